#![forbid(unsafe_code)]

use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};

/// Length of a generated lease id.
pub const LEASE_ID_LEN: usize = 6;
/// Length of a generated access token.
pub const ACCESS_TOKEN_LEN: usize = 9;

const MAX_OWNER_ID_LEN: usize = 128;

/// Draws `len` characters from the 62-symbol alphanumeric alphabet.
pub fn random_alphanumeric(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Identity of the caller a lease is reserved for (the CI job id).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into().trim().to_string();
        validate_owner_id(&value)?;
        Ok(Self(value))
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LeaseId(String);

impl LeaseId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        validate_generated(&value, LEASE_ID_LEN)?;
        Ok(Self(value))
    }

    pub fn cluster_name(&self) -> String {
        cluster_name_for(&self.0)
    }
}

/// Cluster names must be lowercase DNS labels, so the mixed-case id is folded.
/// Ids that differ only in case share a cluster name.
pub fn cluster_name_for(lease_id: &str) -> String {
    format!("e2e-cls-{}", lease_id.to_ascii_lowercase())
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn try_new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        validate_generated(&value, ACCESS_TOKEN_LEN)?;
        Ok(Self(value))
    }
}

// Tokens are credentials; keep them out of debug logs.
impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("id must not be empty")]
    Empty,
    #[error("id is too long")]
    TooLong,
    #[error("id must start with an ascii letter or digit")]
    InvalidFirstChar,
    #[error("invalid character {ch:?} at index {index}")]
    InvalidChar { ch: char, index: usize },
    #[error("expected {expected} characters, got {actual}")]
    BadLength { expected: usize, actual: usize },
}

fn validate_owner_id(value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if value.len() > MAX_OWNER_ID_LEN {
        return Err(IdError::TooLong);
    }
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return Err(IdError::Empty);
    };
    if !first.is_ascii_alphanumeric() {
        return Err(IdError::InvalidFirstChar);
    }
    for (index, ch) in value.chars().enumerate().skip(1) {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '/' | '-' | ':') {
            continue;
        }
        return Err(IdError::InvalidChar { ch, index });
    }
    Ok(())
}

fn validate_generated(value: &str, expected: usize) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }
    let actual = value.chars().count();
    if actual != expected {
        return Err(IdError::BadLength { expected, actual });
    }
    if let Some((index, ch)) = value
        .chars()
        .enumerate()
        .find(|(_, ch)| !ch.is_ascii_alphanumeric())
    {
        return Err(IdError::InvalidChar { ch, index });
    }
    Ok(())
}
