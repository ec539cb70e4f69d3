#![forbid(unsafe_code)]

use dkcm_core::LeaseStatus;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("unknown id")]
    UnknownId,
    /// A generated lease id or access token collided with an existing row.
    #[error("duplicate lease id or access token")]
    DuplicateId,
    #[error("owner {owner_id} already holds an outstanding lease")]
    OwnerLeaseExists { owner_id: String },
    #[error("lease {lease_id} cannot move from {from} to {to}")]
    InvalidTransition {
        lease_id: String,
        from: LeaseStatus,
        to: LeaseStatus,
    },
    #[error("lease {lease_id} is still pending")]
    LeasePending { lease_id: String },
}

impl StoreError {
    /// Stable machine-readable code for logs and API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) | Self::Sql(_) => "STORE_UNAVAILABLE",
            Self::InvalidInput(message) if message.starts_with("RESET_REQUIRED") => "RESET_REQUIRED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::UnknownId => "UNKNOWN_ID",
            Self::DuplicateId => "DUPLICATE_ID",
            Self::OwnerLeaseExists { .. } => "OWNER_LEASE_EXISTS",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::LeasePending { .. } => "LEASE_BUSY",
        }
    }

    /// Errors caused by the database itself rather than by the request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Sql(_))
    }
}
