#![forbid(unsafe_code)]

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const METADATA_FILE_NAME: &str = "metadata.json";

pub const KEY_PROVIDER: &str = "E2E:Provider";
pub const KEY_REGION: &str = "E2E:Region";
pub const KEY_MACHINE: &str = "E2E:Machine";
pub const KEY_VERSION: &str = "E2E:Version";
pub const KEY_MIN_NODES: &str = "E2E:MinNodes";
pub const KEY_MAX_NODES: &str = "E2E:MaxNodes";

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata io {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("metadata json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} does not hold a JSON object")]
    NotAnObject(String),
}

/// Key/value store for facts about the test run.
pub trait MetadataSink: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<(), MetadataError>;
}

/// Flat JSON object in `<dir>/metadata.json`, merged with whatever is already there.
#[derive(Debug)]
pub struct JsonFileMetadata {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileMetadata {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(METADATA_FILE_NAME),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> MetadataError {
        MetadataError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn load(&self) -> Result<Map<String, Value>, MetadataError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => return Err(self.io_err(err)),
        };
        if text.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&text)? {
            Value::Object(map) => Ok(map),
            _ => Err(MetadataError::NotAnObject(self.path.display().to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, MetadataError> {
        let _guard = self.lock.lock().unwrap_or_else(|poison| poison.into_inner());
        Ok(self
            .load()?
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string))
    }
}

impl MetadataSink for JsonFileMetadata {
    fn set(&self, key: &str, value: &str) -> Result<(), MetadataError> {
        let _guard = self.lock.lock().unwrap_or_else(|poison| poison.into_inner());
        let mut map = self.load()?;
        map.insert(key.to_string(), Value::String(value.to_string()));

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| self.io_err(err))?;
        }
        let text = serde_json::to_string_pretty(&Value::Object(map))?;
        std::fs::write(&self.path, text).map_err(|err| self.io_err(err))
    }
}
