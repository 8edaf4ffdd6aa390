//! Persisted client identity.
//!
//! The gateway identifies itself to the coordinating service with a
//! [`ClientId`] generated once and reused across restarts. It is stored as
//! a flat JSON document:
//!
//! ```json
//! {"clientId": 1234567}
//! ```
//!
//! Other keys in the document are preserved.

// ============================================================================
// Imports
// ============================================================================

use std::fs;
use std::path::Path;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ClientId, generate_id};

// ============================================================================
// Constants
// ============================================================================

/// Document key holding the id.
const CLIENT_ID_KEY: &str = "clientId";

// ============================================================================
// ClientId - Persistence
// ============================================================================

impl ClientId {
    /// Reads the client id from `path`, creating it on first use.
    ///
    /// A missing file, a missing key or a non-numeric value results in a
    /// fresh id being written back. Parent directories are created.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the document cannot be read or written
    /// - [`Error::Config`] if the file exists but is not a JSON object
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut document = match fs::read_to_string(path) {
            Ok(source) if source.trim().is_empty() => Map::new(),
            Ok(source) => match serde_json::from_str::<Value>(&source) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(Error::config(format!(
                        "client info at {} is not a JSON object",
                        path.display()
                    )));
                }
                Err(e) => {
                    return Err(Error::config(format!(
                        "client info at {} is not valid JSON: {e}",
                        path.display()
                    )));
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };

        if let Some(id) = document
            .get(CLIENT_ID_KEY)
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .filter(|&id| id != 0)
        {
            debug!(path = %path.display(), client_id = id, "Loaded client id");
            return Ok(Self::new(id));
        }

        if document.contains_key(CLIENT_ID_KEY) {
            warn!(path = %path.display(), "Client id unusable, regenerating");
        }

        let id = generate_id();
        document.insert(CLIENT_ID_KEY.to_string(), Value::from(id));

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string(&Value::Object(document))?)?;

        info!(path = %path.display(), client_id = id, "Generated client id");
        Ok(Self::new(id))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[test]
    fn test_creates_and_reuses_id() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("gen").join("clientInfo.json");

        let first = ClientId::load_or_create(&path).expect("create");
        assert!(!first.is_placeholder());
        assert!(path.exists());

        let second = ClientId::load_or_create(&path).expect("reuse");
        assert_eq!(first, second);

        let stored: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(stored[CLIENT_ID_KEY], Value::from(first.get()));
    }

    #[test]
    fn test_missing_key_is_filled_and_other_keys_kept() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("clientInfo.json");
        fs::write(&path, r#"{"site": "garage"}"#).expect("write");

        let id = ClientId::load_or_create(&path).expect("create");

        let stored: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(stored["site"], Value::from("garage"));
        assert_eq!(stored[CLIENT_ID_KEY], Value::from(id.get()));
    }

    #[test]
    fn test_existing_id_is_read() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("clientInfo.json");
        fs::write(&path, r#"{"clientId": 4242}"#)?;

        assert_eq!(ClientId::load_or_create(&path)?, ClientId::new(4242));
        Ok(())
    }

    #[test]
    fn test_non_object_document_is_error() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("clientInfo.json");
        fs::write(&path, "[1, 2]").expect("write");

        assert!(matches!(
            ClientId::load_or_create(&path),
            Err(Error::Config { .. })
        ));
    }
}
