//! Secret store abstraction.
//!
//! Socket servers only see [`SecretStore`]; the production implementation
//! is [`vault::VaultClient`] (HashiCorp Vault KV version 2) and tests use
//! [`memory::MemoryStore`].

pub mod memory;
pub mod vault;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors returned when fetching a secret.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No secret exists at the path.
    #[error("secret not found: {path}")]
    NotFound {
        /// Secret path inside the mount.
        path: String,
    },

    /// The current version of the secret was deleted or destroyed.
    #[error("secret {path} has no data (version {version} deleted or destroyed)")]
    Deleted {
        /// Secret path inside the mount.
        path: String,
        /// Version reported by the store.
        version: u64,
    },

    /// The store answered with a non-success status.
    #[error("secret store returned {status} for {path}: {message}")]
    Status {
        /// Secret path inside the mount.
        path: String,
        /// HTTP status code.
        status: u16,
        /// Error text reported by the store.
        message: String,
    },

    /// The request never completed.
    #[error("secret store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The response body was not a KV version 2 secret.
    #[error("invalid secret store response for {path}: {message}")]
    Decode {
        /// Secret path inside the mount.
        path: String,
        /// Decoder error.
        message: String,
    },
}

/// Errors looking up a single field of a fetched secret.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    /// The secret has no such key.
    #[error("field '{field}' not present (available: {available})")]
    Missing {
        /// Requested field.
        field: String,
        /// Comma-separated list of keys that do exist.
        available: String,
    },

    /// The key exists but does not hold a string.
    #[error("field '{field}' is a {found}, expected a string")]
    NotString {
        /// Requested field.
        field: String,
        /// JSON type actually stored.
        found: &'static str,
    },
}

/// Version metadata attached to a KV version 2 secret.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct VersionMetadata {
    /// RFC 3339 creation time of this version.
    #[serde(default)]
    pub created_time: String,
    /// RFC 3339 deletion time, empty when not deleted.
    #[serde(default)]
    pub deletion_time: String,
    /// Whether this version was permanently destroyed.
    #[serde(default)]
    pub destroyed: bool,
    /// Version number.
    #[serde(default)]
    pub version: u64,
    /// User-supplied metadata on the secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_metadata: Option<Map<String, Value>>,
}

/// A secret object as fetched from the store.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct KvSecret {
    /// Key/value payload.
    pub data: Map<String, Value>,
    /// Version metadata, when the store reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<VersionMetadata>,
}

// Values stay out of logs: Debug shows keys only.
impl std::fmt::Debug for KvSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvSecret")
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl KvSecret {
    /// Build a secret from a key/value map with no metadata.
    pub fn new(data: Map<String, Value>) -> Self {
        Self {
            data,
            metadata: None,
        }
    }

    /// Look up a string field.
    pub fn field(&self, name: &str) -> Result<&str, FieldError> {
        match self.data.get(name) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(FieldError::NotString {
                field: name.to_string(),
                found: json_type(other),
            }),
            None => Err(FieldError::Missing {
                field: name.to_string(),
                available: self
                    .data
                    .keys()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    /// Human-readable dump of the whole secret (data and metadata).
    pub fn render_dump(&self) -> String {
        // Map<String, Value> always serializes
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Fetches secret objects by path.
///
/// Shared by every socket server, so implementations must be safe for
/// concurrent use.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the current version of the secret at `path`.
    async fn get(&self, path: &str) -> Result<KvSecret, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> KvSecret {
        let Value::Object(data) = json!({"password": "hunter2", "username": "bob", "port": 5432})
        else {
            unreachable!()
        };
        KvSecret::new(data)
    }

    #[test]
    fn test_field_returns_string_value() {
        assert_eq!(sample().field("password"), Ok("hunter2"));
    }

    #[test]
    fn test_missing_field_lists_available_keys() {
        let err = sample().field("token").unwrap_err();
        match &err {
            FieldError::Missing { field, available } => {
                assert_eq!(field, "token");
                assert!(available.contains("password"));
                assert!(available.contains("username"));
            }
            other => panic!("Expected Missing, got: {other:?}"),
        }
        assert!(err.to_string().contains("'token' not present"));
    }

    #[test]
    fn test_non_string_field_is_typed_error() {
        assert_eq!(
            sample().field("port"),
            Err(FieldError::NotString {
                field: "port".to_string(),
                found: "number",
            })
        );
    }

    #[test]
    fn test_dump_contains_keys_and_values() {
        let dump = sample().render_dump();
        assert!(dump.contains("\"password\": \"hunter2\""), "got: {dump}");
        assert!(dump.contains("\"username\": \"bob\""), "got: {dump}");
    }

    #[test]
    fn test_dump_includes_metadata_when_present() {
        let mut secret = sample();
        secret.metadata = Some(VersionMetadata {
            version: 7,
            ..VersionMetadata::default()
        });
        assert!(secret.render_dump().contains("\"version\": 7"));
    }

    #[test]
    fn test_debug_hides_values() {
        let debug = format!("{:?}", sample());
        assert!(debug.contains("password"));
        assert!(!debug.contains("hunter2"));
    }
}
