use crate::store::StoreError;
use l2link_proto::{IdentifierField, ProtoError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Address pool {pool} has no free /30 subnet")]
    PoolExhausted { pool: String },

    #[error("Duplicate {field} {value}: already used by tunnel '{owner}'")]
    DuplicateIdentifier {
        field: IdentifierField,
        value: String,
        owner: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Tunnel '{0}' not found")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Registry lock poisoned")]
    Poisoned,
}

impl RegistryError {
    /// Map a single-record check failure raised while handling `name`.
    ///
    /// A port repeated within one record is a uniqueness violation, every
    /// other record-level failure is malformed input.
    pub fn from_proto(err: ProtoError, name: &str) -> Self {
        match err {
            ProtoError::DuplicatePort(port) => RegistryError::DuplicateIdentifier {
                field: IdentifierField::ForwardedPorts,
                value: port.to_string(),
                owner: name.to_string(),
            },
            other => RegistryError::Validation(other.to_string()),
        }
    }

    /// Short taxonomy name, used when errors cross the IPC boundary
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::PoolExhausted { .. } => "pool_exhausted",
            RegistryError::DuplicateIdentifier { .. } => "duplicate_identifier",
            RegistryError::Validation(_) => "validation_error",
            RegistryError::NotFound(_) => "not_found",
            RegistryError::Storage(_) => "storage",
            RegistryError::Poisoned => "internal",
        }
    }
}
