use thiserror::Error;

/// Errors raised while checking a record or candidate in isolation
///
/// Cross-record checks (uniqueness, pool membership) live in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("Invalid tunnel name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid port {0}: ports must be between 1 and 65535")]
    InvalidPort(u32),

    #[error("Port {0} is listed more than once")]
    DuplicatePort(u16),

    #[error("Invalid port list entry '{0}'")]
    InvalidPortEntry(String),

    #[error("Invalid side '{0}': expected A or B")]
    InvalidSide(String),

    #[error("Interface address {address} must be a /30 link address")]
    InvalidPrefix { address: String },

    #[error("Interface address {address} is not the side {side} host of its /30")]
    WrongHost { address: String, side: String },

    #[error("Local and remote public addresses are both {0}")]
    SamePublicIp(String),

    #[error("Identifier {field} must be non-zero")]
    ZeroIdentifier { field: String },

    #[error("Interface slot {index} is too large: at most {max} fits a kernel interface name")]
    InterfaceIndexTooLarge { index: u32, max: u32 },

    #[error("Unsupported record version {0}")]
    UnsupportedVersion(u32),
}
