//! Error types for the capability node

use thiserror::Error;

/// Result type alias for capability operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving, wiring or aggregating capabilities
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Capability or trigger configuration failed validation
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Capability id, version or type failed validation
    #[error("invalid capability info: {0}")]
    InvalidCapabilityInfo(String),

    /// A capability with the same id is already registered
    #[error("capability already exists: {0}")]
    CapabilityAlreadyExists(String),

    /// No capability is registered under the id
    #[error("capability not found: {0}")]
    CapabilityNotFound(String),

    /// The stored capability does not satisfy the requested contract
    #[error("capability type mismatch: {0}")]
    CapabilityTypeMismatch(String),

    /// Node missing from the topology snapshot
    #[error("could not find node for id {0}")]
    NodeNotFound(String),

    /// DON missing from the topology snapshot
    #[error("could not find DON for id {0}")]
    DonNotFound(String),

    /// Topology breaks an on-chain invariant
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Dispatcher already has a receiver for this capability and DON
    #[error("receiver already exists: {0}")]
    ReceiverExists(String),

    /// Trigger id already has a subscriber
    #[error("trigger already registered: {0}")]
    TriggerAlreadyRegistered(String),

    /// Trigger id has no subscriber
    #[error("no registration for trigger: {0}")]
    TriggerNotRegistered(String),

    /// Operation not supported for this capability
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Aggregation could not produce a result
    #[error("aggregation error: {0}")]
    Aggregation(String),

    /// Payload encoding or decoding failed
    #[error("codec error: {0}")]
    Codec(String),

    /// Peer transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// Remote call did not complete in time
    #[error("timeout: {0}")]
    Timeout(String),

    /// Service lifecycle error (already started, already closed)
    #[error("service error: {0}")]
    Service(String),

    /// Caller is not authorized to use the capability
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Protobuf decoding error
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl Error {
    /// Whether this error signals that the work was already done by a
    /// previous resolution pass
    #[must_use]
    pub const fn is_idempotent(&self) -> bool {
        matches!(self, Self::CapabilityAlreadyExists(_) | Self::ReceiverExists(_))
    }
}
