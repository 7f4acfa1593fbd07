//! Error taxonomy for the sync hub.
//!
//! Validation failures are rejected at the boundary and never enqueued.
//! Delivery failures are recoverable and go through the offline queue or
//! the retry path. Conflicts are not errors at all; they are routed to the
//! conflict resolver.

use thiserror::Error;

/// Reasons an inbound envelope is rejected before it reaches a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required envelope field is empty.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// Recomputed payload checksum does not match the declared one.
    #[error("checksum mismatch (declared {declared}, computed {computed})")]
    ChecksumMismatch { declared: String, computed: String },

    /// The envelope (or its compressed payload) could not be decoded.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The envelope declares a payload encoding the hub does not speak.
    #[error("unsupported payload encoding `{0}`")]
    UnsupportedEncoding(String),
}

/// Errors surfaced by the hub facade.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The connection or token failed authentication. The hub never
    /// retries; the client must re-authenticate.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A target device could not be reached.
    #[error("delivery to {device_id} failed: {reason}")]
    Delivery { device_id: String, reason: String },

    /// An operation used up all of its delivery attempts.
    #[error("operation {operation_id} failed after {attempts} attempts")]
    RetryExhausted { operation_id: String, attempts: u32 },

    /// A bounded buffer overflowed and dropped its oldest entry.
    #[error("offline queue for {device_id} is full ({capacity} entries)")]
    CapacityExceeded { device_id: String, capacity: usize },

    /// The hub is draining for shutdown and no longer accepts work.
    #[error("hub is shutting down")]
    NotAccepting,

    #[error("unknown device `{0}`")]
    UnknownDevice(String),

    /// The persistent store collaborator failed.
    #[error("store error: {0}")]
    Store(String),

    /// A non-store collaborator (responder, transcriber) failed.
    #[error("{service} failed: {reason}")]
    Collaborator { service: &'static str, reason: String },
}

impl HubError {
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Authentication(reason.into())
    }

    /// Whether the caller may try the same request again later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Delivery { .. } | Self::CapacityExceeded { .. })
    }
}

pub type HubResult<T> = std::result::Result<T, HubError>;
