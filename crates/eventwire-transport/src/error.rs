use crate::utils::CancellationError;
use std::time::Duration;
use thiserror::Error;

pub type TransportResult<T> = core::result::Result<T, TransportError>;

/// Discriminant for every error the crate can surface.
///
/// The taxonomy is flat on purpose: callers match failure classes with
/// [`TransportError::is`] regardless of which nested enum produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotConnected,
    AlreadyConnected,
    ConnectionFailed,
    ConnectionClosed,
    Timeout,
    MessageTooLarge,
    TransportFault,
    Configuration,
    InvalidEventType,
    InvalidMessageSize,
    MissingRequiredFields,
    FieldValidationFailed,
    InvalidTimestamp,
    UnknownField,
    ValidationFailed,
    BackpressureTimeout,
    BackpressureStopped,
    BufferClosed,
    Cancelled,
    Internal,
}

/// Violations reported by the validation pipeline.
///
/// A single violation surfaces as its own variant; multiple violations
/// (non-fail-fast mode) gather into [`ValidationError::Failed`].
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("event type '{event_type}' is not allowed")]
    InvalidEventType { event_type: String },

    #[error("serialized payload is {size} bytes, exceeds maximum of {max}")]
    InvalidMessageSize { size: usize, max: usize },

    #[error("required fields missing or empty: {}", .fields.join(", "))]
    MissingRequiredFields { fields: Vec<String> },

    #[error("field '{field}' does not match pattern '{pattern}'")]
    FieldValidationFailed { field: String, pattern: String },

    #[error("timestamp {timestamp} is outside the accepted skew window")]
    InvalidTimestamp { timestamp: u64 },

    #[error("unknown top-level field '{field}' rejected in strict mode")]
    UnknownField { field: String },

    #[error("validation failed with {} violations", .0.len())]
    Failed(Vec<ValidationError>),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ValidationError::InvalidEventType { .. } => ErrorKind::InvalidEventType,
            ValidationError::InvalidMessageSize { .. } => ErrorKind::InvalidMessageSize,
            ValidationError::MissingRequiredFields { .. } => ErrorKind::MissingRequiredFields,
            ValidationError::FieldValidationFailed { .. } => ErrorKind::FieldValidationFailed,
            ValidationError::InvalidTimestamp { .. } => ErrorKind::InvalidTimestamp,
            ValidationError::UnknownField { .. } => ErrorKind::UnknownField,
            ValidationError::Failed(_) => ErrorKind::ValidationFailed,
        }
    }

    /// Individual violations, whether this is a single error or a composite.
    pub fn violations(&self) -> &[ValidationError] {
        match self {
            ValidationError::Failed(all) => all,
            _ => std::slice::from_ref(self),
        }
    }
}

/// Failures raised by the backpressure handler's enqueue path.
#[derive(Debug, Error)]
pub enum BackpressureError {
    #[error("backpressure wait timed out after {waited:?}")]
    Timeout { waited: Duration },

    #[error("backpressure handler is stopped")]
    Stopped,

    #[error("backpressure wait cancelled")]
    Cancelled,
}

impl BackpressureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackpressureError::Timeout { .. } => ErrorKind::BackpressureTimeout,
            BackpressureError::Stopped => ErrorKind::BackpressureStopped,
            BackpressureError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Failures raised by blocking ring-buffer operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("ring buffer closed")]
    Closed,

    #[error("ring buffer wait cancelled")]
    Cancelled,
}

impl RingBufferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RingBufferError::Closed => ErrorKind::BufferClosed,
            RingBufferError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Top-level error for the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no connected transport")]
    NotConnected,

    #[error("transport manager already running")]
    AlreadyConnected,

    #[error("connection to '{endpoint}' failed: {source}")]
    ConnectionFailed {
        endpoint: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation timed out")]
    Timeout,

    #[error("message of {size} bytes exceeds transport limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// A transport-level fault with enough metadata for retry policies.
    #[error("transport '{transport}' failed during {op}: {source}")]
    Transport {
        transport: String,
        op: String,
        temporary: bool,
        retryable: bool,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid configuration for '{field}' = '{value}': {message}")]
    Configuration {
        field: String,
        value: String,
        message: String,
    },

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("backpressure error: {0}")]
    Backpressure(#[from] BackpressureError),

    #[error("buffer error: {0}")]
    Buffer(#[from] RingBufferError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::NotConnected => ErrorKind::NotConnected,
            TransportError::AlreadyConnected => ErrorKind::AlreadyConnected,
            TransportError::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            TransportError::ConnectionClosed => ErrorKind::ConnectionClosed,
            TransportError::Timeout => ErrorKind::Timeout,
            TransportError::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            TransportError::Transport { .. } => ErrorKind::TransportFault,
            TransportError::Configuration { .. } => ErrorKind::Configuration,
            TransportError::Validation(e) => e.kind(),
            TransportError::Backpressure(e) => e.kind(),
            TransportError::Buffer(e) => e.kind(),
            TransportError::Cancelled => ErrorKind::Cancelled,
            TransportError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Common "is" predicate for matching against error kinds.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    /// Whether a retry of the failed operation may succeed.
    pub fn retryable(&self) -> bool {
        match self {
            TransportError::Transport { retryable, .. } => *retryable,
            TransportError::Timeout | TransportError::ConnectionClosed => true,
            _ => false,
        }
    }
}

impl From<CancellationError> for TransportError {
    fn from(_: CancellationError) -> Self {
        TransportError::Cancelled
    }
}
