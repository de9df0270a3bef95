use herald_storage::StorageError;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("request rate limit exceeded, retry after {retry_after:?}")]
    RateLimitedRequest { retry_after: Duration },
    #[error("e-mail rate limit exceeded, retry after {retry_after:?}")]
    RateLimitedEmail { retry_after: Duration },
    #[error("too many active subscriptions (limit {limit})")]
    TooManySubscriptions { limit: usize },
    #[error("topic limit reached (limit {limit})")]
    TooManyTopics { limit: usize },
    #[error("message too large ({size} bytes, limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("invalid delay of {requested_secs}s (allowed {min:?} to {max:?})")]
    InvalidDelay {
        requested_secs: i64,
        min: Duration,
        max: Duration,
    },
    #[error("delayed e-mail notifications are not supported")]
    DelayedEmailUnsupported,
    #[error("delayed delivery is disabled")]
    DelayedDisabled,
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    #[error("broker is shutting down")]
    ShuttingDown,
    #[error("message cache failure: {0}")]
    Storage(#[from] StorageError),
}

/// Coarse classes the boundary layer maps to transport responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AdmissionDenied,
    SchedulingInvalid,
    NotFound,
    Unavailable,
    Internal,
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::RateLimitedRequest { .. }
            | BrokerError::RateLimitedEmail { .. }
            | BrokerError::TooManySubscriptions { .. }
            | BrokerError::TooManyTopics { .. }
            | BrokerError::PayloadTooLarge { .. } => ErrorKind::AdmissionDenied,
            BrokerError::InvalidDelay { .. }
            | BrokerError::DelayedEmailUnsupported
            | BrokerError::DelayedDisabled => ErrorKind::SchedulingInvalid,
            BrokerError::InvalidTopic(_) => ErrorKind::NotFound,
            BrokerError::ShuttingDown => ErrorKind::Unavailable,
            BrokerError::Storage(_) => ErrorKind::Internal,
        }
    }

    /// How long until the limiter that denied the request has a token again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BrokerError::RateLimitedRequest { retry_after }
            | BrokerError::RateLimitedEmail { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            BrokerError::RateLimitedRequest { .. }
            | BrokerError::RateLimitedEmail { .. }
            | BrokerError::TooManySubscriptions { .. }
            | BrokerError::TooManyTopics { .. } => 429,
            BrokerError::PayloadTooLarge { .. } => 413,
            BrokerError::InvalidDelay { .. }
            | BrokerError::DelayedEmailUnsupported
            | BrokerError::DelayedDisabled => 400,
            BrokerError::InvalidTopic(_) => 404,
            BrokerError::ShuttingDown => 503,
            BrokerError::Storage(_) => 500,
        }
    }

    /// Short label used for the denial counter.
    pub fn reason(&self) -> &'static str {
        match self {
            BrokerError::RateLimitedRequest { .. } => "rate_limited_request",
            BrokerError::RateLimitedEmail { .. } => "rate_limited_email",
            BrokerError::TooManySubscriptions { .. } => "too_many_subscriptions",
            BrokerError::TooManyTopics { .. } => "too_many_topics",
            BrokerError::PayloadTooLarge { .. } => "payload_too_large",
            BrokerError::InvalidDelay { .. } => "invalid_delay",
            BrokerError::DelayedEmailUnsupported => "delayed_email_unsupported",
            BrokerError::DelayedDisabled => "delayed_disabled",
            BrokerError::InvalidTopic(_) => "invalid_topic",
            BrokerError::ShuttingDown => "shutting_down",
            BrokerError::Storage(_) => "storage",
        }
    }
}
