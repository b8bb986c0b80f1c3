// batch_ingestor/src/error.rs
// Defines custom error types for the batch_ingestor crate.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error,)]
pub enum BatchError {
    #[error("Invalid batch item: {0}")]
    Validation(String,),
    #[error("Transient transport error: {0}")]
    TransientTransport(String,),
    #[error("Server rejected request with status {status}: {message}")]
    PermanentServer { status: u16, message: String, },
    #[error("Batch queue is closed")]
    QueueClosed,
    #[error("Shards not ready after {elapsed:?}: {detail}")]
    PollTimeout { elapsed: Duration, detail: String, },
    #[error("Invalid configuration: {0}")]
    Configuration(String,),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error,),
    #[error("Other error: {0}")]
    Other(String,),
}

impl BatchError {
    pub fn is_transient(&self,) -> bool {
        match self {
            BatchError::TransientTransport(_,) => true,
            BatchError::PermanentServer { status, .. } => is_retryable_status(*status,),
            BatchError::Other(msg,) => is_transient_message(msg,),
            _ => false,
        }
    }

    /// Maps a non-success HTTP status and its body text to the matching error variant.
    pub fn from_status(status: u16, message: impl Into<String,>,) -> Self {
        let message = message.into();
        if is_retryable_status(status,) {
            BatchError::TransientTransport(format!("status {}: {}", status, message),)
        } else {
            BatchError::PermanentServer { status, message, }
        }
    }
}

/// 429 and every 5xx are worth another attempt; other statuses are final.
pub fn is_retryable_status(status: u16,) -> bool {
    status == 429 || (500..600).contains(&status,)
}

/// Heuristic used for per-item error messages that carry no status code.
pub fn is_transient_message(msg: &str,) -> bool {
    let m = msg.to_lowercase();
    m.contains("timeout",)
        || m.contains("timed out",)
        || m.contains("deadline exceeded",)
        || m.contains("connection",)
        || m.contains("too many requests",)
        || m.contains("unavailable",)
        || m.contains("busy",)
        || m.contains("broken pipe",)
}

pub type Result<T,> = std::result::Result<T, BatchError,>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(422));
        assert!(!is_retryable_status(404));

        assert!(BatchError::from_status(500, "boom").is_transient());
        assert!(matches!(
            BatchError::from_status(401, "no"),
            BatchError::PermanentServer { status: 401, .. }
        ));
    }

    #[test]
    fn message_heuristics() {
        assert!(is_transient_message("context deadline exceeded"));
        assert!(is_transient_message("Connection reset by peer"));
        assert!(!is_transient_message("property 'age' must be an int"));
        assert!(!BatchError::QueueClosed.is_transient());
    }
}
