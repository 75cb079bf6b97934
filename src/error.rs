//! Error types for the telemetry channel

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// The transport could not issue the request at all
    #[error("Transport error: {0}")]
    Transport(String),

    /// A payload exceeded the limit of the selected transport
    #[error("Payload too large: {size} bytes (max: {max_size} bytes)")]
    PayloadTooLarge { size: usize, max_size: usize },

    /// A bounded queue rejected the item
    #[error("Queue full ({capacity} items)")]
    QueueFull { capacity: usize },

    #[error("Channel is not initialized")]
    NotInitialized,

    #[error("Channel is already initialized")]
    AlreadyInitialized,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Transport(_) => true,
            Error::Configuration(_) => false,
            Error::Serialization(_) => false,
            Error::Storage(_) => false,
            Error::PayloadTooLarge { .. } => false,
            Error::QueueFull { .. } => false,
            Error::NotInitialized => false,
            Error::AlreadyInitialized => false,
        }
    }
}

/// Per-item rejection reported in a partial-success response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    /// Index of the item in the submitted batch
    pub index: usize,
    /// Status the endpoint assigned to the item
    pub status_code: u16,
    /// The error message
    pub message: String,
}

impl ItemError {
    /// Whether the rejected item may be sent again
    pub fn is_retryable(&self) -> bool {
        crate::retry::is_retryable_status(self.status_code)
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Item {} rejected with status {}: {}",
            self.index, self.status_code, self.message
        )?;
        if self.is_retryable() {
            write!(f, " [retryable]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_retryable() {
        assert!(Error::Transport("connection reset".to_string()).is_retryable());
        assert!(!Error::PayloadTooLarge {
            size: 70_000,
            max_size: 65_536
        }
        .is_retryable());
        assert!(!Error::Configuration("bad url".to_string()).is_retryable());
        assert!(!Error::QueueFull { capacity: 100 }.is_retryable());
    }

    #[test]
    fn item_error_display_marks_retryable() {
        let err = ItemError {
            index: 2,
            status_code: 500,
            message: "boom".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Item 2 rejected with status 500: boom [retryable]"
        );
    }
}
