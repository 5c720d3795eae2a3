//! Error types for the Harbor image mutator

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the registry-mapping cache, the Harbor client and the
/// image reference parser
#[derive(Debug, Error)]
pub enum Error {
    /// The HTTP request to Harbor did not complete (connect, TLS, timeout)
    #[error("harbor request to {endpoint} failed: {message}")]
    HarborRequest {
        /// URL that was requested
        endpoint: String,
        /// Error message
        message: String,
    },

    /// Harbor answered with a non-success status code
    #[error("harbor returned HTTP {status} for {endpoint}")]
    HarborStatus {
        /// URL that was requested
        endpoint: String,
        /// HTTP status code
        status: u16,
    },

    /// Harbor answered with a body that could not be decoded
    #[error("invalid harbor payload from {endpoint}: {message}")]
    HarborPayload {
        /// URL that was requested
        endpoint: String,
        /// Error message
        message: String,
    },

    /// A complete refresh did not finish within its deadline
    #[error("cache refresh exceeded deadline of {deadline:?}")]
    RefreshTimeout {
        /// Deadline that was exceeded
        deadline: Duration,
    },

    /// The cache has not completed a successful refresh yet
    #[error("registry mapping cache not yet populated")]
    NotPopulated,

    /// A container image reference could not be parsed
    #[error("invalid image reference {reference:?}: {message}")]
    InvalidReference {
        /// The raw reference string
        reference: String,
        /// What is wrong with it
        message: String,
    },

    /// Invalid configuration supplied at startup
    #[error("configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Metric registration or encoding failed
    #[error("metrics error: {message}")]
    Metrics {
        /// Error message
        message: String,
    },
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Self::Metrics {
            message: e.to_string(),
        }
    }
}

impl Error {
    /// Create a Harbor request error
    pub fn harbor_request(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::HarborRequest {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a Harbor status error
    pub fn harbor_status(endpoint: impl Into<String>, status: u16) -> Self {
        Self::HarborStatus {
            endpoint: endpoint.into(),
            status,
        }
    }

    /// Create a Harbor payload error
    pub fn harbor_payload(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::HarborPayload {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid image reference error
    pub fn invalid_reference(reference: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// True for the cold-cache signal
    pub fn is_not_populated(&self) -> bool {
        matches!(self, Self::NotPopulated)
    }

    /// True for upstream failures that the next scheduled refresh may clear
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::HarborRequest { .. }
                | Self::HarborStatus { .. }
                | Self::HarborPayload { .. }
                | Self::RefreshTimeout { .. }
        )
    }
}

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;
