//! Error types for paddock-pve.

use crate::client::Method;
use thiserror::Error;

/// Result type alias for paddock-pve operations.
pub type Result<T> = std::result::Result<T, PveError>;

/// Errors that can occur while talking to the control plane.
#[derive(Debug, Error)]
pub enum PveError {
    /// Transport-level failure (connect, TLS, timeout)
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The API answered with a non-success status
    #[error("{method} {path} returned {status}: {body}")]
    Api {
        /// Method of the failed request
        method: Method,
        /// Path of the failed request
        path: String,
        /// HTTP status code
        status: u16,
        /// Response body, verbatim
        body: String,
    },

    /// Ticket login was rejected
    #[error("login failed: {0}")]
    Login(String),

    /// Response body could not be decoded into the expected shape
    #[error("failed to decode response from {path}: {source}")]
    Decode {
        /// Path of the request
        path: String,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// Response was well-formed JSON but not what we expected
    #[error("unexpected response from {path}: {message}")]
    Unexpected {
        /// Path of the request
        path: String,
        /// What was wrong with it
        message: String,
    },
}

impl PveError {
    /// HTTP status of an API error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// True if the error says the addressed object does not exist.
    ///
    /// The SDN endpoints report missing objects as a 500 with a
    /// "does not exist" message rather than a 404, so both are matched.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Api { status, body, .. } => {
                *status == 404 || body.contains("does not exist") || body.contains("not found")
            }
            _ => self.status() == Some(404),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(status: u16, body: &str) -> PveError {
        PveError::Api {
            method: Method::Delete,
            path: "/cluster/sdn/zones/abc123z".into(),
            status,
            body: body.into(),
        }
    }

    #[test]
    fn test_not_found_by_status() {
        assert!(api_error(404, "").is_not_found());
    }

    #[test]
    fn test_not_found_by_message() {
        assert!(api_error(500, "sdn 'abc123z' does not exist").is_not_found());
        assert!(!api_error(500, "zone is in use").is_not_found());
    }

    #[test]
    fn test_error_display_includes_body() {
        let err = api_error(500, "zone is in use");
        let msg = err.to_string();
        assert!(msg.contains("DELETE"));
        assert!(msg.contains("500"));
        assert!(msg.contains("zone is in use"));
    }
}
