//! Error types for the Trellis controller

use thiserror::Error;

/// How a failed REST operation should be retried, if at all
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient failure (timeout, 5xx, connection reset): short backoff,
    /// capped attempt count, escalates to Slow when the cap is exceeded
    Fast,
    /// Persistent failure (4xx other than not-found-on-delete): long backoff
    Slow,
    /// Not retried automatically (validation failures, invariant violations)
    None,
}

/// Main error type for Trellis operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Remote load-balancer controller returned an HTTP error status
    #[error("controller API error (status {status}): {message}")]
    Api {
        /// HTTP status code from the remote controller
        status: u16,
        /// Response body or reason phrase
        message: String,
    },

    /// Transport-level failure talking to the remote controller
    /// (timeout, connection reset, DNS failure)
    #[error("transient controller error: {0}")]
    Transient(String),

    /// Validation error for CRD specs or cross-references
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal invariant violated; reachable only via bugs, never via input
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a remote API error with the given HTTP status
    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: msg.into(),
        }
    }

    /// Create a transient transport error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invariant-violation error with the given message
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// True if this error is a remote not-found (404)
    ///
    /// Not-found on delete is treated as success: the desired end state
    /// (object absent) already holds.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }

    /// Classify this error into a retry class for the sync engine
    ///
    /// Timeouts and 5xx responses may heal on their own and go to the fast
    /// lane; other 4xx responses mean the request itself is bad and will not
    /// succeed until something else changes, so they back off slowly.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Transient(_) => RetryClass::Fast,
            Self::Api { status, .. } if *status == 408 || *status == 429 => RetryClass::Fast,
            Self::Api { status, .. } if *status >= 500 => RetryClass::Fast,
            Self::Api { .. } => RetryClass::Slow,
            Self::Kube(_) => RetryClass::Fast,
            Self::Validation(_) | Self::Invariant(_) | Self::Serialization(_) => RetryClass::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_take_the_fast_lane() {
        assert_eq!(
            Error::transient("connection reset by peer").retry_class(),
            RetryClass::Fast
        );
        assert_eq!(Error::api(503, "busy").retry_class(), RetryClass::Fast);
        assert_eq!(Error::api(429, "throttled").retry_class(), RetryClass::Fast);
        assert_eq!(Error::api(408, "timeout").retry_class(), RetryClass::Fast);
    }

    #[test]
    fn persistent_api_errors_take_the_slow_lane() {
        assert_eq!(Error::api(400, "bad pool body").retry_class(), RetryClass::Slow);
        assert_eq!(Error::api(409, "conflict").retry_class(), RetryClass::Slow);
        assert_eq!(Error::api(404, "no such object").retry_class(), RetryClass::Slow);
    }

    #[test]
    fn validation_and_invariant_errors_are_never_retried() {
        assert_eq!(
            Error::validation("no such WAF policy").retry_class(),
            RetryClass::None
        );
        assert_eq!(
            Error::invariant("delete of parent with live children").retry_class(),
            RetryClass::None
        );
    }

    #[test]
    fn not_found_detection() {
        assert!(Error::api(404, "gone").is_not_found());
        assert!(!Error::api(400, "bad").is_not_found());
        assert!(!Error::transient("reset").is_not_found());
    }

    #[test]
    fn error_messages_carry_context() {
        let err = Error::api(400, "pool server list malformed");
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("malformed"));

        let err = Error::validation(format!("WAF policy {} not found", "strict-waf"));
        assert!(err.to_string().contains("strict-waf"));
    }
}
