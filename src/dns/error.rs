//! Error types for the DNS engine
//!
//! The error taxonomy follows the failure contracts of the forwarder:
//!
//! - **Parse/Build errors**: malformed or unbuildable DNS messages
//! - **Network errors**: socket I/O failures
//! - **Timeout errors**: a deadline elapsed while waiting on an upstream
//! - **Upstream errors**: the upstream connection or protocol misbehaved
//! - **Config errors**: invalid resolver/listener parameters
//! - **NoResolver**: routing produced no usable resolver
//!
//! # Example
//!
//! ```
//! use kexuedns::dns::DnsError;
//!
//! let err = DnsError::timeout("query to 8.8.8.8:53", std::time::Duration::from_secs(4));
//! assert!(err.is_timeout());
//! assert!(err.is_recoverable());
//! ```

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Error type for DNS operations.
#[derive(Debug, Error)]
pub enum DnsError {
    /// A received DNS message could not be decoded.
    #[error("failed to parse DNS message: {reason}")]
    ParseError {
        /// What went wrong during parsing.
        reason: String,
    },

    /// A DNS message could not be encoded for transmission.
    #[error("failed to build DNS message: {reason}")]
    BuildError {
        /// What went wrong during encoding.
        reason: String,
    },

    /// Low-level socket failure.
    #[error("network error: {reason}")]
    NetworkError {
        /// Description of the failure.
        reason: String,
        /// The underlying I/O error, if available.
        #[source]
        source: Option<io::Error>,
    },

    /// A deadline elapsed before the operation completed.
    #[error("timed out after {timeout:?}: {context}")]
    TimeoutError {
        /// What timed out.
        context: String,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// The upstream connection or protocol misbehaved.
    #[error("upstream error ({upstream}): {reason}")]
    UpstreamError {
        /// Upstream name or address.
        upstream: String,
        /// Description of the failure.
        reason: String,
    },

    /// Invalid resolver or listener configuration.
    #[error("invalid configuration: {reason}")]
    ConfigError {
        /// Description of the configuration error.
        reason: String,
        /// The offending field, if applicable.
        field: Option<String>,
    },

    /// No resolver is available for a query, not even the default.
    #[error("no resolver available: {reason}")]
    NoResolver {
        /// Why no resolver could be selected.
        reason: String,
    },

    /// Unexpected internal state.
    #[error("internal error: {reason}")]
    InternalError {
        /// Description of the internal error.
        reason: String,
    },
}

impl DnsError {
    /// Create a parse error.
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
        }
    }

    /// Create a build error.
    pub fn build(reason: impl Into<String>) -> Self {
        Self::BuildError {
            reason: reason.into(),
        }
    }

    /// Create a network error without an I/O source.
    pub fn network(reason: impl Into<String>) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: None,
        }
    }

    /// Create a network error wrapping an I/O error.
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Create a timeout error.
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::TimeoutError {
            context: context.into(),
            timeout,
        }
    }

    /// Create an upstream error.
    pub fn upstream(upstream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamError {
            upstream: upstream.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field.
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create a no-resolver error.
    pub fn no_resolver(reason: impl Into<String>) -> Self {
        Self::NoResolver {
            reason: reason.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::InternalError {
            reason: reason.into(),
        }
    }

    /// Whether a retry could plausibly succeed.
    ///
    /// Network, timeout, and upstream failures are transient; parse,
    /// build, and configuration failures are not.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NetworkError { .. } | Self::TimeoutError { .. } | Self::UpstreamError { .. }
        )
    }

    /// Whether this error is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError { .. })
    }

    /// Whether this error came from the upstream path.
    #[must_use]
    pub fn is_upstream_error(&self) -> bool {
        matches!(self, Self::UpstreamError { .. })
    }
}

impl From<io::Error> for DnsError {
    fn from(err: io::Error) -> Self {
        Self::NetworkError {
            reason: err.to_string(),
            source: Some(err),
        }
    }
}

/// Type alias for `Result` with [`DnsError`].
pub type DnsResult<T> = std::result::Result<T, DnsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_and_display() {
        let err = DnsError::parse("bad header");
        assert!(matches!(err, DnsError::ParseError { .. }));
        assert!(err.to_string().contains("bad header"));

        let err = DnsError::upstream("8.8.8.8:53", "connection reset");
        assert!(err.to_string().contains("8.8.8.8:53"));
        assert!(err.is_upstream_error());

        let err = DnsError::config_field("bad address", "resolver.address");
        assert!(matches!(err, DnsError::ConfigError { field: Some(_), .. }));
    }

    #[test]
    fn test_recoverability() {
        assert!(DnsError::network("reset").is_recoverable());
        assert!(DnsError::timeout("q", Duration::from_secs(1)).is_recoverable());
        assert!(DnsError::upstream("up", "broken").is_recoverable());

        assert!(!DnsError::parse("bad").is_recoverable());
        assert!(!DnsError::build("bad").is_recoverable());
        assert!(!DnsError::config("bad").is_recoverable());
        assert!(!DnsError::no_resolver("none").is_recoverable());
        assert!(!DnsError::internal("bug").is_recoverable());
    }

    #[test]
    fn test_timeout_classification() {
        assert!(DnsError::timeout("q", Duration::from_millis(500)).is_timeout());
        assert!(!DnsError::network("x").is_timeout());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: DnsError = io_err.into();
        assert!(matches!(err, DnsError::NetworkError { source: Some(_), .. }));
    }
}
