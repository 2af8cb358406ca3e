//! Error types for the calculation engine
//!
//! Most variants describe broken internal invariants rather than bad data.
//! A caller that receives one of those should treat the graph that produced
//! it as unusable: state may have been partially applied.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for strata operations
#[derive(Debug, Error)]
pub enum Error {
    /// A selector reached the graph without having been validated upstream
    #[error("invalid selector {expression:?}: {message}")]
    InvalidSelector {
        /// The raw selector text
        expression: String,
        /// Why parsing failed
        message: String,
    },

    /// A reference count was decremented below zero or for an unknown key
    #[error("reference count underflow in {registry} for {key}")]
    RefCountUnderflow {
        /// Registry that detected the underflow
        registry: String,
        /// Debug rendering of the key
        key: String,
    },

    /// An activation or deactivation broke the lifecycle contract
    #[error("lifecycle violation for {kind} {id}: {message}")]
    Lifecycle {
        /// Kind of object (ip-set, tunnel, binding, ...)
        kind: String,
        /// Identifier of the object
        id: String,
        /// What went wrong
        message: String,
    },

    /// A derived name could not be parsed
    #[error("malformed {kind} name {name:?}: {message}")]
    MalformedName {
        /// Kind of name (policy, profile, ...)
        kind: String,
        /// The offending name
        name: String,
        /// Why it could not be parsed
        message: String,
    },

    /// A configuration parameter failed to parse
    #[error("invalid value {value:?} for config parameter {name}: {message}")]
    Config {
        /// Parameter name
        name: String,
        /// Raw value that was rejected
        value: String,
        /// Parse failure description
        message: String,
    },

    /// The channel feeding or draining the graph closed unexpectedly
    #[error("channel closed [{context}]")]
    ChannelClosed {
        /// Which channel closed
        context: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The input line number (if known)
        line: Option<usize>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "sequencer", "graph")
        context: String,
    },
}

impl Error {
    /// Create an invalid selector error
    pub fn invalid_selector(expression: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidSelector {
            expression: expression.into(),
            message: msg.into(),
        }
    }

    /// Create a refcount underflow error for the given registry and key
    pub fn underflow(registry: impl Into<String>, key: &impl std::fmt::Debug) -> Self {
        Self::RefCountUnderflow {
            registry: registry.into(),
            key: format!("{key:?}"),
        }
    }

    /// Create a lifecycle violation error
    pub fn lifecycle(
        kind: impl Into<String>,
        id: impl std::fmt::Display,
        msg: impl Into<String>,
    ) -> Self {
        Self::Lifecycle {
            kind: kind.into(),
            id: id.to_string(),
            message: msg.into(),
        }
    }

    /// Create a malformed name error
    pub fn malformed_name(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::MalformedName {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(
        name: impl Into<String>,
        value: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Config {
            name: name.into(),
            value: value.into(),
            message: msg.into(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed(context: impl Into<String>) -> Self {
        Self::ChannelClosed {
            context: context.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            line: None,
        }
    }

    /// Create a serialization error pointing at an input line
    pub fn serialization_at_line(line: usize, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            line: Some(line),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error signals a broken invariant of the calculation graph
    ///
    /// Invariant violations are unrecoverable for the graph instance that
    /// reported them.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::InvalidSelector { .. }
                | Self::RefCountUnderflow { .. }
                | Self::Lifecycle { .. }
                | Self::Config { .. }
                | Self::Internal { .. }
        )
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSelector { .. } => "invalid_selector",
            Self::RefCountUnderflow { .. } => "refcount_underflow",
            Self::Lifecycle { .. } => "lifecycle",
            Self::MalformedName { .. } => "malformed_name",
            Self::Config { .. } => "config",
            Self::ChannelClosed { .. } => "channel_closed",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_underflow_renders_key() {
        let err = Error::underflow("egress-selectors", &"has(foo)");
        assert_eq!(
            err.to_string(),
            "reference count underflow in egress-selectors for \"has(foo)\""
        );
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_lifecycle_error_display() {
        let err = Error::lifecycle("ip-set", "s:abc", "already active");
        assert_eq!(
            err.to_string(),
            "lifecycle violation for ip-set s:abc: already active"
        );
        assert_eq!(err.kind(), "lifecycle");
    }

    #[test]
    fn test_malformed_name_is_not_fatal() {
        let err = Error::malformed_name("policy", "a/b/c", "too many separators");
        assert!(!err.is_invariant_violation());
        assert!(err.to_string().contains("a/b/c"));
    }

    #[test]
    fn test_config_error_display() {
        let err = Error::config("TPROXYMode", "Sometimes", "unknown mode");
        assert_eq!(
            err.to_string(),
            "invalid value \"Sometimes\" for config parameter TPROXYMode: unknown mode"
        );
    }

    #[test]
    fn test_serialization_from_serde_json() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization { line: None, .. }));
    }

    #[test]
    fn test_internal_with_context() {
        let err = Error::internal_with_context("sequencer", "flush failed");
        assert_eq!(err.to_string(), "internal error [sequencer]: flush failed");
    }
}
