//! Common types for strata: update model, errors, configuration and telemetry

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod model;
pub mod selector;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Prefix of IP set ids derived from rule selectors
pub const SELECTOR_IP_SET_PREFIX: &str = "s:";

/// Prefix of IP set ids derived from egress gateway selectors
pub const EGRESS_IP_SET_PREFIX: &str = "e:";

/// Profile name prefix carrying Kubernetes namespace labels
pub const NAMESPACE_PROFILE_PREFIX: &str = "kns.";

/// Profile name prefix carrying Kubernetes service account labels
pub const SERVICE_ACCOUNT_PROFILE_PREFIX: &str = "ksa.";

/// Label carrying the namespace of a namespaced workload
pub const NAMESPACE_LABEL: &str = "projectcalico.org/namespace";
