//! Layered configuration parameters
//!
//! Raw name/value pairs arrive from several sources. Each known parameter
//! takes its value from the highest-priority source that sets it, falling
//! back to a default. Unknown names are carried in the raw view only.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix of environment variables read by [`Config::from_env`]
pub const ENV_PREFIX: &str = "STRATA_";

/// Where a raw value came from, in increasing priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Built-in defaults
    Default,
    /// Cluster-wide datastore configuration
    DatastoreGlobal,
    /// Per-host datastore configuration
    DatastorePerHost,
    /// `STRATA_*` environment variables
    Environment,
}

macro_rules! config_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                $(if s.eq_ignore_ascii_case($text) {
                    return Ok(Self::$variant);
                })+
                Err(format!(
                    "expected one of: {}",
                    [$($text),+].join(", ")
                ))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(Self::$variant => f.write_str($text)),+
                }
            }
        }
    };
}

config_enum! {
    /// Which services get transparent-proxy IP sets
    TproxyMode {
        /// No tproxy IP sets
        Disabled => "Disabled",
        /// Only services annotated for L7 logging
        Enabled => "Enabled",
        /// Every service with TCP ports
        EnabledAllServices => "EnabledAllServices",
    }
}

config_enum! {
    /// Scope at which egress gateway selectors are honoured
    EgressIpSupport {
        /// Egress gateways are ignored
        Disabled => "Disabled",
        /// Only namespace (profile) selectors apply
        EnabledPerNamespace => "EnabledPerNamespace",
        /// Endpoint selectors override namespace selectors
        EnabledPerNamespaceOrPerPod => "EnabledPerNamespaceOrPerPod",
    }
}

config_enum! {
    /// IPsec tunnel mode
    IpsecMode {
        /// No IPsec bindings are computed
        Disabled => "Disabled",
        /// Pre-shared key mode
        Psk => "PSK",
    }
}

config_enum! {
    /// Minimum severity logged to the screen
    LogSeverity {
        /// Debug and above
        Debug => "Debug",
        /// Info and above
        Info => "Info",
        /// Warnings and errors
        Warning => "Warning",
        /// Errors only
        Error => "Error",
    }
}

impl LogSeverity {
    /// `tracing` filter level for this severity
    pub fn as_filter_level(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

/// Parsed values of every known parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Params {
    /// `TPROXYMode`
    pub tproxy_mode: TproxyMode,
    /// `EgressIPSupport`
    pub egress_ip_support: EgressIpSupport,
    /// `IPSecMode`
    pub ipsec_mode: IpsecMode,
    /// `LogSeverityScreen`
    pub log_severity_screen: LogSeverity,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            tproxy_mode: TproxyMode::Disabled,
            egress_ip_support: EgressIpSupport::Disabled,
            ipsec_mode: IpsecMode::Disabled,
            log_severity_screen: LogSeverity::Info,
        }
    }
}

/// Canonical names of the known parameters
pub const KNOWN_PARAMS: [&str; 4] = [
    "TPROXYMode",
    "EgressIPSupport",
    "IPSecMode",
    "LogSeverityScreen",
];

/// Layered configuration store
#[derive(Debug, Clone, Default)]
pub struct Config {
    sources: BTreeMap<ConfigSource, BTreeMap<String, String>>,
    params: Params,
}

impl Config {
    /// Configuration holding only defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration seeded from `STRATA_*` variables of the current process
    pub fn from_env() -> Result<Self> {
        Self::from_env_vars(std::env::vars())
    }

    /// Configuration seeded from the given environment-style pairs
    ///
    /// Only `STRATA_` prefixed names are considered; the remainder is
    /// matched case-insensitively against known parameter names.
    pub fn from_env_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let raw: BTreeMap<String, String> = vars
            .into_iter()
            .filter_map(|(k, v)| {
                let name = k.strip_prefix(ENV_PREFIX)?;
                let canonical = canonical_name(name).unwrap_or(name).to_string();
                Some((canonical, v))
            })
            .collect();
        let mut config = Self::new();
        config.update_from(&raw, ConfigSource::Environment)?;
        Ok(config)
    }

    /// Replace the raw values of one source and re-resolve every parameter
    ///
    /// Returns whether the merged raw values changed. On error the
    /// previous state is kept.
    pub fn update_from(
        &mut self,
        raw: &BTreeMap<String, String>,
        source: ConfigSource,
    ) -> Result<bool> {
        let before = self.raw_values();

        let mut sources = self.sources.clone();
        if raw.is_empty() {
            sources.remove(&source);
        } else {
            sources.insert(source, raw.clone());
        }
        let params = resolve(&sources)?;

        self.sources = sources;
        self.params = params;
        Ok(self.raw_values() != before)
    }

    /// Merged raw values, higher-priority sources winning
    pub fn raw_values(&self) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for raw in self.sources.values() {
            for (k, v) in raw {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    /// Parsed parameter values
    pub fn params(&self) -> &Params {
        &self.params
    }
}

/// Canonical spelling of a known parameter name, matched case-insensitively
pub fn canonical_name(name: &str) -> Option<&'static str> {
    KNOWN_PARAMS
        .iter()
        .copied()
        .find(|known| known.eq_ignore_ascii_case(name))
}

fn resolve(sources: &BTreeMap<ConfigSource, BTreeMap<String, String>>) -> Result<Params> {
    let mut params = Params::default();
    // Lowest priority first so later sources overwrite.
    for raw in sources.values() {
        for (name, value) in raw {
            match canonical_name(name) {
                Some("TPROXYMode") => params.tproxy_mode = parse(name, value)?,
                Some("EgressIPSupport") => params.egress_ip_support = parse(name, value)?,
                Some("IPSecMode") => params.ipsec_mode = parse(name, value)?,
                Some("LogSeverityScreen") => params.log_severity_screen = parse(name, value)?,
                _ => {}
            }
        }
    }
    Ok(params)
}

fn parse<T: FromStr<Err = String>>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|msg: String| Error::config(name, value, msg))
}
