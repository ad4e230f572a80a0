//! Forwarder configuration types
//!
//! This module defines the configuration surface of the core: which
//! policy modules are armed (driven by the presence of rule files and
//! flags), the cache policy snapshot each request carries, the
//! load-balancing tuning of the upstream pool, and the anonymization
//! routes.
//!
//! # Configuration Structure
//!
//! ```text
//! Config
//! ├── timeout_secs, force_tcp
//! ├── lb_strategy, lb_estimator
//! ├── query_meta: Vec<String>
//! ├── allowed_names_file / block_names_file / cloak_file / forward_file
//! ├── block_ipv6, block_ips_file
//! ├── cache + cache_size + TTL clamps + reject_ttl
//! ├── nx_log_file / query_log_file / query_log_format
//! ├── blocked_query_response (grammar: "refused" | "hinfo" | "a:<IPv4>[,aaaa:<IPv6>]")
//! └── routes: server name (or "*") -> relay references
//! ```
//!
//! # Example
//!
//! ```
//! use veildns::config::Config;
//!
//! let config = Config::default();
//! assert!(config.cache);
//! assert_eq!(config.timeout_secs, 5);
//! config.validate().expect("defaults are valid");
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, ProxyResult};
use crate::pool::LbStrategy;
use crate::stamp::ServerStamp;

/// Output format of the query log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Tab-separated values
    #[default]
    Tsv,
    /// Labeled tab-separated values (`key:value` pairs)
    Ltsv,
}

/// One entry of a relay route
///
/// Either a fully parsed relay stamp (produced by the external stamp
/// loader), or a string that is interpreted at resolution time as a bare
/// `host:port` or as the name of a registered relay or server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelayRef {
    /// A parsed relay stamp
    Stamp(ServerStamp),
    /// A `host:port` literal or a registered name
    Via(String),
}

/// Top-level configuration of the forwarder core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Deadline for each upstream attempt, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Use TCP for DNSCrypt exchanges instead of UDP
    #[serde(default)]
    pub force_tcp: bool,

    /// Load-balancing strategy of the upstream pool
    #[serde(default)]
    pub lb_strategy: LbStrategy,

    /// Opportunistically reshuffle the pool ranking on selection
    #[serde(default = "default_true")]
    pub lb_estimator: bool,

    /// `key=value` strings attached to outgoing queries as a TXT record
    #[serde(default)]
    pub query_meta: Vec<String>,

    /// Rules file of names exempt from blocking
    #[serde(default)]
    pub allowed_names_file: Option<PathBuf>,

    /// Rules file of blocked names
    #[serde(default)]
    pub block_names_file: Option<PathBuf>,

    /// Reject all `AAAA` queries
    #[serde(default)]
    pub block_ipv6: bool,

    /// Rules file mapping names to forged addresses
    #[serde(default)]
    pub cloak_file: Option<PathBuf>,

    /// Rules file mapping name suffixes to plain-DNS resolvers
    #[serde(default)]
    pub forward_file: Option<PathBuf>,

    /// Whether responses are cached
    #[serde(default = "default_true")]
    pub cache: bool,

    /// Maximum number of cached responses
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Lower clamp on cached TTLs, in seconds
    #[serde(default = "default_cache_min_ttl")]
    pub cache_min_ttl: u32,

    /// Upper clamp on cached TTLs, in seconds
    #[serde(default = "default_cache_max_ttl")]
    pub cache_max_ttl: u32,

    /// Lower clamp on cached negative-response TTLs, in seconds
    #[serde(default = "default_cache_neg_min_ttl")]
    pub cache_neg_min_ttl: u32,

    /// Upper clamp on cached negative-response TTLs, in seconds
    #[serde(default = "default_cache_neg_max_ttl")]
    pub cache_neg_max_ttl: u32,

    /// TTL of synthesized answers for rejected or cloaked queries
    #[serde(default = "default_reject_ttl")]
    pub reject_ttl: u32,

    /// Rules file of response addresses that trigger rejection
    #[serde(default)]
    pub block_ips_file: Option<PathBuf>,

    /// File receiving one line per `NXDOMAIN` answer
    #[serde(default)]
    pub nx_log_file: Option<PathBuf>,

    /// File receiving one line per completed query
    #[serde(default)]
    pub query_log_file: Option<PathBuf>,

    /// Format of the query log
    #[serde(default)]
    pub query_log_format: LogFormat,

    /// What a rejected query is answered with; see the module docs for
    /// the grammar
    #[serde(default = "default_blocked_query_response")]
    pub blocked_query_response: String,

    /// Anonymization routes: server name (or `"*"` for any) to the
    /// relays its queries may be sent through
    #[serde(default)]
    pub routes: HashMap<String, Vec<RelayRef>>,
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_cache_size() -> usize {
    512
}

fn default_cache_min_ttl() -> u32 {
    2400
}

fn default_cache_max_ttl() -> u32 {
    86400
}

fn default_cache_neg_min_ttl() -> u32 {
    60
}

fn default_cache_neg_max_ttl() -> u32 {
    600
}

fn default_reject_ttl() -> u32 {
    600
}

fn default_blocked_query_response() -> String {
    "hinfo".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            force_tcp: false,
            lb_strategy: LbStrategy::default(),
            lb_estimator: true,
            query_meta: Vec::new(),
            allowed_names_file: None,
            block_names_file: None,
            block_ipv6: false,
            cloak_file: None,
            forward_file: None,
            cache: true,
            cache_size: default_cache_size(),
            cache_min_ttl: default_cache_min_ttl(),
            cache_max_ttl: default_cache_max_ttl(),
            cache_neg_min_ttl: default_cache_neg_min_ttl(),
            cache_neg_max_ttl: default_cache_neg_max_ttl(),
            reject_ttl: default_reject_ttl(),
            block_ips_file: None,
            nx_log_file: None,
            query_log_file: None,
            query_log_format: LogFormat::default(),
            blocked_query_response: default_blocked_query_response(),
            routes: HashMap::new(),
        }
    }
}

impl Config {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set the load-balancing strategy
    #[must_use]
    pub fn with_lb_strategy(mut self, strategy: LbStrategy) -> Self {
        self.lb_strategy = strategy;
        self
    }

    /// Enable or disable the selection-time estimator
    #[must_use]
    pub fn with_lb_estimator(mut self, enabled: bool) -> Self {
        self.lb_estimator = enabled;
        self
    }

    /// Set the blocked-query response policy string
    #[must_use]
    pub fn with_blocked_query_response(mut self, policy: impl Into<String>) -> Self {
        self.blocked_query_response = policy.into();
        self
    }

    /// Set the blocked-names rules file
    #[must_use]
    pub fn with_block_names_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.block_names_file = Some(path.into());
        self
    }

    /// Set the cloaking rules file
    #[must_use]
    pub fn with_cloak_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cloak_file = Some(path.into());
        self
    }

    /// Enable or disable response caching
    #[must_use]
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache = enabled;
        self
    }

    /// Add a relay route for a server name (or `"*"`)
    #[must_use]
    pub fn with_route(mut self, server: impl Into<String>, relays: Vec<RelayRef>) -> Self {
        self.routes.insert(server.into(), relays);
        self
    }

    /// Per-attempt timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check the configuration for internally inconsistent values
    pub fn validate(&self) -> ProxyResult<()> {
        if self.timeout_secs == 0 {
            return Err(ProxyError::config_field(
                "must be at least one second",
                "timeout_secs",
            ));
        }
        if self.cache {
            if self.cache_size == 0 {
                return Err(ProxyError::config_field("must be positive", "cache_size"));
            }
            if self.cache_min_ttl > self.cache_max_ttl {
                return Err(ProxyError::config_field(
                    "lower clamp exceeds upper clamp",
                    "cache_min_ttl",
                ));
            }
            if self.cache_neg_min_ttl > self.cache_neg_max_ttl {
                return Err(ProxyError::config_field(
                    "lower clamp exceeds upper clamp",
                    "cache_neg_min_ttl",
                ));
            }
        }
        Ok(())
    }
}
