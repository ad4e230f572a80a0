//! veildns: core engine of an encrypted, privacy-preserving DNS forwarder
//!
//! This crate implements the two subsystems at the heart of an
//! encrypted DNS forwarder. Client listeners and the DNSCrypt/DoH wire
//! formats live outside and talk to this core through small interfaces.
//!
//! # Features
//!
//! - **Upstream pool**: registry of declared servers, periodic
//!   certificate re-validation, per-server round-trip averages and
//!   latency-aware load balancing with an opportunistic re-ranking
//!   estimator
//! - **Policy pipeline**: ordered query/response/logging module chains
//!   covering allowlists, blocklists, cloaking, IPv6 blocking, payload
//!   sizing, caching, per-domain forwarding and query logging
//! - **Anonymized routing**: relay route resolution for DNSCrypt
//!   traffic
//! - **Hot reload**: module sequences and rule sets swap atomically
//!   under in-flight traffic
//!
//! # Architecture
//!
//! ```text
//! Client Query
//!     │
//!     ▼
//! ┌──────────────────┐
//! │   Query Stage    │ ─── Reject/Synth ──▶ synthesized response
//! └────────┬─────────┘
//!          │ Forward
//!          ▼
//! ┌──────────────────┐     ┌──────────────────┐
//! │   ServerPool     │ ──▶ │    Transport     │ (DNSCrypt / DoH)
//! │  get_one() / P2  │     │  outside this    │
//! └────────┬─────────┘     │      crate       │
//!          │               └──────────────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Response Stage  │ ─── Reject ──▶ synthesized response
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Logging Stage   │
//! └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use std::time::Instant;
//!
//! use veildns::config::Config;
//! use veildns::pipeline::{PluginAction, PluginsGlobals, PluginsState};
//! use veildns::pool::ServerPool;
//! use veildns::stamp::ServerStamp;
//! use veildns::transport::ClientProto;
//!
//! # fn main() -> Result<(), veildns::error::ProxyError> {
//! let config = Config::default();
//! config.validate()?;
//!
//! let pool = ServerPool::from_config(&config);
//! pool.register("quad9", ServerStamp::doh("dns.quad9.net", "/dns-query"));
//!
//! let globals = PluginsGlobals::from_config(&config)?;
//! let state = PluginsState::new(&config, ClientProto::Udp, None, Instant::now());
//!
//! // per query: state.apply_query_plugins(...), pool.get_one(),
//! // dispatch over the transport, state.apply_response_plugins(...)
//! assert_eq!(state.action, PluginAction::Forward);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: configuration types
//! - [`dnsutil`]: raw-packet helpers and size constants
//! - [`error`]: error types
//! - [`ewma`]: round-trip moving average
//! - [`pipeline`]: the policy pipeline and its modules
//! - [`pool`]: the upstream server pool
//! - [`stamp`]: the server stamp data model
//! - [`transport`]: the consumed transport interface

pub mod config;
pub mod dnsutil;
pub mod error;
pub mod ewma;
pub mod pipeline;
pub mod pool;
pub mod stamp;
pub mod transport;

pub use config::{Config, LogFormat, RelayRef};
pub use error::{ProxyError, ProxyResult};
pub use pipeline::{
    BlockedResponsePolicy, PluginAction, PluginReturnCode, PluginsGlobals, PluginsState,
};
pub use pool::{LbStrategy, RegisteredServer, RelayAddrs, ServerInfo, ServerLink, ServerPool};
pub use stamp::{ServerStamp, StampProtoType};
pub use transport::{
    CertInfo, ClientProto, CryptoConstruction, DohResponse, TlsSessionInfo, Transport,
};
