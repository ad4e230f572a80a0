//! Upstream server pool
//!
//! This module maintains the set of upstream resolvers: a registry of
//! declared servers and a live pool of probed ones, ordered by estimated
//! latency. A periodic [`refresh`](ServerPool::refresh) re-validates
//! every registered server through the transport layer and re-sorts the
//! live pool; [`get_one`](ServerPool::get_one) picks a server per query
//! according to the configured load-balancing strategy.
//!
//! # Selection strategies
//!
//! - **First**: always the head of the latency-ordered pool
//! - **P2** (default): uniformly among the top two
//! - **PH**: uniformly among the better half (at least the top two)
//! - **Random**: uniformly among all live servers
//!
//! # The estimator
//!
//! Keeping the pool exactly sorted on every query would be wasted work
//! when rankings are stable, so selection instead runs an opportunistic
//! estimator: it samples one random server per call, promotes it if its
//! average round-trip time beats the current head, and periodically
//! grants laggards a bounded "second chance" so a server that recovered
//! gets sampled again. A single adjacent-swap pass then nudges the pool
//! back toward sorted order; convergence is amortized over calls.
//!
//! # Locking
//!
//! One reader/writer lock guards both the registry and the live pool.
//! Selection takes the write lock because the estimator reorders the
//! pool; there is deliberately no read-only fast path.

mod probe;
mod relay;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{Config, RelayRef};
use crate::error::{ProxyError, ProxyResult};
use crate::ewma::{MovingAverage, RTT_EWMA_DECAY};
use crate::stamp::{ServerStamp, StampProtoType};
use crate::transport::{ClientProto, CryptoConstruction, Transport};

/// How long a laggard must sit unused before the estimator lowers its
/// average again
const SECOND_CHANCE_IDLE: Duration = Duration::from_secs(60);

/// A laggard qualifies for a second chance once its average is this many
/// times the best one
const SECOND_CHANCE_RATIO: f64 = 4.0;

/// Load-balancing strategy for per-query server selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LbStrategy {
    /// Always use the head of the latency-ordered pool
    First,
    /// Pick uniformly among the top two (power-of-two choices)
    #[default]
    P2,
    /// Pick uniformly among the better half, but at least the top two
    Ph,
    /// Pick uniformly among all live servers
    Random,
}

/// A declared upstream, not yet probed
///
/// Inserted at configuration time, replaced in place on
/// re-registration, and never removed except through a full rebuild.
#[derive(Debug, Clone)]
pub struct RegisteredServer {
    /// Unique name within the registry
    pub name: String,
    /// The server's stamp
    pub stamp: ServerStamp,
    /// Free-form description from the source list
    pub description: String,
}

/// Resolved addresses of an anonymization relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayAddrs {
    /// Relay address for datagram exchanges
    pub udp_addr: SocketAddr,
    /// Relay address for stream exchanges
    pub tcp_addr: SocketAddr,
}

/// Protocol-specific connection material of a live server
#[derive(Debug, Clone)]
pub enum ServerLink {
    /// A DNSCrypt resolver, optionally reached through a relay
    DnsCrypt {
        /// Fixed query prefix the resolver demultiplexes on
        magic_query: [u8; 8],
        /// Resolver public key from the validated certificate
        server_pk: [u8; 32],
        /// Precomputed shared key for this client
        shared_key: [u8; 32],
        /// AEAD construction the certificate selects
        crypto_construction: CryptoConstruction,
        /// Resolver address for datagram exchanges
        udp_addr: SocketAddr,
        /// Resolver address for stream exchanges
        tcp_addr: SocketAddr,
        /// Anonymization hop, when a route matched
        relay: Option<RelayAddrs>,
    },
    /// A DoH resolver
    Doh {
        /// Endpoint URL
        url: String,
        /// Host name presented in TLS and HTTP
        host_name: String,
        /// Whether the server required GET instead of POST
        use_get: bool,
    },
}

/// A live upstream usable for queries
///
/// Created by a successful probe, replaced in place when a later refresh
/// for the same name succeeds, and kept across failed refreshes. Never
/// garbage-collected based on round-trip time alone.
#[derive(Debug)]
pub struct ServerInfo {
    name: String,
    timeout: Duration,
    link: ServerLink,
    initial_rtt: u32,
    rtt: Mutex<MovingAverage>,
    last_action: Mutex<Option<Instant>>,
}

impl ServerInfo {
    pub(crate) fn new(name: &str, timeout: Duration, link: ServerLink, initial_rtt: u32) -> Self {
        Self {
            name: name.to_string(),
            timeout,
            link,
            initial_rtt,
            rtt: Mutex::new(MovingAverage::new(RTT_EWMA_DECAY)),
            last_action: Mutex::new(None),
        }
    }

    /// Registry name of this server
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deadline for each exchange with this server
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Protocol-specific connection material
    pub fn link(&self) -> &ServerLink {
        &self.link
    }

    /// Protocol this server speaks
    pub fn proto(&self) -> StampProtoType {
        match self.link {
            ServerLink::DnsCrypt { .. } => StampProtoType::DnsCrypt,
            ServerLink::Doh { .. } => StampProtoType::Doh,
        }
    }

    /// Round-trip time of the validation probe, in milliseconds
    pub fn initial_rtt(&self) -> u32 {
        self.initial_rtt
    }

    /// Current round-trip average in milliseconds; negative before the
    /// first measurement
    pub fn rtt_value(&self) -> f64 {
        self.rtt.lock().value()
    }
}

struct PoolInner {
    live: Vec<Arc<ServerInfo>>,
    registered: Vec<RegisteredServer>,
    relays: Vec<RegisteredServer>,
}

/// Registry and latency-ordered live pool of upstream servers
///
/// # Thread Safety
///
/// The pool is shared across all request tasks and the refresh task.
/// All state sits behind one reader/writer lock; see the module docs
/// for the locking discipline.
///
/// # Example
///
/// ```
/// use veildns::pool::{LbStrategy, ServerPool};
/// use veildns::stamp::ServerStamp;
///
/// let pool = ServerPool::builder()
///     .strategy(LbStrategy::P2)
///     .estimator(true)
///     .build();
///
/// pool.register("quad9", ServerStamp::doh("dns.quad9.net", "/dns-query"));
/// assert_eq!(pool.registered_servers().len(), 1);
/// assert!(pool.get_one().is_none()); // nothing probed yet
/// ```
pub struct ServerPool {
    inner: RwLock<PoolInner>,
    strategy: LbStrategy,
    estimator: bool,
    main_proto: ClientProto,
    timeout: Duration,
    routes: HashMap<String, Vec<RelayRef>>,
}

impl std::fmt::Debug for ServerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ServerPool")
            .field("registered", &inner.registered.len())
            .field("live", &inner.live.len())
            .field("strategy", &self.strategy)
            .field("estimator", &self.estimator)
            .finish()
    }
}

impl ServerPool {
    /// Start building a pool
    pub fn builder() -> ServerPoolBuilder {
        ServerPoolBuilder::new()
    }

    /// Build a pool from the relevant configuration fields
    pub fn from_config(config: &Config) -> Self {
        Self::builder()
            .strategy(config.lb_strategy)
            .estimator(config.lb_estimator)
            .timeout(config.timeout())
            .main_proto(if config.force_tcp {
                ClientProto::Tcp
            } else {
                ClientProto::Udp
            })
            .routes(config.routes.clone())
            .build()
    }

    /// Add or replace a server declaration by name
    ///
    /// Never touches the live pool; the next refresh probes the new
    /// stamp.
    pub fn register(&self, name: &str, stamp: ServerStamp) {
        let server = RegisteredServer {
            name: name.to_string(),
            stamp,
            description: String::new(),
        };
        let mut inner = self.inner.write();
        match inner.registered.iter().position(|r| r.name == name) {
            Some(i) => inner.registered[i] = server,
            None => inner.registered.push(server),
        }
    }

    /// Add or replace a relay declaration by name
    pub fn register_relay(&self, name: &str, stamp: ServerStamp) {
        let relay = RegisteredServer {
            name: name.to_string(),
            stamp,
            description: String::new(),
        };
        let mut inner = self.inner.write();
        match inner.relays.iter().position(|r| r.name == name) {
            Some(i) => inner.relays[i] = relay,
            None => inner.relays.push(relay),
        }
    }

    /// Snapshot of the registry
    pub fn registered_servers(&self) -> Vec<RegisteredServer> {
        self.inner.read().registered.clone()
    }

    /// Number of live servers
    pub fn live_len(&self) -> usize {
        self.inner.read().live.len()
    }

    /// Whether the live pool is empty
    pub fn is_empty(&self) -> bool {
        self.inner.read().live.is_empty()
    }

    /// Snapshot of the live pool in its current order
    pub fn live_servers(&self) -> Vec<Arc<ServerInfo>> {
        self.inner.read().live.clone()
    }

    /// Probe every registered server and re-sort the live pool
    ///
    /// Partial success is normal: servers that fail to probe keep their
    /// previous live entry, if any. Returns the number of successfully
    /// probed servers and the last error encountered.
    pub async fn refresh(&self, transport: &dyn Transport) -> (usize, Option<ProxyError>) {
        debug!("refreshing certificates");
        let registered = self.registered_servers();
        let mut live_servers = 0;
        let mut last_error = None;
        for server in &registered {
            match self.refresh_one(transport, &server.name, &server.stamp).await {
                Ok(()) => live_servers += 1,
                Err(err) => last_error = Some(err),
            }
        }

        let mut inner = self.inner.write();
        inner.live.sort_by_key(|s| s.initial_rtt);
        if inner.live.len() > 1 {
            info!("sorted latencies:");
            for server in &inner.live {
                info!("- {:5}ms {}", server.initial_rtt, server.name);
            }
        }
        if let Some(best) = inner.live.first() {
            info!(
                server = %best.name,
                rtt_ms = best.initial_rtt,
                "server with the lowest initial latency"
            );
        }
        (live_servers, last_error)
    }

    /// Probe one server and install the result in the live pool
    ///
    /// The previous live entry for the name survives a failed probe.
    pub async fn refresh_one(
        &self,
        transport: &dyn Transport,
        name: &str,
        stamp: &ServerStamp,
    ) -> ProxyResult<()> {
        let is_new = {
            let inner = self.inner.read();
            !inner.live.iter().any(|s| s.name == name)
        };
        let new_server = self.fetch_server_info(transport, name, stamp, is_new).await?;
        if new_server.name != name {
            return Err(ProxyError::fatal(format!(
                "probe answered for [{}] instead of [{}]",
                new_server.name, name
            )));
        }
        new_server.rtt.lock().set(f64::from(new_server.initial_rtt));
        let new_server = Arc::new(new_server);

        let mut inner = self.inner.write();
        match inner.live.iter().position(|s| s.name == name) {
            Some(i) => inner.live[i] = new_server,
            None => {
                inner.live.push(new_server);
                // A live server should always have a declaration behind
                // it; reconcile the registry if it somehow lost this one.
                if !inner.registered.iter().any(|r| r.name == name) {
                    inner.registered.push(RegisteredServer {
                        name: name.to_string(),
                        stamp: stamp.clone(),
                        description: String::new(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Run [`refresh`](Self::refresh) forever at the given interval
    ///
    /// The out-of-band companion of the per-query path; spawn it once
    /// next to the listeners.
    pub async fn refresh_loop(self: Arc<Self>, transport: Arc<dyn Transport>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let (live, last_error) = self.refresh(transport.as_ref()).await;
            match last_error {
                None => debug!(live, "refresh round complete"),
                Some(err) => debug!(live, error = %err, "refresh round complete with failures"),
            }
        }
    }

    /// Select a server for one request
    ///
    /// Returns `None` when the live pool is empty. Takes the write lock:
    /// when the estimator is enabled, selection reorders the pool.
    pub fn get_one(&self) -> Option<Arc<ServerInfo>> {
        let mut inner = self.inner.write();
        let count = inner.live.len();
        if count == 0 {
            return None;
        }
        if self.estimator {
            Self::estimator_update(&mut inner.live);
        }
        let candidate = match self.strategy {
            LbStrategy::First => 0,
            LbStrategy::Ph => {
                rand::thread_rng().gen_range(0..usize::max(usize::min(count, 2), count / 2))
            }
            LbStrategy::Random => rand::thread_rng().gen_range(0..count),
            LbStrategy::P2 => rand::thread_rng().gen_range(0..usize::min(count, 2)),
        };
        let server = inner.live[candidate].clone();
        debug!(
            server = %server.name,
            rtt_ms = server.rtt_value() as i64,
            "using candidate"
        );
        Some(server)
    }

    fn estimator_update(live: &mut [Arc<ServerInfo>]) {
        let candidate = rand::thread_rng().gen_range(0..live.len());
        Self::estimator_apply(live, candidate, Instant::now());
    }

    /// One estimator step for a given candidate index
    ///
    /// Runs under the pool write lock. When the head has no measurement
    /// yet it is seeded from the candidate first; the promotion
    /// comparison then runs against the seeded value, so the first
    /// observation never swaps.
    fn estimator_apply(live: &mut [Arc<ServerInfo>], candidate: usize, now: Instant) {
        if candidate == 0 {
            return;
        }
        let candidate_rtt = live[candidate].rtt_value();
        let mut best_rtt = live[0].rtt_value();
        if best_rtt < 0.0 {
            best_rtt = candidate_rtt;
            live[0].rtt.lock().set(best_rtt);
        }
        let mut partial_sort = false;
        if candidate_rtt < best_rtt {
            live.swap(0, candidate);
            partial_sort = true;
            debug!(
                server = %live[0].name,
                rtt_ms = candidate_rtt as i64,
                previous_ms = best_rtt as i64,
                "new preferred candidate"
            );
        } else if candidate_rtt > 0.0 && candidate_rtt >= best_rtt * SECOND_CHANCE_RATIO {
            let idle = live[candidate]
                .last_action
                .lock()
                .map_or(true, |ts| now.duration_since(ts) > SECOND_CHANCE_IDLE);
            if idle {
                // At most halve the average, but never below twice the
                // best and never above where it was.
                let lowered = (candidate_rtt / 2.0).max(best_rtt * 2.0).min(candidate_rtt);
                live[candidate].rtt.lock().add(lowered);
                partial_sort = true;
                debug!(
                    server = %live[candidate].name,
                    from_ms = candidate_rtt as i64,
                    to_ms = live[candidate].rtt_value() as i64,
                    best_ms = best_rtt as i64,
                    "giving a new chance to candidate"
                );
            }
        }
        if partial_sort {
            // A single adjacent-swap pass; full sorted order is reached
            // over successive calls.
            for i in 1..live.len() {
                if live[i - 1].rtt_value() > live[i].rtt_value() {
                    live.swap(i - 1, i);
                }
            }
        }
    }

    /// Stamp the start of an exchange with `server`
    pub fn notice_begin(&self, server: &ServerInfo) {
        let _pool = self.inner.write();
        *server.last_action.lock() = Some(Instant::now());
    }

    /// Feed a completed exchange into the server's round-trip average
    ///
    /// Only elapsed times strictly between zero and the server timeout
    /// count; anything else is treated as clock noise.
    pub fn notice_success(&self, server: &ServerInfo) {
        let now = Instant::now();
        let _pool = self.inner.write();
        let Some(started) = *server.last_action.lock() else {
            return;
        };
        let elapsed = now.duration_since(started);
        let elapsed_ms = elapsed.as_millis();
        if elapsed_ms > 0 && elapsed < server.timeout {
            server.rtt.lock().add(elapsed_ms as f64);
        }
    }

    /// Penalize the server's round-trip average by one full timeout
    ///
    /// Failures make a server unattractive but never remove it.
    pub fn notice_failure(&self, server: &ServerInfo) {
        let _pool = self.inner.write();
        server.rtt.lock().add(server.timeout.as_millis() as f64);
    }
}

/// Builder for [`ServerPool`]
pub struct ServerPoolBuilder {
    strategy: LbStrategy,
    estimator: bool,
    main_proto: ClientProto,
    timeout: Duration,
    routes: HashMap<String, Vec<RelayRef>>,
}

impl ServerPoolBuilder {
    /// Create a builder with defaults (P2, estimator on, UDP, 5 s)
    pub fn new() -> Self {
        Self {
            strategy: LbStrategy::default(),
            estimator: true,
            main_proto: ClientProto::Udp,
            timeout: Duration::from_secs(5),
            routes: HashMap::new(),
        }
    }

    /// Set the selection strategy
    #[must_use]
    pub fn strategy(mut self, strategy: LbStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Enable or disable the selection-time estimator
    #[must_use]
    pub fn estimator(mut self, enabled: bool) -> Self {
        self.estimator = enabled;
        self
    }

    /// Set the transport protocol used for DNSCrypt certificate fetches
    #[must_use]
    pub fn main_proto(mut self, proto: ClientProto) -> Self {
        self.main_proto = proto;
        self
    }

    /// Set the per-exchange timeout propagated to live servers
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the anonymization routes
    #[must_use]
    pub fn routes(mut self, routes: HashMap<String, Vec<RelayRef>>) -> Self {
        self.routes = routes;
        self
    }

    /// Build the pool
    pub fn build(self) -> ServerPool {
        ServerPool {
            inner: RwLock::new(PoolInner {
                live: Vec::new(),
                registered: Vec::new(),
                relays: Vec::new(),
            }),
            strategy: self.strategy,
            estimator: self.estimator,
            main_proto: self.main_proto,
            timeout: self.timeout,
            routes: self.routes,
        }
    }
}

impl Default for ServerPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
