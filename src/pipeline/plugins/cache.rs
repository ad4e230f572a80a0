//! Response cache modules
//!
//! Caching is split across the two stages: the query-side module serves
//! hits (synthesizing the cached answer with TTLs counted down to the
//! remaining lifetime), the response-side module stores fresh answers
//! with TTLs clamped to the configured bounds. Both share one store;
//! the query-side module stashes the computed key in the session
//! scratch map so the response side does not have to rebuild it.
//!
//! Negative answers (`NXDOMAIN` or an empty answer section) use the
//! separate negative-TTL bounds, so transient failures age out quickly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, ResponseCode};
use moka::sync::Cache;
use tracing::debug;

use crate::config::Config;
use crate::dnsutil::{clamp_answer_ttls, min_answer_ttl, normalize_qname};
use crate::error::ProxyResult;
use crate::pipeline::{PluginAction, PluginsState};

use super::{Plugin, SESSION_CACHE_KEY};

/// Lookup key: normalized name, type, class and the DNSSEC OK bit
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    name: String,
    qtype: u16,
    qclass: u16,
    dnssec: bool,
}

impl CacheKey {
    /// Key for a single-question message, if it has a question
    pub fn from_message(msg: &Message, dnssec: bool) -> Option<Self> {
        let question = msg.queries().first()?;
        Some(Self {
            name: normalize_qname(&question.name().to_string()),
            qtype: question.query_type().into(),
            qclass: question.query_class().into(),
            dnssec,
        })
    }
}

/// One cached response with its absolute expiration
#[derive(Debug, Clone)]
pub struct CachedResponse {
    msg: Message,
    expiration: Instant,
}

/// Shared store between the query-side and response-side modules
pub type CacheStore = Arc<Cache<CacheKey, CachedResponse>>;

/// Build the store sized from the configuration
pub fn new_store(config: &Config) -> CacheStore {
    Arc::new(Cache::new(config.cache_size as u64))
}

/// Serves cached responses during the query stage
pub struct CachePlugin {
    store: CacheStore,
}

impl CachePlugin {
    /// Query-side module over a shared store
    pub fn new(store: CacheStore) -> Self {
        Self { store }
    }
}

impl Plugin for CachePlugin {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn description(&self) -> &'static str {
        "Serves previously forwarded responses from memory"
    }

    fn eval(&self, state: &mut PluginsState, msg: &mut Message) -> ProxyResult<()> {
        let Some(key) = CacheKey::from_message(msg, state.dnssec) else {
            return Ok(());
        };
        state
            .session_data
            .insert(SESSION_CACHE_KEY, Box::new(key.clone()));

        let Some(cached) = self.store.get(&key) else {
            return Ok(());
        };
        let now = Instant::now();
        if cached.expiration <= now {
            self.store.invalidate(&key);
            return Ok(());
        }

        let mut synth = cached.msg.clone();
        synth.set_id(msg.id());
        let remaining = (cached.expiration - now).as_secs() as u32;
        clamp_answer_ttls(&mut synth, remaining.max(1));

        debug!(name = %key.name, "cache hit");
        state.synth_response = Some(synth);
        state.action = PluginAction::Synth;
        state.cache_hit = true;
        Ok(())
    }
}

/// Stores upstream responses during the response stage
pub struct CacheResponsePlugin {
    store: CacheStore,
}

impl CacheResponsePlugin {
    /// Response-side module over a shared store
    pub fn new(store: CacheStore) -> Self {
        Self { store }
    }
}

impl Plugin for CacheResponsePlugin {
    fn name(&self) -> &'static str {
        "cache_response"
    }

    fn description(&self) -> &'static str {
        "Stores upstream responses in the shared cache"
    }

    fn eval(&self, state: &mut PluginsState, msg: &mut Message) -> ProxyResult<()> {
        if msg.truncated() {
            return Ok(());
        }
        let rcode = msg.response_code();
        if !matches!(rcode, ResponseCode::NoError | ResponseCode::NXDomain) {
            return Ok(());
        }
        let key = match state
            .session_data
            .get(SESSION_CACHE_KEY)
            .and_then(|v| v.downcast_ref::<CacheKey>())
        {
            Some(key) => key.clone(),
            // The query stage may have been bypassed; rebuild the key
            None => match CacheKey::from_message(msg, state.dnssec) {
                Some(key) => key,
                None => return Ok(()),
            },
        };

        let negative = rcode == ResponseCode::NXDomain || msg.answers().is_empty();
        let (min_ttl, max_ttl) = if negative {
            (state.cache_neg_min_ttl, state.cache_neg_max_ttl)
        } else {
            (state.cache_min_ttl, state.cache_max_ttl)
        };
        let ttl = min_answer_ttl(msg)
            .unwrap_or(min_ttl)
            .clamp(min_ttl, max_ttl);

        let mut stored = msg.clone();
        clamp_answer_ttls(&mut stored, ttl);
        debug!(name = %key.name, ttl, negative, "response cached");
        self.store.insert(
            key,
            CachedResponse {
                msg: stored,
                expiration: Instant::now() + Duration::from_secs(u64::from(ttl)),
            },
        );
        Ok(())
    }
}
