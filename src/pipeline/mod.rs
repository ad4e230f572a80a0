//! Request-processing pipeline
//!
//! Every client query flows through a two-stage chain of policy modules
//! plus a logging stage: the *query* stage runs before the upstream
//! exchange and may rewrite, drop, reject or forward the message; the
//! *response* stage runs on the upstream answer and may further reject
//! or mutate it; the *logging* stage records the outcome. Modules are
//! configured once and shared by every in-flight request through
//! [`PluginsGlobals`]; each request owns a [`PluginsState`] that modules
//! read and write as the message moves through the stages.
//!
//! ```text
//! client query ──▶ query stage ──▶ upstream ──▶ response stage ──▶ logging
//!                     │                             │
//!                 Reject/Synth                  Reject/Synth
//!                     │                             │
//!                     └────────── synthesized response ──────────▶ client
//! ```
//!
//! # Ordering
//!
//! Within a stage, modules run strictly in configured order and a module
//! that sets an action other than `Forward` ends the stage for that
//! request. The module sequences are held under a reader lock for the
//! whole stage, so a reload swaps the entire set atomically: a request
//! sees the pre-reload modules or the post-reload modules, never a mix.

pub mod plugins;

use std::any::Any;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, HINFO};
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::Config;
use crate::dnsutil::{
    clamp_answer_ttls, has_tc_flag, rcode, MAX_DNS_UDP_PACKET_SIZE, MAX_DNS_UDP_SAFE_PACKET_SIZE,
    MIN_DNS_PACKET_SIZE, RESPONSE_OVERHEAD,
};
use crate::error::{ProxyError, ProxyResult};
use crate::transport::ClientProto;

use plugins::Plugin;

/// What should happen to the request after a module ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PluginAction {
    /// Nothing decided yet
    None,
    /// Keep going and send the query upstream
    #[default]
    Forward,
    /// Silently drop the request
    Drop,
    /// Answer with the configured blocked-query response
    Reject,
    /// Answer with a module-synthesized response
    Synth,
}

/// Outcome classification recorded for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PluginReturnCode {
    /// Upstream answered successfully
    #[default]
    Pass,
    /// The query was handed to a forwarding rule
    Forward,
    /// The request was dropped
    Drop,
    /// The request was rejected by policy
    Reject,
    /// A module synthesized the response
    Synth,
    /// The packet did not parse
    ParseError,
    /// Upstream answered with NXDOMAIN
    NXDomain,
    /// Upstream answered with an unexpected response code
    ResponseError,
    /// Upstream answered with SERVFAIL
    ServerError,
    /// The answer was forged by a cloaking rule
    Cloak,
    /// Upstream did not answer in time
    ServerTimeout,
}

impl std::fmt::Display for PluginReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pass => "PASS",
            Self::Forward => "FORWARD",
            Self::Drop => "DROP",
            Self::Reject => "REJECT",
            Self::Synth => "SYNTH",
            Self::ParseError => "PARSE_ERROR",
            Self::NXDomain => "NXDOMAIN",
            Self::ResponseError => "RESPONSE_ERROR",
            Self::ServerError => "SERVER_ERROR",
            Self::Cloak => "CLOAK",
            Self::ServerTimeout => "SERVER_TIMEOUT",
        })
    }
}

/// What a rejected query is answered with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockedResponsePolicy {
    /// Answer with the `REFUSED` response code
    pub refused_code_in_responses: bool,
    /// Address returned for rejected `A` queries
    pub respond_with_ipv4: Option<Ipv4Addr>,
    /// Address returned for rejected `AAAA` queries
    pub respond_with_ipv6: Option<Ipv6Addr>,
}

/// Per-request mutable state owned by one task
///
/// Created when a query arrives, threaded through both stages and the
/// logging pass, then discarded once the response is sent. The
/// `session_data` map is keyed by module identifier so modules can stash
/// cross-stage scratch without colliding.
pub struct PluginsState {
    /// What should happen to the request
    pub action: PluginAction,
    /// Outcome classification for logging
    pub return_code: PluginReturnCode,
    /// Module-addressed scratch storage
    pub session_data: HashMap<&'static str, Box<dyn Any + Send>>,
    /// Largest payload that is safe without encryption overhead
    pub max_unencrypted_udp_safe_payload_size: usize,
    /// Payload limit advertised by the client, before clamping
    pub original_max_payload_size: usize,
    /// Effective payload limit for the response
    pub max_payload_size: usize,
    /// Transport the client used
    pub client_proto: ClientProto,
    /// Client address, when the listener knows it
    pub client_addr: Option<SocketAddr>,
    /// Response synthesized by a module or by rejection
    pub synth_response: Option<Message>,
    /// Whether the client requested DNSSEC records
    pub dnssec: bool,
    /// Cache policy snapshot read by the cache module
    pub cache_size: usize,
    /// Lower clamp for cached negative responses, in seconds
    pub cache_neg_min_ttl: u32,
    /// Upper clamp for cached negative responses, in seconds
    pub cache_neg_max_ttl: u32,
    /// Lower clamp for cached responses, in seconds
    pub cache_min_ttl: u32,
    /// Upper clamp for cached responses, in seconds
    pub cache_max_ttl: u32,
    /// TTL of synthesized answers for rejected queries
    pub reject_ttl: u32,
    /// The parsed question, kept for the logging stage
    pub question_msg: Option<Message>,
    /// When the request arrived
    pub request_start: Instant,
    /// When the logging stage ran
    pub request_end: Option<Instant>,
    /// Whether the response came from the cache
    pub cache_hit: bool,
    /// Name of the upstream the query was routed to
    pub server_name: String,
}

impl PluginsState {
    /// State for a fresh request
    pub fn new(
        config: &Config,
        client_proto: ClientProto,
        client_addr: Option<SocketAddr>,
        start: Instant,
    ) -> Self {
        Self {
            action: PluginAction::Forward,
            return_code: PluginReturnCode::default(),
            session_data: HashMap::new(),
            max_unencrypted_udp_safe_payload_size: MAX_DNS_UDP_SAFE_PACKET_SIZE,
            original_max_payload_size: 0,
            max_payload_size: MAX_DNS_UDP_PACKET_SIZE - RESPONSE_OVERHEAD,
            client_proto,
            client_addr,
            synth_response: None,
            dnssec: false,
            cache_size: config.cache_size,
            cache_neg_min_ttl: config.cache_neg_min_ttl,
            cache_neg_max_ttl: config.cache_neg_max_ttl,
            cache_min_ttl: config.cache_min_ttl,
            cache_max_ttl: config.cache_max_ttl,
            reject_ttl: config.reject_ttl,
            question_msg: None,
            request_start: start,
            request_end: None,
            cache_hit: false,
            server_name: String::new(),
        }
    }

    /// Run the query stage over `packet`
    ///
    /// The packet is re-packed in place when any module ran; on error it
    /// is left untouched. A module that rejects the query leaves the
    /// synthesized answer in [`synth_response`](Self::synth_response).
    pub fn apply_query_plugins(
        &mut self,
        globals: &PluginsGlobals,
        packet: &mut Vec<u8>,
        server_name: &str,
    ) -> ProxyResult<()> {
        let inner = globals.inner.read();
        if inner.query_plugins.is_empty() && inner.logging_plugins.is_empty() {
            return Ok(());
        }
        self.server_name = server_name.to_string();
        self.action = PluginAction::Forward;

        let mut msg = Message::from_vec(packet).map_err(|e| {
            self.return_code = PluginReturnCode::ParseError;
            ProxyError::parse(e.to_string())
        })?;
        if msg.queries().len() > 1 {
            return Err(ProxyError::BadQuestionCount {
                count: msg.queries().len(),
            });
        }
        self.question_msg = Some(msg.clone());

        for plugin in &inner.query_plugins {
            if let Err(err) = plugin.eval(self, &mut msg) {
                self.action = PluginAction::Drop;
                return Err(ProxyError::module(plugin.name(), err.to_string()));
            }
            if self.action == PluginAction::Reject {
                self.synth_response = Some(refused_response_from_message(
                    &msg,
                    &inner.blocked_response,
                    self.reject_ttl,
                )?);
            }
            if self.action != PluginAction::Forward {
                break;
            }
        }

        pack_into(&msg, packet)
    }

    /// Run the response stage over `packet`
    ///
    /// A packet that fails to parse but is at least a DNS header long
    /// and has the truncation bit set is passed through untouched: it
    /// was cut short on purpose. When `override_ttl` is given, every
    /// answer TTL is clamped to it.
    pub fn apply_response_plugins(
        &mut self,
        globals: &PluginsGlobals,
        packet: &mut Vec<u8>,
        override_ttl: Option<u32>,
    ) -> ProxyResult<()> {
        let inner = globals.inner.read();
        if inner.response_plugins.is_empty() && inner.logging_plugins.is_empty() {
            return Ok(());
        }
        self.action = PluginAction::Forward;

        let mut msg = match Message::from_vec(packet) {
            Ok(msg) => msg,
            Err(e) => {
                if packet.len() >= MIN_DNS_PACKET_SIZE && has_tc_flag(packet) {
                    return Ok(());
                }
                self.return_code = PluginReturnCode::ParseError;
                return Err(ProxyError::parse(e.to_string()));
            }
        };
        self.return_code = match rcode(packet) {
            0 => PluginReturnCode::Pass,
            3 => PluginReturnCode::NXDomain,
            2 => PluginReturnCode::ServerError,
            _ => PluginReturnCode::ResponseError,
        };

        for plugin in &inner.response_plugins {
            if let Err(err) = plugin.eval(self, &mut msg) {
                self.action = PluginAction::Drop;
                return Err(ProxyError::module(plugin.name(), err.to_string()));
            }
            if self.action == PluginAction::Reject {
                let synth = refused_response_from_message(
                    &msg,
                    &inner.blocked_response,
                    self.reject_ttl,
                )?;
                if let Some(question) = synth.queries().first() {
                    info!(name = %question.name(), "blocking");
                }
                self.synth_response = Some(synth);
            }
            if self.action != PluginAction::Forward {
                break;
            }
        }

        if let Some(ttl) = override_ttl {
            clamp_answer_ttls(&mut msg, ttl);
        }
        pack_into(&msg, packet)
    }

    /// Run the logging stage
    ///
    /// Requires that the query stage parsed a question. Any module error
    /// stops the stage and surfaces.
    pub fn apply_logging_plugins(&mut self, globals: &PluginsGlobals) -> ProxyResult<()> {
        let inner = globals.inner.read();
        if inner.logging_plugins.is_empty() {
            return Ok(());
        }
        self.request_end = Some(Instant::now());
        let mut question = match self.question_msg.take() {
            Some(msg) if msg.queries().len() == 1 => msg,
            Some(msg) => {
                let count = msg.queries().len();
                self.question_msg = Some(msg);
                return Err(ProxyError::BadQuestionCount { count });
            }
            None => {
                return Err(ProxyError::parse("no parsed question to log"));
            }
        };

        let mut result = Ok(());
        for plugin in &inner.logging_plugins {
            if let Err(err) = plugin.eval(self, &mut question) {
                result = Err(ProxyError::module(plugin.name(), err.to_string()));
                break;
            }
        }
        self.question_msg = Some(question);
        result
    }
}

/// Process-wide module sequences and blocked-response policy
///
/// Shared by every in-flight request. Reads take the lock shared for a
/// whole pipeline stage; [`rebuild`](Self::rebuild) takes it exclusively
/// and swaps the entire module set at once.
pub struct PluginsGlobals {
    inner: RwLock<GlobalsInner>,
}

struct GlobalsInner {
    query_plugins: Vec<Box<dyn Plugin>>,
    response_plugins: Vec<Box<dyn Plugin>>,
    logging_plugins: Vec<Box<dyn Plugin>>,
    blocked_response: BlockedResponsePolicy,
}

impl PluginsGlobals {
    /// Build and initialize the module sequences from the configuration
    ///
    /// Inclusion and order are driven by the configuration: a module is
    /// armed when its rules file, flag or field is set. Any module whose
    /// initialization fails aborts the build.
    pub fn from_config(config: &Config) -> ProxyResult<Self> {
        Ok(Self {
            inner: RwLock::new(GlobalsInner::build(config)?),
        })
    }

    /// Globals with no modules at all; every stage is then a no-op
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(GlobalsInner {
                query_plugins: Vec::new(),
                response_plugins: Vec::new(),
                logging_plugins: Vec::new(),
                blocked_response: BlockedResponsePolicy::default(),
            }),
        }
    }

    /// Rebuild the module sequences from a new configuration
    ///
    /// The new set is fully constructed and initialized before the
    /// exclusive lock is taken, so in-flight requests never observe a
    /// half-replaced sequence.
    pub fn rebuild(&self, config: &Config) -> ProxyResult<()> {
        let fresh = GlobalsInner::build(config)?;
        let mut inner = self.inner.write();
        let GlobalsInner {
            query_plugins,
            response_plugins,
            logging_plugins,
            ..
        } = &mut *inner;
        for plugin in query_plugins
            .iter_mut()
            .chain(response_plugins.iter_mut())
            .chain(logging_plugins.iter_mut())
        {
            if let Err(err) = plugin.drop_resources() {
                debug!(plugin = plugin.name(), error = %err, "error releasing module");
            }
        }
        *inner = fresh;
        Ok(())
    }

    /// Re-read every module's rules file in place
    ///
    /// Cheaper than a full [`rebuild`](Self::rebuild) when only rule
    /// file contents changed: module identity, order and options stay
    /// as they are, and each module swaps its rule set atomically.
    pub fn reload_rules(&self) -> ProxyResult<()> {
        let inner = self.inner.read();
        for plugin in inner
            .query_plugins
            .iter()
            .chain(inner.response_plugins.iter())
            .chain(inner.logging_plugins.iter())
        {
            plugin
                .reload()
                .map_err(|err| ProxyError::module(plugin.name(), err.to_string()))?;
        }
        Ok(())
    }

    /// The configured blocked-response policy
    pub fn blocked_response(&self) -> BlockedResponsePolicy {
        self.inner.read().blocked_response
    }

    /// Names of the armed query-stage modules, in order
    pub fn query_plugin_names(&self) -> Vec<&'static str> {
        self.inner.read().query_plugins.iter().map(|p| p.name()).collect()
    }

    /// Names of the armed response-stage modules, in order
    pub fn response_plugin_names(&self) -> Vec<&'static str> {
        self.inner.read().response_plugins.iter().map(|p| p.name()).collect()
    }

    /// Names of the armed logging-stage modules, in order
    pub fn logging_plugin_names(&self) -> Vec<&'static str> {
        self.inner.read().logging_plugins.iter().map(|p| p.name()).collect()
    }
}

impl GlobalsInner {
    fn build(config: &Config) -> ProxyResult<GlobalsInner> {
        let mut query_plugins: Vec<Box<dyn Plugin>> = Vec::new();
        if !config.query_meta.is_empty() {
            query_plugins.push(Box::new(plugins::query_meta::QueryMetaPlugin::new()));
        }
        if config.allowed_names_file.is_some() {
            query_plugins.push(Box::new(plugins::allowed_name::AllowedNamePlugin::new()));
        }
        query_plugins.push(Box::new(plugins::firefox::FirefoxPlugin::new()));
        if config.block_names_file.is_some() {
            query_plugins.push(Box::new(plugins::block_name::BlockNamePlugin::new()));
        }
        if config.block_ipv6 {
            query_plugins.push(Box::new(plugins::block_ipv6::BlockIpv6Plugin::new()));
        }
        if config.cloak_file.is_some() {
            query_plugins.push(Box::new(plugins::cloak::CloakPlugin::new()));
        }
        query_plugins.push(Box::new(plugins::payload_size::PayloadSizePlugin::new()));
        let cache_store = if config.cache {
            Some(plugins::cache::new_store(config))
        } else {
            None
        };
        if let Some(store) = &cache_store {
            query_plugins.push(Box::new(plugins::cache::CachePlugin::new(store.clone())));
        }
        if config.forward_file.is_some() {
            query_plugins.push(Box::new(plugins::forward::ForwardPlugin::new()));
        }

        let mut response_plugins: Vec<Box<dyn Plugin>> = Vec::new();
        if config.nx_log_file.is_some() {
            response_plugins.push(Box::new(plugins::nx_log::NxLogPlugin::new()));
        }
        if config.block_ips_file.is_some() {
            response_plugins.push(Box::new(plugins::block_ip::BlockIpPlugin::new()));
        }
        if let Some(store) = &cache_store {
            response_plugins.push(Box::new(plugins::cache::CacheResponsePlugin::new(
                store.clone(),
            )));
        }

        let mut logging_plugins: Vec<Box<dyn Plugin>> = Vec::new();
        if config.query_log_file.is_some() {
            logging_plugins.push(Box::new(plugins::query_log::QueryLogPlugin::new()));
        }

        for plugin in query_plugins
            .iter_mut()
            .chain(response_plugins.iter_mut())
            .chain(logging_plugins.iter_mut())
        {
            plugin
                .init(config)
                .map_err(|err| ProxyError::module(plugin.name(), err.to_string()))?;
            debug!(plugin = plugin.name(), "module initialized");
        }

        let blocked_response = parse_blocked_query_response(&config.blocked_query_response);
        Ok(GlobalsInner {
            query_plugins,
            response_plugins,
            logging_plugins,
            blocked_response,
        })
    }
}

/// Parse the `blocked_query_response` option
///
/// Accepted forms are `refused`, `hinfo` and `a:<IPv4>[,aaaa:<IPv6>]`
/// (brackets around the IPv6 address are tolerated). Anything else falls
/// back to `hinfo` with a notice. When only an IPv4 address is given it
/// is mirrored into the IPv6 slot so both families answer.
pub fn parse_blocked_query_response(option: &str) -> BlockedResponsePolicy {
    let cleaned: String = option
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let mut policy = BlockedResponsePolicy::default();

    if cleaned.starts_with("a:") {
        let parts: Vec<&str> = cleaned.split(',').collect();
        match parts[0].trim_start_matches("a:").parse::<Ipv4Addr>() {
            Ok(ip) => policy.respond_with_ipv4 = Some(ip),
            Err(_) => {
                info!("error parsing IPv4 response given in blocked_query_response option, defaulting to `hinfo`");
                return policy;
            }
        }
        if parts.len() > 1 {
            if let Some(v6_text) = parts[1].strip_prefix("aaaa:") {
                let v6_text = v6_text.trim_start_matches('[').trim_end_matches(']');
                match v6_text.parse::<Ipv6Addr>() {
                    Ok(ip) => policy.respond_with_ipv6 = Some(ip),
                    Err(_) => {
                        info!("error parsing IPv6 response given in blocked_query_response option, defaulting to IPv4");
                    }
                }
            } else {
                info!(
                    value = parts[1],
                    "invalid IPv6 response given in blocked_query_response option, the option should take the form 'a:<IPv4>,aaaa:<IPv6>'"
                );
            }
        }
        if policy.respond_with_ipv6.is_none() {
            policy.respond_with_ipv6 = policy.respond_with_ipv4.map(|v4| v4.to_ipv6_mapped());
        }
        return policy;
    }

    match cleaned.as_str() {
        "refused" => policy.refused_code_in_responses = true,
        "hinfo" => {}
        other => {
            info!(
                value = other,
                "invalid blocked_query_response option, defaulting to `hinfo`"
            );
        }
    }
    policy
}

/// Synthesize the answer for a rejected query
///
/// With `refused_code_in_responses` the answer is an empty `REFUSED`.
/// With configured addresses it is a `NoError` answer carrying an `A`
/// and/or `AAAA` record at `reject_ttl`. Otherwise it is a `NoError`
/// answer with a single `HINFO` record advertising that the query was
/// filtered.
pub fn refused_response_from_message(
    msg: &Message,
    policy: &BlockedResponsePolicy,
    reject_ttl: u32,
) -> ProxyResult<Message> {
    let mut response = Message::new();
    response.set_id(msg.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(msg.recursion_desired());
    response.set_recursion_available(true);
    for query in msg.queries() {
        response.add_query(query.clone());
    }

    if policy.refused_code_in_responses {
        response.set_response_code(ResponseCode::Refused);
        return Ok(response);
    }
    response.set_response_code(ResponseCode::NoError);
    let Some(question) = msg.queries().first() else {
        return Ok(response);
    };
    let name = question.name().clone();

    if policy.respond_with_ipv4.is_some() || policy.respond_with_ipv6.is_some() {
        match question.query_type() {
            RecordType::A => {
                if let Some(ip) = policy.respond_with_ipv4 {
                    response.add_answer(Record::from_rdata(name, reject_ttl, RData::A(A(ip))));
                }
            }
            RecordType::AAAA => {
                if let Some(ip) = policy.respond_with_ipv6 {
                    response.add_answer(Record::from_rdata(name, reject_ttl, RData::AAAA(AAAA(ip))));
                }
            }
            _ => {}
        }
        return Ok(response);
    }

    let hinfo = HINFO::new(
        "This query has been locally blocked".to_string(),
        "by veildns".to_string(),
    );
    response.add_answer(Record::from_rdata(name, reject_ttl, RData::HINFO(hinfo)));
    Ok(response)
}

/// Re-pack a message into the packet buffer
///
/// The buffer's capacity is reused when the encoded message fits; on
/// error the buffer is left untouched.
fn pack_into(msg: &Message, packet: &mut Vec<u8>) -> ProxyResult<()> {
    let mut packed = Vec::with_capacity(packet.len());
    let mut encoder = BinEncoder::new(&mut packed);
    msg.emit(&mut encoder)
        .map_err(|e| ProxyError::serialize(e.to_string()))?;
    packet.clear();
    packet.extend_from_slice(&packed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn query_message(domain: &str, rtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(domain).unwrap(), rtype));
        msg
    }

    fn query_packet(domain: &str, rtype: RecordType) -> Vec<u8> {
        query_message(domain, rtype).to_vec().unwrap()
    }

    fn state(config: &Config) -> PluginsState {
        PluginsState::new(config, ClientProto::Udp, None, Instant::now())
    }

    /// Records its position in the stage and optionally changes the action
    struct ProbePlugin {
        name: &'static str,
        set_action: Option<PluginAction>,
        fail: bool,
        calls: Arc<AtomicUsize>,
        order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    impl Plugin for ProbePlugin {
        fn name(&self) -> &'static str {
            self.name
        }

        fn description(&self) -> &'static str {
            "test probe"
        }

        fn eval(&self, state: &mut PluginsState, _msg: &mut Message) -> ProxyResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().push(self.name);
            if self.fail {
                return Err(ProxyError::module(self.name, "boom"));
            }
            if let Some(action) = self.set_action {
                state.action = action;
            }
            Ok(())
        }
    }

    fn probe_globals(plugins_list: Vec<ProbePlugin>) -> PluginsGlobals {
        let globals = PluginsGlobals::empty();
        globals.inner.write().query_plugins = plugins_list
            .into_iter()
            .map(|p| Box::new(p) as Box<dyn Plugin>)
            .collect();
        globals
    }

    // ========================================================================
    // Stage Mechanics
    // ========================================================================

    #[test]
    fn test_empty_pipeline_is_a_fixed_point() {
        let config = Config::default();
        let globals = PluginsGlobals::empty();
        let mut state = state(&config);

        let original = query_packet("example.com.", RecordType::A);
        let mut packet = original.clone();
        state
            .apply_query_plugins(&globals, &mut packet, "srv")
            .unwrap();
        assert_eq!(packet, original);
        // Nothing ran, so no server name was recorded either
        assert!(state.server_name.is_empty());
    }

    #[test]
    fn test_query_stage_repack_is_a_fixed_point_when_all_pass() {
        let config = Config::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let globals = probe_globals(vec![ProbePlugin {
            name: "pass",
            set_action: None,
            fail: false,
            calls: calls.clone(),
            order: order.clone(),
        }]);
        let mut state = state(&config);

        let original = query_packet("example.com.", RecordType::A);
        let mut packet = original.clone();
        state
            .apply_query_plugins(&globals, &mut packet, "srv")
            .unwrap();
        assert_eq!(packet, original);
        assert_eq!(state.action, PluginAction::Forward);
        assert_eq!(state.server_name, "srv");
    }

    #[test]
    fn test_query_stage_rejects_unparseable_packet() {
        let config = Config::default();
        let globals = probe_globals(vec![]);
        // One registered logging-free query plugin forces a parse
        globals.inner.write().query_plugins.push(Box::new(ProbePlugin {
            name: "pass",
            set_action: None,
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
            order: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }));
        let mut state = state(&config);

        let mut packet = vec![0xde, 0xad];
        let err = state
            .apply_query_plugins(&globals, &mut packet, "srv")
            .unwrap_err();
        assert!(matches!(err, ProxyError::Parse { .. }));
        assert_eq!(state.return_code, PluginReturnCode::ParseError);
        assert_eq!(packet, vec![0xde, 0xad]);
    }

    #[test]
    fn test_query_stage_rejects_multiple_questions() {
        let config = Config::default();
        let globals = probe_globals(vec![ProbePlugin {
            name: "pass",
            set_action: None,
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
            order: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }]);
        let mut state = state(&config);

        let mut msg = query_message("example.com.", RecordType::A);
        msg.add_query(Query::query(
            Name::from_str("other.com.").unwrap(),
            RecordType::A,
        ));
        let mut packet = msg.to_vec().unwrap();

        let err = state
            .apply_query_plugins(&globals, &mut packet, "srv")
            .unwrap_err();
        assert!(matches!(err, ProxyError::BadQuestionCount { count: 2 }));
    }

    #[test]
    fn test_modules_run_in_order_and_stop_after_terminal_action() {
        let config = Config::default();
        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let calls_c = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let globals = probe_globals(vec![
            ProbePlugin {
                name: "first",
                set_action: None,
                fail: false,
                calls: calls_a.clone(),
                order: order.clone(),
            },
            ProbePlugin {
                name: "rejector",
                set_action: Some(PluginAction::Reject),
                fail: false,
                calls: calls_b.clone(),
                order: order.clone(),
            },
            ProbePlugin {
                name: "unreached",
                set_action: None,
                fail: false,
                calls: calls_c.clone(),
                order: order.clone(),
            },
        ]);
        let mut state = state(&config);

        let mut packet = query_packet("ads.example.", RecordType::A);
        state
            .apply_query_plugins(&globals, &mut packet, "srv")
            .unwrap();

        assert_eq!(*order.lock(), vec!["first", "rejector"]);
        assert_eq!(calls_c.load(Ordering::SeqCst), 0);
        assert_eq!(state.action, PluginAction::Reject);
        assert!(state.synth_response.is_some());
    }

    #[test]
    fn test_module_error_drops_the_request() {
        let config = Config::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let globals = probe_globals(vec![
            ProbePlugin {
                name: "bad",
                set_action: None,
                fail: true,
                calls: calls.clone(),
                order: order.clone(),
            },
            ProbePlugin {
                name: "after",
                set_action: None,
                fail: false,
                calls: Arc::new(AtomicUsize::new(0)),
                order: order.clone(),
            },
        ]);
        let mut state = state(&config);

        let mut packet = query_packet("example.com.", RecordType::A);
        let err = state
            .apply_query_plugins(&globals, &mut packet, "srv")
            .unwrap_err();
        assert!(matches!(err, ProxyError::Module { .. }));
        assert_eq!(state.action, PluginAction::Drop);
        assert_eq!(*order.lock(), vec!["bad"]);
    }

    // ========================================================================
    // Response Stage
    // ========================================================================

    fn response_globals() -> PluginsGlobals {
        let globals = PluginsGlobals::empty();
        globals.inner.write().response_plugins.push(Box::new(ProbePlugin {
            name: "pass",
            set_action: None,
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
            order: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }));
        globals
    }

    fn response_packet(rcode: ResponseCode) -> Vec<u8> {
        let mut msg = query_message("example.com.", RecordType::A);
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(rcode);
        msg.to_vec().unwrap()
    }

    #[test]
    fn test_response_stage_seeds_return_code() {
        let config = Config::default();
        let globals = response_globals();

        for (code, expected) in [
            (ResponseCode::NoError, PluginReturnCode::Pass),
            (ResponseCode::NXDomain, PluginReturnCode::NXDomain),
            (ResponseCode::ServFail, PluginReturnCode::ServerError),
            (ResponseCode::Refused, PluginReturnCode::ResponseError),
        ] {
            let mut state = state(&config);
            let mut packet = response_packet(code);
            state
                .apply_response_plugins(&globals, &mut packet, None)
                .unwrap();
            assert_eq!(state.return_code, expected, "for {code:?}");
        }
    }

    #[test]
    fn test_response_stage_tolerates_truncated_garbage() {
        let config = Config::default();
        let globals = response_globals();
        let mut state = state(&config);

        // Unparseable, but header-sized with the TC bit set
        let mut packet = vec![0u8; MIN_DNS_PACKET_SIZE];
        packet[2] = 0x82;
        packet[5] = 0xff; // bogus question count makes the parse fail
        let original = packet.clone();

        state
            .apply_response_plugins(&globals, &mut packet, None)
            .unwrap();
        assert_eq!(packet, original);
    }

    #[test]
    fn test_response_stage_rejects_short_garbage() {
        let config = Config::default();
        let globals = response_globals();
        let mut state = state(&config);

        let mut packet = vec![0xff, 0x00];
        assert!(state
            .apply_response_plugins(&globals, &mut packet, None)
            .is_err());
    }

    #[test]
    fn test_response_stage_clamps_ttls_on_override() {
        let config = Config::default();
        let globals = response_globals();
        let mut state = state(&config);

        let mut msg = query_message("example.com.", RecordType::A);
        msg.set_message_type(MessageType::Response);
        msg.add_answer(Record::from_rdata(
            Name::from_str("example.com.").unwrap(),
            86400,
            RData::A(A(Ipv4Addr::new(192, 0, 2, 1))),
        ));
        let mut packet = msg.to_vec().unwrap();

        state
            .apply_response_plugins(&globals, &mut packet, Some(60))
            .unwrap();
        let reparsed = Message::from_vec(&packet).unwrap();
        assert_eq!(reparsed.answers()[0].ttl(), 60);
    }

    // ========================================================================
    // Logging Stage
    // ========================================================================

    #[test]
    fn test_logging_stage_requires_parsed_question() {
        let config = Config::default();
        let globals = PluginsGlobals::empty();
        globals.inner.write().logging_plugins.push(Box::new(ProbePlugin {
            name: "log",
            set_action: None,
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
            order: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }));
        let mut state = state(&config);

        assert!(state.apply_logging_plugins(&globals).is_err());
        assert!(state.request_end.is_some());
    }

    #[test]
    fn test_logging_stage_noop_when_empty() {
        let config = Config::default();
        let globals = PluginsGlobals::empty();
        let mut state = state(&config);
        state.apply_logging_plugins(&globals).unwrap();
        assert!(state.request_end.is_none());
    }

    // ========================================================================
    // Blocked-Response Configurator
    // ========================================================================

    #[test]
    fn test_parse_refused() {
        let policy = parse_blocked_query_response("refused");
        assert!(policy.refused_code_in_responses);
        assert!(policy.respond_with_ipv4.is_none());
    }

    #[test]
    fn test_parse_hinfo_and_unknown_values() {
        for option in ["hinfo", "bogus", ""] {
            let policy = parse_blocked_query_response(option);
            assert!(!policy.refused_code_in_responses, "for {option:?}");
            assert!(policy.respond_with_ipv4.is_none());
            assert!(policy.respond_with_ipv6.is_none());
        }
    }

    #[test]
    fn test_parse_is_case_and_space_insensitive() {
        let policy = parse_blocked_query_response(" REFUSED ");
        assert!(policy.refused_code_in_responses);
    }

    #[test]
    fn test_parse_ipv4_only_mirrors_into_ipv6() {
        let policy = parse_blocked_query_response("a:192.0.2.1");
        assert_eq!(policy.respond_with_ipv4, Some(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(
            policy.respond_with_ipv6,
            Some(Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped())
        );
    }

    #[test]
    fn test_parse_ipv4_and_ipv6() {
        let policy = parse_blocked_query_response("a:192.0.2.1,aaaa:2001:db8::1");
        assert_eq!(policy.respond_with_ipv4, Some(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(policy.respond_with_ipv6, Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_parse_tolerates_bracketed_ipv6() {
        let policy = parse_blocked_query_response("a:192.0.2.1,aaaa:[2001:db8::1]");
        assert_eq!(policy.respond_with_ipv6, Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_parse_bad_ipv4_falls_back_to_hinfo() {
        let policy = parse_blocked_query_response("a:not-an-ip");
        assert!(!policy.refused_code_in_responses);
        assert!(policy.respond_with_ipv4.is_none());
        assert!(policy.respond_with_ipv6.is_none());
    }

    #[test]
    fn test_parse_bad_ipv6_falls_back_to_ipv4() {
        let policy = parse_blocked_query_response("a:192.0.2.1,aaaa:not-an-ip");
        assert_eq!(policy.respond_with_ipv4, Some(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(
            policy.respond_with_ipv6,
            Some(Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped())
        );
    }

    // ========================================================================
    // Refused-Response Synthesis
    // ========================================================================

    #[test]
    fn test_synthesis_refused_code() {
        let msg = query_message("ads.example.", RecordType::A);
        let policy = BlockedResponsePolicy {
            refused_code_in_responses: true,
            ..Default::default()
        };
        let synth = refused_response_from_message(&msg, &policy, 600).unwrap();
        assert_eq!(synth.response_code(), ResponseCode::Refused);
        assert!(synth.answers().is_empty());
        assert_eq!(synth.id(), msg.id());
        assert_eq!(synth.queries(), msg.queries());
    }

    #[test]
    fn test_synthesis_with_addresses() {
        let policy = BlockedResponsePolicy {
            refused_code_in_responses: false,
            respond_with_ipv4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            respond_with_ipv6: Some("2001:db8::2".parse().unwrap()),
        };

        let msg = query_message("ads.example.", RecordType::A);
        let synth = refused_response_from_message(&msg, &policy, 600).unwrap();
        assert_eq!(synth.response_code(), ResponseCode::NoError);
        assert_eq!(synth.answers().len(), 1);
        assert_eq!(synth.answers()[0].ttl(), 600);
        assert!(matches!(
            synth.answers()[0].data(),
            Some(RData::A(A(ip))) if *ip == Ipv4Addr::new(10, 0, 0, 1)
        ));

        let msg = query_message("ads.example.", RecordType::AAAA);
        let synth = refused_response_from_message(&msg, &policy, 600).unwrap();
        assert!(matches!(
            synth.answers()[0].data(),
            Some(RData::AAAA(_))
        ));
    }

    #[test]
    fn test_synthesis_hinfo_default() {
        let msg = query_message("ads.example.", RecordType::A);
        let policy = BlockedResponsePolicy::default();
        let synth = refused_response_from_message(&msg, &policy, 600).unwrap();
        assert_eq!(synth.response_code(), ResponseCode::NoError);
        assert_eq!(synth.answers().len(), 1);
        assert!(matches!(synth.answers()[0].data(), Some(RData::HINFO(_))));
    }

    #[test]
    fn test_synthesis_non_address_query_gets_empty_noerror() {
        let policy = BlockedResponsePolicy {
            refused_code_in_responses: false,
            respond_with_ipv4: Some(Ipv4Addr::new(10, 0, 0, 1)),
            respond_with_ipv6: None,
        };
        let msg = query_message("ads.example.", RecordType::TXT);
        let synth = refused_response_from_message(&msg, &policy, 600).unwrap();
        assert_eq!(synth.response_code(), ResponseCode::NoError);
        assert!(synth.answers().is_empty());
    }
}
