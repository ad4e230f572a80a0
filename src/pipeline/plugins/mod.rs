//! Policy modules
//!
//! Every policy concern (metadata injection, allowlisting, blocking,
//! cloaking, payload sizing, caching, forwarding, response filtering and
//! logging) is a module behind the [`Plugin`] capability. The pipeline
//! holds three ordered sequences of them (query, response, logging) and
//! knows nothing about what the individual modules do; modules
//! communicate with their surroundings only through [`PluginsState`].
//!
//! Modules that load a rules file keep it behind an `ArcSwap` so
//! [`reload`](Plugin::reload) can swap the rule set without blocking
//! requests that are mid-evaluation.

pub mod allowed_name;
pub mod block_ip;
pub mod block_ipv6;
pub mod block_name;
pub mod cache;
pub mod cloak;
pub mod firefox;
pub mod forward;
mod logfile;
pub mod matcher;
pub mod nx_log;
pub mod payload_size;
pub mod query_log;
pub mod query_meta;

use hickory_proto::op::Message;

use crate::config::Config;
use crate::error::ProxyResult;
use crate::pipeline::PluginsState;

/// Session-scratch key under which the allowlist marks a request
pub const SESSION_ALLOWED: &str = "allowed_name";

/// Session-scratch key under which the cache stashes the lookup key
pub const SESSION_CACHE_KEY: &str = "cache";

/// Capability every policy module exposes
///
/// `init` runs once per (re)build of the module sequences, in configured
/// order; `eval` runs per request under the globals reader lock and must
/// not block. A module that wants the request to stop forwarding sets
/// the action on the state; a returned error drops the request.
pub trait Plugin: Send + Sync {
    /// Short stable identifier, also used as the session-scratch key
    fn name(&self) -> &'static str;

    /// One-line human description
    fn description(&self) -> &'static str;

    /// Load rules files and allocate resources
    fn init(&mut self, _config: &Config) -> ProxyResult<()> {
        Ok(())
    }

    /// Release resources before the module set is replaced
    fn drop_resources(&mut self) -> ProxyResult<()> {
        Ok(())
    }

    /// Re-read the rules file, swapping the rule set atomically
    fn reload(&self) -> ProxyResult<()> {
        Ok(())
    }

    /// Evaluate one request
    fn eval(&self, state: &mut PluginsState, msg: &mut Message) -> ProxyResult<()>;
}

/// Whether the allowlist exempted this request from blocking
pub(crate) fn is_allowed(state: &PluginsState) -> bool {
    state.session_data.contains_key(SESSION_ALLOWED)
}

/// Normalized name of the (single) question, if there is one
pub(crate) fn question_name(msg: &Message) -> Option<String> {
    msg.queries()
        .first()
        .map(|q| crate::dnsutil::normalize_qname(&q.name().to_string()))
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::io::Write;
    use std::str::FromStr;
    use std::time::Instant;

    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::{Name, RecordType};
    use tempfile::NamedTempFile;

    use crate::config::Config;
    use crate::pipeline::PluginsState;
    use crate::transport::ClientProto;

    use super::Plugin;

    /// Rules file with one pattern (or pattern + value) per line
    pub fn write_rules(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("temp rules file");
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    /// Fresh request state for a config
    pub fn state_for(config: &Config) -> PluginsState {
        PluginsState::new(config, ClientProto::Udp, None, Instant::now())
    }

    /// A single-question query message
    pub fn query_message(domain: &str, rtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x1234);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(domain).unwrap(), rtype));
        msg
    }

    /// Evaluate one `A` query against a module and return the message
    pub fn eval_query(plugin: &dyn Plugin, state: &mut PluginsState, domain: &str) -> Message {
        eval_query_type(plugin, state, domain, RecordType::A)
    }

    /// Evaluate one query of the given type against a module
    pub fn eval_query_type(
        plugin: &dyn Plugin,
        state: &mut PluginsState,
        domain: &str,
        rtype: RecordType,
    ) -> Message {
        let mut msg = query_message(domain, rtype);
        plugin.eval(state, &mut msg).expect("eval");
        msg
    }
}
