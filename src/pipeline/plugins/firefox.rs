//! Browser canary module
//!
//! Firefox probes `use-application-dns.net` before enabling its own
//! DNS-over-HTTPS and falls back to the system resolver when the probe
//! answers `NXDOMAIN`. Since this forwarder already encrypts everything,
//! the canary is answered negatively so the browser keeps using it.

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::RecordType;
use tracing::debug;

use crate::error::ProxyResult;
use crate::pipeline::{PluginAction, PluginReturnCode, PluginsState};

use super::{question_name, Plugin};

const CANARY_DOMAIN: &str = "use-application-dns.net";

/// Answers the Firefox DoH canary negatively
pub struct FirefoxPlugin;

impl FirefoxPlugin {
    /// Create the module
    pub fn new() -> Self {
        Self
    }
}

impl Default for FirefoxPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for FirefoxPlugin {
    fn name(&self) -> &'static str {
        "firefox"
    }

    fn description(&self) -> &'static str {
        "Keeps Firefox on the local resolver by answering its DoH canary"
    }

    fn eval(&self, state: &mut PluginsState, msg: &mut Message) -> ProxyResult<()> {
        let Some(question) = msg.queries().first() else {
            return Ok(());
        };
        if !matches!(
            question.query_type(),
            RecordType::A | RecordType::AAAA
        ) {
            return Ok(());
        }
        let Some(qname) = question_name(msg) else {
            return Ok(());
        };
        if qname != CANARY_DOMAIN && !qname.ends_with(&format!(".{CANARY_DOMAIN}")) {
            return Ok(());
        }

        debug!(name = %qname, "browser canary intercepted");
        let mut synth = Message::new();
        synth.set_id(msg.id());
        synth.set_message_type(MessageType::Response);
        synth.set_op_code(OpCode::Query);
        synth.set_recursion_desired(msg.recursion_desired());
        synth.set_recursion_available(true);
        synth.set_response_code(ResponseCode::NXDomain);
        for query in msg.queries() {
            synth.add_query(query.clone());
        }
        state.synth_response = Some(synth);
        state.action = PluginAction::Synth;
        state.return_code = PluginReturnCode::Cloak;
        Ok(())
    }
}
