//! IPv6 blocking module
//!
//! Rejects every `AAAA` query. Useful on networks where IPv6 routes are
//! advertised but broken, which otherwise costs clients a timeout per
//! lookup.

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use tracing::debug;

use crate::error::ProxyResult;
use crate::pipeline::{PluginAction, PluginReturnCode, PluginsState};

use super::{question_name, Plugin};

/// Rejects `AAAA` queries
pub struct BlockIpv6Plugin;

impl BlockIpv6Plugin {
    /// Create the module
    pub fn new() -> Self {
        Self
    }
}

impl Default for BlockIpv6Plugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for BlockIpv6Plugin {
    fn name(&self) -> &'static str {
        "block_ipv6"
    }

    fn description(&self) -> &'static str {
        "Immediately rejects IPv6 address queries"
    }

    fn eval(&self, state: &mut PluginsState, msg: &mut Message) -> ProxyResult<()> {
        let Some(question) = msg.queries().first() else {
            return Ok(());
        };
        if question.query_type() == RecordType::AAAA {
            debug!(name = ?question_name(msg), "IPv6 query rejected");
            state.action = PluginAction::Reject;
            state.return_code = PluginReturnCode::Reject;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{eval_query_type, state_for};
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_rejects_aaaa() {
        let config = Config::default();
        let plugin = BlockIpv6Plugin::new();
        let mut state = state_for(&config);
        eval_query_type(&plugin, &mut state, "example.com.", RecordType::AAAA);
        assert_eq!(state.action, PluginAction::Reject);
    }

    #[test]
    fn test_passes_a_and_txt() {
        let config = Config::default();
        let plugin = BlockIpv6Plugin::new();
        for rtype in [RecordType::A, RecordType::TXT] {
            let mut state = state_for(&config);
            eval_query_type(&plugin, &mut state, "example.com.", rtype);
            assert_eq!(state.action, PluginAction::Forward);
        }
    }
}
