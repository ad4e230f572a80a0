//! Query metadata module
//!
//! Attaches the configured `key=value` strings to outgoing queries as a
//! TXT record in the additional section. Some upstream resolvers use
//! this for per-client policy, e.g. a subscription token.

use hickory_proto::op::Message;
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{Name, RData, Record};

use crate::config::Config;
use crate::error::ProxyResult;
use crate::pipeline::PluginsState;

use super::Plugin;

const META_TTL: u32 = 86400;

/// Attaches configured metadata strings to outgoing queries
pub struct QueryMetaPlugin {
    meta: Vec<String>,
}

impl QueryMetaPlugin {
    /// A module with no metadata configured yet
    pub fn new() -> Self {
        Self { meta: Vec::new() }
    }
}

impl Default for QueryMetaPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for QueryMetaPlugin {
    fn name(&self) -> &'static str {
        "query_meta"
    }

    fn description(&self) -> &'static str {
        "Adds configured metadata to outgoing queries as a TXT record"
    }

    fn init(&mut self, config: &Config) -> ProxyResult<()> {
        self.meta = config.query_meta.clone();
        Ok(())
    }

    fn eval(&self, _state: &mut PluginsState, msg: &mut Message) -> ProxyResult<()> {
        if self.meta.is_empty() {
            return Ok(());
        }
        let record = Record::from_rdata(
            Name::root(),
            META_TTL,
            RData::TXT(TXT::new(self.meta.clone())),
        );
        msg.add_additional(record);
        Ok(())
    }
}
