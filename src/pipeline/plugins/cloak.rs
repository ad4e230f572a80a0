//! Cloaking module
//!
//! Answers queries for configured names with forged addresses instead
//! of forwarding them: a local split-horizon without running an
//! authoritative server. Rules files map a name pattern to one or more
//! addresses:
//!
//! ```text
//! example.invalid      10.0.0.1
//! *.lan.example.com    192.168.1.10,192.168.1.11
//! ipv6.example.com     2001:db8::7
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use tracing::debug;

use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};
use crate::pipeline::{PluginAction, PluginReturnCode, PluginsState};

use super::matcher::{read_rules_file, NamePatterns};
use super::{is_allowed, question_name, Plugin};

/// Answers configured names with forged addresses
pub struct CloakPlugin {
    rules: ArcSwap<NamePatterns<Vec<IpAddr>>>,
    path: Option<PathBuf>,
}

impl CloakPlugin {
    /// A module with no rules loaded yet
    pub fn new() -> Self {
        Self {
            rules: ArcSwap::from_pointee(NamePatterns::new()),
            path: None,
        }
    }

    fn load(path: &PathBuf) -> ProxyResult<NamePatterns<Vec<IpAddr>>> {
        let mut rules = NamePatterns::new();
        for (pattern, rest) in read_rules_file(path)? {
            if rest.is_empty() {
                return Err(ProxyError::config(format!(
                    "cloaking rule for [{pattern}] has no address"
                )));
            }
            let mut addrs = Vec::new();
            for part in rest.split(',') {
                let addr: IpAddr = part.trim().parse().map_err(|_| {
                    ProxyError::config(format!(
                        "invalid cloaking address [{part}] for [{pattern}]"
                    ))
                })?;
                addrs.push(addr);
            }
            rules.add(&pattern, addrs)?;
        }
        Ok(rules)
    }
}

impl Default for CloakPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for CloakPlugin {
    fn name(&self) -> &'static str {
        "cloak"
    }

    fn description(&self) -> &'static str {
        "Returns forged addresses for configured names"
    }

    fn init(&mut self, config: &Config) -> ProxyResult<()> {
        let path = config
            .cloak_file
            .clone()
            .ok_or_else(|| ProxyError::config_field("no rules file", "cloak_file"))?;
        let rules = Self::load(&path)?;
        debug!(rules = rules.len(), file = %path.display(), "cloaking rules loaded");
        self.rules.store(Arc::new(rules));
        self.path = Some(path);
        Ok(())
    }

    fn reload(&self) -> ProxyResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        self.rules.store(Arc::new(Self::load(path)?));
        Ok(())
    }

    fn eval(&self, state: &mut PluginsState, msg: &mut Message) -> ProxyResult<()> {
        if is_allowed(state) {
            return Ok(());
        }
        let Some(question) = msg.queries().first() else {
            return Ok(());
        };
        let qtype = question.query_type();
        if !matches!(qtype, RecordType::A | RecordType::AAAA) {
            return Ok(());
        }
        let Some(qname) = question_name(msg) else {
            return Ok(());
        };
        let rules = self.rules.load();
        let Some(addrs) = rules.lookup(&qname) else {
            return Ok(());
        };

        let mut synth = Message::new();
        synth.set_id(msg.id());
        synth.set_message_type(MessageType::Response);
        synth.set_op_code(OpCode::Query);
        synth.set_recursion_desired(msg.recursion_desired());
        synth.set_recursion_available(true);
        synth.set_response_code(ResponseCode::NoError);
        for query in msg.queries() {
            synth.add_query(query.clone());
        }
        let name = question.name().clone();
        for addr in addrs {
            match (qtype, addr) {
                (RecordType::A, IpAddr::V4(ip)) => {
                    synth.add_answer(Record::from_rdata(
                        name.clone(),
                        state.reject_ttl,
                        RData::A(A(*ip)),
                    ));
                }
                (RecordType::AAAA, IpAddr::V6(ip)) => {
                    synth.add_answer(Record::from_rdata(
                        name.clone(),
                        state.reject_ttl,
                        RData::AAAA(AAAA(*ip)),
                    ));
                }
                _ => {}
            }
        }

        debug!(name = %qname, answers = synth.answers().len(), "query cloaked");
        state.synth_response = Some(synth);
        state.action = PluginAction::Synth;
        state.return_code = PluginReturnCode::Cloak;
        Ok(())
    }
}
