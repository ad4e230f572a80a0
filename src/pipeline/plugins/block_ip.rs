//! Response address blocklist module
//!
//! Rejects responses whose answer records resolve to blocklisted
//! addresses, catching trackers that rotate names but keep their
//! infrastructure. Rules files take exact addresses and CIDR prefixes:
//!
//! ```text
//! 203.0.113.7
//! 198.51.100.0/24
//! 2001:db8::/32
//! ```

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use ipnet::IpNet;
use tracing::debug;

use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};
use crate::pipeline::{PluginAction, PluginReturnCode, PluginsState};

use super::matcher::read_rules_file;
use super::{is_allowed, Plugin};

#[derive(Debug, Default)]
struct IpRules {
    exact: HashSet<IpAddr>,
    nets: Vec<IpNet>,
}

impl IpRules {
    fn matches(&self, ip: IpAddr) -> bool {
        self.exact.contains(&ip) || self.nets.iter().any(|net| net.contains(&ip))
    }
}

/// Rejects responses carrying blocklisted addresses
pub struct BlockIpPlugin {
    rules: ArcSwap<IpRules>,
    path: Option<PathBuf>,
}

impl BlockIpPlugin {
    /// A module with no rules loaded yet
    pub fn new() -> Self {
        Self {
            rules: ArcSwap::from_pointee(IpRules::default()),
            path: None,
        }
    }

    fn load(path: &PathBuf) -> ProxyResult<IpRules> {
        let mut rules = IpRules::default();
        for (entry, _) in read_rules_file(path)? {
            if let Ok(ip) = entry.parse::<IpAddr>() {
                rules.exact.insert(ip);
            } else if let Ok(net) = entry.parse::<IpNet>() {
                rules.nets.push(net);
            } else {
                return Err(ProxyError::config(format!(
                    "invalid address or prefix [{entry}]"
                )));
            }
        }
        Ok(rules)
    }
}

impl Default for BlockIpPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for BlockIpPlugin {
    fn name(&self) -> &'static str {
        "block_ip"
    }

    fn description(&self) -> &'static str {
        "Rejects responses resolving to blocklisted addresses"
    }

    fn init(&mut self, config: &Config) -> ProxyResult<()> {
        let path = config
            .block_ips_file
            .clone()
            .ok_or_else(|| ProxyError::config_field("no rules file", "block_ips_file"))?;
        let rules = Self::load(&path)?;
        debug!(
            rules = rules.exact.len() + rules.nets.len(),
            file = %path.display(),
            "address blocklist loaded"
        );
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
        let rules = self.rules.load();
        for answer in msg.answers() {
            let ip = match answer.data() {
                Some(RData::A(a)) => IpAddr::V4(a.0),
                Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
                _ => continue,
            };
            if rules.matches(ip) {
                debug!(address = %ip, "response address blocked");
                state.action = PluginAction::Reject;
                state.return_code = PluginReturnCode::Reject;
                break;
            }
        }
        Ok(())
    }
}
