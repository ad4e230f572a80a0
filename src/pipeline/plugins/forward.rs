//! Per-domain forwarding module
//!
//! Routes queries for configured domains to specific plain-DNS
//! resolvers instead of the encrypted upstream pool. Typical use is a
//! corporate or home domain that only an internal resolver can answer:
//!
//! ```text
//! lan          192.168.1.1
//! corp.example 10.0.0.53:53,10.0.0.54
//! ```
//!
//! The exchange is a single UDP round-trip bounded by the request
//! timeout, performed inline: the query stage is synchronous by design
//! and forwarding replaces the upstream suspension point for these
//! requests.

use std::net::{SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use hickory_proto::op::Message;
use rand::Rng;
use tracing::debug;

use crate::config::Config;
use crate::dnsutil::MAX_DNS_PACKET_SIZE;
use crate::error::{ProxyError, ProxyResult};
use crate::pipeline::{PluginAction, PluginReturnCode, PluginsState};

use super::matcher::{read_rules_file, NamePatterns};
use super::{question_name, Plugin};

const PLAIN_DNS_PORT: u16 = 53;

/// Forwards matching queries to configured plain-DNS resolvers
pub struct ForwardPlugin {
    rules: ArcSwap<NamePatterns<Vec<SocketAddr>>>,
    path: Option<PathBuf>,
    timeout: Duration,
}

impl ForwardPlugin {
    /// A module with no rules loaded yet
    pub fn new() -> Self {
        Self {
            rules: ArcSwap::from_pointee(NamePatterns::new()),
            path: None,
            timeout: Duration::from_secs(5),
        }
    }

    fn load(path: &PathBuf) -> ProxyResult<NamePatterns<Vec<SocketAddr>>> {
        let mut rules = NamePatterns::new();
        for (pattern, rest) in read_rules_file(path)? {
            if rest.is_empty() {
                return Err(ProxyError::config(format!(
                    "forwarding rule for [{pattern}] has no resolver"
                )));
            }
            let mut resolvers = Vec::new();
            for part in rest.split(',') {
                let part = part.trim();
                let addr = part
                    .parse::<SocketAddr>()
                    .or_else(|_| {
                        part.parse::<std::net::IpAddr>()
                            .map(|ip| SocketAddr::new(ip, PLAIN_DNS_PORT))
                    })
                    .map_err(|_| {
                        ProxyError::config(format!(
                            "invalid resolver [{part}] for [{pattern}]"
                        ))
                    })?;
                resolvers.push(addr);
            }
            rules.add(&pattern, resolvers)?;
        }
        Ok(rules)
    }

    fn exchange(&self, resolver: SocketAddr, query: &[u8]) -> ProxyResult<Vec<u8>> {
        let socket = UdpSocket::bind(if resolver.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        })
        .map_err(|e| ProxyError::network_io("binding forward socket", e))?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| ProxyError::network_io("setting forward timeout", e))?;
        socket
            .send_to(query, resolver)
            .map_err(|e| ProxyError::network_io("sending forwarded query", e))?;
        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];
        let (len, _) = socket.recv_from(&mut buf).map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) {
                ProxyError::timeout(format!("forwarded query to {resolver}"), self.timeout)
            } else {
                ProxyError::network_io("receiving forwarded response", e)
            }
        })?;
        buf.truncate(len);
        Ok(buf)
    }
}

impl Default for ForwardPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for ForwardPlugin {
    fn name(&self) -> &'static str {
        "forward"
    }

    fn description(&self) -> &'static str {
        "Routes configured domains to dedicated plain-DNS resolvers"
    }

    fn init(&mut self, config: &Config) -> ProxyResult<()> {
        let path = config
            .forward_file
            .clone()
            .ok_or_else(|| ProxyError::config_field("no rules file", "forward_file"))?;
        let rules = Self::load(&path)?;
        debug!(rules = rules.len(), file = %path.display(), "forwarding rules loaded");
        self.rules.store(Arc::new(rules));
        self.path = Some(path);
        self.timeout = config.timeout();
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
        let Some(qname) = question_name(msg) else {
            return Ok(());
        };
        let rules = self.rules.load();
        let Some(resolvers) = rules.lookup(&qname) else {
            return Ok(());
        };
        let resolver = resolvers[rand::thread_rng().gen_range(0..resolvers.len())];

        let query = msg
            .to_vec()
            .map_err(|e| ProxyError::serialize(e.to_string()))?;
        let raw = self.exchange(resolver, &query)?;
        let response =
            Message::from_vec(&raw).map_err(|e| ProxyError::parse(e.to_string()))?;

        debug!(name = %qname, resolver = %resolver, "query forwarded");
        state.synth_response = Some(response);
        state.action = PluginAction::Synth;
        state.return_code = PluginReturnCode::Forward;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{eval_query, query_message, state_for, write_rules};
    use super::*;
    use hickory_proto::op::MessageType;
    use hickory_proto::rr::RecordType;
    use std::net::UdpSocket;

    fn plugin_with(rules: &[&str]) -> (ForwardPlugin, Config, tempfile::NamedTempFile) {
        let file = write_rules(rules);
        let config = Config {
            forward_file: Some(file.path().to_path_buf()),
            timeout_secs: 2,
            ..Config::default()
        };
        let mut plugin = ForwardPlugin::new();
        plugin.init(&config).unwrap();
        (plugin, config, file)
    }

    /// One-shot resolver double answering on a local socket
    fn spawn_resolver() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            let (len, peer) = socket.recv_from(&mut buf).unwrap();
            let mut response = Message::from_vec(&buf[..len]).unwrap();
            response.set_message_type(MessageType::Response);
            let bytes = response.to_vec().unwrap();
            socket.send_to(&bytes, peer).unwrap();
        });
        addr
    }

    #[test]
    fn test_forwards_matching_domain() {
        let resolver = spawn_resolver();
        let (plugin, config, _file) =
            plugin_with(&[&format!("corp.example {resolver}")]);

        let mut state = state_for(&config);
        let mut msg = query_message("host.corp.example.", RecordType::A);
        plugin.eval(&mut state, &mut msg).unwrap();

        assert_eq!(state.action, PluginAction::Synth);
        assert_eq!(state.return_code, PluginReturnCode::Forward);
        let synth = state.synth_response.unwrap();
        assert_eq!(synth.id(), msg.id());
    }

    #[test]
    fn test_unmatched_domain_passes() {
        let (plugin, config, _file) = plugin_with(&["corp.example 127.0.0.1:1"]);
        let mut state = state_for(&config);
        eval_query(&plugin, &mut state, "example.com.");
        assert_eq!(state.action, PluginAction::Forward);
    }

    #[test]
    fn test_default_port_is_53() {
        let (plugin, _config, _file) = plugin_with(&["lan 192.168.1.1"]);
        let rules = plugin.rules.load();
        assert_eq!(rules.lookup("lan").unwrap()[0].port(), 53);
    }

    #[test]
    fn test_rule_without_resolver_fails_init() {
        let file = write_rules(&["corp.example"]);
        let config = Config {
            forward_file: Some(file.path().to_path_buf()),
            ..Config::default()
        };
        assert!(ForwardPlugin::new().init(&config).is_err());
    }

    #[test]
    fn test_unreachable_resolver_is_a_timeout() {
        // Reserved port with nothing listening
        let (plugin, config, _file) = plugin_with(&["corp.example 127.0.0.1:1"]);
        let mut state = state_for(&config);
        let mut msg = query_message("corp.example.", RecordType::A);
        let err = plugin.eval(&mut state, &mut msg).unwrap_err();
        assert!(err.is_recoverable());
    }
}
