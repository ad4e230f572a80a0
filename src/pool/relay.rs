//! Relay route resolution
//!
//! Anonymized DNSCrypt sends already-encrypted queries through a relay
//! so the resolver never sees the client address. Routes map a server
//! name (or the `"*"` wildcard) to the relays its traffic may use; one
//! relay is drawn at random per probe so load spreads across the listed
//! hops.

use std::net::SocketAddr;

use rand::Rng;

use crate::config::RelayRef;
use crate::error::{ProxyError, ProxyResult};
use crate::stamp::{ServerStamp, StampProtoType};

use super::{RelayAddrs, ServerPool};

impl ServerPool {
    /// Resolve the relay a server's traffic should go through
    ///
    /// Returns `Ok(None)` when no route covers the server. A relay
    /// reference is interpreted as a parsed stamp, else a bare
    /// `host:port` (which synthesizes a relay stamp), else the name of a
    /// registered relay or server.
    pub(crate) fn relay_route(&self, server_name: &str) -> ProxyResult<Option<RelayAddrs>> {
        let refs = match self
            .routes
            .get(server_name)
            .or_else(|| self.routes.get("*"))
        {
            Some(refs) => refs,
            None => return Ok(None),
        };
        if refs.is_empty() {
            return Err(ProxyError::EmptyRelayList {
                server: server_name.to_string(),
            });
        }
        let chosen = &refs[rand::thread_rng().gen_range(0..refs.len())];

        let (stamp, label) = match chosen {
            RelayRef::Stamp(stamp) => (stamp.clone(), stamp.server_addr.clone()),
            RelayRef::Via(reference) => {
                if reference.parse::<SocketAddr>().is_ok() {
                    (ServerStamp::relay(reference.clone()), reference.clone())
                } else {
                    let inner = self.inner.read();
                    let found = inner
                        .relays
                        .iter()
                        .chain(inner.registered.iter())
                        .find(|r| r.name == *reference)
                        .map(|r| r.stamp.clone());
                    match found {
                        Some(stamp) => (stamp, reference.clone()),
                        None => {
                            return Err(ProxyError::UndefinedRelay {
                                relay: reference.clone(),
                                server: server_name.to_string(),
                            })
                        }
                    }
                }
            }
        };

        match stamp.proto {
            StampProtoType::DnsCrypt | StampProtoType::DnsCryptRelay => {
                let addr: SocketAddr = stamp.server_addr.parse().map_err(|_| {
                    ProxyError::config(format!(
                        "invalid relay address [{}] for [{server_name}]",
                        stamp.server_addr
                    ))
                })?;
                Ok(Some(RelayAddrs {
                    udp_addr: addr,
                    tcp_addr: addr,
                }))
            }
            _ => Err(ProxyError::InvalidRelayProto {
                relay: label,
                server: server_name.to_string(),
            }),
        }
    }
}
