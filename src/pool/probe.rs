//! Server validation probes
//!
//! Before a registered server enters the live pool it is probed through
//! the transport layer: DNSCrypt servers by fetching and validating
//! their current certificate, DoH servers by sending the fixed probe
//! query and checking the TLS session, the pinned certificates and the
//! response body. The probe round-trip time becomes the server's initial
//! ranking.

use std::net::{IpAddr, SocketAddr};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::dnsutil::{
    decode_hex_key, MAX_DNS_PACKET_SIZE, MAX_HTTP_BODY_LENGTH, MIN_DNS_PACKET_SIZE,
};
use crate::error::{ProxyError, ProxyResult};
use crate::stamp::{ServerStamp, StampProtoType};
use crate::transport::{Transport, DOH_PROBE_QUERY};

use super::{ServerInfo, ServerLink, ServerPool};

impl ServerPool {
    /// Probe a stamp and build the live entry for it
    pub(super) async fn fetch_server_info(
        &self,
        transport: &dyn Transport,
        name: &str,
        stamp: &ServerStamp,
        is_new: bool,
    ) -> ProxyResult<ServerInfo> {
        match stamp.proto {
            StampProtoType::DnsCrypt => {
                self.fetch_dnscrypt_server_info(transport, name, stamp, is_new)
                    .await
            }
            StampProtoType::Doh => {
                self.fetch_doh_server_info(transport, name, stamp, is_new)
                    .await
            }
            other => Err(ProxyError::UnsupportedProtocol {
                proto: other.to_string(),
            }),
        }
    }

    async fn fetch_dnscrypt_server_info(
        &self,
        transport: &dyn Transport,
        name: &str,
        stamp: &ServerStamp,
        is_new: bool,
    ) -> ProxyResult<ServerInfo> {
        let server_pk: [u8; 32] = match <[u8; 32]>::try_from(stamp.server_pk.as_slice()) {
            Ok(pk) => pk,
            Err(_) => {
                let text = String::from_utf8_lossy(&stamp.server_pk);
                let pk = decode_hex_key(&text).map_err(|_| {
                    ProxyError::fatal(format!("unsupported public key for [{name}]: [{text}]"))
                })?;
                warn!(
                    server = name,
                    "public key shouldn't be hex-encoded any more"
                );
                pk
            }
        };
        let relay = self.relay_route(name)?;
        let (cert, rtt_ms) = transport
            .fetch_dnscrypt_cert(
                self.main_proto,
                &server_pk,
                &stamp.server_addr,
                &stamp.provider_name,
                is_new,
                relay.as_ref(),
            )
            .await?;
        let addr: SocketAddr = stamp.server_addr.parse().map_err(|_| {
            ProxyError::config(format!(
                "invalid server address [{}] for [{name}]",
                stamp.server_addr
            ))
        })?;
        Ok(ServerInfo::new(
            name,
            self.timeout,
            ServerLink::DnsCrypt {
                magic_query: cert.magic_query,
                server_pk: cert.server_pk,
                shared_key: cert.shared_key,
                crypto_construction: cert.crypto_construction,
                udp_addr: addr,
                tcp_addr: addr,
                relay,
            },
            rtt_ms,
        ))
    }

    async fn fetch_doh_server_info(
        &self,
        transport: &dyn Transport,
        name: &str,
        stamp: &ServerStamp,
        is_new: bool,
    ) -> ProxyResult<ServerInfo> {
        // A stamp embedding an IP literal lets the provider name resolve
        // without an external lookup.
        if !stamp.server_addr.is_empty() {
            if let Some(ip) = extract_ip(&stamp.server_addr) {
                transport.save_cached_ip(&stamp.provider_name, ip, None);
            }
        }
        let url = doh_url(&stamp.provider_name, &stamp.path);

        let mut use_get = false;
        if transport
            .doh_query(use_get, &url, &DOH_PROBE_QUERY, self.timeout)
            .await
            .is_err()
        {
            use_get = true;
            transport
                .doh_query(use_get, &url, &DOH_PROBE_QUERY, self.timeout)
                .await?;
            debug!(
                server = name,
                "doesn't appear to support POST; falling back to GET requests"
            );
        }
        let resp = transport
            .doh_query(use_get, &url, &DOH_PROBE_QUERY, self.timeout)
            .await?;

        let tls = resp
            .tls
            .as_ref()
            .filter(|tls| tls.handshake_complete)
            .ok_or_else(|| ProxyError::TlsHandshakeFailed {
                server: name.to_string(),
            })?;
        let mut protocol = tls.negotiated_protocol.as_str();
        if protocol.is_empty() {
            protocol = "h1";
            warn!(server = name, "does not support HTTP/2");
        }
        info!(
            server = name,
            version = tls.version,
            protocol,
            "TLS session established"
        );

        let mut found = false;
        'certs: for tbs in &tls.peer_certificates {
            let hash: [u8; 32] = Sha256::digest(tbs).into();
            debug!(
                server = name,
                hash = %hex_string(&hash),
                "advertised certificate"
            );
            for pinned in &stamp.hashes {
                if pinned.len() == hash.len() && pinned[..] == hash {
                    found = true;
                    break 'certs;
                }
            }
        }
        if !found && !stamp.hashes.is_empty() {
            return Err(ProxyError::CertificateHashMismatch {
                server: name.to_string(),
            });
        }

        let body = &resp.body;
        if body.len() > MAX_HTTP_BODY_LENGTH {
            return Err(ProxyError::UnexpectedDohResponse {
                server: name.to_string(),
                reason: format!("oversized body ({} bytes)", body.len()),
            });
        }
        if body.len() < MIN_DNS_PACKET_SIZE
            || body.len() > MAX_DNS_PACKET_SIZE
            || body[0] != 0xca
            || body[1] != 0xfe
            || body[4] != 0x00
            || body[5] != 0x01
        {
            return Err(ProxyError::UnexpectedDohResponse {
                server: name.to_string(),
                reason: "not a plausible DNS answer to the probe".to_string(),
            });
        }

        let rtt_ms = resp.rtt.as_millis() as u32;
        if is_new {
            info!(server = name, rtt_ms, "OK (DoH)");
        } else {
            debug!(server = name, rtt_ms, "OK (DoH)");
        }
        Ok(ServerInfo::new(
            name,
            self.timeout,
            ServerLink::Doh {
                url,
                host_name: stamp.provider_name.clone(),
                use_get,
            },
            rtt_ms,
        ))
    }
}

fn doh_url(provider_name: &str, path: &str) -> String {
    if path.is_empty() || path.starts_with('/') {
        format!("https://{provider_name}{path}")
    } else {
        format!("https://{provider_name}/{path}")
    }
}

/// IP of a `host:port` or bare-IP address string, if it is a literal
fn extract_ip(addr: &str) -> Option<IpAddr> {
    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Some(sock.ip());
    }
    addr.parse::<IpAddr>().ok()
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
