//! Transport interface consumed by the pool
//!
//! The DNSCrypt and DoH wire formats (certificate fetch, nonce
//! construction, HTTP framing) live outside this crate. The pool talks
//! to them through the [`Transport`] trait: a certificate fetch for
//! DNSCrypt servers and a single HTTPS exchange for DoH servers, both
//! returning the measured round-trip time the pool seeds its ranking
//! with.
//!
//! The trait is object-safe so the refresh path can hold a
//! `&dyn Transport`, and async because these calls are the only
//! suspension points in the whole request path.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProxyResult;
use crate::pool::RelayAddrs;

/// Exact probe sent to a DoH server to measure its round-trip time and
/// pin its certificate: transaction id `0xcafe`, one `NS` question for
/// the root, and an OPT record advertising a 4096-byte UDP payload.
pub const DOH_PROBE_QUERY: [u8; 28] = [
    0xca, 0xfe, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // header
    0x00, 0x00, 0x02, 0x00, 0x01, // NS? .
    0x00, 0x00, 0x29, 0x10, 0x00, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00, // OPT
];

/// Transport protocol the client-facing listener received a query on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientProto {
    /// Datagram transport
    #[default]
    Udp,
    /// Stream transport
    Tcp,
}

impl std::fmt::Display for ClientProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        })
    }
}

/// AEAD construction negotiated with a DNSCrypt resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CryptoConstruction {
    /// XSalsa20 with Poly1305
    #[default]
    XSalsa20Poly1305,
    /// XChaCha20 with Poly1305
    XChaCha20Poly1305,
}

/// Result of a successful DNSCrypt certificate fetch
#[derive(Debug, Clone)]
pub struct CertInfo {
    /// Fixed 8-byte prefix queries to this resolver must carry
    pub magic_query: [u8; 8],
    /// Resolver public key from the certificate
    pub server_pk: [u8; 32],
    /// Precomputed shared key for this client
    pub shared_key: [u8; 32],
    /// AEAD construction the certificate selects
    pub crypto_construction: CryptoConstruction,
}

/// TLS session details of a DoH exchange, as far as the probe needs them
#[derive(Debug, Clone, Default)]
pub struct TlsSessionInfo {
    /// Whether the handshake ran to completion
    pub handshake_complete: bool,
    /// Negotiated ALPN protocol; empty when the server offered none
    pub negotiated_protocol: String,
    /// Negotiated TLS version code
    pub version: u16,
    /// TBS (to-be-signed) bytes of each certificate the peer presented,
    /// leaf first
    pub peer_certificates: Vec<Vec<u8>>,
}

/// One DoH exchange as seen by the probe
#[derive(Debug, Clone)]
pub struct DohResponse {
    /// TLS session details; `None` when the exchange never reached TLS
    pub tls: Option<TlsSessionInfo>,
    /// Response body
    pub body: Vec<u8>,
    /// Wall-clock duration of the exchange
    pub rtt: Duration,
}

/// Encrypted-transport operations the pool consumes
///
/// Implementations are free to pool connections, cache certificates and
/// retry internally; the pool only sees the final outcome and the
/// measured round-trip time.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch and validate the current certificate of a DNSCrypt resolver
    ///
    /// Returns the certificate material and the probe round-trip time in
    /// milliseconds. When `relay` is set the exchange is sent through
    /// that anonymization hop.
    async fn fetch_dnscrypt_cert(
        &self,
        main_proto: ClientProto,
        server_pk: &[u8; 32],
        server_addr: &str,
        provider_name: &str,
        is_new: bool,
        relay: Option<&RelayAddrs>,
    ) -> ProxyResult<(CertInfo, u32)>;

    /// Perform one DoH exchange
    ///
    /// `use_get` selects RFC 8484 GET encoding instead of POST.
    async fn doh_query(
        &self,
        use_get: bool,
        url: &str,
        body: &[u8],
        timeout: Duration,
    ) -> ProxyResult<DohResponse>;

    /// Hint the transport's resolver cache with an IP literal embedded
    /// in a stamp, so the provider name resolves without a lookup.
    /// `ttl` of `None` marks the hint as non-expiring.
    fn save_cached_ip(&self, _host: &str, _ip: IpAddr, _ttl: Option<Duration>) {}
}
