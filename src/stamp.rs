//! Server stamp data model
//!
//! A stamp is a compact, self-describing identifier for an encrypted DNS
//! endpoint: protocol, address, provider name, public key (or URL path)
//! and optional certificate pins. Parsing the `sdns://` string encoding
//! is the job of an external loader; this module only defines the parsed
//! form the registry and the probes consume, plus the synthesized stamp
//! used for bare `host:port` relay references.

use serde::{Deserialize, Serialize};

/// Protocol a stamp points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StampProtoType {
    /// A DNSCrypt resolver
    DnsCrypt,
    /// A DNS-over-HTTPS resolver
    Doh,
    /// An anonymization relay that blindly forwards DNSCrypt packets
    DnsCryptRelay,
}

impl std::fmt::Display for StampProtoType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::DnsCrypt => "DNSCrypt",
            Self::Doh => "DoH",
            Self::DnsCryptRelay => "Anonymized DNSCrypt",
        };
        f.write_str(name)
    }
}

/// A parsed server stamp
///
/// Field usage depends on the protocol:
///
/// | Field | DNSCrypt | DoH | Relay |
/// |---|---|---|---|
/// | `server_addr` | `ip:port` | optional IP hint | `ip:port` |
/// | `provider_name` | provider DNS name | host name | unused |
/// | `server_pk` | resolver public key | unused | unused |
/// | `path` | unused | URL path | unused |
/// | `hashes` | unused | TBS certificate pins | unused |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStamp {
    /// Protocol this endpoint speaks
    pub proto: StampProtoType,

    /// Server address as `ip:port`; may be empty for DoH stamps that
    /// rely on the provider name resolving externally
    #[serde(default)]
    pub server_addr: String,

    /// Provider DNS name (DNSCrypt) or host name (DoH)
    #[serde(default)]
    pub provider_name: String,

    /// Resolver public key; normally 32 raw bytes, but legacy stamps
    /// carry a 64-character hex string instead
    #[serde(default)]
    pub server_pk: Vec<u8>,

    /// URL path of a DoH endpoint
    #[serde(default)]
    pub path: String,

    /// SHA-256 pins over the TBS section of acceptable certificates.
    /// Entries of a length other than 32 are ignored when matching.
    #[serde(default)]
    pub hashes: Vec<Vec<u8>>,
}

impl ServerStamp {
    /// Stamp for a DNSCrypt resolver
    pub fn dnscrypt(
        server_addr: impl Into<String>,
        provider_name: impl Into<String>,
        server_pk: Vec<u8>,
    ) -> Self {
        Self {
            proto: StampProtoType::DnsCrypt,
            server_addr: server_addr.into(),
            provider_name: provider_name.into(),
            server_pk,
            path: String::new(),
            hashes: Vec::new(),
        }
    }

    /// Stamp for a DoH resolver
    pub fn doh(provider_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            proto: StampProtoType::Doh,
            server_addr: String::new(),
            provider_name: provider_name.into(),
            server_pk: Vec::new(),
            path: path.into(),
            hashes: Vec::new(),
        }
    }

    /// Stamp synthesized from a bare `host:port` relay reference
    pub fn relay(server_addr: impl Into<String>) -> Self {
        Self {
            proto: StampProtoType::DnsCryptRelay,
            server_addr: server_addr.into(),
            provider_name: String::new(),
            server_pk: Vec::new(),
            path: String::new(),
            hashes: Vec::new(),
        }
    }

    /// Set the server address hint
    #[must_use]
    pub fn with_server_addr(mut self, addr: impl Into<String>) -> Self {
        self.server_addr = addr.into();
        self
    }

    /// Add a certificate pin
    #[must_use]
    pub fn with_hash(mut self, hash: Vec<u8>) -> Self {
        self.hashes.push(hash);
        self
    }
}
