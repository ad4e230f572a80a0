//! Raw DNS packet helpers
//!
//! Small utilities shared by the pool and the pipeline that operate on
//! wire-format packets without a full parse: flag checks, response-code
//! extraction, size bounds, TTL clamping and name normalization.

use hickory_proto::op::Message;

use crate::error::{ProxyError, ProxyResult};

/// Smallest packet that can carry a DNS header
pub const MIN_DNS_PACKET_SIZE: usize = 12;

/// Largest DNS packet this core accepts
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Largest UDP datagram we advertise via EDNS0
pub const MAX_DNS_UDP_PACKET_SIZE: usize = 4096;

/// Largest UDP payload that avoids fragmentation on typical paths
pub const MAX_DNS_UDP_SAFE_PACKET_SIZE: usize = 1252;

/// Framing overhead of an encrypted response:
/// 8-byte server magic + 24-byte nonce + 16-byte MAC
pub const RESPONSE_OVERHEAD: usize = 48;

/// Cap on the body read from a DoH probe
pub const MAX_HTTP_BODY_LENGTH: usize = 4_000_000;

/// Whether the truncation bit is set in a raw packet
///
/// Returns `false` for packets too short to carry a header.
pub fn has_tc_flag(packet: &[u8]) -> bool {
    packet.len() >= MIN_DNS_PACKET_SIZE && packet[2] & 0x02 != 0
}

/// Response code of a raw packet (low four bits of the second flag byte)
pub fn rcode(packet: &[u8]) -> u8 {
    packet[3] & 0x0f
}

/// Lowercase a query name and strip the trailing root dot
///
/// DNS names compare case-insensitively and policy files are written
/// without the trailing dot, so every name match in the pipeline goes
/// through this first.
pub fn normalize_qname(name: &str) -> String {
    let trimmed = name.trim_end_matches('.');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_lowercase()
    }
}

/// Clamp every answer TTL in a message to `max_ttl`
pub fn clamp_answer_ttls(msg: &mut Message, max_ttl: u32) {
    let mut answers = msg.take_answers();
    for record in &mut answers {
        if record.ttl() > max_ttl {
            record.set_ttl(max_ttl);
        }
    }
    msg.insert_answers(answers);
}

/// Smallest answer TTL in a message, if it has any answers
pub fn min_answer_ttl(msg: &Message) -> Option<u32> {
    msg.answers().iter().map(hickory_proto::rr::Record::ttl).min()
}

/// Decode a legacy hex-encoded 32-byte key, tolerating `:` separators
///
/// Stamps are supposed to carry raw 32-byte keys; some old ones embed
/// the key as a 64-character hex string instead.
pub fn decode_hex_key(s: &str) -> ProxyResult<[u8; 32]> {
    let cleaned: String = s.chars().filter(|&c| c != ':').collect();
    if cleaned.len() != 64 {
        return Err(ProxyError::fatal(format!(
            "unsupported public key length: {}",
            cleaned.len()
        )));
    }
    let mut out = [0u8; 32];
    for (i, chunk) in cleaned.as_bytes().chunks(2).enumerate() {
        let hi = hex_digit(chunk[0])?;
        let lo = hex_digit(chunk[1])?;
        out[i] = (hi << 4) | lo;
    }
    Ok(out)
}

fn hex_digit(b: u8) -> ProxyResult<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(ProxyError::fatal(format!(
            "invalid hex digit in public key: {}",
            b as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    #[test]
    fn test_tc_flag() {
        let mut packet = vec![0u8; 12];
        assert!(!has_tc_flag(&packet));
        packet[2] |= 0x02;
        assert!(has_tc_flag(&packet));
        // Too short to carry a header
        assert!(!has_tc_flag(&packet[..8]));
    }

    #[test]
    fn test_rcode_extraction() {
        let mut packet = vec![0u8; 12];
        packet[3] = 0x83; // RA set, rcode NXDOMAIN
        assert_eq!(rcode(&packet), 3);
    }

    #[test]
    fn test_normalize_qname() {
        assert_eq!(normalize_qname("ADS.Example.COM."), "ads.example.com");
        assert_eq!(normalize_qname("example.com"), "example.com");
        assert_eq!(normalize_qname("."), ".");
        assert_eq!(normalize_qname(""), ".");
    }

    #[test]
    fn test_clamp_answer_ttls() {
        let mut msg = Message::new();
        let name = Name::from_str("a.test.").unwrap();
        msg.add_query(Query::query(name.clone(), RecordType::A));
        msg.add_answer(Record::from_rdata(
            name.clone(),
            3600,
            RData::A(A(Ipv4Addr::new(192, 0, 2, 1))),
        ));
        msg.add_answer(Record::from_rdata(
            name,
            30,
            RData::A(A(Ipv4Addr::new(192, 0, 2, 2))),
        ));

        clamp_answer_ttls(&mut msg, 300);
        let ttls: Vec<u32> = msg.answers().iter().map(|r| r.ttl()).collect();
        assert_eq!(ttls, vec![300, 30]);
        assert_eq!(min_answer_ttl(&msg), Some(30));
    }

    #[test]
    fn test_decode_hex_key() {
        let hex = "00:11:22:33:44:55:66:77:88:99:aa:bb:cc:dd:ee:ff:\
                   00:11:22:33:44:55:66:77:88:99:aa:bb:cc:dd:ee:ff";
        let key = decode_hex_key(hex).unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[15], 0xff);
        assert_eq!(key[31], 0xff);

        assert!(decode_hex_key("deadbeef").is_err());
        assert!(decode_hex_key(&"zz".repeat(32)).is_err());
        assert!(decode_hex_key("deadbeef").unwrap_err().is_fatal());
    }
}
