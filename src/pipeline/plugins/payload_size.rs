//! Payload sizing module
//!
//! Reads the EDNS0 payload size the client advertised, records it in
//! the request state, clamps the effective response budget to what the
//! encrypted framing leaves room for, and re-arms EDNS0 on the outgoing
//! query so upstream answers can use the full budget.

use hickory_proto::op::{Edns, Message};

use crate::dnsutil::{MAX_DNS_UDP_PACKET_SIZE, RESPONSE_OVERHEAD};
use crate::error::ProxyResult;
use crate::pipeline::PluginsState;

use super::Plugin;

/// Payload floor every server must accept
const UNEXTENDED_PAYLOAD_SIZE: usize = 512;

/// Tracks and clamps the request's payload budget
pub struct PayloadSizePlugin;

impl PayloadSizePlugin {
    /// Create the module
    pub fn new() -> Self {
        Self
    }
}

impl Default for PayloadSizePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for PayloadSizePlugin {
    fn name(&self) -> &'static str {
        "get_set_payload_size"
    }

    fn description(&self) -> &'static str {
        "Negotiates the EDNS0 payload size of the request"
    }

    fn eval(&self, state: &mut PluginsState, msg: &mut Message) -> ProxyResult<()> {
        state.original_max_payload_size = UNEXTENDED_PAYLOAD_SIZE - RESPONSE_OVERHEAD;
        let mut dnssec = false;
        if let Some(edns) = msg.extensions() {
            let advertised = usize::from(edns.max_payload());
            state.max_unencrypted_udp_safe_payload_size = advertised;
            state.original_max_payload_size = usize::max(
                advertised.saturating_sub(RESPONSE_OVERHEAD),
                state.original_max_payload_size,
            );
            dnssec = edns.dnssec_ok();
        }
        state.dnssec = dnssec;
        state.max_payload_size = usize::min(
            MAX_DNS_UDP_PACKET_SIZE - RESPONSE_OVERHEAD,
            usize::max(state.original_max_payload_size, state.max_payload_size),
        );
        if state.max_payload_size > UNEXTENDED_PAYLOAD_SIZE {
            let mut edns = Edns::new();
            edns.set_max_payload(state.max_payload_size as u16);
            edns.set_dnssec_ok(dnssec);
            *msg.extensions_mut() = Some(edns);
        }
        Ok(())
    }
}
