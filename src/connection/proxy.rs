//! `ProxyPeer`: presents a registry-tunnelled link as an ordinary peer to
//! upper layers (§4.3, §9 design notes).

use std::sync::Weak;

use crate::error::{Error, ErrorKind, Result};
use crate::peer::SendKind;
use crate::wire::{primitives::put_u8, MessageKind, ParticipantId, ProxyMessageHeader};

use super::ConnectionManager;

/// A peer reached only via a `ProxyMessage` tunnel through the registry
/// connection, because neither a direct dial nor a remote-connect fallback
/// succeeded.
///
/// Per design note, the back-reference to the carrier peer (the registry
/// connection doing the actual tunnelling) is a weak lookup by participant
/// name, resolved fresh on every send rather than held as an owning `Arc`.
pub struct ProxyPeer {
    pub source_id: ParticipantId,
    pub destination_id: ParticipantId,
    carrier_name: String,
    manager: Weak<ConnectionManager>,
}

impl ProxyPeer {
    pub fn new(
        source_id: ParticipantId,
        destination_id: ParticipantId,
        carrier_name: String,
        manager: &std::sync::Arc<ConnectionManager>,
    ) -> Self {
        ProxyPeer { source_id, destination_id, carrier_name, manager: std::sync::Arc::downgrade(manager) }
    }

    /// Wraps `payload` in a `ProxyMessage` frame and hands it to the
    /// carrier peer's write queue. Fails if either the connection manager
    /// or the carrier peer (identified by name) has gone away.
    pub fn send(&self, payload: Vec<u8>) -> Result<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| Error::msg(ErrorKind::Connection, "connection manager is gone"))?;
        let carrier = manager
            .peer_by_name(&self.carrier_name)
            .ok_or_else(|| Error::msg(ErrorKind::Connection, "proxy carrier peer is no longer connected"))?;

        let header = ProxyMessageHeader { source: self.source_id, destination: self.destination_id };
        let mut body = Vec::with_capacity(1 + ProxyMessageHeader::LENGTH + payload.len());
        put_u8(&mut body, MessageKind::ProxyMessage as u8);
        header.encode(&mut body);
        body.extend_from_slice(&payload);

        carrier.send_message(body, SendKind::Direct)
    }
}
