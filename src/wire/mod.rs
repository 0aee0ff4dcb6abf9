//! Serialization of all control-plane messages with explicit on-wire
//! versioning (§3, §4.2, §6).

pub mod messages;
pub mod primitives;
pub mod uri;

use primitives::{get_u64, get_u8, put_u64, put_u8};

pub use messages::*;
pub use uri::{AcceptorUri, Host};

use crate::error::{Error, ErrorKind, Result};

/// Maximum allowed total frame length, including the 4-byte length prefix
/// itself (§4.1 sizing rules).
pub const MAX_FRAME_LEN: u32 = 1 << 30; // 1 GiB

/// Length of the `u32` length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// A decoded application-level frame, i.e. the body that follows the `u32`
/// length prefix on the wire.
#[derive(Debug)]
pub enum Frame {
    SubscriptionAnnouncement(SubscriptionAnnouncement),
    SubscriptionAcknowledge(SubscriptionAcknowledge),
    MwMsg { receiver_idx: ReceiverIndex, source: EndpointAddress, payload: Vec<u8> },
    SimMsg { receiver_idx: ReceiverIndex, source: EndpointAddress, payload: Vec<u8> },
    Registry(RegistryFrame),
    Proxy { header: ProxyMessageHeader, payload: Vec<u8> },
}

#[derive(Debug)]
pub enum RegistryFrame {
    ParticipantAnnouncement(ParticipantAnnouncement),
    ParticipantAnnouncementReply(ParticipantAnnouncementReply),
    KnownParticipants(KnownParticipants),
    RemoteParticipantConnectRequest(RemoteParticipantConnectRequest),
}

/// Encodes `frame` into a frame body (kind byte(s) + payload), WITHOUT the
/// leading `u32` length prefix; the caller (the peer's write path) prepends
/// that once the total length is known.
pub fn encode_frame(frame: &Frame, negotiated: ProtocolVersion) -> Vec<u8> {
    let mut out = Vec::new();
    match frame {
        Frame::SubscriptionAnnouncement(m) => {
            put_u8(&mut out, MessageKind::SubscriptionAnnouncement as u8);
            out.extend_from_slice(&m.encode());
        }
        Frame::SubscriptionAcknowledge(m) => {
            put_u8(&mut out, MessageKind::SubscriptionAcknowledge as u8);
            out.extend_from_slice(&m.encode());
        }
        Frame::MwMsg { receiver_idx, source, payload } => {
            put_u8(&mut out, MessageKind::MwMsg as u8);
            put_u64(&mut out, receiver_idx.0);
            source.encode(&mut out);
            out.extend_from_slice(payload);
        }
        Frame::SimMsg { receiver_idx, source, payload } => {
            put_u8(&mut out, MessageKind::SimMsg as u8);
            put_u64(&mut out, receiver_idx.0);
            source.encode(&mut out);
            out.extend_from_slice(payload);
        }
        Frame::Registry(r) => {
            put_u8(&mut out, MessageKind::RegistryMessage as u8);
            match r {
                RegistryFrame::ParticipantAnnouncement(m) => {
                    put_u8(&mut out, RegistryMessageKind::ParticipantAnnouncement as u8);
                    out.extend_from_slice(&m.encode());
                }
                RegistryFrame::ParticipantAnnouncementReply(m) => {
                    put_u8(&mut out, RegistryMessageKind::ParticipantAnnouncementReply as u8);
                    out.extend_from_slice(&m.encode());
                }
                RegistryFrame::KnownParticipants(m) => {
                    put_u8(&mut out, RegistryMessageKind::KnownParticipants as u8);
                    out.extend_from_slice(&m.encode(negotiated));
                }
                RegistryFrame::RemoteParticipantConnectRequest(m) => {
                    put_u8(&mut out, RegistryMessageKind::RemoteParticipantConnectRequest as u8);
                    out.extend_from_slice(&m.encode());
                }
            }
        }
        Frame::Proxy { header, payload } => {
            put_u8(&mut out, MessageKind::ProxyMessage as u8);
            header.encode(&mut out);
            out.extend_from_slice(payload);
        }
    }
    out
}

/// Decodes a frame body (kind byte(s) + payload) previously isolated by the
/// peer's framing read loop. `negotiated` is the protocol version already
/// agreed on this connection (only consulted by `KnownParticipants`, the
/// sole type whose layout differs across `{3,0}`/`{3,1}`, §4.2).
pub fn decode_frame(mut buf: &[u8], negotiated: ProtocolVersion) -> Result<Frame> {
    let kind = MessageKind::from_u8(get_u8(&mut buf)?)?;
    match kind {
        MessageKind::Invalid => Err(Error::msg(ErrorKind::Protocol, "invalid message kind on wire")),
        MessageKind::SubscriptionAnnouncement => {
            Ok(Frame::SubscriptionAnnouncement(SubscriptionAnnouncement::decode(buf)?))
        }
        MessageKind::SubscriptionAcknowledge => {
            Ok(Frame::SubscriptionAcknowledge(SubscriptionAcknowledge::decode(buf)?))
        }
        MessageKind::MwMsg | MessageKind::SimMsg => {
            let receiver_idx = ReceiverIndex(get_u64(&mut buf)?);
            let source = EndpointAddress::decode(&mut buf)?;
            let payload = buf.to_vec();
            Ok(if matches!(kind, MessageKind::MwMsg) {
                Frame::MwMsg { receiver_idx, source, payload }
            } else {
                Frame::SimMsg { receiver_idx, source, payload }
            })
        }
        MessageKind::RegistryMessage => {
            let rk = RegistryMessageKind::from_u8(get_u8(&mut buf)?)?;
            let frame = match rk {
                RegistryMessageKind::ParticipantAnnouncement => {
                    RegistryFrame::ParticipantAnnouncement(ParticipantAnnouncement::decode(buf)?)
                }
                RegistryMessageKind::ParticipantAnnouncementReply => {
                    RegistryFrame::ParticipantAnnouncementReply(ParticipantAnnouncementReply::decode(buf)?)
                }
                RegistryMessageKind::KnownParticipants => {
                    RegistryFrame::KnownParticipants(KnownParticipants::decode(buf, negotiated)?)
                }
                RegistryMessageKind::RemoteParticipantConnectRequest => {
                    RegistryFrame::RemoteParticipantConnectRequest(RemoteParticipantConnectRequest::decode(buf)?)
                }
            };
            Ok(Frame::Registry(frame))
        }
        MessageKind::ProxyMessage => {
            let header = ProxyMessageHeader::decode(&mut buf)?;
            let payload = buf.to_vec();
            Ok(Frame::Proxy { header, payload })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mwmsg_round_trips_through_frame() {
        let frame = Frame::MwMsg {
            receiver_idx: ReceiverIndex(7),
            source: EndpointAddress { participant_id: ParticipantId(1), endpoint_id: 2 },
            payload: vec![9, 9, 9],
        };
        let encoded = encode_frame(&frame, ProtocolVersion::CURRENT);
        let decoded = decode_frame(&encoded, ProtocolVersion::CURRENT).unwrap();
        match decoded {
            Frame::MwMsg { receiver_idx, source, payload } => {
                assert_eq!(receiver_idx, ReceiverIndex(7));
                assert_eq!(source.endpoint_id, 2);
                assert_eq!(payload, vec![9, 9, 9]);
            }
            _ => panic!("wrong frame kind decoded"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = decode_frame(&[200], ProtocolVersion::CURRENT).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
