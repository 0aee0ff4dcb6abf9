//! Control-plane message types and their versioned wire layouts.
//!
//! All message types carry a stable [`WireTypeInfo::SERDES_NAME`] which is
//! the subscription key on the wire (§4.2); it must never change across
//! internal renames.

use super::primitives::*;
use super::uri::AcceptorUri;
use crate::error::{Error, ErrorKind, Result};

/// `(major, minor)` protocol version pair.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const V3_0: ProtocolVersion = ProtocolVersion { major: 3, minor: 0 };
    pub const V3_1: ProtocolVersion = ProtocolVersion { major: 3, minor: 1 };
    pub const CURRENT: ProtocolVersion = Self::V3_1;

    pub const SUPPORTED: &'static [ProtocolVersion] = &[Self::V3_0, Self::V3_1];

    pub fn is_supported(self) -> bool {
        Self::SUPPORTED.contains(&self)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Every transportable type carries a stable name and a layout version,
/// used to bridge mismatched versions on a per-link basis (§4.2).
pub trait WireTypeInfo {
    const SERDES_NAME: &'static str;
    const VERSION: u32;
}

/// 8-byte preamble beginning every registry-kind message: `"VIB-"` followed
/// by the two version words, little-endian.
const MAGIC: [u8; 4] = *b"VIB-";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegistryMsgHeader {
    pub version: ProtocolVersion,
}

impl RegistryMsgHeader {
    pub const LENGTH: usize = 8;

    pub fn current() -> Self {
        RegistryMsgHeader { version: ProtocolVersion::CURRENT }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC);
        put_u16(out, self.version.major);
        put_u16(out, self.version.minor);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.len() < Self::LENGTH {
            return Err(Error::msg(ErrorKind::Protocol, "truncated registry header"));
        }
        if &buf[..4] != &MAGIC {
            return Err(Error::msg(ErrorKind::Protocol, "bad registry magic"));
        }
        *buf = &buf[4..];
        let major = get_u16(buf)?;
        let minor = get_u16(buf)?;
        Ok(RegistryMsgHeader { version: ProtocolVersion { major, minor } })
    }
}

/// Closed set of top-level frame kinds (§4.1).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageKind {
    Invalid = 0,
    SubscriptionAnnouncement = 1,
    SubscriptionAcknowledge = 2,
    MwMsg = 3,
    SimMsg = 4,
    RegistryMessage = 5,
    ProxyMessage = 6,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => MessageKind::Invalid,
            1 => MessageKind::SubscriptionAnnouncement,
            2 => MessageKind::SubscriptionAcknowledge,
            3 => MessageKind::MwMsg,
            4 => MessageKind::SimMsg,
            5 => MessageKind::RegistryMessage,
            6 => MessageKind::ProxyMessage,
            other => return Err(Error::msg(ErrorKind::Protocol, format!("unknown message kind {}", other))),
        })
    }
}

/// Closed set of registry-message sub-kinds, following a `RegistryMessage`
/// frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum RegistryMessageKind {
    ParticipantAnnouncement = 1,
    ParticipantAnnouncementReply = 2,
    KnownParticipants = 3,
    RemoteParticipantConnectRequest = 4,
}

impl RegistryMessageKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => RegistryMessageKind::ParticipantAnnouncement,
            2 => RegistryMessageKind::ParticipantAnnouncementReply,
            3 => RegistryMessageKind::KnownParticipants,
            4 => RegistryMessageKind::RemoteParticipantConnectRequest,
            other => {
                return Err(Error::msg(
                    ErrorKind::Protocol,
                    format!("unknown registry message kind {}", other),
                ))
            }
        })
    }
}

/// Unique id of a participant process, stable for the lifetime of the
/// simulation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct ParticipantId(pub u64);

/// The well-known id reserved for the registry itself.
pub const REGISTRY_PARTICIPANT_ID: ParticipantId = ParticipantId(0);

/// Locally assigned, monotonically growing subscription receiver index.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct ReceiverIndex(pub u64);

/// `ParticipantInfo`: identity, ordered acceptor URIs, and capability tags
/// advertised in the initial announcement.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ParticipantInfo {
    pub participant_id: ParticipantId,
    pub participant_name: String,
    pub acceptor_uris: Vec<AcceptorUri>,
    pub capabilities: String,
    pub simulation_name: String,
}

/// Capability tag advertised when a peer can serve as a remote-connect
/// fallback target.
pub const CAPABILITY_AUTONOMOUS_SYNCHRONOUS: &str = "autonomous-synchronous";
/// Capability tag advertised when a peer can carry/receive tunnelled
/// `ProxyMessage` frames through the registry.
pub const CAPABILITY_PROXY_MESSAGE: &str = "proxy-message";
/// Capability tag advertised by a participant that runs a `TimeConfiguration`
/// (§4.6) and should be added as a synchronized peer by everyone else who
/// also advertises it.
pub const CAPABILITY_VIRTUAL_TIME_SYNC: &str = "virtual-time-sync";

pub fn has_capability(capabilities: &str, tag: &str) -> bool {
    capabilities.split(',').any(|c| c.trim() == tag)
}

fn encode_peer_info(out: &mut Vec<u8>, info: &ParticipantInfo) {
    put_str(out, &info.participant_name);
    put_u64(out, info.participant_id.0);
    put_vec(out, &info.acceptor_uris, |o, u| put_str(o, &u.to_string()));
    put_str(out, &info.capabilities);
}

fn decode_peer_info(buf: &mut &[u8], simulation_name: String) -> Result<ParticipantInfo> {
    let participant_name = get_str(buf)?;
    let participant_id = ParticipantId(get_u64(buf)?);
    let acceptor_uris = get_vec(buf, |b| {
        let s = get_str(b)?;
        AcceptorUri::parse(&s)
    })?;
    let capabilities = get_str(buf)?;
    Ok(ParticipantInfo {
        participant_id,
        participant_name,
        acceptor_uris,
        capabilities,
        simulation_name,
    })
}

/// First message sent on a new peer connection (invariant 2).
#[derive(Debug, Clone)]
pub struct ParticipantAnnouncement {
    pub header: RegistryMsgHeader,
    pub info: ParticipantInfo,
}

impl ParticipantAnnouncement {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.header.encode(&mut out);
        encode_peer_info(&mut out, &self.info);
        put_str(&mut out, &self.info.simulation_name);
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let header = RegistryMsgHeader::decode(&mut buf)?;
        // simulation_name trails the peer info on the wire; peek it after
        // decoding the fixed fields.
        let participant_name = get_str(&mut buf)?;
        let participant_id = ParticipantId(get_u64(&mut buf)?);
        let acceptor_uris = get_vec(&mut buf, |b| {
            let s = get_str(b)?;
            AcceptorUri::parse(&s)
        })?;
        let capabilities = get_str(&mut buf)?;
        let simulation_name = get_str(&mut buf)?;
        Ok(ParticipantAnnouncement {
            header,
            info: ParticipantInfo {
                participant_id,
                participant_name,
                acceptor_uris,
                capabilities,
                simulation_name,
            },
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AnnouncementStatus {
    Failed = 0,
    Success = 1,
}

impl AnnouncementStatus {
    fn encode(self, out: &mut Vec<u8>) {
        put_u8(out, self as u8);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self> {
        Ok(match get_u8(buf)? {
            0 => AnnouncementStatus::Failed,
            1 => AnnouncementStatus::Success,
            other => {
                return Err(Error::msg(ErrorKind::Protocol, format!("bad announcement status {}", other)))
            }
        })
    }
}

/// Reply to a `ParticipantAnnouncement`. `diagnostic` is absent on the wire
/// in `{3,0}` and defaults to empty when reading an older sender.
#[derive(Debug, Clone)]
pub struct ParticipantAnnouncementReply {
    pub remote_header: RegistryMsgHeader,
    pub status: AnnouncementStatus,
    pub diagnostic: String,
}

impl ParticipantAnnouncementReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.remote_header.encode(&mut out);
        self.status.encode(&mut out);
        if self.remote_header.version > ProtocolVersion::V3_0 {
            put_str(&mut out, &self.diagnostic);
        }
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let remote_header = RegistryMsgHeader::decode(&mut buf)?;
        let status = AnnouncementStatus::decode(&mut buf)?;
        let diagnostic = if remote_header.version > ProtocolVersion::V3_0 {
            get_str(&mut buf)?
        } else {
            String::new()
        };
        Ok(ParticipantAnnouncementReply { remote_header, status, diagnostic })
    }
}

/// Broadcast by the registry after a successful announcement, listing
/// every other peer in the same simulation.
#[derive(Debug, Clone)]
pub struct KnownParticipants {
    pub peer_infos: Vec<ParticipantInfo>,
}

impl KnownParticipants {
    /// `negotiated` is the protocol version agreed during the handshake
    /// that preceded this message; in `{3,0}` the header length prefix was
    /// omitted entirely (§4.2).
    pub fn encode(&self, negotiated: ProtocolVersion) -> Vec<u8> {
        let mut out = Vec::new();
        if negotiated > ProtocolVersion::V3_0 {
            RegistryMsgHeader { version: negotiated }.encode(&mut out);
        }
        put_u32(&mut out, self.peer_infos.len() as u32);
        for info in &self.peer_infos {
            put_str(&mut out, &info.simulation_name);
            encode_peer_info(&mut out, info);
        }
        out
    }

    pub fn decode(mut buf: &[u8], negotiated: ProtocolVersion) -> Result<Self> {
        if negotiated > ProtocolVersion::V3_0 {
            let _header = RegistryMsgHeader::decode(&mut buf)?;
        }
        let count = get_u32(&mut buf)? as usize;
        let mut peer_infos = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            let simulation_name = get_str(&mut buf)?;
            peer_infos.push(decode_peer_info(&mut buf, simulation_name)?);
        }
        Ok(KnownParticipants { peer_infos })
    }
}

/// Relayed by the registry to ask `target` to dial `requester` back, used
/// when the requester's direct connect attempt to `target` failed.
#[derive(Debug, Clone)]
pub struct RemoteParticipantConnectRequest {
    pub requester_id: ParticipantId,
    pub requester_name: String,
    pub target_id: ParticipantId,
}

impl RemoteParticipantConnectRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u64(&mut out, self.requester_id.0);
        put_str(&mut out, &self.requester_name);
        put_u64(&mut out, self.target_id.0);
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let requester_id = ParticipantId(get_u64(&mut buf)?);
        let requester_name = get_str(&mut buf)?;
        let target_id = ParticipantId(get_u64(&mut buf)?);
        Ok(RemoteParticipantConnectRequest { requester_id, requester_name, target_id })
    }
}

/// Barrier-advance announcement: "I intend to execute my next step at
/// `timepoint_ns`, lasting `duration_ns`" (§4.6).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NextSimTask {
    pub timepoint_ns: i64,
    pub duration_ns: i64,
}

impl WireTypeInfo for NextSimTask {
    const SERDES_NAME: &'static str = "NEXTSIMTASK";
    const VERSION: u32 = 1;
}

impl NextSimTask {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_i64(&mut out, self.timepoint_ns);
        put_i64(&mut out, self.duration_ns);
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let timepoint_ns = get_i64(&mut buf)?;
        let duration_ns = get_i64(&mut buf)?;
        Ok(NextSimTask { timepoint_ns, duration_ns })
    }
}

#[derive(Debug, Clone)]
pub struct ParticipantStatus {
    pub participant_name: String,
    pub state: u8,
    pub enter_reason: String,
    pub enter_time_us_since_epoch: i64,
    pub refresh_time_us_since_epoch: i64,
}

impl WireTypeInfo for ParticipantStatus {
    const SERDES_NAME: &'static str = "PARTICIPANTSTATUS";
    const VERSION: u32 = 1;
}

impl ParticipantStatus {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_str(&mut out, &self.participant_name);
        put_u8(&mut out, self.state);
        put_str(&mut out, &self.enter_reason);
        put_i64(&mut out, self.enter_time_us_since_epoch);
        put_i64(&mut out, self.refresh_time_us_since_epoch);
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let participant_name = get_str(&mut buf)?;
        let state = get_u8(&mut buf)?;
        let enter_reason = get_str(&mut buf)?;
        let enter_time_us_since_epoch = get_i64(&mut buf)?;
        let refresh_time_us_since_epoch = get_i64(&mut buf)?;
        Ok(ParticipantStatus {
            participant_name,
            state,
            enter_reason,
            enter_time_us_since_epoch,
            refresh_time_us_since_epoch,
        })
    }
}

/// `(receiverIndex, networkName, messageTypeName, version)`.
#[derive(Debug, Clone)]
pub struct SubscriptionAnnouncement {
    pub receiver_idx: ReceiverIndex,
    pub network_name: String,
    pub serdes_name: String,
    pub version: u32,
}

impl SubscriptionAnnouncement {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u64(&mut out, self.receiver_idx.0);
        put_str(&mut out, &self.network_name);
        put_str(&mut out, &self.serdes_name);
        put_u32(&mut out, self.version);
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let receiver_idx = ReceiverIndex(get_u64(&mut buf)?);
        let network_name = get_str(&mut buf)?;
        let serdes_name = get_str(&mut buf)?;
        let version = get_u32(&mut buf)?;
        Ok(SubscriptionAnnouncement { receiver_idx, network_name, serdes_name, version })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SubscriptionStatus {
    Failed = 0,
    Success = 1,
}

#[derive(Debug, Clone)]
pub struct SubscriptionAcknowledge {
    pub receiver_idx: ReceiverIndex,
    pub status: SubscriptionStatus,
    /// The per-link serdes version this acknowledging side selected: the
    /// lower of its own and the announcer's `version` (§4.2/§4.4). `0` when
    /// `status` is `Failed`.
    pub negotiated_version: u32,
}

impl SubscriptionAcknowledge {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_u64(&mut out, self.receiver_idx.0);
        put_u8(&mut out, self.status as u8);
        put_u32(&mut out, self.negotiated_version);
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let receiver_idx = ReceiverIndex(get_u64(&mut buf)?);
        let status = match get_u8(&mut buf)? {
            0 => SubscriptionStatus::Failed,
            1 => SubscriptionStatus::Success,
            other => return Err(Error::msg(ErrorKind::Protocol, format!("bad subscription status {}", other))),
        };
        let negotiated_version = get_u32(&mut buf)?;
        Ok(SubscriptionAcknowledge { receiver_idx, status, negotiated_version })
    }
}

/// Header prepended to a `ProxyMessage` frame: who sent the tunnelled
/// payload, and who it is ultimately addressed to.
#[derive(Debug, Copy, Clone)]
pub struct ProxyMessageHeader {
    pub source: ParticipantId,
    pub destination: ParticipantId,
}

impl ProxyMessageHeader {
    pub const LENGTH: usize = 16;

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.source.0);
        put_u64(out, self.destination.0);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let source = ParticipantId(get_u64(buf)?);
        let destination = ParticipantId(get_u64(buf)?);
        Ok(ProxyMessageHeader { source, destination })
    }
}

/// Source address prepended to `MwMsg`/`SimMsg` frames: `(participantId,
/// endpointId)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EndpointAddress {
    pub participant_id: ParticipantId,
    pub endpoint_id: u64,
}

impl EndpointAddress {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.participant_id.0);
        put_u64(out, self.endpoint_id);
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        let participant_id = ParticipantId(get_u64(buf)?);
        let endpoint_id = get_u64(buf)?;
        Ok(EndpointAddress { participant_id, endpoint_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(name: &str, id: u64) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: ParticipantId(id),
            participant_name: name.into(),
            acceptor_uris: vec![AcceptorUri::parse("tcp://127.0.0.1:7500").unwrap()],
            capabilities: format!("{},{}", CAPABILITY_PROXY_MESSAGE, CAPABILITY_AUTONOMOUS_SYNCHRONOUS),
            simulation_name: "sim".into(),
        }
    }

    #[test]
    fn registry_header_round_trip() {
        let hdr = RegistryMsgHeader { version: ProtocolVersion::V3_1 };
        let mut out = Vec::new();
        hdr.encode(&mut out);
        assert_eq!(out.len(), RegistryMsgHeader::LENGTH);
        let mut cur = &out[..];
        assert_eq!(RegistryMsgHeader::decode(&mut cur).unwrap(), hdr);
    }

    #[test]
    fn announcement_round_trip() {
        let ann = ParticipantAnnouncement {
            header: RegistryMsgHeader::current(),
            info: sample_info("alice", 1),
        };
        let encoded = ann.encode();
        let decoded = ParticipantAnnouncement::decode(&encoded).unwrap();
        assert_eq!(decoded.info.participant_name, "alice");
        assert_eq!(decoded.info.participant_id, ParticipantId(1));
        assert!(has_capability(&decoded.info.capabilities, CAPABILITY_PROXY_MESSAGE));
    }

    #[test]
    fn reply_diagnostic_absent_in_v3_0() {
        let reply = ParticipantAnnouncementReply {
            remote_header: RegistryMsgHeader { version: ProtocolVersion::V3_0 },
            status: AnnouncementStatus::Success,
            diagnostic: "ignored".into(),
        };
        let encoded = reply.encode();
        let decoded = ParticipantAnnouncementReply::decode(&encoded).unwrap();
        assert_eq!(decoded.diagnostic, "");
        assert_eq!(decoded.status, AnnouncementStatus::Success);
    }

    #[test]
    fn reply_diagnostic_present_in_v3_1() {
        let reply = ParticipantAnnouncementReply {
            remote_header: RegistryMsgHeader { version: ProtocolVersion::V3_1 },
            status: AnnouncementStatus::Failed,
            diagnostic: "duplicate name".into(),
        };
        let encoded = reply.encode();
        let decoded = ParticipantAnnouncementReply::decode(&encoded).unwrap();
        assert_eq!(decoded.diagnostic, "duplicate name");
    }

    #[test]
    fn known_participants_v3_0_has_no_header() {
        let kp = KnownParticipants { peer_infos: vec![sample_info("bob", 2)] };
        let encoded = kp.encode(ProtocolVersion::V3_0);
        // no 8-byte magic/version prefix
        assert_ne!(&encoded[..4.min(encoded.len())], b"VIB-");
        let decoded = KnownParticipants::decode(&encoded, ProtocolVersion::V3_0).unwrap();
        assert_eq!(decoded.peer_infos[0].participant_name, "bob");
    }

    #[test]
    fn known_participants_v3_1_has_header() {
        let kp = KnownParticipants { peer_infos: vec![sample_info("carol", 3)] };
        let encoded = kp.encode(ProtocolVersion::V3_1);
        assert_eq!(&encoded[..4], b"VIB-");
        let decoded = KnownParticipants::decode(&encoded, ProtocolVersion::V3_1).unwrap();
        assert_eq!(decoded.peer_infos[0].participant_name, "carol");
    }

    #[test]
    fn next_sim_task_round_trip() {
        let task = NextSimTask { timepoint_ns: 1_000_000, duration_ns: 1_000 };
        let decoded = NextSimTask::decode(&task.encode()).unwrap();
        assert_eq!(decoded, task);
    }
}
