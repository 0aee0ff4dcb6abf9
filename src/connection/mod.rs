//! Connection establishment: registry handshake, direct/remote-connect/proxy
//! fallback, and the per-peer arena (§4.3).

pub mod link;
pub mod proxy;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use slab::Slab;
use tokio::time::timeout;

use crate::async_runtime as rt;
use crate::config::{AggregationOptions, SocketOptions, TimeoutOptions};
use crate::error::{Error, ErrorKind, Result, ResultWrappedExt};
use crate::peer::{self, Listener, Peer, SendKind, Socket};
use crate::wire::{
    self, has_capability, AcceptorUri, AnnouncementStatus, Frame, KnownParticipants,
    ParticipantAnnouncement, ParticipantAnnouncementReply, ParticipantId, ParticipantInfo,
    ProtocolVersion, ReceiverIndex, RegistryFrame, RegistryMsgHeader, RemoteParticipantConnectRequest,
    CAPABILITY_AUTONOMOUS_SYNCHRONOUS, CAPABILITY_PROXY_MESSAGE, REGISTRY_PARTICIPANT_ID,
};

pub mod subscribe;

pub use link::{Link, LinkTable};
pub use proxy::ProxyPeer;

/// Reserved participant name the registry's own peer connection is kept
/// under in a participant's arena, so [`ProxyPeer`]'s by-name carrier
/// lookup also works for registry-tunnelled traffic.
pub const REGISTRY_PEER_NAME: &str = "__registry__";

/// Arena index for a connected peer. Owned exclusively by the
/// `ConnectionManager` that allocated it; never shared as a pointer (§9
/// design notes).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct PeerId(usize);

#[cfg(test)]
impl PeerId {
    pub fn for_test(n: usize) -> Self {
        PeerId(n)
    }
}

/// Per-target connect-state machine, from the initiator's side (§4.3).
/// Tracked by participant name rather than [`PeerId`], since a `Failure`
/// or a registry-tunnelled `Proxy` success never gets an arena entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeerConnectState {
    Direct,
    ReplyReceived,
    Failure,
}

/// Aggregate connect stage, owned by the connection manager across all
/// peers (§4.3). `join()` only lets the local lifecycle leave `Invalid`
/// once this reaches `AllRepliesReceived`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AggregateStage {
    Connecting,
    WaitingForAllReplies,
    AllRepliesReceived,
    Failure,
}

struct PeerEntry {
    peer: Arc<Peer>,
    info: ParticipantInfo,
}

/// Owns every peer connection for one process (participant or registry):
/// the peer arena, the by-name index, the link table, and the aggregate
/// connect-stage bookkeeping.
pub struct ConnectionManager {
    pub participant_id: ParticipantId,
    pub participant_name: String,
    pub simulation_name: String,
    pub capabilities: String,
    acceptor_uris: Mutex<Vec<AcceptorUri>>,
    peers: Mutex<Slab<PeerEntry>>,
    by_name: Mutex<HashMap<String, PeerId>>,
    registry: Mutex<Option<Arc<Peer>>>,
    /// Per-target connect state, keyed by participant name, seeded by
    /// [`ConnectionManager::begin_connect_attempts`] and settled by
    /// [`ConnectionManager::set_connect_state`] (§4.3).
    connect_states: Mutex<HashMap<String, PeerConnectState>>,
    aggregate_stage: Mutex<AggregateStage>,
    pub links: LinkTable,
    next_receiver_idx: AtomicU64,
    /// Maps a locally-assigned receiver index back to the link it was
    /// allocated for, so an incoming `SubscriptionAcknowledge` (which only
    /// carries the index) can be routed to the right `Link`.
    receiver_idx_links: Mutex<HashMap<ReceiverIndex, Arc<Link>>>,
}

impl ConnectionManager {
    pub fn new(
        participant_id: ParticipantId,
        participant_name: impl Into<String>,
        simulation_name: impl Into<String>,
        capabilities: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(ConnectionManager {
            participant_id,
            participant_name: participant_name.into(),
            simulation_name: simulation_name.into(),
            capabilities: capabilities.into(),
            acceptor_uris: Mutex::new(Vec::new()),
            peers: Mutex::new(Slab::new()),
            by_name: Mutex::new(HashMap::new()),
            registry: Mutex::new(None),
            connect_states: Mutex::new(HashMap::new()),
            aggregate_stage: Mutex::new(AggregateStage::Connecting),
            links: LinkTable::new(),
            next_receiver_idx: AtomicU64::new(0),
            receiver_idx_links: Mutex::new(HashMap::new()),
        })
    }

    /// Allocates the next participant-wide receiver index (§3) and records
    /// which link it belongs to, for later `SubscriptionAcknowledge`
    /// routing.
    pub fn next_receiver_idx(&self, link: &Arc<Link>) -> ReceiverIndex {
        let idx = ReceiverIndex(self.next_receiver_idx.fetch_add(1, Ordering::Relaxed));
        self.receiver_idx_links.lock().insert(idx, link.clone());
        idx
    }

    pub fn link_for_receiver_idx(&self, idx: ReceiverIndex) -> Option<Arc<Link>> {
        self.receiver_idx_links.lock().get(&idx).cloned()
    }

    pub fn set_acceptor_uris(&self, uris: Vec<AcceptorUri>) {
        *self.acceptor_uris.lock() = uris;
    }

    pub fn local_info(&self) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: self.participant_id,
            participant_name: self.participant_name.clone(),
            acceptor_uris: self.acceptor_uris.lock().clone(),
            capabilities: self.capabilities.clone(),
            simulation_name: self.simulation_name.clone(),
        }
    }

    pub fn insert_peer(&self, peer: Arc<Peer>, info: ParticipantInfo) -> PeerId {
        let name = info.participant_name.clone();
        let mut peers = self.peers.lock();
        let key = peers.insert(PeerEntry { peer, info });
        self.by_name.lock().insert(name, PeerId(key));
        PeerId(key)
    }

    pub fn remove_peer(&self, id: PeerId) {
        let mut peers = self.peers.lock();
        if peers.contains(id.0) {
            let entry = peers.remove(id.0);
            self.by_name.lock().remove(&entry.info.participant_name);
            entry.peer.shutdown();
        }
    }

    pub fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.lock().get(id.0).map(|e| e.peer.clone())
    }

    pub fn peer_info(&self, id: PeerId) -> Option<ParticipantInfo> {
        self.peers.lock().get(id.0).map(|e| e.info.clone())
    }

    pub fn peer_id_by_name(&self, name: &str) -> Option<PeerId> {
        self.by_name.lock().get(name).copied()
    }

    pub fn peer_by_name(&self, name: &str) -> Option<Arc<Peer>> {
        let id = self.peer_id_by_name(name)?;
        self.peer(id)
    }

    pub fn all_peer_ids(&self) -> Vec<PeerId> {
        self.peers.lock().iter().map(|(k, _)| PeerId(k)).collect()
    }

    /// Stores the registry connection and also inserts it into the named
    /// peer arena under [`REGISTRY_PEER_NAME`], so proxy traffic (which is
    /// carried over this same connection) can reach it by name like any
    /// other peer.
    pub fn set_registry_peer(&self, peer: Arc<Peer>) {
        *self.registry.lock() = Some(peer.clone());
        let info = ParticipantInfo {
            participant_id: REGISTRY_PARTICIPANT_ID,
            participant_name: REGISTRY_PEER_NAME.to_string(),
            acceptor_uris: Vec::new(),
            capabilities: String::new(),
            simulation_name: self.simulation_name.clone(),
        };
        self.insert_peer(peer, info);
    }

    pub fn registry_peer(&self) -> Option<Arc<Peer>> {
        self.registry.lock().clone()
    }

    pub fn aggregate_stage(&self) -> AggregateStage {
        *self.aggregate_stage.lock()
    }

    /// Seeds a `PeerConnectState::Direct` entry per name in `targets` and
    /// moves the aggregate stage to `WaitingForAllReplies` (§4.3). Called
    /// once, right before the initial connect attempts are spawned for a
    /// freshly received `KnownParticipants` set. An empty `targets` (the
    /// first participant to join) settles immediately.
    pub fn begin_connect_attempts(&self, targets: impl Iterator<Item = String>) {
        {
            let mut states = self.connect_states.lock();
            for name in targets {
                states.insert(name, PeerConnectState::Direct);
            }
        }
        *self.aggregate_stage.lock() = AggregateStage::WaitingForAllReplies;
        self.recompute_aggregate_stage();
    }

    /// Records the outcome of a connect attempt to `name` and re-evaluates
    /// the aggregate stage.
    pub fn set_connect_state(&self, name: &str, state: PeerConnectState) {
        self.connect_states.lock().insert(name.to_string(), state);
        self.recompute_aggregate_stage();
    }

    pub fn connect_state(&self, name: &str) -> Option<PeerConnectState> {
        self.connect_states.lock().get(name).copied()
    }

    /// `true` once every target seeded by `begin_connect_attempts` has
    /// either settled at `ReplyReceived` or been marked `Failure`.
    pub fn all_replies_settled(&self) -> bool {
        self.connect_states.lock().values().all(|s| matches!(s, PeerConnectState::ReplyReceived | PeerConnectState::Failure))
    }

    fn recompute_aggregate_stage(&self) {
        let mut stage = self.aggregate_stage.lock();
        if *stage != AggregateStage::WaitingForAllReplies || !self.all_replies_settled() {
            return;
        }
        let any_failed = self.connect_states.lock().values().any(|s| matches!(s, PeerConnectState::Failure));
        *stage = if any_failed { AggregateStage::Failure } else { AggregateStage::AllRepliesReceived };
    }
}

/// Binds the configured acceptors: an OS local-domain socket (when enabled
/// and a path is given) plus ephemeral IPv4 and IPv6 TCP listeners.
pub async fn bind_acceptors(
    socket_opts: &SocketOptions,
    local_domain_path: Option<&str>,
) -> Result<(Vec<AcceptorUri>, Vec<Listener>)> {
    let mut uris = Vec::new();
    let mut listeners = Vec::new();

    if socket_opts.enable_domain_sockets {
        if let Some(path) = local_domain_path {
            let listener = Listener::bind_unix(path).await.wrapped(ErrorKind::Connection)?;
            uris.push(AcceptorUri::local(path));
            listeners.push(listener);
        }
    }

    for addr in [
        "0.0.0.0:0".parse::<SocketAddr>().unwrap(),
        "[::]:0".parse::<SocketAddr>().unwrap(),
    ] {
        let listener = match Listener::bind_tcp(addr).await {
            Ok(l) => l,
            Err(_) if addr.is_ipv6() => continue, // IPv6 may be unavailable in the host network
            Err(e) => return Err(Error::wrapped(ErrorKind::Connection, e)),
        };
        let local_addr = listener.local_addr().wrapped(ErrorKind::Connection)?;
        uris.push(AcceptorUri::from_socket_addr(local_addr));
        listeners.push(listener);
    }

    Ok((uris, listeners))
}

async fn dial_uri(uri: &AcceptorUri, socket_opts: &SocketOptions) -> Result<Socket> {
    match uri {
        AcceptorUri::Local { path } => peer::connect_unix(path).await.wrapped(ErrorKind::Connection),
        AcceptorUri::Tcp { host, port } => {
            let ip = match host {
                crate::wire::Host::V4(ip) => std::net::IpAddr::V4(*ip),
                crate::wire::Host::V6(ip) => std::net::IpAddr::V6(*ip),
                crate::wire::Host::Name(name) => tokio::net::lookup_host((name.as_str(), *port))
                    .await
                    .wrapped(ErrorKind::Connection)?
                    .next()
                    .ok_or_else(|| Error::msg(ErrorKind::Connection, "DNS resolution returned no addresses"))?
                    .ip(),
            };
            peer::connect_tcp(SocketAddr::new(ip, *port), socket_opts).await.wrapped(ErrorKind::Connection)
        }
    }
}

fn announcement_frame(info: &ParticipantInfo) -> Vec<u8> {
    wire::encode_frame(
        &Frame::Registry(RegistryFrame::ParticipantAnnouncement(ParticipantAnnouncement {
            header: RegistryMsgHeader::current(),
            info: info.clone(),
        })),
        ProtocolVersion::CURRENT,
    )
}

fn reply_frame(status: AnnouncementStatus, diagnostic: impl Into<String>) -> Vec<u8> {
    wire::encode_frame(
        &Frame::Registry(RegistryFrame::ParticipantAnnouncementReply(ParticipantAnnouncementReply {
            remote_header: RegistryMsgHeader::current(),
            status,
            diagnostic: diagnostic.into(),
        })),
        ProtocolVersion::CURRENT,
    )
}

/// Dials the registry with retry (spacing `registry_retry_interval`, up to
/// `connect_attempts` tries), announces, and waits for the reply plus the
/// `KnownParticipants` broadcast that follows it.
pub async fn connect_to_registry(
    uri: &AcceptorUri,
    local_info: &ParticipantInfo,
    socket_opts: &SocketOptions,
    timeouts: &TimeoutOptions,
) -> Result<(Socket, ParticipantAnnouncementReply, KnownParticipants)> {
    let mut sock = None;
    let mut last_err = None;
    for attempt in 0..timeouts.connect_attempts.max(1) {
        match dial_uri(uri, socket_opts).await {
            Ok(s) => {
                sock = Some(s);
                break;
            }
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < timeouts.connect_attempts {
                    tokio::time::sleep(timeouts.registry_retry_interval).await;
                }
            }
        }
    }
    let mut sock = sock.ok_or_else(|| last_err.unwrap_or_else(|| Error::msg(ErrorKind::Connection, "registry unreachable")))?;

    peer::write_framed(&mut sock, &announcement_frame(local_info)).await?;

    let reply_body = timeout(timeouts.direct_connect_timeout, peer::read_framed(&mut sock))
        .await
        .map_err(|_| Error::msg(ErrorKind::Timeout, "registry did not reply to announcement in time"))??;
    let reply = match wire::decode_frame(&reply_body, ProtocolVersion::CURRENT)? {
        Frame::Registry(RegistryFrame::ParticipantAnnouncementReply(r)) => r,
        _ => return Err(Error::msg(ErrorKind::Protocol, "expected an announcement reply")),
    };
    if matches!(reply.status, AnnouncementStatus::Failed) {
        return Err(Error::msg(ErrorKind::Configuration, format!("registry rejected announcement: {}", reply.diagnostic)));
    }

    let kp_body = timeout(timeouts.known_participants_timeout, peer::read_framed(&mut sock))
        .await
        .map_err(|_| Error::msg(ErrorKind::Timeout, "known participants not received in time"))??;
    let kp = match wire::decode_frame(&kp_body, reply.remote_header.version)? {
        Frame::Registry(RegistryFrame::KnownParticipants(kp)) => kp,
        _ => return Err(Error::msg(ErrorKind::Protocol, "expected a known-participants broadcast")),
    };

    Ok((sock, reply, kp))
}

/// Reads the first frame of a freshly accepted connection, expecting a
/// `ParticipantAnnouncement`. Used by both the registry and a plain
/// participant's direct-connect acceptor.
pub async fn accept_announcement(mut sock: Socket) -> Result<(Socket, ParticipantAnnouncement)> {
    let body = peer::read_framed(&mut sock).await?;
    match wire::decode_frame(&body, ProtocolVersion::CURRENT)? {
        Frame::Registry(RegistryFrame::ParticipantAnnouncement(ann)) => Ok((sock, ann)),
        _ => Err(Error::msg(ErrorKind::Protocol, "expected a participant announcement as the first frame")),
    }
}

pub async fn reply_announcement(mut sock: Socket, status: AnnouncementStatus, diagnostic: impl Into<String>) -> Result<Socket> {
    peer::write_framed(&mut sock, &reply_frame(status, diagnostic)).await?;
    Ok(sock)
}

/// Attempts a direct connection to `target`, in URI order (local-domain,
/// loopback TCP, routable TCP), applying `per_uri_timeout` to each attempt.
pub async fn direct_connect(
    local_info: &ParticipantInfo,
    target: &ParticipantInfo,
    socket_opts: &SocketOptions,
    per_uri_timeout: Duration,
) -> Result<(Socket, ProtocolVersion)> {
    let mut uris = target.acceptor_uris.clone();
    wire::order_for_connect_attempts(&mut uris);

    let mut last_err = None;
    for uri in &uris {
        let attempt = async {
            let mut sock = dial_uri(uri, socket_opts).await?;
            peer::write_framed(&mut sock, &announcement_frame(local_info)).await?;
            let reply_body = peer::read_framed(&mut sock).await?;
            match wire::decode_frame(&reply_body, ProtocolVersion::CURRENT)? {
                Frame::Registry(RegistryFrame::ParticipantAnnouncementReply(r))
                    if matches!(r.status, AnnouncementStatus::Success) =>
                {
                    Ok((sock, r.remote_header.version))
                }
                _ => Err(Error::msg(ErrorKind::Connection, "peer rejected direct connect")),
            }
        };
        match timeout(per_uri_timeout, attempt).await {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => last_err = Some(e),
            Err(_) => last_err = Some(Error::msg(ErrorKind::Timeout, "direct connect attempt timed out")),
        }
    }
    Err(last_err.unwrap_or_else(|| Error::msg(ErrorKind::Connection, "target advertised no acceptor URIs")))
}

/// `true` if both sides can fall back to a remote-connect request (the
/// failing side asks the registry to ask the target to dial back).
pub fn can_remote_connect(local: &ParticipantInfo, remote: &ParticipantInfo) -> bool {
    has_capability(&local.capabilities, CAPABILITY_AUTONOMOUS_SYNCHRONOUS)
        && has_capability(&remote.capabilities, CAPABILITY_AUTONOMOUS_SYNCHRONOUS)
}

/// `true` if both sides can fall back to registry-tunnelled `ProxyMessage`
/// relay.
pub fn can_proxy(local: &ParticipantInfo, remote: &ParticipantInfo) -> bool {
    has_capability(&local.capabilities, CAPABILITY_PROXY_MESSAGE) && has_capability(&remote.capabilities, CAPABILITY_PROXY_MESSAGE)
}

/// Asks the registry (reached via `registry_peer`) to relay a
/// `RemoteParticipantConnectRequest` so `target_id` dials us back.
pub fn request_remote_connect(registry_peer: &Peer, requester: &ParticipantInfo, target_id: ParticipantId) -> Result<()> {
    let req = RemoteParticipantConnectRequest {
        requester_id: requester.participant_id,
        requester_name: requester.participant_name.clone(),
        target_id,
    };
    let body = wire::encode_frame(&Frame::Registry(RegistryFrame::RemoteParticipantConnectRequest(req)), ProtocolVersion::CURRENT);
    registry_peer.send_message(body, SendKind::Direct)
}

/// Outcome of [`establish`]: either a freshly inserted direct peer, or a
/// tunnelled [`ProxyPeer`] when no direct path could be found.
pub enum Established {
    Direct(PeerId),
    Proxy(ProxyPeer),
}

/// Tries, in order, a direct connection, a remote-connect fallback (ask the
/// registry to have `target` dial us back instead), and finally a
/// registry-tunnelled proxy (§4.3). Returns as soon as one path succeeds.
///
/// A freshly dialled direct peer is inserted into `manager`'s arena and its
/// inbound frame loop is started via `dispatch` before returning. A
/// remote-connect fallback relies on `target` dialling back into this
/// process's own acceptor loop, which inserts and dispatches it the same
/// way an ordinary direct-connect acceptor would (see
/// `accept_announcement`/`reply_announcement`); `establish` only waits for
/// that arena entry to appear, bounded by `timeouts.remote_connect_timeout`.
pub async fn establish(
    manager: &Arc<ConnectionManager>,
    target: &ParticipantInfo,
    socket_opts: &SocketOptions,
    timeouts: &TimeoutOptions,
    dispatch: impl Fn(PeerId, Frame) + Send + Sync + 'static,
) -> Result<Established> {
    let local_info = manager.local_info();

    match direct_connect(&local_info, target, socket_opts, timeouts.direct_connect_timeout).await {
        Ok((sock, negotiated)) => {
            let (peer, mut inbound) = Peer::spawn(sock, negotiated, AggregationOptions::default());
            let id = manager.insert_peer(peer, target.clone());
            rt::spawn(async move {
                while let Some(frame) = inbound.recv().await {
                    dispatch(id, frame);
                }
            });
            return Ok(Established::Direct(id));
        }
        Err(e) => {
            tracing::debug!(error = %e, peer = %target.participant_name, "direct connect failed, trying fallback");
        }
    }

    if can_remote_connect(&local_info, target) {
        if let Some(registry_peer) = manager.registry_peer() {
            if request_remote_connect(&registry_peer, &local_info, target.participant_id).is_ok() {
                let deadline = tokio::time::Instant::now() + timeouts.remote_connect_timeout;
                while tokio::time::Instant::now() < deadline {
                    if let Some(id) = manager.peer_id_by_name(&target.participant_name) {
                        return Ok(Established::Direct(id));
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                tracing::debug!(peer = %target.participant_name, "remote-connect fallback timed out waiting for dial-back");
            }
        }
    }

    if can_proxy(&local_info, target) {
        let proxy = ProxyPeer::new(local_info.participant_id, target.participant_id, REGISTRY_PEER_NAME.to_string(), manager);
        return Ok(Established::Proxy(proxy));
    }

    Err(Error::msg(ErrorKind::Connection, format!("no path to participant {}", target.participant_name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(name: &str, id: u64) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: ParticipantId(id),
            participant_name: name.into(),
            acceptor_uris: vec![],
            capabilities: String::new(),
            simulation_name: "sim".into(),
        }
    }

    #[test]
    fn peer_table_round_trips_by_name_and_id() {
        // ConnectionManager construction doesn't need a runtime; peer
        // insertion does, since `Peer::spawn` requires one, so this test
        // exercises only the arena bookkeeping via a placeholder approach:
        // it's covered end-to-end in the registry/timesync integration
        // tests instead. Here we only check capability predicates and
        // connect-state defaults, which need no sockets.
        let local = sample_info("alice", 1);
        let mut remote = sample_info("bob", 2);
        assert!(!can_remote_connect(&local, &remote));
        remote.capabilities = CAPABILITY_AUTONOMOUS_SYNCHRONOUS.into();
        assert!(!can_remote_connect(&local, &remote));
    }

    #[test]
    fn remote_connect_requires_both_sides_capable() {
        let mut local = sample_info("alice", 1);
        let mut remote = sample_info("bob", 2);
        local.capabilities = CAPABILITY_AUTONOMOUS_SYNCHRONOUS.into();
        remote.capabilities = CAPABILITY_AUTONOMOUS_SYNCHRONOUS.into();
        assert!(can_remote_connect(&local, &remote));
        assert!(!can_proxy(&local, &remote));
    }

    #[test]
    fn aggregate_stage_settles_once_every_target_replies() {
        let manager = ConnectionManager::new(ParticipantId(1), "alice", "sim", "");
        assert_eq!(manager.aggregate_stage(), AggregateStage::Connecting);

        manager.begin_connect_attempts(["bob".to_string(), "carol".to_string()].into_iter());
        assert_eq!(manager.aggregate_stage(), AggregateStage::WaitingForAllReplies);
        assert_eq!(manager.connect_state("bob"), Some(PeerConnectState::Direct));
        assert!(!manager.all_replies_settled());

        manager.set_connect_state("bob", PeerConnectState::ReplyReceived);
        assert_eq!(manager.connect_state("bob"), Some(PeerConnectState::ReplyReceived));
        assert_eq!(manager.aggregate_stage(), AggregateStage::WaitingForAllReplies);

        manager.set_connect_state("carol", PeerConnectState::ReplyReceived);
        assert!(manager.all_replies_settled());
        assert_eq!(manager.aggregate_stage(), AggregateStage::AllRepliesReceived);
    }

    #[test]
    fn aggregate_stage_fails_when_any_target_fails() {
        let manager = ConnectionManager::new(ParticipantId(1), "alice", "sim", "");
        manager.begin_connect_attempts(["bob".to_string()].into_iter());
        manager.set_connect_state("bob", PeerConnectState::Failure);
        assert_eq!(manager.aggregate_stage(), AggregateStage::Failure);
    }

    #[test]
    fn aggregate_stage_settles_immediately_with_no_known_peers() {
        let manager = ConnectionManager::new(ParticipantId(1), "alice", "sim", "");
        manager.begin_connect_attempts(std::iter::empty());
        assert_eq!(manager.aggregate_stage(), AggregateStage::AllRepliesReceived);
    }
}
