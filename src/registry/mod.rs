//! The registry process: accepts announcements, computes and broadcasts
//! `KnownParticipants`, relays remote-connect/proxy traffic, and aggregates
//! `ParticipantStatus` (§4.7).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::async_runtime as rt;
use crate::config::{AggregationOptions, SocketOptions};
use crate::connection::{self, ConnectionManager, PeerId};
use crate::peer::{Listener, Peer, SendKind, Socket};
use crate::wire::{
    self, AnnouncementStatus, EndpointAddress, Frame, KnownParticipants, ParticipantId,
    ParticipantInfo, ParticipantStatus, ProtocolVersion, ProxyMessageHeader, ReceiverIndex,
    RegistryFrame, RemoteParticipantConnectRequest, REGISTRY_PARTICIPANT_ID,
};

/// Receiver index participants send `ParticipantStatus` reports to. Unlike
/// the general link/subscription model (§4.4), status reporting addresses
/// the registry on a fixed, well-known index rather than one negotiated
/// through a `SubscriptionAnnouncement` handshake.
pub const STATUS_RECEIVER_IDX: ReceiverIndex = ReceiverIndex(0);

struct RegistryState {
    remote_addrs: HashMap<PeerId, SocketAddr>,
    id_to_name: HashMap<ParticipantId, String>,
    system_state: HashMap<String, ParticipantStatus>,
}

/// Owns one simulation's registry state. Built on the same
/// [`ConnectionManager`] arena a participant uses, since the registry is
/// itself just a peer that never dials out.
pub struct Registry {
    simulation_name: String,
    manager: Arc<ConnectionManager>,
    state: Mutex<RegistryState>,
}

impl Registry {
    pub fn new(simulation_name: impl Into<String>) -> Arc<Self> {
        let simulation_name = simulation_name.into();
        Arc::new(Registry {
            manager: ConnectionManager::new(REGISTRY_PARTICIPANT_ID, "registry", simulation_name.clone(), ""),
            simulation_name,
            state: Mutex::new(RegistryState {
                remote_addrs: HashMap::new(),
                id_to_name: HashMap::new(),
                system_state: HashMap::new(),
            }),
        })
    }

    pub fn system_state(&self) -> HashMap<String, ParticipantStatus> {
        self.state.lock().system_state.clone()
    }

    /// Drives every listener's accept loop until it errors out. Each
    /// accepted connection is handled on its own spawned task.
    pub async fn run(self: Arc<Self>, listeners: Vec<Listener>, socket_opts: SocketOptions) {
        let mut handles = Vec::new();
        for listener in listeners {
            let this = self.clone();
            let opts = socket_opts.clone();
            handles.push(rt::spawn(async move { this.accept_loop(listener, opts).await }));
        }
        for h in handles {
            let _ = h.await;
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener, socket_opts: SocketOptions) {
        loop {
            match listener.accept().await {
                Ok((socket, remote_addr)) => {
                    let this = self.clone();
                    rt::spawn(async move { this.handle_connection(socket, remote_addr, socket_opts.clone()).await });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "registry listener accept failed, stopping");
                    return;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: Socket, remote_addr: Option<SocketAddr>, _socket_opts: SocketOptions) {
        let (socket, ann) = match connection::accept_announcement(socket).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting malformed announcement");
                return;
            }
        };

        if ann.info.simulation_name != self.simulation_name {
            let diagnostic = format!("simulation mismatch: registry serves {}", self.simulation_name);
            let _ = connection::reply_announcement(socket, AnnouncementStatus::Failed, diagnostic).await;
            return;
        }
        if self.manager.peer_id_by_name(&ann.info.participant_name).is_some() {
            let diagnostic = format!("participant name {} already connected", ann.info.participant_name);
            let _ = connection::reply_announcement(socket, AnnouncementStatus::Failed, diagnostic).await;
            return;
        }

        let socket = match connection::reply_announcement(socket, AnnouncementStatus::Success, "").await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to send announcement reply");
                return;
            }
        };

        let (peer, inbound) = Peer::spawn(socket, ProtocolVersion::CURRENT, AggregationOptions::default());
        let peer_id = self.manager.insert_peer(peer, ann.info.clone());
        {
            let mut state = self.state.lock();
            let addr = remote_addr.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
            state.remote_addrs.insert(peer_id, addr);
            state.id_to_name.insert(ann.info.participant_id, ann.info.participant_name.clone());
        }

        self.broadcast_known_participants();
        self.peer_reader(peer_id, inbound).await;
    }

    fn broadcast_known_participants(&self) {
        let ids = self.manager.all_peer_ids();
        let infos: Vec<(PeerId, ParticipantInfo)> =
            ids.into_iter().filter_map(|id| self.manager.peer_info(id).map(|info| (id, info))).collect();
        let remote_addrs = self.state.lock().remote_addrs.clone();

        for &(audience_id, _) in &infos {
            let kp = compute_known_participants(audience_id, &infos, &remote_addrs);
            let body = wire::encode_frame(&Frame::Registry(RegistryFrame::KnownParticipants(kp)), ProtocolVersion::CURRENT);
            if let Some(peer) = self.manager.peer(audience_id) {
                if let Err(e) = peer.send_message(body, SendKind::Direct) {
                    tracing::warn!(error = %e, "failed to broadcast known participants");
                }
            }
        }
    }

    async fn peer_reader(self: Arc<Self>, peer_id: PeerId, mut inbound: mpsc::UnboundedReceiver<Frame>) {
        while let Some(frame) = inbound.recv().await {
            match frame {
                Frame::Registry(RegistryFrame::RemoteParticipantConnectRequest(req)) => {
                    self.relay_remote_connect(req);
                }
                Frame::Proxy { header, payload } => {
                    self.relay_proxy(header, payload);
                }
                Frame::SimMsg { receiver_idx, source, payload } if receiver_idx == STATUS_RECEIVER_IDX => {
                    self.handle_status_report(source, payload);
                }
                other => {
                    tracing::debug!(?other, "registry ignoring unexpected frame kind from peer");
                }
            }
        }
        self.handle_disconnect(peer_id);
    }

    fn relay_remote_connect(&self, req: RemoteParticipantConnectRequest) {
        let target_name = self.state.lock().id_to_name.get(&req.target_id).cloned();
        let Some(target_name) = target_name else {
            tracing::warn!(target = req.target_id.0, "remote-connect target unknown to registry");
            return;
        };
        let Some(target_peer) = self.manager.peer_by_name(&target_name) else {
            tracing::warn!(target = %target_name, "remote-connect target no longer connected");
            return;
        };
        let body =
            wire::encode_frame(&Frame::Registry(RegistryFrame::RemoteParticipantConnectRequest(req)), ProtocolVersion::CURRENT);
        if let Err(e) = target_peer.send_message(body, SendKind::Direct) {
            tracing::warn!(error = %e, "failed to relay remote-connect request");
        }
    }

    fn relay_proxy(&self, header: ProxyMessageHeader, payload: Vec<u8>) {
        let target_name = self.state.lock().id_to_name.get(&header.destination).cloned();
        let Some(target_name) = target_name else {
            tracing::warn!(destination = header.destination.0, "proxy destination unknown, dropping message");
            return;
        };
        let Some(target_peer) = self.manager.peer_by_name(&target_name) else {
            tracing::warn!(destination = %target_name, "proxy destination disconnected, dropping message");
            return;
        };
        let body = wire::encode_frame(&Frame::Proxy { header, payload }, ProtocolVersion::CURRENT);
        if let Err(e) = target_peer.send_message(body, SendKind::Direct) {
            tracing::warn!(error = %e, "failed to relay proxy message");
        }
    }

    fn handle_status_report(&self, source: EndpointAddress, payload: Vec<u8>) {
        let status = match ParticipantStatus::decode(&payload) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed participant status report");
                return;
            }
        };
        self.state.lock().system_state.insert(status.participant_name.clone(), status.clone());
        self.broadcast_status(&status, source.participant_id);
    }

    fn broadcast_status(&self, status: &ParticipantStatus, exclude: ParticipantId) {
        let body = wire::encode_frame(
            &Frame::SimMsg {
                receiver_idx: STATUS_RECEIVER_IDX,
                source: EndpointAddress { participant_id: REGISTRY_PARTICIPANT_ID, endpoint_id: 0 },
                payload: status.encode(),
            },
            ProtocolVersion::CURRENT,
        );
        for id in self.manager.all_peer_ids() {
            if self.manager.peer_info(id).map(|i| i.participant_id) == Some(exclude) {
                continue;
            }
            if let Some(peer) = self.manager.peer(id) {
                let _ = peer.send_message(body.clone(), SendKind::FlushAggregation);
            }
        }
    }

    /// Teardown fan-out: drops the peer from the arena, then re-broadcasts
    /// `KnownParticipants` (now excluding it) to every remaining peer,
    /// which is how proxied partners and monitors alike learn it's gone.
    fn handle_disconnect(&self, peer_id: PeerId) {
        let departed = self.manager.peer_info(peer_id);
        self.manager.remove_peer(peer_id);
        {
            let mut state = self.state.lock();
            state.remote_addrs.remove(&peer_id);
            if let Some(ref info) = departed {
                state.id_to_name.remove(&info.participant_id);
                state.system_state.remove(&info.participant_name);
            }
        }
        if let Some(info) = departed {
            tracing::info!(participant = %info.participant_name, "participant disconnected, tearing down");
        }
        self.broadcast_known_participants();
    }
}

/// Computes the `KnownParticipants` list `audience_id` should receive:
/// every other connected peer, with wildcard acceptor URIs rewritten
/// relative to each advertiser's observed remote address.
fn compute_known_participants(
    audience_id: PeerId,
    infos: &[(PeerId, ParticipantInfo)],
    remote_addrs: &HashMap<PeerId, SocketAddr>,
) -> KnownParticipants {
    let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
    let audience_local = remote_addrs.get(&audience_id).copied().unwrap_or(unspecified);

    let peer_infos = infos
        .iter()
        .filter(|(id, _)| *id != audience_id)
        .map(|(id, info)| {
            let advertiser_remote = remote_addrs.get(id).copied().unwrap_or(unspecified);
            let mut info = info.clone();
            info.acceptor_uris = wire::uri::transform_for_audience(&info.acceptor_uris, advertiser_remote, audience_local);
            info
        })
        .collect();

    KnownParticipants { peer_infos }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::AcceptorUri;

    fn sample_info(name: &str, id: u64) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: ParticipantId(id),
            participant_name: name.into(),
            acceptor_uris: vec![AcceptorUri::parse("tcp://0.0.0.0:7500").unwrap()],
            capabilities: String::new(),
            simulation_name: "sim".into(),
        }
    }

    #[test]
    fn known_participants_excludes_the_audience_itself() {
        let infos = vec![
            (PeerId::for_test(0), sample_info("alice", 1)),
            (PeerId::for_test(1), sample_info("bob", 2)),
        ];
        let remote_addrs = HashMap::new();
        let kp = compute_known_participants(PeerId::for_test(0), &infos, &remote_addrs);
        assert_eq!(kp.peer_infos.len(), 1);
        assert_eq!(kp.peer_infos[0].participant_name, "bob");
    }

    #[tokio::test]
    async fn status_report_updates_system_state_and_broadcasts_to_others() {
        let registry = Registry::new("sim");

        // The counterpart ends are dropped immediately: this test only
        // checks `Registry`'s own bookkeeping, not bytes actually crossing
        // the wire, so a live peer on the other end isn't needed.
        let (_a_remote_end, a_local_end) = tokio::net::UnixStream::pair().unwrap();
        let (reporter, _reporter_inbound) =
            Peer::spawn(Socket::Unix(a_local_end), ProtocolVersion::CURRENT, AggregationOptions::default());
        registry.manager.insert_peer(reporter, sample_info("alice", 1));
        registry.state.lock().id_to_name.insert(ParticipantId(1), "alice".into());

        let (_b_remote_end, b_local_end) = tokio::net::UnixStream::pair().unwrap();
        let (observer, _observer_inbound) =
            Peer::spawn(Socket::Unix(b_local_end), ProtocolVersion::CURRENT, AggregationOptions::default());
        registry.manager.insert_peer(observer, sample_info("bob", 2));
        registry.state.lock().id_to_name.insert(ParticipantId(2), "bob".into());

        let status = ParticipantStatus {
            participant_name: "alice".into(),
            state: 5,
            enter_reason: "running".into(),
            enter_time_us_since_epoch: 0,
            refresh_time_us_since_epoch: 0,
        };
        registry.handle_status_report(EndpointAddress { participant_id: ParticipantId(1), endpoint_id: 0 }, status.encode());

        let seen = registry.system_state();
        assert_eq!(seen.get("alice").unwrap().state, 5);
    }
}
