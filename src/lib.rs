//! Participant runtime for a distributed co-simulation middleware:
//! connection establishment, the lifecycle state machine, and virtual-time
//! barrier synchronization, unified behind one [`Participant`] facade (§1,
//! §2).
//!
//! The building blocks (`wire`, `peer`, `connection`, `lifecycle`,
//! `timesync`, `registry`) are usable on their own; a hosting executable
//! that only needs the registry process links against `registry` alone.

pub mod async_runtime;
pub mod config;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod timesync;
pub mod wire;

#[cfg(not(feature = "expose_impl"))]
mod peer;
#[cfg(feature = "expose_impl")]
pub mod peer;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::async_runtime as rt;
use crate::config::ParticipantConfig;
use crate::connection::{AggregateStage, ConnectionManager, Established, Link, PeerConnectState, PeerId};
use crate::error::{Error, ErrorKind, Result};
use crate::lifecycle::{Event, GatedEvent, Lifecycle, OperationMode, ParticipantState, SystemState};
use crate::peer::{Listener, Peer, SendKind, Socket};
use crate::timesync::TimeConfiguration;
use crate::wire::{
    self, AcceptorUri, AnnouncementStatus, EndpointAddress, Frame, KnownParticipants, ParticipantId,
    ParticipantInfo, ParticipantStatus, ReceiverIndex, RegistryFrame, CAPABILITY_VIRTUAL_TIME_SYNC,
};

type ReceiverHandler = Arc<dyn Fn(EndpointAddress, Vec<u8>) + Send + Sync>;

/// One joined participant process: owns its connection arena, lifecycle
/// state machine, and (when running virtual time) barrier synchronizer.
pub struct Participant {
    pub connections: Arc<ConnectionManager>,
    pub lifecycle: Arc<Lifecycle>,
    pub time: Option<Arc<TimeConfiguration>>,
    socket_opts: crate::config::SocketOptions,
    timeouts: crate::config::TimeoutOptions,
    receiver_handlers: Mutex<HashMap<ReceiverIndex, ReceiverHandler>>,
    /// Status reports observed from every participant, including this one,
    /// mirrored from the registry's rebroadcasts. The wire-level source of
    /// truth for `lifecycle`'s typed `SystemState`; every insertion here is
    /// immediately mirrored into `lifecycle.observe_system_state` (§3).
    system_state: Mutex<HashMap<String, ParticipantStatus>>,
}

impl Participant {
    /// Joins `simulation_name` as `participant_name`: binds acceptors,
    /// announces to the registry at `registry_uri`, waits for the
    /// `KnownParticipants` broadcast, and establishes a connection to every
    /// peer already in the simulation (§4.3). `time_step`, when given, turns
    /// this into a virtual-time-synchronized participant (§4.6),
    /// automatically advertising [`CAPABILITY_VIRTUAL_TIME_SYNC`].
    ///
    /// `operation_mode` governs whether this participant's milestone-driven
    /// lifecycle edges fire the moment its own preconditions are met
    /// (`Autonomous`) or only once every participant named in
    /// `Coordinated`'s `required_participants` is observed at the same
    /// originating state (§3, invariant 4). A coordinated participant whose
    /// own name is absent from its required set is a configuration error.
    ///
    /// Must be called from within an already-entered Tokio runtime; this
    /// crate never builds one for itself (`async_runtime::build` is for the
    /// hosting executable).
    pub async fn join(
        simulation_name: impl Into<String>,
        participant_name: impl Into<String>,
        registry_uri: &AcceptorUri,
        mut capabilities: Vec<String>,
        config: ParticipantConfig,
        operation_mode: OperationMode,
        local_domain_path: Option<&str>,
        time_step: Option<(Duration, f64)>,
    ) -> Result<Arc<Participant>> {
        let simulation_name = simulation_name.into();
        let participant_name = participant_name.into();
        if let OperationMode::Coordinated { required_participants } = &operation_mode {
            if !required_participants.contains(&participant_name) {
                return Err(Error::msg(
                    ErrorKind::Configuration,
                    "coordinated participant is not a member of its own required set",
                ));
            }
        }
        let uses_virtual_time = time_step.is_some();
        if uses_virtual_time {
            capabilities.push(CAPABILITY_VIRTUAL_TIME_SYNC.to_string());
        }
        let capabilities = capabilities.join(",");

        let (uris, listeners) = connection::bind_acceptors(&config.socket, local_domain_path).await?;

        let manager = ConnectionManager::new(
            ParticipantId(hash_participant_name(&participant_name)),
            participant_name,
            simulation_name,
            capabilities,
        );
        manager.set_acceptor_uris(uris);

        let (sock, reply, kp) =
            connection::connect_to_registry(registry_uri, &manager.local_info(), &config.socket, &config.timeouts).await?;
        let (registry_peer, registry_inbound) =
            Peer::spawn(sock, reply.remote_header.version, config.aggregation.clone());
        manager.set_registry_peer(registry_peer);

        let time = time_step.map(|(step_size, animation_factor)| {
            let mgr = manager.clone();
            TimeConfiguration::new(step_size, animation_factor, move |task, peers| {
                broadcast_next_sim_task(&mgr, task, peers)
            })
        });

        let participant = Arc::new(Participant {
            connections: manager,
            lifecycle: Lifecycle::new(uses_virtual_time, operation_mode),
            time,
            socket_opts: config.socket,
            timeouts: config.timeouts,
            receiver_handlers: Mutex::new(HashMap::new()),
            system_state: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&participant);
        participant.lifecycle.set_on_transition(move |state| {
            if let Some(p) = weak.upgrade() {
                p.report_status(state, String::new());
            }
        });

        for listener in listeners {
            let this = participant.clone();
            rt::spawn(async move { this.accept_loop(listener).await });
        }
        {
            let this = participant.clone();
            rt::spawn(async move { this.registry_dispatch_loop(registry_inbound).await });
        }

        let peer_infos: Vec<_> =
            kp.peer_infos.into_iter().filter(|info| info.participant_name != participant.connections.participant_name).collect();
        participant.connections.begin_connect_attempts(peer_infos.iter().map(|info| info.participant_name.clone()));

        let mut handles = Vec::new();
        for info in peer_infos {
            let this = participant.clone();
            handles.push(rt::spawn(async move { this.connect_peer(info).await }));
        }
        for h in handles {
            let _ = h.await;
        }

        // Only at `AllRepliesReceived` does the local lifecycle leave
        // `Invalid` (§4.3); a participant that never heard back from
        // everyone in `KnownParticipants` reports an error instead.
        match participant.connections.aggregate_stage() {
            AggregateStage::AllRepliesReceived => {
                participant.lifecycle.dispatch(Event::Start);
                participant.lifecycle.advance(GatedEvent::AllParticipantsReplied);
            }
            AggregateStage::Failure => {
                let diagnostic = "one or more known participants could not be reached";
                participant.lifecycle.dispatch(Event::ReportError(diagnostic.to_string()));
                return Err(Error::msg(ErrorKind::Connection, diagnostic));
            }
            other => unreachable!("aggregate connect stage left unsettled after every connect attempt finished: {other:?}"),
        }

        Ok(participant)
    }

    /// Declares a local receiver for `(serdes_name, network_name)` and
    /// registers `handler` to be invoked with every payload subsequently
    /// received on it (§4.4).
    pub fn subscribe(
        self: &Arc<Self>,
        serdes_name: &str,
        network_name: &str,
        version: u32,
        history_len: u8,
        handler: impl Fn(EndpointAddress, Vec<u8>) + Send + Sync + 'static,
    ) -> Arc<Link> {
        let (link, idx) = connection::subscribe::subscribe(&self.connections, serdes_name, network_name, version, history_len);
        self.receiver_handlers.lock().insert(idx, Arc::new(handler));
        link
    }

    /// Publishes `payload` on `link`, addressed as coming from this
    /// participant.
    pub fn publish(&self, link: &Link, payload: Vec<u8>) {
        let source = EndpointAddress { participant_id: self.connections.participant_id, endpoint_id: 0 };
        connection::subscribe::publish(&self.connections, link, source, payload);
    }

    /// Builds and sends a `ParticipantStatus` report to the registry,
    /// updating the locally mirrored `system_state` first so a caller never
    /// observes its own state lag behind what it just sent.
    pub fn report_status(&self, state: ParticipantState, enter_reason: String) {
        let now = now_us();
        let status = ParticipantStatus {
            participant_name: self.connections.participant_name.clone(),
            state: state.as_wire_code(),
            enter_reason,
            enter_time_us_since_epoch: now,
            refresh_time_us_since_epoch: now,
        };
        self.system_state.lock().insert(status.participant_name.clone(), status.clone());
        self.refresh_lifecycle_system_state();
        if let Some(registry_peer) = self.connections.registry_peer() {
            let body = wire::encode_frame(
                &Frame::SimMsg {
                    receiver_idx: registry::STATUS_RECEIVER_IDX,
                    source: EndpointAddress { participant_id: self.connections.participant_id, endpoint_id: 0 },
                    payload: status.encode(),
                },
                registry_peer.negotiated_version(),
            );
            let _ = registry_peer.send_message(body, SendKind::FlushAggregation);
        }
    }

    /// Every status report observed so far, this participant's own included
    /// (§3's `SystemState`, wire-level view).
    pub fn system_state(&self) -> HashMap<String, ParticipantStatus> {
        self.system_state.lock().clone()
    }

    /// Rebuilds the typed `lifecycle::SystemState` from the raw status
    /// reports mirrored so far and feeds it to the lifecycle, releasing any
    /// pending coordinated edge it now satisfies (§3, invariant 4). Reports
    /// with an unrecognized wire code are skipped rather than blocking the
    /// whole aggregation on one bad peer.
    fn refresh_lifecycle_system_state(&self) {
        let states = self
            .system_state
            .lock()
            .iter()
            .filter_map(|(name, status)| {
                ParticipantState::from_wire_code(status.state).map(|s| (name.clone(), s))
            })
            .collect();
        self.lifecycle.observe_system_state(SystemState::new(states));
    }

    pub fn state(&self) -> ParticipantState {
        self.lifecycle.state()
    }

    pub fn pause(&self, reason: impl Into<String>) {
        self.lifecycle.dispatch(Event::Pause(reason.into()));
    }

    pub fn resume(&self) {
        self.lifecycle.dispatch(Event::Continue);
    }

    pub fn stop(&self, reason: impl Into<String>) {
        self.lifecycle.dispatch(Event::Stop(reason.into()));
    }

    pub fn abort(&self) {
        self.lifecycle.dispatch(Event::AbortSimulation);
    }

    /// Runs one barrier-gated step with a synchronous handler. A no-op if
    /// this participant wasn't joined with `time_step`.
    pub async fn run_synchronous_step(&self, handler: impl FnOnce(i64, i64)) {
        if let Some(time) = &self.time {
            time.run_synchronous_step(handler).await;
        }
    }

    /// Runs one barrier-gated step with an asynchronous handler. A no-op if
    /// this participant wasn't joined with `time_step`.
    pub async fn run_asynchronous_step(&self, handler: impl FnOnce(i64, i64)) {
        if let Some(time) = &self.time {
            time.run_asynchronous_step(handler).await;
        }
    }

    pub fn complete_simulation_step(&self) {
        if let Some(time) = &self.time {
            time.complete_simulation_step();
        }
    }

    pub fn add_other_simulation_steps_completed_handler(&self, cb: impl FnMut() + Send + 'static) {
        if let Some(time) = &self.time {
            time.add_other_simulation_steps_completed_handler(cb);
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        loop {
            match listener.accept().await {
                Ok((socket, _remote_addr)) => {
                    let this = self.clone();
                    rt::spawn(async move { this.handle_inbound_connect(socket).await });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "participant listener accept failed, stopping");
                    return;
                }
            }
        }
    }

    async fn handle_inbound_connect(self: Arc<Self>, socket: Socket) {
        let (socket, ann) = match connection::accept_announcement(socket).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting malformed inbound announcement");
                return;
            }
        };
        if ann.info.simulation_name != self.connections.simulation_name {
            let diagnostic = format!("simulation mismatch: this participant joined {}", self.connections.simulation_name);
            let _ = connection::reply_announcement(socket, AnnouncementStatus::Failed, diagnostic).await;
            return;
        }
        let socket = match connection::reply_announcement(socket, AnnouncementStatus::Success, "").await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to reply to inbound announcement");
                return;
            }
        };

        let (peer, mut inbound) = Peer::spawn(socket, wire::ProtocolVersion::CURRENT, crate::config::AggregationOptions::default());
        let id = self.connections.insert_peer(peer, ann.info);
        while let Some(frame) = inbound.recv().await {
            self.clone().dispatch_frame(id, frame);
        }
    }

    async fn registry_dispatch_loop(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Frame>) {
        let Some(registry_id) = self.connections.peer_id_by_name(connection::REGISTRY_PEER_NAME) else {
            tracing::error!("registry connection missing from the peer arena, dropping its inbound traffic");
            return;
        };
        while let Some(frame) = inbound.recv().await {
            self.clone().dispatch_frame(registry_id, frame);
        }
    }

    /// Establishes a connection to `target` (direct, remote-connect
    /// fallback, or proxy) and, if both sides run virtual time, adds it as a
    /// synchronized peer. Used both for the initial `KnownParticipants` set
    /// and for participants who join later (§4.3, §4.6).
    async fn connect_peer(self: Arc<Self>, target: ParticipantInfo) {
        let synchronized = self.time.is_some() && wire::has_capability(&target.capabilities, CAPABILITY_VIRTUAL_TIME_SYNC);
        let name = target.participant_name.clone();
        let this = self.clone();
        let result = connection::establish(&self.connections, &target, &self.socket_opts, &self.timeouts, move |id, frame| {
            this.clone().dispatch_frame(id, frame);
        })
        .await;

        match result {
            Ok(Established::Direct(_)) | Ok(Established::Proxy(_)) => {
                self.connections.set_connect_state(&name, PeerConnectState::ReplyReceived);
                if synchronized {
                    if let Some(time) = &self.time {
                        time.add_synchronized_peer(name);
                    }
                }
            }
            Err(e) => {
                self.connections.set_connect_state(&name, PeerConnectState::Failure);
                tracing::warn!(error = %e, peer = %name, "failed to establish a connection to a known participant");
            }
        }
    }

    /// Connects to every participant in a `KnownParticipants` broadcast that
    /// isn't already known, i.e. dynamic membership after the initial join
    /// (§4.6 dynamic membership).
    async fn connect_to_new_peers(self: Arc<Self>, kp: KnownParticipants) {
        for info in kp.peer_infos {
            if info.participant_name == self.connections.participant_name {
                continue;
            }
            if self.connections.peer_id_by_name(&info.participant_name).is_some() {
                continue;
            }
            let this = self.clone();
            rt::spawn(async move { this.connect_peer(info).await });
        }
    }

    fn dispatch_frame(self: Arc<Self>, from: PeerId, frame: Frame) {
        match frame {
            Frame::MwMsg { receiver_idx, payload, .. } if receiver_idx == timesync::NEXT_SIM_TASK_RECEIVER_IDX => {
                let Some(time) = self.time.clone() else {
                    tracing::debug!("received a NextSimTask but this participant runs no time configuration");
                    return;
                };
                match wire::NextSimTask::decode(&payload) {
                    Ok(task) => {
                        let peer_name = self.connections.peer_info(from).map(|i| i.participant_name).unwrap_or_default();
                        time.on_next_sim_task(&peer_name, task);
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping a malformed NextSimTask"),
                }
            }
            Frame::SimMsg { receiver_idx, payload, .. } if receiver_idx == registry::STATUS_RECEIVER_IDX => {
                match ParticipantStatus::decode(&payload) {
                    Ok(status) => {
                        self.system_state.lock().insert(status.participant_name.clone(), status);
                        self.refresh_lifecycle_system_state();
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping a malformed participant status report"),
                }
            }
            Frame::SimMsg { receiver_idx, source, payload } => {
                let handler = self.receiver_handlers.lock().get(&receiver_idx).cloned();
                match handler {
                    Some(cb) => cb(source, payload),
                    None => tracing::debug!(receiver_idx = receiver_idx.0, "no handler registered for this receiver index"),
                }
            }
            Frame::SubscriptionAnnouncement(ann) => {
                let local_source = EndpointAddress { participant_id: self.connections.participant_id, endpoint_id: 0 };
                connection::subscribe::handle_announcement(&self.connections, from, local_source, ann);
            }
            Frame::SubscriptionAcknowledge(ack) => {
                connection::subscribe::handle_acknowledge(&self.connections, from, ack);
            }
            Frame::Registry(RegistryFrame::KnownParticipants(kp)) => {
                rt::spawn(async move { self.connect_to_new_peers(kp).await });
            }
            other => {
                tracing::debug!(?other, "participant ignoring unexpected frame kind");
            }
        }
    }
}

fn broadcast_next_sim_task(manager: &Arc<ConnectionManager>, task: wire::NextSimTask, peers: &[String]) {
    let source = EndpointAddress { participant_id: manager.participant_id, endpoint_id: 0 };
    let payload = task.encode();
    for name in peers {
        if let Some(peer) = manager.peer_by_name(name) {
            let body = wire::encode_frame(
                &Frame::MwMsg { receiver_idx: timesync::NEXT_SIM_TASK_RECEIVER_IDX, source, payload: payload.clone() },
                peer.negotiated_version(),
            );
            let _ = peer.send_message(body, SendKind::FlushAggregation);
        }
    }
}

fn now_us() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as i64).unwrap_or(0)
}

/// Derives a stable `ParticipantId` from a participant's name (FNV-1a), so a
/// reconnecting participant keeps the same id across process restarts
/// without any external id-allocation service.
fn hash_participant_name(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in name.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_participant_name_is_deterministic_and_name_sensitive() {
        assert_eq!(hash_participant_name("alice"), hash_participant_name("alice"));
        assert_ne!(hash_participant_name("alice"), hash_participant_name("bob"));
    }
}
