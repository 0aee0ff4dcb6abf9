//! Per-topic `Link` table: local/remote receiver bookkeeping and the
//! synchronous/asynchronous subscription-acknowledgement protocol (§4.4).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::wire::ReceiverIndex;

use super::PeerId;

/// A receiver attached to a link, either local (a service in this process)
/// or remote (a `(peer, receiverIdx)` pair on the other end of a wire).
struct LinkState {
    last_message: Option<Vec<u8>>,
    local_receivers: Vec<ReceiverIndex>,
    /// `(peer, receiverIdx, negotiatedVersion)`: the serdes version both
    /// ends agreed to use for messages flowing to this remote receiver
    /// (§4.2/§4.4: the lower of the local and remote `version`).
    remote_receivers: Vec<(PeerId, ReceiverIndex, u32)>,
    pending_acks: HashSet<(PeerId, ReceiverIndex)>,
    /// The serdes version this process declared when it last called
    /// `subscribe()` on this link. `None` until a local receiver exists.
    local_version: Option<u32>,
}

/// `Link(serdesName, networkName)`: the unit of typed pub/sub routing.
pub struct Link {
    pub serdes_name: String,
    pub network_name: String,
    /// `0` or `1`; `1` replays the last sent message to a newly attached
    /// remote receiver.
    pub history_len: u8,
    state: Mutex<LinkState>,
    acks_done: Notify,
}

impl Link {
    fn new(serdes_name: String, network_name: String, history_len: u8) -> Self {
        Link {
            serdes_name,
            network_name,
            history_len,
            state: Mutex::new(LinkState {
                last_message: None,
                local_receivers: Vec::new(),
                remote_receivers: Vec::new(),
                pending_acks: HashSet::new(),
                local_version: None,
            }),
            acks_done: Notify::new(),
        }
    }

    /// Attaches a local service as a receiver under `idx`, allocated by the
    /// owning `ConnectionManager`'s participant-wide counter (§3:
    /// `receiverIndex` is locally assigned, monotonically growing across
    /// every link in the process, not just this one).
    pub fn add_local_receiver(&self, idx: ReceiverIndex) {
        self.state.lock().local_receivers.push(idx);
    }

    pub fn local_receivers(&self) -> Vec<ReceiverIndex> {
        self.state.lock().local_receivers.clone()
    }

    /// Records the serdes version this process subscribed with on this
    /// link, for use by [`Link::negotiate`].
    pub fn declare_local_version(&self, version: u32) {
        self.state.lock().local_version = Some(version);
    }

    /// The lower of `remote_version` and this side's own declared version
    /// (§4.2/§4.4). Falls back to `remote_version` alone when this side has
    /// no local receiver yet (pure relay/publish-only participant).
    pub fn negotiate(&self, remote_version: u32) -> u32 {
        match self.state.lock().local_version {
            Some(local) => local.min(remote_version),
            None => remote_version,
        }
    }

    /// Registers a pending `SubscriptionAnnouncement` sent to `peer`,
    /// ahead of receiving its acknowledgement.
    pub fn mark_pending_ack(&self, peer: PeerId, idx: ReceiverIndex) {
        self.state.lock().pending_acks.insert((peer, idx));
    }

    /// Records a subscription acknowledgement (success or failure) from
    /// `peer`, carrying the version `peer` negotiated for this link on its
    /// own side. Always removes the pending entry, even on failure, so a
    /// synchronous registration never stalls. Returns `true` once every
    /// pending acknowledgement for this link has been resolved.
    pub fn record_ack(&self, peer: PeerId, idx: ReceiverIndex, success: bool, negotiated_version: u32) -> bool {
        let mut state = self.state.lock();
        state.pending_acks.remove(&(peer, idx));
        if success {
            state.remote_receivers.push((peer, idx, negotiated_version));
        }
        let done = state.pending_acks.is_empty();
        drop(state);
        if done {
            self.acks_done.notify_waiters();
        }
        done
    }

    /// Blocks (the calling task, not the executor thread) until every
    /// pending acknowledgement for this link has resolved. Used by
    /// synchronously-declared service registration.
    pub async fn wait_for_acks(&self) {
        loop {
            if self.state.lock().pending_acks.is_empty() {
                return;
            }
            self.acks_done.notified().await;
        }
    }

    /// Adds `(peer, idx)` as a remote receiver outside the ack path (used
    /// when the remote side is the one sending us a `SubscriptionAnnouncement`
    /// rather than us tracking its ack of ours), at `negotiated_version`
    /// (the lower of the two sides' declared versions, see
    /// [`Link::negotiate`]). Returns the replay payload when `history_len ==
    /// 1` and a prior message exists.
    pub fn add_remote_receiver(&self, peer: PeerId, idx: ReceiverIndex, negotiated_version: u32) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        state.remote_receivers.push((peer, idx, negotiated_version));
        if self.history_len == 1 {
            state.last_message.clone()
        } else {
            None
        }
    }

    /// `(peer, receiverIdx, negotiatedVersion)` for every remote receiver
    /// currently attached to this link.
    pub fn remote_receivers(&self) -> Vec<(PeerId, ReceiverIndex, u32)> {
        self.state.lock().remote_receivers.clone()
    }

    /// The serdes version negotiated with `peer` for `idx`, if it's a known
    /// remote receiver on this link.
    pub fn negotiated_version(&self, peer: PeerId, idx: ReceiverIndex) -> Option<u32> {
        self.state.lock().remote_receivers.iter().find(|(p, i, _)| *p == peer && *i == idx).map(|(_, _, v)| *v)
    }

    /// Records `payload` as the link's retained message when history is
    /// enabled. Call once per outgoing send, before dispatch.
    pub fn record_sent(&self, payload: &[u8]) {
        if self.history_len == 1 {
            self.state.lock().last_message = Some(payload.to_vec());
        }
    }
}

/// Keyed table of every link known to a connection, created lazily on
/// first local or remote reference.
pub struct LinkTable {
    links: Mutex<HashMap<(String, String), Arc<Link>>>,
}

impl LinkTable {
    pub fn new() -> Self {
        LinkTable { links: Mutex::new(HashMap::new()) }
    }

    pub fn get_or_create(&self, serdes_name: &str, network_name: &str, history_len: u8) -> Arc<Link> {
        let key = (serdes_name.to_string(), network_name.to_string());
        let mut links = self.links.lock();
        links
            .entry(key)
            .or_insert_with(|| Arc::new(Link::new(serdes_name.to_string(), network_name.to_string(), history_len)))
            .clone()
    }

    pub fn get(&self, serdes_name: &str, network_name: &str) -> Option<Arc<Link>> {
        self.links.lock().get(&(serdes_name.to_string(), network_name.to_string())).cloned()
    }
}

impl Default for LinkTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_tracking_resolves_when_all_peers_respond() {
        let link = Link::new("Foo".into(), "net".into(), 0);
        link.mark_pending_ack(PeerId::for_test(0), ReceiverIndex(0));
        link.mark_pending_ack(PeerId::for_test(1), ReceiverIndex(0));
        assert!(!link.record_ack(PeerId::for_test(0), ReceiverIndex(0), true, 2));
        assert!(link.record_ack(PeerId::for_test(1), ReceiverIndex(0), false, 2));
        assert_eq!(link.remote_receivers().len(), 1);
    }

    #[test]
    fn history_replays_last_message_to_new_remote_receiver() {
        let link = Link::new("Foo".into(), "net".into(), 1);
        link.record_sent(b"hello");
        let replay = link.add_remote_receiver(PeerId::for_test(0), ReceiverIndex(0), 1);
        assert_eq!(replay.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn negotiate_picks_the_lower_of_the_two_versions() {
        let link = Link::new("Foo".into(), "net".into(), 0);
        assert_eq!(link.negotiate(3), 3, "no local version declared yet, remote's wins");
        link.declare_local_version(2);
        assert_eq!(link.negotiate(3), 2);
        assert_eq!(link.negotiate(1), 1);
    }

    #[test]
    fn remote_receiver_version_is_queryable_by_peer_and_index() {
        let link = Link::new("Foo".into(), "net".into(), 0);
        link.add_remote_receiver(PeerId::for_test(0), ReceiverIndex(5), 2);
        assert_eq!(link.negotiated_version(PeerId::for_test(0), ReceiverIndex(5)), Some(2));
        assert_eq!(link.negotiated_version(PeerId::for_test(1), ReceiverIndex(5)), None);
    }
}
