//! Typed subscription registration and message dispatch over `Link` (§4.4).

use std::sync::Arc;

use crate::peer::SendKind;
use crate::wire::{
    self, EndpointAddress, Frame, SubscriptionAcknowledge, SubscriptionAnnouncement, SubscriptionStatus,
};

use super::{ConnectionManager, Link, PeerId};

/// Declares a local receiver for `(serdes_name, network_name)`: looks up or
/// creates the link, attaches a freshly allocated receiver index, announces
/// it to every currently connected peer, and marks one pending ack per
/// announcement sent. The caller awaits `link.wait_for_acks()` itself
/// (synchronous registration) or proceeds immediately (asynchronous).
pub fn subscribe(
    manager: &Arc<ConnectionManager>,
    serdes_name: &str,
    network_name: &str,
    version: u32,
    history_len: u8,
) -> (Arc<Link>, wire::ReceiverIndex) {
    let link = manager.links.get_or_create(serdes_name, network_name, history_len);
    let idx = manager.next_receiver_idx(&link);
    link.add_local_receiver(idx);
    link.declare_local_version(version);

    for peer_id in manager.all_peer_ids() {
        if let Some(peer) = manager.peer(peer_id) {
            link.mark_pending_ack(peer_id, idx);
            let body = wire::encode_frame(
                &Frame::SubscriptionAnnouncement(SubscriptionAnnouncement {
                    receiver_idx: idx,
                    network_name: network_name.to_string(),
                    serdes_name: serdes_name.to_string(),
                    version,
                }),
                peer.negotiated_version(),
            );
            let _ = peer.send_message(body, SendKind::Direct);
        }
    }
    (link, idx)
}

/// Handles an incoming `SubscriptionAnnouncement` from `from`: matches it
/// against a link with at least one local receiver already declared,
/// negotiates the per-link serdes version (the lower of `ann.version` and
/// this side's own, §4.2/§4.4), attaches `from` as a remote receiver at
/// that version, replays the retained message when history is enabled, and
/// replies `Success`/`Failed` carrying the negotiated version back.
pub fn handle_announcement(manager: &Arc<ConnectionManager>, from: PeerId, local_source: EndpointAddress, ann: SubscriptionAnnouncement) {
    let (status, negotiated_version) = match manager.links.get(&ann.serdes_name, &ann.network_name) {
        Some(link) if !link.local_receivers().is_empty() => {
            let negotiated_version = link.negotiate(ann.version);
            let replay = link.add_remote_receiver(from, ann.receiver_idx, negotiated_version);
            if let (Some(peer), Some(payload)) = (manager.peer(from), replay) {
                let body = wire::encode_frame(
                    &Frame::SimMsg { receiver_idx: ann.receiver_idx, source: local_source, payload },
                    peer.negotiated_version(),
                );
                let _ = peer.send_message(body, SendKind::UserData);
            }
            (SubscriptionStatus::Success, negotiated_version)
        }
        _ => (SubscriptionStatus::Failed, 0),
    };

    if let Some(peer) = manager.peer(from) {
        let body = wire::encode_frame(
            &Frame::SubscriptionAcknowledge(SubscriptionAcknowledge { receiver_idx: ann.receiver_idx, status, negotiated_version }),
            peer.negotiated_version(),
        );
        let _ = peer.send_message(body, SendKind::Direct);
    }
}

/// Handles an incoming `SubscriptionAcknowledge`: routes it to the link
/// that allocated `ack.receiver_idx` and records the ack, always clearing
/// the pending entry even on failure so registration never stalls (§4.4).
pub fn handle_acknowledge(manager: &Arc<ConnectionManager>, from: PeerId, ack: SubscriptionAcknowledge) {
    if let Some(link) = manager.link_for_receiver_idx(ack.receiver_idx) {
        link.record_ack(from, ack.receiver_idx, matches!(ack.status, SubscriptionStatus::Success), ack.negotiated_version);
    } else {
        tracing::debug!(receiver_idx = ack.receiver_idx.0, "subscription acknowledge for unknown receiver index");
    }
}

/// Publishes `payload` on `link`, addressed as coming from `source`: sent
/// once per distinct remote receiver, tagged `UserData` so it can be
/// aggregated like any other `SimMsg`.
pub fn publish(manager: &Arc<ConnectionManager>, link: &Link, source: EndpointAddress, payload: Vec<u8>) {
    link.record_sent(&payload);
    for (peer_id, receiver_idx, _negotiated_version) in link.remote_receivers() {
        if let Some(peer) = manager.peer(peer_id) {
            let body = wire::encode_frame(
                &Frame::SimMsg { receiver_idx, source, payload: payload.clone() },
                peer.negotiated_version(),
            );
            let _ = peer.send_message(body, SendKind::UserData);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ParticipantId;

    #[test]
    fn acknowledge_with_no_matching_receiver_is_a_noop() {
        let manager = ConnectionManager::new(ParticipantId(1), "alice", "sim", "");
        handle_acknowledge(
            &manager,
            PeerId::for_test(0),
            SubscriptionAcknowledge { receiver_idx: crate::wire::ReceiverIndex(99), status: SubscriptionStatus::Success, negotiated_version: 1 },
        );
    }

    #[test]
    fn handle_announcement_negotiates_the_lower_version_and_echoes_it_in_the_ack() {
        let manager = ConnectionManager::new(ParticipantId(1), "alice", "sim", "");
        let link = manager.links.get_or_create("Foo", "net", 0);
        let idx = manager.next_receiver_idx(&link);
        link.add_local_receiver(idx);
        link.declare_local_version(3);

        let from = PeerId::for_test(0);
        let ann = SubscriptionAnnouncement {
            receiver_idx: crate::wire::ReceiverIndex(5),
            network_name: "net".into(),
            serdes_name: "Foo".into(),
            version: 1,
        };
        handle_announcement(&manager, from, EndpointAddress { participant_id: ParticipantId(1), endpoint_id: 0 }, ann);

        assert_eq!(link.negotiated_version(from, crate::wire::ReceiverIndex(5)), Some(1));
    }

    #[test]
    fn next_receiver_idx_is_unique_across_distinct_links() {
        let manager = ConnectionManager::new(ParticipantId(1), "alice", "sim", "");
        let a = manager.links.get_or_create("Foo", "netA", 0);
        let b = manager.links.get_or_create("Foo", "netB", 0);
        let idx_a = manager.next_receiver_idx(&a);
        let idx_b = manager.next_receiver_idx(&b);
        assert_ne!(idx_a, idx_b);
        assert_eq!(manager.link_for_receiver_idx(idx_a).is_some(), true);
        assert_eq!(manager.link_for_receiver_idx(idx_b).is_some(), true);
    }
}
