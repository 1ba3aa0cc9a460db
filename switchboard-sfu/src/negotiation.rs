//! Per-peer negotiation worker
//!
//! Every server-initiated offer goes through this loop. Requests are
//! coalesced through the peer's single-slot trigger, debounced, and only
//! acted on once the connection is back in `stable`, so at most one local
//! offer is ever outstanding. A cycle that loses a race against an inbound
//! offer is abandoned; the next request retries.

use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::SfuConfig;
use crate::media::SignalingState;
use crate::peer::Peer;
use crate::signal::SignalMessage;

pub fn spawn(peer: Arc<Peer>, config: &SfuConfig) -> JoinHandle<()> {
    let debounce = config.negotiation_debounce();
    let poll = config.stability_poll();
    tokio::spawn(run(peer, debounce, poll))
}

/// Runs until the peer's closed signal fires
pub async fn run(peer: Arc<Peer>, debounce: Duration, poll: Duration) {
    let closed = peer.closed_token();

    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            () = peer.negotiation_trigger().notified() => {}
        }

        tokio::select! {
            () = closed.cancelled() => break,
            () = tokio::time::sleep(debounce) => {}
        }
        // Requests that landed inside the window belong to this cycle
        let _ = peer.negotiation_trigger().notified().now_or_never();

        if !wait_until_stable(&peer, &closed, poll).await {
            break;
        }
        negotiate(&peer).await;
    }

    debug!(peer_id = %peer.id, "Negotiation worker stopped");
}

/// False if the peer closed first
async fn wait_until_stable(peer: &Peer, closed: &CancellationToken, poll: Duration) -> bool {
    loop {
        match peer.connection().signaling_state() {
            SignalingState::Stable => return !closed.is_cancelled(),
            SignalingState::Closed => return false,
            state => trace!(peer_id = %peer.id, state = ?state, "Waiting for stable"),
        }
        tokio::select! {
            () = closed.cancelled() => return false,
            () = tokio::time::sleep(poll) => {}
        }
    }
}

/// One offer cycle; every failure abandons the cycle
async fn negotiate(peer: &Peer) {
    let connection = peer.connection();
    let ice_restart = peer.restart_pending();

    let offer = match connection.create_offer(ice_restart).await {
        Ok(offer) => offer,
        Err(e) => {
            debug!(peer_id = %peer.id, error = %e, "Offer creation failed, abandoning cycle");
            return;
        }
    };

    let state = connection.signaling_state();
    if state != SignalingState::Stable {
        debug!(peer_id = %peer.id, state = ?state, "Negotiation raced, abandoning cycle");
        retry_restart(peer, ice_restart);
        return;
    }

    if let Err(e) = connection.set_local_description(offer.clone()).await {
        debug!(peer_id = %peer.id, error = %e, "Local offer rejected, abandoning cycle");
        retry_restart(peer, ice_restart);
        return;
    }

    let offer = connection.local_description().await.unwrap_or(offer);
    if ice_restart {
        peer.clear_restart();
        info!(peer_id = %peer.id, "Sending ICE restart offer");
    } else {
        debug!(peer_id = %peer.id, "Sending renegotiation offer");
    }
    peer.send(SignalMessage::offer(offer));
}

/// A pending restart has no other trigger left, so re-arm it
fn retry_restart(peer: &Peer, ice_restart: bool) {
    if ice_restart {
        peer.request_negotiation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaConnection;
    use crate::testing::FakeConnection;
    use crate::types::{PeerId, RoomId};

    #[tokio::test]
    async fn test_worker_exits_when_closed_mid_debounce() {
        let (peer, _rx) = Peer::new(
            PeerId::from("a"),
            RoomId::from("r1"),
            None,
            FakeConnection::new(),
            &SfuConfig::default(),
        );
        let worker = tokio::spawn(run(
            Arc::clone(&peer),
            Duration::from_secs(30),
            Duration::from_millis(5),
        ));

        peer.request_negotiation();
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.close();

        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_worker_waits_for_stable() {
        let connection = FakeConnection::new();
        let (peer, mut rx) = Peer::new(
            PeerId::from("a"),
            RoomId::from("r1"),
            None,
            connection.clone(),
            &SfuConfig::default(),
        );
        connection
            .set_remote_description(crate::signal::SessionDescription::offer("remote"))
            .await
            .unwrap();

        tokio::spawn(run(Arc::clone(&peer), Duration::from_millis(5), Duration::from_millis(5)));
        peer.request_negotiation();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert!(connection.offers_created().is_empty());

        let answer = connection.create_answer().await.unwrap();
        connection.set_local_description(answer).await.unwrap();

        let offer = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(offer.kind, crate::signal::SignalKind::Offer);
        peer.close();
    }
}
