//! In-memory signaling channel for tests and demos

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::error::{Error, Result};
use crate::signaling::channel::{LinkStatus, SignalingChannel};
use crate::signaling::protocol::SignalMessage;

/// Message buffer per endpoint before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 256;

/// One endpoint of an in-memory signaling link.
///
/// [`pair`](InMemorySignaling::pair) returns two linked endpoints: a message
/// sent on one is delivered to the other's subscribers. Connectivity is
/// driven manually through [`set_status`](InMemorySignaling::set_status),
/// which makes channel-failure paths testable without a real transport.
pub struct InMemorySignaling {
    label: &'static str,
    inbound: broadcast::Sender<SignalMessage>,
    peer_inbound: broadcast::Sender<SignalMessage>,
    status_tx: watch::Sender<LinkStatus>,
    status_rx: watch::Receiver<LinkStatus>,
}

impl InMemorySignaling {
    /// Create two linked endpoints, both starting `Connected`
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_inbound, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (right_inbound, _) = broadcast::channel(CHANNEL_CAPACITY);
        let left = Arc::new(Self::endpoint(
            "left",
            left_inbound.clone(),
            right_inbound.clone(),
        ));
        let right = Arc::new(Self::endpoint("right", right_inbound, left_inbound));
        (left, right)
    }

    fn endpoint(
        label: &'static str,
        inbound: broadcast::Sender<SignalMessage>,
        peer_inbound: broadcast::Sender<SignalMessage>,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(LinkStatus::Connected);
        Self {
            label,
            inbound,
            peer_inbound,
            status_tx,
            status_rx,
        }
    }

    /// Drive this endpoint's connectivity
    pub fn set_status(&self, status: LinkStatus) {
        self.status_tx.send_replace(status);
    }
}

#[async_trait]
impl SignalingChannel for InMemorySignaling {
    async fn send(&self, message: SignalMessage) -> Result<()> {
        let status = *self.status_rx.borrow();
        if !status.is_connected() {
            return Err(Error::SignalingError(format!(
                "channel {} is {}",
                self.label, status
            )));
        }
        debug!(
            label = self.label,
            event = %message.event,
            participant_id = %message.participant_id,
            "delivering signal message"
        );
        // No subscriber on the peer endpoint means the message is dropped,
        // matching the no-delivery-guarantee contract.
        if self.peer_inbound.send(message).is_err() {
            debug!(label = self.label, "peer endpoint has no subscriber, message dropped");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.inbound.subscribe()
    }

    fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }

    fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::{ParticipantId, Role};

    #[tokio::test]
    async fn test_pair_delivers_across_endpoints() {
        let (left, right) = InMemorySignaling::pair();
        let mut inbox = right.subscribe();

        let id = ParticipantId::mint(Role::Participant);
        left.send(SignalMessage::leave(id.clone())).await.unwrap();

        let received = inbox.recv().await.unwrap();
        assert_eq!(received.participant_id, id);
    }

    #[tokio::test]
    async fn test_send_without_subscriber_is_dropped_not_error() {
        let (left, _right) = InMemorySignaling::pair();
        let id = ParticipantId::mint(Role::Participant);
        assert!(left.send(SignalMessage::leave(id)).await.is_ok());
    }

    #[tokio::test]
    async fn test_send_fails_when_not_connected() {
        let (left, _right) = InMemorySignaling::pair();
        left.set_status(LinkStatus::Failed);

        let id = ParticipantId::mint(Role::Participant);
        let err = left.send(SignalMessage::leave(id)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_watch_status_sees_transitions() {
        let (left, _right) = InMemorySignaling::pair();
        let mut status = left.watch_status();
        assert_eq!(*status.borrow(), LinkStatus::Connected);

        left.set_status(LinkStatus::Disconnected);
        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), LinkStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_messages_do_not_loop_back() {
        let (left, right) = InMemorySignaling::pair();
        let mut own_inbox = left.subscribe();
        let mut peer_inbox = right.subscribe();

        let id = ParticipantId::mint(Role::Participant);
        left.send(SignalMessage::leave(id)).await.unwrap();

        assert!(peer_inbox.recv().await.is_ok());
        assert!(own_inbox.try_recv().is_err());
    }
}
