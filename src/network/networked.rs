//! Networked Channel
//!
//! Outbound events become `ServerMessage`s queued on each participant's
//! socket writer; inbound client messages are tagged with the sender id
//! before they reach the handler.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::core::signal::Signal;
use crate::game::participant::ParticipantId;
use crate::network::channel::{
    Arrivals, ChannelError, EventChannel, InboundEvent, InboundHub, InboundKind, OutboundEvent,
};
use crate::network::protocol::{ClientMessage, ServerMessage};

type Writers = BTreeMap<ParticipantId, mpsc::Sender<ServerMessage>>;

/// Event channel over per-participant socket writers.
#[derive(Default)]
pub struct NetworkedChannel {
    ready: Signal,
    inbound: InboundHub,
    arrivals: Arrivals,
    writers: Mutex<Writers>,
}

impl NetworkedChannel {
    /// Create a closed channel with no participants.
    pub fn new() -> Self {
        Self::default()
    }

    fn writers(&self) -> MutexGuard<'_, Writers> {
        self.writers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an approved participant's writer. Late registrants get
    /// `ChannelReady` right away if the channel is open.
    pub fn register(&self, id: ParticipantId, writer: mpsc::Sender<ServerMessage>) {
        let mut writers = self.writers();
        if self.ready.is_signalled() {
            let _ = writer.try_send(ServerMessage::ChannelReady);
        }
        writers.insert(id, writer);
        self.arrivals.arrived(id);
        debug!(participant = %id, "Remote participant registered");
    }

    /// Forget `id` and report it as departed. Returns false if unknown.
    pub fn remove(&self, id: ParticipantId) -> bool {
        let removed = self.writers().remove(&id).is_some();
        if removed {
            self.inbound.dispatch(InboundEvent::new(id, InboundKind::Departed));
        }
        removed
    }

    /// Route a client message from `sender`. Returns true if it carried a
    /// gameplay notification from a registered participant.
    pub fn receive(&self, sender: ParticipantId, message: ClientMessage) -> bool {
        if !self.writers().contains_key(&sender) {
            debug!(participant = %sender, "Message from unregistered participant ignored");
            return false;
        }
        match message.into_inbound() {
            Some(kind) => self.inbound.dispatch(InboundEvent::new(sender, kind)),
            None => false,
        }
    }

    /// Number of registered participants.
    pub fn len(&self) -> usize {
        self.writers().len()
    }

    /// No participants registered.
    pub fn is_empty(&self) -> bool {
        self.writers().is_empty()
    }
}

impl EventChannel for NetworkedChannel {
    fn kind(&self) -> &'static str {
        "networked"
    }

    fn deliver(&self, recipient: ParticipantId, event: OutboundEvent) -> Result<(), ChannelError> {
        let mut writers = self.writers();
        let Some(writer) = writers.get(&recipient) else {
            return Err(ChannelError::RecipientGone(recipient));
        };
        match writer.try_send(ServerMessage::from(event)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(participant = %recipient, "Outbound queue full, message dropped");
                Err(ChannelError::Congested(recipient))
            }
            Err(TrySendError::Closed(_)) => {
                writers.remove(&recipient);
                Err(ChannelError::RecipientGone(recipient))
            }
        }
    }

    fn ready(&self) -> &Signal {
        &self.ready
    }

    fn inbound(&self) -> &InboundHub {
        &self.inbound
    }

    fn recipients(&self) -> Vec<ParticipantId> {
        self.writers().keys().copied().collect()
    }

    fn fire_ready(&self) -> Option<Vec<ParticipantId>> {
        let writers = self.writers();
        self.ready
            .signal()
            .then(|| writers.keys().copied().collect())
    }

    fn expect_recipients(&self, expected: &[ParticipantId]) -> Signal {
        let writers = self.writers();
        self.arrivals.expect(expected, |id| writers.contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::channel::InboundHandler;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<InboundEvent>>);

    impl InboundHandler for Recorder {
        fn on_inbound(&self, event: InboundEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_outbound_serialized_per_participant() {
        let channel = NetworkedChannel::new();
        let (tx, mut rx) = mpsc::channel(8);
        channel.register(ParticipantId(1), tx);

        channel
            .deliver(ParticipantId(1), OutboundEvent::GameAborted { reason: "fault".into() })
            .unwrap();
        assert_eq!(rx.recv().await, Some(ServerMessage::GameAborted { reason: "fault".into() }));
        assert_eq!(
            channel.deliver(ParticipantId(2), OutboundEvent::ChannelReady),
            Err(ChannelError::RecipientGone(ParticipantId(2)))
        );
    }

    #[tokio::test]
    async fn test_late_registration_sees_ready() {
        let channel = NetworkedChannel::new();
        let (early_tx, mut early_rx) = mpsc::channel(8);
        channel.register(ParticipantId(1), early_tx);
        assert!(channel.open());
        assert_eq!(early_rx.recv().await, Some(ServerMessage::ChannelReady));

        let (late_tx, mut late_rx) = mpsc::channel(8);
        channel.register(ParticipantId(2), late_tx);
        assert_eq!(late_rx.recv().await, Some(ServerMessage::ChannelReady));
    }

    #[tokio::test]
    async fn test_ready_sent_once_per_participant() {
        let channel = NetworkedChannel::new();
        let (early_tx, mut early_rx) = mpsc::channel(8);
        channel.register(ParticipantId(1), early_tx);
        assert_eq!(channel.fire_ready(), Some(vec![ParticipantId(1)]));

        // Registered after the signal fired but before `open` delivered:
        // registration tells it, the snapshot does not include it.
        let (late_tx, mut late_rx) = mpsc::channel(8);
        channel.register(ParticipantId(2), late_tx);
        assert_eq!(late_rx.recv().await, Some(ServerMessage::ChannelReady));
        assert!(channel.fire_ready().is_none());
        assert!(!channel.open());
        assert!(late_rx.try_recv().is_err());
        assert!(early_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_expect_recipients_waits_for_registration() {
        let channel = NetworkedChannel::new();
        let (tx, _rx) = mpsc::channel(8);
        channel.register(ParticipantId(1), tx);

        let reachable = channel.expect_recipients(&[ParticipantId(1), ParticipantId(2)]);
        assert!(!reachable.is_signalled());
        let (tx, _rx2) = mpsc::channel(8);
        channel.register(ParticipantId(2), tx);
        assert!(reachable.is_signalled());
    }

    #[test]
    fn test_full_queue_reports_congestion() {
        let channel = NetworkedChannel::new();
        let (tx, _rx) = mpsc::channel(1);
        channel.register(ParticipantId(1), tx);
        channel.deliver(ParticipantId(1), OutboundEvent::ChannelReady).unwrap();
        assert_eq!(
            channel.deliver(ParticipantId(1), OutboundEvent::ChannelReady),
            Err(ChannelError::Congested(ParticipantId(1)))
        );
    }

    #[test]
    fn test_closed_writer_is_dropped() {
        let channel = NetworkedChannel::new();
        let (tx, rx) = mpsc::channel(1);
        channel.register(ParticipantId(1), tx);
        drop(rx);
        assert!(channel.deliver(ParticipantId(1), OutboundEvent::ChannelReady).is_err());
        assert!(channel.is_empty());
    }

    #[test]
    fn test_inbound_tagged_with_sender() {
        let channel = NetworkedChannel::new();
        let recorder = Arc::new(Recorder::default());
        channel.subscribe(recorder.clone());

        let select = ClientMessage::SelectMove { round: 1, choice: "rock".into() };
        assert!(!channel.receive(ParticipantId(5), select.clone()));

        let (tx, _rx) = mpsc::channel(1);
        channel.register(ParticipantId(5), tx);
        assert!(channel.receive(ParticipantId(5), select));
        assert!(!channel.receive(ParticipantId(5), ClientMessage::Ping { timestamp: 1 }));
        assert!(channel.remove(ParticipantId(5)));

        let seen = recorder.0.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                InboundEvent::new(
                    ParticipantId(5),
                    InboundKind::MoveSelected { round: 1, choice: "rock".into() }
                ),
                InboundEvent::new(ParticipantId(5), InboundKind::Departed),
            ]
        );
    }
}
