//! Local Channel
//!
//! In-process variant for practice mode: every participant is a listener
//! inside this process and inbound notifications are injected directly.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::core::signal::Signal;
use crate::game::participant::ParticipantId;
use crate::network::channel::{
    Arrivals, ChannelError, EventChannel, InboundEvent, InboundHub, InboundKind, OutboundEvent,
};

/// In-process event channel.
#[derive(Default)]
pub struct LocalChannel {
    ready: Signal,
    inbound: InboundHub,
    arrivals: Arrivals,
    listeners: Mutex<BTreeMap<ParticipantId, mpsc::UnboundedSender<OutboundEvent>>>,
}

impl LocalChannel {
    /// Create a closed channel with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, BTreeMap<ParticipantId, mpsc::UnboundedSender<OutboundEvent>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a local listener for `id`. If the channel is already open
    /// the listener sees `ChannelReady` first.
    pub fn attach(&self, id: ParticipantId) -> mpsc::UnboundedReceiver<OutboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.listeners();
        if self.ready.is_signalled() {
            let _ = tx.send(OutboundEvent::ChannelReady);
        }
        listeners.insert(id, tx);
        self.arrivals.arrived(id);
        debug!(participant = %id, "Local listener attached");
        rx
    }

    /// Detach `id` and report it as departed.
    pub fn detach(&self, id: ParticipantId) -> bool {
        let removed = self.listeners().remove(&id).is_some();
        if removed {
            self.inbound.dispatch(InboundEvent::new(id, InboundKind::Departed));
        }
        removed
    }

    /// Inject a notification as if `sender` had sent it.
    pub fn inject(&self, sender: ParticipantId, kind: InboundKind) -> bool {
        self.inbound.dispatch(InboundEvent::new(sender, kind))
    }
}

impl EventChannel for LocalChannel {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn deliver(&self, recipient: ParticipantId, event: OutboundEvent) -> Result<(), ChannelError> {
        let mut listeners = self.listeners();
        let Some(tx) = listeners.get(&recipient) else {
            return Err(ChannelError::RecipientGone(recipient));
        };
        if tx.send(event).is_err() {
            listeners.remove(&recipient);
            return Err(ChannelError::RecipientGone(recipient));
        }
        Ok(())
    }

    fn ready(&self) -> &Signal {
        &self.ready
    }

    fn inbound(&self) -> &InboundHub {
        &self.inbound
    }

    fn recipients(&self) -> Vec<ParticipantId> {
        self.listeners().keys().copied().collect()
    }

    fn fire_ready(&self) -> Option<Vec<ParticipantId>> {
        let listeners = self.listeners();
        self.ready
            .signal()
            .then(|| listeners.keys().copied().collect())
    }

    fn expect_recipients(&self, expected: &[ParticipantId]) -> Signal {
        let listeners = self.listeners();
        self.arrivals.expect(expected, |id| listeners.contains_key(id))
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
    async fn test_channel_ready_is_latched() {
        let channel = LocalChannel::new();
        let mut early = channel.attach(ParticipantId(1));

        assert!(channel.open());
        assert!(!channel.open());
        assert_eq!(early.recv().await, Some(OutboundEvent::ChannelReady));
        assert!(early.try_recv().is_err());

        let mut late = channel.attach(ParticipantId(2));
        assert_eq!(late.recv().await, Some(OutboundEvent::ChannelReady));
        assert!(channel.ready().wait_for(Some(std::time::Duration::ZERO)).await.is_signalled());
    }

    #[tokio::test]
    async fn test_attach_between_fire_and_delivery_sees_ready_once() {
        let channel = LocalChannel::new();
        assert_eq!(channel.fire_ready(), Some(Vec::new()));
        let mut late = channel.attach(ParticipantId(1));
        assert!(!channel.open());
        assert_eq!(late.recv().await, Some(OutboundEvent::ChannelReady));
        assert!(late.try_recv().is_err());
        assert!(channel.expect_recipients(&[ParticipantId(1)]).is_signalled());
    }

    #[tokio::test]
    async fn test_deliver_point_to_point() {
        let channel = LocalChannel::new();
        let mut one = channel.attach(ParticipantId(1));
        let mut two = channel.attach(ParticipantId(2));

        let aborted = OutboundEvent::GameAborted { reason: "x".into() };
        channel.deliver(ParticipantId(2), aborted.clone()).unwrap();
        assert_eq!(two.recv().await, Some(aborted));
        assert!(one.try_recv().is_err());

        assert_eq!(
            channel.deliver(ParticipantId(9), OutboundEvent::ChannelReady),
            Err(ChannelError::RecipientGone(ParticipantId(9)))
        );
    }

    #[test]
    fn test_inject_and_detach_reach_handler() {
        let channel = LocalChannel::new();
        let recorder = Arc::new(Recorder::default());
        let _rx = channel.attach(ParticipantId(1));

        assert!(!channel.inject(ParticipantId(1), InboundKind::AbortConfirmed));
        channel.subscribe(recorder.clone());
        assert!(channel.inject(
            ParticipantId(1),
            InboundKind::MoveSelected { round: 1, choice: "rock".into() }
        ));
        assert!(channel.detach(ParticipantId(1)));
        channel.unsubscribe();
        assert!(!channel.inject(ParticipantId(1), InboundKind::AbortConfirmed));

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], InboundEvent::new(ParticipantId(1), InboundKind::Departed));
    }
}
