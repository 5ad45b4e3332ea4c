//! The seam to the real-time media service.
//!
//! Room internals (signalling, codecs, routing) live behind [`Transport`] and
//! [`RoomHandle`]; this crate only sees joined rooms and the events they emit.

use crate::{media::LocalAudioTrack, token::Credential};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Handle to a remote track. The room owns the media; this only names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub sid: String,
    pub kind: TrackKind,
}

impl RemoteTrack {
    pub fn audio(sid: impl Into<String>) -> Self {
        Self {
            sid: sid.into(),
            kind: TrackKind::Audio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipant {
    pub identity: String,
}

impl RemoteParticipant {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

/// Everything a joined room reports back.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    TrackSubscribed {
        track: RemoteTrack,
        participant: RemoteParticipant,
    },
    TrackUnsubscribed {
        track: RemoteTrack,
        participant: RemoteParticipant,
    },
    DataReceived {
        payload: Bytes,
        participant: RemoteParticipant,
    },
    /// The room went away without being asked to.
    Disconnected { reason: String },
}

/// Producer side of a room's event subscription, held by the transport adapter.
#[derive(Clone)]
pub struct RoomEventSender {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl RoomEventSender {
    /// Delivers an event. Returns `false` once the subscriber has been dropped,
    /// which is how an adapter learns it was deregistered.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Subscriber side of a room's events. Dropping it deregisters every listener.
///
/// Events are queued from the moment the room is joined, so nothing that
/// arrives before the listeners start is lost.
pub struct RoomEvents {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl RoomEvents {
    pub fn channel() -> (RoomEventSender, RoomEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RoomEventSender { tx }, RoomEvents { rx })
    }

    /// Next event, or `None` once the adapter has dropped every sender.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// A joined room: the handle plus its event subscription.
pub struct JoinedRoom {
    pub room: Box<dyn RoomHandle>,
    pub events: RoomEvents,
}

/// Joins rooms on the real-time media service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Joins the room the credential is scoped to. The credential is consumed.
    async fn join(&self, url: &str, credential: Credential) -> anyhow::Result<JoinedRoom>;
}

/// An open room connection, exclusively owned by one session.
#[async_trait]
pub trait RoomHandle: Send {
    async fn publish_audio(&mut self, track: &dyn LocalAudioTrack) -> anyhow::Result<()>;

    /// Leaves the room. Must be callable on a room the service already closed.
    async fn close(&mut self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropping_events_deregisters() {
        let (tx, mut events) = RoomEvents::channel();
        assert!(tx.send(TransportEvent::Disconnected {
            reason: "test".into()
        }));
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Disconnected { .. })
        ));

        drop(events);
        assert!(tx.is_closed());
        assert!(!tx.send(TransportEvent::Disconnected {
            reason: "late".into()
        }));
    }

    #[tokio::test]
    async fn test_events_end_when_adapter_drops_sender() {
        let (tx, mut events) = RoomEvents::channel();
        drop(tx);
        assert!(events.recv().await.is_none());
    }
}
