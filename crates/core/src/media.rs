//! Local microphone publishing and remote audio playback.
//!
//! The controller is stateless across sessions: per-session playback state lives
//! in [`RemoteAudio`], which the [`Session`] owns and hands in on every call.

use crate::{
    error::MediaError,
    session::Session,
    transcript::{Sender, TranscriptLog},
    transport::{RemoteParticipant, RemoteTrack, RoomHandle, TrackKind},
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub(crate) const AGENT_RESPONDING_TEXT: &str = "Agent is responding...";

/// A captured microphone stream, owned by exactly one session.
pub trait LocalAudioTrack: Send + Sync {
    fn name(&self) -> &str;

    /// Stops capture and releases the device. Called once, on teardown.
    fn stop(&mut self);
}

/// Opens the local microphone.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioCapture: Send + Sync {
    /// Fails when the device is missing or permission is denied.
    async fn open_microphone(&self) -> anyhow::Result<Box<dyn LocalAudioTrack>>;
}

/// Plays remote tracks.
pub trait AudioOutput: Send + Sync {
    /// Starts playing `track`. The sink calls [`PlaybackEnd::notify`] when the
    /// audio runs out on its own.
    fn attach(
        &self,
        track: &RemoteTrack,
        on_end: PlaybackEnd,
    ) -> anyhow::Result<Box<dyn AudioSink>>;
}

/// One attached remote track.
pub trait AudioSink: Send {
    /// Stops playback and releases the output element.
    fn detach(self: Box<Self>);
}

#[derive(Debug)]
pub(crate) enum MediaSignal {
    PlaybackEnded { sid: String },
}

/// Lets a sink report natural end-of-audio for its own track.
#[derive(Debug)]
pub struct PlaybackEnd {
    sid: String,
    tx: mpsc::UnboundedSender<MediaSignal>,
}

impl PlaybackEnd {
    pub fn track_sid(&self) -> &str {
        &self.sid
    }

    pub fn notify(self) {
        // The session may already be gone; there is nobody left to tell.
        let _ = self.tx.send(MediaSignal::PlaybackEnded { sid: self.sid });
    }
}

enum Playback {
    Attached {
        participant: String,
        sink: Box<dyn AudioSink>,
    },
    /// Played to the end; kept so the later unsubscribe is recognised.
    Ended,
}

/// Per-session remote audio state, keyed by track sid.
pub(crate) struct RemoteAudio {
    tracks: Mutex<HashMap<String, Playback>>,
    signals: mpsc::UnboundedSender<MediaSignal>,
}

impl RemoteAudio {
    pub(crate) fn new(signals: mpsc::UnboundedSender<MediaSignal>) -> Self {
        Self {
            tracks: Mutex::new(HashMap::new()),
            signals,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Playback>> {
        self.tracks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn any_attached(tracks: &HashMap<String, Playback>) -> bool {
    tracks
        .values()
        .any(|p| matches!(p, Playback::Attached { .. }))
}

pub struct MediaTrackController {
    capture: Arc<dyn AudioCapture>,
    output: Arc<dyn AudioOutput>,
    transcript: TranscriptLog,
    speaking: watch::Sender<bool>,
}

impl MediaTrackController {
    pub fn new(
        capture: Arc<dyn AudioCapture>,
        output: Arc<dyn AudioOutput>,
        transcript: TranscriptLog,
    ) -> Self {
        let (speaking, _) = watch::channel(false);
        Self {
            capture,
            output,
            transcript,
            speaking,
        }
    }

    pub fn is_remote_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    pub fn watch_speaking(&self) -> watch::Receiver<bool> {
        self.speaking.subscribe()
    }

    /// Opens the microphone and publishes it on `room`.
    ///
    /// On a publish failure the freshly opened track is stopped before returning.
    pub async fn publish_local_audio(
        &self,
        room: &mut dyn RoomHandle,
    ) -> Result<Box<dyn LocalAudioTrack>, MediaError> {
        let mut track = self
            .capture
            .open_microphone()
            .await
            .map_err(|e| MediaError::Capture(format!("{:#}", e)))?;

        if let Err(e) = room.publish_audio(track.as_ref()).await {
            track.stop();
            return Err(MediaError::Publish(format!("{:#}", e)));
        }

        info!(track = track.name(), "Local audio published");
        Ok(track)
    }

    pub fn on_remote_track_subscribed(
        &self,
        session: &Session,
        track: &RemoteTrack,
        participant: &RemoteParticipant,
    ) {
        if track.kind != TrackKind::Audio {
            debug!(sid = %track.sid, kind = ?track.kind, "Ignoring non-audio track");
            return;
        }

        let remote = session.remote_audio();
        let mut tracks = remote.lock();
        if let Some(Playback::Attached { .. }) = tracks.get(&track.sid) {
            debug!(sid = %track.sid, "Track already attached");
            return;
        }

        let on_end = PlaybackEnd {
            sid: track.sid.clone(),
            tx: remote.signals.clone(),
        };
        let sink = match self.output.attach(track, on_end) {
            Ok(sink) => sink,
            Err(e) => {
                warn!(sid = %track.sid, error = ?e, "Failed to attach remote audio");
                return;
            }
        };

        tracks.insert(
            track.sid.clone(),
            Playback::Attached {
                participant: participant.identity.clone(),
                sink,
            },
        );
        self.refresh_speaking(&tracks);
        drop(tracks);

        info!(sid = %track.sid, participant = %participant.identity, "Remote audio attached");
        self.transcript.append(Sender::Agent, AGENT_RESPONDING_TEXT);
    }

    pub fn on_remote_track_unsubscribed(
        &self,
        session: &Session,
        track: &RemoteTrack,
        participant: &RemoteParticipant,
    ) {
        if track.kind != TrackKind::Audio {
            return;
        }

        let remote = session.remote_audio();
        let mut tracks = remote.lock();
        match tracks.remove(&track.sid) {
            Some(Playback::Attached { sink, .. }) => {
                sink.detach();
                info!(sid = %track.sid, participant = %participant.identity, "Remote audio detached");
            }
            Some(Playback::Ended) => {
                debug!(sid = %track.sid, "Unsubscribed track had already finished playing");
            }
            None => {
                debug!(sid = %track.sid, "Unsubscribe for a track that was never attached");
            }
        }
        self.refresh_speaking(&tracks);
    }

    /// The sink for `sid` ran out of audio on its own.
    pub(crate) fn on_playback_ended(&self, session: &Session, sid: &str) {
        let remote = session.remote_audio();
        let mut tracks = remote.lock();
        match tracks.remove(sid) {
            Some(Playback::Attached { sink, participant }) => {
                sink.detach();
                tracks.insert(sid.to_string(), Playback::Ended);
                info!(sid, %participant, "Remote audio finished playing");
            }
            Some(Playback::Ended) => {
                tracks.insert(sid.to_string(), Playback::Ended);
            }
            None => debug!(sid, "Playback ended for a track no longer tracked"),
        }
        self.refresh_speaking(&tracks);
    }

    /// Detaches every remote sink of `session`. Part of teardown.
    pub(crate) fn release_remote_audio(&self, session: &Session) {
        let remote = session.remote_audio();
        let mut tracks = remote.lock();
        for (sid, playback) in tracks.drain() {
            if let Playback::Attached { sink, .. } = playback {
                debug!(%sid, "Detaching remote audio on teardown");
                sink.detach();
            }
        }
        self.refresh_speaking(&tracks);
    }

    fn refresh_speaking(&self, tracks: &HashMap<String, Playback>) {
        let now = any_attached(tracks);
        self.speaking.send_if_modified(|speaking| {
            let changed = *speaking != now;
            *speaking = now;
            changed
        });
    }
}
