//! Voice session lifecycle.
//!
//! [`SessionConnectionManager`] is the only place session state changes. It runs
//! the connect sequence (credential, room join, listeners, microphone), owns the
//! live [`Session`] and its resources, and tears everything down on `disconnect()`
//! or when the transport drops the room.
//!
//! ```text
//! Idle ──connect──▶ Connecting ──ok──▶ Connected ──disconnect──▶ Disconnecting ──▶ Idle
//!                        │                 │
//!                        └──err──▶ Failed ◀┘ transport closed
//!                                    │
//!                                    └──────────────────────────────────────────▶ Idle
//! ```

use crate::{
    config::Config,
    error::SessionError,
    identity::{IdentityGenerator, RandomIdentityGenerator, SessionIdentifiers},
    media::{
        AudioCapture, AudioOutput, LocalAudioTrack, MediaSignal, MediaTrackController, RemoteAudio,
    },
    relay::DataChannelRelay,
    token::{CredentialProvider, TokenClient},
    transcript::{Sender, TranscriptLog},
    transport::{JoinedRoom, RoomEvents, RoomHandle, Transport, TransportEvent},
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

pub(crate) const READY_TEXT: &str = "Connected to voice support. You can start speaking now.";

/// Lifecycle state of the (single) voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One live connection, as seen by the event handlers.
pub struct Session {
    identifiers: SessionIdentifiers,
    remote_audio: RemoteAudio,
    /// Set once the transport has closed the room on its own.
    terminated: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        identifiers: SessionIdentifiers,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MediaSignal>) {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            identifiers,
            remote_audio: RemoteAudio::new(signals_tx),
            terminated: AtomicBool::new(false),
        });
        (session, signals_rx)
    }

    pub fn room_identifier(&self) -> &str {
        &self.identifiers.room
    }

    pub fn participant_identifier(&self) -> &str {
        &self.identifiers.participant
    }

    pub(crate) fn remote_audio(&self) -> &RemoteAudio {
        &self.remote_audio
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// The collaborators a manager is built from.
pub struct SessionServices {
    pub credentials: Arc<dyn CredentialProvider>,
    pub transport: Arc<dyn Transport>,
    pub capture: Arc<dyn AudioCapture>,
    pub output: Arc<dyn AudioOutput>,
    pub identities: Arc<dyn IdentityGenerator>,
}

impl SessionServices {
    /// Services backed by the HTTP token client and random identifiers.
    pub fn from_config(
        config: &Config,
        transport: Arc<dyn Transport>,
        capture: Arc<dyn AudioCapture>,
        output: Arc<dyn AudioOutput>,
    ) -> Result<Self, SessionError> {
        let token_url = config.require_token_server_url()?.clone();
        let credentials = TokenClient::new(token_url, config.token_request_timeout)?;
        Ok(Self {
            credentials: Arc::new(credentials),
            transport,
            capture,
            output,
            identities: Arc::new(RandomIdentityGenerator::new(
                config.participant_prefix.clone(),
            )),
        })
    }
}

/// Handle on the listener task of one session. Dropping it deregisters.
struct Listeners {
    handle: Option<JoinHandle<()>>,
}

impl Listeners {
    fn spawn(
        core: Weak<Core>,
        session: Arc<Session>,
        events: RoomEvents,
        signals: mpsc::UnboundedReceiver<MediaSignal>,
    ) -> Self {
        let span = info_span!(
            "session_events",
            room = %session.room_identifier(),
            participant = %session.participant_identifier()
        );
        let handle = tokio::spawn(run_listeners(core, session, events, signals).instrument(span));
        Self {
            handle: Some(handle),
        }
    }

    fn deregister(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Releases the handle from inside the listener task, which must not abort itself.
    fn release_from_listener(mut self) {
        self.handle.take();
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Resources owned by a Connected session.
struct ActiveSession {
    session: Arc<Session>,
    room: Box<dyn RoomHandle>,
    microphone: Box<dyn LocalAudioTrack>,
    listeners: Listeners,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveSession>,
    last_error: Option<String>,
}

struct Core {
    config: Arc<Config>,
    credentials: Arc<dyn CredentialProvider>,
    transport: Arc<dyn Transport>,
    identities: Arc<dyn IdentityGenerator>,
    media: MediaTrackController,
    relay: DataChannelRelay,
    transcript: TranscriptLog,
    state: watch::Sender<SessionState>,
    /// Every state change happens with this lock held.
    slot: Mutex<Slot>,
}

/// Owns the single voice session and serializes connect/disconnect.
///
/// Cloning gives another handle onto the same manager.
#[derive(Clone)]
pub struct SessionConnectionManager {
    core: Arc<Core>,
}

impl SessionConnectionManager {
    pub fn new(config: Arc<Config>, services: SessionServices) -> Self {
        let transcript = TranscriptLog::new();
        let (state, _) = watch::channel(SessionState::Idle);
        let core = Core {
            config,
            credentials: services.credentials,
            transport: services.transport,
            identities: services.identities,
            media: MediaTrackController::new(
                services.capture,
                services.output,
                transcript.clone(),
            ),
            relay: DataChannelRelay::new(transcript.clone()),
            transcript,
            state,
            slot: Mutex::new(Slot::default()),
        };
        Self {
            core: Arc::new(core),
        }
    }

    /// Starts a session in a fresh room derived from `room_base_name`.
    ///
    /// Rejected with [`SessionError::StateConflict`] unless the manager is Idle.
    /// Any other failure rolls back to Idle before it is returned. The attempt
    /// runs on its own task, so dropping this future does not abandon it halfway.
    #[instrument(name = "connect", skip(self), fields(room, participant))]
    pub async fn connect(&self, room_base_name: &str) -> Result<SessionIdentifiers, SessionError> {
        self.core.begin_connect()?;

        let core = self.core.clone();
        let room_base_name = room_base_name.to_string();
        let attempt =
            tokio::spawn(async move { core.run_connect(&room_base_name).await }.in_current_span());

        match attempt.await {
            Ok(result) => result,
            Err(e) => {
                let err = SessionError::TransportJoin(format!("connect attempt aborted: {}", e));
                self.core.fail_connect(&err);
                Err(err)
            }
        }
    }

    /// Connects using the configured room name.
    pub async fn connect_default_room(&self) -> Result<SessionIdentifiers, SessionError> {
        let room_base_name = self.core.config.room_name.clone();
        self.connect(&room_base_name).await
    }

    /// Ends the current session. A no-op unless Connected; never fails.
    pub async fn disconnect(&self) {
        let core = self.core.clone();
        let teardown = tokio::spawn(async move { core.run_disconnect().await }.in_current_span());
        if let Err(e) = teardown.await {
            error!(error = %e, "Disconnect task failed");
        }
    }

    pub fn state(&self) -> SessionState {
        *self.core.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.core.state.subscribe()
    }

    /// True while a connect or disconnect is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connecting | SessionState::Disconnecting
        )
    }

    pub fn is_remote_speaking(&self) -> bool {
        self.core.media.is_remote_speaking()
    }

    pub fn watch_speaking(&self) -> watch::Receiver<bool> {
        self.core.media.watch_speaking()
    }

    /// Message of the most recent failure, if it has not been cleared yet.
    pub fn last_error(&self) -> Option<String> {
        self.core.lock_slot().last_error.clone()
    }

    /// Identifiers of the live session, if Connected.
    pub fn session_info(&self) -> Option<SessionIdentifiers> {
        self.core
            .lock_slot()
            .active
            .as_ref()
            .map(|a| a.session.identifiers.clone())
    }

    pub fn transcript(&self) -> &TranscriptLog {
        &self.core.transcript
    }

    pub fn config(&self) -> &Config {
        &self.core.config
    }
}

impl Core {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Callers must hold the slot lock.
    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Session state changed");
        }
    }

    fn begin_connect(&self) -> Result<(), SessionError> {
        let _slot = self.lock_slot();
        let current = self.current_state();
        if current != SessionState::Idle {
            warn!(state = %current, "Rejecting connect: session not idle");
            return Err(SessionError::StateConflict(current));
        }
        self.set_state(SessionState::Connecting);
        Ok(())
    }

    async fn run_connect(
        self: Arc<Self>,
        room_base_name: &str,
    ) -> Result<SessionIdentifiers, SessionError> {
        match self.clone().establish(room_base_name).await {
            Ok(identifiers) => Ok(identifiers),
            Err(err) => {
                self.fail_connect(&err);
                Err(err)
            }
        }
    }

    async fn establish(
        self: Arc<Self>,
        room_base_name: &str,
    ) -> Result<SessionIdentifiers, SessionError> {
        let url = self.config.require_transport_url()?.to_string();
        self.transcript.clear();

        let identifiers = self.identities.generate(room_base_name);
        let span = tracing::Span::current();
        span.record("room", identifiers.room.as_str());
        span.record("participant", identifiers.participant.as_str());

        info!("Requesting session credential");
        let credential = self
            .credentials
            .fetch_credential(&identifiers.room, &identifiers.participant)
            .await?;

        // The credential is consumed here whether or not the join succeeds.
        let JoinedRoom { mut room, events } = self
            .transport
            .join(&url, credential)
            .await
            .map_err(|e| SessionError::TransportJoin(format!("{:#}", e)))?;
        info!("Joined room");

        let (session, signals) = Session::new(identifiers.clone());
        let listeners = Listeners::spawn(Arc::downgrade(&self), session.clone(), events, signals);

        let microphone = match self.media.publish_local_audio(room.as_mut()).await {
            Ok(microphone) => microphone,
            Err(e) => {
                self.rollback(&session, listeners, room, None).await;
                return Err(e.into());
            }
        };

        let leftover = {
            let mut slot = self.lock_slot();
            if session.is_terminated() {
                Some((listeners, room, microphone))
            } else {
                slot.active = Some(ActiveSession {
                    session: session.clone(),
                    room,
                    microphone,
                    listeners,
                });
                slot.last_error = None;
                self.set_state(SessionState::Connected);
                self.transcript.append(Sender::System, READY_TEXT);
                None
            }
        };

        if let Some((listeners, room, microphone)) = leftover {
            self.rollback(&session, listeners, room, Some(microphone))
                .await;
            return Err(SessionError::TransportJoin(
                "the room closed while the session was being set up".to_string(),
            ));
        }

        info!("Voice session ready");
        Ok(identifiers)
    }

    /// Releases everything a failed connect attempt acquired.
    async fn rollback(
        &self,
        session: &Session,
        listeners: Listeners,
        mut room: Box<dyn RoomHandle>,
        microphone: Option<Box<dyn LocalAudioTrack>>,
    ) {
        listeners.deregister();
        self.media.release_remote_audio(session);
        if let Some(mut microphone) = microphone {
            microphone.stop();
        }
        close_quietly(room.as_mut()).await;
    }

    fn fail_connect(&self, err: &SessionError) {
        error!(error = %err, "Connect failed");
        let mut slot = self.lock_slot();
        self.set_state(SessionState::Failed);
        // Remote events handled while connecting belong to the abandoned attempt.
        self.transcript.clear();
        slot.last_error = Some(err.to_string());
        self.set_state(SessionState::Idle);
    }

    async fn run_disconnect(&self) {
        let active = {
            let mut slot = self.lock_slot();
            match self.current_state() {
                SessionState::Connected => {
                    self.set_state(SessionState::Disconnecting);
                    slot.active.take()
                }
                other => {
                    debug!(state = %other, "Disconnect ignored");
                    return;
                }
            }
        };

        if let Some(active) = active {
            self.teardown(active, false).await;
        }

        let mut slot = self.lock_slot();
        self.transcript.clear();
        slot.last_error = None;
        self.set_state(SessionState::Idle);
        info!("Disconnected");
    }

    /// The transport closed `session`'s room without being asked to.
    async fn on_transport_closed(&self, session: &Arc<Session>, reason: String) {
        let active = {
            let mut slot = self.lock_slot();
            session.terminated.store(true, Ordering::SeqCst);
            let is_current = slot
                .active
                .as_ref()
                .is_some_and(|a| Arc::ptr_eq(&a.session, session));
            if !is_current {
                debug!(%reason, "Room closed outside the connected state");
                return;
            }
            self.set_state(SessionState::Failed);
            slot.active.take()
        };

        warn!(%reason, "Session terminated by transport");
        if let Some(active) = active {
            self.teardown(active, true).await;
        }

        let message = format!("Session ended: {}", reason);
        let mut slot = self.lock_slot();
        self.transcript.append(Sender::System, message.clone());
        slot.last_error = Some(message);
        self.set_state(SessionState::Idle);
    }

    /// Best-effort release of a session's resources; never fails.
    async fn teardown(&self, active: ActiveSession, from_listener: bool) {
        let ActiveSession {
            session,
            mut room,
            mut microphone,
            listeners,
        } = active;

        if from_listener {
            listeners.release_from_listener();
        } else {
            listeners.deregister();
        }
        self.media.release_remote_audio(&session);
        microphone.stop();
        close_quietly(room.as_mut()).await;
    }
}

async fn close_quietly(room: &mut dyn RoomHandle) {
    if let Err(e) = room.close().await {
        warn!(error = ?e, "Closing the room failed; treating it as closed");
    }
}

enum Wakeup {
    Event(TransportEvent),
    EventsEnded,
    Media(MediaSignal),
}

/// Delivers room events and playback signals to the handlers until the room closes.
async fn run_listeners(
    manager: Weak<Core>,
    session: Arc<Session>,
    mut events: RoomEvents,
    mut signals: mpsc::UnboundedReceiver<MediaSignal>,
) {
    debug!("Listeners registered");
    loop {
        let wakeup = tokio::select! {
            event = events.recv() => match event {
                Some(event) => Wakeup::Event(event),
                None => Wakeup::EventsEnded,
            },
            Some(signal) = signals.recv() => Wakeup::Media(signal),
        };

        // The manager is gone; its session went with it.
        let Some(core) = manager.upgrade() else {
            break;
        };

        match wakeup {
            Wakeup::Event(TransportEvent::TrackSubscribed { track, participant }) => {
                core.media
                    .on_remote_track_subscribed(&session, &track, &participant);
            }
            Wakeup::Event(TransportEvent::TrackUnsubscribed { track, participant }) => {
                core.media
                    .on_remote_track_unsubscribed(&session, &track, &participant);
            }
            Wakeup::Event(TransportEvent::DataReceived {
                payload,
                participant,
            }) => {
                core.relay.on_data_received(&payload, &participant);
            }
            Wakeup::Media(MediaSignal::PlaybackEnded { sid }) => {
                core.media.on_playback_ended(&session, &sid);
            }
            Wakeup::Event(TransportEvent::Disconnected { reason }) => {
                core.on_transport_closed(&session, reason).await;
                break;
            }
            Wakeup::EventsEnded => {
                core.on_transport_closed(&session, "connection lost".to_string())
                    .await;
                break;
            }
        }
    }
    debug!("Listeners stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConfigError,
        error::TokenError,
        media::{
            MockAudioCapture,
            tests::{RecordingOutput, StubTrack},
        },
        token::{Credential, MockCredentialProvider},
        transport::RoomEventSender,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FixedIdentities;

    impl IdentityGenerator for FixedIdentities {
        fn generate(&self, room_base_name: &str) -> SessionIdentifiers {
            SessionIdentifiers {
                room: format!("{}-test01", room_base_name),
                participant: "farmer-test01".to_string(),
            }
        }
    }

    #[derive(Default)]
    struct CountingTransport {
        joins: AtomicUsize,
        closes: Arc<AtomicUsize>,
        fail_join: bool,
        events: Mutex<Option<RoomEventSender>>,
    }

    struct CountingRoom {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RoomHandle for CountingRoom {
        async fn publish_audio(&mut self, _: &dyn LocalAudioTrack) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("already closed")
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn join(&self, _url: &str, credential: Credential) -> anyhow::Result<JoinedRoom> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            if self.fail_join {
                anyhow::bail!("invalid token {}", credential.expose().len());
            }
            let (tx, events) = RoomEvents::channel();
            *self.events.lock().unwrap() = Some(tx);
            Ok(JoinedRoom {
                room: Box::new(CountingRoom {
                    closes: self.closes.clone(),
                }),
                events,
            })
        }
    }

    fn config() -> Arc<Config> {
        Arc::new(Config {
            transport_url: Some("ws://localhost:7880".to_string()),
            ..Config::default()
        })
    }

    fn working_capture(stopped: Arc<AtomicUsize>) -> MockAudioCapture {
        let mut capture = MockAudioCapture::new();
        capture.expect_open_microphone().returning(move || {
            Ok(Box::new(StubTrack {
                stopped: stopped.clone(),
            }) as Box<dyn LocalAudioTrack>)
        });
        capture
    }

    fn manager(
        config: Arc<Config>,
        credentials: MockCredentialProvider,
        transport: Arc<CountingTransport>,
        capture: MockAudioCapture,
    ) -> SessionConnectionManager {
        SessionConnectionManager::new(
            config,
            SessionServices {
                credentials: Arc::new(credentials),
                transport,
                capture: Arc::new(capture),
                output: Arc::new(RecordingOutput::default()),
                identities: Arc::new(FixedIdentities),
            },
        )
    }

    fn granting_credentials() -> MockCredentialProvider {
        let mut credentials = MockCredentialProvider::new();
        credentials
            .expect_fetch_credential()
            .times(1)
            .returning(|_, _| Ok(Credential::new("abc")));
        credentials
    }

    #[test]
    fn test_services_require_token_server_url() {
        let build = |config: &Config| {
            SessionServices::from_config(
                config,
                Arc::new(CountingTransport::default()),
                Arc::new(MockAudioCapture::new()),
                Arc::new(RecordingOutput::default()),
            )
        };

        let missing = build(&config());
        assert!(matches!(
            missing,
            Err(SessionError::Configuration(ConfigError::MissingVar(ref var)))
                if var == "TOKEN_SERVER_URL"
        ));

        let configured = Config {
            token_server_url: Some("http://localhost:3000/getToken".parse().unwrap()),
            ..(*config()).clone()
        };
        assert!(build(&configured).is_ok());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Idle.to_string(), "idle");
        assert_eq!(SessionState::Disconnecting.to_string(), "disconnecting");
        assert_eq!(
            serde_json::to_string(&SessionState::Connected).unwrap(),
            "\"connected\""
        );
    }

    #[tokio::test]
    async fn test_missing_transport_url_fails_before_network() {
        let mut credentials = MockCredentialProvider::new();
        credentials.expect_fetch_credential().never();
        let transport = Arc::new(CountingTransport::default());
        let manager = manager(
            Arc::new(Config::default()),
            credentials,
            transport.clone(),
            MockAudioCapture::new(),
        );

        let err = manager.connect("agriculture-room").await.unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));
        assert_eq!(manager.state(), SessionState::Idle);
        assert_eq!(transport.joins.load(Ordering::SeqCst), 0);
        assert!(manager.last_error().unwrap().contains("LIVEKIT_WS_URL"));
    }

    #[tokio::test]
    async fn test_token_failure_skips_join() {
        let mut credentials = MockCredentialProvider::new();
        credentials
            .expect_fetch_credential()
            .times(1)
            .returning(|_, _| Err(TokenError::MissingToken));
        let transport = Arc::new(CountingTransport::default());
        let manager = manager(config(), credentials, transport.clone(), MockAudioCapture::new());

        let err = manager.connect("agriculture-room").await.unwrap_err();
        assert!(matches!(err, SessionError::Token(TokenError::MissingToken)));
        assert_eq!(transport.joins.load(Ordering::SeqCst), 0);
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(manager.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_identifiers_are_passed_to_token_service() {
        let mut credentials = MockCredentialProvider::new();
        credentials
            .expect_fetch_credential()
            .withf(|room, participant| {
                room.to_string() == "agriculture-room-test01"
                    && participant.to_string() == "farmer-test01"
            })
            .times(1)
            .returning(|_, _| Ok(Credential::new("abc")));
        let stopped = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(CountingTransport::default());
        let manager = manager(config(), credentials, transport, working_capture(stopped));

        let ids = manager.connect("agriculture-room").await.expect("connects");
        assert_eq!(ids.room, "agriculture-room-test01");
        assert_eq!(manager.session_info(), Some(ids));
    }

    #[tokio::test]
    async fn test_join_failure_returns_to_idle() {
        let transport = Arc::new(CountingTransport {
            fail_join: true,
            ..Default::default()
        });
        let mut capture = MockAudioCapture::new();
        capture.expect_open_microphone().never();
        let manager = manager(config(), granting_credentials(), transport.clone(), capture);

        let err = manager.connect("agriculture-room").await.unwrap_err();
        assert!(matches!(err, SessionError::TransportJoin(_)));
        assert_eq!(transport.joins.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(manager.session_info().is_none());
    }

    #[tokio::test]
    async fn test_capture_failure_closes_joined_room() {
        let mut credentials = MockCredentialProvider::new();
        credentials
            .expect_fetch_credential()
            .times(2)
            .returning(|_, _| Ok(Credential::new("abc")));
        let mut capture = MockAudioCapture::new();
        capture
            .expect_open_microphone()
            .times(2)
            .returning(|| Err(anyhow::anyhow!("microphone permission denied")));
        let transport = Arc::new(CountingTransport::default());
        let manager = manager(config(), credentials, transport.clone(), capture);

        let err = manager.connect("agriculture-room").await.unwrap_err();
        assert!(matches!(err, SessionError::Capture(_)));
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(manager.last_error().unwrap().contains("permission denied"));

        // Listeners were deregistered with the rollback.
        let sender = transport.events.lock().unwrap().clone().unwrap();
        for _ in 0..10 {
            if sender.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(sender.is_closed());

        // Immediately retryable: the second attempt runs the full sequence again.
        let err = manager.connect("agriculture-room").await.unwrap_err();
        assert!(matches!(err, SessionError::Capture(_)));
        assert_eq!(transport.joins.load(Ordering::SeqCst), 2);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disconnect_releases_everything_even_if_close_fails() {
        let stopped = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(CountingTransport::default());
        let manager = manager(
            config(),
            granting_credentials(),
            transport.clone(),
            working_capture(stopped.clone()),
        );

        manager.connect("agriculture-room").await.expect("connects");
        assert_eq!(manager.state(), SessionState::Connected);
        assert_eq!(manager.transcript().len(), 1);

        manager.disconnect().await;
        assert_eq!(manager.state(), SessionState::Idle);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert!(manager.transcript().is_empty());
        assert!(manager.last_error().is_none());
        assert!(manager.session_info().is_none());

        manager.disconnect().await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }
}
