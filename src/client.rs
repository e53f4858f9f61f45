//! The Syncplay protocol engine.
//!
//! [`SyncplayClient::connect`] opens the TCP connection, performs the TLS
//! capability exchange and the hello, then spawns a background read loop that
//! processes one line at a time and feeds the shared session state. Events
//! are emitted on a bounded channel returned from `connect`; the loop's own
//! completion is observed by awaiting [`SyncplayClient::join`].
//!
//! # Example
//!
//! ```rust,ignore
//! let config = SyncplayConfig::new("syncplay.example.org", 8995, "alice", "movie-night")
//!     .with_password("hunter2");
//! let (client, mut events) = SyncplayClient::connect(config, CancellationToken::new()).await?;
//!
//! client.send_chat("hello from rust").await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SyncplayEvent::UserJoined { user } => { /* … */ }
//!         SyncplayEvent::ForcedPlaybackState { state } => { /* seek to match */ }
//!         _ => {}
//!     }
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use md5::{Digest, Md5};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, SyncplayError};
use crate::event::SyncplayEvent;
use crate::ignore::IgnoringOnTheFly;
use crate::protocol::{
    ChatMessage, Envelope, FeatureSet, Hello, IgnoringCounters, MediaFile, Ping, PlayState,
    PlaylistChange, PlaylistIndexChange, ReadyChange, RoomListSnapshot, RoomRef, SetMessage,
    StateMessage, TlsDirective, TlsMessage, CLIENT_VERSION, PROTOCOL_VERSION,
};
use crate::roster::{PlaybackState, RoomUser, Roster};
use crate::rtt::RttEstimator;
use crate::transport::{self, MaybeTlsStream, MessageReader, MessageWriter};

/// Default capacity of the bounded event channel.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Configuration ───────────────────────────────────────────────────

/// The locally-true playback state, supplied by the embedding application.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassiveStateReport {
    /// Current playback position, seconds.
    pub position: f64,
    pub paused: bool,
}

type StateReporter = dyn Fn() -> Option<PassiveStateReport> + Send + Sync;

/// Configuration for a [`SyncplayClient`] connection.
///
/// Host, port, username and room are required; everything else has a default.
#[derive(Clone)]
pub struct SyncplayConfig {
    pub host: String,
    pub port: u16,
    /// Requested username. The server's hello response is authoritative and
    /// may assign a different one.
    pub username: String,
    /// Requested room name; also overwritten by the hello response.
    pub room: String,
    /// Room password. Sent as a lowercase-hex MD5 digest, never in plaintext.
    pub password: Option<String>,
    /// Capabilities advertised in the hello.
    pub features: FeatureSet,
    /// Capacity of the bounded event channel. Values below 1 are clamped to 1.
    /// When the consumer cannot keep up, events are dropped with a warning so
    /// the read loop never blocks.
    pub event_channel_capacity: usize,
    state_reporter: Option<Arc<StateReporter>>,
}

impl SyncplayConfig {
    /// Create a configuration with default capabilities and no password.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        room: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            room: room.into(),
            password: None,
            features: FeatureSet::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            state_reporter: None,
        }
    }

    /// Set the room password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Override the advertised capability set.
    #[must_use]
    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }

    /// Set the capacity of the bounded event channel.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Install a callback that reports the locally-true playback state.
    ///
    /// When the server asks for state and no forced change is pending, the
    /// reply carries this report so a passive client can tell the truth
    /// without fighting an in-flight forced change.
    #[must_use]
    pub fn with_state_reporter<F>(mut self, reporter: F) -> Self
    where
        F: Fn() -> Option<PassiveStateReport> + Send + Sync + 'static,
    {
        self.state_reporter = Some(Arc::new(reporter));
        self
    }
}

impl std::fmt::Debug for SyncplayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncplayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("room", &self.room)
            .field("password", &self.password.as_ref().map(|_| "<set>"))
            .field("event_channel_capacity", &self.event_channel_capacity)
            .field("has_state_reporter", &self.state_reporter.is_some())
            .finish()
    }
}

// ── Shared state ────────────────────────────────────────────────────

/// Everything the read loop mutates and the public API reads as snapshots.
struct Session {
    username: String,
    room: String,
    server_features: Option<FeatureSet>,
    server_version: Option<String>,
    motd: Option<String>,
    playback: PlaybackState,
    roster: Roster,
    rtt: RttEstimator,
    ignoring: IgnoringOnTheFly,
}

impl Session {
    fn new(config: &SyncplayConfig) -> Self {
        Self {
            username: config.username.clone(),
            room: config.room.clone(),
            server_features: None,
            server_version: None,
            motd: None,
            playback: PlaybackState::default(),
            roster: Roster::new(),
            rtt: RttEstimator::new(),
            ignoring: IgnoringOnTheFly::new(),
        }
    }
}

/// State shared between the client handle and the read loop.
struct Shared {
    connected: AtomicBool,
    /// Held only for short synchronous critical sections; never across awaits.
    session: StdMutex<Session>,
    /// The single write lock: public sends and the loop's reactive replies
    /// both serialize through here.
    writer: tokio::sync::Mutex<MessageWriter>,
    state_reporter: Option<Arc<StateReporter>>,
    event_tx: mpsc::Sender<SyncplayEvent>,
}

fn lock(session: &StdMutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Client handle ───────────────────────────────────────────────────

/// Async client handle for a Syncplay session.
///
/// Created via [`SyncplayClient::connect`]. All send methods fail fast with
/// [`SyncplayError::NotConnected`] once the transport is gone; all query
/// methods return snapshot copies and are safe to call concurrently with the
/// read loop.
pub struct SyncplayClient {
    shared: Arc<Shared>,
    task: Option<JoinHandle<Result<()>>>,
    cancel: CancellationToken,
}

impl SyncplayClient {
    /// Connect, perform the TLS capability exchange and the hello, and spawn
    /// the background read loop.
    ///
    /// The returned receiver yields [`SyncplayEvent`]s until the loop exits.
    /// Cancelling `cancel` aborts an in-progress connect or handshake and
    /// later stops the read loop; the loop's outcome is observed via
    /// [`SyncplayClient::join`].
    ///
    /// # Errors
    ///
    /// [`SyncplayError::Io`] when the connection fails, [`SyncplayError::Tls`]
    /// when certificate validation fails (never silently downgraded),
    /// [`SyncplayError::HandshakeIncomplete`] when the server hangs up during
    /// the TLS negotiation, [`SyncplayError::Cancelled`] when the token fires.
    pub async fn connect(
        config: SyncplayConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<SyncplayEvent>)> {
        let mut stream =
            run_cancellable(&cancel, transport::connect_tcp(&config.host, config.port)).await?;
        info!(host = %config.host, port = config.port, "connection established");

        // The server will not process anything until the TLS capability
        // exchange completes, so it happens here rather than in the loop.
        let probe = serde_json::to_string(&Envelope::tls(TlsMessage {
            start_tls: TlsDirective::Send,
        }))?;
        run_cancellable(&cancel, transport::write_line(&mut stream, &probe)).await?;
        let response = run_cancellable(&cancel, transport::read_probe_line(&mut stream)).await?;
        let decision: Envelope = serde_json::from_str(&response)?;

        let stream = match decision.tls {
            Some(TlsMessage {
                start_tls: TlsDirective::True,
            }) => run_cancellable(&cancel, transport::upgrade_tls(stream, &config.host)).await?,
            _ => MaybeTlsStream::Plain(stream),
        };

        let (reader, mut writer) = transport::split(stream);

        let hello = Envelope::hello(Hello {
            username: config.username.clone(),
            password: config.password.as_deref().map(password_digest),
            room: RoomRef::new(config.room.clone()),
            version: PROTOCOL_VERSION.to_string(),
            real_version: Some(CLIENT_VERSION.to_string()),
            features: config.features.clone(),
            motd: None,
        });
        let hello_line = serde_json::to_string(&hello)?;
        run_cancellable(&cancel, writer.write_line(&hello_line)).await?;

        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);

        let shared = Arc::new(Shared {
            connected: AtomicBool::new(true),
            session: StdMutex::new(Session::new(&config)),
            writer: tokio::sync::Mutex::new(writer),
            state_reporter: config.state_reporter.clone(),
            event_tx,
        });

        let task = tokio::spawn(read_loop(reader, Arc::clone(&shared), cancel.clone()));

        let client = Self {
            shared,
            task: Some(task),
            cancel,
        };
        Ok((client, event_rx))
    }

    // ── Command surface ─────────────────────────────────────────────

    /// Send a chat message to the current room.
    ///
    /// # Errors
    ///
    /// [`SyncplayError::NotConnected`] if the transport has closed.
    pub async fn send_chat(&self, message: impl Into<String>) -> Result<()> {
        self.send(&Envelope::chat_send(message)).await
    }

    /// Replace the shared playlist.
    ///
    /// # Errors
    ///
    /// [`SyncplayError::NotConnected`] if the transport has closed.
    pub async fn set_playlist(&self, files: Vec<String>) -> Result<()> {
        self.send(&Envelope::set(SetMessage {
            playlist_change: Some(PlaylistChange {
                changed_by: None,
                files,
            }),
            ..SetMessage::default()
        }))
        .await
    }

    /// Select a playlist entry by index.
    ///
    /// # Errors
    ///
    /// [`SyncplayError::NotConnected`] if the transport has closed.
    pub async fn set_playlist_index(&self, index: i64) -> Result<()> {
        self.send(&Envelope::set(SetMessage {
            playlist_index: Some(PlaylistIndexChange {
                changed_by: None,
                index: Some(index),
            }),
            ..SetMessage::default()
        }))
        .await
    }

    /// Set the local user's ready flag.
    ///
    /// # Errors
    ///
    /// [`SyncplayError::NotConnected`] if the transport has closed.
    pub async fn set_ready(&self, ready: bool) -> Result<()> {
        self.send_ready(None, ready).await
    }

    /// Set another user's ready flag (where the server permits it).
    ///
    /// # Errors
    ///
    /// [`SyncplayError::NotConnected`] if the transport has closed.
    pub async fn set_user_ready(&self, username: impl Into<String>, ready: bool) -> Result<()> {
        self.send_ready(Some(username.into()), ready).await
    }

    /// Announce the local media file.
    ///
    /// # Errors
    ///
    /// [`SyncplayError::NotConnected`] if the transport has closed.
    pub async fn set_file(&self, file: MediaFile) -> Result<()> {
        self.send(&Envelope::set(SetMessage {
            file: Some(file),
            ..SetMessage::default()
        }))
        .await
    }

    /// Force a playback state on the room.
    ///
    /// Increments the ignoring-on-the-fly counter and sends it together with
    /// a fresh ping sub-message; server playstate broadcasts are then ignored
    /// until the server echoes the counter back.
    ///
    /// # Errors
    ///
    /// [`SyncplayError::NotConnected`] if the transport has closed.
    pub async fn force_playback_state(
        &self,
        paused: bool,
        position: f64,
        is_seek: bool,
    ) -> Result<()> {
        self.ensure_connected()?;
        let envelope = {
            let mut session = lock(&self.shared.session);
            let counter = session.ignoring.begin_forced_change();
            Envelope::state(StateMessage {
                playstate: Some(PlayState {
                    position,
                    paused,
                    do_seek: Some(is_seek),
                    set_by: None,
                }),
                ignoring_on_the_fly: Some(IgnoringCounters {
                    server: 0,
                    client: counter,
                }),
                ping: Some(Ping {
                    latency_calculation: None,
                    client_latency_calculation: Some(unix_time_seconds()),
                    server_rtt: None,
                    client_rtt: Some(session.rtt.client_rtt()),
                }),
            })
        };
        self.send(&envelope).await
    }

    /// Move to a different room, then request a fresh membership snapshot so
    /// ready states are known.
    ///
    /// # Errors
    ///
    /// [`SyncplayError::NotConnected`] if the transport has closed.
    pub async fn move_to_room(&self, room: impl Into<String>) -> Result<()> {
        self.send(&Envelope::set(SetMessage {
            room: Some(RoomRef::new(room)),
            ..SetMessage::default()
        }))
        .await?;
        self.send(&Envelope::list_request()).await
    }

    // ── Lookups and snapshots ───────────────────────────────────────

    /// Fetch a user by name, if known.
    pub fn user(&self, username: &str) -> Option<RoomUser> {
        lock(&self.shared.session).roster.get(username).cloned()
    }

    /// Fetch a user by name, with an explicit not-found error.
    ///
    /// # Errors
    ///
    /// [`SyncplayError::UnknownUser`] when no such user is registered.
    pub fn try_user(&self, username: &str) -> Result<RoomUser> {
        self.user(username)
            .ok_or_else(|| SyncplayError::UnknownUser(username.to_string()))
    }

    /// All currently known users, across every room the server reported.
    pub fn users(&self) -> Vec<RoomUser> {
        lock(&self.shared.session).roster.users().cloned().collect()
    }

    /// The registry entry for the local session's own username, if present.
    pub fn current_user(&self) -> Option<RoomUser> {
        let session = lock(&self.shared.session);
        session.roster.get(&session.username).cloned()
    }

    /// The server-assigned username.
    pub fn username(&self) -> String {
        lock(&self.shared.session).username.clone()
    }

    /// The current room name.
    pub fn room_name(&self) -> String {
        lock(&self.shared.session).room.clone()
    }

    /// The server's version string, once the hello response has arrived.
    pub fn server_version(&self) -> Option<String> {
        lock(&self.shared.session).server_version.clone()
    }

    /// The server's negotiated feature set, once the hello response arrived.
    pub fn server_features(&self) -> Option<FeatureSet> {
        lock(&self.shared.session).server_features.clone()
    }

    /// The server's message of the day, if it sent one.
    pub fn motd(&self) -> Option<String> {
        lock(&self.shared.session).motd.clone()
    }

    /// The last accepted server playback state.
    pub fn playback(&self) -> PlaybackState {
        lock(&self.shared.session).playback.clone()
    }

    /// The current shared playlist.
    pub fn playlist(&self) -> Vec<String> {
        lock(&self.shared.session).roster.playlist().to_vec()
    }

    /// The selected playlist index; `-1` means "none selected".
    pub fn playlist_index(&self) -> i64 {
        lock(&self.shared.session).roster.playlist_index()
    }

    /// The playlist entry at the selected index, if in range.
    pub fn selected_playlist_entry(&self) -> Option<String> {
        lock(&self.shared.session).roster.selected_entry().cloned()
    }

    /// Most recent raw client RTT sample, seconds.
    pub fn client_rtt(&self) -> f64 {
        lock(&self.shared.session).rtt.client_rtt()
    }

    /// Most recent server-measured RTT, seconds.
    pub fn server_rtt(&self) -> f64 {
        lock(&self.shared.session).rtt.server_rtt()
    }

    /// Estimated one-way latency used for position dead-reckoning.
    pub fn forward_delay(&self) -> f64 {
        lock(&self.shared.session).rtt.forward_delay()
    }

    /// Whether the transport is believed to be connected.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Ask the read loop to stop and close the transport. The outcome is
    /// observed by awaiting [`SyncplayClient::join`].
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Await the background read loop's completion.
    ///
    /// Returns `Ok(())` on a clean server-side close,
    /// [`SyncplayError::Cancelled`] when stopped via the cancellation token,
    /// and the transport or protocol error otherwise. Returns `Ok(())` when
    /// the loop was already joined.
    ///
    /// # Errors
    ///
    /// See above; there is no separate "connection dropped" event.
    pub async fn join(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(join_err) if join_err.is_cancelled() => Err(SyncplayError::Cancelled),
            Err(join_err) => Err(SyncplayError::Io(std::io::Error::other(join_err))),
        }
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn ensure_connected(&self) -> Result<()> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(SyncplayError::NotConnected);
        }
        Ok(())
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        self.ensure_connected()?;
        send_envelope(&self.shared, envelope).await
    }

    async fn send_ready(&self, username: Option<String>, ready: bool) -> Result<()> {
        self.send(&Envelope::set(SetMessage {
            ready: Some(ReadyChange {
                username,
                is_ready: Some(ready),
                manually_initiated: true,
                set_by: None,
            }),
            ..SetMessage::default()
        }))
        .await
    }
}

impl std::fmt::Debug for SyncplayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncplayClient")
            .field("connected", &self.is_connected())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for SyncplayClient {
    fn drop(&mut self) {
        // Dropping the handle without join() must not leave the loop running
        // forever; the token stops it at its next suspension point.
        self.cancel.cancel();
    }
}

// ── Read loop ───────────────────────────────────────────────────────

/// Background loop: one line per iteration for as long as the transport is
/// connected. Exits `Ok` on clean end-of-stream, `Err(Cancelled)` on the
/// token, and `Err` on transport or decode failures. The transport is closed
/// on every path.
async fn read_loop(
    mut reader: MessageReader,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) -> Result<()> {
    debug!("read loop started");

    let result = loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break Err(SyncplayError::Cancelled),
            line = reader.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if let Err(e) = handle_line(&shared, &line).await {
                    error!(error = %e, "failed to process inbound line");
                    break Err(e);
                }
            }
            Ok(None) => {
                debug!("server closed the connection");
                break Ok(());
            }
            Err(e) => break Err(e),
        }
    };

    shared.connected.store(false, Ordering::Release);
    if let Err(e) = shared.writer.lock().await.shutdown().await {
        debug!(error = %e, "error shutting down write half");
    }
    debug!("read loop exited");
    result
}

/// Decode one line and dispatch every tag present on it.
async fn handle_line(shared: &Arc<Shared>, line: &str) -> Result<()> {
    let envelope: Envelope = serde_json::from_str(line)?;

    // Hello first: the server usually sends it alongside state messages and
    // the membership request must go out before those are reacted to.
    if let Some(hello) = envelope.hello {
        handle_hello(shared, hello).await?;
    }

    if envelope.tls.is_some() {
        warn!("server sent a TLS directive after initialization; ignoring");
    }

    if let Some(state) = envelope.state {
        handle_state(shared, state).await?;
    }

    if let Some(set) = envelope.set {
        handle_set(shared, set);
    }

    if let Some(chat) = envelope.chat {
        handle_chat(shared, chat);
    }

    if let Some(Some(list)) = envelope.list {
        handle_list(shared, &list);
    }

    if let Some(error) = envelope.error {
        warn!(message = %error.message, "server reported an error");
        emit(
            shared,
            SyncplayEvent::ServerError {
                message: error.message,
            },
        );
    }

    for key in envelope.unknown.keys() {
        warn!(command = %key, raw = %line, "unknown command");
    }

    Ok(())
}

async fn handle_hello(shared: &Arc<Shared>, hello: Hello) -> Result<()> {
    info!(username = %hello.username, room = %hello.room.name, "hello received");

    let event = {
        let mut session = lock(&shared.session);
        session.username = hello.username.clone();
        session.room = hello.room.name.clone();
        session.server_features = Some(hello.features);
        session.server_version = hello.real_version.clone();
        session.motd = hello.motd.clone();
        SyncplayEvent::HelloReceived {
            username: hello.username,
            room: hello.room.name,
            server_version: hello.real_version,
            motd: hello.motd,
        }
    };
    emit(shared, event);

    // The server's own user-list broadcast is not guaranteed to follow the
    // hello in a useful order; ask for a full snapshot explicitly.
    send_envelope(shared, &Envelope::list_request()).await
}

/// Ping handling and play-state reconciliation. Ping first so the forward
/// delay is current when the position is dead-reckoned.
async fn handle_state(shared: &Arc<Shared>, state: StateMessage) -> Result<()> {
    let mut reply = StateMessage::default();
    let mut forced_state = None;
    let mut report_passively = false;

    {
        let mut session = lock(&shared.session);

        if let Some(ping) = &state.ping {
            if let (Some(sent_at), Some(server_rtt)) =
                (ping.client_latency_calculation, ping.server_rtt)
            {
                session.rtt.record_sample(sent_at, server_rtt, unix_time_seconds());
            }
            reply.ping = Some(Ping {
                latency_calculation: ping.latency_calculation,
                client_latency_calculation: Some(unix_time_seconds()),
                server_rtt: None,
                client_rtt: Some(session.rtt.client_rtt()),
            });
            trace!(
                client_rtt = session.rtt.client_rtt(),
                server_rtt = session.rtt.server_rtt(),
                forward_delay = session.rtt.forward_delay(),
                "ping"
            );
        }

        if let Some(playstate) = &state.playstate {
            let had_pending = session.ignoring.is_ignoring();
            let counters = state.ignoring_on_the_fly;
            let server_forcing = counters.is_some_and(|c| c.server != 0);

            // Leave the recorded state alone while our own forced change is
            // waiting to be acknowledged — unless the server demands one.
            if !had_pending || server_forcing {
                session.playback.position = playstate.position;
                session.playback.paused = playstate.paused;
                session.playback.set_by = playstate.set_by.clone();
                session.playback.last_was_seek = playstate.do_seek.unwrap_or(false);

                // Dead-reckon for network latency while playing.
                if state.ping.is_some() && !session.playback.paused {
                    session.playback.position += session.rtt.forward_delay();
                }
            }

            if let Some(counters) = counters {
                // Server acknowledged our forced change.
                session.ignoring.acknowledge(counters.client);

                // The server forces its own change: cede priority and echo
                // its counter back unconditionally.
                if counters.server != 0 {
                    session.ignoring.yield_to_server();
                    reply.ignoring_on_the_fly = Some(IgnoringCounters {
                        server: counters.server,
                        client: 0,
                    });
                    if !had_pending {
                        forced_state = Some(session.playback.clone());
                    }
                }
            }

            report_passively = !session.ignoring.is_ignoring();
        }
    }

    if let Some(state) = forced_state {
        emit(shared, SyncplayEvent::ForcedPlaybackState { state });
    }

    // With nothing pending, answer the server's query with the locally-true
    // state. The reporter runs outside the session lock so it may call back
    // into the client.
    if report_passively {
        if let Some(report) = shared.state_reporter.as_ref().and_then(|r| r()) {
            reply.playstate = Some(PlayState {
                position: report.position,
                paused: report.paused,
                do_seek: None,
                set_by: None,
            });
        }
    }

    // Always reply, even if empty, to keep the ping cadence alive.
    send_envelope(shared, &Envelope::state(reply)).await
}

fn handle_set(shared: &Arc<Shared>, set: SetMessage) {
    if let Some(users) = set.user {
        handle_set_users(shared, users);
    }
    if let Some(ready) = set.ready {
        handle_set_ready(shared, ready);
    }
    if let Some(change) = set.playlist_change {
        handle_playlist_change(shared, change);
    }
    if let Some(index) = set.playlist_index {
        handle_playlist_index(shared, index);
    }
}

fn handle_set_users(
    shared: &Arc<Shared>,
    users: std::collections::HashMap<String, crate::protocol::UserChange>,
) {
    for (username, change) in users {
        if let Some(event) = &change.event {
            if event.joined {
                let room = change
                    .room
                    .as_ref()
                    .map(|r| r.name.as_str())
                    .unwrap_or_default();
                let outcome = {
                    let mut session = lock(&shared.session);
                    session.roster.add_joined(&username, room, event, None)
                };
                match outcome {
                    Ok(user) => {
                        info!(username = %username, room = %room, "user joined");
                        emit(shared, SyncplayEvent::UserJoined { user });
                    }
                    Err(_) => {
                        error!(
                            username = %username,
                            "join event for user already in registry; skipping"
                        );
                        continue;
                    }
                }
                // A file announced with the join is handled by the file
                // block below, so it is raised as its own change.
            }

            if event.left {
                let outcome = lock(&shared.session).roster.remove_left(&username);
                match outcome {
                    Ok(user) => {
                        info!(username = %username, room = %user.room, "user left");
                        emit(shared, SyncplayEvent::UserLeft { user });
                    }
                    Err(_) => {
                        error!(
                            username = %username,
                            "leave event for user missing from registry; skipping"
                        );
                    }
                }
                continue;
            }
        } else if let Some(room) = &change.room {
            let outcome = {
                let mut session = lock(&shared.session);
                let moved = session.roster.set_room(&username, &room.name);
                if let Ok(Some(_)) = &moved {
                    if session.username == username {
                        session.room = room.name.clone();
                    }
                }
                moved
            };
            match outcome {
                Ok(Some((user, previous_room))) => {
                    trace!(
                        username = %username,
                        from = %previous_room,
                        to = %room.name,
                        "user changed room"
                    );
                    emit(
                        shared,
                        SyncplayEvent::UserRoomChanged {
                            user,
                            previous_room,
                        },
                    );
                }
                Ok(None) => {}
                Err(_) => {
                    error!(
                        username = %username,
                        "room change for user missing from registry; skipping"
                    );
                }
            }
        }

        if let Some(file) = change.file {
            let outcome = lock(&shared.session).roster.set_file(&username, file);
            match outcome {
                Ok((user, previous)) => {
                    trace!(username = %username, file = ?user.file, "user changed file");
                    emit(shared, SyncplayEvent::UserFileChanged { user, previous });
                }
                Err(_) => {
                    error!(
                        username = %username,
                        "file update for user missing from registry; skipping"
                    );
                }
            }
        }
    }
}

fn handle_set_ready(shared: &Arc<Shared>, ready: ReadyChange) {
    let (Some(username), Some(is_ready)) = (ready.username, ready.is_ready) else {
        debug!("ready change missing username or flag; ignoring");
        return;
    };

    let outcome = {
        let mut session = lock(&shared.session);
        session.roster.set_ready(&username, is_ready).map(|user| {
            let initiated_by = ready
                .set_by
                .as_deref()
                .and_then(|name| session.roster.get(name).cloned());
            (user, initiated_by)
        })
    };
    match outcome {
        Ok((user, initiated_by)) => {
            trace!(username = %username, ready = is_ready, "user ready state changed");
            emit(shared, SyncplayEvent::UserReadyChanged { user, initiated_by });
        }
        Err(_) => {
            warn!(username = %username, "user not in registry; ignoring ready state");
        }
    }
}

fn handle_playlist_change(shared: &Arc<Shared>, change: PlaylistChange) {
    let (previous, changed_by) = {
        let mut session = lock(&shared.session);
        let previous = session.roster.replace_playlist(change.files.clone());
        let changed_by = change
            .changed_by
            .as_deref()
            .and_then(|name| session.roster.get(name).cloned());
        (previous, changed_by)
    };
    trace!(by = ?change.changed_by, files = ?change.files, "playlist changed");
    emit(
        shared,
        SyncplayEvent::PlaylistChanged {
            previous,
            playlist: change.files,
            changed_by,
        },
    );
}

fn handle_playlist_index(shared: &Arc<Shared>, change: PlaylistIndexChange) {
    let index = change.index.unwrap_or(-1);
    let (previous, changed_by) = {
        let mut session = lock(&shared.session);
        let previous = session.roster.set_playlist_index(index);
        let changed_by = change
            .changed_by
            .as_deref()
            .and_then(|name| session.roster.get(name).cloned());
        (previous, changed_by)
    };
    trace!(by = ?change.changed_by, index, "playlist index changed");
    emit(
        shared,
        SyncplayEvent::PlaylistIndexChanged {
            previous,
            index,
            changed_by,
        },
    );
}

fn handle_chat(shared: &Arc<Shared>, chat: ChatMessage) {
    match chat {
        ChatMessage::Received { username, message } => {
            trace!(from = %username, %message, "chat received");
            emit(shared, SyncplayEvent::ChatReceived { username, message });
        }
        ChatMessage::Send(_) => {
            warn!("server sent a bare-string chat message; ignoring");
        }
    }
}

/// Merge a full membership snapshot. Snapshots update or insert, never
/// remove — removal only happens via explicit leave events.
fn handle_list(shared: &Arc<Shared>, snapshot: &RoomListSnapshot) {
    let mut session = lock(&shared.session);
    for (room, users) in snapshot {
        for (username, entry) in users {
            trace!(username = %username, room = %room, "merging list entry");
            session.roster.merge_list_entry(room, username, entry);
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Serialize and write one envelope through the shared write lock.
async fn send_envelope(shared: &Shared, envelope: &Envelope) -> Result<()> {
    let json = serde_json::to_string(envelope)?;
    shared.writer.lock().await.write_line(&json).await
}

/// Emit an event without blocking the loop. When the channel is full the
/// event is dropped with a warning.
fn emit(shared: &Shared, event: SyncplayEvent) {
    match shared.event_tx.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(dropped)) => {
            warn!(
                event = ?std::mem::discriminant(&dropped),
                "event channel full, dropping event"
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("event channel closed, receiver dropped");
        }
    }
}

/// Race a fallible future against the cancellation token.
async fn run_cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        () = cancel.cancelled() => Err(SyncplayError::Cancelled),
        out = fut => out,
    }
}

/// Wall clock as fractional unix seconds, the protocol's timestamp format.
fn unix_time_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Lowercase-hex MD5 digest of the room password's UTF-8 bytes.
fn password_digest(password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn password_digest_is_lowercase_hex_md5() {
        // md5("") and md5("password") are well-known vectors.
        assert_eq!(password_digest(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(
            password_digest("password"),
            "5f4dcc3b5aa765d61d8327deb882cf99"
        );
    }

    #[test]
    fn config_defaults() {
        let config = SyncplayConfig::new("localhost", 8995, "alice", "movie-night");
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8995);
        assert_eq!(config.username, "alice");
        assert_eq!(config.room, "movie-night");
        assert!(config.password.is_none());
        assert_eq!(config.event_channel_capacity, 256);
        assert!(config.state_reporter.is_none());
    }

    #[test]
    fn config_builder_methods() {
        let config = SyncplayConfig::new("localhost", 8995, "alice", "room")
            .with_password("hunter2")
            .with_event_channel_capacity(16)
            .with_state_reporter(|| {
                Some(PassiveStateReport {
                    position: 1.0,
                    paused: false,
                })
            });
        assert_eq!(config.password.as_deref(), Some("hunter2"));
        assert_eq!(config.event_channel_capacity, 16);
        assert!(config.state_reporter.is_some());
    }

    #[test]
    fn event_channel_capacity_is_clamped_to_one() {
        let config =
            SyncplayConfig::new("h", 1, "u", "r").with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[test]
    fn config_debug_hides_the_password() {
        let config = SyncplayConfig::new("h", 1, "u", "r").with_password("secret");
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("<set>"));
    }

    #[test]
    fn unix_time_is_fractional_seconds_since_epoch() {
        let now = unix_time_seconds();
        // 2020-01-01 as a sanity floor.
        assert!(now > 1_577_836_800.0);
    }
}
