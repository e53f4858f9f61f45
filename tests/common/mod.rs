#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Shared test utilities for syncplay-client integration tests.
//!
//! Provides a loopback [`ServerHarness`] that speaks the line protocol over a
//! real TCP socket, plus helper functions for constructing common server
//! message JSON strings.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use syncplay_client::protocol::{
    ChatMessage, Envelope, ErrorMessage, FeatureSet, Hello, IgnoringCounters, MediaFile, Ping,
    PlayState, PlaylistChange, PlaylistIndexChange, ReadyChange, RoomRef, SetMessage, StateMessage,
    TlsDirective, TlsMessage, UserChange, UserEvent, CLIENT_VERSION, PROTOCOL_VERSION,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing once per test binary. Set `RUST_LOG=trace` to see the
/// full line exchange; output is captured per test.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

// ── ServerHarness ───────────────────────────────────────────────────

/// A scripted loopback server for one client connection.
///
/// Accepts a single client, answers the TLS capability probe with
/// `startTLS: false` automatically, and otherwise exchanges lines through
/// channels: everything the client sends (the probe included) comes out of
/// [`ServerHarness::recv_line`], and [`ServerHarness::send_line`] pushes a
/// line to the client. [`ServerHarness::close`] ends the server's write side
/// so the client observes a clean end-of-stream.
pub struct ServerHarness {
    pub addr: SocketAddr,
    from_client: mpsc::Receiver<String>,
    to_client: Option<mpsc::Sender<String>>,
    _task: JoinHandle<()>,
}

impl ServerHarness {
    /// Bind an ephemeral port and start serving one connection.
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");

        let (line_tx, from_client) = mpsc::channel::<String>(64);
        let (to_client, mut outbound) = mpsc::channel::<String>(64);

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut outbound_open = true;

            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Ok(Some(line)) = line else { break };
                        if is_tls_probe(&line) {
                            let answer = tls_answer_json(TlsDirective::False);
                            if write.write_all(answer.as_bytes()).await.is_err() {
                                break;
                            }
                            let _ = write.write_all(b"\r\n").await;
                        }
                        if line_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    out = outbound.recv(), if outbound_open => {
                        match out {
                            Some(line) => {
                                if write.write_all(line.as_bytes()).await.is_err() {
                                    break;
                                }
                                let _ = write.write_all(b"\r\n").await;
                            }
                            None => {
                                outbound_open = false;
                                let _ = write.shutdown().await;
                            }
                        }
                    }
                }
            }
        });

        Self {
            addr,
            from_client,
            to_client: Some(to_client),
            _task: task,
        }
    }

    /// Next line the client sent. Panics after five seconds.
    pub async fn recv_line(&mut self) -> String {
        timeout(RECV_TIMEOUT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client line")
            .expect("client connection closed")
    }

    /// Next line the client sent, parsed as JSON.
    pub async fn recv_json(&mut self) -> serde_json::Value {
        let line = self.recv_line().await;
        serde_json::from_str(&line).expect("client sent invalid JSON")
    }

    /// Push one line to the client.
    pub async fn send_line(&self, line: impl Into<String>) {
        self.to_client
            .as_ref()
            .expect("server already closed")
            .send(line.into())
            .await
            .expect("server task gone");
    }

    /// Close the server's write side; the client sees a clean end-of-stream.
    pub fn close(&mut self) {
        self.to_client = None;
    }
}

fn is_tls_probe(line: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .is_some_and(|v| v["TLS"]["startTLS"] == "send")
}

// ── JSON helper functions ───────────────────────────────────────────

fn to_json(envelope: &Envelope) -> String {
    serde_json::to_string(envelope).expect("envelope serialization")
}

/// Returns the JSON string for a `TLS` capability answer.
pub fn tls_answer_json(directive: TlsDirective) -> String {
    to_json(&Envelope::tls(TlsMessage {
        start_tls: directive,
    }))
}

/// Returns the JSON string for a server `Hello` response.
pub fn server_hello_json(username: &str, room: &str, motd: Option<&str>) -> String {
    to_json(&Envelope::hello(Hello {
        username: username.into(),
        password: None,
        room: RoomRef::new(room),
        version: PROTOCOL_VERSION.into(),
        real_version: Some(CLIENT_VERSION.into()),
        features: FeatureSet::default(),
        motd: motd.map(Into::into),
    }))
}

/// Returns the JSON string for a `Set/user` join event.
pub fn user_joined_json(username: &str, room: &str, file: Option<MediaFile>) -> String {
    let change = UserChange {
        room: Some(RoomRef::new(room)),
        event: Some(UserEvent {
            joined: true,
            left: false,
            version: Some(CLIENT_VERSION.into()),
            features: Some(FeatureSet::default()),
        }),
        file,
    };
    to_json(&Envelope::set(SetMessage {
        user: Some(HashMap::from([(username.to_string(), change)])),
        ..SetMessage::default()
    }))
}

/// Returns the JSON string for a `Set/user` leave event.
pub fn user_left_json(username: &str) -> String {
    let change = UserChange {
        event: Some(UserEvent {
            joined: false,
            left: true,
            version: None,
            features: None,
        }),
        ..UserChange::default()
    };
    to_json(&Envelope::set(SetMessage {
        user: Some(HashMap::from([(username.to_string(), change)])),
        ..SetMessage::default()
    }))
}

/// Returns the JSON string for a `Set/user` room change.
pub fn user_room_json(username: &str, room: &str) -> String {
    let change = UserChange {
        room: Some(RoomRef::new(room)),
        ..UserChange::default()
    };
    to_json(&Envelope::set(SetMessage {
        user: Some(HashMap::from([(username.to_string(), change)])),
        ..SetMessage::default()
    }))
}

/// Returns the JSON string for a `Set/ready` change.
pub fn ready_json(username: &str, is_ready: bool, set_by: Option<&str>) -> String {
    to_json(&Envelope::set(SetMessage {
        ready: Some(ReadyChange {
            username: Some(username.into()),
            is_ready: Some(is_ready),
            manually_initiated: true,
            set_by: set_by.map(Into::into),
        }),
        ..SetMessage::default()
    }))
}

/// Returns the JSON string for a `Set/playlistChange`.
pub fn playlist_json(changed_by: &str, files: &[&str]) -> String {
    to_json(&Envelope::set(SetMessage {
        playlist_change: Some(PlaylistChange {
            changed_by: Some(changed_by.into()),
            files: files.iter().map(|f| (*f).to_string()).collect(),
        }),
        ..SetMessage::default()
    }))
}

/// Returns the JSON string for a `Set/playlistIndex`.
pub fn playlist_index_json(changed_by: &str, index: Option<i64>) -> String {
    to_json(&Envelope::set(SetMessage {
        playlist_index: Some(PlaylistIndexChange {
            changed_by: Some(changed_by.into()),
            index,
        }),
        ..SetMessage::default()
    }))
}

/// Returns the JSON string for a server chat broadcast.
pub fn chat_json(username: &str, message: &str) -> String {
    to_json(&Envelope {
        chat: Some(ChatMessage::Received {
            username: username.into(),
            message: message.into(),
        }),
        ..Envelope::default()
    })
}

/// Returns the JSON string for a server `Error` message.
pub fn error_json(message: &str) -> String {
    to_json(&Envelope {
        error: Some(ErrorMessage {
            message: message.into(),
        }),
        ..Envelope::default()
    })
}

/// Returns the JSON string for a `State` ping from the server.
pub fn state_ping_json(
    latency_calculation: f64,
    client_latency_calculation: Option<f64>,
    server_rtt: Option<f64>,
) -> String {
    to_json(&Envelope::state(StateMessage {
        ping: Some(Ping {
            latency_calculation: Some(latency_calculation),
            client_latency_calculation,
            server_rtt,
            client_rtt: None,
        }),
        ..StateMessage::default()
    }))
}

/// Returns the JSON string for a plain `State` playstate broadcast.
pub fn state_playstate_json(position: f64, paused: bool, set_by: Option<&str>) -> String {
    to_json(&Envelope::state(StateMessage {
        playstate: Some(PlayState {
            position,
            paused,
            do_seek: None,
            set_by: set_by.map(Into::into),
        }),
        ..StateMessage::default()
    }))
}

/// Returns the JSON string for a `State` playstate with ignoring counters.
pub fn state_with_counters_json(
    position: f64,
    paused: bool,
    do_seek: Option<bool>,
    set_by: Option<&str>,
    server: u32,
    client: u32,
) -> String {
    to_json(&Envelope::state(StateMessage {
        playstate: Some(PlayState {
            position,
            paused,
            do_seek,
            set_by: set_by.map(Into::into),
        }),
        ignoring_on_the_fly: Some(IgnoringCounters { server, client }),
        ..StateMessage::default()
    }))
}
