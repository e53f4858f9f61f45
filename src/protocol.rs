//! Wire-compatible protocol types for the Syncplay protocol.
//!
//! Every message is one line of JSON whose top-level keys are message-type
//! tags (`TLS`, `Hello`, `Set`, `State`, `Error`, `Chat`, `List`). More than
//! one tag may appear on a single line, and unknown tags must survive
//! decoding so they can be logged — [`Envelope`] captures them in a flattened
//! map instead of failing.
//!
//! Field names follow the server's JSON exactly (`camelCase` keys, `TLS` and
//! friends in their historical casing), so types here use explicit
//! `#[serde(rename)]` attributes rather than a blanket rename rule.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Protocol version advertised in the client hello.
pub const PROTOCOL_VERSION: &str = "1.2.255";

/// Real client version advertised in the client hello (`realversion`).
pub const CLIENT_VERSION: &str = "1.7.4";

// ── Envelope ────────────────────────────────────────────────────────

/// Room list snapshot: room name → username → user entry.
pub type RoomListSnapshot = HashMap<String, HashMap<String, ListUserEntry>>;

/// One line on the wire. Each optional field corresponds to a top-level tag;
/// any number of tags may be present at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "TLS", skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsMessage>,

    #[serde(rename = "Hello", skip_serializing_if = "Option::is_none")]
    pub hello: Option<Hello>,

    #[serde(rename = "Set", skip_serializing_if = "Option::is_none")]
    pub set: Option<SetMessage>,

    #[serde(rename = "State", skip_serializing_if = "Option::is_none")]
    pub state: Option<StateMessage>,

    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMessage>,

    #[serde(rename = "Chat", skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatMessage>,

    /// Inbound: a full membership snapshot. Outbound: `Some(None)` serializes
    /// as `"List": null`, the wire form of a list request.
    #[serde(rename = "List", default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Option<RoomListSnapshot>>,

    /// Top-level keys this client does not recognize. Preserved for logging;
    /// never a decode failure (forward compatibility).
    #[serde(flatten)]
    pub unknown: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    pub fn tls(message: TlsMessage) -> Self {
        Self {
            tls: Some(message),
            ..Self::default()
        }
    }

    pub fn hello(hello: Hello) -> Self {
        Self {
            hello: Some(hello),
            ..Self::default()
        }
    }

    pub fn set(set: SetMessage) -> Self {
        Self {
            set: Some(set),
            ..Self::default()
        }
    }

    pub fn state(state: StateMessage) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// The bare-string outbound chat form; the server fills in the sender.
    pub fn chat_send(message: impl Into<String>) -> Self {
        Self {
            chat: Some(ChatMessage::Send(message.into())),
            ..Self::default()
        }
    }

    /// `{"List": null}` — asks the server for a full membership snapshot.
    pub fn list_request() -> Self {
        Self {
            list: Some(None),
            ..Self::default()
        }
    }
}

// ── TLS capability exchange ─────────────────────────────────────────

/// The `TLS` tag payload used during the capability probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsMessage {
    #[serde(rename = "startTLS")]
    pub start_tls: TlsDirective,
}

/// Value of the `startTLS` field. The client sends `send`; the server answers
/// `true` or `false`. Anything unrecognized is treated as a plaintext answer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TlsDirective {
    Send,
    True,
    False,
    #[serde(other)]
    Unknown,
}

// ── Hello ───────────────────────────────────────────────────────────

/// The `Hello` tag payload, used in both directions. The client announces
/// identity and capabilities; the server's response is authoritative for
/// username and room and may carry a message of the day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub username: String,

    /// Lowercase-hex MD5 digest of the room password. Never the plaintext.
    #[serde(rename = "password", default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    pub room: RoomRef,

    #[serde(default = "default_protocol_version")]
    pub version: String,

    #[serde(rename = "realversion", default, skip_serializing_if = "Option::is_none")]
    pub real_version: Option<String>,

    #[serde(default)]
    pub features: FeatureSet,

    /// Server-side only; never included in client hellos.
    #[serde(rename = "motd", default, skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

/// A room named by its only wire attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomRef {
    pub name: String,
}

impl RoomRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Capability flags exchanged in hellos and user join events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeatureSet {
    #[serde(rename = "sharedPlaylists")]
    pub shared_playlists: bool,
    pub chat: bool,
    #[serde(rename = "featureList")]
    pub feature_list: bool,
    pub readiness: bool,
    #[serde(rename = "managedRooms")]
    pub managed_rooms: bool,
    #[serde(rename = "persistentRooms")]
    pub persistent_rooms: bool,
    #[serde(rename = "uiMode")]
    pub ui_mode: String,
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self {
            shared_playlists: true,
            chat: true,
            feature_list: true,
            readiness: true,
            managed_rooms: false,
            persistent_rooms: false,
            ui_mode: "CLI".to_string(),
        }
    }
}

// ── Chat ────────────────────────────────────────────────────────────

/// The `Chat` tag has two wire forms: the server broadcasts an object with
/// the sender, while a client sends a bare string and lets the server
/// attribute it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ChatMessage {
    Received { username: String, message: String },
    Send(String),
}

/// The `Error` tag payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorMessage {
    pub message: String,
}

// ── Set ─────────────────────────────────────────────────────────────

/// The `Set` tag payload: room/user/playlist mutations, in both directions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetMessage {
    /// Per-user changes, keyed by username.
    #[serde(rename = "user", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<HashMap<String, UserChange>>,

    #[serde(rename = "ready", default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<ReadyChange>,

    #[serde(rename = "playlistChange", default, skip_serializing_if = "Option::is_none")]
    pub playlist_change: Option<PlaylistChange>,

    #[serde(rename = "playlistIndex", default, skip_serializing_if = "Option::is_none")]
    pub playlist_index: Option<PlaylistIndexChange>,

    /// Outbound only: announce the local reported file.
    #[serde(rename = "file", default, skip_serializing_if = "Option::is_none")]
    pub file: Option<MediaFile>,

    /// Outbound only: request a move to a different room.
    #[serde(rename = "room", default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomRef>,
}

/// One entry in a `Set/user` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomRef>,

    #[serde(rename = "event", default, skip_serializing_if = "Option::is_none")]
    pub event: Option<UserEvent>,

    #[serde(rename = "file", default, skip_serializing_if = "Option::is_none")]
    pub file: Option<MediaFile>,
}

/// Join/leave marker inside a `Set/user` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserEvent {
    #[serde(default)]
    pub joined: bool,
    #[serde(default)]
    pub left: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FeatureSet>,
}

/// `Set/ready` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadyChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(rename = "isReady", default, skip_serializing_if = "Option::is_none")]
    pub is_ready: Option<bool>,

    #[serde(rename = "manuallyInitiated", default)]
    pub manually_initiated: bool,

    #[serde(rename = "setBy", default, skip_serializing_if = "Option::is_none")]
    pub set_by: Option<String>,
}

/// `Set/playlistChange` payload: the playlist is replaced wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistChange {
    #[serde(rename = "user", default, skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<String>,

    #[serde(default)]
    pub files: Vec<String>,
}

/// `Set/playlistIndex` payload. An absent index means "none selected".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistIndexChange {
    #[serde(rename = "user", default, skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
}

// ── State ───────────────────────────────────────────────────────────

/// The `State` tag payload: the ping/playstate exchange that keeps the room
/// in sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateMessage {
    #[serde(rename = "ping", default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<Ping>,

    #[serde(rename = "playstate", default, skip_serializing_if = "Option::is_none")]
    pub playstate: Option<PlayState>,

    #[serde(
        rename = "ignoringOnTheFly",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ignoring_on_the_fly: Option<IgnoringCounters>,
}

/// Ping sub-message. Timestamps are unix seconds with a fractional part.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    #[serde(
        rename = "latencyCalculation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub latency_calculation: Option<f64>,

    #[serde(
        rename = "clientLatencyCalculation",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_latency_calculation: Option<f64>,

    #[serde(rename = "serverRtt", default, skip_serializing_if = "Option::is_none")]
    pub server_rtt: Option<f64>,

    #[serde(rename = "clientRtt", default, skip_serializing_if = "Option::is_none")]
    pub client_rtt: Option<f64>,
}

/// Playstate sub-message: position in seconds plus pause/seek attribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlayState {
    pub position: f64,
    pub paused: bool,

    #[serde(rename = "doSeek", default, skip_serializing_if = "Option::is_none")]
    pub do_seek: Option<bool>,

    #[serde(rename = "setBy", default, skip_serializing_if = "Option::is_none")]
    pub set_by: Option<String>,
}

/// The ignoring-on-the-fly counters. Non-negative integers used as both a
/// flag and a handshake counter; zero means "not ignoring" and is omitted
/// from the wire.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IgnoringCounters {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub server: u32,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub client: u32,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(n: &u32) -> bool {
    *n == 0
}

// ── Media files ─────────────────────────────────────────────────────

/// A media file as reported by a room member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaFile {
    pub name: String,
    /// Duration in seconds.
    pub duration: f64,
    pub size: FileSize,
}

impl MediaFile {
    pub fn new(name: impl Into<String>, duration: f64, size: u64) -> Self {
        Self {
            name: name.into(),
            duration,
            size: FileSize::Bytes(size),
        }
    }
}

/// The `size` field is a union: a true byte count (JSON number) or an opaque
/// hashed representation (JSON string) from clients that hide the real size.
/// Decoding disambiguates by token kind, never coercing one into the other.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FileSize {
    Bytes(u64),
    Hashed(String),
}

// ── List snapshots ──────────────────────────────────────────────────

/// One user entry in a `List` snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListUserEntry {
    #[serde(default)]
    pub position: f64,

    /// The server sends `{}` for "no file"; that decodes as `None`.
    #[serde(default, deserialize_with = "empty_object_as_none")]
    pub file: Option<MediaFile>,

    #[serde(default)]
    pub controller: bool,

    #[serde(rename = "isReady", default)]
    pub is_ready: Option<bool>,

    #[serde(default)]
    pub features: FeatureSet,
}

/// Decode `null` and `{}` as `None`; anything else must be a [`MediaFile`].
fn empty_object_as_none<'de, D>(deserializer: D) -> Result<Option<MediaFile>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(map)) if map.is_empty() => Ok(None),
        Some(other) => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
