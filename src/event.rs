//! Typed events emitted by the protocol engine.
//!
//! Events are delivered on the bounded channel returned from
//! [`SyncplayClient::connect`](crate::client::SyncplayClient::connect), in
//! the order the corresponding messages arrived — all emission happens on the
//! read-loop task. Handlers that need to send follow-up messages should
//! offload long-running work to their own task so the receiver keeps up.

use crate::protocol::MediaFile;
use crate::roster::{PlaybackState, RoomUser};

/// Notifications raised by the background read loop.
#[derive(Debug, Clone)]
pub enum SyncplayEvent {
    /// The server confirmed the hello. Username and room are the
    /// server-assigned values, which may differ from what was requested.
    HelloReceived {
        username: String,
        room: String,
        server_version: Option<String>,
        motd: Option<String>,
    },

    /// A user joined a room.
    UserJoined { user: RoomUser },

    /// A user left. The payload is the registry entry that was removed.
    UserLeft { user: RoomUser },

    /// A user moved between rooms.
    UserRoomChanged {
        user: RoomUser,
        previous_room: String,
    },

    /// A user announced a different media file. `previous` is the file the
    /// registry held before the update, if any.
    UserFileChanged {
        user: RoomUser,
        previous: Option<MediaFile>,
    },

    /// A user's ready flag changed. `initiated_by` is the user that triggered
    /// the change when the server attributes it and that user is known.
    UserReadyChanged {
        user: RoomUser,
        initiated_by: Option<RoomUser>,
    },

    /// A chat message from another room member.
    ChatReceived { username: String, message: String },

    /// The shared playlist was replaced.
    PlaylistChanged {
        previous: Vec<String>,
        playlist: Vec<String>,
        changed_by: Option<RoomUser>,
    },

    /// The selected playlist index changed. `-1` means "none selected".
    PlaylistIndexChanged {
        previous: i64,
        index: i64,
        changed_by: Option<RoomUser>,
    },

    /// The server forced a playback state discontinuity (another client
    /// seeked, paused, or unpaused). Consumers should adjust local playback
    /// to match `state`.
    ForcedPlaybackState { state: PlaybackState },

    /// The server reported an error condition on the `Error` tag.
    ServerError { message: String },
}
