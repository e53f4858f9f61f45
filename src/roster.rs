//! Room membership registry and playlist state.
//!
//! The roster owns every [`RoomUser`] record; the engine mutates it from the
//! read-loop task and external callers only ever see snapshot clones.
//! Mutations that reference an unknown username report that as a typed error
//! so the engine can log and skip the single update instead of dropping the
//! connection — the server, not this client, is the source of truth.

use std::collections::HashMap;

use crate::error::SyncplayError;
use crate::protocol::{FeatureSet, ListUserEntry, MediaFile, UserEvent};

/// One room participant as last reported by the server.
#[derive(Debug, Clone)]
pub struct RoomUser {
    /// Stable identity key, unique across the registry.
    pub username: String,
    pub room: String,
    pub is_ready: bool,
    pub is_paused: bool,
    /// Last reported playback position, seconds.
    pub position: f64,
    pub file: Option<MediaFile>,
    /// Elevated playback-control role in a managed room. Tracked, not enforced.
    pub is_controller: bool,
    pub version: Option<String>,
    pub features: FeatureSet,
}

impl RoomUser {
    fn from_join(username: &str, room: &str, event: &UserEvent, file: Option<MediaFile>) -> Self {
        Self {
            username: username.to_string(),
            room: room.to_string(),
            is_ready: false,
            is_paused: true,
            position: 0.0,
            file,
            is_controller: false,
            version: event.version.clone(),
            features: event.features.clone().unwrap_or_default(),
        }
    }

    fn from_list_entry(username: &str, room: &str, entry: &ListUserEntry) -> Self {
        Self {
            username: username.to_string(),
            room: room.to_string(),
            is_ready: entry.is_ready.unwrap_or(false),
            is_paused: true,
            position: entry.position,
            file: entry.file.clone(),
            is_controller: entry.controller,
            version: None,
            features: entry.features.clone(),
        }
    }

    fn merge_list_entry(&mut self, room: &str, entry: &ListUserEntry) {
        self.room = room.to_string();
        self.is_ready = entry.is_ready.unwrap_or(false);
        self.is_controller = entry.controller;
        self.position = entry.position;
        self.file = entry.file.clone();
        self.features = entry.features.clone();
    }
}

/// The playback state the server last told us to adopt.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackState {
    /// Position in seconds, possibly dead-reckoned forward by the delay
    /// estimate.
    pub position: f64,
    pub paused: bool,
    /// Username the server attributed the update to.
    pub set_by: Option<String>,
    /// Whether the last accepted update was a seek.
    pub last_was_seek: bool,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            position: 0.0,
            paused: true,
            set_by: None,
            last_was_seek: false,
        }
    }
}

/// Username-keyed user registry plus the shared playlist.
#[derive(Debug, Default)]
pub(crate) struct Roster {
    users: HashMap<String, RoomUser>,
    playlist: Vec<String>,
    playlist_index: i64,
}

impl Roster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, username: &str) -> Option<&RoomUser> {
        self.users.get(username)
    }

    pub(crate) fn users(&self) -> impl Iterator<Item = &RoomUser> {
        self.users.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.users.len()
    }

    /// Insert a user announced by a join event. A duplicate join for an
    /// existing username is a protocol-level inconsistency and is skipped.
    pub(crate) fn add_joined(
        &mut self,
        username: &str,
        room: &str,
        event: &UserEvent,
        file: Option<MediaFile>,
    ) -> Result<RoomUser, SyncplayError> {
        if self.users.contains_key(username) {
            return Err(SyncplayError::DuplicateUser(username.to_string()));
        }
        let user = RoomUser::from_join(username, room, event, file);
        self.users.insert(username.to_string(), user.clone());
        Ok(user)
    }

    /// Remove a user on a leave event, returning the removed record.
    pub(crate) fn remove_left(&mut self, username: &str) -> Result<RoomUser, SyncplayError> {
        self.users
            .remove(username)
            .ok_or_else(|| SyncplayError::UnknownUser(username.to_string()))
    }

    /// Record a room change. Returns `Ok(None)` when the reported room equals
    /// the one already on record, `Ok(Some((snapshot, previous_room)))` when
    /// it differs.
    pub(crate) fn set_room(
        &mut self,
        username: &str,
        room: &str,
    ) -> Result<Option<(RoomUser, String)>, SyncplayError> {
        let user = self
            .users
            .get_mut(username)
            .ok_or_else(|| SyncplayError::UnknownUser(username.to_string()))?;
        if user.room == room {
            return Ok(None);
        }
        let previous = std::mem::replace(&mut user.room, room.to_string());
        Ok(Some((user.clone(), previous)))
    }

    /// Update a user's reported file, returning the new snapshot and the
    /// previous file.
    pub(crate) fn set_file(
        &mut self,
        username: &str,
        file: MediaFile,
    ) -> Result<(RoomUser, Option<MediaFile>), SyncplayError> {
        let user = self
            .users
            .get_mut(username)
            .ok_or_else(|| SyncplayError::UnknownUser(username.to_string()))?;
        let previous = user.file.replace(file);
        Ok((user.clone(), previous))
    }

    /// Update a user's ready flag, returning the new snapshot.
    pub(crate) fn set_ready(
        &mut self,
        username: &str,
        ready: bool,
    ) -> Result<RoomUser, SyncplayError> {
        let user = self
            .users
            .get_mut(username)
            .ok_or_else(|| SyncplayError::UnknownUser(username.to_string()))?;
        user.is_ready = ready;
        Ok(user.clone())
    }

    /// Merge one `List` snapshot entry: update in place when the user is
    /// known, insert otherwise. Snapshots never remove users.
    pub(crate) fn merge_list_entry(
        &mut self,
        room: &str,
        username: &str,
        entry: &ListUserEntry,
    ) -> RoomUser {
        match self.users.get_mut(username) {
            Some(user) => {
                user.merge_list_entry(room, entry);
                user.clone()
            }
            None => {
                let user = RoomUser::from_list_entry(username, room, entry);
                self.users.insert(username.to_string(), user.clone());
                user
            }
        }
    }

    /// Replace the playlist wholesale, returning the previous one.
    pub(crate) fn replace_playlist(&mut self, files: Vec<String>) -> Vec<String> {
        std::mem::replace(&mut self.playlist, files)
    }

    /// Replace the selected index, returning the previous value. `-1` means
    /// "none selected".
    pub(crate) fn set_playlist_index(&mut self, index: i64) -> i64 {
        std::mem::replace(&mut self.playlist_index, index)
    }

    pub(crate) fn playlist(&self) -> &[String] {
        &self.playlist
    }

    pub(crate) fn playlist_index(&self) -> i64 {
        self.playlist_index
    }

    /// The playlist entry at the selected index, if the index is in range.
    pub(crate) fn selected_entry(&self) -> Option<&String> {
        usize::try_from(self.playlist_index)
            .ok()
            .and_then(|i| self.playlist.get(i))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn join_event() -> UserEvent {
        UserEvent {
            joined: true,
            left: false,
            version: Some("1.7.4".into()),
            features: Some(FeatureSet::default()),
        }
    }

    #[test]
    fn join_then_leave_removes_exactly_that_entry() {
        let mut roster = Roster::new();
        roster.add_joined("alice", "movies", &join_event(), None).unwrap();
        roster.add_joined("bob", "movies", &join_event(), None).unwrap();
        assert_eq!(roster.len(), 2);

        let left = roster.remove_left("alice").unwrap();
        assert_eq!(left.username, "alice");
        assert_eq!(roster.len(), 1);
        assert!(roster.get("bob").is_some());
    }

    #[test]
    fn duplicate_join_is_rejected_and_registry_unchanged() {
        let mut roster = Roster::new();
        roster.add_joined("alice", "movies", &join_event(), None).unwrap();
        let err = roster.add_joined("alice", "other", &join_event(), None);
        assert!(matches!(err, Err(SyncplayError::DuplicateUser(name)) if name == "alice"));
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get("alice").unwrap().room, "movies");
    }

    #[test]
    fn leave_for_unknown_user_leaves_registry_untouched() {
        let mut roster = Roster::new();
        roster.add_joined("alice", "movies", &join_event(), None).unwrap();
        assert!(roster.remove_left("mallory").is_err());
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn list_merge_updates_in_place_and_never_removes() {
        let mut roster = Roster::new();
        roster.add_joined("alice", "movies", &join_event(), None).unwrap();

        let entry = ListUserEntry {
            position: 42.5,
            file: None,
            controller: true,
            is_ready: Some(true),
            features: FeatureSet::default(),
        };
        roster.merge_list_entry("movies", "alice", &entry);
        roster.merge_list_entry("movies", "carol", &entry);

        assert_eq!(roster.len(), 2);
        let alice = roster.get("alice").unwrap();
        assert!(alice.is_ready);
        assert!(alice.is_controller);
        assert!((alice.position - 42.5).abs() < f64::EPSILON);
    }

    #[test]
    fn room_change_reports_previous_room_only_when_different() {
        let mut roster = Roster::new();
        roster.add_joined("alice", "movies", &join_event(), None).unwrap();

        assert!(roster.set_room("alice", "movies").unwrap().is_none());

        let (user, previous) = roster.set_room("alice", "anime").unwrap().unwrap();
        assert_eq!(user.room, "anime");
        assert_eq!(previous, "movies");
    }

    #[test]
    fn ready_update_for_unknown_user_is_an_error() {
        let mut roster = Roster::new();
        assert!(roster.set_ready("ghost", true).is_err());
    }

    #[test]
    fn playlist_replacement_returns_the_old_list() {
        let mut roster = Roster::new();
        let old = roster.replace_playlist(vec!["a.mkv".into(), "b.mkv".into()]);
        assert!(old.is_empty());

        let old = roster.replace_playlist(vec!["c.mkv".into()]);
        assert_eq!(old, vec!["a.mkv".to_string(), "b.mkv".to_string()]);
        assert_eq!(roster.playlist(), ["c.mkv".to_string()]);
    }

    #[test]
    fn selected_entry_is_none_when_index_out_of_range() {
        let mut roster = Roster::new();
        roster.replace_playlist(vec!["a.mkv".into()]);

        roster.set_playlist_index(0);
        assert_eq!(roster.selected_entry().map(String::as_str), Some("a.mkv"));

        roster.set_playlist_index(5);
        assert!(roster.selected_entry().is_none());

        roster.set_playlist_index(-1);
        assert!(roster.selected_entry().is_none());
    }
}
