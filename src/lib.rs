//! Async client library for the [Syncplay](https://syncplay.pl/) wire
//! protocol: line-delimited JSON over TCP, with an in-band TLS upgrade.
//!
//! The crate keeps a shared media-playback session in sync with a Syncplay
//! server: it performs the TLS capability exchange and hello, then runs a
//! background read loop that maintains the room roster, the shared playlist,
//! and the server-directed playback state, emitting [`SyncplayEvent`]s as
//! they happen.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use syncplay_client::{SyncplayClient, SyncplayConfig, SyncplayEvent};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), syncplay_client::SyncplayError> {
//! let config = SyncplayConfig::new("syncplay.example.org", 8995, "alice", "movie-night");
//! let (client, mut events) = SyncplayClient::connect(config, CancellationToken::new()).await?;
//!
//! client.send_chat("hello").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let SyncplayEvent::ChatReceived { username, message } = event {
//!         println!("<{username}> {message}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency model
//!
//! One background task owns the read half of the connection; outbound writes
//! (public commands and the loop's reactive replies) serialize through a
//! single async lock, so every message goes out as a complete line. Session
//! state lives behind a synchronous lock that is never held across an await;
//! the public query methods return snapshot clones.

pub mod client;
pub mod error;
pub mod event;
pub mod protocol;
pub mod roster;

mod ignore;
mod rtt;
mod transport;

pub use client::{PassiveStateReport, SyncplayClient, SyncplayConfig};
pub use error::{Result, SyncplayError};
pub use event::SyncplayEvent;
pub use protocol::{FeatureSet, FileSize, MediaFile};
pub use roster::{PlaybackState, RoomUser};
