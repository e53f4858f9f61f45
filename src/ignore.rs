//! The "ignoring-on-the-fly" echo-suppression state machine.
//!
//! When the client forces a playback change it bumps a counter and sends it
//! with the change; every server playstate broadcast is then ignored until
//! the server echoes that counter back, which prevents the client's own
//! change from bouncing back and being applied twice. The server runs the
//! mirror of this when *it* forces a discontinuity, and the client must cede
//! priority and acknowledge.

/// Tracks in-flight client-forced playback changes.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IgnoringOnTheFly {
    client: u32,
}

impl IgnoringOnTheFly {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start a client-forced change; returns the counter value to put on the
    /// wire.
    pub(crate) fn begin_forced_change(&mut self) -> u32 {
        self.client += 1;
        self.client
    }

    /// The server echoed a client counter. Clears the pending change when the
    /// echo matches the counter currently in flight; returns whether it did.
    pub(crate) fn acknowledge(&mut self, echoed: u32) -> bool {
        if echoed == self.client {
            self.client = 0;
            true
        } else {
            false
        }
    }

    /// The server is forcing its own change; the client cedes priority and
    /// drops any pending change of its own.
    pub(crate) fn yield_to_server(&mut self) {
        self.client = 0;
    }

    /// The counter value currently awaiting acknowledgement (0 = none).
    pub(crate) fn pending(&self) -> u32 {
        self.client
    }

    /// Whether a client-forced change is in flight. The wire value doubles as
    /// a flag; this is the single derived boolean view of it.
    pub(crate) fn is_ignoring(&self) -> bool {
        self.client > 0
    }
}
