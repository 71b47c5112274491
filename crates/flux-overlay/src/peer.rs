//! Peer records: the parent (at most one) and each direct child known by
//! the topology (§3).

use std::time::Instant;

use flux_proto::Tracker;

use crate::subtree::SubtreeStatus;

/// The connection to this broker's parent, if any (rank 0 has none).
pub struct Parent {
    pub rank: u32,
    pub uuid: String,
    pub public_key: String,
    pub uri: String,
    pub tracker: Tracker,
    pub hello_responded: bool,
    pub hello_error: bool,
    pub offline: bool,
    pub goodbye_sent: bool,
    pub lastsent: Option<Instant>,
}

impl Parent {
    pub fn new(rank: u32, public_key: String, uri: String) -> Self {
        Self {
            rank,
            uuid: String::new(),
            public_key,
            uri,
            tracker: Tracker::new(),
            hello_responded: false,
            hello_error: false,
            offline: false,
            goodbye_sent: false,
            lastsent: None,
        }
    }

    /// True once a hello error response or transport disconnect has
    /// declared this parent unreachable (§4.4.10's `overlay_parent_error`).
    pub fn is_errored(&self) -> bool {
        (self.hello_responded && self.hello_error) || self.offline
    }
}

/// One direct child, indexed by rank in the overlay's children array and,
/// once its hello has been accepted, also by uuid.
pub struct Child {
    pub rank: u32,
    pub uuid: Option<String>,
    pub status: SubtreeStatus,
    pub status_timestamp: Instant,
    pub lastseen: Option<Instant>,
    pub torpid: bool,
    pub tracker: Tracker,
    pub last_error: Option<String>,
}

impl Child {
    pub fn new(rank: u32) -> Self {
        Self {
            rank,
            uuid: None,
            status: SubtreeStatus::Offline,
            status_timestamp: Instant::now(),
            lastseen: None,
            torpid: false,
            tracker: Tracker::new(),
            last_error: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status.is_online()
    }

    pub fn set_status(&mut self, status: SubtreeStatus) {
        self.status = status;
        self.status_timestamp = Instant::now();
    }

    pub fn duration_since_status_change(&self) -> std::time::Duration {
        self.status_timestamp.elapsed()
    }
}
