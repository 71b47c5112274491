//! The overlay's message model: the four kinds of traffic that cross the
//! TBON (request, response, event, control), the route stack each hop
//! pushes or pops, and the role/flag bitmasks carried alongside.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Role bitmask carried on every message.
    ///
    /// `OWNER` marks a message as originating from the broker's own rank
    /// (used to validate `overlay.hello`, which must be sent with owner
    /// role). `USER` marks a message from an authenticated external client.
    /// `LOCAL` is the "local-role bit": set on messages that originate from
    /// this broker's local channel and must be cleared before the message
    /// is handed to a remote peer or delivered back into the local channel
    /// from a remote peer (§4.4.5, §8 invariant 3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Role: u8 {
        const OWNER = 0b0000_0001;
        const USER  = 0b0000_0010;
        const LOCAL = 0b0000_0100;
    }
}

bitflags! {
    /// Per-message flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Flags: u8 {
        /// Route this request toward the parent regardless of the target
        /// rank's position in the local subtree.
        const UPSTREAM = 0b0000_0001;
        /// Suppress tracing/snooping of this message's payload.
        const PRIVATE  = 0b0000_0010;
        /// This response is one of several; do not retire the RPC tracker
        /// entry unless it also carries a non-zero error code.
        const STREAMING = 0b0000_0100;
    }
}

/// The subtree/child-record uuid stack threaded onto a message as it
/// traverses the tree. Requests push a hop on the way down; responses pop
/// one hop per rank on the way back up.
pub type RouteStack = Vec<String>;

/// Which of the four wire kinds a message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Request,
    Response,
    Event,
    Control,
}

/// The three control sub-kinds (§6). Carried as `(kind, value)` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Heartbeat,
    Status,
    Disconnect,
}

impl ControlKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ControlKind::Heartbeat),
            1 => Some(ControlKind::Status),
            2 => Some(ControlKind::Disconnect),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            ControlKind::Heartbeat => 0,
            ControlKind::Status => 1,
            ControlKind::Disconnect => 2,
        }
    }
}

/// A single overlay message. Requests/responses/events carry a topic and an
/// opaque payload; control messages carry a `(kind, value)` pair instead of
/// a topic and have an empty payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: Kind,
    /// Empty for control messages.
    pub topic: String,
    pub matchtag: u32,
    pub route: RouteStack,
    pub role: Role,
    /// Present for requests from authenticated clients; absent for
    /// broker-internal traffic.
    pub userid: Option<u32>,
    /// Present only on events.
    pub seq: Option<u64>,
    pub flags: Flags,
    /// Set iff `kind == Control`.
    pub control: Option<(ControlKind, i64)>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn request(topic: impl Into<String>, matchtag: u32) -> Self {
        Self {
            kind: Kind::Request,
            topic: topic.into(),
            matchtag,
            route: Vec::new(),
            role: Role::empty(),
            userid: None,
            seq: None,
            flags: Flags::empty(),
            control: None,
            payload: Vec::new(),
        }
    }

    pub fn response_to(request: &Message) -> Self {
        Self {
            kind: Kind::Response,
            topic: request.topic.clone(),
            matchtag: request.matchtag,
            route: request.route.clone(),
            role: request.role,
            userid: request.userid,
            seq: None,
            flags: Flags::empty(),
            control: None,
            payload: Vec::new(),
        }
    }

    pub fn event(topic: impl Into<String>, seq: u64) -> Self {
        Self {
            kind: Kind::Event,
            topic: topic.into(),
            matchtag: 0,
            route: Vec::new(),
            role: Role::empty(),
            userid: None,
            seq: Some(seq),
            flags: Flags::empty(),
            control: None,
            payload: Vec::new(),
        }
    }

    pub fn control(kind: ControlKind, value: i64) -> Self {
        Self {
            kind: Kind::Control,
            topic: String::new(),
            matchtag: 0,
            route: Vec::new(),
            role: Role::empty(),
            userid: None,
            seq: None,
            flags: Flags::empty(),
            control: Some((kind, value)),
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Serialize) -> serde_json::Result<Self> {
        self.payload = serde_json::to_vec(&payload)?;
        Ok(self)
    }

    pub fn with_raw_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    pub fn push_route(&mut self, uuid: impl Into<String>) {
        self.route.push(uuid.into());
    }

    pub fn pop_route(&mut self) -> Option<String> {
        self.route.pop()
    }

    /// The last-pushed route entry: the uuid a response should be sent to
    /// next, or the uuid a request most recently arrived from.
    pub fn last_route(&self) -> Option<&str> {
        self.route.last().map(String::as_str)
    }

    /// Clear the LOCAL role bit before handing the message to a remote peer
    /// or to the local channel coming from one (§4.4.5, §8 invariant 3).
    pub fn clear_local_role(&mut self) {
        self.role.remove(Role::LOCAL);
    }

    /// True iff this is a streaming response without a terminal error code
    /// (§4.3: such responses do not retire their tracker entry).
    pub fn is_streaming_non_terminal(&self, error_code: i32) -> bool {
        self.kind == Kind::Response && self.flags.contains(Flags::STREAMING) && error_code == 0
    }

    /// Synthesize an `EHOSTUNREACH` response to a tracked request, per
    /// §4.4.10/§7's "RPC-in-flight loss" handling.
    pub fn synthesize_unreachable(request: &Message, diagnostic: &str) -> Message {
        let mut resp = Message::response_to(request);
        resp.payload = serde_json::to_vec(&serde_json::json!({
            "errno": crate::errno::EHOSTUNREACH,
            "error": crate::errno::describe(crate::errno::EHOSTUNREACH, diagnostic),
        }))
        .unwrap_or_default();
        resp
    }
}
