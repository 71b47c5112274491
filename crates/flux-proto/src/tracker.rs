//! Pending-RPC tracker.
//!
//! Every request that leaves a rank bound for a remote peer is recorded here
//! keyed by `(last-route-uuid, matchtag)` — the uuid of the child or parent
//! connection the request was just handed to, plus its matchtag. When that
//! peer is later declared lost, every tracker entry keyed to its uuid is
//! retired with a synthesized `EHOSTUNREACH` response instead of hanging
//! forever (§4.3, §4.4.10).

use std::collections::HashMap;

use crate::message::Message;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    route_uuid: String,
    matchtag: u32,
}

/// One in-flight request, enough to synthesize a response if the peer it
/// was sent to disappears before answering.
#[derive(Debug, Clone)]
pub struct Pending {
    pub request: Message,
}

/// Tracks RPCs in flight toward a single peer-keyed namespace.
///
/// The overlay keeps one `Tracker` per rank (or, equivalently, a single
/// tracker keyed on `(route_uuid, matchtag)` pairs covering every peer);
/// either works since the uuid component already disambiguates peers.
#[derive(Debug, Default)]
pub struct Tracker {
    pending: HashMap<Key, Pending>,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Record a request just sent toward `route_uuid`. Returns `false`
    /// (and does not overwrite the existing entry) if the key is already
    /// tracked — matchtags are expected to be unique per outstanding
    /// request to a given peer.
    pub fn track(&mut self, route_uuid: impl Into<String>, request: Message) -> bool {
        let key = Key {
            route_uuid: route_uuid.into(),
            matchtag: request.matchtag,
        };
        if self.pending.contains_key(&key) {
            return false;
        }
        self.pending.insert(key, Pending { request });
        true
    }

    /// Record that a response arrived. Retires the tracker entry unless
    /// the response is a non-terminal streaming response (§4.3), in which
    /// case the entry is left in place for further responses. Returns the
    /// original request if the entry was retired.
    pub fn observe_response(
        &mut self,
        route_uuid: &str,
        response: &Message,
        error_code: i32,
    ) -> Option<Message> {
        let key = Key {
            route_uuid: route_uuid.to_string(),
            matchtag: response.matchtag,
        };
        if response.is_streaming_non_terminal(error_code) {
            return None;
        }
        self.pending.remove(&key).map(|p| p.request)
    }

    /// Retire every entry keyed to `route_uuid` (the peer was declared
    /// lost), invoking `on_lost` with each original request so the caller
    /// can synthesize and deliver an `EHOSTUNREACH` response.
    pub fn purge_peer(&mut self, route_uuid: &str, mut on_lost: impl FnMut(Message)) {
        let dead: Vec<Key> = self
            .pending
            .keys()
            .filter(|k| k.route_uuid == route_uuid)
            .cloned()
            .collect();
        for key in dead {
            if let Some(p) = self.pending.remove(&key) {
                on_lost(p.request);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Flags;

    #[test]
    fn track_rejects_duplicate_key() {
        let mut t = Tracker::new();
        assert!(t.track("child-a", Message::request("overlay.health", 1)));
        assert!(!t.track("child-a", Message::request("overlay.health", 1)));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn different_peers_can_share_a_matchtag() {
        let mut t = Tracker::new();
        assert!(t.track("child-a", Message::request("overlay.health", 1)));
        assert!(t.track("child-b", Message::request("overlay.health", 1)));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn terminal_response_retires_entry() {
        let mut t = Tracker::new();
        let req = Message::request("overlay.health", 5);
        t.track("child-a", req.clone());

        let resp = Message::response_to(&req);
        let retired = t.observe_response("child-a", &resp, 0);
        assert!(retired.is_some());
        assert!(t.is_empty());
    }

    #[test]
    fn streaming_non_terminal_response_leaves_entry() {
        let mut t = Tracker::new();
        let req = Message::request("overlay.trace", 9);
        t.track("child-a", req.clone());

        let mut resp = Message::response_to(&req);
        resp.flags.insert(Flags::STREAMING);
        let retired = t.observe_response("child-a", &resp, 0);
        assert!(retired.is_none());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn streaming_response_with_error_retires_entry() {
        let mut t = Tracker::new();
        let req = Message::request("overlay.trace", 9);
        t.track("child-a", req.clone());

        let mut resp = Message::response_to(&req);
        resp.flags.insert(Flags::STREAMING);
        let retired = t.observe_response("child-a", &resp, 5);
        assert!(retired.is_some());
        assert!(t.is_empty());
    }

    #[test]
    fn purge_peer_only_retires_matching_uuid() {
        let mut t = Tracker::new();
        t.track("child-a", Message::request("overlay.health", 1));
        t.track("child-b", Message::request("overlay.health", 2));

        let mut lost = Vec::new();
        t.purge_peer("child-a", |req| lost.push(req));

        assert_eq!(lost.len(), 1);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn purge_peer_is_idempotent_once_empty() {
        let mut t = Tracker::new();
        t.track("child-a", Message::request("overlay.health", 1));
        t.purge_peer("child-a", |_| {});
        assert!(t.is_empty());
        // second purge touches nothing and must not panic or double-invoke.
        let mut calls = 0;
        t.purge_peer("child-a", |_| calls += 1);
        assert_eq!(calls, 0);
    }
}
