//! `overlay.trace` support (§4.4.11, §4.5).
//!
//! Invoked from every message receive and outbound send path in the run
//! loop. If no subscribers are registered the whole thing is a no-op: the
//! caller checks [`TraceSubscribers::is_empty`] before building a
//! [`TraceEvent`] at all, so a broker with no trace clients pays nothing
//! beyond that check.

use serde::Serialize;

use flux_proto::{ControlKind, Kind, Message};

/// One traced frame, in the shape `overlay.trace` streams out (§4.4.11).
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub timestamp: f64,
    /// "tx" or "rx".
    pub prefix: &'static str,
    /// `NODEID_ANY` (`u32::MAX`) for multicast events, per §4.5.
    pub rank: u32,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub topic: String,
    pub payload_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errnum: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errstr: Option<String>,
}

pub const NODEID_ANY: u32 = u32::MAX;

impl TraceEvent {
    /// Build the event for a request/response/event frame. Control
    /// messages use [`Self::for_control`] instead, since they carry a
    /// synthesized pseudo-topic rather than a real one (§4.5).
    pub fn for_message(prefix: &'static str, rank: u32, msg: &Message, timestamp: f64) -> Self {
        let kind = match msg.kind {
            Kind::Request => "request",
            Kind::Response => "response",
            Kind::Event => "event",
            Kind::Control => "control",
        };
        let (errnum, errstr) = if msg.kind == Kind::Response {
            extract_error(msg)
        } else {
            (None, None)
        };
        Self {
            timestamp,
            prefix,
            rank,
            kind,
            topic: msg.topic.clone(),
            payload_size: msg.payload.len(),
            payload: None,
            errnum,
            errstr,
        }
    }

    /// Control messages carry no topic; §4.5 synthesizes one:
    /// `heartbeat N | status N | disconnect N`.
    pub fn for_control(prefix: &'static str, rank: u32, kind: ControlKind, value: i64, timestamp: f64) -> Self {
        let name = match kind {
            ControlKind::Heartbeat => "heartbeat",
            ControlKind::Status => "status",
            ControlKind::Disconnect => "disconnect",
        };
        Self {
            timestamp,
            prefix,
            rank,
            kind: "control",
            topic: format!("{name} {value}"),
            payload_size: 0,
            payload: None,
            errnum: None,
            errstr: None,
        }
    }

    pub fn with_payload(mut self, include: bool, msg: &Message) -> Self {
        if include {
            self.payload = Some(msg.payload.clone());
        }
        self
    }
}

fn extract_error(msg: &Message) -> (Option<i32>, Option<String>) {
    let Ok(v) = msg.payload_as::<serde_json::Value>() else {
        return (None, None);
    };
    let errnum = v.get("errno").and_then(|e| e.as_i64()).map(|e| e as i32);
    let errstr = v.get("error").and_then(|e| e.as_str()).map(str::to_string);
    (errnum, errstr)
}

/// A single `overlay.trace` subscriber's filter, matched against every
/// traced frame before it is delivered (§4.4.11: "Subscribers filter by
/// typemask, topic glob, nodeid, and module-name list").
#[derive(Debug, Clone)]
pub struct TraceFilter {
    /// Bitmask over request(1)/response(2)/event(4)/control(8); 0 means all.
    pub typemask: u8,
    /// Simple glob: `*` matches any suffix, otherwise an exact match.
    pub topic_glob: Option<String>,
    /// `NODEID_ANY` matches every rank.
    pub nodeid: u32,
}

pub const TYPEMASK_REQUEST: u8 = 0b0001;
pub const TYPEMASK_RESPONSE: u8 = 0b0010;
pub const TYPEMASK_EVENT: u8 = 0b0100;
pub const TYPEMASK_CONTROL: u8 = 0b1000;

impl Default for TraceFilter {
    fn default() -> Self {
        Self {
            typemask: 0,
            topic_glob: None,
            nodeid: NODEID_ANY,
        }
    }
}

impl TraceFilter {
    fn kind_bit(kind: &str) -> u8 {
        match kind {
            "request" => TYPEMASK_REQUEST,
            "response" => TYPEMASK_RESPONSE,
            "event" => TYPEMASK_EVENT,
            "control" => TYPEMASK_CONTROL,
            _ => 0,
        }
    }

    pub fn matches(&self, event: &TraceEvent) -> bool {
        if self.typemask != 0 && self.typemask & Self::kind_bit(event.kind) == 0 {
            return false;
        }
        if self.nodeid != NODEID_ANY && self.nodeid != event.rank {
            return false;
        }
        if let Some(glob) = &self.topic_glob {
            if !glob_matches(glob, &event.topic) {
                return false;
            }
        }
        true
    }
}

fn glob_matches(glob: &str, topic: &str) -> bool {
    match glob.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => glob == topic,
    }
}

/// One subscriber: a filter plus the matchtag its streamed responses are
/// sent under (so the run loop knows which client to deliver to).
pub struct TraceSubscriber {
    pub id: u64,
    pub filter: TraceFilter,
}

/// Registered `overlay.trace` subscribers. Empty by default, which is the
/// common case; every call site checks [`is_empty`](Self::is_empty) first
/// so tracing a message costs nothing when nobody is watching.
#[derive(Default)]
pub struct TraceSubscribers {
    subs: Vec<TraceSubscriber>,
    next_id: u64,
}

impl TraceSubscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn add(&mut self, filter: TraceFilter) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.subs.push(TraceSubscriber { id, filter });
        id
    }

    /// `overlay.disconnect`: detach a streaming subscriber on client hang-up.
    pub fn remove(&mut self, id: u64) {
        self.subs.retain(|s| s.id != id);
    }

    /// Matching subscriber ids for one traced event.
    pub fn matching(&self, event: &TraceEvent) -> Vec<u64> {
        self.subs
            .iter()
            .filter(|s| s.filter.matches(event))
            .map(|s| s.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_proto::Message;

    #[test]
    fn no_subscribers_means_empty() {
        let subs = TraceSubscribers::new();
        assert!(subs.is_empty());
    }

    #[test]
    fn typemask_filters_by_kind() {
        let mut subs = TraceSubscribers::new();
        let id = subs.add(TraceFilter {
            typemask: TYPEMASK_REQUEST,
            ..Default::default()
        });
        let req_event = TraceEvent::for_message("rx", 1, &Message::request("overlay.hello", 1), 0.0);
        let resp_event = TraceEvent::for_message(
            "tx",
            1,
            &Message::response_to(&Message::request("overlay.hello", 1)),
            0.0,
        );
        assert_eq!(subs.matching(&req_event), vec![id]);
        assert!(subs.matching(&resp_event).is_empty());
    }

    #[test]
    fn topic_glob_prefix_match() {
        let mut subs = TraceSubscribers::new();
        let id = subs.add(TraceFilter {
            topic_glob: Some("overlay.*".to_string()),
            ..Default::default()
        });
        let matching = TraceEvent::for_message("rx", 0, &Message::request("overlay.health", 1), 0.0);
        let other = TraceEvent::for_message("rx", 0, &Message::request("kvs.put", 1), 0.0);
        assert_eq!(subs.matching(&matching), vec![id]);
        assert!(subs.matching(&other).is_empty());
    }

    #[test]
    fn nodeid_filter_matches_exact_rank_only() {
        let mut subs = TraceSubscribers::new();
        let id = subs.add(TraceFilter {
            nodeid: 2,
            ..Default::default()
        });
        let from_2 = TraceEvent::for_message("rx", 2, &Message::request("meep", 1), 0.0);
        let from_1 = TraceEvent::for_message("rx", 1, &Message::request("meep", 1), 0.0);
        assert_eq!(subs.matching(&from_2), vec![id]);
        assert!(subs.matching(&from_1).is_empty());
    }

    #[test]
    fn control_event_uses_synthesized_topic() {
        let event = TraceEvent::for_control("tx", 0, ControlKind::Heartbeat, 0, 0.0);
        assert_eq!(event.topic, "heartbeat 0");
    }

    #[test]
    fn remove_detaches_subscriber() {
        let mut subs = TraceSubscribers::new();
        let id = subs.add(TraceFilter::default());
        subs.remove(id);
        assert!(subs.is_empty());
    }
}
