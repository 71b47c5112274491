//! `overlay.*` admin RPC dispatch (§4.4.11, and the supplemented
//! `overlay.stats-get`/FLUB stubs from the crate layout notes).
//!
//! The run loop calls [`dispatch`] on every request arriving on the local
//! channel before handing anything unmatched to [`crate::overlay::Overlay::route_from_local`].
//! A handled topic never leaves this broker: these RPCs answer from local
//! state only and are not forwarded.

use flux_proto::errno;
use flux_proto::Message;

use crate::overlay::Overlay;
use crate::subtree::SubtreeStatus;
use crate::trace::{TraceFilter, TraceSubscribers, NODEID_ANY};

/// Side effects a dispatched admin request can ask the run loop to perform,
/// beyond the direct response returned to the caller.
pub enum DispatchEffect {
    None,
    /// Messages synthesized by a disconnect (EHOSTUNREACH for in-flight RPCs).
    Deliver(Vec<Message>),
    /// `overlay.trace` registered a new streaming subscriber.
    TraceSubscribed(u64),
}

/// Try to answer `msg` as an admin RPC. `None` means the topic is not one
/// of ours and should fall through to normal routing.
pub fn dispatch(
    overlay: &mut Overlay,
    trace: &mut TraceSubscribers,
    msg: &Message,
) -> Option<(Message, DispatchEffect)> {
    match msg.topic.as_str() {
        "overlay.stats-get" => Some((stats_get(overlay, msg), DispatchEffect::None)),
        "overlay.health" => Some((health(overlay, msg), DispatchEffect::None)),
        "overlay.monitor" => Some((monitor(overlay, msg), DispatchEffect::None)),
        "overlay.topology" => Some((topology(overlay, msg), DispatchEffect::None)),
        "overlay.trace" => Some(trace_subscribe(trace, msg)),
        "overlay.disconnect" => Some(disconnect(overlay, trace, msg)),
        "overlay.disconnect-subtree" => Some(disconnect_subtree(overlay, msg)),
        "overlay.disconnect-parent" => Some(disconnect_parent(overlay, msg)),
        "overlay.flub-getinfo" | "overlay.flub-kex" => Some((flub_unsupported(msg), DispatchEffect::None)),
        _ => None,
    }
}

fn ok_response(request: &Message, body: serde_json::Value) -> Message {
    Message::response_to(request)
        .with_payload(body)
        .expect("admin response payloads always serialize")
}

fn error_response(request: &Message, errno: i32, message: &str) -> Message {
    Message::response_to(request)
        .with_payload(serde_json::json!({
            "errno": errno,
            "error": errno::describe(errno, message),
        }))
        .expect("error payloads always serialize")
}

fn stats_get(overlay: &Overlay, request: &Message) -> Message {
    ok_response(request, serde_json::json!(overlay.stats))
}

/// Aggregate health (§4.4.11): `{rank, status, duration, children:[...]}`.
/// A request with `"stream": true` in its payload registers as a
/// streaming subscriber re-sent a fresh snapshot by
/// [`Overlay::notify_monitors`] whenever any child status changes.
fn health(overlay: &mut Overlay, request: &Message) -> Message {
    if wants_stream(request) {
        overlay.health_requests.push(request.clone());
    }
    ok_response(request, overlay.health_snapshot())
}

/// Peer status/torpidity monitor (§4.4.11): always streaming. The initial
/// dump carries one record per peer that is not both offline and calm
/// (`status != offline || torpid`); later pushes come one rank at a time
/// from [`Overlay::notify_monitors`].
fn monitor(overlay: &mut Overlay, request: &Message) -> Message {
    overlay.monitor_requests.push(request.clone());
    let records: Vec<_> = overlay
        .children
        .iter()
        .filter(|c| c.status != SubtreeStatus::Offline || c.torpid)
        .map(|c| {
            serde_json::json!({
                "rank": c.rank,
                "status": c.status.as_str(),
                "torpid": c.torpid,
            })
        })
        .collect();
    ok_response(request, serde_json::json!({ "peers": records }))
}

fn wants_stream(request: &Message) -> bool {
    request
        .payload_as::<serde_json::Value>()
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false)
}

fn topology(overlay: &Overlay, request: &Message) -> Message {
    match overlay.topology.get_json_subtree_at(overlay.rank) {
        Ok(subtree) => ok_response(request, subtree),
        Err(e) => error_response(request, errno::EINVAL, &e.to_string()),
    }
}

fn trace_subscribe(trace: &mut TraceSubscribers, request: &Message) -> (Message, DispatchEffect) {
    let filter = request
        .payload_as::<serde_json::Value>()
        .ok()
        .map(|v| TraceFilter {
            typemask: v.get("typemask").and_then(|t| t.as_u64()).unwrap_or(0) as u8,
            topic_glob: v.get("topic").and_then(|t| t.as_str()).map(str::to_string),
            nodeid: v
                .get("nodeid")
                .and_then(|n| n.as_u64())
                .map(|n| n as u32)
                .unwrap_or(NODEID_ANY),
        })
        .unwrap_or_default();
    let id = trace.add(filter);
    (ok_response(request, serde_json::json!({ "subscribed": true })), DispatchEffect::TraceSubscribed(id))
}

/// A client hanging up a streaming RPC (trace/monitor/health) detaches its
/// subscription; `sub_id` is carried in the request payload by the run loop
/// when it notices the client's route has gone away. Trace subscribers are
/// keyed by the id `overlay.trace` handed back at subscribe time; monitor
/// and health subscribers have no separate id, so `sub_id` there is the
/// subscribing request's own matchtag.
fn disconnect(overlay: &mut Overlay, trace: &mut TraceSubscribers, request: &Message) -> (Message, DispatchEffect) {
    if let Ok(v) = request.payload_as::<serde_json::Value>() {
        if let Some(id) = v.get("sub_id").and_then(|i| i.as_u64()) {
            trace.remove(id);
            overlay.monitor_requests.retain(|r| r.matchtag as u64 != id);
            overlay.health_requests.retain(|r| r.matchtag as u64 != id);
        }
    }
    (ok_response(request, serde_json::json!({})), DispatchEffect::None)
}

fn disconnect_subtree(overlay: &mut Overlay, request: &Message) -> (Message, DispatchEffect) {
    let Some(rank) = request
        .payload_as::<serde_json::Value>()
        .ok()
        .and_then(|v| v.get("nodeid").and_then(|n| n.as_u64()))
        .map(|n| n as u32)
    else {
        return (error_response(request, errno::EINVAL, "missing nodeid"), DispatchEffect::None);
    };
    match overlay.disconnect_subtree(rank) {
        Ok(lost) => (ok_response(request, serde_json::json!({})), DispatchEffect::Deliver(lost)),
        Err(e) => (error_response(request, errno::EINVAL, &e.to_string()), DispatchEffect::None),
    }
}

fn disconnect_parent(overlay: &mut Overlay, request: &Message) -> (Message, DispatchEffect) {
    let lost = overlay.disconnect_parent();
    (ok_response(request, serde_json::json!({})), DispatchEffect::Deliver(lost))
}

/// FLUB late-join is not implemented against this topology model (§9 Open
/// Question decision): config-file and PMI bootstrap both know the full
/// membership up front, so a FLUB handshake has nothing to negotiate.
fn flub_unsupported(request: &Message) -> Message {
    error_response(request, errno::ENOSYS, "late join not supported by this topology")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_cert::Cert;
    use flux_config::TbonSettings;
    use flux_topology::{Scheme, Topology};

    fn root_overlay(size: i64) -> Overlay {
        let mut topo = Topology::build(Scheme::Kary(2), size).unwrap();
        topo.set_rank(0);
        Overlay::new(
            0,
            size as u32,
            "root-uuid".to_string(),
            "node0".to_string(),
            topo,
            Cert::create().unwrap(),
            TbonSettings::default(),
        )
    }

    #[test]
    fn stats_get_reports_counters() {
        let mut overlay = root_overlay(3);
        overlay.stats.hello_count = 2;
        let mut trace = TraceSubscribers::new();
        let (resp, _) = dispatch(&mut overlay, &mut trace, &Message::request("overlay.stats-get", 1)).unwrap();
        let payload: serde_json::Value = resp.payload_as().unwrap();
        assert_eq!(payload["hello_count"], 2);
    }

    #[test]
    fn health_reports_self_and_children() {
        let overlay_children = root_overlay(3).children.len();
        let mut overlay = root_overlay(3);
        let mut trace = TraceSubscribers::new();
        let (resp, _) = dispatch(&mut overlay, &mut trace, &Message::request("overlay.health", 1)).unwrap();
        let payload: serde_json::Value = resp.payload_as().unwrap();
        assert_eq!(payload["status"], SubtreeStatus::Partial.as_str());
        assert_eq!(payload["children"].as_array().unwrap().len(), overlay_children);
    }

    #[test]
    fn flub_topics_return_unsupported() {
        let mut overlay = root_overlay(3);
        let mut trace = TraceSubscribers::new();
        let (resp, _) = dispatch(&mut overlay, &mut trace, &Message::request("overlay.flub-getinfo", 1)).unwrap();
        let payload: serde_json::Value = resp.payload_as().unwrap();
        assert_eq!(payload["errno"], errno::ENOSYS);
    }

    #[test]
    fn disconnect_subtree_unknown_rank_errors() {
        let mut overlay = root_overlay(3);
        let mut trace = TraceSubscribers::new();
        let req = Message::request("overlay.disconnect-subtree", 1)
            .with_payload(serde_json::json!({ "nodeid": 42 }))
            .unwrap();
        let (resp, effect) = dispatch(&mut overlay, &mut trace, &req).unwrap();
        let payload: serde_json::Value = resp.payload_as().unwrap();
        assert!(payload.get("errno").is_some());
        assert!(matches!(effect, DispatchEffect::None));
    }

    #[test]
    fn trace_subscribe_registers_a_subscriber() {
        let mut overlay = root_overlay(3);
        let mut trace = TraceSubscribers::new();
        let req = Message::request("overlay.trace", 1)
            .with_payload(serde_json::json!({ "typemask": 0 }))
            .unwrap();
        let (_resp, effect) = dispatch(&mut overlay, &mut trace, &req).unwrap();
        assert!(matches!(effect, DispatchEffect::TraceSubscribed(_)));
        assert!(!trace.is_empty());
    }

    #[test]
    fn monitor_initial_dump_skips_quiet_offline_peers() {
        let mut overlay = root_overlay(3);
        let mut trace = TraceSubscribers::new();
        let (resp, _) = dispatch(&mut overlay, &mut trace, &Message::request("overlay.monitor", 1)).unwrap();
        let payload: serde_json::Value = resp.payload_as().unwrap();
        // Every child starts offline and not torpid, so the initial dump
        // is empty even though there are two configured children.
        assert!(payload["peers"].as_array().unwrap().is_empty());
        assert_eq!(overlay.monitor_requests.len(), 1);
    }

    #[test]
    fn health_stream_request_registers_as_a_subscriber() {
        let mut overlay = root_overlay(3);
        let mut trace = TraceSubscribers::new();
        let req = Message::request("overlay.health", 1)
            .with_payload(serde_json::json!({ "stream": true }))
            .unwrap();
        dispatch(&mut overlay, &mut trace, &req);
        assert_eq!(overlay.health_requests.len(), 1);
    }

    #[test]
    fn disconnect_drops_monitor_and_health_subscribers_by_matchtag() {
        let mut overlay = root_overlay(3);
        let mut trace = TraceSubscribers::new();
        overlay.monitor_requests.push(Message::request("overlay.monitor", 7));
        overlay.health_requests.push(Message::request("overlay.health", 7));

        let req = Message::request("overlay.disconnect", 1)
            .with_payload(serde_json::json!({ "sub_id": 7 }))
            .unwrap();
        dispatch(&mut overlay, &mut trace, &req);

        assert!(overlay.monitor_requests.is_empty());
        assert!(overlay.health_requests.is_empty());
    }

    #[test]
    fn unrelated_topic_is_not_dispatched() {
        let mut overlay = root_overlay(3);
        let mut trace = TraceSubscribers::new();
        assert!(dispatch(&mut overlay, &mut trace, &Message::request("kvs.put", 1)).is_none());
    }
}
