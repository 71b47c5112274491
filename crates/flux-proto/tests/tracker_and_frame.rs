use flux_proto::{decode, encode, ControlKind, Flags, Message, Tracker};

#[test]
fn request_response_cycle_through_tracker_and_wire() {
    let mut tracker = Tracker::new();

    let mut req = Message::request("overlay.health", 11);
    req.push_route("rank-3-uuid");
    tracker.track("rank-3-uuid", req.clone());

    let frames = encode(&req);
    let wire_req = decode(&frames).unwrap();
    assert_eq!(wire_req, req);

    let resp = Message::response_to(&wire_req);
    let retired = tracker.observe_response("rank-3-uuid", &resp, 0);
    assert_eq!(retired, Some(req));
    assert!(tracker.is_empty());
}

#[test]
fn lost_peer_synthesizes_unreachable_for_every_pending_request() {
    let mut tracker = Tracker::new();
    tracker.track("rank-5-uuid", Message::request("overlay.topology", 1));
    tracker.track("rank-5-uuid", Message::request("overlay.status", 2));
    tracker.track("rank-6-uuid", Message::request("overlay.status", 2));

    let mut synthesized = Vec::new();
    tracker.purge_peer("rank-5-uuid", |req| {
        synthesized.push(Message::synthesize_unreachable(&req, "parent peer lost"));
    });

    assert_eq!(synthesized.len(), 2);
    assert_eq!(tracker.len(), 1);
    for resp in &synthesized {
        let payload: String = resp.payload_as().unwrap();
        assert!(payload.starts_with("EHOSTUNREACH"));
    }
}

#[test]
fn control_disconnect_has_no_topic_or_payload() {
    let msg = Message::control(ControlKind::Disconnect, 7);
    let frames = encode(&msg);
    let decoded = decode(&frames).unwrap();
    assert!(decoded.topic.is_empty());
    assert!(decoded.payload.is_empty());
    assert_eq!(decoded.control, Some((ControlKind::Disconnect, 7)));
}

#[test]
fn upstream_flag_survives_the_wire() {
    let mut msg = Message::request("overlay.disconnect-parent", 1);
    msg.flags.insert(Flags::UPSTREAM);
    let decoded = decode(&encode(&msg)).unwrap();
    assert!(decoded.flags.contains(Flags::UPSTREAM));
}
