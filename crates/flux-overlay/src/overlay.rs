//! The overlay core (§4.4): bootstrap-derived state, hello/goodbye,
//! message classification and routing, sequence checking, event
//! multicast, heartbeat/torpid detection, and parent-loss handling.
//!
//! This module is deliberately transport-free: every operation here takes
//! and returns [`Message`]/[`RouteDecision`] values so the routing and
//! handshake logic can be exercised without a socket. [`crate::run`] wires
//! these decisions to real `tmq` sockets.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use flux_cert::Cert;
use flux_config::TbonSettings;
use flux_proto::errno::{self, describe};
use flux_proto::{ControlKind, Flags, Kind, Message, Role};
use flux_topology::Topology;
use tracing::{debug, info, warn};

use crate::error::OverlayError;
use crate::peer::{Child, Parent};
use crate::subtree::{self, SubtreeStatus};

pub const VERSION: (u8, u8, u8) = (1, 0, 0);

fn version_to_int24(v: (u8, u8, u8)) -> i64 {
    ((v.0 as i64) << 16) | ((v.1 as i64) << 8) | v.2 as i64
}

fn version_triple(v: i64) -> (u8, u8, u8) {
    (((v >> 16) & 0xff) as u8, ((v >> 8) & 0xff) as u8, (v & 0xff) as u8)
}

/// What the caller should do with a message after [`Overlay`] has
/// classified and/or routed it.
#[derive(Debug)]
pub enum RouteDecision {
    ToParent(Message),
    ToChild { uuid: String, msg: Message },
    /// One send per online child, route stack rooted at that child's uuid.
    Multicast(Vec<(String, Message)>),
    ToLocal(Message),
    /// Drop: nothing to send anywhere (e.g. ignored control message).
    Drop,
}

/// Snapshot of counters for `overlay.stats-get`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OverlayStats {
    pub hello_count: u64,
    pub goodbye_count: u64,
    pub event_tx: u64,
    pub event_rx: u64,
}

pub struct Overlay {
    pub rank: u32,
    pub size: u32,
    pub uuid: String,
    pub hostname: String,
    pub version: (u8, u8, u8),
    pub topology: Topology,
    pub cert: Cert,
    pub settings: TbonSettings,

    pub bind_uri: Option<String>,
    pub parent: Option<Parent>,

    /// Indexed in topology child-rank order.
    pub children: Vec<Child>,
    /// Only online children are present, mirroring the real broker's
    /// uuid-keyed hash (§3: "the child index by uuid contains only online
    /// children").
    child_uuid_index: HashMap<String, usize>,

    pub status: SubtreeStatus,
    pub status_timestamp: Instant,

    /// Event sequence counter maintained by every rank except 0.
    pub event_seq: u64,

    pub stats: OverlayStats,

    pub monitor_requests: Vec<Message>,
    pub health_requests: Vec<Message>,
    /// `overlay.health`/`overlay.monitor` push frames queued by
    /// [`Self::notify_monitors`] since the run loop last drained them
    /// (§4.4.11: "streaming clients are re-sent a response whenever any
    /// child status changes").
    pending_notifications: Vec<Message>,

    /// Refuse new hellos once the broker state machine enters
    /// CLEANUP/SHUTDOWN (§3's "Lifecycle (self, viewed by broker state)").
    pub accepting_hellos: bool,
}

impl Overlay {
    pub fn new(
        rank: u32,
        size: u32,
        uuid: String,
        hostname: String,
        topology: Topology,
        cert: Cert,
        settings: TbonSettings,
    ) -> Self {
        let children = topology
            .get_child_ranks()
            .into_iter()
            .map(Child::new)
            .collect::<Vec<_>>();
        let status = if children.is_empty() {
            SubtreeStatus::Full
        } else {
            SubtreeStatus::Partial
        };

        let parent = topology.get_parent().map(|parent_rank| {
            // public key/uri are filled in by bootstrap before the socket
            // connects; placeholders here keep construction infallible.
            Parent::new(parent_rank, String::new(), String::new())
        });

        Self {
            rank,
            size,
            uuid,
            hostname,
            version: VERSION,
            topology,
            cert,
            settings,
            bind_uri: None,
            parent,
            children,
            child_uuid_index: HashMap::new(),
            status,
            status_timestamp: Instant::now(),
            event_seq: 0,
            stats: OverlayStats::default(),
            monitor_requests: Vec::new(),
            health_requests: Vec::new(),
            pending_notifications: Vec::new(),
            accepting_hellos: true,
        }
    }

    fn child_index_by_rank(&self, rank: u32) -> Option<usize> {
        self.children.iter().position(|c| c.rank == rank)
    }

    fn child_mut_by_uuid(&mut self, uuid: &str) -> Option<&mut Child> {
        let idx = *self.child_uuid_index.get(uuid)?;
        self.children.get_mut(idx)
    }

    pub fn child_by_uuid(&self, uuid: &str) -> Option<&Child> {
        let idx = *self.child_uuid_index.get(uuid)?;
        self.children.get(idx)
    }

    fn online_child_count(&self) -> usize {
        self.children.iter().filter(|c| c.is_online()).count()
    }

    // ---- self-status aggregation (§3) --------------------------------

    /// Recompute self status from children; if it changed, push a status
    /// control message upstream and notify health subscribers. Returns the
    /// control message to send upstream, if any.
    fn recompute_status(&mut self) -> Option<Message> {
        let new_status = subtree::aggregate(self.children.iter().map(|c| &c.status));
        if new_status == self.status {
            return None;
        }
        self.status = new_status;
        self.status_timestamp = Instant::now();
        info!(rank = self.rank, status = new_status.as_str(), "self status changed");
        Some(Message::control(ControlKind::Status, new_status.as_i64()))
    }

    // ---- hello / goodbye (§4.4.3, §4.4.4) -----------------------------

    /// Build this broker's outgoing hello request to its parent.
    pub fn build_hello_request(&self) -> Message {
        let payload = serde_json::json!({
            "rank": self.rank,
            "version": version_to_int24(self.version),
            "uuid": self.uuid,
            "status": self.status.as_i64(),
            "hostname": self.hostname,
        });
        let mut msg = Message::request("overlay.hello", 0)
            .with_payload(payload)
            .expect("hello payload always serializes");
        msg.role.insert(Role::OWNER);
        msg
    }

    /// Parent-side: validate an incoming hello and update the child
    /// record. Returns the response to send back to the child.
    pub fn handle_hello_request(
        &mut self,
        request: &Message,
        expected_hostname: impl Fn(u32) -> Option<String>,
    ) -> Message {
        self.stats.hello_count += 1;

        if !self.accepting_hellos {
            return error_response(request, errno::EPERM, "broker is shutting down");
        }
        if !request.role.contains(Role::OWNER) {
            return error_response(request, errno::EPERM, "hello must be sent with owner role");
        }

        let payload: serde_json::Value = match request.payload_as() {
            Ok(v) => v,
            Err(_) => return error_response(request, errno::EPROTO, "malformed hello payload"),
        };

        let claimed_rank = match payload.get("rank").and_then(|v| v.as_u64()) {
            Some(r) => r as u32,
            None => return error_response(request, errno::EPROTO, "missing rank"),
        };
        let claimed_version = payload.get("version").and_then(|v| v.as_i64()).unwrap_or(0);
        let claimed_uuid = match payload.get("uuid").and_then(|v| v.as_str()) {
            Some(u) => u.to_string(),
            None => return error_response(request, errno::EPROTO, "missing uuid"),
        };
        let claimed_status = payload
            .get("status")
            .and_then(|v| v.as_i64())
            .and_then(SubtreeStatus::from_i64)
            .unwrap_or(SubtreeStatus::Unknown);
        let claimed_hostname = payload.get("hostname").and_then(|v| v.as_str());

        let Some(idx) = self.child_index_by_rank(claimed_rank) else {
            return error_response(request, errno::EINVAL, "rank is not a direct child");
        };

        let (local_major, local_minor, local_patch) = version_triple(version_to_int24(self.version));
        let (remote_major, remote_minor, remote_patch) = version_triple(claimed_version);
        if (local_major, local_minor) != (remote_major, remote_minor) {
            let message = format!(
                "version mismatch: local {local_major}.{local_minor}.{local_patch}, remote {remote_major}.{remote_minor}.{remote_patch}"
            );
            self.children[idx].last_error = Some(message.clone());
            self.children[idx].set_status(SubtreeStatus::Offline);
            return error_response(request, errno::EPROTO, &message);
        }

        if let Some(claimed) = claimed_hostname {
            if let Some(expected) = expected_hostname(claimed_rank) {
                if expected != claimed {
                    let message = format!("hostname mismatch: claimed {claimed}, expected {expected}");
                    self.children[idx].last_error = Some(message.clone());
                    self.children[idx].set_status(SubtreeStatus::Offline);
                    return error_response(request, errno::EINVAL, &message);
                }
            }
        }

        // A child that is already online sending hello again is a
        // crash-restart: drop the old association first.
        if self.children[idx].is_online() {
            if let Some(old_uuid) = self.children[idx].uuid.clone() {
                self.child_uuid_index.remove(&old_uuid);
            }
            self.children[idx].set_status(SubtreeStatus::Lost);
            warn!(rank = claimed_rank, "child re-helloed while online; treating as crash-restart");
        }

        self.children[idx].uuid = Some(claimed_uuid.clone());
        self.children[idx].set_status(claimed_status);
        self.children[idx].last_error = None;
        self.child_uuid_index.insert(claimed_uuid, idx);

        self.recompute_status();
        self.notify_monitors(claimed_rank);

        Message::response_to(request)
            .with_payload(serde_json::json!({ "uuid": self.uuid }))
            .expect("uuid payload always serializes")
    }

    /// Child-side: apply the parent's hello response.
    pub fn apply_hello_response(&mut self, response: &Message) -> Result<(), OverlayError> {
        let Some(parent) = self.parent.as_mut() else {
            return Err(OverlayError::NoParent);
        };
        parent.hello_responded = true;

        let payload: serde_json::Value = response.payload_as().unwrap_or_default();
        if let Some(err) = payload.get("errno") {
            parent.hello_error = true;
            let message = payload
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("hello rejected")
                .to_string();
            warn!(rank = self.rank, errno = ?err, "hello rejected by parent");
            return Err(OverlayError::HelloRejected(message));
        }

        if let Some(uuid) = payload.get("uuid").and_then(|v| v.as_str()) {
            parent.uuid = uuid.to_string();
        }
        parent.hello_error = false;
        info!(rank = self.rank, "hello accepted by parent");
        Ok(())
    }

    pub fn build_goodbye_request(&mut self) -> Option<Message> {
        let parent = self.parent.as_mut()?;
        if parent.goodbye_sent || parent.offline {
            return None;
        }
        parent.goodbye_sent = true;
        let mut msg = Message::request("overlay.goodbye", 0);
        msg.role.insert(Role::OWNER);
        Some(msg)
    }

    /// Parent-side: a child said goodbye. Marks it offline and purges its
    /// tracker, returning the synthesized EHOSTUNREACH responses to
    /// deliver locally plus the response to send back to the child.
    pub fn handle_goodbye_request(&mut self, child_uuid: &str, request: &Message) -> (Message, Vec<Message>) {
        self.stats.goodbye_count += 1;
        let response = Message::response_to(request);
        let lost = self.transition_child(child_uuid, SubtreeStatus::Offline, "goodbye", None);
        (response, lost)
    }

    /// Move a child out of the online set into `status` (§3's lifecycle:
    /// `offline` for an orderly goodbye, `lost` for a transport failure or
    /// an administrative disconnect), purging its tracker into synthesized
    /// `EHOSTUNREACH` responses. `error`, if given, is recorded on the
    /// child record so `overlay.health` subscribers can see why.
    fn transition_child(
        &mut self,
        child_uuid: &str,
        status: SubtreeStatus,
        reason: &str,
        error: Option<&str>,
    ) -> Vec<Message> {
        let Some(idx) = self.child_uuid_index.remove(child_uuid) else {
            return Vec::new();
        };
        let child = &mut self.children[idx];
        child.set_status(status);
        if let Some(error) = error {
            child.last_error = Some(error.to_string());
        }
        let rank = child.rank;

        let mut lost = Vec::new();
        child.tracker.purge_peer(child_uuid, |req| {
            lost.push(Message::synthesize_unreachable(&req, reason));
        });

        self.recompute_status();
        self.notify_monitors(rank);
        lost
    }

    // ---- message classification & routing (§4.4.5) --------------------

    /// Route a message arriving from the local channel.
    pub fn route_from_local(&mut self, mut msg: Message) -> RouteDecision {
        msg.clear_local_role();
        match msg.kind {
            Kind::Request => self.route_local_request(msg),
            Kind::Response => self.route_local_response(msg),
            Kind::Event => self.route_local_event(msg),
            Kind::Control => RouteDecision::Drop,
        }
    }

    fn target_rank(msg: &Message) -> Option<u32> {
        msg.payload_as::<serde_json::Value>()
            .ok()
            .and_then(|v| v.get("nodeid").and_then(|n| n.as_u64()))
            .map(|n| n as u32)
    }

    fn route_local_request(&mut self, mut msg: Message) -> RouteDecision {
        let upstream = msg.flags.contains(Flags::UPSTREAM);
        let target = Self::target_rank(&msg);
        let routed_via_child = target.and_then(|t| self.topology.get_child_route(t));

        if upstream || routed_via_child.is_none() {
            if self.parent.is_none() {
                return match target {
                    None | Some(0) => RouteDecision::ToLocal(error_response(
                        &msg,
                        errno::ENOSYS,
                        "no route: no parent and target is rank 0/any",
                    )),
                    _ => RouteDecision::Drop,
                };
            }
            msg.push_route(self.uuid.clone());
            return RouteDecision::ToParent(msg);
        }

        let child_rank = routed_via_child.unwrap();
        let Some(idx) = self.child_index_by_rank(child_rank) else {
            return RouteDecision::Drop;
        };
        let Some(child_uuid) = self.children[idx].uuid.clone() else {
            return RouteDecision::Drop;
        };

        msg.push_route(self.uuid.clone());
        msg.push_route(child_uuid.clone());
        self.children[idx].tracker.track(child_uuid.clone(), msg.clone());
        RouteDecision::ToChild { uuid: child_uuid, msg }
    }

    fn route_local_response(&mut self, mut msg: Message) -> RouteDecision {
        let next = msg.pop_route();
        match next {
            Some(hop) if self.parent.as_ref().map(|p| p.uuid == hop).unwrap_or(false) => {
                RouteDecision::ToParent(msg)
            }
            Some(hop) => RouteDecision::ToChild { uuid: hop, msg },
            None => RouteDecision::Drop,
        }
    }

    fn route_local_event(&mut self, msg: Message) -> RouteDecision {
        if self.rank == 0 {
            self.stats.event_tx += 1;
            self.multicast_event(msg)
        } else {
            let mut msg = msg;
            msg.flags.insert(Flags::UPSTREAM);
            RouteDecision::ToParent(msg)
        }
    }

    /// Route a message arriving from the parent socket.
    pub fn route_from_parent(&mut self, mut msg: Message) -> RouteDecision {
        msg.clear_local_role();
        let Some(parent) = self.parent.as_mut() else {
            return RouteDecision::Drop;
        };
        if !parent.hello_responded && !(msg.kind == Kind::Control) {
            // discard everything but control/hello-response before hello completes
            let is_hello_response = msg.kind == Kind::Response && msg.topic == "overlay.hello";
            if !is_hello_response {
                return RouteDecision::Drop;
            }
        }

        match msg.kind {
            Kind::Response => {
                let route_uuid = parent.uuid.clone();
                parent.tracker.observe_response(&route_uuid, &msg, 0);
                RouteDecision::ToLocal(msg)
            }
            Kind::Event => {
                self.stats.event_rx += 1;
                self.check_event_sequence(msg.seq);
                let multicast = self.multicast_event(msg.clone());
                msg.route.clear();
                if let RouteDecision::Multicast(sends) = multicast {
                    // deliver locally too (rank 0 already handles this path
                    // via route_local_event; non-zero ranks deliver here).
                    let mut all = sends;
                    return RouteDecision::Multicast(all.drain(..).collect::<Vec<_>>())
                        .also_deliver_locally(msg);
                }
                RouteDecision::ToLocal(msg)
            }
            Kind::Control => self.handle_parent_control(msg),
            Kind::Request => RouteDecision::ToLocal(msg),
        }
    }

    fn handle_parent_control(&mut self, msg: Message) -> RouteDecision {
        let Some((kind, _value)) = msg.control else {
            return RouteDecision::Drop;
        };
        match kind {
            ControlKind::Heartbeat | ControlKind::Status => RouteDecision::Drop,
            ControlKind::Disconnect => {
                let lost = self.handle_parent_loss("parent sent disconnect control");
                RouteDecision::Multicast(Vec::new()).also_deliver_many(lost)
            }
        }
    }

    /// Route a message arriving from the bind socket, `from_uuid` is the
    /// ROUTER-supplied sender identity.
    pub fn route_from_child(&mut self, from_uuid: &str, mut msg: Message) -> RouteDecision {
        msg.clear_local_role();

        let known = self.child_uuid_index.contains_key(from_uuid);
        if !known {
            if msg.kind == Kind::Request && msg.topic == "overlay.hello" {
                // handled by the caller via handle_hello_request; nothing
                // to route here.
                return RouteDecision::Drop;
            }
            debug!(from = from_uuid, "frame from unknown child; sending disconnect");
            return RouteDecision::ToChild {
                uuid: from_uuid.to_string(),
                msg: Message::control(ControlKind::Disconnect, 0),
            };
        }

        if let Some(child) = self.child_mut_by_uuid(from_uuid) {
            child.lastseen = Some(Instant::now());
        }

        match msg.kind {
            Kind::Control => {
                if let Some((ControlKind::Status, value)) = msg.control {
                    if let Some(status) = SubtreeStatus::from_i64(value) {
                        let rank = self.child_mut_by_uuid(from_uuid).map(|c| c.rank);
                        if let Some(idx) = self.child_uuid_index.get(from_uuid).copied() {
                            self.children[idx].set_status(status);
                        }
                        if let Some(rank) = rank {
                            self.recompute_status();
                            self.notify_monitors(rank);
                        }
                    }
                }
                RouteDecision::Drop
            }
            Kind::Request => RouteDecision::ToLocal(msg),
            Kind::Response => {
                msg.pop_route(); // child uuid hop
                msg.pop_route(); // local uuid hop
                if let Some(idx) = self.child_uuid_index.get(from_uuid).copied() {
                    self.children[idx].tracker.observe_response(from_uuid, &msg, 0);
                }
                RouteDecision::ToLocal(msg)
            }
            Kind::Event => {
                if self.rank != 0 {
                    let mut msg = msg;
                    msg.flags.insert(Flags::UPSTREAM);
                    RouteDecision::ToParent(msg)
                } else {
                    msg.route.clear();
                    RouteDecision::ToLocal(msg)
                }
            }
        }
    }

    // ---- sequence checking (§4.4.6) -----------------------------------

    fn check_event_sequence(&mut self, seq: Option<u64>) {
        let Some(seq) = seq else { return };
        if self.event_seq == 0 {
            self.event_seq = seq;
            return;
        }
        if seq <= self.event_seq {
            warn!(rank = self.rank, seq, "duplicate event");
        } else if seq > self.event_seq + 1 {
            warn!(
                rank = self.rank,
                first = self.event_seq + 1,
                last = seq - 1,
                "lost events"
            );
        }
        self.event_seq = seq;
    }

    // ---- event multicast (§4.4.7) --------------------------------------

    fn multicast_event(&mut self, msg: Message) -> RouteDecision {
        let mut sends = Vec::new();
        for child in self.children.iter().filter(|c| c.is_online()) {
            let Some(uuid) = child.uuid.clone() else { continue };
            let mut out = msg.clone();
            out.route = vec![uuid.clone()];
            sends.push((uuid, out));
        }
        RouteDecision::Multicast(sends)
    }

    /// Call when the transport reports `EHOSTUNREACH` sending to `uuid`,
    /// whether that send was a single routed message or one leg of an
    /// event multicast (§4.4.7, §4.4.10, §7 scenario E): transitions that
    /// child to `lost` and drains its tracker into synthesized
    /// `EHOSTUNREACH` responses with diagnostic `"lost connection"`.
    pub fn handle_child_unreachable(&mut self, uuid: &str) -> Vec<Message> {
        self.transition_child(uuid, SubtreeStatus::Lost, "EHOSTUNREACH sending to child", Some("lost connection"))
            .into_iter()
            .map(|mut m| {
                m.route.clear();
                m
            })
            .collect()
    }

    // ---- heartbeat / torpid detection (§4.4.9) --------------------------

    /// One sync-timer tick. Returns a heartbeat control to send upstream,
    /// if due.
    pub fn tick(&mut self) -> Option<Message> {
        let now = Instant::now();
        let heartbeat = if let Some(parent) = self.parent.as_mut() {
            let due = parent
                .lastsent
                .map(|t| now.duration_since(t) > self.settings.torpid_min)
                .unwrap_or(true);
            if due && !parent.offline {
                parent.lastsent = Some(now);
                Some(Message::control(ControlKind::Heartbeat, 0))
            } else {
                None
            }
        } else {
            None
        };

        self.update_torpid_children(now);
        heartbeat
    }

    fn update_torpid_children(&mut self, now: Instant) {
        let torpid_max = self.settings.torpid_max;
        let mut notify = Vec::new();
        for child in self.children.iter_mut() {
            if !child.is_online() {
                continue;
            }
            let Some(lastseen) = child.lastseen else { continue };
            let idle = now.duration_since(lastseen);

            if !torpid_max.is_zero() && idle >= torpid_max {
                if !child.torpid {
                    child.torpid = true;
                    warn!(
                        rank = child.rank,
                        duration = %flux_config::fsd::format(idle),
                        "broker has been unresponsive"
                    );
                    notify.push(child.rank);
                }
            } else if child.torpid {
                child.torpid = false;
                info!(rank = child.rank, "broker is responsive now");
                notify.push(child.rank);
            }
        }
        for rank in notify {
            self.notify_monitors(rank);
        }
    }

    // ---- parent loss (§4.4.10) ------------------------------------------

    /// Mark the parent offline, purge its tracker, and return the
    /// synthesized EHOSTUNREACH responses to deliver locally.
    pub fn handle_parent_loss(&mut self, reason: &str) -> Vec<Message> {
        let Some(parent) = self.parent.as_mut() else {
            return Vec::new();
        };
        if parent.offline {
            return Vec::new();
        }
        parent.offline = true;
        let route_uuid = parent.uuid.clone();
        let mut lost = Vec::new();
        parent.tracker.purge_peer(&route_uuid, |req| {
            lost.push(Message::synthesize_unreachable(&req, reason));
        });
        warn!(rank = self.rank, reason, "parent lost");
        lost
    }

    // ---- admin hooks ------------------------------------------------------

    /// `overlay.disconnect-parent`: same transition as an organic parent
    /// loss, triggered synthetically (§9 supplemented feature).
    pub fn disconnect_parent(&mut self) -> Vec<Message> {
        self.handle_parent_loss("overlay.disconnect-parent")
    }

    /// `overlay.disconnect-subtree`: administrative force-disconnect. §3's
    /// child lifecycle sends this down the "disconnect rpc" edge, which
    /// lands on `lost`, not `offline`.
    pub fn disconnect_subtree(&mut self, rank: u32) -> Result<Vec<Message>, OverlayError> {
        let idx = self.child_index_by_rank(rank).ok_or(OverlayError::NotAChild(rank))?;
        let Some(uuid) = self.children[idx].uuid.clone() else {
            return Ok(Vec::new());
        };
        Ok(self.transition_child(
            &uuid,
            SubtreeStatus::Lost,
            "overlay.disconnect-subtree",
            Some("administrative disconnect"),
        ))
    }

    /// `rank`'s status or torpidity just changed. Queues a fresh push for
    /// every active `overlay.monitor` subscriber and, since a child status
    /// change also means this broker's own aggregate may have moved, a
    /// fresh `overlay.health` snapshot for every active `overlay.health`
    /// streaming subscriber (§4.4.11).
    fn notify_monitors(&mut self, rank: u32) {
        if !self.monitor_requests.is_empty() {
            if let Some(child) = self.children.iter().find(|c| c.rank == rank) {
                if let Ok(event) = Message::event("overlay.monitor", 0).with_payload(monitor_record(child)) {
                    self.pending_notifications.push(event);
                }
            }
        }
        if !self.health_requests.is_empty() {
            if let Ok(event) = Message::event("overlay.health", 0).with_payload(self.health_snapshot()) {
                self.pending_notifications.push(event);
            }
        }
    }

    /// The `{rank, status, duration, children:[...]}` shape both the
    /// one-shot `overlay.health` response and every streamed push share
    /// (§4.4.11).
    pub fn health_snapshot(&self) -> serde_json::Value {
        let children: Vec<_> = self
            .children
            .iter()
            .map(|c| {
                let mut entry = serde_json::json!({
                    "rank": c.rank,
                    "status": c.status.as_str(),
                    "duration": c.duration_since_status_change().as_secs_f64(),
                });
                if let Some(error) = &c.last_error {
                    entry["error"] = serde_json::json!(error);
                }
                entry
            })
            .collect();
        serde_json::json!({
            "rank": self.rank,
            "status": self.status.as_str(),
            "duration": self.status_timestamp.elapsed().as_secs_f64(),
            "children": children,
        })
    }

    /// Drain monitor/health push frames queued since the last drain, for
    /// the run loop to deliver to the local channel.
    pub fn drain_notifications(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.pending_notifications)
    }
}

/// One `overlay.monitor` record: `{rank, status, torpid}` (§4.4.11).
fn monitor_record(child: &Child) -> serde_json::Value {
    serde_json::json!({
        "rank": child.rank,
        "status": child.status.as_str(),
        "torpid": child.torpid,
    })
}

fn error_response(request: &Message, errno: i32, message: &str) -> Message {
    let mut resp = Message::response_to(request);
    resp.payload = serde_json::to_vec(&serde_json::json!({
        "errno": errno,
        "error": describe(errno, message),
    }))
    .unwrap_or_default();
    resp
}

impl RouteDecision {
    fn also_deliver_locally(self, msg: Message) -> Self {
        match self {
            RouteDecision::Multicast(mut sends) => {
                // Local delivery is represented by an empty-uuid sentinel
                // the run loop recognizes and hands to the local channel.
                sends.push((String::new(), msg));
                RouteDecision::Multicast(sends)
            }
            other => other,
        }
    }

    fn also_deliver_many(self, msgs: Vec<Message>) -> Self {
        match self {
            RouteDecision::Multicast(mut sends) => {
                sends.extend(msgs.into_iter().map(|m| (String::new(), m)));
                RouteDecision::Multicast(sends)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_cert::Cert;
    use flux_topology::{Scheme, Topology};

    fn leaf_overlay() -> Overlay {
        let mut topo = Topology::build(Scheme::Kary(2), 3).unwrap();
        topo.set_rank(1);
        Overlay::new(
            1,
            3,
            "child-uuid".to_string(),
            "node1".to_string(),
            topo,
            Cert::create().unwrap(),
            TbonSettings::default(),
        )
    }

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
    fn leaf_starts_full_with_no_children() {
        let ov = leaf_overlay();
        assert_eq!(ov.status, SubtreeStatus::Full);
    }

    #[test]
    fn root_with_children_starts_partial() {
        let ov = root_overlay(3);
        assert_eq!(ov.status, SubtreeStatus::Partial);
    }

    #[test]
    fn hello_from_unknown_rank_is_rejected() {
        let mut ov = root_overlay(3);
        let req = ov_hello_request(99, "unk");
        let resp = ov.handle_hello_request(&req, |_| None);
        let payload: serde_json::Value = resp.payload_as().unwrap();
        assert!(payload.get("errno").is_some());
    }

    #[test]
    fn hello_from_direct_child_succeeds_and_updates_status() {
        let mut ov = root_overlay(3);
        let req = ov_hello_request(1, "uuid-1");
        let resp = ov.handle_hello_request(&req, |_| None);
        let payload: serde_json::Value = resp.payload_as().unwrap();
        assert_eq!(payload["uuid"], "root-uuid");
        assert!(ov.child_by_uuid("uuid-1").is_some());
        assert!(ov.child_by_uuid("uuid-1").unwrap().is_online());
    }

    #[test]
    fn rehello_while_online_is_treated_as_crash_restart() {
        let mut ov = root_overlay(3);
        let req = ov_hello_request(1, "uuid-1");
        ov.handle_hello_request(&req, |_| None);
        assert!(ov.child_by_uuid("uuid-1").is_some());

        let req2 = ov_hello_request(1, "uuid-1-restarted");
        ov.handle_hello_request(&req2, |_| None);
        assert!(ov.child_by_uuid("uuid-1").is_none());
        assert!(ov.child_by_uuid("uuid-1-restarted").is_some());
    }

    #[test]
    fn goodbye_transitions_child_offline_and_purges_tracker() {
        let mut ov = root_overlay(3);
        let hello = ov_hello_request(1, "uuid-1");
        ov.handle_hello_request(&hello, |_| None);

        let tracked = Message::request("overlay.health", 5);
        ov.children
            .iter_mut()
            .find(|c| c.rank == 1)
            .unwrap()
            .tracker
            .track("uuid-1", tracked);

        let goodbye = Message::request("overlay.goodbye", 0);
        let (_resp, lost) = ov.handle_goodbye_request("uuid-1", &goodbye);
        assert_eq!(lost.len(), 1);
        assert!(!ov.child_by_uuid("uuid-1").unwrap_or(&Child::new(1)).is_online());
    }

    #[test]
    fn unknown_child_frame_yields_disconnect() {
        let mut ov = root_overlay(3);
        let decision = ov.route_from_child("ghost", Message::event("heartbeat.tick", 1));
        match decision {
            RouteDecision::ToChild { uuid, msg } => {
                assert_eq!(uuid, "ghost");
                assert_eq!(msg.control.unwrap().0, ControlKind::Disconnect);
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[test]
    fn sequence_gap_is_detected() {
        let mut ov = leaf_overlay();
        ov.check_event_sequence(Some(1));
        ov.check_event_sequence(Some(5));
        assert_eq!(ov.event_seq, 5);
    }

    #[test]
    fn parent_loss_purges_tracker_into_unreachable_responses() {
        let mut ov = leaf_overlay();
        ov.parent.as_mut().unwrap().uuid = "parent-uuid".to_string();
        let req = Message::request("overlay.health", 1);
        ov.parent
            .as_mut()
            .unwrap()
            .tracker
            .track("parent-uuid", req);

        let lost = ov.handle_parent_loss("test");
        assert_eq!(lost.len(), 1);
        assert!(ov.parent.as_ref().unwrap().offline);
    }

    #[test]
    fn disconnect_subtree_on_unknown_rank_errors() {
        let mut ov = root_overlay(3);
        assert!(ov.disconnect_subtree(42).is_err());
    }

    #[test]
    fn local_event_at_root_multicasts_to_online_children() {
        let mut ov = root_overlay(3);
        for rank in [1u32, 2u32] {
            let hello = ov_hello_request(rank, &format!("uuid-{rank}"));
            ov.handle_hello_request(&hello, |_| None);
        }
        let decision = ov.route_from_local(Message::event("heartbeat.tick", 1));
        match decision {
            RouteDecision::Multicast(sends) => assert_eq!(sends.len(), 2),
            other => panic!("expected multicast, got {other:?}"),
        }
    }

    fn ov_hello_request(rank: u32, uuid: &str) -> Message {
        let mut msg = Message::request("overlay.hello", 0)
            .with_payload(serde_json::json!({
                "rank": rank,
                "version": version_to_int24(VERSION),
                "uuid": uuid,
                "status": SubtreeStatus::Full.as_i64(),
                "hostname": "nodeX",
            }))
            .unwrap();
        msg.role.insert(Role::OWNER);
        msg
    }

    #[test]
    fn no_notifications_without_subscribers() {
        let mut ov = root_overlay(3);
        let hello = ov_hello_request(1, "uuid-1");
        ov.handle_hello_request(&hello, |_| None);
        assert!(ov.drain_notifications().is_empty());
    }

    #[test]
    fn monitor_subscriber_is_pushed_a_record_on_child_status_change() {
        let mut ov = root_overlay(3);
        ov.monitor_requests.push(Message::request("overlay.monitor", 1));

        let hello = ov_hello_request(1, "uuid-1");
        ov.handle_hello_request(&hello, |_| None);

        let pushed = ov.drain_notifications();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].topic, "overlay.monitor");
        let payload: serde_json::Value = pushed[0].payload_as().unwrap();
        assert_eq!(payload["rank"], 1);
        assert_eq!(payload["status"], SubtreeStatus::Full.as_str());

        // A second drain with no further state change yields nothing.
        assert!(ov.drain_notifications().is_empty());
    }

    #[test]
    fn health_subscriber_is_pushed_a_fresh_snapshot_on_child_status_change() {
        let mut ov = root_overlay(3);
        ov.health_requests.push(Message::request("overlay.health", 1));

        let hello = ov_hello_request(1, "uuid-1");
        ov.handle_hello_request(&hello, |_| None);

        let pushed = ov.drain_notifications();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].topic, "overlay.health");
        let payload: serde_json::Value = pushed[0].payload_as().unwrap();
        assert_eq!(payload["rank"], 0);
        assert!(payload["children"].as_array().unwrap().iter().any(|c| c["rank"] == 1));
    }

    #[test]
    fn health_snapshot_reports_duration_and_child_errors() {
        let mut ov = root_overlay(3);
        let idx = ov.child_index_by_rank(1).unwrap();
        ov.children[idx].last_error = Some("boom".to_string());
        let snapshot = ov.health_snapshot();
        assert!(snapshot["duration"].as_f64().unwrap() >= 0.0);
        let child = snapshot["children"].as_array().unwrap().iter().find(|c| c["rank"] == 1).unwrap();
        assert_eq!(child["error"], "boom");
    }

    #[test]
    fn torpid_max_zero_clears_existing_torpid_flag() {
        let mut ov = root_overlay(3);
        let hello = ov_hello_request(1, "uuid-1");
        ov.handle_hello_request(&hello, |_| None);

        let idx = ov.child_index_by_rank(1).unwrap();
        ov.children[idx].lastseen = Some(Instant::now() - Duration::from_secs(120));
        ov.update_torpid_children(Instant::now());
        assert!(ov.children[idx].torpid);

        ov.settings.torpid_max = Duration::ZERO;
        ov.update_torpid_children(Instant::now());
        assert!(!ov.children[idx].torpid);
    }
}
