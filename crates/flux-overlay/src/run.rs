//! The overlay run loop (§4.4.1, §4.4.2): wires real `tmq` ROUTER/DEALER
//! sockets and a heartbeat/torpid timer to the transport-free [`Overlay`]
//! core, and drains the local channel the binary crate hands in.
//!
//! Shaped after the select-loop `hooteproto`'s peer code uses to poll a
//! socket stream alongside a keepalive ticker, extended here to also own
//! the local-channel side: this broker has no separate module-dispatch
//! process to hand traffic to, so the run loop is both transport and the
//! one local "subscriber" admin RPCs answer into.
//!
//! A child's ZMQ identity on the bind (ROUTER) socket is its own uuid:
//! [`crate::socket_config::create_dealer_and_connect`] sets that uuid as
//! the connecting DEALER's identity, so no separate uuid-to-identity table
//! is needed here.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use flux_proto::{frame, Kind, Message};
use futures::{SinkExt, StreamExt};
use tmq::Multipart;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::dispatch::{self, DispatchEffect};
use crate::error::OverlayError;
use crate::overlay::{Overlay, RouteDecision};
use crate::socket_config::{DealerSocket, RouterSocket};
use crate::trace::{TraceEvent, TraceSubscribers};

/// The binary crate's side of the local channel: traffic the overlay
/// should route out arrives on `inbound`; responses, events, and admin
/// RPC replies the overlay produces go out on `outbound`.
pub struct LocalChannel {
    pub inbound: mpsc::Receiver<Message>,
    pub outbound: mpsc::Sender<Message>,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn multipart_to_bytes(parts: Multipart) -> Vec<Bytes> {
    parts.into_iter().map(|m| Bytes::from(m.to_vec())).collect()
}

fn message_to_multipart(identity: Option<&[u8]>, msg: &Message) -> Multipart {
    let mut frames: Vec<Vec<u8>> = Vec::new();
    if let Some(id) = identity {
        frames.push(id.to_vec());
    }
    frames.extend(frame::encode(msg).into_iter().map(|b| b.to_vec()));
    frames.into()
}

/// Run the reactor until `shutdown` fires.
pub async fn run<R, D>(
    mut overlay: Overlay,
    mut router: R,
    mut dealer: Option<D>,
    mut local: LocalChannel,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), OverlayError>
where
    R: RouterSocket,
    D: DealerSocket,
{
    let mut trace = TraceSubscribers::new();

    if let Some(dealer) = dealer.as_mut() {
        let hello = overlay.build_hello_request();
        dealer
            .send(message_to_multipart(None, &hello))
            .await
            .map_err(OverlayError::from)?;
    }

    let heartbeat_period = overlay.settings.torpid_min.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(heartbeat_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                if let Some(dealer) = dealer.as_mut() {
                    if let Some(goodbye) = overlay.build_goodbye_request() {
                        let _ = dealer.send(message_to_multipart(None, &goodbye)).await;
                    }
                }
                return Ok(());
            }

            _ = ticker.tick() => {
                if let Some(heartbeat) = overlay.tick() {
                    if let Some(dealer) = dealer.as_mut() {
                        if dealer.send(message_to_multipart(None, &heartbeat)).await.is_err() {
                            let lost = overlay.handle_parent_loss("heartbeat send failed");
                            deliver_local(&mut local, lost).await;
                        }
                    }
                }
                deliver_local(&mut local, overlay.drain_notifications()).await;
            }

            frame = router.next() => {
                match frame {
                    Some(Ok(parts)) => {
                        if let Err(e) = handle_router_frame(&mut overlay, &mut trace, &mut router, &mut dealer, &mut local, parts).await {
                            warn!(error = %e, "failed handling child frame");
                        }
                        deliver_local(&mut local, overlay.drain_notifications()).await;
                    }
                    Some(Err(e)) => warn!(error = %e, "router recv error"),
                    None => {}
                }
            }

            frame = recv_dealer(&mut dealer) => {
                if let Some(result) = frame {
                    match result {
                        Ok(parts) => {
                            if let Err(e) = handle_dealer_frame(&mut overlay, &mut trace, &mut router, &mut dealer, &mut local, parts).await {
                                warn!(error = %e, "failed handling parent frame");
                            }
                            deliver_local(&mut local, overlay.drain_notifications()).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "dealer recv error");
                            let lost = overlay.handle_parent_loss("dealer stream error");
                            deliver_local(&mut local, lost).await;
                        }
                    }
                }
            }

            Some(msg) = local.inbound.recv() => {
                if let Err(e) = handle_local_message(&mut overlay, &mut trace, &mut router, &mut dealer, &mut local, msg).await {
                    warn!(error = %e, "failed handling local message");
                }
                deliver_local(&mut local, overlay.drain_notifications()).await;
            }
        }
    }
}

async fn recv_dealer<D: DealerSocket>(
    dealer: &mut Option<D>,
) -> Option<Result<Multipart, tmq::TmqError>> {
    match dealer.as_mut() {
        Some(d) => d.next().await,
        None => std::future::pending().await,
    }
}

async fn handle_router_frame<R, D>(
    overlay: &mut Overlay,
    trace: &mut TraceSubscribers,
    router: &mut R,
    dealer: &mut Option<D>,
    local: &mut LocalChannel,
    parts: Multipart,
) -> Result<(), OverlayError>
where
    R: RouterSocket,
    D: DealerSocket,
{
    let raw = multipart_to_bytes(parts);
    let (prefix, body) = frame::split_identity_prefix(&raw);
    let Some(identity) = prefix.first() else {
        return Ok(());
    };
    let identity = identity.to_vec();
    let from_uuid = String::from_utf8_lossy(&identity).to_string();

    let msg = frame::decode(body)?;

    if !trace.is_empty() {
        emit_trace(trace, local, &msg, overlay.rank, "rx").await;
    }

    if msg.kind == Kind::Request && msg.topic == "overlay.hello" {
        let response = overlay.handle_hello_request(&msg, |_rank| None);
        let _ = router.send(message_to_multipart(Some(&identity), &response)).await;
        return Ok(());
    }

    if msg.kind == Kind::Request && msg.topic == "overlay.goodbye" {
        let (response, lost) = overlay.handle_goodbye_request(&from_uuid, &msg);
        let _ = router.send(message_to_multipart(Some(&identity), &response)).await;
        deliver_local(local, lost).await;
        return Ok(());
    }

    if msg.kind == Kind::Request {
        if let Some((response, effect)) = dispatch::dispatch(overlay, trace, &msg) {
            let _ = router.send(message_to_multipart(Some(&identity), &response)).await;
            apply_effect(local, effect).await;
            return Ok(());
        }
    }

    let decision = overlay.route_from_child(&from_uuid, msg);
    apply_decision(overlay, router, dealer, local, decision).await
}

async fn handle_dealer_frame<R, D>(
    overlay: &mut Overlay,
    trace: &mut TraceSubscribers,
    router: &mut R,
    dealer: &mut Option<D>,
    local: &mut LocalChannel,
    parts: Multipart,
) -> Result<(), OverlayError>
where
    R: RouterSocket,
    D: DealerSocket,
{
    let raw = multipart_to_bytes(parts);
    let msg = frame::decode(&raw)?;

    if msg.kind == Kind::Response && msg.topic == "overlay.hello" {
        overlay.apply_hello_response(&msg)?;
        return Ok(());
    }

    if !trace.is_empty() {
        emit_trace(trace, local, &msg, overlay.rank, "rx").await;
    }

    let decision = overlay.route_from_parent(msg);
    apply_decision(overlay, router, dealer, local, decision).await
}

async fn handle_local_message<R, D>(
    overlay: &mut Overlay,
    trace: &mut TraceSubscribers,
    router: &mut R,
    dealer: &mut Option<D>,
    local: &mut LocalChannel,
    msg: Message,
) -> Result<(), OverlayError>
where
    R: RouterSocket,
    D: DealerSocket,
{
    if !trace.is_empty() {
        emit_trace(trace, local, &msg, overlay.rank, "tx").await;
    }

    if msg.kind == Kind::Request {
        if let Some((response, effect)) = dispatch::dispatch(overlay, trace, &msg) {
            let _ = local.outbound.send(response).await;
            apply_effect(local, effect).await;
            return Ok(());
        }
    }

    let decision = overlay.route_from_local(msg);
    apply_decision(overlay, router, dealer, local, decision).await
}

/// Send the sockets/local-channel traffic a routing decision produced. A
/// transport `EHOSTUNREACH` on a routed or multicast send to a child is
/// not fatal to the loop: it is the connection-loss signal §4.4.7/§4.4.10
/// describe, so it drives the same child-loss transition
/// [`Overlay::handle_child_unreachable`] and its synthesized
/// `EHOSTUNREACH` responses are delivered to the local channel.
async fn apply_decision<R, D>(
    overlay: &mut Overlay,
    router: &mut R,
    dealer: &mut Option<D>,
    local: &mut LocalChannel,
    decision: RouteDecision,
) -> Result<(), OverlayError>
where
    R: RouterSocket,
    D: DealerSocket,
{
    match decision {
        RouteDecision::ToParent(msg) => {
            if let Some(dealer) = dealer.as_mut() {
                dealer
                    .send(message_to_multipart(None, &msg))
                    .await
                    .map_err(OverlayError::from)?;
            }
        }
        RouteDecision::ToChild { uuid, msg } => {
            if router
                .send(message_to_multipart(Some(uuid.as_bytes()), &msg))
                .await
                .is_err()
            {
                let lost = overlay.handle_child_unreachable(&uuid);
                deliver_local(local, lost).await;
            }
        }
        RouteDecision::Multicast(sends) => {
            for (uuid, msg) in sends {
                if uuid.is_empty() {
                    let _ = local.outbound.send(msg).await;
                } else if router.send(message_to_multipart(Some(uuid.as_bytes()), &msg)).await.is_err() {
                    let lost = overlay.handle_child_unreachable(&uuid);
                    deliver_local(local, lost).await;
                }
            }
        }
        RouteDecision::ToLocal(msg) => {
            let _ = local.outbound.send(msg).await;
        }
        RouteDecision::Drop => {}
    }
    Ok(())
}

async fn deliver_local(local: &mut LocalChannel, msgs: Vec<Message>) {
    for msg in msgs {
        let _ = local.outbound.send(msg).await;
    }
}

async fn apply_effect(local: &mut LocalChannel, effect: DispatchEffect) {
    if let DispatchEffect::Deliver(msgs) = effect {
        deliver_local(local, msgs).await;
    }
}

/// Trace subscribers all share this broker's single local channel, so a
/// matched event is forwarded once rather than per-subscriber.
async fn emit_trace(trace: &TraceSubscribers, local: &mut LocalChannel, msg: &Message, rank: u32, prefix: &'static str) {
    let event = if msg.kind == Kind::Control {
        let Some((kind, value)) = msg.control else { return };
        TraceEvent::for_control(prefix, rank, kind, value, now_secs())
    } else {
        TraceEvent::for_message(prefix, rank, msg, now_secs())
    };
    if trace.matching(&event).is_empty() {
        return;
    }
    if let Ok(frame) = Message::event("overlay.trace", 0).with_payload(&event) {
        let _ = local.outbound.send(frame).await;
    }
}
