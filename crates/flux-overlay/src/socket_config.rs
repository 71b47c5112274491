//! Socket construction: CURVE-secured ROUTER (children) and DEALER
//! (parent) sockets over `tmq`, configured per §4.4.1.
//!
//! Linger is fixed low so shutdown never hangs on an unsent frame; send
//! and receive HWMs are unbounded except the child-inbound HWM, which is
//! the one knob an operator gets (`tbon.child_rcvhwm`).

pub use tmq::Context as ZmqContext;
pub use tmq::Multipart;

use flux_cert::Cert;
use futures::{Sink, Stream};
use tmq::TmqError;

use crate::error::OverlayError;

/// Fixed low linger so a shutting-down broker never blocks on outbound
/// frames the peer will never read.
pub const LINGER_MS: i32 = 5;

pub trait RouterSocket:
    Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}
impl<T> RouterSocket for T where
    T: Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}

pub trait DealerSocket:
    Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}
impl<T> DealerSocket for T where
    T: Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}

/// Options shared by both socket directions, resolved from `tbon.*`
/// attributes before either socket is built.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub enable_ipv6: bool,
    pub child_rcvhwm: i32,
    pub tcp_user_timeout_ms: Option<i32>,
    pub connect_timeout_ms: Option<i32>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            enable_ipv6: false,
            child_rcvhwm: 0,
            tcp_user_timeout_ms: None,
            connect_timeout_ms: None,
        }
    }
}

/// Bind a ROUTER socket for this broker's children: CURVE server mode
/// keyed to `cert`, ZAP domain applied by the caller via `zmq::Context`
/// (the ZAP handler itself lives in [`crate::zap`]).
pub fn create_router_and_bind(
    ctx: &ZmqContext,
    endpoint: &str,
    cert: &Cert,
    opts: &SocketOptions,
) -> Result<impl RouterSocket, OverlayError> {
    let mut builder = tmq::router(ctx)
        .set_linger(LINGER_MS)
        .set_ipv6(opts.enable_ipv6 as i32);

    if opts.child_rcvhwm > 0 {
        builder = builder.set_rcvhwm(opts.child_rcvhwm);
    }

    let secret = cert.secret_key().ok_or(flux_cert::CertError::PublicOnly)?;
    let public = cert.public_key().ok_or(flux_cert::CertError::PublicOnly)?;
    builder = builder
        .set_curve_server(true)
        .set_curve_secretkey(secret)
        .set_curve_publickey(public);

    Ok(builder.bind(endpoint)?)
}

/// Connect a DEALER socket to this broker's parent: CURVE client mode
/// keyed to the parent's public key.
///
/// `own_uuid` is set as the socket's ZMQ identity, so the parent's ROUTER
/// socket sees this broker's logical uuid directly as the sender identity
/// on every frame rather than a libzmq-assigned one. This is what lets
/// [`crate::run`] use a single uuid-keyed map for both routing decisions
/// and ZMQ identities.
pub fn create_dealer_and_connect(
    ctx: &ZmqContext,
    endpoint: &str,
    cert: &Cert,
    parent_public_key: &str,
    own_uuid: &str,
    opts: &SocketOptions,
) -> Result<impl DealerSocket, OverlayError> {
    let mut builder = tmq::dealer(ctx)
        .set_linger(LINGER_MS)
        .set_ipv6(opts.enable_ipv6 as i32)
        .set_identity(own_uuid.as_bytes());

    if let Some(ms) = opts.tcp_user_timeout_ms {
        builder = builder.set_tcp_maxrt(ms);
    }
    if let Some(ms) = opts.connect_timeout_ms {
        builder = builder.set_connect_timeout(ms);
    }

    let secret = cert.secret_key().ok_or(flux_cert::CertError::PublicOnly)?;
    let public = cert.public_key().ok_or(flux_cert::CertError::PublicOnly)?;
    builder = builder
        .set_curve_serverkey(parent_public_key)
        .set_curve_secretkey(secret)
        .set_curve_publickey(public);

    Ok(builder.connect(endpoint)?)
}
