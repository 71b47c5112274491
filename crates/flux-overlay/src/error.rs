//! Overlay error taxonomy (§7): protocol, authorization, transport,
//! version-mismatch, RPC-in-flight, sequence-gap, and cert-load failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("certificate error: {0}")]
    Cert(#[from] flux_cert::CertError),

    #[error("topology error: {0}")]
    Topology(#[from] flux_topology::TopologyError),

    #[error("frame error: {0}")]
    Frame(#[from] flux_proto::FrameError),

    #[error("config error: {0}")]
    Config(#[from] flux_config::ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] tmq::TmqError),

    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),

    #[error("protocol violation from rank {rank}: {reason}")]
    Protocol { rank: u32, reason: String },

    #[error("authorization denied for key {0}")]
    Unauthorized(String),

    #[error("hello version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: String, remote: String },

    #[error("hello rejected: {0}")]
    HelloRejected(String),

    #[error("rank {0} is not a direct child of this broker")]
    NotAChild(u32),

    #[error("hostname mismatch for rank {rank}: claimed {claimed}, expected {expected}")]
    HostnameMismatch {
        rank: u32,
        claimed: String,
        expected: String,
    },

    #[error("parent is unreachable: {0}")]
    ParentUnreachable(String),

    #[error("late join not supported by this topology")]
    LateJoinUnsupported,

    #[error("rank {0} is neither this broker nor a direct child")]
    NotSelfOrChild(u32),

    #[error("no parent configured for rank 0")]
    NoParent,

    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
}
