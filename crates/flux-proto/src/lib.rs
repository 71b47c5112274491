//! flux-proto - wire message types for the Flux overlay network
//!
//! This crate defines the request/response/event/control message model that
//! crosses the tree-based overlay network (TBON), the FLUX01 multipart wire
//! encoding for it, and the pending-RPC tracker used to synthesize
//! `EHOSTUNREACH` responses when a peer disappears mid-request. It owns no
//! sockets and runs no event loop; that lives in `flux-overlay`.

pub mod errno;
pub mod frame;
pub mod message;
pub mod tracker;

pub use frame::{decode, encode, FrameError, PROTOCOL_VERSION};
pub use message::{ControlKind, Flags, Kind, Message, Role, RouteStack};
pub use tracker::{Pending, Tracker};
