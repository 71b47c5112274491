//! flux-overlay - the tree-based overlay network (TBON) core.
//!
//! This crate owns the overlay's routing and handshake state machine
//! ([`overlay`]), its peer bookkeeping ([`peer`]), subtree status
//! aggregation ([`subtree`]), CURVE/ZAP socket wiring ([`socket_config`],
//! [`zap`]), admin RPC dispatch ([`dispatch`]), trace support ([`trace`]),
//! and the async reactor loop that ties real sockets to all of the above
//! ([`run`]). Bootstrap ([`bootstrap`]) derives the initial [`overlay::Overlay`]
//! from a topology plus either a config file or a PMI key-value exchange.

pub mod bootstrap;
pub mod dispatch;
pub mod error;
pub mod overlay;
pub mod peer;
pub mod run;
pub mod socket_config;
pub mod subtree;
pub mod trace;
pub mod zap;

pub use bootstrap::{
    BootstrapProvider, Bootstrapped, ConfigFileBootstrap, HostEntry, PmiBootstrap, PmiKvs,
};
pub use error::OverlayError;
pub use overlay::{Overlay, OverlayStats, RouteDecision, VERSION};
pub use peer::{Child, Parent};
pub use run::{run, LocalChannel};
pub use subtree::SubtreeStatus;
