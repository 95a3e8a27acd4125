//! Transport collaborators for the nmx device management stack
//!
//! This crate describes the external collaborators the session layer talks
//! to: the vendor discovery bus (ping/pong discovery plus command/response
//! exchange) and the short-range wireless link driver. Both are consumed as
//! opaque, deadline-bounded primitives. In-memory simulations of both live in
//! [`sim`].

pub mod bus;
pub mod link;
pub mod rendezvous;
pub mod sim;

pub use nmx_core::{NmxError, NmxResult};
pub use bus::{Command, DiscoveryBus, Ping, Pong, Response, DEVICE_NAME_CAPACITY, MAX_RESPONSE_SIZE};
pub use link::{AddrType, AttrHandle, ConnHandle, LinkConnection, LinkDriver, LinkEvent, PeerAddr, PeerSpec};
pub use rendezvous::Rendezvous;
pub use sim::{nmp_echo_handler, CommandHandler, SimBus, SimLink, TeardownMode};
