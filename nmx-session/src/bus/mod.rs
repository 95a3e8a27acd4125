//! Discovery bus transport and session
//!
//! The bus has no per-message addressing below the command/response layer,
//! so the transport lets exactly one session at a time register as the
//! responder that receives raw responses.

pub mod session;
pub mod transport;

pub use session::BusSession;
pub use transport::{BusTransport, BusTransportConfig, ResponderGuard};
