//! Link-oriented transport and session
//!
//! Every link session owns one connection to one peripheral. The
//! [`LinkFsm`] drives the connection lifecycle and pumps link events back
//! into the session through the [`LinkHandler`] interface.

pub mod close;
pub mod fsm;
pub mod session;
pub mod state;
pub mod transport;

pub use close::CloseState;
pub use fsm::{LinkFsm, LinkHandler, NMP_CHR_UUID, NMP_SVC_UUID};
pub use session::LinkSession;
pub use state::LinkState;
pub use transport::LinkTransport;
