//! Session layer for the nmx device management stack
//!
//! Correlates requests with responses and hides the transport behind a
//! uniform [`Session`] interface.
//!
//! # Layers
//! - [`listener`] / [`dispatcher`]: one-shot waits keyed by sequence number,
//!   response reassembly and statistics
//! - [`transceiver`]: encode, register, transmit, wait
//! - [`session`] / [`transport`]: the traits upper layers program against
//! - [`bus`]: discovery bus transport with a single shared responder slot
//! - [`link`]: connection state machine and per-link sessions
//!
//! A request always registers its listener before the first byte is
//! transmitted, and every wait is bounded by a timeout.

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod link;
pub mod listener;
pub mod session;
pub mod transceiver;
pub mod transport;

pub use nmx_core::{NmxError, NmxResult};
pub use bus::{BusSession, BusTransport, BusTransportConfig, ResponderGuard};
pub use config::{
    MsgFilter, SessionConfig, SessionConfigBuilder, TxOptions, DEFAULT_CLOSE_TIMEOUT,
    DEFAULT_TX_TIMEOUT,
};
pub use dispatcher::{DispatchStatistics, Dispatcher};
pub use link::{LinkFsm, LinkHandler, LinkSession, LinkState, LinkTransport};
pub use listener::{Listener, ListenerWait};
pub use session::{tx_request, Session};
pub use transceiver::Transceiver;
pub use transport::Transport;
