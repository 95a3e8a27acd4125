//! nmx - device management over heterogeneous transports
//!
//! Upper-layer tooling issues management requests through a [`Session`]
//! without knowing whether they travel over a short-range wireless link or
//! the vendor discovery bus.
//!
//! # Architecture
//!
//! This library is organized as a workspace with multiple crates:
//!
//! - `nmx-core`: error taxonomy, NMP codec, protocol selector
//! - `nmx-transport`: discovery bus and link driver collaborators, simulated peers
//! - `nmx-session`: request correlation, sessions, bus and link transports
//!
//! # Usage
//!
//! ```no_run
//! use nmx::{config, BusTransport, NmpHeader, NmpMessage, NmpOp, Session, SessionConfig, SimBus, Transport, TxOptions};
//! use std::sync::Arc;
//!
//! # async fn run() -> nmx::NmxResult<()> {
//! let bus = Arc::new(SimBus::new());
//! let transport = BusTransport::new(config::parse_bus_conn_string("node-.*")?, bus)?;
//! transport.start().await?;
//!
//! let session = transport.build_session(SessionConfig::default())?;
//! session.open().await?;
//! let req = NmpMessage::new(NmpHeader::new(NmpOp::Read, 0, 0, 1), Vec::new());
//! let rsp = nmx::tx_request(session.as_ref(), &req, &TxOptions::default().with_tries(3)).await?;
//! println!("{:?}", rsp.hdr);
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;

// Re-export core types
pub use nmx_core::{
    MgmtProto, NmpHeader, NmpMessage, NmpOp, NmxError, NmxResult, SeqGenerator, NMP_HDR_SIZE,
    OMP_MSG_OVERHEAD,
};

// Re-export session API
pub use nmx_session::{
    tx_request, BusSession, BusTransport, BusTransportConfig, LinkSession, LinkState,
    LinkTransport, Session, SessionConfig, SessionConfigBuilder, Transport, TxOptions,
};

// Re-export transport collaborators
pub use nmx_transport::{
    AddrType, DiscoveryBus, LinkDriver, LinkEvent, PeerAddr, PeerSpec, SimBus, SimLink,
};

pub mod transport {
    pub use nmx_transport::*;
}

pub mod session {
    pub use nmx_session::*;
}
