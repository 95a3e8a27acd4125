//! Transport abstraction
//!
//! A transport is the shared resource behind one connection type. It owns
//! discovery and connection setup, moves raw bytes, and builds the sessions
//! that talk through it.

use crate::config::SessionConfig;
use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use nmx_core::NmxResult;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Bring the transport up (discovery, controller sync, ...)
    async fn start(&self) -> NmxResult<()>;

    /// Mark the transport closing; later work is rejected
    async fn stop(&self) -> NmxResult<()>;

    /// Build a session that talks through this transport
    fn build_session(&self, cfg: SessionConfig) -> NmxResult<Box<dyn Session>>;

    /// Transmit raw bytes
    async fn tx(&self, data: Bytes) -> NmxResult<()>;
}
