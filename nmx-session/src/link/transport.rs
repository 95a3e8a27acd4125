//! Link-oriented transport

use super::session::LinkSession;
use crate::config::SessionConfig;
use crate::session::Session;
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use nmx_core::{NmxError, NmxResult};
use nmx_transport::LinkDriver;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Builds link sessions on top of one radio driver
///
/// Each session owns its own link, so the transport has no shared byte
/// channel of its own.
pub struct LinkTransport<D: LinkDriver> {
    driver: Arc<D>,
    closing: AtomicBool,
}

impl<D: LinkDriver> fmt::Debug for LinkTransport<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkTransport")
            .field("closing", &self.closing.load(Ordering::SeqCst))
            .finish()
    }
}

impl<D: LinkDriver + 'static> LinkTransport<D> {
    pub fn new(driver: Arc<D>) -> Self {
        Self {
            driver,
            closing: AtomicBool::new(false),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }
}

#[async_trait]
impl<D: LinkDriver + 'static> Transport for LinkTransport<D> {
    async fn start(&self) -> NmxResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(NmxError::Closed("link transport stopped".to_string()));
        }
        Ok(())
    }

    async fn stop(&self) -> NmxResult<()> {
        self.closing.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// # Errors
    /// - `NmxError::Closed` if the transport is stopped
    /// - `NmxError::InvalidConfig` if `cfg` names no peer or selects OMP
    fn build_session(&self, cfg: SessionConfig) -> NmxResult<Box<dyn Session>> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(NmxError::Closed("link transport stopped".to_string()));
        }
        let peer = cfg.peer.clone().ok_or_else(|| {
            NmxError::InvalidConfig("link session requires a peer".to_string())
        })?;
        Ok(Box::new(LinkSession::new(self.driver.clone(), peer, cfg)?))
    }

    async fn tx(&self, _data: Bytes) -> NmxResult<()> {
        Err(NmxError::Unsupported(
            "link transport transmits through its sessions only".to_string(),
        ))
    }
}
