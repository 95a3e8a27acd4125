//! Session over a dedicated link

use super::close::CloseState;
use super::fsm::{LinkFsm, LinkHandler};
use super::state::LinkState;
use crate::config::{SessionConfig, TxOptions};
use crate::session::Session;
use crate::transceiver::Transceiver;
use async_trait::async_trait;
use nmx_core::{MgmtProto, NmpMessage, NmxError, NmxResult, NMP_HDR_SIZE};
use nmx_transport::{LinkDriver, PeerSpec};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

/// ATT notify / write-command opcode plus attribute handle
const ATT_BASE_SZ: usize = 3;

struct LinkSessionInner<D: LinkDriver> {
    cfg: SessionConfig,
    fsm: LinkFsm<D>,
    txvr: Mutex<Option<Arc<Transceiver>>>,
    close: Mutex<CloseState>,
    open_lock: tokio::sync::Mutex<()>,
}

impl<D: LinkDriver> LinkSessionInner<D> {
    fn txvr(&self) -> Option<Arc<Transceiver>> {
        self.txvr.lock().clone()
    }
}

impl<D: LinkDriver> LinkHandler for LinkSessionInner<D> {
    fn on_connect(&self) {
        log::debug!("Link session connected");
    }

    fn on_rx(&self, data: &[u8]) {
        match self.txvr() {
            Some(txvr) => txvr.on_rx(data),
            None => log::debug!("Dropping {} bytes received without a transceiver", data.len()),
        }
    }

    fn on_disconnect(&self, reason: NmxError) {
        let reason = match reason {
            NmxError::Disconnected(_) => reason,
            other => NmxError::Disconnected(other.to_string()),
        };
        if let Some(txvr) = self.txvr() {
            let failed = txvr.error_all(reason.clone());
            if failed > 0 {
                log::warn!("Link dropped with {} request(s) outstanding: {}", failed, reason);
            }
            txvr.dispatcher().reset_reassembly();
        }
        self.close.lock().signal(reason);
    }
}

/// Session owning one link to one peer
///
/// Requests are fragmented into link-sized writes and responses are
/// reassembled from notifications.
pub struct LinkSession<D: LinkDriver> {
    inner: Arc<LinkSessionInner<D>>,
}

impl<D: LinkDriver> fmt::Debug for LinkSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkSession")
            .field("cfg", &self.inner.cfg)
            .field("fsm", &self.inner.fsm)
            .finish()
    }
}

impl<D: LinkDriver + 'static> LinkSession<D> {
    /// # Errors
    /// `NmxError::InvalidConfig` if `cfg` selects a protocol other than NMP
    pub fn new(driver: Arc<D>, peer: PeerSpec, cfg: SessionConfig) -> NmxResult<Self> {
        if cfg.mgmt_proto != MgmtProto::Nmp {
            return Err(NmxError::InvalidConfig(format!(
                "Invalid operation for {}",
                cfg.mgmt_proto
            )));
        }

        Ok(Self {
            inner: Arc::new(LinkSessionInner {
                cfg,
                fsm: LinkFsm::new(driver, peer),
                txvr: Mutex::new(None),
                close: Mutex::new(CloseState::default()),
                open_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.fsm.state()
    }

    fn link_mtu(&self) -> usize {
        self.inner
            .cfg
            .cap_mtu(self.inner.fsm.att_mtu() as usize)
            .saturating_sub(ATT_BASE_SZ + NMP_HDR_SIZE)
    }

    fn handler(&self) -> Weak<dyn LinkHandler> {
        let weak: Weak<LinkSessionInner<D>> = Arc::downgrade(&self.inner);
        weak
    }

    fn release_txvr(&self, err: NmxError) {
        if let Some(txvr) = self.inner.txvr.lock().take() {
            txvr.error_all(err);
        }
    }

    fn open_txvr(&self, action: &str) -> NmxResult<Arc<Transceiver>> {
        if !self.inner.fsm.state().is_ready() {
            return Err(NmxError::Closed(format!(
                "Attempt to {} over closed link session",
                action
            )));
        }
        self.inner.txvr().ok_or_else(|| {
            NmxError::Closed(format!("Attempt to {} over closed link session", action))
        })
    }

    async fn shutdown(&self, closed: tokio::sync::oneshot::Receiver<NmxError>) -> NmxResult<()> {
        if self.inner.fsm.stop().await? {
            self.release_txvr(NmxError::Closed("link session closed".to_string()));
            return Err(NmxError::Closed(
                "Attempt to close an unopened link session".to_string(),
            ));
        }

        let timeout = self.inner.cfg.close_timeout;
        match tokio::time::timeout(timeout, closed).await {
            Ok(Ok(reason)) => log::debug!("Link session closed: {}", reason),
            Ok(Err(_)) => log::debug!("Link session close signal dropped"),
            Err(_) => {
                log::warn!(
                    "Link to {} not torn down within {:?}; closing anyway",
                    self.inner.fsm.peer(),
                    timeout
                );
                self.inner.fsm.abandon();
            }
        }

        self.release_txvr(NmxError::Closed("link session closed".to_string()));
        Ok(())
    }
}

#[async_trait]
impl<D: LinkDriver + 'static> Session for LinkSession<D> {
    async fn open(&self) -> NmxResult<()> {
        let _guard = self.inner.open_lock.lock().await;
        if self.inner.close.lock().is_waiting() {
            return Err(NmxError::AlreadyClosing);
        }
        if self.inner.fsm.state() != LinkState::Idle {
            return Err(NmxError::AlreadyOpen(
                "Attempt to open an already-open link session".to_string(),
            ));
        }

        let txvr = Arc::new(Transceiver::new(&self.inner.cfg, true)?);
        *self.inner.txvr.lock() = Some(txvr);
        self.inner.close.lock().reset();

        if let Err(e) = self.inner.fsm.start(self.handler()).await {
            *self.inner.txvr.lock() = None;
            return Err(e);
        }
        Ok(())
    }

    async fn close(&self) -> NmxResult<()> {
        let closed = self.inner.close.lock().begin()?;
        let result = self.shutdown(closed).await;
        self.inner.close.lock().finish();
        result
    }

    fn is_open(&self) -> bool {
        self.inner.fsm.state().is_ready()
    }

    fn mtu_in(&self) -> usize {
        self.link_mtu()
    }

    fn mtu_out(&self) -> usize {
        self.link_mtu()
    }

    fn mgmt_proto(&self) -> MgmtProto {
        self.inner.cfg.mgmt_proto
    }

    async fn tx_request_once(&self, msg: &NmpMessage, opts: &TxOptions) -> NmxResult<NmpMessage> {
        let txvr = self.open_txvr("transmit")?;
        let fsm = &self.inner.fsm;
        txvr.tx_request(move |data| fsm.write(data), msg, self.mtu_out(), opts.timeout)
            .await
    }

    fn abort_rx(&self, seq: u8) -> NmxResult<()> {
        match self.inner.txvr() {
            Some(txvr) => txvr.abort_rx(seq),
            None => Err(NmxError::Closed(
                "Attempt to abort over closed link session".to_string(),
            )),
        }
    }
}
