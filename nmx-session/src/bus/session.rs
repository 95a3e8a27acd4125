//! Session over the discovery bus
//!
//! Bus sessions own no link of their own: opening only installs a fresh
//! transceiver, and each request borrows the transport's responder slot for
//! its duration.

use super::transport::BusTransport;
use crate::config::{SessionConfig, TxOptions};
use crate::session::Session;
use crate::transceiver::Transceiver;
use crate::transport::Transport;
use async_trait::async_trait;
use nmx_core::{MgmtProto, NmpMessage, NmxError, NmxResult, OMP_MSG_OVERHEAD};
use nmx_transport::{DiscoveryBus, MAX_RESPONSE_SIZE};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

struct BusSessionState {
    open: bool,
    txvr: Arc<Transceiver>,
}

pub struct BusSession<B: DiscoveryBus> {
    cfg: SessionConfig,
    transport: BusTransport<B>,
    state: Mutex<BusSessionState>,
}

impl<B: DiscoveryBus> fmt::Debug for BusSession<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusSession")
            .field("cfg", &self.cfg)
            .field("open", &self.state.lock().open)
            .finish()
    }
}

impl<B: DiscoveryBus + 'static> BusSession<B> {
    /// # Errors
    /// `NmxError::InvalidConfig` if `cfg` selects a protocol other than NMP
    pub fn new(transport: BusTransport<B>, cfg: SessionConfig) -> NmxResult<Self> {
        let txvr = Arc::new(Transceiver::new(&cfg, false)?);
        Ok(Self {
            cfg,
            transport,
            state: Mutex::new(BusSessionState { open: false, txvr }),
        })
    }

    pub fn transport(&self) -> &BusTransport<B> {
        &self.transport
    }

    fn open_txvr(&self, action: &str) -> NmxResult<Arc<Transceiver>> {
        let state = self.state.lock();
        if !state.open {
            return Err(NmxError::Closed(format!(
                "Attempt to {} over closed bus session",
                action
            )));
        }
        Ok(state.txvr.clone())
    }
}

#[async_trait]
impl<B: DiscoveryBus + 'static> Session for BusSession<B> {
    async fn open(&self) -> NmxResult<()> {
        let mut state = self.state.lock();
        if state.open {
            return Err(NmxError::AlreadyOpen(
                "Attempt to open an already-open bus session".to_string(),
            ));
        }
        state.txvr = Arc::new(Transceiver::new(&self.cfg, false)?);
        state.open = true;
        Ok(())
    }

    async fn close(&self) -> NmxResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(NmxError::Closed(
                "Attempt to close an unopened bus session".to_string(),
            ));
        }
        let failed = state
            .txvr
            .error_all(NmxError::Closed("bus session closed".to_string()));
        if failed > 0 {
            log::debug!("Closing bus session failed {} pending request(s)", failed);
        }
        state.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn mtu_in(&self) -> usize {
        self.cfg
            .cap_mtu(MAX_RESPONSE_SIZE)
            .saturating_sub(OMP_MSG_OVERHEAD)
    }

    /// Commands are carried with a 3:4 expansion, so only three quarters of
    /// the raw bus MTU is usable
    fn mtu_out(&self) -> usize {
        (self.cfg.cap_mtu(self.transport.config().mtu) * 3 / 4).saturating_sub(OMP_MSG_OVERHEAD)
    }

    fn mgmt_proto(&self) -> MgmtProto {
        self.cfg.mgmt_proto
    }

    async fn tx_request_once(&self, msg: &NmpMessage, opts: &TxOptions) -> NmxResult<NmpMessage> {
        let txvr = self.open_txvr("transmit")?;
        let _responder = self.transport.reserve_responder(txvr.clone())?;

        let transport = &self.transport;
        txvr.tx_request(move |data| transport.tx(data), msg, self.mtu_out(), opts.timeout)
            .await
    }

    fn abort_rx(&self, seq: u8) -> NmxResult<()> {
        self.open_txvr("abort")?.abort_rx(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusTransportConfig;
    use bytes::Bytes;
    use nmx_core::{NmpHeader, NmpOp};
    use nmx_transport::{nmp_echo_handler, SimBus};
    use std::time::Duration;

    async fn started(bus: SimBus, target: &str, comm_timeout: Duration) -> BusTransport<SimBus> {
        let cfg = BusTransportConfig {
            comm_timeout,
            ..BusTransportConfig::new(target)
        };
        let transport = BusTransport::new(cfg, Arc::new(bus)).unwrap();
        transport.start().await.unwrap();
        transport
    }

    async fn echo_transport() -> BusTransport<SimBus> {
        let bus = SimBus::new();
        bus.add_device("node-A", nmp_echo_handler());
        started(bus, "node-A", Duration::from_millis(500)).await
    }

    fn request(seq: u8, body: &[u8]) -> NmpMessage {
        NmpMessage::new(NmpHeader::new(NmpOp::Read, 1, 0, seq), body.to_vec())
    }

    fn opts() -> TxOptions {
        TxOptions::new(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_open_close_reopen() {
        let session = BusSession::new(echo_transport().await, SessionConfig::default()).unwrap();

        session.open().await.unwrap();
        let rsp = session.tx_request_once(&request(1, b"hi"), &opts()).await.unwrap();
        assert_eq!(rsp.hdr.op, NmpOp::ReadRsp);
        assert_eq!(&rsp.body[..], b"hi");

        session.close().await.unwrap();
        assert!(!session.is_open());
        assert!(matches!(
            session.tx_request_once(&request(2, b""), &opts()).await,
            Err(NmxError::Closed(_))
        ));

        session.open().await.unwrap();
        assert!(session.tx_request_once(&request(3, b""), &opts()).await.is_ok());
        assert!(!session.transport().has_responder());
    }

    #[tokio::test]
    async fn test_open_and_close_twice() {
        let session = BusSession::new(echo_transport().await, SessionConfig::default()).unwrap();

        assert!(matches!(session.close().await, Err(NmxError::Closed(_))));
        session.open().await.unwrap();
        assert!(matches!(session.open().await, Err(NmxError::AlreadyOpen(_))));
        session.close().await.unwrap();
        assert!(matches!(session.close().await, Err(NmxError::Closed(_))));
    }

    #[tokio::test]
    async fn test_mtus() {
        let transport = echo_transport().await;
        let session = BusSession::new(transport.clone(), SessionConfig::default()).unwrap();
        assert_eq!(session.mtu_in(), 1011);
        assert_eq!(session.mtu_out(), 371);

        let hinted = SessionConfig::builder().mtu_hint(100).build();
        let session = BusSession::new(transport, hinted).unwrap();
        assert_eq!(session.mtu_in(), 87);
        assert_eq!(session.mtu_out(), 62);
    }

    #[tokio::test]
    async fn test_oversized_request_refused() {
        let session = BusSession::new(echo_transport().await, SessionConfig::default()).unwrap();
        session.open().await.unwrap();

        let body = vec![0u8; session.mtu_out() + 1];
        assert!(matches!(
            session.tx_request_once(&request(1, &body), &opts()).await,
            Err(NmxError::EncodingTooLarge { .. })
        ));
        assert!(!session.transport().has_responder());
    }

    #[tokio::test]
    async fn test_second_session_sees_busy_transport() {
        let bus = SimBus::new();
        bus.add_silent_device("quiet");
        let transport = started(bus, "quiet", Duration::from_millis(200)).await;

        let first = Arc::new(BusSession::new(transport.clone(), SessionConfig::default()).unwrap());
        let second = BusSession::new(transport.clone(), SessionConfig::default()).unwrap();
        first.open().await.unwrap();
        second.open().await.unwrap();

        let pending = first.clone();
        let waiting = tokio::spawn(async move {
            pending.tx_request_once(&request(1, b""), &opts()).await
        });
        while !transport.has_responder() {
            tokio::task::yield_now().await;
        }

        let err = second
            .tx_request_once(&request(2, b""), &opts())
            .await
            .unwrap_err();
        assert!(err.is_busy());

        assert!(waiting.await.unwrap().unwrap_err().is_timeout());
        assert!(!transport.has_responder());
    }

    #[tokio::test]
    async fn test_abort_unblocks_request() {
        // Answers with the wrong sequence number so the request stays pending.
        let bus = SimBus::new();
        bus.add_device(
            "skewed",
            Arc::new(|raw: &Bytes| {
                let req = NmpMessage::decode(raw).ok()?;
                let mut rsp = req.response(Vec::new());
                rsp.hdr.seq = req.seq().wrapping_add(1);
                rsp.encode().ok()
            }),
        );
        let transport = started(bus, "skewed", Duration::from_millis(500)).await;
        let session = Arc::new(BusSession::new(transport, SessionConfig::default()).unwrap());
        session.open().await.unwrap();

        let pending = session.clone();
        let waiting = tokio::spawn(async move {
            pending
                .tx_request_once(&request(5, b""), &TxOptions::new(Duration::from_secs(5)))
                .await
        });

        loop {
            match session.abort_rx(5) {
                Ok(()) => break,
                Err(NmxError::NoListener(5)) => tokio::task::yield_now().await,
                Err(e) => panic!("unexpected abort error: {e}"),
            }
        }
        assert!(matches!(waiting.await.unwrap(), Err(NmxError::Aborted)));
    }

    async fn quiet_session() -> Arc<BusSession<SimBus>> {
        let bus = SimBus::new();
        bus.add_silent_device("quiet");
        let transport = started(bus, "quiet", Duration::from_secs(2)).await;
        let session = Arc::new(BusSession::new(transport, SessionConfig::default()).unwrap());
        session.open().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_request_timeout_shorter_than_comm_timeout() {
        let session = quiet_session().await;

        let started = tokio::time::Instant::now();
        let err = session
            .tx_request_once(&request(4, b""), &TxOptions::new(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!session.transport().has_responder());
    }

    #[tokio::test]
    async fn test_abort_while_bus_polls() {
        let session = quiet_session().await;
        let pending = session.clone();
        let started = tokio::time::Instant::now();
        let waiting = tokio::spawn(async move {
            pending
                .tx_request_once(&request(5, b""), &TxOptions::new(Duration::from_secs(5)))
                .await
        });

        loop {
            match session.abort_rx(5) {
                Ok(()) => break,
                Err(NmxError::NoListener(5)) => tokio::task::yield_now().await,
                Err(e) => panic!("unexpected abort error: {e}"),
            }
        }
        assert!(matches!(waiting.await.unwrap(), Err(NmxError::Aborted)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!session.transport().has_responder());
    }

    #[tokio::test]
    async fn test_close_while_bus_polls() {
        let session = quiet_session().await;
        let pending = session.clone();
        let waiting = tokio::spawn(async move {
            pending
                .tx_request_once(&request(6, b""), &TxOptions::new(Duration::from_secs(5)))
                .await
        });

        while !session.transport().has_responder() {
            tokio::task::yield_now().await;
        }
        session.close().await.unwrap();
        assert!(matches!(waiting.await.unwrap(), Err(NmxError::Closed(_))));
    }

    #[tokio::test]
    async fn test_omp_session_refused() {
        let transport = echo_transport().await;
        let cfg = SessionConfig::builder().mgmt_proto(MgmtProto::Omp).build();
        assert!(matches!(
            transport.build_session(cfg),
            Err(NmxError::InvalidConfig(_))
        ));
    }
}
