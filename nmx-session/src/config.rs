//! Session configuration and per-request options

use nmx_core::{MgmtProto, NmpMessage};
use nmx_transport::PeerSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How long `close` waits for the transport to confirm teardown
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-request response timeout
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(10);

/// Message predicate; returning `false` drops the message
pub type MsgFilter = Arc<dyn Fn(&NmpMessage) -> bool + Send + Sync>;

/// Configuration of one session, fixed at construction
#[derive(Clone)]
pub struct SessionConfig {
    pub mgmt_proto: MgmtProto,
    /// Applied to outgoing requests
    pub tx_filter: Option<MsgFilter>,
    /// Applied to incoming responses
    pub rx_filter: Option<MsgFilter>,
    /// Upper bound on the raw link MTU the session will use
    pub mtu_hint: Option<usize>,
    /// Peer to connect to; required by link-oriented transports
    pub peer: Option<PeerSpec>,
    pub close_timeout: Duration,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("mgmt_proto", &self.mgmt_proto)
            .field("tx_filter", &self.tx_filter.is_some())
            .field("rx_filter", &self.rx_filter.is_some())
            .field("mtu_hint", &self.mtu_hint)
            .field("peer", &self.peer)
            .field("close_timeout", &self.close_timeout)
            .finish()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mgmt_proto: MgmtProto::Nmp,
            tx_filter: None,
            rx_filter: None,
            mtu_hint: None,
            peer: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Apply the MTU hint to a raw MTU
    pub fn cap_mtu(&self, mtu: usize) -> usize {
        match self.mtu_hint {
            Some(hint) => mtu.min(hint),
            None => mtu,
        }
    }
}

/// Builder for [`SessionConfig`]
///
/// ```rust
/// use nmx_session::SessionConfig;
/// use nmx_transport::PeerSpec;
///
/// let cfg = SessionConfig::builder()
///     .peer(PeerSpec::by_name("sensor-7"))
///     .rx_filter(|msg| msg.hdr.group == 0)
///     .build();
/// assert!(cfg.rx_filter.is_some());
/// ```
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    cfg: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mgmt_proto(mut self, proto: MgmtProto) -> Self {
        self.cfg.mgmt_proto = proto;
        self
    }

    pub fn tx_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&NmpMessage) -> bool + Send + Sync + 'static,
    {
        self.cfg.tx_filter = Some(Arc::new(filter));
        self
    }

    pub fn rx_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&NmpMessage) -> bool + Send + Sync + 'static,
    {
        self.cfg.rx_filter = Some(Arc::new(filter));
        self
    }

    pub fn mtu_hint(mut self, mtu: usize) -> Self {
        self.cfg.mtu_hint = Some(mtu);
        self
    }

    pub fn peer(mut self, peer: PeerSpec) -> Self {
        self.cfg.peer = Some(peer);
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.close_timeout = timeout;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.cfg
    }
}

/// Per-request options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOptions {
    /// How long to wait for each attempt's response
    pub timeout: Duration,
    /// Total attempts; only timeouts are retried
    pub tries: u32,
}

impl TxOptions {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout, tries: 1 }
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }
}

impl Default for TxOptions {
    fn default() -> Self {
        Self::new(DEFAULT_TX_TIMEOUT)
    }
}
