//! Link connection state machine
//!
//! Connects to the peer, discovers and subscribes to the management
//! characteristic, then hands link events to a [`LinkHandler`] from a pump
//! task. The handler is held weakly so a dropped session does not keep the
//! pump's target alive.

use super::state::LinkState;
use bytes::Bytes;
use nmx_core::{NmxError, NmxResult};
use nmx_transport::{AttrHandle, ConnHandle, LinkConnection, LinkDriver, LinkEvent, PeerSpec};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use uuid::{uuid, Uuid};

/// Plain management service
pub const NMP_SVC_UUID: Uuid = uuid!("8d53dc1d-1db7-4cd3-868b-8a527460aa84");

/// Plain management request/response characteristic
pub const NMP_CHR_UUID: Uuid = uuid!("da2e7828-fbce-4e01-ae9e-261174997c48");

/// Receives link events
///
/// Called from the pump task; implementations must not block. Events from a
/// link the state machine no longer tracks are not delivered.
pub trait LinkHandler: Send + Sync {
    fn on_connect(&self);

    /// Raw notification bytes from the management characteristic
    fn on_rx(&self, data: &[u8]);

    /// The current link dropped; called at most once per established link
    ///
    /// Runs while the state is still held, before it returns to `Idle`, so
    /// the handler must not call back into the [`LinkFsm`].
    fn on_disconnect(&self, reason: NmxError);
}

#[derive(Debug, Default)]
struct FsmState {
    link: LinkState,
    conn: Option<ConnHandle>,
    attr: Option<AttrHandle>,
    att_mtu: u16,
}

impl FsmState {
    fn transition(&mut self, new_state: LinkState) -> NmxResult<()> {
        self.link.validate_transition(new_state)?;
        log::debug!("Link state {} -> {}", self.link, new_state);
        self.link = new_state;
        Ok(())
    }

    fn reset(&mut self) {
        self.link = LinkState::Idle;
        self.conn = None;
        self.attr = None;
    }
}

pub struct LinkFsm<D: LinkDriver> {
    driver: Arc<D>,
    peer: PeerSpec,
    state: Arc<Mutex<FsmState>>,
}

impl<D: LinkDriver> fmt::Debug for LinkFsm<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkFsm")
            .field("peer", &self.peer)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl<D: LinkDriver + 'static> LinkFsm<D> {
    pub fn new(driver: Arc<D>, peer: PeerSpec) -> Self {
        Self {
            driver,
            peer,
            state: Arc::new(Mutex::new(FsmState::default())),
        }
    }

    pub fn peer(&self) -> &PeerSpec {
        &self.peer
    }

    pub fn state(&self) -> LinkState {
        self.state.lock().link
    }

    /// Negotiated ATT MTU of the current link; 0 without one
    pub fn att_mtu(&self) -> u16 {
        let state = self.state.lock();
        if state.link.is_ready() {
            state.att_mtu
        } else {
            0
        }
    }

    /// Establish the link
    ///
    /// On success the state is `Connected`, the event pump is running and
    /// `handler.on_connect()` has been called. On failure the state returns
    /// to `Idle`.
    ///
    /// # Errors
    /// - `NmxError::InvalidState` unless the link is idle
    /// - any error from the driver's connect, discovery or subscribe
    pub async fn start(&self, handler: Weak<dyn LinkHandler>) -> NmxResult<()> {
        self.state.lock().transition(LinkState::Connecting)?;
        log::info!("Connecting to {}", self.peer);

        let conn = match self.driver.connect(&self.peer).await {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("Connection to {} failed: {}", self.peer, e);
                self.state.lock().reset();
                return Err(e);
            }
        };

        let attr = match self.discover(conn.handle).await {
            Ok(attr) => attr,
            Err(e) => {
                log::error!("Service discovery on {} failed: {}", self.peer, e);
                if let Err(te) = self.driver.terminate(conn.handle).await {
                    log::debug!("Terminating half-open link failed: {}", te);
                }
                self.state.lock().reset();
                return Err(e);
            }
        };

        let LinkConnection {
            handle,
            att_mtu,
            events,
        } = conn;
        {
            let mut state = self.state.lock();
            state.transition(LinkState::Connected)?;
            state.conn = Some(handle);
            state.attr = Some(attr);
            state.att_mtu = att_mtu;
        }
        log::info!(
            "Connected to {} (handle {}, att_mtu {})",
            self.peer,
            handle,
            att_mtu
        );

        tokio::spawn(pump(events, handle, attr, self.state.clone(), handler.clone()));
        if let Some(handler) = handler.upgrade() {
            handler.on_connect();
        }
        Ok(())
    }

    async fn discover(&self, conn: ConnHandle) -> NmxResult<AttrHandle> {
        let attr = self
            .driver
            .discover_characteristic(conn, NMP_SVC_UUID, NMP_CHR_UUID)
            .await?;
        self.driver.subscribe(conn, attr).await?;
        Ok(attr)
    }

    /// Request teardown
    ///
    /// # Returns
    /// `true` if the link is already down; `false` if teardown was started
    /// and completion will arrive through `on_disconnect`
    ///
    /// # Errors
    /// `NmxError::InvalidState` while a connect is in progress
    pub async fn stop(&self) -> NmxResult<bool> {
        let conn = {
            let mut state = self.state.lock();
            match state.link {
                LinkState::Idle => return Ok(true),
                LinkState::Disconnecting => return Ok(false),
                LinkState::Connecting => {
                    return Err(NmxError::InvalidState(
                        "link connection in progress".to_string(),
                    ));
                }
                LinkState::Connected => {}
            }
            state.transition(LinkState::Disconnecting)?;
            state.conn
        };

        if let Some(conn) = conn {
            if let Err(e) = self.driver.terminate(conn).await {
                log::warn!("Terminating link to {} failed: {}", self.peer, e);
            }
        }
        Ok(false)
    }

    /// Give up on a teardown the driver never confirmed
    ///
    /// Returns the state to `Idle` and forgets the connection, so its late
    /// disconnect is ignored.
    ///
    /// # Returns
    /// `true` if a pending teardown was abandoned
    pub fn abandon(&self) -> bool {
        let mut state = self.state.lock();
        if state.link != LinkState::Disconnecting {
            return false;
        }
        if let Some(conn) = state.conn {
            log::warn!("Abandoning unconfirmed teardown of link handle {}", conn);
        }
        if let Err(e) = state.transition(LinkState::Idle) {
            log::warn!("{}", e);
        }
        state.reset();
        true
    }

    /// Write one unit of request bytes
    ///
    /// # Errors
    /// `NmxError::Closed` unless the link is connected
    pub async fn write(&self, data: Bytes) -> NmxResult<()> {
        let (conn, attr) = {
            let state = self.state.lock();
            match (state.link, state.conn, state.attr) {
                (LinkState::Connected, Some(conn), Some(attr)) => (conn, attr),
                (link, _, _) => {
                    return Err(NmxError::Closed(format!("link is {}", link)));
                }
            }
        };
        self.driver.write_cmd(conn, attr, data).await
    }
}

async fn pump(
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    conn: ConnHandle,
    attr: AttrHandle,
    state: Arc<Mutex<FsmState>>,
    handler: Weak<dyn LinkHandler>,
) {
    let reason = loop {
        match events.recv().await {
            Some(LinkEvent::Notification { attr: from, data }) => {
                if from != attr {
                    log::debug!("Ignoring notification from attribute 0x{:04x}", from);
                    continue;
                }
                if state.lock().conn != Some(conn) {
                    log::debug!("Dropping notification from stale link handle {}", conn);
                    continue;
                }
                if let Some(handler) = handler.upgrade() {
                    handler.on_rx(&data);
                }
            }
            Some(LinkEvent::Disconnected { reason }) => break reason,
            None => break NmxError::Disconnected("link event stream ended".to_string()),
        }
    };

    let mut state = state.lock();
    if state.conn != Some(conn) {
        log::debug!("Ignoring disconnect of stale link handle {}: {}", conn, reason);
        return;
    }
    log::info!("Link handle {} down: {}", conn, reason);

    // Nobody can reopen until the state is released.
    if let Some(handler) = handler.upgrade() {
        handler.on_disconnect(reason);
    }
    if let Err(e) = state.transition(LinkState::Idle) {
        log::warn!("{}", e);
    }
    state.reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockall::mock;
    use nmx_transport::{SimLink, TeardownMode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    mock! {
        Driver {}

        #[async_trait]
        impl LinkDriver for Driver {
            async fn connect(&self, peer: &PeerSpec) -> NmxResult<LinkConnection>;
            async fn discover_characteristic(
                &self,
                conn: ConnHandle,
                svc: Uuid,
                chr: Uuid,
            ) -> NmxResult<AttrHandle>;
            async fn subscribe(&self, conn: ConnHandle, attr: AttrHandle) -> NmxResult<()>;
            async fn write_cmd(&self, conn: ConnHandle, attr: AttrHandle, data: Bytes) -> NmxResult<()>;
            async fn terminate(&self, conn: ConnHandle) -> NmxResult<()>;
        }
    }

    #[derive(Default)]
    struct Counter {
        connects: AtomicUsize,
        rx_bytes: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl LinkHandler for Counter {
        fn on_connect(&self) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_rx(&self, data: &[u8]) {
            self.rx_bytes.fetch_add(data.len(), Ordering::SeqCst);
        }

        fn on_disconnect(&self, _reason: NmxError) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn handler(counter: &Arc<Counter>) -> Weak<dyn LinkHandler> {
        let weak: Weak<Counter> = Arc::downgrade(counter);
        weak
    }

    async fn settle<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_idle() {
        let mut driver = MockDriver::new();
        driver
            .expect_connect()
            .times(1)
            .returning(|_| Err(NmxError::Timeout("no advertisement".into())));
        let fsm = LinkFsm::new(Arc::new(driver), PeerSpec::by_name("sensor"));
        let counter = Arc::new(Counter::default());

        assert!(fsm.start(handler(&counter)).await.unwrap_err().is_timeout());
        assert_eq!(fsm.state(), LinkState::Idle);
        assert_eq!(counter.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_discovery_failure_terminates_link() {
        let mut driver = MockDriver::new();
        driver.expect_connect().returning(|_| {
            let (_tx, events) = mpsc::unbounded_channel();
            Ok(LinkConnection {
                handle: 7,
                att_mtu: 185,
                events,
            })
        });
        driver
            .expect_discover_characteristic()
            .withf(|conn, svc, chr| *conn == 7 && *svc == NMP_SVC_UUID && *chr == NMP_CHR_UUID)
            .returning(|_, _, _| Err(NmxError::InvalidData("service missing".into())));
        driver
            .expect_terminate()
            .withf(|conn| *conn == 7)
            .times(1)
            .returning(|_| Ok(()));

        let fsm = LinkFsm::new(Arc::new(driver), PeerSpec::by_name("sensor"));
        let counter = Arc::new(Counter::default());
        assert!(matches!(
            fsm.start(handler(&counter)).await,
            Err(NmxError::InvalidData(_))
        ));
        assert_eq!(fsm.state(), LinkState::Idle);
    }

    #[tokio::test]
    async fn test_lifecycle_with_simulated_link() {
        let link = Arc::new(SimLink::echo(64));
        let fsm = LinkFsm::new(link.clone(), PeerSpec::by_name("sensor"));
        let counter = Arc::new(Counter::default());

        fsm.start(handler(&counter)).await.unwrap();
        assert_eq!(fsm.state(), LinkState::Connected);
        assert_eq!(fsm.att_mtu(), 64);
        assert_eq!(counter.connects.load(Ordering::SeqCst), 1);
        assert!(fsm.start(handler(&counter)).await.is_err());

        assert!(!fsm.stop().await.unwrap());
        settle(|| counter.disconnects.load(Ordering::SeqCst) == 1).await;
        assert_eq!(fsm.state(), LinkState::Idle);
        assert!(fsm.stop().await.unwrap());
        assert!(matches!(
            fsm.write(Bytes::from_static(b"x")).await,
            Err(NmxError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_deferred_teardown_stays_disconnecting() {
        let link = Arc::new(SimLink::silent(64));
        link.set_teardown(TeardownMode::Deferred);
        let fsm = LinkFsm::new(link.clone(), PeerSpec::by_name("sensor"));
        let counter = Arc::new(Counter::default());

        fsm.start(handler(&counter)).await.unwrap();
        assert!(!fsm.stop().await.unwrap());
        assert_eq!(fsm.state(), LinkState::Disconnecting);
        assert!(!fsm.stop().await.unwrap());

        assert!(link.drop_link("supervision timeout"));
        settle(|| fsm.state() == LinkState::Idle).await;
        assert_eq!(counter.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_teardown_ignores_late_disconnect() {
        let link = Arc::new(SimLink::silent(64));
        link.set_teardown(TeardownMode::Deferred);
        let fsm = LinkFsm::new(link.clone(), PeerSpec::by_name("sensor"));
        let counter = Arc::new(Counter::default());

        assert!(!fsm.abandon());
        fsm.start(handler(&counter)).await.unwrap();
        assert!(!fsm.stop().await.unwrap());
        assert!(fsm.abandon());
        assert_eq!(fsm.state(), LinkState::Idle);
        assert!(fsm.stop().await.unwrap());

        assert!(link.drop_link("supervision timeout"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(fsm.state(), LinkState::Idle);

        fsm.start(handler(&counter)).await.unwrap();
        assert_eq!(fsm.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_peer_drop_fires_disconnect_once() {
        let link = Arc::new(SimLink::silent(64));
        let fsm = LinkFsm::new(link.clone(), PeerSpec::by_name("sensor"));
        let counter = Arc::new(Counter::default());

        fsm.start(handler(&counter)).await.unwrap();
        assert!(link.drop_link("out of range"));
        settle(|| counter.disconnects.load(Ordering::SeqCst) == 1).await;
        assert_eq!(fsm.state(), LinkState::Idle);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.disconnects.load(Ordering::SeqCst), 1);
    }
}
