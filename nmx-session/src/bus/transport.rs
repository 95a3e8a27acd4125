//! Discovery bus transport

use super::session::BusSession;
use crate::config::SessionConfig;
use crate::session::Session;
use crate::transceiver::Transceiver;
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use nmx_core::{NmxError, NmxResult};
use nmx_transport::bus::new_request_id;
use nmx_transport::{Command, DiscoveryBus, Ping};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Discovery bus transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusTransportConfig {
    /// Deadline for discovery and for each command/response exchange
    pub comm_timeout: Duration,
    /// Regular expression matched against advertised device names
    pub target_match: String,
    /// Raw bus MTU
    pub mtu: usize,
}

impl BusTransportConfig {
    pub fn new(target_match: impl Into<String>) -> Self {
        Self {
            target_match: target_match.into(),
            ..Default::default()
        }
    }
}

impl Default for BusTransportConfig {
    fn default() -> Self {
        Self {
            comm_timeout: Duration::from_secs(10),
            target_match: String::new(),
            mtu: 512,
        }
    }
}

#[derive(Default)]
struct BusState {
    device_name: Option<String>,
    closing: bool,
    responder: Option<Arc<Transceiver>>,
}

struct BusTransportInner<B> {
    cfg: BusTransportConfig,
    target: Regex,
    bus: Arc<B>,
    state: Mutex<BusState>,
    /// Serializes discovery; callers share one pong rendezvous
    start_lock: tokio::sync::Mutex<()>,
}

/// Transport over the vendor discovery bus
///
/// Cheap to clone; clones share the same device and responder slot.
pub struct BusTransport<B: DiscoveryBus> {
    inner: Arc<BusTransportInner<B>>,
}

impl<B: DiscoveryBus> Clone for BusTransport<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: DiscoveryBus> fmt::Debug for BusTransport<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BusTransport")
            .field("cfg", &self.inner.cfg)
            .field("device_name", &state.device_name)
            .field("closing", &state.closing)
            .field("responder", &state.responder.is_some())
            .finish()
    }
}

/// Holds the responder slot for the duration of one request
///
/// Dropping the guard frees the slot only while it still holds the
/// responder it reserved.
pub struct ResponderGuard<B: DiscoveryBus> {
    transport: BusTransport<B>,
    responder: Arc<Transceiver>,
}

impl<B: DiscoveryBus> Drop for ResponderGuard<B> {
    fn drop(&mut self) {
        let mut state = self.transport.inner.state.lock();
        let ours = state
            .responder
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &self.responder));
        if ours {
            state.responder = None;
        } else {
            log::debug!("Responder slot was reassigned; leaving it in place");
        }
    }
}

/// Closes a rendezvous window when dropped, including on cancellation
struct ListenWindow<'a, B: DiscoveryBus> {
    bus: &'a B,
    close: fn(&B),
}

impl<'a, B: DiscoveryBus> ListenWindow<'a, B> {
    fn open(bus: &'a B, open: fn(&B), close: fn(&B)) -> Self {
        open(bus);
        Self { bus, close }
    }
}

impl<B: DiscoveryBus> Drop for ListenWindow<'_, B> {
    fn drop(&mut self) {
        (self.close)(self.bus);
    }
}

impl<B: DiscoveryBus> BusTransport<B> {
    /// Create a transport over `bus`
    ///
    /// # Errors
    /// `NmxError::InvalidConfig` if the target pattern is empty or not a
    /// valid regular expression
    pub fn new(cfg: BusTransportConfig, bus: Arc<B>) -> NmxResult<Self> {
        if cfg.target_match.is_empty() {
            return Err(NmxError::InvalidConfig(
                "bus target pattern cannot be empty".to_string(),
            ));
        }
        let target = Regex::new(&cfg.target_match).map_err(|e| {
            NmxError::InvalidConfig(format!(
                "Invalid bus target pattern \"{}\": {}",
                cfg.target_match, e
            ))
        })?;

        Ok(Self {
            inner: Arc::new(BusTransportInner {
                cfg,
                target,
                bus,
                state: Mutex::new(BusState::default()),
                start_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn config(&self) -> &BusTransportConfig {
        &self.inner.cfg
    }

    /// Name of the device resolved by `start`
    pub fn device_name(&self) -> Option<String> {
        self.inner.state.lock().device_name.clone()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.state.lock().closing
    }

    pub fn has_responder(&self) -> bool {
        self.inner.state.lock().responder.is_some()
    }

    /// Register or clear the session that receives raw responses
    ///
    /// Clearing always succeeds.
    ///
    /// # Errors
    /// - `NmxError::Closed` if the transport is stopped
    /// - `NmxError::Busy` if another responder is registered
    pub fn set_rsp_session(&self, responder: Option<Arc<Transceiver>>) -> NmxResult<()> {
        let mut state = self.inner.state.lock();
        if responder.is_some() {
            if state.closing {
                return Err(NmxError::Closed("bus transport stopped".to_string()));
            }
            if state.responder.is_some() {
                return Err(NmxError::Busy("bus transport busy".to_string()));
            }
        }
        state.responder = responder;
        Ok(())
    }

    /// Register `responder` and clear it again when the guard drops
    pub fn reserve_responder(&self, responder: Arc<Transceiver>) -> NmxResult<ResponderGuard<B>> {
        self.set_rsp_session(Some(responder.clone()))?;
        Ok(ResponderGuard {
            transport: self.clone(),
            responder,
        })
    }

    fn route_response(&self, payload: &[u8]) -> NmxResult<()> {
        let responder = self.inner.state.lock().responder.clone();
        match responder {
            Some(txvr) => {
                txvr.on_rx(payload);
                Ok(())
            }
            None => {
                log::warn!(
                    "Dropping {}-byte bus response: no responder registered",
                    payload.len()
                );
                Err(NmxError::NoResponder)
            }
        }
    }

    async fn discover(&self, deadline: Instant) -> NmxResult<Option<String>> {
        let bus = &self.inner.bus;
        let request_id = new_request_id();
        bus.ping_send(&Ping { request_id })?;

        loop {
            let pong = match bus.pong_recv(deadline).await {
                Ok(pong) => pong,
                Err(e) if e.is_timeout() => return Ok(None),
                Err(e) => return Err(e),
            };

            if pong.request_id != request_id {
                log::debug!("Ignoring stale pong from {}", pong.device_name);
                continue;
            }
            if self.inner.target.is_match(&pong.device_name) {
                return Ok(Some(pong.device_name));
            }
            log::debug!("Bus device {} does not match target", pong.device_name);
        }
    }

    async fn exchange(&self, device_name: String, payload: Bytes, deadline: Instant) -> NmxResult<Bytes> {
        let bus = &self.inner.bus;
        let request_id = new_request_id();
        bus.command_send(&Command {
            request_id,
            device_name: device_name.clone(),
            payload,
        })?;

        loop {
            match bus.response_recv(deadline).await {
                Ok(rsp) if rsp.request_id == request_id => return Ok(rsp.payload),
                Ok(rsp) => {
                    log::debug!("Ignoring bus response with stale id {}", rsp.request_id);
                }
                Err(e) if e.is_timeout() => {
                    return Err(NmxError::Timeout(format!(
                        "no response from bus device {} within {:?}",
                        device_name, self.inner.cfg.comm_timeout
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<B: DiscoveryBus + 'static> Transport for BusTransport<B> {
    /// Discover the target device
    ///
    /// Broadcasts a ping and commits to the first pong whose device name
    /// matches the target pattern.
    ///
    /// Concurrent callers run one at a time.
    ///
    /// # Errors
    /// `NmxError::DeviceNotFound` if nothing matches before the comm timeout
    async fn start(&self) -> NmxResult<()> {
        let _starting = self.inner.start_lock.lock().await;
        if self.is_closing() {
            return Err(NmxError::Closed("bus transport stopped".to_string()));
        }

        let deadline = Instant::now() + self.inner.cfg.comm_timeout;
        let bus = &*self.inner.bus;
        bus.initialize(deadline).await?;

        let found = {
            let _window = ListenWindow::open(bus, B::pong_listen, B::pong_reject);
            self.discover(deadline).await
        };

        match found? {
            Some(device_name) => {
                log::info!("Matched bus device {}", device_name);
                self.inner.state.lock().device_name = Some(device_name);
                Ok(())
            }
            None => Err(NmxError::DeviceNotFound(format!(
                "no bus device matching \"{}\"",
                self.inner.cfg.target_match
            ))),
        }
    }

    async fn stop(&self) -> NmxResult<()> {
        self.inner.state.lock().closing = true;
        Ok(())
    }

    fn build_session(&self, cfg: SessionConfig) -> NmxResult<Box<dyn Session>> {
        Ok(Box::new(BusSession::new(self.clone(), cfg)?))
    }

    /// Send `data` to the resolved device and route the response to the
    /// registered responder
    ///
    /// # Errors
    /// - `NmxError::Closed` if the transport is stopped
    /// - `NmxError::InvalidState` if `start` has not resolved a device
    /// - `NmxError::Timeout` if no matching response arrives before the comm timeout
    /// - `NmxError::NoResponder` if the response arrives with nobody registered
    async fn tx(&self, data: Bytes) -> NmxResult<()> {
        let device_name = {
            let state = self.inner.state.lock();
            if state.closing {
                return Err(NmxError::Closed("bus transport stopped".to_string()));
            }
            state.device_name.clone().ok_or_else(|| {
                NmxError::InvalidState("bus transport not started".to_string())
            })?
        };

        let deadline = Instant::now() + self.inner.cfg.comm_timeout;
        let payload = {
            let bus = &*self.inner.bus;
            let _window = ListenWindow::open(bus, B::response_listen, B::response_reject);
            self.exchange(device_name, data, deadline).await
        };

        self.route_response(&payload?)
    }
}
