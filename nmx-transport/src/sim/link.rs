use super::CommandHandler;
use crate::link::{AttrHandle, ConnHandle, LinkConnection, LinkDriver, LinkEvent, PeerSpec};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use nmx_core::{NmpHeader, NmxError, NmxResult, NMP_HDR_SIZE};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Attribute handle the simulated peripheral exposes for management traffic
pub const SIM_ATTR_HANDLE: AttrHandle = 0x0012;

/// ATT write/notify opcode plus handle
const ATT_BASE_SZ: usize = 3;

/// How the simulated peripheral reacts to `terminate`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownMode {
    /// Report the disconnect right away
    Immediate,
    /// Keep the link up until [`SimLink::drop_link`] is called
    Deferred,
}

#[derive(Debug)]
struct SimConn {
    handle: ConnHandle,
    events: mpsc::UnboundedSender<LinkEvent>,
    rx_buf: BytesMut,
    subscribed: bool,
    terminating: bool,
}

struct SimLinkState {
    conn: Option<SimConn>,
    next_handle: ConnHandle,
    teardown: TeardownMode,
    connect_error: Option<NmxError>,
    writes: Vec<Bytes>,
    connects: usize,
}

/// Simulated peripheral reachable over the link
pub struct SimLink {
    state: Mutex<SimLinkState>,
    handler: Option<CommandHandler>,
    att_mtu: u16,
}

impl SimLink {
    pub fn new(att_mtu: u16, handler: Option<CommandHandler>) -> Self {
        Self {
            state: Mutex::new(SimLinkState {
                conn: None,
                next_handle: 1,
                teardown: TeardownMode::Immediate,
                connect_error: None,
                writes: Vec::new(),
                connects: 0,
            }),
            handler,
            att_mtu,
        }
    }

    /// Peripheral answering every request with an echo of its body
    pub fn echo(att_mtu: u16) -> Self {
        Self::new(att_mtu, Some(super::nmp_echo_handler()))
    }

    /// Peripheral that accepts writes but never answers
    pub fn silent(att_mtu: u16) -> Self {
        Self::new(att_mtu, None)
    }

    pub fn set_teardown(&self, mode: TeardownMode) {
        self.state.lock().teardown = mode;
    }

    /// Make the next `connect` fail with `err`
    pub fn fail_next_connect(&self, err: NmxError) {
        self.state.lock().connect_error = Some(err);
    }

    /// Drop the link from the peer side
    ///
    /// # Returns
    /// `false` if there was no link to drop
    pub fn drop_link(&self, reason: &str) -> bool {
        let conn = self.state.lock().conn.take();
        match conn {
            Some(conn) => {
                let _ = conn.events.send(LinkEvent::Disconnected {
                    reason: NmxError::Disconnected(reason.to_string()),
                });
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().conn.is_some()
    }

    /// Raw writes received so far
    pub fn writes(&self) -> Vec<Bytes> {
        self.state.lock().writes.clone()
    }

    /// Number of successful connects
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    fn max_write(&self) -> usize {
        (self.att_mtu as usize).saturating_sub(ATT_BASE_SZ)
    }
}

fn live_conn(conn: &mut Option<SimConn>, handle: ConnHandle) -> NmxResult<&mut SimConn> {
    match conn {
        Some(conn) if conn.handle == handle && !conn.terminating => Ok(conn),
        _ => Err(NmxError::Disconnected(format!(
            "no live connection with handle {}",
            handle
        ))),
    }
}

#[async_trait]
impl LinkDriver for SimLink {
    async fn connect(&self, peer: &PeerSpec) -> NmxResult<LinkConnection> {
        let mut state = self.state.lock();
        if let Some(err) = state.connect_error.take() {
            return Err(err);
        }
        if state.conn.is_some() {
            return Err(NmxError::Busy("peripheral already connected".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = state.next_handle;
        state.next_handle = state.next_handle.wrapping_add(1);
        state.connects += 1;
        state.conn = Some(SimConn {
            handle,
            events: tx,
            rx_buf: BytesMut::new(),
            subscribed: false,
            terminating: false,
        });
        log::debug!("Simulated peripheral connected to {} (handle {})", peer, handle);

        Ok(LinkConnection {
            handle,
            att_mtu: self.att_mtu,
            events: rx,
        })
    }

    async fn discover_characteristic(
        &self,
        conn: ConnHandle,
        _svc: Uuid,
        _chr: Uuid,
    ) -> NmxResult<AttrHandle> {
        let mut state = self.state.lock();
        live_conn(&mut state.conn, conn)?;
        Ok(SIM_ATTR_HANDLE)
    }

    async fn subscribe(&self, conn: ConnHandle, attr: AttrHandle) -> NmxResult<()> {
        let mut state = self.state.lock();
        let conn = live_conn(&mut state.conn, conn)?;
        if attr != SIM_ATTR_HANDLE {
            return Err(NmxError::InvalidData(format!(
                "unknown attribute handle 0x{:04x}",
                attr
            )));
        }
        conn.subscribed = true;
        Ok(())
    }

    async fn write_cmd(&self, conn: ConnHandle, attr: AttrHandle, data: Bytes) -> NmxResult<()> {
        let max_write = self.max_write();
        if data.len() > max_write {
            return Err(NmxError::EncodingTooLarge {
                size: data.len(),
                mtu: max_write,
            });
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let conn = live_conn(&mut state.conn, conn)?;
        if attr != SIM_ATTR_HANDLE {
            return Err(NmxError::InvalidData(format!(
                "unknown attribute handle 0x{:04x}",
                attr
            )));
        }
        state.writes.push(data.clone());
        conn.rx_buf.extend_from_slice(&data);

        while conn.rx_buf.len() >= NMP_HDR_SIZE {
            let hdr = match NmpHeader::decode(&conn.rx_buf[..NMP_HDR_SIZE]) {
                Ok(hdr) => hdr,
                Err(e) => {
                    conn.rx_buf.clear();
                    return Err(e);
                }
            };
            if conn.rx_buf.len() < hdr.frame_len() {
                break;
            }
            let request = conn.rx_buf.split_to(hdr.frame_len()).freeze();

            let Some(handler) = self.handler.as_ref() else {
                continue;
            };
            let Some(response) = handler(&request) else {
                continue;
            };
            if !conn.subscribed {
                continue;
            }
            for chunk in response.chunks(max_write) {
                let _ = conn.events.send(LinkEvent::Notification {
                    attr: SIM_ATTR_HANDLE,
                    data: Bytes::copy_from_slice(chunk),
                });
            }
        }
        Ok(())
    }

    async fn terminate(&self, conn: ConnHandle) -> NmxResult<()> {
        let mut state = self.state.lock();
        live_conn(&mut state.conn, conn)?;

        match state.teardown {
            TeardownMode::Immediate => {
                if let Some(conn) = state.conn.take() {
                    let _ = conn.events.send(LinkEvent::Disconnected {
                        reason: NmxError::Disconnected(
                            "connection terminated by local host".to_string(),
                        ),
                    });
                }
            }
            TeardownMode::Deferred => {
                if let Some(conn) = state.conn.as_mut() {
                    conn.terminating = true;
                }
            }
        }
        Ok(())
    }
}
