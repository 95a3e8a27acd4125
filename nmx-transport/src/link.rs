//! Short-range wireless link collaborator
//!
//! The radio stack itself is not part of this crate. [`LinkDriver`] is the
//! surface the link state machine drives: connect to a peer, discover the
//! management characteristic, subscribe to notifications, write commands and
//! terminate. Everything the link reports asynchronously arrives as a
//! [`LinkEvent`] on the channel handed back by [`LinkDriver::connect`].

use async_trait::async_trait;
use bytes::Bytes;
use nmx_core::{NmxError, NmxResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Connection handle assigned by the link driver
pub type ConnHandle = u16;

/// Attribute (characteristic value) handle on the peer
pub type AttrHandle = u16;

/// Link-layer address type of the local controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrType {
    #[default]
    Public,
    Random,
}

impl FromStr for AddrType {
    type Err = NmxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(AddrType::Public),
            "random" => Ok(AddrType::Random),
            other => Err(NmxError::InvalidConfig(format!(
                "Invalid address type: {}",
                other
            ))),
        }
    }
}

/// 48-bit device address, most significant octet first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr(pub [u8; 6]);

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for PeerAddr {
    type Err = NmxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NmxError::InvalidConfig(format!("Invalid peer address: {}", s));

        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(PeerAddr(octets))
    }
}

/// Which peer a link session connects to
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerSpec {
    /// Advertised name to scan for
    pub name: Option<String>,
    /// Exact device address
    pub addr: Option<PeerAddr>,
    pub own_addr_type: AddrType,
}

impl PeerSpec {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn by_addr(addr: PeerAddr) -> Self {
        Self {
            addr: Some(addr),
            ..Default::default()
        }
    }
}

impl fmt::Display for PeerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, &self.addr) {
            (Some(name), Some(addr)) => write!(f, "{} ({})", name, addr),
            (Some(name), None) => f.write_str(name),
            (None, Some(addr)) => write!(f, "{}", addr),
            (None, None) => f.write_str("<any>"),
        }
    }
}

/// Event reported by the link after a connection is established
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Notification received on a subscribed attribute
    Notification { attr: AttrHandle, data: Bytes },
    /// The link dropped; no further events follow
    Disconnected { reason: NmxError },
}

/// A freshly established link
#[derive(Debug)]
pub struct LinkConnection {
    pub handle: ConnHandle,
    /// Negotiated ATT MTU
    pub att_mtu: u16,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Radio stack driver
#[async_trait]
pub trait LinkDriver: Send + Sync {
    /// Connect to `peer`
    async fn connect(&self, peer: &PeerSpec) -> NmxResult<LinkConnection>;

    /// Resolve the attribute handle of characteristic `chr` in service `svc`
    async fn discover_characteristic(
        &self,
        conn: ConnHandle,
        svc: Uuid,
        chr: Uuid,
    ) -> NmxResult<AttrHandle>;

    /// Enable notifications on `attr`
    async fn subscribe(&self, conn: ConnHandle, attr: AttrHandle) -> NmxResult<()>;

    /// Write without response
    async fn write_cmd(&self, conn: ConnHandle, attr: AttrHandle, data: Bytes) -> NmxResult<()>;

    /// Start tearing the link down; completion is reported as
    /// [`LinkEvent::Disconnected`]
    async fn terminate(&self, conn: ConnHandle) -> NmxResult<()>;
}
