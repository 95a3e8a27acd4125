//! Discovery bus collaborator
//!
//! The vendor discovery bus carries four packet kinds:
//!
//! - `ping { request_id }` broadcast by the client
//! - `pong { request_id, device_name }` answered by every device
//! - `command { request_id, device_name, payload }` addressed by name
//! - `response { request_id, payload }` answered by the addressed device
//!
//! Request ids only correlate replies with requests; they carry no security
//! meaning.

use async_trait::async_trait;
use bytes::Bytes;
use nmx_core::NmxResult;
use tokio::time::Instant;

/// Size of the fixed device name field in a pong (including the terminator)
pub const DEVICE_NAME_CAPACITY: usize = 16;

/// Largest response payload the bus can carry
pub const MAX_RESPONSE_SIZE: usize = 1024;

/// Fresh correlation id for a ping or command
pub fn new_request_id() -> i32 {
    rand::random()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub request_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub request_id: i32,
    pub device_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub request_id: i32,
    pub device_name: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub request_id: i32,
    pub payload: Bytes,
}

/// Native discovery/command library
///
/// Receive calls block until a packet arrives or the absolute deadline
/// passes. Packets are only delivered between a `*_listen` and the matching
/// `*_reject`.
#[async_trait]
pub trait DiscoveryBus: Send + Sync {
    /// Bring the bus up; waits until all publishers and subscribers matched
    async fn initialize(&self, deadline: Instant) -> NmxResult<()>;

    fn ping_send(&self, ping: &Ping) -> NmxResult<()>;

    fn pong_listen(&self);

    async fn pong_recv(&self, deadline: Instant) -> NmxResult<Pong>;

    fn pong_reject(&self);

    fn command_send(&self, command: &Command) -> NmxResult<()>;

    fn response_listen(&self);

    async fn response_recv(&self, deadline: Instant) -> NmxResult<Response>;

    fn response_reject(&self);
}
