//! In-memory peers for both collaborators
//!
//! [`SimBus`] answers discovery and commands from a list of named devices,
//! [`SimLink`] behaves like a single connectable peripheral. Both run the
//! same request handlers so a test can swap transports without changing the
//! simulated device.

mod bus;
mod link;

pub use bus::SimBus;
pub use link::{SimLink, TeardownMode, SIM_ATTR_HANDLE};

use bytes::Bytes;
use nmx_core::NmpMessage;
use std::sync::Arc;

/// Maps one encoded request to its encoded response; `None` means the device
/// stays silent
pub type CommandHandler = Arc<dyn Fn(&Bytes) -> Option<Bytes> + Send + Sync>;

/// Device that answers every NMP request with a response carrying the same body
pub fn nmp_echo_handler() -> CommandHandler {
    Arc::new(|request: &Bytes| {
        let msg = match NmpMessage::decode(request) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Simulated device ignoring undecodable request: {}", e);
                return None;
            }
        };
        msg.response(msg.body.clone()).encode().ok()
    })
}
