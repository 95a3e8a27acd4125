//! One-shot wait handle for a single outstanding request

use nmx_core::{NmpMessage, NmxError, NmxResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Registered side of an outstanding request
///
/// The dispatcher keeps one of these per sequence number. The slot holds
/// exactly one outcome: whichever of a response or an error arrives first
/// wins and every later delivery is ignored.
#[derive(Debug)]
pub struct Listener {
    seq: u8,
    slot: Mutex<Option<oneshot::Sender<NmxResult<NmpMessage>>>>,
}

/// Waiting side of an outstanding request
#[derive(Debug)]
pub struct ListenerWait {
    seq: u8,
    rx: oneshot::Receiver<NmxResult<NmpMessage>>,
}

impl Listener {
    /// Create a listener for `seq` and the handle the requester waits on
    pub fn new(seq: u8) -> (Arc<Listener>, ListenerWait) {
        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(Listener {
            seq,
            slot: Mutex::new(Some(tx)),
        });
        (listener, ListenerWait { seq, rx })
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Deliver a response
    ///
    /// # Returns
    /// `false` if the listener was already resolved
    pub fn deliver(&self, rsp: NmpMessage) -> bool {
        self.resolve(Ok(rsp))
    }

    /// Deliver an error
    ///
    /// # Returns
    /// `false` if the listener was already resolved
    pub fn fail(&self, err: NmxError) -> bool {
        self.resolve(Err(err))
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.lock().is_none()
    }

    fn resolve(&self, outcome: NmxResult<NmpMessage>) -> bool {
        match self.slot.lock().take() {
            // The waiter may already have given up on a timeout.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

impl ListenerWait {
    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Wait for the response, an error, or the deadline, whichever is first
    pub async fn wait(self, timeout: Duration) -> NmxResult<NmpMessage> {
        self.wait_until(Instant::now() + timeout).await
    }

    /// Like [`wait`](ListenerWait::wait) with an absolute deadline
    pub async fn wait_until(self, deadline: Instant) -> NmxResult<NmpMessage> {
        match tokio::time::timeout_at(deadline, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(NmxError::Disconnected(format!(
                "listener for seq {} dropped",
                self.seq
            ))),
            Err(_) => Err(NmxError::Timeout(format!(
                "no response for seq {} before deadline",
                self.seq
            ))),
        }
    }
}
