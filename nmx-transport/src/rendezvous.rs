//! Single-consumer hand-off between a packet producer and a deadline-bounded
//! consumer

use nmx_core::{NmxError, NmxResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct RendezvousState<T> {
    enabled: bool,
    pending: VecDeque<T>,
}

/// Hand-off slot for one packet stream
///
/// Packets are only accepted while a consumer has called [`listen`]. Anything
/// produced outside a listen window is dropped, which is how stale pongs and
/// responses from earlier exchanges are discarded.
///
/// [`listen`]: Rendezvous::listen
#[derive(Debug)]
pub struct Rendezvous<T> {
    state: Mutex<RendezvousState<T>>,
    notify: Notify,
}

impl<T> Rendezvous<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RendezvousState {
                enabled: false,
                pending: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Start accepting packets
    pub fn listen(&self) {
        self.state.lock().enabled = true;
    }

    /// Stop accepting packets and discard anything not yet consumed
    pub fn reject(&self) {
        {
            let mut state = self.state.lock();
            state.enabled = false;
            state.pending.clear();
        }
        self.notify.notify_waiters();
    }

    /// Check if the rendezvous is accepting packets
    pub fn is_listening(&self) -> bool {
        self.state.lock().enabled
    }

    /// Offer a packet
    ///
    /// # Returns
    /// `false` if nobody is listening and the packet was dropped
    pub fn produce(&self, item: T) -> bool {
        {
            let mut state = self.state.lock();
            if !state.enabled {
                return false;
            }
            state.pending.push_back(item);
        }
        self.notify.notify_waiters();
        true
    }

    /// Take the next packet, waiting until `deadline`
    ///
    /// # Errors
    /// - `NmxError::InvalidState` if not listening (or rejected while waiting)
    /// - `NmxError::Timeout` if the deadline passes first
    pub async fn consume(&self, deadline: Instant) -> NmxResult<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if !state.enabled {
                    return Err(NmxError::InvalidState(
                        "rendezvous is not listening".to_string(),
                    ));
                }
                if let Some(item) = state.pending.pop_front() {
                    return Ok(item);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(NmxError::Timeout("rendezvous consume".to_string()));
            }
        }
    }
}

impl<T> Default for Rendezvous<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_produce_without_listener_drops() {
        let rdv = Rendezvous::new();
        assert!(!rdv.produce(1u32));
        rdv.listen();
        assert!(rdv.produce(2u32));
    }

    #[tokio::test]
    async fn test_consume_waits_for_producer() {
        let rdv = Arc::new(Rendezvous::new());
        rdv.listen();

        let producer = rdv.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.produce(7u32);
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        assert_eq!(assert_ok!(rdv.consume(deadline).await), 7);
    }

    #[tokio::test]
    async fn test_consume_times_out() {
        let rdv: Rendezvous<u32> = Rendezvous::new();
        rdv.listen();
        let deadline = Instant::now() + Duration::from_millis(30);
        let err = assert_err!(rdv.consume(deadline).await);
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_reject_discards_pending_and_wakes_consumer() {
        let rdv = Arc::new(Rendezvous::new());
        rdv.listen();
        rdv.produce(1u32);
        rdv.reject();
        assert!(!rdv.is_listening());

        rdv.listen();
        let consumer = rdv.clone();
        let task = tokio::spawn(async move {
            consumer
                .consume(Instant::now() + Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        rdv.reject();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(NmxError::InvalidState(_))));
    }
}
