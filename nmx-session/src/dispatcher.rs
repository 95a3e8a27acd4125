//! Response dispatcher: correlates incoming responses with waiting listeners

use crate::config::MsgFilter;
use crate::listener::Listener;
use bytes::BytesMut;
use nmx_core::{NmpHeader, NmpMessage, NmxError, NmxResult, NMP_HDR_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Upper bound on buffered partial response bytes
const MAX_REASSEMBLY_SIZE: usize = 64 * 1024;

/// Dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStatistics {
    /// Responses handed to a waiting listener
    pub responses_delivered: u64,
    /// Responses nobody was waiting for (late or unsolicited)
    pub unsolicited: u64,
    /// Responses dropped by the rx filter
    pub filtered: u64,
    /// Inbound bytes that could not be decoded
    pub decode_errors: u64,
    /// Synthetic errors injected through abort, close or disconnect
    pub errors_injected: u64,
}

impl DispatchStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Per-session registry of outstanding requests keyed by sequence number
///
/// Inbound bytes may arrive whole (discovery bus) or fragmented across
/// several link notifications; [`dispatch`] buffers until a complete
/// message is available.
///
/// [`dispatch`]: Dispatcher::dispatch
pub struct Dispatcher {
    listeners: Mutex<HashMap<u8, Arc<Listener>>>,
    reassembly: Mutex<BytesMut>,
    rx_filter: Option<MsgFilter>,
    stats: Mutex<DispatchStatistics>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("listeners", &self.listener_count())
            .field("rx_filter", &self.rx_filter.is_some())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_rx_filter(None)
    }

    /// Create a dispatcher that drops responses rejected by `rx_filter`
    pub fn with_rx_filter(rx_filter: Option<MsgFilter>) -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            reassembly: Mutex::new(BytesMut::new()),
            rx_filter,
            stats: Mutex::new(DispatchStatistics::new()),
        }
    }

    /// Register `listener` under `seq`
    ///
    /// # Errors
    /// `NmxError::DuplicateSequence` if `seq` already has a listener
    pub fn add_listener(&self, seq: u8, listener: Arc<Listener>) -> NmxResult<()> {
        let mut listeners = self.listeners.lock();
        if listeners.contains_key(&seq) {
            return Err(NmxError::DuplicateSequence(seq));
        }
        listeners.insert(seq, listener);
        Ok(())
    }

    /// Remove and return the listener for `seq`
    pub fn remove_listener(&self, seq: u8) -> Option<Arc<Listener>> {
        self.listeners.lock().remove(&seq)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Feed inbound bytes
    ///
    /// # Returns
    /// Number of responses delivered to a listener
    pub fn dispatch(&self, data: &[u8]) -> usize {
        let frames = {
            let mut buf = self.reassembly.lock();
            if buf.len() + data.len() > MAX_REASSEMBLY_SIZE {
                log::warn!(
                    "Dropping {} buffered response bytes: reassembly limit exceeded",
                    buf.len() + data.len()
                );
                buf.clear();
                self.stats.lock().decode_errors += 1;
                return 0;
            }
            buf.extend_from_slice(data);

            let mut frames = Vec::new();
            while buf.len() >= NMP_HDR_SIZE {
                let hdr = match NmpHeader::decode(&buf[..NMP_HDR_SIZE]) {
                    Ok(hdr) => hdr,
                    Err(e) => {
                        log::warn!("Discarding undecodable response bytes: {}", e);
                        buf.clear();
                        self.stats.lock().decode_errors += 1;
                        break;
                    }
                };
                if buf.len() < hdr.frame_len() {
                    break;
                }
                frames.push(buf.split_to(hdr.frame_len()).freeze());
            }
            frames
        };

        let mut delivered = 0;
        for frame in frames {
            match NmpMessage::decode(&frame) {
                Ok(msg) => {
                    if self.dispatch_message(msg) {
                        delivered += 1;
                    }
                }
                Err(e) => {
                    log::warn!("Discarding malformed response: {}", e);
                    self.stats.lock().decode_errors += 1;
                }
            }
        }
        delivered
    }

    fn dispatch_message(&self, msg: NmpMessage) -> bool {
        if let Some(filter) = &self.rx_filter {
            if !filter(&msg) {
                log::debug!("Rx filter dropped response seq={}", msg.seq());
                self.stats.lock().filtered += 1;
                return false;
            }
        }

        let seq = msg.seq();
        let listener = if msg.hdr.op.is_response() {
            self.listeners.lock().get(&seq).cloned()
        } else {
            None
        };

        let delivered = match listener {
            Some(listener) => listener.deliver(msg),
            None => false,
        };

        if delivered {
            self.stats.lock().responses_delivered += 1;
        } else {
            log::debug!("Dropping unsolicited response seq={}", seq);
            self.stats.lock().unsolicited += 1;
        }
        delivered
    }

    /// Deliver a synthetic error to the listener for `seq`
    ///
    /// # Errors
    /// `NmxError::NoListener` if nothing is registered under `seq`
    pub fn fake_rx_error(&self, seq: u8, err: NmxError) -> NmxResult<()> {
        let listener = self
            .listeners
            .lock()
            .get(&seq)
            .cloned()
            .ok_or(NmxError::NoListener(seq))?;

        if listener.fail(err) {
            self.stats.lock().errors_injected += 1;
        }
        Ok(())
    }

    /// Deliver `err` to every registered listener
    ///
    /// # Returns
    /// Number of listeners that were still unresolved
    pub fn error_all(&self, err: NmxError) -> usize {
        let listeners: Vec<Arc<Listener>> = self.listeners.lock().values().cloned().collect();

        let failed = listeners
            .iter()
            .filter(|listener| listener.fail(err.clone()))
            .count();
        self.stats.lock().errors_injected += failed as u64;
        failed
    }

    /// Forget any partially received response
    pub fn reset_reassembly(&self) {
        self.reassembly.lock().clear();
    }

    pub fn statistics(&self) -> DispatchStatistics {
        self.stats.lock().clone()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nmx_core::NmpOp;
    use std::time::Duration;

    fn encoded_rsp(seq: u8, body: &[u8]) -> bytes::Bytes {
        NmpMessage::new(NmpHeader::new(NmpOp::ReadRsp, 0, 0, seq), body.to_vec())
            .encode()
            .unwrap()
    }

    #[test]
    fn test_duplicate_sequence_rejected() {
        let dispatcher = Dispatcher::new();
        let (first, _w1) = Listener::new(3);
        let (second, _w2) = Listener::new(3);

        dispatcher.add_listener(3, first).unwrap();
        assert!(matches!(
            dispatcher.add_listener(3, second),
            Err(NmxError::DuplicateSequence(3))
        ));
        assert!(dispatcher.remove_listener(3).is_some());
        assert!(dispatcher.remove_listener(3).is_none());
    }

    #[tokio::test]
    async fn test_dispatch_wakes_matching_listener() {
        let dispatcher = Dispatcher::new();
        let (listener, wait) = Listener::new(11);
        dispatcher.add_listener(11, listener).unwrap();

        assert_eq!(dispatcher.dispatch(&encoded_rsp(11, b"ok")), 1);
        let rsp = wait.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&rsp.body[..], b"ok");
        assert_eq!(dispatcher.statistics().responses_delivered, 1);
    }

    #[tokio::test]
    async fn test_fragments_reassembled() {
        let dispatcher = Dispatcher::new();
        let (listener, wait) = Listener::new(2);
        dispatcher.add_listener(2, listener).unwrap();

        let raw = encoded_rsp(2, &[7u8; 40]);
        assert_eq!(dispatcher.dispatch(&raw[..5]), 0);
        assert_eq!(dispatcher.dispatch(&raw[5..30]), 0);
        assert_eq!(dispatcher.dispatch(&raw[30..]), 1);

        let rsp = wait.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(rsp.body.len(), 40);
    }

    #[test]
    fn test_unsolicited_response_counted() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.dispatch(&encoded_rsp(99, b"late")), 0);
        assert_eq!(dispatcher.statistics().unsolicited, 1);
    }

    #[test]
    fn test_rx_filter_drops() {
        let filter: MsgFilter = Arc::new(|msg: &NmpMessage| msg.body.is_empty());
        let dispatcher = Dispatcher::with_rx_filter(Some(filter));
        let (listener, _wait) = Listener::new(1);
        dispatcher.add_listener(1, listener.clone()).unwrap();

        assert_eq!(dispatcher.dispatch(&encoded_rsp(1, b"nope")), 0);
        assert!(!listener.is_resolved());
        assert_eq!(dispatcher.statistics().filtered, 1);
    }

    #[tokio::test]
    async fn test_fake_rx_error_targets_one_listener() {
        let dispatcher = Dispatcher::new();
        let (a, wait_a) = Listener::new(1);
        let (b, _wait_b) = Listener::new(2);
        dispatcher.add_listener(1, a).unwrap();
        dispatcher.add_listener(2, b.clone()).unwrap();

        dispatcher.fake_rx_error(1, NmxError::Aborted).unwrap();
        assert!(matches!(
            wait_a.wait(Duration::from_secs(1)).await,
            Err(NmxError::Aborted)
        ));
        assert!(!b.is_resolved());
        assert!(matches!(
            dispatcher.fake_rx_error(42, NmxError::Aborted),
            Err(NmxError::NoListener(42))
        ));
    }

    #[test]
    fn test_error_all_resolves_each_once() {
        let dispatcher = Dispatcher::new();
        for seq in 0..3 {
            let (listener, _wait) = Listener::new(seq);
            dispatcher.add_listener(seq, listener).unwrap();
        }
        let err = NmxError::Disconnected("gone".into());
        assert_eq!(dispatcher.error_all(err.clone()), 3);
        assert_eq!(dispatcher.error_all(err), 0);
    }

    #[test]
    fn test_garbage_header_resets_buffer() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.dispatch(&[0xff; NMP_HDR_SIZE]), 0);
        assert_eq!(dispatcher.statistics().decode_errors, 1);
        assert_eq!(dispatcher.dispatch(&encoded_rsp(1, b"")), 0);
        assert_eq!(dispatcher.statistics().unsolicited, 1);
    }
}
