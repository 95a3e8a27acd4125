//! Request/response transceiver
//!
//! Encodes a request, registers a listener for its sequence number, hands
//! the bytes to the transport and waits for the outcome. The listener is
//! always registered before the first byte leaves, so a response that races
//! back through an asynchronous delivery path still finds it.

use crate::config::{MsgFilter, SessionConfig};
use crate::dispatcher::Dispatcher;
use crate::listener::Listener;
use bytes::Bytes;
use nmx_core::{MgmtProto, NmpMessage, NmxError, NmxResult, NMP_HDR_SIZE};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Removes the listener on every exit path of a request
struct Registration<'a> {
    dispatcher: &'a Dispatcher,
    seq: u8,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.dispatcher.remove_listener(self.seq);
    }
}

/// Per-session request engine
pub struct Transceiver {
    fragmenting: bool,
    tx_filter: Option<MsgFilter>,
    dispatcher: Dispatcher,
}

impl fmt::Debug for Transceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transceiver")
            .field("fragmenting", &self.fragmenting)
            .field("tx_filter", &self.tx_filter.is_some())
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl Transceiver {
    /// Create a transceiver for `cfg`
    ///
    /// `fragmenting` selects link-style transmission where an encoded request
    /// larger than one write is split across several; otherwise an oversized
    /// request is refused.
    ///
    /// # Errors
    /// `NmxError::InvalidConfig` for any protocol other than plain NMP
    pub fn new(cfg: &SessionConfig, fragmenting: bool) -> NmxResult<Self> {
        if cfg.mgmt_proto != MgmtProto::Nmp {
            return Err(NmxError::InvalidConfig(format!(
                "Invalid operation for {}",
                cfg.mgmt_proto
            )));
        }

        Ok(Self {
            fragmenting,
            tx_filter: cfg.tx_filter.clone(),
            dispatcher: Dispatcher::with_rx_filter(cfg.rx_filter.clone()),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Send `msg` through `tx_fn` and wait up to `timeout` for its response
    ///
    /// # Arguments
    /// * `tx_fn` - Transmits one unit of encoded bytes
    /// * `msg` - Request; its sequence number keys the listener
    /// * `mtu` - Largest body a single transmission unit can carry
    /// * `timeout` - Response deadline, measured from the start of transmission
    ///
    /// # Errors
    /// - `NmxError::Filtered` if the tx filter rejects the request
    /// - `NmxError::EncodingTooLarge` if the body cannot fit and fragmenting is off
    /// - `NmxError::DuplicateSequence` if the sequence number is already in flight
    /// - `NmxError::Timeout` if nothing arrives in time
    /// - any error from `tx_fn` or injected into the listener
    ///
    /// A response, abort or injected error settles the request even while
    /// `tx_fn` is still pending; the unfinished transmission is dropped.
    pub async fn tx_request<F, Fut>(
        &self,
        mut tx_fn: F,
        msg: &NmpMessage,
        mtu: usize,
        timeout: Duration,
    ) -> NmxResult<NmpMessage>
    where
        F: FnMut(Bytes) -> Fut,
        Fut: Future<Output = NmxResult<()>>,
    {
        if let Some(filter) = &self.tx_filter {
            if !filter(msg) {
                return Err(NmxError::Filtered(format!(
                    "request seq={} rejected by tx filter",
                    msg.seq()
                )));
            }
        }

        let encoded = msg.encode()?;
        let units = if self.fragmenting {
            fragment(&encoded, mtu + NMP_HDR_SIZE)
        } else {
            if msg.body.len() > mtu {
                return Err(NmxError::EncodingTooLarge {
                    size: msg.body.len(),
                    mtu,
                });
            }
            vec![encoded]
        };

        let deadline = Instant::now() + timeout;
        let seq = msg.seq();
        let (listener, wait) = Listener::new(seq);
        self.dispatcher.add_listener(seq, listener)?;
        let _registration = Registration {
            dispatcher: &self.dispatcher,
            seq,
        };

        log::debug!(
            "Tx NMP request seq={} op={:?} group={} id={} ({} bytes in {} unit(s))",
            seq,
            msg.hdr.op,
            msg.hdr.group,
            msg.hdr.id,
            msg.body.len() + NMP_HDR_SIZE,
            units.len()
        );
        let send = async {
            for unit in units {
                tx_fn(unit).await?;
            }
            Ok::<(), NmxError>(())
        };
        let outcome = wait.wait_until(deadline);
        tokio::pin!(send, outcome);

        // A transport may hold the send open while it polls for the reply,
        // so the outcome races transmission rather than following it.
        tokio::select! {
            biased;
            result = &mut outcome => result,
            sent = &mut send => {
                sent?;
                outcome.await
            }
        }
    }

    /// Feed bytes received from the transport
    pub fn on_rx(&self, data: &[u8]) {
        self.dispatcher.dispatch(data);
    }

    /// Fail every outstanding request with `err`
    pub fn error_all(&self, err: NmxError) -> usize {
        self.dispatcher.error_all(err)
    }

    /// Unblock the request waiting on `seq`
    pub fn abort_rx(&self, seq: u8) -> NmxResult<()> {
        self.dispatcher.fake_rx_error(seq, NmxError::Aborted)
    }

    pub fn pending(&self) -> usize {
        self.dispatcher.listener_count()
    }
}

fn fragment(encoded: &Bytes, unit: usize) -> Vec<Bytes> {
    (0..encoded.len())
        .step_by(unit)
        .map(|start| encoded.slice(start..(start + unit).min(encoded.len())))
        .collect()
}
