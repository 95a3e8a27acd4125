//! Session abstraction
//!
//! A session is one logical management conversation with one device over
//! one transport. Upper layers only see this trait; whether bytes travel
//! over a wireless link or the discovery bus is hidden behind it.
//!
//! # Lifecycle
//! 1. **Build**: [`Transport::build_session`](crate::Transport::build_session)
//! 2. **Open**: establish or reuse the underlying link
//! 3. **Use**: [`Session::tx_request_once`] or the retrying [`tx_request`]
//! 4. **Close**: fail pending requests and tear the link down
//!
//! A closed session can be opened again.

use crate::config::TxOptions;
use async_trait::async_trait;
use nmx_core::{MgmtProto, NmpMessage, NmxResult};

#[async_trait]
pub trait Session: Send + Sync {
    /// Open the session
    ///
    /// # Errors
    /// `NmxError::AlreadyOpen` if the session is already open
    async fn open(&self) -> NmxResult<()>;

    /// Close the session
    ///
    /// Pending requests fail. Waits up to the configured close timeout for
    /// the transport to confirm teardown, then returns regardless.
    ///
    /// # Errors
    /// - `NmxError::Closed` if the session is not open
    /// - `NmxError::AlreadyClosing` if another close is in progress
    async fn close(&self) -> NmxResult<()>;

    fn is_open(&self) -> bool;

    /// Largest response body the session can receive
    fn mtu_in(&self) -> usize;

    /// Largest request body the session can send
    fn mtu_out(&self) -> usize;

    fn mgmt_proto(&self) -> MgmtProto;

    /// Send one request and wait for its response
    ///
    /// # Errors
    /// - `NmxError::Closed` if the session is not open
    /// - `NmxError::Busy` if the transport's responder slot is taken
    /// - `NmxError::Timeout` if no response arrives within `opts.timeout`
    async fn tx_request_once(&self, msg: &NmpMessage, opts: &TxOptions) -> NmxResult<NmpMessage>;

    /// Unblock the request waiting on `seq` with `NmxError::Aborted`
    fn abort_rx(&self, seq: u8) -> NmxResult<()>;
}

/// Send a request, retrying timed-out attempts up to `opts.tries` times
pub async fn tx_request(
    session: &dyn Session,
    msg: &NmpMessage,
    opts: &TxOptions,
) -> NmxResult<NmpMessage> {
    let tries = opts.tries.max(1);
    let mut attempt = 1;
    loop {
        match session.tx_request_once(msg, opts).await {
            Err(e) if e.is_timeout() && attempt < tries => {
                log::debug!(
                    "Request seq={} timed out (attempt {}/{}), retrying",
                    msg.seq(),
                    attempt,
                    tries
                );
                attempt += 1;
            }
            result => return result,
        }
    }
}
