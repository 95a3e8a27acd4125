//! Close hand-off between `close()` and the disconnect path

use nmx_core::{NmxError, NmxResult};
use tokio::sync::oneshot;

/// Single-owner close rendezvous
///
/// `close()` claims the state with [`begin`](CloseState::begin) and waits on
/// the returned receiver; the disconnect path wakes it with
/// [`signal`](CloseState::signal). Only one close may own it at a time.
#[derive(Debug, Default)]
pub enum CloseState {
    #[default]
    NotClosing,
    Waiting(Option<oneshot::Sender<NmxError>>),
    Closed,
}

impl CloseState {
    /// Claim the close
    ///
    /// # Errors
    /// `NmxError::AlreadyClosing` if another close owns it
    pub fn begin(&mut self) -> NmxResult<oneshot::Receiver<NmxError>> {
        if self.is_waiting() {
            return Err(NmxError::AlreadyClosing);
        }
        let (tx, rx) = oneshot::channel();
        *self = CloseState::Waiting(Some(tx));
        Ok(rx)
    }

    /// Wake the waiting close, if any
    ///
    /// # Returns
    /// `true` if a close was woken
    pub fn signal(&mut self, reason: NmxError) -> bool {
        match self {
            CloseState::Waiting(slot) => match slot.take() {
                Some(tx) => tx.send(reason).is_ok(),
                None => false,
            },
            _ => false,
        }
    }

    /// Release ownership after the close finished
    pub fn finish(&mut self) {
        *self = CloseState::Closed;
    }

    /// Forget a finished close so the session can be reopened
    pub fn reset(&mut self) {
        if !self.is_waiting() {
            *self = CloseState::NotClosing;
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, CloseState::Waiting(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_owner() {
        let mut state = CloseState::default();
        let rx = state.begin().unwrap();
        assert!(matches!(state.begin(), Err(NmxError::AlreadyClosing)));

        assert!(state.signal(NmxError::Disconnected("bye".into())));
        assert!(!state.signal(NmxError::Aborted));
        assert!(matches!(rx.await, Ok(NmxError::Disconnected(_))));

        state.finish();
        assert!(!state.is_waiting());
        assert!(state.begin().is_ok());
    }

    #[test]
    fn test_signal_without_close() {
        let mut state = CloseState::default();
        assert!(!state.signal(NmxError::Aborted));
        state.reset();
        assert!(matches!(state, CloseState::NotClosing));
    }
}
