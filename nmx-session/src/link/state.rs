//! Link connection state

use nmx_core::{NmxError, NmxResult};
use std::fmt;

/// Link connection state
///
/// # State Transitions
/// ```text
/// Idle -> Connecting (on start())
/// Connecting -> Connected (after discovery and subscription)
/// Connecting -> Idle (on connect or discovery failure)
/// Connected -> Disconnecting (on stop())
/// Connected -> Idle (peer dropped the link)
/// Disconnecting -> Idle (link teardown reported)
/// ```
///
/// There is no direct `Idle -> Connected` edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No link (initial state)
    #[default]
    Idle,
    /// Connecting and discovering the management characteristic
    Connecting,
    /// Link up and subscribed; requests can be written
    Connected,
    /// Teardown requested, waiting for the link to report it
    Disconnecting,
}

impl LinkState {
    /// Check if requests can be written
    pub fn is_ready(&self) -> bool {
        matches!(self, LinkState::Connected)
    }

    /// Validate state transition
    ///
    /// # Arguments
    /// * `new_state` - The target state
    ///
    /// # Returns
    /// `Ok(())` if transition is valid, `Err` otherwise
    pub fn validate_transition(&self, new_state: LinkState) -> NmxResult<()> {
        let valid = matches!(
            (*self, new_state),
            (LinkState::Idle, LinkState::Connecting)
                | (LinkState::Connecting, LinkState::Connected)
                | (LinkState::Connecting, LinkState::Idle)
                | (LinkState::Connected, LinkState::Disconnecting)
                | (LinkState::Connected, LinkState::Idle)
                | (LinkState::Disconnecting, LinkState::Idle)
        );

        if valid {
            Ok(())
        } else {
            Err(NmxError::InvalidState(format!(
                "Invalid link state transition: {} -> {}",
                self, new_state
            )))
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "Idle",
            LinkState::Connecting => "Connecting",
            LinkState::Connected => "Connected",
            LinkState::Disconnecting => "Disconnecting",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
