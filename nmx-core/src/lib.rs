//! Core types for the nmx device management stack
//!
//! This crate provides the error taxonomy shared by every layer, the
//! management protocol (NMP) header and message codec, and the protocol
//! selector used by session configuration.

pub mod error;
pub mod nmp;
pub mod proto;

pub use error::{NmxError, NmxResult};
pub use nmp::{NmpHeader, NmpMessage, NmpOp, SeqGenerator, NMP_HDR_SIZE};
pub use proto::{MgmtProto, OMP_MSG_OVERHEAD};
