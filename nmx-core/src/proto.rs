//! Management protocol selector

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes of CoAP/OMP framing wrapped around each management message
pub const OMP_MSG_OVERHEAD: usize = 13;

/// Management protocol spoken by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MgmtProto {
    /// Plain newtmgr protocol: 8-byte header followed by the body
    #[default]
    Nmp,
    /// NMP carried inside CoAP
    Omp,
}

impl MgmtProto {
    pub fn as_str(&self) -> &'static str {
        match self {
            MgmtProto::Nmp => "nmp",
            MgmtProto::Omp => "omp",
        }
    }
}

impl fmt::Display for MgmtProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
