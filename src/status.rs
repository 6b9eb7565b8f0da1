//! Tunnel connection status
//!
//! Mirrors the status values reported by the platform VPN subsystem. The
//! numeric codes follow the platform's own numbering so they can be passed
//! across process boundaries unchanged.

use crate::error::{TunnelctlError, TunnelctlResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of the platform-managed tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum TunnelStatus {
    /// No usable tunnel configuration exists
    Invalid = 0,
    /// Tunnel is down
    #[default]
    Disconnected = 1,
    /// Tunnel is being established
    Connecting = 2,
    /// Tunnel is up
    Connected = 3,
    /// Network path changed, tunnel re-validating without teardown
    Reasserting = 4,
    /// Tunnel is being torn down
    Disconnecting = 5,
}

impl TunnelStatus {
    /// All status values, in code order
    pub const ALL: [TunnelStatus; 6] = [
        TunnelStatus::Invalid,
        TunnelStatus::Disconnected,
        TunnelStatus::Connecting,
        TunnelStatus::Connected,
        TunnelStatus::Reasserting,
        TunnelStatus::Disconnecting,
    ];

    /// Numeric status code
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Look up a status by its numeric code
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Lowercase name, as used in config files and CLI output
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelStatus::Invalid => "invalid",
            TunnelStatus::Disconnected => "disconnected",
            TunnelStatus::Connecting => "connecting",
            TunnelStatus::Connected => "connected",
            TunnelStatus::Reasserting => "reasserting",
            TunnelStatus::Disconnecting => "disconnecting",
        }
    }

    /// Whether a tunnel is up or on its way up
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TunnelStatus::Connecting | TunnelStatus::Connected | TunnelStatus::Reasserting
        )
    }

    /// Whether a start request would begin a new tunnel from this state
    pub fn accepts_start(self) -> bool {
        matches!(self, TunnelStatus::Disconnected | TunnelStatus::Invalid)
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelStatus {
    type Err = TunnelctlError;

    fn from_str(s: &str) -> TunnelctlResult<Self> {
        let lower = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == lower)
            .ok_or_else(|| TunnelctlError::ParseError(format!("Unknown tunnel status: {}", s)))
    }
}

impl From<TunnelStatus> for u32 {
    fn from(status: TunnelStatus) -> u32 {
        status as u32
    }
}
