//! Platform VPN subsystem interface
//!
//! The adapter never creates tunnels itself. It talks to a platform
//! subsystem through the [`PlatformTunnel`] trait:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │     TunnelAdapter (status relay)    │
//! └──────────────┬──────────────────────┘
//!                │  start / stop / profile
//!                ▼          ▲ StatusEvent stream
//!        ┌───────────────────────┐
//!        │    PlatformTunnel     │
//!        └───────┬───────┬───────┘
//!                │       │
//!          ┌─────▼──┐ ┌──▼──────┐
//!          │Command │ │Simulated│  <- Platform drivers
//!          └────────┘ └─────────┘
//! ```
//!
//! The platform owns the tunnel and its state machine. It reports every
//! transition on its event stream and answers the current status
//! synchronously.

pub mod command;
pub mod simulated;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::broadcast;

use crate::error::TunnelctlResult;
use crate::status::TunnelStatus;

pub use command::CommandPlatform;
pub use simulated::SimulatedPlatform;

/// Caller-supplied options forwarded verbatim to the platform at start
pub type TunnelOptions = HashMap<String, Value>;

/// Tunnel configuration stored on the platform side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelProfile {
    /// Profile identifier, assigned when the profile is first created
    pub id: String,
    /// Name shown by the system for this tunnel
    pub description: String,
    /// Server the tunnel connects to
    pub server_address: String,
    /// Whether the profile is enabled
    pub enabled: bool,
    /// Whether the system may bring the tunnel up on demand
    pub on_demand: bool,
}

impl TunnelProfile {
    /// Create a new, enabled profile with a fresh identifier
    pub fn new(description: &str, server_address: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.to_string(),
            server_address: server_address.to_string(),
            enabled: true,
            on_demand: true,
        }
    }
}

/// Status change reported by the platform
///
/// Consumers treat this as a wake-up and re-query [`PlatformTunnel::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    /// Status at the time the event was emitted
    pub status: TunnelStatus,
    /// When the transition happened
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn now(status: TunnelStatus) -> Self {
        Self { status, at: Utc::now() }
    }
}

/// Interface to the platform-managed tunnel
#[async_trait]
pub trait PlatformTunnel: Send + Sync {
    /// Name of this platform driver (e.g., "simulated", "command")
    fn name(&self) -> &str;

    /// Load the stored tunnel profile, if one exists
    async fn load_profile(&self) -> TunnelctlResult<Option<TunnelProfile>>;

    /// Store the tunnel profile used by the next start
    async fn save_profile(&self, profile: &TunnelProfile) -> TunnelctlResult<()>;

    /// Ask the platform to bring the tunnel up.
    /// Returns once the request is accepted; progress arrives as events.
    async fn start_tunnel(&self, options: Option<&TunnelOptions>) -> TunnelctlResult<()>;

    /// Ask the platform to tear the tunnel down
    async fn stop_tunnel(&self) -> TunnelctlResult<()>;

    /// Current tunnel status
    fn status(&self) -> TunnelStatus;

    /// Subscribe to status change events
    fn subscribe(&self) -> broadcast::Receiver<StatusEvent>;
}
