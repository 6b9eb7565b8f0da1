//! tunnelctl - VPN Tunnel Adapter Library
//!
//! Process-wide adapter in front of a platform VPN subsystem:
//! - Tunnel status mirrored from platform events
//! - Payload-free status change notifications
//! - Display name / server address configuration
//! - Fire-and-forget start and stop requests
//!
//! Platform drivers: a simulated in-memory platform and a command-driven
//! platform that runs external up/down commands.

pub mod error;
pub mod status;
pub mod notification;
pub mod platform;
pub mod config;
pub mod adapter;

// Re-export commonly used types
pub use error::{TunnelctlError, TunnelctlResult};
pub use status::TunnelStatus;
pub use notification::{Notification, NotificationCenter, ObserverId, STATUS_CHANGED};
pub use platform::{
    CommandPlatform, PlatformTunnel, SimulatedPlatform, StatusEvent, TunnelOptions, TunnelProfile,
};
pub use config::{TunnelctlConfig, PlatformKind};
pub use adapter::TunnelAdapter;
