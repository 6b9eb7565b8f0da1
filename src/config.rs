//! Configuration management for tunnelctl

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use crate::error::{TunnelctlError, TunnelctlResult};
use crate::notification;
use crate::platform::{CommandPlatform, PlatformTunnel, SimulatedPlatform};

/// Default value for both the display name and the server address
pub const DEFAULT_PROFILE_VALUE: &str = "MyVPN";

/// Main tunnelctl configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelctlConfig {
    /// Tunnel profile defaults
    #[serde(default)]
    pub profile: ProfileSettings,
    /// Platform driver selection
    #[serde(default)]
    pub platform: PlatformSettings,
    /// Notification delivery
    #[serde(default)]
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSettings {
    /// Name the system shows for the tunnel
    #[serde(default = "default_profile_value")]
    pub display_name: String,
    /// Server the tunnel connects to
    #[serde(default = "default_profile_value")]
    pub server_address: String,
    /// Let the system bring the tunnel up on demand
    #[serde(default = "default_on_demand")]
    pub on_demand: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// In-memory platform with timed transitions
    #[default]
    Simulated,
    /// External up/down commands
    Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformSettings {
    /// Which platform driver to use
    #[serde(default)]
    pub kind: PlatformKind,
    /// Command line that brings the tunnel up (command platform)
    #[serde(default)]
    pub up: Vec<String>,
    /// Command line that tears the tunnel down (command platform)
    #[serde(default)]
    pub down: Vec<String>,
    /// Where the command platform records its profile and status
    /// (defaults to [`TunnelctlConfig::default_state_path`])
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    /// Delay between simulated transitions, in milliseconds
    #[serde(default = "default_transition_delay_ms")]
    pub transition_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Broadcast buffer size for notification subscribers
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_profile_value() -> String {
    DEFAULT_PROFILE_VALUE.to_string()
}

fn default_on_demand() -> bool {
    true
}

fn default_transition_delay_ms() -> u64 {
    250
}

fn default_capacity() -> usize {
    notification::DEFAULT_CAPACITY
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            display_name: default_profile_value(),
            server_address: default_profile_value(),
            on_demand: default_on_demand(),
        }
    }
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            kind: PlatformKind::default(),
            up: Vec::new(),
            down: Vec::new(),
            state_file: None,
            transition_delay_ms: default_transition_delay_ms(),
        }
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

impl TunnelctlConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> TunnelctlResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TunnelctlError::ConfigError(format!("Failed to read config: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| TunnelctlError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> TunnelctlResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> TunnelctlResult<()> {
        let content = self.to_toml()?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| TunnelctlError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> TunnelctlResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TunnelctlError::ConfigError(format!("Failed to serialize config: {}", e)))
    }

    /// Check settings that serde cannot
    pub fn validate(&self) -> TunnelctlResult<()> {
        if self.notifications.capacity == 0 {
            return Err(TunnelctlError::ConfigError(
                "notifications.capacity must be greater than zero".to_string(),
            ));
        }
        if self.platform.kind == PlatformKind::Command
            && (self.platform.up.is_empty() || self.platform.down.is_empty())
        {
            return Err(TunnelctlError::ConfigError(
                "command platform requires both 'up' and 'down' commands".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the platform driver selected by this configuration
    pub fn build_platform(&self) -> TunnelctlResult<Arc<dyn PlatformTunnel>> {
        match self.platform.kind {
            PlatformKind::Simulated => {
                let delay = std::time::Duration::from_millis(self.platform.transition_delay_ms);
                Ok(Arc::new(SimulatedPlatform::new().with_auto_transitions(delay)))
            }
            PlatformKind::Command => {
                let up = self.platform.up.clone();
                let down = self.platform.down.clone();
                let platform = match self.platform.state_file.clone().or_else(Self::default_state_path) {
                    Some(path) => CommandPlatform::with_state_file(up, down, path)?,
                    None => CommandPlatform::new(up, down)?,
                };
                Ok(Arc::new(platform))
            }
        }
    }

    /// Default command platform state file:
    /// `$XDG_RUNTIME_DIR/tunnelctl/state.json`, else under
    /// `$XDG_STATE_HOME` or `~/.local/state`
    pub fn default_state_path() -> Option<PathBuf> {
        std::env::var_os("XDG_RUNTIME_DIR")
            .or_else(|| std::env::var_os("XDG_STATE_HOME"))
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state")))
            .map(|dir| dir.join("tunnelctl").join("state.json"))
    }

    /// Default config file location: `$XDG_CONFIG_HOME/tunnelctl/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
            .map(|dir| dir.join("tunnelctl").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TunnelctlConfig::default();
        assert_eq!(config.profile.display_name, "MyVPN");
        assert_eq!(config.profile.server_address, "MyVPN");
        assert!(config.profile.on_demand);
        assert_eq!(config.platform.kind, PlatformKind::Simulated);
        assert_eq!(config.notifications.capacity, notification::DEFAULT_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: TunnelctlConfig = toml::from_str(
            r#"
            [profile]
            server_address = "vpn.example.net"
            "#,
        )
        .unwrap();
        assert_eq!(config.profile.display_name, "MyVPN");
        assert_eq!(config.profile.server_address, "vpn.example.net");
        assert_eq!(config.platform.transition_delay_ms, 250);
    }

    #[test]
    fn test_command_platform_requires_commands() {
        let mut config: TunnelctlConfig = toml::from_str(
            r#"
            [platform]
            kind = "command"
            up = ["wg-quick", "up", "wg0"]
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());

        config.platform.down = vec!["wg-quick".into(), "down".into(), "wg0".into()];
        assert!(config.validate().is_ok());

        let dir = tempfile::TempDir::new().unwrap();
        config.platform.state_file = Some(dir.path().join("state.json"));
        let platform = config.build_platform().unwrap();
        assert_eq!(platform.name(), "command");
        assert_eq!(platform.status(), crate::status::TunnelStatus::Invalid);
    }

    #[test]
    fn test_state_file_setting() {
        let config: TunnelctlConfig = toml::from_str(
            r#"
            [platform]
            kind = "command"
            up = ["true"]
            down = ["true"]
            state_file = "/run/user/1000/tunnelctl/state.json"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.platform.state_file,
            Some(PathBuf::from("/run/user/1000/tunnelctl/state.json"))
        );
        assert!(config.to_toml().unwrap().contains("state_file"));
        assert!(!TunnelctlConfig::default().to_toml().unwrap().contains("state_file"));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = TunnelctlConfig::default();
        config.notifications.capacity = 0;
        assert!(matches!(config.validate(), Err(TunnelctlError::ConfigError(_))));
    }
}
