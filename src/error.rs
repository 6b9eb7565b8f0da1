//! Error types for tunnelctl

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum TunnelctlError {
    /// IO error
    Io(io::Error),
    /// Command execution failed
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },
    /// Configuration error
    ConfigError(String),
    /// Platform subsystem error
    PlatformError(String),
    /// Parse error
    ParseError(String),
    /// Already exists
    AlreadyExists(String),
    /// Not found
    NotFound(String),
    /// Invalid state
    InvalidState(String),
}

impl fmt::Display for TunnelctlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelctlError::Io(e) => write!(f, "IO error: {}", e),
            TunnelctlError::CommandFailed { cmd, code, stderr } => {
                if let Some(code) = code {
                    write!(f, "Command '{}' failed with code {}: {}", cmd, code, stderr)
                } else {
                    write!(f, "Command '{}' failed: {}", cmd, stderr)
                }
            }
            TunnelctlError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            TunnelctlError::PlatformError(msg) => write!(f, "Platform error: {}", msg),
            TunnelctlError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            TunnelctlError::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            TunnelctlError::NotFound(msg) => write!(f, "Not found: {}", msg),
            TunnelctlError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for TunnelctlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TunnelctlError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TunnelctlError {
    fn from(error: io::Error) -> Self {
        TunnelctlError::Io(error)
    }
}

impl From<serde_json::Error> for TunnelctlError {
    fn from(error: serde_json::Error) -> Self {
        TunnelctlError::ParseError(error.to_string())
    }
}

impl From<toml::de::Error> for TunnelctlError {
    fn from(error: toml::de::Error) -> Self {
        TunnelctlError::ConfigError(error.to_string())
    }
}

pub type TunnelctlResult<T> = Result<T, TunnelctlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = TunnelctlError::CommandFailed {
            cmd: "wg-quick up wg0".to_string(),
            code: Some(1),
            stderr: "no such device".to_string(),
        };
        assert_eq!(err.to_string(), "Command 'wg-quick up wg0' failed with code 1: no such device");

        let err = TunnelctlError::CommandFailed {
            cmd: "wg-quick".to_string(),
            code: None,
            stderr: "killed".to_string(),
        };
        assert_eq!(err.to_string(), "Command 'wg-quick' failed: killed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: TunnelctlError = io_err.into();
        assert!(matches!(err, TunnelctlError::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: TunnelctlError = serde_json::from_str::<serde_json::Value>("not json").unwrap_err().into();
        assert!(matches!(err, TunnelctlError::ParseError(_)));
    }
}
