//! Command-driven platform driver
//!
//! Brings the tunnel up and down by running external commands, for example
//! `wg-quick up wg0` / `wg-quick down wg0`. The profile and per-start options
//! are handed to the commands through environment variables:
//!
//! - `TUNNELCTL_NAME`: profile description
//! - `TUNNELCTL_SERVER`: server address
//! - `TUNNELCTL_OPTIONS`: every option as one JSON object
//! - `TUNNELCTL_OPT_<KEY>`: one per option, key uppercased with non
//!   alphanumerics turned into `_`
//!
//! With a state file the profile and the last settled status survive the
//! process, so a later process can stop a tunnel an earlier one started.
//!
//! A stop while the up command is still running kills it before the down
//! command runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{PlatformTunnel, StatusEvent, TunnelOptions, TunnelProfile};
use crate::error::{TunnelctlError, TunnelctlResult};
use crate::status::TunnelStatus;

const EVENT_CAPACITY: usize = 64;

/// What the state file holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SavedState {
    status: TunnelStatus,
    profile: Option<TunnelProfile>,
}

impl SavedState {
    fn empty() -> Self {
        Self {
            status: TunnelStatus::Invalid,
            profile: None,
        }
    }
}

#[derive(Debug)]
struct CommandState {
    status: TunnelStatus,
    profile: Option<TunnelProfile>,
    generation: u64,
    /// Task running the up command of the current start
    up_task: Option<JoinHandle<()>>,
}

struct Inner {
    up: Vec<String>,
    down: Vec<String>,
    state_file: Option<PathBuf>,
    state: Mutex<CommandState>,
    event_tx: broadcast::Sender<StatusEvent>,
}

/// Platform driver that shells out to configured up/down commands
#[derive(Clone)]
pub struct CommandPlatform {
    inner: Arc<Inner>,
}

impl CommandPlatform {
    /// Create a command platform that keeps its state in memory.
    /// Both command lines must be non-empty.
    pub fn new(up: Vec<String>, down: Vec<String>) -> TunnelctlResult<Self> {
        Self::build(up, down, None, SavedState::empty())
    }

    /// Create a command platform that restores and records its profile and
    /// settled status in `path`. A missing file means no profile yet.
    pub fn with_state_file(up: Vec<String>, down: Vec<String>, path: impl Into<PathBuf>) -> TunnelctlResult<Self> {
        let path = path.into();
        let saved = read_state(&path)?;
        debug!("Restored tunnel state {} from {}", saved.status, path.display());
        Self::build(up, down, Some(path), saved)
    }

    fn build(
        up: Vec<String>,
        down: Vec<String>,
        state_file: Option<PathBuf>,
        saved: SavedState,
    ) -> TunnelctlResult<Self> {
        if up.is_empty() {
            return Err(TunnelctlError::ConfigError("Missing 'up' command".to_string()));
        }
        if down.is_empty() {
            return Err(TunnelctlError::ConfigError("Missing 'down' command".to_string()));
        }

        let status = if saved.profile.is_some() {
            saved.status
        } else {
            TunnelStatus::Invalid
        };

        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                up,
                down,
                state_file,
                state: Mutex::new(CommandState {
                    status,
                    profile: saved.profile,
                    generation: 0,
                    up_task: None,
                }),
                event_tx,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CommandState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the status and emit the event, with the state lock held
    fn set_status(&self, state: &mut CommandState, status: TunnelStatus) {
        state.status = status;
        debug!("Command platform reports {}", status);
        if !matches!(
            status,
            TunnelStatus::Connecting | TunnelStatus::Reasserting | TunnelStatus::Disconnecting
        ) {
            self.persist(state);
        }
        let _ = self.inner.event_tx.send(StatusEvent::now(status));
    }

    /// Report `status` only if no newer request superseded `generation`
    fn report_if_current(&self, generation: u64, status: TunnelStatus) {
        let mut state = self.lock();
        if state.generation == generation {
            self.set_status(&mut state, status);
        } else {
            debug!("Dropping superseded transition to {}", status);
        }
    }

    fn next_generation(state: &mut CommandState) -> u64 {
        state.generation += 1;
        state.generation
    }

    fn persist(&self, state: &CommandState) {
        let Some(path) = &self.inner.state_file else {
            return;
        };
        let saved = SavedState {
            status: state.status,
            profile: state.profile.clone(),
        };
        if let Err(e) = write_state(path, &saved) {
            warn!("Failed to record tunnel state in {}: {}", path.display(), e);
        }
    }
}

fn read_state(path: &Path) -> TunnelctlResult<SavedState> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(SavedState::empty()),
        Err(e) => Err(e.into()),
    }
}

fn write_state(path: &Path, saved: &SavedState) -> TunnelctlResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(saved)?)?;
    Ok(())
}

/// Environment passed to the up/down commands
fn command_env(profile: &TunnelProfile, options: Option<&TunnelOptions>) -> Vec<(String, String)> {
    let mut env = vec![
        ("TUNNELCTL_NAME".to_string(), profile.description.clone()),
        ("TUNNELCTL_SERVER".to_string(), profile.server_address.clone()),
    ];

    if let Some(options) = options {
        let sorted: BTreeMap<&String, &Value> = options.iter().collect();
        // Serializing a map of JSON values cannot fail
        env.push(("TUNNELCTL_OPTIONS".to_string(), serde_json::to_string(&sorted).unwrap_or_default()));

        let mut exported: BTreeMap<String, (&String, String)> = BTreeMap::new();
        for (key, value) in sorted {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let name = option_env_key(key);
            if let Some((previous, _)) = exported.insert(name.clone(), (key, value)) {
                warn!("Options '{}' and '{}' both map to {}, exporting '{}'", previous, key, name, key);
            }
        }
        env.extend(exported.into_iter().map(|(name, (_, value))| (name, value)));
    }

    env
}

fn option_env_key(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("TUNNELCTL_OPT_{}", sanitized)
}

/// Run a command line to completion. Dropping the future kills the child.
async fn run_command(argv: &[String], env: &[(String, String)]) -> TunnelctlResult<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| TunnelctlError::ConfigError("Empty command line".to_string()))?;

    debug!("Running {} {:?}", program, args);
    let output = Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| TunnelctlError::PlatformError(format!("Failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(TunnelctlError::CommandFailed {
            cmd: argv.join(" "),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

#[async_trait]
impl PlatformTunnel for CommandPlatform {
    fn name(&self) -> &str {
        "command"
    }

    async fn load_profile(&self) -> TunnelctlResult<Option<TunnelProfile>> {
        Ok(self.lock().profile.clone())
    }

    async fn save_profile(&self, profile: &TunnelProfile) -> TunnelctlResult<()> {
        let mut state = self.lock();
        state.profile = Some(profile.clone());
        info!("Saved tunnel profile '{}' ({})", profile.description, profile.server_address);
        if state.status == TunnelStatus::Invalid {
            self.set_status(&mut state, TunnelStatus::Disconnected);
        } else {
            self.persist(&state);
        }
        Ok(())
    }

    async fn start_tunnel(&self, options: Option<&TunnelOptions>) -> TunnelctlResult<()> {
        let mut state = self.lock();
        let Some(profile) = state.profile.clone() else {
            warn!("No tunnel profile saved, start ignored");
            return Ok(());
        };
        if !state.status.accepts_start() {
            info!("Tunnel already {}, start ignored", state.status);
            return Ok(());
        }
        let generation = Self::next_generation(&mut state);
        self.set_status(&mut state, TunnelStatus::Connecting);

        let env = command_env(&profile, options);
        let platform = self.clone();
        state.up_task = Some(tokio::spawn(async move {
            match run_command(&platform.inner.up, &env).await {
                Ok(()) => {
                    info!("Tunnel '{}' is up", profile.description);
                    platform.report_if_current(generation, TunnelStatus::Connected);
                }
                Err(e) => {
                    error!("Failed to bring tunnel '{}' up: {}", profile.description, e);
                    platform.report_if_current(generation, TunnelStatus::Disconnected);
                }
            }
        }));

        Ok(())
    }

    async fn stop_tunnel(&self) -> TunnelctlResult<()> {
        let (generation, env, up_task) = {
            let mut state = self.lock();
            if matches!(
                state.status,
                TunnelStatus::Disconnected | TunnelStatus::Invalid | TunnelStatus::Disconnecting
            ) {
                debug!("Tunnel is {}, stop ignored", state.status);
                return Ok(());
            }
            let generation = Self::next_generation(&mut state);
            let up_task = state.up_task.take();
            self.set_status(&mut state, TunnelStatus::Disconnecting);
            let env = state
                .profile
                .as_ref()
                .map(|p| command_env(p, None))
                .unwrap_or_default();
            (generation, env, up_task)
        };

        let platform = self.clone();
        tokio::spawn(async move {
            if let Some(up_task) = up_task {
                if !up_task.is_finished() {
                    info!("Stop requested while the tunnel is coming up, killing the up command");
                }
                up_task.abort();
                let _ = up_task.await;
            }
            if let Err(e) = run_command(&platform.inner.down, &env).await {
                warn!("Tunnel down command failed: {}", e);
            }
            platform.report_if_current(generation, TunnelStatus::Disconnected);
        });

        Ok(())
    }

    fn status(&self) -> TunnelStatus {
        self.lock().status
    }

    fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.event_tx.subscribe()
    }
}
