//! In-memory platform driver
//!
//! Keeps the tunnel state in process memory and records every request it
//! receives. Transitions are either injected with [`SimulatedPlatform::report`]
//! or, in auto mode, played out on a timer after each start/stop request.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{PlatformTunnel, StatusEvent, TunnelOptions, TunnelProfile};
use crate::error::TunnelctlResult;
use crate::status::TunnelStatus;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct SimulatedState {
    status: TunnelStatus,
    profile: Option<TunnelProfile>,
    saved_profiles: Vec<TunnelProfile>,
    start_requests: Vec<Option<TunnelOptions>>,
    stop_requests: usize,
    /// Bumped by every accepted request so stale timers do nothing
    generation: u64,
}

struct Inner {
    state: Mutex<SimulatedState>,
    event_tx: broadcast::Sender<StatusEvent>,
    auto_delay: Option<Duration>,
}

/// Simulated platform VPN subsystem
#[derive(Clone)]
pub struct SimulatedPlatform {
    inner: Arc<Inner>,
}

impl SimulatedPlatform {
    /// Create a platform with no stored profile (status `invalid`)
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// Create a platform that already holds a profile (status `disconnected`)
    pub fn with_profile(profile: TunnelProfile) -> Self {
        Self::build(Some(profile), None)
    }

    /// Play transitions automatically, `delay` apart, after each request
    pub fn with_auto_transitions(self, delay: Duration) -> Self {
        let profile = self.lock().profile.clone();
        Self::build(profile, Some(delay))
    }

    fn build(profile: Option<TunnelProfile>, auto_delay: Option<Duration>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let status = if profile.is_some() {
            TunnelStatus::Disconnected
        } else {
            TunnelStatus::Invalid
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SimulatedState {
                    status,
                    profile,
                    ..Default::default()
                }),
                event_tx,
                auto_delay,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the platform status and emit a status event
    pub fn report(&self, status: TunnelStatus) {
        let mut state = self.lock();
        self.set_status(&mut state, status);
    }

    fn set_status(&self, state: &mut SimulatedState, status: TunnelStatus) {
        state.status = status;
        debug!("Simulated platform reports {}", status);
        let _ = self.inner.event_tx.send(StatusEvent::now(status));
    }

    /// Options of every start request received, in order
    pub fn start_requests(&self) -> Vec<Option<TunnelOptions>> {
        self.lock().start_requests.clone()
    }

    /// Number of stop requests received
    pub fn stop_requests(&self) -> usize {
        self.lock().stop_requests
    }

    /// Every profile saved, in order
    pub fn saved_profiles(&self) -> Vec<TunnelProfile> {
        self.lock().saved_profiles.clone()
    }

    /// Report `status` after `delay` unless another request came in meanwhile
    fn schedule(&self, generation: u64, delay: Duration, status: TunnelStatus) {
        let platform = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = platform.lock();
            if state.generation == generation {
                platform.set_status(&mut state, status);
            } else {
                debug!("Dropping stale simulated transition to {}", status);
            }
        });
    }
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformTunnel for SimulatedPlatform {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn load_profile(&self) -> TunnelctlResult<Option<TunnelProfile>> {
        Ok(self.lock().profile.clone())
    }

    async fn save_profile(&self, profile: &TunnelProfile) -> TunnelctlResult<()> {
        let mut state = self.lock();
        state.profile = Some(profile.clone());
        state.saved_profiles.push(profile.clone());
        debug!("Simulated platform saved profile {}", profile.id);
        if state.status == TunnelStatus::Invalid {
            self.set_status(&mut state, TunnelStatus::Disconnected);
        }
        Ok(())
    }

    async fn start_tunnel(&self, options: Option<&TunnelOptions>) -> TunnelctlResult<()> {
        let generation = {
            let mut state = self.lock();
            state.start_requests.push(options.cloned());

            if self.inner.auto_delay.is_none() {
                return Ok(());
            }
            if state.profile.is_none() {
                warn!("Simulated platform has no profile, start ignored");
                return Ok(());
            }
            if !state.status.accepts_start() {
                info!("Tunnel already {}, start ignored", state.status);
                return Ok(());
            }
            state.generation += 1;
            self.set_status(&mut state, TunnelStatus::Connecting);
            state.generation
        };

        if let Some(delay) = self.inner.auto_delay {
            self.schedule(generation, delay, TunnelStatus::Connected);
        }
        Ok(())
    }

    async fn stop_tunnel(&self) -> TunnelctlResult<()> {
        let generation = {
            let mut state = self.lock();
            state.stop_requests += 1;

            if self.inner.auto_delay.is_none() {
                return Ok(());
            }
            if matches!(
                state.status,
                TunnelStatus::Disconnected | TunnelStatus::Invalid | TunnelStatus::Disconnecting
            ) {
                debug!("Tunnel is {}, stop ignored", state.status);
                return Ok(());
            }
            state.generation += 1;
            self.set_status(&mut state, TunnelStatus::Disconnecting);
            state.generation
        };

        if let Some(delay) = self.inner.auto_delay {
            self.schedule(generation, delay, TunnelStatus::Disconnected);
        }
        Ok(())
    }

    fn status(&self) -> TunnelStatus {
        self.lock().status
    }

    fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initial_status_depends_on_profile() {
        assert_eq!(SimulatedPlatform::new().status(), TunnelStatus::Invalid);
        let platform = SimulatedPlatform::with_profile(TunnelProfile::new("MyVPN", "vpn.example.net"));
        assert_eq!(platform.status(), TunnelStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_save_profile_leaves_invalid() {
        let platform = SimulatedPlatform::new();
        let mut events = platform.subscribe();

        platform.save_profile(&TunnelProfile::new("MyVPN", "MyVPN")).await.unwrap();

        assert_eq!(platform.status(), TunnelStatus::Disconnected);
        assert_eq!(events.recv().await.unwrap().status, TunnelStatus::Disconnected);
        assert_eq!(platform.saved_profiles().len(), 1);
        assert!(platform.load_profile().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_manual_mode_only_records() {
        let platform = SimulatedPlatform::with_profile(TunnelProfile::new("MyVPN", "MyVPN"));
        let mut options = TunnelOptions::new();
        options.insert("username".to_string(), json!("alice"));

        platform.start_tunnel(Some(&options)).await.unwrap();
        platform.start_tunnel(None).await.unwrap();
        platform.stop_tunnel().await.unwrap();

        assert_eq!(platform.status(), TunnelStatus::Disconnected);
        assert_eq!(platform.start_requests(), vec![Some(options), None]);
        assert_eq!(platform.stop_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_transitions() {
        let platform = SimulatedPlatform::with_profile(TunnelProfile::new("MyVPN", "MyVPN"))
            .with_auto_transitions(Duration::from_millis(100));
        let mut events = platform.subscribe();

        platform.start_tunnel(None).await.unwrap();
        assert_eq!(events.recv().await.unwrap().status, TunnelStatus::Connecting);
        assert_eq!(events.recv().await.unwrap().status, TunnelStatus::Connected);

        // Redundant start is a no-op
        platform.start_tunnel(None).await.unwrap();
        assert_eq!(platform.status(), TunnelStatus::Connected);

        platform.stop_tunnel().await.unwrap();
        assert_eq!(events.recv().await.unwrap().status, TunnelStatus::Disconnecting);
        assert_eq!(events.recv().await.unwrap().status, TunnelStatus::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_connecting_cancels_pending_connect() {
        let platform = SimulatedPlatform::with_profile(TunnelProfile::new("MyVPN", "MyVPN"))
            .with_auto_transitions(Duration::from_millis(100));
        let mut events = platform.subscribe();

        platform.start_tunnel(None).await.unwrap();
        platform.stop_tunnel().await.unwrap();

        let seen: Vec<TunnelStatus> = vec![
            events.recv().await.unwrap().status,
            events.recv().await.unwrap().status,
            events.recv().await.unwrap().status,
        ];
        assert_eq!(
            seen,
            vec![TunnelStatus::Connecting, TunnelStatus::Disconnecting, TunnelStatus::Disconnected]
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(platform.status(), TunnelStatus::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rapid_requests_settle_on_last_request() {
        let platform = SimulatedPlatform::with_profile(TunnelProfile::new("MyVPN", "MyVPN"))
            .with_auto_transitions(Duration::from_millis(1));

        for _ in 0..50 {
            platform.start_tunnel(None).await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
            platform.stop_tunnel().await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(platform.status(), TunnelStatus::Disconnected);
    }
}
