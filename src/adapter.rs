//! Process-wide tunnel adapter
//!
//! [`TunnelAdapter`] fronts the platform VPN subsystem. It holds the tunnel
//! configuration fields, forwards start/stop requests, and mirrors the
//! platform's status into a cached value that callers can read without
//! blocking.
//!
//! The status relay is installed once, when the adapter is built. For every
//! platform event it re-reads the platform status, stores it, and only then
//! posts [`STATUS_CHANGED`]. Observers that react to the notification by
//! reading [`TunnelAdapter::status`] always see the new value.
//!
//! Start and stop run in the background on the adapter's own runtime. Their
//! outcome is only visible through status changes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::TunnelctlConfig;
use crate::error::{TunnelctlError, TunnelctlResult};
use crate::notification::{Notification, NotificationCenter, ObserverId, STATUS_CHANGED};
use crate::platform::{PlatformTunnel, SimulatedPlatform, StatusEvent, TunnelOptions, TunnelProfile};
use crate::status::TunnelStatus;

static SHARED: OnceLock<Arc<TunnelAdapter>> = OnceLock::new();

/// State written by the relay and read by callers
struct RelayState {
    status: AtomicU32,
    notifications: NotificationCenter,
}

impl RelayState {
    fn load(&self) -> TunnelStatus {
        // Only valid codes are ever stored
        TunnelStatus::from_code(self.status.load(Ordering::Acquire)).unwrap_or(TunnelStatus::Invalid)
    }

    fn publish(&self, status: TunnelStatus) {
        self.status.store(status.code(), Ordering::Release);
        self.notifications.post(STATUS_CHANGED);
    }
}

/// Singleton adapter around the platform-managed tunnel
pub struct TunnelAdapter {
    platform: Arc<dyn PlatformTunnel>,
    relay_state: Arc<RelayState>,
    display_name: RwLock<String>,
    server_address: RwLock<String>,
    on_demand: bool,
    handle: Handle,
    runtime: Option<Runtime>,
    relay: JoinHandle<()>,
}

impl TunnelAdapter {
    /// The process-wide adapter, created on first use.
    ///
    /// Without a prior [`TunnelAdapter::install`] the adapter is built from
    /// the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if the adapter runtime cannot be started on first use.
    pub fn shared() -> Arc<TunnelAdapter> {
        SHARED
            .get_or_init(|| {
                let config = TunnelctlConfig::default();
                let delay = std::time::Duration::from_millis(config.platform.transition_delay_ms);
                let platform = Arc::new(SimulatedPlatform::new().with_auto_transitions(delay));
                match TunnelAdapter::new(platform, &config) {
                    Ok(adapter) => Arc::new(adapter),
                    Err(e) => panic!("Failed to create tunnel adapter: {}", e),
                }
            })
            .clone()
    }

    /// Create the process-wide adapter with an explicit platform.
    ///
    /// Fails with `AlreadyExists` once the adapter exists, including when
    /// [`TunnelAdapter::shared`] already created a default one.
    pub fn install(
        platform: Arc<dyn PlatformTunnel>,
        config: &TunnelctlConfig,
    ) -> TunnelctlResult<Arc<TunnelAdapter>> {
        if SHARED.get().is_some() {
            return Err(TunnelctlError::AlreadyExists("Tunnel adapter already initialized".to_string()));
        }

        let adapter = Arc::new(Self::new(platform, config)?);
        let mut installed = false;
        let shared = SHARED.get_or_init(|| {
            installed = true;
            adapter
        });

        if !installed {
            return Err(TunnelctlError::AlreadyExists("Tunnel adapter already initialized".to_string()));
        }
        info!("Tunnel adapter installed with '{}' platform", shared.platform.name());
        Ok(shared.clone())
    }

    /// The adapter if it has been created, without creating it
    pub fn try_shared() -> Option<Arc<TunnelAdapter>> {
        SHARED.get().cloned()
    }

    fn new(platform: Arc<dyn PlatformTunnel>, config: &TunnelctlConfig) -> TunnelctlResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tunnel-adapter")
            .enable_all()
            .build()
            .map_err(|e| TunnelctlError::PlatformError(format!("Failed to start adapter runtime: {}", e)))?;

        // Subscribe before the first status read so no transition slips between them
        let events = platform.subscribe();
        let initial = platform.status();

        let relay_state = Arc::new(RelayState {
            status: AtomicU32::new(initial.code()),
            notifications: NotificationCenter::new(config.notifications.capacity),
        });

        let relay = runtime.spawn(relay_status(platform.clone(), relay_state.clone(), events));

        debug!("Tunnel adapter created, platform '{}' reports {}", platform.name(), initial);

        Ok(Self {
            platform,
            relay_state,
            display_name: RwLock::new(config.profile.display_name.clone()),
            server_address: RwLock::new(config.profile.server_address.clone()),
            on_demand: config.profile.on_demand,
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            relay,
        })
    }

    /// Last status reported by the platform
    pub fn status(&self) -> TunnelStatus {
        self.relay_state.load()
    }

    /// Name of the platform driver in use
    pub fn platform_name(&self) -> &str {
        self.platform.name()
    }

    /// Display name applied at the next start
    pub fn display_name(&self) -> String {
        self.display_name.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_display_name(&self, name: impl Into<String>) {
        *self.display_name.write().unwrap_or_else(|e| e.into_inner()) = name.into();
    }

    /// Server address applied at the next start
    pub fn server_address(&self) -> String {
        self.server_address.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_server_address(&self, address: impl Into<String>) {
        *self.server_address.write().unwrap_or_else(|e| e.into_inner()) = address.into();
    }

    /// Notification center carrying [`STATUS_CHANGED`]
    pub fn notifications(&self) -> &NotificationCenter {
        &self.relay_state.notifications
    }

    /// Receive a [`STATUS_CHANGED`] notification for every relayed event
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.relay_state.notifications.subscribe()
    }

    /// Run `callback` for every status change, on the relay thread
    pub fn add_observer<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.relay_state.notifications.add_observer(STATUS_CHANGED, callback)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.relay_state.notifications.remove_observer(id)
    }

    /// Ask the platform to bring the tunnel up with the current display name
    /// and server address.
    ///
    /// Returns immediately. The returned handle completes once the request
    /// has been handed to the platform; awaiting it is optional. Whether a
    /// start while already connecting or connected does anything is up to
    /// the platform.
    pub fn start_tunnel(&self, options: Option<TunnelOptions>) -> JoinHandle<()> {
        let platform = self.platform.clone();
        let description = self.display_name();
        let server_address = self.server_address();
        let on_demand = self.on_demand;

        info!("Starting tunnel '{}' to {}", description, server_address);
        self.handle.spawn(async move {
            let result = prepare_profile(platform.as_ref(), &description, &server_address, on_demand).await;
            let result = match result {
                Ok(()) => platform.start_tunnel(options.as_ref()).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!("Start tunnel error: {}", e);
            }
        })
    }

    /// Ask the platform to tear the tunnel down.
    ///
    /// Returns immediately. Does nothing when the platform holds no profile.
    pub fn stop_tunnel(&self) -> JoinHandle<()> {
        let platform = self.platform.clone();

        info!("Stopping tunnel");
        self.handle.spawn(async move {
            match platform.load_profile().await {
                Ok(Some(_)) => {
                    if let Err(e) = platform.stop_tunnel().await {
                        error!("Stop tunnel error: {}", e);
                    }
                }
                Ok(None) => debug!("No tunnel profile, nothing to stop"),
                Err(e) => error!("Failed to load tunnel profile: {}", e),
            }
        })
    }
}

impl Drop for TunnelAdapter {
    fn drop(&mut self) {
        self.relay.abort();
        // May run inside another runtime, where a blocking shutdown would panic
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        debug!("TunnelAdapter dropped");
    }
}

/// Load the platform profile or create one, apply the adapter settings,
/// save it and read it back.
async fn prepare_profile(
    platform: &dyn PlatformTunnel,
    description: &str,
    server_address: &str,
    on_demand: bool,
) -> TunnelctlResult<()> {
    let mut profile = match platform.load_profile().await? {
        Some(profile) => profile,
        None => {
            info!("No tunnel profile found, creating one");
            TunnelProfile::new(description, server_address)
        }
    };

    profile.description = description.to_string();
    profile.server_address = server_address.to_string();
    profile.enabled = true;
    profile.on_demand = on_demand;

    platform.save_profile(&profile).await?;

    platform
        .load_profile()
        .await?
        .ok_or_else(|| TunnelctlError::NotFound("Tunnel profile missing after save".to_string()))?;

    Ok(())
}

/// Mirror platform status into `state` until the platform closes its stream
async fn relay_status(
    platform: Arc<dyn PlatformTunnel>,
    state: Arc<RelayState>,
    mut events: broadcast::Receiver<StatusEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => trace!("Platform event: {} at {}", event.status, event.at),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Status relay skipped {} platform events", skipped);
            }
            Err(RecvError::Closed) => {
                info!("Platform status stream closed, relay stopping");
                break;
            }
        }

        let status = platform.status();
        state.publish(status);
        debug!("Tunnel status is now {}", status);
    }
}
