//! Engine Service
//!
//! [`BlueManager`] ties the registry, scan loop, session runtime and action
//! pipeline to one radio. It is the only type applications need to hold.

use crate::domain::error::Rejection;
use crate::domain::models::{ActionRequest, Address, DeviceRecord, SessionState};
use crate::domain::registry::DeviceRegistry;
use crate::domain::settings::EngineConfig;
use crate::infrastructure::bluetooth::actions::ActionPipeline;
use crate::infrastructure::bluetooth::connection::{ConnectionController, SessionContext, SessionTable};
use crate::infrastructure::bluetooth::listeners::{BlueListener, ListenerSet};
use crate::infrastructure::bluetooth::radio::{PairedDevice, Radio};
use crate::infrastructure::bluetooth::scanner::{ScanLoop, ScanOptions, ScanPhase};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing::info;

/// Discovery and session engine bound to one radio
pub struct BlueManager {
    radio: Arc<dyn Radio>,
    registry: Arc<DeviceRegistry>,
    listeners: Arc<ListenerSet>,
    scanner: ScanLoop,
    connections: ConnectionController,
    actions: ActionPipeline,
    stopped: AtomicBool,
}

impl BlueManager {
    /// Create an engine whose tasks run on `runtime`
    pub fn new(radio: Arc<dyn Radio>, config: EngineConfig, runtime: Handle) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let listeners = Arc::new(ListenerSet::new());
        let sessions: Arc<SessionTable> = Arc::new(Mutex::new(Default::default()));
        let ctx = Arc::new(SessionContext {
            radio: radio.clone(),
            registry: registry.clone(),
            listeners: listeners.clone(),
            config,
            runtime,
        });

        Self {
            radio,
            registry,
            listeners,
            scanner: ScanLoop::new(ctx.clone(), sessions.clone()),
            connections: ConnectionController::new(ctx, sessions.clone()),
            actions: ActionPipeline::new(sessions),
            stopped: AtomicBool::new(false),
        }
    }

    /// Convenience constructor using the current tokio runtime
    pub fn with_current_runtime(radio: Arc<dyn Radio>, config: EngineConfig) -> Result<Self, Rejection> {
        let runtime = Handle::try_current().map_err(|_| Rejection::EngineStopped)?;
        Ok(Self::new(radio, config, runtime))
    }

    fn ensure_running(&self) -> Result<(), Rejection> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Rejection::EngineStopped);
        }
        Ok(())
    }

    // Listeners

    pub fn add_listener(&self, listener: Arc<dyn BlueListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn BlueListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn clear_listeners(&self) {
        self.listeners.clear();
    }

    // Discovery

    /// Start the scan duty cycle. Returns false if already running or shut down.
    pub fn start_scan(&self, options: ScanOptions) -> bool {
        if self.ensure_running().is_err() {
            return false;
        }
        self.scanner.start(options)
    }

    pub fn stop_scan(&self) -> bool {
        self.scanner.stop()
    }

    /// Stop scanning and wait until the scan task has exited
    pub async fn stop_scan_and_wait(&self) {
        self.scanner.stop_and_wait().await;
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_running()
    }

    pub fn scan_phase(&self) -> ScanPhase {
        self.scanner.phase()
    }

    /// Evict stale devices now and report them lost
    pub fn force_sweep(&self) -> Vec<DeviceRecord> {
        self.scanner.sweep()
    }

    /// Copies of every known device, ordered by address
    pub fn discovered_devices(&self) -> Vec<DeviceRecord> {
        self.registry.all()
    }

    pub fn discovered_device(&self, address: &Address) -> Option<DeviceRecord> {
        self.registry.get(address)
    }

    pub fn paired_devices(&self) -> Vec<PairedDevice> {
        self.radio.paired_devices()
    }

    // Sessions

    pub fn open(&self, address: &Address) -> Result<(), Rejection> {
        self.ensure_running()?;
        self.connections.open(address)
    }

    pub fn close(&self, address: &Address) -> Result<(), Rejection> {
        self.connections.close(address)
    }

    pub fn close_all(&self) -> usize {
        self.connections.close_all()
    }

    pub fn session_state(&self, address: &Address) -> Option<SessionState> {
        self.connections.state(address)
    }

    /// Addresses with a session that has not reached a terminal state
    pub fn sessioned_addresses(&self) -> HashSet<Address> {
        self.connections.live_addresses()
    }

    pub fn refresh_cache(&self, address: &Address) -> Result<bool, Rejection> {
        self.connections.refresh_cache(address)
    }

    // Actions

    pub fn perform(
        &self,
        address: &Address,
        request: ActionRequest,
        listener: Arc<dyn BlueListener>,
    ) -> Result<(), Rejection> {
        self.ensure_running()?;
        self.actions.perform(address, request, listener)
    }

    /// Stop scanning, close every session and refuse further work
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down BlueManager");
        self.scanner.stop_and_wait().await;
        let closing = self.connections.close_all();
        if closing > 0 {
            info!("Closing {} sessions", closing);
        }
    }
}
