//! Scan Loop
//!
//! Runs the discovery duty cycle: scan for `scan_period`, stop the radio,
//! evict devices not seen within the loss timeout, idle for `idle_period`,
//! and go again. A scan failure skips straight to a back-off wait.
//!
//! The loop is a single tokio task. Stopping cancels it through a
//! [`CancellationToken`] and every advertisement is checked against the token
//! before it is recorded. [`ScanLoop::stop`] may return while one advertisement
//! that already passed that check is still being reported; once
//! [`ScanLoop::stop_and_wait`] returns, the loop has reported its last event.

use crate::domain::error::RadioError;
use crate::domain::models::{Address, Advertisement, DeviceRecord, EngineEvent, Observation};
use crate::infrastructure::bluetooth::connection::{live_addresses, SessionContext, SessionTable};
use crate::infrastructure::bluetooth::radio::{ScanEvent, ScanFilter};
use crate::infrastructure::bluetooth::timer::{self, TimerHandle};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Where the duty cycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Stopped,
    Scanning,
    Idle,
    /// Waiting after a scan failure
    Backoff,
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub filter: ScanFilter,
    /// Stop scanning as soon as this address is seen
    pub target: Option<Address>,
    /// Stop scanning after this long
    pub duration: Option<Duration>,
}

impl ScanOptions {
    pub fn for_target(target: Address) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct ScanControl {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
    duration_timer: Option<TimerHandle>,
}

enum PhaseEnd {
    Elapsed,
    Cancelled,
    TargetFound,
    Failed(RadioError),
    ChannelClosed,
}

struct ScanShared {
    ctx: Arc<SessionContext>,
    sessions: Arc<SessionTable>,
    control: Mutex<ScanControl>,
    phase: Mutex<ScanPhase>,
    /// Serialises radio scan toggles against stop()
    radio_gate: Mutex<()>,
}

impl ScanShared {
    fn control(&self) -> MutexGuard<'_, ScanControl> {
        self.control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.radio_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, phase: ScanPhase) {
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = phase;
    }

    fn phase(&self) -> ScanPhase {
        if self.control().cancel.is_none() {
            return ScanPhase::Stopped;
        }
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stop(&self) -> bool {
        let cancel = {
            let mut control = self.control();
            let Some(cancel) = control.cancel.take() else {
                return false;
            };
            control.duration_timer.take();
            cancel
        };

        {
            let _gate = self.gate();
            cancel.cancel();
            if let Err(e) = self.ctx.radio.stop_scan() {
                warn!("Failed to stop radio scan: {}", e);
            }
        }
        self.set_phase(ScanPhase::Stopped);
        info!("Scan loop stopped");
        true
    }

    /// Disable the radio scan unless the loop was cancelled, in which case
    /// stop() already did it
    fn halt_radio(&self, cancel: &CancellationToken) {
        let _gate = self.gate();
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.ctx.radio.stop_scan() {
            warn!("Failed to stop radio scan: {}", e);
        }
    }

    /// Returns false if the advertisement was filtered out or the loop is stopping
    fn observe(&self, advertisement: &Advertisement, filter: &ScanFilter, cancel: &CancellationToken) -> bool {
        if !filter.matches_name(advertisement.name.as_deref()) || cancel.is_cancelled() {
            return false;
        }

        let (observation, record) = self.ctx.registry.observe(advertisement, Instant::now());
        match observation {
            Observation::FirstSighting => {
                info!(
                    "Found {} ({}, {} dBm)",
                    record.label(),
                    record.address,
                    record.signal_strength
                );
                self.ctx.listeners.emit(&EngineEvent::DeviceFound(record));
            }
            Observation::Update => {
                trace!("Update from {} ({} dBm)", record.address, record.signal_strength);
                self.ctx.listeners.emit(&EngineEvent::DeviceUpdated(record));
            }
        }
        true
    }

    fn sweep(&self) -> Vec<DeviceRecord> {
        let sessioned = live_addresses(&self.sessions);
        let lost = self.ctx.registry.sweep(
            Instant::now(),
            self.ctx.config.discovery_loss_timeout(),
            &sessioned,
        );
        for record in &lost {
            info!("Lost {} ({})", record.label(), record.address);
            self.ctx.listeners.emit(&EngineEvent::DeviceLost(record.clone()));
        }
        lost
    }

    /// Report a failure once and wait out the back-off.
    /// Returns false if the loop was stopped meanwhile.
    async fn back_off(&self, error: &RadioError, cancel: &CancellationToken) -> bool {
        warn!("Scan failed: {}", error);
        self.halt_radio(cancel);
        self.set_phase(ScanPhase::Backoff);
        if !cancel.is_cancelled() {
            self.ctx.listeners.emit(&EngineEvent::ScanError(error.code()));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.ctx.config.error_backoff()) => true,
        }
    }
}

async fn scan_phase(
    shared: &ScanShared,
    options: &ScanOptions,
    cancel: &CancellationToken,
    events: &mut mpsc::UnboundedReceiver<ScanEvent>,
) -> PhaseEnd {
    let window = tokio::time::sleep(shared.ctx.config.scan_period());
    tokio::pin!(window);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PhaseEnd::Cancelled,
            _ = &mut window => return PhaseEnd::Elapsed,
            event = events.recv() => match event {
                Some(ScanEvent::Advertisement(advertisement)) => {
                    let accepted = shared.observe(&advertisement, &options.filter, cancel);
                    if accepted && options.target.as_ref() == Some(&advertisement.address) {
                        return PhaseEnd::TargetFound;
                    }
                }
                Some(ScanEvent::Failed(e)) => return PhaseEnd::Failed(e),
                None => return PhaseEnd::ChannelClosed,
            },
        }
    }
}

async fn run_scan_loop(shared: Arc<ScanShared>, options: ScanOptions, cancel: CancellationToken) {
    loop {
        shared.set_phase(ScanPhase::Scanning);
        let (sink, mut events) = mpsc::unbounded_channel();
        let started = {
            let _gate = shared.gate();
            if cancel.is_cancelled() {
                break;
            }
            shared.ctx.radio.start_scan(&options.filter, sink)
        };
        if let Err(e) = started {
            if shared.back_off(&e, &cancel).await {
                continue;
            }
            break;
        }
        debug!("Scan phase started");

        match scan_phase(&shared, &options, &cancel, &mut events).await {
            PhaseEnd::Cancelled => break,
            PhaseEnd::TargetFound => {
                info!("Target device found; stopping scan");
                shared.stop();
                break;
            }
            PhaseEnd::Failed(e) => {
                if shared.back_off(&e, &cancel).await {
                    continue;
                }
                break;
            }
            PhaseEnd::ChannelClosed => {
                shared.halt_radio(&cancel);
                if shared.ctx.config.auto_restart {
                    info!("Radio closed the advertisement channel; restarting scan");
                    continue;
                }
                warn!("Radio closed the advertisement channel; stopping scan loop");
                shared.stop();
                break;
            }
            PhaseEnd::Elapsed => shared.halt_radio(&cancel),
        }

        if cancel.is_cancelled() {
            break;
        }
        shared.set_phase(ScanPhase::Idle);
        shared.sweep();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.ctx.config.idle_period()) => {}
        }
    }
    debug!("Scan loop exited");
}

/// Discovery duty cycle handle
pub struct ScanLoop {
    shared: Arc<ScanShared>,
}

impl ScanLoop {
    pub(crate) fn new(ctx: Arc<SessionContext>, sessions: Arc<SessionTable>) -> Self {
        Self {
            shared: Arc::new(ScanShared {
                ctx,
                sessions,
                control: Mutex::new(ScanControl::default()),
                phase: Mutex::new(ScanPhase::Stopped),
                radio_gate: Mutex::new(()),
            }),
        }
    }

    /// Start the duty cycle. Returns false if it was already running.
    pub fn start(&self, options: ScanOptions) -> bool {
        let mut control = self.shared.control();
        if control.cancel.is_some() {
            debug!("Scan loop already running");
            return false;
        }

        info!(
            "Starting scan loop (scan {:?}, idle {:?})",
            self.shared.ctx.config.scan_period(),
            self.shared.ctx.config.idle_period()
        );
        let cancel = CancellationToken::new();
        control.cancel = Some(cancel.clone());
        self.shared.set_phase(ScanPhase::Scanning);

        if let Some(duration) = options.duration {
            let shared = self.shared.clone();
            control.duration_timer = Some(timer::after(&self.shared.ctx.runtime, duration, move || {
                info!("Scan time elapsed");
                shared.stop();
            }));
        }
        control.task = Some(
            self.shared
                .ctx
                .runtime
                .spawn(run_scan_loop(self.shared.clone(), options, cancel)),
        );
        true
    }

    /// Stop the duty cycle. Returns false if it was not running.
    pub fn stop(&self) -> bool {
        self.shared.stop()
    }

    /// Stop, then wait for the loop task to wind down
    pub async fn stop_and_wait(&self) {
        self.shared.stop();
        let task = self.shared.control().task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("Scan loop panicked: {}", e);
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.control().cancel.is_some()
    }

    pub fn phase(&self) -> ScanPhase {
        self.shared.phase()
    }

    /// Run an eviction sweep now, regardless of the duty cycle
    pub fn sweep(&self) -> Vec<DeviceRecord> {
        self.shared.sweep()
    }
}

impl Drop for ScanLoop {
    fn drop(&mut self) {
        self.shared.stop();
    }
}
