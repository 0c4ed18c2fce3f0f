//! Session runtime
//!
//! Owns the session table and drives each [`Session`] state machine against
//! the radio.
//!
//! Every transition happens under the session's lock. Radio work and timers
//! requested by a transition are spawned from inside that lock, so they can
//! never observe a half-applied state. Listener callbacks are queued from
//! inside the lock too, onto a per-session channel drained by a dispatcher
//! task: they come out in transition order, and the lock is not held while a
//! listener runs, so listeners may call back into the engine.

use crate::domain::error::Rejection;
use crate::domain::models::{ActionRequest, Address, ConnectionHandle, EngineEvent, SessionState};
use crate::domain::registry::DeviceRegistry;
use crate::domain::session::{Effect, Session, SessionEvent};
use crate::domain::settings::EngineConfig;
use crate::infrastructure::bluetooth::actions;
use crate::infrastructure::bluetooth::listeners::{BlueListener, ListenerSet};
use crate::infrastructure::bluetooth::radio::{LinkEvent, Radio};
use crate::infrastructure::bluetooth::timer::{self, TimerHandle};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) type SessionTable = Mutex<HashMap<Address, Arc<SessionHandle>>>;

type ActionListener = Arc<dyn BlueListener>;
type Callback = Effect<ActionListener>;

/// Collaborators shared by every session of one engine
pub(crate) struct SessionContext {
    pub(crate) radio: Arc<dyn Radio>,
    pub(crate) registry: Arc<DeviceRegistry>,
    pub(crate) listeners: Arc<ListenerSet>,
    pub(crate) config: EngineConfig,
    pub(crate) runtime: Handle,
}

struct SessionSlot {
    session: Session<ActionListener>,
    discovery_timer: Option<TimerHandle>,
}

pub(crate) struct SessionHandle {
    address: Address,
    pub(crate) ctx: Arc<SessionContext>,
    slot: Mutex<SessionSlot>,
    callbacks: mpsc::UnboundedSender<Callback>,
    /// Cancelled once closure has been delivered
    finished: CancellationToken,
    /// Cancelled once the radio connect has resolved either way
    connect_settled: CancellationToken,
}

impl SessionHandle {
    fn new(address: Address, ctx: Arc<SessionContext>, callbacks: mpsc::UnboundedSender<Callback>) -> Self {
        let session = Session::new(address.clone(), ctx.config.notification_descriptor_uuid);
        Self {
            address,
            ctx,
            slot: Mutex::new(SessionSlot {
                session,
                discovery_timer: None,
            }),
            callbacks,
            finished: CancellationToken::new(),
            connect_settled: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn state(&self) -> SessionState {
        self.lock().session.state()
    }

    pub(crate) fn link(&self) -> Option<ConnectionHandle> {
        self.lock().session.link().cloned()
    }

    /// Feed one event through the state machine and run its effects
    pub(crate) fn apply(self: &Arc<Self>, event: SessionEvent) {
        let mut slot = self.lock();
        let before = slot.session.state();
        let effects = slot.session.apply(event);
        let after = slot.session.state();
        if before != after {
            debug!("Session {}: {} -> {}", self.address, before, after);
        }
        self.execute(&mut slot, effects);
    }

    /// Bind an action to this session, or refuse it synchronously
    pub(crate) fn submit(
        self: &Arc<Self>,
        request: ActionRequest,
        listener: ActionListener,
    ) -> Result<(), Rejection> {
        let mut slot = self.lock();
        let effects = slot.session.submit(request, listener)?;
        self.execute(&mut slot, effects);
        Ok(())
    }

    fn execute(self: &Arc<Self>, slot: &mut SessionSlot, effects: Vec<Callback>) {
        for effect in effects {
            match effect {
                Effect::ArmDiscoveryTimer => {
                    let handle = self.clone();
                    slot.discovery_timer = Some(timer::after(
                        &self.ctx.runtime,
                        self.ctx.config.discovery_timeout(),
                        move || handle.apply(SessionEvent::DiscoveryTimedOut),
                    ));
                }
                Effect::CancelDiscoveryTimer => {
                    if let Some(timer) = slot.discovery_timer.take() {
                        timer.cancel();
                    }
                }
                Effect::Discover(link) => {
                    let handle = self.clone();
                    self.ctx.runtime.spawn(async move {
                        let event = match handle.ctx.radio.discover(&link).await {
                            Ok(services) => SessionEvent::ServicesDiscovered(services),
                            Err(e) => SessionEvent::DiscoveryFailed(e),
                        };
                        handle.apply(event);
                    });
                }
                Effect::Disconnect(link) => {
                    let handle = self.clone();
                    self.ctx.runtime.spawn(async move {
                        handle.ctx.radio.disconnect(&link).await;
                        handle.apply(SessionEvent::DisconnectConfirmed);
                    });
                }
                Effect::Submit { id, link, request } => {
                    actions::submit_to_radio(self, id, link, request);
                }
                callback => {
                    // The dispatcher only goes away after Closed
                    let _ = self.callbacks.send(callback);
                }
            }
        }
    }

    /// Drop the timer and refresh the registry record of a closed session
    fn retire(&self) {
        self.lock().discovery_timer.take();
        // The peripheral was reachable up to now; restart its loss clock
        self.ctx.registry.touch(&self.address, Instant::now());
    }

    /// Free the address for a new session
    fn unregister(self: &Arc<Self>, table: &Weak<SessionTable>) {
        if let Some(table) = table.upgrade() {
            let mut sessions = lock_table(&table);
            if sessions
                .get(&self.address)
                .is_some_and(|current| Arc::ptr_eq(current, self))
            {
                sessions.remove(&self.address);
            }
        }
    }
}

pub(crate) fn lock_table(table: &SessionTable) -> MutexGuard<'_, HashMap<Address, Arc<SessionHandle>>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn lookup(table: &SessionTable, address: &Address) -> Option<Arc<SessionHandle>> {
    lock_table(table).get(address).cloned()
}

/// Addresses whose session has not reached a terminal state
pub(crate) fn live_addresses(table: &SessionTable) -> HashSet<Address> {
    let handles: Vec<Arc<SessionHandle>> = lock_table(table).values().cloned().collect();
    handles
        .into_iter()
        .filter(|handle| !handle.state().is_terminal())
        .map(|handle| handle.address().clone())
        .collect()
}

async fn dispatch_callbacks(
    handle: Arc<SessionHandle>,
    table: Weak<SessionTable>,
    mut callbacks: mpsc::UnboundedReceiver<Callback>,
) {
    let address = handle.address().clone();
    while let Some(callback) = callbacks.recv().await {
        match callback {
            Effect::Ready => {
                info!("Session {} ready", address);
                handle
                    .ctx
                    .listeners
                    .emit(&EngineEvent::DeviceReady(address.clone()));
            }
            Effect::ActionSucceeded {
                listener,
                action,
                value,
            } => listener.on_action_success(&address, &action, &value),
            Effect::ActionFailed { listener, action } => {
                listener.on_action_failure(&address, &action)
            }
            Effect::Closed => {
                info!("Session {} closed ({})", address, handle.state());
                handle.retire();
                let settled = handle.connect_settled.is_cancelled();
                if settled {
                    handle.unregister(&table);
                }
                handle
                    .ctx
                    .listeners
                    .emit(&EngineEvent::DeviceClosed(address.clone()));
                handle.finished.cancel();
                if !settled {
                    // The address stays taken until the radio gives up the
                    // connect or hands back a link to release
                    debug!("Holding {} until its connect attempt resolves", address);
                    handle.connect_settled.cancelled().await;
                    handle.unregister(&table);
                }
                break;
            }
            _ => warn!("Radio effect queued as a callback for {}", address),
        }
    }
}

async fn pump_link_events(handle: Arc<SessionHandle>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    loop {
        tokio::select! {
            _ = handle.finished.cancelled() => break,
            event = events.recv() => match event {
                Some(LinkEvent::Disconnected) => handle.apply(SessionEvent::LinkLost),
                Some(LinkEvent::ValueChanged {
                    service,
                    characteristic,
                    value,
                }) => handle.apply(SessionEvent::ValueChanged {
                    service,
                    characteristic,
                    value,
                }),
                // The radio released the link; closure is reported elsewhere
                None => break,
            },
        }
    }
}

/// Opens and closes sessions, one per address
pub struct ConnectionController {
    ctx: Arc<SessionContext>,
    sessions: Arc<SessionTable>,
}

impl ConnectionController {
    pub(crate) fn new(ctx: Arc<SessionContext>, sessions: Arc<SessionTable>) -> Self {
        Self { ctx, sessions }
    }

    /// Begin connecting to a discovered device.
    ///
    /// Progress is reported through `on_device_ready` / `on_device_closed`.
    pub fn open(&self, address: &Address) -> Result<(), Rejection> {
        let record = self
            .ctx
            .registry
            .get(address)
            .ok_or_else(|| Rejection::UnknownDevice(address.clone()))?;

        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let handle = {
            let mut sessions = lock_table(&self.sessions);
            if sessions.contains_key(address) {
                return Err(Rejection::AlreadySessioned(address.clone()));
            }
            let handle = Arc::new(SessionHandle::new(
                address.clone(),
                self.ctx.clone(),
                callback_tx,
            ));
            sessions.insert(address.clone(), handle.clone());
            handle
        };

        info!("Opening session with {} ({})", record.label(), address);
        self.ctx.runtime.spawn(dispatch_callbacks(
            handle.clone(),
            Arc::downgrade(&self.sessions),
            callback_rx,
        ));

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        self.ctx.runtime.spawn(pump_link_events(handle.clone(), link_rx));

        self.ctx.runtime.spawn(async move {
            let event = match handle
                .ctx
                .radio
                .connect(&record.radio_handle, &record.address, link_tx)
                .await
            {
                Ok(link) => SessionEvent::Connected(link),
                Err(e) => SessionEvent::ConnectFailed(e),
            };
            handle.apply(event);
            handle.connect_settled.cancel();
        });

        Ok(())
    }

    /// Ask the session for `address` to close. Closing an already closing
    /// session is a no-op.
    pub fn close(&self, address: &Address) -> Result<(), Rejection> {
        let handle = lookup(&self.sessions, address)
            .ok_or_else(|| Rejection::NoSession(address.clone()))?;
        info!("Closing session with {}", address);
        handle.apply(SessionEvent::CloseRequested);
        Ok(())
    }

    /// Close every session; returns how many were asked to close
    pub fn close_all(&self) -> usize {
        let handles: Vec<Arc<SessionHandle>> =
            lock_table(&self.sessions).values().cloned().collect();
        for handle in &handles {
            handle.apply(SessionEvent::CloseRequested);
        }
        handles.len()
    }

    pub fn state(&self, address: &Address) -> Option<SessionState> {
        lookup(&self.sessions, address).map(|handle| handle.state())
    }

    pub fn live_addresses(&self) -> HashSet<Address> {
        live_addresses(&self.sessions)
    }

    pub fn len(&self) -> usize {
        lock_table(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock_table(&self.sessions).is_empty()
    }

    /// Drop the platform attribute cache of a connected session
    pub fn refresh_cache(&self, address: &Address) -> Result<bool, Rejection> {
        let handle = lookup(&self.sessions, address)
            .ok_or_else(|| Rejection::NoSession(address.clone()))?;
        let link = handle.link().ok_or_else(|| Rejection::NotReady {
            address: address.clone(),
            state: handle.state(),
        })?;
        Ok(self.ctx.radio.refresh_cache(&link))
    }
}
