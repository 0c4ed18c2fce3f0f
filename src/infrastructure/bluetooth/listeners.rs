//! Listener registration and fan-out.
//!
//! Scan events and session readiness/closure go to every registered
//! [`BlueListener`]. Action outcomes go only to the listener passed with the
//! action. Fan-out iterates over a snapshot, so a listener may register or
//! unregister listeners from inside a callback.

use crate::domain::models::{ActionRequest, Address, DeviceRecord, EngineEvent};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Callbacks raised by the engine. Every method defaults to a no-op.
///
/// Callbacks run on engine tasks; keep them short and hand heavy work off.
pub trait BlueListener: Send + Sync {
    fn on_device_found(&self, _device: &DeviceRecord) {}
    fn on_device_update(&self, _device: &DeviceRecord) {}
    fn on_device_lost(&self, _device: &DeviceRecord) {}
    fn on_device_scan_error(&self, _code: i32) {}
    fn on_device_ready(&self, _address: &Address) {}
    fn on_device_closed(&self, _address: &Address) {}
    fn on_action_success(&self, _address: &Address, _action: &ActionRequest, _value: &[u8]) {}
    fn on_action_failure(&self, _address: &Address, _action: &ActionRequest) {}
}

/// Route an event to the matching callback of `listener`
pub fn deliver(listener: &dyn BlueListener, event: &EngineEvent) {
    match event {
        EngineEvent::DeviceFound(device) => listener.on_device_found(device),
        EngineEvent::DeviceUpdated(device) => listener.on_device_update(device),
        EngineEvent::DeviceLost(device) => listener.on_device_lost(device),
        EngineEvent::ScanError(code) => listener.on_device_scan_error(*code),
        EngineEvent::DeviceReady(address) => listener.on_device_ready(address),
        EngineEvent::DeviceClosed(address) => listener.on_device_closed(address),
        EngineEvent::ActionSucceeded {
            address,
            action,
            value,
        } => listener.on_action_success(address, action, value),
        EngineEvent::ActionFailed { address, action } => {
            listener.on_action_failure(address, action)
        }
    }
}

fn same_listener(a: &Arc<dyn BlueListener>, b: &Arc<dyn BlueListener>) -> bool {
    // Compare data pointers only; vtable pointers are not unique
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[derive(Default)]
pub struct ListenerSet {
    listeners: Mutex<Vec<Arc<dyn BlueListener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn BlueListener>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener. Registering the same one twice is a no-op.
    pub fn add(&self, listener: Arc<dyn BlueListener>) {
        let mut listeners = self.lock();
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove(&self, listener: &Arc<dyn BlueListener>) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn BlueListener>> {
        self.lock().clone()
    }

    /// Deliver `event` to every listener registered at the time of the call
    pub fn emit(&self, event: &EngineEvent) {
        for listener in self.snapshot() {
            deliver(listener.as_ref(), event);
        }
    }
}

/// Forwards every callback into a channel as an [`EngineEvent`]
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn forward(&self, event: EngineEvent) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.sender.send(event);
    }
}

impl BlueListener for ChannelListener {
    fn on_device_found(&self, device: &DeviceRecord) {
        self.forward(EngineEvent::DeviceFound(device.clone()));
    }

    fn on_device_update(&self, device: &DeviceRecord) {
        self.forward(EngineEvent::DeviceUpdated(device.clone()));
    }

    fn on_device_lost(&self, device: &DeviceRecord) {
        self.forward(EngineEvent::DeviceLost(device.clone()));
    }

    fn on_device_scan_error(&self, code: i32) {
        self.forward(EngineEvent::ScanError(code));
    }

    fn on_device_ready(&self, address: &Address) {
        self.forward(EngineEvent::DeviceReady(address.clone()));
    }

    fn on_device_closed(&self, address: &Address) {
        self.forward(EngineEvent::DeviceClosed(address.clone()));
    }

    fn on_action_success(&self, address: &Address, action: &ActionRequest, value: &[u8]) {
        self.forward(EngineEvent::ActionSucceeded {
            address: address.clone(),
            action: action.clone(),
            value: value.to_vec(),
        });
    }

    fn on_action_failure(&self, address: &Address, action: &ActionRequest) {
        self.forward(EngineEvent::ActionFailed {
            address: address.clone(),
            action: action.clone(),
        });
    }
}
