//! In-memory radio
//!
//! A scriptable [`Radio`] for tests and demos. Peripherals are registered up
//! front with a canned service map and a [`Response`] per operation; the test
//! then pushes advertisements, notifications and link losses by hand.

use crate::domain::error::RadioError;
use crate::domain::models::{Address, Advertisement, ConnectionHandle, RadioHandle, ServiceMap};
use crate::infrastructure::bluetooth::protocol::ENABLE_NOTIFICATION_VALUE;
use crate::infrastructure::bluetooth::radio::{LinkEvent, PairedDevice, Radio, ScanEvent, ScanFilter};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// How a scripted operation resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Immediate,
    After(Duration),
    Fail,
    /// The operation never completes
    Never,
}

impl Response {
    async fn settle(self) -> bool {
        match self {
            Response::Immediate => true,
            Response::After(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
            Response::Fail => false,
            Response::Never => std::future::pending().await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockPeripheral {
    services: ServiceMap,
    values: HashMap<(Uuid, Uuid), Vec<u8>>,
    connect: Response,
    discover: Response,
    read: Response,
    write: Response,
    subscribe: Response,
    write_echo: Option<Vec<u8>>,
}

impl MockPeripheral {
    pub fn new(services: ServiceMap) -> Self {
        Self {
            services,
            values: HashMap::new(),
            connect: Response::Immediate,
            discover: Response::Immediate,
            read: Response::Immediate,
            write: Response::Immediate,
            subscribe: Response::Immediate,
            write_echo: None,
        }
    }

    pub fn with_value(mut self, service: Uuid, characteristic: Uuid, value: impl Into<Vec<u8>>) -> Self {
        self.values.insert((service, characteristic), value.into());
        self
    }

    pub fn connect(mut self, response: Response) -> Self {
        self.connect = response;
        self
    }

    pub fn discover(mut self, response: Response) -> Self {
        self.discover = response;
        self
    }

    pub fn read(mut self, response: Response) -> Self {
        self.read = response;
        self
    }

    pub fn write(mut self, response: Response) -> Self {
        self.write = response;
        self
    }

    pub fn subscribe(mut self, response: Response) -> Self {
        self.subscribe = response;
        self
    }

    /// Confirm writes with these bytes instead of the payload
    pub fn echo_on_write(mut self, confirmed: impl Into<Vec<u8>>) -> Self {
        self.write_echo = Some(confirmed.into());
        self
    }
}

#[derive(Debug)]
struct MockLink {
    address: Address,
    events: mpsc::UnboundedSender<LinkEvent>,
}

#[derive(Debug, Default)]
struct MockState {
    scan_sink: Option<mpsc::UnboundedSender<ScanEvent>>,
    scan_filter: Option<ScanFilter>,
    scan_starts: usize,
    scan_start_failures: VecDeque<i32>,
    peripherals: HashMap<Address, MockPeripheral>,
    links: HashMap<u64, MockLink>,
    next_link: u64,
    disconnects: HashMap<Address, usize>,
    writes: Vec<(Address, Uuid, Vec<u8>)>,
    paired: Vec<PairedDevice>,
    refresh_supported: bool,
    refreshes: usize,
}

#[derive(Debug, Default)]
pub struct MockRadio {
    state: Mutex<MockState>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_peripheral(&self, address: impl Into<Address>, peripheral: MockPeripheral) {
        self.lock().peripherals.insert(address.into(), peripheral);
    }

    pub fn handle_for(address: &Address) -> RadioHandle {
        RadioHandle::new(format!("mock:{}", address))
    }

    /// Push an advertisement; returns false when not scanning
    pub fn advertise(&self, address: impl Into<Address>, name: Option<&str>, signal: i16) -> bool {
        let address = address.into();
        let advertisement = Advertisement {
            handle: Self::handle_for(&address),
            address,
            name: name.map(str::to_string),
            signal,
        };
        self.push_scan_event(ScanEvent::Advertisement(advertisement))
    }

    /// Abort the running scan with a platform error code
    pub fn fail_scan(&self, code: i32) -> bool {
        self.push_scan_event(ScanEvent::Failed(RadioError::ScanFailed { code }))
    }

    /// Drop the advertisement channel without a stop request
    pub fn close_scan_channel(&self) -> bool {
        self.lock().scan_sink.take().is_some()
    }

    /// Make the next `start_scan` fail with `code`
    pub fn fail_next_scan_start(&self, code: i32) {
        self.lock().scan_start_failures.push_back(code);
    }

    fn push_scan_event(&self, event: ScanEvent) -> bool {
        match &self.lock().scan_sink {
            Some(sink) => sink.send(event).is_ok(),
            None => false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scan_sink.is_some()
    }

    pub fn scan_starts(&self) -> usize {
        self.lock().scan_starts
    }

    pub fn scan_filter(&self) -> Option<ScanFilter> {
        self.lock().scan_filter.clone()
    }

    /// Push a characteristic change on the open link to `address`
    pub fn notify(&self, address: &Address, service: Uuid, characteristic: Uuid, value: impl Into<Vec<u8>>) -> bool {
        let state = self.lock();
        let Some(link) = state.links.values().find(|link| link.address == *address) else {
            return false;
        };
        link.events
            .send(LinkEvent::ValueChanged {
                service,
                characteristic,
                value: value.into(),
            })
            .is_ok()
    }

    /// Simulate the peer going away
    pub fn drop_link(&self, address: &Address) -> bool {
        let mut state = self.lock();
        let Some(id) = state
            .links
            .iter()
            .find(|(_, link)| link.address == *address)
            .map(|(id, _)| *id)
        else {
            return false;
        };
        match state.links.remove(&id) {
            Some(link) => link.events.send(LinkEvent::Disconnected).is_ok(),
            None => false,
        }
    }

    pub fn disconnects(&self, address: &Address) -> usize {
        self.lock().disconnects.get(address).copied().unwrap_or(0)
    }

    pub fn open_links(&self) -> usize {
        self.lock().links.len()
    }

    pub fn writes(&self) -> Vec<(Address, Uuid, Vec<u8>)> {
        self.lock().writes.clone()
    }

    pub fn set_paired(&self, paired: Vec<PairedDevice>) {
        self.lock().paired = paired;
    }

    pub fn set_refresh_supported(&self, supported: bool) {
        self.lock().refresh_supported = supported;
    }

    pub fn refreshes(&self) -> usize {
        self.lock().refreshes
    }

    fn peripheral(&self, address: &Address) -> Result<MockPeripheral, RadioError> {
        self.lock()
            .peripherals
            .get(address)
            .cloned()
            .ok_or_else(|| RadioError::NotFound(address.to_string()))
    }
}

#[async_trait]
impl Radio for MockRadio {
    fn start_scan(
        &self,
        filter: &ScanFilter,
        sink: mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<(), RadioError> {
        let mut state = self.lock();
        state.scan_starts += 1;
        if let Some(code) = state.scan_start_failures.pop_front() {
            return Err(RadioError::ScanFailed { code });
        }
        state.scan_filter = Some(filter.clone());
        state.scan_sink = Some(sink);
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), RadioError> {
        self.lock().scan_sink = None;
        Ok(())
    }

    async fn connect(
        &self,
        _handle: &RadioHandle,
        address: &Address,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<ConnectionHandle, RadioError> {
        let peripheral = self.peripheral(address)?;
        if !peripheral.connect.settle().await {
            return Err(RadioError::ConnectFailed(format!("{} refused", address)));
        }

        let mut state = self.lock();
        state.next_link += 1;
        let id = state.next_link;
        state.links.insert(
            id,
            MockLink {
                address: address.clone(),
                events,
            },
        );
        Ok(ConnectionHandle {
            id,
            address: address.clone(),
        })
    }

    async fn discover(&self, link: &ConnectionHandle) -> Result<ServiceMap, RadioError> {
        let peripheral = self.peripheral(&link.address)?;
        if !peripheral.discover.settle().await {
            return Err(RadioError::Gatt { status: 133 });
        }
        Ok(peripheral.services)
    }

    async fn read(
        &self,
        link: &ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError> {
        let peripheral = self.peripheral(&link.address)?;
        if !peripheral.read.settle().await {
            return Err(RadioError::Gatt { status: 2 });
        }
        Ok(peripheral
            .values
            .get(&(service, characteristic))
            .cloned()
            .unwrap_or_default())
    }

    async fn write(
        &self,
        link: &ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<Vec<u8>, RadioError> {
        let peripheral = self.peripheral(&link.address)?;
        if !peripheral.write.settle().await {
            return Err(RadioError::Gatt { status: 3 });
        }

        let mut state = self.lock();
        state
            .writes
            .push((link.address.clone(), characteristic, payload.to_vec()));
        if let Some(stored) = state.peripherals.get_mut(&link.address) {
            stored
                .values
                .insert((service, characteristic), payload.to_vec());
        }
        Ok(peripheral.write_echo.unwrap_or_else(|| payload.to_vec()))
    }

    async fn subscribe(
        &self,
        link: &ConnectionHandle,
        _service: Uuid,
        _characteristic: Uuid,
        _descriptor: Uuid,
    ) -> Result<Vec<u8>, RadioError> {
        let peripheral = self.peripheral(&link.address)?;
        if !peripheral.subscribe.settle().await {
            return Err(RadioError::Gatt { status: 3 });
        }
        Ok(ENABLE_NOTIFICATION_VALUE.to_vec())
    }

    async fn disconnect(&self, link: &ConnectionHandle) {
        let mut state = self.lock();
        state.links.remove(&link.id);
        *state.disconnects.entry(link.address.clone()).or_default() += 1;
    }

    fn refresh_cache(&self, _link: &ConnectionHandle) -> bool {
        let mut state = self.lock();
        if state.refresh_supported {
            state.refreshes += 1;
        }
        state.refresh_supported
    }

    fn paired_devices(&self) -> Vec<PairedDevice> {
        self.lock().paired.clone()
    }
}
