use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

/// Hardware address of a peripheral, normalised to upper case.
///
/// This is the unique key of the device registry and of the session table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_uppercase())
    }

    /// Format a 48-bit Bluetooth address as `AA:BB:CC:DD:EE:FF`
    pub fn from_u64(raw: u64) -> Self {
        let bytes = raw.to_be_bytes();
        let parts: Vec<String> = bytes[2..].iter().map(|b| format!("{:02X}", b)).collect();
        Self(parts.join(":"))
    }

    /// Parse the address back into its 48-bit form, if it is a MAC address
    pub fn to_u64(&self) -> Option<u64> {
        let hex: String = self.0.chars().filter(|c| *c != ':' && *c != '-').collect();
        if hex.is_empty() || hex.len() > 12 {
            return None;
        }
        u64::from_str_radix(&hex, 16).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Address {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// Opaque reference into a radio backend, needed to open a link.
///
/// Only the backend that produced the handle knows how to interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RadioHandle(String);

impl RadioHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A live link to a peripheral, issued by the radio on connect
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub id: u64,
    pub address: Address,
}

/// A single advertisement observed while scanning
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: Address,
    pub name: Option<String>,
    /// Signal strength in dBm. Advisory only.
    pub signal: i16,
    pub handle: RadioHandle,
}

/// A known peripheral as tracked by the device registry.
///
/// Callers only ever receive copies; the registry owns the live record.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub address: Address,
    pub display_name: Option<String>,
    pub last_seen_at: Instant,
    pub signal_strength: i16,
    pub radio_handle: RadioHandle,
}

impl DeviceRecord {
    pub fn from_advertisement(advertisement: &Advertisement, seen_at: Instant) -> Self {
        Self {
            address: advertisement.address.clone(),
            display_name: advertisement.name.clone(),
            last_seen_at: seen_at,
            signal_strength: advertisement.signal,
            radio_handle: advertisement.handle.clone(),
        }
    }

    /// Name for display purposes, falling back to the address
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(self.address.as_str())
    }
}

/// Outcome of feeding an advertisement into the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    FirstSighting,
    Update,
}

/// What an action does to its target characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Read,
    Write(Vec<u8>),
    Subscribe,
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write(_) => "write",
            Self::Subscribe => "subscribe",
        }
    }
}

/// A read, write or subscribe request against one characteristic.
///
/// Requests are immutable once built; the pipeline hands the same value
/// back in every outcome callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    kind: ActionKind,
    service: Uuid,
    characteristic: Uuid,
}

impl ActionRequest {
    pub fn read(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            kind: ActionKind::Read,
            service,
            characteristic,
        }
    }

    pub fn write(service: Uuid, characteristic: Uuid, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ActionKind::Write(payload.into()),
            service,
            characteristic,
        }
    }

    pub fn subscribe(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            kind: ActionKind::Subscribe,
            service,
            characteristic,
        }
    }

    pub fn kind(&self) -> &ActionKind {
        &self.kind
    }

    pub fn service(&self) -> Uuid {
        self.service
    }

    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// `(service, characteristic)` pair this action targets
    pub fn target(&self) -> (Uuid, Uuid) {
        (self.service, self.characteristic)
    }
}

impl fmt::Display for ActionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}",
            self.kind.name(),
            self.service,
            self.characteristic
        )
    }
}

/// A characteristic found during service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

impl CharacteristicInfo {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            descriptors: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, descriptor: Uuid) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn has_descriptor(&self, descriptor: Uuid) -> bool {
        self.descriptors.contains(&descriptor)
    }
}

/// Services and characteristics enumerated on a connected peripheral
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMap {
    services: HashMap<Uuid, Vec<CharacteristicInfo>>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: Uuid, characteristics: Vec<CharacteristicInfo>) -> Self {
        self.insert(service, characteristics);
        self
    }

    pub fn insert(&mut self, service: Uuid, characteristics: Vec<CharacteristicInfo>) {
        self.services
            .entry(service)
            .or_default()
            .extend(characteristics);
    }

    pub fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<&CharacteristicInfo> {
        self.services
            .get(&service)?
            .iter()
            .find(|c| c.uuid == characteristic)
    }

    pub fn services(&self) -> impl Iterator<Item = (&Uuid, &Vec<CharacteristicInfo>)> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Lifecycle of a single session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    ServiceDiscovery,
    Ready,
    Closing,
    Closed,
    /// Connect or discovery failed outright
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::ServiceDiscovery => "service discovery",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Every listener callback as a value, for channel-based consumers
#[derive(Debug, Clone)]
pub enum EngineEvent {
    DeviceFound(DeviceRecord),
    DeviceUpdated(DeviceRecord),
    DeviceLost(DeviceRecord),
    ScanError(i32),
    DeviceReady(Address),
    DeviceClosed(Address),
    ActionSucceeded {
        address: Address,
        action: ActionRequest,
        value: Vec<u8>,
    },
    ActionFailed {
        address: Address,
        action: ActionRequest,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_normalisation() {
        let address = Address::new(" aa:bb:cc:dd:ee:ff ");
        assert_eq!(address.as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(address, Address::from("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn test_address_u64_round_trip() {
        let address = Address::from_u64(0x0011_22AA_BBCC);
        assert_eq!(address.as_str(), "00:11:22:AA:BB:CC");
        assert_eq!(address.to_u64(), Some(0x0011_22AA_BBCC));
        assert_eq!(Address::new("not an address").to_u64(), None);
    }

    #[test]
    fn test_service_map_lookup() {
        let service = Uuid::from_u128(1);
        let characteristic = Uuid::from_u128(2);
        let map = ServiceMap::new()
            .with_service(service, vec![CharacteristicInfo::new(characteristic)]);

        assert!(map.characteristic(service, characteristic).is_some());
        assert!(map.characteristic(service, Uuid::from_u128(3)).is_none());
        assert!(map.characteristic(Uuid::from_u128(9), characteristic).is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_record_label_falls_back_to_address() {
        let advertisement = Advertisement {
            address: Address::new("AA:BB"),
            name: Some(String::new()),
            signal: -40,
            handle: RadioHandle::new("AA:BB"),
        };
        let record = DeviceRecord::from_advertisement(&advertisement, Instant::now());
        assert_eq!(record.label(), "AA:BB");
    }
}
