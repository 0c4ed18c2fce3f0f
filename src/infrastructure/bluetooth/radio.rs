//! Radio capability
//!
//! The engine never talks to a Bluetooth stack directly. Each backend
//! implements [`Radio`]; scan results and unsolicited link events are pushed
//! through tokio channels handed to the backend, so they may originate on any
//! thread the platform likes.

use crate::domain::error::RadioError;
use crate::domain::models::{Address, Advertisement, ConnectionHandle, RadioHandle, ServiceMap};
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Pushed by a backend while scanning is enabled
#[derive(Debug)]
pub enum ScanEvent {
    Advertisement(Advertisement),
    /// The platform aborted the scan
    Failed(RadioError),
}

/// Pushed by a backend for an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The peer went away, or the underlying stream ended
    Disconnected,
    ValueChanged {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// What the backend should look for while scanning
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report peripherals advertising one of these services.
    /// Empty means report everything.
    pub service_uuids: Vec<Uuid>,
    /// Only report peripherals whose name starts with this prefix
    pub name_prefix: Option<String>,
}

impl ScanFilter {
    pub fn matches_name(&self, name: Option<&str>) -> bool {
        match &self.name_prefix {
            None => true,
            Some(prefix) => name.is_some_and(|name| name.starts_with(prefix.as_str())),
        }
    }
}

/// A device the platform already has a bond with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDevice {
    pub address: Address,
    pub name: Option<String>,
    pub handle: RadioHandle,
}

#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Enable scanning. Advertisements and scan failures go to `sink` until
    /// [`stop_scan`](Radio::stop_scan); the backend drops `sink` when it stops.
    fn start_scan(
        &self,
        filter: &ScanFilter,
        sink: mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<(), RadioError>;

    /// Disable scanning. Idempotent.
    fn stop_scan(&self) -> Result<(), RadioError>;

    /// Open a link. Unsolicited events for it go to `events`.
    async fn connect(
        &self,
        handle: &RadioHandle,
        address: &Address,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<ConnectionHandle, RadioError>;

    /// Enumerate services, characteristics and their descriptors
    async fn discover(&self, link: &ConnectionHandle) -> Result<ServiceMap, RadioError>;

    async fn read(
        &self,
        link: &ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError>;

    /// Write `payload` and return the value the peripheral confirmed
    async fn write(
        &self,
        link: &ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<Vec<u8>, RadioError>;

    /// Enable notifications by writing `descriptor`. Returns the value written;
    /// subsequent changes arrive as [`LinkEvent::ValueChanged`].
    async fn subscribe(
        &self,
        link: &ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<Vec<u8>, RadioError>;

    /// Close the link; returns once the backend confirms
    async fn disconnect(&self, link: &ConnectionHandle);

    /// Drop the platform's cached attribute table for `link`.
    /// Backends without such a cache return `false`.
    fn refresh_cache(&self, _link: &ConnectionHandle) -> bool {
        false
    }

    fn paired_devices(&self) -> Vec<PairedDevice> {
        Vec::new()
    }
}
