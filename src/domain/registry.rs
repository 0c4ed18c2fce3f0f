//! Device Registry
//!
//! Maps hardware addresses to the most recent [`DeviceRecord`] seen for them
//! and decides when a device counts as lost. Safe to share between the scan
//! loop and any number of reader threads.

use crate::domain::models::{Address, Advertisement, DeviceRecord, Observation};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<Address, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Address, DeviceRecord>> {
        // Every mutation is a single insert/remove, so a poisoned map is still consistent
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or refresh the record for an advertisement.
    ///
    /// Returns whether this was the first sighting of the address, together
    /// with a copy of the record as stored.
    pub fn observe(&self, advertisement: &Advertisement, now: Instant) -> (Observation, DeviceRecord) {
        let mut devices = self.lock();
        match devices.get_mut(&advertisement.address) {
            Some(record) => {
                record.last_seen_at = now;
                record.signal_strength = advertisement.signal;
                record.radio_handle = advertisement.handle.clone();
                // Scan responses often omit the name; keep the last one we saw
                if advertisement.name.is_some() {
                    record.display_name = advertisement.name.clone();
                }
                (Observation::Update, record.clone())
            }
            None => {
                let record = DeviceRecord::from_advertisement(advertisement, now);
                devices.insert(record.address.clone(), record.clone());
                (Observation::FirstSighting, record)
            }
        }
    }

    /// Remove every record older than `ttl` that has no live session.
    ///
    /// Returns the removed records so the caller can report them lost.
    pub fn sweep(
        &self,
        now: Instant,
        ttl: Duration,
        sessioned: &HashSet<Address>,
    ) -> Vec<DeviceRecord> {
        let mut devices = self.lock();
        let stale: Vec<Address> = devices
            .values()
            .filter(|record| now.saturating_duration_since(record.last_seen_at) > ttl)
            .filter(|record| !sessioned.contains(&record.address))
            .map(|record| record.address.clone())
            .collect();

        let mut lost: Vec<DeviceRecord> = stale
            .iter()
            .filter_map(|address| devices.remove(address))
            .collect();
        lost.sort_by(|a, b| a.address.cmp(&b.address));

        if !lost.is_empty() {
            debug!("Sweep evicted {} of {} devices", lost.len(), lost.len() + devices.len());
        }
        lost
    }

    /// Refresh `last_seen_at` without an advertisement.
    ///
    /// Used when a session ends so the device is not evicted by the very next
    /// sweep; a connected peripheral usually stops advertising.
    pub fn touch(&self, address: &Address, now: Instant) -> bool {
        match self.lock().get_mut(address) {
            Some(record) => {
                record.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, address: &Address) -> Option<DeviceRecord> {
        self.lock().get(address).cloned()
    }

    /// Copies of all records, ordered by address
    pub fn all(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.address.cmp(&b.address));
        records
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
