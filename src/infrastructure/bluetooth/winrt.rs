//! WinRT Radio
//!
//! Bluetooth LE through the Windows Runtime: an advertisement watcher for
//! scanning and `BluetoothLEDevice` + GATT for links.

use crate::domain::error::RadioError;
use crate::domain::models::{
    Address, Advertisement, CharacteristicInfo, ConnectionHandle, RadioHandle, ServiceMap,
};
use crate::infrastructure::bluetooth::protocol::{
    CLIENT_CHARACTERISTIC_CONFIG_UUID, ENABLE_NOTIFICATION_VALUE,
};
use crate::infrastructure::bluetooth::radio::{LinkEvent, Radio, ScanEvent, ScanFilter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{
    BluetoothCacheMode, BluetoothConnectionStatus, BluetoothError, BluetoothLEDevice,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

impl From<windows::core::Error> for RadioError {
    fn from(e: windows::core::Error) -> Self {
        RadioError::Platform(e.to_string())
    }
}

fn to_guid(uuid: Uuid) -> GUID {
    let (data1, data2, data3, data4) = uuid.as_fields();
    GUID {
        data1,
        data2,
        data3,
        data4: *data4,
    }
}

fn from_guid(guid: GUID) -> Uuid {
    Uuid::from_fields(guid.data1, guid.data2, guid.data3, &guid.data4)
}

fn buffer_to_vec(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn vec_to_buffer(bytes: &[u8]) -> windows::core::Result<IBuffer> {
    let writer = DataWriter::new()?;
    writer.WriteBytes(bytes)?;
    writer.DetachBuffer()
}

fn check_status(status: GattCommunicationStatus) -> Result<(), RadioError> {
    if status == GattCommunicationStatus::Success {
        Ok(())
    } else {
        Err(RadioError::Gatt { status: status.0 })
    }
}

/// Radio handles carry the 48-bit address as hex
fn parse_handle(handle: &RadioHandle) -> Result<u64, RadioError> {
    u64::from_str_radix(handle.as_str(), 16)
        .map_err(|_| RadioError::NotFound(format!("bad radio handle {}", handle.as_str())))
}

struct WinRtLink {
    device: BluetoothLEDevice,
    session: Option<GattSession>,
    status_token: i64,
    characteristics: HashMap<(Uuid, Uuid), GattCharacteristic>,
    value_tokens: Vec<(GattCharacteristic, i64)>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl WinRtLink {
    fn release(self) {
        for (characteristic, token) in self.value_tokens {
            let _ = characteristic.RemoveValueChanged(token);
        }
        let _ = self.device.RemoveConnectionStatusChanged(self.status_token);
        if let Some(session) = self.session {
            let _ = session.Close();
        }
        let _ = self.device.Close();
    }
}

#[derive(Default)]
pub struct WinRtRadio {
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
    links: Mutex<HashMap<u64, WinRtLink>>,
    next_link: AtomicU64,
}

impl WinRtRadio {
    pub fn new() -> Self {
        Self::default()
    }

    fn watcher(&self) -> MutexGuard<'_, Option<BluetoothLEAdvertisementWatcher>> {
        self.watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn links(&self) -> MutexGuard<'_, HashMap<u64, WinRtLink>> {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn device(&self, link: &ConnectionHandle) -> Result<BluetoothLEDevice, RadioError> {
        self.links()
            .get(&link.id)
            .map(|l| l.device.clone())
            .ok_or(RadioError::Disconnected)
    }

    fn characteristic(
        &self,
        link: &ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<GattCharacteristic, RadioError> {
        self.links()
            .get(&link.id)
            .ok_or(RadioError::Disconnected)?
            .characteristics
            .get(&(service, characteristic))
            .cloned()
            .ok_or_else(|| RadioError::NotFound(format!("{}/{}", service, characteristic)))
    }

    /// Keep the link up between GATT operations
    async fn maintain_connection(device: &BluetoothLEDevice) -> windows::core::Result<GattSession> {
        let device_id = device.BluetoothDeviceId()?;
        let session = GattSession::FromDeviceIdAsync(&device_id)?.await?;
        session.SetMaintainConnection(true)?;
        Ok(session)
    }
}

#[async_trait]
impl Radio for WinRtRadio {
    fn start_scan(
        &self,
        filter: &ScanFilter,
        sink: mpsc::UnboundedSender<ScanEvent>,
    ) -> Result<(), RadioError> {
        let mut current = self.watcher();
        if let Some(previous) = current.take() {
            let _ = previous.Stop();
        }

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;
        let service_uuids = watcher.AdvertisementFilter()?.Advertisement()?.ServiceUuids()?;
        for uuid in &filter.service_uuids {
            service_uuids.Append(to_guid(*uuid))?;
        }

        let sender = sink.clone();
        let received = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let raw = args.BluetoothAddress()?;
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    let advertisement = Advertisement {
                        address: Address::from_u64(raw),
                        name: (!name.is_empty()).then_some(name),
                        signal: args.RawSignalStrengthInDBm()?,
                        handle: RadioHandle::new(format!("{:012X}", raw)),
                    };
                    let _ = sender.send(ScanEvent::Advertisement(advertisement));
                }
                Ok(())
            },
        );
        watcher.Received(&received)?;

        let stopped = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let error = args.Error()?;
                    if error != BluetoothError::Success {
                        let _ = sink.send(ScanEvent::Failed(RadioError::ScanFailed { code: error.0 }));
                    }
                }
                Ok(())
            },
        );
        watcher.Stopped(&stopped)?;

        info!("Starting BLE advertisement watcher");
        watcher.Start()?;
        *current = Some(watcher);
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), RadioError> {
        if let Some(watcher) = self.watcher().take() {
            debug!("Stopping BLE advertisement watcher");
            watcher.Stop()?;
        }
        Ok(())
    }

    async fn connect(
        &self,
        handle: &RadioHandle,
        address: &Address,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<ConnectionHandle, RadioError> {
        let raw = parse_handle(handle)?;
        info!("Connecting to Bluetooth device: {}", address);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(raw)?
            .await
            .map_err(|e| RadioError::ConnectFailed(e.to_string()))?;

        let session = match Self::maintain_connection(&device).await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Failed to create GattSession for {}: {}", address, e);
                None
            }
        };

        let sender = events.clone();
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        let _ = sender.send(LinkEvent::Disconnected);
                    }
                }
                Ok(())
            });
        let status_token = device.ConnectionStatusChanged(&status_handler)?;

        let id = self.next_link.fetch_add(1, Ordering::Relaxed) + 1;
        self.links().insert(
            id,
            WinRtLink {
                device,
                session,
                status_token,
                characteristics: HashMap::new(),
                value_tokens: Vec::new(),
                events,
            },
        );
        Ok(ConnectionHandle {
            id,
            address: address.clone(),
        })
    }

    async fn discover(&self, link: &ConnectionHandle) -> Result<ServiceMap, RadioError> {
        let device = self.device(link)?;
        let services_result = device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        check_status(services_result.Status()?)?;

        let mut map = ServiceMap::new();
        let mut found = HashMap::new();
        let services = services_result.Services()?;
        for i in 0..services.Size()? {
            let service = services.GetAt(i)?;
            let service_uuid = from_guid(service.Uuid()?);

            let chars_result = service.GetCharacteristicsAsync()?.await?;
            if let Err(e) = check_status(chars_result.Status()?) {
                // Some services refuse access; skip them
                debug!("Characteristics of {} unavailable: {}", service_uuid, e);
                continue;
            }

            let characteristics = chars_result.Characteristics()?;
            let mut infos = Vec::new();
            for j in 0..characteristics.Size()? {
                let characteristic = characteristics.GetAt(j)?;
                let char_uuid = from_guid(characteristic.Uuid()?);
                let mut info = CharacteristicInfo::new(char_uuid);

                let descriptors_result = characteristic.GetDescriptorsAsync()?.await?;
                if descriptors_result.Status()? == GattCommunicationStatus::Success {
                    let descriptors = descriptors_result.Descriptors()?;
                    for k in 0..descriptors.Size()? {
                        info = info.with_descriptor(from_guid(descriptors.GetAt(k)?.Uuid()?));
                    }
                }

                found.insert((service_uuid, char_uuid), characteristic);
                infos.push(info);
            }
            map.insert(service_uuid, infos);
        }

        match self.links().get_mut(&link.id) {
            Some(stored) => stored.characteristics = found,
            None => return Err(RadioError::Disconnected),
        }
        info!("Discovered {} services on {}", map.len(), link.address);
        Ok(map)
    }

    async fn read(
        &self,
        link: &ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, RadioError> {
        let characteristic = self.characteristic(link, service, characteristic)?;
        let result = characteristic
            .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        check_status(result.Status()?)?;
        Ok(buffer_to_vec(&result.Value()?)?)
    }

    async fn write(
        &self,
        link: &ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<Vec<u8>, RadioError> {
        let characteristic = self.characteristic(link, service, characteristic)?;
        let buffer = vec_to_buffer(payload)?;
        let result = characteristic.WriteValueWithResultAsync(&buffer)?.await?;
        check_status(result.Status()?)?;
        // The stack only acknowledges success; it does not echo the value
        Ok(payload.to_vec())
    }

    async fn subscribe(
        &self,
        link: &ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<Vec<u8>, RadioError> {
        if descriptor != CLIENT_CHARACTERISTIC_CONFIG_UUID {
            return Err(RadioError::Unsupported("notification descriptor other than 0x2902"));
        }
        let target = self.characteristic(link, service, characteristic)?;
        let status = target
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )?
            .await?;
        check_status(status)?;

        let events = self
            .links()
            .get(&link.id)
            .map(|l| l.events.clone())
            .ok_or(RadioError::Disconnected)?;
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = buffer_to_vec(&args.CharacteristicValue()?)?;
                    let _ = events.send(LinkEvent::ValueChanged {
                        service,
                        characteristic,
                        value,
                    });
                }
                Ok(())
            },
        );
        let token = target.ValueChanged(&handler)?;
        if let Some(stored) = self.links().get_mut(&link.id) {
            stored.value_tokens.push((target, token));
        }
        Ok(ENABLE_NOTIFICATION_VALUE.to_vec())
    }

    async fn disconnect(&self, link: &ConnectionHandle) {
        let removed = self.links().remove(&link.id);
        if let Some(stored) = removed {
            info!("Disconnected from {}", link.address);
            stored.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_conversion_round_trip() {
        let uuid = Uuid::parse_str("c8c51726-81bc-483b-a052-f7a14ea3d281").unwrap();
        let guid = to_guid(uuid);
        assert_eq!(guid, GUID::from_u128(0xc8c51726_81bc_483b_a052_f7a14ea3d281));
        assert_eq!(from_guid(guid), uuid);
    }

    #[test]
    fn test_handle_parsing() {
        assert_eq!(parse_handle(&RadioHandle::new("0011223344AA")).unwrap(), 0x0011_2233_44AA);
        assert!(parse_handle(&RadioHandle::new("mock:1")).is_err());
    }
}
