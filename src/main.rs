use anyhow::Context;
use blue_manager::domain::models::{Address, EngineEvent, RadioHandle};
use blue_manager::domain::settings::{Settings, SettingsService};
use blue_manager::infrastructure::bluetooth::listeners::ChannelListener;
use blue_manager::infrastructure::bluetooth::radio::{Radio, ScanFilter};
use blue_manager::infrastructure::bluetooth::scanner::ScanOptions;
use blue_manager::infrastructure::bluetooth::stream::{StreamPeer, StreamRadio, TcpConnector};
use blue_manager::infrastructure::bluetooth::BlueManager;
use blue_manager::infrastructure::logging::init_logger;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

/// Stream peers from the settings file take precedence over the platform radio
fn select_radio(settings: &Settings) -> anyhow::Result<Arc<dyn Radio>> {
    if !settings.stream_peers.is_empty() {
        let peers = settings
            .stream_peers
            .iter()
            .map(|peer| StreamPeer {
                address: peer.address.clone(),
                name: peer.name.clone(),
                handle: RadioHandle::new(peer.endpoint.clone()),
            })
            .collect();
        info!("Using stream radio with {} peers", settings.stream_peers.len());
        return Ok(Arc::new(StreamRadio::new(
            TcpConnector,
            peers,
            settings.engine.classic_service_uuid,
            settings.engine.notification_descriptor_uuid,
            settings.engine.buffer_size,
        )));
    }
    platform_radio()
}

#[cfg(windows)]
fn platform_radio() -> anyhow::Result<Arc<dyn Radio>> {
    use blue_manager::infrastructure::bluetooth::winrt::WinRtRadio;
    Ok(Arc::new(WinRtRadio::new()))
}

#[cfg(not(windows))]
fn platform_radio() -> anyhow::Result<Arc<dyn Radio>> {
    anyhow::bail!("No Bluetooth LE backend on this platform; configure stream_peers in the settings file")
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::DeviceFound(device) => {
            info!("Found {} [{}] {} dBm", device.label(), device.address, device.signal_strength)
        }
        EngineEvent::DeviceUpdated(_) => {}
        EngineEvent::DeviceLost(device) => info!("Lost {} [{}]", device.label(), device.address),
        EngineEvent::ScanError(code) => warn!("Scan error {}", code),
        EngineEvent::DeviceReady(address) => info!("{} ready", address),
        EngineEvent::DeviceClosed(address) => info!("{} closed", address),
        EngineEvent::ActionSucceeded {
            address,
            action,
            value,
        } => info!("{} on {}: {:02X?}", action, address, value),
        EngineEvent::ActionFailed { address, action } => warn!("{} on {} failed", action, address),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().context("Failed to load settings")?;
    let settings = settings_service.get().clone();

    let _logging_guard = init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting BlueManager");
    info!("Settings: {}", settings_service.path().display());

    let radio = select_radio(&settings)?;
    for paired in radio.paired_devices() {
        info!("Paired: {} ({})", paired.address, paired.name.as_deref().unwrap_or("?"));
    }

    let manager = BlueManager::new(radio, settings.engine.clone(), Handle::current());
    let (listener, mut events) = ChannelListener::new();
    manager.add_listener(Arc::new(listener));

    let options = ScanOptions {
        filter: ScanFilter {
            service_uuids: settings.filter_service_uuids.clone(),
            name_prefix: settings.filter_name_prefix.clone(),
        },
        ..ScanOptions::default()
    };
    manager.start_scan(options);

    // Reconnect to devices we know as soon as they show up
    let known: HashSet<Address> = settings.known_addresses.iter().cloned().collect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                log_event(&event);
                if let EngineEvent::DeviceFound(device) = &event {
                    if known.contains(&device.address) {
                        if let Err(e) = manager.open(&device.address) {
                            error!("Could not open {}: {}", device.address, e);
                        }
                    }
                }
            }
        }
    }

    manager.shutdown().await;

    // Give open sessions a moment to report their closure
    let grace = tokio::time::sleep(Duration::from_secs(2));
    tokio::pin!(grace);
    while !manager.sessioned_addresses().is_empty() {
        tokio::select! {
            _ = &mut grace => break,
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
        }
    }
    info!("BlueManager stopped");
    Ok(())
}
