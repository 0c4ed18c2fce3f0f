//! BlueManager
//!
//! A Bluetooth peripheral discovery and session engine. A duty-cycled scan
//! loop keeps a registry of nearby devices; sessions connect, discover
//! services and run one read, write or subscribe action at a time; results
//! reach the application through listener callbacks.

pub mod domain;
pub mod infrastructure;

pub use domain::error::{RadioError, Rejection};
pub use domain::models::{
    ActionKind, ActionRequest, Address, DeviceRecord, EngineEvent, SessionState,
};
pub use domain::settings::{EngineConfig, Settings, SettingsService};
pub use infrastructure::bluetooth::listeners::{BlueListener, ChannelListener};
pub use infrastructure::bluetooth::radio::{Radio, ScanFilter};
pub use infrastructure::bluetooth::scanner::{ScanOptions, ScanPhase};
pub use infrastructure::bluetooth::BlueManager;
