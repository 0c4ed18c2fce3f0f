//! Error types for the discovery and session engine.
//!
//! Radio adapters report failures as [`RadioError`]; the engine converts them
//! into listener callbacks and never hands them to callers directly. Requests
//! the engine refuses up front come back as [`Rejection`].

use crate::domain::models::{Address, SessionState};
use uuid::Uuid;

/// Failure reported by a radio backend
#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    /// The adapter is switched off, missing, or permission was revoked
    #[error("radio unavailable: {0}")]
    Unavailable(String),

    #[error("scan failed with code {code}")]
    ScanFailed { code: i32 },

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// A GATT operation completed with a non-success status
    #[error("GATT operation failed with status {status}")]
    Gatt { status: i32 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("link disconnected")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error raised by the platform stack
    #[error("platform error: {0}")]
    Platform(String),
}

impl RadioError {
    /// Numeric code surfaced through `on_device_scan_error`
    pub fn code(&self) -> i32 {
        match self {
            Self::ScanFailed { code } | Self::Gatt { status: code } => *code,
            Self::Unavailable(_) => 1,
            Self::ConnectFailed(_) => 2,
            Self::NotFound(_) => 3,
            Self::Unsupported(_) => 4,
            Self::Disconnected => 5,
            Self::Io(_) => 6,
            Self::Platform(_) => 7,
        }
    }
}

/// A request refused synchronously, before anything reached the radio
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("{0} already has an open session")]
    AlreadySessioned(Address),

    #[error("{0} is not a discovered device")]
    UnknownDevice(Address),

    #[error("{0} has no session")]
    NoSession(Address),

    #[error("session for {address} is {state}, not ready")]
    NotReady {
        address: Address,
        state: SessionState,
    },

    #[error("{0} already has an action in flight")]
    ActionPending(Address),

    #[error("characteristic {characteristic} of service {service} was not discovered")]
    UnknownCharacteristic { service: Uuid, characteristic: Uuid },

    #[error("characteristic {0} has no notification descriptor")]
    NotifyUnsupported(Uuid),

    #[error("engine runtime has shut down")]
    EngineStopped,
}
