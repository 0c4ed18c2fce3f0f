//! Bluetooth Module
//!
//! Discovery, sessions and actions on top of a pluggable radio.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      BlueManager                         │
//! │     (Engine facade - public API for the application)     │
//! └──────┬──────────────┬──────────────┬───────────┬────────┘
//!        │              │              │           │
//!        ▼              ▼              ▼           ▼
//! ┌────────────┐ ┌─────────────┐ ┌──────────┐ ┌───────────┐
//! │  ScanLoop  │ │ Connection  │ │ Actions  │ │ Listeners │
//! │            │ │ Controller  │ │          │ │           │
//! │ - duty     │ │ - sessions  │ │ - read   │ │ - fan-out │
//! │   cycle    │ │ - discovery │ │ - write  │ │ - channel │
//! │ - eviction │ │   timeout   │ │ - notify │ │           │
//! └─────┬──────┘ └──────┬──────┘ └────┬─────┘ └───────────┘
//!       └───────────────┼─────────────┘
//!                       ▼
//!        ┌──────────────────────────────┐
//!        │   Radio (mock/stream/winrt)  │
//!        └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`radio`] - Radio capability trait and its event types
//! - [`scanner`] - Scan duty cycle and device eviction
//! - [`connection`] - Session runtime and the session table
//! - [`actions`] - Read / write / subscribe pipeline
//! - [`listeners`] - Listener trait, registration and fan-out
//! - [`service`] - Engine facade
//! - [`protocol`] - Well-known UUIDs and descriptor values
//! - [`stream`] - Byte-stream radio over any async transport
//! - [`mock`] - Scriptable in-memory radio
//! - `winrt` - Windows Runtime radio (Windows only)

pub mod actions;
pub mod connection;
pub mod listeners;
pub mod mock;
pub mod protocol;
pub mod radio;
pub mod scanner;
pub mod service;
pub mod stream;
pub mod timer;
#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use service::BlueManager;
