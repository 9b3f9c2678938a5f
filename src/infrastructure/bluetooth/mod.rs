//! Bluetooth Module
//!
//! Framing and link management for the BLE pin-grid display.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    HardwareService                       │
//! │  (Actor owning the link; driven through HardwareHandle)  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼──────────────┐
//!         │             │              │
//!         ▼             ▼              ▼
//! ┌─────────────┐ ┌────────────┐ ┌────────────┐
//! │ Dispatcher  │ │ Connection │ │  Protocol  │
//! │             │ │            │ │            │
//! │ - full/diff │ │ - discovery│ │ - packing  │
//! │   choice    │ │ - reconnect│ │ - frames   │
//! │ - sanitize  │ │ - status   │ │ - checksum │
//! └──────┬──────┘ └─────┬──────┘ └────────────┘
//!        │              │
//!        ▼              ▼
//! ┌─────────────┐ ┌──────────────────────────┐
//! │  Scheduler  │─▶│ Transport (WinRT / Sim)  │
//! └─────────────┘ └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, grid packing, frame building and decoding
//! - [`transport`] - Platform BLE abstraction
//! - [`scheduler`] - Single-flight FIFO write queue
//! - [`connection`] - Link session, reconnection and status handling
//! - [`dispatcher`] - Full/diff frame selection
//! - [`service`] - Actor tying it together
//! - [`simulated`] - In-process device for tests and `--simulate`

pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod scheduler;
pub mod service;
pub mod simulated;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

pub use service::{HardwareHandle, HardwareService};
