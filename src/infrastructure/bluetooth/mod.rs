//! Bluetooth Module
//!
//! BLE command transport for the dormitory door locks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  CommandOrchestrator                     │
//! │  (one command at a time: pacing, retry, response wait)   │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────┐
//! │                   BluetoothService                       │
//! │  (transport link: the single connection and its events)  │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │  Scanner  │  │ Connection │  │   Radio   │
//! │           │  │            │  │           │
//! │ - Name    │  │ - Connect  │  │ - btleplug│
//! │   matching│  │ - GATT     │  │   backend │
//! │ - De-dup  │  │ - Notify   │  │           │
//! └───────────┘  └────────────┘  └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Frame encoding, additional data block, response decoding
//! - [`error`] - Transport and command errors
//! - [`radio`] - Backend traits the transport talks through
//! - [`btle`] - btleplug implementation of the backend traits
//! - [`scanner`] - Name matching and discovery
//! - [`connection`] - Connection, GATT resolution, notification subscription
//! - [`service`] - Transport link
//! - [`orchestrator`] - Command orchestrator

pub mod btle;
pub mod connection;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod radio;
pub mod scanner;
pub mod service;

#[cfg(test)]
pub(crate) mod fake;

pub use orchestrator::CommandOrchestrator;
pub use service::BluetoothService;
