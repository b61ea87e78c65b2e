//! Typed Modbus TCP register model for Alfen Eve charging stations.
//!
//! Two roles share one register map:
//!
//! - [`simulator`] exposes the station's multi-unit holding registers over
//!   Modbus TCP and runs the mirror loop that echoes a commanded max current
//!   into the applied-current status register after a bounded delay, and
//! - [`hub::Hub`] polls those registers on a fixed interval, decodes them
//!   with [`codec`] into an atomically-published snapshot, notifies
//!   subscribers, and serializes clamped writes back.
//!
//! The [`map`] module is the shared source of truth: client-visible
//! addresses only, with the simulator's storage offset confined to its
//! dispatcher.

/// Utilities for encoding from and decoding to Modbus registers
pub mod codec;
/// Connection and polling configuration
pub mod config;
/// Crate error taxonomy
pub mod error;
/// Polling hub: snapshot, subscriptions and the clamped write path
pub mod hub;
/// The Alfen register map as typed field tables
pub mod map;
/// Simulated charging station (based on tokio-modbus [servers examples](https://github.com/slowtec/tokio-modbus/tree/main/examples))
pub mod simulator;

pub use config::HubConfig;
pub use error::{Error, Result};
pub use hub::{Hub, Snapshot, Subscription};
