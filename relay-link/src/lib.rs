//! Device link and controller for CH340/CH341 USB relay modules.
//!
//! [`DeviceLink`] owns the serial connection and runs one request/reply
//! exchange at a time. [`RelayController`] sits on top, keeps the last known
//! relay state and notifies observers when it changes. Interactive front ends
//! drive the controller through a [`RelayHandle`] so serial I/O never blocks
//! their own loop.

pub mod config;
pub mod controller;
pub mod error;
pub mod link;
pub mod protocol;
pub mod tracing;
pub mod transport;
pub mod types;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::LinkConfig;
pub use controller::{RelayController, SubscriptionId};
pub use error::{LinkError, Result};
pub use link::DeviceLink;
pub use types::{DevicePath, FaultReason, LinkState, RelayState, Status};
pub use worker::{RelayHandle, WorkerCommand, WorkerConfig, WorkerError, WorkerEvent};
