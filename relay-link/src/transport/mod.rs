//! Physical transport to the relay module.
//!
//! The link never touches the OS directly: it asks a [`Connector`] to
//! resolve the device node and open a byte stream on it. [`SerialConnector`]
//! is the real implementation (USB discovery plus `tokio-serial`); tests plug
//! in an in-memory device instead.

pub mod usb;

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, StopBits,
};

use crate::{
    config::LinkConfig,
    error::{LinkError, Result},
    tracing::prelude::*,
    types::DevicePath,
};

pub use usb::{UsbSerialPort, RELAY_BRIDGE_IDS};

/// Byte stream to the relay hardware.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Resolves and opens the relay's serial endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Find the device node to open. Called on every connect attempt.
    async fn resolve(&self) -> Result<DevicePath>;

    /// Open the node with the relay's fixed line settings.
    async fn open(&self, path: &DevicePath) -> Result<Box<dyn Transport>>;
}

/// Node used when discovery finds nothing.
#[cfg(target_os = "linux")]
pub const DEFAULT_DEVICE: &str = "/dev/ttyUSB0";
#[cfg(target_os = "macos")]
pub const DEFAULT_DEVICE: &str = "/dev/cu.wchusbserial1410";
#[cfg(windows)]
pub const DEFAULT_DEVICE: &str = "COM3";
#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
pub const DEFAULT_DEVICE: &str = "/dev/ttyU0";

/// How the device node is found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLocator {
    /// Always this node.
    Fixed(DevicePath),
    /// USB discovery, then [`DEFAULT_DEVICE`].
    Discover,
}

impl DeviceLocator {
    pub fn from_config(config: &LinkConfig) -> Self {
        match &config.device {
            Some(path) => DeviceLocator::Fixed(path.clone()),
            None => DeviceLocator::Discover,
        }
    }

    pub async fn resolve(&self) -> Result<DevicePath> {
        match self {
            DeviceLocator::Fixed(path) => {
                if path.exists() {
                    Ok(path.clone())
                } else {
                    Err(LinkError::NotFound(format!("{} does not exist", path)))
                }
            }
            DeviceLocator::Discover => discover().await,
        }
    }
}

async fn discover() -> Result<DevicePath> {
    // udev enumeration is blocking sysfs I/O
    let ports = tokio::task::spawn_blocking(usb::enumerate)
        .await
        .map_err(|e| LinkError::Io(io::Error::other(e)))?;

    match ports {
        Ok(ports) => {
            if let Some(port) = usb::select_relay_port(&ports) {
                debug!(
                    node = %port.device_node,
                    vid = %format!("{:04x}", port.vid),
                    pid = %format!("{:04x}", port.pid),
                    "Selected relay port"
                );
                return Ok(DevicePath::new(&port.device_node));
            }
            debug!(port_count = ports.len(), "No relay bridge among USB serial ports");
        }
        Err(e) => {
            debug!(error = %e, "USB enumeration failed, trying default node");
        }
    }

    let fallback = DevicePath::new(DEFAULT_DEVICE);
    if fallback.exists() {
        Ok(fallback)
    } else {
        Err(LinkError::NotFound(
            "no CH340/CH341 serial device attached".to_string(),
        ))
    }
}

/// Opens real serial ports via `tokio-serial`.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    locator: DeviceLocator,
    baud: u32,
}

impl SerialConnector {
    pub fn new(locator: DeviceLocator, baud: u32) -> Self {
        Self { locator, baud }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(DeviceLocator::from_config(config), config.baud)
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn resolve(&self) -> Result<DevicePath> {
        self.locator.resolve().await
    }

    async fn open(&self, path: &DevicePath) -> Result<Box<dyn Transport>> {
        // Line framing is fixed by the module: 8N1, no flow control.
        let stream = tokio_serial::new(path.to_port_name(), self.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| open_error(path, e))?;

        // Bytes queued before we opened belong to nobody's request.
        stream.clear(ClearBuffer::Input)?;

        debug!(device = %path, baud = self.baud, "Serial port opened");
        Ok(Box::new(stream))
    }
}

fn open_error(path: &DevicePath, err: tokio_serial::Error) -> LinkError {
    match err.kind() {
        tokio_serial::ErrorKind::NoDevice
        | tokio_serial::ErrorKind::Io(io::ErrorKind::NotFound) => {
            LinkError::NotFound(format!("{}: {}", path, err.description))
        }
        tokio_serial::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            LinkError::PermissionDenied(path.clone())
        }
        _ => err.into(),
    }
}
