//! USB serial port enumeration.
//!
//! Lists the serial device nodes backed by USB devices together with the
//! identifying attributes of the USB device. Enumeration only reads system
//! metadata; it never opens or writes to a port.
//!
//! ## Platform Support
//!
//! - **Linux**: udev, walking from each tty node to its USB parent
//! - **Other**: the port listing of `tokio-serial`

use crate::error::Result;

/// VID:PID pairs of the WCH USB-serial bridges used on relay modules.
pub const RELAY_BRIDGE_IDS: &[(u16, u16)] = &[
    (0x1a86, 0x7523), // CH340
    (0x1a86, 0x5523), // CH341
];

/// A serial device node and the USB device behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbSerialPort {
    /// USB vendor ID
    pub vid: u16,
    /// USB product ID
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    /// Device node, e.g. "/dev/ttyUSB0"
    pub device_node: String,
}

impl UsbSerialPort {
    /// Whether the port belongs to a CH340/CH341 bridge.
    pub fn is_relay_bridge(&self) -> bool {
        RELAY_BRIDGE_IDS.contains(&(self.vid, self.pid))
    }

    fn is_usb_serial_node(&self) -> bool {
        self.device_node
            .rsplit('/')
            .next()
            .is_some_and(|name| name.starts_with("ttyUSB"))
    }
}

/// List USB serial ports, sorted by device node for stable ordering.
pub fn enumerate() -> Result<Vec<UsbSerialPort>> {
    let mut ports = platform_enumerate()?;
    ports.sort_by(|a, b| a.device_node.cmp(&b.device_node));
    Ok(ports)
}

/// Pick the port a relay most likely sits on.
///
/// First CH340/CH341 bridge wins; otherwise the first generic `ttyUSB*`
/// node. The connect probe is what actually confirms a relay answers.
pub fn select_relay_port(ports: &[UsbSerialPort]) -> Option<&UsbSerialPort> {
    ports
        .iter()
        .find(|p| p.is_relay_bridge())
        .or_else(|| ports.iter().find(|p| p.is_usb_serial_node()))
}

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
fn platform_enumerate() -> Result<Vec<UsbSerialPort>> {
    linux::enumerate()
}

#[cfg(not(target_os = "linux"))]
fn platform_enumerate() -> Result<Vec<UsbSerialPort>> {
    use tokio_serial::SerialPortType;

    let ports = tokio_serial::available_ports()?
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => Some(UsbSerialPort {
                vid: usb.vid,
                pid: usb.pid,
                serial_number: usb.serial_number,
                manufacturer: usb.manufacturer,
                product: usb.product,
                device_node: port.port_name,
            }),
            _ => None,
        })
        .collect();

    Ok(ports)
}
