//! Linux udev-based serial port enumeration.
//!
//! Scans the `tty` subsystem and, for every node with a USB ancestor, reads
//! VID/PID and descriptor strings from that `usb_device`. Ports without a
//! USB parent (built-in UARTs, virtual consoles) are skipped.
//!
//! udev handles are !Send; this runs synchronously and callers move it onto
//! a blocking thread so the handles never cross threads.

use super::UsbSerialPort;
use crate::{error::Result, tracing::prelude::*};

pub(super) fn enumerate() -> Result<Vec<UsbSerialPort>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("tty")?;

    let mut ports = Vec::new();
    for tty in enumerator.scan_devices()? {
        let Some(node) = tty.devnode().and_then(|p| p.to_str()).map(str::to_string) else {
            continue;
        };

        let usb = match tty.parent_with_subsystem_devtype("usb", "usb_device") {
            Ok(Some(usb)) => usb,
            Ok(None) => continue,
            Err(e) => {
                trace!(node = %node, error = %e, "Skipping tty, parent lookup failed");
                continue;
            }
        };

        let (Some(vid), Some(pid)) = (
            hex_attribute(&usb, "idVendor"),
            hex_attribute(&usb, "idProduct"),
        ) else {
            trace!(node = %node, "Skipping tty, USB parent has no VID/PID");
            continue;
        };

        let port = UsbSerialPort {
            vid,
            pid,
            serial_number: string_attribute(&usb, "serial"),
            manufacturer: string_attribute(&usb, "manufacturer"),
            product: string_attribute(&usb, "product"),
            device_node: node,
        };

        trace!(
            node = %port.device_node,
            vid = %format!("{:04x}", port.vid),
            pid = %format!("{:04x}", port.pid),
            product = ?port.product,
            "Found USB serial port"
        );
        ports.push(port);
    }

    debug!(port_count = ports.len(), "USB serial enumeration complete");
    Ok(ports)
}

// VID and PID attributes are 4 hex digits, e.g. "1a86".
fn hex_attribute(device: &udev::Device, name: &str) -> Option<u16> {
    let raw = device.attribute_value(name)?.to_str()?;
    u16::from_str_radix(raw.trim(), 16).ok()
}

fn string_attribute(device: &udev::Device, name: &str) -> Option<String> {
    device
        .attribute_value(name)
        .and_then(|v| v.to_str())
        .map(|s| s.trim().to_string())
}
