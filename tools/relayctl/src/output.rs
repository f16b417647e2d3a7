//! Output formatting for relay state, ports and worker events.

use colored::Colorize;
use relay_link::{transport::UsbSerialPort, DevicePath, LinkState, RelayState, Status, WorkerEvent};

/// Output formatter configuration
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub use_color: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { use_color: true }
    }
}

/// Relay state word: ON green, OFF red, UNKNOWN yellow.
pub fn format_relay(state: RelayState, config: &OutputConfig) -> String {
    let text = state.to_string();
    if !config.use_color {
        return text;
    }
    match state {
        RelayState::On => text.green().bold().to_string(),
        RelayState::Off => text.red().bold().to_string(),
        RelayState::Unknown => text.yellow().to_string(),
    }
}

fn format_link(state: LinkState, config: &OutputConfig) -> String {
    let text = state.to_string();
    if !config.use_color {
        return text;
    }
    match state {
        LinkState::Connected => text.green().to_string(),
        LinkState::Connecting => text.normal().to_string(),
        LinkState::Disconnected | LinkState::Faulted(_) => text.yellow().to_string(),
    }
}

/// Status line. A relay that cannot be reached is never shown as plain
/// ON/OFF.
pub fn format_status(
    status: &Status,
    device: Option<&DevicePath>,
    config: &OutputConfig,
) -> String {
    let prefix = match device {
        Some(device) => format!("{}: ", device),
        None => String::new(),
    };

    if status.link.is_connected() {
        return format!("{}{}", prefix, format_relay(status.relay, config));
    }

    let unreachable = if config.use_color {
        "unreachable".yellow().to_string()
    } else {
        "unreachable".to_string()
    };
    let mut line = format!(
        "{}{} ({})",
        prefix,
        unreachable,
        format_link(status.link, config)
    );
    if status.relay != RelayState::Unknown {
        line.push_str(&format!(
            ", last known {}",
            format_relay(status.relay, config)
        ));
    }
    line
}

/// One port per line, with VID:PID and descriptor strings.
pub fn format_port(port: &UsbSerialPort, selected: bool, config: &OutputConfig) -> String {
    let ids = format!("{:04x}:{:04x}", port.vid, port.pid);
    let ids = if config.use_color && port.is_relay_bridge() {
        ids.cyan().to_string()
    } else {
        ids
    };

    let mut line = format!("{:<16} {}", port.device_node, ids);

    let description: Vec<&str> = [port.manufacturer.as_deref(), port.product.as_deref()]
        .into_iter()
        .flatten()
        .collect();
    if !description.is_empty() {
        line.push_str(&format!(" {}", description.join(" ")));
    }
    if let Some(serial) = &port.serial_number {
        line.push_str(&format!(" [{}]", serial));
    }

    if selected {
        let marker = if port.is_relay_bridge() {
            "relay"
        } else {
            "default"
        };
        if config.use_color {
            line.push_str(&format!(" <- {}", marker.bold()));
        } else {
            line.push_str(&format!(" <- {}", marker));
        }
    }

    line
}

pub fn format_failure(message: &str, config: &OutputConfig) -> String {
    if config.use_color {
        format!("{} {}", "error:".red().bold(), message)
    } else {
        format!("error: {}", message)
    }
}

/// Worker event as printed by `watch`.
pub fn format_event(
    event: &WorkerEvent,
    last_known: RelayState,
    config: &OutputConfig,
) -> String {
    match event {
        WorkerEvent::Relay(state) => format!("relay {}", format_relay(*state, config)),
        WorkerEvent::Link(link) => {
            let status = Status {
                link: *link,
                relay: last_known,
            };
            format!(
                "link {}: {}",
                format_link(*link, config),
                format_status(&status, None, config)
            )
        }
        WorkerEvent::PollFailed(message) => format_failure(message, config),
    }
}
