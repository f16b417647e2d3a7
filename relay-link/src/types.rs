//! Core value types shared by the link, the controller and front ends.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use strum::Display;

/// Serial endpoint of the relay (a `/dev/tty*` node or a COM port name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DevicePath(PathBuf);

impl DevicePath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Whether the node is currently present.
    ///
    /// Windows COM ports have no filesystem node and always report present;
    /// the open call is the real check there.
    pub fn exists(&self) -> bool {
        if cfg!(windows) {
            return true;
        }
        self.0.exists()
    }

    /// Path as passed to the serial driver.
    pub fn to_port_name(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&str> for DevicePath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Why a link entered the faulted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum FaultReason {
    /// The device opened but never answered the connect probe.
    ProtocolSilent,
    Timeout,
    Malformed,
    Io,
}

/// Connectivity of the device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Faulted(FaultReason),
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Faulted(reason) => write!(f, "faulted ({})", reason),
        }
    }
}

/// Last known electrical state of the relay output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum RelayState {
    On,
    Off,
    #[default]
    Unknown,
}

impl From<bool> for RelayState {
    fn from(energized: bool) -> Self {
        if energized {
            RelayState::On
        } else {
            RelayState::Off
        }
    }
}

/// Connectivity and power state together, as shown to an operator.
///
/// The relay state is only presented as live when the link is connected, so
/// "unreachable, last known OFF" is never rendered as plain "OFF".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub link: LinkState,
    pub relay: RelayState,
}

impl Status {
    /// True when `relay` reflects a live reading.
    pub fn is_live(&self) -> bool {
        self.link.is_connected() && self.relay != RelayState::Unknown
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.link, self.relay) {
            (LinkState::Connected, relay) => write!(f, "{}", relay),
            (link, RelayState::Unknown) => write!(f, "unreachable ({})", link),
            (link, relay) => write!(f, "unreachable ({}), last known {}", link, relay),
        }
    }
}
