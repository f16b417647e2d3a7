//! Error types for the relay device link.
//!
//! Every failure the link can observe is surfaced as a [`LinkError`]; nothing
//! is retried internally. Callers decide whether to reconnect.

use std::{io, time::Duration};

use thiserror::Error;

use crate::{
    protocol::FrameError,
    types::{DevicePath, FaultReason},
};

#[derive(Error, Debug)]
pub enum LinkError {
    /// No matching device node exists.
    #[error("relay device not found: {0}")]
    NotFound(String),

    /// The OS refused to open the device node.
    #[error("permission denied opening {0} (is the user in the dialout group?)")]
    PermissionDenied(DevicePath),

    /// `connect()` while already connected or connecting.
    #[error("device link is already open")]
    AlreadyOpen,

    #[error("device link is not connected")]
    NotConnected,

    /// No reply within the exchange timeout.
    #[error("no reply from relay within {0:?}")]
    Timeout(Duration),

    /// Reply failed the framing check.
    #[error("malformed reply from relay: {0}")]
    Malformed(String),

    /// The link faulted earlier and must be reconnected.
    #[error("device link faulted ({0}); reconnect required")]
    Faulted(FaultReason),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LinkError {
    /// Fault the link enters when an exchange fails with this error.
    ///
    /// Lifecycle misuse and open failures leave the link state alone and
    /// return `None`.
    pub fn fault_reason(&self) -> Option<FaultReason> {
        match self {
            LinkError::Timeout(_) => Some(FaultReason::Timeout),
            LinkError::Malformed(_) => Some(FaultReason::Malformed),
            LinkError::Io(_) => Some(FaultReason::Io),
            _ => None,
        }
    }
}

impl From<FrameError> for LinkError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => LinkError::Io(e),
            other => LinkError::Malformed(other.to_string()),
        }
    }
}

impl From<tokio_serial::Error> for LinkError {
    fn from(err: tokio_serial::Error) -> Self {
        match err.kind() {
            tokio_serial::ErrorKind::NoDevice => LinkError::NotFound(err.description),
            tokio_serial::ErrorKind::Io(kind) => {
                LinkError::Io(io::Error::new(kind, err.description))
            }
            _ => LinkError::Io(io::Error::other(err.description)),
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
