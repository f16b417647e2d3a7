//! Wire protocol of CH340-based single channel relay modules.
//!
//! # Frame Format
//!
//! Requests and replies share one fixed 4-byte frame:
//!
//! ```text
//! [Start:0xA0] [Channel:1] [Payload:1] [Sum:1]
//! ```
//!
//! `Sum` is the wrapping byte sum of the first three bytes. The board has a
//! single output, so `Channel` is always `0x01`.
//!
//! ## Requests
//!
//! | Command   | Payload | Frame         |
//! |-----------|---------|---------------|
//! | `TurnOff` | `0x00`  | `A0 01 00 A1` |
//! | `TurnOn`  | `0x01`  | `A0 01 01 A2` |
//! | `Query`   | `0x05`  | `A0 01 05 A6` |
//!
//! ## Replies
//!
//! Every request is acknowledged with one frame whose payload bit 0 is the
//! electrical state of the channel (set = energized). Other payload bits carry
//! no meaning and are ignored.
//!
//! There is no request tagging and no CRC, so the only corruption guard is
//! framing discipline: exact length, start byte, channel and sum must all
//! match or the reply is rejected.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::{tracing::prelude::*, types::RelayState};

/// Length of every request and reply frame.
pub const FRAME_LEN: usize = 4;

const START: u8 = 0xa0;

/// Channel selector of single channel boards.
pub const CHANNEL: u8 = 0x01;

/// Payload bit carrying the energized state in replies.
const ENERGIZED_BIT: u8 = 0x01;

/// Relay command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Query,
    TurnOn,
    TurnOff,
}

impl Command {
    fn payload(self) -> u8 {
        match self {
            Command::TurnOff => 0x00,
            Command::TurnOn => 0x01,
            Command::Query => 0x05,
        }
    }

    /// The state a successful acknowledgement should report.
    pub fn commanded_state(self) -> Option<RelayState> {
        match self {
            Command::TurnOn => Some(RelayState::On),
            Command::TurnOff => Some(RelayState::Off),
            Command::Query => None,
        }
    }

    /// Encode to the wire frame.
    pub fn encode(self) -> [u8; FRAME_LEN] {
        let head = [START, CHANNEL, self.payload()];
        [head[0], head[1], head[2], checksum(&head)]
    }
}

/// Decoded acknowledgement frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub channel: u8,
    pub energized: bool,
}

impl Response {
    /// Parse exactly one reply frame.
    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() != FRAME_LEN {
            return Err(FrameError::Length(frame.len()));
        }
        if frame[0] != START {
            return Err(FrameError::BadStart(frame[0]));
        }
        if frame[1] != CHANNEL {
            return Err(FrameError::BadChannel(frame[1]));
        }
        let expected = checksum(&frame[..3]);
        if frame[3] != expected {
            return Err(FrameError::BadSum {
                expected,
                found: frame[3],
            });
        }

        Ok(Response {
            channel: frame[1],
            energized: frame[2] & ENERGIZED_BIT != 0,
        })
    }

    pub fn relay_state(&self) -> RelayState {
        RelayState::from(self.energized)
    }

    /// Encode as a reply frame (used by device simulators).
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let head = [START, self.channel, u8::from(self.energized)];
        [head[0], head[1], head[2], checksum(&head)]
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Reply framing violations.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("expected 4-byte frame, got {0} bytes")]
    Length(usize),

    #[error("bad start byte 0x{0:02x}")]
    BadStart(u8),

    #[error("unexpected channel 0x{0:02x}")]
    BadChannel(u8),

    #[error("bad trailing sum: expected 0x{expected:02x}, found 0x{found:02x}")]
    BadSum { expected: u8, found: u8 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Tokio codec for the relay protocol.
#[derive(Debug, Default)]
pub struct RelayCodec;

impl Decoder for RelayCodec {
    type Item = Response;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_LEN {
            return Ok(None);
        }

        let frame = src.split_to(FRAME_LEN);
        let response = Response::parse(&frame)?;

        trace!(
            energized = response.energized,
            frame = ?&frame[..],
            "RX relay"
        );

        Ok(Some(response))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(response) => Ok(Some(response)),
            None if src.is_empty() => Ok(None),
            None => {
                let len = src.remaining();
                src.clear();
                Err(FrameError::Length(len))
            }
        }
    }
}

impl Encoder<Command> for RelayCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = item.encode();
        trace!(command = ?item, frame = ?frame, "TX relay");
        dst.reserve(FRAME_LEN);
        dst.put_slice(&frame);
        Ok(())
    }
}
