//! In-memory relay module for tests.
//!
//! [`FakeRelay`] simulates the board on the far end of a `tokio::io::duplex`
//! pipe and hands out a [`FakeConnector`] the link can open. The board can be
//! unplugged, locked down, or made to misbehave on the wire.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::{
    error::{LinkError, Result},
    protocol::{Command, Response, CHANNEL, FRAME_LEN},
    transport::{Connector, Transport},
    types::DevicePath,
};

pub(crate) const FAKE_NODE: &str = "/dev/ttyFAKE0";

/// Reply delay of [`Behavior::Slow`].
const SLOW_REPLY: Duration = Duration::from_millis(30);

/// Gap between the two acks of [`Behavior::Duplicate`].
const ECHO_GAP: Duration = Duration::from_millis(5);

/// How the simulated board answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    /// Acknowledge with the channel state.
    Normal,
    /// Read requests, never answer.
    Silent,
    /// Answer with a bad start byte.
    Garbled,
    /// Answer with only half a frame.
    Short,
    /// Answer with a valid frame plus one extra byte.
    Surplus,
    /// Acknowledge, but the contact never moves.
    Stuck,
    /// Acknowledge after [`SLOW_REPLY`].
    Slow,
    /// Acknowledge, then send the same ack again a little later.
    Duplicate,
}

struct Board {
    present: bool,
    permission_denied: bool,
    energized: bool,
    behavior: Behavior,
    received: Vec<Command>,
}

struct Shared {
    board: Mutex<Board>,
    opens: AtomicUsize,
}

#[derive(Clone)]
pub(crate) struct FakeRelay {
    shared: Arc<Shared>,
}

impl FakeRelay {
    /// Plugged in, released, well behaved.
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                board: Mutex::new(Board {
                    present: true,
                    permission_denied: false,
                    energized: false,
                    behavior: Behavior::Normal,
                    received: Vec::new(),
                }),
                opens: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn absent() -> Self {
        let relay = Self::new();
        relay.board().present = false;
        relay
    }

    pub(crate) fn connector(&self) -> FakeConnector {
        FakeConnector {
            shared: Arc::clone(&self.shared),
        }
    }

    fn board(&self) -> std::sync::MutexGuard<'_, Board> {
        self.shared.board.lock().unwrap()
    }

    pub(crate) fn set_behavior(&self, behavior: Behavior) {
        self.board().behavior = behavior;
    }

    pub(crate) fn set_energized(&self, energized: bool) {
        self.board().energized = energized;
    }

    pub(crate) fn set_permission_denied(&self, denied: bool) {
        self.board().permission_denied = denied;
    }

    pub(crate) fn plug_in(&self) {
        let mut board = self.board();
        board.present = true;
        board.behavior = Behavior::Normal;
    }

    /// Pull the cable: the node vanishes and an already open pipe goes quiet.
    pub(crate) fn unplug(&self) {
        let mut board = self.board();
        board.present = false;
        board.behavior = Behavior::Silent;
    }

    pub(crate) fn energized(&self) -> bool {
        self.board().energized
    }

    /// Number of times the connector opened the board.
    pub(crate) fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn received(&self) -> Vec<Command> {
        self.board().received.clone()
    }
}

pub(crate) struct FakeConnector {
    shared: Arc<Shared>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn resolve(&self) -> Result<DevicePath> {
        if self.shared.board.lock().unwrap().present {
            Ok(DevicePath::new(FAKE_NODE))
        } else {
            Err(LinkError::NotFound(format!("{} does not exist", FAKE_NODE)))
        }
    }

    async fn open(&self, path: &DevicePath) -> Result<Box<dyn Transport>> {
        {
            let board = self.shared.board.lock().unwrap();
            if !board.present {
                return Err(LinkError::NotFound(path.to_string()));
            }
            if board.permission_denied {
                return Err(LinkError::PermissionDenied(path.clone()));
            }
        }

        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let (host, device) = tokio::io::duplex(64);
        tokio::spawn(serve(device, Arc::clone(&self.shared)));
        Ok(Box::new(host))
    }
}

fn parse_command(frame: &[u8; FRAME_LEN]) -> Option<Command> {
    [Command::Query, Command::TurnOn, Command::TurnOff]
        .into_iter()
        .find(|c| c.encode() == *frame)
}

// Board side of the pipe. Exits when the host drops its end.
async fn serve(mut io: DuplexStream, shared: Arc<Shared>) {
    let mut frame = [0u8; FRAME_LEN];
    loop {
        if io.read_exact(&mut frame).await.is_err() {
            return;
        }

        let (reply, behavior) = {
            let mut board = shared.board.lock().unwrap();
            let Some(command) = parse_command(&frame) else {
                continue;
            };
            board.received.push(command);

            if board.behavior != Behavior::Stuck {
                match command {
                    Command::TurnOn => board.energized = true,
                    Command::TurnOff => board.energized = false,
                    Command::Query => {}
                }
            }

            let ack = Response {
                channel: CHANNEL,
                energized: board.energized,
            }
            .encode();

            let reply = match board.behavior {
                Behavior::Normal | Behavior::Stuck | Behavior::Slow | Behavior::Duplicate => {
                    ack.to_vec()
                }
                Behavior::Silent => continue,
                Behavior::Garbled => vec![0x55, ack[1], ack[2], ack[3]],
                Behavior::Short => ack[..2].to_vec(),
                Behavior::Surplus => {
                    let mut bytes = ack.to_vec();
                    bytes.push(0x00);
                    bytes
                }
            };
            (reply, board.behavior)
        };

        if behavior == Behavior::Slow {
            tokio::time::sleep(SLOW_REPLY).await;
        }

        if io.write_all(&reply).await.is_err() {
            return;
        }

        if behavior == Behavior::Duplicate {
            tokio::time::sleep(ECHO_GAP).await;
            if io.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}
