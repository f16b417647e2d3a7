//! Relay worker actor for interactive front ends.
//!
//! A front end must never block its own loop on a serial round trip. The
//! worker owns command execution in a separate task: callers send a
//! [`WorkerCommand`] and await the reply on a oneshot channel, while state
//! changes arrive as [`WorkerEvent`]s the front end drains at its leisure.
//!
//! With a poll interval configured, the worker refreshes the relay on every
//! tick while connected. With auto-reconnect enabled it also retries
//! `reconnect()` on each tick while the link is down, unless the caller asked
//! for the disconnect. The link itself still never retries.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::LinkConfig,
    controller::RelayController,
    error::LinkError,
    tracing::prelude::*,
    types::{LinkState, RelayState},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Refresh interval; `None` disables polling.
    pub poll_interval: Option<Duration>,
    pub auto_reconnect: bool,
}

impl WorkerConfig {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            auto_reconnect: config.auto_reconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    Connect,
    Disconnect,
    Reconnect,
    Refresh,
    TurnOn,
    TurnOff,
    Toggle,
}

/// Notifications published by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Relay state changed.
    Relay(RelayState),
    /// Link state changed.
    Link(LinkState),
    /// A background poll or reconnect attempt failed.
    PollFailed(String),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("relay worker has stopped")]
    Stopped,
}

struct Request {
    command: WorkerCommand,
    response_tx: oneshot::Sender<Result<RelayState, LinkError>>,
}

/// Front end side of the worker.
pub struct RelayHandle {
    command_tx: mpsc::Sender<Request>,
    event_rx: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    controller: Arc<RelayController>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Start the worker task. It runs until `shutdown` is cancelled or every
    /// handle is dropped, and disconnects the link on the way out.
    pub fn spawn(
        controller: Arc<RelayController>,
        config: WorkerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(10);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(worker_actor(
            Arc::clone(&controller),
            config,
            command_rx,
            event_tx,
            shutdown,
        ));

        Self {
            command_tx,
            event_rx: Some(event_rx),
            controller,
            task,
        }
    }

    /// Run a command on the worker and wait for its result.
    pub async fn execute(&self, command: WorkerCommand) -> Result<RelayState, WorkerError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.command_tx
            .send(Request {
                command,
                response_tx,
            })
            .await
            .map_err(|_| WorkerError::Stopped)?;

        response_rx
            .await
            .map_err(|_| WorkerError::Stopped)?
            .map_err(WorkerError::from)
    }

    /// Event receiver; can be taken once.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<WorkerEvent>> {
        self.event_rx.take()
    }

    pub fn controller(&self) -> &Arc<RelayController> {
        &self.controller
    }

    /// Wait for the worker task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "Relay worker panicked");
        }
    }
}

async fn tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn execute(
    controller: &RelayController,
    command: WorkerCommand,
) -> Result<RelayState, LinkError> {
    match command {
        WorkerCommand::Connect => controller.connect().await,
        WorkerCommand::Disconnect => {
            controller.disconnect().await;
            Ok(controller.current_state())
        }
        WorkerCommand::Reconnect => controller.reconnect().await,
        WorkerCommand::Refresh => controller.refresh().await,
        WorkerCommand::TurnOn => controller.turn_on().await,
        WorkerCommand::TurnOff => controller.turn_off().await,
        WorkerCommand::Toggle => controller.toggle().await,
    }
}

struct Supervisor {
    auto_reconnect: bool,
    /// False after an explicit disconnect; auto-reconnect respects it.
    wanted: bool,
    last_failure: Option<String>,
}

impl Supervisor {
    async fn poll(
        &mut self,
        controller: &RelayController,
        event_tx: &mpsc::UnboundedSender<WorkerEvent>,
    ) {
        let result = if controller.link_state().is_connected() {
            controller.refresh().await
        } else if self.auto_reconnect && self.wanted {
            controller.reconnect().await
        } else {
            return;
        };

        match result {
            Ok(_) => self.last_failure = None,
            Err(e) => {
                let message = e.to_string();
                // Report each distinct failure once, not every tick.
                if self.last_failure.as_deref() != Some(message.as_str()) {
                    warn!(error = %e, "Relay poll failed");
                    let _ = event_tx.send(WorkerEvent::PollFailed(message.clone()));
                    self.last_failure = Some(message);
                }
            }
        }
    }
}

async fn worker_actor(
    controller: Arc<RelayController>,
    config: WorkerConfig,
    mut command_rx: mpsc::Receiver<Request>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    shutdown: CancellationToken,
) {
    let relay_events = event_tx.clone();
    let subscription = controller.subscribe(move |state| {
        let _ = relay_events.send(WorkerEvent::Relay(state));
    });

    let mut link_rx: watch::Receiver<LinkState> = controller.link().subscribe();

    let mut poll = config.poll_interval.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    let mut supervisor = Supervisor {
        auto_reconnect: config.auto_reconnect,
        wanted: false,
        last_failure: None,
    };

    debug!(
        poll_interval = ?config.poll_interval,
        auto_reconnect = config.auto_reconnect,
        "Relay worker started"
    );

    loop {
        tokio::select! {
            request = command_rx.recv() => {
                let Some(request) = request else {
                    debug!("All relay handles dropped, stopping worker");
                    break;
                };
                match request.command {
                    WorkerCommand::Connect | WorkerCommand::Reconnect => supervisor.wanted = true,
                    WorkerCommand::Disconnect => supervisor.wanted = false,
                    _ => {}
                }
                trace!(command = ?request.command, "Relay worker command");
                let result = execute(&controller, request.command).await;
                let _ = request.response_tx.send(result);
            }

            changed = link_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *link_rx.borrow_and_update();
                let _ = event_tx.send(WorkerEvent::Link(state));
            }

            _ = tick(&mut poll) => {
                supervisor.poll(&controller, &event_tx).await;
            }

            _ = shutdown.cancelled() => {
                debug!("Relay worker shutting down");
                break;
            }
        }
    }

    controller.disconnect().await;
    controller.unsubscribe(subscription);
}
