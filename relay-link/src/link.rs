//! Device link: the single owner of the serial connection to the relay.
//!
//! The link resolves and opens the device through a [`Connector`], proves the
//! board answers with a `Query` probe, then runs strictly one request/reply
//! exchange at a time. The transport lives behind an async mutex held for a
//! whole write+read round trip; the hardware has no request tagging, so
//! interleaved writes would corrupt framing.
//!
//! Connectivity is published on a `watch` channel. Any exchange that times
//! out, returns a malformed reply, or hits an I/O error drops the transport
//! and moves the link to [`LinkState::Faulted`]. So does dropping a
//! `connect()` or `exchange()` future before it completes, since a reply may
//! still be on its way. The link never retries; callers see every failure and
//! decide whether to reconnect.

use std::{
    sync::{PoisonError, RwLock},
    time::Duration,
};

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::{
    io::AsyncReadExt,
    sync::{watch, Mutex, MutexGuard},
};
use tokio_util::codec::Framed;

use crate::{
    config::LinkConfig,
    error::{LinkError, Result},
    protocol::{Command, FrameError, RelayCodec, Response},
    tracing::prelude::*,
    transport::{Connector, SerialConnector, Transport},
    types::{DevicePath, FaultReason, LinkState, RelayState},
};

type RelayPort = Framed<Box<dyn Transport>, RelayCodec>;

pub struct DeviceLink {
    connector: Box<dyn Connector>,
    timeout: Duration,

    /// Open port; `Some` only while connecting or connected.
    port: Mutex<Option<RelayPort>>,

    state_tx: watch::Sender<LinkState>,

    /// Node of the current or most recent connection.
    path: RwLock<Option<DevicePath>>,
}

impl DeviceLink {
    pub fn new(connector: Box<dyn Connector>, timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            connector,
            timeout,
            port: Mutex::new(None),
            state_tx,
            path: RwLock::new(None),
        }
    }

    /// Link over a real serial port, located as the configuration says.
    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(Box::new(SerialConnector::from_config(config)), config.timeout)
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Watch link state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    pub fn device_path(&self) -> Option<DevicePath> {
        self.path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_state(&self, state: LinkState) {
        let mut old = state;
        self.state_tx.send_if_modified(|current| {
            old = std::mem::replace(current, state);
            old != state
        });
        if old != state {
            debug!(from = %old, to = %state, "Link state changed");
        }
    }

    fn set_path(&self, path: DevicePath) {
        *self.path.write().unwrap_or_else(PoisonError::into_inner) = Some(path);
    }

    /// Open the device and verify it answers.
    ///
    /// Returns the relay state reported by the probe. A link in
    /// [`LinkState::Faulted`] may be connected again directly; the fault is
    /// cleared first.
    pub async fn connect(&self) -> Result<RelayState> {
        if matches!(self.state(), LinkState::Connected | LinkState::Connecting) {
            return Err(LinkError::AlreadyOpen);
        }

        let port = self.port.lock().await;

        // Another caller may have connected while we waited for the port.
        match self.state() {
            LinkState::Connected | LinkState::Connecting => return Err(LinkError::AlreadyOpen),
            LinkState::Faulted(_) => self.set_state(LinkState::Disconnected),
            LinkState::Disconnected => {}
        }

        let path = self.connector.resolve().await?;
        let transport = self.connector.open(&path).await?;
        self.set_path(path.clone());
        self.set_state(LinkState::Connecting);

        let mut in_flight = InFlight::arm(self, port, FaultReason::ProtocolSilent);
        let framed = in_flight.port.insert(Framed::new(transport, RelayCodec));
        match self.round_trip(framed, Command::Query).await {
            Ok(response) => {
                in_flight.disarm();
                self.set_state(LinkState::Connected);
                info!(device = %path, relay = %response.relay_state(), "Relay connected");
                Ok(response.relay_state())
            }
            Err(e) => {
                warn!(device = %path, error = %e, "Relay did not answer probe");
                Err(e)
            }
        }
    }

    /// Run one request/reply exchange.
    ///
    /// Concurrent callers queue on the port lock. A timeout, malformed reply
    /// or I/O error faults the link; no retry is attempted.
    pub async fn exchange(&self, command: Command) -> Result<Response> {
        let mut in_flight = InFlight::arm(self, self.port.lock().await, FaultReason::Timeout);

        let Some(framed) = in_flight.port.as_mut() else {
            in_flight.disarm();
            return Err(match self.state() {
                LinkState::Faulted(reason) => LinkError::Faulted(reason),
                _ => LinkError::NotConnected,
            });
        };

        match self.round_trip(framed, command).await {
            Ok(response) => {
                in_flight.disarm();
                Ok(response)
            }
            Err(e) => {
                match e.fault_reason() {
                    Some(reason) => {
                        in_flight.reason = reason;
                        warn!(command = ?command, error = %e, "Relay link faulted");
                    }
                    None => in_flight.disarm(),
                }
                Err(e)
            }
        }
    }

    async fn round_trip(&self, framed: &mut RelayPort, command: Command) -> Result<Response> {
        // Anything already received is not an answer to this request.
        let stale = discard_pending(framed)?;
        if stale > 0 {
            debug!(bytes = stale, "Discarding stale input");
        }

        framed.send(command).await?;

        let deadline = tokio::time::Instant::now() + self.timeout;
        let response = tokio::select! {
            reply = framed.next() => match reply {
                Some(reply) => reply?,
                None => return Err(closed()),
            },
            _ = tokio::time::sleep_until(deadline) => {
                let partial = framed.read_buffer().len();
                return Err(if partial > 0 {
                    FrameError::Length(partial).into()
                } else {
                    LinkError::Timeout(self.timeout)
                });
            }
        };

        let surplus = framed.read_buffer().len();
        if surplus > 0 {
            return Err(LinkError::Malformed(format!(
                "{} unexpected bytes after reply",
                surplus
            )));
        }

        Ok(response)
    }

    /// Release the transport. Safe from any state.
    pub async fn disconnect(&self) {
        let mut port = self.port.lock().await;
        let was_open = port.take().is_some();
        self.set_state(LinkState::Disconnected);
        if was_open {
            info!(device = ?self.device_path().map(|p| p.to_string()), "Relay disconnected");
        }
    }

    pub async fn reconnect(&self) -> Result<RelayState> {
        self.disconnect().await;
        self.connect().await
    }
}

/// Empty the codec buffer and whatever the transport can hand over without
/// waiting. Returns the number of bytes thrown away.
fn discard_pending(framed: &mut RelayPort) -> Result<usize> {
    let mut discarded = framed.read_buffer().len();
    framed.read_buffer_mut().clear();

    let mut scratch = [0u8; 64];
    loop {
        match framed.get_mut().read(&mut scratch).now_or_never() {
            Some(Ok(0)) => return Err(closed()),
            Some(Ok(n)) => discarded += n,
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(discarded),
        }
    }
}

fn closed() -> LinkError {
    LinkError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "relay closed the connection",
    ))
}

/// Port lock held by a request in progress.
///
/// Dropped while still armed, it closes the port and faults the link with
/// `reason`. Covers both a failed request and a caller that gave up on the
/// future before the reply arrived.
struct InFlight<'a> {
    link: &'a DeviceLink,
    port: MutexGuard<'a, Option<RelayPort>>,
    reason: FaultReason,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn arm(
        link: &'a DeviceLink,
        port: MutexGuard<'a, Option<RelayPort>>,
        reason: FaultReason,
    ) -> Self {
        Self {
            link,
            port,
            reason,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed && self.port.take().is_some() {
            self.link.set_state(LinkState::Faulted(self.reason));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behavior, FakeRelay, FAKE_NODE};

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn link_to(relay: &FakeRelay) -> DeviceLink {
        DeviceLink::new(Box::new(relay.connector()), TIMEOUT)
    }

    #[tokio::test]
    async fn test_connect_probes_the_relay() {
        let relay = FakeRelay::new();
        relay.set_energized(true);
        let link = link_to(&relay);
        assert_eq!(link.state(), LinkState::Disconnected);

        assert_eq!(link.connect().await.unwrap(), RelayState::On);
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(link.device_path(), Some(DevicePath::new(FAKE_NODE)));
        assert_eq!(relay.received(), vec![Command::Query]);
    }

    #[tokio::test]
    async fn test_connect_absent_device() {
        let relay = FakeRelay::absent();
        let link = link_to(&relay);

        assert!(matches!(link.connect().await, Err(LinkError::NotFound(_))));
        assert_eq!(link.state(), LinkState::Disconnected);
        assert_eq!(relay.opens(), 0);
    }

    #[tokio::test]
    async fn test_connect_permission_denied() {
        let relay = FakeRelay::new();
        relay.set_permission_denied(true);
        let link = link_to(&relay);

        assert!(matches!(
            link.connect().await,
            Err(LinkError::PermissionDenied(_))
        ));
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_silent_device_is_not_connected() {
        let relay = FakeRelay::new();
        relay.set_behavior(Behavior::Silent);
        let link = link_to(&relay);

        assert!(matches!(link.connect().await, Err(LinkError::Timeout(_))));
        assert_eq!(
            link.state(),
            LinkState::Faulted(FaultReason::ProtocolSilent)
        );
        assert!(matches!(
            link.exchange(Command::Query).await,
            Err(LinkError::Faulted(FaultReason::ProtocolSilent))
        ));
    }

    #[tokio::test]
    async fn test_connect_twice_is_already_open() {
        let relay = FakeRelay::new();
        let link = link_to(&relay);
        link.connect().await.unwrap();

        assert!(matches!(link.connect().await, Err(LinkError::AlreadyOpen)));
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(relay.opens(), 1);
    }

    #[tokio::test]
    async fn test_exchange_requires_connection() {
        let relay = FakeRelay::new();
        let link = link_to(&relay);

        assert!(matches!(
            link.exchange(Command::TurnOn).await,
            Err(LinkError::NotConnected)
        ));
        assert!(relay.received().is_empty());
    }

    #[tokio::test]
    async fn test_exchange_returns_ack() {
        let relay = FakeRelay::new();
        let link = link_to(&relay);
        link.connect().await.unwrap();

        let response = link.exchange(Command::TurnOn).await.unwrap();
        assert_eq!(response.relay_state(), RelayState::On);
        assert!(relay.energized());

        let response = link.exchange(Command::TurnOff).await.unwrap();
        assert_eq!(response.relay_state(), RelayState::Off);
        assert!(!relay.energized());
    }

    #[tokio::test]
    async fn test_timeout_faults_the_link() {
        let relay = FakeRelay::new();
        let link = link_to(&relay);
        link.connect().await.unwrap();

        relay.set_behavior(Behavior::Silent);
        assert!(matches!(
            link.exchange(Command::Query).await,
            Err(LinkError::Timeout(t)) if t == TIMEOUT
        ));
        assert_eq!(link.state(), LinkState::Faulted(FaultReason::Timeout));

        // Faulted links refuse work until reconnected.
        relay.set_behavior(Behavior::Normal);
        assert!(matches!(
            link.exchange(Command::Query).await,
            Err(LinkError::Faulted(FaultReason::Timeout))
        ));
    }

    #[tokio::test]
    async fn test_garbled_reply_is_malformed() {
        let relay = FakeRelay::new();
        let link = link_to(&relay);
        link.connect().await.unwrap();

        relay.set_behavior(Behavior::Garbled);
        assert!(matches!(
            link.exchange(Command::TurnOn).await,
            Err(LinkError::Malformed(_))
        ));
        assert_eq!(link.state(), LinkState::Faulted(FaultReason::Malformed));
    }

    #[tokio::test]
    async fn test_short_reply_is_malformed() {
        let relay = FakeRelay::new();
        let link = link_to(&relay);
        link.connect().await.unwrap();

        relay.set_behavior(Behavior::Short);
        assert!(matches!(
            link.exchange(Command::Query).await,
            Err(LinkError::Malformed(_))
        ));
        assert_eq!(link.state(), LinkState::Faulted(FaultReason::Malformed));
    }

    #[tokio::test]
    async fn test_surplus_bytes_are_malformed() {
        let relay = FakeRelay::new();
        let link = link_to(&relay);
        link.connect().await.unwrap();

        relay.set_behavior(Behavior::Surplus);
        assert!(matches!(
            link.exchange(Command::Query).await,
            Err(LinkError::Malformed(_))
        ));
        assert_eq!(link.state(), LinkState::Faulted(FaultReason::Malformed));
    }

    #[tokio::test]
    async fn test_late_duplicate_is_not_the_next_reply() {
        let relay = FakeRelay::new();
        let link = link_to(&relay);
        link.connect().await.unwrap();

        relay.set_behavior(Behavior::Duplicate);
        let response = link.exchange(Command::TurnOn).await.unwrap();
        assert_eq!(response.relay_state(), RelayState::On);

        // Let the second copy of the ack land in the pipe.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let response = link.exchange(Command::TurnOff).await.unwrap();
        assert_eq!(response.relay_state(), RelayState::Off);
        assert!(!relay.energized());
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_abandoned_connect_faults_the_link() {
        let relay = FakeRelay::new();
        relay.set_behavior(Behavior::Slow);
        let link = link_to(&relay);

        let abandoned = tokio::time::timeout(Duration::from_millis(10), link.connect()).await;
        assert!(abandoned.is_err());
        assert_eq!(
            link.state(),
            LinkState::Faulted(FaultReason::ProtocolSilent)
        );
        assert!(matches!(
            link.exchange(Command::Query).await,
            Err(LinkError::Faulted(FaultReason::ProtocolSilent))
        ));

        relay.set_behavior(Behavior::Normal);
        link.connect().await.unwrap();
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(relay.opens(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_exchange_faults_the_link() {
        let relay = FakeRelay::new();
        let link = link_to(&relay);
        link.connect().await.unwrap();

        relay.set_behavior(Behavior::Slow);
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), link.exchange(Command::TurnOn)).await;
        assert!(abandoned.is_err());
        assert_eq!(link.state(), LinkState::Faulted(FaultReason::Timeout));

        relay.set_behavior(Behavior::Normal);
        link.reconnect().await.unwrap();
        assert_eq!(link.state(), LinkState::Connected);
        let response = link.exchange(Command::TurnOff).await.unwrap();
        assert_eq!(response.relay_state(), RelayState::Off);
    }

    #[tokio::test]
    async fn test_slow_reply_within_timeout() {
        let relay = FakeRelay::new();
        relay.set_behavior(Behavior::Slow);
        relay.set_energized(true);
        let link = link_to(&relay);

        assert_eq!(link.connect().await.unwrap(), RelayState::On);
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_from_every_state() {
        let relay = FakeRelay::new();
        let link = link_to(&relay);

        // Disconnected
        link.disconnect().await;
        assert_eq!(link.state(), LinkState::Disconnected);

        // Connected
        link.connect().await.unwrap();
        link.disconnect().await;
        assert_eq!(link.state(), LinkState::Disconnected);
        link.disconnect().await;
        assert_eq!(link.state(), LinkState::Disconnected);

        // Faulted
        link.connect().await.unwrap();
        relay.set_behavior(Behavior::Silent);
        let _ = link.exchange(Command::Query).await;
        assert!(matches!(link.state(), LinkState::Faulted(_)));
        link.disconnect().await;
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_recovers_from_fault() {
        let relay = FakeRelay::new();
        let link = link_to(&relay);
        link.connect().await.unwrap();

        relay.set_behavior(Behavior::Silent);
        let _ = link.exchange(Command::Query).await;
        assert_eq!(link.state(), LinkState::Faulted(FaultReason::Timeout));

        relay.set_behavior(Behavior::Normal);
        relay.set_energized(true);
        assert_eq!(link.reconnect().await.unwrap(), RelayState::On);
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(relay.opens(), 2);
    }

    #[tokio::test]
    async fn test_connect_clears_fault() {
        let relay = FakeRelay::new();
        let link = link_to(&relay);
        link.connect().await.unwrap();
        relay.set_behavior(Behavior::Garbled);
        let _ = link.exchange(Command::Query).await;

        relay.set_behavior(Behavior::Normal);
        link.connect().await.unwrap();
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_state_watch_sees_transitions() {
        let relay = FakeRelay::new();
        let link = link_to(&relay);
        let mut rx = link.subscribe();

        link.connect().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), LinkState::Connected);

        link.disconnect().await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_concurrent_exchanges_are_serialized() {
        let relay = FakeRelay::new();
        let link = std::sync::Arc::new(link_to(&relay));
        link.connect().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let link = std::sync::Arc::clone(&link);
            let command = if i % 2 == 0 {
                Command::TurnOn
            } else {
                Command::TurnOff
            };
            tasks.push(tokio::spawn(async move { link.exchange(command).await }));
        }

        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(link.state(), LinkState::Connected);
        assert_eq!(relay.received().len(), 9);
    }
}
