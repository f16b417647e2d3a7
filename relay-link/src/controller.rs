//! Relay controller: on/off semantics on top of the device link.
//!
//! The controller is the only owner of [`RelayState`]. The state changes only
//! when an exchange succeeds, and then to whatever the board acknowledged; a
//! failed exchange leaves the last known value in place, because the contact
//! has not physically moved just because we lost sight of it.
//!
//! Observers registered with [`RelayController::subscribe`] are called in
//! registration order, synchronously, after each commit that changes the
//! value. Re-confirming the current state notifies nobody.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::{
    config::LinkConfig,
    error::Result,
    link::DeviceLink,
    protocol::Command,
    tracing::prelude::*,
    types::{LinkState, RelayState, Status},
};

/// Handle returned by [`RelayController::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Arc<dyn Fn(RelayState) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    entries: Vec<(SubscriptionId, Observer)>,
}

pub struct RelayController {
    link: DeviceLink,
    state: RwLock<RelayState>,

    /// Held from exchange through commit so commits land in hardware order.
    op: tokio::sync::Mutex<()>,

    observers: Mutex<Observers>,
}

impl RelayController {
    pub fn new(link: DeviceLink) -> Self {
        Self {
            link,
            state: RwLock::new(RelayState::Unknown),
            op: tokio::sync::Mutex::new(()),
            observers: Mutex::new(Observers::default()),
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(DeviceLink::from_config(config))
    }

    pub fn link(&self) -> &DeviceLink {
        &self.link
    }

    /// Connect the link. The probe reply counts as a status read.
    pub async fn connect(&self) -> Result<RelayState> {
        let _op = self.op.lock().await;
        let state = self.link.connect().await?;
        self.commit(state);
        Ok(state)
    }

    /// Disconnect the link. The last known relay state is kept.
    pub async fn disconnect(&self) {
        let _op = self.op.lock().await;
        self.link.disconnect().await;
    }

    pub async fn reconnect(&self) -> Result<RelayState> {
        let _op = self.op.lock().await;
        let state = self.link.reconnect().await?;
        self.commit(state);
        Ok(state)
    }

    /// Read the relay state from the board.
    pub async fn refresh(&self) -> Result<RelayState> {
        let _op = self.op.lock().await;
        self.apply(Command::Query).await
    }

    pub async fn turn_on(&self) -> Result<RelayState> {
        let _op = self.op.lock().await;
        self.apply(Command::TurnOn).await
    }

    pub async fn turn_off(&self) -> Result<RelayState> {
        let _op = self.op.lock().await;
        self.apply(Command::TurnOff).await
    }

    /// Invert the relay, reading it first if the state is not yet known.
    pub async fn toggle(&self) -> Result<RelayState> {
        let _op = self.op.lock().await;
        let current = match self.current_state() {
            RelayState::Unknown => self.apply(Command::Query).await?,
            known => known,
        };
        let command = match current {
            RelayState::On => Command::TurnOff,
            _ => Command::TurnOn,
        };
        self.apply(command).await
    }

    // Caller holds `op`.
    async fn apply(&self, command: Command) -> Result<RelayState> {
        let response = self.link.exchange(command).await?;
        let acked = response.relay_state();

        if let Some(commanded) = command.commanded_state() {
            if commanded != acked {
                warn!(
                    command = ?command,
                    acked = %acked,
                    "Relay acknowledged a different state than commanded"
                );
            }
        }

        self.commit(acked);
        Ok(acked)
    }

    fn commit(&self, new: RelayState) {
        let old = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, new)
        };

        if old != new {
            info!(from = %old, to = %new, "Relay state changed");
            self.notify(new);
        }
    }

    fn notify(&self, state: RelayState) {
        // Snapshot so observers may subscribe or unsubscribe from inside.
        let observers: Vec<Observer> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in observers {
            observer(state);
        }
    }

    /// Last known relay state. Never touches the hardware.
    pub fn current_state(&self) -> RelayState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn status(&self) -> Status {
        Status {
            link: self.link_state(),
            relay: self.current_state(),
        }
    }

    /// Register an observer for relay state changes.
    pub fn subscribe(
        &self,
        observer: impl Fn(RelayState) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(observers.next_id);
        observers.next_id += 1;
        observers.entries.push((id, Arc::new(observer)));
        id
    }

    /// Remove an observer. Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = observers.entries.len();
        observers.entries.retain(|(entry, _)| *entry != id);
        observers.entries.len() != before
    }
}
