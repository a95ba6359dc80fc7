//! Pin map and an in-process reservation service.
//!
//! A [`PinMap`] lists the sessions available to this process and the pins wired to each
//! of them. [`InMemoryReservationService`] grants exclusive, session-granular reservations
//! over a pin map and keeps the registry of sessions left open for later attach. It stands
//! in for a session-management server when running against simulated instruments.
//!
//! Pin map files are TOML:
//!
//! ```toml
//! [[sessions]]
//! session_name = "DCPower1"
//! resource_name = "PXI1Slot2"
//! instrument_type_id = "niDCPower"
//! channel_list = "0"
//!
//! [[sessions.channel_mappings]]
//! pin_or_relay_name = "NI_DCPower_Pin"
//! site = 0
//! channel = "0"
//! ```

use async_trait::async_trait;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use hal_core::{HalError, HalResult, Reservation, SessionDescriptor, SessionReservationService};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

/// Sessions available to this process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PinMap {
    /// Sessions in reservation order
    #[serde(default)]
    pub sessions: Vec<SessionDescriptor>,
}

impl PinMap {
    /// Pin map over `sessions`, in open order.
    pub fn new(sessions: Vec<SessionDescriptor>) -> Self {
        Self { sessions }
    }

    /// Load and validate a pin map file.
    pub fn load(path: impl AsRef<Path>) -> HalResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(HalError::Configuration(format!(
                "Pin map file not found: {}",
                path.display()
            )));
        }
        Self::extract(Figment::from(Toml::file(path)))
    }

    /// Parse and validate a pin map from TOML text.
    pub fn from_toml_str(contents: &str) -> HalResult<Self> {
        Self::extract(Figment::from(Toml::string(contents)))
    }

    fn extract(figment: Figment) -> HalResult<Self> {
        let pin_map: Self = figment
            .extract()
            .map_err(|e| HalError::Configuration(format!("Invalid pin map: {e}")))?;
        pin_map.validate()?;
        Ok(pin_map)
    }

    /// Session names and pin names must both be unique.
    pub fn validate(&self) -> HalResult<()> {
        Reservation::new(self.sessions.clone())
            .validate()
            .map_err(|e| HalError::Configuration(e.to_string()))
    }

    /// Every pin name, in pin map order.
    pub fn pin_names(&self) -> Vec<&str> {
        self.sessions.iter().flat_map(|s| s.pins()).collect()
    }

    /// Sessions backing `pins`, in pin map order, with mappings narrowed to `pins`.
    fn sessions_for(&self, pins: &[String]) -> HalResult<Vec<SessionDescriptor>> {
        let known: HashSet<&str> = self.pin_names().into_iter().collect();
        if let Some(unknown) = pins.iter().find(|p| !known.contains(p.as_str())) {
            return Err(HalError::Reservation(format!(
                "Pin '{}' is not defined in the pin map",
                unknown
            )));
        }

        let wanted: HashSet<&str> = pins.iter().map(String::as_str).collect();
        Ok(self
            .sessions
            .iter()
            .filter_map(|session| {
                let mappings: Vec<_> = session
                    .channel_mappings
                    .iter()
                    .filter(|m| wanted.contains(m.pin_or_relay_name.as_str()))
                    .cloned()
                    .collect();
                (!mappings.is_empty()).then(|| SessionDescriptor {
                    channel_mappings: mappings,
                    ..session.clone()
                })
            })
            .collect())
    }
}

#[derive(Debug, Default)]
struct ReservationState {
    next_id: u64,
    /// session name -> reservation id holding it
    held: HashMap<String, u64>,
    /// Sessions left open for later attach, in registration order
    registered: Vec<SessionDescriptor>,
}

/// Reservation service backed by a [`PinMap`].
///
/// Reservations are exclusive per session: a pin whose session is held by another
/// reservation waits until it is released or the request timeout elapses. A `None`
/// timeout waits indefinitely.
#[derive(Debug)]
pub struct InMemoryReservationService {
    pin_map: PinMap,
    state: Mutex<ReservationState>,
    released: Notify,
}

impl InMemoryReservationService {
    /// Service that grants reservations from `pin_map`.
    pub fn new(pin_map: PinMap) -> Self {
        Self {
            pin_map,
            state: Mutex::new(ReservationState::default()),
            released: Notify::new(),
        }
    }

    /// Service over the pin map stored at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> HalResult<Self> {
        Ok(Self::new(PinMap::load(path)?))
    }

    /// Pin map the service reserves from.
    pub fn pin_map(&self) -> &PinMap {
        &self.pin_map
    }

    /// Sessions currently registered for attach.
    pub fn registered_sessions(&self) -> Vec<SessionDescriptor> {
        self.state.lock().registered.clone()
    }

    /// Number of sessions currently held by reservations.
    pub fn held_sessions(&self) -> usize {
        self.state.lock().held.len()
    }

    async fn acquire(
        &self,
        sessions: Vec<SessionDescriptor>,
        timeout: Option<Duration>,
    ) -> HalResult<Reservation> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let busy: Vec<String> = {
                let mut state = self.state.lock();
                let busy: Vec<String> = sessions
                    .iter()
                    .filter(|s| state.held.contains_key(&s.session_name))
                    .map(|s| s.session_name.clone())
                    .collect();
                if busy.is_empty() {
                    state.next_id += 1;
                    let id = state.next_id;
                    for session in &sessions {
                        state.held.insert(session.session_name.clone(), id);
                    }
                    debug!(reservation_id = id, sessions = sessions.len(), "Reserved sessions");
                    return Ok(Reservation { id, sessions });
                }
                busy
            };

            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    return Err(HalError::Reservation(format!(
                        "Timed out waiting for sessions held by another client: {}",
                        busy.join(", ")
                    )));
                }
                Some(deadline) => {
                    let _ = tokio::time::timeout_at(deadline, notified).await;
                }
                None => notified.await,
            }
        }
    }
}

#[async_trait]
impl SessionReservationService for InMemoryReservationService {
    async fn reserve_sessions(&self, pins: &[String], timeout: Option<Duration>) -> HalResult<Reservation> {
        if pins.is_empty() {
            return Err(HalError::Reservation("No pins requested".to_string()));
        }
        let sessions = self.pin_map.sessions_for(pins)?;
        self.acquire(sessions, timeout).await
    }

    async fn reserve_all_sessions(&self, timeout: Option<Duration>) -> HalResult<Reservation> {
        self.acquire(self.pin_map.sessions.clone(), timeout).await
    }

    async fn reserve_all_registered_sessions(&self, timeout: Option<Duration>) -> HalResult<Reservation> {
        let registered = self.registered_sessions();
        self.acquire(registered, timeout).await
    }

    async fn unreserve(&self, reservation: &Reservation) -> HalResult<()> {
        {
            let mut state = self.state.lock();
            state.held.retain(|_, id| *id != reservation.id);
        }
        debug!(reservation_id = reservation.id, "Released reservation");
        self.released.notify_waiters();
        Ok(())
    }

    async fn register_sessions(&self, sessions: &[SessionDescriptor]) -> HalResult<()> {
        let mut state = self.state.lock();
        for session in sessions {
            if !state
                .registered
                .iter()
                .any(|r| r.session_name == session.session_name)
            {
                state.registered.push(session.clone());
            }
        }
        info!(count = sessions.len(), "Registered sessions");
        Ok(())
    }

    async fn unregister_sessions(&self, sessions: &[SessionDescriptor]) -> HalResult<()> {
        let names: HashSet<&str> = sessions.iter().map(|s| s.session_name.as_str()).collect();
        let mut state = self.state.lock();
        state
            .registered
            .retain(|r| !names.contains(r.session_name.as_str()));
        info!(count = sessions.len(), "Unregistered sessions");
        Ok(())
    }
}
