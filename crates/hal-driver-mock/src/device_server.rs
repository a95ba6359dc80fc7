//! Simulated vendor session backend.
//!
//! Real instrument drivers open named sessions through a device server that lets several
//! processes share one session: a setup step creates it and detaches, later measurements
//! attach, and a cleanup step attaches and closes. [`SimulatedDeviceServer`] reproduces
//! that lifecycle in memory, shared by every simulated driver in the process.
//!
//! | Behavior               | Session exists | Session missing | On release |
//! |------------------------|----------------|-----------------|------------|
//! | `Auto`                 | attach         | create          | detach if attached, close if created |
//! | `CreateNew`            | error          | create          | close      |
//! | `AttachExisting`       | attach         | error           | detach     |
//! | `InitializeThenDetach` | error          | create          | detach     |
//! | `AttachThenClose`      | attach         | error           | close      |
//!
//! The server also models the test fixture: SMUs drive a shared node voltage that DMMs
//! read back. Every lifecycle step is appended to a journal that tests assert on.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hal_core::{
    ConfigurationMap, DmmFunction, DriverError, DriverErrorKind, InitializationBehavior,
    InitializeParams,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// Journal
// =============================================================================

/// What release does with a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDisposition {
    /// Close the session on the server
    Close,
    /// Leave the session open for the next client
    Detach,
}

/// One lifecycle step recorded by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A new session was created
    Created {
        /// Session name
        session_name: String,
        /// Resource the session was opened on
        resource_name: String,
    },
    /// A driver attached to an existing session
    Attached {
        /// Session name
        session_name: String,
    },
    /// The device was reset during initialize
    Reset {
        /// Session name
        session_name: String,
    },
    /// A driver option was applied
    Configured {
        /// Session name
        session_name: String,
        /// Option name
        option: String,
    },
    /// Output was aborted
    Aborted {
        /// Session name
        session_name: String,
    },
    /// A driver detached and left the session open
    Detached {
        /// Session name
        session_name: String,
    },
    /// The session was closed
    Closed {
        /// Session name
        session_name: String,
    },
}

impl ServerEvent {
    /// Session the event belongs to.
    pub fn session_name(&self) -> &str {
        match self {
            Self::Created { session_name, .. }
            | Self::Attached { session_name }
            | Self::Reset { session_name }
            | Self::Configured { session_name, .. }
            | Self::Aborted { session_name }
            | Self::Detached { session_name }
            | Self::Closed { session_name } => session_name,
        }
    }
}

// =============================================================================
// Instrument State
// =============================================================================

/// SMU output channel state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputState {
    /// Programmed output level in volts
    pub voltage_level: f64,
    /// Voltage level range in volts
    pub voltage_level_range: f64,
    /// Current limit in amps
    pub current_limit: f64,
    /// Current limit range in amps
    pub current_limit_range: f64,
    /// Output has been initiated and not aborted
    pub running: bool,
    /// When the source-complete event fires
    pub source_complete_at: Option<Instant>,
}

/// DMM measurement configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DmmConfiguration {
    /// Configured measurement function
    pub function: DmmFunction,
    /// Configured range
    pub range: f64,
    /// Configured resolution in digits
    pub resolution_digits: f64,
}

impl Default for DmmConfiguration {
    fn default() -> Self {
        Self {
            function: DmmFunction::DcVolts,
            range: 10.0,
            resolution_digits: 5.5,
        }
    }
}

/// Everything a session remembers between clients.
#[derive(Debug, Clone, Default)]
pub struct InstrumentState {
    /// Driver options applied at initialization
    pub options: ConfigurationMap,
    /// Resets performed by initialize
    pub reset_count: u32,
    /// Times a driver attached to this session
    pub attach_count: u32,
    /// Source output state
    pub output: OutputState,
    /// DMM configuration
    pub dmm: DmmConfiguration,
}

/// A session held by the server.
#[derive(Debug)]
pub struct SimulatedInstrument {
    session_name: String,
    resource_name: String,
    instrument_type: String,
    state: Mutex<InstrumentState>,
}

impl SimulatedInstrument {
    fn new(session_name: &str, resource_name: &str, instrument_type: &str) -> Self {
        Self {
            session_name: session_name.to_string(),
            resource_name: resource_name.to_string(),
            instrument_type: instrument_type.to_string(),
            state: Mutex::new(InstrumentState::default()),
        }
    }

    /// Session name the instrument was opened under.
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Resource name the session was created with.
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Instrument type that created the session.
    pub fn instrument_type(&self) -> &str {
        &self.instrument_type
    }

    /// Copy of the full instrument state.
    pub fn snapshot(&self) -> InstrumentState {
        self.state.lock().clone()
    }

    /// Copy of the source output state.
    pub fn output(&self) -> OutputState {
        self.state.lock().output.clone()
    }

    /// Copy of the DMM configuration.
    pub fn dmm_configuration(&self) -> DmmConfiguration {
        self.state.lock().dmm
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut InstrumentState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

/// A driver's hold on a server session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    instrument: Arc<SimulatedInstrument>,
    disposition: SessionDisposition,
}

impl SessionHandle {
    /// Instrument behind the handle.
    pub fn instrument(&self) -> &Arc<SimulatedInstrument> {
        &self.instrument
    }

    /// What release does to the session.
    pub fn disposition(&self) -> SessionDisposition {
        self.disposition
    }

    /// Session the handle refers to.
    pub fn session_name(&self) -> &str {
        self.instrument.session_name()
    }
}

/// Slot holding a driver's session between initialize and release.
#[derive(Debug, Default)]
pub(crate) struct SessionSlot {
    handle: Mutex<Option<SessionHandle>>,
}

impl SessionSlot {
    pub(crate) fn is_open(&self) -> bool {
        self.handle.lock().is_some()
    }

    pub(crate) fn fill(&self, handle: SessionHandle) {
        *self.handle.lock() = Some(handle);
    }

    pub(crate) fn take(&self) -> Option<SessionHandle> {
        self.handle.lock().take()
    }

    pub(crate) fn instrument(
        &self,
        instrument_type: &str,
    ) -> Result<Arc<SimulatedInstrument>, DriverError> {
        self.handle
            .lock()
            .as_ref()
            .map(|h| Arc::clone(h.instrument()))
            .ok_or_else(|| {
                DriverError::new(
                    instrument_type,
                    DriverErrorKind::Initialization,
                    "Session is not initialized",
                )
            })
    }
}

// =============================================================================
// Device Server
// =============================================================================

#[derive(Debug, Default)]
struct Faults {
    fail_initialize: HashSet<String>,
    fail_release: HashSet<String>,
    stalled: HashSet<String>,
}

/// In-memory device server shared by the simulated drivers.
#[derive(Debug, Default)]
pub struct SimulatedDeviceServer {
    sessions: DashMap<String, Arc<SimulatedInstrument>>,
    journal: Mutex<Vec<ServerEvent>>,
    node_voltage: Mutex<f64>,
    faults: Mutex<Faults>,
}

impl SimulatedDeviceServer {
    /// Server with no open sessions and the fixture node at 0 V.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for `params.descriptor` according to `params.behavior`.
    ///
    /// `resource_name` is passed separately because some drivers rewrite it before
    /// connecting.
    pub fn open(
        &self,
        instrument_type: &str,
        resource_name: &str,
        params: InitializeParams<'_>,
    ) -> Result<SessionHandle, DriverError> {
        let session_name = params.descriptor.session_name.as_str();
        let error = |message: String| {
            DriverError::new(instrument_type, DriverErrorKind::Initialization, message)
        };

        if self.faults.lock().fail_initialize.remove(session_name) {
            warn!(session_name, "Injected initialization failure");
            return Err(error(format!(
                "Injected initialization failure for session '{session_name}'"
            )));
        }

        let (instrument, disposition, event) = match self.sessions.entry(session_name.to_string())
        {
            Entry::Occupied(entry) => {
                let disposition = match params.behavior {
                    InitializationBehavior::Auto | InitializationBehavior::AttachExisting => {
                        SessionDisposition::Detach
                    }
                    InitializationBehavior::AttachThenClose => SessionDisposition::Close,
                    InitializationBehavior::CreateNew
                    | InitializationBehavior::InitializeThenDetach => {
                        return Err(error(format!(
                            "Session '{session_name}' already exists ({})",
                            params.behavior
                        )));
                    }
                };
                let instrument = Arc::clone(entry.get());
                if !instrument.instrument_type.eq_ignore_ascii_case(instrument_type) {
                    return Err(error(format!(
                        "Session '{session_name}' is open as '{}', not '{instrument_type}'",
                        instrument.instrument_type
                    )));
                }
                instrument.update(|s| s.attach_count += 1);
                let event = ServerEvent::Attached {
                    session_name: session_name.to_string(),
                };
                (instrument, disposition, event)
            }
            Entry::Vacant(entry) => {
                let disposition = match params.behavior {
                    InitializationBehavior::Auto | InitializationBehavior::CreateNew => {
                        SessionDisposition::Close
                    }
                    InitializationBehavior::InitializeThenDetach => SessionDisposition::Detach,
                    InitializationBehavior::AttachExisting
                    | InitializationBehavior::AttachThenClose => {
                        return Err(error(format!(
                            "Session '{session_name}' does not exist ({})",
                            params.behavior
                        )));
                    }
                };
                let instrument = Arc::new(SimulatedInstrument::new(
                    session_name,
                    resource_name,
                    instrument_type,
                ));
                entry.insert(Arc::clone(&instrument));
                let event = ServerEvent::Created {
                    session_name: session_name.to_string(),
                    resource_name: resource_name.to_string(),
                };
                (instrument, disposition, event)
            }
        };
        self.record(event);

        if params.reset_device {
            instrument.update(|s| {
                s.reset_count += 1;
                s.output = OutputState::default();
                s.dmm = DmmConfiguration::default();
            });
            self.record(ServerEvent::Reset {
                session_name: session_name.to_string(),
            });
        }

        for (key, value) in params.options {
            instrument.update(|s| s.options.insert(key.clone(), value.clone()));
            self.record(ServerEvent::Configured {
                session_name: session_name.to_string(),
                option: key.clone(),
            });
        }

        info!(
            session_name,
            resource_name,
            instrument_type,
            behavior = %params.behavior,
            ?disposition,
            "Opened simulated session"
        );
        Ok(SessionHandle {
            instrument,
            disposition,
        })
    }

    /// Detach from or close the session behind `handle`.
    pub fn release(&self, handle: &SessionHandle) -> Result<(), DriverError> {
        let session_name = handle.session_name();
        if self.faults.lock().fail_release.contains(session_name) {
            warn!(session_name, "Injected release failure");
            return Err(DriverError::new(
                handle.instrument.instrument_type(),
                DriverErrorKind::Shutdown,
                format!("Injected release failure for session '{session_name}'"),
            ));
        }

        let event = match handle.disposition {
            SessionDisposition::Close => {
                self.sessions
                    .remove_if(session_name, |_, v| Arc::ptr_eq(v, &handle.instrument));
                ServerEvent::Closed {
                    session_name: session_name.to_string(),
                }
            }
            SessionDisposition::Detach => ServerEvent::Detached {
                session_name: session_name.to_string(),
            },
        };
        debug!(session_name, disposition = ?handle.disposition, "Released simulated session");
        self.record(event);
        Ok(())
    }

    /// Stop the output of `instrument`.
    pub fn abort_output(&self, instrument: &SimulatedInstrument) {
        instrument.update(|s| {
            s.output.running = false;
            s.output.source_complete_at = None;
        });
        self.record(ServerEvent::Aborted {
            session_name: instrument.session_name().to_string(),
        });
    }

    /// Whether `session_name` is open.
    pub fn is_open(&self, session_name: &str) -> bool {
        self.sessions.contains_key(session_name)
    }

    /// Names of open sessions, sorted.
    pub fn open_sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Instrument of the open session `session_name`.
    pub fn instrument(&self, session_name: &str) -> Option<Arc<SimulatedInstrument>> {
        self.sessions.get(session_name).map(|e| Arc::clone(e.value()))
    }

    // =========================================================================
    // Fixture
    // =========================================================================

    /// Voltage currently driven onto the fixture node.
    pub fn node_voltage(&self) -> f64 {
        *self.node_voltage.lock()
    }

    /// Drive the fixture node to `volts`.
    pub fn set_node_voltage(&self, volts: f64) {
        *self.node_voltage.lock() = volts;
    }

    // =========================================================================
    // Fault Injection
    // =========================================================================

    /// Fail the next initialize of `session_name`.
    pub fn fail_next_initialize(&self, session_name: impl Into<String>) {
        self.faults.lock().fail_initialize.insert(session_name.into());
    }

    /// Make every release of `session_name` fail until cleared.
    pub fn set_release_failure(&self, session_name: impl Into<String>, fail: bool) {
        let name = session_name.into();
        let mut faults = self.faults.lock();
        if fail {
            faults.fail_release.insert(name);
        } else {
            faults.fail_release.remove(&name);
        }
    }

    /// Hold back the source-complete event of `session_name` until cleared.
    pub fn stall_source_complete(&self, session_name: impl Into<String>, stalled: bool) {
        let name = session_name.into();
        let mut faults = self.faults.lock();
        if stalled {
            faults.stalled.insert(name);
        } else {
            faults.stalled.remove(&name);
        }
    }

    /// Whether source-complete is held back for `session_name`.
    pub fn is_stalled(&self, session_name: &str) -> bool {
        self.faults.lock().stalled.contains(session_name)
    }

    // =========================================================================
    // Journal
    // =========================================================================

    /// Every event recorded since the last clear.
    pub fn journal(&self) -> Vec<ServerEvent> {
        self.journal.lock().clone()
    }

    /// Journal entries for one session.
    pub fn events_for(&self, session_name: &str) -> Vec<ServerEvent> {
        self.journal
            .lock()
            .iter()
            .filter(|e| e.session_name() == session_name)
            .cloned()
            .collect()
    }

    /// Forget recorded events.
    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    fn record(&self, event: ServerEvent) {
        self.journal.lock().push(event);
    }
}
