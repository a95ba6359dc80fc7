//! Session lifecycle manager.
//!
//! [`SessionManager`] turns a [`Reservation`] into live driver sessions and guarantees
//! they are released again:
//!
//! 1. every descriptor's driver is resolved before anything is opened, so an unsupported
//!    instrument type fails without side effects
//! 2. descriptors are initialized strictly in order; each ready session is pushed onto the
//!    scope's unwind stack
//! 3. if descriptor k fails, sessions k-1..1 are released (last opened first) and the
//!    driver error is surfaced as [`HalError::InitializationFailure`]; descriptor k never
//!    reached ready and is not released
//! 4. otherwise the caller gets a [`SessionScope`] whose [`PinSessionMap`] fans each
//!    descriptor out to its pins
//!
//! A scope is torn down, again last-opened-first, by [`SessionScope::close`], by
//! [`SessionManager::with_sessions`] after the body returns or panics, or, when the scope is
//! dropped without either (e.g. the owning future was cancelled), by a teardown task spawned
//! on the current Tokio runtime.

use crate::registry::DriverRegistry;
use futures::future::{BoxFuture, FutureExt};
use hal_core::{
    Capability, ConfigurationMap, DriverComponents, HalError, HalResult, InitializationBehavior,
    InitializeParams, InstrumentTypeId, Measures, Multimeter, Reservation, SessionDescriptor,
    SessionReservationService, Signal, Sources,
};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Sessions and Pin Map
// =============================================================================

/// One initialized driver session.
pub struct InstrumentSession {
    descriptor: SessionDescriptor,
    components: DriverComponents,
}

impl InstrumentSession {
    /// Descriptor the session was opened from.
    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    /// Session name from the pin map.
    pub fn session_name(&self) -> &str {
        &self.descriptor.session_name
    }

    /// Instrument type the session was opened with.
    pub fn instrument_type_id(&self) -> &InstrumentTypeId {
        &self.descriptor.instrument_type_id
    }

    /// Capabilities the driver exposes, in declaration order.
    pub fn capabilities(&self) -> Vec<Capability> {
        self.components.capabilities()
    }
}

impl fmt::Debug for InstrumentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentSession")
            .field("session_name", &self.descriptor.session_name)
            .field("instrument_type_id", &self.descriptor.instrument_type_id)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// Pin name to the session backing it.
///
/// Pins that fan out from one descriptor share a single [`InstrumentSession`]
/// (`Arc::ptr_eq` holds between them).
#[derive(Debug, Default)]
pub struct PinSessionMap {
    pins: HashMap<String, Arc<InstrumentSession>>,
}

impl PinSessionMap {
    fn from_sessions(sessions: &[Arc<InstrumentSession>]) -> Self {
        let mut pins = HashMap::new();
        for session in sessions {
            for pin in session.descriptor.pins() {
                pins.insert(pin.to_string(), Arc::clone(session));
            }
        }
        Self { pins }
    }

    /// Session backing `pin`.
    pub fn session(&self, pin: &str) -> HalResult<&Arc<InstrumentSession>> {
        self.pins
            .get(pin)
            .ok_or_else(|| HalError::PinNotReserved(pin.to_string()))
    }

    /// `Sources<S>` view of the session backing `pin`.
    pub fn sources<S: Signal>(&self, pin: &str) -> HalResult<Arc<dyn Sources<S>>> {
        let session = self.session(pin)?;
        S::sources(&session.components)
            .ok_or_else(|| mismatch(pin, session, S::SOURCE_CAPABILITY))
    }

    /// `Measures<S>` view of the session backing `pin`.
    pub fn measures<S: Signal>(&self, pin: &str) -> HalResult<Arc<dyn Measures<S>>> {
        let session = self.session(pin)?;
        S::measures(&session.components)
            .ok_or_else(|| mismatch(pin, session, S::MEASURE_CAPABILITY))
    }

    /// [`Multimeter`] view of the session backing `pin`.
    pub fn multimeter(&self, pin: &str) -> HalResult<Arc<dyn Multimeter>> {
        let session = self.session(pin)?;
        session
            .components
            .multimeter
            .clone()
            .ok_or_else(|| mismatch(pin, session, Capability::Multimeter))
    }

    /// Pin names, sorted.
    pub fn pin_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether `pin` is mapped in this scope.
    pub fn contains(&self, pin: &str) -> bool {
        self.pins.contains_key(pin)
    }

    /// Number of mapped pins.
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    /// Whether no pin is mapped.
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

fn mismatch(pin: &str, session: &InstrumentSession, capability: Capability) -> HalError {
    HalError::CapabilityMismatch {
        pin: pin.to_string(),
        instrument_type_id: session.instrument_type_id().to_string(),
        capability,
    }
}

// =============================================================================
// Initialization Options
// =============================================================================

/// Options applied to every session opened in one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct InitOptions {
    /// Reset devices before they are considered ready
    pub reset_device: bool,
    /// Driver options, passed through untouched
    pub options: ConfigurationMap,
    /// Create/attach and detach/close policy
    pub behavior: InitializationBehavior,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self::measurement()
    }
}

impl InitOptions {
    /// Measurement defaults: attach if possible, no reset.
    pub fn measurement() -> Self {
        Self {
            reset_device: false,
            options: ConfigurationMap::new(),
            behavior: InitializationBehavior::Auto,
        }
    }

    /// Up-front creation defaults: reset, then leave sessions open for later attach.
    pub fn create() -> Self {
        Self {
            reset_device: true,
            options: ConfigurationMap::new(),
            behavior: InitializationBehavior::InitializeThenDetach,
        }
    }

    /// Teardown defaults: attach without perturbing the device, then close.
    pub fn destroy() -> Self {
        Self {
            reset_device: false,
            options: ConfigurationMap::new(),
            behavior: InitializationBehavior::AttachThenClose,
        }
    }

    /// Whether drivers reset the device during initialize.
    pub fn with_reset(mut self, reset_device: bool) -> Self {
        self.reset_device = reset_device;
        self
    }

    /// Create/attach and close/detach policy.
    pub fn with_behavior(mut self, behavior: InitializationBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Add a driver-specific option.
    pub fn with_option(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(name.into(), value);
        self
    }
}

// =============================================================================
// Session Scope (RAII guard)
// =============================================================================

struct ReservationLease {
    reservation: Reservation,
    service: Arc<dyn SessionReservationService>,
}

/// Live sessions for one reservation.
///
/// Release with [`SessionScope::close`]. Dropping an unclosed scope spawns the teardown on
/// the current runtime and logs an error when there is none.
pub struct SessionScope {
    /// Unwind stack, in open order
    opened: Vec<Arc<InstrumentSession>>,
    pins: PinSessionMap,
    lease: Option<ReservationLease>,
    closed: bool,
}

impl fmt::Debug for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionScope")
            .field("sessions", &self.session_names())
            .field("pins", &self.pins.pin_names())
            .field("reserved", &self.lease.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl SessionScope {
    fn new(lease: Option<ReservationLease>) -> Self {
        Self {
            opened: Vec::new(),
            pins: PinSessionMap::default(),
            lease,
            closed: false,
        }
    }

    /// Pin map for this scope.
    pub fn pins(&self) -> &PinSessionMap {
        &self.pins
    }

    /// Sessions in open order.
    pub fn sessions(&self) -> &[Arc<InstrumentSession>] {
        &self.opened
    }

    /// Session names in open order.
    pub fn session_names(&self) -> Vec<&str> {
        self.opened.iter().map(|s| s.session_name()).collect()
    }

    /// Reservation held by this scope, if it was obtained through the manager.
    pub fn reservation(&self) -> Option<&Reservation> {
        self.lease.as_ref().map(|lease| &lease.reservation)
    }

    /// Release every session (last opened first), then the reservation.
    ///
    /// Every release is attempted even after one fails; failures are returned together
    /// as [`HalError::TeardownFailed`]. Sessions stay owned by the scope until their own
    /// release returns, so if this future is dropped part-way the rest are still released
    /// by the background teardown.
    pub async fn close(mut self) -> HalResult<()> {
        self.release_all().await.into_result()
    }

    /// Like [`Self::close`], but reports which sessions failed to release.
    pub(crate) async fn close_with_report(mut self) -> TeardownReport {
        self.release_all().await
    }

    /// Close after a failed open; errors are logged, not returned.
    async fn abandon(self) {
        if let Err(err) = self.close().await {
            error!(error = %err, "Teardown failed while unwinding a partial open");
        }
    }

    #[instrument(skip_all, fields(sessions = self.opened.len(), reserved = self.lease.is_some()))]
    async fn release_all(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        while let Some(session) = self.opened.last().cloned() {
            if let Err(err) = release_session(&session).await {
                report.session_failed(session.session_name(), err);
            }
            self.opened.pop();
        }
        if let Some(lease) = &self.lease {
            if let Err(err) = lease.service.unreserve(&lease.reservation).await {
                error!(error = %err, "Failed to release reservation");
                report.errors.push(err);
            }
        }
        self.lease = None;
        self.closed = true;
        report
    }
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        if self.closed || (self.opened.is_empty() && self.lease.is_none()) {
            return;
        }
        let opened = std::mem::take(&mut self.opened);
        let lease = self.lease.take();
        let names: Vec<String> = opened
            .iter()
            .map(|s| s.session_name().to_string())
            .collect();

        match Handle::try_current() {
            Ok(handle) => {
                warn!(sessions = ?names, "SessionScope dropped without close(), releasing in background");
                handle.spawn(async move {
                    if let Err(err) = teardown(opened, lease).await {
                        error!(error = %err, "Background session teardown failed");
                    }
                });
            }
            Err(_) => {
                error!(
                    sessions = ?names,
                    "SessionScope dropped outside a Tokio runtime; sessions were not released"
                );
            }
        }
    }
}

/// Failures collected while tearing a scope down.
#[derive(Debug, Default)]
pub(crate) struct TeardownReport {
    /// Sessions whose release failed; they may still be open on the device
    pub(crate) failed_sessions: Vec<String>,
    pub(crate) errors: Vec<HalError>,
}

impl TeardownReport {
    fn session_failed(&mut self, session_name: &str, err: HalError) {
        self.failed_sessions.push(session_name.to_string());
        self.errors.push(err);
    }

    pub(crate) fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn into_result(self) -> HalResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(HalError::TeardownFailed(self.errors))
        }
    }
}

async fn release_session(session: &InstrumentSession) -> HalResult<()> {
    match session.components.initializable.release().await {
        Ok(()) => {
            info!(session_name = %session.session_name(), "Released session");
            Ok(())
        }
        Err(err) => {
            error!(session_name = %session.session_name(), error = %err, "Release failed");
            Err(HalError::HardwareFault(err))
        }
    }
}

#[instrument(skip_all, fields(sessions = opened.len(), reserved = lease.is_some()))]
async fn teardown(
    opened: Vec<Arc<InstrumentSession>>,
    lease: Option<ReservationLease>,
) -> HalResult<()> {
    let mut report = TeardownReport::default();
    for session in opened.iter().rev() {
        if let Err(err) = release_session(session).await {
            report.session_failed(session.session_name(), err);
        }
    }
    if let Some(lease) = lease {
        if let Err(err) = lease.service.unreserve(&lease.reservation).await {
            error!(error = %err, "Failed to release reservation");
            report.errors.push(err);
        }
    }
    report.into_result()
}

// =============================================================================
// Session Manager
// =============================================================================

/// Opens and tears down driver sessions for reservations.
pub struct SessionManager {
    registry: Arc<DriverRegistry>,
    reservations: Arc<dyn SessionReservationService>,
    reservation_timeout: Option<Duration>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("registry", &self.registry)
            .field("reservations", &"<dyn SessionReservationService>")
            .field("reservation_timeout", &self.reservation_timeout)
            .finish()
    }
}

impl SessionManager {
    /// Manager resolving drivers from `registry` and reserving through `reservations`.
    pub fn new(
        registry: Arc<DriverRegistry>,
        reservations: Arc<dyn SessionReservationService>,
    ) -> Self {
        Self {
            registry,
            reservations,
            reservation_timeout: None,
        }
    }

    /// How long reservation requests may wait for pins held elsewhere.
    pub fn with_reservation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reservation_timeout = timeout;
        self
    }

    /// Registry drivers are resolved from.
    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    /// Open every session in `reservation`.
    ///
    /// The caller keeps ownership of the reservation itself; closing the returned scope
    /// releases sessions only.
    pub async fn open(
        &self,
        reservation: &Reservation,
        options: &InitOptions,
    ) -> HalResult<SessionScope> {
        self.open_scope(reservation, None, options).await
    }

    /// Reserve the sessions for `pins` and open them.
    ///
    /// Closing the scope releases the sessions and then the reservation.
    pub async fn initialize(
        &self,
        pins: &[String],
        options: &InitOptions,
    ) -> HalResult<SessionScope> {
        let reservation = self
            .reservations
            .reserve_sessions(pins, self.reservation_timeout)
            .await?;
        self.open_leased(reservation, options).await
    }

    /// Run `body` with sessions for `pins`, releasing them afterwards on every path.
    ///
    /// A body error is returned as-is (teardown failures are logged); after a successful
    /// body a teardown failure is returned. A panic in the body is resumed after teardown.
    pub async fn with_sessions<T, F>(
        &self,
        pins: &[String],
        options: &InitOptions,
        body: F,
    ) -> HalResult<T>
    where
        F: for<'s> FnOnce(&'s PinSessionMap) -> BoxFuture<'s, HalResult<T>>,
    {
        let scope = self.initialize(pins, options).await?;
        let outcome = AssertUnwindSafe(body(scope.pins())).catch_unwind().await;
        let teardown = scope.close().await;

        match outcome {
            Ok(Ok(value)) => teardown.map(|()| value),
            Ok(Err(err)) => {
                if let Err(teardown_err) = teardown {
                    warn!(error = %teardown_err, "Teardown failed after measurement error");
                }
                Err(err)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Create every session in the pin map context and leave them open.
    ///
    /// Uses [`InitOptions::create`]. The created sessions are registered with the
    /// reservation service so later measurements attach instead of re-initializing.
    #[instrument(skip(self))]
    pub async fn create_instrument_sessions(&self) -> HalResult<Vec<SessionDescriptor>> {
        let reservation = self
            .reservations
            .reserve_all_sessions(self.reservation_timeout)
            .await?;
        let scope = self.open_leased(reservation, &InitOptions::create()).await?;
        let descriptors: Vec<SessionDescriptor> = scope
            .sessions()
            .iter()
            .map(|s| s.descriptor().clone())
            .collect();

        if let Err(err) = self.reservations.register_sessions(&descriptors).await {
            scope.abandon().await;
            return Err(err);
        }
        scope.close().await?;
        info!(count = descriptors.len(), "Created instrument sessions");
        Ok(descriptors)
    }

    /// Close every registered session.
    ///
    /// Uses [`InitOptions::destroy`], then unregisters the sessions that closed. Sessions
    /// whose release failed stay registered, so a later call can retry them.
    #[instrument(skip(self))]
    pub async fn destroy_instrument_sessions(&self) -> HalResult<Vec<SessionDescriptor>> {
        let reservation = self
            .reservations
            .reserve_all_registered_sessions(self.reservation_timeout)
            .await?;
        let scope = self
            .open_leased(reservation, &InitOptions::destroy())
            .await?;
        let descriptors: Vec<SessionDescriptor> = scope
            .sessions()
            .iter()
            .map(|s| s.descriptor().clone())
            .collect();

        // Sessions that did close are unregistered even when others failed, so a retry
        // only attaches to what is still open.
        let mut report = scope.close_with_report().await;
        let closed: Vec<SessionDescriptor> = descriptors
            .iter()
            .filter(|d| !report.failed_sessions.contains(&d.session_name))
            .cloned()
            .collect();
        if let Err(err) = self.reservations.unregister_sessions(&closed).await {
            if report.is_clean() {
                return Err(err);
            }
            report.errors.push(err);
        }
        if !report.is_clean() {
            warn!(
                failed = ?report.failed_sessions,
                unregistered = closed.len(),
                "Some sessions could not be closed and remain registered"
            );
        }
        report.into_result()?;
        info!(count = descriptors.len(), "Destroyed instrument sessions");
        Ok(descriptors)
    }

    async fn open_leased(
        &self,
        reservation: Reservation,
        options: &InitOptions,
    ) -> HalResult<SessionScope> {
        let lease = ReservationLease {
            reservation: reservation.clone(),
            service: Arc::clone(&self.reservations),
        };
        self.open_scope(&reservation, Some(lease), options).await
    }

    #[instrument(skip_all, fields(sessions = reservation.len(), behavior = %options.behavior, reset = options.reset_device))]
    async fn open_scope(
        &self,
        reservation: &Reservation,
        lease: Option<ReservationLease>,
        options: &InitOptions,
    ) -> HalResult<SessionScope> {
        let mut scope = SessionScope::new(lease);
        match self.open_into(&mut scope, reservation, options).await {
            Ok(()) => {
                scope.pins = PinSessionMap::from_sessions(&scope.opened);
                debug!(pins = ?scope.pins.pin_names(), "Sessions ready");
                Ok(scope)
            }
            Err(err) => {
                if !scope.opened.is_empty() {
                    warn!(opened = scope.opened.len(), "Unwinding sessions after failed open");
                }
                scope.abandon().await;
                Err(err)
            }
        }
    }

    async fn open_into(
        &self,
        scope: &mut SessionScope,
        reservation: &Reservation,
        options: &InitOptions,
    ) -> HalResult<()> {
        reservation.validate()?;

        let resolved = reservation
            .sessions
            .iter()
            .map(|descriptor| {
                self.registry
                    .resolve(&descriptor.instrument_type_id)
                    .map(|constructor| (descriptor, constructor))
            })
            .collect::<HalResult<Vec<_>>>()?;

        for (descriptor, constructor) in resolved {
            let components = constructor.construct();
            let params = InitializeParams {
                descriptor,
                reset_device: options.reset_device,
                options: &options.options,
                behavior: options.behavior,
            };
            if let Err(source) = components.initializable.initialize(params).await {
                warn!(
                    session_name = %descriptor.session_name,
                    instrument_type_id = %descriptor.instrument_type_id,
                    error = %source,
                    "Session initialization failed"
                );
                return Err(HalError::InitializationFailure {
                    instrument_type_id: descriptor.instrument_type_id.to_string(),
                    session_name: descriptor.session_name.clone(),
                    source,
                });
            }
            info!(
                session_name = %descriptor.session_name,
                resource_name = %descriptor.resource_name,
                instrument_type_id = %descriptor.instrument_type_id,
                "Session initialized"
            );
            scope.opened.push(Arc::new(InstrumentSession {
                descriptor: descriptor.clone(),
                components,
            }));
        }
        Ok(())
    }
}
