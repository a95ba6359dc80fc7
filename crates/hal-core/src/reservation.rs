//! Reservation data model and the reservation collaborator contract.
//!
//! A [`Reservation`] is what the session-management service hands back when a measurement
//! asks for pins: an ordered list of [`SessionDescriptor`]s, each describing one physical
//! session and the pins that fan out onto it. The HAL never decides which resource backs a
//! pin; it only consumes descriptors through [`SessionReservationService`].

use crate::error::{HalError, HalResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

// =============================================================================
// Instrument Type Id
// =============================================================================

/// Key identifying a driver family, e.g. `"niDMM"` or `"niDCPower"`.
///
/// Comparison is ASCII case-insensitive: the registry normalizes ids with
/// [`InstrumentTypeId::normalized`] on both registration and lookup. The original
/// spelling is kept for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstrumentTypeId(String);

impl InstrumentTypeId {
    /// Id with the given spelling.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id as written in the pin map.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lookup key used by the registry.
    pub fn normalized(&self) -> String {
        self.0.trim().to_ascii_lowercase()
    }

    /// True when the id is empty or only whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl PartialEq for InstrumentTypeId {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for InstrumentTypeId {}

impl std::hash::Hash for InstrumentTypeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized().hash(state);
    }
}

impl fmt::Display for InstrumentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstrumentTypeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for InstrumentTypeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// One pin (or relay) mapped onto a session channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMapping {
    /// Logical pin or relay name
    pub pin_or_relay_name: String,
    /// Site index (`None` for system pins)
    #[serde(default)]
    pub site: Option<i32>,
    /// Instrument channel the pin is wired to
    #[serde(default)]
    pub channel: String,
}

/// Static description of one physical session before it is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Display name used by the session backend to share sessions across processes
    pub session_name: String,
    /// Physical resource the session talks to
    pub resource_name: String,
    /// Driver family
    pub instrument_type_id: InstrumentTypeId,
    /// Channels covered by this session (driver-specific syntax)
    #[serde(default)]
    pub channel_list: String,
    /// Pins fanning out onto this session
    #[serde(default)]
    pub channel_mappings: Vec<ChannelMapping>,
}

impl SessionDescriptor {
    /// Descriptor with no pin mappings.
    pub fn new(
        session_name: impl Into<String>,
        resource_name: impl Into<String>,
        instrument_type_id: impl Into<InstrumentTypeId>,
    ) -> Self {
        Self {
            session_name: session_name.into(),
            resource_name: resource_name.into(),
            instrument_type_id: instrument_type_id.into(),
            channel_list: String::new(),
            channel_mappings: Vec::new(),
        }
    }

    /// Map a pin onto this session.
    pub fn with_pin(mut self, pin: impl Into<String>, site: Option<i32>, channel: impl Into<String>) -> Self {
        self.channel_mappings.push(ChannelMapping {
            pin_or_relay_name: pin.into(),
            site,
            channel: channel.into(),
        });
        self
    }

    /// Channels the session spans.
    pub fn with_channel_list(mut self, channel_list: impl Into<String>) -> Self {
        self.channel_list = channel_list.into();
        self
    }

    /// Pin names mapped onto this session, in mapping order.
    pub fn pins(&self) -> impl Iterator<Item = &str> {
        self.channel_mappings
            .iter()
            .map(|m| m.pin_or_relay_name.as_str())
    }
}

/// Ordered set of sessions granted to one caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Token identifying this grant to the reservation service
    #[serde(default)]
    pub id: u64,
    /// Sessions in open order
    pub sessions: Vec<SessionDescriptor>,
}

impl Reservation {
    /// Reservation over `sessions`, in open order, with no service token.
    pub fn new(sessions: Vec<SessionDescriptor>) -> Self {
        Self { id: 0, sessions }
    }

    /// Check that session names are unique and every pin maps to exactly one session.
    pub fn validate(&self) -> HalResult<()> {
        let mut names = HashSet::new();
        let mut seen = HashSet::new();
        for descriptor in &self.sessions {
            if !names.insert(descriptor.session_name.as_str()) {
                return Err(HalError::Reservation(format!(
                    "Session '{}' appears more than once",
                    descriptor.session_name
                )));
            }
            for pin in descriptor.pins() {
                if !seen.insert(pin) {
                    return Err(HalError::Reservation(format!(
                        "Pin '{}' is mapped to more than one session",
                        pin
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether no session is reserved.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of reserved sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

// =============================================================================
// Initialization Options
// =============================================================================

/// Whether a physical session is created or attached, and whether it is detached or
/// closed when the scope ends.
///
/// Passed through unchanged to the driver, which forwards it to its session backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializationBehavior {
    /// Attach if the session exists, otherwise create. Closes only what it created.
    #[default]
    Auto,
    /// Create a new session; fail if one exists. Close at scope end.
    CreateNew,
    /// Attach to an existing session; fail if none. Detach at scope end.
    AttachExisting,
    /// Create a new session and leave it open at scope end.
    InitializeThenDetach,
    /// Attach to an existing session and close it at scope end.
    AttachThenClose,
}

impl fmt::Display for InitializationBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Auto => "auto",
            Self::CreateNew => "create_new",
            Self::AttachExisting => "attach_existing",
            Self::InitializeThenDetach => "initialize_then_detach",
            Self::AttachThenClose => "attach_then_close",
        };
        f.write_str(label)
    }
}

/// Option name to value, passed opaquely to drivers.
pub type ConfigurationMap = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Reservation Service
// =============================================================================

/// Boundary with the session-management service.
///
/// Implementations own physical-resource exclusivity; the HAL only asks for
/// descriptors and hands them back.
#[async_trait]
pub trait SessionReservationService: Send + Sync {
    /// Reserve the sessions backing `pins`.
    async fn reserve_sessions(&self, pins: &[String], timeout: Option<Duration>) -> HalResult<Reservation>;

    /// Reserve every session in the pin map context.
    async fn reserve_all_sessions(&self, timeout: Option<Duration>) -> HalResult<Reservation>;

    /// Reserve every session previously passed to [`Self::register_sessions`].
    async fn reserve_all_registered_sessions(&self, timeout: Option<Duration>) -> HalResult<Reservation>;

    /// Give a reservation back.
    async fn unreserve(&self, reservation: &Reservation) -> HalResult<()>;

    /// Advertise sessions that were left open for later processes to attach to.
    async fn register_sessions(&self, sessions: &[SessionDescriptor]) -> HalResult<()>;

    /// Withdraw sessions that were closed.
    async fn unregister_sessions(&self, sessions: &[SessionDescriptor]) -> HalResult<()>;
}
