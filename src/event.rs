//! Event types flowing from subtasks into the dispatcher.
//!
//! An [`Event`] is immutable once constructed. Subtasks build one from raw
//! source data and hand it to `EventManager::handle_event`; every trigger sees
//! the same value for the duration of that single dispatch.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::platform::{CompanionMessage, DeviceId, ErrorLogEntry, MemRange, ResourceHandle};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random event id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of the object an event originated from (channel, device, engine).
///
/// Counted triggers keep one occurrence counter per source.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

impl From<DeviceId> for SourceId {
    fn from(device: DeviceId) -> Self {
        Self(u64::from(device.0))
    }
}

impl From<ResourceHandle> for SourceId {
    fn from(handle: ResourceHandle) -> Self {
        Self(u64::from(handle.0))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src:{:#x}", self.0)
    }
}

/// Discriminant of [`EventPayload`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TestStarted,
    TestEnded,
    Named,
    Resource,
    Companion,
    MemoryChanged,
    SurfaceMatched,
    TimerElapsed,
    ErrorLogged,
    Fault,
    Interrupt,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TestStarted => "test_started",
            Self::TestEnded => "test_ended",
            Self::Named => "named",
            Self::Resource => "resource",
            Self::Companion => "companion",
            Self::MemoryChanged => "memory_changed",
            Self::SurfaceMatched => "surface_matched",
            Self::TimerElapsed => "timer_elapsed",
            Self::ErrorLogged => "error_logged",
            Self::Fault => "fault",
            Self::Interrupt => "interrupt",
        };
        f.write_str(s)
    }
}

/// Source-specific event attributes.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// The test began; emitted once by `start_test`.
    TestStarted,

    /// The test is ending; emitted once by `end_test`.
    TestEnded,

    /// An application-defined occurrence identified by name.
    Named {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<SourceId>,
    },

    /// A privileged-service notification fired.
    Resource { parent: ResourceHandle, index: u32 },

    /// A companion-processor message arrived.
    Companion { device: DeviceId, message: CompanionMessage },

    /// A watched memory word changed.
    MemoryChanged { address: u64, previous: u64, current: u64 },

    /// A watched surface range reached its expected contents.
    SurfaceMatched { range: MemRange, bytes: Vec<u8> },

    /// A timer deadline passed.
    TimerElapsed,

    /// An error-log entry was recorded.
    ErrorLogged { entry: ErrorLogEntry },

    /// A fault was reported by a channel or engine.
    Fault {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<SourceId>,
        code: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<u64>,
    },

    /// An interrupt was raised.
    Interrupt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<SourceId>,
        code: u32,
    },
}

/// An asynchronous occurrence delivered to the dispatcher.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    /// Wraps a payload with a fresh id and the current time.
    #[must_use]
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// The event dispatched by `start_test`.
    #[must_use]
    pub fn test_started() -> Self {
        Self::new(EventPayload::TestStarted)
    }

    /// The event dispatched by `end_test`.
    #[must_use]
    pub fn test_ended() -> Self {
        Self::new(EventPayload::TestEnded)
    }

    /// A named event with no particular source.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(EventPayload::Named {
            name: name.into(),
            source: None,
        })
    }

    /// A named event attributed to `source`.
    #[must_use]
    pub fn named_from(name: impl Into<String>, source: SourceId) -> Self {
        Self::new(EventPayload::Named {
            name: name.into(),
            source: Some(source),
        })
    }

    /// Builds the event for one companion-processor message.
    #[must_use]
    pub fn companion(device: DeviceId, message: CompanionMessage) -> Self {
        Self::new(EventPayload::Companion { device, message })
    }

    /// Builds the event for one error-log entry.
    #[must_use]
    pub fn error_logged(entry: ErrorLogEntry) -> Self {
        Self::new(EventPayload::ErrorLogged { entry })
    }

    /// A processor fault, optionally attributed to a source and address.
    #[must_use]
    pub fn fault(source: Option<SourceId>, code: u32, address: Option<u64>) -> Self {
        Self::new(EventPayload::Fault { source, code, address })
    }

    /// An interrupt raised by `source`.
    #[must_use]
    pub fn interrupt(source: Option<SourceId>, code: u32) -> Self {
        Self::new(EventPayload::Interrupt { source, code })
    }

    /// The payload discriminant.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::TestStarted => EventKind::TestStarted,
            EventPayload::TestEnded => EventKind::TestEnded,
            EventPayload::Named { .. } => EventKind::Named,
            EventPayload::Resource { .. } => EventKind::Resource,
            EventPayload::Companion { .. } => EventKind::Companion,
            EventPayload::MemoryChanged { .. } => EventKind::MemoryChanged,
            EventPayload::SurfaceMatched { .. } => EventKind::SurfaceMatched,
            EventPayload::TimerElapsed => EventKind::TimerElapsed,
            EventPayload::ErrorLogged { .. } => EventKind::ErrorLogged,
            EventPayload::Fault { .. } => EventKind::Fault,
            EventPayload::Interrupt { .. } => EventKind::Interrupt,
        }
    }

    /// The originating object, when the source carries one.
    #[must_use]
    pub fn source(&self) -> Option<SourceId> {
        match &self.payload {
            EventPayload::Named { source, .. }
            | EventPayload::Fault { source, .. }
            | EventPayload::Interrupt { source, .. } => *source,
            EventPayload::Resource { parent, .. } => Some((*parent).into()),
            EventPayload::Companion { device, .. } => Some((*device).into()),
            _ => None,
        }
    }

    /// The event name for [`EventPayload::Named`].
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Named { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The fault or interrupt code, companion message code, or error-log code.
    #[must_use]
    pub const fn code(&self) -> Option<u32> {
        match &self.payload {
            EventPayload::Fault { code, .. } | EventPayload::Interrupt { code, .. } => Some(*code),
            EventPayload::Companion { message, .. } => Some(message.code),
            EventPayload::ErrorLogged { entry } => Some(entry.code),
            _ => None,
        }
    }
}
