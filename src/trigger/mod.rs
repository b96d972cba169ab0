//! Triggers: predicates over events, each bound to one action block.
//!
//! Matching is two-phase. `could_match` is a cheap, lock-free
//! over-approximation evaluated for every trigger before the dispatch lock is
//! taken; `do_match` is the definitive decision, made under the dispatch lock,
//! and may advance private state such as occurrence counters. The dispatcher
//! only calls `do_match` for an event after `could_match` returned true for it.

use std::fmt;
use std::ops::{BitAnd, BitOr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::event::Event;
use crate::platform::PlatformCaps;

/// Lifecycle and event-matching triggers.
pub mod basic;
/// Composite triggers.
pub mod composite;
/// Occurrence-counting triggers.
pub mod counted;

pub use basic::{EventTrigger, LifecycleTrigger};
pub use composite::AnyOf;
pub use counted::{CountedTrigger, Occurrence};

/// Unique identifier for a registered trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(Uuid);

impl TriggerId {
    /// Create a new random trigger id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TriggerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What the events a trigger matches are guaranteed to carry.
///
/// Actions consult this in `is_supported` to refuse triggers whose events
/// lack the data they need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    /// Matching events identify their originating source.
    pub const SOURCE: Self = Self(1 << 0);
    /// Matching events carry a payload (message bytes, log entry, surface data).
    pub const PAYLOAD: Self = Self(1 << 1);
    /// Matching events carry a memory address or range.
    pub const MEMORY: Self = Self(1 << 2);
    /// Matching events are test lifecycle transitions.
    pub const LIFECYCLE: Self = Self(1 << 3);
    /// Matching events are named.
    pub const NAME: Self = Self(1 << 4);

    /// No capabilities.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every capability bit set.
    #[must_use]
    pub const fn all() -> Self {
        Self(0b1_1111)
    }

    /// Returns true if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when no capability bit is set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for Capabilities {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// A predicate over events.
///
/// Implementations hold any private state behind interior mutability:
/// `could_match` runs concurrently from every subtask thread, while
/// `do_match` and `start_test` are serialized by the dispatch lock.
///
/// Contract: `do_match(e)` may only return true if `could_match(e)` does.
pub trait Trigger: Send + Sync {
    /// Human-readable name used in logs and errors.
    fn name(&self) -> &str;

    /// Static configuration check, called once at registration.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationError::Unsupported` when the trigger cannot work
    /// on the current platform.
    fn is_supported(&self, caps: &PlatformCaps) -> EngineResult<()>;

    /// What matching events carry.
    fn capabilities(&self) -> Capabilities;

    /// Cheap, conservative pre-check. Must never be false for an event
    /// `do_match` would accept.
    fn could_match(&self, event: &Event) -> bool;

    /// Definitive decision; may mutate private state.
    fn do_match(&self, event: &Event) -> bool;

    /// Called once when the test starts.
    ///
    /// # Errors
    ///
    /// An error aborts `start_test`.
    fn start_test(&self) -> EngineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_contains_and_combine() {
        let caps = Capabilities::SOURCE | Capabilities::PAYLOAD;
        assert!(caps.contains(Capabilities::SOURCE));
        assert!(caps.contains(Capabilities::empty()));
        assert!(!caps.contains(Capabilities::MEMORY));
        assert_eq!(caps & Capabilities::PAYLOAD, Capabilities::PAYLOAD);
        assert!(Capabilities::all().contains(caps | Capabilities::NAME | Capabilities::LIFECYCLE));
    }

    #[test]
    fn trigger_ids_are_unique() {
        assert_ne!(TriggerId::new(), TriggerId::new());
    }
}
