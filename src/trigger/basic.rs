//! Event and lifecycle triggers.

use std::fmt;
use std::sync::Arc;

use crate::descriptor::Descriptor;
use crate::error::{EngineError, EngineResult};
use crate::event::{Event, EventKind};
use crate::platform::PlatformCaps;

use super::{Capabilities, Trigger};

/// Unconditional pass-through trigger for the start or end of a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleTrigger {
    kind: EventKind,
    name: String,
}

impl LifecycleTrigger {
    /// Fires once when the test starts.
    #[must_use]
    pub fn on_test_start() -> Self {
        Self {
            kind: EventKind::TestStarted,
            name: "on_test_start".to_string(),
        }
    }

    /// Fires once when the test ends.
    #[must_use]
    pub fn on_test_end() -> Self {
        Self {
            kind: EventKind::TestEnded,
            name: "on_test_end".to_string(),
        }
    }
}

impl Trigger for LifecycleTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_supported(&self, _caps: &PlatformCaps) -> EngineResult<()> {
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LIFECYCLE
    }

    fn could_match(&self, event: &Event) -> bool {
        event.kind() == self.kind
    }

    fn do_match(&self, event: &Event) -> bool {
        self.could_match(event)
    }
}

/// Fires on every occurrence of one event kind, optionally narrowed by event
/// name, code, and a descriptor.
///
/// Name and code are checked in `could_match`; the descriptor, which may be
/// arbitrarily expensive, only in `do_match`.
#[derive(Clone)]
pub struct EventTrigger {
    label: String,
    kind: EventKind,
    event_name: Option<String>,
    code: Option<u32>,
    descriptor: Option<Arc<dyn Descriptor>>,
}

impl fmt::Debug for EventTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTrigger")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("event_name", &self.event_name)
            .field("code", &self.code)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl EventTrigger {
    /// Matches every event of `kind`.
    #[must_use]
    pub fn on(kind: EventKind) -> Self {
        Self {
            label: format!("on_{kind}"),
            kind,
            event_name: None,
            code: None,
            descriptor: None,
        }
    }

    /// Matches named events called `name`.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: format!("on_named:{name}"),
            kind: EventKind::Named,
            event_name: Some(name),
            code: None,
            descriptor: None,
        }
    }

    /// Narrows the trigger to events carrying `code`.
    #[must_use]
    pub fn with_code(mut self, code: u32) -> Self {
        self.code = Some(code);
        self
    }

    /// Narrows the trigger to events the descriptor accepts.
    #[must_use]
    pub fn with_descriptor(mut self, descriptor: Arc<dyn Descriptor>) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    /// Overrides the name reported in logs.
    #[must_use]
    pub fn labelled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl Trigger for EventTrigger {
    fn name(&self) -> &str {
        &self.label
    }

    fn is_supported(&self, caps: &PlatformCaps) -> EngineResult<()> {
        let missing = match self.kind {
            EventKind::Companion if caps.companion_devices == 0 => Some("companion processor"),
            EventKind::Resource if !caps.resources => Some("privileged service"),
            EventKind::MemoryChanged if !caps.memory => Some("memory bus"),
            EventKind::SurfaceMatched if !caps.surfaces => Some("surface bus"),
            EventKind::ErrorLogged if !caps.error_log => Some("error log"),
            _ => None,
        };
        match missing {
            Some(what) => Err(EngineError::unsupported(
                self.label.clone(),
                format!("platform has no {what}"),
            )),
            None => Ok(()),
        }
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = match self.kind {
            EventKind::TestStarted | EventKind::TestEnded => Capabilities::LIFECYCLE,
            EventKind::Named => Capabilities::NAME,
            EventKind::Resource => Capabilities::SOURCE,
            EventKind::Companion => Capabilities::SOURCE | Capabilities::PAYLOAD,
            EventKind::MemoryChanged => Capabilities::MEMORY,
            EventKind::SurfaceMatched => Capabilities::MEMORY | Capabilities::PAYLOAD,
            EventKind::ErrorLogged => Capabilities::PAYLOAD,
            EventKind::TimerElapsed | EventKind::Fault | EventKind::Interrupt => Capabilities::empty(),
        };
        if self.descriptor.is_some() && matches!(self.kind, EventKind::Named | EventKind::Fault | EventKind::Interrupt) {
            // Descriptor-scoped matches only accept events that name a source.
            caps = caps | Capabilities::SOURCE;
        }
        caps
    }

    fn could_match(&self, event: &Event) -> bool {
        if event.kind() != self.kind {
            return false;
        }
        if let Some(name) = &self.event_name {
            if event.name() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(code) = self.code {
            if event.code() != Some(code) {
                return false;
            }
        }
        true
    }

    fn do_match(&self, event: &Event) -> bool {
        self.could_match(event) && self.descriptor.as_ref().map_or(true, |d| d.matches(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::SourceDescriptor;
    use crate::event::SourceId;

    #[test]
    fn lifecycle_triggers_match_their_phase_only() {
        let start = LifecycleTrigger::on_test_start();
        assert!(start.do_match(&Event::test_started()));
        assert!(!start.could_match(&Event::test_ended()));
        assert!(LifecycleTrigger::on_test_end().do_match(&Event::test_ended()));
    }

    #[test]
    fn named_trigger_filters_on_name_in_prefilter() {
        let t = EventTrigger::named("X");
        assert!(t.could_match(&Event::named("X")));
        assert!(!t.could_match(&Event::named("Y")));
        assert!(!t.could_match(&Event::test_started()));
    }

    #[test]
    fn descriptor_is_checked_only_in_do_match() {
        let t = EventTrigger::on(EventKind::Fault)
            .with_descriptor(Arc::new(SourceDescriptor::new([SourceId(9)])));
        let other = Event::fault(Some(SourceId(1)), 3, None);
        assert!(t.could_match(&other));
        assert!(!t.do_match(&other));
        assert!(t.do_match(&Event::fault(Some(SourceId(9)), 3, None)));
        assert!(t.capabilities().contains(Capabilities::SOURCE));
    }

    #[test]
    fn code_filter_applies() {
        let t = EventTrigger::on(EventKind::Interrupt).with_code(0x20);
        assert!(t.do_match(&Event::interrupt(None, 0x20)));
        assert!(!t.could_match(&Event::interrupt(None, 0x21)));
    }

    #[test]
    fn unsupported_without_collaborator() {
        let t = EventTrigger::on(EventKind::Companion);
        assert!(t.is_supported(&PlatformCaps::default()).unwrap_err().is_registration());
        t.is_supported(&PlatformCaps::full()).unwrap();
        EventTrigger::named("x").is_supported(&PlatformCaps::default()).unwrap();
    }
}
