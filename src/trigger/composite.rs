//! Triggers built from other triggers.

use std::sync::{Arc, RwLock};

use crate::error::{EngineError, EngineResult};
use crate::event::Event;
use crate::platform::PlatformCaps;

use super::{Capabilities, Trigger};

/// Logical OR over several triggers sharing one registration.
///
/// Members that are unsupported on the current platform are dropped when
/// `is_supported` runs; the composite itself is unsupported only if no member
/// survives. `do_match` evaluates every live member, so each keeps its own
/// counters in step, and reports a single match however many members agree.
pub struct AnyOf {
    label: String,
    members: Vec<Arc<dyn Trigger>>,
    live: RwLock<Vec<bool>>,
}

impl AnyOf {
    /// Matches when any of `members` matches.
    #[must_use]
    pub fn new(label: impl Into<String>, members: Vec<Arc<dyn Trigger>>) -> Self {
        let live = RwLock::new(vec![true; members.len()]);
        Self {
            label: label.into(),
            members,
            live,
        }
    }

    /// Number of members still considered after the support check.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
            .read()
            .map(|l| l.iter().filter(|x| **x).count())
            .unwrap_or(0)
    }

    fn live_members(&self) -> Vec<&Arc<dyn Trigger>> {
        let Ok(live) = self.live.read() else {
            return Vec::new();
        };
        self.members
            .iter()
            .zip(live.iter())
            .filter_map(|(m, l)| l.then_some(m))
            .collect()
    }
}

impl Trigger for AnyOf {
    fn name(&self) -> &str {
        &self.label
    }

    fn is_supported(&self, caps: &PlatformCaps) -> EngineResult<()> {
        let support: Vec<bool> = self.members.iter().map(|m| m.is_supported(caps).is_ok()).collect();
        if !support.iter().any(|s| *s) {
            return Err(EngineError::unsupported(
                self.label.clone(),
                format!("none of {} member triggers apply to this platform", self.members.len()),
            ));
        }
        let mut live = self
            .live
            .write()
            .map_err(|_| EngineError::internal("poisoned lock: any_of.live"))?;
        *live = support;
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        // Only what every live member guarantees.
        self.live_members()
            .iter()
            .map(|m| m.capabilities())
            .reduce(|a, b| a & b)
            .unwrap_or_default()
    }

    fn could_match(&self, event: &Event) -> bool {
        self.live_members().iter().any(|m| m.could_match(event))
    }

    fn do_match(&self, event: &Event) -> bool {
        let mut matched = false;
        for m in self.live_members() {
            if m.could_match(event) && m.do_match(event) {
                matched = true;
            }
        }
        matched
    }

    fn start_test(&self) -> EngineResult<()> {
        for m in self.live_members() {
            m.start_test()?;
        }
        Ok(())
    }
}
