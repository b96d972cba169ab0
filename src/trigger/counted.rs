//! Occurrence-counting triggers.
//!
//! A [`CountedTrigger`] wraps another trigger and fires only on selected
//! occurrences of it. Occurrences are counted per source, so "the 3rd fault"
//! means the 3rd fault on each channel independently. Counters live for the
//! whole test and are cleared by `start_test`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::{EngineError, EngineResult};
use crate::event::{Event, SourceId};
use crate::platform::PlatformCaps;

use super::{Capabilities, Trigger};

/// Which occurrences (1-based) of the wrapped trigger fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Occurrence {
    /// Exactly the listed ordinals.
    Nth(BTreeSet<u64>),
    /// Every `n`th occurrence: n, 2n, 3n, ...
    EveryNth(u64),
    /// Every occurrence from `first` through `last` inclusive (open-ended if `None`).
    Range { first: u64, last: Option<u64> },
    /// A deterministic pseudo-random fraction, in percent.
    Percent(u8),
}

impl Occurrence {
    /// Shorthand for a single ordinal.
    #[must_use]
    pub fn nth(n: u64) -> Self {
        Self::Nth(BTreeSet::from([n]))
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Nth(set) if set.is_empty() => Err("no ordinals selected".to_string()),
            Self::Nth(set) if set.contains(&0) => Err("ordinals are 1-based".to_string()),
            Self::EveryNth(0) => Err("period must be at least 1".to_string()),
            Self::Range { first, last } if *first == 0 || last.is_some_and(|l| l < *first) => {
                Err(format!("invalid occurrence range {first}..={last:?}"))
            }
            Self::Percent(p) if *p > 100 => Err(format!("percentage {p} exceeds 100")),
            _ => Ok(()),
        }
    }
}

/// Fires on selected occurrences of an inner trigger.
pub struct CountedTrigger {
    label: String,
    inner: Arc<dyn Trigger>,
    occurrence: Occurrence,
    seed: u64,
    counters: Mutex<HashMap<Option<SourceId>, u64>>,
}

impl CountedTrigger {
    /// Fires `inner` only on the occurrences selected by `occurrence`.
    #[must_use]
    pub fn new(inner: Arc<dyn Trigger>, occurrence: Occurrence) -> Self {
        let label = format!("{}:{occurrence:?}", inner.name());
        Self {
            label,
            inner,
            occurrence,
            seed: 0,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Seed for [`Occurrence::Percent`] decisions.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Occurrences seen so far for `source`.
    #[must_use]
    pub fn count(&self, source: Option<SourceId>) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(&source).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn selects(&self, source: Option<SourceId>, ordinal: u64) -> bool {
        match &self.occurrence {
            Occurrence::Nth(set) => set.contains(&ordinal),
            Occurrence::EveryNth(n) => ordinal % n == 0,
            Occurrence::Range { first, last } => ordinal >= *first && last.map_or(true, |l| ordinal <= l),
            Occurrence::Percent(p) => percent_roll(self.seed, source, ordinal) < u64::from(*p),
        }
    }
}

/// Maps `(seed, source, ordinal)` to a stable value in `0..100`.
fn percent_roll(seed: u64, source: Option<SourceId>, ordinal: u64) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    match source {
        Some(s) => {
            hasher.update(&[1]);
            hasher.update(&s.0.to_le_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
    hasher.update(&ordinal.to_le_bytes());
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(word) % 100
}

impl Trigger for CountedTrigger {
    fn name(&self) -> &str {
        &self.label
    }

    fn is_supported(&self, caps: &PlatformCaps) -> EngineResult<()> {
        self.occurrence
            .validate()
            .map_err(|reason| EngineError::unsupported(self.label.clone(), reason))?;
        self.inner.is_supported(caps)
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn could_match(&self, event: &Event) -> bool {
        self.inner.could_match(event)
    }

    fn do_match(&self, event: &Event) -> bool {
        if !self.inner.do_match(event) {
            return false;
        }
        let source = event.source();
        let ordinal = {
            let Ok(mut counters) = self.counters.lock() else {
                return false;
            };
            let count = counters.entry(source).or_insert(0);
            *count += 1;
            *count
        };
        self.selects(source, ordinal)
    }

    fn start_test(&self) -> EngineResult<()> {
        if let Ok(mut counters) = self.counters.lock() {
            counters.clear();
        }
        self.inner.start_test()
    }
}
