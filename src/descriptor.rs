//! Descriptor predicates consulted by triggers.
//!
//! A descriptor names a set of objects (channels, devices, event names) and
//! answers whether an event concerns one of them. Descriptors are registered
//! with the event manager, optionally under a unique name, and shared by the
//! triggers that reference them.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::event::{Event, SourceId};

/// Unique identifier for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DescriptorId(Uuid);

impl DescriptorId {
    /// Create a new random descriptor id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DescriptorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DescriptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Predicate over events.
pub trait Descriptor: Send + Sync + fmt::Debug {
    /// Returns true if the event concerns an object this descriptor names.
    fn matches(&self, event: &Event) -> bool;
}

/// Matches events originating from any of a fixed set of sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDescriptor {
    sources: BTreeSet<SourceId>,
}

impl SourceDescriptor {
    /// Accepts events from any of `sources`.
    #[must_use]
    pub fn new(sources: impl IntoIterator<Item = SourceId>) -> Self {
        Self {
            sources: sources.into_iter().collect(),
        }
    }
}

impl Descriptor for SourceDescriptor {
    fn matches(&self, event: &Event) -> bool {
        event.source().is_some_and(|s| self.sources.contains(&s))
    }
}

/// Matches named events whose name satisfies a regular expression.
#[derive(Debug, Clone)]
pub struct NameDescriptor {
    pattern: Regex,
}

impl NameDescriptor {
    /// Compiles `pattern`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if the pattern does not compile.
    pub fn new(pattern: &str) -> EngineResult<Self> {
        let pattern = Regex::new(pattern).map_err(|e| EngineError::Config {
            message: format!("invalid name pattern '{pattern}': {e}"),
        })?;
        Ok(Self { pattern })
    }

    /// Matches exactly one name.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the name is escaped before compiling.
    pub fn exact(name: &str) -> EngineResult<Self> {
        Self::new(&format!("^{}$", regex::escape(name)))
    }
}

impl Descriptor for NameDescriptor {
    fn matches(&self, event: &Event) -> bool {
        event.name().is_some_and(|n| self.pattern.is_match(n))
    }
}
