//! External collaborator contracts.
//!
//! The engine never touches hardware or privileged services directly. Every
//! asynchronous source a subtask watches is reached through one of the traits
//! below, bundled in a [`Platform`]. Wait primitives are crossbeam receivers:
//! a collaborator signals by sending, and a subtask parks on `recv`.
//!
//! [`loopback`] provides in-process implementations for embedded use and tests.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// In-process collaborator backends.
pub mod loopback;

/// Errors reported by platform collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The collaborator is not present on this platform.
    #[error("{what} is not available on this platform")]
    Unavailable { what: String },

    /// A memory or surface read failed.
    #[error("Bus read at {address:#x} failed: {reason}")]
    BusRead { address: u64, reason: String },

    /// Subscribing to or unsubscribing from a notification source failed.
    #[error("Subscription to {source_name} failed: {reason}")]
    Subscription { source_name: String, reason: String },
}

/// Handle of a parent object a privileged-service notification is keyed on.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceHandle(pub u32);

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Index of a managed device (one companion processor per device).
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// A contiguous range of device-visible memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemRange {
    /// First byte address.
    pub base: u64,
    /// Length in bytes.
    pub len: u64,
}

impl MemRange {
    /// The `len` bytes starting at `base`.
    #[must_use]
    pub const fn new(base: u64, len: u64) -> Self {
        Self { base, len }
    }

    /// Exclusive end address, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.len)
    }

    /// Returns true if `address` falls within `[base, end)`.
    #[must_use]
    pub const fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }
}

impl fmt::Display for MemRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.base, self.end())
    }
}

/// A message delivered by a companion processor.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionMessage {
    pub code: u32,
    pub payload: Vec<u8>,
}

/// One entry of the platform error log.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub code: u32,
    pub message: String,
}

/// Word-granular memory reads for the memory-watch subtask.
pub trait MemoryBus: Send + Sync {
    /// Reads the live word at `address`.
    fn read_word(&self, address: u64) -> Result<u64, PlatformError>;
}

/// Range reads for the surface-watch subtask.
pub trait SurfaceBus: Send + Sync {
    /// Reads `range.len` bytes starting at `range.base`.
    fn read_range(&self, range: &MemRange) -> Result<Vec<u8>, PlatformError>;
}

/// Privileged-service notifications keyed by `(parent, index)`.
pub trait ResourceService: Send + Sync {
    /// Registers interest and returns the wait primitive signalled on each notification.
    fn register(&self, parent: ResourceHandle, index: u32) -> Result<Receiver<()>, PlatformError>;

    /// Withdraws interest. The receiver returned by `register` disconnects.
    fn unregister(&self, parent: ResourceHandle, index: u32) -> Result<(), PlatformError>;
}

/// Message queue fed by one device's companion processor.
pub trait CompanionChannel: Send + Sync {
    /// The device this channel belongs to.
    fn device(&self) -> DeviceId;

    /// Opens the queue.
    fn open(&self) -> Result<Receiver<CompanionMessage>, PlatformError>;

    /// Closes the queue. The receiver returned by `open` disconnects.
    fn close(&self) -> Result<(), PlatformError>;
}

/// Platform error-log event source.
pub trait ErrorLogSource: Send + Sync {
    /// Subscribes to new error-log entries.
    fn subscribe(&self) -> Result<Receiver<ErrorLogEntry>, PlatformError>;

    /// Cancels the subscription.
    fn unsubscribe(&self) -> Result<(), PlatformError>;
}

/// The set of collaborators available to one engine instance.
///
/// Absent collaborators make the corresponding hooks and triggers unsupported.
#[derive(Clone, Default)]
pub struct Platform {
    memory: Option<Arc<dyn MemoryBus>>,
    surfaces: Option<Arc<dyn SurfaceBus>>,
    resources: Option<Arc<dyn ResourceService>>,
    companions: Vec<Arc<dyn CompanionChannel>>,
    error_log: Option<Arc<dyn ErrorLogSource>>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("caps", &self.caps())
            .finish()
    }
}

impl Platform {
    /// A platform with no collaborators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the memory bus polled by memory-watch hooks.
    #[must_use]
    pub fn with_memory(mut self, memory: Arc<dyn MemoryBus>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Adds the surface bus polled by surface hooks.
    #[must_use]
    pub fn with_surfaces(mut self, surfaces: Arc<dyn SurfaceBus>) -> Self {
        self.surfaces = Some(surfaces);
        self
    }

    /// Adds the privileged resource-notification service.
    #[must_use]
    pub fn with_resources(mut self, resources: Arc<dyn ResourceService>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Adds one device's companion channel.
    #[must_use]
    pub fn with_companion(mut self, channel: Arc<dyn CompanionChannel>) -> Self {
        self.companions.push(channel);
        self
    }

    /// Adds the platform error log.
    #[must_use]
    pub fn with_error_log(mut self, error_log: Arc<dyn ErrorLogSource>) -> Self {
        self.error_log = Some(error_log);
        self
    }

    pub(crate) fn memory(&self) -> Option<&Arc<dyn MemoryBus>> {
        self.memory.as_ref()
    }

    pub(crate) fn surfaces(&self) -> Option<&Arc<dyn SurfaceBus>> {
        self.surfaces.as_ref()
    }

    pub(crate) fn resources(&self) -> Option<&Arc<dyn ResourceService>> {
        self.resources.as_ref()
    }

    pub(crate) fn companions(&self) -> &[Arc<dyn CompanionChannel>] {
        &self.companions
    }

    pub(crate) fn error_log(&self) -> Option<&Arc<dyn ErrorLogSource>> {
        self.error_log.as_ref()
    }

    /// Summarizes what this platform provides, for `is_supported` checks.
    #[must_use]
    pub fn caps(&self) -> PlatformCaps {
        PlatformCaps {
            memory: self.memory.is_some(),
            surfaces: self.surfaces.is_some(),
            resources: self.resources.is_some(),
            companion_devices: self.companions.len(),
            error_log: self.error_log.is_some(),
        }
    }
}

/// Static configuration consulted by `is_supported` checks.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformCaps {
    pub memory: bool,
    pub surfaces: bool,
    pub resources: bool,
    pub companion_devices: usize,
    pub error_log: bool,
}

impl PlatformCaps {
    /// Every collaborator present, one companion device.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            memory: true,
            surfaces: true,
            resources: true,
            companion_devices: 1,
            error_log: true,
        }
    }
}
