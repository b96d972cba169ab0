//! In-process platform backends.
//!
//! These implementations keep all state in memory and deliver notifications
//! through crossbeam channels. They are intended for embedded usage, tests,
//! and as a reference for real collaborator bindings.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};

use super::{
    CompanionChannel, CompanionMessage, DeviceId, ErrorLogEntry, ErrorLogSource, MemRange, MemoryBus,
    PlatformError, ResourceHandle, ResourceService, SurfaceBus,
};

/// Pending notifications kept per resource key before the waiter catches up.
const RESOURCE_SIGNAL_CAPACITY: usize = 64;

fn poisoned(what: &str) -> PlatformError {
    PlatformError::Subscription {
        source_name: what.to_string(),
        reason: "poisoned lock".to_string(),
    }
}

/// Word-addressed memory. Unwritten words read as zero.
#[derive(Debug, Default)]
pub struct LoopbackMemory {
    words: RwLock<HashMap<u64, u64>>,
}

impl LoopbackMemory {
    /// Stores `value` at `address`.
    pub fn write_word(&self, address: u64, value: u64) {
        if let Ok(mut words) = self.words.write() {
            words.insert(address, value);
        }
    }
}

impl MemoryBus for LoopbackMemory {
    fn read_word(&self, address: u64) -> Result<u64, PlatformError> {
        let words = self.words.read().map_err(|_| PlatformError::BusRead {
            address,
            reason: "poisoned lock".to_string(),
        })?;
        Ok(words.get(&address).copied().unwrap_or(0))
    }
}

/// Byte-addressed surface memory. Unwritten bytes read as zero.
#[derive(Debug, Default)]
pub struct LoopbackSurface {
    bytes: RwLock<HashMap<u64, u8>>,
}

impl LoopbackSurface {
    /// Copies `data` to consecutive addresses starting at `base`.
    pub fn write(&self, base: u64, data: &[u8]) {
        if let Ok(mut bytes) = self.bytes.write() {
            for (offset, b) in (0u64..).zip(data.iter()) {
                bytes.insert(base.wrapping_add(offset), *b);
            }
        }
    }
}

impl SurfaceBus for LoopbackSurface {
    fn read_range(&self, range: &MemRange) -> Result<Vec<u8>, PlatformError> {
        let bytes = self.bytes.read().map_err(|_| PlatformError::BusRead {
            address: range.base,
            reason: "poisoned lock".to_string(),
        })?;
        Ok((range.base..range.end())
            .map(|a| bytes.get(&a).copied().unwrap_or(0))
            .collect())
    }
}

/// Privileged-service stand-in: `signal` wakes whoever registered the key.
#[derive(Debug, Default)]
pub struct LoopbackResources {
    waiters: Mutex<HashMap<(ResourceHandle, u32), Sender<()>>>,
}

impl LoopbackResources {
    /// Signals the OS event for `(parent, index)`. Returns false if nobody is registered.
    pub fn signal(&self, parent: ResourceHandle, index: u32) -> bool {
        let Ok(waiters) = self.waiters.lock() else {
            return false;
        };
        match waiters.get(&(parent, index)) {
            Some(tx) => match tx.try_send(()) {
                Ok(()) | Err(TrySendError::Full(())) => true,
                Err(TrySendError::Disconnected(())) => false,
            },
            None => false,
        }
    }

    /// Returns true if `(parent, index)` is currently registered.
    pub fn is_registered(&self, parent: ResourceHandle, index: u32) -> bool {
        self.waiters
            .lock()
            .map(|w| w.contains_key(&(parent, index)))
            .unwrap_or(false)
    }
}

impl ResourceService for LoopbackResources {
    fn register(&self, parent: ResourceHandle, index: u32) -> Result<Receiver<()>, PlatformError> {
        let mut waiters = self.waiters.lock().map_err(|_| poisoned("resource"))?;
        let (tx, rx) = bounded(RESOURCE_SIGNAL_CAPACITY);
        waiters.insert((parent, index), tx);
        Ok(rx)
    }

    fn unregister(&self, parent: ResourceHandle, index: u32) -> Result<(), PlatformError> {
        let mut waiters = self.waiters.lock().map_err(|_| poisoned("resource"))?;
        waiters.remove(&(parent, index));
        Ok(())
    }
}

/// Companion-processor queue for one device.
#[derive(Debug)]
pub struct LoopbackCompanion {
    device: DeviceId,
    tx: Mutex<Option<Sender<CompanionMessage>>>,
}

impl LoopbackCompanion {
    /// A closed queue for `device`.
    #[must_use]
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            tx: Mutex::new(None),
        }
    }

    /// Posts a message. Returns false if the queue is not open.
    pub fn post(&self, message: CompanionMessage) -> bool {
        let Ok(tx) = self.tx.lock() else {
            return false;
        };
        tx.as_ref().is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Returns true while the engine holds the queue open.
    pub fn is_open(&self) -> bool {
        self.tx.lock().map(|tx| tx.is_some()).unwrap_or(false)
    }
}

impl CompanionChannel for LoopbackCompanion {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn open(&self) -> Result<Receiver<CompanionMessage>, PlatformError> {
        let mut slot = self.tx.lock().map_err(|_| poisoned("companion"))?;
        let (tx, rx) = unbounded();
        *slot = Some(tx);
        Ok(rx)
    }

    fn close(&self) -> Result<(), PlatformError> {
        let mut slot = self.tx.lock().map_err(|_| poisoned("companion"))?;
        *slot = None;
        Ok(())
    }
}

/// Error-log stand-in.
#[derive(Debug, Default)]
pub struct LoopbackErrorLog {
    tx: Mutex<Option<Sender<ErrorLogEntry>>>,
}

impl LoopbackErrorLog {
    /// Appends an entry. Returns false if nobody is subscribed.
    pub fn log(&self, code: u32, message: impl Into<String>) -> bool {
        let Ok(tx) = self.tx.lock() else {
            return false;
        };
        let entry = ErrorLogEntry {
            code,
            message: message.into(),
        };
        tx.as_ref().is_some_and(|tx| tx.send(entry).is_ok())
    }

    /// Returns true while a subscriber is attached.
    pub fn is_subscribed(&self) -> bool {
        self.tx.lock().map(|tx| tx.is_some()).unwrap_or(false)
    }
}

impl ErrorLogSource for LoopbackErrorLog {
    fn subscribe(&self) -> Result<Receiver<ErrorLogEntry>, PlatformError> {
        let mut slot = self.tx.lock().map_err(|_| poisoned("error_log"))?;
        let (tx, rx) = unbounded();
        *slot = Some(tx);
        Ok(rx)
    }

    fn unsubscribe(&self) -> Result<(), PlatformError> {
        let mut slot = self.tx.lock().map_err(|_| poisoned("error_log"))?;
        *slot = None;
        Ok(())
    }
}
