//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Tunables for one engine instance.
///
/// Every field has a default, so a partial JSON document is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identifier of the running test, consulted by on-test-id branches.
    pub test_id: Option<u32>,
    /// Pause between full scan passes of the memory and surface watches.
    /// Zero yields the thread without sleeping.
    pub poll_interval_us: u64,
    /// Upper bound on a single timer sleep so `stop` stays responsive.
    pub timer_max_sleep_ms: u64,
    /// Capacity of each poll-style subtask's wake channel.
    pub wake_queue_capacity: usize,
    /// How long a blocking mutex acquisition inside an action block may wait.
    pub mutex_wait_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            test_id: None,
            poll_interval_us: 200,
            timer_max_sleep_ms: 50,
            wake_queue_capacity: 16,
            mutex_wait_ms: 1000,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document and validates it.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if the document is malformed or a value
    /// is out of range.
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let cfg: Self = serde_json::from_str(json).map_err(|e| EngineError::Config {
            message: format!("invalid engine config: {e}"),
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values the subtasks cannot work with.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` naming the offending field.
    pub fn validate(&self) -> EngineResult<()> {
        if self.wake_queue_capacity == 0 {
            return Err(EngineError::Config {
                message: "wake_queue_capacity must be at least 1".to_string(),
            });
        }
        if self.timer_max_sleep_ms == 0 {
            return Err(EngineError::Config {
                message: "timer_max_sleep_ms must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Sets the id used by `on_test_id` branches.
    #[must_use]
    pub fn with_test_id(mut self, test_id: u32) -> Self {
        self.test_id = Some(test_id);
        self
    }

    pub(crate) const fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub(crate) const fn timer_max_sleep(&self) -> Duration {
        Duration::from_millis(self.timer_max_sleep_ms)
    }

    pub(crate) const fn mutex_wait(&self) -> Duration {
        Duration::from_millis(self.mutex_wait_ms)
    }
}
