//! Companion-processor subtask: turns queued device messages into events.

use std::sync::{Arc, Weak};

use crossbeam_channel::select;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EngineResult, ExecutionError};
use crate::event::Event;
use crate::platform::{CompanionChannel, DeviceId};

use super::{EventSink, Subtask, SubtaskKind, Worker};

/// Drains one device's companion-processor queue into the dispatcher.
///
/// Created by `start_test`, one per channel. Each wake drains every pending
/// message and dispatches one `Companion` event per message, in queue order.
pub struct CompanionSubtask {
    device: DeviceId,
    channel: Arc<dyn CompanionChannel>,
    worker: Worker,
}

impl CompanionSubtask {
    pub(crate) fn new(channel: Arc<dyn CompanionChannel>, sink: Weak<dyn EventSink>, config: &EngineConfig) -> Self {
        let device = channel.device();
        Self {
            device,
            channel,
            worker: Worker::new(format!("companion:{device}"), sink, config.wake_queue_capacity),
        }
    }

    /// The device whose queue this subtask drains.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }
}

impl Subtask for CompanionSubtask {
    fn kind(&self) -> SubtaskKind {
        SubtaskKind::Companion
    }

    fn label(&self) -> String {
        self.worker.label().to_string()
    }

    fn start(&self) -> EngineResult<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        let queue = self.channel.open()?;
        let device = self.device;
        let sink = self.worker.sink();
        let label = self.label();
        info!(subtask = %label, "starting companion subtask");
        self.worker.start(move |signals| loop {
            select! {
                recv(queue) -> first => {
                    let Ok(first) = first else {
                        if signals.should_stop() {
                            return Ok(());
                        }
                        return Err(ExecutionError::Disconnected { path: label.clone() }.into());
                    };
                    let mut batch = vec![first];
                    batch.extend(queue.try_iter());
                    debug!(subtask = %label, messages = batch.len(), "companion batch");
                    let Some(sink) = sink.upgrade() else {
                        return Ok(());
                    };
                    for message in batch {
                        sink.handle_event(&Event::companion(device, message))?;
                    }
                }
                recv(signals.wake_rx()) -> _ => {
                    if signals.should_stop() {
                        return Ok(());
                    }
                }
            }
        })
    }

    fn stop(&self) -> EngineResult<()> {
        let stopped = self.worker.stop();
        let closed = self.channel.close().map_err(Into::into);
        stopped.and(closed)
    }

    fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    fn hook_count(&self) -> usize {
        0
    }
}
