//! # eventrig - trigger/action event dispatch for verification harnesses
//!
//! A test registers *triggers* (predicates over events) bound to *action
//! blocks* (small programs of actions with conditional jumps). Events come in
//! from the test itself and from background *subtasks* that watch memory
//! words, surface ranges, timers, privileged-service notifications, companion
//! processors and the platform error log. Every matching trigger runs its
//! block synchronously, in registration order.
//!
//! ## Core Concepts
//!
//! - **Event**: a kind, an optional source and an optional payload
//! - **Trigger**: two-stage matching, a cheap `could_match` then `do_match`
//! - **Action block**: a program counter over actions, with branches and named mutexes
//! - **Subtask**: a worker thread that turns one asynchronous source into events or callbacks
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use eventrig::{BlockBuilder, EngineConfig, EventManager, EventTrigger, LogAction, Platform};
//!
//! let mgr = EventManager::new(EngineConfig::default(), Platform::new())?;
//! let block = mgr.add_action_block(BlockBuilder::named("greet").then(LogAction::new("hello")).build())?;
//! mgr.add_trigger(Arc::new(EventTrigger::named("boot")), block)?;
//! mgr.start_test()?;
//! mgr.handle_event(&eventrig::Event::named("boot"))?;
//! mgr.end_test()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod platform;

// Matching and execution
pub mod action;
pub mod trigger;

// Engine
pub mod manager;
pub mod subtask;

pub use action::{
    Action, ActionBlock, ActionBlockId, ActionContext, BlockBuilder, BranchAction, BranchDecision, FnAction, LogAction,
    NamedMutex, NextAction,
};
pub use config::EngineConfig;
pub use descriptor::{Descriptor, DescriptorId, NameDescriptor, SourceDescriptor};
pub use error::{EngineError, EngineResult, ExecutionError, RegistrationError, SubtaskError};
pub use event::{Event, EventId, EventKind, EventPayload, SourceId};
pub use manager::{EventManager, TestStatus};
pub use platform::{Platform, PlatformCaps, PlatformError};
pub use subtask::{
    ErrorLogCallback, MemoryCallback, ResourceCallback, SubtaskKind, SurfaceCallback, SurfaceRegion, TimerCallback,
};
pub use trigger::{AnyOf, Capabilities, CountedTrigger, EventTrigger, LifecycleTrigger, Trigger, TriggerId};
