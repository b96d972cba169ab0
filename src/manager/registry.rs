//! Registries owned by the event manager.
//!
//! [`Registry`] sits behind the dispatch lock: the trigger list in
//! registration order and the action blocks it is bound to. Descriptors live
//! in their own table so actions can look them up while a dispatch is running.

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::{ActionBlock, ActionBlockId};
use crate::descriptor::{Descriptor, DescriptorId};
use crate::error::{EngineResult, RegistrationError};
use crate::trigger::{Trigger, TriggerId};

pub(crate) struct TriggerEntry {
    pub(crate) id: TriggerId,
    pub(crate) trigger: Arc<dyn Trigger>,
    pub(crate) block: ActionBlockId,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) triggers: Vec<TriggerEntry>,
    pub(crate) blocks: HashMap<ActionBlockId, ActionBlock>,
    pub(crate) block_order: Vec<ActionBlockId>,
}

impl Registry {
    /// Stores a block. The caller has already checked its name is unique.
    pub(crate) fn add_block(&mut self, block: ActionBlock) -> ActionBlockId {
        let id = block.id();
        self.block_order.push(id);
        self.blocks.insert(id, block);
        id
    }

    /// Binds `trigger` to `block` at the end of the trigger list.
    ///
    /// Fails if the same trigger object is already registered, the block is
    /// unknown, or one of the block's actions cannot run for this trigger.
    pub(crate) fn admit(&mut self, id: TriggerId, trigger: Arc<dyn Trigger>, block: ActionBlockId) -> EngineResult<()> {
        if let Some(existing) = self.triggers.iter().find(|e| Arc::ptr_eq(&e.trigger, &trigger)) {
            return Err(RegistrationError::DuplicateTrigger {
                id: existing.id.to_string(),
            }
            .into());
        }
        let Some(bound) = self.blocks.get(&block) else {
            return Err(RegistrationError::UnknownActionBlock { id: block.to_string() }.into());
        };
        bound.is_supported(trigger.as_ref())?;
        self.triggers.push(TriggerEntry { id, trigger, block });
        Ok(())
    }

    /// Cleanup hook for every block, in registration order.
    pub(crate) fn end_test(&mut self) {
        for id in &self.block_order {
            if let Some(block) = self.blocks.get_mut(id) {
                block.end_test();
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct DescriptorTable {
    entries: HashMap<DescriptorId, Arc<dyn Descriptor>>,
    names: HashMap<String, DescriptorId>,
}

impl DescriptorTable {
    pub(crate) fn add(&mut self, name: Option<&str>, descriptor: Arc<dyn Descriptor>) -> EngineResult<DescriptorId> {
        if let Some(name) = name {
            if self.names.contains_key(name) {
                return Err(RegistrationError::DuplicateDescriptor { name: name.to_string() }.into());
            }
        }
        let id = DescriptorId::new();
        if let Some(name) = name {
            self.names.insert(name.to_string(), id);
        }
        self.entries.insert(id, descriptor);
        Ok(id)
    }

    pub(crate) fn by_name(&self, name: &str) -> Option<Arc<dyn Descriptor>> {
        self.names.get(name).and_then(|id| self.entries.get(id)).cloned()
    }

    pub(crate) fn by_id(&self, id: DescriptorId) -> Option<Arc<dyn Descriptor>> {
        self.entries.get(&id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
