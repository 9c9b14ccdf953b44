//! Per-handler hook lists.
//!
//! Slots are index-stable: removal writes a tombstone instead of shifting the
//! list, so a `send` walking the list by index is never disturbed by a hook
//! removing itself (or a neighbour) mid-chain. Tombstones are reclaimed by
//! [`HookRegistry::compact`], which only ever runs from the deferred cleanup
//! task.

use std::collections::HashMap;

use crate::handler::HandlerId;
use crate::hook::{same_hook, HookRef};

#[derive(Default)]
pub(crate) struct HookRegistry {
    lists: HashMap<HandlerId, Vec<Option<HookRef>>>,
}

impl HookRegistry {
    /// Append `hook` unless it is already live in the handler's list.
    /// Returns `true` when the hook was added.
    pub fn install(&mut self, id: HandlerId, hook: HookRef) -> bool {
        let list = self.lists.entry(id).or_default();
        if list.iter().flatten().any(|h| same_hook(h, &hook)) {
            return false;
        }
        list.push(Some(hook));
        true
    }

    /// Tombstone `hook`. Returns `true` when a slot was tombstoned.
    pub fn remove(&mut self, id: HandlerId, hook: &HookRef) -> bool {
        let Some(list) = self.lists.get_mut(&id) else {
            return false;
        };
        match list
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|h| same_hook(h, hook)))
        {
            Some(slot) => {
                *slot = None;
                true
            }
            None => false,
        }
    }

    /// Tombstone every slot of the handler's list. Returns how many live
    /// hooks were tombstoned.
    pub fn clear(&mut self, id: HandlerId) -> usize {
        let Some(list) = self.lists.get_mut(&id) else {
            return 0;
        };
        list.iter_mut().filter_map(Option::take).count()
    }

    /// Physical slot count, tombstones included. Fixed for the duration of a
    /// `send` because compaction never runs inside one.
    pub fn len_of(&self, id: HandlerId) -> usize {
        self.lists.get(&id).map_or(0, Vec::len)
    }

    /// The live hook at `index`, if any.
    pub fn hook_at(&self, id: HandlerId, index: usize) -> Option<HookRef> {
        self.lists.get(&id)?.get(index)?.clone()
    }

    pub fn live_count(&self, id: HandlerId) -> usize {
        self.lists
            .get(&id)
            .map_or(0, |list| list.iter().flatten().count())
    }

    /// Drop the tombstones from one handler's list, pruning the list when
    /// nothing live remains. Returns the number of slots reclaimed.
    pub fn compact(&mut self, id: HandlerId) -> usize {
        let Some(list) = self.lists.get_mut(&id) else {
            return 0;
        };
        let before = list.len();
        list.retain(Option::is_some);
        let reclaimed = before - list.len();
        if list.is_empty() {
            self.lists.remove(&id);
        }
        reclaimed
    }

    /// Number of handlers with a list, empty or not.
    pub fn handler_count(&self) -> usize {
        self.lists.len()
    }
}
