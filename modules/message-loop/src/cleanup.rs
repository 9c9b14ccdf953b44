//! Deferred compaction of tombstoned hook lists.

use std::collections::HashSet;

use crate::handler::HandlerId;
use crate::registry::HookRegistry;

/// Hook lists holding tombstones that have not been reclaimed yet.
#[derive(Default)]
pub(crate) struct DirtySet {
    ids: HashSet<HandlerId>,
}

impl DirtySet {
    /// Record a list as dirty. Returns `true` when the set was empty before,
    /// which is the caller's cue to schedule a cleanup pass.
    pub fn mark(&mut self, id: HandlerId) -> bool {
        let was_empty = self.ids.is_empty();
        self.ids.insert(id);
        was_empty
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Compact every dirty list once and empty the set.
    pub fn sweep(&mut self, registry: &mut HookRegistry) -> CleanupReport {
        let mut report = CleanupReport::default();
        for id in self.ids.drain() {
            report.lists += 1;
            report.reclaimed += registry.compact(id);
        }
        report
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CleanupReport {
    pub lists: usize,
    pub reclaimed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerRef;
    use crate::hook::HookRef;
    use crate::message::Message;
    use anyhow::Result;
    use std::rc::Rc;

    #[test]
    fn mark_reports_empty_to_dirty_edge_once() {
        let h: HandlerRef = Rc::new(|_: &dyn Message| -> Result<()> { Ok(()) });
        let g: HandlerRef = Rc::new(|_: &dyn Message| -> Result<()> { Ok(()) });
        let mut dirty = DirtySet::default();
        assert!(dirty.mark(HandlerId::of(&h)));
        assert!(!dirty.mark(HandlerId::of(&h)));
        assert!(!dirty.mark(HandlerId::of(&g)));
        assert_eq!(dirty.len(), 2);
    }

    #[test]
    fn sweep_compacts_and_empties() {
        let h: HandlerRef = Rc::new(|_: &dyn Message| -> Result<()> { Ok(()) });
        let id = HandlerId::of(&h);
        let hook: HookRef = Rc::new(|_: &HandlerRef, _: &dyn Message| -> Result<bool> { Ok(true) });

        let mut registry = HookRegistry::default();
        registry.install(id, hook.clone());
        registry.remove(id, &hook);

        let mut dirty = DirtySet::default();
        dirty.mark(id);
        let report = dirty.sweep(&mut registry);

        assert_eq!(report, CleanupReport { lists: 1, reclaimed: 1 });
        assert_eq!(dirty.len(), 0);
        assert_eq!(registry.handler_count(), 0);
    }
}
