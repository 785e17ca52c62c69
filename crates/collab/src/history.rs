//! Undo/redo history built from inverse patches.
//!
//! Entries are keyed by the id of the intent that created them. The patches
//! stored under an id are whatever currently undoes (or redoes) that edit;
//! they are replaced whenever the edit is re-derived during a rebase.

use crate::ids::IntentId;
use doc_model::Patch;
use std::collections::HashMap;

/// Default maximum number of undo entries.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Linear undo/redo stacks.
#[derive(Debug)]
pub struct History {
    undo_stack: Vec<IntentId>,
    undo_patches: HashMap<IntentId, Vec<Patch>>,
    redo_stack: Vec<IntentId>,
    redo_patches: HashMap<IntentId, Vec<Patch>>,
    max_entries: usize,
}

impl History {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create with a custom depth limit. The oldest entries are evicted.
    pub fn with_limit(max_entries: usize) -> Self {
        Self {
            undo_stack: Vec::new(),
            undo_patches: HashMap::new(),
            redo_stack: Vec::new(),
            redo_patches: HashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Record a new forward edit. Invalidates all redo history.
    pub fn record(&mut self, id: IntentId, inverse: Vec<Patch>) {
        self.redo_stack.clear();
        self.redo_patches.clear();
        self.push_undo(id, inverse);
    }

    /// Push an undo entry without touching the redo stack.
    pub fn push_undo(&mut self, id: IntentId, patches: Vec<Patch>) {
        self.undo_stack.retain(|entry| *entry != id);
        self.undo_stack.push(id);
        self.undo_patches.insert(id, patches);

        while self.undo_stack.len() > self.max_entries {
            let evicted = self.undo_stack.remove(0);
            self.undo_patches.remove(&evicted);
        }
    }

    pub fn push_redo(&mut self, id: IntentId, patches: Vec<Patch>) {
        self.redo_stack.retain(|entry| *entry != id);
        self.redo_stack.push(id);
        self.redo_patches.insert(id, patches);
    }

    /// Pop the most recent undo entry that still has patches.
    pub fn pop_undo(&mut self) -> Option<(IntentId, Vec<Patch>)> {
        while let Some(id) = self.undo_stack.pop() {
            if let Some(patches) = self.undo_patches.remove(&id) {
                return Some((id, patches));
            }
        }
        None
    }

    /// Pop the most recent redo entry that still has patches.
    pub fn pop_redo(&mut self) -> Option<(IntentId, Vec<Patch>)> {
        while let Some(id) = self.redo_stack.pop() {
            if let Some(patches) = self.redo_patches.remove(&id) {
                return Some((id, patches));
            }
        }
        None
    }

    /// Replace the undo patches of an entry that is still on the stack.
    pub fn update_undo(&mut self, id: IntentId, patches: Vec<Patch>) {
        if let Some(slot) = self.undo_patches.get_mut(&id) {
            *slot = patches;
        }
    }

    pub fn update_redo(&mut self, id: IntentId, patches: Vec<Patch>) {
        if let Some(slot) = self.redo_patches.get_mut(&id) {
            *slot = patches;
        }
    }

    pub fn forget_undo(&mut self, id: IntentId) {
        self.undo_stack.retain(|entry| *entry != id);
        self.undo_patches.remove(&id);
    }

    pub fn forget_redo(&mut self, id: IntentId) {
        self.redo_stack.retain(|entry| *entry != id);
        self.redo_patches.remove(&id);
    }

    pub fn undo_patches(&self, id: IntentId) -> Option<&[Patch]> {
        self.undo_patches.get(&id).map(Vec::as_slice)
    }

    pub fn redo_patches(&self, id: IntentId) -> Option<&[Patch]> {
        self.redo_patches.get(&id).map(Vec::as_slice)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patches(color: &str) -> Vec<Patch> {
        vec![Patch::replace(vec!["color".into()], json!(color))]
    }

    #[test]
    fn test_record_and_pop() {
        let mut history = History::new();
        let a = IntentId::new();
        let b = IntentId::new();
        history.record(a, patches("red"));
        history.record(b, patches("green"));

        assert_eq!(history.pop_undo(), Some((b, patches("green"))));
        assert_eq!(history.pop_undo(), Some((a, patches("red"))));
        assert_eq!(history.pop_undo(), None);
        assert!(!history.can_undo());
    }

    #[test]
    fn test_record_clears_redo() {
        let mut history = History::new();
        let a = IntentId::new();
        history.push_redo(a, patches("red"));
        assert!(history.can_redo());

        history.record(IntentId::new(), patches("blue"));
        assert!(!history.can_redo());
        assert_eq!(history.pop_redo(), None);
    }

    #[test]
    fn test_push_undo_keeps_redo() {
        let mut history = History::new();
        let a = IntentId::new();
        history.push_redo(a, patches("red"));
        history.push_undo(IntentId::new(), patches("blue"));
        assert!(history.can_redo());
    }

    #[test]
    fn test_single_entry_per_id() {
        let mut history = History::new();
        let a = IntentId::new();
        history.push_undo(a, patches("red"));
        history.push_undo(a, patches("blue"));
        assert_eq!(history.undo_len(), 1);
        assert_eq!(history.undo_patches(a), Some(patches("blue").as_slice()));
    }

    #[test]
    fn test_update_only_touches_existing_entries() {
        let mut history = History::new();
        let a = IntentId::new();
        history.update_undo(a, patches("red"));
        assert_eq!(history.undo_patches(a), None);

        history.push_undo(a, patches("red"));
        history.update_undo(a, patches("green"));
        assert_eq!(history.undo_patches(a), Some(patches("green").as_slice()));
    }

    #[test]
    fn test_forget() {
        let mut history = History::new();
        let a = IntentId::new();
        let b = IntentId::new();
        history.push_undo(a, patches("red"));
        history.push_undo(b, patches("green"));
        history.forget_undo(b);

        assert_eq!(history.undo_len(), 1);
        assert_eq!(history.pop_undo(), Some((a, patches("red"))));
    }

    #[test]
    fn test_limit_evicts_oldest() {
        let mut history = History::with_limit(2);
        let ids: Vec<IntentId> = (0..3).map(|_| IntentId::new()).collect();
        for id in &ids {
            history.record(*id, patches("red"));
        }
        assert_eq!(history.undo_len(), 2);
        assert_eq!(history.undo_patches(ids[0]), None);
        assert_eq!(history.pop_undo().map(|(id, _)| id), Some(ids[2]));
    }
}
