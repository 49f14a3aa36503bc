use crate::reconcile::{reconcile, ArrayChange};
use crate::Handle;

/// To-many state: canonical server order and the visible many-array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManyState {
    /// Canonical members in server order
    pub(crate) canonical_state: Vec<Handle>,
    /// The visible, ordered many-array
    pub(crate) current: Vec<Handle>,
    /// Last change applied to `current`
    pub(crate) last_change: Option<ArrayChange>,
}

impl ManyState {
    pub fn canonical_state(&self) -> &[Handle] {
        &self.canonical_state
    }

    pub fn current(&self) -> &[Handle] {
        &self.current
    }

    pub fn last_change(&self) -> Option<ArrayChange> {
        self.last_change
    }

    pub(super) fn insert_canonical(&mut self, handle: Handle, index: Option<usize>) {
        match index {
            Some(i) if i < self.canonical_state.len() => self.canonical_state.insert(i, handle),
            _ => self.canonical_state.push(handle),
        }
    }

    pub(super) fn insert_current(&mut self, handle: Handle, index: Option<usize>) {
        let at = index
            .filter(|i| *i < self.current.len())
            .unwrap_or(self.current.len());
        self.current.insert(at, handle);
        self.last_change = Some(ArrayChange::insertion(at, 1));
    }

    pub(super) fn remove_current(&mut self, handle: Handle) {
        if let Some(at) = self.current.iter().position(|h| *h == handle) {
            self.current.remove(at);
            self.last_change = Some(ArrayChange::removal(at, 1));
        }
    }

    /// Canonical order followed by new local records the server has not
    /// acknowledged yet.
    pub(super) fn flush<F>(&mut self, is_new: &F) -> Option<ArrayChange>
    where
        F: Fn(Handle) -> bool,
    {
        let mut target = self.canonical_state.clone();
        for handle in &self.current {
            if is_new(*handle) && !target.contains(handle) {
                target.push(*handle);
            }
        }
        let change = reconcile(&mut self.current, &target);
        if change.is_some() {
            self.last_change = change;
        }
        change
    }

    /// Reorder canonical state to match the server's list exactly.
    pub(crate) fn adopt_order(&mut self, order: &[Handle]) {
        let mut ordered: Vec<Handle> = order
            .iter()
            .copied()
            .filter(|h| self.canonical_state.contains(h))
            .collect();
        for handle in &self.canonical_state {
            if !ordered.contains(handle) {
                ordered.push(*handle);
            }
        }
        self.canonical_state = ordered;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_applies_minimal_window() {
        let mut many = ManyState {
            canonical_state: vec![Handle(1), Handle(2), Handle(9), Handle(4), Handle(5)],
            current: vec![Handle(1), Handle(2), Handle(3), Handle(4), Handle(5)],
            last_change: None,
        };
        let change = many.flush(&|_| false).unwrap();
        assert_eq!(change.first_change_index, 2);
        assert_eq!(change.removed_count, 1);
        assert_eq!(change.added_count, 1);
        assert_eq!(many.current, many.canonical_state);
    }

    #[test]
    fn flush_without_difference_is_silent() {
        let mut many = ManyState {
            canonical_state: vec![Handle(1)],
            current: vec![Handle(1)],
            last_change: Some(ArrayChange::insertion(0, 1)),
        };
        assert_eq!(many.flush(&|_| false), None);
        // the previous change is left as is
        assert_eq!(many.last_change, Some(ArrayChange::insertion(0, 1)));
    }

    #[test]
    fn insert_at_index() {
        let mut many = ManyState::default();
        many.insert_current(Handle(1), None);
        many.insert_current(Handle(2), None);
        many.insert_current(Handle(3), Some(1));
        assert_eq!(many.current, vec![Handle(1), Handle(3), Handle(2)]);
        assert_eq!(many.last_change, Some(ArrayChange::insertion(1, 1)));

        many.remove_current(Handle(1));
        assert_eq!(many.last_change, Some(ArrayChange::removal(0, 1)));
    }

    #[test]
    fn adopt_order_follows_server() {
        let mut many = ManyState {
            canonical_state: vec![Handle(1), Handle(2), Handle(3)],
            ..Default::default()
        };
        many.adopt_order(&[Handle(3), Handle(1), Handle(2)]);
        assert_eq!(many.canonical_state, vec![Handle(3), Handle(1), Handle(2)]);
    }
}
