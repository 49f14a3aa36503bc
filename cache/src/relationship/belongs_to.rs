use crate::Handle;

/// To-one state: the visible record and the canonical one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BelongsToState {
    pub(crate) inverse_record: Option<Handle>,
    pub(crate) canonical_state: Option<Handle>,
}

impl BelongsToState {
    pub fn inverse_record(&self) -> Option<Handle> {
        self.inverse_record
    }

    pub fn canonical_state(&self) -> Option<Handle> {
        self.canonical_state
    }

    /// A new local record is not displaced by an empty canonical state.
    pub(super) fn keeps_new_record<F>(&self, is_new: &F) -> bool
    where
        F: Fn(Handle) -> bool,
    {
        self.canonical_state.is_none() && self.inverse_record.is_some_and(is_new)
    }

    pub(super) fn adopt_canonical(&mut self) -> bool {
        if self.inverse_record == self.canonical_state {
            return false;
        }
        self.inverse_record = self.canonical_state;
        true
    }
}
