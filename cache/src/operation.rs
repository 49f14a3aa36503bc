//! Save operations.
//!
//! Which adapter call persists a record is decided from its flags when the
//! commit is dispatched, not when `save` was requested.

use crate::snapshot::Snapshot;
use crate::state::StateFlags;
use serde::{Deserialize, Serialize};

/// The adapter call a commit maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SaveOperation {
    CreateRecord,
    UpdateRecord,
    DeleteRecord,
}

impl SaveOperation {
    /// Choose the operation for a record in the given state.
    pub fn for_flags(flags: &StateFlags) -> Self {
        if flags.is_new {
            SaveOperation::CreateRecord
        } else if flags.is_deleted {
            SaveOperation::DeleteRecord
        } else {
            SaveOperation::UpdateRecord
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SaveOperation::CreateRecord => "createRecord",
            SaveOperation::UpdateRecord => "updateRecord",
            SaveOperation::DeleteRecord => "deleteRecord",
        }
    }
}

impl std::fmt::Display for SaveOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A commit ready for the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSave {
    /// Adapter call to make
    pub operation: SaveOperation,
    /// Record as it was when the commit started
    pub snapshot: Snapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateId;

    #[test]
    fn operation_follows_flags() {
        assert_eq!(
            SaveOperation::for_flags(&StateId::CreatedInFlight.flags()),
            SaveOperation::CreateRecord
        );
        assert_eq!(
            SaveOperation::for_flags(&StateId::UpdatedInFlight.flags()),
            SaveOperation::UpdateRecord
        );
        assert_eq!(
            SaveOperation::for_flags(&StateId::DeletedInFlight.flags()),
            SaveOperation::DeleteRecord
        );
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(SaveOperation::DeleteRecord).unwrap();
        assert_eq!(value, serde_json::json!("deleteRecord"));
        assert_eq!(SaveOperation::UpdateRecord.to_string(), "updateRecord");
    }
}
