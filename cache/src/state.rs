//! Record lifecycle state machine.
//!
//! The hierarchy is static data: every node knows its parent, its children and
//! the flag values it overrides. Event handlers are looked up in a
//! (state, event) table, bubbling to the parent node when a node does not
//! handle an event. Handlers are short step programs that the store executes
//! against the record.
//!
//! ```text
//! root
//! ├── empty
//! ├── loading
//! ├── loaded
//! │   ├── saved
//! │   ├── created  { uncommitted, inFlight, invalid }
//! │   └── updated  { uncommitted, inFlight, invalid }
//! └── deleted      { uncommitted, inFlight, saved, invalid }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A node of the state hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateId {
    Root,
    Empty,
    Loading,
    Loaded,
    LoadedSaved,
    Created,
    CreatedUncommitted,
    CreatedInFlight,
    CreatedInvalid,
    Updated,
    UpdatedUncommitted,
    UpdatedInFlight,
    UpdatedInvalid,
    Deleted,
    DeletedUncommitted,
    DeletedInFlight,
    DeletedSaved,
    DeletedInvalid,
}

/// Kind of pending change a dirty state represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DirtyType {
    Created,
    Updated,
    Deleted,
}

/// Flags derived from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFlags {
    pub is_empty: bool,
    pub is_loading: bool,
    pub is_loaded: bool,
    pub is_dirty: bool,
    pub is_saving: bool,
    pub is_deleted: bool,
    pub is_new: bool,
    pub is_valid: bool,
}

#[derive(Default, Clone, Copy)]
struct Overrides {
    is_empty: Option<bool>,
    is_loading: Option<bool>,
    is_loaded: Option<bool>,
    is_dirty: Option<bool>,
    is_saving: Option<bool>,
    is_deleted: Option<bool>,
    is_new: Option<bool>,
    is_valid: Option<bool>,
}

impl StateFlags {
    const ROOT: StateFlags = StateFlags {
        is_empty: false,
        is_loading: false,
        is_loaded: false,
        is_dirty: false,
        is_saving: false,
        is_deleted: false,
        is_new: false,
        is_valid: true,
    };

    fn apply(&mut self, o: Overrides) {
        macro_rules! take {
            ($($f:ident),*) => { $( if let Some(v) = o.$f { self.$f = v; } )* };
        }
        take!(is_empty, is_loading, is_loaded, is_dirty, is_saving, is_deleted, is_new, is_valid);
    }
}

/// Events a state can handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LoadingData,
    LoadedData,
    PushedData,
    DidSetProperty,
    PropertyWasReset,
    BecomeDirty,
    WillCommit,
    DidCommit,
    BecameInvalid,
    BecameValid,
    BecameError,
    NotFound,
    DeleteRecord,
    Rollback,
    RolledBack,
    UnloadRecord,
    ReloadRecord,
    InvokeLifecycleCallbacks,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            EventKind::LoadingData => "loadingData",
            EventKind::LoadedData => "loadedData",
            EventKind::PushedData => "pushedData",
            EventKind::DidSetProperty => "didSetProperty",
            EventKind::PropertyWasReset => "propertyWasReset",
            EventKind::BecomeDirty => "becomeDirty",
            EventKind::WillCommit => "willCommit",
            EventKind::DidCommit => "didCommit",
            EventKind::BecameInvalid => "becameInvalid",
            EventKind::BecameValid => "becameValid",
            EventKind::BecameError => "becameError",
            EventKind::NotFound => "notFound",
            EventKind::DeleteRecord => "deleteRecord",
            EventKind::Rollback => "rollback",
            EventKind::RolledBack => "rolledBack",
            EventKind::UnloadRecord => "unloadRecord",
            EventKind::ReloadRecord => "reloadRecord",
            EventKind::InvokeLifecycleCallbacks => "invokeLifecycleCallbacks",
        }
    }
}

/// Lifecycle notifications delivered at the end of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Lifecycle {
    Ready,
    DidLoad,
    DidCreate,
    DidUpdate,
    DidDelete,
    DidCommit,
    BecameInvalid,
    BecameError,
}

/// One instruction of a handler program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Move to a path relative to the nearest ancestor owning its first segment
    Transition(&'static str),
    Trigger(Lifecycle),
    Send(EventKind),
    /// Record the property change; becomes dirty if the value changed
    DirtyIfChanged,
    /// Record the property change on an already dirty record
    TrackProperty,
    /// Send `rolledBack` when no local changes remain
    RolledBackIfClean,
    /// Drop local values equal to canonical, settle to `loaded.saved` if clean
    SavedIfClean,
    RollbackAttributes,
    RemoveFromInverses,
    ClearErrors,
    ClearAttributeError,
    BecameValidIfNoErrors,
    MarkError,
    ForbidUnload,
}

/// Hooks run when a node is exited or set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    FinishLoading,
    DirtyIfChangedAttributes,
    UpdateRecordArrays,
    RemoveFromInverses,
}

use Lifecycle::*;
use Step::*;

const DIRTY_UNCOMMITTED_COMMON: &[(EventKind, &[Step])] = &[
    (EventKind::DidSetProperty, &[TrackProperty]),
    (EventKind::LoadingData, &[]),
    (EventKind::PropertyWasReset, &[RolledBackIfClean]),
    (EventKind::BecomeDirty, &[]),
    (EventKind::WillCommit, &[Transition("inFlight")]),
    (EventKind::ReloadRecord, &[]),
    (EventKind::BecameInvalid, &[Transition("invalid")]),
    (EventKind::Rollback, &[RollbackAttributes, Trigger(Ready)]),
];

const DIRTY_IN_FLIGHT_COMMON: &[(EventKind, &[Step])] = &[
    (EventKind::DidSetProperty, &[TrackProperty]),
    (EventKind::BecomeDirty, &[]),
    (EventKind::PushedData, &[]),
    (EventKind::UnloadRecord, &[ForbidUnload]),
    (EventKind::WillCommit, &[]),
    (
        EventKind::BecameInvalid,
        &[Transition("invalid"), Send(EventKind::InvokeLifecycleCallbacks)],
    ),
    (
        EventKind::BecameError,
        &[Transition("uncommitted"), MarkError, Trigger(BecameError)],
    ),
];

const DIRTY_INVALID_COMMON: &[(EventKind, &[Step])] = &[
    (EventKind::DeleteRecord, &[Transition("deleted.uncommitted")]),
    (
        EventKind::DidSetProperty,
        &[ClearAttributeError, TrackProperty, BecameValidIfNoErrors],
    ),
    (EventKind::BecameInvalid, &[]),
    (EventKind::BecomeDirty, &[]),
    (EventKind::PushedData, &[]),
    (EventKind::WillCommit, &[ClearErrors, Transition("inFlight")]),
    (EventKind::BecameValid, &[Transition("uncommitted")]),
    (EventKind::InvokeLifecycleCallbacks, &[Trigger(BecameInvalid)]),
];

impl StateId {
    pub const ALL: [StateId; 18] = [
        StateId::Root,
        StateId::Empty,
        StateId::Loading,
        StateId::Loaded,
        StateId::LoadedSaved,
        StateId::Created,
        StateId::CreatedUncommitted,
        StateId::CreatedInFlight,
        StateId::CreatedInvalid,
        StateId::Updated,
        StateId::UpdatedUncommitted,
        StateId::UpdatedInFlight,
        StateId::UpdatedInvalid,
        StateId::Deleted,
        StateId::DeletedUncommitted,
        StateId::DeletedInFlight,
        StateId::DeletedSaved,
        StateId::DeletedInvalid,
    ];

    pub fn parent(self) -> Option<StateId> {
        use StateId::*;
        match self {
            Root => None,
            Empty | Loading | Loaded | Deleted => Some(Root),
            LoadedSaved | Created | Updated => Some(Loaded),
            CreatedUncommitted | CreatedInFlight | CreatedInvalid => Some(Created),
            UpdatedUncommitted | UpdatedInFlight | UpdatedInvalid => Some(Updated),
            DeletedUncommitted | DeletedInFlight | DeletedSaved | DeletedInvalid => Some(Deleted),
        }
    }

    /// Name of this node within its parent.
    pub fn segment(self) -> &'static str {
        use StateId::*;
        match self {
            Root => "root",
            Empty => "empty",
            Loading => "loading",
            Loaded => "loaded",
            LoadedSaved | DeletedSaved => "saved",
            Created => "created",
            Updated => "updated",
            Deleted => "deleted",
            CreatedUncommitted | UpdatedUncommitted | DeletedUncommitted => "uncommitted",
            CreatedInFlight | UpdatedInFlight | DeletedInFlight => "inFlight",
            CreatedInvalid | UpdatedInvalid | DeletedInvalid => "invalid",
        }
    }

    /// Full dot path, e.g. `root.loaded.updated.uncommitted`.
    pub fn path(self) -> &'static str {
        use StateId::*;
        match self {
            Root => "root",
            Empty => "root.empty",
            Loading => "root.loading",
            Loaded => "root.loaded",
            LoadedSaved => "root.loaded.saved",
            Created => "root.loaded.created",
            CreatedUncommitted => "root.loaded.created.uncommitted",
            CreatedInFlight => "root.loaded.created.inFlight",
            CreatedInvalid => "root.loaded.created.invalid",
            Updated => "root.loaded.updated",
            UpdatedUncommitted => "root.loaded.updated.uncommitted",
            UpdatedInFlight => "root.loaded.updated.inFlight",
            UpdatedInvalid => "root.loaded.updated.invalid",
            Deleted => "root.deleted",
            DeletedUncommitted => "root.deleted.uncommitted",
            DeletedInFlight => "root.deleted.inFlight",
            DeletedSaved => "root.deleted.saved",
            DeletedInvalid => "root.deleted.invalid",
        }
    }

    pub fn child(self, segment: &str) -> Option<StateId> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.parent() == Some(self) && s.segment() == segment)
    }

    /// Child entered automatically when a transition stops on this node.
    pub fn initial_child(self) -> Option<StateId> {
        use StateId::*;
        match self {
            Loaded => Some(LoadedSaved),
            Created => Some(CreatedUncommitted),
            Updated => Some(UpdatedUncommitted),
            Deleted => Some(DeletedUncommitted),
            _ => None,
        }
    }

    fn overrides(self) -> Overrides {
        use StateId::*;
        let t = Some(true);
        let f = Some(false);
        match self {
            Empty => Overrides {
                is_empty: t,
                ..Default::default()
            },
            Loading => Overrides {
                is_loading: t,
                ..Default::default()
            },
            Loaded => Overrides {
                is_loaded: t,
                ..Default::default()
            },
            Created => Overrides {
                is_dirty: t,
                is_new: t,
                ..Default::default()
            },
            Updated => Overrides {
                is_dirty: t,
                ..Default::default()
            },
            CreatedInFlight | UpdatedInFlight | DeletedInFlight => Overrides {
                is_saving: t,
                ..Default::default()
            },
            CreatedInvalid | UpdatedInvalid | DeletedInvalid => Overrides {
                is_valid: f,
                ..Default::default()
            },
            Deleted => Overrides {
                is_deleted: t,
                is_loaded: t,
                is_dirty: t,
                ..Default::default()
            },
            DeletedSaved => Overrides {
                is_dirty: f,
                ..Default::default()
            },
            _ => Overrides::default(),
        }
    }

    /// Flags for this node, folding overrides from the root down.
    pub fn flags(self) -> StateFlags {
        let mut chain = vec![self];
        let mut current = self;
        while let Some(parent) = current.parent() {
            chain.push(parent);
            current = parent;
        }
        let mut flags = StateFlags::ROOT;
        for node in chain.into_iter().rev() {
            flags.apply(node.overrides());
        }
        flags
    }

    pub fn dirty_type(self) -> Option<DirtyType> {
        let mut current = Some(self);
        while let Some(node) = current {
            match node {
                StateId::Created => return Some(DirtyType::Created),
                StateId::Updated => return Some(DirtyType::Updated),
                StateId::Deleted => return Some(DirtyType::Deleted),
                _ => current = node.parent(),
            }
        }
        None
    }

    pub fn exit_hook(self) -> Option<Hook> {
        match self {
            StateId::Loading => Some(Hook::FinishLoading),
            _ => None,
        }
    }

    pub fn setup_hook(self) -> Option<Hook> {
        match self {
            StateId::LoadedSaved => Some(Hook::DirtyIfChangedAttributes),
            StateId::Deleted => Some(Hook::UpdateRecordArrays),
            StateId::DeletedSaved => Some(Hook::RemoveFromInverses),
            _ => None,
        }
    }

    /// Handler defined directly on this node, without bubbling.
    pub fn own_handler(self, event: EventKind) -> Option<&'static [Step]> {
        use EventKind as E;
        use StateId::*;

        let from_table = |table: &'static [(EventKind, &'static [Step])]| {
            table.iter().find(|(e, _)| *e == event).map(|(_, s)| *s)
        };

        match (self, event) {
            (Root, E::RolledBack | E::PropertyWasReset | E::UnloadRecord) => Some(&[]),

            (Empty, E::LoadingData) => Some(&[Transition("loading")]),
            (Empty, E::LoadedData) => {
                Some(&[Transition("loaded.created.uncommitted"), Trigger(Ready)])
            }
            (Empty | Loading, E::PushedData) => {
                Some(&[Transition("loaded.saved"), Trigger(DidLoad), Trigger(Ready)])
            }

            (Loading, E::BecameError) => Some(&[Trigger(BecameError)]),
            (Loading, E::NotFound) => Some(&[Transition("empty")]),

            (Loaded, E::LoadingData) => Some(&[]),

            (LoadedSaved, E::DidSetProperty) => Some(&[DirtyIfChanged]),
            (LoadedSaved, E::BecomeDirty) => Some(&[Transition("updated.uncommitted")]),
            (LoadedSaved, E::WillCommit) => Some(&[Transition("updated.inFlight")]),
            (LoadedSaved, E::DeleteRecord) => Some(&[Transition("deleted.uncommitted")]),
            (
                LoadedSaved,
                E::PushedData | E::ReloadRecord | E::UnloadRecord | E::DidCommit | E::NotFound,
            ) => Some(&[]),

            (CreatedUncommitted, E::PushedData) => {
                Some(&[Transition("loaded.updated.uncommitted"), Trigger(DidLoad)])
            }
            (CreatedUncommitted, E::RolledBack) => Some(&[Transition("deleted.saved")]),
            (CreatedUncommitted, E::DeleteRecord) => Some(&[
                RemoveFromInverses,
                Transition("deleted.saved"),
                Send(E::InvokeLifecycleCallbacks),
            ]),
            (CreatedUncommitted, _) => from_table(DIRTY_UNCOMMITTED_COMMON),

            (UpdatedUncommitted, E::PushedData) => Some(&[SavedIfClean]),
            (UpdatedUncommitted, E::RolledBack) => Some(&[Transition("loaded.saved")]),
            (UpdatedUncommitted, E::DeleteRecord) => Some(&[Transition("deleted.uncommitted")]),
            (UpdatedUncommitted, _) => from_table(DIRTY_UNCOMMITTED_COMMON),

            (CreatedInFlight, E::DidCommit) => {
                Some(&[Transition("saved"), Trigger(DidCreate), Trigger(DidCommit)])
            }
            (UpdatedInFlight, E::DidCommit) => {
                Some(&[Transition("saved"), Trigger(DidUpdate), Trigger(DidCommit)])
            }
            (CreatedInFlight | UpdatedInFlight, _) => from_table(DIRTY_IN_FLIGHT_COMMON),

            (CreatedInvalid, E::RolledBack) => {
                Some(&[ClearErrors, Transition("deleted.saved"), Trigger(Ready)])
            }
            (UpdatedInvalid, E::RolledBack) => {
                Some(&[ClearErrors, Transition("loaded.saved"), Trigger(Ready)])
            }
            (CreatedInvalid | UpdatedInvalid, _) => from_table(DIRTY_INVALID_COMMON),

            (DeletedUncommitted, E::WillCommit) => Some(&[Transition("inFlight")]),
            (DeletedUncommitted, E::Rollback) => Some(&[RollbackAttributes, Trigger(Ready)]),
            (DeletedUncommitted, E::PushedData | E::BecomeDirty | E::DeleteRecord) => Some(&[]),
            (DeletedUncommitted, E::RolledBack) => {
                Some(&[Transition("loaded.saved"), Trigger(Ready)])
            }

            (DeletedInFlight, E::UnloadRecord) => Some(&[ForbidUnload]),
            (DeletedInFlight, E::WillCommit) => Some(&[]),
            (DeletedInFlight, E::DidCommit) => {
                Some(&[Transition("saved"), Send(E::InvokeLifecycleCallbacks)])
            }
            (DeletedInFlight, E::BecameError) => {
                Some(&[Transition("uncommitted"), MarkError, Trigger(BecameError)])
            }
            (DeletedInFlight, E::BecameInvalid) => {
                Some(&[Transition("invalid"), Trigger(BecameInvalid)])
            }

            (DeletedSaved, E::InvokeLifecycleCallbacks) => {
                Some(&[Trigger(DidDelete), Trigger(DidCommit)])
            }
            (DeletedSaved, E::WillCommit | E::DidCommit) => Some(&[]),

            (DeletedInvalid, E::DidSetProperty) => {
                Some(&[ClearAttributeError, BecameValidIfNoErrors])
            }
            (DeletedInvalid, E::DeleteRecord | E::BecomeDirty | E::WillCommit) => Some(&[]),
            (DeletedInvalid, E::RolledBack) => {
                Some(&[ClearErrors, Transition("loaded.saved"), Trigger(Ready)])
            }
            (DeletedInvalid, E::BecameValid) => Some(&[Transition("uncommitted")]),

            _ => None,
        }
    }

    /// Handler for an event, bubbling through parents up to the root.
    pub fn handler(self, event: EventKind) -> Option<(StateId, &'static [Step])> {
        let mut current = Some(self);
        while let Some(node) = current {
            if let Some(steps) = node.own_handler(event) {
                return Some((node, steps));
            }
            current = node.parent();
        }
        None
    }
}

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

/// Nodes exited and entered by one transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub exits: Vec<StateId>,
    pub enters: Vec<StateId>,
    pub target: StateId,
}

impl Route {
    /// Resolve `path` from `from`: walk up until a node owns the first
    /// segment, then walk down the path and through initial children.
    pub fn compute(from: StateId, path: &str) -> Option<Route> {
        let mut segments = path.split('.');
        let first = segments.next()?;

        let mut exits = Vec::new();
        let mut pivot = from;
        while pivot.child(first).is_none() {
            exits.push(pivot);
            pivot = pivot.parent()?;
        }

        let mut enters = Vec::new();
        let mut state = pivot.child(first)?;
        enters.push(state);
        for segment in segments {
            state = state.child(segment)?;
            enters.push(state);
        }
        while let Some(initial) = state.initial_child() {
            state = initial;
            enters.push(state);
        }

        Some(Route {
            exits,
            enters,
            target: state,
        })
    }
}

/// The shared state machine with its precomputed route table.
///
/// The hierarchy never changes, so every (state, transition path) pair that
/// a handler can produce is resolved once up front.
#[derive(Debug, Clone)]
pub struct StateMachine {
    routes: HashMap<(StateId, &'static str), Route>,
}

impl StateMachine {
    pub fn new() -> Self {
        let mut paths: Vec<&'static str> = Vec::new();
        for state in StateId::ALL {
            for event in ALL_EVENTS {
                if let Some(steps) = state.own_handler(event) {
                    for step in steps {
                        if let Transition(path) = *step {
                            if !paths.contains(&path) {
                                paths.push(path);
                            }
                        }
                    }
                }
            }
        }

        let mut routes = HashMap::new();
        for from in StateId::ALL {
            for path in &paths {
                if let Some(route) = Route::compute(from, path) {
                    routes.insert((from, *path), route);
                }
            }
        }
        Self { routes }
    }

    pub fn route(&self, from: StateId, path: &'static str) -> Option<Route> {
        self.routes
            .get(&(from, path))
            .cloned()
            .or_else(|| Route::compute(from, path))
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

const ALL_EVENTS: [EventKind; 18] = [
    EventKind::LoadingData,
    EventKind::LoadedData,
    EventKind::PushedData,
    EventKind::DidSetProperty,
    EventKind::PropertyWasReset,
    EventKind::BecomeDirty,
    EventKind::WillCommit,
    EventKind::DidCommit,
    EventKind::BecameInvalid,
    EventKind::BecameValid,
    EventKind::BecameError,
    EventKind::NotFound,
    EventKind::DeleteRecord,
    EventKind::Rollback,
    EventKind::RolledBack,
    EventKind::UnloadRecord,
    EventKind::ReloadRecord,
    EventKind::InvokeLifecycleCallbacks,
];
