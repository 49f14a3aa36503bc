//! # Carry Cache
//!
//! A client-side entity cache with an identity map, a per-record lifecycle
//! state machine and a bidirectional relationship graph.
//!
//! The synchronous [`Store`] holds every record and applies all mutation.
//! The async [`Cache`] façade sits on top of it and talks to the backend
//! through an application-supplied [`Adapter`].
//!
//! ## Core Concepts
//!
//! ### Identity
//!
//! Each `(type, id)` pair maps to exactly one [`Handle`]. Pushing the same
//! resource twice updates the same record.
//!
//! ### Record state
//!
//! Every record moves through a fixed state tree (`empty`, `loading`,
//! `loaded.saved`, `loaded.updated.inFlight`, `deleted.saved`, ...). Events a
//! state does not handle bubble to its parent; an event nobody handles is an
//! [`Error::UnhandledEvent`].
//!
//! ### Relationships
//!
//! Relationships keep a canonical (server) membership and a local one.
//! Local edits are mirrored on the inverse side immediately. Canonical
//! changes are flushed once per tick, and unsaved new records survive a
//! canonical flush that does not mention them.
//!
//! ### Ticks
//!
//! Work that must be batched is queued and applied by [`Store::flush`]:
//!
//! 1. canonical relationship flush
//! 2. record array reconciliation
//! 3. lifecycle event delivery
//! 4. orphan sweep
//!
//! [`Cache::settle`] dispatches coalesced fetches and queued commits before
//! running the same tick.
//!
//! ## Quick Start
//!
//! ```rust
//! use carry_cache::{ModelSchema, RelationshipDef, Schema, Store};
//! use serde_json::json;
//!
//! // 1. Define a schema
//! let schema = Schema::new()
//!     .with_model(
//!         ModelSchema::new("post")
//!             .attribute("title")
//!             .relationship(RelationshipDef::has_many("comments", "comment")),
//!     )
//!     .with_model(
//!         ModelSchema::new("comment")
//!             .attribute("body")
//!             .relationship(RelationshipDef::belongs_to("post", "post")),
//!     );
//!
//! // 2. Create a store
//! let mut store = Store::new(schema).unwrap();
//!
//! // 3. Push server data
//! let post = store
//!     .push(&json!({"data": {"type": "post", "id": "1", "attributes": {"title": "A"}}}))
//!     .unwrap()
//!     .single()
//!     .unwrap();
//!
//! // 4. Edit locally; the inverse side follows
//! let comment = store.create_record("comment", None, Default::default()).unwrap();
//! store.set_belongs_to(comment, "post", Some(post)).unwrap();
//! assert_eq!(store.has_many_values(post, "comments").unwrap(), vec![comment]);
//!
//! store.set_attribute(post, "title", json!("B")).unwrap();
//! assert!(store.flags(post).unwrap().state.is_dirty);
//!
//! // 5. End the tick
//! let report = store.flush();
//! assert!(!report.lifecycle.is_empty());
//! ```

pub mod adapter;
pub mod cache;
pub mod config;
pub mod document;
pub mod error;
pub mod identity;
pub mod operation;
pub mod reconcile;
pub mod record;
pub mod record_array;
pub mod reference;
pub mod relationship;
pub mod runloop;
pub mod schema;
pub mod snapshot;
pub mod state;
pub mod store;

// Re-export main types at crate root
pub use adapter::{
    Adapter, AdapterError, AdapterResult, PassthroughSerializer, RequestType, Serializer,
};
pub use cache::{Cache, PendingFetch};
pub use config::{CacheConfig, ConfigError};
pub use document::{
    Document, ErrorObject, PrimaryData, Resource, ResourceIdentifier, ValidationErrors,
};
pub use error::{Error, Result};
pub use identity::Handle;
pub use operation::{PendingSave, SaveOperation};
pub use reconcile::{diff_window, ArrayChange};
pub use record::{Attributes, InternalModel};
pub use record_array::{ArrayId, RecordArray, RecordFilter};
pub use reference::{BelongsToReference, HasManyReference, RecordReference, RemoteType};
pub use relationship::{FieldKey, Relationship};
pub use runloop::TickReport;
pub use schema::{ModelSchema, RelationshipDef, RelationshipKind, RelationshipMeta, Schema};
pub use snapshot::Snapshot;
pub use state::{Lifecycle, StateFlags, StateId};
pub use store::{Pushed, RecordFlags, SaveOutcome, Store};

/// Name of a registered model type.
pub type ModelName = String;
