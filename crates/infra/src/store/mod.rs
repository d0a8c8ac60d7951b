//! Transactional row storage boundary.
//!
//! The engine never talks to storage directly: the flush planner turns the
//! entity cache into revision-checked statements against an [`EntityStore`].

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryStore;
pub use r#trait::{EntityStore, FieldFilter, FieldPatch, Row, StoreError, TxId};
