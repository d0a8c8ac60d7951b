//! Entity persistence: per-transaction cache, flush planning, conflict hooks.

pub mod cache;
pub mod flush;
pub mod listener;
pub mod operation;

pub use cache::{EntityCache, EntityState};
pub use flush::{FlushExecutor, plan};
pub use listener::{IgnoreConflictsOn, OptimisticLockingListener, OptimisticLockingResult};
pub use operation::{BulkUpdate, DbOperation, OperationKind};
