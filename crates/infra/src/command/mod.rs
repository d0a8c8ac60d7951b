//! Command execution inside transaction boundaries.
//!
//! A command is a unit of work run against a [`CommandContext`]. The context
//! owns one storage transaction and one entity cache; nothing is written until
//! the command returns and the context flushes.
//!
//! ```text
//! CommandExecutor::execute(cmd)
//!   ↓
//! 1. begin transaction, new CommandContext (empty cache)
//!   ↓
//! 2. cmd.execute(&mut ctx)          ── nested REQUIRED commands share ctx
//!   ↓                                  nested REQUIRES_NEW commands get their own
//! 3. flush (revision-checked statements, conflict listeners)
//!   ↓
//! 4. COMMITTING listeners
//!   ↓
//! 5. commit ── COMMITTED listeners
//!
//! any error in 2–5 ⇒ rollback ── ROLLED_BACK listeners ⇒ error returned
//! ```

pub mod context;
pub mod executor;

pub use context::{CommandContext, TransactionListener, TransactionState};
pub use executor::CommandExecutor;

use crate::error::EngineResult;

/// How a nested command relates to the transaction of its caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Propagation {
    /// Join the caller's transaction and cache.
    #[default]
    Required,
    /// Run in an independent transaction that commits on its own.
    RequiresNew,
}

/// A unit of work.
///
/// Commands are values: tests wrap them to inject synchronization points, the
/// executor retries them, and nested invocations pass them by reference.
pub trait Command<T> {
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<T>;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<T, F> Command<T> for F
where
    F: Fn(&mut CommandContext) -> EngineResult<T>,
{
    fn execute(&self, ctx: &mut CommandContext) -> EngineResult<T> {
        self(ctx)
    }

    fn name(&self) -> &str {
        "closure"
    }
}
