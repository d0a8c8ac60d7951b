//! Variable storage with out-of-line byte values.
//!
//! ```text
//!   VariableEntity { value: ByteArray(id) } ──FK──► ByteArrayEntity { bytes }
//! ```
//!
//! Reading a variable row never touches its byte array; the bytes are only
//! fetched when the value is asked for. If the byte array is gone by then
//! (its owner was deleted concurrently) the value is absent and nothing is
//! written back.

use tracing::debug;

use txflow_core::ExecutionId;
use txflow_core::model::{ByteArrayEntity, ExecutionEntity, StoredValue, VariableEntity, VariableValue};

use crate::command::CommandContext;
use crate::error::EngineResult;

/// A loaded variable row whose byte value has not been fetched yet.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableInstance {
    entity: VariableEntity,
}

impl VariableInstance {
    pub fn entity(&self) -> &VariableEntity {
        &self.entity
    }

    pub fn name(&self) -> &str {
        &self.entity.name
    }

    /// Resolve the value, fetching the byte array if needed.
    pub fn value(&self, ctx: &mut CommandContext) -> EngineResult<Option<VariableValue>> {
        let value = match &self.entity.value {
            StoredValue::Null => VariableValue::Null,
            StoredValue::Boolean(b) => VariableValue::Boolean(*b),
            StoredValue::Long(l) => VariableValue::Long(*l),
            StoredValue::Double(d) => VariableValue::Double(*d),
            StoredValue::String(s) => VariableValue::String(s.clone()),
            StoredValue::Json(j) => VariableValue::Json(j.clone()),
            StoredValue::ByteArray(id) => match ctx.find::<ByteArrayEntity>(*id)? {
                Some(bytes) => VariableValue::Bytes(bytes.bytes),
                None => {
                    debug!(variable = %self.entity.name, byte_array_id = %id, "byte array no longer exists");
                    return Ok(None);
                }
            },
        };
        Ok(Some(value))
    }
}

fn stored_scalar(value: VariableValue) -> Result<StoredValue, Vec<u8>> {
    Ok(match value {
        VariableValue::Null => StoredValue::Null,
        VariableValue::Boolean(b) => StoredValue::Boolean(b),
        VariableValue::Long(l) => StoredValue::Long(l),
        VariableValue::Double(d) => StoredValue::Double(d),
        VariableValue::String(s) => StoredValue::String(s),
        VariableValue::Json(j) => StoredValue::Json(j),
        VariableValue::Bytes(bytes) => return Err(bytes),
    })
}

/// Variable rows of a scope (`None` is the global scope).
pub fn variables_of(ctx: &mut CommandContext, scope: Option<ExecutionId>) -> EngineResult<Vec<VariableInstance>> {
    Ok(ctx
        .find_where::<VariableEntity>(|v| v.execution_id == scope)?
        .into_iter()
        .map(|entity| VariableInstance { entity })
        .collect())
}

pub fn variable_instance(
    ctx: &mut CommandContext,
    scope: Option<ExecutionId>,
    name: &str,
) -> EngineResult<Option<VariableInstance>> {
    Ok(ctx
        .find_where::<VariableEntity>(|v| v.execution_id == scope && v.name == name)?
        .into_iter()
        .next()
        .map(|entity| VariableInstance { entity }))
}

pub fn get_variable(ctx: &mut CommandContext, scope: Option<ExecutionId>, name: &str) -> EngineResult<Option<VariableValue>> {
    match variable_instance(ctx, scope, name)? {
        Some(instance) => instance.value(ctx),
        None => Ok(None),
    }
}

/// Create or overwrite a variable. Byte values reuse the existing byte array
/// row when there is one.
pub fn set_variable(
    ctx: &mut CommandContext,
    scope: Option<ExecutionId>,
    name: &str,
    value: VariableValue,
) -> EngineResult<()> {
    let existing = variable_instance(ctx, scope, name)?.map(|i| i.entity);
    let old_bytes = existing.as_ref().and_then(|v| v.value.byte_array_id());

    let stored = match stored_scalar(value) {
        Ok(scalar) => {
            if let Some(id) = old_bytes {
                ctx.delete_by_id::<ByteArrayEntity>(id)?;
            }
            scalar
        }
        Err(bytes) => match old_bytes {
            Some(id) => match ctx.find_mut::<ByteArrayEntity>(id)? {
                Some(row) => {
                    row.bytes = bytes;
                    StoredValue::ByteArray(id)
                }
                None => insert_bytes(ctx, name, bytes)?,
            },
            None => insert_bytes(ctx, name, bytes)?,
        },
    };

    match existing {
        Some(mut variable) => {
            variable.value = stored;
            ctx.update(variable)
        }
        None => {
            let mut variable = VariableEntity::new(name, scope, stored);
            if let Some(execution) = scope {
                variable.tenant_id = ctx
                    .find::<ExecutionEntity>(execution)?
                    .and_then(|e| e.tenant_id);
            }
            ctx.insert(variable)
        }
    }
}

fn insert_bytes(ctx: &mut CommandContext, name: &str, bytes: Vec<u8>) -> EngineResult<StoredValue> {
    let row = ByteArrayEntity::new(name, bytes);
    let id = row.id;
    ctx.insert(row)?;
    Ok(StoredValue::ByteArray(id))
}

/// Delete a variable row together with its byte array.
pub fn delete_variable_entity(ctx: &mut CommandContext, variable: &VariableEntity) -> EngineResult<()> {
    ctx.delete(variable)?;
    if let Some(id) = variable.value.byte_array_id() {
        ctx.delete_by_id::<ByteArrayEntity>(id)?;
    }
    Ok(())
}

/// Returns false if there was no such variable.
pub fn remove_variable(ctx: &mut CommandContext, scope: Option<ExecutionId>, name: &str) -> EngineResult<bool> {
    match variable_instance(ctx, scope, name)? {
        Some(instance) => {
            delete_variable_entity(ctx, &instance.entity)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Delete every variable of a scope. Returns the number removed.
pub fn remove_scope_variables(ctx: &mut CommandContext, scope: ExecutionId) -> EngineResult<usize> {
    let variables = variables_of(ctx, Some(scope))?;
    for instance in &variables {
        delete_variable_entity(ctx, &instance.entity)?;
    }
    Ok(variables.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use crate::engine::Engine;

    fn byte_arrays(engine: &Engine) -> usize {
        engine
            .command_executor()
            .run(|ctx| ctx.find_where::<ByteArrayEntity>(|_| true))
            .unwrap()
            .len()
    }

    #[test]
    fn bytes_are_stored_out_of_line_and_reused() {
        let engine = Engine::in_memory();
        let executor = engine.command_executor();
        executor
            .run(|ctx| set_variable(ctx, None, "payload", VariableValue::Bytes(vec![1, 2, 3])))
            .unwrap();
        assert_eq!(byte_arrays(&engine), 1);

        executor
            .run(|ctx| set_variable(ctx, None, "payload", VariableValue::Bytes(vec![4])))
            .unwrap();
        assert_eq!(byte_arrays(&engine), 1);
        let value = executor.run(|ctx| get_variable(ctx, None, "payload")).unwrap();
        assert_eq!(value, Some(VariableValue::Bytes(vec![4])));

        executor
            .run(|ctx| set_variable(ctx, None, "payload", VariableValue::Long(7)))
            .unwrap();
        assert_eq!(byte_arrays(&engine), 0);
    }

    #[test]
    fn removing_a_variable_removes_its_bytes() {
        let engine = Engine::in_memory();
        let executor = engine.command_executor();
        executor
            .run(|ctx| set_variable(ctx, None, "payload", VariableValue::Bytes(vec![9; 16])))
            .unwrap();

        assert!(executor.run(|ctx| remove_variable(ctx, None, "payload")).unwrap());
        assert_eq!(byte_arrays(&engine), 0);
        assert!(!executor.run(|ctx| remove_variable(ctx, None, "payload")).unwrap());
    }

    #[test]
    fn missing_byte_array_reads_as_absent_without_writes() {
        let engine = Engine::in_memory();
        let executor = engine.command_executor();
        executor
            .run(|ctx| set_variable(ctx, None, "payload", VariableValue::Bytes(vec![1])))
            .unwrap();

        let value = executor
            .run(|ctx| {
                let instance = variable_instance(ctx, None, "payload")?.expect("variable");
                // Owner deleted by someone else in between.
                executor.run(|other| remove_variable(other, None, "payload"))?;
                instance.value(ctx)
            })
            .unwrap();
        assert_eq!(value, None);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 32, ..ProptestConfig::default() })]

        #[test]
        fn scalar_values_survive_storage(n in any::<i64>(), s in ".{0,16}", b in any::<bool>()) {
            let engine = Engine::in_memory();
            let executor = engine.command_executor();
            for (name, value) in [
                ("n", VariableValue::Long(n)),
                ("s", VariableValue::String(s.clone())),
                ("b", VariableValue::Boolean(b)),
            ] {
                executor.run(|ctx| set_variable(ctx, None, name, value.clone())).unwrap();
                let read = executor.run(|ctx| get_variable(ctx, None, name)).unwrap();
                prop_assert_eq!(read, Some(value));
            }
        }
    }
}
