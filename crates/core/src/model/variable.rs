//! Variables and their out-of-line byte storage.
//!
//! Scalars live in the variable row itself. Byte values are stored in a
//! separate [`ByteArrayEntity`] referenced by id and only fetched when the value
//! is actually read.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityKey, EntityType, VersionedEntity};
use crate::id::{ByteArrayId, ExecutionId, TenantId, VariableId};

/// A variable value as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum VariableValue {
    Null,
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl VariableValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            VariableValue::Null => "null",
            VariableValue::Boolean(_) => "boolean",
            VariableValue::Long(_) => "long",
            VariableValue::Double(_) => "double",
            VariableValue::String(_) => "string",
            VariableValue::Json(_) => "json",
            VariableValue::Bytes(_) => "bytes",
        }
    }
}

impl From<serde_json::Value> for VariableValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => VariableValue::Null,
            Value::Bool(b) => VariableValue::Boolean(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => VariableValue::Long(i),
                None => VariableValue::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => VariableValue::String(s),
            other => VariableValue::Json(other),
        }
    }
}

/// What the variable row stores. Byte values are a reference only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Null,
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
    Json(serde_json::Value),
    ByteArray(ByteArrayId),
}

impl StoredValue {
    pub fn byte_array_id(&self) -> Option<ByteArrayId> {
        match self {
            StoredValue::ByteArray(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableEntity {
    pub id: VariableId,
    pub revision: u32,
    pub name: String,
    pub execution_id: Option<ExecutionId>,
    pub value: StoredValue,
    pub tenant_id: Option<TenantId>,
}

impl VariableEntity {
    pub fn new(name: impl Into<String>, execution_id: Option<ExecutionId>, value: StoredValue) -> Self {
        Self {
            id: VariableId::new(),
            revision: 1,
            name: name.into(),
            execution_id,
            value,
            tenant_id: None,
        }
    }
}

impl VersionedEntity for VariableEntity {
    const ENTITY_TYPE: EntityType = EntityType::Variable;

    fn entity_id(&self) -> Uuid {
        *self.id.as_uuid()
    }

    fn revision(&self) -> u32 {
        self.revision
    }

    fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }

    fn references(&self) -> Vec<EntityKey> {
        let mut refs = Vec::new();
        if let Some(exec) = self.execution_id {
            refs.push(EntityKey::new(EntityType::Execution, exec));
        }
        if let Some(bytes) = self.value.byte_array_id() {
            refs.push(EntityKey::new(EntityType::ByteArray, bytes));
        }
        refs
    }
}

/// Out-of-line binary payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteArrayEntity {
    pub id: ByteArrayId,
    pub revision: u32,
    pub name: String,
    pub bytes: Vec<u8>,
    pub tenant_id: Option<TenantId>,
}

impl ByteArrayEntity {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: ByteArrayId::new(),
            revision: 1,
            name: name.into(),
            bytes,
            tenant_id: None,
        }
    }
}

impl VersionedEntity for ByteArrayEntity {
    const ENTITY_TYPE: EntityType = EntityType::ByteArray;

    fn entity_id(&self) -> Uuid {
        *self.id.as_uuid()
    }

    fn revision(&self) -> u32 {
        self.revision
    }

    fn set_revision(&mut self, revision: u32) {
        self.revision = revision;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_backed_variable_references_its_blob() {
        let blob = ByteArrayEntity::new("payload", vec![1, 2, 3]);
        let var = VariableEntity::new("payload", None, StoredValue::ByteArray(blob.id));
        assert_eq!(var.references(), vec![EntityKey::new(EntityType::ByteArray, blob.id)]);
    }

    #[test]
    fn stored_value_serializes_tagged() {
        let json = serde_json::to_value(StoredValue::Long(7)).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "long", "value": 7 }));
    }
}
