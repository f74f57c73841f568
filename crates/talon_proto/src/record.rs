//! A materialized row: field-id → value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use talon_common::value::Value;

/// One table row keyed by field id. Absent fields read as NULL.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub fields: BTreeMap<u32, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, field_id: u32, value: Value) {
        self.fields.insert(field_id, value);
    }

    pub fn get(&self, field_id: u32) -> Option<&Value> {
        self.fields.get(&field_id)
    }

    pub fn get_or_null(&self, field_id: u32) -> Value {
        self.fields.get(&field_id).cloned().unwrap_or(Value::Null)
    }

    pub fn remove(&mut self, field_id: u32) -> Option<Value> {
        self.fields.remove(&field_id)
    }

    /// Values for the given fields in order, NULL-filling gaps.
    pub fn project(&self, field_ids: &[u32]) -> Vec<Value> {
        field_ids.iter().map(|id| self.get_or_null(*id)).collect()
    }

    /// Merge `other` over `self`, keeping `other`'s values on collision.
    pub fn merge_from(&mut self, other: &Record) {
        for (k, v) in &other.fields {
            self.fields.insert(*k, v.clone());
        }
    }
}
