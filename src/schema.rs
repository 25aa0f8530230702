//! Entity metadata consumed by the translator.
//!
//! The translator never inspects host types by reflection. Everything it
//! needs to know about mapped entities (tables, columns, keys, references
//! and value converters) comes through the [`Catalog`] trait.
//! [`InMemoryCatalog`] is a plain map-backed implementation.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::value::{HostType, Value};

/// Text format used by [`ValueConverter::DateTimeFromText`].
pub const DATETIME_TEXT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Conversion between a column's database representation and its host type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ValueConverter {
    /// Database and host representation coincide.
    #[default]
    Identity,
    /// Booleans stored as integers (0 / non-zero).
    BoolFromInt,
    /// 64-bit integers narrowed to a 32-bit host field.
    IntNarrow,
    /// Durations stored as a millisecond count.
    TimeSpanFromMillis,
    /// Timestamps stored as text.
    DateTimeFromText,
    /// Decimals stored as text.
    FloatFromText,
}

impl ValueConverter {
    /// Database value to host value.
    pub fn to_host(&self, value: Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            ValueConverter::Identity => Ok(value),
            ValueConverter::BoolFromInt => match value {
                Value::Int(i) => Ok(Value::Bool(i != 0)),
                Value::Bool(b) => Ok(Value::Bool(b)),
                other => Err(format!("expected int for bool, got {}", other.type_name())),
            },
            ValueConverter::IntNarrow => match value {
                Value::Int(i) => i32::try_from(i)
                    .map(|n| Value::Int(i64::from(n)))
                    .map_err(|_| format!("value {i} out of range for int")),
                other => Err(format!("expected int, got {}", other.type_name())),
            },
            ValueConverter::TimeSpanFromMillis => match value {
                Value::Int(ms) | Value::TimeSpan(ms) => Ok(Value::TimeSpan(ms)),
                Value::Float(ms) => Ok(Value::TimeSpan(ms.round() as i64)),
                other => Err(format!("expected milliseconds, got {}", other.type_name())),
            },
            ValueConverter::DateTimeFromText => match value {
                Value::Text(s) => NaiveDateTime::parse_from_str(&s, DATETIME_TEXT_FORMAT)
                    .map(Value::DateTime)
                    .map_err(|e| format!("invalid timestamp '{s}': {e}")),
                Value::DateTime(dt) => Ok(Value::DateTime(dt)),
                other => Err(format!("expected timestamp text, got {}", other.type_name())),
            },
            ValueConverter::FloatFromText => match value {
                Value::Text(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|e| format!("invalid decimal '{s}': {e}")),
                Value::Float(f) => Ok(Value::Float(f)),
                Value::Int(i) => Ok(Value::Float(i as f64)),
                other => Err(format!("expected decimal text, got {}", other.type_name())),
            },
        }
    }

    /// Host value to database value. Values of an unexpected kind pass
    /// through unchanged.
    pub fn to_db(&self, value: Value) -> Value {
        match (self, value) {
            (ValueConverter::BoolFromInt, Value::Bool(b)) => Value::Int(i64::from(b)),
            (ValueConverter::TimeSpanFromMillis, Value::TimeSpan(ms)) => Value::Int(ms),
            (ValueConverter::DateTimeFromText, Value::DateTime(dt)) => {
                Value::Text(dt.format(DATETIME_TEXT_FORMAT).to_string())
            }
            (ValueConverter::FloatFromText, Value::Float(f)) => Value::Text(f.to_string()),
            (_, v) => v,
        }
    }
}

/// A mapped scalar member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub member: String,
    pub column: String,
    pub ty: HostType,
    pub converter: ValueConverter,
}

/// A many-to-one reference from one entity to another.
///
/// `fk_members` are the owner's members holding the foreign key; they pair
/// positionally with the target's key members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceInfo {
    pub member: String,
    pub target: String,
    pub fk_members: Vec<String>,
    pub nullable: bool,
}

/// Mapping of one entity type to one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub name: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    pub key: Vec<String>,
    pub references: Vec<ReferenceInfo>,
}

impl EntityInfo {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: Vec::new(),
            key: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Add a column whose name equals the member name.
    pub fn with_column(self, member: &str, ty: HostType) -> Self {
        self.with_mapped_column(member, member, ty, ValueConverter::Identity)
    }

    pub fn with_mapped_column(
        mut self,
        member: &str,
        column: &str,
        ty: HostType,
        converter: ValueConverter,
    ) -> Self {
        self.columns.push(ColumnInfo {
            member: member.to_string(),
            column: column.to_string(),
            ty,
            converter,
        });
        self
    }

    pub fn with_key(mut self, members: &[&str]) -> Self {
        self.key = members.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_reference(
        mut self,
        member: &str,
        target: &str,
        fk_members: &[&str],
        nullable: bool,
    ) -> Self {
        self.references.push(ReferenceInfo {
            member: member.to_string(),
            target: target.to_string(),
            fk_members: fk_members.iter().map(|m| m.to_string()).collect(),
            nullable,
        });
        self
    }

    pub fn column(&self, member: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.member == member)
    }

    pub fn reference(&self, member: &str) -> Option<&ReferenceInfo> {
        self.references.iter().find(|r| r.member == member)
    }

    /// Key columns in key order. Members missing from the column list are
    /// skipped.
    pub fn key_columns(&self) -> Vec<&ColumnInfo> {
        self.key.iter().filter_map(|k| self.column(k)).collect()
    }
}

/// Source of entity metadata.
pub trait Catalog {
    fn entity(&self, name: &str) -> Option<&EntityInfo>;
}

/// Map-backed [`Catalog`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    entities: HashMap<String, EntityInfo>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: EntityInfo) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    pub fn add_entity(&mut self, entity: EntityInfo) {
        self.entities.insert(entity.name.clone(), entity);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Catalog for InMemoryCatalog {
    fn entity(&self, name: &str) -> Option<&EntityInfo> {
        self.entities.get(name)
    }
}
