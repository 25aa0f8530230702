//! Host values, host types and result rows.
//!
//! [`HostType`] describes the static type of an expression on the host side
//! of the mapping; [`Value`] is a dynamically typed host value. Rows handed
//! back by the database are plain `Vec<Value>`.

use std::fmt;

use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

/// A row returned by the database, one value per SQL output column.
pub type Row = Vec<Value>;

/// Static host-side type of an expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostType {
    Bool,
    Int32,
    Int64,
    Double,
    Decimal,
    String,
    DateTime,
    /// A duration. Carried through SQL as a millisecond count.
    TimeSpan,
    Guid,
    Bytes,
    /// A mapped entity, by entity name.
    Entity(String),
    /// An anonymous record with named fields.
    Record(Vec<(String, HostType)>),
    /// A sequence of elements.
    Sequence(Box<HostType>),
    /// A group produced by `GroupBy`.
    Grouping {
        key: Box<HostType>,
        element: Box<HostType>,
    },
    Nullable(Box<HostType>),
    /// Type not known to the translator.
    Object,
}

impl HostType {
    /// Wrap in `Nullable` unless already nullable or a reference type.
    pub fn nullable(self) -> HostType {
        match self {
            HostType::Nullable(_)
            | HostType::String
            | HostType::Bytes
            | HostType::Object
            | HostType::Entity(_)
            | HostType::Record(_) => self,
            other => HostType::Nullable(Box::new(other)),
        }
    }

    /// The underlying type with any `Nullable` wrapper removed.
    pub fn non_null(&self) -> &HostType {
        match self {
            HostType::Nullable(inner) => inner.non_null(),
            other => other,
        }
    }

    pub fn is_nullable(&self) -> bool {
        matches!(self, HostType::Nullable(_))
    }

    /// Scalar types that map to a single SQL column.
    pub fn is_primitive(&self) -> bool {
        !matches!(
            self.non_null(),
            HostType::Entity(_)
                | HostType::Record(_)
                | HostType::Sequence(_)
                | HostType::Grouping { .. }
                | HostType::Object
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self.non_null(),
            HostType::Int32 | HostType::Int64 | HostType::Double | HostType::Decimal
        )
    }

    /// The value a `...OrDefault` operator or an empty `Sum`/`Count` yields.
    pub fn default_value(&self) -> Value {
        match self {
            HostType::Bool => Value::Bool(false),
            HostType::Int32 | HostType::Int64 => Value::Int(0),
            HostType::Double | HostType::Decimal => Value::Float(0.0),
            HostType::TimeSpan => Value::TimeSpan(0),
            _ => Value::Null,
        }
    }

    /// Result type of an arithmetic operator over two numeric operands.
    pub fn widen(&self, other: &HostType) -> HostType {
        let rank = |t: &HostType| match t.non_null() {
            HostType::Int32 => 0,
            HostType::Int64 => 1,
            HostType::Decimal => 2,
            HostType::Double => 3,
            _ => 4,
        };
        let (l, r) = (rank(self), rank(other));
        let base = if l >= r { self.non_null() } else { other.non_null() };
        if self.is_nullable() || other.is_nullable() {
            base.clone().nullable()
        } else {
            base.clone()
        }
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostType::Bool => write!(f, "bool"),
            HostType::Int32 => write!(f, "int"),
            HostType::Int64 => write!(f, "long"),
            HostType::Double => write!(f, "double"),
            HostType::Decimal => write!(f, "decimal"),
            HostType::String => write!(f, "string"),
            HostType::DateTime => write!(f, "DateTime"),
            HostType::TimeSpan => write!(f, "TimeSpan"),
            HostType::Guid => write!(f, "Guid"),
            HostType::Bytes => write!(f, "byte[]"),
            HostType::Entity(name) => write!(f, "{name}"),
            HostType::Record(fields) => {
                write!(f, "{{ ")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {ty}")?;
                }
                write!(f, " }}")
            }
            HostType::Sequence(elem) => write!(f, "IEnumerable<{elem}>"),
            HostType::Grouping { key, element } => write!(f, "IGrouping<{key}, {element}>"),
            HostType::Nullable(inner) => write!(f, "{inner}?"),
            HostType::Object => write!(f, "object"),
        }
    }
}

/// A materialized entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity: String,
    pub fields: Vec<(String, Value)>,
}

impl EntityRecord {
    pub fn get(&self, member: &str) -> Option<&Value> {
        self.fields.iter().find(|(m, _)| m == member).map(|(_, v)| v)
    }
}

/// A dynamically typed host value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    DateTime(NaiveDateTime),
    /// Duration in milliseconds.
    TimeSpan(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Record(Vec<(String, Value)>),
    Entity(EntityRecord),
    /// A host-side group produced by the grouping fallback.
    Group { key: Box<Value>, items: Vec<Value> },
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Field lookup on records and entities.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            Value::Entity(e) => e.get(name),
            _ => None,
        }
    }

    pub fn from_duration(d: TimeDelta) -> Value {
        Value::TimeSpan(d.num_milliseconds())
    }

    pub fn as_duration(&self) -> Option<TimeDelta> {
        match self {
            Value::TimeSpan(ms) => Some(TimeDelta::milliseconds(*ms)),
            _ => None,
        }
    }

    /// Best-effort static type of the value.
    pub fn host_type(&self) -> HostType {
        match self {
            Value::Null => HostType::Object,
            Value::Bool(_) => HostType::Bool,
            Value::Int(i) if i32::try_from(*i).is_ok() => HostType::Int32,
            Value::Int(_) => HostType::Int64,
            Value::Float(_) => HostType::Double,
            Value::Text(_) => HostType::String,
            Value::DateTime(_) => HostType::DateTime,
            Value::TimeSpan(_) => HostType::TimeSpan,
            Value::Bytes(_) => HostType::Bytes,
            Value::List(items) => HostType::Sequence(Box::new(
                items.first().map(Value::host_type).unwrap_or(HostType::Object),
            )),
            Value::Record(fields) => HostType::Record(
                fields
                    .iter()
                    .map(|(n, v)| (n.clone(), v.host_type()))
                    .collect(),
            ),
            Value::Entity(e) => HostType::Entity(e.entity.clone()),
            Value::Group { key, items } => HostType::Grouping {
                key: Box::new(key.host_type()),
                element: Box::new(items.first().map(Value::host_type).unwrap_or(HostType::Object)),
            },
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::DateTime(_) => "datetime",
            Value::TimeSpan(_) => "timespan",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Entity(_) => "entity",
            Value::Group { .. } => "group",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<TimeDelta> for Value {
    fn from(v: TimeDelta) -> Self {
        Value::from_duration(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}
