//! Row materialization.
//!
//! A [`ReadPlan`] describes how one host value is rebuilt from one result
//! row: which slots to read, which converter to apply, and which parts are
//! host constants, captured values or host-evaluated functions. The plan is
//! built once per compiled query and evaluated for every row.

use std::collections::HashMap;

use chrono::{Datelike, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::TranslateError;
use crate::linq::sql::{DatePart, SqlFunction};
use crate::schema::ValueConverter;
use crate::value::{EntityRecord, Value};

/// Execution-time services a materializer may need.
pub trait Session {
    /// Runtime value of an external value, by index.
    fn external_value(&self, index: usize) -> Option<&Value>;

    /// Hand a freshly read entity to the session. The returned record is
    /// what the query yields; a tracking session returns the instance it
    /// already holds for the same key.
    fn attach(&mut self, identity: &str, entity: EntityRecord) -> EntityRecord {
        let _ = identity;
        entity
    }
}

/// A [`Session`] over a fixed set of external values, with an optional
/// identity map.
#[derive(Debug, Clone, Default)]
pub struct ExecutionSession {
    values: Vec<Value>,
    identity_map: Option<HashMap<String, EntityRecord>>,
}

impl ExecutionSession {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            identity_map: None,
        }
    }

    /// Resolve entities with the same key to one instance.
    pub fn tracking(mut self) -> Self {
        self.identity_map = Some(HashMap::new());
        self
    }

    pub fn tracked_count(&self) -> usize {
        self.identity_map.as_ref().map_or(0, HashMap::len)
    }
}

impl Session for ExecutionSession {
    fn external_value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    fn attach(&mut self, identity: &str, entity: EntityRecord) -> EntityRecord {
        match &mut self.identity_map {
            Some(map) => map
                .entry(identity.to_string())
                .or_insert(entity)
                .clone(),
            None => entity,
        }
    }
}

/// One entity column read by an [`EntityReader`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySlot {
    pub member: String,
    pub index: usize,
    pub alias: String,
    pub converter: ValueConverter,
}

/// Reads a whole entity from consecutive slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReader {
    pub entity: String,
    pub slots: Vec<EntitySlot>,
    /// Positions in `slots` of the key members.
    pub key_slots: Vec<usize>,
    /// Read through a left-outer join: a row whose key is all NULL yields
    /// `Value::Null`.
    pub nullable: bool,
}

impl EntityReader {
    pub fn read(
        &self,
        row: &[Value],
        row_index: usize,
        session: &mut dyn Session,
    ) -> Result<Value, TranslateError> {
        if self.nullable
            && !self.key_slots.is_empty()
            && self
                .key_slots
                .iter()
                .all(|&k| row.get(self.slots[k].index).is_none_or(Value::is_null))
        {
            return Ok(Value::Null);
        }
        let mut fields = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let raw = slot_value(row, row_index, slot.index, &slot.alias)?;
            let value = slot.converter.to_host(raw).map_err(|message| TranslateError::Conversion {
                row: row_index,
                column: slot.alias.clone(),
                message,
            })?;
            fields.push((slot.member.clone(), value));
        }
        let key: Vec<&Value> = self.key_slots.iter().map(|&k| &fields[k].1).collect();
        let identity = format!(
            "{}#{}",
            self.entity,
            serde_json::to_string(&key).unwrap_or_default()
        );
        let record = EntityRecord {
            entity: self.entity.clone(),
            fields,
        };
        Ok(Value::Entity(session.attach(&identity, record)))
    }
}

/// How to rebuild one host value from a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReadPlan {
    Slot {
        index: usize,
        column: String,
        converter: ValueConverter,
    },
    Entity(EntityReader),
    Record(Vec<(String, ReadPlan)>),
    Constant(Value),
    /// A captured host value, read from the session.
    External(usize),
    /// A function the dialect cannot evaluate, computed after reading its
    /// arguments.
    HostFunction {
        func: SqlFunction,
        args: Vec<ReadPlan>,
    },
    /// Group key and element, for host-side grouping.
    Pair(Box<ReadPlan>, Box<ReadPlan>),
}

impl ReadPlan {
    pub fn read(
        &self,
        row: &[Value],
        row_index: usize,
        session: &mut dyn Session,
    ) -> Result<Value, TranslateError> {
        match self {
            ReadPlan::Slot {
                index,
                column,
                converter,
            } => {
                let raw = slot_value(row, row_index, *index, column)?;
                converter.to_host(raw).map_err(|message| TranslateError::Conversion {
                    row: row_index,
                    column: column.clone(),
                    message,
                })
            }
            ReadPlan::Entity(reader) => reader.read(row, row_index, session),
            ReadPlan::Record(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (name, plan) in fields {
                    out.push((name.clone(), plan.read(row, row_index, session)?));
                }
                Ok(Value::Record(out))
            }
            ReadPlan::Constant(v) => Ok(v.clone()),
            ReadPlan::External(index) => session
                .external_value(*index)
                .cloned()
                .ok_or_else(|| TranslateError::UnboundParameter(format!("external value {index}"))),
            ReadPlan::HostFunction { func, args } => {
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(a.read(row, row_index, session)?);
                }
                eval_host_function(*func, &values).map_err(|message| TranslateError::Conversion {
                    row: row_index,
                    column: func.name().to_string(),
                    message,
                })
            }
            ReadPlan::Pair(key, element) => Ok(Value::List(vec![
                key.read(row, row_index, session)?,
                element.read(row, row_index, session)?,
            ])),
        }
    }
}

/// Root materializer of a compiled query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Materializer {
    /// The query returns whole entities.
    Entity(EntityReader),
    Rows(ReadPlan),
}

impl Materializer {
    pub fn read(
        &self,
        row: &[Value],
        row_index: usize,
        session: &mut dyn Session,
    ) -> Result<Value, TranslateError> {
        match self {
            Materializer::Entity(reader) => reader.read(row, row_index, session),
            Materializer::Rows(plan) => plan.read(row, row_index, session),
        }
    }
}

fn slot_value(row: &[Value], row_index: usize, index: usize, column: &str) -> Result<Value, TranslateError> {
    row.get(index).cloned().ok_or_else(|| TranslateError::Conversion {
        row: row_index,
        column: column.to_string(),
        message: format!("row has {} columns, slot {index} requested", row.len()),
    })
}

/// Evaluate a SQL function on host values. NULL arguments yield NULL
/// except for `COALESCE`.
pub fn eval_host_function(func: SqlFunction, args: &[Value]) -> Result<Value, String> {
    if func == SqlFunction::Coalesce {
        return Ok(args.iter().find(|v| !v.is_null()).cloned().unwrap_or(Value::Null));
    }
    if args.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }
    let text = |i: usize| -> Result<&str, String> {
        args.get(i)
            .and_then(Value::as_str)
            .ok_or_else(|| format!("{} expects text argument {i}", func.name()))
    };
    let int = |i: usize| -> Result<i64, String> {
        args.get(i)
            .and_then(Value::as_i64)
            .ok_or_else(|| format!("{} expects integer argument {i}", func.name()))
    };
    let float = |i: usize| -> Result<f64, String> {
        args.get(i)
            .and_then(Value::as_f64)
            .ok_or_else(|| format!("{} expects numeric argument {i}", func.name()))
    };
    let numeric = |f: fn(f64) -> f64| -> Result<Value, String> {
        match args.first() {
            Some(Value::Int(i)) => Ok(Value::Int(f(*i as f64) as i64)),
            _ => Ok(Value::Float(f(float(0)?))),
        }
    };
    match func {
        SqlFunction::Upper => Ok(Value::Text(text(0)?.to_uppercase())),
        SqlFunction::Lower => Ok(Value::Text(text(0)?.to_lowercase())),
        SqlFunction::Trim => Ok(Value::Text(text(0)?.trim().to_string())),
        SqlFunction::Length => Ok(Value::Int(text(0)?.chars().count() as i64)),
        SqlFunction::Substring => {
            let s = text(0)?;
            let start = usize::try_from(int(1)?.max(1) - 1).unwrap_or(0);
            let chars = s.chars().skip(start);
            let out: String = if args.len() > 2 {
                chars.take(usize::try_from(int(2)?).unwrap_or(0)).collect()
            } else {
                chars.collect()
            };
            Ok(Value::Text(out))
        }
        SqlFunction::Replace => Ok(Value::Text(text(0)?.replace(text(1)?, text(2)?))),
        SqlFunction::Concat => {
            let mut out = String::new();
            for i in 0..args.len() {
                out.push_str(text(i)?);
            }
            Ok(Value::Text(out))
        }
        SqlFunction::Abs => numeric(f64::abs),
        SqlFunction::Round => numeric(f64::round),
        SqlFunction::Floor => numeric(f64::floor),
        SqlFunction::Ceiling => numeric(f64::ceil),
        SqlFunction::Sqrt => Ok(Value::Float(float(0)?.sqrt())),
        SqlFunction::Power => Ok(Value::Float(float(0)?.powf(float(1)?))),
        SqlFunction::DatePart(part) => {
            let Some(Value::DateTime(dt)) = args.first() else {
                return Err(format!("{} expects a timestamp", func.name()));
            };
            Ok(match part {
                DatePart::Year => Value::Int(i64::from(dt.year())),
                DatePart::Month => Value::Int(i64::from(dt.month())),
                DatePart::Day => Value::Int(i64::from(dt.day())),
                DatePart::Hour => Value::Int(i64::from(dt.hour())),
                DatePart::Minute => Value::Int(i64::from(dt.minute())),
                DatePart::Second => Value::Int(i64::from(dt.second())),
                DatePart::Millisecond => Value::Int(i64::from(dt.and_utc().timestamp_subsec_millis())),
                DatePart::DayOfWeek => Value::Int(i64::from(dt.weekday().num_days_from_sunday())),
                DatePart::DayOfYear => Value::Int(i64::from(dt.ordinal())),
                DatePart::Date => Value::DateTime(dt.date().and_time(chrono::NaiveTime::MIN)),
            })
        }
        SqlFunction::DateDiffMs => match (args.first(), args.get(1)) {
            (Some(Value::DateTime(a)), Some(Value::DateTime(b))) => {
                let delta: TimeDelta = *b - *a;
                Ok(Value::TimeSpan(delta.num_milliseconds()))
            }
            _ => Err(format!("{} expects two timestamps", func.name())),
        },
        SqlFunction::Coalesce => Ok(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn reader(nullable: bool) -> EntityReader {
        EntityReader {
            entity: "Author".into(),
            slots: vec![
                EntitySlot {
                    member: "Id".into(),
                    index: 0,
                    alias: "c0".into(),
                    converter: ValueConverter::Identity,
                },
                EntitySlot {
                    member: "Name".into(),
                    index: 1,
                    alias: "c1".into(),
                    converter: ValueConverter::Identity,
                },
            ],
            key_slots: vec![0],
            nullable,
        }
    }

    #[test]
    fn test_entity_reader_reads_fields() {
        let mut session = ExecutionSession::default();
        let row = vec![Value::Int(7), Value::from("Ann")];
        let v = reader(false).read(&row, 0, &mut session).unwrap();
        let Value::Entity(rec) = v else {
            panic!("expected entity");
        };
        assert_eq!(rec.get("Name"), Some(&Value::from("Ann")));
    }

    #[test]
    fn test_nullable_entity_with_null_key() {
        let mut session = ExecutionSession::default();
        let row = vec![Value::Null, Value::Null];
        assert_eq!(reader(true).read(&row, 0, &mut session).unwrap(), Value::Null);
    }

    #[test]
    fn test_identity_map_returns_first_instance() {
        let mut session = ExecutionSession::default().tracking();
        let r = reader(false);
        let a = r.read(&[Value::Int(1), Value::from("Ann")], 0, &mut session).unwrap();
        let b = r.read(&[Value::Int(1), Value::from("Changed")], 1, &mut session).unwrap();
        assert_eq!(a, b);
        assert_eq!(session.tracked_count(), 1);
    }

    #[test]
    fn test_slot_conversion_error_reports_position() {
        let plan = ReadPlan::Slot {
            index: 0,
            column: "c0".into(),
            converter: ValueConverter::BoolFromInt,
        };
        let mut session = ExecutionSession::default();
        let err = plan.read(&[Value::from("x")], 3, &mut session).unwrap_err();
        match err {
            TranslateError::Conversion { row, column, .. } => {
                assert_eq!(row, 3);
                assert_eq!(column, "c0");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_slot_is_conversion_error() {
        let plan = ReadPlan::Slot {
            index: 4,
            column: "c4".into(),
            converter: ValueConverter::Identity,
        };
        let mut session = ExecutionSession::default();
        assert!(plan.read(&[Value::Int(1)], 0, &mut session).unwrap_err().is_materialization_error());
    }

    #[test]
    fn test_external_read_from_session() {
        let mut session = ExecutionSession::new(vec![Value::Int(5)]);
        assert_eq!(ReadPlan::External(0).read(&[], 0, &mut session).unwrap(), Value::Int(5));
        assert!(ReadPlan::External(1).read(&[], 0, &mut session).is_err());
    }

    #[test]
    fn test_host_functions() {
        assert_eq!(
            eval_host_function(SqlFunction::Sqrt, &[Value::Float(9.0)]),
            Ok(Value::Float(3.0))
        );
        assert_eq!(
            eval_host_function(SqlFunction::Substring, &[Value::from("hello"), Value::Int(2), Value::Int(3)]),
            Ok(Value::from("ell"))
        );
        assert_eq!(
            eval_host_function(SqlFunction::Upper, &[Value::Null]),
            Ok(Value::Null)
        );
        assert_eq!(
            eval_host_function(SqlFunction::Coalesce, &[Value::Null, Value::Int(2)]),
            Ok(Value::Int(2))
        );
        let dt = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(
            eval_host_function(SqlFunction::DatePart(DatePart::DayOfYear), &[Value::DateTime(dt)]),
            Ok(Value::Int(61))
        );
    }
}
