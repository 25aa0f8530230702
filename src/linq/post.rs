//! Host-side post-processing of materialized rows.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::TranslateError;
use crate::hash;
use crate::value::Value;

/// Row-count contract of a `First`/`Single`/`Last` family operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
    Last,
    LastOrDefault,
}

impl Cardinality {
    pub fn from_method(method: &str) -> Option<Cardinality> {
        Some(match method {
            "First" => Cardinality::First,
            "FirstOrDefault" => Cardinality::FirstOrDefault,
            "Single" => Cardinality::Single,
            "SingleOrDefault" => Cardinality::SingleOrDefault,
            "Last" => Cardinality::Last,
            "LastOrDefault" => Cardinality::LastOrDefault,
            _ => return None,
        })
    }

    pub fn method(self) -> &'static str {
        match self {
            Cardinality::First => "First",
            Cardinality::FirstOrDefault => "FirstOrDefault",
            Cardinality::Single => "Single",
            Cardinality::SingleOrDefault => "SingleOrDefault",
            Cardinality::Last => "Last",
            Cardinality::LastOrDefault => "LastOrDefault",
        }
    }

    pub fn or_default(self) -> bool {
        matches!(
            self,
            Cardinality::FirstOrDefault | Cardinality::SingleOrDefault | Cardinality::LastOrDefault
        )
    }

    pub fn is_single(self) -> bool {
        matches!(self, Cardinality::Single | Cardinality::SingleOrDefault)
    }

    pub fn is_last(self) -> bool {
        matches!(self, Cardinality::Last | Cardinality::LastOrDefault)
    }
}

/// What happens to the materialized rows before they reach the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PostProcess {
    /// The rows are the result.
    Rows,
    /// Exactly one row carrying a scalar; no row yields `default`.
    Scalar { default: Value },
    Cardinality { kind: Cardinality, default: Value },
    /// Rows are `[key, element]` pairs grouped in first-appearance order of
    /// their key.
    HostGrouping,
}

impl PostProcess {
    pub fn apply(&self, rows: Vec<Value>) -> Result<Value, TranslateError> {
        match self {
            PostProcess::Rows => Ok(Value::List(rows)),
            PostProcess::Scalar { default } => Ok(match rows.into_iter().next() {
                Some(Value::Null) | None => default.clone(),
                Some(v) => v,
            }),
            PostProcess::Cardinality { kind, default } => apply_cardinality(*kind, default, rows),
            PostProcess::HostGrouping => group_rows(rows),
        }
    }
}

fn apply_cardinality(kind: Cardinality, default: &Value, rows: Vec<Value>) -> Result<Value, TranslateError> {
    let violation = |message: &str| TranslateError::CardinalityViolation {
        operator: kind.method().to_string(),
        message: message.to_string(),
    };
    if kind.is_single() && rows.len() > 1 {
        return Err(violation("sequence contains more than one element"));
    }
    let picked = if kind.is_last() {
        rows.into_iter().next_back()
    } else {
        rows.into_iter().next()
    };
    match picked {
        Some(v) => Ok(v),
        None if kind.or_default() => Ok(default.clone()),
        None => Err(violation("sequence contains no elements")),
    }
}

/// Group key/element pairs in first-appearance order of the keys.
fn group_rows(rows: Vec<Value>) -> Result<Value, TranslateError> {
    let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
    // Key fingerprint to the groups carrying it; equal fingerprints are
    // still compared by value.
    let mut index: HashMap<u64, Vec<usize>> = HashMap::new();
    for row in rows {
        let Value::List(mut pair) = row else {
            return Err(TranslateError::InternalError(
                "host grouping expects key/element pairs".into(),
            ));
        };
        if pair.len() != 2 {
            return Err(TranslateError::InternalError(
                "host grouping expects key/element pairs".into(),
            ));
        }
        let element = pair.pop().unwrap_or(Value::Null);
        let key = pair.pop().unwrap_or(Value::Null);
        let bucket = index.entry(hash::fingerprint(&key)?).or_default();
        match bucket.iter().copied().find(|&g| groups[g].0 == key) {
            Some(g) => groups[g].1.push(element),
            None => {
                bucket.push(groups.len());
                groups.push((key, vec![element]));
            }
        }
    }
    Ok(Value::List(
        groups
            .into_iter()
            .map(|(key, items)| Value::Group {
                key: Box::new(key),
                items,
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_takes_first_row() {
        let post = PostProcess::Cardinality {
            kind: Cardinality::First,
            default: Value::Null,
        };
        assert_eq!(post.apply(vec![Value::Int(1), Value::Int(2)]).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_first_on_empty_fails() {
        let post = PostProcess::Cardinality {
            kind: Cardinality::First,
            default: Value::Null,
        };
        let err = post.apply(vec![]).unwrap_err();
        assert_eq!(err.to_string(), "First: sequence contains no elements");
    }

    #[test]
    fn test_or_default_on_empty() {
        let post = PostProcess::Cardinality {
            kind: Cardinality::SingleOrDefault,
            default: Value::Int(0),
        };
        assert_eq!(post.apply(vec![]).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_single_with_two_rows_fails() {
        let post = PostProcess::Cardinality {
            kind: Cardinality::SingleOrDefault,
            default: Value::Null,
        };
        let err = post.apply(vec![Value::Int(1), Value::Int(2)]).unwrap_err();
        assert!(matches!(err, TranslateError::CardinalityViolation { .. }));
        assert!(err.to_string().contains("more than one element"));
    }

    #[test]
    fn test_last_takes_last_row() {
        let post = PostProcess::Cardinality {
            kind: Cardinality::Last,
            default: Value::Null,
        };
        assert_eq!(post.apply(vec![Value::Int(1), Value::Int(2)]).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_scalar_default_on_null() {
        let post = PostProcess::Scalar {
            default: Value::Int(0),
        };
        assert_eq!(post.apply(vec![Value::Null]).unwrap(), Value::Int(0));
        assert_eq!(post.apply(vec![Value::Int(4)]).unwrap(), Value::Int(4));
    }

    #[test]
    fn test_host_grouping_keeps_first_appearance_order() {
        let row = |k: i32, v: i32| Value::List(vec![Value::from(k), Value::from(v)]);
        let out = PostProcess::HostGrouping
            .apply(vec![row(2, 1), row(1, 2), row(2, 3)])
            .unwrap();
        let Value::List(groups) = out else {
            panic!("expected list");
        };
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[0],
            Value::Group {
                key: Box::new(Value::Int(2)),
                items: vec![Value::Int(1), Value::Int(3)],
            }
        );
    }

    #[test]
    fn test_host_grouping_many_keys() {
        let rows: Vec<Value> = (0..3000)
            .map(|i: i32| Value::List(vec![Value::from((i * 7) % 1000), Value::from(i)]))
            .collect();
        let Value::List(groups) = PostProcess::HostGrouping.apply(rows).unwrap() else {
            panic!("expected list");
        };
        assert_eq!(groups.len(), 1000);
        let keys: Vec<Value> = groups
            .iter()
            .take(3)
            .map(|g| match g {
                Value::Group { key, items } => {
                    assert_eq!(items.len(), 3);
                    (**key).clone()
                }
                other => panic!("expected group, got {other:?}"),
            })
            .collect();
        assert_eq!(keys, vec![Value::Int(0), Value::Int(7), Value::Int(14)]);
    }

    #[test]
    fn test_host_grouping_composite_keys() {
        let row = |a: i32, b: &str, v: i32| {
            Value::List(vec![Value::List(vec![Value::from(a), Value::from(b)]), Value::from(v)])
        };
        let Value::List(groups) = PostProcess::HostGrouping
            .apply(vec![row(1, "x", 1), row(1, "y", 2), row(1, "x", 3)])
            .unwrap()
        else {
            panic!("expected list");
        };
        assert_eq!(groups.len(), 2);
        let Value::Group { items, .. } = &groups[0] else {
            panic!("expected group");
        };
        assert_eq!(items, &vec![Value::Int(1), Value::Int(3)]);
    }
}
