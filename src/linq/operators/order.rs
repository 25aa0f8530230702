//! Ordering and row limits: `OrderBy`/`ThenBy` (and descending), `Take`,
//! `Skip`.
//!
//! `OrderBy` places its keys ahead of any existing keys; `ThenBy` appends.
//! Consecutive literal `Take`s keep the smaller count and consecutive
//! literal `Skip`s add up; every other combination that SQL cannot express
//! in one SELECT wraps the scope first.

use crate::error::TranslateError;
use crate::linq::analyzer::{Analyzer, OperatorCall, Pending, Step};
use crate::linq::node::{Node, Seq};
use crate::linq::operators::filter::require_sql;
use crate::linq::sql::{OrderKey, SqlExpr};
use crate::value::Value;

pub fn translate_order_by(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    let method = op.method();
    let descending = method.ends_with("Descending");
    let then = method.starts_with("ThenBy");
    let lambda = op.operand(0)?;

    let (scope, row, keys) = match seq.row {
        Node::Grouping(mut g) => {
            let key = az.apply_lambda(lambda, vec![Node::Grouping(g.clone())])?;
            if key.contains_aggregate() {
                az.push_grouping(&mut g, lambda)?;
            }
            let keys = az.key_operands(&key, lambda)?;
            (seq.scope, Node::Grouping(g), keys)
        }
        Node::GroupJoin(_) => return Err(op.unsupported("ordering a group-join group")),
        row => {
            let seq = az.ensure(Seq { scope: seq.scope, row }, Pending::Order)?;
            let key = az.apply_lambda(lambda, vec![seq.row.clone()])?;
            if key.contains_group() {
                return Err(op.invalid_shape("a group cannot be an ordering key"));
            }
            let keys = az.key_operands(&key, lambda)?;
            (seq.scope, seq.row, keys)
        }
    };
    for k in &keys {
        require_sql(az, k, lambda)?;
    }

    let new_keys = keys.into_iter().map(|expr| OrderKey { expr, descending });
    let order_by = &mut az.ctx.scope_mut(scope).order_by;
    if then {
        order_by.extend(new_keys);
    } else {
        let existing = std::mem::take(order_by);
        order_by.extend(new_keys);
        order_by.extend(existing);
    }
    Ok(Step::Continue(Seq { scope, row }))
}

pub fn translate_take(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    if matches!(seq.row, Node::Grouping(_) | Node::GroupJoin(_)) {
        return Err(op.unsupported("Take over groups"));
    }
    let count = count_operand(az, op)?;
    Ok(Step::Continue(apply_take(az, seq, count)?))
}

pub fn translate_skip(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    if matches!(seq.row, Node::Grouping(_) | Node::GroupJoin(_)) {
        return Err(op.unsupported("Skip over groups"));
    }
    let count = count_operand(az, op)?;
    let mut seq = seq;
    let needs_wrap = {
        let acc = az.ctx.scope(seq.scope);
        acc.is_compound()
            || acc.limit.is_some()
            || (acc.offset.is_some() && !both_literal(acc.offset.as_ref(), &count))
    };
    if needs_wrap {
        seq = az.wrap_derived(seq)?;
    }
    let acc = az.ctx.scope_mut(seq.scope);
    let merged = acc
        .offset
        .take()
        .as_ref()
        .and_then(literal_int)
        .zip(literal_int(&count));
    acc.offset = Some(match merged {
        Some((a, b)) => SqlExpr::literal(a + b),
        None => count,
    });
    Ok(Step::Continue(seq))
}

/// Limit the sequence to `count` rows, composing with an existing limit.
pub fn apply_take(az: &mut Analyzer<'_>, seq: Seq, count: SqlExpr) -> Result<Seq, TranslateError> {
    let mut seq = seq;
    let needs_wrap = {
        let acc = az.ctx.scope(seq.scope);
        acc.is_compound() || (acc.limit.is_some() && !both_literal(acc.limit.as_ref(), &count))
    };
    if needs_wrap {
        seq = az.wrap_derived(seq)?;
    }
    let acc = az.ctx.scope_mut(seq.scope);
    let merged = acc
        .limit
        .take()
        .as_ref()
        .and_then(literal_int)
        .zip(literal_int(&count));
    acc.limit = Some(match merged {
        Some((a, b)) => SqlExpr::literal(a.min(b)),
        None => count,
    });
    Ok(seq)
}

fn both_literal(existing: Option<&SqlExpr>, count: &SqlExpr) -> bool {
    existing.and_then(literal_int).is_some() && literal_int(count).is_some()
}

fn count_operand(az: &mut Analyzer<'_>, op: &OperatorCall<'_>) -> Result<SqlExpr, TranslateError> {
    let operand = op.operand(0)?;
    if !operand.is_host_evaluable() {
        return Err(op.unsupported("row count must not depend on the row"));
    }
    let node = az.translate(operand)?;
    az.scalar(node, operand)
}

fn literal_int(e: &SqlExpr) -> Option<i64> {
    match e {
        SqlExpr::Literal {
            value: Value::Int(n),
            ..
        } => Some(*n),
        _ => None,
    }
}
