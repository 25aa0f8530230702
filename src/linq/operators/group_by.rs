//! `GroupBy` in its four shapes, projections over groupings and aggregates
//! over a group.
//!
//! A grouping is kept raw until something consumes it. Consuming it through
//! its key or an aggregate emits GROUP BY; a raw grouping that reaches the
//! end of the query is grouped on the host instead.

use crate::error::TranslateError;
use crate::linq::analyzer::{Analyzer, OperatorCall, Pending, Step};
use crate::linq::chain::ExpressionChain;
use crate::linq::expr::Expr;
use crate::linq::node::{GroupingNode, Node, Seq};
use crate::linq::operators::aggregate::build_aggregate;
use crate::linq::sql::{AggFunc, SqlBinaryOp, SqlExpr};

pub fn translate_group_by(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    if matches!(seq.row, Node::Grouping(_) | Node::GroupJoin(_)) {
        return Err(op.unsupported("grouping a grouping"));
    }
    let seq = az.ensure(seq, Pending::Group)?;
    let operands = op.operands();
    let key_selector = op.operand(0)?;
    let key = az.apply_lambda(key_selector, vec![seq.row.clone()])?;
    if key.contains_group() {
        return Err(op.invalid_shape("a group cannot be a grouping key"));
    }

    let (element_selector, result_selector) = match operands {
        [_] => (None, None),
        [_, second] if second.lambda_arity() == 2 => (None, Some(second)),
        [_, second] => (Some(second), None),
        [_, element, result] => (Some(element), Some(result)),
        _ => return Err(op.unsupported("GroupBy overload")),
    };
    let element = match element_selector {
        Some(sel) => az.apply_lambda(sel, vec![seq.row.clone()])?,
        None => seq.row.clone(),
    };
    let grouping = GroupingNode {
        key: Box::new(key),
        element: Box::new(element),
        scope: seq.scope,
        pushed: false,
    };
    let row = match result_selector {
        Some(sel) => select_from_grouping(az, grouping, sel, true)?,
        None => Node::Grouping(grouping),
    };
    Ok(Step::Continue(Seq {
        scope: seq.scope,
        row,
    }))
}

/// Project a grouping. `with_key` selects the `(key, group)` result-selector
/// form. A projection that returns the group itself keeps it raw; anything
/// else consumes it in SQL.
pub fn select_from_grouping(
    az: &mut Analyzer<'_>,
    mut g: GroupingNode,
    lambda: &Expr,
    with_key: bool,
) -> Result<Node, TranslateError> {
    let args = if with_key {
        vec![(*g.key).clone(), Node::Grouping(g.clone())]
    } else {
        vec![Node::Grouping(g.clone())]
    };
    let result = az.apply_lambda(lambda, args)?;
    if let Node::Grouping(inner) = &result
        && !with_key
        && inner == &g
    {
        return Ok(result);
    }
    if result.contains_group() {
        return Err(az.invalid_shape(
            "a group may only be used through its key or aggregates",
            lambda,
        ));
    }
    az.push_grouping(&mut g, lambda)?;
    Ok(result)
}

/// Aggregate over the group bound to a lambda parameter, for example
/// `g.Count()`, `g.Sum(x => x.Price)` or `g.Where(p).Select(s).Max()`.
pub fn translate_group_aggregate(
    az: &mut Analyzer<'_>,
    g: &GroupingNode,
    chain: &ExpressionChain<'_>,
) -> Result<Node, TranslateError> {
    let mut element = (*g.element).clone();
    let mut filter: Option<SqlExpr> = None;
    let mut distinct = false;
    let links = chain.links();
    for (i, link) in links.iter().enumerate() {
        let call = link.call;
        let is_last = i + 1 == links.len();
        let operands = call.operands();
        let source = Expr::Call(call.clone());
        match call.method.as_str() {
            "Where" if !is_last => {
                let lambda = lambda_operand(az, operands, &source)?;
                let pred = predicate_over(az, lambda, &element)?;
                filter = Some(conjoin(filter, pred));
            }
            "Select" if !is_last => {
                let lambda = lambda_operand(az, operands, &source)?;
                element = az.apply_lambda(lambda, vec![element])?;
            }
            "Distinct" if !is_last => distinct = true,
            "AsEnumerable" | "AsQueryable" if !is_last => {}
            "Any" | "All" if is_last => {
                let negate_all = call.method == "All";
                if let Some(sel) = operands.first() {
                    let pred = predicate_over(az, sel, &element)?;
                    let pred = if negate_all {
                        crate::linq::analyzer::negate(pred)
                    } else {
                        pred
                    };
                    filter = Some(conjoin(filter, pred));
                }
                let count = build_aggregate(az, AggFunc::Count, None, false, filter);
                let (op, rhs) = if negate_all {
                    (SqlBinaryOp::Eq, 0)
                } else {
                    (SqlBinaryOp::Gt, 0)
                };
                return Ok(Node::Sql(SqlExpr::binary(op, count, SqlExpr::literal(rhs))));
            }
            method if is_last && AggFunc::from_method(method).is_some() => {
                let Some(func) = AggFunc::from_method(method) else {
                    return Err(az.unsupported(method, &source));
                };
                if let Some(sel) = operands.first() {
                    if func.is_count() {
                        let pred = predicate_over(az, sel, &element)?;
                        filter = Some(conjoin(filter, pred));
                    } else {
                        element = az.apply_lambda(sel, vec![element])?;
                    }
                }
                let arg = if func.is_count() && !distinct {
                    None
                } else {
                    Some(az.scalar(element, &source)?)
                };
                return Ok(Node::Sql(build_aggregate(az, func, arg, distinct, filter)));
            }
            other => return Err(az.unsupported(&format!("{other} over a group"), &source)),
        }
    }
    Err(az.unsupported("group used as a sequence without an aggregate", chain.root()))
}

fn lambda_operand<'e>(az: &Analyzer<'_>, operands: &'e [Expr], source: &Expr) -> Result<&'e Expr, TranslateError> {
    operands
        .first()
        .ok_or_else(|| az.invalid_shape("group operator without a lambda", source))
}

fn predicate_over(az: &mut Analyzer<'_>, lambda: &Expr, element: &Node) -> Result<SqlExpr, TranslateError> {
    let node = az.apply_lambda(lambda, vec![element.clone()])?;
    az.predicate(node, lambda)
}

fn conjoin(existing: Option<SqlExpr>, pred: SqlExpr) -> SqlExpr {
    match existing {
        Some(e) => SqlExpr::and(e, pred),
        None => pred,
    }
}
