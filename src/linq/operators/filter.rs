//! `Where`: WHERE on plain sequences, HAVING on groupings.

use crate::error::TranslateError;
use crate::linq::analyzer::{Analyzer, OperatorCall, Pending, Step};
use crate::linq::expr::Expr;
use crate::linq::node::{Node, Seq};
use crate::linq::tier::first_unsupported_function;

pub fn translate_where(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    let lambda = op.operand(0)?;
    if lambda.lambda_arity() != 1 {
        return Err(op.unsupported("indexed Where"));
    }
    Ok(Step::Continue(apply_where(az, seq, lambda)?))
}

/// Add the lambda's predicate to the sequence's scope. Used by `Where` and
/// by the predicate overloads of `Count`, `Any`, `First` and friends.
pub fn apply_where(az: &mut Analyzer<'_>, seq: Seq, lambda: &Expr) -> Result<Seq, TranslateError> {
    match seq.row {
        Node::Grouping(mut g) => {
            let node = az.apply_lambda(lambda, vec![Node::Grouping(g.clone())])?;
            let pred = az.predicate(node, lambda)?;
            require_sql(az, &pred, lambda)?;
            az.push_grouping(&mut g, lambda)?;
            az.ctx.scope_mut(g.scope).add_having(pred);
            Ok(Seq {
                scope: seq.scope,
                row: Node::Grouping(g),
            })
        }
        Node::GroupJoin(_) => Err(az.unsupported("Where over a group-join group", lambda)),
        row => {
            let seq = az.ensure(Seq { scope: seq.scope, row }, Pending::Filter)?;
            let node = az.apply_lambda(lambda, vec![seq.row.clone()])?;
            let pred = az.predicate(node, lambda)?;
            require_sql(az, &pred, lambda)?;
            az.ctx.scope_mut(seq.scope).add_predicate(pred);
            Ok(seq)
        }
    }
}

/// Predicates and keys must be evaluable by the database.
pub fn require_sql(
    az: &Analyzer<'_>,
    expr: &crate::linq::sql::SqlExpr,
    source: &Expr,
) -> Result<(), TranslateError> {
    match first_unsupported_function(expr, az.dialect()) {
        Some(func) => Err(az.unsupported(
            &format!("{} in a {} predicate", func.name(), az.dialect().name()),
            source,
        )),
        None => Ok(()),
    }
}
