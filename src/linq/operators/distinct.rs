//! `Distinct`: group by every column of the row and select the row.

use crate::error::TranslateError;
use crate::linq::analyzer::{Analyzer, OperatorCall, Pending, Step};
use crate::linq::expr::Expr;
use crate::linq::node::{Node, Seq};

pub fn translate_distinct(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    if matches!(seq.row, Node::Grouping(_) | Node::GroupJoin(_)) {
        return Err(op.unsupported("Distinct over groups"));
    }
    let seq = az.ensure(seq, Pending::Group)?;
    let columns = az.flatten(&seq.row, &Expr::Call(op.call.clone()))?;
    let columns = az.grouping_keys(columns);
    az.discard_ordering(seq.scope, "Distinct");
    let acc = az.ctx.scope_mut(seq.scope);
    acc.group_by = columns;
    acc.distinct = true;
    Ok(Step::Continue(seq))
}
