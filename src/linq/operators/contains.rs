//! `Contains` against a subquery or a host collection.
//!
//! Subquery form: `IN (SELECT ...)`. Host collections inline their values
//! as `IN (...)` literals, an empty collection is always false, and a
//! collection that is captured or longer than `max_in_list_literals`
//! travels as one array parameter.

use crate::error::TranslateError;
use crate::linq::analyzer::{Analyzer, ChainMode, OperatorCall, Step, Terminal};
use crate::linq::context::ValueTransform;
use crate::linq::expr::Expr;
use crate::linq::node::{Node, Seq};
use crate::linq::post::PostProcess;
use crate::linq::sql::{InList, ScopeKind, SqlExpr};
use crate::linq::tier::value_expr;
use crate::schema::ValueConverter;
use crate::value::{HostType, Value};

pub fn translate_contains(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    let value_expr_src = op.operand(0)?;
    let source = Expr::Call(op.call.clone());
    let column = match &seq.row {
        Node::Grouping(_) | Node::GroupJoin(_) => return Err(op.unsupported("Contains over groups")),
        row => {
            let mut keys = az.key_operands(row, &source)?;
            if keys.len() != 1 {
                return Err(op.invalid_shape("Contains needs a single-column sequence"));
            }
            keys.remove(0)
        }
    };

    let (body, scope) = match op.mode {
        ChainMode::Root => {
            let outer = az.ctx.new_parent_scope(seq.scope, ScopeKind::Subquery)?;
            (seq.scope, outer)
        }
        ChainMode::Nested => {
            let parent = az.ctx.scope(seq.scope).parent.ok_or_else(|| {
                TranslateError::InternalError("nested Contains without an enclosing scope".into())
            })?;
            (seq.scope, parent)
        }
    };

    // The probed value belongs to the enclosing query.
    az.ctx.enter_scope(scope);
    let probe = az
        .translate(value_expr_src)
        .and_then(|node| az.key_operands(&node, value_expr_src));
    az.ctx.end_scope();
    let mut probe = probe?;
    if probe.len() != 1 {
        return Err(op.invalid_shape("Contains needs a single-column value"));
    }
    let probe = probe.remove(0);

    let (output, _) = value_expr(column, az.dialect());
    az.discard_outputs(body);
    az.ctx.scope_mut(body).add_output(output);
    if !az.ctx.scope(body).is_limited() {
        az.discard_ordering(body, "Contains");
    }
    let scope = match op.mode {
        ChainMode::Root => scope,
        ChainMode::Nested => body,
    };
    Ok(Step::Done(Terminal {
        node: Node::Sql(SqlExpr::In {
            operand: Box::new(probe),
            list: InList::Subquery(body),
        }),
        scope,
        post: PostProcess::Scalar {
            default: Value::Bool(false),
        },
    }))
}

/// `collection.Contains(value)` where the collection is a host value.
pub fn translate_host_contains(
    az: &mut Analyzer<'_>,
    collection: &Expr,
    value: &Expr,
    expr: &Expr,
) -> Result<Node, TranslateError> {
    let node = az.translate(value)?;
    let operand = az.scalar(node, value)?;
    let converter = match &operand {
        SqlExpr::Column(c) if c.converter != ValueConverter::Identity => Some(c.converter),
        _ => None,
    };

    if let Expr::Constant(Value::List(items)) = collection {
        if items.is_empty() {
            return Ok(Node::Sql(SqlExpr::false_predicate()));
        }
        let limit = az.config().max_in_list_literals;
        if items.len() <= limit || !az.dialect().capabilities().array_parameters {
            if items.len() > limit {
                tracing::warn!(
                    items = items.len(),
                    limit,
                    dialect = az.dialect().name(),
                    "[query_translator] inlining long IN list: dialect has no array parameters"
                );
            }
            let values = items
                .iter()
                .cloned()
                .map(|v| match converter {
                    Some(c) => c.to_db(v),
                    None => v,
                })
                .collect();
            return Ok(Node::Sql(SqlExpr::In {
                operand: Box::new(operand),
                list: InList::Values(values),
            }));
        }
    } else if !az.dialect().capabilities().array_parameters {
        return Err(az.unsupported(
            &format!("Contains over a captured collection in {}", az.dialect().name()),
            expr,
        ));
    }

    let ty = HostType::Sequence(Box::new(operand.ty()));
    let transform = converter.map(ValueTransform::ElementConverter);
    let index = az.ctx.register_external(collection, ty, transform);
    tracing::trace!(index, "[query_translator] host collection bound as array parameter");
    Ok(Node::Sql(SqlExpr::In {
        operand: Box::new(operand),
        list: InList::External(index),
    }))
}
