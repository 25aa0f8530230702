//! `Union`, `Concat` (UNION ALL), `Except` and `Intersect`.
//!
//! The second operand is translated into a sister scope and linked behind
//! the last member of the head's set-operation chain. Members carry a
//! fixed column layout, so their outputs are emitted without
//! de-duplication and checked for equal width. `INTERSECT` binds tighter
//! than the other operators in SQL, so appending it to an existing chain
//! wraps the chain first.

use crate::error::TranslateError;
use crate::linq::analyzer::{Analyzer, ChainMode, OperatorCall, Outcome, Pending, Step};
use crate::linq::chain::ExpressionChain;
use crate::linq::node::Seq;
use crate::linq::sql::{ScopeId, SetOpKind, SetOperation};
use crate::linq::tier::TierSplitter;

pub fn translate_set_operation(
    az: &mut Analyzer<'_>,
    seq: Seq,
    op: &OperatorCall<'_>,
) -> Result<Step, TranslateError> {
    let Some(kind) = SetOpKind::from_method(op.method()) else {
        return Err(op.unsupported("set operation"));
    };
    if seq.row.contains_group() {
        return Err(op.unsupported("set operation over groups"));
    }

    let mut seq = az.ensure(seq, Pending::SetOp)?;
    if kind == SetOpKind::Intersect && az.ctx.scope(seq.scope).is_compound() {
        seq = az.wrap_derived(seq)?;
    }
    az.discard_ordering(seq.scope, kind.to_sql());
    az.ctx.scope_mut(seq.scope).dedup_outputs = false;

    let member = translate_member(az, op)?;
    let tail = chain_tail(az, seq.scope);
    az.ctx.scope_mut(tail).set_op = Some(SetOperation { kind, next: member });
    check_member_width(az, seq.scope, op)?;
    tracing::trace!(
        head = seq.scope,
        member,
        kind = kind.to_sql(),
        "[query_translator] linked set-operation member"
    );
    Ok(Step::Continue(seq))
}

/// Translate the second operand into a sealed sister scope with its
/// outputs emitted.
fn translate_member(az: &mut Analyzer<'_>, op: &OperatorCall<'_>) -> Result<ScopeId, TranslateError> {
    let operand = op.operand(0)?;
    let chain = ExpressionChain::build(operand, false)?;
    az.ctx.new_sister_scope()?;
    let result = member_body(az, &chain, op);
    az.ctx.end_scope();
    result
}

fn member_body(
    az: &mut Analyzer<'_>,
    chain: &ExpressionChain<'_>,
    op: &OperatorCall<'_>,
) -> Result<ScopeId, TranslateError> {
    let mut seq = match az.run_chain(chain, ChainMode::Nested)? {
        Outcome::Sequence(seq) => seq,
        Outcome::Terminal(_) => {
            return Err(op.invalid_shape("set-operation operand is not a sequence"));
        }
    };
    if seq.row.contains_group() {
        return Err(op.unsupported("set operation over groups"));
    }
    // A member with its own limit or chain keeps them inside a derived table.
    {
        let acc = az.ctx.scope(seq.scope);
        if acc.is_limited() || acc.is_compound() {
            seq = az.wrap_derived(seq)?;
        }
    }
    az.discard_ordering(seq.scope, "set-operation member");
    az.ctx.scope_mut(seq.scope).dedup_outputs = false;
    TierSplitter::new(az, seq.scope, true).split(&seq.row)?;
    az.ctx.scope_mut(seq.scope).sealed = true;
    Ok(seq.scope)
}

fn chain_tail(az: &Analyzer<'_>, head: ScopeId) -> ScopeId {
    let mut tail = head;
    while let Some(next) = az.ctx.scope(tail).set_op.as_ref().map(|o| o.next) {
        tail = next;
    }
    tail
}

/// Members after the head must agree with each other; the head's own
/// outputs are emitted at the end of the query and checked then.
fn check_member_width(az: &Analyzer<'_>, head: ScopeId, op: &OperatorCall<'_>) -> Result<(), TranslateError> {
    let mut widths = Vec::new();
    let mut next = az.ctx.scope(head).set_op.as_ref().map(|o| o.next);
    while let Some(id) = next {
        widths.push(az.ctx.scope(id).outputs.len());
        next = az.ctx.scope(id).set_op.as_ref().map(|o| o.next);
    }
    if let Some(first) = widths.first()
        && widths.iter().any(|w| w != first)
    {
        return Err(op.invalid_shape(format!(
            "set-operation members project {first} and {} columns",
            widths.iter().find(|w| *w != first).copied().unwrap_or(0)
        )));
    }
    let head_outputs = az.ctx.scope(head).outputs.len();
    if head_outputs > 0
        && let Some(first) = widths.first()
        && *first != head_outputs
    {
        return Err(op.invalid_shape(format!(
            "set-operation members project {head_outputs} and {first} columns"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::*;
    use crate::error::TranslateError;
    use crate::linq::expr::Expr;
    use crate::value::Value;

    fn titles() -> Expr {
        books().query("Select", vec![lam("b", p("b").member("Title"))])
    }

    fn names() -> Expr {
        authors().query("Select", vec![lam("a", p("a").member("Name"))])
    }

    #[test]
    fn test_union_of_two_projections() {
        let q = titles().query("Union", vec![names()]);
        assert_eq!(
            compile(&q).sql(),
            "SELECT t0.Title AS c0 FROM books t0 UNION SELECT t1.Name AS c0 FROM authors t1"
        );
    }

    #[test]
    fn test_concat_is_union_all() {
        let q = titles().query("Concat", vec![names()]);
        assert!(compile(&q).sql().contains(" UNION ALL SELECT t1.Name"));
    }

    #[test]
    fn test_multi_level_chain() {
        let q = titles()
            .query("Union", vec![names()])
            .query("Except", vec![names()]);
        let sql = compile(&q).sql().to_string();
        assert_eq!(
            sql,
            "SELECT t0.Title AS c0 FROM books t0 UNION SELECT t1.Name AS c0 FROM authors t1 EXCEPT SELECT t2.Name AS c0 FROM authors t2"
        );
    }

    #[test]
    fn test_intersect_after_union_wraps() {
        let q = titles()
            .query("Union", vec![names()])
            .query("Intersect", vec![names()]);
        let sql = compile(&q).sql().to_string();
        assert!(
            sql.starts_with(
                "SELECT t2.c0 AS c0 FROM (SELECT t0.Title AS c0 FROM books t0 UNION SELECT t1.Name AS c0 FROM authors t1) t2 INTERSECT"
            ),
            "{sql}"
        );
    }

    #[test]
    fn test_filter_after_union_wraps() {
        let q = titles()
            .query("Union", vec![names()])
            .query("Where", vec![lam("s", p("s").ne(Expr::constant("x")))]);
        let sql = compile(&q).sql().to_string();
        assert!(sql.ends_with("FROM authors t1) t2 WHERE (t2.c0 <> 'x')"), "{sql}");
    }

    #[test]
    fn test_members_keep_duplicate_columns() {
        let pair = |e: Expr, m: &str| {
            e.query(
                "Select",
                vec![lam("r", Expr::record(vec![("A", p("r").member(m)), ("B", p("r").member(m))]))],
            )
        };
        let q = pair(books(), "Title").query("Union", vec![pair(authors(), "Name")]);
        let compiled = compile(&q);
        assert_eq!(
            compiled.sql(),
            "SELECT t0.Title AS c0, t0.Title AS c1 FROM books t0 UNION SELECT t1.Name AS c0, t1.Name AS c1 FROM authors t1"
        );
        let rows = vec![vec![Value::from("x"), Value::from("x")]];
        let out = compiled.materialize(&rows, &mut session(vec![])).unwrap();
        assert_eq!(
            out,
            Value::List(vec![Value::Record(vec![
                ("A".into(), Value::from("x")),
                ("B".into(), Value::from("x")),
            ])])
        );
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let wide = authors().query(
            "Select",
            vec![lam("a", Expr::record(vec![("N", p("a").member("Name")), ("C", p("a").member("Country"))]))],
        );
        let q = titles().query("Union", vec![wide]);
        assert!(matches!(
            compile_with(&q, &crate::dialect::GenericDialect::ansi()),
            Err(TranslateError::InvalidProjectionShape { .. })
        ));
    }

    #[test]
    fn test_limited_head_wraps() {
        let q = titles()
            .query("Take", vec![Expr::constant(3)])
            .query("Union", vec![names()]);
        let sql = compile(&q).sql().to_string();
        assert!(sql.starts_with("SELECT t1.c0 AS c0 FROM (SELECT t0.Title AS c0 FROM books t0 LIMIT 3) t1 UNION"), "{sql}");
    }
}
