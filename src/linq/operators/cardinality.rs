//! `First`, `Single`, `Last` and their `OrDefault` forms.
//!
//! The row-count contract is checked on the host after materialization;
//! SQL only limits how many rows come back. `Single` reads two rows when
//! `single_row_probe` is on so that a second match can be reported.

use crate::error::TranslateError;
use crate::linq::analyzer::{Analyzer, ChainMode, OperatorCall, Step, Terminal};
use crate::linq::node::{Node, Seq};
use crate::linq::operators::filter::apply_where;
use crate::linq::operators::order::apply_take;
use crate::linq::post::{Cardinality, PostProcess};
use crate::linq::sql::SqlExpr;
use crate::linq::tier::value_expr;
use crate::value::Value;

pub fn translate_cardinality(
    az: &mut Analyzer<'_>,
    seq: Seq,
    op: &OperatorCall<'_>,
) -> Result<Step, TranslateError> {
    let Some(kind) = Cardinality::from_method(op.method()) else {
        return Err(op.unsupported("cardinality operator"));
    };
    if matches!(seq.row, Node::Grouping(_) | Node::GroupJoin(_)) {
        return Err(op.unsupported("taking one group"));
    }
    let seq = match op.operands().first() {
        Some(pred) => apply_where(az, seq, pred)?,
        None => seq,
    };
    match op.mode {
        ChainMode::Root => root_cardinality(az, seq, kind),
        ChainMode::Nested => nested_cardinality(az, seq, op, kind),
    }
}

fn root_cardinality(az: &mut Analyzer<'_>, seq: Seq, kind: Cardinality) -> Result<Step, TranslateError> {
    let probe = if kind.is_last() {
        None
    } else if kind.is_single() {
        az.config().single_row_probe.then_some(2)
    } else {
        Some(1)
    };
    let seq = match probe {
        Some(n) => apply_take(az, seq, SqlExpr::literal(n))?,
        None => seq,
    };
    let default = match &seq.row {
        Node::Sql(e) => e.ty().default_value(),
        _ => Value::Null,
    };
    Ok(Step::Done(Terminal {
        node: seq.row,
        scope: seq.scope,
        post: PostProcess::Cardinality { kind, default },
    }))
}

/// Inside a projection the operator is a scalar subquery reading one row.
fn nested_cardinality(
    az: &mut Analyzer<'_>,
    seq: Seq,
    op: &OperatorCall<'_>,
    kind: Cardinality,
) -> Result<Step, TranslateError> {
    if kind.is_last() {
        return Err(op.unsupported("Last in a subquery"));
    }
    let seq = apply_take(az, seq, SqlExpr::literal(1))?;
    let Node::Sql(e) = seq.row else {
        return Err(op.invalid_shape(format!(
            "a subquery returning a {} cannot be used as a value",
            seq.row.kind_name()
        )));
    };
    let ty = e.ty().nullable();
    let (output, _) = value_expr(e, az.dialect());
    az.discard_outputs(seq.scope);
    az.ctx.scope_mut(seq.scope).add_output(output);
    Ok(Step::Done(Terminal {
        node: Node::Sql(SqlExpr::ScalarSubquery {
            scope: seq.scope,
            ty: ty.clone(),
        }),
        scope: seq.scope,
        post: PostProcess::Scalar {
            default: ty.default_value(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::*;
    use crate::config::TranslatorConfig;
    use crate::error::TranslateError;
    use crate::linq::expr::Expr;
    use crate::value::Value;

    fn titles(method: &str) -> Expr {
        books()
            .query("Select", vec![lam("x", x().member("Title"))])
            .query(method, vec![])
    }

    fn rows(values: &[&str]) -> Vec<Vec<Value>> {
        values.iter().map(|v| vec![Value::from(*v)]).collect()
    }

    #[test]
    fn test_first_limits_one() {
        let compiled = compile(&titles("First"));
        assert_eq!(compiled.sql(), "SELECT t0.Title AS c0 FROM books t0 LIMIT 1");
        let out = compiled.materialize(&rows(&["Dune"]), &mut session(vec![])).unwrap();
        assert_eq!(out, Value::from("Dune"));
    }

    #[test]
    fn test_first_on_empty_fails() {
        let compiled = compile(&titles("First"));
        let err = compiled.materialize(&[], &mut session(vec![])).unwrap_err();
        assert!(matches!(err, TranslateError::CardinalityViolation { .. }));
    }

    #[test]
    fn test_first_or_default_on_empty() {
        let compiled = compile(&titles("FirstOrDefault"));
        assert_eq!(compiled.materialize(&[], &mut session(vec![])).unwrap(), Value::Null);
    }

    #[test]
    fn test_single_probes_two_rows() {
        let compiled = compile(&titles("Single"));
        assert!(compiled.sql().ends_with("LIMIT 2"), "{}", compiled.sql());
        let err = compiled
            .materialize(&rows(&["a", "b"]), &mut session(vec![]))
            .unwrap_err();
        assert_eq!(err.to_string(), "Single: sequence contains more than one element");
    }

    #[test]
    fn test_single_or_default_many_rows_fails() {
        let compiled = compile(&titles("SingleOrDefault"));
        assert!(compiled.materialize(&rows(&["a", "b"]), &mut session(vec![])).is_err());
        assert_eq!(compiled.materialize(&[], &mut session(vec![])).unwrap(), Value::Null);
    }

    #[test]
    fn test_single_without_probe() {
        let config = TranslatorConfig {
            single_row_probe: false,
            ..Default::default()
        };
        let compiled = compile_config(&titles("Single"), &config);
        assert!(!compiled.sql().contains("LIMIT"), "{}", compiled.sql());
    }

    #[test]
    fn test_last_reads_all_rows() {
        let compiled = compile(&titles("Last"));
        assert!(!compiled.sql().contains("LIMIT"));
        let out = compiled.materialize(&rows(&["a", "b"]), &mut session(vec![])).unwrap();
        assert_eq!(out, Value::from("b"));
    }

    #[test]
    fn test_first_with_predicate() {
        let q = books().query("First", vec![lam("x", x().member("Price").gt(Expr::constant(5.0)))]);
        let sql = compile(&q).sql().to_string();
        assert!(sql.ends_with("WHERE (t0.Price > 5) LIMIT 1"), "{sql}");
    }

    #[test]
    fn test_nested_first_is_scalar_subquery() {
        let cheapest = books()
            .query("Where", vec![lam("b", p("b").member("AuthorId").eq(p("a").member("Id")))])
            .query("OrderBy", vec![lam("b", p("b").member("Price"))])
            .query("Select", vec![lam("b", p("b").member("Title"))])
            .query("FirstOrDefault", vec![]);
        let q = authors().query("Select", vec![lam("a", cheapest)]);
        assert_eq!(
            compile(&q).sql(),
            "SELECT (SELECT t1.Title AS c0 FROM books t1 WHERE (t1.AuthorId = t0.Id) ORDER BY t1.Price LIMIT 1) AS c0 FROM authors t0"
        );
    }

    #[test]
    fn test_nested_entity_first_rejected() {
        let q = authors().query(
            "Select",
            vec![lam("a", books().query("First", vec![]))],
        );
        assert!(matches!(
            compile_with(&q, &crate::dialect::GenericDialect::ansi()),
            Err(TranslateError::InvalidProjectionShape { .. })
        ));
    }

    #[test]
    fn test_nested_last_unsupported() {
        let q = authors().query(
            "Select",
            vec![lam("a", titles("Last"))],
        );
        assert!(matches!(
            compile_with(&q, &crate::dialect::GenericDialect::ansi()),
            Err(TranslateError::UnsupportedOperator { .. })
        ));
    }
}
