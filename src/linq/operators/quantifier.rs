//! `Any` and `All` as `EXISTS` / `NOT EXISTS`.

use crate::error::TranslateError;
use crate::linq::analyzer::{Analyzer, ChainMode, OperatorCall, Pending, Step, Terminal, negate};
use crate::linq::node::{Node, Seq};
use crate::linq::operators::filter::{apply_where, require_sql};
use crate::linq::post::PostProcess;
use crate::linq::sql::{ScopeKind, SqlExpr};
use crate::value::Value;

pub fn translate_any(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    if matches!(seq.row, Node::Grouping(_) | Node::GroupJoin(_)) {
        return Err(op.unsupported("Any over groups"));
    }
    let seq = match op.operands().first() {
        Some(pred) => apply_where(az, seq, pred)?,
        None => seq,
    };
    exists(az, seq, op, false)
}

/// `All(pred)` is `NOT EXISTS (rows where NOT pred)`.
pub fn translate_all(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    if matches!(seq.row, Node::Grouping(_) | Node::GroupJoin(_)) {
        return Err(op.unsupported("All over groups"));
    }
    let lambda = op.operand(0)?;
    let seq = az.ensure(seq, Pending::Filter)?;
    let node = az.apply_lambda(lambda, vec![seq.row.clone()])?;
    let pred = az.predicate(node, lambda)?;
    require_sql(az, &pred, lambda)?;
    az.ctx.scope_mut(seq.scope).add_predicate(negate(pred));
    exists(az, seq, op, true)
}

fn exists(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>, negated: bool) -> Result<Step, TranslateError> {
    let subquery = match op.mode {
        // At the end of the query the rows become the body of an EXISTS
        // selected by a fresh root scope.
        ChainMode::Root => {
            let outer = az.ctx.new_parent_scope(seq.scope, ScopeKind::Subquery)?;
            (seq.scope, outer)
        }
        ChainMode::Nested => (seq.scope, seq.scope),
    };
    let (body, scope) = subquery;
    az.discard_outputs(body);
    if !az.ctx.scope(body).is_limited() {
        az.discard_ordering(body, op.method());
    }
    Ok(Step::Done(Terminal {
        node: Node::Sql(SqlExpr::Exists {
            negated,
            subquery: body,
        }),
        scope,
        post: PostProcess::Scalar {
            default: Value::Bool(negated),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::*;
    use crate::dialect::GenericDialect;
    use crate::linq::expr::Expr;
    use crate::value::Value;

    fn books_with_author_from(country: &str) -> Expr {
        books().query(
            "Where",
            vec![lam(
                "x",
                authors().query(
                    "Any",
                    vec![lam(
                        "a",
                        p("a")
                            .member("Id")
                            .eq(x().member("AuthorId"))
                            .and(p("a").member("Country").eq(Expr::constant(country))),
                    )],
                ),
            )],
        )
    }

    #[test]
    fn test_correlated_any_is_exists() {
        let sql = compile(&books_with_author_from("NZ")).sql().to_string();
        assert!(
            sql.ends_with(
                "WHERE EXISTS (SELECT 1 FROM authors t1 WHERE ((t1.Id = t0.AuthorId) AND (t1.Country = 'NZ')))"
            ),
            "{sql}"
        );
    }

    #[test]
    fn test_all_is_not_exists_of_negation() {
        let q = authors().query(
            "Where",
            vec![lam(
                "a",
                books()
                    .query("Where", vec![lam("b", p("b").member("AuthorId").eq(p("a").member("Id")))])
                    .query("All", vec![lam("b", p("b").member("Price").gt(Expr::constant(10.0)))]),
            )],
        );
        let sql = compile(&q).sql().to_string();
        assert!(
            sql.ends_with(
                "WHERE NOT EXISTS (SELECT 1 FROM books t1 WHERE ((t1.AuthorId = t0.Id) AND (NOT (t1.Price > 10))))"
            ),
            "{sql}"
        );
    }

    #[test]
    fn test_root_any_selects_boolean() {
        let compiled = compile(&books().query("Any", vec![]));
        assert_eq!(compiled.sql(), "SELECT EXISTS (SELECT 1 FROM books t0) AS c0");
        let out = compiled.materialize(&[vec![Value::Bool(true)]], &mut session(vec![])).unwrap();
        assert_eq!(out, Value::Bool(true));
    }

    #[test]
    fn test_root_any_with_int_booleans() {
        let compiled = compile_with(&books().query("Any", vec![]), &GenericDialect::mssql()).unwrap();
        assert_eq!(
            compiled.sql(),
            "SELECT CASE WHEN EXISTS (SELECT 1 FROM books t0) THEN 1 ELSE 0 END AS c0"
        );
        let out = compiled.materialize(&[vec![Value::Int(0)]], &mut session(vec![])).unwrap();
        assert_eq!(out, Value::Bool(false));
    }

    #[test]
    fn test_not_any() {
        let q = authors().query(
            "Where",
            vec![lam(
                "a",
                books()
                    .query("Any", vec![lam("b", p("b").member("AuthorId").eq(p("a").member("Id")))])
                    .not(),
            )],
        );
        let sql = compile(&q).sql().to_string();
        assert!(sql.contains("WHERE NOT EXISTS (SELECT 1 FROM books t1"), "{sql}");
    }
}
