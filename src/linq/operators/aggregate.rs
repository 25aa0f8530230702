//! `Count`, `LongCount`, `Sum`, `Average`, `Min`, `Max` over a sequence.
//!
//! At the end of the query the aggregate is the single output of the root
//! scope and the row is unwrapped on the host. Inside a lambda the scope
//! becomes a scalar subquery. Aggregates over a group are handled by
//! [`group_by::translate_group_aggregate`](super::group_by::translate_group_aggregate).

use crate::error::TranslateError;
use crate::linq::analyzer::{Analyzer, ChainMode, OperatorCall, Pending, Step, Terminal};
use crate::linq::node::{Node, Seq};
use crate::linq::operators::filter::apply_where;
use crate::linq::post::PostProcess;
use crate::linq::sql::{AggFunc, AggregateExpression, SqlExpr, SqlFunction, SqlFunctionExpression};
use crate::value::{HostType, Value};

pub fn translate_aggregate(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    let Some(func) = AggFunc::from_method(op.method()) else {
        return Err(op.unsupported("aggregate"));
    };
    let selector = op.operands().first();

    let seq = match seq.row {
        Node::Grouping(mut g) => {
            // Counting groups: group in SQL, then count the grouped rows.
            if !func.is_count() || selector.is_some() {
                return Err(op.unsupported("aggregate over groups without a projection"));
            }
            let marker = crate::linq::expr::Expr::Call(op.call.clone());
            az.push_grouping(&mut g, &marker)?;
            az.wrap_derived(Seq {
                scope: seq.scope,
                row: *g.key,
            })?
        }
        Node::GroupJoin(_) => return Err(op.unsupported("aggregate over a group-join group")),
        row => Seq { scope: seq.scope, row },
    };

    let (seq, value) = match selector {
        Some(pred) if func.is_count() => (apply_where(az, seq, pred)?, None),
        Some(sel) => {
            let seq = az.ensure(seq, Pending::Aggregate)?;
            let value = az.apply_lambda(sel, vec![seq.row.clone()])?;
            (seq, Some(value))
        }
        None if func.is_count() => (seq, None),
        None => {
            let row = seq.row.clone();
            (seq, Some(row))
        }
    };
    let seq = az.ensure(seq, Pending::Aggregate)?;

    let arg = match value {
        Some(Node::Sql(e)) => Some(e),
        Some(other) => {
            return Err(op.invalid_shape(format!(
                "{} over a {} sequence",
                op.method(),
                other.kind_name()
            )));
        }
        None => None,
    };
    let aggregate = build_aggregate(az, func, arg, false, None);
    let ty = aggregate.ty();

    az.discard_ordering(seq.scope, op.method());

    let default = match func {
        AggFunc::Count | AggFunc::LongCount | AggFunc::Sum => ty.non_null().default_value(),
        _ => Value::Null,
    };
    match op.mode {
        ChainMode::Root => Ok(Step::Done(Terminal {
            node: Node::Sql(aggregate),
            scope: seq.scope,
            post: PostProcess::Scalar { default },
        })),
        ChainMode::Nested => {
            az.discard_outputs(seq.scope);
            az.ctx.scope_mut(seq.scope).add_output(aggregate);
            let subquery = SqlExpr::ScalarSubquery {
                scope: seq.scope,
                ty: ty.clone(),
            };
            // An empty correlated SUM is NULL in SQL and zero on the host.
            let node = if func == AggFunc::Sum && !default.is_null() {
                SqlExpr::Function(SqlFunctionExpression {
                    func: SqlFunction::Coalesce,
                    args: vec![
                        subquery,
                        SqlExpr::Literal {
                            value: default.clone(),
                            ty: ty.non_null().clone(),
                        },
                    ],
                    ty: ty.non_null().clone(),
                })
            } else {
                subquery
            };
            Ok(Step::Done(Terminal {
                node: Node::Sql(node),
                scope: seq.scope,
                post: PostProcess::Scalar { default },
            }))
        }
    }
}

/// Build an aggregate call. Without FILTER support a filter is folded into
/// the argument as `CASE WHEN filter THEN arg ELSE NULL END`.
pub fn build_aggregate(
    az: &Analyzer<'_>,
    func: AggFunc,
    arg: Option<SqlExpr>,
    distinct: bool,
    filter: Option<SqlExpr>,
) -> SqlExpr {
    let dialect = az.dialect();
    let arg_ty = arg.as_ref().map(SqlExpr::ty);
    let ty = dialect.aggregate_result_type(func, arg_ty.as_ref());
    let (arg, filter) = match filter {
        Some(f) if !dialect.capabilities().filtered_aggregates => {
            let then = arg.unwrap_or_else(|| SqlExpr::literal(1));
            let case_ty = then.ty().nullable();
            let folded = SqlExpr::Case {
                whens: vec![(f, then)],
                otherwise: Box::new(SqlExpr::Literal {
                    value: Value::Null,
                    ty: HostType::Object,
                }),
                ty: case_ty,
            };
            (Some(folded), None)
        }
        other => (arg, other),
    };
    SqlExpr::Aggregate(AggregateExpression {
        func,
        arg: arg.map(Box::new),
        distinct,
        filter: filter.map(Box::new),
        ty,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::*;
    use crate::linq::expr::Expr;
    use crate::linq::post::PostProcess;
    use crate::value::{HostType, Value};

    #[test]
    fn test_dropped_ordering_releases_external() {
        let v = Expr::variable("v", HostType::Double);
        let q = books()
            .query("OrderBy", vec![lam("x", x().member("Price").mul(v))])
            .query("Count", vec![]);
        let compiled = compile(&q);
        assert_eq!(compiled.sql(), "SELECT COUNT(*) AS c0 FROM books t0");
        assert_eq!(compiled.externals().len(), 1);
        assert_eq!(compiled.externals()[0].use_count, 0);
        assert!(compiled.parameters().is_empty());
    }

    #[test]
    fn test_nested_aggregate_keeps_filter_external() {
        let v = Expr::variable("v", HostType::Double);
        let q = authors().query(
            "Select",
            vec![lam(
                "a",
                books()
                    .query("OrderBy", vec![lam("b", p("b").member("Price").mul(v.clone()))])
                    .query(
                        "Where",
                        vec![lam(
                            "b",
                            p("b").member("AuthorId").eq(p("a").member("Id")).and(p("b").member("Price").gt(v)),
                        )],
                    )
                    .query("Count", vec![]),
            )],
        );
        let compiled = compile(&q);
        assert!(!compiled.sql().contains("ORDER BY"), "{}", compiled.sql());
        assert_eq!(compiled.externals()[0].use_count, 1);
        assert_eq!(compiled.parameters().len(), 1);
    }

    #[test]
    fn test_root_count() {
        let compiled = compile(&books().query("Count", vec![]));
        assert_eq!(compiled.sql(), "SELECT COUNT(*) AS c0 FROM books t0");
        assert_eq!(
            compiled.post_process(),
            &PostProcess::Scalar {
                default: Value::Int(0)
            }
        );
        let out = compiled.materialize(&[vec![Value::Int(4)]], &mut session(vec![])).unwrap();
        assert_eq!(out, Value::Int(4));
    }

    #[test]
    fn test_count_with_predicate_filters() {
        let q = books().query("Count", vec![lam("x", x().member("InStock"))]);
        assert_eq!(
            compile(&q).sql(),
            "SELECT COUNT(*) AS c0 FROM books t0 WHERE t0.InStock"
        );
    }

    #[test]
    fn test_sum_with_selector_defaults_to_zero() {
        let q = books().query("Sum", vec![lam("x", x().member("Price"))]);
        let compiled = compile(&q);
        assert_eq!(compiled.sql(), "SELECT SUM(t0.Price) AS c0 FROM books t0");
        let out = compiled.materialize(&[vec![Value::Null]], &mut session(vec![])).unwrap();
        assert_eq!(out, Value::Float(0.0));
    }

    #[test]
    fn test_max_after_select() {
        let q = books()
            .query("Select", vec![lam("x", x().member("Price"))])
            .query("Max", vec![]);
        assert_eq!(compile(&q).sql(), "SELECT MAX(t0.Price) AS c0 FROM books t0");
    }

    #[test]
    fn test_count_after_take_wraps() {
        let q = books().query("Take", vec![Expr::constant(5)]).query("Count", vec![]);
        let sql = compile(&q).sql().to_string();
        assert!(sql.starts_with("SELECT COUNT(*) AS c0 FROM (SELECT"), "{sql}");
        assert!(sql.ends_with("LIMIT 5) t1"), "{sql}");
    }

    #[test]
    fn test_aggregate_drops_ordering() {
        let q = books()
            .query("OrderBy", vec![lam("x", x().member("Title"))])
            .query("Count", vec![]);
        assert!(!compile(&q).sql().contains("ORDER BY"));
    }

    #[test]
    fn test_nested_count_is_scalar_subquery() {
        let q = authors().query(
            "Select",
            vec![lam(
                "a",
                Expr::record(vec![
                    ("Name", p("a").member("Name")),
                    (
                        "Books",
                        books()
                            .query(
                                "Where",
                                vec![lam("b", p("b").member("AuthorId").eq(p("a").member("Id")))],
                            )
                            .query("Count", vec![]),
                    ),
                ]),
            )],
        );
        assert_eq!(
            compile(&q).sql(),
            "SELECT t0.Name AS c0, (SELECT COUNT(*) AS c0 FROM books t1 WHERE (t1.AuthorId = t0.Id)) AS c1 FROM authors t0"
        );
    }

    #[test]
    fn test_nested_sum_coalesces() {
        let q = authors().query(
            "Select",
            vec![lam(
                "a",
                books()
                    .query(
                        "Where",
                        vec![lam("b", p("b").member("AuthorId").eq(p("a").member("Id")))],
                    )
                    .query("Sum", vec![lam("b", p("b").member("Price"))]),
            )],
        );
        let sql = compile(&q).sql().to_string();
        assert!(sql.starts_with("SELECT COALESCE((SELECT SUM(t1.Price)"), "{sql}");
        assert!(sql.contains(", 0) AS c0"), "{sql}");
    }

    #[test]
    fn test_count_groups() {
        let q = books()
            .query("GroupBy", vec![lam("x", x().member("AuthorId"))])
            .query("Count", vec![]);
        let sql = compile(&q).sql().to_string();
        assert!(sql.starts_with("SELECT COUNT(*) AS c0 FROM (SELECT t0.AuthorId AS c0"), "{sql}");
        assert!(sql.ends_with("GROUP BY t0.AuthorId) t1"), "{sql}");
    }
}
