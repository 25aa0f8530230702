//! `Select` and the pass-through operators.

use crate::error::TranslateError;
use crate::linq::analyzer::{Analyzer, OperatorCall, Pending, Step};
use crate::linq::node::{Node, Seq};
use crate::linq::operators::group_by;

pub fn translate_select(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    let lambda = op.operand(0)?;
    if lambda.lambda_arity() != 1 {
        return Err(op.unsupported("indexed Select"));
    }
    match seq.row {
        Node::Grouping(g) => {
            let row = group_by::select_from_grouping(az, g, lambda, false)?;
            Ok(Step::Continue(Seq {
                scope: seq.scope,
                row,
            }))
        }
        Node::GroupJoin(_) => Err(op.unsupported("Select over a group-join group")),
        row => {
            let seq = az.ensure(Seq { scope: seq.scope, row }, Pending::Project)?;
            let row = az.apply_lambda(lambda, vec![seq.row])?;
            if matches!(row, Node::Grouping(_)) {
                return Err(op.invalid_shape("grouping produced by a projection"));
            }
            Ok(Step::Continue(Seq {
                scope: seq.scope,
                row,
            }))
        }
    }
}

/// `AsQueryable`, `AsEnumerable`, `ToList`, `ToArray`.
pub fn translate_passthrough(
    _az: &mut Analyzer<'_>,
    seq: Seq,
    _op: &OperatorCall<'_>,
) -> Result<Step, TranslateError> {
    Ok(Step::Continue(seq))
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::*;
    use crate::linq::expr::Expr;
    use crate::value::{HostType, Value};

    #[test]
    fn test_select_member() {
        let q = items()
            .query("Where", vec![lam("x", x().member("A").eq(Expr::constant(1)))])
            .query("Select", vec![lam("x", x().member("B"))]);
        assert_eq!(compile(&q).sql(), "SELECT t0.B AS c0 FROM items t0 WHERE (t0.A = 1)");
    }

    #[test]
    fn test_select_record_dedups_columns() {
        let q = books().query(
            "Select",
            vec![lam(
                "x",
                Expr::record(vec![
                    ("T", x().member("Title")),
                    ("Again", x().member("Title")),
                    ("P", x().member("Price")),
                ]),
            )],
        );
        let compiled = compile(&q);
        assert_eq!(compiled.ast().root().outputs.len(), 2);
    }

    #[test]
    fn test_constant_projection_stays_on_host() {
        let q = books().query(
            "Select",
            vec![lam(
                "x",
                Expr::record(vec![("Id", x().member("Id")), ("K", Expr::constant(7))]),
            )],
        );
        let compiled = compile(&q);
        assert!(!compiled.sql().contains('7'), "{}", compiled.sql());
        let rows = vec![vec![Value::Int(1)]];
        let out = compiled.materialize(&rows, &mut session(vec![])).unwrap();
        assert_eq!(
            out,
            Value::List(vec![Value::Record(vec![
                ("Id".into(), Value::Int(1)),
                ("K".into(), Value::Int(7)),
            ])])
        );
    }

    #[test]
    fn test_captured_variable_projection_read_from_session() {
        let v = Expr::variable("tag", HostType::String);
        let q = books().query(
            "Select",
            vec![lam("x", Expr::record(vec![("Id", x().member("Id")), ("Tag", v)]))],
        );
        let compiled = compile(&q);
        assert!(compiled.parameters().is_empty());
        assert_eq!(compiled.externals().len(), 1);
        let out = compiled
            .materialize(&[vec![Value::Int(3)]], &mut session(vec![Value::from("new")]))
            .unwrap();
        assert_eq!(
            out,
            Value::List(vec![Value::Record(vec![
                ("Id".into(), Value::Int(3)),
                ("Tag".into(), Value::from("new")),
            ])])
        );
    }

    #[test]
    fn test_whole_entity_uses_entity_reader() {
        let compiled = compile(&authors());
        assert!(matches!(
            compiled.ast().root().materializer,
            Some(crate::linq::reader::Materializer::Entity(_))
        ));
        assert_eq!(
            compiled.sql(),
            "SELECT t0.Id AS c0, t0.Name AS c1, t0.Country AS c2 FROM authors t0"
        );
    }

    #[test]
    fn test_passthrough_operators() {
        let q = authors().query("AsQueryable", vec![]).query("ToList", vec![]);
        assert_eq!(compile(&q).sql(), compile(&authors()).sql());
    }
}
