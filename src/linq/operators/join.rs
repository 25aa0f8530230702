//! `Join`, `GroupJoin` and `SelectMany`.
//!
//! Joins extend the scope of the outer sequence, so every table the outer
//! row is built from must live in that scope. The inner side of `Join` and
//! `GroupJoin` must be an entity set. A group-join group is not a table
//! until it is consumed: flattening it with `SelectMany` joins it (left
//! outer with `DefaultIfEmpty`), aggregating it makes a correlated
//! subquery.

use crate::error::TranslateError;
use crate::linq::analyzer::{Analyzer, ChainMode, OperatorCall, Outcome, Pending, Step};
use crate::linq::chain::ExpressionChain;
use crate::linq::expr::Expr;
use crate::linq::node::{EntityNode, GroupJoinNode, Node, Seq};
use crate::linq::sql::{JoinType, SqlExpr, TableId};

pub fn translate_join(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    let seq = prepare_outer(az, seq, op)?;
    let info = inner_entity(az, op)?;
    let table = az.ctx.register_entity_set(info, JoinType::Inner);
    let inner = Node::Entity(EntityNode {
        entity: info.name.clone(),
        table,
        prefix: String::new(),
        nullable: false,
    });
    let condition = key_condition(az, op, &seq.row, &inner)?;
    if let Some(t) = az.ctx.table_mut(table) {
        t.condition = Some(condition);
    }
    let row = az.apply_lambda(op.operand(3)?, vec![seq.row, inner])?;
    Ok(Step::Continue(Seq {
        scope: seq.scope,
        row,
    }))
}

pub fn translate_group_join(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    let seq = prepare_outer(az, seq, op)?;
    let info = inner_entity(az, op)?;
    let mut table = az.ctx.detached_entity_table(info, JoinType::LeftOuter);
    let inner = Node::Entity(EntityNode {
        entity: info.name.clone(),
        table: table.id,
        prefix: String::new(),
        nullable: false,
    });
    table.condition = Some(key_condition(az, op, &seq.row, &inner)?);
    let group = Node::GroupJoin(GroupJoinNode {
        entity: info.name.clone(),
        table,
    });
    let row = az.apply_lambda(op.operand(3)?, vec![seq.row, group])?;
    Ok(Step::Continue(Seq {
        scope: seq.scope,
        row,
    }))
}

pub fn translate_select_many(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    let seq = prepare_outer(az, seq, op)?;
    let selector = op.operand(0)?;
    if selector.lambda_arity() != 1 {
        return Err(op.unsupported("indexed SelectMany"));
    }
    let inner = translate_join_collection(az, &seq, selector)?;
    let row = match op.operands().get(1) {
        Some(result) => az.apply_lambda(result, vec![seq.row, inner])?,
        None => inner,
    };
    Ok(Step::Continue(Seq {
        scope: seq.scope,
        row,
    }))
}

/// Aggregate or quantifier over a group-join group: the group's table and
/// join condition become a correlated subquery.
pub fn translate_group_join_sequence(
    az: &mut Analyzer<'_>,
    group: &GroupJoinNode,
    chain: &ExpressionChain<'_>,
    expr: &Expr,
) -> Result<Node, TranslateError> {
    let scope = az.ctx.new_select_scope()?;
    let mut table = group.table.clone();
    let condition = table.condition.take();
    table.join = JoinType::Inner;
    let id = table.id;
    az.ctx.add_table(scope, table);
    if let Some(c) = condition {
        az.ctx.scope_mut(scope).add_predicate(c);
    }
    let seq = Seq {
        scope,
        row: Node::Entity(EntityNode {
            entity: group.entity.clone(),
            table: id,
            prefix: String::new(),
            nullable: false,
        }),
    };
    let outcome = az.run_links(seq, chain, ChainMode::Nested);
    az.ctx.end_scope();
    match outcome? {
        Outcome::Terminal(t) => Ok(t.node),
        Outcome::Sequence(_) => Err(az.invalid_shape("group-join group used as a value", expr)),
    }
}

/// Join the sequence produced by a `SelectMany` collection selector:
/// an entity set or a group-join group, optionally filtered by `Where`
/// and optionally ending in `DefaultIfEmpty`.
fn translate_join_collection(az: &mut Analyzer<'_>, seq: &Seq, selector: &Expr) -> Result<Node, TranslateError> {
    let Some(lambda) = selector.as_lambda() else {
        return Err(az.invalid_shape("expected a lambda", selector));
    };
    az.ctx.new_quote_scope();
    az.ctx.bind(&lambda.params[0], seq.row.clone());
    let result = join_collection_body(az, seq, &lambda.body);
    az.ctx.end_quote_scope();
    result
}

fn join_collection_body(az: &mut Analyzer<'_>, seq: &Seq, body: &Expr) -> Result<Node, TranslateError> {
    let chain = ExpressionChain::build(body, false)?;
    let root = chain.root();
    let (mut table, entity, mut has_condition) = match root {
        Expr::EntitySet(name) => {
            let info = az.entity_info(name)?;
            (az.ctx.detached_entity_table(info, JoinType::Cross), info.name.clone(), false)
        }
        Expr::Parameter(_) | Expr::Member { .. } => match az.translate(root)? {
            Node::GroupJoin(g) => (g.table, g.entity, true),
            other => {
                return Err(az.unsupported(
                    &format!("SelectMany over a {}", other.kind_name()),
                    body,
                ));
            }
        },
        _ => return Err(az.unsupported("SelectMany collection", body)),
    };
    let inner = EntityNode {
        entity,
        table: table.id,
        prefix: String::new(),
        nullable: false,
    };

    let mut left_outer = false;
    let links = chain.links();
    for (i, link) in links.iter().enumerate() {
        let call = link.call;
        let operands = call.operands();
        match (call.method.as_str(), operands) {
            ("Where", [pred]) if !left_outer => {
                let node = az.apply_lambda(pred, vec![Node::Entity(inner.clone())])?;
                let p = az.predicate(node, pred)?;
                table.condition = Some(match table.condition.take() {
                    Some(c) => SqlExpr::and(c, p),
                    None => p,
                });
                has_condition = true;
            }
            ("DefaultIfEmpty", []) if i + 1 == links.len() => left_outer = true,
            ("AsQueryable" | "AsEnumerable", []) => {}
            (method, _) => {
                return Err(az.unsupported(&format!("{method} in a SelectMany collection"), body));
            }
        }
    }

    table.join = match (left_outer, has_condition) {
        (true, _) => JoinType::LeftOuter,
        (false, true) => JoinType::Inner,
        (false, false) => JoinType::Cross,
    };
    if table.join == JoinType::LeftOuter && table.condition.is_none() {
        table.condition = Some(SqlExpr::eq(SqlExpr::literal(1), SqlExpr::literal(1)));
    }
    tracing::trace!(
        table = %table.alias,
        join = ?table.join,
        "[query_translator] SelectMany joins collection"
    );
    az.ctx.add_table(seq.scope, table);
    Ok(Node::Entity(EntityNode {
        nullable: left_outer,
        ..inner
    }))
}

/// Wrap if needed and check that the outer row is built from tables of
/// the current scope.
fn prepare_outer(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Seq, TranslateError> {
    if matches!(seq.row, Node::Grouping(_) | Node::GroupJoin(_)) {
        return Err(op.unsupported("joining a grouping"));
    }
    let seq = az.ensure(seq, Pending::Join)?;
    let mut tables = Vec::new();
    row_tables(&seq.row, &mut tables);
    let current = az.ctx.current();
    let resolved = !tables.is_empty()
        && seq.scope == current
        && tables
            .iter()
            .all(|&t| az.ctx.table_scope(t) == Some(seq.scope));
    if !resolved {
        return Err(TranslateError::AmbiguousJoinSource {
            operator: op.method().to_string(),
            expression: op.text(),
        });
    }
    Ok(seq)
}

fn inner_entity<'a>(
    az: &Analyzer<'a>,
    op: &OperatorCall<'_>,
) -> Result<&'a crate::schema::EntityInfo, TranslateError> {
    match op.operand(0)? {
        Expr::EntitySet(name) => az.entity_info(name),
        _ => Err(op.unsupported("inner side of a join must be an entity set")),
    }
}

/// `outer_key == inner_key`, field by field for records.
fn key_condition(
    az: &mut Analyzer<'_>,
    op: &OperatorCall<'_>,
    outer: &Node,
    inner: &Node,
) -> Result<SqlExpr, TranslateError> {
    let outer_selector = op.operand(1)?;
    let inner_selector = op.operand(2)?;
    let outer_key = az.apply_lambda(outer_selector, vec![outer.clone()])?;
    let inner_key = az.apply_lambda(inner_selector, vec![inner.clone()])?;
    let left = az.key_operands(&outer_key, outer_selector)?;
    let right = az.key_operands(&inner_key, inner_selector)?;
    if left.len() != right.len() {
        return Err(op.invalid_shape(format!(
            "join keys have {} and {} columns",
            left.len(),
            right.len()
        )));
    }
    SqlExpr::and_all(left.into_iter().zip(right).map(|(l, r)| SqlExpr::eq(l, r)))
        .ok_or_else(|| op.invalid_shape("empty join key"))
}

fn row_tables(node: &Node, out: &mut Vec<TableId>) {
    match node {
        Node::Entity(e) => out.push(e.table),
        Node::Reference(r) => out.push(r.owner.table),
        Node::Record(fields) => fields.iter().for_each(|(_, n)| row_tables(n, out)),
        Node::Sql(e) => sql_tables(e, out),
        Node::Grouping(_) | Node::GroupJoin(_) => {}
    }
}

fn sql_tables(e: &SqlExpr, out: &mut Vec<TableId>) {
    match e {
        SqlExpr::Column(c) => out.push(c.table),
        SqlExpr::Binary { left, right, .. } => {
            sql_tables(left, out);
            sql_tables(right, out);
        }
        SqlExpr::Not(inner) | SqlExpr::Negate(inner) => sql_tables(inner, out),
        SqlExpr::IsNull { operand, .. } | SqlExpr::Cast { operand, .. } => sql_tables(operand, out),
        SqlExpr::Function(f) => f.args.iter().for_each(|a| sql_tables(a, out)),
        SqlExpr::Case {
            whens, otherwise, ..
        } => {
            for (w, t) in whens {
                sql_tables(w, out);
                sql_tables(t, out);
            }
            sql_tables(otherwise, out);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::*;
    use crate::error::TranslateError;
    use crate::linq::expr::Expr;
    use crate::value::Value;

    fn b() -> Expr {
        p("b")
    }

    fn a() -> Expr {
        p("a")
    }

    #[test]
    fn test_inner_join() {
        let q = books().query(
            "Join",
            vec![
                authors(),
                lam("b", b().member("AuthorId")),
                lam("a", a().member("Id")),
                lam2("b", "a", Expr::record(vec![("T", b().member("Title")), ("N", a().member("Name"))])),
            ],
        );
        assert_eq!(
            compile(&q).sql(),
            "SELECT t0.Title AS c0, t1.Name AS c1 FROM books t0 INNER JOIN authors t1 ON (t0.AuthorId = t1.Id)"
        );
    }

    #[test]
    fn test_join_on_record_keys() {
        let q = orders().query(
            "Join",
            vec![
                books(),
                lam("o", Expr::record(vec![("K", p("o").member("BookId")), ("Q", p("o").member("Quantity"))])),
                lam("b", Expr::record(vec![("K", b().member("Id")), ("Q", b().member("AuthorId"))])),
                lam2("o", "b", b().member("Title")),
            ],
        );
        let sql = compile(&q).sql().to_string();
        assert!(
            sql.ends_with("ON ((t0.BookId = t1.Id) AND (t0.Quantity = t1.AuthorId))"),
            "{sql}"
        );
    }

    #[test]
    fn test_join_with_subquery_inner_rejected() {
        let q = books().query(
            "Join",
            vec![
                authors().query("Where", vec![lam("a", a().member("Country").eq(Expr::constant("NZ")))]),
                lam("b", b().member("AuthorId")),
                lam("a", a().member("Id")),
                lam2("b", "a", b()),
            ],
        );
        assert!(matches!(
            compile_with(&q, &crate::dialect::GenericDialect::ansi()),
            Err(TranslateError::UnsupportedOperator { .. })
        ));
    }

    #[test]
    fn test_join_from_constant_row_is_ambiguous() {
        let q = books()
            .query("Select", vec![lam("b", Expr::constant(1))])
            .query(
                "Join",
                vec![
                    authors(),
                    lam("k", p("k")),
                    lam("a", a().member("Id")),
                    lam2("k", "a", a()),
                ],
            );
        assert!(matches!(
            compile_with(&q, &crate::dialect::GenericDialect::ansi()),
            Err(TranslateError::AmbiguousJoinSource { .. })
        ));
    }

    fn authors_with_books() -> Expr {
        authors().query(
            "GroupJoin",
            vec![
                books(),
                lam("a", a().member("Id")),
                lam("b", b().member("AuthorId")),
                lam2("a", "bs", Expr::record(vec![("A", a()), ("Bs", p("bs"))])),
            ],
        )
    }

    #[test]
    fn test_group_join_select_many_default_if_empty_is_left_join() {
        let q = authors_with_books().query(
            "SelectMany",
            vec![
                lam("t", p("t").member("Bs").enumerable("DefaultIfEmpty", vec![])),
                lam2(
                    "t",
                    "b",
                    Expr::record(vec![("Name", p("t").member("A").member("Name")), ("Title", b().member("Title"))]),
                ),
            ],
        );
        let compiled = compile(&q);
        assert_eq!(
            compiled.sql(),
            "SELECT t0.Name AS c0, t1.Title AS c1 FROM authors t0 LEFT JOIN books t1 ON (t0.Id = t1.AuthorId)"
        );
        let rows = vec![vec![Value::from("Ann"), Value::Null]];
        let out = compiled.materialize(&rows, &mut session(vec![])).unwrap();
        assert_eq!(
            out,
            Value::List(vec![Value::Record(vec![
                ("Name".into(), Value::from("Ann")),
                ("Title".into(), Value::Null),
            ])])
        );
    }

    #[test]
    fn test_group_join_select_many_without_default_is_inner_join() {
        let q = authors_with_books().query(
            "SelectMany",
            vec![lam("t", p("t").member("Bs")), lam2("t", "b", b().member("Title"))],
        );
        let sql = compile(&q).sql().to_string();
        assert!(sql.contains("INNER JOIN books t1 ON (t0.Id = t1.AuthorId)"), "{sql}");
    }

    #[test]
    fn test_group_join_count_is_correlated_subquery() {
        let q = authors().query(
            "GroupJoin",
            vec![
                books(),
                lam("a", a().member("Id")),
                lam("b", b().member("AuthorId")),
                lam2(
                    "a",
                    "bs",
                    Expr::record(vec![("Name", a().member("Name")), ("N", p("bs").enumerable("Count", vec![]))]),
                ),
            ],
        );
        assert_eq!(
            compile(&q).sql(),
            "SELECT t0.Name AS c0, (SELECT COUNT(*) AS c0 FROM books t1 WHERE (t0.Id = t1.AuthorId)) AS c1 FROM authors t0"
        );
    }

    #[test]
    fn test_select_many_cross_join() {
        let q = books().query(
            "SelectMany",
            vec![lam("b", authors()), lam2("b", "a", Expr::record(vec![("T", b().member("Title")), ("N", a().member("Name"))]))],
        );
        let sql = compile(&q).sql().to_string();
        assert!(sql.ends_with("FROM books t0 CROSS JOIN authors t1"), "{sql}");
    }

    #[test]
    fn test_select_many_filtered_is_inner_join() {
        let q = books().query(
            "SelectMany",
            vec![
                lam(
                    "b",
                    authors().query("Where", vec![lam("a", a().member("Id").eq(b().member("AuthorId")))]),
                ),
                lam2("b", "a", a().member("Name")),
            ],
        );
        let sql = compile(&q).sql().to_string();
        assert!(sql.ends_with("FROM books t0 INNER JOIN authors t1 ON (t1.Id = t0.AuthorId)"), "{sql}");
    }

    #[test]
    fn test_select_many_default_if_empty_without_filter() {
        let q = books().query(
            "SelectMany",
            vec![lam("b", authors().query("DefaultIfEmpty", vec![])), lam2("b", "a", a().member("Name"))],
        );
        let sql = compile(&q).sql().to_string();
        assert!(sql.ends_with("LEFT JOIN authors t1 ON (1 = 1)"), "{sql}");
    }
}
