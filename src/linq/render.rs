//! Reference ANSI-style rendering of a [`SqlAst`].
//!
//! Dialect SQL generation lives outside this crate. The text produced here
//! is used for logging, diagnostics and tests, and it fixes the positional
//! order of SQL parameters: external values are numbered `@p0, @p1, ...`
//! in order of first appearance in the text.

use std::collections::HashMap;

use crate::linq::sql::{
    ColumnExpression, DatePart, InList, JoinType, LockMode, ScopeId, SqlAst, SqlExpr, SqlFunction,
    TableId, TableSource,
};
use crate::value::{HostType, Value};

/// Rendered SQL text and the external-value indices bound as parameters,
/// in positional order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSql {
    pub text: String,
    pub parameters: Vec<usize>,
}

/// Render the root scope of `ast` with its whole scope tree.
pub fn render(ast: &SqlAst) -> RenderedSql {
    let mut renderer = Renderer::new(ast);
    let text = renderer.select(ast.root_id());
    RenderedSql {
        text,
        parameters: renderer.parameters,
    }
}

struct Renderer<'a> {
    ast: &'a SqlAst,
    aliases: HashMap<TableId, &'a str>,
    parameters: Vec<usize>,
}

impl<'a> Renderer<'a> {
    fn new(ast: &'a SqlAst) -> Self {
        let aliases = ast
            .scopes()
            .iter()
            .flat_map(|s| s.tables.iter())
            .map(|t| (t.id, t.alias.as_str()))
            .collect();
        Self {
            ast,
            aliases,
            parameters: Vec::new(),
        }
    }

    // ── Statements ─────────────────────────────────────────────────────────

    fn select(&mut self, id: ScopeId) -> String {
        let ast = self.ast;
        let Some(scope) = ast.scope(id) else {
            return format!("SELECT NULL /* missing scope {id} */");
        };
        let mut sql = String::from("SELECT ");
        if scope.distinct && scope.group_by.is_empty() {
            sql.push_str("DISTINCT ");
        }
        if scope.outputs.is_empty() {
            sql.push('1');
        } else {
            let outputs: Vec<String> = scope
                .outputs
                .iter()
                .map(|o| format!("{} AS {}", self.expr(&o.expr), o.alias))
                .collect();
            sql.push_str(&outputs.join(", "));
        }

        for (i, table) in scope.tables.iter().enumerate() {
            let source = match &table.source {
                TableSource::Entity { table, .. } => table.clone(),
                TableSource::Derived(body) => format!("({})", self.select(*body)),
            };
            if i == 0 {
                sql.push_str(&format!(" FROM {source} {}", table.alias));
                continue;
            }
            match (table.join, &table.condition) {
                (JoinType::Inner, Some(cond)) => {
                    let cond = self.expr(cond);
                    sql.push_str(&format!(" INNER JOIN {source} {} ON {cond}", table.alias));
                }
                (JoinType::LeftOuter, cond) => {
                    let cond = cond.as_ref().map_or_else(|| "(1 = 1)".to_string(), |c| self.expr(c));
                    sql.push_str(&format!(" LEFT JOIN {source} {} ON {cond}", table.alias));
                }
                (JoinType::Cross, _) | (JoinType::Inner, None) => {
                    sql.push_str(&format!(" CROSS JOIN {source} {}", table.alias));
                }
            }
        }

        if let Some(pred) = &scope.predicate {
            sql.push_str(&format!(" WHERE {}", self.expr(pred)));
        }
        if !scope.group_by.is_empty() {
            let keys = self.list(&scope.group_by);
            sql.push_str(&format!(" GROUP BY {keys}"));
        }
        if let Some(having) = &scope.having {
            sql.push_str(&format!(" HAVING {}", self.expr(having)));
        }
        if let Some(op) = &scope.set_op {
            let next = self.select(op.next);
            sql.push_str(&format!(" {} {next}", op.kind.to_sql()));
        }
        if !scope.order_by.is_empty() {
            let keys: Vec<String> = scope
                .order_by
                .iter()
                .map(|k| {
                    let e = self.expr(&k.expr);
                    if k.descending { format!("{e} DESC") } else { e }
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
        }
        if let Some(limit) = &scope.limit {
            sql.push_str(&format!(" LIMIT {}", self.expr(limit)));
        }
        if let Some(offset) = &scope.offset {
            sql.push_str(&format!(" OFFSET {}", self.expr(offset)));
        }
        if let Some(lock) = scope.tables.iter().find_map(|t| t.lock) {
            sql.push_str(match lock {
                LockMode::Update => " FOR UPDATE",
                LockMode::Share => " FOR SHARE",
            });
        }
        sql
    }

    // ── Expressions ────────────────────────────────────────────────────────

    fn list(&mut self, exprs: &[SqlExpr]) -> String {
        exprs.iter().map(|e| self.expr(e)).collect::<Vec<_>>().join(", ")
    }

    fn expr(&mut self, expr: &SqlExpr) -> String {
        match expr {
            SqlExpr::Column(c) => self.column(c),
            SqlExpr::Literal { value, .. } => literal(value),
            SqlExpr::External { index, .. } => self.parameter(*index),
            SqlExpr::Binary { op, left, right } => {
                let l = self.expr(left);
                let r = self.expr(right);
                format!("({l} {} {r})", op.to_sql())
            }
            SqlExpr::Not(e) => format!("(NOT {})", self.expr(e)),
            SqlExpr::Negate(e) => format!("(-{})", self.expr(e)),
            SqlExpr::IsNull { operand, negated } => {
                let not = if *negated { "NOT " } else { "" };
                format!("({} IS {not}NULL)", self.expr(operand))
            }
            SqlExpr::Like {
                operand,
                pattern,
                escape,
            } => {
                let o = self.expr(operand);
                let p = self.expr(pattern);
                match escape {
                    Some(c) => format!("({o} LIKE {p} ESCAPE {})", literal(&Value::Text(c.to_string()))),
                    None => format!("({o} LIKE {p})"),
                }
            }
            SqlExpr::In { operand, list } => {
                let o = self.expr(operand);
                match list {
                    InList::Values(values) if values.is_empty() => "(1 = 0)".to_string(),
                    InList::Values(values) => {
                        let items: Vec<String> = values.iter().map(literal).collect();
                        format!("({o} IN ({}))", items.join(", "))
                    }
                    InList::External(index) => format!("({o} IN ({}))", self.parameter(*index)),
                    InList::Subquery(scope) => format!("({o} IN ({}))", self.select(*scope)),
                }
            }
            SqlExpr::Exists { negated, subquery } => {
                let not = if *negated { "NOT " } else { "" };
                format!("{not}EXISTS ({})", self.select(*subquery))
            }
            SqlExpr::ScalarSubquery { scope, .. } => format!("({})", self.select(*scope)),
            SqlExpr::Function(f) => {
                let args = self.list(&f.args);
                match f.func {
                    SqlFunction::DatePart(DatePart::Date) => format!("CAST({args} AS DATE)"),
                    SqlFunction::DatePart(part) => format!("EXTRACT({} FROM {args})", part.to_sql()),
                    func => format!("{}({args})", func.name()),
                }
            }
            SqlExpr::Aggregate(a) => {
                let mut sql = match &a.arg {
                    None => format!("{}(*)", a.func.sql_name()),
                    Some(arg) => {
                        let distinct = if a.distinct { "DISTINCT " } else { "" };
                        format!("{}({distinct}{})", a.func.sql_name(), self.expr(arg))
                    }
                };
                if let Some(filter) = &a.filter {
                    sql.push_str(&format!(" FILTER (WHERE {})", self.expr(filter)));
                }
                sql
            }
            SqlExpr::Case {
                whens, otherwise, ..
            } => {
                let mut sql = String::from("CASE");
                for (when, then) in whens {
                    let w = self.expr(when);
                    let t = self.expr(then);
                    sql.push_str(&format!(" WHEN {w} THEN {t}"));
                }
                sql.push_str(&format!(" ELSE {} END", self.expr(otherwise)));
                sql
            }
            SqlExpr::Cast { operand, ty } => {
                format!("CAST({} AS {})", self.expr(operand), sql_type(ty))
            }
        }
    }

    fn column(&self, c: &ColumnExpression) -> String {
        match self.aliases.get(&c.table) {
            Some(alias) => format!("{alias}.{}", c.column),
            None => c.column.clone(),
        }
    }

    fn parameter(&mut self, index: usize) -> String {
        let position = match self.parameters.iter().position(|&p| p == index) {
            Some(pos) => pos,
            None => {
                self.parameters.push(index);
                self.parameters.len() - 1
            }
        };
        format!("@p{position}")
    }
}

/// SQL literal for a host value.
pub fn literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::DateTime(dt) => format!("TIMESTAMP '{}'", dt.format("%Y-%m-%d %H:%M:%S%.f")),
        Value::TimeSpan(ms) => ms.to_string(),
        Value::Bytes(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
            format!("X'{hex}'")
        }
        Value::List(items) => items.iter().map(literal).collect::<Vec<_>>().join(", "),
        Value::Record(_) | Value::Entity(_) | Value::Group { .. } => "NULL".to_string(),
    }
}

/// SQL type name used in `CAST`.
pub fn sql_type(ty: &HostType) -> String {
    match ty.non_null() {
        HostType::Bool => "BOOLEAN".to_string(),
        HostType::Int32 => "INT".to_string(),
        HostType::Int64 | HostType::TimeSpan => "BIGINT".to_string(),
        HostType::Double => "DOUBLE PRECISION".to_string(),
        HostType::Decimal => "DECIMAL".to_string(),
        HostType::String => "VARCHAR".to_string(),
        HostType::DateTime => "TIMESTAMP".to_string(),
        HostType::Guid => "UUID".to_string(),
        HostType::Bytes => "VARBINARY".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linq::operators::test_helpers::*;
    use crate::linq::expr::Expr;
    use chrono::NaiveDate;

    #[test]
    fn test_literals() {
        assert_eq!(literal(&Value::from("O'Brien")), "'O''Brien'");
        assert_eq!(literal(&Value::Float(2.5)), "2.5");
        assert_eq!(literal(&Value::Bool(false)), "FALSE");
        assert_eq!(literal(&Value::Null), "NULL");
        let dt = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        assert_eq!(literal(&Value::DateTime(dt)), "TIMESTAMP '2024-03-01 08:30:00'");
        assert_eq!(literal(&Value::Bytes(vec![0xAB, 0x01])), "X'AB01'");
    }

    #[test]
    fn test_cast_types() {
        assert_eq!(sql_type(&HostType::Int32.nullable()), "INT");
        assert_eq!(sql_type(&HostType::Double), "DOUBLE PRECISION");
        assert_eq!(sql_type(&HostType::TimeSpan), "BIGINT");
    }

    #[test]
    fn test_parameters_numbered_by_first_appearance() {
        let lo = Expr::variable("lo", crate::value::HostType::Double);
        let hi = Expr::variable("hi", crate::value::HostType::Double);
        let q = books().query(
            "Where",
            vec![lam(
                "x",
                x().member("Price")
                    .gt(lo.clone())
                    .and(x().member("Price").lt(hi))
                    .and(x().member("Price").ne(lo)),
            )],
        );
        let compiled = compile(&q);
        assert!(
            compiled
                .sql()
                .ends_with("WHERE (((t0.Price > @p0) AND (t0.Price < @p1)) AND (t0.Price <> @p0))"),
            "{}",
            compiled.sql()
        );
        assert_eq!(compiled.parameters().len(), 2);
    }

    #[test]
    fn test_nullable_reference_renders_left_join() {
        let q = books().query("Select", vec![lam("x", x().member("Publisher").member("Name"))]);
        assert_eq!(
            compile(&q).sql(),
            "SELECT t1.Name AS c0 FROM books t0 LEFT JOIN publishers t1 ON (t0.PublisherId = t1.Id)"
        );
    }

    #[test]
    fn test_select_without_outputs() {
        let q = publishers().query("Any", vec![]);
        assert_eq!(compile(&q).sql(), "SELECT EXISTS (SELECT 1 FROM publishers t0) AS c0");
    }
}
