//! Split a projection between SQL and the host.
//!
//! Columns, computed SQL expressions and aggregates become output columns of
//! the scope and are read back by slot. Literals, captured host values and
//! functions the dialect cannot evaluate stay on the host and never reach
//! the SQL text. Set-operation members need a fixed column layout, so in
//! `force_sql` mode everything is emitted as output columns.

use crate::dialect::Dialect;
use crate::error::TranslateError;
use crate::linq::analyzer::Analyzer;
use crate::linq::node::Node;
use crate::linq::reader::{EntityReader, EntitySlot, ReadPlan};
use crate::linq::sql::{ScopeId, SqlExpr, SqlFunction};
use crate::schema::ValueConverter;
use crate::value::{HostType, Value};

pub struct TierSplitter<'s, 'a> {
    az: &'s mut Analyzer<'a>,
    scope: ScopeId,
    force_sql: bool,
    entities: usize,
}

impl<'s, 'a> TierSplitter<'s, 'a> {
    pub fn new(az: &'s mut Analyzer<'a>, scope: ScopeId, force_sql: bool) -> Self {
        Self {
            az,
            scope,
            force_sql,
            entities: 0,
        }
    }

    /// Build the read plan for `node`, registering output columns as
    /// needed.
    pub fn split(&mut self, node: &Node) -> Result<ReadPlan, TranslateError> {
        match node {
            Node::Sql(e) => self.split_scalar(e),
            Node::Entity(e) => {
                let info = self.az.entity_info(&e.entity)?;
                let prefix = format!("e{}_", self.entities);
                self.entities += 1;
                let mut slots = Vec::with_capacity(info.columns.len());
                for col in &info.columns {
                    let ty = if e.nullable {
                        col.ty.clone().nullable()
                    } else {
                        col.ty.clone()
                    };
                    let expr = SqlExpr::Column(crate::linq::sql::ColumnExpression {
                        table: e.table,
                        column: format!("{}{}", e.prefix, col.column),
                        ty,
                        converter: col.converter,
                    });
                    let acc = self.az.ctx.scope_mut(self.scope);
                    let index = if self.force_sql {
                        acc.add_named_output(expr, format!("{prefix}{}", col.column))
                    } else {
                        acc.add_output(expr)
                    };
                    slots.push(EntitySlot {
                        member: col.member.clone(),
                        index,
                        alias: acc.outputs[index].alias.clone(),
                        converter: col.converter,
                    });
                }
                let key_slots = info
                    .key
                    .iter()
                    .filter_map(|k| slots.iter().position(|s| &s.member == k))
                    .collect();
                Ok(ReadPlan::Entity(EntityReader {
                    entity: info.name.clone(),
                    slots,
                    key_slots,
                    nullable: e.nullable,
                }))
            }
            Node::Reference(r) => {
                let e = self.az.resolve_reference(r)?;
                self.split(&Node::Entity(e))
            }
            Node::Record(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (name, n) in fields {
                    out.push((name.clone(), self.split(n)?));
                }
                Ok(ReadPlan::Record(out))
            }
            Node::Grouping(_) | Node::GroupJoin(_) => Err(TranslateError::invalid_shape(
                "Select",
                format!("a {} cannot be projected as a value", node.kind_name()),
                "projection",
            )),
        }
    }

    fn split_scalar(&mut self, e: &SqlExpr) -> Result<ReadPlan, TranslateError> {
        let dialect = self.az.dialect();
        if !self.force_sql {
            match e {
                SqlExpr::Literal { value, ty } => {
                    let value = match (value, ty.non_null()) {
                        (Value::Int(ms), HostType::TimeSpan) => Value::TimeSpan(*ms),
                        (v, _) => v.clone(),
                    };
                    return Ok(ReadPlan::Constant(value));
                }
                SqlExpr::External { index, .. } => {
                    self.az.ctx.release_external(*index);
                    return Ok(ReadPlan::External(*index));
                }
                SqlExpr::Function(f) if !dialect.supports_function(f.func) => {
                    let mut args = Vec::with_capacity(f.args.len());
                    for arg in &f.args {
                        args.push(self.split_scalar(arg)?);
                    }
                    return Ok(ReadPlan::HostFunction { func: f.func, args });
                }
                _ => {}
            }
        }
        if let Some(func) = first_unsupported_function(e, dialect) {
            return Err(TranslateError::unsupported(
                func.name(),
                0,
                "function not available in SQL for this dialect",
            ));
        }
        let (value, converter) = value_expr(e.clone(), dialect);
        let acc = self.az.ctx.scope_mut(self.scope);
        let index = acc.add_output(value);
        Ok(ReadPlan::Slot {
            index,
            column: acc.outputs[index].alias.clone(),
            converter,
        })
    }
}

/// The expression as it must appear in an output column, with the converter
/// that turns the database value back into the host value.
pub fn value_expr(expr: SqlExpr, dialect: &dyn Dialect) -> (SqlExpr, ValueConverter) {
    let caps = dialect.capabilities();
    if caps.bool_as_int {
        if expr.is_predicate() {
            return (
                SqlExpr::Case {
                    whens: vec![(expr, SqlExpr::literal(1))],
                    otherwise: Box::new(SqlExpr::literal(0)),
                    ty: HostType::Bool,
                },
                ValueConverter::BoolFromInt,
            );
        }
        if let SqlExpr::Literal {
            value: Value::Bool(b),
            ..
        } = expr
        {
            return (
                SqlExpr::Literal {
                    value: Value::Int(i64::from(b)),
                    ty: HostType::Bool,
                },
                ValueConverter::BoolFromInt,
            );
        }
    }
    let converter = match &expr {
        SqlExpr::Column(c) => c.converter,
        other => match other.ty().non_null() {
            HostType::TimeSpan => ValueConverter::TimeSpanFromMillis,
            HostType::Bool if caps.bool_as_int => ValueConverter::BoolFromInt,
            _ => ValueConverter::Identity,
        },
    };
    (expr, converter)
}

/// First function inside `expr` the dialect cannot evaluate in SQL.
pub fn first_unsupported_function(expr: &SqlExpr, dialect: &dyn Dialect) -> Option<SqlFunction> {
    let mut found = None;
    visit(expr, &mut |e| {
        if found.is_none()
            && let SqlExpr::Function(f) = e
            && !dialect.supports_function(f.func)
        {
            found = Some(f.func);
        }
    });
    found
}

fn visit(expr: &SqlExpr, f: &mut impl FnMut(&SqlExpr)) {
    f(expr);
    match expr {
        SqlExpr::Binary { left, right, .. } => {
            visit(left, f);
            visit(right, f);
        }
        SqlExpr::Not(e) | SqlExpr::Negate(e) => visit(e, f),
        SqlExpr::IsNull { operand, .. }
        | SqlExpr::Cast { operand, .. }
        | SqlExpr::In { operand, .. } => visit(operand, f),
        SqlExpr::Like {
            operand, pattern, ..
        } => {
            visit(operand, f);
            visit(pattern, f);
        }
        SqlExpr::Function(func) => func.args.iter().for_each(|a| visit(a, f)),
        SqlExpr::Aggregate(a) => {
            if let Some(arg) = &a.arg {
                visit(arg, f);
            }
            if let Some(filter) = &a.filter {
                visit(filter, f);
            }
        }
        SqlExpr::Case {
            whens, otherwise, ..
        } => {
            for (w, t) in whens {
                visit(w, f);
                visit(t, f);
            }
            visit(otherwise, f);
        }
        SqlExpr::Column(_)
        | SqlExpr::Literal { .. }
        | SqlExpr::External { .. }
        | SqlExpr::Exists { .. }
        | SqlExpr::ScalarSubquery { .. } => {}
    }
}
