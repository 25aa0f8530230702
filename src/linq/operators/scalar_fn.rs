//! String, math, date and conversion helpers used inside lambda bodies.
//!
//! Each call becomes a SQL function node typed by the dialect. `LIKE`
//! patterns built from constants are escaped now; patterns from captured
//! values are escaped when the value is bound. Durations are millisecond
//! counts in SQL, so `TimeSpan` members are integer arithmetic.

use crate::dialect::escape_like;
use crate::error::TranslateError;
use crate::linq::analyzer::Analyzer;
use crate::linq::context::{LikeMode, ValueTransform};
use crate::linq::expr::{Expr, MethodCall};
use crate::linq::node::Node;
use crate::linq::sql::{DatePart, SqlBinaryOp, SqlExpr, SqlFunction, SqlFunctionExpression};
use crate::value::{HostType, Value};

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

// ── Members of scalar values ───────────────────────────────────────────────

/// Member access on a translated scalar: nullable `HasValue`/`Value`,
/// string `Length`, date parts and duration components.
pub fn translate_sql_member(
    az: &mut Analyzer<'_>,
    sql: SqlExpr,
    member: &str,
    expr: &Expr,
) -> Result<Node, TranslateError> {
    let ty = sql.ty();
    match (ty.non_null(), member) {
        (_, "HasValue") => Ok(Node::Sql(SqlExpr::is_null(sql, true))),
        (_, "Value") if ty.is_nullable() => Ok(Node::Sql(sql)),
        (HostType::String, "Length") => Ok(Node::Sql(function(az, SqlFunction::Length, vec![sql]))),
        (HostType::DateTime, _) => match DatePart::from_member(member) {
            Some(part) => Ok(Node::Sql(function(az, SqlFunction::DatePart(part), vec![sql]))),
            None => Err(az.unsupported(&format!("DateTime.{member}"), expr)),
        },
        (HostType::TimeSpan, _) => timespan_member(az, sql, member, expr).map(Node::Sql),
        _ => Err(TranslateError::UnknownMember {
            owner: format!("{ty}"),
            member: member.to_string(),
        }),
    }
}

fn timespan_member(az: &Analyzer<'_>, millis: SqlExpr, member: &str, expr: &Expr) -> Result<SqlExpr, TranslateError> {
    let nullable = millis.ty().is_nullable();
    let typed = |ty: HostType| if nullable { ty.nullable() } else { ty };
    let total = |divisor: i64| {
        let ms = SqlExpr::Cast {
            operand: Box::new(millis.clone()),
            ty: typed(HostType::Double),
        };
        if divisor == 1 {
            ms
        } else {
            SqlExpr::binary(SqlBinaryOp::Div, ms, SqlExpr::literal(divisor as f64))
        }
    };
    let component = |unit: i64, modulus: Option<i64>| {
        let ms = SqlExpr::Cast {
            operand: Box::new(millis.clone()),
            ty: typed(HostType::Int64),
        };
        let units = if unit == 1 {
            ms
        } else {
            SqlExpr::binary(SqlBinaryOp::Div, ms, SqlExpr::literal(unit))
        };
        match modulus {
            Some(m) => SqlExpr::binary(SqlBinaryOp::Mod, units, SqlExpr::literal(m)),
            None => units,
        }
    };
    Ok(match member {
        "TotalMilliseconds" => total(1),
        "TotalSeconds" => total(MS_PER_SECOND),
        "TotalMinutes" => total(MS_PER_MINUTE),
        "TotalHours" => total(MS_PER_HOUR),
        "TotalDays" => total(MS_PER_DAY),
        "Days" => component(MS_PER_DAY, None),
        "Hours" => component(MS_PER_HOUR, Some(24)),
        "Minutes" => component(MS_PER_MINUTE, Some(60)),
        "Seconds" => component(MS_PER_SECOND, Some(60)),
        "Milliseconds" => component(1, Some(MS_PER_SECOND)),
        _ => return Err(az.unsupported(&format!("TimeSpan.{member}"), expr)),
    })
}

// ── String helpers ─────────────────────────────────────────────────────────

/// `s.Contains(x)`, `s.StartsWith(x)`, `s.EndsWith(x)` as `LIKE`.
pub fn translate_like(az: &mut Analyzer<'_>, expr: &Expr, call: &MethodCall) -> Result<Node, TranslateError> {
    let Some(mode) = LikeMode::from_method(&call.method) else {
        return Err(az.unsupported(&call.method, expr));
    };
    let operand = receiver(az, call, expr)?;
    let arg = single_arg(az, call, expr)?;
    let dialect = az.dialect();
    let escape_char = dialect.like_escape();

    let (pattern, escape) = match arg {
        Expr::Constant(Value::Text(text)) => {
            let (escaped, changed) = escape_like(text, dialect.like_wildcards(), escape_char);
            (SqlExpr::literal(mode.wrap(&escaped)), changed.then_some(escape_char))
        }
        Expr::Constant(Value::Null) => return Ok(Node::Sql(SqlExpr::false_predicate())),
        host if host.is_host_evaluable() => {
            let transform = ValueTransform::LikePattern {
                mode,
                escape: escape_char,
                wildcards: dialect.like_wildcards().to_vec(),
            };
            let index = az.ctx.register_external(host, HostType::String, Some(transform));
            (
                SqlExpr::External {
                    index,
                    ty: HostType::String,
                },
                Some(escape_char),
            )
        }
        column => {
            let node = az.translate(column)?;
            let value = az.scalar(node, column)?;
            let percent = || SqlExpr::literal("%");
            let pattern = match mode {
                LikeMode::Contains => SqlExpr::binary(
                    SqlBinaryOp::Concat,
                    SqlExpr::binary(SqlBinaryOp::Concat, percent(), value),
                    percent(),
                ),
                LikeMode::StartsWith => SqlExpr::binary(SqlBinaryOp::Concat, value, percent()),
                LikeMode::EndsWith => SqlExpr::binary(SqlBinaryOp::Concat, percent(), value),
            };
            (pattern, None)
        }
    };
    Ok(Node::Sql(SqlExpr::Like {
        operand: Box::new(operand),
        pattern: Box::new(pattern),
        escape,
    }))
}

/// `ToUpper`, `ToLower`, `Trim`, `Replace`.
pub fn translate_string_fn(az: &mut Analyzer<'_>, expr: &Expr, call: &MethodCall) -> Result<Node, TranslateError> {
    let func = match call.method.as_str() {
        "ToUpper" => SqlFunction::Upper,
        "ToLower" => SqlFunction::Lower,
        "Trim" => SqlFunction::Trim,
        "Replace" => SqlFunction::Replace,
        other => return Err(az.unsupported(other, expr)),
    };
    let mut args = vec![receiver(az, call, expr)?];
    args.extend(scalar_args(az, &call.args)?);
    Ok(Node::Sql(function(az, func, args)))
}

/// `s.Substring(start[, length])`; SQL positions are 1-based.
pub fn translate_substring(az: &mut Analyzer<'_>, expr: &Expr, call: &MethodCall) -> Result<Node, TranslateError> {
    let text = receiver(az, call, expr)?;
    let mut rest = scalar_args(az, &call.args)?.into_iter();
    let Some(start) = rest.next() else {
        return Err(az.unsupported("Substring without a start index", expr));
    };
    let start = match start {
        SqlExpr::Literal {
            value: Value::Int(i),
            ..
        } => SqlExpr::literal(i + 1),
        other => SqlExpr::binary(SqlBinaryOp::Add, other, SqlExpr::literal(1)),
    };
    let mut args = vec![text, start];
    args.extend(rest);
    Ok(Node::Sql(function(az, SqlFunction::Substring, args)))
}

/// `string.IsNullOrEmpty(s)`.
pub fn translate_is_null_or_empty(
    az: &mut Analyzer<'_>,
    expr: &Expr,
    call: &MethodCall,
) -> Result<Node, TranslateError> {
    let arg = single_arg(az, call, expr)?;
    let node = az.translate(arg)?;
    let s = az.scalar(node, arg)?;
    Ok(Node::Sql(SqlExpr::binary(
        SqlBinaryOp::Or,
        SqlExpr::is_null(s.clone(), false),
        SqlExpr::eq(s, SqlExpr::literal("")),
    )))
}

/// `string.Concat(a, b, ...)` as a chain of `||`.
pub fn translate_string_concat(
    az: &mut Analyzer<'_>,
    expr: &Expr,
    call: &MethodCall,
) -> Result<Node, TranslateError> {
    let parts = scalar_args(az, &call.args)?;
    parts
        .into_iter()
        .reduce(|a, b| SqlExpr::binary(SqlBinaryOp::Concat, a, b))
        .map(Node::Sql)
        .ok_or_else(|| az.unsupported("empty Concat", expr))
}

// ── Math ───────────────────────────────────────────────────────────────────

pub fn translate_math(az: &mut Analyzer<'_>, expr: &Expr, call: &MethodCall) -> Result<Node, TranslateError> {
    let func = match call.method.as_str() {
        "Abs" => SqlFunction::Abs,
        "Round" => SqlFunction::Round,
        "Floor" => SqlFunction::Floor,
        "Ceiling" => SqlFunction::Ceiling,
        "Sqrt" => SqlFunction::Sqrt,
        "Pow" => SqlFunction::Power,
        other => return Err(az.unsupported(&format!("Math.{other}"), expr)),
    };
    let args = scalar_args(az, &call.args)?;
    Ok(Node::Sql(function(az, func, args)))
}

// ── Conversions ────────────────────────────────────────────────────────────

/// `x.ToString()`: a cast for primitives.
pub fn translate_to_string(az: &mut Analyzer<'_>, expr: &Expr, call: &MethodCall) -> Result<Node, TranslateError> {
    let Some(target) = call.target.as_deref() else {
        return Err(az.unsupported("static ToString", expr));
    };
    match az.translate(target)? {
        Node::Sql(e) if e.ty().non_null() == &HostType::String => Ok(Node::Sql(e)),
        Node::Sql(e) => Ok(Node::Sql(SqlExpr::Cast {
            operand: Box::new(e),
            ty: HostType::String,
        })),
        other => Err(az.invalid_shape(
            format!("ToString on a {} has no SQL form", other.kind_name()),
            expr,
        )),
    }
}

/// `x.GetValueOrDefault([fallback])` as `COALESCE`.
pub fn translate_value_or_default(
    az: &mut Analyzer<'_>,
    expr: &Expr,
    call: &MethodCall,
) -> Result<Node, TranslateError> {
    let value = receiver(az, call, expr)?;
    let ty = value.ty().non_null().clone();
    let fallback = match call.args.first() {
        Some(arg) => {
            let node = az.translate(arg)?;
            az.scalar(node, arg)?
        }
        None => SqlExpr::Literal {
            value: ty.default_value(),
            ty: ty.clone(),
        },
    };
    Ok(Node::Sql(SqlExpr::Function(SqlFunctionExpression {
        func: SqlFunction::Coalesce,
        args: vec![value, fallback],
        ty,
    })))
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn function(az: &Analyzer<'_>, func: SqlFunction, args: Vec<SqlExpr>) -> SqlExpr {
    let types: Vec<HostType> = args.iter().map(SqlExpr::ty).collect();
    let ty = az.dialect().function_result_type(func, &types);
    SqlExpr::Function(SqlFunctionExpression { func, args, ty })
}

fn receiver(az: &mut Analyzer<'_>, call: &MethodCall, expr: &Expr) -> Result<SqlExpr, TranslateError> {
    let Some(target) = call.target.as_deref() else {
        return Err(az.unsupported(&format!("static {}", call.method), expr));
    };
    let node = az.translate(target)?;
    az.scalar(node, target)
}

fn single_arg<'e>(az: &Analyzer<'_>, call: &'e MethodCall, expr: &Expr) -> Result<&'e Expr, TranslateError> {
    match call.args.as_slice() {
        [arg] => Ok(arg),
        _ => Err(az.unsupported(&format!("{} with {} arguments", call.method, call.args.len()), expr)),
    }
}

fn scalar_args(az: &mut Analyzer<'_>, args: &[Expr]) -> Result<Vec<SqlExpr>, TranslateError> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        let node = az.translate(arg)?;
        out.push(az.scalar(node, arg)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::*;
    use crate::dialect::GenericDialect;
    use crate::error::TranslateError;
    use crate::linq::expr::{Declaring, Expr};
    use crate::value::{HostType, Value};

    fn where_sql(pred: Expr) -> String {
        compile(&books().query("Where", vec![lam("x", pred)])).sql().to_string()
    }

    fn select_sql(e: Expr) -> String {
        compile(&books().query("Select", vec![lam("x", e)])).sql().to_string()
    }

    fn title() -> Expr {
        x().member("Title")
    }

    #[test]
    fn test_starts_with_constant() {
        let sql = where_sql(title().method(Declaring::String, "StartsWith", vec![Expr::constant("Du")]));
        assert!(sql.ends_with("WHERE (t0.Title LIKE 'Du%')"), "{sql}");
    }

    #[test]
    fn test_contains_constant_with_wildcards_is_escaped() {
        let sql = where_sql(title().method(Declaring::String, "Contains", vec![Expr::constant("50%")]));
        assert!(sql.ends_with("WHERE (t0.Title LIKE '%50\\%%' ESCAPE '\\')"), "{sql}");
    }

    #[test]
    fn test_like_parameter_transformed_at_bind() {
        let term = Expr::variable("term", HostType::String);
        let q = books().query(
            "Where",
            vec![lam("x", title().method(Declaring::String, "EndsWith", vec![term]))],
        );
        let compiled = compile(&q);
        assert!(compiled.sql().ends_with("WHERE (t0.Title LIKE @p0 ESCAPE '\\')"), "{}", compiled.sql());
        let bound = compiled.bind(&[Value::from("a_b")]).unwrap();
        assert_eq!(bound, vec![Value::from("%a\\_b")]);
    }

    #[test]
    fn test_like_against_column() {
        let sql = where_sql(
            title().method(Declaring::String, "Contains", vec![x().member("Author").member("Name")]),
        );
        assert!(sql.contains("(t0.Title LIKE (('%' || t1.Name) || '%'))"), "{sql}");
    }

    #[test]
    fn test_upper_and_length() {
        let sql = select_sql(Expr::record(vec![
            ("U", title().method(Declaring::String, "ToUpper", vec![])),
            ("L", title().member("Length")),
        ]));
        assert_eq!(sql, "SELECT UPPER(t0.Title) AS c0, LENGTH(t0.Title) AS c1 FROM books t0");
    }

    #[test]
    fn test_substring_is_one_based() {
        let sql = select_sql(title().method(
            Declaring::String,
            "Substring",
            vec![Expr::constant(0), Expr::constant(3)],
        ));
        assert_eq!(sql, "SELECT SUBSTRING(t0.Title, 1, 3) AS c0 FROM books t0");
    }

    #[test]
    fn test_is_null_or_empty() {
        let sql = where_sql(Expr::static_call(Declaring::String, "IsNullOrEmpty", vec![title()]));
        assert!(sql.ends_with("WHERE ((t0.Title IS NULL) OR (t0.Title = ''))"), "{sql}");
    }

    #[test]
    fn test_date_part() {
        let sql = where_sql(x().member("Published").member("Year").gt(Expr::constant(2000)));
        assert!(sql.ends_with("WHERE (EXTRACT(YEAR FROM t0.Published) > 2000)"), "{sql}");
    }

    #[test]
    fn test_math_round() {
        let sql = select_sql(Expr::static_call(Declaring::Math, "Round", vec![x().member("Price")]));
        assert_eq!(sql, "SELECT ROUND(t0.Price) AS c0 FROM books t0");
    }

    #[test]
    fn test_unsupported_function_evaluated_on_host_in_projection() {
        let q = books().query(
            "Select",
            vec![lam("x", Expr::static_call(Declaring::Math, "Sqrt", vec![x().member("Price")]))],
        );
        let compiled = compile_with(&q, &GenericDialect::sqlite()).unwrap();
        assert_eq!(compiled.sql(), "SELECT t0.Price AS c0 FROM books t0");
        let out = compiled
            .materialize(&[vec![Value::Float(16.0)]], &mut session(vec![]))
            .unwrap();
        assert_eq!(out, Value::List(vec![Value::Float(4.0)]));
    }

    #[test]
    fn test_timespan_total_seconds() {
        let span = orders_span();
        let q = orders().query(
            "Select",
            vec![lam("o", span.member("TotalSeconds"))],
        );
        assert_eq!(
            compile(&q).sql(),
            "SELECT (CAST(DATEDIFF_MS(t0.PlacedAt, t0.ShippedAt) AS DOUBLE PRECISION) / 1000) AS c0 FROM orders t0"
        );
    }

    #[test]
    fn test_timespan_hours_component() {
        let q = orders().query("Select", vec![lam("o", orders_span().member("Hours"))]);
        assert_eq!(
            compile(&q).sql(),
            "SELECT ((CAST(DATEDIFF_MS(t0.PlacedAt, t0.ShippedAt) AS BIGINT) / 3600000) % 24) AS c0 FROM orders t0"
        );
    }

    fn orders_span() -> Expr {
        p("o").member("ShippedAt").sub(p("o").member("PlacedAt"))
    }

    #[test]
    fn test_to_string_casts_primitives() {
        let sql = select_sql(x().member("Price").method(Declaring::Object, "ToString", vec![]));
        assert_eq!(sql, "SELECT CAST(t0.Price AS VARCHAR) AS c0 FROM books t0");
    }

    #[test]
    fn test_to_string_on_entity_rejected() {
        let q = books().query(
            "Select",
            vec![lam("x", x().method(Declaring::Object, "ToString", vec![]))],
        );
        assert!(matches!(
            compile_with(&q, &GenericDialect::ansi()),
            Err(TranslateError::InvalidProjectionShape { .. })
        ));
    }

    #[test]
    fn test_get_value_or_default() {
        let q = orders().query(
            "Select",
            vec![lam("o", p("o").member("Discount").method(Declaring::Object, "GetValueOrDefault", vec![]))],
        );
        assert_eq!(compile(&q).sql(), "SELECT COALESCE(t0.Discount, 0) AS c0 FROM orders t0");
    }

    #[test]
    fn test_has_value() {
        let q = orders().query(
            "Where",
            vec![lam("o", p("o").member("ShippedAt").member("HasValue"))],
        );
        assert!(compile(&q).sql().ends_with("WHERE (t0.ShippedAt IS NOT NULL)"));
    }
}
