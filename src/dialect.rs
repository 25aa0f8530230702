//! SQL dialect capabilities.
//!
//! The translator does not render dialect SQL, but several translation
//! decisions depend on the target: LIKE wildcard characters and escape,
//! boolean representation, FILTER support on aggregates, array parameters,
//! result types of functions, and which functions can run in SQL at all.
//! Functions a dialect cannot evaluate are computed on the host when they
//! appear in a projection.

use crate::linq::sql::{AggFunc, DatePart, SqlFunction};
use crate::value::HostType;

/// Feature flags of a SQL dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Booleans are stored and projected as integers.
    pub bool_as_int: bool,
    /// `agg(...) FILTER (WHERE ...)` is available.
    pub filtered_aggregates: bool,
    /// A whole list can be bound to a single parameter.
    pub array_parameters: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            bool_as_int: false,
            filtered_aggregates: true,
            array_parameters: true,
        }
    }
}

/// Dialect description consumed by the translator.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &Capabilities;

    /// Characters with wildcard meaning inside a LIKE pattern.
    fn like_wildcards(&self) -> &[char] {
        &['%', '_']
    }

    fn like_escape(&self) -> char {
        '\\'
    }

    /// Whether the dialect can evaluate `func` in SQL.
    fn supports_function(&self, func: SqlFunction) -> bool {
        let _ = func;
        true
    }

    fn function_result_type(&self, func: SqlFunction, args: &[HostType]) -> HostType {
        default_function_result_type(func, args)
    }

    fn aggregate_result_type(&self, func: AggFunc, arg: Option<&HostType>) -> HostType {
        default_aggregate_result_type(func, arg)
    }
}

/// Result types shared by the built-in dialects.
pub fn default_function_result_type(func: SqlFunction, args: &[HostType]) -> HostType {
    let first = args.first().cloned().unwrap_or(HostType::Object);
    let nullable = args.iter().any(HostType::is_nullable);
    let ty = match func {
        SqlFunction::Upper
        | SqlFunction::Lower
        | SqlFunction::Trim
        | SqlFunction::Substring
        | SqlFunction::Replace
        | SqlFunction::Concat => return HostType::String,
        SqlFunction::Length => HostType::Int32,
        SqlFunction::Abs | SqlFunction::Round | SqlFunction::Floor | SqlFunction::Ceiling => {
            first.non_null().clone()
        }
        SqlFunction::Sqrt | SqlFunction::Power => HostType::Double,
        SqlFunction::DatePart(DatePart::Date) => HostType::DateTime,
        SqlFunction::DatePart(_) => HostType::Int32,
        SqlFunction::DateDiffMs => HostType::TimeSpan,
        SqlFunction::Coalesce => {
            return args.last().cloned().unwrap_or(HostType::Object);
        }
    };
    if nullable { ty.nullable() } else { ty }
}

pub fn default_aggregate_result_type(func: AggFunc, arg: Option<&HostType>) -> HostType {
    match func {
        AggFunc::Count => HostType::Int32,
        AggFunc::LongCount => HostType::Int64,
        AggFunc::Avg => match arg.map(HostType::non_null) {
            Some(HostType::Decimal) => HostType::Decimal,
            _ => HostType::Double,
        },
        AggFunc::Sum | AggFunc::Min | AggFunc::Max => {
            arg.cloned().unwrap_or(HostType::Object)
        }
    }
}

/// Table-driven [`Dialect`] covering the common targets.
#[derive(Debug, Clone)]
pub struct GenericDialect {
    name: String,
    capabilities: Capabilities,
    wildcards: Vec<char>,
    escape: char,
    unsupported: Vec<SqlFunction>,
}

impl GenericDialect {
    /// ANSI SQL with native booleans, FILTER and array parameters.
    pub fn ansi() -> Self {
        Self {
            name: "ansi".to_string(),
            capabilities: Capabilities::default(),
            wildcards: vec!['%', '_'],
            escape: '\\',
            unsupported: Vec::new(),
        }
    }

    /// SQL Server: integer booleans, bracket wildcards, no FILTER, no array
    /// parameters.
    pub fn mssql() -> Self {
        Self {
            name: "mssql".to_string(),
            capabilities: Capabilities {
                bool_as_int: true,
                filtered_aggregates: false,
                array_parameters: false,
            },
            wildcards: vec!['%', '_', '['],
            escape: '\\',
            unsupported: Vec::new(),
        }
    }

    /// SQLite: integer booleans and a small function library.
    pub fn sqlite() -> Self {
        Self {
            name: "sqlite".to_string(),
            capabilities: Capabilities {
                bool_as_int: true,
                filtered_aggregates: true,
                array_parameters: false,
            },
            wildcards: vec!['%', '_'],
            escape: '\\',
            unsupported: vec![
                SqlFunction::Floor,
                SqlFunction::Ceiling,
                SqlFunction::Sqrt,
                SqlFunction::Power,
                SqlFunction::DatePart(DatePart::DayOfYear),
            ],
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Mark a function as evaluated on the host.
    pub fn without_function(mut self, func: SqlFunction) -> Self {
        self.unsupported.push(func);
        self
    }
}

impl Dialect for GenericDialect {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn like_wildcards(&self) -> &[char] {
        &self.wildcards
    }

    fn like_escape(&self) -> char {
        self.escape
    }

    fn supports_function(&self, func: SqlFunction) -> bool {
        !self.unsupported.contains(&func)
    }
}

/// Escape every wildcard and escape character of `text` for use inside a
/// LIKE pattern. Returns the escaped text and whether anything changed.
pub fn escape_like(text: &str, wildcards: &[char], escape: char) -> (String, bool) {
    let mut out = String::with_capacity(text.len());
    let mut escaped = false;
    for c in text.chars() {
        if c == escape || wildcards.contains(&c) {
            out.push(escape);
            escaped = true;
        }
        out.push(c);
    }
    (out, escaped)
}
