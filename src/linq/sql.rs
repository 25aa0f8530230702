//! SQL intermediate representation.
//!
//! Translation builds one [`SelectAccumulator`] per SELECT scope inside the
//! translation context; at the end the arena is frozen into an immutable
//! [`SqlAst`]. Subqueries (EXISTS, IN, scalar, derived tables, set-operation
//! members) are referenced by [`ScopeId`], never by pointer.

use serde::{Deserialize, Serialize};

use crate::error::TranslateError;
use crate::linq::reader::Materializer;
use crate::schema::ValueConverter;
use crate::value::{HostType, Value};

/// Index of a scope in the scope arena.
pub type ScopeId = usize;

/// Unique table id across one translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub usize);

// ── Expressions ────────────────────────────────────────────────────────────

/// A column of a registered table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnExpression {
    pub table: TableId,
    pub column: String,
    pub ty: HostType,
    pub converter: ValueConverter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlBinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
}

impl SqlBinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            SqlBinaryOp::Eq
                | SqlBinaryOp::Ne
                | SqlBinaryOp::Lt
                | SqlBinaryOp::Le
                | SqlBinaryOp::Gt
                | SqlBinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, SqlBinaryOp::And | SqlBinaryOp::Or)
    }

    pub fn to_sql(self) -> &'static str {
        match self {
            SqlBinaryOp::Eq => "=",
            SqlBinaryOp::Ne => "<>",
            SqlBinaryOp::Lt => "<",
            SqlBinaryOp::Le => "<=",
            SqlBinaryOp::Gt => ">",
            SqlBinaryOp::Ge => ">=",
            SqlBinaryOp::And => "AND",
            SqlBinaryOp::Or => "OR",
            SqlBinaryOp::Add => "+",
            SqlBinaryOp::Sub => "-",
            SqlBinaryOp::Mul => "*",
            SqlBinaryOp::Div => "/",
            SqlBinaryOp::Mod => "%",
            SqlBinaryOp::Concat => "||",
        }
    }
}

/// Date/time component extracted by [`SqlFunction::DatePart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatePart {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Millisecond,
    DayOfWeek,
    DayOfYear,
    /// The date with the time of day truncated.
    Date,
}

impl DatePart {
    pub fn from_member(member: &str) -> Option<DatePart> {
        Some(match member {
            "Year" => DatePart::Year,
            "Month" => DatePart::Month,
            "Day" => DatePart::Day,
            "Hour" => DatePart::Hour,
            "Minute" => DatePart::Minute,
            "Second" => DatePart::Second,
            "Millisecond" => DatePart::Millisecond,
            "DayOfWeek" => DatePart::DayOfWeek,
            "DayOfYear" => DatePart::DayOfYear,
            "Date" => DatePart::Date,
            _ => return None,
        })
    }

    pub fn to_sql(self) -> &'static str {
        match self {
            DatePart::Year => "YEAR",
            DatePart::Month => "MONTH",
            DatePart::Day => "DAY",
            DatePart::Hour => "HOUR",
            DatePart::Minute => "MINUTE",
            DatePart::Second => "SECOND",
            DatePart::Millisecond => "MILLISECOND",
            DatePart::DayOfWeek => "DOW",
            DatePart::DayOfYear => "DOY",
            DatePart::Date => "DATE",
        }
    }
}

/// SQL scalar functions the translator emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlFunction {
    Upper,
    Lower,
    Trim,
    Length,
    /// `SUBSTRING(s, start, [len])`, 1-based start.
    Substring,
    Replace,
    Concat,
    Abs,
    Round,
    Floor,
    Ceiling,
    Sqrt,
    Power,
    DatePart(DatePart),
    /// Milliseconds from the first timestamp to the second.
    DateDiffMs,
    Coalesce,
}

impl SqlFunction {
    pub fn name(self) -> &'static str {
        match self {
            SqlFunction::Upper => "UPPER",
            SqlFunction::Lower => "LOWER",
            SqlFunction::Trim => "TRIM",
            SqlFunction::Length => "LENGTH",
            SqlFunction::Substring => "SUBSTRING",
            SqlFunction::Replace => "REPLACE",
            SqlFunction::Concat => "CONCAT",
            SqlFunction::Abs => "ABS",
            SqlFunction::Round => "ROUND",
            SqlFunction::Floor => "FLOOR",
            SqlFunction::Ceiling => "CEILING",
            SqlFunction::Sqrt => "SQRT",
            SqlFunction::Power => "POWER",
            SqlFunction::DatePart(_) => "EXTRACT",
            SqlFunction::DateDiffMs => "DATEDIFF_MS",
            SqlFunction::Coalesce => "COALESCE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlFunctionExpression {
    pub func: SqlFunction,
    pub args: Vec<SqlExpr>,
    pub ty: HostType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    LongCount,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn from_method(method: &str) -> Option<AggFunc> {
        Some(match method {
            "Count" => AggFunc::Count,
            "LongCount" => AggFunc::LongCount,
            "Sum" => AggFunc::Sum,
            "Average" => AggFunc::Avg,
            "Min" => AggFunc::Min,
            "Max" => AggFunc::Max,
            _ => return None,
        })
    }

    pub fn is_count(self) -> bool {
        matches!(self, AggFunc::Count | AggFunc::LongCount)
    }

    pub fn sql_name(self) -> &'static str {
        match self {
            AggFunc::Count | AggFunc::LongCount => "COUNT",
            AggFunc::Sum => "SUM",
            AggFunc::Avg => "AVG",
            AggFunc::Min => "MIN",
            AggFunc::Max => "MAX",
        }
    }
}

/// An aggregate call. `arg == None` means `COUNT(*)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpression {
    pub func: AggFunc,
    pub arg: Option<Box<SqlExpr>>,
    pub distinct: bool,
    pub filter: Option<Box<SqlExpr>>,
    pub ty: HostType,
}

/// Right-hand side of an `IN` test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InList {
    Values(Vec<Value>),
    /// An external value bound as an array parameter.
    External(usize),
    Subquery(ScopeId),
}

/// A SQL scalar or predicate expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlExpr {
    Column(ColumnExpression),
    Literal {
        value: Value,
        ty: HostType,
    },
    /// Placeholder for a host-supplied value, by external-value index.
    External {
        index: usize,
        ty: HostType,
    },
    Binary {
        op: SqlBinaryOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    Not(Box<SqlExpr>),
    Negate(Box<SqlExpr>),
    IsNull {
        operand: Box<SqlExpr>,
        negated: bool,
    },
    Like {
        operand: Box<SqlExpr>,
        pattern: Box<SqlExpr>,
        escape: Option<char>,
    },
    In {
        operand: Box<SqlExpr>,
        list: InList,
    },
    Exists {
        negated: bool,
        subquery: ScopeId,
    },
    ScalarSubquery {
        scope: ScopeId,
        ty: HostType,
    },
    Function(SqlFunctionExpression),
    Aggregate(AggregateExpression),
    Case {
        whens: Vec<(SqlExpr, SqlExpr)>,
        otherwise: Box<SqlExpr>,
        ty: HostType,
    },
    Cast {
        operand: Box<SqlExpr>,
        ty: HostType,
    },
}

impl SqlExpr {
    pub fn literal(value: impl Into<Value>) -> SqlExpr {
        let value = value.into();
        let ty = value.host_type();
        SqlExpr::Literal { value, ty }
    }

    pub fn binary(op: SqlBinaryOp, left: SqlExpr, right: SqlExpr) -> SqlExpr {
        SqlExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: SqlExpr, right: SqlExpr) -> SqlExpr {
        SqlExpr::binary(SqlBinaryOp::Eq, left, right)
    }

    pub fn and(left: SqlExpr, right: SqlExpr) -> SqlExpr {
        SqlExpr::binary(SqlBinaryOp::And, left, right)
    }

    /// Conjunction of all expressions; `None` when empty.
    pub fn and_all(exprs: impl IntoIterator<Item = SqlExpr>) -> Option<SqlExpr> {
        exprs.into_iter().reduce(SqlExpr::and)
    }

    /// A predicate that is always false, valid in every dialect.
    pub fn false_predicate() -> SqlExpr {
        SqlExpr::eq(SqlExpr::literal(1), SqlExpr::literal(0))
    }

    pub fn is_null(operand: SqlExpr, negated: bool) -> SqlExpr {
        SqlExpr::IsNull {
            operand: Box::new(operand),
            negated,
        }
    }

    /// Static host type of the expression.
    pub fn ty(&self) -> HostType {
        match self {
            SqlExpr::Column(c) => c.ty.clone(),
            SqlExpr::Literal { ty, .. }
            | SqlExpr::External { ty, .. }
            | SqlExpr::ScalarSubquery { ty, .. }
            | SqlExpr::Case { ty, .. }
            | SqlExpr::Cast { ty, .. } => ty.clone(),
            SqlExpr::Function(f) => f.ty.clone(),
            SqlExpr::Aggregate(a) => a.ty.clone(),
            SqlExpr::Binary { op, left, right } => {
                if op.is_comparison() || op.is_logical() {
                    HostType::Bool
                } else if *op == SqlBinaryOp::Concat {
                    HostType::String
                } else {
                    let (l, r) = (left.ty(), right.ty());
                    if l.non_null() == &HostType::TimeSpan || r.non_null() == &HostType::TimeSpan {
                        l
                    } else {
                        l.widen(&r)
                    }
                }
            }
            SqlExpr::Negate(inner) => inner.ty(),
            SqlExpr::Not(_)
            | SqlExpr::IsNull { .. }
            | SqlExpr::Like { .. }
            | SqlExpr::In { .. }
            | SqlExpr::Exists { .. } => HostType::Bool,
        }
    }

    /// Whether the expression is boolean-valued by construction (as opposed
    /// to a boolean column or literal).
    pub fn is_predicate(&self) -> bool {
        match self {
            SqlExpr::Binary { op, .. } => op.is_comparison() || op.is_logical(),
            SqlExpr::Not(_)
            | SqlExpr::IsNull { .. }
            | SqlExpr::Like { .. }
            | SqlExpr::In { .. }
            | SqlExpr::Exists { .. } => true,
            _ => false,
        }
    }

    /// Whether an aggregate appears in this expression, not counting
    /// aggregates inside subqueries.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            SqlExpr::Aggregate(_) => true,
            SqlExpr::Binary { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            SqlExpr::Not(e) | SqlExpr::Negate(e) => e.contains_aggregate(),
            SqlExpr::IsNull { operand, .. }
            | SqlExpr::Cast { operand, .. }
            | SqlExpr::In { operand, .. } => operand.contains_aggregate(),
            SqlExpr::Like {
                operand, pattern, ..
            } => operand.contains_aggregate() || pattern.contains_aggregate(),
            SqlExpr::Function(f) => f.args.iter().any(SqlExpr::contains_aggregate),
            SqlExpr::Case {
                whens, otherwise, ..
            } => {
                whens
                    .iter()
                    .any(|(w, t)| w.contains_aggregate() || t.contains_aggregate())
                    || otherwise.contains_aggregate()
            }
            SqlExpr::Column(_)
            | SqlExpr::Literal { .. }
            | SqlExpr::External { .. }
            | SqlExpr::Exists { .. }
            | SqlExpr::ScalarSubquery { .. } => false,
        }
    }

    /// Indices of external values referenced directly by this expression.
    pub fn externals(&self, out: &mut Vec<usize>) {
        match self {
            SqlExpr::External { index, .. } => out.push(*index),
            SqlExpr::Binary { left, right, .. } => {
                left.externals(out);
                right.externals(out);
            }
            SqlExpr::Not(e) | SqlExpr::Negate(e) => e.externals(out),
            SqlExpr::IsNull { operand, .. } | SqlExpr::Cast { operand, .. } => {
                operand.externals(out)
            }
            SqlExpr::In { operand, list } => {
                operand.externals(out);
                if let InList::External(index) = list {
                    out.push(*index);
                }
            }
            SqlExpr::Like {
                operand, pattern, ..
            } => {
                operand.externals(out);
                pattern.externals(out);
            }
            SqlExpr::Function(f) => f.args.iter().for_each(|a| a.externals(out)),
            SqlExpr::Aggregate(a) => {
                if let Some(arg) = &a.arg {
                    arg.externals(out);
                }
                if let Some(filter) = &a.filter {
                    filter.externals(out);
                }
            }
            SqlExpr::Case {
                whens, otherwise, ..
            } => {
                for (w, t) in whens {
                    w.externals(out);
                    t.externals(out);
                }
                otherwise.externals(out);
            }
            SqlExpr::Column(_)
            | SqlExpr::Literal { .. }
            | SqlExpr::Exists { .. }
            | SqlExpr::ScalarSubquery { .. } => {}
        }
    }
}

// ── Tables ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    LeftOuter,
    Cross,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Update,
    Share,
}

impl LockMode {
    pub fn parse(mode: &str) -> Option<LockMode> {
        match mode.to_ascii_lowercase().as_str() {
            "update" => Some(LockMode::Update),
            "share" => Some(LockMode::Share),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TableSource {
    Entity { entity: String, table: String },
    /// A derived table whose body is another scope.
    Derived(ScopeId),
}

/// Identity used to de-duplicate tables: the same entity reached through
/// the same path is the same table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableIdentity {
    pub source: String,
    pub discriminator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableExpression {
    pub id: TableId,
    pub source: TableSource,
    pub alias: String,
    pub join: JoinType,
    pub condition: Option<SqlExpr>,
    pub lock: Option<LockMode>,
    pub discriminator: String,
}

impl TableExpression {
    pub fn identity(&self) -> TableIdentity {
        let source = match &self.source {
            TableSource::Entity { entity, .. } => entity.clone(),
            TableSource::Derived(scope) => format!("derived#{scope}"),
        };
        TableIdentity {
            source,
            discriminator: self.discriminator.clone(),
        }
    }

    /// Entity name for entity-backed tables.
    pub fn entity(&self) -> Option<&str> {
        match &self.source {
            TableSource::Entity { entity, .. } => Some(entity),
            TableSource::Derived(_) => None,
        }
    }
}

// ── Select scopes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    Root,
    /// Correlated subquery (EXISTS, IN, scalar).
    Subquery,
    /// Body of a derived table.
    Derived,
    /// Second or later member of a set-operation chain.
    SetMember,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetOpKind {
    Union,
    UnionAll,
    Except,
    Intersect,
}

impl SetOpKind {
    pub fn from_method(method: &str) -> Option<SetOpKind> {
        Some(match method {
            "Union" => SetOpKind::Union,
            "Concat" => SetOpKind::UnionAll,
            "Except" => SetOpKind::Except,
            "Intersect" => SetOpKind::Intersect,
            _ => return None,
        })
    }

    pub fn to_sql(self) -> &'static str {
        match self {
            SetOpKind::Union => "UNION",
            SetOpKind::UnionAll => "UNION ALL",
            SetOpKind::Except => "EXCEPT",
            SetOpKind::Intersect => "INTERSECT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetOperation {
    pub kind: SetOpKind,
    pub next: ScopeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputColumn {
    pub expr: SqlExpr,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderKey {
    pub expr: SqlExpr,
    pub descending: bool,
}

/// One SQL SELECT under construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectAccumulator {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    pub kind: ScopeKind,
    /// Sealed scopes are finished; tables inside are not visible to
    /// de-duplication or promotion.
    pub sealed: bool,
    pub tables: Vec<TableExpression>,
    #[serde(skip)]
    pub columns: Vec<ColumnExpression>,
    pub outputs: Vec<OutputColumn>,
    pub dedup_outputs: bool,
    pub predicate: Option<SqlExpr>,
    pub having: Option<SqlExpr>,
    pub group_by: Vec<SqlExpr>,
    pub distinct: bool,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<SqlExpr>,
    pub offset: Option<SqlExpr>,
    pub set_op: Option<SetOperation>,
    pub materializer: Option<Materializer>,
}

impl SelectAccumulator {
    pub fn new(id: ScopeId, parent: Option<ScopeId>, kind: ScopeKind) -> Self {
        Self {
            id,
            parent,
            kind,
            sealed: false,
            tables: Vec::new(),
            columns: Vec::new(),
            outputs: Vec::new(),
            dedup_outputs: true,
            predicate: None,
            having: None,
            group_by: Vec::new(),
            distinct: false,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            set_op: None,
            materializer: None,
        }
    }

    pub fn add_predicate(&mut self, predicate: SqlExpr) {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => SqlExpr::and(existing, predicate),
            None => predicate,
        });
    }

    pub fn add_having(&mut self, predicate: SqlExpr) {
        self.having = Some(match self.having.take() {
            Some(existing) => SqlExpr::and(existing, predicate),
            None => predicate,
        });
    }

    /// Register an output column, returning its position. Identical
    /// expressions share one output unless de-duplication is off.
    pub fn add_output(&mut self, expr: SqlExpr) -> usize {
        if self.dedup_outputs
            && let Some(pos) = self.outputs.iter().position(|o| o.expr == expr)
        {
            return pos;
        }
        let alias = format!("c{}", self.outputs.len());
        self.outputs.push(OutputColumn { expr, alias });
        self.outputs.len() - 1
    }

    /// Register an output column under an explicit alias, without
    /// de-duplication.
    pub fn add_named_output(&mut self, expr: SqlExpr, alias: String) -> usize {
        self.outputs.push(OutputColumn { expr, alias });
        self.outputs.len() - 1
    }

    pub fn set_materializer(&mut self, materializer: Materializer) -> Result<(), TranslateError> {
        if self.materializer.is_some() {
            return Err(TranslateError::InternalError(format!(
                "materialization plan for scope {} set twice",
                self.id
            )));
        }
        self.materializer = Some(materializer);
        Ok(())
    }

    pub fn find_table(&self, identity: &TableIdentity) -> Option<TableId> {
        self.tables
            .iter()
            .find(|t| &t.identity() == identity)
            .map(|t| t.id)
    }

    pub fn table(&self, id: TableId) -> Option<&TableExpression> {
        self.tables.iter().find(|t| t.id == id)
    }

    pub fn table_mut(&mut self, id: TableId) -> Option<&mut TableExpression> {
        self.tables.iter_mut().find(|t| t.id == id)
    }

    pub fn remove_table(&mut self, id: TableId) -> Option<TableExpression> {
        let pos = self.tables.iter().position(|t| t.id == id)?;
        Some(self.tables.remove(pos))
    }

    pub fn is_limited(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty() || self.having.is_some() || self.distinct
    }

    pub fn is_compound(&self) -> bool {
        self.set_op.is_some()
    }
}

// ── Frozen AST ─────────────────────────────────────────────────────────────

/// Immutable result of a translation: the scope arena, the root scope and
/// the external values that survive as SQL parameters, in positional order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlAst {
    scopes: Vec<SelectAccumulator>,
    root: ScopeId,
    parameters: Vec<usize>,
}

impl SqlAst {
    pub fn new(scopes: Vec<SelectAccumulator>, root: ScopeId, parameters: Vec<usize>) -> Self {
        Self {
            scopes,
            root,
            parameters,
        }
    }

    pub fn root(&self) -> &SelectAccumulator {
        &self.scopes[self.root]
    }

    pub fn root_id(&self) -> ScopeId {
        self.root
    }

    pub fn scope(&self, id: ScopeId) -> Option<&SelectAccumulator> {
        self.scopes.get(id)
    }

    pub fn scopes(&self) -> &[SelectAccumulator] {
        &self.scopes
    }

    /// External-value indices bound as SQL parameters, in positional order.
    pub fn parameters(&self) -> &[usize] {
        &self.parameters
    }

    /// Position of an external value among the SQL parameters.
    pub fn parameter_position(&self, external: usize) -> Option<usize> {
        self.parameters.iter().position(|&p| p == external)
    }

    pub fn table(&self, id: TableId) -> Option<&TableExpression> {
        self.scopes.iter().find_map(|s| s.table(id))
    }

    /// Scope that owns a table.
    pub fn table_scope(&self, id: TableId) -> Option<ScopeId> {
        self.scopes
            .iter()
            .find(|s| s.table(id).is_some())
            .map(|s| s.id)
    }

    pub(crate) fn set_parameters(&mut self, parameters: Vec<usize>) {
        self.parameters = parameters;
    }

    /// Every external-value reference in reachable scopes, one entry per
    /// occurrence.
    pub fn external_references(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for id in self.reachable_scopes() {
            let scope = &self.scopes[id];
            for t in &scope.tables {
                if let Some(c) = &t.condition {
                    c.externals(&mut out);
                }
            }
            for e in scope
                .outputs
                .iter()
                .map(|o| &o.expr)
                .chain(scope.predicate.iter())
                .chain(scope.having.iter())
                .chain(scope.group_by.iter())
                .chain(scope.order_by.iter().map(|k| &k.expr))
                .chain(scope.limit.iter())
                .chain(scope.offset.iter())
            {
                e.externals(&mut out);
            }
        }
        out
    }

    /// Scopes reachable from the root: subqueries, derived bodies and
    /// set-operation members. Promoted-away or abandoned scopes are skipped.
    pub fn reachable_scopes(&self) -> Vec<ScopeId> {
        let mut seen = vec![false; self.scopes.len()];
        let mut stack = vec![self.root];
        let mut order = Vec::new();
        while let Some(id) = stack.pop() {
            if id >= seen.len() || seen[id] {
                continue;
            }
            seen[id] = true;
            order.push(id);
            let scope = &self.scopes[id];
            let mut refs = Vec::new();
            scope_references(scope, &mut refs);
            for r in refs.into_iter().rev() {
                stack.push(r);
            }
        }
        order
    }
}

/// Scope ids referenced from one scope's tables and expressions.
fn scope_references(scope: &SelectAccumulator, out: &mut Vec<ScopeId>) {
    for t in &scope.tables {
        if let TableSource::Derived(id) = t.source {
            out.push(id);
        }
        if let Some(c) = &t.condition {
            expr_scope_references(c, out);
        }
    }
    for o in &scope.outputs {
        expr_scope_references(&o.expr, out);
    }
    for e in scope
        .predicate
        .iter()
        .chain(scope.having.iter())
        .chain(scope.group_by.iter())
        .chain(scope.order_by.iter().map(|k| &k.expr))
    {
        expr_scope_references(e, out);
    }
    if let Some(op) = &scope.set_op {
        out.push(op.next);
    }
}

fn expr_scope_references(expr: &SqlExpr, out: &mut Vec<ScopeId>) {
    match expr {
        SqlExpr::Exists { subquery, .. } => out.push(*subquery),
        SqlExpr::ScalarSubquery { scope, .. } => out.push(*scope),
        SqlExpr::In { operand, list } => {
            expr_scope_references(operand, out);
            if let InList::Subquery(id) = list {
                out.push(*id);
            }
        }
        SqlExpr::Binary { left, right, .. } => {
            expr_scope_references(left, out);
            expr_scope_references(right, out);
        }
        SqlExpr::Not(e) | SqlExpr::Negate(e) => expr_scope_references(e, out),
        SqlExpr::IsNull { operand, .. } | SqlExpr::Cast { operand, .. } => {
            expr_scope_references(operand, out)
        }
        SqlExpr::Like {
            operand, pattern, ..
        } => {
            expr_scope_references(operand, out);
            expr_scope_references(pattern, out);
        }
        SqlExpr::Function(f) => f.args.iter().for_each(|a| expr_scope_references(a, out)),
        SqlExpr::Aggregate(a) => {
            if let Some(arg) = &a.arg {
                expr_scope_references(arg, out);
            }
            if let Some(filter) = &a.filter {
                expr_scope_references(filter, out);
            }
        }
        SqlExpr::Case {
            whens, otherwise, ..
        } => {
            for (w, t) in whens {
                expr_scope_references(w, out);
                expr_scope_references(t, out);
            }
            expr_scope_references(otherwise, out);
        }
        SqlExpr::Column(_) | SqlExpr::Literal { .. } | SqlExpr::External { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(table: usize, name: &str) -> SqlExpr {
        SqlExpr::Column(ColumnExpression {
            table: TableId(table),
            column: name.to_string(),
            ty: HostType::Int32,
            converter: ValueConverter::Identity,
        })
    }

    #[test]
    fn test_add_predicate_builds_conjunction() {
        let mut acc = SelectAccumulator::new(0, None, ScopeKind::Root);
        acc.add_predicate(SqlExpr::eq(col(0, "A"), SqlExpr::literal(1)));
        acc.add_predicate(SqlExpr::eq(col(0, "B"), SqlExpr::literal(2)));
        match acc.predicate.unwrap() {
            SqlExpr::Binary {
                op: SqlBinaryOp::And,
                ..
            } => {}
            other => panic!("expected AND, got {other:?}"),
        }
    }

    #[test]
    fn test_add_output_dedups() {
        let mut acc = SelectAccumulator::new(0, None, ScopeKind::Root);
        assert_eq!(acc.add_output(col(0, "A")), 0);
        assert_eq!(acc.add_output(col(0, "B")), 1);
        assert_eq!(acc.add_output(col(0, "A")), 0);
        assert_eq!(acc.outputs.len(), 2);
        assert_eq!(acc.outputs[1].alias, "c1");
    }

    #[test]
    fn test_add_output_without_dedup() {
        let mut acc = SelectAccumulator::new(0, None, ScopeKind::Root);
        acc.dedup_outputs = false;
        acc.add_output(col(0, "A"));
        acc.add_output(col(0, "A"));
        assert_eq!(acc.outputs.len(), 2);
    }

    #[test]
    fn test_expression_types() {
        let cmp = SqlExpr::eq(col(0, "A"), SqlExpr::literal(1));
        assert_eq!(cmp.ty(), HostType::Bool);
        assert!(cmp.is_predicate());
        let sum = SqlExpr::binary(SqlBinaryOp::Add, col(0, "A"), SqlExpr::literal(1.5));
        assert_eq!(sum.ty(), HostType::Double);
        assert!(!sum.is_predicate());
    }

    #[test]
    fn test_contains_aggregate_skips_subqueries() {
        let agg = SqlExpr::Aggregate(AggregateExpression {
            func: AggFunc::Count,
            arg: None,
            distinct: false,
            filter: None,
            ty: HostType::Int32,
        });
        assert!(SqlExpr::binary(SqlBinaryOp::Gt, agg, SqlExpr::literal(1)).contains_aggregate());
        assert!(
            !SqlExpr::ScalarSubquery {
                scope: 1,
                ty: HostType::Int32
            }
            .contains_aggregate()
        );
    }

    #[test]
    fn test_set_materializer_once() {
        let mut acc = SelectAccumulator::new(0, None, ScopeKind::Root);
        let m = Materializer::Rows(crate::linq::reader::ReadPlan::Constant(Value::Null));
        assert!(acc.set_materializer(m.clone()).is_ok());
        assert!(matches!(
            acc.set_materializer(m),
            Err(TranslateError::InternalError(_))
        ));
    }
}
