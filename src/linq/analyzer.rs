//! Core expression analyzer.
//!
//! The analyzer walks an operator chain root-first, keeping a [`Seq`] (the
//! scope that produces the rows plus the shape of one row) and dispatching
//! every operator through the build-once table in
//! [`crate::linq::operators`]. Lambda bodies are analyzed into [`Node`]s with
//! the lambda's parameters bound to the current row shape.
//!
//! Operators that cannot extend the current SELECT (a filter after a
//! `Take`, a join after a `GroupBy`, anything after a set operation) first
//! wrap the current scope into a derived table: see
//! [`Analyzer::wrap_derived`].

use crate::config::TranslatorConfig;
use crate::dialect::Dialect;
use crate::error::TranslateError;
use crate::linq::chain::ExpressionChain;
use crate::linq::context::{TranslationContext, ValueTransform};
use crate::linq::expr::{BinaryOp, Declaring, Expr, MethodCall, UnaryOp};
use crate::linq::node::{EntityNode, GroupingNode, Node, ReferenceNode, Seq};
use crate::linq::operators::aggregate::build_aggregate;
use crate::linq::operators::{self, Handler};
use crate::linq::post::PostProcess;
use crate::linq::reader::{Materializer, ReadPlan};
use crate::linq::sql::{
    AggFunc, JoinType, OrderKey, ScopeId, ScopeKind, SqlBinaryOp, SqlExpr, SqlFunction,
    SqlFunctionExpression, TableExpression, TableSource,
};
use crate::linq::tier::{TierSplitter, value_expr};
use crate::schema::{Catalog, EntityInfo, ValueConverter};
use crate::value::{HostType, Value};

/// Whether a chain is the query itself or a sequence nested in a lambda.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    Root,
    Nested,
}

/// One operator application handed to a sequence handler.
#[derive(Debug, Clone, Copy)]
pub struct OperatorCall<'c> {
    pub call: &'c MethodCall,
    pub position: usize,
    pub observed: bool,
    pub mode: ChainMode,
}

impl<'c> OperatorCall<'c> {
    pub fn method(&self) -> &'c str {
        &self.call.method
    }

    pub fn operands(&self) -> &'c [Expr] {
        self.call.operands()
    }

    pub fn operand(&self, index: usize) -> Result<&'c Expr, TranslateError> {
        self.call
            .operands()
            .get(index)
            .ok_or_else(|| self.unsupported(&format!("missing argument {index}")))
    }

    pub fn text(&self) -> String {
        Expr::Call(self.call.clone()).to_text()
    }

    pub fn unsupported(&self, reason: &str) -> TranslateError {
        TranslateError::unsupported(
            self.call.method.clone(),
            self.position,
            format!("{reason}: {}", self.text()),
        )
    }

    pub fn invalid_shape(&self, reason: impl Into<String>) -> TranslateError {
        TranslateError::invalid_shape(self.call.method.clone(), reason, self.text())
    }
}

/// A chain that ended in a scalar-producing operator.
#[derive(Debug, Clone)]
pub struct Terminal {
    pub node: Node,
    pub scope: ScopeId,
    pub post: PostProcess,
}

/// Result of one operator.
#[derive(Debug, Clone)]
pub enum Step {
    Continue(Seq),
    Done(Terminal),
}

/// Result of a whole chain.
#[derive(Debug, Clone)]
pub enum Outcome {
    Sequence(Seq),
    Terminal(Terminal),
}

/// The kind of operation about to extend a scope; decides whether the
/// scope must first become a derived table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    Filter,
    Project,
    Order,
    Group,
    Join,
    Aggregate,
    SetOp,
}

pub struct Analyzer<'a> {
    pub(crate) ctx: TranslationContext,
    catalog: &'a dyn Catalog,
    dialect: &'a dyn Dialect,
    config: &'a TranslatorConfig,
    /// Enclosing chain operators, innermost last, for error reporting.
    operators: Vec<(String, usize)>,
}

impl<'a> Analyzer<'a> {
    pub fn new(
        catalog: &'a dyn Catalog,
        dialect: &'a dyn Dialect,
        config: &'a TranslatorConfig,
    ) -> Self {
        Self {
            ctx: TranslationContext::new(config),
            catalog,
            dialect,
            config,
            operators: Vec::new(),
        }
    }

    pub fn catalog(&self) -> &'a dyn Catalog {
        self.catalog
    }

    pub fn dialect(&self) -> &'a dyn Dialect {
        self.dialect
    }

    pub fn config(&self) -> &'a TranslatorConfig {
        self.config
    }

    pub fn into_context(self) -> TranslationContext {
        self.ctx
    }

    pub fn entity_info(&self, name: &str) -> Result<&'a EntityInfo, TranslateError> {
        let catalog: &'a dyn Catalog = self.catalog;
        catalog
            .entity(name)
            .ok_or_else(|| TranslateError::UnknownMember {
                owner: "catalog".to_string(),
                member: name.to_string(),
            })
    }

    // ── Errors ─────────────────────────────────────────────────────────────

    fn current_operator(&self) -> (String, usize) {
        self.operators
            .last()
            .cloned()
            .unwrap_or_else(|| ("<expression>".to_string(), 0))
    }

    pub fn unsupported(&self, what: &str, expr: &Expr) -> TranslateError {
        let (_, position) = self.current_operator();
        TranslateError::unsupported(what, position, expr.to_text())
    }

    pub fn invalid_shape(&self, reason: impl Into<String>, expr: &Expr) -> TranslateError {
        let (operator, _) = self.current_operator();
        TranslateError::invalid_shape(operator, reason, expr.to_text())
    }

    // ── Chains ─────────────────────────────────────────────────────────────

    /// Translate a query pipeline. Nested chains run in a fresh correlated
    /// subquery scope.
    pub fn translate_query(&mut self, expr: &Expr, mode: ChainMode) -> Result<Outcome, TranslateError> {
        let chain = ExpressionChain::build(expr, mode == ChainMode::Root)?;
        match mode {
            ChainMode::Root => self.run_chain(&chain, mode),
            ChainMode::Nested => {
                self.ctx.new_select_scope()?;
                let result = self.run_chain(&chain, mode);
                self.ctx.end_scope();
                result
            }
        }
    }

    /// Run a chain in the current scope.
    pub fn run_chain(
        &mut self,
        chain: &ExpressionChain<'_>,
        mode: ChainMode,
    ) -> Result<Outcome, TranslateError> {
        let first_method = chain
            .links()
            .first()
            .map(|l| l.call.method.as_str())
            .unwrap_or("<root>");
        let seq = self.translate_source(chain.root(), first_method)?;
        self.run_links(seq, chain, mode)
    }

    /// Apply every link of a chain to an already analyzed source.
    pub fn run_links(
        &mut self,
        mut seq: Seq,
        chain: &ExpressionChain<'_>,
        mode: ChainMode,
    ) -> Result<Outcome, TranslateError> {
        let count = chain.len();
        for link in chain.links() {
            let call = link.call;
            let Some(Handler::Sequence(handler)) =
                operators::lookup(call.declaring, &call.method, call.operands().len())
            else {
                return Err(TranslateError::unsupported(
                    call.method.clone(),
                    link.position,
                    Expr::Call(call.clone()).to_text(),
                ));
            };
            let op = OperatorCall {
                call,
                position: link.position,
                observed: link.observed,
                mode,
            };
            tracing::trace!(
                operator = %call.method,
                position = link.position,
                scope = seq.scope,
                "[query_translator] analyzing operator"
            );
            self.operators.push((call.method.clone(), link.position));
            let step = handler(self, seq, &op);
            self.operators.pop();
            match step? {
                Step::Continue(next) => seq = next,
                Step::Done(terminal) => {
                    if link.position + 1 != count {
                        return Err(op.unsupported("scalar result used as a sequence"));
                    }
                    return Ok(Outcome::Terminal(terminal));
                }
            }
        }
        Ok(Outcome::Sequence(seq))
    }

    fn translate_source(&mut self, root: &Expr, operator: &str) -> Result<Seq, TranslateError> {
        match root {
            Expr::EntitySet(name) => {
                let info = self.entity_info(name)?;
                let table = self.ctx.register_entity_set(info, JoinType::Inner);
                Ok(Seq {
                    scope: self.ctx.current(),
                    row: Node::Entity(EntityNode {
                        entity: info.name.clone(),
                        table,
                        prefix: String::new(),
                        nullable: false,
                    }),
                })
            }
            Expr::Parameter(_) | Expr::Member { .. } if !root.is_host_evaluable() => {
                let node = self.translate(root)?;
                Err(TranslateError::unsupported(
                    operator,
                    0,
                    format!("query over a {} source: {root}", node.kind_name()),
                ))
            }
            _ => Err(TranslateError::unsupported(
                operator,
                0,
                format!("query over an in-memory collection: {root}"),
            )),
        }
    }

    // ── Lambdas ────────────────────────────────────────────────────────────

    /// Analyze a lambda body with its parameters bound to `args`.
    pub fn apply_lambda(&mut self, lambda: &Expr, args: Vec<Node>) -> Result<Node, TranslateError> {
        let Some(l) = lambda.as_lambda() else {
            return Err(self.invalid_shape("expected a lambda", lambda));
        };
        if l.params.len() != args.len() {
            return Err(self.unsupported(
                &format!("lambda with {} parameters", l.params.len()),
                lambda,
            ));
        }
        self.ctx.new_quote_scope();
        for (param, node) in l.params.iter().zip(args) {
            self.ctx.bind(param, node);
        }
        let result = self.translate(&l.body);
        self.ctx.end_quote_scope();
        result
    }

    // ── Expressions ────────────────────────────────────────────────────────

    /// Analyze one expression.
    pub fn translate(&mut self, expr: &Expr) -> Result<Node, TranslateError> {
        match expr {
            Expr::Constant(value) => match value {
                Value::List(_) => Err(self.invalid_shape("in-memory collection used as a value", expr)),
                Value::TimeSpan(ms) => Ok(Node::Sql(SqlExpr::Literal {
                    value: Value::Int(*ms),
                    ty: HostType::TimeSpan,
                })),
                v => Ok(Node::Sql(SqlExpr::Literal {
                    value: v.clone(),
                    ty: v.host_type(),
                })),
            },
            Expr::Variable { ty, .. } => Ok(self.external(expr, ty.clone())),
            Expr::Parameter(name) => Ok(self.ctx.lookup(name)?.clone()),
            Expr::EntitySet(_) => Err(self.invalid_shape("entity set used as a value", expr)),
            Expr::Lambda(_) => Err(self.invalid_shape("lambda used as a value", expr)),
            Expr::Member { target, member } => {
                if expr.is_host_evaluable() {
                    return Ok(self.external(expr, HostType::Object));
                }
                let target = self.translate(target)?;
                self.member_access(target, member, expr)
            }
            Expr::Call(call) => self.translate_call(expr, call),
            Expr::Binary { op, left, right } => {
                if expr.is_host_evaluable() {
                    return Ok(self.external(expr, HostType::Object));
                }
                self.translate_binary(*op, left, right, expr)
            }
            Expr::Unary { op, operand } => self.translate_unary(op, operand, expr),
            Expr::Conditional {
                test,
                if_true,
                if_false,
            } => {
                let test = self.translate(test)?;
                let test = self.predicate(test, expr)?;
                let a = self.translate(if_true)?;
                let a = self.scalar(a, expr)?;
                let b = self.translate(if_false)?;
                let b = self.scalar(b, expr)?;
                let ty = match &a {
                    SqlExpr::Literal {
                        value: Value::Null, ..
                    } => b.ty(),
                    _ => a.ty(),
                };
                Ok(Node::Sql(SqlExpr::Case {
                    whens: vec![(test, a)],
                    otherwise: Box::new(b),
                    ty,
                }))
            }
            Expr::New(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (name, e) in fields {
                    out.push((name.clone(), self.translate(e)?));
                }
                Ok(Node::Record(out))
            }
        }
    }

    /// Register `expr` as an external value.
    pub fn external(&mut self, expr: &Expr, ty: HostType) -> Node {
        let transform = (ty.non_null() == &HostType::TimeSpan).then_some(ValueTransform::TimeSpanMillis);
        let index = self.ctx.register_external(expr, ty.clone(), transform);
        Node::Sql(SqlExpr::External { index, ty })
    }

    fn translate_call(&mut self, expr: &Expr, call: &MethodCall) -> Result<Node, TranslateError> {
        if expr.is_host_evaluable() && !call.declaring.is_sequence() {
            let ty = match call.declaring {
                Declaring::DateTime => HostType::DateTime,
                Declaring::TimeSpan => HostType::TimeSpan,
                _ => HostType::Object,
            };
            return Ok(self.external(expr, ty));
        }
        match operators::lookup(call.declaring, &call.method, call.operands().len()) {
            Some(Handler::Scalar(handler)) => handler(self, expr, call),
            Some(Handler::Sequence(_)) => self.translate_nested_sequence(expr, call),
            None => Err(self.unsupported(&call.method, expr)),
        }
    }

    /// A sequence operator used as a value inside a lambda: an aggregate
    /// over a group, `Contains` over a host collection, or a correlated
    /// subquery.
    fn translate_nested_sequence(&mut self, expr: &Expr, call: &MethodCall) -> Result<Node, TranslateError> {
        let chain = ExpressionChain::build(expr, false)?;
        let root = chain.root();
        if root.is_host_evaluable() {
            if chain.len() == 1 && call.method == "Contains" {
                let value = call
                    .operands()
                    .first()
                    .ok_or_else(|| self.unsupported("Contains", expr))?;
                return operators::contains::translate_host_contains(self, root, value, expr);
            }
            if expr.is_host_evaluable() {
                return Ok(self.external(expr, HostType::Object));
            }
            return Err(self.unsupported(&call.method, expr));
        }
        if matches!(root, Expr::Parameter(_) | Expr::Member { .. }) {
            return match self.translate(root)? {
                Node::Grouping(g) => operators::group_by::translate_group_aggregate(self, &g, &chain),
                Node::GroupJoin(gj) => operators::join::translate_group_join_sequence(self, &gj, &chain, expr),
                other => Err(self.invalid_shape(
                    format!("{} used as a sequence", other.kind_name()),
                    expr,
                )),
            };
        }
        match self.translate_query(expr, ChainMode::Nested)? {
            Outcome::Terminal(t) => Ok(t.node),
            Outcome::Sequence(_) => Err(self.invalid_shape("nested sequence used as a value", expr)),
        }
    }

    // ── Member access ──────────────────────────────────────────────────────

    fn member_access(&mut self, target: Node, member: &str, expr: &Expr) -> Result<Node, TranslateError> {
        match target {
            Node::Entity(e) => self.entity_member(&e, member),
            Node::Reference(r) => self.reference_member(&r, member),
            Node::Record(fields) => fields
                .into_iter()
                .find(|(name, _)| name == member)
                .map(|(_, node)| node)
                .ok_or_else(|| TranslateError::UnknownMember {
                    owner: "record".to_string(),
                    member: member.to_string(),
                }),
            Node::Grouping(g) => {
                if member == "Key" {
                    Ok(*g.key)
                } else {
                    Err(TranslateError::UnknownMember {
                        owner: "grouping".to_string(),
                        member: member.to_string(),
                    })
                }
            }
            Node::GroupJoin(_) => Err(self.invalid_shape("member of a group-join group", expr)),
            Node::Sql(sql) => operators::scalar_fn::translate_sql_member(self, sql, member, expr),
        }
    }

    pub fn entity_member(&mut self, e: &EntityNode, member: &str) -> Result<Node, TranslateError> {
        let info = self.entity_info(&e.entity)?;
        if let Some(col) = info.column(member) {
            let ty = if e.nullable {
                col.ty.clone().nullable()
            } else {
                col.ty.clone()
            };
            let column = format!("{}{}", e.prefix, col.column);
            return Ok(Node::Sql(self.ctx.register_column(e.table, &column, ty, col.converter)));
        }
        if info.reference(member).is_some() {
            return Ok(Node::Reference(ReferenceNode {
                owner: e.clone(),
                member: member.to_string(),
            }));
        }
        Err(TranslateError::UnknownMember {
            owner: e.entity.clone(),
            member: member.to_string(),
        })
    }

    /// Access through a reference. Target key members fold to the owner's
    /// foreign-key columns; anything else joins the target.
    fn reference_member(&mut self, r: &ReferenceNode, member: &str) -> Result<Node, TranslateError> {
        let owner = self.entity_info(&r.owner.entity)?;
        let reference = owner
            .reference(&r.member)
            .ok_or_else(|| TranslateError::UnknownMember {
                owner: owner.name.clone(),
                member: r.member.clone(),
            })?;
        let target = self.entity_info(&reference.target)?;
        if let Some(pos) = target.key.iter().position(|k| k == member)
            && let Some(fk) = reference.fk_members.get(pos)
            && let Some(fk_col) = owner.column(fk)
        {
            let key_ty = target
                .column(member)
                .map(|c| c.ty.clone())
                .unwrap_or_else(|| fk_col.ty.clone());
            let ty = if reference.nullable || r.owner.nullable {
                key_ty.nullable()
            } else {
                key_ty
            };
            let column = format!("{}{}", r.owner.prefix, fk_col.column);
            return Ok(Node::Sql(self.ctx.register_column(
                r.owner.table,
                &column,
                ty,
                fk_col.converter,
            )));
        }
        let joined = self.resolve_reference(r)?;
        self.entity_member(&joined, member)
    }

    /// Join a pending reference.
    pub fn resolve_reference(&mut self, r: &ReferenceNode) -> Result<EntityNode, TranslateError> {
        let catalog = self.catalog;
        self.ctx.register_association(catalog, &r.owner, &r.member)
    }

    // ── Operators ──────────────────────────────────────────────────────────

    fn translate_binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        expr: &Expr,
    ) -> Result<Node, TranslateError> {
        let l = self.translate(left)?;
        let r = self.translate(right)?;
        match op {
            BinaryOp::AndAlso | BinaryOp::OrElse => {
                let l = self.predicate(l, expr)?;
                let r = self.predicate(r, expr)?;
                let sql_op = if op == BinaryOp::AndAlso {
                    SqlBinaryOp::And
                } else {
                    SqlBinaryOp::Or
                };
                Ok(Node::Sql(SqlExpr::binary(sql_op, l, r)))
            }
            BinaryOp::Equal | BinaryOp::NotEqual => {
                let pred = self.equality(l, r, expr)?;
                Ok(Node::Sql(if op == BinaryOp::NotEqual {
                    negate(pred)
                } else {
                    pred
                }))
            }
            BinaryOp::LessThan
            | BinaryOp::LessThanOrEqual
            | BinaryOp::GreaterThan
            | BinaryOp::GreaterThanOrEqual => {
                let sql_op = match op {
                    BinaryOp::LessThan => SqlBinaryOp::Lt,
                    BinaryOp::LessThanOrEqual => SqlBinaryOp::Le,
                    BinaryOp::GreaterThan => SqlBinaryOp::Gt,
                    _ => SqlBinaryOp::Ge,
                };
                let l = self.scalar(l, expr)?;
                let r = self.scalar(r, expr)?;
                let (l, r) = self.align_operands(l, r);
                Ok(Node::Sql(SqlExpr::binary(sql_op, l, r)))
            }
            BinaryOp::Add => {
                let l = self.scalar(l, expr)?;
                let r = self.scalar(r, expr)?;
                if l.ty().non_null() == &HostType::String || r.ty().non_null() == &HostType::String {
                    return Ok(Node::Sql(SqlExpr::binary(SqlBinaryOp::Concat, l, r)));
                }
                if l.ty().non_null() == &HostType::DateTime {
                    return Err(self.unsupported("DateTime arithmetic", expr));
                }
                Ok(Node::Sql(SqlExpr::binary(SqlBinaryOp::Add, l, r)))
            }
            BinaryOp::Subtract => {
                let l = self.scalar(l, expr)?;
                let r = self.scalar(r, expr)?;
                let (lt, rt) = (l.ty(), r.ty());
                if lt.non_null() == &HostType::DateTime && rt.non_null() == &HostType::DateTime {
                    let ty = if lt.is_nullable() || rt.is_nullable() {
                        HostType::TimeSpan.nullable()
                    } else {
                        HostType::TimeSpan
                    };
                    return Ok(Node::Sql(SqlExpr::Function(SqlFunctionExpression {
                        func: SqlFunction::DateDiffMs,
                        args: vec![r, l],
                        ty,
                    })));
                }
                if lt.non_null() == &HostType::DateTime {
                    return Err(self.unsupported("DateTime arithmetic", expr));
                }
                Ok(Node::Sql(SqlExpr::binary(SqlBinaryOp::Sub, l, r)))
            }
            BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulo => {
                let sql_op = match op {
                    BinaryOp::Multiply => SqlBinaryOp::Mul,
                    BinaryOp::Divide => SqlBinaryOp::Div,
                    _ => SqlBinaryOp::Mod,
                };
                let l = self.scalar(l, expr)?;
                let r = self.scalar(r, expr)?;
                Ok(Node::Sql(SqlExpr::binary(sql_op, l, r)))
            }
            BinaryOp::Coalesce => {
                let l = self.scalar(l, expr)?;
                let r = self.scalar(r, expr)?;
                let ty = r.ty();
                Ok(Node::Sql(SqlExpr::Function(SqlFunctionExpression {
                    func: SqlFunction::Coalesce,
                    args: vec![l, r],
                    ty,
                })))
            }
        }
    }

    /// Equality between two analyzed operands. Entities and references
    /// compare by key, records field by field, NULL becomes `IS NULL`.
    fn equality(&mut self, l: Node, r: Node, expr: &Expr) -> Result<SqlExpr, TranslateError> {
        let is_null_literal = |n: &Node| {
            matches!(
                n,
                Node::Sql(SqlExpr::Literal {
                    value: Value::Null,
                    ..
                })
            )
        };
        if is_null_literal(&r) {
            return self.null_test(l, expr);
        }
        if is_null_literal(&l) {
            return self.null_test(r, expr);
        }
        match (l, r) {
            (Node::Sql(a), Node::Sql(b)) => {
                let (a, b) = self.align_operands(a, b);
                Ok(SqlExpr::eq(a, b))
            }
            (Node::Record(a), Node::Record(b)) => {
                if a.len() != b.len() {
                    return Err(self.invalid_shape("records with different shapes compared", expr));
                }
                let mut parts = Vec::with_capacity(a.len());
                for ((_, x), (_, y)) in a.into_iter().zip(b) {
                    parts.push(self.equality(x, y, expr)?);
                }
                SqlExpr::and_all(parts)
                    .ok_or_else(|| self.invalid_shape("empty records compared", expr))
            }
            (a @ (Node::Entity(_) | Node::Reference(_)), b @ (Node::Entity(_) | Node::Reference(_))) => {
                let ka = self.key_operands(&a, expr)?;
                let kb = self.key_operands(&b, expr)?;
                if ka.len() != kb.len() {
                    return Err(self.invalid_shape("entities with different keys compared", expr));
                }
                SqlExpr::and_all(ka.into_iter().zip(kb).map(|(x, y)| SqlExpr::eq(x, y)))
                    .ok_or_else(|| self.invalid_shape("entity without key compared", expr))
            }
            (a, b) => Err(self.invalid_shape(
                format!("cannot compare {} with {}", a.kind_name(), b.kind_name()),
                expr,
            )),
        }
    }

    fn null_test(&mut self, node: Node, expr: &Expr) -> Result<SqlExpr, TranslateError> {
        match node {
            Node::Sql(e) => Ok(SqlExpr::is_null(e, false)),
            other @ (Node::Entity(_) | Node::Reference(_)) => {
                let keys = self.key_operands(&other, expr)?;
                SqlExpr::and_all(keys.into_iter().map(|k| SqlExpr::is_null(k, false)))
                    .ok_or_else(|| self.invalid_shape("entity without key compared with null", expr))
            }
            other => Err(self.invalid_shape(
                format!("{} compared with null", other.kind_name()),
                expr,
            )),
        }
    }

    /// Bring a literal or external value into the representation of the
    /// column it is compared with.
    fn align_operands(&mut self, a: SqlExpr, b: SqlExpr) -> (SqlExpr, SqlExpr) {
        let converter = |e: &SqlExpr| match e {
            SqlExpr::Column(c) if c.converter != ValueConverter::Identity => Some(c.converter),
            _ => None,
        };
        if let Some(conv) = converter(&a) {
            let b = self.convert_operand(b, conv);
            return (a, b);
        }
        if let Some(conv) = converter(&b) {
            let a = self.convert_operand(a, conv);
            return (a, b);
        }
        (a, b)
    }

    fn convert_operand(&mut self, operand: SqlExpr, converter: ValueConverter) -> SqlExpr {
        match operand {
            SqlExpr::Literal { value, ty } => SqlExpr::Literal {
                value: converter.to_db(value),
                ty,
            },
            SqlExpr::External { index, ty } => {
                let Some(source) = self.ctx.external(index).filter(|e| e.transform.is_none()).map(|e| e.source.clone()) else {
                    return SqlExpr::External { index, ty };
                };
                self.ctx.release_external(index);
                let index = self.ctx.register_external(
                    &source,
                    ty.clone(),
                    Some(ValueTransform::Converter(converter)),
                );
                SqlExpr::External { index, ty }
            }
            other => other,
        }
    }

    fn translate_unary(&mut self, op: &UnaryOp, operand: &Expr, expr: &Expr) -> Result<Node, TranslateError> {
        if expr.is_host_evaluable() {
            let ty = match op {
                UnaryOp::Convert(ty) => ty.clone(),
                _ => HostType::Object,
            };
            return Ok(self.external(expr, ty));
        }
        let node = self.translate(operand)?;
        match op {
            UnaryOp::Not => {
                let p = self.predicate(node, expr)?;
                Ok(Node::Sql(negate(p)))
            }
            UnaryOp::Negate => {
                let e = self.scalar(node, expr)?;
                Ok(Node::Sql(SqlExpr::Negate(Box::new(e))))
            }
            UnaryOp::Convert(ty) => match node {
                Node::Sql(e) => {
                    let from = e.ty();
                    let to = ty.non_null();
                    if to == from.non_null() || to == &HostType::Object || !to.is_primitive() {
                        Ok(Node::Sql(e))
                    } else {
                        Ok(Node::Sql(SqlExpr::Cast {
                            operand: Box::new(e),
                            ty: ty.clone(),
                        }))
                    }
                }
                other => Ok(other),
            },
        }
    }

    // ── Shape helpers ──────────────────────────────────────────────────────

    /// The node as a single SQL scalar.
    pub fn scalar(&mut self, node: Node, expr: &Expr) -> Result<SqlExpr, TranslateError> {
        match node {
            Node::Sql(e) => Ok(e),
            other => Err(self.invalid_shape(
                format!("{} used where a scalar is required", other.kind_name()),
                expr,
            )),
        }
    }

    /// The node as a SQL predicate.
    pub fn predicate(&mut self, node: Node, expr: &Expr) -> Result<SqlExpr, TranslateError> {
        let e = self.scalar(node, expr)?;
        Ok(self.to_predicate(e))
    }

    pub fn to_predicate(&self, e: SqlExpr) -> SqlExpr {
        if e.is_predicate() {
            return e;
        }
        match e {
            SqlExpr::Literal {
                value: Value::Bool(true),
                ..
            } => SqlExpr::eq(SqlExpr::literal(1), SqlExpr::literal(1)),
            SqlExpr::Literal {
                value: Value::Bool(false),
                ..
            } => SqlExpr::false_predicate(),
            other if other.ty().non_null() == &HostType::Bool
                && self.dialect.capabilities().bool_as_int =>
            {
                SqlExpr::eq(other, SqlExpr::literal(1))
            }
            other => other,
        }
    }

    /// Operands used to compare or join on a node: key columns for
    /// entities, foreign-key columns for references, fields for records.
    pub fn key_operands(&mut self, node: &Node, expr: &Expr) -> Result<Vec<SqlExpr>, TranslateError> {
        match node {
            Node::Sql(e) => Ok(vec![e.clone()]),
            Node::Entity(e) => {
                let info = self.entity_info(&e.entity)?;
                let mut out = Vec::new();
                for key in &info.key {
                    if let Node::Sql(col) = self.entity_member(e, key)? {
                        out.push(col);
                    }
                }
                Ok(out)
            }
            Node::Reference(r) => {
                let owner = self.entity_info(&r.owner.entity)?;
                let reference = owner.reference(&r.member).ok_or_else(|| {
                    TranslateError::UnknownMember {
                        owner: owner.name.clone(),
                        member: r.member.clone(),
                    }
                })?;
                let target = self.entity_info(&reference.target)?;
                let mut out = Vec::new();
                for key in &target.key {
                    if let Node::Sql(col) = self.reference_member(r, key)? {
                        out.push(col);
                    }
                }
                Ok(out)
            }
            Node::Record(fields) => {
                let mut out = Vec::new();
                for (_, n) in fields {
                    out.extend(self.key_operands(n, expr)?);
                }
                Ok(out)
            }
            other => Err(self.invalid_shape(
                format!("{} used as a key", other.kind_name()),
                expr,
            )),
        }
    }

    /// Every column of a node: entities contribute all mapped columns.
    pub fn flatten(&mut self, node: &Node, expr: &Expr) -> Result<Vec<SqlExpr>, TranslateError> {
        match node {
            Node::Sql(e) => Ok(vec![e.clone()]),
            Node::Entity(e) => {
                let info = self.entity_info(&e.entity)?;
                let mut out = Vec::with_capacity(info.columns.len());
                for col in &info.columns {
                    if let Node::Sql(c) = self.entity_member(e, &col.member)? {
                        out.push(c);
                    }
                }
                Ok(out)
            }
            Node::Reference(r) => {
                let e = self.resolve_reference(r)?;
                self.flatten(&Node::Entity(e), expr)
            }
            Node::Record(fields) => {
                let mut out = Vec::new();
                for (_, n) in fields {
                    out.extend(self.flatten(n, expr)?);
                }
                Ok(out)
            }
            other => Err(self.invalid_shape(
                format!("{} cannot be flattened into columns", other.kind_name()),
                expr,
            )),
        }
    }

    /// Emit GROUP BY for a grouping that is consumed in SQL.
    pub fn push_grouping(&mut self, g: &mut GroupingNode, expr: &Expr) -> Result<(), TranslateError> {
        if g.pushed {
            return Ok(());
        }
        let keys = self.flatten(&g.key, expr)?;
        let keys = self.grouping_keys(keys);
        self.discard_ordering(g.scope, "grouping");
        if keys.is_empty() {
            // Constant key: one group, and none over an empty input.
            let count = build_aggregate(self, AggFunc::Count, None, false, None);
            let nonempty = SqlExpr::binary(SqlBinaryOp::Gt, count, SqlExpr::literal(0));
            self.ctx.scope_mut(g.scope).add_having(nonempty);
        }
        self.ctx.scope_mut(g.scope).group_by = keys;
        g.pushed = true;
        Ok(())
    }

    /// Keep the key columns that vary per row. Literals and external values
    /// are constant within one execution and are not grouped on.
    pub fn grouping_keys(&self, keys: Vec<SqlExpr>) -> Vec<SqlExpr> {
        keys.into_iter()
            .filter(|k| !matches!(k, SqlExpr::Literal { .. } | SqlExpr::External { .. }))
            .collect()
    }

    // ── Discarded expressions ──────────────────────────────────────────────

    /// Drop one use of every external value the expressions reference.
    pub fn release_exprs<'e>(&mut self, exprs: impl IntoIterator<Item = &'e SqlExpr>) {
        let mut indices = Vec::new();
        for e in exprs {
            e.externals(&mut indices);
        }
        for index in indices {
            self.ctx.release_external(index);
        }
    }

    /// Remove the ORDER BY of a scope. Row order is meaningless under a
    /// grouping, an aggregate, an existence test or a set-operation member.
    pub fn discard_ordering(&mut self, scope: ScopeId, under: &str) {
        let keys = std::mem::take(&mut self.ctx.scope_mut(scope).order_by);
        if keys.is_empty() {
            return;
        }
        self.release_exprs(keys.iter().map(|k| &k.expr));
        tracing::debug!(
            scope,
            under,
            keys = keys.len(),
            "[query_translator] dropping ORDER BY"
        );
    }

    /// Remove every output column of a scope before it is re-projected.
    pub fn discard_outputs(&mut self, scope: ScopeId) {
        let outputs = std::mem::take(&mut self.ctx.scope_mut(scope).outputs);
        self.release_exprs(outputs.iter().map(|o| &o.expr));
    }

    // ── Derived tables ─────────────────────────────────────────────────────

    pub fn needs_wrap(&self, scope: ScopeId, pending: Pending) -> bool {
        let acc = self.ctx.scope(scope);
        let limited = acc.is_limited();
        let grouped = acc.is_grouped();
        let compound = acc.is_compound();
        match pending {
            Pending::Filter | Pending::Group | Pending::Join | Pending::Aggregate => {
                limited || grouped || compound
            }
            Pending::Project => grouped || compound,
            Pending::Order => limited || compound,
            Pending::SetOp => limited,
        }
    }

    /// Wrap the sequence's scope into a derived table when `pending` cannot
    /// extend it in place.
    pub fn ensure(&mut self, seq: Seq, pending: Pending) -> Result<Seq, TranslateError> {
        if self.needs_wrap(seq.scope, pending) {
            self.wrap_derived(seq)
        } else {
            Ok(seq)
        }
    }

    /// Turn the sequence's scope into the body of a derived table inside a
    /// fresh scope, and re-express the row over the derived table's
    /// columns. Entity columns are exported as `e{n}_{column}`, scalars as
    /// `c{n}`. Ordering without a limit moves to the outer scope.
    pub fn wrap_derived(&mut self, seq: Seq) -> Result<Seq, TranslateError> {
        let inner = seq.scope;
        let outer = self.ctx.new_parent_scope(inner, ScopeKind::Derived)?;
        {
            let acc = self.ctx.scope_mut(inner);
            acc.sealed = true;
            acc.dedup_outputs = false;
        }
        let table = self.ctx.allocate_table_id();
        let mut entities = 0usize;
        let row = self.remap_into_derived(seq.row, inner, table, &mut entities)?;

        let moved = if self.ctx.scope(inner).is_limited() {
            Vec::new()
        } else {
            std::mem::take(&mut self.ctx.scope_mut(inner).order_by)
        };
        for key in moved {
            let column = self.export_scalar(key.expr, inner, table);
            self.ctx.scope_mut(outer).order_by.push(OrderKey {
                expr: column,
                descending: key.descending,
            });
        }
        self.check_set_chain(inner)?;

        let alias = self.ctx.table_alias(table);
        let discriminator = self.ctx.next_occurrence();
        self.ctx.add_table(
            outer,
            TableExpression {
                id: table,
                source: TableSource::Derived(inner),
                alias: alias.clone(),
                join: JoinType::Inner,
                condition: None,
                lock: None,
                discriminator,
            },
        );
        tracing::debug!(
            inner,
            outer,
            table = %alias,
            "[query_translator] wrapped scope as derived table"
        );
        Ok(Seq { scope: outer, row })
    }

    fn export_scalar(&mut self, e: SqlExpr, inner: ScopeId, table: crate::linq::sql::TableId) -> SqlExpr {
        let ty = e.ty();
        let (value, converter) = value_expr(e, self.dialect);
        let pos = self.ctx.scope_mut(inner).add_output(value);
        let alias = self.ctx.scope(inner).outputs[pos].alias.clone();
        self.ctx.register_column(table, &alias, ty, converter)
    }

    fn remap_into_derived(
        &mut self,
        node: Node,
        inner: ScopeId,
        table: crate::linq::sql::TableId,
        entities: &mut usize,
    ) -> Result<Node, TranslateError> {
        match node {
            Node::Sql(e) => Ok(Node::Sql(self.export_scalar(e, inner, table))),
            Node::Entity(e) => {
                let info = self.entity_info(&e.entity)?;
                let prefix = format!("e{}_", *entities);
                *entities += 1;
                for col in &info.columns {
                    let ty = if e.nullable {
                        col.ty.clone().nullable()
                    } else {
                        col.ty.clone()
                    };
                    let source = crate::linq::sql::ColumnExpression {
                        table: e.table,
                        column: format!("{}{}", e.prefix, col.column),
                        ty,
                        converter: col.converter,
                    };
                    self.ctx
                        .scope_mut(inner)
                        .add_named_output(SqlExpr::Column(source), format!("{prefix}{}", col.column));
                }
                Ok(Node::Entity(EntityNode {
                    entity: e.entity,
                    table,
                    prefix,
                    nullable: e.nullable,
                }))
            }
            Node::Reference(r) => {
                let e = self.resolve_reference(&r)?;
                self.remap_into_derived(Node::Entity(e), inner, table, entities)
            }
            Node::Record(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (name, n) in fields {
                    out.push((name, self.remap_into_derived(n, inner, table, entities)?));
                }
                Ok(Node::Record(out))
            }
            other => {
                let (operator, position) = self.current_operator();
                Err(TranslateError::unsupported(
                    operator,
                    position,
                    format!("operator applied to a {} that is not consumed in SQL", other.kind_name()),
                ))
            }
        }
    }

    /// Every member of a set-operation chain must produce the same number
    /// of output columns.
    pub fn check_set_chain(&self, head: ScopeId) -> Result<(), TranslateError> {
        let expected = self.ctx.scope(head).outputs.len();
        let mut next = self.ctx.scope(head).set_op.as_ref().map(|op| op.next);
        while let Some(id) = next {
            let member = self.ctx.scope(id);
            if member.outputs.len() != expected {
                let (operator, _) = self.current_operator();
                return Err(TranslateError::invalid_shape(
                    operator,
                    format!(
                        "set-operation members project {} and {} columns",
                        expected,
                        member.outputs.len()
                    ),
                    format!("scope {head}"),
                ));
            }
            next = member.set_op.as_ref().map(|op| op.next);
        }
        Ok(())
    }

    // ── Finalization ───────────────────────────────────────────────────────

    /// Build the root read plan and decide post-processing.
    pub fn finish(&mut self, outcome: Outcome) -> Result<PostProcess, TranslateError> {
        let (scope, node, post) = match outcome {
            Outcome::Sequence(seq) => match seq.row {
                Node::Grouping(g) if !g.pushed => return self.finish_host_grouping(seq.scope, *g.key, *g.element),
                Node::Grouping(_) => {
                    return Err(TranslateError::invalid_shape(
                        "GroupBy",
                        "a grouping filtered in SQL cannot be returned as groups",
                        "raw grouping at the end of the query",
                    ));
                }
                row => (seq.scope, row, PostProcess::Rows),
            },
            Outcome::Terminal(t) => (t.scope, t.node, t.post),
        };
        if scope != self.ctx.root() {
            return Err(TranslateError::InternalError(format!(
                "final scope {scope} is not the root scope {}",
                self.ctx.root()
            )));
        }
        let force_sql = self.ctx.scope(scope).is_compound();
        let plan = TierSplitter::new(self, scope, force_sql).split(&node)?;
        self.check_set_chain(scope)?;
        let materializer = match plan {
            ReadPlan::Entity(reader) => Materializer::Entity(reader),
            other => Materializer::Rows(other),
        };
        self.ctx.scope_mut(scope).set_materializer(materializer)?;
        Ok(post)
    }

    fn finish_host_grouping(&mut self, scope: ScopeId, key: Node, element: Node) -> Result<PostProcess, TranslateError> {
        if !self.config.host_grouping_fallback {
            return Err(TranslateError::invalid_shape(
                "GroupBy",
                "grouping is not consumed by an aggregate or projection and host grouping is disabled",
                "raw grouping at the end of the query",
            ));
        }
        tracing::debug!(scope, "[query_translator] grouping rows on the host after retrieval");
        if self.ctx.scope(scope).order_by.is_empty() {
            let marker = Expr::param("<group key>");
            for expr in self.key_operands(&key, &marker)? {
                self.ctx.scope_mut(scope).order_by.push(OrderKey {
                    expr,
                    descending: false,
                });
            }
        }
        let mut splitter = TierSplitter::new(self, scope, false);
        let key_plan = splitter.split(&key)?;
        let element_plan = splitter.split(&element)?;
        self.ctx.scope_mut(scope).set_materializer(Materializer::Rows(ReadPlan::Pair(
            Box::new(key_plan),
            Box::new(element_plan),
        )))?;
        Ok(PostProcess::HostGrouping)
    }
}

/// Logical negation, folding `IS NULL` and `EXISTS` flags.
pub fn negate(pred: SqlExpr) -> SqlExpr {
    match pred {
        SqlExpr::IsNull { operand, negated } => SqlExpr::IsNull {
            operand,
            negated: !negated,
        },
        SqlExpr::Exists { negated, subquery } => SqlExpr::Exists {
            negated: !negated,
            subquery,
        },
        SqlExpr::Binary {
            op: SqlBinaryOp::Eq,
            left,
            right,
        } => SqlExpr::Binary {
            op: SqlBinaryOp::Ne,
            left,
            right,
        },
        SqlExpr::Not(inner) => *inner,
        other => SqlExpr::Not(Box::new(other)),
    }
}
