//! Per-translation state: the scope arena, lambda-parameter bindings and the
//! external-value pool.
//!
//! Scopes form a tree through parent ids. The *current* scope is the top
//! of a stack that operators push and pop as they descend into correlated
//! subqueries. Binding frames form a second, independent stack so that a
//! lambda's parameters are visible only while its body is analyzed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::TranslatorConfig;
use crate::error::TranslateError;
use crate::linq::expr::Expr;
use crate::linq::node::Node;
use crate::linq::sql::{ScopeId, ScopeKind, SelectAccumulator, TableId};
use crate::schema::ValueConverter;
use crate::value::{HostType, Value};

// ── External values ────────────────────────────────────────────────────────

/// Where a LIKE pattern places the bound text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LikeMode {
    Contains,
    StartsWith,
    EndsWith,
}

impl LikeMode {
    pub fn from_method(method: &str) -> Option<LikeMode> {
        match method {
            "Contains" => Some(LikeMode::Contains),
            "StartsWith" => Some(LikeMode::StartsWith),
            "EndsWith" => Some(LikeMode::EndsWith),
            _ => None,
        }
    }

    /// Wrap already-escaped text with `%` wildcards.
    pub fn wrap(self, escaped: &str) -> String {
        match self {
            LikeMode::Contains => format!("%{escaped}%"),
            LikeMode::StartsWith => format!("{escaped}%"),
            LikeMode::EndsWith => format!("%{escaped}"),
        }
    }
}

/// Rewrite applied to a host value when it is bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueTransform {
    /// Escape wildcards and wrap the text into a LIKE pattern.
    LikePattern {
        mode: LikeMode,
        escape: char,
        wildcards: Vec<char>,
    },
    /// Durations travel as millisecond counts.
    TimeSpanMillis,
    /// Convert to the database representation of the compared column.
    Converter(ValueConverter),
    /// Convert every element of a collection bound as an array parameter.
    ElementConverter(ValueConverter),
}

impl ValueTransform {
    pub fn apply(&self, value: Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            ValueTransform::LikePattern {
                mode,
                escape,
                wildcards,
            } => match value {
                Value::Text(s) => {
                    let (escaped, _) = crate::dialect::escape_like(&s, wildcards, *escape);
                    Ok(Value::Text(mode.wrap(&escaped)))
                }
                other => Err(format!(
                    "LIKE pattern expects text, got {}",
                    other.type_name()
                )),
            },
            ValueTransform::TimeSpanMillis => match value {
                Value::TimeSpan(ms) | Value::Int(ms) => Ok(Value::Int(ms)),
                other => Err(format!("expected a duration, got {}", other.type_name())),
            },
            ValueTransform::Converter(converter) => Ok(converter.to_db(value)),
            ValueTransform::ElementConverter(converter) => match value {
                Value::List(items) => Ok(Value::List(
                    items.into_iter().map(|v| converter.to_db(v)).collect(),
                )),
                other => Err(format!(
                    "array parameter expects a list, got {}",
                    other.type_name()
                )),
            },
        }
    }
}

/// A host-supplied runtime value referenced by the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalValue {
    pub index: usize,
    /// Host expression that produces the value at execution time.
    pub source: Expr,
    pub ty: HostType,
    pub transform: Option<ValueTransform>,
    /// Number of live SQL references. Zero means the value is only read on
    /// the host (or not at all) and is not bound as a parameter.
    pub use_count: usize,
}

// ── Context ────────────────────────────────────────────────────────────────

/// Mutable state of one translation.
#[derive(Debug)]
pub struct TranslationContext {
    scopes: Vec<SelectAccumulator>,
    root: ScopeId,
    stack: Vec<ScopeId>,
    frames: Vec<HashMap<String, Node>>,
    externals: Vec<ExternalValue>,
    next_table: usize,
    next_occurrence: usize,
    alias_prefix: String,
    max_depth: usize,
}

impl TranslationContext {
    pub fn new(config: &TranslatorConfig) -> Self {
        Self {
            scopes: vec![SelectAccumulator::new(0, None, ScopeKind::Root)],
            root: 0,
            stack: vec![0],
            frames: Vec::new(),
            externals: Vec::new(),
            next_table: 0,
            next_occurrence: 0,
            alias_prefix: config.table_alias_prefix.clone(),
            max_depth: config.max_scope_depth,
        }
    }

    // ── Scopes ─────────────────────────────────────────────────────────────

    pub fn root(&self) -> ScopeId {
        self.root
    }

    pub fn current(&self) -> ScopeId {
        self.stack.last().copied().unwrap_or(self.root)
    }

    pub fn scope(&self, id: ScopeId) -> &SelectAccumulator {
        &self.scopes[id]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut SelectAccumulator {
        &mut self.scopes[id]
    }

    pub fn scopes(&self) -> &[SelectAccumulator] {
        &self.scopes
    }

    /// Number of scopes from `id` up to its tree root, inclusive.
    pub fn depth(&self, id: ScopeId) -> usize {
        self.ancestors(id).len()
    }

    /// `id` followed by its ancestors, nearest first.
    pub fn ancestors(&self, id: ScopeId) -> Vec<ScopeId> {
        let mut chain = vec![id];
        let mut current = self.scopes[id].parent;
        while let Some(p) = current {
            chain.push(p);
            current = self.scopes[p].parent;
        }
        chain
    }

    /// Lowest common ancestor of two scopes, `None` for separate trees.
    pub fn lowest_common_ancestor(&self, a: ScopeId, b: ScopeId) -> Option<ScopeId> {
        let of_a = self.ancestors(a);
        self.ancestors(b).into_iter().find(|s| of_a.contains(s))
    }

    /// Whether the scope or one of its ancestors is sealed.
    pub fn is_sealed(&self, id: ScopeId) -> bool {
        self.ancestors(id).iter().any(|&s| self.scopes[s].sealed)
    }

    fn push_scope(&mut self, parent: Option<ScopeId>, kind: ScopeKind) -> Result<ScopeId, TranslateError> {
        let id = self.scopes.len();
        self.scopes.push(SelectAccumulator::new(id, parent, kind));
        if self.depth(id) > self.max_depth {
            self.scopes.pop();
            return Err(TranslateError::NestingTooDeep(self.max_depth));
        }
        self.stack.push(id);
        Ok(id)
    }

    /// Push a correlated subquery scope under the current scope.
    pub fn new_select_scope(&mut self) -> Result<ScopeId, TranslateError> {
        let parent = self.current();
        self.push_scope(Some(parent), ScopeKind::Subquery)
    }

    /// Push a scope sharing the current scope's parent, for a set-operation
    /// member.
    pub fn new_sister_scope(&mut self) -> Result<ScopeId, TranslateError> {
        let parent = self.scopes[self.current()].parent;
        self.push_scope(parent, ScopeKind::SetMember)
    }

    /// Insert a fresh scope between `child` and its parent. The fresh scope
    /// takes over `child`'s kind and place on the scope stack; `child`
    /// becomes `child_kind`.
    pub fn new_parent_scope(
        &mut self,
        child: ScopeId,
        child_kind: ScopeKind,
    ) -> Result<ScopeId, TranslateError> {
        if self.depth(child) + 1 > self.max_depth {
            return Err(TranslateError::NestingTooDeep(self.max_depth));
        }
        let id = self.scopes.len();
        let parent = self.scopes[child].parent;
        let kind = self.scopes[child].kind;
        self.scopes.push(SelectAccumulator::new(id, parent, kind));
        self.scopes[child].parent = Some(id);
        self.scopes[child].kind = child_kind;
        if self.root == child {
            self.root = id;
        }
        for s in self.stack.iter_mut() {
            if *s == child {
                *s = id;
            }
        }
        Ok(id)
    }

    /// Make an existing scope current again, for example to analyze an
    /// operand that belongs to the enclosing query. Pair with `end_scope`.
    pub fn enter_scope(&mut self, id: ScopeId) {
        self.stack.push(id);
    }

    /// Pop the current scope.
    pub fn end_scope(&mut self) {
        if self.stack.len() > 1 {
            self.stack.pop();
        }
    }

    // ── Tables ─────────────────────────────────────────────────────────────

    pub fn allocate_table_id(&mut self) -> TableId {
        let id = TableId(self.next_table);
        self.next_table += 1;
        id
    }

    pub fn table_alias(&self, id: TableId) -> String {
        format!("{}{}", self.alias_prefix, id.0)
    }

    /// Discriminator for a fresh, independent occurrence of an entity set.
    pub fn next_occurrence(&mut self) -> String {
        let d = format!("set#{}", self.next_occurrence);
        self.next_occurrence += 1;
        d
    }

    // ── Bindings ───────────────────────────────────────────────────────────

    /// Open an isolated binding frame for a lambda body.
    pub fn new_quote_scope(&mut self) {
        self.frames.push(HashMap::new());
    }

    pub fn end_quote_scope(&mut self) {
        self.frames.pop();
    }

    /// Bind a parameter in the innermost frame.
    pub fn bind(&mut self, name: &str, node: Node) {
        if self.frames.is_empty() {
            self.frames.push(HashMap::new());
        }
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.to_string(), node);
        }
    }

    /// Resolve a parameter, innermost frame first.
    pub fn lookup(&self, name: &str) -> Result<&Node, TranslateError> {
        self.frames
            .iter()
            .rev()
            .find_map(|f| f.get(name))
            .ok_or_else(|| TranslateError::UnboundParameter(name.to_string()))
    }

    // ── External values ────────────────────────────────────────────────────

    /// Register a host value, or bump the use count of an identical
    /// registration. Returns its index.
    pub fn register_external(
        &mut self,
        source: &Expr,
        ty: HostType,
        transform: Option<ValueTransform>,
    ) -> usize {
        if let Some(existing) = self
            .externals
            .iter_mut()
            .find(|e| &e.source == source && e.transform == transform)
        {
            existing.use_count += 1;
            return existing.index;
        }
        let index = self.externals.len();
        self.externals.push(ExternalValue {
            index,
            source: source.clone(),
            ty,
            transform,
            use_count: 1,
        });
        index
    }

    /// Drop one SQL reference to an external value.
    pub fn release_external(&mut self, index: usize) {
        if let Some(e) = self.externals.get_mut(index) {
            e.use_count = e.use_count.saturating_sub(1);
        }
    }

    pub fn external(&self, index: usize) -> Option<&ExternalValue> {
        self.externals.get(index)
    }

    pub fn externals(&self) -> &[ExternalValue] {
        &self.externals
    }

    /// Consume the context.
    pub fn into_parts(self) -> (Vec<SelectAccumulator>, ScopeId, Vec<ExternalValue>) {
        (self.scopes, self.root, self.externals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linq::sql::SqlExpr;

    fn ctx() -> TranslationContext {
        TranslationContext::new(&TranslatorConfig::default())
    }

    #[test]
    fn test_select_scope_parenting() {
        let mut c = ctx();
        let s1 = c.new_select_scope().unwrap();
        assert_eq!(c.scope(s1).parent, Some(0));
        assert_eq!(c.current(), s1);
        let s2 = c.new_select_scope().unwrap();
        assert_eq!(c.depth(s2), 3);
        c.end_scope();
        c.end_scope();
        assert_eq!(c.current(), 0);
        c.end_scope();
        assert_eq!(c.current(), 0, "root scope is never popped");
    }

    #[test]
    fn test_nesting_too_deep() {
        let config = TranslatorConfig {
            max_scope_depth: 2,
            ..TranslatorConfig::default()
        };
        let mut c = TranslationContext::new(&config);
        c.new_select_scope().unwrap();
        assert!(matches!(
            c.new_select_scope(),
            Err(TranslateError::NestingTooDeep(2))
        ));
    }

    #[test]
    fn test_parent_scope_replaces_root() {
        let mut c = ctx();
        let p = c.new_parent_scope(0, ScopeKind::Derived).unwrap();
        assert_eq!(c.root(), p);
        assert_eq!(c.current(), p);
        assert_eq!(c.scope(0).parent, Some(p));
        assert_eq!(c.scope(0).kind, ScopeKind::Derived);
        assert_eq!(c.scope(p).kind, ScopeKind::Root);
    }

    #[test]
    fn test_sister_scope_shares_parent() {
        let mut c = ctx();
        let s1 = c.new_select_scope().unwrap();
        let s2 = c.new_sister_scope().unwrap();
        assert_eq!(c.scope(s2).parent, c.scope(s1).parent);
        assert_eq!(c.lowest_common_ancestor(s1, s2), Some(0));
    }

    #[test]
    fn test_lca_of_separate_trees() {
        let mut c = ctx();
        let sister = c.new_sister_scope().unwrap();
        assert_eq!(c.scope(sister).parent, None);
        assert_eq!(c.lowest_common_ancestor(0, sister), None);
    }

    #[test]
    fn test_binding_shadowing() {
        let mut c = ctx();
        c.new_quote_scope();
        c.bind("x", Node::Sql(SqlExpr::literal(1)));
        c.new_quote_scope();
        c.bind("x", Node::Sql(SqlExpr::literal(2)));
        assert_eq!(c.lookup("x").unwrap(), &Node::Sql(SqlExpr::literal(2)));
        c.end_quote_scope();
        assert_eq!(c.lookup("x").unwrap(), &Node::Sql(SqlExpr::literal(1)));
        c.end_quote_scope();
        assert!(matches!(c.lookup("x"), Err(TranslateError::UnboundParameter(_))));
    }

    #[test]
    fn test_external_registration_dedups() {
        let mut c = ctx();
        let v = Expr::variable("v", HostType::Int32);
        let a = c.register_external(&v, HostType::Int32, None);
        let b = c.register_external(&v, HostType::Int32, None);
        assert_eq!(a, b);
        assert_eq!(c.external(a).unwrap().use_count, 2);
        let t = c.register_external(&v, HostType::Int32, Some(ValueTransform::TimeSpanMillis));
        assert_ne!(a, t);
        c.release_external(a);
        c.release_external(a);
        c.release_external(a);
        assert_eq!(c.external(a).unwrap().use_count, 0);
    }

    #[test]
    fn test_like_pattern_transform() {
        let t = ValueTransform::LikePattern {
            mode: LikeMode::StartsWith,
            escape: '\\',
            wildcards: vec!['%', '_'],
        };
        assert_eq!(
            t.apply(Value::Text("10%".into())),
            Ok(Value::Text("10\\%%".into()))
        );
        assert_eq!(t.apply(Value::Null), Ok(Value::Null));
        assert!(t.apply(Value::Int(1)).is_err());
    }
}
