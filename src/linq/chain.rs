//! Flattening of nested operator calls into an ordered chain.
//!
//! `books.Where(p).Select(s).Count()` arrives as
//! `Count(Select(Where(books, p), s))`; the chain lists the operator
//! applications root-first: `[Where, Select, Count]` over the root `books`.

use crate::error::TranslateError;
use crate::linq::expr::{Expr, MethodCall};

/// One operator application in a chain.
#[derive(Debug, Clone, Copy)]
pub struct ChainLink<'a> {
    pub call: &'a MethodCall,
    /// Position in the chain, root-first, starting at 0.
    pub position: usize,
    /// Set on the last link when the chain's result is observed by the
    /// caller of the whole query rather than consumed by an enclosing
    /// expression.
    pub observed: bool,
}

/// An operator chain over a root source expression.
#[derive(Debug, Clone)]
pub struct ExpressionChain<'a> {
    root: &'a Expr,
    links: Vec<ChainLink<'a>>,
}

impl<'a> ExpressionChain<'a> {
    /// Flatten `expr`. `observed` marks the final link as externally
    /// observed.
    pub fn build(expr: &'a Expr, observed: bool) -> Result<Self, TranslateError> {
        let mut calls = Vec::new();
        let mut current = expr;
        while let Expr::Call(call) = current {
            let Some(source) = call.source() else {
                break;
            };
            calls.push(call);
            current = source;
        }

        if !is_chain_root(current) {
            let operator = calls
                .last()
                .map(|c| c.method.clone())
                .unwrap_or_else(|| "<root>".to_string());
            return Err(TranslateError::unsupported(
                operator,
                0,
                format!("unsupported query root: {current}"),
            ));
        }

        calls.reverse();
        let count = calls.len();
        let links = calls
            .into_iter()
            .enumerate()
            .map(|(position, call)| ChainLink {
                call,
                position,
                observed: observed && position + 1 == count,
            })
            .collect();
        Ok(ExpressionChain {
            root: current,
            links,
        })
    }

    pub fn root(&self) -> &'a Expr {
        self.root
    }

    pub fn links(&self) -> &[ChainLink<'a>] {
        &self.links
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn last(&self) -> Option<&ChainLink<'a>> {
        self.links.last()
    }
}

/// Expressions that may start a chain: entity sets, lambda parameters and
/// their members (groupings, group-join groups), and host collections.
fn is_chain_root(expr: &Expr) -> bool {
    match expr {
        Expr::EntitySet(_) | Expr::Parameter(_) | Expr::Variable { .. } => true,
        Expr::Constant(v) => v.as_list().is_some(),
        Expr::Member { .. } => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linq::expr::Declaring;

    fn pipeline() -> Expr {
        Expr::entity_set("Book")
            .query(
                "Where",
                vec![Expr::lambda(&["x"], Expr::param("x").member("A").eq(Expr::constant(1)))],
            )
            .query("Select", vec![Expr::lambda(&["x"], Expr::param("x").member("B"))])
            .query("Count", vec![])
    }

    #[test]
    fn test_build_orders_links_root_first() {
        let q = pipeline();
        let chain = ExpressionChain::build(&q, true).unwrap();
        assert_eq!(chain.root(), &Expr::entity_set("Book"));
        let methods: Vec<&str> = chain.links().iter().map(|l| l.call.method.as_str()).collect();
        assert_eq!(methods, vec!["Where", "Select", "Count"]);
        assert_eq!(chain.links()[2].position, 2);
    }

    #[test]
    fn test_only_last_link_observed() {
        let q = pipeline();
        let chain = ExpressionChain::build(&q, true).unwrap();
        let observed: Vec<bool> = chain.links().iter().map(|l| l.observed).collect();
        assert_eq!(observed, vec![false, false, true]);

        let nested = ExpressionChain::build(&q, false).unwrap();
        assert!(nested.links().iter().all(|l| !l.observed));
    }

    #[test]
    fn test_bare_root_is_empty_chain() {
        let q = Expr::entity_set("Book");
        let chain = ExpressionChain::build(&q, true).unwrap();
        assert!(chain.is_empty());
    }

    #[test]
    fn test_unsupported_root_shape() {
        let q = Expr::constant(5).query("Count", vec![]);
        let err = ExpressionChain::build(&q, true).unwrap_err();
        assert!(matches!(err, TranslateError::UnsupportedOperator { .. }));
        assert!(err.to_string().contains("Count"));
    }

    #[test]
    fn test_collection_contains_roots_at_receiver() {
        let q = Expr::constant(vec![1, 2]).method(
            Declaring::Collection,
            "Contains",
            vec![Expr::param("x").member("Id")],
        );
        let chain = ExpressionChain::build(&q, false).unwrap();
        assert_eq!(chain.root(), &Expr::constant(vec![1, 2]));
        assert_eq!(chain.len(), 1);
    }
}
