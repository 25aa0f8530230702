//! Shared helpers for integration tests: a small inventory catalog and
//! expression shorthands.

#![allow(dead_code)]

use query_translator::{
    CompiledQuery, EntityInfo, ExecutionSession, Expr, GenericDialect, HostType, InMemoryCatalog,
    TranslateError, TranslatorConfig, Value, translate,
};

pub fn catalog() -> InMemoryCatalog {
    InMemoryCatalog::new()
        .with_entity(
            EntityInfo::new("Item", "items")
                .with_column("Id", HostType::Int32)
                .with_column("A", HostType::Int32)
                .with_column("B", HostType::Int32)
                .with_column("K", HostType::String)
                .with_key(&["Id"]),
        )
        .with_entity(
            EntityInfo::new("Other", "others")
                .with_column("Id", HostType::Int32)
                .with_column("ItemId", HostType::Int32)
                .with_column("Label", HostType::String)
                .with_key(&["Id"])
                .with_reference("Item", "Item", &["ItemId"], false),
        )
}

pub fn items() -> Expr {
    Expr::entity_set("Item")
}

pub fn others() -> Expr {
    Expr::entity_set("Other")
}

pub fn p(name: &str) -> Expr {
    Expr::param(name)
}

pub fn lam(param: &str, body: Expr) -> Expr {
    Expr::lambda(&[param], body)
}

pub fn try_compile(q: &Expr, config: &TranslatorConfig) -> Result<CompiledQuery, TranslateError> {
    translate(q, &catalog(), &GenericDialect::ansi(), config)
}

pub fn compile(q: &Expr) -> CompiledQuery {
    try_compile(q, &TranslatorConfig::default()).unwrap()
}

pub fn run(compiled: &CompiledQuery, rows: Vec<Vec<Value>>) -> Value {
    compiled
        .materialize(&rows, &mut ExecutionSession::new(vec![]))
        .unwrap()
}
