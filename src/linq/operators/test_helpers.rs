//! Shared fixtures for operator tests: a small bookstore catalog and
//! expression shorthands.

use crate::config::TranslatorConfig;
use crate::dialect::{Dialect, GenericDialect};
use crate::error::TranslateError;
use crate::linq::expr::Expr;
use crate::linq::reader::ExecutionSession;
use crate::linq::{CompiledQuery, translate};
use crate::schema::{EntityInfo, InMemoryCatalog};
use crate::value::{HostType, Value};

pub fn catalog() -> InMemoryCatalog {
    InMemoryCatalog::new()
        .with_entity(
            EntityInfo::new("Item", "items")
                .with_column("Id", HostType::Int32)
                .with_column("A", HostType::Int32)
                .with_column("B", HostType::Int32)
                .with_key(&["Id"]),
        )
        .with_entity(
            EntityInfo::new("Book", "books")
                .with_column("Id", HostType::Int32)
                .with_column("Title", HostType::String)
                .with_column("Price", HostType::Double)
                .with_column("AuthorId", HostType::Int32)
                .with_column("PublisherId", HostType::Int32.nullable())
                .with_column("Published", HostType::DateTime)
                .with_column("InStock", HostType::Bool)
                .with_key(&["Id"])
                .with_reference("Author", "Author", &["AuthorId"], false)
                .with_reference("Publisher", "Publisher", &["PublisherId"], true),
        )
        .with_entity(
            EntityInfo::new("Author", "authors")
                .with_column("Id", HostType::Int32)
                .with_column("Name", HostType::String)
                .with_column("Country", HostType::String)
                .with_key(&["Id"]),
        )
        .with_entity(
            EntityInfo::new("Publisher", "publishers")
                .with_column("Id", HostType::Int32)
                .with_column("Name", HostType::String)
                .with_key(&["Id"]),
        )
        .with_entity(
            EntityInfo::new("Order", "orders")
                .with_column("Id", HostType::Int32)
                .with_column("BookId", HostType::Int32)
                .with_column("Quantity", HostType::Int32)
                .with_column("PlacedAt", HostType::DateTime)
                .with_column("ShippedAt", HostType::DateTime.nullable())
                .with_column("Discount", HostType::Double.nullable())
                .with_key(&["Id"])
                .with_reference("Book", "Book", &["BookId"], false),
        )
}

pub fn items() -> Expr {
    Expr::entity_set("Item")
}

pub fn books() -> Expr {
    Expr::entity_set("Book")
}

pub fn authors() -> Expr {
    Expr::entity_set("Author")
}

pub fn publishers() -> Expr {
    Expr::entity_set("Publisher")
}

pub fn orders() -> Expr {
    Expr::entity_set("Order")
}

pub fn p(name: &str) -> Expr {
    Expr::param(name)
}

pub fn x() -> Expr {
    p("x")
}

pub fn lam(param: &str, body: Expr) -> Expr {
    Expr::lambda(&[param], body)
}

pub fn lam2(a: &str, b: &str, body: Expr) -> Expr {
    Expr::lambda(&[a, b], body)
}

pub fn compile_with(q: &Expr, dialect: &dyn Dialect) -> Result<CompiledQuery, TranslateError> {
    translate(q, &catalog(), dialect, &TranslatorConfig::default())
}

pub fn compile_config(q: &Expr, config: &TranslatorConfig) -> CompiledQuery {
    translate(q, &catalog(), &GenericDialect::ansi(), config).unwrap()
}

pub fn compile(q: &Expr) -> CompiledQuery {
    compile_with(q, &GenericDialect::ansi()).unwrap()
}

pub fn session(values: Vec<Value>) -> ExecutionSession {
    ExecutionSession::new(values)
}
