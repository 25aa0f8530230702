//! query_translator — LINQ-style query pipelines to SQL.
//!
//! A query is a tree of standard query operators (`Where`, `Select`,
//! `GroupBy`, `Join`, ...) over mapped entity sets. The translator turns it
//! into a dialect-neutral SQL AST, a materializer that rebuilds host values
//! from result rows, and the ordered list of host values bound as SQL
//! parameters. Executing the SQL is left to the caller.
//!
//! # Example
//!
//! ```
//! use query_translator::{
//!     EntityInfo, Expr, GenericDialect, HostType, InMemoryCatalog, TranslatorConfig, translate,
//! };
//!
//! let catalog = InMemoryCatalog::new().with_entity(
//!     EntityInfo::new("Book", "books")
//!         .with_column("Id", HostType::Int32)
//!         .with_column("Price", HostType::Double)
//!         .with_key(&["Id"]),
//! );
//! let query = Expr::entity_set("Book").query(
//!     "Where",
//!     vec![Expr::lambda(&["b"], Expr::param("b").member("Price").gt(Expr::constant(10.0)))],
//! );
//! let compiled =
//!     translate(&query, &catalog, &GenericDialect::ansi(), &TranslatorConfig::default()).unwrap();
//! assert_eq!(
//!     compiled.sql(),
//!     "SELECT t0.Id AS c0, t0.Price AS c1 FROM books t0 WHERE (t0.Price > 10)"
//! );
//! ```

pub mod config;
pub mod dialect;
pub mod error;
mod hash;
pub mod linq;
pub mod schema;
pub mod value;

pub use config::TranslatorConfig;
pub use dialect::{Capabilities, Dialect, GenericDialect};
pub use error::{ErrorKind, TranslateError};
pub use linq::expr::{Declaring, Expr};
pub use linq::reader::{ExecutionSession, Session};
pub use linq::{CompiledQuery, Row, translate};
pub use schema::{Catalog, EntityInfo, InMemoryCatalog};
pub use value::{HostType, Value};
