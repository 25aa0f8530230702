//! LINQ-style pipeline translation.
//!
//! [`translate`] turns a query expression into a [`CompiledQuery`]: the SQL
//! AST of the query, its reference SQL text, the materializer that rebuilds
//! host values from result rows and the ordered list of external values
//! bound as SQL parameters.
//!
//! # Pipeline
//!
//! ```text
//! Expr ──► ExpressionChain ──► Analyzer (operator table) ──► scopes
//!                                                        │
//!          CompiledQuery ◄── render (parameter order) ◄──┘
//! ```

pub mod analyzer;
pub mod chain;
pub mod context;
pub mod expr;
pub mod node;
pub mod operators;
pub mod post;
pub mod reader;
pub mod registrar;
pub mod render;
pub mod sql;
pub mod tier;

use serde::Serialize;

use crate::config::TranslatorConfig;
use crate::dialect::Dialect;
use crate::error::TranslateError;
use crate::hash;
use crate::schema::Catalog;
use crate::value::Value;

use analyzer::{Analyzer, ChainMode};
use context::ExternalValue;
use expr::Expr;
use post::PostProcess;
use reader::Session;
use sql::SqlAst;

/// One result row as returned by the database, in output-column order.
pub type Row = Vec<Value>;

/// The immutable result of translating one query expression.
///
/// A compiled query holds no reference to the catalog or dialect it was
/// built with and can be shared across threads and executions.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledQuery {
    ast: SqlAst,
    sql: String,
    post: PostProcess,
    externals: Vec<ExternalValue>,
    parameters: Vec<ExternalValue>,
    fingerprint: u64,
}

/// Translate a query expression.
///
/// Either the whole expression translates or an error is returned; no
/// partial result is produced.
pub fn translate(
    expr: &Expr,
    catalog: &dyn Catalog,
    dialect: &dyn Dialect,
    config: &TranslatorConfig,
) -> Result<CompiledQuery, TranslateError> {
    config.validate()?;

    let mut analyzer = Analyzer::new(catalog, dialect, config);
    let outcome = analyzer.translate_query(expr, ChainMode::Root)?;
    let post = analyzer.finish(outcome)?;
    let (scopes, root, mut externals) = analyzer.into_context().into_parts();

    let mut ast = SqlAst::new(scopes, root, Vec::new());
    let rendered = render::render(&ast);

    // Use counts follow the SQL that survived: expressions of dropped
    // orderings, replaced outputs and abandoned scopes no longer count.
    let references = ast.external_references();
    for external in &mut externals {
        let live = references.iter().filter(|&&i| i == external.index).count();
        if live != external.use_count {
            tracing::trace!(
                index = external.index,
                counted = external.use_count,
                live,
                "[query_translator] external use count adjusted to the final SQL"
            );
            external.use_count = live;
        }
    }

    let mut parameters = Vec::with_capacity(rendered.parameters.len());
    for &index in &rendered.parameters {
        let external = externals.get(index).ok_or_else(|| {
            TranslateError::InternalError(format!("parameter references unknown external value {index}"))
        })?;
        parameters.push(external.clone());
    }
    for external in &externals {
        if external.use_count > 0 && !rendered.parameters.contains(&external.index) {
            tracing::debug!(
                index = external.index,
                source = %external.source.to_text(),
                "[query_translator] external value not referenced by the final SQL, not bound"
            );
        }
    }
    ast.set_parameters(rendered.parameters);

    let fingerprint = hash::fingerprint(&(&ast, &post, &externals))?;
    tracing::debug!(
        dialect = dialect.name(),
        scopes = ast.reachable_scopes().len(),
        parameters = parameters.len(),
        fingerprint = %format!("{fingerprint:016x}"),
        "[query_translator] query translated"
    );
    if config.log_sql {
        tracing::debug!(sql = %rendered.text, "[query_translator] generated SQL");
    } else {
        tracing::trace!(sql = %rendered.text, "[query_translator] generated SQL");
    }

    Ok(CompiledQuery {
        ast,
        sql: rendered.text,
        post,
        externals,
        parameters,
        fingerprint,
    })
}

impl CompiledQuery {
    /// Reference SQL text with `@pN` parameter placeholders.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn ast(&self) -> &SqlAst {
        &self.ast
    }

    pub fn post_process(&self) -> &PostProcess {
        &self.post
    }

    /// Every external value the query captured, by index.
    pub fn externals(&self) -> &[ExternalValue] {
        &self.externals
    }

    /// External values bound as SQL parameters, in positional order.
    pub fn parameters(&self) -> &[ExternalValue] {
        &self.parameters
    }

    /// Deterministic hash of the compiled shape.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Prepare SQL parameter values from runtime external values.
    ///
    /// `values` is indexed by external-value index. The result is in
    /// parameter order, with value transforms (LIKE escaping, converters)
    /// applied.
    pub fn bind(&self, values: &[Value]) -> Result<Vec<Value>, TranslateError> {
        self.parameters
            .iter()
            .map(|p| {
                let value = values.get(p.index).cloned().ok_or_else(|| {
                    TranslateError::ParameterBinding {
                        parameter: p.source.to_text(),
                        message: format!("no runtime value supplied for external value {}", p.index),
                    }
                })?;
                match &p.transform {
                    Some(t) => t.apply(value).map_err(|message| TranslateError::ParameterBinding {
                        parameter: p.source.to_text(),
                        message,
                    }),
                    None => Ok(value),
                }
            })
            .collect()
    }

    /// Rebuild host values from result rows and apply post-processing.
    pub fn materialize(&self, rows: &[Row], session: &mut dyn Session) -> Result<Value, TranslateError> {
        let materializer = self
            .ast
            .root()
            .materializer
            .as_ref()
            .ok_or_else(|| TranslateError::InternalError("root scope has no materializer".into()))?;
        let values = rows
            .iter()
            .enumerate()
            .map(|(i, row)| materializer.read(row, i, session))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::trace!(rows = values.len(), "[query_translator] rows materialized");
        self.post.apply(values)
    }

    /// JSON form of the compiled query, for diagnostics.
    pub fn to_json(&self) -> Result<String, TranslateError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TranslateError::InternalError(format!("compiled query serialization: {e}")))
    }
}
