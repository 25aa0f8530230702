//! `WithLock("update" | "share")`: row-lock the source entity's table.

use crate::error::TranslateError;
use crate::linq::analyzer::{Analyzer, OperatorCall, Step};
use crate::linq::expr::Expr;
use crate::linq::node::{Node, Seq};
use crate::linq::sql::{LockMode, TableSource};
use crate::value::Value;

pub fn translate_with_lock(az: &mut Analyzer<'_>, seq: Seq, op: &OperatorCall<'_>) -> Result<Step, TranslateError> {
    let mode = match op.operand(0)? {
        Expr::Constant(Value::Text(text)) => {
            LockMode::parse(text).ok_or_else(|| op.unsupported(&format!("lock mode '{text}'")))?
        }
        _ => return Err(op.unsupported("lock mode must be a text constant")),
    };
    let Node::Entity(entity) = &seq.row else {
        return Err(op.unsupported("WithLock over a projection"));
    };
    let table = az
        .ctx
        .table_mut(entity.table)
        .ok_or_else(|| TranslateError::InternalError(format!("table {:?} is not registered", entity.table)))?;
    if !matches!(table.source, TableSource::Entity { .. }) {
        return Err(op.unsupported("WithLock over a derived table"));
    }
    table.lock = Some(mode);
    tracing::trace!(table = %table.alias, ?mode, "[query_translator] row lock requested");
    Ok(Step::Continue(seq))
}

#[cfg(test)]
mod tests {
    use super::super::test_helpers::*;
    use crate::dialect::GenericDialect;
    use crate::error::TranslateError;
    use crate::linq::expr::Expr;

    #[test]
    fn test_lock_for_update() {
        let q = books()
            .query("WithLock", vec![Expr::constant("update")])
            .query("Where", vec![lam("x", x().member("Id").eq(Expr::constant(7)))]);
        let sql = compile(&q).sql().to_string();
        assert!(sql.ends_with("WHERE (t0.Id = 7) FOR UPDATE"), "{sql}");
    }

    #[test]
    fn test_lock_share_mode_is_case_insensitive() {
        let q = authors().query("WithLock", vec![Expr::constant("SHARE")]);
        assert!(compile(&q).sql().ends_with("FOR SHARE"));
    }

    #[test]
    fn test_unknown_lock_mode_rejected() {
        let q = books().query("WithLock", vec![Expr::constant("exclusive")]);
        assert!(matches!(
            compile_with(&q, &GenericDialect::ansi()),
            Err(TranslateError::UnsupportedOperator { .. })
        ));
    }

    #[test]
    fn test_lock_after_projection_rejected() {
        let q = books()
            .query("Select", vec![lam("x", x().member("Title"))])
            .query("WithLock", vec![Expr::constant("update")]);
        assert!(compile_with(&q, &GenericDialect::ansi()).is_err());
    }
}
