//! Operator dispatch table.
//!
//! Every translatable method is registered here once, keyed by method name
//! and filtered by declaring type and operand count. Sequence operators
//! transform a [`Seq`](crate::linq::node::Seq); scalar handlers translate a
//! single call inside a lambda body.

pub mod aggregate;
pub mod cardinality;
pub mod contains;
pub mod distinct;
pub mod filter;
pub mod group_by;
pub mod join;
pub mod lock;
pub mod order;
pub mod project;
pub mod quantifier;
pub mod scalar_fn;
pub mod set_op;

#[cfg(test)]
pub(crate) mod test_helpers;

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::error::TranslateError;
use crate::linq::analyzer::{Analyzer, OperatorCall, Step};
use crate::linq::expr::{Declaring, Expr, MethodCall};
use crate::linq::node::{Node, Seq};

pub type SequenceFn = fn(&mut Analyzer<'_>, Seq, &OperatorCall<'_>) -> Result<Step, TranslateError>;
pub type ScalarFn = fn(&mut Analyzer<'_>, &Expr, &MethodCall) -> Result<Node, TranslateError>;

#[derive(Clone, Copy)]
pub enum Handler {
    Sequence(SequenceFn),
    Scalar(ScalarFn),
}

struct Entry {
    declaring: &'static [Declaring],
    min_operands: usize,
    max_operands: usize,
    handler: Handler,
}

const SEQUENCE: &[Declaring] = &[Declaring::Queryable, Declaring::Enumerable];
const ANY_SEQUENCE: &[Declaring] = &[
    Declaring::Queryable,
    Declaring::Enumerable,
    Declaring::Collection,
];
const STRING: &[Declaring] = &[Declaring::String];
const MATH: &[Declaring] = &[Declaring::Math];
const OBJECT: &[Declaring] = &[Declaring::Object, Declaring::String, Declaring::DateTime];

static OPERATORS: LazyLock<HashMap<&'static str, Vec<Entry>>> = LazyLock::new(build_table);

/// Find the handler for a call.
pub fn lookup(declaring: Declaring, method: &str, operands: usize) -> Option<Handler> {
    OPERATORS
        .get(method)?
        .iter()
        .find(|e| {
            e.declaring.contains(&declaring)
                && (e.min_operands..=e.max_operands).contains(&operands)
        })
        .map(|e| e.handler)
}

/// Names of all registered methods, sorted.
pub fn registered_methods() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = OPERATORS.keys().copied().collect();
    names.sort_unstable();
    names
}

fn build_table() -> HashMap<&'static str, Vec<Entry>> {
    let mut table: HashMap<&'static str, Vec<Entry>> = HashMap::new();
    let mut add = |name: &'static str,
                   declaring: &'static [Declaring],
                   min_operands: usize,
                   max_operands: usize,
                   handler: Handler| {
        table.entry(name).or_default().push(Entry {
            declaring,
            min_operands,
            max_operands,
            handler,
        });
    };

    // ── Sequence operators ─────────────────────────────────────────────────
    add("Where", SEQUENCE, 1, 1, Handler::Sequence(filter::translate_where));
    add("Select", SEQUENCE, 1, 1, Handler::Sequence(project::translate_select));
    for name in ["AsQueryable", "AsEnumerable", "ToList", "ToArray"] {
        add(name, SEQUENCE, 0, 0, Handler::Sequence(project::translate_passthrough));
    }
    for name in ["OrderBy", "OrderByDescending", "ThenBy", "ThenByDescending"] {
        add(name, SEQUENCE, 1, 1, Handler::Sequence(order::translate_order_by));
    }
    add("Take", SEQUENCE, 1, 1, Handler::Sequence(order::translate_take));
    add("Skip", SEQUENCE, 1, 1, Handler::Sequence(order::translate_skip));
    add("GroupBy", SEQUENCE, 1, 3, Handler::Sequence(group_by::translate_group_by));
    add("Distinct", SEQUENCE, 0, 0, Handler::Sequence(distinct::translate_distinct));
    add("Join", SEQUENCE, 4, 4, Handler::Sequence(join::translate_join));
    add("GroupJoin", SEQUENCE, 4, 4, Handler::Sequence(join::translate_group_join));
    add("SelectMany", SEQUENCE, 1, 2, Handler::Sequence(join::translate_select_many));
    for name in ["First", "FirstOrDefault", "Single", "SingleOrDefault", "Last", "LastOrDefault"] {
        add(name, SEQUENCE, 0, 1, Handler::Sequence(cardinality::translate_cardinality));
    }
    add("Any", SEQUENCE, 0, 1, Handler::Sequence(quantifier::translate_any));
    add("All", SEQUENCE, 1, 1, Handler::Sequence(quantifier::translate_all));
    add("Contains", ANY_SEQUENCE, 1, 1, Handler::Sequence(contains::translate_contains));
    for name in ["Count", "LongCount", "Sum", "Average", "Min", "Max"] {
        add(name, SEQUENCE, 0, 1, Handler::Sequence(aggregate::translate_aggregate));
    }
    for name in ["Union", "Concat", "Except", "Intersect"] {
        add(name, SEQUENCE, 1, 1, Handler::Sequence(set_op::translate_set_operation));
    }
    add("WithLock", SEQUENCE, 1, 1, Handler::Sequence(lock::translate_with_lock));

    // ── Scalar functions ───────────────────────────────────────────────────
    for name in ["Contains", "StartsWith", "EndsWith"] {
        add(name, STRING, 1, 1, Handler::Scalar(scalar_fn::translate_like));
    }
    for name in ["ToUpper", "ToLower", "Trim"] {
        add(name, STRING, 0, 0, Handler::Scalar(scalar_fn::translate_string_fn));
    }
    add("Substring", STRING, 1, 2, Handler::Scalar(scalar_fn::translate_substring));
    add("Replace", STRING, 2, 2, Handler::Scalar(scalar_fn::translate_string_fn));
    add("IsNullOrEmpty", STRING, 1, 1, Handler::Scalar(scalar_fn::translate_is_null_or_empty));
    add("Concat", STRING, 2, 4, Handler::Scalar(scalar_fn::translate_string_concat));
    for name in ["Abs", "Floor", "Ceiling", "Sqrt"] {
        add(name, MATH, 1, 1, Handler::Scalar(scalar_fn::translate_math));
    }
    add("Round", MATH, 1, 2, Handler::Scalar(scalar_fn::translate_math));
    add("Pow", MATH, 2, 2, Handler::Scalar(scalar_fn::translate_math));
    add("ToString", OBJECT, 0, 0, Handler::Scalar(scalar_fn::translate_to_string));
    add("GetValueOrDefault", OBJECT, 0, 1, Handler::Scalar(scalar_fn::translate_value_or_default));

    table
}
