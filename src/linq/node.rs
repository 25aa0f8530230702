//! Intermediate analysis results.
//!
//! Every analyzed expression becomes a [`Node`]: either a finished SQL
//! expression or a structured value (entity, pending reference, record,
//! grouping) that is only flattened into SQL columns once the consumer is
//! known.

use crate::linq::sql::{ScopeId, SqlExpr, TableExpression, TableId};

/// A whole entity row backed by a table (or a derived table, in which case
/// `prefix` selects its columns).
#[derive(Debug, Clone, PartialEq)]
pub struct EntityNode {
    pub entity: String,
    pub table: TableId,
    pub prefix: String,
    /// Reached through a left-outer join; all columns may be NULL.
    pub nullable: bool,
}

/// A many-to-one reference that has not been joined yet. Accessing the
/// target's key folds to the owner's foreign-key columns.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceNode {
    pub owner: EntityNode,
    pub member: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupingNode {
    pub key: Box<Node>,
    pub element: Box<Node>,
    pub scope: ScopeId,
    /// GROUP BY has been emitted for this grouping.
    pub pushed: bool,
}

/// The group parameter of a `GroupJoin` result selector. The inner table
/// is registered only when the group is flattened by `SelectMany`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupJoinNode {
    pub entity: String,
    pub table: TableExpression,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Sql(SqlExpr),
    Entity(EntityNode),
    Reference(ReferenceNode),
    Record(Vec<(String, Node)>),
    Grouping(GroupingNode),
    GroupJoin(GroupJoinNode),
}

impl Node {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Sql(_) => "scalar",
            Node::Entity(_) => "entity",
            Node::Reference(_) => "reference",
            Node::Record(_) => "record",
            Node::Grouping(_) => "grouping",
            Node::GroupJoin(_) => "group-join group",
        }
    }

    /// Whether a raw grouping or group-join group appears anywhere inside.
    pub fn contains_group(&self) -> bool {
        match self {
            Node::Grouping(_) | Node::GroupJoin(_) => true,
            Node::Record(fields) => fields.iter().any(|(_, n)| n.contains_group()),
            Node::Sql(_) | Node::Entity(_) | Node::Reference(_) => false,
        }
    }

    /// Whether an aggregate appears in any scalar inside.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Node::Sql(e) => e.contains_aggregate(),
            Node::Record(fields) => fields.iter().any(|(_, n)| n.contains_aggregate()),
            _ => false,
        }
    }

    pub fn as_sql(&self) -> Option<&SqlExpr> {
        match self {
            Node::Sql(e) => Some(e),
            _ => None,
        }
    }
}

/// State of a sequence while its chain is analyzed: the scope producing
/// its rows and the shape of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Seq {
    pub scope: ScopeId,
    pub row: Node,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linq::sql::SqlExpr;

    #[test]
    fn test_contains_group_looks_into_records() {
        let grouping = Node::Grouping(GroupingNode {
            key: Box::new(Node::Sql(SqlExpr::literal(1))),
            element: Box::new(Node::Sql(SqlExpr::literal(2))),
            scope: 0,
            pushed: false,
        });
        let rec = Node::Record(vec![("G".into(), grouping)]);
        assert!(rec.contains_group());
        assert!(!Node::Record(vec![("A".into(), Node::Sql(SqlExpr::literal(1)))]).contains_group());
    }
}
