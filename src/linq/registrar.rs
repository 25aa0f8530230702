//! Table, column and association-join registration.
//!
//! Tables are identified by (entity, discriminator). An entity set named in
//! the query gets a fresh discriminator per occurrence; an association join
//! is discriminated by the owner table and member path, so the same
//! reference reached twice shares one join. When a lookup finds the table
//! in an unrelated scope (for example a sibling subquery) it is promoted to
//! the lowest common ancestor of both scopes.

use crate::error::TranslateError;
use crate::linq::context::TranslationContext;
use crate::linq::node::EntityNode;
use crate::linq::sql::{
    ColumnExpression, JoinType, ScopeId, SqlExpr, TableExpression, TableIdentity, TableId,
    TableSource,
};
use crate::schema::{Catalog, EntityInfo, ValueConverter};
use crate::value::HostType;

impl TranslationContext {
    /// Find or create a table by identity.
    ///
    /// Search order: the current scope, then every live scope. A table found
    /// in a scope that is not an ancestor of the current scope moves to the
    /// lowest common ancestor. `build` creates the table when none matches.
    pub fn register_table(
        &mut self,
        identity: &TableIdentity,
        build: impl FnOnce(TableId, String) -> TableExpression,
    ) -> TableId {
        let current = self.current();
        if let Some(id) = self.scope(current).find_table(identity) {
            return id;
        }
        if let Some((owner, id)) = self.find_table_anywhere(identity)
            && let Some(lca) = self.lowest_common_ancestor(owner, current)
        {
            if lca != owner {
                self.promote(id, owner, lca);
            }
            return id;
        }
        let id = self.allocate_table_id();
        let alias = self.table_alias(id);
        let table = build(id, alias);
        self.scope_mut(current).tables.push(table);
        id
    }

    /// Register a fresh occurrence of an entity set in the current scope.
    pub fn register_entity_set(&mut self, entity: &EntityInfo, join: JoinType) -> TableId {
        let discriminator = self.next_occurrence();
        let identity = TableIdentity {
            source: entity.name.clone(),
            discriminator: discriminator.clone(),
        };
        let (name, table) = (entity.name.clone(), entity.table.clone());
        self.register_table(&identity, move |id, alias| TableExpression {
            id,
            source: TableSource::Entity {
                entity: name,
                table,
            },
            alias,
            join,
            condition: None,
            lock: None,
            discriminator,
        })
    }

    /// Build an unregistered entity-set table; used where registration is
    /// deferred (group joins).
    pub fn detached_entity_table(&mut self, entity: &EntityInfo, join: JoinType) -> TableExpression {
        let id = self.allocate_table_id();
        TableExpression {
            id,
            source: TableSource::Entity {
                entity: entity.name.clone(),
                table: entity.table.clone(),
            },
            alias: self.table_alias(id),
            join,
            condition: None,
            lock: None,
            discriminator: self.next_occurrence(),
        }
    }

    /// Append a table to a scope without identity checks.
    pub fn add_table(&mut self, scope: ScopeId, table: TableExpression) {
        self.scope_mut(scope).tables.push(table);
    }

    fn find_table_anywhere(&self, identity: &TableIdentity) -> Option<(ScopeId, TableId)> {
        self.scopes()
            .iter()
            .filter(|s| !self.is_sealed(s.id))
            .find_map(|s| s.find_table(identity).map(|t| (s.id, t)))
    }

    fn promote(&mut self, table: TableId, from: ScopeId, to: ScopeId) {
        if let Some(t) = self.scope_mut(from).remove_table(table) {
            tracing::debug!(
                table = %t.alias,
                from,
                to,
                "[query_translator] promoting shared join to common ancestor scope"
            );
            self.scope_mut(to).tables.push(t);
        }
    }

    /// Scope that currently owns a table.
    pub fn table_scope(&self, id: TableId) -> Option<ScopeId> {
        self.scopes()
            .iter()
            .find(|s| s.table(id).is_some())
            .map(|s| s.id)
    }

    pub fn table(&self, id: TableId) -> Option<&TableExpression> {
        self.scopes().iter().find_map(|s| s.table(id))
    }

    pub fn table_mut(&mut self, id: TableId) -> Option<&mut TableExpression> {
        let scope = self.table_scope(id)?;
        self.scope_mut(scope).table_mut(id)
    }

    /// Column reference, memoized per scope by (table, column).
    pub fn register_column(
        &mut self,
        table: TableId,
        column: &str,
        ty: HostType,
        converter: ValueConverter,
    ) -> SqlExpr {
        let current = self.current();
        let scope = self.scope_mut(current);
        if let Some(existing) = scope
            .columns
            .iter()
            .find(|c| c.table == table && c.column == column)
        {
            return SqlExpr::Column(existing.clone());
        }
        let col = ColumnExpression {
            table,
            column: column.to_string(),
            ty,
            converter,
        };
        scope.columns.push(col.clone());
        SqlExpr::Column(col)
    }

    /// Join the target of `owner.member` and return it as an entity.
    ///
    /// The join condition pairs the owner's foreign-key columns with the
    /// target's key columns. Nullable references, and references reached
    /// through a nullable owner, join left-outer.
    pub fn register_association(
        &mut self,
        catalog: &dyn Catalog,
        owner: &EntityNode,
        member: &str,
    ) -> Result<EntityNode, TranslateError> {
        let owner_info = catalog
            .entity(&owner.entity)
            .ok_or_else(|| TranslateError::UnknownMember {
                owner: owner.entity.clone(),
                member: member.to_string(),
            })?;
        let reference = owner_info
            .reference(member)
            .ok_or_else(|| TranslateError::UnknownMember {
                owner: owner.entity.clone(),
                member: member.to_string(),
            })?;
        let target = catalog
            .entity(&reference.target)
            .ok_or_else(|| TranslateError::UnknownMember {
                owner: owner.entity.clone(),
                member: format!("{member} -> {}", reference.target),
            })?;
        if reference.fk_members.len() != target.key.len() {
            return Err(TranslateError::InternalError(format!(
                "reference {}.{member} has {} foreign-key members but {} has {} key members",
                owner.entity,
                reference.fk_members.len(),
                target.name,
                target.key.len()
            )));
        }

        let mut pairs = Vec::with_capacity(target.key.len());
        for (fk, key) in reference.fk_members.iter().zip(&target.key) {
            let fk_col = owner_info
                .column(fk)
                .ok_or_else(|| TranslateError::UnknownMember {
                    owner: owner.entity.clone(),
                    member: fk.clone(),
                })?;
            let key_col = target
                .column(key)
                .ok_or_else(|| TranslateError::UnknownMember {
                    owner: target.name.clone(),
                    member: key.clone(),
                })?;
            pairs.push((fk_col.clone(), key_col.clone()));
        }

        let nullable = reference.nullable || owner.nullable;
        let identity = TableIdentity {
            source: target.name.clone(),
            discriminator: format!("{}.{}{member}", self.table_alias(owner.table), owner.prefix),
        };
        let (entity_name, table_name) = (target.name.clone(), target.table.clone());
        let owner_table = owner.table;
        let owner_prefix = owner.prefix.clone();
        let discriminator = identity.discriminator.clone();
        let id = self.register_table(&identity, move |id, alias| {
            let condition = SqlExpr::and_all(pairs.into_iter().map(|(fk, key)| {
                SqlExpr::eq(
                    SqlExpr::Column(ColumnExpression {
                        table: owner_table,
                        column: format!("{owner_prefix}{}", fk.column),
                        ty: fk.ty,
                        converter: fk.converter,
                    }),
                    SqlExpr::Column(ColumnExpression {
                        table: id,
                        column: key.column,
                        ty: key.ty,
                        converter: key.converter,
                    }),
                )
            }));
            TableExpression {
                id,
                source: TableSource::Entity {
                    entity: entity_name,
                    table: table_name,
                },
                alias,
                join: if nullable {
                    JoinType::LeftOuter
                } else {
                    JoinType::Inner
                },
                condition,
                lock: None,
                discriminator,
            }
        });
        Ok(EntityNode {
            entity: target.name.clone(),
            table: id,
            prefix: String::new(),
            nullable,
        })
    }
}
