// used for persistence
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params_from_iter};

// used for tombstones
use chrono::{DateTime, SecondsFormat, Utc};

use tracing::{debug, trace};

use crate::config::TableConfig;
use crate::error::{NestsetError, Result};
use crate::interval::BoundPatch;
use crate::node::{Bounds, NodeId, NodeRecord, Scope};

// ------------- BoundsStore -------------
/// What the tree engine needs from the table holding the nodes.
///
/// Every call is confined to the rows of one scope. Bound patches must be
/// applied to all matching rows at once; callers that need several calls to
/// be all-or-nothing wrap them in a transaction of their own.
pub trait BoundsStore {
    fn get(&self, scope: &Scope, id: NodeId) -> Result<Option<NodeRecord>>;
    /// Largest right bound in the scope, zero when it is empty.
    fn max_right_bound(&self, scope: &Scope) -> Result<i64>;
    /// Applies the patch to every row it touches and returns the row count.
    fn bulk_update(&self, scope: &Scope, patch: &BoundPatch) -> Result<usize>;
    /// All rows of the scope, tombstoned ones included, ordered by left bound.
    /// With `within` only the rows strictly inside those bounds are returned.
    fn load_ordered(&self, scope: &Scope, within: Option<Bounds>) -> Result<Vec<NodeRecord>>;
    /// Removes the given rows, highest left bound first, all or none.
    fn delete_range(&self, scope: &Scope, ids: &[NodeId]) -> Result<usize>;
    fn tombstone(&self, scope: &Scope, ids: &[NodeId], at: DateTime<Utc>) -> Result<usize>;
    /// Clears tombstones set at or after `since`.
    fn untombstone(&self, scope: &Scope, ids: &[NodeId], since: DateTime<Utc>) -> Result<usize>;
    fn insert(
        &self,
        scope: &Scope,
        parent_id: Option<NodeId>,
        bounds: Bounds,
        label: Option<&str>,
    ) -> Result<NodeId>;
    /// Writes parent, bounds and tombstone of an existing row. A missing
    /// label keeps the stored one.
    fn save(&self, scope: &Scope, record: &NodeRecord) -> Result<()>;
    /// Live children of `parent` (roots when `None`) ordered by left bound.
    fn children(&self, scope: &Scope, parent: Option<NodeId>) -> Result<Vec<NodeRecord>>;
    /// Live rows strictly inside `bounds`, ordered by left bound.
    fn descendants(&self, scope: &Scope, bounds: Bounds) -> Result<Vec<NodeRecord>>;
    /// Live rows enclosing `bounds`, outermost first.
    fn ancestors(&self, scope: &Scope, bounds: Bounds) -> Result<Vec<NodeRecord>>;
    /// Live rows with the number of live ancestors of each.
    fn with_depth(&self, scope: &Scope) -> Result<Vec<(NodeRecord, i64)>>;
    /// Whether rows dropped by a rebuild are tombstoned rather than removed.
    fn soft_deletes(&self) -> bool;
}

// ------------- QueryContext -------------
/// Numbers bind parameters and hands out self-join aliases for one statement.
#[derive(Debug, Default)]
pub struct QueryContext {
    params: Vec<Value>,
    aliases: usize,
}
impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }
    /// Registers a value and returns its placeholder.
    pub fn bind<V: Into<Value>>(&mut self, value: V) -> String {
        self.params.push(value.into());
        format!("?{}", self.params.len())
    }
    pub fn alias(&mut self, prefix: &str) -> String {
        self.aliases += 1;
        format!("_{}{}", prefix, self.aliases)
    }
    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

// ------------- Persistence -------------
pub struct Persistor<'db> {
    pub db: &'db Connection,
    table: TableConfig,
    columns: String,
}
impl<'db> Persistor<'db> {
    pub fn new(connection: &'db Connection, table: TableConfig) -> Result<Persistor<'db>> {
        table.validate()?;
        let t = &table;
        let scope_definitions: String = t
            .scope_columns
            .iter()
            .map(|c| format!("{c} any null,\n                "))
            .collect();
        let scope_index: String = t.scope_columns.iter().map(|c| format!("{c}, ")).collect();
        // The "STRICT" keyword is left out so the file stays readable by
        // external tools.
        connection.execute_batch(&format!(
            "
            create table if not exists {name} (
                {id} integer not null,
                {parent} integer null,
                {lft} integer not null,
                {rgt} integer not null,
                {deleted} text null,
                {label} text null,
                {scope_definitions}constraint referenceable_{name}_{id} primary key (
                    {id}
                )
            );-- STRICT;
            create index if not exists {name}_nested_set on {name} (
                {scope_index}{lft}, {rgt}, {parent}
            );
            ",
            name = t.name,
            id = t.id,
            parent = t.parent_id,
            lft = t.left,
            rgt = t.right,
            deleted = t.deleted_at,
            label = t.label,
        ))?;
        let columns = format!(
            "{id}, {parent}, {lft}, {rgt}, {deleted}, {label}",
            id = t.id,
            parent = t.parent_id,
            lft = t.left,
            rgt = t.right,
            deleted = t.deleted_at,
            label = t.label,
        );
        debug!(table = %t.name, scopes = t.scope_columns.len(), "tree table ready");
        Ok(Persistor {
            db: connection,
            table,
            columns,
        })
    }
    pub fn table(&self) -> &TableConfig {
        &self.table
    }
    /// Runs `f` inside a transaction, committing only when it succeeds.
    pub fn atomically<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let transaction = self.db.unchecked_transaction()?;
        let result = f(self)?;
        transaction.commit()?;
        Ok(result)
    }

    fn check_scope(&self, scope: &Scope) -> Result<()> {
        if scope.len() != self.table.scope_columns.len() {
            return Err(NestsetError::ScopeMismatch {
                left: scope.to_string(),
                right: format!("columns ({})", self.table.scope_columns.join(", ")),
            });
        }
        Ok(())
    }
    // " and a.s1 is ?n ..." for the given alias, or unqualified columns
    fn scope_filter(&self, ctx: &mut QueryContext, alias: Option<&str>, scope: &Scope) -> String {
        let prefix = alias.map(|a| format!("{a}.")).unwrap_or_default();
        let mut filter = String::new();
        for (column, value) in self.table.scope_columns.iter().zip(scope.values()) {
            let placeholder = ctx.bind(value.clone());
            filter += &format!(" and {prefix}{column} is {placeholder}");
        }
        filter
    }
    // " and a.s1 is b.s1 ..." joining two aliases on the scope columns
    fn scope_join(&self, left: &str, right: &str) -> String {
        self.table
            .scope_columns
            .iter()
            .map(|c| format!(" and {left}.{c} is {right}.{c}"))
            .collect()
    }
    fn qualified_columns(&self, alias: &str) -> String {
        self.columns
            .split(", ")
            .map(|c| format!("{alias}.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
    fn id_list(&self, ctx: &mut QueryContext, ids: &[NodeId]) -> String {
        ids.iter()
            .map(|id| ctx.bind(*id))
            .collect::<Vec<_>>()
            .join(", ")
    }
    fn fetch(&self, sql: &str, ctx: &QueryContext) -> Result<Vec<NodeRecord>> {
        trace!(%sql, "fetch");
        let mut statement = self.db.prepare_cached(sql)?;
        let rows = statement.query_map(params_from_iter(ctx.params()), record)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
    fn execute(&self, sql: &str, ctx: &QueryContext) -> Result<usize> {
        trace!(%sql, "execute");
        let mut statement = self.db.prepare_cached(sql)?;
        Ok(statement.execute(params_from_iter(ctx.params()))?)
    }

    // set-clause for one bound column under the given patch
    fn column_patch(&self, ctx: &mut QueryContext, column: &str, patch: &BoundPatch) -> String {
        match patch {
            BoundPatch::Gap(gap) => {
                let cut = ctx.bind(gap.cut);
                let height = ctx.bind(gap.height);
                format!("case when {column} >= {cut} then {column} + {height} else {column} end")
            }
            BoundPatch::Move(plan) => {
                let lft = ctx.bind(plan.subtree.left);
                let rgt = ctx.bind(plan.subtree.right);
                let distance = ctx.bind(plan.subtree_shift);
                let from = ctx.bind(plan.from);
                let to = ctx.bind(plan.to);
                let height = ctx.bind(plan.corridor_shift);
                format!(
                    "case when {column} between {lft} and {rgt} then {column} + {distance} \
                     when {column} between {from} and {to} then {column} + {height} \
                     else {column} end"
                )
            }
        }
    }
}

// fixed width so that tombstones compare correctly as text
fn stamp(at: DateTime<Utc>) -> Value {
    Value::Text(at.to_rfc3339_opts(SecondsFormat::Micros, false))
}

fn record(row: &Row) -> rusqlite::Result<NodeRecord> {
    Ok(NodeRecord {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        bounds: Bounds::new(row.get(2)?, row.get(3)?),
        deleted_at: row.get(4)?,
        label: row.get(5)?,
    })
}

impl BoundsStore for Persistor<'_> {
    fn get(&self, scope: &Scope, id: NodeId) -> Result<Option<NodeRecord>> {
        self.check_scope(scope)?;
        let mut ctx = QueryContext::new();
        let key = ctx.bind(id);
        let filter = self.scope_filter(&mut ctx, None, scope);
        let sql = format!(
            "select {} from {} where {} = {key}{filter}",
            self.columns, self.table.name, self.table.id
        );
        let mut statement = self.db.prepare_cached(&sql)?;
        Ok(statement
            .query_row(params_from_iter(ctx.params()), record)
            .optional()?)
    }
    fn max_right_bound(&self, scope: &Scope) -> Result<i64> {
        self.check_scope(scope)?;
        let mut ctx = QueryContext::new();
        let filter = self.scope_filter(&mut ctx, None, scope);
        let sql = format!(
            "select coalesce(max({}), 0) from {} where 1 = 1{filter}",
            self.table.right, self.table.name
        );
        let mut statement = self.db.prepare_cached(&sql)?;
        Ok(statement.query_row(params_from_iter(ctx.params()), |r| r.get(0))?)
    }
    fn bulk_update(&self, scope: &Scope, patch: &BoundPatch) -> Result<usize> {
        self.check_scope(scope)?;
        let (lft, rgt) = (&self.table.left, &self.table.right);
        let mut ctx = QueryContext::new();
        let left_patch = self.column_patch(&mut ctx, lft, patch);
        let right_patch = self.column_patch(&mut ctx, rgt, patch);
        let predicate = match patch {
            BoundPatch::Gap(gap) => {
                let cut = ctx.bind(gap.cut);
                format!("({lft} >= {cut} or {rgt} >= {cut})")
            }
            BoundPatch::Move(plan) => {
                let from = ctx.bind(plan.from);
                let to = ctx.bind(plan.to);
                format!("({lft} between {from} and {to} or {rgt} between {from} and {to})")
            }
        };
        let filter = self.scope_filter(&mut ctx, None, scope);
        let sql = format!(
            "update {} set {lft} = {left_patch}, {rgt} = {right_patch} where {predicate}{filter}",
            self.table.name
        );
        let updated = self.execute(&sql, &ctx)?;
        debug!(?patch, updated, "bulk bound update");
        Ok(updated)
    }
    fn load_ordered(&self, scope: &Scope, within: Option<Bounds>) -> Result<Vec<NodeRecord>> {
        self.check_scope(scope)?;
        let mut ctx = QueryContext::new();
        let range = match within {
            Some(bounds) => {
                let lower = ctx.bind(bounds.left);
                let upper = ctx.bind(bounds.right);
                format!(" and {lft} > {lower} and {lft} < {upper}", lft = self.table.left)
            }
            None => String::new(),
        };
        let filter = self.scope_filter(&mut ctx, None, scope);
        let sql = format!(
            "select {} from {} where 1 = 1{range}{filter} order by {}, {}",
            self.columns, self.table.name, self.table.left, self.table.id
        );
        self.fetch(&sql, &ctx)
    }
    fn delete_range(&self, scope: &Scope, ids: &[NodeId]) -> Result<usize> {
        self.check_scope(scope)?;
        if ids.is_empty() {
            return Ok(0);
        }
        // find the deletion order first, deepest rows go before their ancestors
        let mut ctx = QueryContext::new();
        let list = self.id_list(&mut ctx, ids);
        let filter = self.scope_filter(&mut ctx, None, scope);
        let sql = format!(
            "select {id} from {table} where {id} in ({list}){filter} order by {lft} desc",
            id = self.table.id,
            table = self.table.name,
            lft = self.table.left
        );
        let ordered: Vec<NodeId> = {
            let mut statement = self.db.prepare_cached(&sql)?;
            let rows = statement.query_map(params_from_iter(ctx.params()), |r| r.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let sql = format!(
            "delete from {} where {} = ?1",
            self.table.name, self.table.id
        );
        // a savepoint keeps the per-row deletes all-or-nothing and nests
        // inside an enclosing transaction
        self.db.execute_batch("savepoint delete_range")?;
        let removed = (|| -> Result<usize> {
            let mut statement = self.db.prepare_cached(&sql)?;
            let mut deleted = 0;
            for &id in &ordered {
                deleted += statement.execute([id])?;
            }
            Ok(deleted)
        })();
        match removed {
            Ok(deleted) => {
                self.db.execute_batch("release delete_range")?;
                debug!(deleted, "rows removed");
                Ok(deleted)
            }
            Err(e) => {
                self.db
                    .execute_batch("rollback to delete_range; release delete_range")?;
                Err(e)
            }
        }
    }
    fn tombstone(&self, scope: &Scope, ids: &[NodeId], at: DateTime<Utc>) -> Result<usize> {
        self.check_scope(scope)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut ctx = QueryContext::new();
        let stamp = ctx.bind(stamp(at));
        let list = self.id_list(&mut ctx, ids);
        let filter = self.scope_filter(&mut ctx, None, scope);
        let sql = format!(
            "update {table} set {deleted} = {stamp} where {id} in ({list}) and {deleted} is null{filter}",
            table = self.table.name,
            deleted = self.table.deleted_at,
            id = self.table.id
        );
        self.execute(&sql, &ctx)
    }
    fn untombstone(&self, scope: &Scope, ids: &[NodeId], since: DateTime<Utc>) -> Result<usize> {
        self.check_scope(scope)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let mut ctx = QueryContext::new();
        let stamp = ctx.bind(stamp(since));
        let list = self.id_list(&mut ctx, ids);
        let filter = self.scope_filter(&mut ctx, None, scope);
        let sql = format!(
            "update {table} set {deleted} = null where {id} in ({list}) and {deleted} >= {stamp}{filter}",
            table = self.table.name,
            deleted = self.table.deleted_at,
            id = self.table.id
        );
        self.execute(&sql, &ctx)
    }
    fn insert(
        &self,
        scope: &Scope,
        parent_id: Option<NodeId>,
        bounds: Bounds,
        label: Option<&str>,
    ) -> Result<NodeId> {
        self.check_scope(scope)?;
        let mut ctx = QueryContext::new();
        let mut columns = vec![
            self.table.parent_id.clone(),
            self.table.left.clone(),
            self.table.right.clone(),
            self.table.label.clone(),
        ];
        let mut placeholders = vec![
            ctx.bind(parent_id.map_or(Value::Null, Value::Integer)),
            ctx.bind(bounds.left),
            ctx.bind(bounds.right),
            ctx.bind(label.map_or(Value::Null, |l| Value::Text(l.to_string()))),
        ];
        for (column, value) in self.table.scope_columns.iter().zip(scope.values()) {
            columns.push(column.clone());
            placeholders.push(ctx.bind(value.clone()));
        }
        let sql = format!(
            "insert into {} ({}) values ({})",
            self.table.name,
            columns.join(", "),
            placeholders.join(", ")
        );
        self.execute(&sql, &ctx)?;
        Ok(self.db.last_insert_rowid())
    }
    fn save(&self, scope: &Scope, record: &NodeRecord) -> Result<()> {
        self.check_scope(scope)?;
        let t = &self.table;
        let mut ctx = QueryContext::new();
        let parent = ctx.bind(record.parent_id.map_or(Value::Null, Value::Integer));
        let lft = ctx.bind(record.bounds.left);
        let rgt = ctx.bind(record.bounds.right);
        let deleted = ctx.bind(
            record
                .deleted_at
                .map_or(Value::Null, stamp),
        );
        let label = ctx.bind(
            record
                .label
                .as_ref()
                .map_or(Value::Null, |l| Value::Text(l.clone())),
        );
        let id = ctx.bind(record.id);
        let filter = self.scope_filter(&mut ctx, None, scope);
        let sql = format!(
            "update {name} set {p} = {parent}, {l} = {lft}, {r} = {rgt}, {d} = {deleted}, \
             {lb} = coalesce({label}, {lb}) where {i} = {id}{filter}",
            name = t.name,
            p = t.parent_id,
            l = t.left,
            r = t.right,
            d = t.deleted_at,
            lb = t.label,
            i = t.id,
        );
        match self.execute(&sql, &ctx)? {
            1 => Ok(()),
            0 => Err(NestsetError::NodeMissing(format!(
                "#{} is not stored in scope {}",
                record.id, scope
            ))),
            n => Err(NestsetError::Invariant(format!(
                "saving #{} touched {n} rows",
                record.id
            ))),
        }
    }
    fn children(&self, scope: &Scope, parent: Option<NodeId>) -> Result<Vec<NodeRecord>> {
        self.check_scope(scope)?;
        let mut ctx = QueryContext::new();
        let parent_filter = match parent {
            Some(id) => format!("{} = {}", self.table.parent_id, ctx.bind(id)),
            None => format!("{} is null", self.table.parent_id),
        };
        let filter = self.scope_filter(&mut ctx, None, scope);
        let sql = format!(
            "select {} from {} where {parent_filter} and {} is null{filter} order by {}",
            self.columns, self.table.name, self.table.deleted_at, self.table.left
        );
        self.fetch(&sql, &ctx)
    }
    fn descendants(&self, scope: &Scope, bounds: Bounds) -> Result<Vec<NodeRecord>> {
        self.check_scope(scope)?;
        let mut ctx = QueryContext::new();
        let lower = ctx.bind(bounds.left);
        let upper = ctx.bind(bounds.right);
        let filter = self.scope_filter(&mut ctx, None, scope);
        let sql = format!(
            "select {cols} from {table} where {lft} > {lower} and {lft} < {upper} \
             and {deleted} is null{filter} order by {lft}",
            cols = self.columns,
            table = self.table.name,
            lft = self.table.left,
            deleted = self.table.deleted_at,
        );
        self.fetch(&sql, &ctx)
    }
    fn ancestors(&self, scope: &Scope, bounds: Bounds) -> Result<Vec<NodeRecord>> {
        self.check_scope(scope)?;
        let mut ctx = QueryContext::new();
        let left = ctx.bind(bounds.left);
        let filter = self.scope_filter(&mut ctx, None, scope);
        let sql = format!(
            "select {cols} from {table} where {lft} < {left} and {rgt} > {left} \
             and {deleted} is null{filter} order by {lft}",
            cols = self.columns,
            table = self.table.name,
            lft = self.table.left,
            rgt = self.table.right,
            deleted = self.table.deleted_at,
        );
        self.fetch(&sql, &ctx)
    }
    fn with_depth(&self, scope: &Scope) -> Result<Vec<(NodeRecord, i64)>> {
        self.check_scope(scope)?;
        let (lft, rgt, deleted) = (&self.table.left, &self.table.right, &self.table.deleted_at);
        let mut ctx = QueryContext::new();
        let node = ctx.alias("n");
        let ancestor = ctx.alias("a");
        let filter = self.scope_filter(&mut ctx, Some(node.as_str()), scope);
        let sql = format!(
            "select {cols}, (
                select count(1) from {table} {ancestor}
                    where {ancestor}.{lft} < {node}.{lft}
                    and {ancestor}.{rgt} > {node}.{lft}
                    and {ancestor}.{deleted} is null{join}
            ) as depth
                from {table} {node}
                where {node}.{deleted} is null{filter}
                order by {node}.{lft}",
            cols = self.qualified_columns(&node),
            table = self.table.name,
            join = self.scope_join(&ancestor, &node),
        );
        let mut statement = self.db.prepare_cached(&sql)?;
        let rows = statement.query_map(params_from_iter(ctx.params()), |row| {
            Ok((record(row)?, row.get(6)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
    fn soft_deletes(&self) -> bool {
        self.table.soft_delete
    }
}
