//! Fluent query builder over a typed entity.
//!
//! A [`QuerySet`] accumulates a [`SelectQuery`] against its entity's table.
//! Building it expands relation includes into JSON projections and, for
//! versioned entities, scopes every versioned table to the execution
//! context's branch.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use crate::dsl::QueryProxy;
use crate::error::{ErrorCode, LineageError, LineageResult};
use crate::schema::{Cardinality, Entity, EntitySchema, RelationDef, SchemaRegistry};
use crate::sql::{
    compile_select, expand_includes, qcol, CompiledQuery, CteBody, DistanceOp, Expr, FromTarget,
    Include, JoinKind, SelectItem, SelectQuery, SqlValue, Table, TableRegistry,
};
use crate::traits::{Embedder, SqlExecutor};
use crate::versioning::{rewrite_for_branch, ExecutionContext};

/// Query over entity `E`.
pub struct QuerySet<E: Entity> {
    registry: Arc<SchemaRegistry>,
    schema: Arc<EntitySchema>,
    aliases: TableRegistry,
    /// Aliases bound in this query tree, with their table names.
    bound: Vec<(String, String)>,
    alias: String,
    query: SelectQuery,
    explicit_columns: bool,
    includes: Vec<Include>,
    /// Scope versioned tables to the context's branch.
    scoped: bool,
    turn_limit: Option<u64>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for QuerySet<E> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            schema: self.schema.clone(),
            aliases: self.aliases.clone(),
            bound: self.bound.clone(),
            alias: self.alias.clone(),
            query: self.query.clone(),
            explicit_columns: self.explicit_columns,
            includes: self.includes.clone(),
            scoped: self.scoped,
            turn_limit: self.turn_limit,
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> QuerySet<E> {
    /// Start a query over `E`'s table. The entity must be registered.
    pub fn new(registry: Arc<SchemaRegistry>) -> LineageResult<Self> {
        let schema = registry.get(E::TABLE)?.clone();
        let mut aliases = TableRegistry::new();
        let alias = aliases.alias_for(E::TABLE);
        Ok(Self {
            query: SelectQuery::from(Table::aliased(E::TABLE, alias.clone())),
            bound: vec![(alias.clone(), E::TABLE.to_string())],
            registry,
            schema,
            aliases,
            alias,
            explicit_columns: false,
            includes: Vec::new(),
            scoped: true,
            turn_limit: None,
            _entity: PhantomData,
        })
    }

    /// Alias of the root table.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Field stand-ins for the root table.
    pub fn proxy(&self) -> QueryProxy {
        QueryProxy::new(self.alias.clone(), self.schema.clone())
    }

    /// Field stand-ins for a table joined with [`join`](Self::join).
    pub fn related_proxy<R: Entity>(&self) -> LineageResult<QueryProxy> {
        let alias = self
            .query
            .joins
            .iter()
            .find_map(|j| match &j.target {
                FromTarget::Table(t) if t.name == R::TABLE => {
                    Some(t.reference().to_string())
                }
                _ => None,
            })
            .ok_or_else(|| {
                LineageError::query_build(
                    format!("'{}' is not joined into this query", R::TABLE),
                    ErrorCode::QryNoRelation,
                )
            })?;
        Ok(QueryProxy::new(alias, self.registry.get(R::TABLE)?.clone()))
    }

    /// Restrict the output to `fields`, in order.
    pub fn select(mut self, fields: &[&str]) -> LineageResult<Self> {
        let proxy = self.proxy();
        for name in fields {
            self.query.columns.push(SelectItem::expr(proxy.field(name)?.expr()));
        }
        self.explicit_columns = true;
        Ok(self)
    }

    /// AND a prebuilt predicate into the WHERE clause.
    pub fn where_(mut self, predicate: Expr) -> Self {
        self.query.push_where(predicate);
        self
    }

    /// AND a predicate built against the root proxy.
    pub fn filter<F>(self, build: F) -> LineageResult<Self>
    where
        F: FnOnce(&QueryProxy) -> LineageResult<Expr>,
    {
        let predicate = build(&self.proxy())?;
        Ok(self.where_(predicate))
    }

    /// `field = value`, type-checked.
    pub fn where_eq(self, field: &str, value: impl Into<SqlValue>) -> LineageResult<Self> {
        let predicate = self.proxy().field(field)?.eq(value)?;
        Ok(self.where_(predicate))
    }

    /// Inner join the entity `R` through the relation `E` declares to it.
    pub fn join<R: Entity>(mut self) -> LineageResult<Self> {
        let relation = self.registry.relation_between(E::TABLE, R::TABLE)?.clone();
        let target = self.bind(R::TABLE);

        match (&relation.cardinality, &relation.junction) {
            (Cardinality::ManyToMany, Some(junction)) => {
                let via = self.bind(&junction.entity);
                self.query = self
                    .query
                    .join(
                        JoinKind::Inner,
                        Table::aliased(&junction.entity, via.clone()),
                        qcol(&via, &junction.keys[0]).eq(qcol(&self.alias, &relation.primary_key)),
                    )
                    .join(
                        JoinKind::Inner,
                        Table::aliased(R::TABLE, target.clone()),
                        qcol(&target, &relation.foreign_key).eq(qcol(&via, &junction.keys[1])),
                    );
            }
            _ => {
                self.query = self.query.join(
                    JoinKind::Inner,
                    Table::aliased(R::TABLE, target.clone()),
                    qcol(&target, &relation.foreign_key).eq(qcol(&self.alias, &relation.primary_key)),
                );
            }
        }
        Ok(self)
    }

    /// Nest `child`'s rows under each result as a JSON column named after the
    /// relation `E` declares to `R`.
    pub fn include<R: Entity>(mut self, child: QuerySet<R>) -> LineageResult<Self> {
        let relation: RelationDef = self.registry.relation_between(E::TABLE, R::TABLE)?.clone();
        let target_primary_key = child.schema.primary_key.clone();
        let (mut query, child_bound) = child.into_projection();

        // Keep child aliases that are free here; re-allocate the rest.
        let mut clashes = Vec::new();
        for (alias, table) in child_bound {
            if self.aliases.reserve(&alias) {
                self.bound.push((alias, table));
            } else {
                clashes.push((alias, table));
            }
        }
        for (old, table) in clashes {
            let fresh = self.bind(&table);
            query.rename_qualifier(&old, &fresh);
        }

        let junction = match (&relation.cardinality, &relation.junction) {
            (Cardinality::ManyToMany, Some(j)) => {
                let via = self.bind(&j.entity);
                Some(Table::aliased(&j.entity, via))
            }
            _ => None,
        };

        self.includes.push(Include {
            relation,
            junction,
            target_primary_key,
            query,
        });
        Ok(self)
    }

    pub fn order_by(mut self, field: &str) -> LineageResult<Self> {
        let order = self.proxy().field(field)?.asc();
        self.query = self.query.order_by(order);
        Ok(self)
    }

    pub fn order_by_desc(mut self, field: &str) -> LineageResult<Self> {
        let order = self.proxy().field(field)?.desc();
        self.query = self.query.order_by(order);
        Ok(self)
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.query = self.query.limit(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.query = self.query.offset(n);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.query = self.query.distinct();
        self
    }

    pub fn distinct_on(mut self, fields: &[&str]) -> LineageResult<Self> {
        let proxy = self.proxy();
        let exprs = fields
            .iter()
            .map(|f| proxy.field(f).map(|r| r.expr()))
            .collect::<LineageResult<Vec<_>>>()?;
        self.query = self.query.distinct_on(exprs);
        Ok(self)
    }

    /// Attach a named CTE the query can select from or join.
    pub fn with_cte(mut self, name: &str, query: SelectQuery, recursive: bool) -> Self {
        self.query = self.query.with_cte(name, CteBody::Select(query), recursive);
        self
    }

    /// First row by primary key.
    pub fn first(self) -> LineageResult<Self> {
        let pk = self.schema.primary_key.clone();
        Ok(self.order_by(&pk)?.limit(1))
    }

    /// Last row by primary key.
    pub fn last(self) -> LineageResult<Self> {
        let pk = self.schema.primary_key.clone();
        Ok(self.order_by_desc(&pk)?.limit(1))
    }

    /// Order by cosine distance between `field` and the embedding of `text`,
    /// keeping the `top_k` closest rows.
    pub async fn similar(
        mut self,
        field: &str,
        text: &str,
        embedder: &dyn Embedder,
        top_k: u64,
    ) -> LineageResult<Self> {
        let vector = embedder.embed(text).await?;
        let distance = self.proxy().field(field)?.distance(DistanceOp::Cosine, vector)?;
        self.query = self.query.order_by(distance.asc()).limit(top_k);
        Ok(self)
    }

    /// Only consider the `n` most recent visible turns.
    pub fn turn_limit(mut self, n: u64) -> Self {
        self.turn_limit = Some(n);
        self
    }

    /// Read physical rows without branch scoping.
    pub fn unversioned(mut self) -> Self {
        self.scoped = false;
        self
    }

    /// Final query: includes expanded, versioned tables scoped to `ctx`.
    pub fn build(&self, ctx: &ExecutionContext) -> LineageResult<SelectQuery> {
        let (query, _) = self.clone().into_projection();
        let query = expand_includes(query, &self.schema.primary_key)?;
        if !self.scoped {
            return Ok(query);
        }
        rewrite_for_branch(query, &self.registry, ctx.branch_id, self.turn_limit)
    }

    pub fn compile(&self, ctx: &ExecutionContext) -> LineageResult<CompiledQuery> {
        let compiled = compile_select(&self.build(ctx)?)?;
        debug!(
            entity = E::TABLE,
            branch_id = ctx.branch_id,
            params = compiled.params.len(),
            sql = %compiled.sql,
            "compiled query"
        );
        Ok(compiled)
    }

    /// Rows as JSON objects, with nested relation columns decoded.
    pub async fn execute_json<X>(&self, executor: &X, ctx: &ExecutionContext) -> LineageResult<Vec<serde_json::Value>>
    where
        X: SqlExecutor + ?Sized,
    {
        let compiled = self.compile(ctx)?;
        let mut rows = executor.fetch(&compiled).await?;
        let nested: HashSet<&str> = self.includes.iter().map(|i| i.relation.name.as_str()).collect();
        for row in &mut rows {
            decode_nested(row, &nested)?;
        }
        Ok(rows)
    }

    /// Rows hydrated into `E`.
    pub async fn execute<X>(&self, executor: &X, ctx: &ExecutionContext) -> LineageResult<Vec<E>>
    where
        X: SqlExecutor + ?Sized,
    {
        self.execute_json(executor, ctx)
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(LineageError::from))
            .collect()
    }

    /// The first hydrated row, if any.
    pub async fn fetch_one<X>(&self, executor: &X, ctx: &ExecutionContext) -> LineageResult<Option<E>>
    where
        X: SqlExecutor + ?Sized,
    {
        Ok(self.execute(executor, ctx).await?.into_iter().next())
    }

    fn bind(&mut self, table: &str) -> String {
        let alias = self.aliases.alias_for(table);
        self.bound.push((alias.clone(), table.to_string()));
        alias
    }

    /// The select list filled in and includes still pending, plus every
    /// alias the tree binds.
    fn into_projection(self) -> (SelectQuery, Vec<(String, String)>) {
        let mut query = self.query;
        if !self.explicit_columns {
            let defaults: Vec<SelectItem> = self
                .schema
                .fields
                .iter()
                .map(|f| SelectItem::expr(qcol(&self.alias, &f.name)))
                .collect();
            let custom = std::mem::take(&mut query.columns);
            query.columns = defaults;
            query.columns.extend(custom);
        }
        query.columns.extend(
            self.includes
                .into_iter()
                .map(|inc| SelectItem::Include(Box::new(inc))),
        );
        (query, self.bound)
    }
}

/// Some drivers hand JSON aggregates back as text.
fn decode_nested(row: &mut serde_json::Value, nested: &HashSet<&str>) -> LineageResult<()> {
    let Some(map) = row.as_object_mut() else {
        return Ok(());
    };
    for (key, value) in map.iter_mut() {
        if !nested.contains(key.as_str()) {
            continue;
        }
        if let serde_json::Value::String(text) = value {
            *value = serde_json::from_str(text)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType, Versioning};
    use crate::traits::{MockEmbedder, MockSqlExecutor};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Post {
        id: i64,
        title: String,
        #[serde(default)]
        comments: Vec<Comment>,
    }

    impl Entity for Post {
        const TABLE: &'static str = "posts";

        fn schema() -> LineageResult<EntitySchema> {
            EntitySchema::builder("posts")
                .field(FieldDef::new("id", FieldType::BigInt).primary_key())
                .field(FieldDef::new("title", FieldType::Text))
                .field(FieldDef::new("topic", FieldType::Text))
                .field(FieldDef::new("embedding", FieldType::Vector(2)).optional())
                .relation(RelationDef::one_to_many("comments", "comments", "id", "post_id"))
                .build()
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Comment {
        id: i64,
        body: String,
    }

    impl Entity for Comment {
        const TABLE: &'static str = "comments";

        fn schema() -> LineageResult<EntitySchema> {
            EntitySchema::builder("comments")
                .field(FieldDef::new("id", FieldType::BigInt).primary_key())
                .field(FieldDef::new("post_id", FieldType::BigInt).references("posts", "id"))
                .field(FieldDef::new("body", FieldType::Text))
                .field(FieldDef::new("reliability", FieldType::Float))
                .build()
        }
    }

    #[derive(Debug, Deserialize)]
    struct Message {
        #[allow(dead_code)]
        id: i64,
    }

    impl Entity for Message {
        const TABLE: &'static str = "messages";

        fn schema() -> LineageResult<EntitySchema> {
            EntitySchema::builder("messages")
                .field(FieldDef::new("id", FieldType::BigInt).primary_key())
                .field(FieldDef::new("content", FieldType::Text))
                .versioning(Versioning::Turn)
                .build()
        }
    }

    fn registry() -> Arc<SchemaRegistry> {
        let mut registry = SchemaRegistry::new();
        registry.register_entity::<Post>().unwrap();
        registry.register_entity::<Comment>().unwrap();
        registry.register_entity::<Message>().unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_filter_compiles_or() {
        let compiled = QuerySet::<Post>::new(registry())
            .unwrap()
            .select(&["id"])
            .unwrap()
            .filter(|p| {
                let topic = p.field("topic")?;
                Ok(topic.eq("animals")? | topic.eq("physics")?)
            })
            .unwrap()
            .compile(&ExecutionContext::new(1))
            .unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT p.id FROM posts AS p WHERE (p.topic = $1 OR p.topic = $2)"
        );
        assert_eq!(compiled.params.len(), 2);
    }

    #[test]
    fn test_include_realiases_child() {
        let registry = registry();
        // child also allocates "c"; the parent has not, so it is kept
        let comments = QuerySet::<Comment>::new(registry.clone())
            .unwrap()
            .select(&["id", "body"])
            .unwrap()
            .filter(|c| c.field("reliability")?.gt(0.5))
            .unwrap();
        let q = QuerySet::<Post>::new(registry)
            .unwrap()
            .select(&["id", "title"])
            .unwrap()
            .include(comments)
            .unwrap();
        let compiled = q.compile(&ExecutionContext::new(1)).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT p.id, p.title, COALESCE(json_agg(DISTINCT jsonb_build_object('id', c.id, 'body', c.body)) FILTER (WHERE c.id IS NOT NULL), '[]') AS comments \
             FROM posts AS p LEFT JOIN comments AS c ON (c.post_id = p.id AND c.reliability > $1) \
             GROUP BY p.id, p.title"
        );
    }

    #[test]
    fn test_include_renames_clashing_alias() {
        let registry = registry();
        let mut parent = QuerySet::<Post>::new(registry.clone()).unwrap();
        parent.bind("comments");
        let q = parent
            .select(&["id"])
            .unwrap()
            .include(QuerySet::<Comment>::new(registry).unwrap().select(&["id"]).unwrap())
            .unwrap();
        let sql = q.compile(&ExecutionContext::new(1)).unwrap().sql;
        assert!(sql.contains("LEFT JOIN comments AS c1 ON c1.post_id = p.id"));
    }

    #[test]
    fn test_no_relation_is_rejected() {
        let err = QuerySet::<Comment>::new(registry())
            .unwrap()
            .join::<Post>()
            .err()
            .unwrap();
        assert_eq!(err.code(), ErrorCode::QryNoRelation);
    }

    #[test]
    fn test_join_and_related_filter() {
        let q = QuerySet::<Post>::new(registry())
            .unwrap()
            .select(&["id"])
            .unwrap()
            .join::<Comment>()
            .unwrap();
        let pred = q.related_proxy::<Comment>().unwrap().field("body").unwrap().like("%x%").unwrap();
        let sql = q.where_(pred).distinct().compile(&ExecutionContext::new(1)).unwrap().sql;
        assert_eq!(
            sql,
            "SELECT DISTINCT p.id FROM posts AS p INNER JOIN comments AS c ON c.post_id = p.id WHERE c.body LIKE $1"
        );
    }

    #[test]
    fn test_versioned_entity_scoped_to_context_branch() {
        let q = QuerySet::<Message>::new(registry()).unwrap().last().unwrap();
        let compiled = q.compile(&ExecutionContext::new(7)).unwrap();
        assert!(compiled.sql.starts_with("WITH RECURSIVE branch_hierarchy"));
        assert!(compiled
            .sql
            .ends_with("FROM filtered_messages AS m ORDER BY m.id DESC LIMIT 1"));
        assert_eq!(compiled.params[0], SqlValue::Int(7));

        let raw = q.unversioned().compile(&ExecutionContext::new(7)).unwrap();
        assert!(raw.params.is_empty());
        assert!(raw.sql.starts_with("SELECT m.id, m.content, m.branch_id, m.turn_id FROM messages AS m"));
    }

    #[tokio::test]
    async fn test_execute_hydrates_nested_rows() {
        let registry = registry();
        let q = QuerySet::<Post>::new(registry.clone())
            .unwrap()
            .select(&["id", "title"])
            .unwrap()
            .include(QuerySet::<Comment>::new(registry).unwrap().select(&["id", "body"]).unwrap())
            .unwrap();

        let mut executor = MockSqlExecutor::new();
        executor
            .expect_fetch()
            .withf(|q| q.sql.contains("GROUP BY p.id, p.title"))
            .times(1)
            .returning(|_| {
                Ok(vec![
                    json!({"id": 1, "title": "a", "comments": [{"id": 10, "body": "x"}, {"id": 11, "body": "y"}]}),
                    json!({"id": 2, "title": "b", "comments": "[]"}),
                ])
            });

        let posts = q.execute(&executor, &ExecutionContext::new(1)).await.unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].comments.len(), 2);
        assert!(posts[1].comments.is_empty());
    }

    #[tokio::test]
    async fn test_similar_orders_by_distance() {
        let mut embedder = MockEmbedder::new();
        embedder
            .expect_embed()
            .returning(|_| Ok(vec![0.5, 0.5]));

        let q = QuerySet::<Post>::new(registry())
            .unwrap()
            .select(&["id"])
            .unwrap()
            .similar("embedding", "cats", &embedder, 3)
            .await
            .unwrap();
        let compiled = q.compile(&ExecutionContext::new(1)).unwrap();
        assert_eq!(
            compiled.sql,
            "SELECT p.id FROM posts AS p ORDER BY (p.embedding <=> $1) ASC LIMIT 3"
        );
        assert_eq!(compiled.params, vec![SqlValue::Vector(vec![0.5, 0.5])]);
    }
}
