//! Branch and turn storage in the `branches` and `turns` tables.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use lineage_core::sql::{
    col, func, param, qcol, CteBody, InsertQuery, InsertSource, JoinKind, Table, UnionQuery,
    UpdateQuery,
};
use lineage_core::{
    compile, Branch, CompiledQuery, Expr, LineageError, LineageResult, NewBranch, NewTurn,
    SchemaRegistry, SelectQuery, SqlExecutor, SqlValue, Turn, TurnStatus, VersionBackend,
};

use crate::error::decode_error;

/// Increment the branch counter and insert the staged turn in one statement,
/// so concurrent starts on one branch serialize on the branch row.
const START_TURN: &str = "WITH updated_branch AS (\
UPDATE branches SET current_index = current_index + 1, updated_at = NOW() \
WHERE id = $1{guard} \
RETURNING id, current_index) \
INSERT INTO turns (branch_id, index, status, message, metadata) \
SELECT id, current_index, 'staged', $2::text, $3::jsonb FROM updated_branch \
RETURNING *";

const NO_STAGED_TURN: &str =
    " AND NOT EXISTS (SELECT 1 FROM turns WHERE branch_id = $1 AND status = 'staged')";

/// Move the identity sequence past explicitly inserted branch ids.
pub(crate) const SYNC_BRANCH_IDS: &str = "SELECT setval(pg_get_serial_sequence('branches', 'id'), \
GREATEST((SELECT MAX(id) FROM branches), 1))";

/// Delete the rows written by the doomed turns, then the turns, and reset
/// the counter. Row FKs are checked at the end of the statement, so one
/// statement covers both tables.
const REWIND: &str = "WITH doomed AS (\
SELECT id FROM turns WHERE branch_id = $1 AND index > $2){rows}, \
removed AS (DELETE FROM turns WHERE id IN (SELECT id FROM doomed) RETURNING *), \
reset AS (UPDATE branches SET current_index = $2, updated_at = NOW() WHERE id = $1) \
SELECT * FROM removed ORDER BY index";

/// [`VersionBackend`] over any [`SqlExecutor`] pointed at Postgres.
pub struct PostgresVersionBackend<X: SqlExecutor> {
    executor: Arc<X>,
    /// Versioned tables whose rows a rewind deletes with their turns.
    row_tables: Vec<String>,
}

impl<X: SqlExecutor> PostgresVersionBackend<X> {
    pub fn new(executor: Arc<X>) -> Self {
        Self {
            executor,
            row_tables: Vec::new(),
        }
    }

    /// Cascade rewinds into the versioned tables of `registry`.
    pub fn with_registry(mut self, registry: &SchemaRegistry) -> Self {
        self.row_tables = crate::record::versioned_tables(registry);
        self
    }

    pub fn executor(&self) -> &Arc<X> {
        &self.executor
    }

    async fn fetch_all<T: DeserializeOwned>(&self, query: &CompiledQuery) -> LineageResult<Vec<T>> {
        self.executor
            .fetch(query)
            .await?
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(decode_error))
            .collect()
    }

    async fn fetch_one<T: DeserializeOwned>(&self, query: &CompiledQuery) -> LineageResult<Option<T>> {
        match self.executor.fetch_optional(query).await? {
            Some(row) => Ok(Some(serde_json::from_value(row).map_err(decode_error)?)),
            None => Ok(None),
        }
    }
}

fn by_id(table: &str, id: i64) -> LineageResult<CompiledQuery> {
    compile(
        &SelectQuery::from(Table::new(table))
            .column(Expr::Star(None))
            .and_where(col("id").eq(param(id)))
            .into(),
    )
}

fn start_turn_query(turn: &NewTurn) -> CompiledQuery {
    let guard = if turn.exclusive { NO_STAGED_TURN } else { "" };
    let metadata = if turn.metadata.is_null() {
        SqlValue::Null
    } else {
        SqlValue::Json(turn.metadata.clone())
    };
    CompiledQuery {
        sql: START_TURN.replace("{guard}", guard),
        params: vec![
            SqlValue::Int(turn.branch_id),
            SqlValue::from(turn.message.clone()),
            metadata,
        ],
    }
}

fn create_branch_query(branch: &NewBranch) -> LineageResult<CompiledQuery> {
    let name = SqlValue::from(branch.name.clone());
    let mut columns: Vec<String> = Vec::new();
    if branch.id.is_some() {
        columns.push("id".into());
    }
    let mut insert = match &branch.from {
        None => {
            let mut row = vec![param(name), param(0)];
            if let Some(id) = branch.id {
                row.insert(0, param(id));
            }
            columns.extend(["name".into(), "current_index".into()]);
            InsertQuery::values("branches", columns, row)
        }
        Some(turn) => {
            // the fork position is read from the stored turn, not the caller's copy
            let mut source = SelectQuery::from(Table::aliased("turns", "t"));
            if let Some(id) = branch.id {
                source = source.column(param(id));
            }
            let source = source
                .column(param(name))
                .column(qcol("t", "index"))
                .column(qcol("t", "index"))
                .column(qcol("t", "id"))
                .column(qcol("t", "branch_id"))
                .and_where(qcol("t", "id").eq(param(turn.id)));
            columns.extend([
                "name".into(),
                "current_index".into(),
                "forked_from_index".into(),
                "forked_from_turn_id".into(),
                "forked_from_branch_id".into(),
            ]);
            InsertQuery {
                table: "branches".into(),
                columns,
                source: InsertSource::Select(Box::new(source)),
                on_conflict_do_nothing: false,
                returning: Vec::new(),
            }
        }
    };
    insert.on_conflict_do_nothing = branch.id.is_some();
    compile(&insert.returning(vec![Expr::Star(None)]).into())
}

fn rewind_query(branch_id: i64, index: i64, row_tables: &[String]) -> CompiledQuery {
    let rows: String = row_tables
        .iter()
        .enumerate()
        .map(|(i, table)| {
            format!(
                ", rows_{} AS (DELETE FROM {} WHERE turn_id IN (SELECT id FROM doomed))",
                i, table
            )
        })
        .collect();
    CompiledQuery {
        sql: REWIND.replace("{rows}", &rows),
        params: vec![SqlValue::Int(branch_id), SqlValue::Int(index)],
    }
}

fn finish_turn_query(
    turn_id: i64,
    status: TurnStatus,
    message: Option<String>,
) -> LineageResult<CompiledQuery> {
    let update = UpdateQuery {
        table: Table::new("turns"),
        set: vec![
            ("status".into(), param(status.as_str())),
            ("ended_at".into(), func("NOW", vec![])),
            (
                "message".into(),
                Expr::Coalesce(vec![param(SqlValue::from(message)), col("message")]),
            ),
        ],
        where_clause: Some(
            col("id")
                .eq(param(turn_id))
                .and(col("status").eq(param(TurnStatus::Staged.as_str()))),
        ),
        returning: vec![Expr::Star(None)],
    };
    compile(&update.into())
}

/// Recursive walk over `branches`. `step_on` joins the next level to the
/// previous one, aliased `p` (next) and `c` (previous).
fn branch_walk(seed: Expr, step_on: Expr) -> LineageResult<CompiledQuery> {
    const WALK: &str = "branch_walk";
    let base = SelectQuery::from(Table::aliased("branches", "b"))
        .column(Expr::Star(Some("b".into())))
        .and_where(seed);
    let step = SelectQuery::from(Table::aliased("branches", "p"))
        .column(Expr::Star(Some("p".into())))
        .join(JoinKind::Inner, Table::aliased(WALK, "c"), step_on);
    let query = SelectQuery::from(Table::new(WALK))
        .column(Expr::Star(None))
        .order_by(col("id").asc())
        .with_cte(
            WALK,
            CteBody::Union(UnionQuery {
                left: Box::new(base),
                right: Box::new(step),
                all: false,
            }),
            true,
        );
    compile(&query.into())
}

/// Order a fetched chain from `branch_id` up to the root.
fn order_chain(branch_id: i64, mut rows: Vec<Branch>) -> LineageResult<Vec<Branch>> {
    let mut chain = Vec::with_capacity(rows.len());
    let mut next = Some(branch_id);
    while let Some(id) = next {
        let pos = rows
            .iter()
            .position(|b| b.id == id)
            .ok_or_else(|| LineageError::branch_not_found(id))?;
        let branch = rows.swap_remove(pos);
        next = branch.forked_from_branch_id;
        chain.push(branch);
    }
    Ok(chain)
}

#[async_trait]
impl<X: SqlExecutor> VersionBackend for PostgresVersionBackend<X> {
    async fn create_branch(&self, branch: NewBranch) -> LineageResult<Branch> {
        let query = create_branch_query(&branch)?;
        if let Some(created) = self.fetch_one::<Branch>(&query).await? {
            if branch.id.is_some() {
                let sync = CompiledQuery {
                    sql: SYNC_BRANCH_IDS.to_string(),
                    params: Vec::new(),
                };
                self.executor.fetch(&sync).await?;
                debug!(branch_id = created.id, "branch id sequence synced");
            }
            return Ok(created);
        }
        // an explicit id that is already taken
        if let Some(id) = branch.id {
            if let Some(existing) = self.get_branch(id).await? {
                return Ok(existing);
            }
        }
        match branch.from {
            Some(turn) => Err(LineageError::turn_not_found(turn.id)),
            None => Err(LineageError::backend("Branch insert returned no row")),
        }
    }

    async fn get_branch(&self, branch_id: i64) -> LineageResult<Option<Branch>> {
        self.fetch_one(&by_id("branches", branch_id)?).await
    }

    async fn list_branches(&self) -> LineageResult<Vec<Branch>> {
        let query = SelectQuery::from(Table::new("branches"))
            .column(Expr::Star(None))
            .order_by(col("id").asc());
        self.fetch_all(&compile(&query.into())?).await
    }

    async fn start_turn(&self, turn: NewTurn) -> LineageResult<Turn> {
        let query = start_turn_query(&turn);
        let started = match self.fetch_one::<Turn>(&query).await {
            Ok(started) => started,
            // lost a race to the partial unique index on staged turns
            Err(e) if e.is_unique_violation() && turn.exclusive => {
                return Err(LineageError::turn_already_staged(turn.branch_id))
            }
            Err(e) => return Err(e),
        };
        match started {
            Some(t) => Ok(t),
            None if self.get_branch(turn.branch_id).await?.is_none() => {
                Err(LineageError::branch_not_found(turn.branch_id))
            }
            None => Err(LineageError::turn_already_staged(turn.branch_id)),
        }
    }

    async fn get_turn(&self, turn_id: i64) -> LineageResult<Option<Turn>> {
        self.fetch_one(&by_id("turns", turn_id)?).await
    }

    async fn finish_turn(
        &self,
        turn_id: i64,
        status: TurnStatus,
        message: Option<String>,
    ) -> LineageResult<Turn> {
        if !TurnStatus::Staged.can_transition_to(status) {
            return Err(LineageError::versioning(format!(
                "Turn {} cannot move to {}",
                turn_id, status
            )));
        }
        let query = finish_turn_query(turn_id, status, message)?;
        if let Some(turn) = self.fetch_one(&query).await? {
            return Ok(turn);
        }
        match self.get_turn(turn_id).await? {
            None => Err(LineageError::turn_not_found(turn_id)),
            Some(current) => Err(LineageError::versioning(format!(
                "Turn {} is {}, cannot move to {}",
                turn_id, current.status, status
            ))),
        }
    }

    async fn ancestry(&self, branch_id: i64) -> LineageResult<Vec<Branch>> {
        let query = branch_walk(
            qcol("b", "id").eq(param(branch_id)),
            qcol("p", "id").eq(qcol("c", "forked_from_branch_id")),
        )?;
        let rows: Vec<Branch> = self.fetch_all(&query).await?;
        if rows.is_empty() {
            return Err(LineageError::branch_not_found(branch_id));
        }
        let chain = order_chain(branch_id, rows)?;
        debug!(branch_id, depth = chain.len(), "loaded ancestry");
        Ok(chain)
    }

    async fn descendants(&self, branch_id: i64) -> LineageResult<Vec<Branch>> {
        let query = branch_walk(
            qcol("b", "forked_from_branch_id").eq(param(branch_id)),
            qcol("p", "forked_from_branch_id").eq(qcol("c", "id")),
        )?;
        self.fetch_all(&query).await
    }

    async fn branch_turns(&self, branch_ids: &[i64]) -> LineageResult<Vec<Turn>> {
        let ids = branch_ids.iter().copied().map(SqlValue::Int).collect();
        let query = SelectQuery::from(Table::new("turns"))
            .column(Expr::Star(None))
            .and_where(col("branch_id").in_list(ids))
            .order_by(col("id").asc());
        self.fetch_all(&compile(&query.into())?).await
    }

    async fn rewind_to(&self, branch_id: i64, index: i64) -> LineageResult<Vec<Turn>> {
        if self.get_branch(branch_id).await?.is_none() {
            return Err(LineageError::branch_not_found(branch_id));
        }
        let query = rewind_query(branch_id, index, &self.row_tables);
        let removed: Vec<Turn> = self.fetch_all(&query).await?;
        debug!(branch_id, index, removed = removed.len(), "turns deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::{json, Value};

    use lineage_core::ErrorCode;

    mockall::mock! {
        Executor {}

        #[async_trait]
        impl SqlExecutor for Executor {
            async fn fetch(&self, query: &CompiledQuery) -> LineageResult<Vec<Value>>;
            async fn execute(&self, query: &CompiledQuery) -> LineageResult<u64>;
        }
    }

    fn branch_row(id: i64, parent: Option<i64>) -> Value {
        json!({
            "id": id,
            "name": format!("b{}", id),
            "current_index": 2,
            "forked_from_index": parent.map(|_| 1),
            "forked_from_turn_id": parent.map(|_| 10),
            "forked_from_branch_id": parent,
            "created_at": "2025-01-01T00:00:00+00:00",
            "updated_at": "2025-01-01T00:00:00+00:00",
        })
    }

    fn turn_row(id: i64, status: &str) -> Value {
        json!({
            "id": id,
            "branch_id": 1,
            "index": 1,
            "status": status,
            "created_at": "2025-01-01T00:00:00+00:00",
            "ended_at": null,
            "message": null,
            "metadata": null,
        })
    }

    #[test]
    fn test_start_turn_is_one_statement() {
        let q = start_turn_query(&NewTurn {
            branch_id: 4,
            exclusive: true,
            ..Default::default()
        });
        assert!(q.sql.starts_with("WITH updated_branch AS (UPDATE branches SET current_index = current_index + 1"));
        assert!(q.sql.contains("NOT EXISTS (SELECT 1 FROM turns WHERE branch_id = $1 AND status = 'staged')"));
        assert!(q.sql.ends_with("FROM updated_branch RETURNING *"));
        assert_eq!(q.params, vec![SqlValue::Int(4), SqlValue::Null, SqlValue::Null]);

        let relaxed = start_turn_query(&NewTurn {
            branch_id: 4,
            ..Default::default()
        });
        assert!(!relaxed.sql.contains("NOT EXISTS"));
    }

    #[test]
    fn test_fork_is_insert_select() {
        let turn: Turn = serde_json::from_value(turn_row(10, "committed")).unwrap();
        let q = create_branch_query(&NewBranch::fork(turn, Some("feature".into()))).unwrap();
        assert_eq!(
            q.sql,
            "INSERT INTO branches (name, current_index, forked_from_index, forked_from_turn_id, forked_from_branch_id) \
             SELECT $1, t.index, t.index, t.id, t.branch_id FROM turns AS t WHERE t.id = $2 RETURNING *"
        );
        assert_eq!(q.params, vec![SqlValue::Text("feature".into()), SqlValue::Int(10)]);
    }

    #[test]
    fn test_explicit_id_insert_skips_conflicts() {
        let q = create_branch_query(&NewBranch::root("main").with_id(5)).unwrap();
        assert_eq!(
            q.sql,
            "INSERT INTO branches (id, name, current_index) VALUES ($1, $2, $3) \
             ON CONFLICT DO NOTHING RETURNING *"
        );
        assert_eq!(
            q.params,
            vec![SqlValue::Int(5), SqlValue::Text("main".into()), SqlValue::Int(0)]
        );

        let plain = create_branch_query(&NewBranch::root("scratch")).unwrap();
        assert!(!plain.sql.contains("ON CONFLICT"));
        assert!(plain.sql.starts_with("INSERT INTO branches (name, current_index)"));
    }

    #[tokio::test]
    async fn test_explicit_id_syncs_sequence_or_returns_existing() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let log = seen.clone();
        let mut executor = MockExecutor::new();
        executor.expect_fetch().returning(move |q| {
            log.lock().unwrap().push(q.sql.clone());
            if q.sql.starts_with("INSERT") {
                Ok(vec![branch_row(5, None)])
            } else {
                Ok(vec![json!({"setval": 5})])
            }
        });
        let backend = PostgresVersionBackend::new(Arc::new(executor));
        let main = backend
            .create_branch(NewBranch::root("main").with_id(5))
            .await
            .unwrap();
        assert_eq!(main.id, 5);
        assert_eq!(seen.lock().unwrap()[1], SYNC_BRANCH_IDS);

        // the id is taken: the insert is skipped and the stored row returned
        let mut executor = MockExecutor::new();
        executor.expect_fetch().returning(|q| {
            if q.sql.starts_with("INSERT") {
                Ok(vec![])
            } else {
                Ok(vec![branch_row(5, None)])
            }
        });
        let backend = PostgresVersionBackend::new(Arc::new(executor));
        let existing = backend
            .create_branch(NewBranch::root("other").with_id(5))
            .await
            .unwrap();
        assert_eq!(existing.name.as_deref(), Some("b5"));
    }

    #[test]
    fn test_rewind_deletes_rows_with_turns() {
        let q = rewind_query(2, 4, &["messages".to_string(), "documents".to_string()]);
        assert_eq!(
            q.sql,
            "WITH doomed AS (SELECT id FROM turns WHERE branch_id = $1 AND index > $2), \
             rows_0 AS (DELETE FROM messages WHERE turn_id IN (SELECT id FROM doomed)), \
             rows_1 AS (DELETE FROM documents WHERE turn_id IN (SELECT id FROM doomed)), \
             removed AS (DELETE FROM turns WHERE id IN (SELECT id FROM doomed) RETURNING *), \
             reset AS (UPDATE branches SET current_index = $2, updated_at = NOW() WHERE id = $1) \
             SELECT * FROM removed ORDER BY index"
        );
        assert_eq!(q.params, vec![SqlValue::Int(2), SqlValue::Int(4)]);
        assert!(!rewind_query(2, 4, &[]).sql.contains("rows_0"));
    }

    #[tokio::test]
    async fn test_rewind_unknown_branch() {
        let mut executor = MockExecutor::new();
        executor.expect_fetch().returning(|_| Ok(vec![]));
        let backend = PostgresVersionBackend::new(Arc::new(executor));
        let err = backend.rewind_to(9, 1).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::VerBranchNotFound);
    }

    #[test]
    fn test_finish_turn_guards_on_staged() {
        let q = finish_turn_query(3, TurnStatus::Reverted, Some("oops".into())).unwrap();
        assert_eq!(
            q.sql,
            "UPDATE turns SET status = $1, ended_at = NOW(), message = COALESCE($2, message) \
             WHERE (id = $3 AND status = $4) RETURNING *"
        );
        assert_eq!(q.params[0], SqlValue::Text("reverted".into()));
    }

    #[test]
    fn test_ancestry_walk_is_recursive() {
        let q = branch_walk(
            qcol("b", "id").eq(param(3)),
            qcol("p", "id").eq(qcol("c", "forked_from_branch_id")),
        )
        .unwrap();
        assert!(q.sql.starts_with("WITH RECURSIVE branch_walk AS (SELECT b.* FROM branches AS b WHERE b.id = $1 UNION SELECT p.* FROM branches AS p INNER JOIN branch_walk AS c ON p.id = c.forked_from_branch_id)"));
    }

    #[tokio::test]
    async fn test_ancestry_orders_target_first() {
        let mut executor = MockExecutor::new();
        executor
            .expect_fetch()
            .returning(|_| Ok(vec![branch_row(1, None), branch_row(3, Some(2)), branch_row(2, Some(1))]));
        let backend = PostgresVersionBackend::new(Arc::new(executor));

        let ids: Vec<i64> = backend.ancestry(3).await.unwrap().iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_start_turn_reports_staged_or_missing_branch() {
        let calls = Arc::new(Mutex::new(0));
        let seen = calls.clone();
        let mut executor = MockExecutor::new();
        executor.expect_fetch().returning(move |q| {
            *seen.lock().unwrap() += 1;
            // the insert returns nothing, the branch lookup finds the branch
            if q.sql.starts_with("WITH updated_branch") {
                Ok(vec![])
            } else {
                Ok(vec![branch_row(1, None)])
            }
        });
        let backend = PostgresVersionBackend::new(Arc::new(executor));

        let err = backend
            .start_turn(NewTurn {
                branch_id: 1,
                exclusive: true,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::VerTurnAlreadyStaged);
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_finish_turn_rejects_terminal_turn() {
        let mut executor = MockExecutor::new();
        executor.expect_fetch().returning(|q| {
            if q.sql.starts_with("UPDATE") {
                Ok(vec![])
            } else {
                Ok(vec![turn_row(5, "committed")])
            }
        });
        let backend = PostgresVersionBackend::new(Arc::new(executor));

        let err = backend.finish_turn(5, TurnStatus::Reverted, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::VerInvalidTransition);
        assert!(err.to_string().contains("is committed"));
    }
}
