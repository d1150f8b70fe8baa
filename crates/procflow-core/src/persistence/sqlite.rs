// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteQueryResult};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::error::{EngineError, Result};

use super::{
    Change, ChangeSet, EventSubscription, EventSubscriptionQuery, Execution, Job, JobKind,
    JobQuery, Persistence, VariableInstance,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const EXECUTION_COLUMNS: &str = "id, parent_id, process_instance_id, process_definition_id, \
     activity_id, business_key, is_active, is_scope, is_concurrent, is_suspended, tenant_id, revision";

const VARIABLE_COLUMNS: &str =
    "id, scope_id, scope_type, process_instance_id, name, value, revision";

const JOB_COLUMNS: &str = "id, correlation_id, kind, job_type, handler_configuration, \
     execution_id, process_instance_id, process_definition_id, topic, priority, due_date, \
     lock_owner, lock_expiration_time, retries, failed_attempts, exception_message, \
     exception_stacktrace, tenant_id, created_at, revision";

const EVENT_SUBSCRIPTION_COLUMNS: &str = "id, event_type, event_name, execution_id, \
     process_instance_id, activity_id, tenant_id, created_at, revision";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The schema is not touched; call [`migrate`](Self::migrate) if needed.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL (e.g. `sqlite:.data/procflow.db`) and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| EngineError::database("connect", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| EngineError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        let persistence = Self { pool };
        persistence.migrate().await?;
        Ok(persistence)
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if they don't exist,
    /// then runs all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/procflow.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Run all embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| EngineError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Turn "zero rows affected" into an optimistic-lock failure.
fn expect_one(result: SqliteQueryResult, entity: &'static str, id: &str) -> Result<()> {
    if result.rows_affected() == 1 {
        Ok(())
    } else {
        Err(EngineError::OptimisticLock {
            entity,
            id: id.to_string(),
        })
    }
}

/// Map a unique-key violation on insert to an optimistic-lock failure.
fn insert_conflict(err: sqlx::Error, entity: &'static str, id: &str) -> EngineError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => EngineError::OptimisticLock {
            entity,
            id: id.to_string(),
        },
        _ => err.into(),
    }
}

async fn apply_execution(conn: &mut SqliteConnection, change: &Change<Execution>) -> Result<()> {
    match change {
        Change::Insert(e) => {
            sqlx::query(
                r#"
                INSERT INTO executions (id, parent_id, process_instance_id, process_definition_id,
                    activity_id, business_key, is_active, is_scope, is_concurrent, is_suspended,
                    tenant_id, revision)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1)
                "#,
            )
            .bind(&e.id)
            .bind(&e.parent_id)
            .bind(&e.process_instance_id)
            .bind(&e.process_definition_id)
            .bind(&e.activity_id)
            .bind(&e.business_key)
            .bind(e.is_active)
            .bind(e.is_scope)
            .bind(e.is_concurrent)
            .bind(e.is_suspended)
            .bind(&e.tenant_id)
            .execute(&mut *conn)
            .await
            .map_err(|err| insert_conflict(err, "execution", &e.id))?;
            Ok(())
        }
        Change::Update(e) => {
            let result = sqlx::query(
                r#"
                UPDATE executions
                SET parent_id = ?1, activity_id = ?2, business_key = ?3, is_active = ?4,
                    is_scope = ?5, is_concurrent = ?6, is_suspended = ?7, tenant_id = ?8,
                    revision = revision + 1
                WHERE id = ?9 AND revision = ?10
                "#,
            )
            .bind(&e.parent_id)
            .bind(&e.activity_id)
            .bind(&e.business_key)
            .bind(e.is_active)
            .bind(e.is_scope)
            .bind(e.is_concurrent)
            .bind(e.is_suspended)
            .bind(&e.tenant_id)
            .bind(&e.id)
            .bind(e.revision)
            .execute(&mut *conn)
            .await?;
            expect_one(result, "execution", &e.id)
        }
        Change::Delete { id, revision } => {
            let result = sqlx::query("DELETE FROM executions WHERE id = ?1 AND revision = ?2")
                .bind(id)
                .bind(revision)
                .execute(&mut *conn)
                .await?;
            expect_one(result, "execution", id)
        }
    }
}

async fn apply_variable(
    conn: &mut SqliteConnection,
    change: &Change<VariableInstance>,
) -> Result<()> {
    match change {
        Change::Insert(v) => {
            sqlx::query(
                r#"
                INSERT INTO variables (id, scope_id, scope_type, process_instance_id, name, value, revision)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
                "#,
            )
            .bind(&v.id)
            .bind(&v.scope_id)
            .bind(v.scope_type.as_str())
            .bind(&v.process_instance_id)
            .bind(&v.name)
            .bind(Json(&v.value))
            .execute(&mut *conn)
            .await
            .map_err(|err| insert_conflict(err, "variable", &v.id))?;
            Ok(())
        }
        Change::Update(v) => {
            let result = sqlx::query(
                r#"
                UPDATE variables
                SET value = ?1, revision = revision + 1
                WHERE id = ?2 AND revision = ?3
                "#,
            )
            .bind(Json(&v.value))
            .bind(&v.id)
            .bind(v.revision)
            .execute(&mut *conn)
            .await?;
            expect_one(result, "variable", &v.id)
        }
        Change::Delete { id, revision } => {
            let result = sqlx::query("DELETE FROM variables WHERE id = ?1 AND revision = ?2")
                .bind(id)
                .bind(revision)
                .execute(&mut *conn)
                .await?;
            expect_one(result, "variable", id)
        }
    }
}

async fn apply_job(conn: &mut SqliteConnection, change: &Change<Job>) -> Result<()> {
    match change {
        Change::Insert(j) => {
            sqlx::query(
                r#"
                INSERT INTO jobs (id, correlation_id, kind, job_type, handler_configuration,
                    execution_id, process_instance_id, process_definition_id, topic, priority,
                    due_date, lock_owner, lock_expiration_time, retries, failed_attempts,
                    exception_message, exception_stacktrace, tenant_id, created_at, revision)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, 1)
                "#,
            )
            .bind(&j.id)
            .bind(&j.correlation_id)
            .bind(j.kind.as_str())
            .bind(&j.job_type)
            .bind(&j.handler_configuration)
            .bind(&j.execution_id)
            .bind(&j.process_instance_id)
            .bind(&j.process_definition_id)
            .bind(&j.topic)
            .bind(j.priority)
            .bind(j.due_date)
            .bind(&j.lock_owner)
            .bind(j.lock_expiration_time)
            .bind(j.retries)
            .bind(j.failed_attempts)
            .bind(&j.exception_message)
            .bind(&j.exception_stacktrace)
            .bind(&j.tenant_id)
            .bind(j.created_at)
            .execute(&mut *conn)
            .await
            .map_err(|err| insert_conflict(err, "job", &j.id))?;
            Ok(())
        }
        Change::Update(j) => {
            let result = sqlx::query(
                r#"
                UPDATE jobs
                SET kind = ?1, handler_configuration = ?2, execution_id = ?3, topic = ?4,
                    priority = ?5, due_date = ?6, lock_owner = ?7, lock_expiration_time = ?8,
                    retries = ?9, failed_attempts = ?10, exception_message = ?11,
                    exception_stacktrace = ?12, revision = revision + 1
                WHERE id = ?13 AND revision = ?14
                "#,
            )
            .bind(j.kind.as_str())
            .bind(&j.handler_configuration)
            .bind(&j.execution_id)
            .bind(&j.topic)
            .bind(j.priority)
            .bind(j.due_date)
            .bind(&j.lock_owner)
            .bind(j.lock_expiration_time)
            .bind(j.retries)
            .bind(j.failed_attempts)
            .bind(&j.exception_message)
            .bind(&j.exception_stacktrace)
            .bind(&j.id)
            .bind(j.revision)
            .execute(&mut *conn)
            .await?;
            expect_one(result, "job", &j.id)
        }
        Change::Delete { id, revision } => {
            let result = sqlx::query("DELETE FROM jobs WHERE id = ?1 AND revision = ?2")
                .bind(id)
                .bind(revision)
                .execute(&mut *conn)
                .await?;
            expect_one(result, "job", id)
        }
    }
}

async fn apply_event_subscription(
    conn: &mut SqliteConnection,
    change: &Change<EventSubscription>,
) -> Result<()> {
    match change {
        Change::Insert(s) => {
            sqlx::query(
                r#"
                INSERT INTO event_subscriptions (id, event_type, event_name, execution_id,
                    process_instance_id, activity_id, tenant_id, created_at, revision)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
                "#,
            )
            .bind(&s.id)
            .bind(s.event_type.as_str())
            .bind(&s.event_name)
            .bind(&s.execution_id)
            .bind(&s.process_instance_id)
            .bind(&s.activity_id)
            .bind(&s.tenant_id)
            .bind(s.created_at)
            .execute(&mut *conn)
            .await
            .map_err(|err| insert_conflict(err, "event_subscription", &s.id))?;
            Ok(())
        }
        Change::Update(s) => {
            let result = sqlx::query(
                r#"
                UPDATE event_subscriptions
                SET execution_id = ?1, activity_id = ?2, revision = revision + 1
                WHERE id = ?3 AND revision = ?4
                "#,
            )
            .bind(&s.execution_id)
            .bind(&s.activity_id)
            .bind(&s.id)
            .bind(s.revision)
            .execute(&mut *conn)
            .await?;
            expect_one(result, "event_subscription", &s.id)
        }
        Change::Delete { id, revision } => {
            let result =
                sqlx::query("DELETE FROM event_subscriptions WHERE id = ?1 AND revision = ?2")
                    .bind(id)
                    .bind(revision)
                    .execute(&mut *conn)
                    .await?;
            expect_one(result, "event_subscription", id)
        }
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn find_execution(&self, id: &str) -> Result<Option<Execution>> {
        let record = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {} FROM executions WHERE id = ?",
            EXECUTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_executions_by_process_instance(
        &self,
        process_instance_id: &str,
    ) -> Result<Vec<Execution>> {
        let records = sqlx::query_as::<_, Execution>(&format!(
            "SELECT {} FROM executions WHERE process_instance_id = ? ORDER BY id",
            EXECUTION_COLUMNS
        ))
        .bind(process_instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn find_process_instances(
        &self,
        process_definition_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Execution>> {
        let records = sqlx::query_as::<_, Execution>(&format!(
            r#"
            SELECT {} FROM executions
            WHERE parent_id IS NULL
              AND (?1 IS NULL OR process_definition_id = ?1)
            ORDER BY id
            LIMIT ?2
            "#,
            EXECUTION_COLUMNS
        ))
        .bind(process_definition_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn find_variables_by_process_instance(
        &self,
        process_instance_id: &str,
    ) -> Result<Vec<VariableInstance>> {
        let records = sqlx::query_as::<_, VariableInstance>(&format!(
            "SELECT {} FROM variables WHERE process_instance_id = ? ORDER BY id",
            VARIABLE_COLUMNS
        ))
        .bind(process_instance_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn find_job(&self, id: &str) -> Result<Option<Job>> {
        let record = sqlx::query_as::<_, Job>(&format!(
            "SELECT {} FROM jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let records = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {} FROM jobs
            WHERE (?1 IS NULL OR kind = ?1)
              AND (?2 IS NULL OR job_type = ?2)
              AND (?3 IS NULL OR process_instance_id = ?3)
              AND (?4 IS NULL OR execution_id = ?4)
              AND (?5 IS NULL OR topic = ?5)
              AND (?6 IS NULL OR (due_date IS NOT NULL AND julianday(due_date) <= julianday(?6)))
              AND (?7 IS NULL OR (lock_owner IS NOT NULL
                   AND lock_expiration_time IS NOT NULL
                   AND julianday(lock_expiration_time) <= julianday(?7)))
            ORDER BY julianday(created_at) ASC, id ASC
            LIMIT ?8
            "#,
            JOB_COLUMNS
        ))
        .bind(query.kind.map(|k| k.as_str()))
        .bind(&query.job_type)
        .bind(&query.process_instance_id)
        .bind(&query.execution_id)
        .bind(&query.topic)
        .bind(query.due_before)
        .bind(query.lock_expired_before)
        // LIMIT -1 means no limit in SQLite
        .bind(query.limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn find_acquirable_jobs(
        &self,
        kind: JobKind,
        topics: Option<&[String]>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        if let Some(topics) = topics
            && topics.is_empty()
        {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM jobs WHERE kind = ", JOB_COLUMNS));
        qb.push_bind(kind.as_str());
        qb.push(" AND retries > 0");
        qb.push(" AND (lock_owner IS NULL OR lock_expiration_time IS NULL OR julianday(lock_expiration_time) <= julianday(");
        qb.push_bind(now);
        qb.push("))");
        qb.push(" AND (due_date IS NULL OR julianday(due_date) <= julianday(");
        qb.push_bind(now);
        qb.push("))");
        if let Some(topics) = topics {
            qb.push(" AND topic IN (");
            let mut separated = qb.separated(", ");
            for topic in topics {
                separated.push_bind(topic.clone());
            }
            separated.push_unseparated(")");
        }
        qb.push(
            " ORDER BY priority DESC, julianday(COALESCE(due_date, created_at)) ASC, \
             julianday(created_at) ASC, id ASC LIMIT ",
        );
        qb.push_bind(limit);

        let records = qb.build_query_as::<Job>().fetch_all(&self.pool).await?;
        Ok(records)
    }

    async fn find_event_subscriptions(
        &self,
        query: &EventSubscriptionQuery,
    ) -> Result<Vec<EventSubscription>> {
        let records = sqlx::query_as::<_, EventSubscription>(&format!(
            r#"
            SELECT {} FROM event_subscriptions
            WHERE (?1 IS NULL OR event_type = ?1)
              AND (?2 IS NULL OR event_name = ?2)
              AND (?3 IS NULL OR process_instance_id = ?3)
              AND (?4 IS NULL OR execution_id = ?4)
            ORDER BY julianday(created_at) ASC, id ASC
            "#,
            EVENT_SUBSCRIPTION_COLUMNS
        ))
        .bind(query.event_type.map(|t| t.as_str()))
        .bind(&query.event_name)
        .bind(&query.process_instance_id)
        .bind(&query.execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn lock_job(
        &self,
        job_id: &str,
        expected_revision: i32,
        lock_owner: &str,
        lock_expiration_time: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_owner = ?1, lock_expiration_time = ?2, revision = revision + 1
            WHERE id = ?3 AND revision = ?4
            "#,
        )
        .bind(lock_owner)
        .bind(lock_expiration_time)
        .bind(job_id)
        .bind(expected_revision)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn flush(&self, changes: ChangeSet) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for change in &changes.executions {
            apply_execution(&mut *tx, change).await?;
        }
        for change in &changes.variables {
            apply_variable(&mut *tx, change).await?;
        }
        for change in &changes.jobs {
            apply_job(&mut *tx, change).await?;
        }
        for change in &changes.event_subscriptions {
            apply_event_subscription(&mut *tx, change).await?;
        }

        // Dropping the transaction on an early return rolls it back.
        tx.commit().await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let result: std::result::Result<(i64,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{EventType, ScopeType, VariableValue};
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    fn execution(id: &str) -> Execution {
        Execution {
            id: id.to_string(),
            parent_id: None,
            process_instance_id: id.to_string(),
            process_definition_id: "order".to_string(),
            activity_id: Some("start".to_string()),
            business_key: Some("order-42".to_string()),
            is_active: true,
            is_scope: true,
            is_concurrent: false,
            is_suspended: false,
            tenant_id: None,
            revision: 1,
        }
    }

    fn job(id: &str, kind: JobKind, priority: i64, created_at: DateTime<Utc>) -> Job {
        Job {
            id: id.to_string(),
            correlation_id: None,
            kind,
            job_type: "async-continuation".to_string(),
            handler_configuration: Some("before".to_string()),
            execution_id: Some("pi-1".to_string()),
            process_instance_id: Some("pi-1".to_string()),
            process_definition_id: Some("order".to_string()),
            topic: None,
            priority,
            due_date: None,
            lock_owner: None,
            lock_expiration_time: None,
            retries: 3,
            failed_attempts: 0,
            exception_message: None,
            exception_stacktrace: None,
            tenant_id: None,
            created_at,
            revision: 1,
        }
    }

    #[tokio::test]
    async fn test_flush_round_trips_all_tables() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = Utc::now();

        let variable = VariableInstance {
            id: Uuid::new_v4().to_string(),
            scope_id: "pi-1".to_string(),
            scope_type: ScopeType::Execution,
            process_instance_id: "pi-1".to_string(),
            name: "amount".to_string(),
            value: VariableValue::Double(99.5),
            revision: 1,
        };
        let subscription = EventSubscription {
            id: Uuid::new_v4().to_string(),
            event_type: EventType::Message,
            event_name: "payment-received".to_string(),
            execution_id: "pi-1".to_string(),
            process_instance_id: "pi-1".to_string(),
            activity_id: "wait-payment".to_string(),
            tenant_id: None,
            created_at: now,
            revision: 1,
        };

        persistence
            .flush(ChangeSet {
                executions: vec![Change::Insert(execution("pi-1"))],
                variables: vec![Change::Insert(variable.clone())],
                jobs: vec![Change::Insert(job("job-1", JobKind::Ready, 0, now))],
                event_subscriptions: vec![Change::Insert(subscription.clone())],
            })
            .await
            .expect("Failed to flush");

        let loaded = persistence
            .find_execution("pi-1")
            .await
            .unwrap()
            .expect("Execution should exist");
        assert_eq!(loaded, execution("pi-1"));

        let variables = persistence
            .find_variables_by_process_instance("pi-1")
            .await
            .unwrap();
        assert_eq!(variables, vec![variable]);

        let stored_job = persistence.find_job("job-1").await.unwrap().unwrap();
        assert_eq!(stored_job.kind, JobKind::Ready);
        assert_eq!(stored_job.handler_configuration.as_deref(), Some("before"));

        let subscriptions = persistence
            .find_event_subscriptions(&EventSubscriptionQuery {
                event_name: Some("payment-received".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].event_type, EventType::Message);
    }

    #[tokio::test]
    async fn test_flush_rolls_back_on_stale_revision() {
        let persistence = SqlitePersistence::new(test_pool().await);

        persistence
            .flush(ChangeSet {
                executions: vec![Change::Insert(execution("pi-1"))],
                ..Default::default()
            })
            .await
            .unwrap();

        let mut stale = execution("pi-1");
        stale.revision = 7;
        let err = persistence
            .flush(ChangeSet {
                executions: vec![
                    Change::Insert(execution("pi-2")),
                    Change::Update(stale),
                ],
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(err.is_optimistic_lock());
        assert!(
            persistence.find_execution("pi-2").await.unwrap().is_none(),
            "insert from the failed flush must be rolled back"
        );
    }

    #[tokio::test]
    async fn test_insert_collision_is_optimistic_lock() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let changes = ChangeSet {
            executions: vec![Change::Insert(execution("pi-1"))],
            ..Default::default()
        };
        persistence.flush(changes.clone()).await.unwrap();

        let err = persistence.flush(changes).await.unwrap_err();
        assert_eq!(err.error_code(), "OPTIMISTIC_LOCK");
    }

    #[tokio::test]
    async fn test_lock_job_compare_and_swap() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = Utc::now();
        persistence
            .flush(ChangeSet {
                jobs: vec![Change::Insert(job("job-1", JobKind::Ready, 0, now))],
                ..Default::default()
            })
            .await
            .unwrap();

        let expires = now + ChronoDuration::minutes(5);
        assert!(persistence.lock_job("job-1", 1, "w1", expires).await.unwrap());
        assert!(!persistence.lock_job("job-1", 1, "w2", expires).await.unwrap());

        let locked = persistence.find_job("job-1").await.unwrap().unwrap();
        assert_eq!(locked.lock_owner.as_deref(), Some("w1"));
        assert_eq!(locked.revision, 2);
    }

    #[tokio::test]
    async fn test_find_acquirable_jobs_filters_and_orders() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = Utc::now();

        let low = job("low", JobKind::Ready, 0, now - ChronoDuration::seconds(30));
        let high = job("high", JobKind::Ready, 10, now - ChronoDuration::seconds(5));
        let mut future = job("future", JobKind::Ready, 50, now);
        future.due_date = Some(now + ChronoDuration::minutes(1));
        let mut locked = job("locked", JobKind::Ready, 50, now);
        locked.lock_owner = Some("other".to_string());
        locked.lock_expiration_time = Some(now + ChronoDuration::minutes(1));
        let mut expired = job("expired", JobKind::Ready, 5, now);
        expired.lock_owner = Some("crashed".to_string());
        expired.lock_expiration_time = Some(now - ChronoDuration::minutes(1));
        let mut exhausted = job("exhausted", JobKind::Ready, 50, now);
        exhausted.retries = 0;
        let timer = job("timer", JobKind::Timer, 50, now);

        persistence
            .flush(ChangeSet {
                jobs: [low, high, future, locked, expired, exhausted, timer]
                    .into_iter()
                    .map(Change::Insert)
                    .collect(),
                ..Default::default()
            })
            .await
            .unwrap();

        let acquirable = persistence
            .find_acquirable_jobs(JobKind::Ready, None, now, 10)
            .await
            .unwrap();
        let ids: Vec<&str> = acquirable.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "expired", "low"]);

        let limited = persistence
            .find_acquirable_jobs(JobKind::Ready, None, now, 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_find_acquirable_jobs_by_topic() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = Utc::now();

        let mut billing = job("billing", JobKind::ExternalWorker, 0, now);
        billing.topic = Some("billing".to_string());
        let mut shipping = job("shipping", JobKind::ExternalWorker, 0, now);
        shipping.topic = Some("shipping".to_string());

        persistence
            .flush(ChangeSet {
                jobs: vec![Change::Insert(billing), Change::Insert(shipping)],
                ..Default::default()
            })
            .await
            .unwrap();

        let topics = vec!["billing".to_string()];
        let found = persistence
            .find_acquirable_jobs(JobKind::ExternalWorker, Some(topics.as_slice()), now, 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "billing");

        let none = persistence
            .find_acquirable_jobs(JobKind::ExternalWorker, Some(&[][..]), now, 10)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_find_jobs_with_lock_filter() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let now = Utc::now();

        let mut expired = job("expired", JobKind::Ready, 0, now);
        expired.lock_owner = Some("crashed".to_string());
        expired.lock_expiration_time = Some(now - ChronoDuration::seconds(1));
        let free = job("free", JobKind::Ready, 0, now);

        persistence
            .flush(ChangeSet {
                jobs: vec![Change::Insert(expired), Change::Insert(free)],
                ..Default::default()
            })
            .await
            .unwrap();

        let all = persistence.find_jobs(&JobQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let reclaimable = persistence
            .find_jobs(&JobQuery {
                lock_expired_before: Some(now),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(reclaimable.len(), 1);
        assert_eq!(reclaimable[0].id, "expired");
    }

    #[tokio::test]
    async fn test_find_process_instances() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let mut child = execution("child");
        child.parent_id = Some("pi-1".to_string());
        child.process_instance_id = "pi-1".to_string();

        persistence
            .flush(ChangeSet {
                executions: vec![
                    Change::Insert(execution("pi-1")),
                    Change::Insert(child),
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        let roots = persistence
            .find_process_instances(Some("order"), 10)
            .await
            .unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id, "pi-1");

        let tree = persistence
            .find_executions_by_process_instance("pi-1")
            .await
            .unwrap();
        assert_eq!(tree.len(), 2);
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("procflow.db");

        let persistence = SqlitePersistence::from_path(&path)
            .await
            .expect("Failed to open database");
        assert!(persistence.health_check().await.unwrap());
        assert!(path.exists());
    }
}
