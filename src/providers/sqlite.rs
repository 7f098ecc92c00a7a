use super::{OwnerId, Provider, ProviderError};
use crate::{DefinitionIdentity, InstanceId, InstanceRecord, InstanceStatus, now_millis};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite};
use std::collections::BTreeSet;
use std::time::Duration;

/// Configuration for [`SqliteProvider`].
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// How often `wait_for_runnable` re-queries while nothing is due.
    pub poll_interval: Duration,
    pub max_connections: u32,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_connections: 5,
        }
    }
}

/// SQLite-backed storage engine.
///
/// Owners and instances live in two tables. Writes are single statements
/// guarded by `version`, so no explicit transactions are needed.
pub struct SqliteProvider {
    pool: SqlitePool,
    options: SqliteOptions,
}

const INSTANCE_COLUMNS: &str = "instance_id, definition_name, definition_namespace, definition_version, status, \
     blocking_points, state, version, runnable_at, created_at, updated_at";

impl SqliteProvider {
    /// Classify a sqlx error by retryability.
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }

        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }

        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        // Unknown failures are assumed transient.
        ProviderError::retryable(operation, error_msg)
    }

    /// Create a new SQLite provider
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g., "sqlite:data.db?mode=rwc" or "sqlite::memory:")
    /// * `options` - Optional configuration
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(database_url: &str, options: Option<SqliteOptions>) -> Result<Self, sqlx::Error> {
        let options = options.unwrap_or_default();
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        // Shared-cache memory databases report SQLITE_LOCKED instead of waiting, so keep one connection.
        let max_connections = if is_memory { 1 } else { options.max_connections.max(1) };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;

        Self::create_schema(&pool).await?;
        Ok(Self { pool, options })
    }

    /// Convenience: create an in-memory SQLite store for tests
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:", None).await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instance_owners (
                owner_id TEXT PRIMARY KEY,
                host_type TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                definition_name TEXT NOT NULL,
                definition_namespace TEXT NOT NULL,
                definition_version TEXT NOT NULL,
                status TEXT NOT NULL,
                blocking_points TEXT NOT NULL,
                state BLOB,
                version INTEGER NOT NULL,
                runnable_at INTEGER,
                claimed_by TEXT,
                claimed_until INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_instances_runnable ON instances(definition_name, status, runnable_at)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Host type of a live owner, or `LeaseLost`.
    async fn owner_host_type(&self, owner: OwnerId, operation: &str) -> Result<String, ProviderError> {
        let row = sqlx::query("SELECT host_type, expires_at FROM instance_owners WHERE owner_id = ?")
            .bind(owner.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        let Some(row) = row else {
            return Err(ProviderError::lease_lost(operation, format!("owner {owner} not found")));
        };
        let expires_at: i64 = row.try_get("expires_at").map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        if expires_at <= now_millis() as i64 {
            return Err(ProviderError::lease_lost(operation, format!("owner {owner} expired")));
        }
        row.try_get("host_type").map_err(|e| Self::sqlx_to_provider_error(operation, e))
    }

    async fn any_runnable(&self, host_type: &str) -> Result<bool, ProviderError> {
        let now = now_millis() as i64;
        let row = sqlx::query(
            r#"
            SELECT 1 FROM instances
            WHERE definition_name = ?1 AND status = 'Idle'
              AND runnable_at IS NOT NULL AND runnable_at <= ?2
              AND (claimed_until IS NULL OR claimed_until <= ?2)
            LIMIT 1
            "#,
        )
        .bind(host_type)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("wait_for_runnable", e))?;
        Ok(row.is_some())
    }

    /// Existence check used to tell `NotFound` from `VersionConflict` after a guarded write missed.
    async fn classify_miss(&self, operation: &str, instance_id: InstanceId, expected_version: u64) -> ProviderError {
        let found = sqlx::query("SELECT version FROM instances WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool)
            .await;
        match found {
            Ok(None) => ProviderError::not_found(operation, format!("instance not found: {instance_id}")),
            Ok(Some(row)) => {
                let actual: i64 = row.try_get("version").unwrap_or(-1);
                ProviderError::version_conflict(
                    operation,
                    format!("expected version {expected_version}, found {actual}"),
                )
            }
            Err(e) => Self::sqlx_to_provider_error(operation, e),
        }
    }

    fn row_to_record(operation: &str, row: &SqliteRow) -> Result<InstanceRecord, ProviderError> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| ProviderError::permanent(operation, format!("corrupt {what}: {e}"));
        let get_str = |col: &str| row.try_get::<String, _>(col).map_err(|e| corrupt(col, &e));
        let get_i64 = |col: &str| row.try_get::<i64, _>(col).map_err(|e| corrupt(col, &e));

        let instance_id = uuid::Uuid::parse_str(&get_str("instance_id")?).map_err(|e| corrupt("instance_id", &e))?;
        let version = semver::Version::parse(&get_str("definition_version")?).map_err(|e| corrupt("definition_version", &e))?;
        let status_text = get_str("status")?;
        let status = InstanceStatus::parse(&status_text).ok_or_else(|| corrupt("status", &status_text))?;
        let blocking_points: BTreeSet<String> =
            serde_json::from_str(&get_str("blocking_points")?).map_err(|e| corrupt("blocking_points", &e))?;
        let state: Option<Vec<u8>> = row.try_get("state").map_err(|e| corrupt("state", &e))?;
        let runnable_at: Option<i64> = row.try_get("runnable_at").map_err(|e| corrupt("runnable_at", &e))?;

        Ok(InstanceRecord {
            instance_id,
            definition: DefinitionIdentity::new(get_str("definition_name")?, get_str("definition_namespace")?, version),
            status,
            blocking_points,
            state,
            version: get_i64("version")? as u64,
            runnable_at_ms: runnable_at.map(|v| v as u64),
            created_at_ms: get_i64("created_at")? as u64,
            updated_at_ms: get_i64("updated_at")? as u64,
        })
    }

    fn encode_blocking_points(operation: &str, record: &InstanceRecord) -> Result<String, ProviderError> {
        serde_json::to_string(&record.blocking_points)
            .map_err(|e| ProviderError::permanent(operation, format!("Serialization error: {e}")))
    }
}

#[async_trait]
impl Provider for SqliteProvider {
    async fn create_owner(&self, host_type: &str, lease: Duration) -> Result<OwnerId, ProviderError> {
        let owner = uuid::Uuid::new_v4();
        let now = now_millis() as i64;
        sqlx::query("INSERT INTO instance_owners (owner_id, host_type, expires_at, created_at) VALUES (?, ?, ?, ?)")
            .bind(owner.to_string())
            .bind(host_type)
            .bind(now + lease.as_millis() as i64)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("create_owner", e))?;
        Ok(owner)
    }

    async fn delete_owner(&self, owner: OwnerId) -> Result<(), ProviderError> {
        sqlx::query("DELETE FROM instance_owners WHERE owner_id = ?")
            .bind(owner.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("delete_owner", e))?;
        Ok(())
    }

    async fn wait_for_runnable(&self, owner: OwnerId, timeout: Duration) -> Result<bool, ProviderError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let host_type = self.owner_host_type(owner, "wait_for_runnable").await?;
            if self.any_runnable(&host_type).await? {
                return Ok(true);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.options.poll_interval.min(deadline - now)).await;
        }
    }

    async fn claim_runnable(&self, owner: OwnerId, lock_for: Duration) -> Result<Option<InstanceRecord>, ProviderError> {
        let host_type = self.owner_host_type(owner, "claim_runnable").await?;
        let now = now_millis() as i64;
        let sql = format!(
            r#"
            UPDATE instances
            SET claimed_by = ?1, claimed_until = ?2
            WHERE instance_id = (
                SELECT instance_id FROM instances
                WHERE definition_name = ?3 AND status = 'Idle'
                  AND runnable_at IS NOT NULL AND runnable_at <= ?4
                  AND (claimed_until IS NULL OR claimed_until <= ?4)
                ORDER BY runnable_at
                LIMIT 1
            )
            RETURNING {INSTANCE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(owner.to_string())
            .bind(now + lock_for.as_millis() as i64)
            .bind(&host_type)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("claim_runnable", e))?;
        row.as_ref().map(|r| Self::row_to_record("claim_runnable", r)).transpose()
    }

    async fn create_instance(&self, record: &InstanceRecord) -> Result<(), ProviderError> {
        let blocking = Self::encode_blocking_points("create_instance", record)?;
        let sql = format!("INSERT INTO instances ({INSTANCE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)");
        sqlx::query::<Sqlite>(&sql)
            .bind(record.instance_id.to_string())
            .bind(&record.definition.name)
            .bind(&record.definition.namespace)
            .bind(record.definition.version.to_string())
            .bind(record.status.as_str())
            .bind(blocking)
            .bind(record.state.as_deref())
            .bind(record.version as i64)
            .bind(record.runnable_at_ms.map(|v| v as i64))
            .bind(record.created_at_ms as i64)
            .bind(record.updated_at_ms as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("create_instance", e))?;
        Ok(())
    }

    async fn read_instance(&self, instance_id: InstanceId) -> Result<Option<InstanceRecord>, ProviderError> {
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE instance_id = ?");
        let row = sqlx::query(&sql)
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("read_instance", e))?;
        row.as_ref().map(|r| Self::row_to_record("read_instance", r)).transpose()
    }

    async fn write_instance(&self, record: &InstanceRecord, expected_version: u64) -> Result<(), ProviderError> {
        let blocking = Self::encode_blocking_points("write_instance", record)?;
        let result = sqlx::query(
            r#"
            UPDATE instances
            SET status = ?1, blocking_points = ?2, state = ?3, version = ?4, runnable_at = ?5,
                updated_at = ?6, definition_version = ?7, claimed_by = NULL, claimed_until = NULL
            WHERE instance_id = ?8 AND version = ?9
            "#,
        )
        .bind(record.status.as_str())
        .bind(blocking)
        .bind(record.state.as_deref())
        .bind(record.version as i64)
        .bind(record.runnable_at_ms.map(|v| v as i64))
        .bind(record.updated_at_ms as i64)
        .bind(record.definition.version.to_string())
        .bind(record.instance_id.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("write_instance", e))?;

        if result.rows_affected() == 0 {
            return Err(self.classify_miss("write_instance", record.instance_id, expected_version).await);
        }
        Ok(())
    }

    async fn delete_instance(&self, instance_id: InstanceId, expected_version: u64) -> Result<(), ProviderError> {
        let result = sqlx::query("DELETE FROM instances WHERE instance_id = ? AND version = ?")
            .bind(instance_id.to_string())
            .bind(expected_version as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("delete_instance", e))?;
        if result.rows_affected() == 0 {
            return Err(self.classify_miss("delete_instance", instance_id, expected_version).await);
        }
        Ok(())
    }
}
