use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

use super::{TaskPatch, TaskRepository};
use crate::queue::error::QueueError;
use crate::queue::types::{BackgroundTask, TaskStatus};
use crate::web::Pagination;

/// sqlx-backed repository. One row per task; `parameters` and `result` are
/// JSON text blobs, timestamps are RFC 3339 text at fixed microsecond width
/// so lexicographic order matches chronological order.
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub async fn new(database_url: &str) -> Result<Self, QueueError> {
        info!("Initializing SQLite task repository at {}", database_url);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                parameters TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                result TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| QueueError::Persistence(format!("corrupt timestamp '{}': {}", raw, e)))
}

fn row_to_task(row: &SqliteRow) -> Result<BackgroundTask, QueueError> {
    let status: String = row.get("status");
    let status = status
        .parse::<TaskStatus>()
        .map_err(QueueError::Persistence)?;

    let parameters: String = row.get("parameters");
    let result: Option<String> = row.get("result");

    Ok(BackgroundTask {
        task_id: row.get("task_id"),
        task_type: row.get("task_type"),
        parameters: serde_json::from_str(&parameters)?,
        status,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        error_message: row.get("error_message"),
        created_at: parse_ts(row.get("created_at"))?,
        started_at: row
            .get::<Option<String>, _>("started_at")
            .map(|t| parse_ts(&t))
            .transpose()?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .map(|t| parse_ts(&t))
            .transpose()?,
    })
}

/// Writes every mutable column back for one task. Callers hold the
/// transaction; the row is known to exist.
async fn write_back(conn: &mut SqliteConnection, task: &BackgroundTask) -> Result<(), QueueError> {
    sqlx::query(
        r#"
        UPDATE tasks
        SET status = ?,
            retry_count = ?,
            result = ?,
            error_message = ?,
            started_at = ?,
            completed_at = ?
        WHERE task_id = ?
        "#,
    )
    .bind(task.status.as_str())
    .bind(task.retry_count as i64)
    .bind(
        task.result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
    )
    .bind(&task.error_message)
    .bind(task.started_at.as_ref().map(format_ts))
    .bind(task.completed_at.as_ref().map(format_ts))
    .bind(&task.task_id)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn add(&self, task: &BackgroundTask) -> Result<String, QueueError> {
        let insert = sqlx::query(
            r#"
            INSERT INTO tasks
            (task_id, task_type, parameters, status, retry_count, max_retries,
             result, error_message, created_at, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.task_type)
        .bind(serde_json::to_string(&task.parameters)?)
        .bind(task.status.as_str())
        .bind(task.retry_count as i64)
        .bind(task.max_retries as i64)
        .bind(
            task.result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&task.error_message)
        .bind(format_ts(&task.created_at))
        .bind(task.started_at.as_ref().map(format_ts))
        .bind(task.completed_at.as_ref().map(format_ts))
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => Ok(task.task_id.clone()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(QueueError::DuplicateTask(task.task_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_by_id(&self, task_id: &str) -> Result<Option<BackgroundTask>, QueueError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn update(&self, task_id: &str, patch: TaskPatch) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;

        let mut task = row_to_task(&row)?;
        patch.apply(&mut task);
        write_back(&mut *tx, &task).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn transition(
        &self,
        task_id: &str,
        from: &[TaskStatus],
        patch: TaskPatch,
    ) -> Result<bool, QueueError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(false);
        };

        let mut task = row_to_task(&row)?;
        if !from.contains(&task.status) {
            // dropping the transaction rolls it back
            return Ok(false);
        }

        patch.apply(&mut task);
        write_back(&mut *tx, &task).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list(&self, pagination: &Pagination) -> Result<Vec<BackgroundTask>, QueueError> {
        let pagination = pagination.check();
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at ASC LIMIT ? OFFSET ?")
            .bind(pagination.limit() as i64)
            .bind(pagination.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_task).collect()
    }
}
