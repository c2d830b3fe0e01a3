//! Durable training queue.
//!
//! A single SQLite table shared by the chat service (which enqueues and
//! reports) and the worker process (which claims and runs jobs). Every state
//! change is a single statement so that the two processes never observe a
//! half-applied transition.
//!
//! ```text
//! not_started ──dequeue──▶ running ──┬──▶ success
//!                                    └──▶ failed
//! ```
//!
//! `reported` is a separate one-way flag set by [`TrainQueue::poll_completed`].

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::{db, migrate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    NotStarted,
    Running,
    Failed,
    Success,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::NotStarted => "not_started",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Success => "success",
        }
    }

    /// The only state a job may be in immediately before `self`.
    fn predecessor(self) -> Option<JobStatus> {
        match self {
            JobStatus::NotStarted => None,
            JobStatus::Running => Some(JobStatus::NotStarted),
            JobStatus::Failed | JobStatus::Success => Some(JobStatus::Running),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(JobStatus::NotStarted),
            "running" => Ok(JobStatus::Running),
            "failed" => Ok(JobStatus::Failed),
            "success" => Ok(JobStatus::Success),
            other => Err(QueueError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no waiting jobs")]
    Empty,
    #[error("job {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {0} not found")]
    NotFound(i64),
    #[error("unknown job status {0:?} in queue table")]
    UnknownStatus(String),
    #[error("queue database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// One row of the queue table.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: i64,
    pub user: String,
    pub age_days: Option<u32>,
    pub status: JobStatus,
    /// Milliseconds since the Unix epoch.
    pub insert_time: i64,
    pub heartbeat_at: Option<i64>,
    pub reported: bool,
}

impl Job {
    fn from_row(row: &SqliteRow) -> Result<Self, QueueError> {
        let status: String = row.try_get("status")?;
        let age_days: Option<i64> = row.try_get("age_days")?;
        let reported: i64 = row.try_get("reported")?;
        Ok(Self {
            id: row.try_get("id")?,
            user: row.try_get("user")?,
            age_days: age_days.and_then(|d| u32::try_from(d).ok()),
            status: status.parse()?,
            insert_time: row.try_get("insert_time")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            reported: reported != 0,
        })
    }
}

/// A terminal job that has just been flagged as reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedJob {
    pub id: i64,
    pub user: String,
    pub status: JobStatus,
}

const JOB_COLUMNS: &str = "id, user, age_days, status, insert_time, heartbeat_at, reported";

#[derive(Clone)]
pub struct TrainQueue {
    pool: SqlitePool,
}

impl TrainQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database, creating the schema if needed.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::ensure_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Add a `not_started` job for `user` and return its id.
    pub async fn enqueue(&self, user: &str, age_days: Option<u32>) -> Result<i64, QueueError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO train_queue (user, age_days, status, insert_time) \
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(user)
        .bind(age_days.map(i64::from))
        .bind(JobStatus::NotStarted.as_str())
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Claim the oldest waiting job, moving it to `running`.
    ///
    /// The select and the update are one statement, so a job is handed to at
    /// most one caller even with several workers on the same file.
    pub async fn dequeue(&self) -> Result<Job, QueueError> {
        let now = now_ms();
        let sql = format!(
            r#"
            UPDATE train_queue
            SET status = ?, heartbeat_at = ?
            WHERE id = (
                SELECT id FROM train_queue
                WHERE status = ?
                ORDER BY insert_time, id
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(JobStatus::Running.as_str())
            .bind(now)
            .bind(JobStatus::NotStarted.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Job::from_row(&row),
            None => Err(QueueError::Empty),
        }
    }

    /// Move job `id` to `status`, refusing anything but a forward step.
    pub async fn update_status(&self, id: i64, status: JobStatus) -> Result<(), QueueError> {
        if let Some(from) = status.predecessor() {
            let result =
                sqlx::query("UPDATE train_queue SET status = ? WHERE id = ? AND status = ?")
                    .bind(status.as_str())
                    .bind(id)
                    .bind(from.as_str())
                    .execute(&self.pool)
                    .await?;
            if result.rows_affected() == 1 {
                return Ok(());
            }
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM train_queue WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match current {
            None => Err(QueueError::NotFound(id)),
            Some(current) => Err(QueueError::InvalidTransition {
                id,
                from: current.parse()?,
                to: status,
            }),
        }
    }

    /// Record that the worker running job `id` is still alive.
    pub async fn heartbeat(&self, id: i64) -> Result<(), QueueError> {
        sqlx::query("UPDATE train_queue SET heartbeat_at = ? WHERE id = ? AND status = ?")
            .bind(now_ms())
            .bind(id)
            .bind(JobStatus::Running.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fail every `running` job whose last heartbeat is older than `lease`.
    ///
    /// Such jobs belonged to a worker that died mid-run. They are not
    /// retried; the failure is reported like any other.
    pub async fn fail_stale(&self, lease: Duration) -> Result<Vec<Job>, QueueError> {
        let cutoff = now_ms() - i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let sql = format!(
            r#"
            UPDATE train_queue
            SET status = ?
            WHERE status = ? AND COALESCE(heartbeat_at, insert_time) < ?
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(JobStatus::Failed.as_str())
            .bind(JobStatus::Running.as_str())
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Job::from_row).collect()
    }

    /// Flag every finished, unreported job as reported and return them.
    ///
    /// Each job is returned by exactly one call, in insertion order.
    pub async fn poll_completed(&self) -> Result<Vec<CompletedJob>, QueueError> {
        let rows = sqlx::query(
            r#"
            UPDATE train_queue
            SET reported = 1
            WHERE reported = 0 AND status IN (?, ?)
            RETURNING id, user, status
            "#,
        )
        .bind(JobStatus::Success.as_str())
        .bind(JobStatus::Failed.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut completed = rows
            .iter()
            .map(|row| -> Result<CompletedJob, QueueError> {
                let status: String = row.try_get("status")?;
                Ok(CompletedJob {
                    id: row.try_get("id")?,
                    user: row.try_get("user")?,
                    status: status.parse()?,
                })
            })
            .collect::<Result<Vec<_>, QueueError>>()?;
        completed.sort_by_key(|job| job.id);
        Ok(completed)
    }

    /// The `limit` most recently inserted jobs, newest first.
    pub async fn list(&self, limit: i64) -> Result<Vec<Job>, QueueError> {
        let sql = format!(
            "SELECT {} FROM train_queue ORDER BY insert_time DESC, id DESC LIMIT ?",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(Job::from_row).collect()
    }

    pub async fn get(&self, id: i64) -> Result<Job, QueueError> {
        let sql = format!("SELECT {} FROM train_queue WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(QueueError::NotFound(id))?;
        Job::from_row(&row)
    }

    #[cfg(test)]
    pub(crate) async fn set_heartbeat(&self, id: i64, at_ms: i64) -> Result<(), QueueError> {
        sqlx::query("UPDATE train_queue SET heartbeat_at = ? WHERE id = ?")
            .bind(at_ms)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_queue() -> (tempfile::TempDir, TrainQueue) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::minimal();
        config.db.path = dir.path().join("queue.sqlite");
        let queue = TrainQueue::open(&config).await.unwrap();
        (dir, queue)
    }

    #[tokio::test]
    async fn empty_queue_dequeue_is_empty() {
        let (_dir, queue) = open_queue().await;
        assert!(matches!(queue.dequeue().await, Err(QueueError::Empty)));
    }

    #[tokio::test]
    async fn dequeue_in_insertion_order_and_claims() {
        let (_dir, queue) = open_queue().await;
        let a = queue.enqueue("alice", None).await.unwrap();
        let b = queue.enqueue("bob", Some(30)).await.unwrap();

        let first = queue.dequeue().await.unwrap();
        assert_eq!(first.id, a);
        assert_eq!(first.user, "alice");
        assert_eq!(first.status, JobStatus::Running);
        assert!(first.heartbeat_at.is_some());

        let second = queue.dequeue().await.unwrap();
        assert_eq!(second.id, b);
        assert_eq!(second.age_days, Some(30));

        assert!(matches!(queue.dequeue().await, Err(QueueError::Empty)));
    }

    #[tokio::test]
    async fn transitions_are_monotonic() {
        let (_dir, queue) = open_queue().await;
        let id = queue.enqueue("alice", None).await.unwrap();

        // not_started cannot jump straight to success
        let err = queue.update_status(id, JobStatus::Success).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: JobStatus::NotStarted,
                to: JobStatus::Success,
                ..
            }
        ));

        queue.dequeue().await.unwrap();
        queue.update_status(id, JobStatus::Success).await.unwrap();

        let err = queue.update_status(id, JobStatus::Failed).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
        let err = queue.update_status(id, JobStatus::NotStarted).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        assert!(matches!(
            queue.update_status(9999, JobStatus::Running).await,
            Err(QueueError::NotFound(9999))
        ));
    }

    #[tokio::test]
    async fn poll_completed_reports_exactly_once() {
        let (_dir, queue) = open_queue().await;
        let a = queue.enqueue("alice", None).await.unwrap();
        let b = queue.enqueue("bob", None).await.unwrap();
        queue.enqueue("carol", None).await.unwrap();

        queue.dequeue().await.unwrap();
        queue.dequeue().await.unwrap();
        queue.update_status(a, JobStatus::Success).await.unwrap();
        queue.update_status(b, JobStatus::Failed).await.unwrap();

        let completed = queue.poll_completed().await.unwrap();
        assert_eq!(
            completed,
            vec![
                CompletedJob {
                    id: a,
                    user: "alice".to_string(),
                    status: JobStatus::Success
                },
                CompletedJob {
                    id: b,
                    user: "bob".to_string(),
                    status: JobStatus::Failed
                },
            ]
        );

        assert!(queue.poll_completed().await.unwrap().is_empty());
        assert!(queue.get(a).await.unwrap().reported);
        assert!(!queue.get(a + 2).await.unwrap().reported);
    }

    #[tokio::test]
    async fn stale_running_jobs_fail() {
        let (_dir, queue) = open_queue().await;
        let stale = queue.enqueue("alice", None).await.unwrap();
        let live = queue.enqueue("bob", None).await.unwrap();
        queue.dequeue().await.unwrap();
        queue.dequeue().await.unwrap();

        queue
            .set_heartbeat(stale, now_ms() - 2 * 60 * 60 * 1000)
            .await
            .unwrap();
        queue.heartbeat(live).await.unwrap();

        let failed = queue.fail_stale(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, stale);
        assert_eq!(failed[0].status, JobStatus::Failed);

        assert_eq!(queue.get(live).await.unwrap().status, JobStatus::Running);
        let reported = queue.poll_completed().await.unwrap();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].user, "alice");
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let (_dir, queue) = open_queue().await;
        for user in ["a", "b", "c"] {
            queue.enqueue(user, None).await.unwrap();
        }
        let jobs = queue.list(2).await.unwrap();
        let users: Vec<_> = jobs.iter().map(|j| j.user.as_str()).collect();
        assert_eq!(users, vec!["c", "b"]);
    }
}
