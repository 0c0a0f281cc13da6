//! Durable job/segment store (SQLite via sqlx).
//!
//! The engine treats this as its persistence port: checkpoints are written
//! through on pause, success and failure (plus throttled progress ticks),
//! and unfinished jobs are reloaded from here at startup for crash
//! recovery. The pool serializes writes; callers get no ordering guarantee
//! across different jobs beyond that.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::job::{Job, Segment};
use crate::status::DownloadStatus;

/// Handle to the SQLite-backed job store. Cheap to clone.
#[derive(Clone)]
pub struct StateDb {
    pool: Pool<Sqlite>,
}

impl StateDb {
    /// Open (or create) the default store under the XDG state directory
    /// (`~/.local/state/rangeload/jobs.db`).
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("rangeload")?;
        let state_dir = xdg_dirs.get_state_home();
        tokio::fs::create_dir_all(&state_dir).await?;
        Self::open_at(state_dir.join("jobs.db")).await
    }

    /// Open (or create) the store at a specific path. Creates parent dirs
    /// if needed; intended for tests and embedders with their own layout.
    pub async fn open_at(path: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("open job store at {}", path.display()))?;

        let db = StateDb { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory store for tests. A single connection, so the database
    /// lives exactly as long as the pool.
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = StateDb { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                key TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                save_path TEXT NOT NULL,
                checksum TEXT,
                supports_ranges INTEGER NOT NULL DEFAULT 0,
                size INTEGER,
                progress INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS segments (
                key TEXT PRIMARY KEY,
                job_key TEXT NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                transferred INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_segments_job ON segments(job_key)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert or replace one job row. Segments are checkpointed separately
    /// via `upsert_segment`.
    pub async fn upsert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (key, url, save_path, checksum, supports_ranges, size,
                 progress, created_at, updated_at, retry_count, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                url = excluded.url,
                save_path = excluded.save_path,
                checksum = excluded.checksum,
                supports_ranges = excluded.supports_ranges,
                size = excluded.size,
                progress = excluded.progress,
                updated_at = excluded.updated_at,
                retry_count = excluded.retry_count,
                status = excluded.status
            "#,
        )
        .bind(&job.key)
        .bind(&job.url)
        .bind(job.save_path.to_string_lossy().to_string())
        .bind(&job.checksum)
        .bind(job.supports_ranges as i64)
        .bind(job.size.map(|s| s as i64))
        .bind(job.progress as i64)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.retry_count as i64)
        .bind(job.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a job and all of its segments.
    pub async fn delete_job(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM segments WHERE job_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_segment(&self, segment: &Segment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO segments (key, job_key, start_offset, end_offset, transferred)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                start_offset = excluded.start_offset,
                end_offset = excluded.end_offset,
                transferred = excluded.transferred
            "#,
        )
        .bind(&segment.key)
        .bind(&segment.job_key)
        .bind(segment.start as i64)
        .bind(segment.end as i64)
        .bind(segment.transferred as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_segment(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM segments WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every job whose status is not `completed`, most recently created
    /// first, with its segments attached. Used for startup recovery.
    pub async fn load_unfinished(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT key, url, save_path, checksum, supports_ranges, size,
                   progress, created_at, updated_at, retry_count, status
            FROM jobs
            WHERE status != 'completed'
            ORDER BY created_at DESC, key DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("key");
            let save_path: String = row.get("save_path");
            let status: String = row.get("status");
            let size: Option<i64> = row.get("size");
            let progress: i64 = row.get("progress");
            let supports_ranges: i64 = row.get("supports_ranges");
            let retry_count: i64 = row.get("retry_count");

            let mut job = Job {
                key: key.clone(),
                url: row.get("url"),
                save_path: PathBuf::from(save_path),
                checksum: row.get("checksum"),
                supports_ranges: supports_ranges != 0,
                size: size.map(|s| s as u64),
                progress: progress as u64,
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
                retry_count: retry_count as u32,
                status: DownloadStatus::from_str(&status),
                segments: HashMap::new(),
            };
            job.segments = self.load_segments(&key).await?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    async fn load_segments(&self, job_key: &str) -> Result<HashMap<String, Segment>> {
        let rows = sqlx::query(
            r#"
            SELECT key, job_key, start_offset, end_offset, transferred
            FROM segments
            WHERE job_key = ?
            "#,
        )
        .bind(job_key)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get("key");
            let start: i64 = row.get("start_offset");
            let end: i64 = row.get("end_offset");
            let transferred: i64 = row.get("transferred");
            out.insert(
                key.clone(),
                Segment {
                    job_key: row.get("job_key"),
                    key,
                    start: start as u64,
                    end: end as u64,
                    transferred: transferred as u64,
                },
            );
        }
        Ok(out)
    }

    /// Release the underlying storage handles. Idempotent.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(key: &str, created_at: i64) -> Job {
        let mut job = Job::builder()
            .key(key)
            .url(format!("http://127.0.0.1/{key}.bin"))
            .save_path(format!("/tmp/{key}.bin"))
            .build()
            .unwrap();
        job.created_at = created_at;
        job.updated_at = created_at;
        job
    }

    #[tokio::test]
    async fn upsert_and_reload_job_with_segments() {
        let db = StateDb::open_memory().await.unwrap();
        let mut job = sample_job("a", 100);
        job.size = Some(1000);
        job.supports_ranges = true;
        job.progress = 40;
        job.status = DownloadStatus::Paused;
        db.upsert_job(&job).await.unwrap();

        let segment = Segment {
            job_key: "a".into(),
            key: "/tmp/a.bin_1".into(),
            start: 0,
            end: 332,
            transferred: 40,
        };
        db.upsert_segment(&segment).await.unwrap();

        let jobs = db.load_unfinished().await.unwrap();
        assert_eq!(jobs.len(), 1);
        let loaded = &jobs[0];
        assert_eq!(loaded.key, "a");
        assert_eq!(loaded.size, Some(1000));
        assert!(loaded.supports_ranges);
        assert_eq!(loaded.progress, 40);
        assert_eq!(loaded.status, DownloadStatus::Paused);
        assert_eq!(loaded.segments.len(), 1);
        assert_eq!(loaded.segments["/tmp/a.bin_1"], segment);
    }

    #[tokio::test]
    async fn completed_jobs_are_not_reloaded() {
        let db = StateDb::open_memory().await.unwrap();
        let mut done = sample_job("done", 1);
        done.status = DownloadStatus::Completed;
        db.upsert_job(&done).await.unwrap();
        let pending = sample_job("pending", 2);
        db.upsert_job(&pending).await.unwrap();

        let jobs = db.load_unfinished().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key, "pending");
    }

    #[tokio::test]
    async fn unfinished_jobs_come_newest_first() {
        let db = StateDb::open_memory().await.unwrap();
        db.upsert_job(&sample_job("old", 10)).await.unwrap();
        db.upsert_job(&sample_job("new", 20)).await.unwrap();

        let jobs = db.load_unfinished().await.unwrap();
        assert_eq!(jobs[0].key, "new");
        assert_eq!(jobs[1].key, "old");
    }

    #[tokio::test]
    async fn upsert_is_replace_on_same_key() {
        let db = StateDb::open_memory().await.unwrap();
        let mut job = sample_job("a", 1);
        db.upsert_job(&job).await.unwrap();
        job.progress = 99;
        job.status = DownloadStatus::Error;
        db.upsert_job(&job).await.unwrap();

        let jobs = db.load_unfinished().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].progress, 99);
        assert_eq!(jobs[0].status, DownloadStatus::Error);
    }

    #[tokio::test]
    async fn delete_job_cascades_to_segments() {
        let db = StateDb::open_memory().await.unwrap();
        let job = sample_job("a", 1);
        db.upsert_job(&job).await.unwrap();
        db.upsert_segment(&Segment {
            job_key: "a".into(),
            key: "/tmp/a.bin_1".into(),
            start: 0,
            end: 9,
            transferred: 0,
        })
        .await
        .unwrap();

        db.delete_job("a").await.unwrap();
        assert!(db.load_unfinished().await.unwrap().is_empty());
        assert!(db.load_segments("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_segment_leaves_siblings() {
        let db = StateDb::open_memory().await.unwrap();
        db.upsert_job(&sample_job("a", 1)).await.unwrap();
        for i in 1..=2 {
            db.upsert_segment(&Segment {
                job_key: "a".into(),
                key: format!("/tmp/a.bin_{i}"),
                start: 0,
                end: 9,
                transferred: 0,
            })
            .await
            .unwrap();
        }

        db.delete_segment("/tmp/a.bin_1").await.unwrap();
        let segments = db.load_segments("a").await.unwrap();
        assert_eq!(segments.len(), 1);
        assert!(segments.contains_key("/tmp/a.bin_2"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let db = StateDb::open_memory().await.unwrap();
        db.close().await;
        db.close().await;
    }
}
