//! MVCC state versioning.
//!
//! A singleton `state_versions` row guards cross-track state commits. The
//! advance is a single conditional UPDATE compared against the expected
//! version; `rows_affected == 1` is the only success signal. Every commit
//! attempt leaves a `commit_windows` audit row.

use crate::error::Result;
use crate::util::{clip, now_iso};
use sqlx::SqlitePool;
use std::fmt;

/// Terminal statuses of a commit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Committed,
    RebaseCommitted,
    DriftUnresolved,
    DriftRebaseRequired,
    DriftCommitRace,
    BlockedEvalGate,
    DreamNoCommit,
}

impl CommitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitStatus::Committed => "committed",
            CommitStatus::RebaseCommitted => "rebase_committed",
            CommitStatus::DriftUnresolved => "drift_unresolved",
            CommitStatus::DriftRebaseRequired => "drift_rebase_required",
            CommitStatus::DriftCommitRace => "drift_commit_race",
            CommitStatus::BlockedEvalGate => "blocked_eval_gate",
            CommitStatus::DreamNoCommit => "dream_no_commit",
        }
    }
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seed the singleton version row if absent.
pub async fn ensure_version_row(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO state_versions(id, version, updated_ts, actor, note)
        VALUES(1, 0, ?1, 'bootstrap', 'init')
        "#,
    )
    .bind(now_iso())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn read_version(pool: &SqlitePool) -> Result<i64> {
    ensure_version_row(pool).await?;
    let version: i64 = sqlx::query_scalar("SELECT version FROM state_versions WHERE id = 1")
        .fetch_one(pool)
        .await?;
    Ok(version)
}

/// Atomic compare-and-swap advance. Returns `(ok, current_version)` where
/// `current_version` is read back after the attempt either way.
pub async fn cas_advance(
    pool: &SqlitePool,
    expected_version: i64,
    actor: &str,
    note: &str,
) -> Result<(bool, i64)> {
    ensure_version_row(pool).await?;
    let result = sqlx::query(
        r#"
        UPDATE state_versions
        SET version = version + 1, updated_ts = ?1, actor = ?2, note = ?3
        WHERE id = 1 AND version = ?4
        "#,
    )
    .bind(now_iso())
    .bind(actor)
    .bind(clip(note, 220))
    .bind(expected_version)
    .execute(pool)
    .await?;
    let current: i64 = sqlx::query_scalar("SELECT version FROM state_versions WHERE id = 1")
        .fetch_one(pool)
        .await?;
    Ok((result.rows_affected() == 1, current))
}

pub async fn record_commit_window(
    pool: &SqlitePool,
    event_id: i64,
    actor: &str,
    base_version: i64,
    observed_version: i64,
    status: CommitStatus,
    note: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO commit_windows(ts, event_id, actor, base_version, observed_version, status, note)
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(now_iso())
    .bind(event_id)
    .bind(actor)
    .bind(base_version)
    .bind(observed_version)
    .bind(status.as_str())
    .bind(clip(note, 500))
    .execute(pool)
    .await?;
    Ok(())
}

/// Latest commit-window status for an event, if any. Test and audit helper.
pub async fn latest_commit_status(pool: &SqlitePool, event_id: i64) -> Result<Option<(String, String)>> {
    let row: Option<(String, String)> = sqlx::query_as(
        "SELECT status, actor FROM commit_windows WHERE event_id = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}
