//! Append-only event log with per-track progress flags.
//!
//! Rows are never updated except for `brain_done` / `worker_done`, each owned
//! exclusively by its track, and never deleted outside GC. Every append is
//! committed before the call returns.

use crate::error::Result;
use crate::util::now_iso;
use sqlx::{FromRow, SqlitePool};

/// Event types the brain track consumes.
pub const BRAIN_EVENT_TYPES: &[&str] = &[
    "input",
    "iteration",
    "deep_request",
    "dream_request",
    "health",
    "web_probe",
    "file_feed",
    "vscode_observer",
    "social",
    "device_capture",
    "manual",
    "shallow",
];

/// Event types the deep/dream worker track consumes.
pub const WORKER_EVENT_TYPES: &[&str] = &["iteration", "deep_request", "dream_request"];

#[derive(Debug, Clone, FromRow)]
pub struct Event {
    pub id: i64,
    pub ts: String,
    pub source: String,
    pub event_type: String,
    pub content: String,
    pub meta_json: String,
    pub brain_done: bool,
    pub worker_done: bool,
}

impl Event {
    /// Parsed meta; malformed JSON degrades to an empty object.
    pub fn meta(&self) -> serde_json::Value {
        serde_json::from_str(&self.meta_json).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// Append a new event; returns its monotonic id (> 0, strictly increasing).
pub async fn append_event(
    pool: &SqlitePool,
    source: &str,
    event_type: &str,
    content: &str,
    meta: &serde_json::Value,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO events(ts, source, event_type, content, meta_json, brain_done, worker_done)
        VALUES(?1, ?2, ?3, ?4, ?5, 0, 0)
        "#,
    )
    .bind(now_iso())
    .bind(source)
    .bind(event_type)
    .bind(content)
    .bind(meta.to_string())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

fn type_placeholders(types: &[&str]) -> String {
    types.iter().map(|t| format!("'{t}'")).collect::<Vec<_>>().join(", ")
}

/// Pending events for the brain track, oldest first.
pub async fn fetch_pending_brain(pool: &SqlitePool, max_events: i64) -> Result<Vec<Event>> {
    let n = max_events.clamp(1, 200);
    let sql = format!(
        r#"
        SELECT id, ts, source, event_type, content, meta_json, brain_done, worker_done
        FROM events
        WHERE brain_done = 0 AND event_type IN ({})
        ORDER BY id ASC
        LIMIT ?
        "#,
        type_placeholders(BRAIN_EVENT_TYPES)
    );
    let rows = sqlx::query_as::<_, Event>(&sql).bind(n).fetch_all(pool).await?;
    Ok(rows)
}

/// Pending events for the worker track, oldest first.
pub async fn fetch_pending_worker(pool: &SqlitePool, max_events: i64) -> Result<Vec<Event>> {
    let n = max_events.clamp(1, 200);
    let sql = format!(
        r#"
        SELECT id, ts, source, event_type, content, meta_json, brain_done, worker_done
        FROM events
        WHERE worker_done = 0 AND event_type IN ({})
        ORDER BY id ASC
        LIMIT ?
        "#,
        type_placeholders(WORKER_EVENT_TYPES)
    );
    let rows = sqlx::query_as::<_, Event>(&sql).bind(n).fetch_all(pool).await?;
    Ok(rows)
}

pub async fn mark_brain_done(pool: &SqlitePool, event_id: i64) -> Result<()> {
    sqlx::query("UPDATE events SET brain_done = 1 WHERE id = ?")
        .bind(event_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_worker_done(pool: &SqlitePool, event_id: i64) -> Result<()> {
    sqlx::query("UPDATE events SET worker_done = 1 WHERE id = ?")
        .bind(event_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Most recent events of the given types, newest first. Used for dream replay
/// composition and event counting.
pub async fn recent_events_of_types(
    pool: &SqlitePool,
    types: &[&str],
    limit: i64,
) -> Result<Vec<Event>> {
    let n = limit.clamp(1, 500);
    let sql = format!(
        r#"
        SELECT id, ts, source, event_type, content, meta_json, brain_done, worker_done
        FROM events
        WHERE event_type IN ({})
        ORDER BY id DESC
        LIMIT ?
        "#,
        type_placeholders(types)
    );
    let rows = sqlx::query_as::<_, Event>(&sql).bind(n).fetch_all(pool).await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_runtime_db;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect_runtime_db(&dir.path().join("events.db")).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_append_returns_increasing_ids() {
        let (_dir, pool) = test_pool().await;
        let a = append_event(&pool, "manual", "input", "first", &serde_json::json!({})).await.unwrap();
        let b = append_event(&pool, "manual", "input", "second", &serde_json::json!({})).await.unwrap();
        assert!(a > 0);
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_brain_filter_excludes_worker_only_types() {
        let (_dir, pool) = test_pool().await;
        append_event(&pool, "manual", "input", "hello", &serde_json::json!({})).await.unwrap();
        append_event(&pool, "deep-worker", "evidence", "not for brain", &serde_json::json!({}))
            .await
            .unwrap();
        append_event(&pool, "panel", "api_bridge", "connector echo", &serde_json::json!({}))
            .await
            .unwrap();
        let pending = fetch_pending_brain(&pool, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type, "input");
    }

    #[tokio::test]
    async fn test_worker_filter_and_done_flags() {
        let (_dir, pool) = test_pool().await;
        let input = append_event(&pool, "manual", "input", "x", &serde_json::json!({})).await.unwrap();
        let iter = append_event(&pool, "manual", "iteration", "y", &serde_json::json!({})).await.unwrap();

        let pending = fetch_pending_worker(&pool, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, iter);

        mark_worker_done(&pool, iter).await.unwrap();
        assert!(fetch_pending_worker(&pool, 10).await.unwrap().is_empty());

        // The brain track still sees both events until it marks them itself.
        let brain_pending = fetch_pending_brain(&pool, 10).await.unwrap();
        assert_eq!(brain_pending.len(), 2);
        mark_brain_done(&pool, input).await.unwrap();
        assert_eq!(fetch_pending_brain(&pool, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_meta_parsing_tolerates_garbage() {
        let (_dir, pool) = test_pool().await;
        sqlx::query("INSERT INTO events(ts, source, event_type, content, meta_json) VALUES('t','s','input','c','{bad')")
            .execute(&pool)
            .await
            .unwrap();
        let pending = fetch_pending_brain(&pool, 10).await.unwrap();
        assert_eq!(pending[0].meta(), serde_json::json!({}));
    }
}
