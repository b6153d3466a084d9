//! Database module
//!
//! SQLite-backed durable storage for the event log, decisions, contracts,
//! protocol flow, governance, memory, and safety tables. One file, WAL mode,
//! inline schema creation at startup.
//!
//! A malformed database file is quarantined (renamed with a `.corrupt_<ts>`
//! suffix together with its `-wal`/`-shm` siblings), the schema is
//! re-initialized once, and the connection retried.

pub mod events;
pub mod mvcc;

pub use events::{
    append_event, fetch_pending_brain, fetch_pending_worker, mark_brain_done, mark_worker_done,
    Event, BRAIN_EVENT_TYPES, WORKER_EVENT_TYPES,
};
pub use mvcc::{cas_advance, read_version, record_commit_window, CommitStatus};

use crate::error::{ResidentError, Result};
use crate::state::Action;
use crate::util::now_iso;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{FromRow, SqlitePool};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

// ============================================================================
// Connection
// ============================================================================

/// Open (or create) the runtime database, apply pragmas, and ensure the
/// schema. On a malformed database the file is quarantined and the schema
/// re-initialized once.
pub async fn connect_runtime_db(path: &Path) -> Result<SqlitePool> {
    match open_pool(path).await {
        Ok(pool) => Ok(pool),
        Err(err) => {
            let message = err.to_string().to_lowercase();
            if !message.contains("malformed") && !message.contains("not a database") {
                return Err(err);
            }
            let quarantined = quarantine_corrupted_db(path);
            warn!(
                "database {} malformed, quarantined to {}",
                path.display(),
                quarantined.display()
            );
            open_pool(path).await
        }
    }
}

async fn open_pool(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    ensure_schema(&pool).await?;
    Ok(pool)
}

/// Rename a corrupted database (with WAL/SHM siblings) out of the way.
fn quarantine_corrupted_db(path: &Path) -> PathBuf {
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "resident".to_string());
    let ext = path
        .extension()
        .map(|s| format!(".{}", s.to_string_lossy()))
        .unwrap_or_default();
    let backup = path.with_file_name(format!("{stem}.corrupt_{ts}{ext}"));
    if std::fs::rename(path, &backup).is_err() {
        return path.to_path_buf();
    }
    for suffix in ["-wal", "-shm"] {
        let sidecar = PathBuf::from(format!("{}{}", path.display(), suffix));
        if sidecar.exists() {
            let _ = std::fs::rename(&sidecar, PathBuf::from(format!("{}{}", backup.display(), suffix)));
        }
    }
    backup
}

// ============================================================================
// Schema
// ============================================================================

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        source TEXT NOT NULL,
        event_type TEXT NOT NULL,
        content TEXT NOT NULL,
        meta_json TEXT NOT NULL DEFAULT '{}',
        brain_done INTEGER NOT NULL DEFAULT 0,
        worker_done INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_brain ON events(brain_done, id)",
    "CREATE INDEX IF NOT EXISTS idx_events_worker ON events(worker_done, event_type, id)",
    "CREATE INDEX IF NOT EXISTS idx_events_source ON events(source, id)",
    r#"
    CREATE TABLE IF NOT EXISTS decisions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id INTEGER NOT NULL,
        ts TEXT NOT NULL,
        action TEXT NOT NULL,
        reason TEXT NOT NULL,
        summary TEXT NOT NULL,
        meta_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_decisions_event ON decisions(event_id)",
    "CREATE INDEX IF NOT EXISTS idx_decisions_ts ON decisions(ts)",
    r#"
    CREATE TABLE IF NOT EXISTS health (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        service TEXT NOT NULL,
        status TEXT NOT NULL,
        detail TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_health_service ON health(service, id)",
    r#"
    CREATE TABLE IF NOT EXISTS protocol_flow (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        event_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        payload_json TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_protocol_event ON protocol_flow(event_id)",
    "CREATE INDEX IF NOT EXISTS idx_protocol_kind ON protocol_flow(kind, id)",
    r#"
    CREATE TABLE IF NOT EXISTS provider_routes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        event_id INTEGER NOT NULL,
        action TEXT NOT NULL,
        provider_group TEXT NOT NULL,
        detail_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_provider_routes_event ON provider_routes(event_id)",
    r#"
    CREATE TABLE IF NOT EXISTS contracts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        event_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        payload_json TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_contracts_event ON contracts(event_id)",
    "CREATE INDEX IF NOT EXISTS idx_contracts_kind ON contracts(kind, id)",
    r#"
    CREATE TABLE IF NOT EXISTS state_versions (
        id INTEGER PRIMARY KEY CHECK(id = 1),
        version INTEGER NOT NULL DEFAULT 0,
        updated_ts TEXT NOT NULL,
        actor TEXT NOT NULL,
        note TEXT NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS commit_windows (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        event_id INTEGER NOT NULL,
        actor TEXT NOT NULL,
        base_version INTEGER NOT NULL,
        observed_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        note TEXT NOT NULL DEFAULT ''
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_commit_windows_event ON commit_windows(event_id)",
    "CREATE INDEX IF NOT EXISTS idx_commit_windows_status ON commit_windows(status, id)",
    r#"
    CREATE TABLE IF NOT EXISTS fact_memory (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        claim_key TEXT NOT NULL UNIQUE,
        claim_text TEXT NOT NULL,
        subject TEXT,
        predicate TEXT,
        object_text TEXT,
        confidence REAL NOT NULL DEFAULT 0.5,
        support_count INTEGER NOT NULL DEFAULT 1,
        conflict_count INTEGER NOT NULL DEFAULT 0,
        source TEXT NOT NULL,
        first_seen_event_id INTEGER NOT NULL DEFAULT 0,
        last_seen_event_id INTEGER NOT NULL DEFAULT 0,
        first_seen_ts TEXT NOT NULL,
        last_seen_ts TEXT NOT NULL,
        tier TEXT NOT NULL DEFAULT 'warm',
        lifecycle_score REAL NOT NULL DEFAULT 0.0,
        meta_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_fact_memory_last_event ON fact_memory(last_seen_event_id)",
    "CREATE INDEX IF NOT EXISTS idx_fact_memory_tier ON fact_memory(tier)",
    r#"
    CREATE TABLE IF NOT EXISTS fact_conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        claim_key TEXT NOT NULL,
        existing_fact_id INTEGER NOT NULL,
        incoming_claim TEXT NOT NULL,
        existing_claim TEXT NOT NULL,
        source TEXT NOT NULL,
        note TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_fact_conflicts_key ON fact_conflicts(claim_key)",
    r#"
    CREATE TABLE IF NOT EXISTS memory_vectors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id INTEGER NOT NULL,
        source TEXT NOT NULL,
        content TEXT NOT NULL,
        vector_json TEXT NOT NULL,
        norm REAL NOT NULL,
        tier TEXT NOT NULL DEFAULT 'short',
        ts TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_memory_vectors_event ON memory_vectors(event_id)",
    "CREATE INDEX IF NOT EXISTS idx_memory_vectors_tier ON memory_vectors(tier)",
    r#"
    CREATE TABLE IF NOT EXISTS source_trust (
        source TEXT PRIMARY KEY,
        trust_score REAL NOT NULL DEFAULT 0.5,
        sample_count INTEGER NOT NULL DEFAULT 0,
        updated_ts TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS causal_edges (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subject TEXT NOT NULL,
        predicate TEXT NOT NULL,
        object_text TEXT NOT NULL,
        weight REAL NOT NULL DEFAULT 0.5,
        source TEXT NOT NULL,
        last_event_id INTEGER NOT NULL DEFAULT 0,
        updated_ts TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_causal_subject ON causal_edges(subject)",
    "CREATE INDEX IF NOT EXISTS idx_causal_last_event ON causal_edges(last_event_id)",
    r#"
    CREATE TABLE IF NOT EXISTS risk_gate (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        event_id INTEGER NOT NULL,
        action TEXT NOT NULL,
        risk_level TEXT NOT NULL,
        requires_approval INTEGER NOT NULL DEFAULT 0,
        approved INTEGER NOT NULL DEFAULT 0,
        reason_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_risk_gate_event ON risk_gate(event_id)",
    r#"
    CREATE TABLE IF NOT EXISTS guard_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        guard_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        detail TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_guard_events_type ON guard_events(guard_type)",
    r#"
    CREATE TABLE IF NOT EXISTS deep_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        event_id INTEGER NOT NULL,
        stage TEXT NOT NULL,
        status TEXT NOT NULL,
        detail_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_deep_runs_event ON deep_runs(event_id)",
    r#"
    CREATE TABLE IF NOT EXISTS canary_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        event_id INTEGER NOT NULL,
        snapshot_path TEXT NOT NULL,
        status TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_canary_event ON canary_snapshots(event_id)",
    r#"
    CREATE TABLE IF NOT EXISTS eval_gates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        event_id INTEGER NOT NULL,
        gate_name TEXT NOT NULL,
        status TEXT NOT NULL,
        blocking INTEGER NOT NULL DEFAULT 1,
        detail_json TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_eval_gates_event ON eval_gates(event_id)",
    "CREATE INDEX IF NOT EXISTS idx_eval_gates_status ON eval_gates(status, id)",
];

/// Create every table and index, then seed the singleton MVCC version row.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    mvcc::ensure_version_row(pool).await?;
    Ok(())
}

// ============================================================================
// Decisions
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Decision {
    pub id: i64,
    pub event_id: i64,
    pub ts: String,
    pub action: String,
    pub reason: String,
    pub summary: String,
    pub meta_json: String,
}

pub async fn insert_decision(
    pool: &SqlitePool,
    event_id: i64,
    action: Action,
    reason: &str,
    summary: &str,
    meta: &serde_json::Value,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO decisions(event_id, ts, action, reason, summary, meta_json)
        VALUES(?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(event_id)
    .bind(now_iso())
    .bind(action.as_str())
    .bind(reason)
    .bind(summary)
    .bind(meta.to_string())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn list_recent_decisions(pool: &SqlitePool, limit: i64) -> Result<Vec<Decision>> {
    let n = limit.clamp(1, 200);
    let rows = sqlx::query_as::<_, Decision>(
        r#"
        SELECT id, event_id, ts, action, reason, summary, meta_json
        FROM decisions
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(n)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Count decisions referencing one event; used by idempotence checks.
pub async fn count_decisions_for_event(pool: &SqlitePool, event_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM decisions WHERE event_id = ?")
        .bind(event_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ============================================================================
// Contracts, protocol flow, provider routes, health
// ============================================================================

pub async fn insert_contract(
    pool: &SqlitePool,
    event_id: i64,
    kind: &str,
    payload_json: &str,
) -> Result<i64> {
    let result =
        sqlx::query("INSERT INTO contracts(ts, event_id, kind, payload_json) VALUES(?1, ?2, ?3, ?4)")
            .bind(now_iso())
            .bind(event_id)
            .bind(kind)
            .bind(payload_json)
            .execute(pool)
            .await?;
    Ok(result.last_insert_rowid())
}

pub async fn insert_protocol_flow(
    pool: &SqlitePool,
    event_id: i64,
    kind: &str,
    payload_json: &str,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO protocol_flow(ts, event_id, kind, payload_json) VALUES(?1, ?2, ?3, ?4)",
    )
    .bind(now_iso())
    .bind(event_id)
    .bind(kind)
    .bind(payload_json)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn insert_provider_route(
    pool: &SqlitePool,
    event_id: i64,
    action: Action,
    provider_group: &str,
    detail_json: &str,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO provider_routes(ts, event_id, action, provider_group, detail_json) VALUES(?1, ?2, ?3, ?4, ?5)",
    )
    .bind(now_iso())
    .bind(event_id)
    .bind(action.as_str())
    .bind(provider_group)
    .bind(detail_json)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn append_health_record(
    pool: &SqlitePool,
    service: &str,
    status: &str,
    detail: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO health(ts, service, status, detail) VALUES(?1, ?2, ?3, ?4)")
        .bind(now_iso())
        .bind(service)
        .bind(status)
        .bind(detail)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Garbage collection
// ============================================================================

/// Per-table retention caps. Invoked every 40 cycles; deletes the oldest rows
/// past the cap.
const GC_THRESHOLDS: &[(&str, i64)] = &[
    ("events", 120_000),
    ("decisions", 120_000),
    ("protocol_flow", 120_000),
    ("provider_routes", 120_000),
    ("memory_vectors", 240_000),
    ("causal_edges", 120_000),
    ("deep_runs", 120_000),
    ("eval_gates", 120_000),
    ("commit_windows", 120_000),
    ("guard_events", 120_000),
    ("contracts", 120_000),
];

pub async fn runtime_gc(pool: &SqlitePool) -> Result<()> {
    for (table, keep) in GC_THRESHOLDS {
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(1) FROM {table}"))
            .fetch_one(pool)
            .await?;
        if total <= *keep {
            continue;
        }
        let drop_count = total - keep;
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE id IN (SELECT id FROM {table} ORDER BY id ASC LIMIT ?)"
        ))
        .bind(drop_count)
        .execute(pool)
        .await?;
        info!("gc: dropped {} oldest rows from {}", drop_count, table);
    }
    Ok(())
}

/// Classify transient lock contention, which the forever loops retry with a
/// back-off instead of treating as fatal.
pub fn is_transient_lock_error(err: &ResidentError) -> bool {
    match err {
        ResidentError::Storage(inner) => {
            let text = inner.to_string().to_lowercase();
            text.contains("locked") || text.contains("busy")
        }
        _ => false,
    }
}
