//! # Safety Chain
//!
//! The staged gate between a worker decision and any externally visible
//! publish: sandbox pattern screen, evaluation harness, canary snapshot, and
//! the rollback stage for failures. Stages run sequentially and the first
//! non-ok result short-circuits to rollback. Every stage leaves a `deep_runs`
//! row; the evaluation stage additionally records a blocking eval-gate row.

use crate::error::Result;
use crate::util::{clip, now_compact, now_iso, now_secs};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Patterns no patch plan may contain.
pub const FORBIDDEN_PATCH_PATTERNS: &[&str] = &[
    "rm -rf",
    "drop table",
    "del /f",
    "format c:",
    "git reset --hard",
];

static PASSED_COUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)\s+passed").unwrap());

// ============================================================================
// Harness configuration
// ============================================================================

/// The pre-registered evaluation suite. Overridable through
/// `RESIDENT_EVAL_COMMAND` (whitespace-split) for deployments whose suite is
/// not the default cargo invocation.
#[derive(Debug, Clone)]
pub struct EvalHarness {
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub enabled: bool,
}

impl Default for EvalHarness {
    fn default() -> Self {
        Self {
            command: vec!["cargo".to_string(), "test".to_string(), "--quiet".to_string()],
            timeout_secs: 120,
            enabled: true,
        }
    }
}

impl EvalHarness {
    pub fn from_env() -> Self {
        let mut harness = EvalHarness::default();
        if let Ok(raw) = std::env::var("RESIDENT_EVAL_COMMAND") {
            let parts: Vec<String> = raw.split_whitespace().map(|s| s.to_string()).collect();
            if !parts.is_empty() {
                harness.command = parts;
            }
        }
        harness
    }
}

// ============================================================================
// Stage results
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: String,
    pub status: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<String>,
}

impl StageResult {
    fn ok(stage: &str, reason: &str) -> Self {
        Self {
            stage: stage.to_string(),
            status: "ok".to_string(),
            reason: reason.to_string(),
            passed_count: None,
            artifact_path: None,
        }
    }

    fn failed(stage: &str, status: &str, reason: &str) -> Self {
        Self {
            stage: stage.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            passed_count: None,
            artifact_path: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalGate {
    pub name: String,
    pub status: String,
    pub publish_allowed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyOutcome {
    pub ok: bool,
    pub stages: Vec<StageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_gate: Option<EvalGate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mvcc_rollback: Option<StageResult>,
}

// ============================================================================
// Chain
// ============================================================================

/// Run sandbox -> eval -> canary for one patch plan. Any non-ok stage routes
/// through the rollback stage and fails the chain.
pub async fn run_deep_safety_chain(
    base_dir: &Path,
    pool: &SqlitePool,
    event_id: i64,
    patch_plan: &str,
    harness: &EvalHarness,
) -> Result<SafetyOutcome> {
    let mut stages = Vec::new();

    let sandbox = sandbox_stage(patch_plan);
    record_stage(pool, event_id, &sandbox).await?;
    let sandbox_ok = sandbox.is_ok();
    let sandbox_reason = sandbox.reason.clone();
    stages.push(sandbox);
    if !sandbox_ok {
        let rollback = rollback_stage(base_dir, event_id, &sandbox_reason);
        record_stage(pool, event_id, &rollback).await?;
        stages.push(rollback);
        return Ok(SafetyOutcome {
            ok: false,
            stages,
            eval_gate: None,
            mvcc_rollback: None,
        });
    }

    let eval = eval_stage(base_dir, harness).await;
    record_stage(pool, event_id, &eval).await?;
    let eval_ok = eval.is_ok();
    let eval_reason = eval.reason.clone();
    record_eval_gate(pool, event_id, "deep_eval_harness", if eval_ok { "passed" } else { "failed" }, true, &eval)
        .await?;
    stages.push(eval);
    if !eval_ok {
        let rollback = rollback_stage(base_dir, event_id, &eval_reason);
        record_stage(pool, event_id, &rollback).await?;
        stages.push(rollback);
        return Ok(SafetyOutcome {
            ok: false,
            stages,
            eval_gate: Some(EvalGate {
                name: "deep_eval_harness".to_string(),
                status: "failed".to_string(),
                publish_allowed: false,
            }),
            mvcc_rollback: None,
        });
    }

    let canary = canary_stage(base_dir, pool, event_id, patch_plan).await?;
    record_stage(pool, event_id, &canary).await?;
    let publish_allowed = canary.is_ok();
    stages.push(canary);

    Ok(SafetyOutcome {
        ok: publish_allowed,
        stages,
        eval_gate: Some(EvalGate {
            name: "deep_eval_harness".to_string(),
            status: "passed".to_string(),
            publish_allowed,
        }),
        mvcc_rollback: None,
    })
}

// ============================================================================
// Stages
// ============================================================================

/// Substring screen against the forbidden pattern list.
pub fn sandbox_stage(patch_plan: &str) -> StageResult {
    let low = patch_plan.to_lowercase();
    for pattern in FORBIDDEN_PATCH_PATTERNS {
        if low.contains(pattern) {
            return StageResult::failed("sandbox", "blocked", &format!("forbidden_pattern:{pattern}"));
        }
    }
    StageResult::ok("sandbox", "passed")
}

/// Run the pre-registered suite under a hard wall clock. Success requires
/// exit 0 and a positive `N passed` count parsed from stdout.
pub async fn eval_stage(base_dir: &Path, harness: &EvalHarness) -> StageResult {
    if !harness.enabled {
        return StageResult::failed("eval", "failed", "eval_required");
    }
    let Some((program, args)) = harness.command.split_first() else {
        return StageResult::failed("eval", "failed", "eval_command_empty");
    };

    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .current_dir(base_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(Duration::from_secs(harness.timeout_secs), command.output()).await {
        Err(_) => return StageResult::failed("eval", "failed", "eval_timeout"),
        Ok(Err(err)) => return StageResult::failed("eval", "failed", &format!("eval_exception:{err}")),
        Ok(Ok(output)) => output,
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("eval harness failed: {}", clip(&stderr, 200));
        return StageResult::failed("eval", "failed", "eval_failed");
    }

    let passed_count = parse_passed_count(&stdout);
    if passed_count <= 0 {
        return StageResult::failed("eval", "failed", "eval_no_passed_tests");
    }
    let mut result = StageResult::ok("eval", "eval_passed");
    result.passed_count = Some(passed_count);
    result
}

/// Extract the highest `N passed` occurrence from harness output. Both the
/// cargo and pytest summary lines match.
pub fn parse_passed_count(stdout: &str) -> i64 {
    PASSED_COUNT
        .captures_iter(stdout)
        .filter_map(|caps| caps[1].parse::<i64>().ok())
        .max()
        .unwrap_or(0)
}

/// Write the canary snapshot artifact and register its row.
pub async fn canary_stage(
    base_dir: &Path,
    pool: &SqlitePool,
    event_id: i64,
    patch_plan: &str,
) -> Result<StageResult> {
    let canary_dir = base_dir.join("resident_output").join("canary");
    std::fs::create_dir_all(&canary_dir)?;
    let path = canary_dir.join(format!("canary_{}_{}.json", event_id, now_compact()));
    let payload = serde_json::json!({
        "event_id": event_id,
        "created_at": now_iso(),
        "patch_plan": clip(patch_plan, 4000),
        "status": "canary_passed",
    });
    std::fs::write(&path, serde_json::to_string_pretty(&payload).unwrap_or_default())?;
    sqlx::query("INSERT INTO canary_snapshots(ts, event_id, snapshot_path, status) VALUES(?1, ?2, ?3, 'ok')")
        .bind(now_iso())
        .bind(event_id)
        .bind(path.display().to_string())
        .execute(pool)
        .await?;
    let mut result = StageResult::ok("canary", "canary_saved");
    result.artifact_path = Some(path.display().to_string());
    Ok(result)
}

/// Record the rollback artifact. The rollback itself always reports ok; the
/// failure it records does not re-fail.
pub fn rollback_stage(base_dir: &Path, event_id: i64, reason: &str) -> StageResult {
    let rollback_dir = base_dir.join("resident_output").join("rollback");
    let path = rollback_dir.join(format!("rollback_{}_{}.log", event_id, now_secs()));
    let write = std::fs::create_dir_all(&rollback_dir)
        .and_then(|_| std::fs::write(&path, format!("{} rollback triggered: {}\n", now_iso(), reason)));
    if let Err(err) = write {
        warn!("rollback log write failed: {}", err);
    }
    let mut result = StageResult::ok("rollback", reason);
    result.artifact_path = Some(path.display().to_string());
    result
}

pub fn rollback_log_path(result: &StageResult) -> Option<PathBuf> {
    result.artifact_path.as_ref().map(PathBuf::from)
}

// ============================================================================
// Recording
// ============================================================================

async fn record_stage(pool: &SqlitePool, event_id: i64, result: &StageResult) -> Result<()> {
    sqlx::query("INSERT INTO deep_runs(ts, event_id, stage, status, detail_json) VALUES(?1, ?2, ?3, ?4, ?5)")
        .bind(now_iso())
        .bind(event_id)
        .bind(&result.stage)
        .bind(&result.status)
        .bind(serde_json::to_string(result).unwrap_or_else(|_| "{}".to_string()))
        .execute(pool)
        .await?;
    Ok(())
}

async fn record_eval_gate(
    pool: &SqlitePool,
    event_id: i64,
    gate_name: &str,
    status: &str,
    blocking: bool,
    detail: &StageResult,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO eval_gates(ts, event_id, gate_name, status, blocking, detail_json) VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(now_iso())
    .bind(event_id)
    .bind(gate_name)
    .bind(status)
    .bind(blocking)
    .bind(serde_json::to_string(detail).unwrap_or_else(|_| "{}".to_string()))
    .execute(pool)
    .await?;
    Ok(())
}
