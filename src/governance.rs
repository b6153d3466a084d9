//! # Governance
//!
//! Risk scoring over a fixed keyword blocklist plus source trust, the
//! immutable-path guard, file-based approval overrides, and the emergence
//! (repeated-action loop) guard.

use crate::error::Result;
use crate::state::Action;
use crate::util::{clip, now_iso};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::path::Path;

/// Keywords that raise the risk score by 0.35 each.
pub const HIGH_RISK_KEYWORDS: &[&str] = &[
    "delete",
    "drop table",
    "rm -rf",
    "format",
    "shutdown",
    "override policy",
    "destructive",
    "生产",
    "删除",
    "覆盖",
    "重置",
];

// ============================================================================
// Risk assessment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Mid,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Mid => "mid",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskAssessment {
    pub event_id: i64,
    pub risk_level: RiskLevel,
    pub requires_approval: bool,
    pub reasons: Vec<String>,
}

/// Score the event text: keyword hits +0.35 each, low source trust +0.20,
/// untrusted input surfaces +0.10. `high >= 0.55`, `mid >= 0.25`, else low.
/// High risk always requires approval.
pub fn assess_risk(
    event_id: i64,
    action: Action,
    content: &str,
    source: &str,
    source_trust: f64,
) -> RiskAssessment {
    let text = format!("{} {}", action.as_str(), content).to_lowercase();
    let mut reasons = Vec::new();
    let mut score = 0.0;

    for keyword in HIGH_RISK_KEYWORDS {
        if text.contains(keyword) {
            score += 0.35;
            reasons.push(format!("keyword:{keyword}"));
        }
    }
    if source_trust < 0.45 {
        score += 0.20;
        reasons.push("low_source_trust".to_string());
    }
    let source_low = source.to_lowercase();
    if ["web", "social", "device"].iter().any(|p| source_low.starts_with(p)) {
        score += 0.10;
        reasons.push("untrusted_input_surface".to_string());
    }

    let risk_level = if score >= 0.55 {
        RiskLevel::High
    } else if score >= 0.25 {
        RiskLevel::Mid
    } else {
        RiskLevel::Low
    };
    RiskAssessment {
        event_id,
        risk_level,
        requires_approval: risk_level == RiskLevel::High,
        reasons,
    }
}

// ============================================================================
// Immutable path guard
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ImmutableGuard {
    pub blocked: bool,
    pub hits: Vec<String>,
}

/// Case-insensitive substring match of protected paths in the content. A hit
/// later coerces the action to `halt_and_fallback`.
pub fn check_immutable_guard(content: &str, immutable_paths: &[String]) -> ImmutableGuard {
    let text = content.to_lowercase();
    let hits: Vec<String> = immutable_paths
        .iter()
        .filter(|path| !path.trim().is_empty() && text.contains(&path.to_lowercase()))
        .cloned()
        .collect();
    ImmutableGuard {
        blocked: !hits.is_empty(),
        hits,
    }
}

// ============================================================================
// Approval overrides
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApprovalsFile {
    approved_event_ids: Vec<serde_json::Value>,
}

/// True when the event id is listed in `resident_output/approvals.json`.
pub fn load_approval_override(base_dir: &Path, event_id: i64) -> bool {
    let path = base_dir.join("resident_output").join("approvals.json");
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return false;
    };
    let raw = raw.trim_start_matches('\u{feff}');
    let Ok(file) = serde_json::from_str::<ApprovalsFile>(raw) else {
        return false;
    };
    file.approved_event_ids.iter().any(|value| match value {
        serde_json::Value::Number(n) => n.as_i64() == Some(event_id),
        serde_json::Value::String(s) => s.parse::<i64>().ok() == Some(event_id),
        _ => false,
    })
}

// ============================================================================
// Recording
// ============================================================================

pub async fn record_risk_gate(
    pool: &SqlitePool,
    event_id: i64,
    action: Action,
    risk: &RiskAssessment,
    approved: bool,
) -> Result<i64> {
    let reason_json = serde_json::json!({ "reasons": risk.reasons }).to_string();
    let result = sqlx::query(
        r#"
        INSERT INTO risk_gate(ts, event_id, action, risk_level, requires_approval, approved, reason_json)
        VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(now_iso())
    .bind(event_id)
    .bind(action.as_str())
    .bind(risk.risk_level.as_str())
    .bind(risk.requires_approval)
    .bind(approved)
    .bind(reason_json)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn record_guard_event(
    pool: &SqlitePool,
    guard_type: &str,
    severity: &str,
    detail: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO guard_events(ts, guard_type, severity, detail) VALUES(?1, ?2, ?3, ?4)")
        .bind(now_iso())
        .bind(guard_type)
        .bind(severity)
        .bind(clip(detail, 1000))
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Emergence guard
// ============================================================================

/// Scan the last 6 decisions; if the most recent action repeats 5 or more
/// times, record a warn-level guard event and return the alert reason. Fewer
/// than 4 decisions never alerts.
pub async fn emergence_guard(pool: &SqlitePool) -> Result<Option<String>> {
    let actions: Vec<(String,)> =
        sqlx::query_as("SELECT action FROM decisions ORDER BY id DESC LIMIT 6")
            .fetch_all(pool)
            .await?;
    if actions.len() < 4 {
        return Ok(None);
    }
    let top = actions[0].0.clone();
    let repeat = actions.iter().filter(|(a,)| *a == top).count();
    if repeat >= 5 {
        let reason = format!("repeated_action_loop:{top}");
        record_guard_event(pool, "emergence", "warn", &reason).await?;
        return Ok(Some(reason));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{connect_runtime_db, insert_decision};

    #[test]
    fn test_risk_low_for_benign_trusted_input() {
        let risk = assess_risk(1, Action::PlanNext, "整理一下今天的工作计划", "manual", 0.8);
        assert_eq!(risk.risk_level, RiskLevel::Low);
        assert!(!risk.requires_approval);
        assert!(risk.reasons.is_empty());
    }

    #[test]
    fn test_risk_keywords_accumulate_to_high() {
        let risk = assess_risk(1, Action::PlanNext, "please delete and drop table users", "manual", 0.8);
        assert_eq!(risk.risk_level, RiskLevel::High);
        assert!(risk.requires_approval);
        assert!(risk.reasons.iter().any(|r| r == "keyword:delete"));
        assert!(risk.reasons.iter().any(|r| r == "keyword:drop table"));
    }

    #[test]
    fn test_risk_untrusted_surface_and_low_trust_reach_mid() {
        // 0.20 (trust) + 0.10 (surface) = 0.30 -> mid
        let risk = assess_risk(1, Action::PlanNext, "ordinary text", "web_probe", 0.3);
        assert_eq!(risk.risk_level, RiskLevel::Mid);
        assert!(!risk.requires_approval);
    }

    #[test]
    fn test_cjk_keywords_trigger() {
        let risk = assess_risk(1, Action::PlanNext, "把生产数据删除重置一遍", "manual", 0.8);
        assert_eq!(risk.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_immutable_guard_substring_match() {
        let paths = vec!["/srv/resident/Cargo.toml".to_string(), "src/safety.rs".to_string()];
        let guard = check_immutable_guard("请修改 SRC/SAFETY.RS 的逻辑", &paths);
        assert!(guard.blocked);
        assert_eq!(guard.hits, vec!["src/safety.rs".to_string()]);

        let clean = check_immutable_guard("改一下 readme 文档", &paths);
        assert!(!clean.blocked);
    }

    #[test]
    fn test_approval_override_reads_event_ids() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("resident_output");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(
            out.join("approvals.json"),
            r#"{"approved_event_ids": [3, "7", null]}"#,
        )
        .unwrap();
        assert!(load_approval_override(dir.path(), 3));
        assert!(load_approval_override(dir.path(), 7));
        assert!(!load_approval_override(dir.path(), 9));
    }

    #[test]
    fn test_approval_override_missing_file_is_false() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!load_approval_override(dir.path(), 1));
    }

    #[tokio::test]
    async fn test_emergence_guard_needs_enough_history() {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect_runtime_db(&dir.path().join("g.db")).await.unwrap();
        for i in 0..3 {
            insert_decision(&pool, i, Action::PlanNext, "r", "s", &serde_json::json!({}))
                .await
                .unwrap();
        }
        assert!(emergence_guard(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_emergence_guard_alerts_on_repeated_action() {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect_runtime_db(&dir.path().join("g.db")).await.unwrap();
        for i in 0..5 {
            insert_decision(&pool, i, Action::Stabilize, "r", "s", &serde_json::json!({}))
                .await
                .unwrap();
        }
        let alert = emergence_guard(&pool).await.unwrap();
        assert_eq!(alert, Some("repeated_action_loop:stabilize".to_string()));

        let guards: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM guard_events WHERE guard_type = 'emergence'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(guards, 1);
    }

    #[tokio::test]
    async fn test_emergence_guard_quiet_on_mixed_actions() {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect_runtime_db(&dir.path().join("g.db")).await.unwrap();
        let actions = [
            Action::PlanNext,
            Action::Stabilize,
            Action::PlanNext,
            Action::EscalateDeep,
            Action::PlanNext,
            Action::PlanNext,
        ];
        for (i, action) in actions.iter().enumerate() {
            insert_decision(&pool, i as i64, *action, "r", "s", &serde_json::json!({}))
                .await
                .unwrap();
        }
        assert!(emergence_guard(&pool).await.unwrap().is_none());
    }
}
