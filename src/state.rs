//! # Runtime State
//!
//! The mutable singleton state shared by the brain and worker tracks. On disk
//! it is a single JSON document written via temp-file + rename. The nested
//! `stability`, `orchestration`, and `work_memory` blocks are structured
//! records with explicit fields; `normalize()` coerces and clamps every field
//! and is idempotent, so it runs both on load and before each save.

use crate::util::{clamp01, clip, now_iso};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::warn;

// ============================================================================
// Actions
// ============================================================================

/// Every decision the runtime can take, as a tagged variant. State deltas are
/// a pure function of the variant (see [`RuntimeState::apply_action`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    PlanNext,
    Stabilize,
    EscalateDeep,
    EscalateDream,
    HaltAndFallback,
    AwaitApproval,
    DeepPublish,
    Rollback,
    DreamReflect,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::PlanNext => "plan_next",
            Action::Stabilize => "stabilize",
            Action::EscalateDeep => "escalate_deep",
            Action::EscalateDream => "escalate_dream",
            Action::HaltAndFallback => "halt_and_fallback",
            Action::AwaitApproval => "await_approval",
            Action::DeepPublish => "deep_publish",
            Action::Rollback => "rollback",
            Action::DreamReflect => "dream_reflect",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Stability block
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityState {
    /// normal | degraded
    pub mode: String,
    pub panic_count: i64,
    pub degraded_cycles: i64,
    pub requested_brain_events: i64,
    pub effective_brain_events: i64,
    pub requested_worker_events: i64,
    pub effective_worker_events: i64,
    pub last_budget_reason: String,
    pub last_route_group: String,
    pub last_route_override: String,
    pub last_route_error: String,
    pub consecutive_fallbacks: i64,
    /// Consecutive live failures per route group.
    pub route_fail_streak: BTreeMap<String, i64>,
    pub route_success_count: BTreeMap<String, i64>,
    /// Cycle number until which a group is excluded from routing.
    pub route_cooldown_until: BTreeMap<String, i64>,
    pub last_updated: String,
}

impl Default for StabilityState {
    fn default() -> Self {
        Self {
            mode: "normal".to_string(),
            panic_count: 0,
            degraded_cycles: 0,
            requested_brain_events: 12,
            effective_brain_events: 12,
            requested_worker_events: 6,
            effective_worker_events: 6,
            last_budget_reason: "normal".to_string(),
            last_route_group: "-".to_string(),
            last_route_override: String::new(),
            last_route_error: String::new(),
            consecutive_fallbacks: 0,
            route_fail_streak: BTreeMap::new(),
            route_success_count: BTreeMap::new(),
            route_cooldown_until: BTreeMap::new(),
            last_updated: "-".to_string(),
        }
    }
}

impl StabilityState {
    fn normalize(&mut self) {
        let mode = self.mode.trim().to_lowercase();
        self.mode = if mode.is_empty() { "normal".to_string() } else { mode };
        self.panic_count = self.panic_count.max(0);
        self.degraded_cycles = self.degraded_cycles.max(0);
        self.requested_brain_events = self.requested_brain_events.max(1);
        self.effective_brain_events = self
            .effective_brain_events
            .max(1)
            .min(self.requested_brain_events);
        self.requested_worker_events = self.requested_worker_events.max(1);
        self.effective_worker_events = self
            .effective_worker_events
            .max(1)
            .min(self.requested_worker_events);
        self.consecutive_fallbacks = self.consecutive_fallbacks.max(0);
        self.last_budget_reason = clip(&self.last_budget_reason, 320).to_string();
        self.last_route_group = clip(&self.last_route_group, 120).to_string();
        self.last_route_override = clip(&self.last_route_override, 220).to_string();
        self.last_route_error = clip(&self.last_route_error, 320).to_string();
        self.last_updated = clip(&self.last_updated, 40).to_string();
        for map in [
            &mut self.route_fail_streak,
            &mut self.route_success_count,
            &mut self.route_cooldown_until,
        ] {
            map.retain(|key, _| !key.trim().is_empty());
            for value in map.values_mut() {
                *value = (*value).max(0);
            }
        }
    }

    /// Cooldowns still in force at `cycle`.
    pub fn active_cooldowns(&self, cycle: i64) -> BTreeMap<String, i64> {
        self.route_cooldown_until
            .iter()
            .filter(|(_, until)| **until > cycle)
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

// ============================================================================
// Orchestration block
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupMetrics {
    pub total: i64,
    pub success: i64,
    pub fail: i64,
    pub fallback: i64,
    pub success_rate: f64,
    pub fallback_ratio: f64,
    pub latency_ms_ema: f64,
    pub cost_usd_ema: f64,
    pub last_provider: String,
    pub last_model: String,
    pub last_error: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelMetrics {
    pub provider: String,
    pub model: String,
    pub total: i64,
    pub success: i64,
    pub success_rate: f64,
    pub latency_ms_ema: f64,
    pub cost_usd_ema: f64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationState {
    pub last_task_type: String,
    pub last_route_group: String,
    pub last_route_reason: String,
    pub last_provider: String,
    pub last_model: String,
    pub last_error: String,
    pub last_latency_ms: i64,
    pub last_cost_usd: f64,
    pub updated_at: String,
    pub group_metrics: BTreeMap<String, GroupMetrics>,
    /// Keyed by `provider:model`.
    pub model_metrics: BTreeMap<String, ModelMetrics>,
    /// Route-group usage counters per task type.
    pub task_route_stats: BTreeMap<String, BTreeMap<String, i64>>,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        Self {
            last_task_type: "-".to_string(),
            last_route_group: "-".to_string(),
            last_route_reason: "-".to_string(),
            last_provider: "-".to_string(),
            last_model: "-".to_string(),
            last_error: String::new(),
            last_latency_ms: 0,
            last_cost_usd: 0.0,
            updated_at: "-".to_string(),
            group_metrics: BTreeMap::new(),
            model_metrics: BTreeMap::new(),
            task_route_stats: BTreeMap::new(),
        }
    }
}

impl OrchestrationState {
    fn normalize(&mut self) {
        self.last_task_type = clip(&self.last_task_type, 80).to_string();
        self.last_route_group = clip(&self.last_route_group, 80).to_string();
        self.last_route_reason = clip(&self.last_route_reason, 220).to_string();
        self.last_provider = clip(&self.last_provider, 80).to_string();
        self.last_model = clip(&self.last_model, 120).to_string();
        self.last_error = clip(&self.last_error, 320).to_string();
        self.last_latency_ms = self.last_latency_ms.max(0);
        self.last_cost_usd = self.last_cost_usd.max(0.0);
        self.updated_at = clip(&self.updated_at, 40).to_string();
        self.group_metrics.retain(|key, _| !key.trim().is_empty());
        self.model_metrics.retain(|key, _| !key.trim().is_empty());
        for metrics in self.group_metrics.values_mut() {
            metrics.total = metrics.total.max(0);
            metrics.success = metrics.success.max(0);
            metrics.fail = metrics.fail.max(0);
            metrics.fallback = metrics.fallback.max(0);
            metrics.success_rate = clamp01(metrics.success_rate);
            metrics.fallback_ratio = clamp01(metrics.fallback_ratio);
            metrics.latency_ms_ema = metrics.latency_ms_ema.max(0.0);
            metrics.cost_usd_ema = metrics.cost_usd_ema.max(0.0);
        }
        for metrics in self.model_metrics.values_mut() {
            metrics.total = metrics.total.max(0);
            metrics.success = metrics.success.max(0);
            metrics.success_rate = clamp01(metrics.success_rate);
        }
    }
}

// ============================================================================
// Work memory block
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteStat {
    pub total: i64,
    pub success: i64,
    pub fail: i64,
    pub fallback: i64,
    pub success_rate: f64,
    pub fallback_ratio: f64,
    pub last_provider: String,
    pub last_model: String,
    pub last_error: String,
    pub last_seen: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecentSuccess {
    pub ts: String,
    pub task_type: String,
    pub group: String,
    pub provider: String,
    pub model: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkMemoryState {
    /// Per task type, per route group outcome counters.
    pub task_route_stats: BTreeMap<String, BTreeMap<String, RouteStat>>,
    /// Learned per-task group preferences, prepended to routing candidates.
    pub task_preferences: BTreeMap<String, Vec<String>>,
    pub recent_successes: Vec<RecentSuccess>,
    /// conservative | balanced | aggressive
    pub strength: String,
    pub updated_at: String,
}

impl Default for WorkMemoryState {
    fn default() -> Self {
        Self {
            task_route_stats: BTreeMap::new(),
            task_preferences: BTreeMap::new(),
            recent_successes: Vec::new(),
            strength: "balanced".to_string(),
            updated_at: "-".to_string(),
        }
    }
}

impl WorkMemoryState {
    fn normalize(&mut self) {
        self.task_route_stats.retain(|key, row| !key.trim().is_empty() && !row.is_empty());
        for row in self.task_route_stats.values_mut() {
            row.retain(|key, _| !key.trim().is_empty());
            for stat in row.values_mut() {
                stat.total = stat.total.max(0);
                stat.success = stat.success.max(0);
                stat.fail = stat.fail.max(0);
                stat.fallback = stat.fallback.max(0);
                stat.success_rate = clamp01(stat.success_rate);
                stat.fallback_ratio = clamp01(stat.fallback_ratio);
                stat.last_error = clip(&stat.last_error, 220).to_string();
            }
        }
        for groups in self.task_preferences.values_mut() {
            let mut dedup: Vec<String> = Vec::new();
            for group in groups.iter() {
                let trimmed = clip(group.trim(), 80).to_string();
                if !trimmed.is_empty() && !dedup.contains(&trimmed) {
                    dedup.push(trimmed);
                }
            }
            dedup.truncate(6);
            *groups = dedup;
        }
        self.task_preferences.retain(|key, _| !key.trim().is_empty());
        if self.recent_successes.len() > 30 {
            let skip = self.recent_successes.len() - 30;
            self.recent_successes.drain(..skip);
        }
        for item in &mut self.recent_successes {
            item.summary = clip(&item.summary, 180).to_string();
        }
        self.strength = normalize_memory_strength(&self.strength);
        self.updated_at = clip(&self.updated_at, 40).to_string();
    }
}

/// Canonicalize the work-memory strength label, accepting the CJK aliases.
pub fn normalize_memory_strength(value: &str) -> String {
    match value.trim().to_lowercase().as_str() {
        "conservative" | "保守" => "conservative".to_string(),
        "aggressive" | "激进" => "aggressive".to_string(),
        "balanced" | "均衡" => "balanced".to_string(),
        _ => "balanced".to_string(),
    }
}

// ============================================================================
// Runtime state
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeState {
    pub cycle: i64,
    pub energy: f64,
    pub stress: f64,
    pub uncertainty: f64,
    pub integrity: f64,
    pub continuity: f64,
    pub permission_level: i64,
    pub last_event_id: i64,
    pub role_id: String,
    pub last_action: String,
    pub last_reason: String,
    pub mvcc_version: i64,
    pub reward_rep_deep_worker: f64,
    pub reward_rep_dream_worker: f64,
    pub stability: StabilityState,
    pub orchestration: OrchestrationState,
    pub work_memory: WorkMemoryState,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            cycle: 0,
            energy: 0.8,
            stress: 0.2,
            uncertainty: 0.3,
            integrity: 0.85,
            continuity: 0.7,
            permission_level: 1,
            last_event_id: 0,
            role_id: "operator".to_string(),
            last_action: "-".to_string(),
            last_reason: "-".to_string(),
            mvcc_version: 0,
            reward_rep_deep_worker: 50.0,
            reward_rep_dream_worker: 50.0,
            stability: StabilityState::default(),
            orchestration: OrchestrationState::default(),
            work_memory: WorkMemoryState::default(),
        }
    }
}

impl RuntimeState {
    /// Load from disk with default-merge. Missing or corrupt input yields the
    /// default state; this never raises to callers.
    pub fn load(path: &Path) -> Self {
        let mut state = match std::fs::read_to_string(path) {
            Ok(raw) => {
                let raw = raw.trim_start_matches('\u{feff}');
                match serde_json::from_str::<RuntimeState>(raw) {
                    Ok(state) => state,
                    Err(err) => {
                        warn!("state file {} unreadable, using defaults: {}", path.display(), err);
                        RuntimeState::default()
                    }
                }
            }
            Err(_) => RuntimeState::default(),
        };
        state.normalize();
        state
    }

    /// Atomic write via temp file + rename.
    pub fn save(&self, path: &Path) -> crate::error::Result<()> {
        let payload = serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::ResidentError::Validation(e.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &payload)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Coerce and clamp every field. Idempotent; applied on load and before
    /// every save.
    pub fn normalize(&mut self) {
        self.cycle = self.cycle.max(0);
        self.energy = clamp01(self.energy);
        self.stress = clamp01(self.stress);
        self.uncertainty = clamp01(self.uncertainty);
        self.integrity = clamp01(self.integrity);
        self.continuity = clamp01(self.continuity);
        self.last_event_id = self.last_event_id.max(0);
        self.mvcc_version = self.mvcc_version.max(0);
        if self.role_id.trim().is_empty() {
            self.role_id = "operator".to_string();
        }
        self.stability.normalize();
        self.orchestration.normalize();
        self.work_memory.normalize();
    }

    /// Apply the fixed per-action scalar deltas after a brain event commits.
    /// `halted` and `has_actionable` come out of the diagnosis.
    pub fn apply_action(&mut self, event_id: i64, action: Action, halted: bool, has_actionable: bool, reason: &str) {
        let mut energy_delta = -0.03;
        let mut stress_delta = 0.02;
        let mut continuity_delta = 0.01;
        let mut uncertainty_delta = -0.01;
        let mut integrity_delta = 0.005;

        match action {
            Action::EscalateDeep => {
                energy_delta -= 0.03;
                stress_delta += 0.03;
            }
            Action::EscalateDream => {
                energy_delta -= 0.015;
                stress_delta -= 0.01;
                continuity_delta += 0.015;
                uncertainty_delta -= 0.015;
            }
            Action::HaltAndFallback => {
                stress_delta -= 0.05;
                continuity_delta -= 0.02;
                uncertainty_delta += 0.04;
            }
            Action::Stabilize => {
                stress_delta -= 0.04;
                continuity_delta += 0.02;
                uncertainty_delta -= 0.02;
            }
            _ => {}
        }

        if self.stability.mode == "degraded" {
            stress_delta += 0.01;
            continuity_delta -= 0.005;
            uncertainty_delta += 0.01;
        }
        if has_actionable {
            uncertainty_delta -= 0.02;
            continuity_delta += 0.01;
        }
        if halted {
            uncertainty_delta += 0.06;
            integrity_delta -= 0.01;
        }

        self.cycle += 1;
        self.energy = clamp01(self.energy + energy_delta);
        self.stress = clamp01(self.stress + stress_delta);
        self.uncertainty = clamp01(self.uncertainty + uncertainty_delta);
        self.integrity = clamp01(self.integrity + integrity_delta);
        self.continuity = clamp01(self.continuity + continuity_delta);
        self.last_event_id = event_id;
        self.last_action = action.as_str().to_string();
        self.last_reason = clip(reason, 220).to_string();
        self.stability.last_updated = now_iso();
    }
}
