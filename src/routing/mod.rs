//! # Policy Router
//!
//! Task-type inference, candidate selection, scoreboard scoring, cooldown
//! overrides with fallback substitution, and the work-memory bias that lets
//! learned per-task preferences reshape the candidate list. Provider
//! invocation lives in [`provider`].

pub mod provider;

pub use provider::{
    candidate_urls, estimate_cost_usd, extract_text, generate_structured_response, MemoryBias,
    RouteResponse,
};

use crate::config::LlmConfig;
use crate::governance::RiskLevel;
use crate::state::{normalize_memory_strength, Action, RecentSuccess, RouteStat, RuntimeState};
use crate::util::{clamp, clamp01, clip, now_iso};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Task types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Dream,
    DeepReflection,
    Coding,
    RiskControl,
    ShallowReaction,
    Analysis,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Dream => "dream",
            TaskType::DeepReflection => "deep_reflection",
            TaskType::Coding => "coding",
            TaskType::RiskControl => "risk_control",
            TaskType::ShallowReaction => "shallow_reaction",
            TaskType::Analysis => "analysis",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CODING_SIGNALS: &[&str] = &[
    "code", "patch", "refactor", "bug", "test", "pytest", "traceback", ".py", "函数", "重构",
    "修复", "测试", "代码",
];

/// Deterministic cascade over action, risk, event type, and text.
pub fn infer_task_type(
    action: Action,
    risk_level: RiskLevel,
    event_type: &str,
    prompt: &str,
    objective: &str,
) -> TaskType {
    let evt = event_type.trim().to_lowercase();
    if evt == "dream_request" || action == Action::EscalateDream {
        return TaskType::Dream;
    }
    if evt == "iteration"
        || evt == "deep_request"
        || action == Action::EscalateDeep
        || action == Action::DeepPublish
    {
        return TaskType::DeepReflection;
    }
    let text = format!("{} {}", prompt, objective).to_lowercase();
    if CODING_SIGNALS.iter().any(|signal| text.contains(signal)) {
        return TaskType::Coding;
    }
    if risk_level == RiskLevel::High {
        return TaskType::RiskControl;
    }
    let short_text =
        prompt.trim().chars().count() <= 120 && objective.trim().chars().count() <= 160;
    if short_text && (action == Action::Stabilize || action == Action::PlanNext) {
        return TaskType::ShallowReaction;
    }
    TaskType::Analysis
}

// ============================================================================
// Candidate selection
// ============================================================================

fn base_preference(task_type: TaskType) -> &'static [&'static str] {
    match task_type {
        TaskType::Dream => &["dream_chain", "deep_chain", "medium_chain", "shallow_chain", "fast_chain"],
        TaskType::DeepReflection => &["deep_chain", "medium_chain", "shallow_chain", "fast_chain"],
        TaskType::Coding => &["coder_chain", "deep_chain", "medium_chain", "shallow_chain"],
        TaskType::RiskControl => &["deep_chain", "medium_chain", "shallow_chain", "fast_chain"],
        TaskType::ShallowReaction => &["shallow_chain", "fast_chain", "medium_chain", "deep_chain"],
        TaskType::Analysis => &["medium_chain", "shallow_chain", "deep_chain", "fast_chain"],
    }
}

/// Ordered candidate groups for a task: base ordering filtered by
/// availability, with custom `task_preferences` (or the `*` wildcard)
/// prepended.
pub fn route_candidates_for_task(task_type: TaskType, cfg: &LlmConfig) -> Vec<String> {
    let available: Vec<&String> = cfg.provider_groups.keys().filter(|k| !k.trim().is_empty()).collect();
    if available.is_empty() {
        return vec!["fallback-local".to_string()];
    }

    let prefs = &cfg.routing_policy.task_preferences;
    let custom = prefs
        .get(task_type.as_str())
        .filter(|list| !list.is_empty())
        .or_else(|| prefs.get("*"))
        .cloned()
        .unwrap_or_default();

    let mut preferred: Vec<String> = base_preference(task_type)
        .iter()
        .filter(|g| available.iter().any(|a| a.as_str() == **g))
        .map(|g| g.to_string())
        .collect();
    if !custom.is_empty() {
        let custom_available: Vec<String> = custom
            .into_iter()
            .filter(|g| available.iter().any(|a| a.as_str() == g))
            .collect();
        let rest: Vec<String> = preferred
            .iter()
            .filter(|g| !custom_available.contains(g))
            .cloned()
            .collect();
        preferred = custom_available.into_iter().chain(rest).collect();
    }
    if preferred.is_empty() {
        preferred = ["medium_chain", "shallow_chain", "deep_chain", "fast_chain"]
            .iter()
            .filter(|g| available.iter().any(|a| a.as_str() == **g))
            .map(|g| g.to_string())
            .collect();
    }
    if preferred.is_empty() {
        preferred = available.into_iter().cloned().collect();
    }
    if preferred.is_empty() {
        preferred.push("fallback-local".to_string());
    }
    preferred
}

// ============================================================================
// Scoreboard
// ============================================================================

/// Group score from observed metrics: success rate carries most of the
/// weight, latency and cost normalize against fixed scales, fallback usage
/// penalizes, and barely-sampled groups get an exploration bonus.
pub fn group_score(group: &str, state: &RuntimeState) -> f64 {
    let metrics = state.orchestration.group_metrics.get(group);
    let (total, success, latency_ms, cost_usd, fallback_ratio) = match metrics {
        Some(m) => (
            m.total.max(0),
            m.success.max(0),
            if m.latency_ms_ema > 0.0 { m.latency_ms_ema } else { 1800.0 },
            m.cost_usd_ema.max(0.0),
            clamp01(m.fallback_ratio),
        ),
        None => (0, 0, 1800.0, 0.0, 0.0),
    };
    let success_rate = if total > 0 {
        success as f64 / total as f64
    } else {
        0.5
    };
    let latency_score = 1.0 - (latency_ms / 10_000.0).min(1.0);
    let cost_score = 1.0 - (cost_usd / 0.02).min(1.0);
    let exploration_bonus = if total < 3 { 0.06 } else { 0.0 };
    success_rate * 0.62 + latency_score * 0.24 + cost_score * 0.12 - fallback_ratio * 0.08
        + exploration_bonus
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteChoice {
    pub group: String,
    pub task_type: TaskType,
    pub reason: String,
    pub candidates: Vec<String>,
    pub scores: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default)]
pub struct RouteContext<'a> {
    pub event_type: &'a str,
    pub prompt: &'a str,
    pub objective: &'a str,
}

/// Pick the route group for an action under the current risk level. High risk
/// with `deep_chain` configured always forces `deep_chain`.
pub fn choose_provider_group(
    action: Action,
    risk_level: RiskLevel,
    cfg: &LlmConfig,
    ctx: &RouteContext<'_>,
    state: &RuntimeState,
) -> RouteChoice {
    let task_type = infer_task_type(action, risk_level, ctx.event_type, ctx.prompt, ctx.objective);
    if cfg.provider_groups.is_empty() {
        let mut scores = BTreeMap::new();
        scores.insert("fallback-local".to_string(), 1.0);
        return RouteChoice {
            group: "fallback-local".to_string(),
            task_type,
            reason: "no_provider_groups".to_string(),
            candidates: vec!["fallback-local".to_string()],
            scores,
        };
    }

    let mut candidates = route_candidates_for_task(task_type, cfg);
    let risk_high = risk_level == RiskLevel::High;
    if risk_high && cfg.provider_groups.contains_key("deep_chain") {
        candidates.retain(|g| g != "deep_chain");
        candidates.insert(0, "deep_chain".to_string());
    }

    let scores: BTreeMap<String, f64> = candidates
        .iter()
        .filter(|g| cfg.provider_groups.contains_key(*g))
        .map(|g| (g.clone(), group_score(g, state)))
        .collect();
    if scores.is_empty() {
        let mut fallback_scores = BTreeMap::new();
        fallback_scores.insert("fallback-local".to_string(), 1.0);
        return RouteChoice {
            group: "fallback-local".to_string(),
            task_type,
            reason: "empty_scoreboard".to_string(),
            candidates,
            scores: fallback_scores,
        };
    }

    if risk_high && scores.contains_key("deep_chain") {
        return RouteChoice {
            group: "deep_chain".to_string(),
            task_type,
            reason: "risk_high_force_deep".to_string(),
            candidates,
            scores,
        };
    }

    let best = scores
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(g, _)| g.clone())
        .unwrap_or_else(|| "fallback-local".to_string());
    RouteChoice {
        group: best,
        task_type,
        reason: "task_policy+score".to_string(),
        candidates,
        scores,
    }
}

// ============================================================================
// Work-memory policy and bias
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct WorkMemoryPolicy {
    pub strength: String,
    pub bias_limit: usize,
    pub min_total_for_pref: i64,
    pub min_score_for_pref: f64,
    pub max_pref_groups: usize,
}

/// Parameter table per configured strength.
pub fn work_memory_policy(cfg: &LlmConfig) -> WorkMemoryPolicy {
    match normalize_memory_strength(&cfg.routing_policy.work_memory_strength).as_str() {
        "conservative" => WorkMemoryPolicy {
            strength: "conservative".to_string(),
            bias_limit: 2,
            min_total_for_pref: 4,
            min_score_for_pref: 0.68,
            max_pref_groups: 2,
        },
        "aggressive" => WorkMemoryPolicy {
            strength: "aggressive".to_string(),
            bias_limit: 6,
            min_total_for_pref: 1,
            min_score_for_pref: 0.35,
            max_pref_groups: 6,
        },
        _ => WorkMemoryPolicy {
            strength: "balanced".to_string(),
            bias_limit: 4,
            min_total_for_pref: 2,
            min_score_for_pref: 0.5,
            max_pref_groups: 4,
        },
    }
}

/// Prepend learned per-task preferences into a cloned config's
/// `task_preferences`. Returns the biased config and the merged preference
/// list (empty when no bias applies).
pub fn memory_biased_config(
    state: &RuntimeState,
    cfg: &LlmConfig,
    task_type: TaskType,
) -> (LlmConfig, Vec<String>) {
    let policy = work_memory_policy(cfg);
    let preferred: Vec<String> = state
        .work_memory
        .task_preferences
        .get(task_type.as_str())
        .map(|groups| {
            groups
                .iter()
                .filter(|g| !g.trim().is_empty())
                .take(policy.bias_limit.max(1))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    if preferred.is_empty() {
        return (cfg.clone(), Vec::new());
    }

    let mut biased = cfg.clone();
    let existing = biased
        .routing_policy
        .task_preferences
        .get(task_type.as_str())
        .cloned()
        .unwrap_or_default();
    let mut merged: Vec<String> = Vec::new();
    for group in preferred.into_iter().chain(existing) {
        if !merged.contains(&group) {
            merged.push(group);
        }
    }
    merged.truncate(8);
    biased
        .routing_policy
        .task_preferences
        .insert(task_type.as_str().to_string(), merged.clone());
    (biased, merged)
}

// ============================================================================
// Cooldowns
// ============================================================================

/// Fallback ladder when a group is cooling down.
pub fn fallback_group(cfg: &LlmConfig) -> String {
    for group in ["shallow_chain", "fast_chain", "medium_chain"] {
        if cfg.provider_groups.contains_key(group) {
            return group.to_string();
        }
    }
    "fallback-local".to_string()
}

/// Substitute a cooling-down group with the fallback and flag degraded mode.
/// Returns `(effective_group, override_reason)`; the reason is empty when no
/// override applied.
pub fn apply_route_cooldown_override(
    state: &mut RuntimeState,
    cfg: &LlmConfig,
    route_group: &str,
) -> (String, String) {
    let key = route_group.trim().to_string();
    if key.is_empty() {
        return (fallback_group(cfg), "empty_route_group".to_string());
    }
    let cycle = state.cycle;
    let until = state
        .stability
        .route_cooldown_until
        .get(&key)
        .copied()
        .unwrap_or(0);
    if until > cycle {
        let fallback = fallback_group(cfg);
        let reason = clip(&format!("cooldown:{key}->{fallback}@{until}"), 220).to_string();
        state.stability.mode = "degraded".to_string();
        state.stability.last_route_override = reason.clone();
        state.stability.last_updated = now_iso();
        return (fallback, reason);
    }
    state.stability.last_route_override = String::new();
    (key, String::new())
}

/// Bookkeeping after a routed call: failure streaks, cooldown windows, panic
/// counters, consecutive-fallback tracking, and degraded-mode recovery.
pub fn observe_route_outcome(
    state: &mut RuntimeState,
    requested_group: &str,
    actual_group: &str,
    response: &RouteResponse,
    cfg: &LlmConfig,
) {
    let key = if !requested_group.trim().is_empty() {
        requested_group.to_string()
    } else if !actual_group.trim().is_empty() {
        actual_group.to_string()
    } else {
        "-".to_string()
    };
    let cycle = state.cycle;
    let route_error = response.error.clone().unwrap_or_default();
    // The raw config switch, not the guard-adjusted value: a guarded test run
    // with live routing configured still counts as a live failure.
    let live_enabled = cfg.api_live_enabled;
    let failed = live_enabled && (!response.live_api || !route_error.is_empty());

    let stability = &mut state.stability;
    if failed {
        let streak = stability.route_fail_streak.get(&key).copied().unwrap_or(0) + 1;
        stability.route_fail_streak.insert(key.clone(), streak);
        stability.last_route_error = clip(
            if route_error.is_empty() { "live_route_failed" } else { route_error.as_str() },
            320,
        )
        .to_string();
        if streak >= 3 {
            stability.route_cooldown_until.insert(key.clone(), cycle + 15);
            stability.panic_count += 1;
            stability.mode = "degraded".to_string();
        }
    } else {
        stability.route_fail_streak.insert(key.clone(), 0);
        let successes = stability.route_success_count.get(&key).copied().unwrap_or(0);
        stability.route_success_count.insert(key.clone(), successes + 1);
        stability.last_route_error = String::new();
    }

    if response.provider == "fallback-local" {
        stability.consecutive_fallbacks += 1;
        if stability.consecutive_fallbacks == 3 {
            let existing = stability.route_cooldown_until.get(&key).copied().unwrap_or(0);
            stability
                .route_cooldown_until
                .insert(key.clone(), existing.max(cycle + 12));
            stability.panic_count += 1;
            stability.mode = "degraded".to_string();
        }
    } else {
        stability.consecutive_fallbacks = 0;
    }

    let any_active = stability.route_cooldown_until.values().any(|until| *until > cycle);
    if !any_active && stability.mode == "degraded" && !failed && stability.consecutive_fallbacks <= 1 {
        stability.mode = "normal".to_string();
    }

    stability.last_route_group =
        clip(if actual_group.is_empty() { key.as_str() } else { actual_group }, 120).to_string();
    stability.last_updated = now_iso();
}

// ============================================================================
// Orchestration metrics and work memory updates
// ============================================================================

fn ema(old_value: f64, new_value: f64, alpha: f64) -> f64 {
    if old_value <= 0.0 {
        return new_value;
    }
    let a = clamp(alpha, 0.05, 0.95);
    old_value * (1.0 - a) + new_value * a
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Roll the routed outcome into group/model EMAs and per-task counters.
pub fn update_orchestration_metrics(
    state: &mut RuntimeState,
    task_type: TaskType,
    route_group: &str,
    route_reason: &str,
    response: &RouteResponse,
) {
    let group_key = clip(if route_group.is_empty() { "-" } else { route_group }, 80).to_string();
    let provider = clip(&response.provider, 80).to_string();
    let model = clip(&response.model, 120).to_string();
    let model_key = format!("{provider}:{model}");
    let latency_ms = response.latency_ms.max(0) as f64;
    let cost_usd = response.estimated_cost_usd.max(0.0);
    let success = response.is_success();
    let fallback_used = response.used_fallback();
    let error = response.error.clone().unwrap_or_default();

    let orch = &mut state.orchestration;
    let group = orch.group_metrics.entry(group_key.clone()).or_default();
    group.total += 1;
    if success {
        group.success += 1;
    } else {
        group.fail += 1;
    }
    if fallback_used {
        group.fallback += 1;
    }
    group.success_rate = round4(group.success as f64 / group.total.max(1) as f64);
    group.fallback_ratio = round4(group.fallback as f64 / group.total.max(1) as f64);
    group.latency_ms_ema = (ema(group.latency_ms_ema, latency_ms, 0.3) * 100.0).round() / 100.0;
    group.cost_usd_ema = round6(ema(group.cost_usd_ema, cost_usd, 0.3));
    group.last_provider = provider.clone();
    group.last_model = model.clone();
    group.last_error = clip(&error, 220).to_string();
    group.updated_at = now_iso();

    let model_metrics = orch.model_metrics.entry(model_key).or_default();
    model_metrics.provider = provider.clone();
    model_metrics.model = model.clone();
    model_metrics.total += 1;
    if success {
        model_metrics.success += 1;
    }
    model_metrics.success_rate = round4(model_metrics.success as f64 / model_metrics.total.max(1) as f64);
    model_metrics.latency_ms_ema = (ema(model_metrics.latency_ms_ema, latency_ms, 0.3) * 100.0).round() / 100.0;
    model_metrics.cost_usd_ema = round6(ema(model_metrics.cost_usd_ema, cost_usd, 0.3));
    model_metrics.updated_at = now_iso();

    let task_row = orch
        .task_route_stats
        .entry(task_type.as_str().to_string())
        .or_default();
    *task_row.entry(group_key.clone()).or_insert(0) += 1;

    orch.last_task_type = task_type.as_str().to_string();
    orch.last_route_group = group_key;
    orch.last_route_reason = clip(if route_reason.is_empty() { "-" } else { route_reason }, 220).to_string();
    orch.last_provider = provider;
    orch.last_model = model;
    orch.last_error = clip(&error, 320).to_string();
    orch.last_latency_ms = latency_ms.round() as i64;
    orch.last_cost_usd = round6(cost_usd);
    orch.updated_at = now_iso();
}

/// Fold the routed outcome into work memory: per-task route stats, re-ranked
/// task preferences under the policy thresholds, and the recent-success ring.
pub fn update_work_memory(
    state: &mut RuntimeState,
    task_type: TaskType,
    requested_group: &str,
    actual_group: &str,
    response: &RouteResponse,
    cfg: &LlmConfig,
) {
    let policy = work_memory_policy(cfg);
    let task_key = task_type.as_str().to_string();
    let group_key = clip(
        if !actual_group.trim().is_empty() {
            actual_group
        } else if !requested_group.trim().is_empty() {
            requested_group
        } else {
            "-"
        },
        80,
    )
    .to_string();
    let provider = clip(&response.provider, 80).to_string();
    let model = clip(&response.model, 120).to_string();
    let error = response.error.clone().unwrap_or_default();
    let success = response.is_success();
    let fallback_used = response.used_fallback();

    let wm = &mut state.work_memory;
    wm.strength = policy.strength.clone();
    let row = wm.task_route_stats.entry(task_key.clone()).or_default();
    let stat = row.entry(group_key.clone()).or_insert_with(RouteStat::default);
    stat.total += 1;
    if success {
        stat.success += 1;
    } else {
        stat.fail += 1;
    }
    if fallback_used {
        stat.fallback += 1;
    }
    stat.success_rate = round4(stat.success as f64 / stat.total.max(1) as f64);
    stat.fallback_ratio = round4(stat.fallback as f64 / stat.total.max(1) as f64);
    stat.last_provider = provider.clone();
    stat.last_model = model.clone();
    stat.last_error = clip(&error, 220).to_string();
    stat.last_seen = now_iso();
    let group_total = stat.total;

    // Re-rank this task's groups into preferences.
    let mut ranked: Vec<(String, f64, i64)> = row
        .iter()
        .filter(|(_, m)| m.total > 0)
        .map(|(g, m)| {
            let sr = clamp01(m.success_rate);
            let fr = clamp01(m.fallback_ratio);
            let confidence = (m.total as f64 / 10.0).min(1.0);
            (g.clone(), sr * 0.72 + (1.0 - fr) * 0.18 + confidence * 0.1, m.total)
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.2.cmp(&a.2))
    });
    let mut preferred: Vec<String> = ranked
        .iter()
        .filter(|(_, score, total)| *total >= policy.min_total_for_pref && *score >= policy.min_score_for_pref)
        .take(policy.max_pref_groups.max(1))
        .map(|(g, _, _)| g.clone())
        .collect();
    if preferred.is_empty() && success {
        // First-shot promotion: aggressive memory promotes immediately,
        // balanced waits for a second sample.
        if policy.strength == "aggressive" || (policy.strength == "balanced" && group_total >= 2) {
            preferred = vec![group_key.clone()];
        }
    }
    if !preferred.is_empty() {
        wm.task_preferences.insert(task_key.clone(), preferred);
    }

    if success {
        wm.recent_successes.push(RecentSuccess {
            ts: now_iso(),
            task_type: task_key,
            group: group_key,
            provider,
            model,
            summary: clip(&response.summary, 180).to_string(),
        });
        if wm.recent_successes.len() > 30 {
            let skip = wm.recent_successes.len() - 30;
            wm.recent_successes.drain(..skip);
        }
    }
    wm.updated_at = now_iso();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with_groups(groups: &[&str]) -> LlmConfig {
        let mut cfg = LlmConfig::default();
        for group in groups {
            cfg.provider_groups.insert(group.to_string(), vec![]);
        }
        cfg
    }

    #[test]
    fn test_infer_task_type_cascade() {
        assert_eq!(
            infer_task_type(Action::PlanNext, RiskLevel::Low, "dream_request", "", ""),
            TaskType::Dream
        );
        assert_eq!(
            infer_task_type(Action::EscalateDream, RiskLevel::Low, "input", "", ""),
            TaskType::Dream
        );
        assert_eq!(
            infer_task_type(Action::PlanNext, RiskLevel::Low, "iteration", "", ""),
            TaskType::DeepReflection
        );
        assert_eq!(
            infer_task_type(Action::PlanNext, RiskLevel::Low, "input", "请重构这段代码", ""),
            TaskType::Coding
        );
        assert_eq!(
            infer_task_type(Action::PlanNext, RiskLevel::High, "input", "ordinary words", ""),
            TaskType::RiskControl
        );
        assert_eq!(
            infer_task_type(Action::PlanNext, RiskLevel::Low, "input", "短输入", ""),
            TaskType::ShallowReaction
        );
        let long_text = "x".repeat(200);
        assert_eq!(
            infer_task_type(Action::PlanNext, RiskLevel::Low, "input", &long_text, ""),
            TaskType::Analysis
        );
    }

    #[test]
    fn test_candidates_filtered_by_availability() {
        let cfg = cfg_with_groups(&["deep_chain", "shallow_chain"]);
        let candidates = route_candidates_for_task(TaskType::Dream, &cfg);
        assert_eq!(candidates, vec!["deep_chain".to_string(), "shallow_chain".to_string()]);
    }

    #[test]
    fn test_custom_preferences_prepend() {
        let mut cfg = cfg_with_groups(&["deep_chain", "shallow_chain", "medium_chain"]);
        cfg.routing_policy
            .task_preferences
            .insert("analysis".to_string(), vec!["deep_chain".to_string()]);
        let candidates = route_candidates_for_task(TaskType::Analysis, &cfg);
        assert_eq!(candidates[0], "deep_chain");
        assert!(candidates.contains(&"medium_chain".to_string()));
    }

    #[test]
    fn test_no_groups_falls_back_local() {
        let cfg = LlmConfig::default();
        assert_eq!(
            route_candidates_for_task(TaskType::Analysis, &cfg),
            vec!["fallback-local".to_string()]
        );
    }

    #[test]
    fn test_group_score_exploration_bonus() {
        let state = RuntimeState::default();
        // Unsampled group: 0.5*0.62 + latency/cost defaults + 0.06 bonus.
        let fresh = group_score("deep_chain", &state);
        let mut sampled = RuntimeState::default();
        let metrics = sampled
            .orchestration
            .group_metrics
            .entry("deep_chain".to_string())
            .or_default();
        metrics.total = 10;
        metrics.success = 5;
        metrics.latency_ms_ema = 1800.0;
        let seasoned = group_score("deep_chain", &sampled);
        assert!((fresh - seasoned - 0.06).abs() < 1e-9);
    }

    #[test]
    fn test_risk_high_forces_deep_chain() {
        let cfg = cfg_with_groups(&["deep_chain", "shallow_chain"]);
        let state = RuntimeState::default();
        let ctx = RouteContext {
            event_type: "input",
            prompt: "anything at all",
            objective: "",
        };
        let choice = choose_provider_group(Action::PlanNext, RiskLevel::High, &cfg, &ctx, &state);
        assert_eq!(choice.group, "deep_chain");
        assert_eq!(choice.reason, "risk_high_force_deep");
    }

    #[test]
    fn test_choose_without_groups_reports_reason() {
        let cfg = LlmConfig::default();
        let state = RuntimeState::default();
        let ctx = RouteContext::default();
        let choice = choose_provider_group(Action::PlanNext, RiskLevel::Low, &cfg, &ctx, &state);
        assert_eq!(choice.group, "fallback-local");
        assert_eq!(choice.reason, "no_provider_groups");
    }

    #[test]
    fn test_fallback_ladder_order() {
        assert_eq!(fallback_group(&cfg_with_groups(&["medium_chain", "shallow_chain"])), "shallow_chain");
        assert_eq!(fallback_group(&cfg_with_groups(&["medium_chain", "fast_chain"])), "fast_chain");
        assert_eq!(fallback_group(&cfg_with_groups(&["medium_chain"])), "medium_chain");
        assert_eq!(fallback_group(&LlmConfig::default()), "fallback-local");
    }

    #[test]
    fn test_cooldown_override_substitutes_and_degrades() {
        let cfg = cfg_with_groups(&["deep_chain", "shallow_chain"]);
        let mut state = RuntimeState::default();
        state.cycle = 5;
        state.stability.route_cooldown_until.insert("deep_chain".to_string(), 12);
        let (group, reason) = apply_route_cooldown_override(&mut state, &cfg, "deep_chain");
        assert_eq!(group, "shallow_chain");
        assert!(reason.starts_with("cooldown:deep_chain->shallow_chain"));
        assert_eq!(state.stability.mode, "degraded");
    }

    #[test]
    fn test_cooldown_expired_passes_through() {
        let cfg = cfg_with_groups(&["deep_chain", "shallow_chain"]);
        let mut state = RuntimeState::default();
        state.cycle = 20;
        state.stability.route_cooldown_until.insert("deep_chain".to_string(), 12);
        let (group, reason) = apply_route_cooldown_override(&mut state, &cfg, "deep_chain");
        assert_eq!(group, "deep_chain");
        assert!(reason.is_empty());
    }

    fn fallback_response() -> RouteResponse {
        RouteResponse {
            provider: "fallback-local".to_string(),
            model: "-".to_string(),
            live_api: false,
            ..RouteResponse::default()
        }
    }

    #[test]
    fn test_three_live_failures_trip_cooldown() {
        let mut cfg = cfg_with_groups(&["deep_chain"]);
        cfg.api_live_enabled = true;
        let mut state = RuntimeState::default();
        state.cycle = 2;
        for _ in 0..3 {
            observe_route_outcome(&mut state, "deep_chain", "deep_chain", &fallback_response(), &cfg);
        }
        assert_eq!(
            state.stability.route_cooldown_until.get("deep_chain").copied().unwrap(),
            17
        );
        assert!(state.stability.panic_count >= 1);
        assert_eq!(state.stability.mode, "degraded");
    }

    #[test]
    fn test_three_consecutive_fallbacks_trip_cooldown_without_live() {
        let cfg = cfg_with_groups(&["shallow_chain"]);
        let mut state = RuntimeState::default();
        state.cycle = 4;
        for _ in 0..3 {
            observe_route_outcome(&mut state, "shallow_chain", "shallow_chain", &fallback_response(), &cfg);
        }
        assert_eq!(
            state.stability.route_cooldown_until.get("shallow_chain").copied().unwrap(),
            16
        );
        assert_eq!(state.stability.mode, "degraded");
    }

    #[test]
    fn test_success_resets_streak_and_recovers_mode() {
        let mut cfg = cfg_with_groups(&["deep_chain"]);
        cfg.api_live_enabled = true;
        let mut state = RuntimeState::default();
        state.stability.mode = "degraded".to_string();
        state.stability.route_fail_streak.insert("deep_chain".to_string(), 2);
        let success = RouteResponse {
            provider: "vendor".to_string(),
            model: "glm-4".to_string(),
            live_api: true,
            ..RouteResponse::default()
        };
        observe_route_outcome(&mut state, "deep_chain", "deep_chain", &success, &cfg);
        assert_eq!(state.stability.route_fail_streak.get("deep_chain"), Some(&0));
        assert_eq!(state.stability.mode, "normal");
        assert_eq!(state.stability.consecutive_fallbacks, 0);
    }

    #[test]
    fn test_orchestration_metrics_accumulate() {
        let mut state = RuntimeState::default();
        let response = RouteResponse {
            provider: "vendor".to_string(),
            model: "glm-4".to_string(),
            live_api: true,
            latency_ms: 900,
            estimated_cost_usd: 0.001,
            ..RouteResponse::default()
        };
        update_orchestration_metrics(&mut state, TaskType::Analysis, "medium_chain", "task_policy+score", &response);
        let metrics = state.orchestration.group_metrics.get("medium_chain").unwrap();
        assert_eq!(metrics.total, 1);
        assert_eq!(metrics.success, 1);
        assert_eq!(metrics.latency_ms_ema, 900.0);
        assert_eq!(state.orchestration.last_provider, "vendor");
        assert!(state.orchestration.model_metrics.contains_key("vendor:glm-4"));
        assert_eq!(
            state
                .orchestration
                .task_route_stats
                .get("analysis")
                .and_then(|r| r.get("medium_chain")),
            Some(&1)
        );
    }

    #[test]
    fn test_work_memory_balanced_promotes_on_second_success() {
        let cfg = LlmConfig::default();
        let mut state = RuntimeState::default();
        let success = RouteResponse {
            provider: "vendor".to_string(),
            model: "glm-4".to_string(),
            live_api: true,
            summary: "done".to_string(),
            ..RouteResponse::default()
        };
        update_work_memory(&mut state, TaskType::Coding, "coder_chain", "coder_chain", &success, &cfg);
        // One success under balanced strength is not yet a preference.
        assert!(state.work_memory.task_preferences.get("coding").is_none());
        update_work_memory(&mut state, TaskType::Coding, "coder_chain", "coder_chain", &success, &cfg);
        assert_eq!(
            state.work_memory.task_preferences.get("coding").unwrap(),
            &vec!["coder_chain".to_string()]
        );
        assert_eq!(state.work_memory.recent_successes.len(), 2);
    }

    #[test]
    fn test_work_memory_aggressive_promotes_first_shot() {
        let mut cfg = LlmConfig::default();
        cfg.routing_policy.work_memory_strength = "aggressive".to_string();
        let mut state = RuntimeState::default();
        let success = RouteResponse {
            provider: "vendor".to_string(),
            model: "glm-4".to_string(),
            live_api: true,
            ..RouteResponse::default()
        };
        update_work_memory(&mut state, TaskType::Dream, "dream_chain", "dream_chain", &success, &cfg);
        assert_eq!(
            state.work_memory.task_preferences.get("dream").unwrap(),
            &vec!["dream_chain".to_string()]
        );
    }

    #[test]
    fn test_memory_bias_prepends_learned_groups() {
        let mut cfg = LlmConfig::default();
        cfg.provider_groups.insert("deep_chain".to_string(), vec![]);
        cfg.provider_groups.insert("medium_chain".to_string(), vec![]);
        cfg.routing_policy
            .task_preferences
            .insert("analysis".to_string(), vec!["medium_chain".to_string()]);
        let mut state = RuntimeState::default();
        state
            .work_memory
            .task_preferences
            .insert("analysis".to_string(), vec!["deep_chain".to_string()]);
        let (biased, merged) = memory_biased_config(&state, &cfg, TaskType::Analysis);
        assert_eq!(merged, vec!["deep_chain".to_string(), "medium_chain".to_string()]);
        assert_eq!(
            biased.routing_policy.task_preferences.get("analysis").unwrap(),
            &merged
        );
    }

    #[test]
    fn test_memory_bias_noop_without_preferences() {
        let cfg = LlmConfig::default();
        let state = RuntimeState::default();
        let (_, merged) = memory_biased_config(&state, &cfg, TaskType::Analysis);
        assert!(merged.is_empty());
    }
}
