//! # Deep/Dream Worker
//!
//! The slow track. Dream requests are answered with a memory replay routed
//! through the dream chain and never advance the state version. Iteration
//! and deep requests run the full safety chain and publish only when the
//! eval gate passes and the MVCC window is clean; anything else rolls back
//! with artifacts.

use crate::config::LlmConfig;
use crate::contracts::{build_eval_result, build_reward_update, contract_to_row, ContractKind};
use crate::db::{self, mvcc, CommitStatus, Event};
use crate::error::Result;
use crate::governance::RiskLevel;
use crate::routing::{
    apply_route_cooldown_override, choose_provider_group, generate_structured_response,
    infer_task_type, memory_biased_config, observe_route_outcome, update_orchestration_metrics,
    update_work_memory, work_memory_policy, MemoryBias, RouteContext,
};
use crate::safety::{rollback_stage, run_deep_safety_chain, EvalHarness};
use crate::scheduler::compute_worker_event_budget;
use crate::state::{Action, RuntimeState};
use crate::util::clip;
use sqlx::SqlitePool;
use std::path::PathBuf;
use tracing::{error, info};

const DREAM_OBJECTIVE: &str = "Turn dream replay fragments into one concise actionable insight.";

/// Event types woven into a dream replay.
const REPLAY_EVENT_TYPES: &[&str] = &[
    "input",
    "iteration",
    "deep_request",
    "dream_request",
    "web_probe",
    "file_feed",
    "vscode_observer",
    "social",
    "device_capture",
];

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub max_events: i64,
    pub base_dir: PathBuf,
    pub eval: EvalHarness,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_events: 6,
            base_dir: PathBuf::from("."),
            eval: EvalHarness::default(),
        }
    }
}

/// Run one worker pass over the pending batch. Returns the handled count.
pub async fn run_single_worker_cycle(
    pool: &SqlitePool,
    state: &mut RuntimeState,
    opts: &WorkerOptions,
) -> Result<usize> {
    let llm_cfg = LlmConfig::load(&opts.base_dir.join("llm_config.json"));
    state.normalize();

    let effective = compute_worker_event_budget(state, opts.max_events);
    let rows = db::fetch_pending_worker(pool, effective).await?;
    if rows.is_empty() {
        return Ok(0);
    }

    let mut handled = 0;
    for event in rows {
        let event_id = event.id;
        let outcome = if event.event_type == "dream_request" {
            handle_dream_event(pool, state, &llm_cfg, &event).await
        } else {
            handle_deep_event(pool, state, opts, &event).await
        };
        if let Err(err) = outcome {
            error!("worker event #{} failed: {}", event_id, err);
            let reason = clip(&format!("internal_exception:{err}"), 240).to_string();
            db::insert_decision(
                pool,
                event_id,
                Action::HaltAndFallback,
                &reason,
                &reason,
                &serde_json::json!({"internal_error": true, "worker": true}),
            )
            .await?;
        }
        db::mark_worker_done(pool, event_id).await?;
        handled += 1;
    }

    if state.cycle % 40 == 0 {
        db::runtime_gc(pool).await?;
    }
    Ok(handled)
}

// ============================================================================
// Dream path
// ============================================================================

/// Weave the most recent non-system events into a replay text. The most
/// frequent source becomes the focus.
pub async fn compose_dream_replay(pool: &SqlitePool, seed: &str, limit: i64) -> Result<String> {
    let n = limit.clamp(3, 20);
    let rows = db::events::recent_events_of_types(pool, REPLAY_EVENT_TYPES, n).await?;
    if rows.is_empty() {
        return Ok(
            "Dream replay: input flow is quiet; keep stable rhythm and wait for higher-value signals."
                .to_string(),
        );
    }

    let mut source_count: std::collections::BTreeMap<String, usize> = std::collections::BTreeMap::new();
    let mut merged: Vec<String> = Vec::new();
    for event in rows.iter().rev() {
        let source = if event.source.is_empty() { "unknown" } else { event.source.as_str() };
        *source_count.entry(source.to_string()).or_insert(0) += 1;
        let content = event.content.replace('\n', " ");
        merged.push(format!("{}/{}:{}", source, event.event_type, clip(content.trim(), 36)));
    }
    let focus_source = source_count
        .iter()
        .max_by_key(|(_, count)| **count)
        .map(|(source, _)| source.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let weave_start = merged.len().saturating_sub(5);
    let weave = merged[weave_start..].join(" | ");
    let seed_text = clip(seed.replace('\n', " ").trim(), 80).to_string();
    let seed_part = if seed_text.is_empty() {
        String::new()
    } else {
        format!(", trigger={seed_text}")
    };
    Ok(format!(
        "Dream replay focus `{focus_source}`{seed_part}. Reordered fragments: {weave}"
    ))
}

async fn handle_dream_event(
    pool: &SqlitePool,
    state: &mut RuntimeState,
    llm_cfg: &LlmConfig,
    event: &Event,
) -> Result<()> {
    let event_id = event.id;
    let base_version = mvcc::read_version(pool).await?;
    let draft = compose_dream_replay(pool, &event.content, 12).await?;

    let task_type = infer_task_type(
        Action::EscalateDream,
        RiskLevel::Mid,
        &event.event_type,
        &draft,
        "dream replay",
    );
    let (cfg_route, memory_pref_groups) = memory_biased_config(state, llm_cfg, task_type);
    let ctx = RouteContext {
        event_type: &event.event_type,
        prompt: &draft,
        objective: DREAM_OBJECTIVE,
    };
    let choice = choose_provider_group(Action::EscalateDream, RiskLevel::Mid, &cfg_route, &ctx, state);
    let (route_group, override_reason) = apply_route_cooldown_override(state, &cfg_route, &choice.group);

    let mut response =
        generate_structured_response(&route_group, &draft, DREAM_OBJECTIVE, &cfg_route, task_type.as_str()).await;
    response.route_reason = clip(&choice.reason, 220).to_string();
    response.route_candidates = choice.candidates.clone();
    response.route_scores = choice.scores.clone();
    response.requested_group = choice.group.clone();
    response.effective_group = route_group.clone();
    if !override_reason.is_empty() {
        response.stability_override = Some(override_reason.clone());
    }
    if !memory_pref_groups.is_empty() {
        response.memory_bias = Some(MemoryBias {
            task_type: task_type.as_str().to_string(),
            preferred_groups: memory_pref_groups.iter().take(6).cloned().collect(),
            strength: work_memory_policy(&cfg_route).strength,
        });
    }

    observe_route_outcome(state, &choice.group, &route_group, &response, &cfg_route);
    let effective_reason = if override_reason.is_empty() { choice.reason.clone() } else { override_reason };
    update_orchestration_metrics(state, task_type, &route_group, &effective_reason, &response);
    update_work_memory(state, task_type, &choice.group, &route_group, &response, &cfg_route);

    let dream_text = if response.summary.trim().is_empty() {
        draft.clone()
    } else {
        response.summary.trim().to_string()
    };
    db::append_event(
        pool,
        "deep-worker",
        "dream",
        &dream_text,
        &serde_json::json!({
            "parent_event_id": event_id,
            "seed": clip(&event.content, 200),
            "provider": &response.provider,
            "model": &response.model,
            "live_api": response.live_api,
        }),
    )
    .await?;
    db::append_event(
        pool,
        "deep-worker",
        "dream_release",
        &format!("dream replay published for event#{event_id}"),
        &serde_json::json!({"parent_event_id": event_id, "mode": "dream"}),
    )
    .await?;
    // Dream replay is memory work only; the state version never advances.
    mvcc::record_commit_window(
        pool,
        event_id,
        "deep-worker",
        base_version,
        base_version,
        CommitStatus::DreamNoCommit,
        "memory replay only",
    )
    .await?;
    db::insert_decision(
        pool,
        event_id,
        Action::DreamReflect,
        "worker dream replay generated",
        clip(&dream_text, 220),
        &serde_json::json!({"worker": "dream", "parent_event_id": event_id, "mode": "dream"}),
    )
    .await?;

    let score = if response.live_api { 0.78 } else { 0.64 };
    let eval = build_eval_result(
        event_id,
        "dream_replay",
        score,
        true,
        false,
        vec![
            format!("provider={}", response.provider),
            format!("model={}", response.model),
        ],
    );
    let (kind, payload) = contract_to_row(ContractKind::EvalResult, &eval);
    db::insert_contract(pool, event_id, &kind, &payload).await?;

    let rep_before = state.reward_rep_dream_worker;
    let delta = if response.live_api { 0.35 } else { 0.10 };
    state.reward_rep_dream_worker = rep_before + delta;
    let reward = build_reward_update(
        event_id,
        "dream-worker",
        rep_before,
        delta,
        vec![
            "dream_reflect".to_string(),
            if response.live_api { "api_live" } else { "fallback" }.to_string(),
        ],
    );
    let (kind, payload) = contract_to_row(ContractKind::RewardUpdate, &reward);
    db::insert_contract(pool, event_id, &kind, &payload).await?;

    info!("worker dream replay for event #{}", event_id);
    Ok(())
}

// ============================================================================
// Deep path
// ============================================================================

async fn handle_deep_event(
    pool: &SqlitePool,
    state: &mut RuntimeState,
    opts: &WorkerOptions,
    event: &Event,
) -> Result<()> {
    let event_id = event.id;
    let base_version = mvcc::read_version(pool).await?;
    let patch_plan = format!(
        "apply reversible refinement for event#{}; source={}; type={}; objective={}",
        event_id,
        event.source,
        event.event_type,
        clip(&event.content, 120)
    );

    let mut chain = run_deep_safety_chain(&opts.base_dir, pool, event_id, &patch_plan, &opts.eval).await?;
    let gate_pass = chain.ok
        && chain
            .eval_gate
            .as_ref()
            .map(|gate| gate.publish_allowed)
            .unwrap_or(false);

    let observed_version = mvcc::read_version(pool).await?;
    let mut commit_status = CommitStatus::BlockedEvalGate;
    let mut publish_allowed = false;
    let mut publish_reason = chain
        .eval_gate
        .as_ref()
        .map(|gate| gate.status.clone())
        .unwrap_or_else(|| "failed".to_string());

    if gate_pass {
        if observed_version != base_version {
            commit_status = CommitStatus::DriftRebaseRequired;
            publish_reason = format!("mvcc drift: base={base_version}, observed={observed_version}");
            chain.mvcc_rollback = Some(rollback_stage(&opts.base_dir, event_id, &publish_reason));
        } else {
            let (committed, new_version) = mvcc::cas_advance(
                pool,
                base_version,
                "deep-worker",
                &format!("event#{event_id}:deep_publish"),
            )
            .await?;
            if committed {
                commit_status = CommitStatus::Committed;
                publish_allowed = true;
                publish_reason = format!("published@v{new_version}");
                state.mvcc_version = new_version;
            } else {
                commit_status = CommitStatus::DriftCommitRace;
                publish_reason = "mvcc commit race".to_string();
                chain.mvcc_rollback = Some(rollback_stage(&opts.base_dir, event_id, &publish_reason));
            }
        }
    }

    mvcc::record_commit_window(
        pool,
        event_id,
        "deep-worker",
        base_version,
        observed_version,
        commit_status,
        &publish_reason,
    )
    .await?;

    let chain_ok = chain.ok;
    let proposal = format!(
        "proposal: {} safe plan for `{}`",
        if publish_allowed { "apply" } else { "hold" },
        clip(&event.content, 120)
    );
    let evidence = format!(
        "evidence: source={}, type={}, cycle={}, safety={}, publish={}, status={}",
        event.source,
        event.event_type,
        state.cycle,
        if chain_ok { "ok" } else { "failed" },
        publish_allowed,
        commit_status
    );
    let chain_json = serde_json::to_value(&chain).unwrap_or_else(|_| serde_json::json!({}));

    db::append_event(
        pool,
        "deep-worker",
        "evidence",
        &evidence,
        &serde_json::json!({
            "parent_event_id": event_id,
            "safety_chain": &chain_json,
            "commit_window": {
                "base_version": base_version,
                "observed_version": observed_version,
                "status": commit_status.as_str(),
            },
        }),
    )
    .await?;
    if publish_allowed {
        db::append_event(
            pool,
            "deep-worker",
            "proposal",
            &proposal,
            &serde_json::json!({"parent_event_id": event_id, "safety_chain": &chain_json}),
        )
        .await?;
        db::append_event(
            pool,
            "deep-worker",
            "deep_release",
            &format!("deep release published for event#{event_id}"),
            &serde_json::json!({"parent_event_id": event_id, "commit_status": commit_status.as_str()}),
        )
        .await?;
    } else {
        db::append_event(
            pool,
            "deep-worker",
            "guard",
            &format!("deep publish blocked for event#{event_id}: {publish_reason}"),
            &serde_json::json!({
                "parent_event_id": event_id,
                "commit_status": commit_status.as_str(),
                "eval_gate": &chain.eval_gate,
            }),
        )
        .await?;
    }
    db::append_event(
        pool,
        "deep-worker",
        "trace",
        &format!(
            "deep safety chain event#{}: {}",
            event_id,
            clip(&chain_json.to_string(), 600)
        ),
        &serde_json::json!({"parent_event_id": event_id}),
    )
    .await?;

    let action = if publish_allowed { Action::DeepPublish } else { Action::Rollback };
    let summary = if publish_allowed {
        clip(&proposal, 220).to_string()
    } else {
        clip(&format!("blocked: {publish_reason}"), 220).to_string()
    };
    db::insert_decision(
        pool,
        event_id,
        action,
        "worker gate+mvcc checked",
        &summary,
        &serde_json::json!({
            "worker": "deep",
            "parent_event_id": event_id,
            "safety_chain": &chain_json,
            "eval_gate": &chain.eval_gate,
            "commit_window": {
                "base_version": base_version,
                "observed_version": observed_version,
                "status": commit_status.as_str(),
            },
        }),
    )
    .await?;

    let eval_score = if publish_allowed {
        0.92
    } else if chain_ok {
        0.66
    } else {
        0.3
    };
    let gate_status = chain
        .eval_gate
        .as_ref()
        .map(|gate| gate.status.clone())
        .unwrap_or_else(|| "failed".to_string());
    let eval = build_eval_result(
        event_id,
        "deep_eval_harness",
        eval_score,
        publish_allowed,
        !chain_ok,
        vec![gate_status, clip(&publish_reason, 180).to_string()],
    );
    let (kind, payload) = contract_to_row(ContractKind::EvalResult, &eval);
    db::insert_contract(pool, event_id, &kind, &payload).await?;

    let rep_before = state.reward_rep_deep_worker;
    let delta = if publish_allowed { 0.45 } else { -0.25 };
    state.reward_rep_deep_worker = rep_before + delta;
    let reward = build_reward_update(
        event_id,
        "deep-worker",
        rep_before,
        delta,
        vec![
            commit_status.as_str().to_string(),
            if publish_allowed { "publish_allowed" } else { "publish_blocked" }.to_string(),
        ],
    );
    let (kind, payload) = contract_to_row(ContractKind::RewardUpdate, &reward);
    db::insert_contract(pool, event_id, &kind, &payload).await?;

    info!(
        "worker deep event #{} {} ({})",
        event_id,
        action,
        commit_status
    );
    Ok(())
}
