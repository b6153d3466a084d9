//! # Brain Cycle
//!
//! The fast-track per-event pipeline: memory ingest, diagnosis, risk and
//! guard checks, routed generation, contract emission, protocol flow,
//! decision, escalation, and the MVCC state commit. No failure escapes the
//! track: the outer frame converts any unexpected error into a
//! `halt_and_fallback` decision and still marks the event done.

use crate::config::{load_immutable_paths, LlmConfig, SkillRouterPolicy};
use crate::contracts::{
    build_approval, build_dispatch_plan, build_exec_trace, build_plan, build_risk_report,
    contract_to_row, ContractKind, DispatchInputs,
};
use crate::db::{self, mvcc, CommitStatus, Event};
use crate::diagnose::{diagnose, project_state, Diagnosis};
use crate::error::Result;
use crate::governance::{
    assess_risk, check_immutable_guard, emergence_guard, load_approval_override, record_guard_event,
    record_risk_gate,
};
use crate::memory::{hybrid_retrieve, ingest_event_memory, source_trust_score};
use crate::protocol::{make_evidence_pack, make_proposal, make_task};
use crate::routing::{
    apply_route_cooldown_override, choose_provider_group, generate_structured_response,
    infer_task_type, memory_biased_config, observe_route_outcome, update_orchestration_metrics,
    update_work_memory, work_memory_policy, MemoryBias, RouteContext,
};
use crate::scheduler::compute_brain_event_budget;
use crate::state::{Action, RuntimeState};
use crate::util::{clip, clip_line};
use sqlx::SqlitePool;
use std::path::PathBuf;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct BrainOptions {
    pub max_events: i64,
    pub force_deep: bool,
    pub base_dir: PathBuf,
}

impl Default for BrainOptions {
    fn default() -> Self {
        Self {
            max_events: 12,
            force_deep: false,
            base_dir: PathBuf::from("."),
        }
    }
}

/// Choose the track action from the diagnosis, event type, and meta flags.
fn choose_action(diag: &Diagnosis, event_type: &str, force_deep: bool, meta: &serde_json::Value) -> Action {
    let mode = meta
        .get("mode")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_lowercase();
    if diag.halted() {
        return Action::HaltAndFallback;
    }
    if event_type == "dream_request" || mode == "dream" {
        return Action::EscalateDream;
    }
    if force_deep || event_type == "iteration" || event_type == "deep_request" {
        return Action::EscalateDeep;
    }
    if event_type == "health" {
        return Action::Stabilize;
    }
    Action::PlanNext
}

/// Run one brain pass over the pending batch. Returns the handled count.
pub async fn run_single_brain_cycle(
    pool: &SqlitePool,
    state: &mut RuntimeState,
    opts: &BrainOptions,
) -> Result<usize> {
    let llm_cfg = LlmConfig::load(&opts.base_dir.join("llm_config.json"));
    let skill_policy = SkillRouterPolicy::load(&opts.base_dir);
    let immutable_paths = load_immutable_paths(&opts.base_dir);
    state.normalize();

    let effective = compute_brain_event_budget(state, opts.max_events);
    let rows = db::fetch_pending_brain(pool, effective).await?;
    if rows.is_empty() {
        return Ok(0);
    }

    let mut handled = 0;
    for event in rows {
        let event_id = event.id;
        match handle_brain_event(pool, state, opts, &llm_cfg, &skill_policy, &immutable_paths, &event).await {
            Ok(()) => {}
            Err(err) => {
                // The pipeline never aborts the track: record the failure as
                // a halt decision and move on.
                error!("brain event #{} failed: {}", event_id, err);
                let reason = clip(&format!("internal_exception:{err}"), 240).to_string();
                db::insert_decision(
                    pool,
                    event_id,
                    Action::HaltAndFallback,
                    &reason,
                    &reason,
                    &serde_json::json!({"internal_error": true}),
                )
                .await?;
            }
        }
        db::mark_brain_done(pool, event_id).await?;
        if let Some(reason) = emergence_guard(pool).await? {
            db::append_event(
                pool,
                "emergence-guard",
                "guard",
                &reason,
                &serde_json::json!({"event_id": event_id}),
            )
            .await?;
        }
        handled += 1;
    }

    if state.cycle % 40 == 0 {
        db::runtime_gc(pool).await?;
    }
    Ok(handled)
}

async fn handle_brain_event(
    pool: &SqlitePool,
    state: &mut RuntimeState,
    opts: &BrainOptions,
    llm_cfg: &LlmConfig,
    skill_policy: &SkillRouterPolicy,
    immutable_paths: &[String],
    event: &Event,
) -> Result<()> {
    let event_id = event.id;
    let source = event.source.as_str();
    let event_type = event.event_type.as_str();
    let content = event.content.as_str();
    let meta = event.meta();
    let base_version = mvcc::read_version(pool).await?;

    // 1. Memory enrichment and retrieval.
    let memory_stats = ingest_event_memory(pool, event_id, source, content, &meta).await?;
    let retrieved = hybrid_retrieve(pool, content, 8).await?;

    // 2. Diagnose over the projected state.
    let state_10d = project_state(state);
    let diag = diagnose(content, &state_10d);

    // 3-4. Action choice, then risk and guard coercions.
    let mut action = choose_action(&diag, event_type, opts.force_deep, &meta);
    let trust = source_trust_score(pool, source, 0.6).await?;
    let risk = assess_risk(event_id, action, content, source, trust);
    let immutable = check_immutable_guard(content, immutable_paths);
    if immutable.blocked {
        action = Action::HaltAndFallback;
        record_guard_event(
            pool,
            "immutable",
            "high",
            &format!("event#{} blocked paths={:?}", event_id, immutable.hits),
        )
        .await?;
    }
    let requires_approval = risk.requires_approval;
    let approved = !requires_approval || load_approval_override(&opts.base_dir, event_id);
    if requires_approval && !approved {
        action = Action::AwaitApproval;
    }

    // 5. Route selection with memory bias and cooldown override.
    let task_type_hint = infer_task_type(action, risk.risk_level, event_type, content, &diag.diagnosis);
    let (cfg_route, memory_pref_groups) = memory_biased_config(state, llm_cfg, task_type_hint);
    let ctx = RouteContext {
        event_type,
        prompt: content,
        objective: &diag.diagnosis,
    };
    let choice = choose_provider_group(action, risk.risk_level, &cfg_route, &ctx, state);
    let task_type = choice.task_type;
    let (route_group, override_reason) = apply_route_cooldown_override(state, &cfg_route, &choice.group);

    let mut response =
        generate_structured_response(&route_group, content, &diag.diagnosis, &cfg_route, task_type.as_str())
            .await;
    response.route_reason = choice.reason.clone();
    response.route_candidates = choice.candidates.clone();
    response.route_scores = choice.scores.clone();
    response.requested_group = choice.group.clone();
    response.effective_group = route_group.clone();
    if !override_reason.is_empty() {
        response.stability_override = Some(override_reason.clone());
    }
    if !memory_pref_groups.is_empty() {
        response.memory_bias = Some(MemoryBias {
            task_type: task_type_hint.as_str().to_string(),
            preferred_groups: memory_pref_groups.iter().take(6).cloned().collect(),
            strength: work_memory_policy(&cfg_route).strength,
        });
    }

    observe_route_outcome(state, &choice.group, &route_group, &response, &cfg_route);
    let effective_reason = if override_reason.is_empty() {
        choice.reason.clone()
    } else {
        override_reason.clone()
    };
    update_orchestration_metrics(state, task_type, &route_group, &effective_reason, &response);
    update_work_memory(state, task_type, &choice.group, &route_group, &response, &cfg_route);
    db::insert_provider_route(
        pool,
        event_id,
        action,
        &route_group,
        &serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string()),
    )
    .await?;

    // 6. Contracts.
    let plan = build_plan(event_id, content, action, &route_group, &response.summary);
    let (kind, payload) = contract_to_row(ContractKind::Plan, &plan);
    db::insert_contract(pool, event_id, &kind, &payload).await?;

    let risk_report = build_risk_report(event_id, &risk, immutable.blocked);
    let (kind, payload) = contract_to_row(ContractKind::RiskReport, &risk_report);
    db::insert_contract(pool, event_id, &kind, &payload).await?;

    if requires_approval {
        let approval = build_approval(event_id, action, approved);
        let (kind, payload) = contract_to_row(ContractKind::Approval, &approval);
        db::insert_contract(pool, event_id, &kind, &payload).await?;
    }

    let dispatch = build_dispatch_plan(&DispatchInputs {
        event_id,
        state,
        content,
        event_type,
        meta: &meta,
        action,
        task_type,
        route_group: &route_group,
        route: &response,
        diagnosis: &diag,
        risk: &risk,
        requires_approval,
        approved,
        llm_cfg: &cfg_route,
        skill_policy,
    });
    let (kind, payload) = contract_to_row(ContractKind::DispatchPlan, &dispatch);
    db::insert_contract(pool, event_id, &kind, &payload).await?;

    let trace = build_exec_trace(
        event_id,
        &plan.id,
        &risk_report.id,
        action,
        &route_group,
        content,
        &response.summary,
    );
    let (kind, payload) = contract_to_row(ContractKind::ExecTrace, &trace);
    db::insert_contract(pool, event_id, &kind, &payload).await?;

    // 7. Protocol triple.
    let task_priority = if risk.risk_level == crate::governance::RiskLevel::High {
        "high"
    } else {
        "mid"
    };
    let task = make_task(event_id, content, source, task_priority);
    let evidence = make_evidence_pack(&task.task_id, &retrieved.facts, &retrieved.vectors, content, event_id);
    let proposal = make_proposal(
        &task.task_id,
        action,
        &format!("{}; diagnosis={}", response.next_step, diag.diagnosis),
        risk.risk_level.as_str(),
        requires_approval,
        "fallback_to_previous_state + reopen_at_7d",
    );
    db::insert_protocol_flow(pool, event_id, "task", &serde_json::to_string(&task).unwrap_or_default()).await?;
    db::insert_protocol_flow(pool, event_id, "evidence", &serde_json::to_string(&evidence).unwrap_or_default())
        .await?;
    db::insert_protocol_flow(pool, event_id, "proposal", &serde_json::to_string(&proposal).unwrap_or_default())
        .await?;

    // 8. Decision.
    let summary = if action == Action::AwaitApproval {
        "high-risk action pending approval".to_string()
    } else if let Some(advice) = diag.first_advice() {
        clip(advice, 240).to_string()
    } else {
        clip(&diag.diagnosis, 240).to_string()
    };
    let decision_meta = serde_json::json!({
        "diagnosis": &diag,
        "event_meta": &meta,
        "memory_stats": memory_stats,
        "risk": &risk,
        "route": {
            "group": &route_group,
            "provider": &response.provider,
            "model": &response.model,
            "live_api": response.live_api,
            "error": &response.error,
        },
        "dispatch_id": &dispatch.id,
    });
    db::insert_decision(pool, event_id, action, clip(&diag.diagnosis, 240), &summary, &decision_meta).await?;

    // 9. Risk gate and escalation events.
    record_risk_gate(pool, event_id, action, &risk, approved).await?;
    if action == Action::EscalateDeep && approved && event_type != "deep_request" {
        db::append_event(
            pool,
            "brain-loop",
            "deep_request",
            &format!("deep request from event {}: {}", event_id, clip(content, 200)),
            &serde_json::json!({"parent_event_id": event_id}),
        )
        .await?;
    }
    if action == Action::EscalateDream && approved && event_type != "dream_request" {
        db::append_event(
            pool,
            "brain-loop",
            "dream_request",
            &format!("dream request from event {}: {}", event_id, clip(content, 200)),
            &serde_json::json!({"parent_event_id": event_id}),
        )
        .await?;
    }
    if action == Action::AwaitApproval {
        db::append_event(
            pool,
            "risk-gate",
            "risk",
            &format!("approval required for event {}: {}", event_id, clip(content, 180)),
            &serde_json::json!({"parent_event_id": event_id, "risk": &risk}),
        )
        .await?;
    }

    // 10. MVCC commit with one rebase retry.
    let observed_version = mvcc::read_version(pool).await?;
    let (committed, mut new_version) =
        mvcc::cas_advance(pool, base_version, "brain-loop", &format!("event#{event_id}:{action}")).await?;
    let commit_status = if committed {
        CommitStatus::Committed
    } else {
        let (rebase_ok, rebased_version) = mvcc::cas_advance(
            pool,
            observed_version,
            "brain-loop",
            &format!("event#{event_id}:{action}:rebase"),
        )
        .await?;
        new_version = rebased_version;
        if rebase_ok {
            CommitStatus::RebaseCommitted
        } else {
            new_version = mvcc::read_version(pool).await?;
            CommitStatus::DriftUnresolved
        }
    };
    mvcc::record_commit_window(
        pool,
        event_id,
        "brain-loop",
        base_version,
        observed_version,
        commit_status,
        &format!("action={action}"),
    )
    .await?;

    // 11. State deltas.
    state.mvcc_version = new_version;
    state.apply_action(
        event_id,
        action,
        diag.halted(),
        !diag.actionable_advice.is_empty(),
        &diag.diagnosis,
    );

    debug!(
        "brain event #{} {} via {} ({})",
        event_id,
        action,
        route_group,
        clip_line(&summary, 80)
    );
    info!("brain handled event #{} action={}", event_id, action);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnose::{diagnose, project_state};

    fn diag_for(text: &str) -> Diagnosis {
        diagnose(text, &project_state(&RuntimeState::default()))
    }

    #[test]
    fn test_choose_action_priorities() {
        let diag = diag_for("普通输入内容");
        assert_eq!(
            choose_action(&diag, "dream_request", false, &serde_json::json!({})),
            Action::EscalateDream
        );
        assert_eq!(
            choose_action(&diag, "input", false, &serde_json::json!({"mode": "dream"})),
            Action::EscalateDream
        );
        assert_eq!(
            choose_action(&diag, "iteration", false, &serde_json::json!({})),
            Action::EscalateDeep
        );
        assert_eq!(
            choose_action(&diag, "input", true, &serde_json::json!({})),
            Action::EscalateDeep
        );
        assert_eq!(
            choose_action(&diag, "health", false, &serde_json::json!({})),
            Action::Stabilize
        );
        assert_eq!(
            choose_action(&diag, "input", false, &serde_json::json!({})),
            Action::PlanNext
        );
    }

    #[test]
    fn test_choose_action_halt_wins() {
        let diag = diag_for("这里出现无限递归了");
        assert!(diag.halted());
        assert_eq!(
            choose_action(&diag, "dream_request", true, &serde_json::json!({})),
            Action::HaltAndFallback
        );
    }
}
