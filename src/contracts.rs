//! # Typed Contracts
//!
//! Plan, RiskReport, Approval, DispatchPlan, ExecTrace, EvalResult, and
//! RewardUpdate records. Contracts are immutable JSON payloads with a schema
//! version and a deterministic id `{prefix}-{event_id}-{ms_epoch}`, persisted
//! as `(kind, payload_json)` rows; readers dispatch on the kind.

use crate::config::{LlmConfig, SkillRouterPolicy};
use crate::diagnose::Diagnosis;
use crate::governance::{RiskAssessment, RiskLevel};
use crate::routing::{RouteResponse, TaskType};
use crate::state::{Action, RuntimeState};
use crate::util::{clamp, clip, now_iso, now_ms, sha1_hex16};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SCHEMA_VERSION: &str = "resident.v1";

pub fn make_contract_id(prefix: &str, event_id: i64) -> String {
    format!("{}-{}-{}", prefix, event_id, now_ms())
}

// ============================================================================
// Risk bands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskBand {
    L0,
    L1,
    L2,
    L3,
}

impl RiskBand {
    /// Forbidden actions map straight to L3; otherwise high -> L2, mid -> L1.
    pub fn from_level(level: RiskLevel, forbidden: bool) -> Self {
        if forbidden {
            return RiskBand::L3;
        }
        match level {
            RiskLevel::High => RiskBand::L2,
            RiskLevel::Mid => RiskBand::L1,
            RiskLevel::Low => RiskBand::L0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskBand::L0 => "L0",
            RiskBand::L1 => "L1",
            RiskBand::L2 => "L2",
            RiskBand::L3 => "L3",
        }
    }
}

impl fmt::Display for RiskBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Contract kinds
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractKind {
    Plan,
    RiskReport,
    Approval,
    DispatchPlan,
    ExecTrace,
    EvalResult,
    RewardUpdate,
}

impl ContractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractKind::Plan => "plan",
            ContractKind::RiskReport => "risk_report",
            ContractKind::Approval => "approval",
            ContractKind::DispatchPlan => "dispatch_plan",
            ContractKind::ExecTrace => "exec_trace",
            ContractKind::EvalResult => "eval_result",
            ContractKind::RewardUpdate => "reward_update",
        }
    }
}

// ============================================================================
// Contract records
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: String,
    pub action: String,
    pub tool: String,
    pub expected_output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub schema_version: String,
    pub id: String,
    pub ts: String,
    pub source: String,
    pub goal: String,
    pub steps: Vec<PlanStep>,
    pub assumptions: Vec<String>,
    pub rollback_plan: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskReport {
    pub schema_version: String,
    pub id: String,
    pub ts: String,
    pub source: String,
    pub risk_level: RiskBand,
    pub reasons: Vec<String>,
    pub required_permission: String,
    pub requires_approval: bool,
    pub forbidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub schema_version: String,
    pub id: String,
    pub ts: String,
    pub source: String,
    pub decision: String,
    pub approver: String,
    pub reason: String,
    pub scope: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallTrace {
    pub tool: String,
    pub args_hash: String,
    pub started_ts: String,
    pub ended_ts: String,
    pub result_digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecTrace {
    pub schema_version: String,
    pub id: String,
    pub ts: String,
    pub source: String,
    pub trace_id: String,
    pub plan_id: String,
    pub risk_report_id: String,
    pub tool_calls: Vec<ToolCallTrace>,
    pub artifacts: Vec<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    pub schema_version: String,
    pub id: String,
    pub ts: String,
    pub source: String,
    pub suite: String,
    pub score: f64,
    #[serde(rename = "pass")]
    pub pass_flag: bool,
    pub regression: bool,
    pub findings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardUpdate {
    pub schema_version: String,
    pub id: String,
    pub ts: String,
    pub source: String,
    pub actor_id: String,
    pub rep_before: f64,
    pub rep_after: f64,
    pub delta: f64,
    pub reason_codes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchItem {
    pub worker: String,
    pub model_group: String,
    pub tool: String,
    pub input: String,
    pub expected_output: String,
    pub timeout_sec: i64,
    pub reversible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPlan {
    pub schema_version: String,
    pub id: String,
    pub ts: String,
    pub source: String,
    pub intent: String,
    pub task_type: String,
    pub risk_level: RiskBand,
    pub dispatch_plan: Vec<DispatchItem>,
    pub recommended_skills: Vec<String>,
    pub success_criteria: Vec<String>,
    pub rollback_plan: String,
    pub confidence: f64,
    pub issue_detected: bool,
    pub issue_reason: String,
    pub hub_prompt: String,
}

/// Serialize a contract into its `(kind, payload_json)` row.
pub fn contract_to_row<T: Serialize>(kind: ContractKind, contract: &T) -> (String, String) {
    (
        kind.as_str().to_string(),
        serde_json::to_string(contract).unwrap_or_else(|_| "{}".to_string()),
    )
}

// ============================================================================
// Plan / risk report / approval / trace builders
// ============================================================================

/// Always two steps: analyze the event, then the chosen action via the route
/// group.
pub fn build_plan(
    event_id: i64,
    content: &str,
    action: Action,
    route_group: &str,
    route_summary: &str,
) -> Plan {
    let goal = if content.trim().is_empty() {
        format!("event#{event_id}")
    } else {
        clip(content, 260).to_string()
    };
    Plan {
        schema_version: SCHEMA_VERSION.to_string(),
        id: make_contract_id("plan", event_id),
        ts: now_iso(),
        source: "brain-loop".to_string(),
        goal,
        steps: vec![
            PlanStep {
                step_id: format!("{event_id}-1"),
                action: "analyze_event".to_string(),
                tool: "diagnose+memory".to_string(),
                expected_output: "diagnosis+risk".to_string(),
            },
            PlanStep {
                step_id: format!("{event_id}-2"),
                action: action.as_str().to_string(),
                tool: format!("provider_group:{route_group}"),
                expected_output: clip(route_summary, 180).to_string(),
            },
        ],
        assumptions: vec![
            "prefer_reversible_changes".to_string(),
            "risk_checked_before_execution".to_string(),
        ],
        rollback_plan: "fallback_to_previous_state + reopen_at_7d".to_string(),
    }
}

pub fn build_risk_report(event_id: i64, risk: &RiskAssessment, forbidden: bool) -> RiskReport {
    RiskReport {
        schema_version: SCHEMA_VERSION.to_string(),
        id: make_contract_id("risk", event_id),
        ts: now_iso(),
        source: "gatekeeper".to_string(),
        risk_level: RiskBand::from_level(risk.risk_level, forbidden),
        reasons: risk.reasons.clone(),
        required_permission: if risk.requires_approval {
            "approval".to_string()
        } else {
            "none".to_string()
        },
        requires_approval: risk.requires_approval,
        forbidden,
    }
}

/// Only emitted when approval is required.
pub fn build_approval(event_id: i64, action: Action, approved: bool) -> Approval {
    Approval {
        schema_version: SCHEMA_VERSION.to_string(),
        id: make_contract_id("approval", event_id),
        ts: now_iso(),
        source: "risk-gate".to_string(),
        decision: if approved { "approve" } else { "reject" }.to_string(),
        approver: if approved { "override" } else { "policy" }.to_string(),
        reason: if approved {
            "override_approved"
        } else {
            "approval_required"
        }
        .to_string(),
        scope: vec![action.as_str().to_string()],
    }
}

pub fn build_exec_trace(
    event_id: i64,
    plan_id: &str,
    risk_report_id: &str,
    action: Action,
    route_group: &str,
    content: &str,
    result_summary: &str,
) -> ExecTrace {
    let now = now_iso();
    let status = match action {
        Action::AwaitApproval | Action::HaltAndFallback => "blocked",
        _ => "success",
    };
    ExecTrace {
        schema_version: SCHEMA_VERSION.to_string(),
        id: make_contract_id("trace", event_id),
        ts: now.clone(),
        source: "brain-loop".to_string(),
        trace_id: make_contract_id("trace-ref", event_id),
        plan_id: plan_id.to_string(),
        risk_report_id: risk_report_id.to_string(),
        tool_calls: vec![ToolCallTrace {
            tool: format!("provider_group:{route_group}"),
            args_hash: sha1_hex16(&format!(
                "{}|{}|{}|{}",
                event_id,
                action.as_str(),
                route_group,
                clip(content, 120)
            )),
            started_ts: now.clone(),
            ended_ts: now,
            result_digest: sha1_hex16(result_summary),
        }],
        artifacts: vec![
            format!("action:{}", action.as_str()),
            format!("provider_group:{route_group}"),
        ],
        status: status.to_string(),
    }
}

pub fn build_eval_result(
    event_id: i64,
    suite: &str,
    score: f64,
    pass_flag: bool,
    regression: bool,
    findings: Vec<String>,
) -> EvalResult {
    EvalResult {
        schema_version: SCHEMA_VERSION.to_string(),
        id: make_contract_id("eval", event_id),
        ts: now_iso(),
        source: "deep-worker".to_string(),
        suite: suite.to_string(),
        score: clamp(score, 0.0, 1.0),
        pass_flag,
        regression,
        findings,
    }
}

pub fn build_reward_update(
    event_id: i64,
    actor_id: &str,
    rep_before: f64,
    delta: f64,
    reason_codes: Vec<String>,
) -> RewardUpdate {
    RewardUpdate {
        schema_version: SCHEMA_VERSION.to_string(),
        id: make_contract_id("reward", event_id),
        ts: now_iso(),
        source: "reward-engine".to_string(),
        actor_id: actor_id.to_string(),
        rep_before,
        rep_after: rep_before + delta,
        delta,
        reason_codes,
    }
}

// ============================================================================
// Issue detection
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct IssueSignal {
    pub issue_detected: bool,
    pub issue_reason: String,
    pub confidence: f64,
}

const SMALLTALK_TOKENS: &[&str] = &["你好", "hi", "hello", "谢谢", "ok", "好的", "收到", "在吗"];

const WORK_TOKENS: &[&str] = &[
    "修复", "重构", "实现", "排查", "分析", "优化", "部署", "编写", "生成", "写一个", "计划",
    "执行", "debug", "bug", "error", "traceback", "fix", "refactor", "implement", "build", "todo",
];

/// Decide whether the event carries an actionable issue. Escalation events
/// and actions always do; small talk never does; otherwise score work-token
/// hits, question marks, trigger flags, and length against the 0.45 bar.
pub fn detect_actionable_issue(
    content: &str,
    event_type: &str,
    meta: &serde_json::Value,
    action: Action,
) -> IssueSignal {
    let text = content.trim().to_lowercase();
    let evt = event_type.trim().to_lowercase();
    if evt == "iteration" || evt == "deep_request" || evt == "dream_request" {
        return IssueSignal {
            issue_detected: true,
            issue_reason: format!("event_type={evt}"),
            confidence: 0.92,
        };
    }
    if matches!(action, Action::EscalateDeep | Action::EscalateDream | Action::AwaitApproval) {
        return IssueSignal {
            issue_detected: true,
            issue_reason: format!("action={}", action.as_str()),
            confidence: 0.88,
        };
    }
    if text.is_empty() {
        return IssueSignal {
            issue_detected: false,
            issue_reason: "empty_input".to_string(),
            confidence: 0.28,
        };
    }
    if text.chars().count() <= 24 && SMALLTALK_TOKENS.iter().any(|t| text.contains(t)) {
        return IssueSignal {
            issue_detected: false,
            issue_reason: "smalltalk".to_string(),
            confidence: 0.33,
        };
    }

    let mut score = 0.0;
    if WORK_TOKENS.iter().any(|t| text.contains(t)) {
        score += 0.55;
    }
    if text.contains('?') || text.contains('？') {
        score += 0.16;
    }
    let trigger = meta.get("trigger_update").and_then(|v| v.as_bool()).unwrap_or(false)
        || meta.get("run_once").and_then(|v| v.as_bool()).unwrap_or(false);
    if trigger {
        score += 0.12;
    }
    if text.chars().count() >= 40 {
        score += 0.08;
    }

    let detected = score >= 0.45;
    IssueSignal {
        issue_detected: detected,
        issue_reason: if detected {
            "explicit_work_signal".to_string()
        } else {
            "insufficient_action_signal".to_string()
        },
        confidence: clamp(0.32 + score, 0.0, 0.96),
    }
}

// ============================================================================
// Dispatch plan
// ============================================================================

/// Dispatch-level task family (contract vocabulary, narrower than routing).
pub fn dispatch_task_type(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::ShallowReaction | TaskType::Analysis => "shallow",
        TaskType::DeepReflection => "deep",
        TaskType::Dream => "dream",
        TaskType::Coding => "coding",
        TaskType::RiskControl => "ops",
    }
}

fn dispatch_worker(task_type: &str, content: &str, event_type: &str, meta: &serde_json::Value) -> &'static str {
    let text = content.to_lowercase();
    let evt = event_type.to_lowercase();
    let connector = meta
        .get("connector_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_lowercase();
    if !connector.is_empty() && connector.contains("mcp") {
        return "mcp";
    }
    if text.contains("mcp") || evt.starts_with("mcp") {
        return "mcp";
    }
    if text.contains("api") || evt == "api_bridge" {
        return "api";
    }
    match task_type {
        "coding" => "coder",
        "deep" | "dream" => "deep",
        _ => "shallow",
    }
}

fn dispatch_model_group(task_type: &str, route_group: &str) -> String {
    if !route_group.trim().is_empty() {
        return route_group.trim().to_string();
    }
    match task_type {
        "coding" => "coder_chain".to_string(),
        "deep" | "dream" => "deep_chain".to_string(),
        _ => "shallow_chain".to_string(),
    }
}

fn dispatch_tool(worker: &str, task_type: &str) -> &'static str {
    match (worker, task_type) {
        ("coder", _) => "deep_coder_worker.run_once",
        ("deep", "dream") => "deep_worker.dream_replay_once",
        ("deep", _) => "deep_worker.run_once",
        ("mcp", _) => "panel_connector.call_mcp_tool",
        ("api", _) => "panel_connector.call_api_connector",
        _ => "brain_loop.run_once",
    }
}

fn dispatch_timeout(worker: &str, task_type: &str) -> i64 {
    match (worker, task_type) {
        ("coder", _) => 240,
        ("deep", "dream") => 120,
        ("deep", _) => 180,
        ("mcp", _) | ("api", _) => 90,
        _ => 45,
    }
}

/// Default creative pack for dream tasks when config supplies none.
const DREAM_SKILL_PACK: &[&str] = &[
    "algorithmic-art",
    "generative-art",
    "canvas-design",
    "theme-factory",
    "artifacts-builder",
    "web-artifacts-builder",
    "slack-gif-creator",
    "imagegen",
    "sora",
    "speech",
    "transcribe",
];

fn task_skill_pack(task_type: &str, cfg: &LlmConfig, policy: &SkillRouterPolicy) -> Vec<String> {
    let packs = &cfg.routing_policy.task_skill_packs;
    let mut items: Vec<String> = packs
        .get(task_type)
        .or_else(|| packs.get("*"))
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    if items.is_empty() && task_type == "dream" {
        items = DREAM_SKILL_PACK.iter().map(|s| s.to_string()).collect();
    }
    let mut dedup: Vec<String> = Vec::new();
    for item in items {
        if !dedup.contains(&item) {
            dedup.push(item);
        }
    }
    dedup.truncate(16);
    policy.filter_skills(dedup)
}

fn build_hub_prompt(
    goal: &str,
    event_summary: &str,
    state: &RuntimeState,
    risk_band: RiskBand,
    route_group: &str,
    requires_approval: bool,
) -> String {
    let workers = "shallow, deep, coder, mcp, api";
    let tools = "brain_loop.run_once, deep_worker.run_once, deep_worker.dream_replay_once, \
                 deep_coder_worker.run_once, panel_connector.call_mcp_tool, panel_connector.call_api_connector";
    let constraints = [
        "中枢只做调度，不直接执行".to_string(),
        "输出必须是可执行任务单（1-3条）".to_string(),
        format!("当前风险={risk_band}"),
        format!("当前路由组={}", if route_group.is_empty() { "-" } else { route_group }),
        format!("requires_approval={requires_approval}"),
        "默认优先可回滚动作".to_string(),
    ];
    let state_brief = format!(
        "cycle={}, energy={:.2}, stress={:.2}, continuity={:.2}",
        state.cycle, state.energy, state.stress, state.continuity
    );
    format!(
        "你是调度中枢，不直接执行，只产出可执行任务单。\n目标：{}\n输入事件流：{}\n状态：{}\n可用执行单元：{}\n可用工具：{}\n约束：{}",
        clip(goal, 220),
        clip(event_summary, 420),
        state_brief,
        workers,
        tools,
        constraints.join("；")
    )
}

/// Everything the dispatch-plan builder needs from the brain pipeline.
pub struct DispatchInputs<'a> {
    pub event_id: i64,
    pub state: &'a RuntimeState,
    pub content: &'a str,
    pub event_type: &'a str,
    pub meta: &'a serde_json::Value,
    pub action: Action,
    pub task_type: TaskType,
    pub route_group: &'a str,
    pub route: &'a RouteResponse,
    pub diagnosis: &'a Diagnosis,
    pub risk: &'a RiskAssessment,
    pub requires_approval: bool,
    pub approved: bool,
    pub llm_cfg: &'a LlmConfig,
    pub skill_policy: &'a SkillRouterPolicy,
}

/// The contract-level, human-readable task order the brain produces for
/// downstream workers: a primary item plus escalation and coding follow-up
/// items, capped at three.
pub fn build_dispatch_plan(inputs: &DispatchInputs<'_>) -> DispatchPlan {
    let task_type = dispatch_task_type(inputs.task_type);
    let risk_band = RiskBand::from_level(inputs.risk.risk_level, false);
    let issue = detect_actionable_issue(inputs.content, inputs.event_type, inputs.meta, inputs.action);

    let worker = dispatch_worker(task_type, inputs.content, inputs.event_type, inputs.meta);
    let model_group = dispatch_model_group(task_type, inputs.route_group);
    let tool = dispatch_tool(worker, task_type);
    let timeout_sec = dispatch_timeout(worker, task_type);
    let reversible = matches!(risk_band, RiskBand::L0 | RiskBand::L1);

    let primary_expected = if !inputs.route.summary.trim().is_empty() {
        clip(&inputs.route.summary, 180).to_string()
    } else if !inputs.diagnosis.diagnosis.trim().is_empty() {
        clip(&inputs.diagnosis.diagnosis, 180).to_string()
    } else {
        "actionable output".to_string()
    };

    let mut items = vec![DispatchItem {
        worker: worker.to_string(),
        model_group,
        tool: tool.to_string(),
        input: clip(inputs.content, 360).to_string(),
        expected_output: primary_expected,
        timeout_sec,
        reversible,
    }];

    if issue.issue_detected {
        match inputs.action {
            Action::EscalateDeep => items.push(DispatchItem {
                worker: "deep".to_string(),
                model_group: "deep_chain".to_string(),
                tool: "deep_worker.run_once".to_string(),
                input: format!("deep request for event#{}: {}", inputs.event_id, clip(inputs.content, 220)),
                expected_output: "evidence + proposal + deep_release".to_string(),
                timeout_sec: 180,
                reversible: true,
            }),
            Action::EscalateDream => items.push(DispatchItem {
                worker: "deep".to_string(),
                model_group: "deep_chain".to_string(),
                tool: "deep_worker.dream_replay_once".to_string(),
                input: format!("dream replay for event#{}: {}", inputs.event_id, clip(inputs.content, 220)),
                expected_output: "dream insight + dream_release".to_string(),
                timeout_sec: 120,
                reversible: true,
            }),
            _ => {}
        }
        if task_type == "coding" && worker != "coder" {
            items.push(DispatchItem {
                worker: "coder".to_string(),
                model_group: "coder_chain".to_string(),
                tool: "deep_coder_worker.run_once".to_string(),
                input: clip(inputs.content, 260).to_string(),
                expected_output: "patch proposal + test hints".to_string(),
                timeout_sec: 240,
                reversible: true,
            });
        }
    }
    items.truncate(3);
    if inputs.requires_approval && !inputs.approved {
        for item in &mut items {
            item.expected_output = format!("[待审批] {}", clip(&item.expected_output, 150));
        }
    }

    let mut success_criteria = vec![
        "至少生成 1 条可执行任务单".to_string(),
        "执行单包含 worker/model_group/tool/timeout/reversible".to_string(),
        "输出可用于下一轮调度".to_string(),
    ];
    if issue.issue_detected {
        success_criteria.push("任务单覆盖当前事件的核心意图".to_string());
    } else {
        success_criteria.push("识别为非执行型输入并保持系统稳定".to_string());
    }
    if inputs.requires_approval {
        success_criteria.push("高风险任务进入审批流程".to_string());
    }
    success_criteria.truncate(6);

    let rollback_plan = if matches!(risk_band, RiskBand::L2 | RiskBand::L3) || inputs.requires_approval {
        "block_external_side_effects + fallback_to_previous_state + require_human_review"
    } else {
        "fallback_to_previous_state + reopen_at_7d"
    };

    let mut confidence = clamp(
        issue.confidence + if inputs.route.live_api { 0.08 } else { 0.0 },
        0.05,
        0.98,
    );
    if !issue.issue_detected {
        confidence = confidence.min(0.58);
    }

    let event_summary = format!(
        "event_type={}; action={}; diagnosis={}; route={}; next={}",
        inputs.event_type,
        inputs.action.as_str(),
        clip(&inputs.diagnosis.diagnosis, 200),
        inputs.route_group,
        clip(&inputs.route.next_step, 140)
    );
    let hub_prompt = build_hub_prompt(
        clip(inputs.content, 220),
        &event_summary,
        inputs.state,
        risk_band,
        inputs.route_group,
        inputs.requires_approval,
    );

    let intent = if inputs.diagnosis.diagnosis.trim().is_empty() {
        clip(inputs.content, 180).to_string()
    } else {
        clip(inputs.diagnosis.diagnosis.trim(), 220).to_string()
    };

    DispatchPlan {
        schema_version: SCHEMA_VERSION.to_string(),
        id: make_contract_id("dispatch", inputs.event_id),
        ts: now_iso(),
        source: "brain-loop".to_string(),
        intent,
        task_type: task_type.to_string(),
        risk_level: risk_band,
        dispatch_plan: items,
        recommended_skills: task_skill_pack(task_type, inputs.llm_cfg, inputs.skill_policy),
        success_criteria,
        rollback_plan: clip(rollback_plan, 280).to_string(),
        confidence: (confidence * 10_000.0).round() / 10_000.0,
        issue_detected: issue.issue_detected,
        issue_reason: clip(&issue.issue_reason, 160).to_string(),
        hub_prompt: clip(&hub_prompt, 1200).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnose::{diagnose, project_state};
    use crate::governance::assess_risk;

    fn sample_diagnosis() -> Diagnosis {
        diagnose("队列深度在上升", &project_state(&RuntimeState::default()))
    }

    fn sample_inputs<'a>(
        content: &'a str,
        event_type: &'a str,
        action: Action,
        state: &'a RuntimeState,
        meta: &'a serde_json::Value,
        route: &'a RouteResponse,
        diagnosis: &'a Diagnosis,
        risk: &'a RiskAssessment,
        cfg: &'a LlmConfig,
        policy: &'a SkillRouterPolicy,
    ) -> DispatchInputs<'a> {
        DispatchInputs {
            event_id: 1,
            state,
            content,
            event_type,
            meta,
            action,
            task_type: TaskType::Analysis,
            route_group: "medium_chain",
            route,
            diagnosis,
            risk,
            requires_approval: risk.requires_approval,
            approved: !risk.requires_approval,
            llm_cfg: cfg,
            skill_policy: policy,
        }
    }

    #[test]
    fn test_contract_id_format() {
        let id = make_contract_id("plan", 42);
        let parts: Vec<&str> = id.splitn(3, '-').collect();
        assert_eq!(parts[0], "plan");
        assert_eq!(parts[1], "42");
        assert!(parts[2].parse::<i64>().unwrap() > 0);
    }

    #[test]
    fn test_risk_band_mapping() {
        assert_eq!(RiskBand::from_level(RiskLevel::Low, true), RiskBand::L3);
        assert_eq!(RiskBand::from_level(RiskLevel::High, false), RiskBand::L2);
        assert_eq!(RiskBand::from_level(RiskLevel::Mid, false), RiskBand::L1);
        assert_eq!(RiskBand::from_level(RiskLevel::Low, false), RiskBand::L0);
    }

    #[test]
    fn test_plan_has_two_steps() {
        let plan = build_plan(7, "调查延迟来源", Action::PlanNext, "medium_chain", "排查建议");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].action, "analyze_event");
        assert_eq!(plan.steps[1].action, "plan_next");
        assert!(plan.steps[1].tool.contains("medium_chain"));
    }

    #[test]
    fn test_exec_trace_digests_and_status() {
        let trace = build_exec_trace(3, "plan-3-1", "risk-3-1", Action::AwaitApproval, "deep_chain", "content", "summary");
        assert_eq!(trace.status, "blocked");
        assert_eq!(trace.tool_calls.len(), 1);
        assert_eq!(trace.tool_calls[0].args_hash.len(), 16);
        assert_eq!(trace.tool_calls[0].result_digest.len(), 16);
    }

    #[test]
    fn test_eval_result_serializes_pass_alias() {
        let eval = build_eval_result(1, "dream_replay", 0.78, true, false, vec![]);
        let json = serde_json::to_value(&eval).unwrap();
        assert_eq!(json.get("pass"), Some(&serde_json::Value::Bool(true)));
        assert!(json.get("pass_flag").is_none());
    }

    #[test]
    fn test_eval_score_clamped() {
        let eval = build_eval_result(1, "s", 1.7, true, false, vec![]);
        assert_eq!(eval.score, 1.0);
    }

    #[test]
    fn test_issue_detection_smalltalk() {
        let signal = detect_actionable_issue("你好呀", "input", &serde_json::json!({}), Action::PlanNext);
        assert!(!signal.issue_detected);
        assert_eq!(signal.issue_reason, "smalltalk");
    }

    #[test]
    fn test_issue_detection_escalation_event() {
        let signal = detect_actionable_issue("whatever", "deep_request", &serde_json::json!({}), Action::PlanNext);
        assert!(signal.issue_detected);
        assert_eq!(signal.issue_reason, "event_type=deep_request");
    }

    #[test]
    fn test_issue_detection_work_tokens() {
        let signal = detect_actionable_issue(
            "请修复队列堆积的问题",
            "input",
            &serde_json::json!({}),
            Action::PlanNext,
        );
        assert!(signal.issue_detected);
        assert_eq!(signal.issue_reason, "explicit_work_signal");
    }

    #[test]
    fn test_issue_detection_insufficient_signal() {
        let signal = detect_actionable_issue(
            "今天的天气真是不错呢大家说是不是",
            "input",
            &serde_json::json!({}),
            Action::PlanNext,
        );
        assert!(!signal.issue_detected);
    }

    #[test]
    fn test_dispatch_plan_smalltalk_not_detected() {
        let state = RuntimeState::default();
        let meta = serde_json::json!({});
        let route = RouteResponse::default();
        let diagnosis = sample_diagnosis();
        let risk = assess_risk(1, Action::PlanNext, "你好呀", "manual", 0.8);
        let cfg = LlmConfig::default();
        let policy = SkillRouterPolicy::default();
        let inputs = sample_inputs("你好呀", "input", Action::PlanNext, &state, &meta, &route, &diagnosis, &risk, &cfg, &policy);
        let plan = build_dispatch_plan(&inputs);
        assert!(!plan.issue_detected);
        assert!(plan.confidence <= 0.58);
        assert_eq!(plan.task_type, "shallow");
        assert_eq!(plan.dispatch_plan.len(), 1);
        assert_eq!(plan.dispatch_plan[0].worker, "shallow");
        assert_eq!(plan.dispatch_plan[0].tool, "brain_loop.run_once");
        assert_eq!(plan.dispatch_plan[0].timeout_sec, 45);
    }

    #[test]
    fn test_dispatch_plan_escalation_appends_deep_item() {
        let state = RuntimeState::default();
        let meta = serde_json::json!({});
        let route = RouteResponse::default();
        let diagnosis = sample_diagnosis();
        let risk = assess_risk(1, Action::EscalateDeep, "迭代优化协议流", "manual", 0.8);
        let cfg = LlmConfig::default();
        let policy = SkillRouterPolicy::default();
        let mut inputs = sample_inputs(
            "迭代优化协议流",
            "iteration",
            Action::EscalateDeep,
            &state,
            &meta,
            &route,
            &diagnosis,
            &risk,
            &cfg,
            &policy,
        );
        inputs.task_type = TaskType::DeepReflection;
        inputs.route_group = "deep_chain";
        let plan = build_dispatch_plan(&inputs);
        assert!(plan.issue_detected);
        assert_eq!(plan.task_type, "deep");
        assert_eq!(plan.dispatch_plan.len(), 2);
        assert_eq!(plan.dispatch_plan[1].tool, "deep_worker.run_once");
        assert_eq!(plan.dispatch_plan[1].timeout_sec, 180);
    }

    #[test]
    fn test_dispatch_plan_approval_pending_marks_items() {
        let state = RuntimeState::default();
        let meta = serde_json::json!({});
        let route = RouteResponse::default();
        let diagnosis = sample_diagnosis();
        let risk = assess_risk(1, Action::AwaitApproval, "delete old rows and drop table users", "manual", 0.8);
        assert!(risk.requires_approval);
        let cfg = LlmConfig::default();
        let policy = SkillRouterPolicy::default();
        let mut inputs = sample_inputs(
            "delete old rows and drop table users",
            "input",
            Action::AwaitApproval,
            &state,
            &meta,
            &route,
            &diagnosis,
            &risk,
            &cfg,
            &policy,
        );
        inputs.approved = false;
        let plan = build_dispatch_plan(&inputs);
        assert!(plan.dispatch_plan.iter().all(|i| i.expected_output.starts_with("[待审批]")));
        assert!(plan.rollback_plan.contains("require_human_review"));
        assert!(plan.success_criteria.iter().any(|c| c.contains("审批")));
    }

    #[test]
    fn test_dispatch_dream_gets_default_skill_pack() {
        let state = RuntimeState::default();
        let meta = serde_json::json!({});
        let route = RouteResponse::default();
        let diagnosis = sample_diagnosis();
        let risk = assess_risk(1, Action::EscalateDream, "做一次记忆重放", "manual", 0.8);
        let cfg = LlmConfig::default();
        let policy = SkillRouterPolicy::default();
        let mut inputs = sample_inputs(
            "做一次记忆重放",
            "dream_request",
            Action::EscalateDream,
            &state,
            &meta,
            &route,
            &diagnosis,
            &risk,
            &cfg,
            &policy,
        );
        inputs.task_type = TaskType::Dream;
        let plan = build_dispatch_plan(&inputs);
        assert_eq!(plan.task_type, "dream");
        assert!(plan.recommended_skills.contains(&"generative-art".to_string()));
        assert_eq!(plan.dispatch_plan[0].tool, "deep_worker.dream_replay_once");
    }

    #[test]
    fn test_dispatch_worker_resolution_mcp_and_api() {
        let meta = serde_json::json!({"connector_id": "mcp-browser"});
        assert_eq!(dispatch_worker("shallow", "text", "input", &meta), "mcp");
        let meta = serde_json::json!({});
        assert_eq!(dispatch_worker("shallow", "call the api connector", "input", &meta), "api");
        assert_eq!(dispatch_worker("coding", "plain", "input", &meta), "coder");
        assert_eq!(dispatch_worker("deep", "plain", "input", &meta), "deep");
    }

    #[test]
    fn test_dispatch_timeouts_in_contract_range() {
        for worker in ["coder", "deep", "mcp", "api", "shallow"] {
            for task in ["deep", "dream", "coding", "shallow", "ops"] {
                let timeout = dispatch_timeout(worker, task);
                assert!((5..=900).contains(&timeout));
            }
        }
    }
}
