//! # Resident - Cognitive Agent Runtime Core
//!
//! A durable event-driven scheduler that turns heterogeneous inputs into
//! typed contracts while maintaining bounded resource budgets, a
//! policy-aware model router, MVCC-protected shared state, and staged
//! safety gates before any externally visible publish.
//!
//! ## Architecture
//!
//! - **Event log**: append-only SQLite queue with per-track progress flags
//! - **Two tracks**: the fast brain cycle and the slow deep/dream worker,
//!   coupled only through re-entrant event appends
//! - **Memory**: fact upsert with conflict tracking, hashed vector index,
//!   source trust, causal edges, lifecycle tiers
//! - **Governance**: risk scoring, immutable-path guard, approval
//!   overrides, emergence guard
//! - **Policy router**: task-type inference, scoreboard scoring, cooldowns,
//!   work-memory bias, live/dry-run provider invocation
//! - **Safety chain**: sandbox screen, evaluation harness, canary snapshot,
//!   rollback artifacts, all gating deep publishes
//! - **MVCC**: compare-and-swap state version advances with drift auditing

pub mod brain;
pub mod config;
pub mod contracts;
pub mod db;
pub mod diagnose;
pub mod error;
pub mod governance;
pub mod memory;
pub mod protocol;
pub mod routing;
pub mod safety;
pub mod scheduler;
pub mod state;
pub mod util;
pub mod worker;

pub use brain::{run_single_brain_cycle, BrainOptions};
pub use config::{LlmConfig, ProviderConfig, RoutingPolicy, SkillRouterPolicy, TEST_GUARD_ENV};
pub use contracts::{
    Approval, ContractKind, DispatchItem, DispatchPlan, EvalResult, ExecTrace, Plan, PlanStep,
    RewardUpdate, RiskBand, RiskReport, ToolCallTrace,
};
pub use db::{connect_runtime_db, CommitStatus, Event};
pub use diagnose::{diagnose, project_state, Diagnosis, State10D};
pub use error::{ResidentError, Result};
pub use governance::{assess_risk, RiskAssessment, RiskLevel};
pub use memory::{hybrid_retrieve, ingest_event_memory, MemoryStats, Retrieved};
pub use routing::{choose_provider_group, RouteChoice, RouteResponse, TaskType};
pub use safety::{run_deep_safety_chain, EvalHarness, SafetyOutcome};
pub use scheduler::{
    compute_brain_event_budget, compute_worker_event_budget, run_brain_forever, run_brain_once,
    run_worker_forever, run_worker_once, spawn_ctrl_c_watch,
};
pub use state::{Action, RuntimeState, StabilityState};
pub use worker::{run_single_worker_cycle, WorkerOptions};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::brain::{run_single_brain_cycle, BrainOptions};
    pub use crate::config::LlmConfig;
    pub use crate::db::{append_event, connect_runtime_db};
    pub use crate::error::{ResidentError, Result};
    pub use crate::safety::EvalHarness;
    pub use crate::scheduler::{run_brain_once, run_worker_once};
    pub use crate::state::{Action, RuntimeState};
    pub use crate::worker::{run_single_worker_cycle, WorkerOptions};
}
