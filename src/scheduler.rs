//! # Scheduler Driver
//!
//! Budget computation under the runtime dials, and the once/forever drive
//! modes shared by the brain and worker binaries. High stress or low energy
//! shrinks the per-cycle batch; degraded mode taxes everything. The forever
//! loops sleep only on idle passes, back off 0.8s on transient lock errors,
//! and observe a cooperative shutdown flag between cycles.

use crate::brain::{run_single_brain_cycle, BrainOptions};
use crate::db::is_transient_lock_error;
use crate::error::Result;
use crate::state::RuntimeState;
use crate::util::now_iso;
use crate::worker::{run_single_worker_cycle, WorkerOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Back-off between retries on transient lock contention.
const LOCK_BACKOFF: Duration = Duration::from_millis(800);

// ============================================================================
// Budgets
// ============================================================================

/// Brain-track batch budget. Multiplicative reducers over the dials; the
/// effective count never exceeds the requested count and shrinking a cycle
/// counts as a degraded cycle.
pub fn compute_brain_event_budget(state: &mut RuntimeState, requested_max: i64) -> i64 {
    let requested = requested_max.clamp(1, 200);
    let mut scale = 1.0_f64;
    let mut reasons: Vec<&str> = Vec::new();

    if state.stress >= 0.8 {
        scale *= 0.45;
        reasons.push("stress_high");
    } else if state.stress >= 0.65 {
        scale *= 0.7;
        reasons.push("stress_up");
    }
    if state.energy <= 0.2 {
        scale *= 0.6;
        reasons.push("energy_low");
    } else if state.energy <= 0.35 {
        scale *= 0.8;
        reasons.push("energy_down");
    }
    if state.uncertainty >= 0.75 {
        scale *= 0.8;
        reasons.push("uncertainty_high");
    }
    if state.continuity <= 0.3 {
        scale *= 0.8;
        reasons.push("continuity_low");
    }
    if state.stability.mode == "degraded" {
        scale *= 0.8;
        reasons.push("degraded_mode");
    }

    let effective = ((requested as f64 * scale).round() as i64).clamp(1, requested);
    state.stability.requested_brain_events = requested;
    state.stability.effective_brain_events = effective;
    state.stability.last_budget_reason = if reasons.is_empty() {
        "normal".to_string()
    } else {
        reasons.join(",")
    };
    state.stability.last_updated = now_iso();
    if effective < requested {
        state.stability.degraded_cycles += 1;
    }
    effective
}

/// Worker-track batch budget with its own thresholds.
pub fn compute_worker_event_budget(state: &mut RuntimeState, requested_max: i64) -> i64 {
    let requested = requested_max.clamp(1, 200);
    let mut scale = 1.0_f64;
    let mut reasons: Vec<&str> = Vec::new();

    if state.stress >= 0.85 {
        scale *= 0.6;
        reasons.push("worker_stress_high");
    }
    if state.energy <= 0.15 {
        scale *= 0.7;
        reasons.push("worker_energy_low");
    }
    if state.stability.mode == "degraded" {
        scale *= 0.8;
        reasons.push("worker_degraded_mode");
    }

    let effective = ((requested as f64 * scale).round() as i64).clamp(1, requested);
    state.stability.requested_worker_events = requested;
    state.stability.effective_worker_events = effective;
    if !reasons.is_empty() {
        state.stability.last_budget_reason =
            format!("{}|{}", state.stability.last_budget_reason, reasons.join(","));
    }
    state.stability.last_updated = now_iso();
    effective
}

// ============================================================================
// Drive modes
// ============================================================================

/// One fetch+process pass of the brain track, then persist state.
pub async fn run_brain_once(
    pool: &SqlitePool,
    state_path: &Path,
    state: &mut RuntimeState,
    opts: &BrainOptions,
) -> Result<usize> {
    let handled = run_single_brain_cycle(pool, state, opts).await?;
    state.normalize();
    state.save(state_path)?;
    Ok(handled)
}

/// One fetch+process pass of the worker track, then persist state.
pub async fn run_worker_once(
    pool: &SqlitePool,
    state_path: &Path,
    state: &mut RuntimeState,
    opts: &WorkerOptions,
) -> Result<usize> {
    let handled = run_single_worker_cycle(pool, state, opts).await?;
    state.normalize();
    state.save(state_path)?;
    Ok(handled)
}

/// Drive the brain track until the shutdown flag is raised. Sleeps only on
/// idle passes; transient lock contention backs off and continues.
pub async fn run_brain_forever(
    pool: &SqlitePool,
    state_path: &Path,
    state: &mut RuntimeState,
    opts: &BrainOptions,
    interval_sec: f64,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let interval = Duration::from_secs_f64(interval_sec.max(0.2));
    while !shutdown.load(Ordering::Relaxed) {
        match run_brain_once(pool, state_path, state, opts).await {
            Ok(0) => tokio::time::sleep(interval).await,
            Ok(handled) => info!("brain cycle handled {} event(s)", handled),
            Err(err) if is_transient_lock_error(&err) => {
                warn!("event log contended, backing off: {}", err);
                tokio::time::sleep(LOCK_BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
    info!("brain loop shutting down");
    Ok(())
}

/// Drive the worker track until the shutdown flag is raised.
pub async fn run_worker_forever(
    pool: &SqlitePool,
    state_path: &Path,
    state: &mut RuntimeState,
    opts: &WorkerOptions,
    interval_sec: f64,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let interval = Duration::from_secs_f64(interval_sec.max(0.2));
    while !shutdown.load(Ordering::Relaxed) {
        match run_worker_once(pool, state_path, state, opts).await {
            Ok(0) => tokio::time::sleep(interval).await,
            Ok(handled) => info!("worker cycle handled {} event(s)", handled),
            Err(err) if is_transient_lock_error(&err) => {
                warn!("event log contended, backing off: {}", err);
                tokio::time::sleep(LOCK_BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
    info!("worker loop shutting down");
    Ok(())
}

/// Flip a shutdown flag on ctrl-c. The loops observe it between events, so
/// the current event always finishes first.
pub fn spawn_ctrl_c_watch(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, finishing current event");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
}
