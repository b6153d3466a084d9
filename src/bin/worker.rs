//! Worker-track driver: consumes iteration, deep, and dream requests through
//! the safety chain and MVCC-guarded publish path.

use anyhow::{Context, Result};
use clap::Parser;
use resident::db::{append_event, append_health_record, connect_runtime_db};
use resident::safety::EvalHarness;
use resident::scheduler::{run_worker_forever, run_worker_once, spawn_ctrl_c_watch};
use resident::state::RuntimeState;
use resident::WorkerOptions;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "resident-worker", about = "Resident slow loop (deep/dream worker track)")]
struct Args {
    /// Runtime database path
    #[arg(long, default_value = "resident.db")]
    db: PathBuf,

    /// Runtime state file path
    #[arg(long, default_value = "resident_state.json")]
    state: PathBuf,

    /// Run a single fetch+process pass and exit
    #[arg(long)]
    once: bool,

    /// Inject a skill-drill iteration event before the first cycle
    #[arg(long)]
    force_skill: bool,

    /// Inject a deep_request event before the first cycle
    #[arg(long)]
    force_deep: bool,

    /// Inject a dream_request event before the first cycle
    #[arg(long)]
    force_dream: bool,

    /// Idle sleep between passes in forever mode
    #[arg(long, default_value_t = 20.0)]
    interval_sec: f64,

    /// Requested per-cycle event budget
    #[arg(long, default_value_t = 6)]
    max_events: i64,
}

async fn inject_force_events(pool: &SqlitePool, args: &Args) -> Result<()> {
    if args.force_skill {
        append_event(
            pool,
            "deep-worker",
            "iteration",
            "forced skill drill iteration",
            &serde_json::json!({"force": true, "force_skill": true}),
        )
        .await?;
    }
    if args.force_deep {
        append_event(
            pool,
            "deep-worker",
            "deep_request",
            "forced deep reflection",
            &serde_json::json!({"force": true}),
        )
        .await?;
    }
    if args.force_dream {
        append_event(
            pool,
            "deep-worker",
            "dream_request",
            "forced dream replay request",
            &serde_json::json!({"force": true, "mode": "dream"}),
        )
        .await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let base_dir = std::env::current_dir().context("cannot resolve working directory")?;
    let pool = connect_runtime_db(&args.db)
        .await
        .with_context(|| format!("cannot open runtime database {}", args.db.display()))?;
    let mut state = RuntimeState::load(&args.state);
    append_health_record(&pool, "deep-worker", "started", "").await?;

    inject_force_events(&pool, &args).await?;
    let opts = WorkerOptions {
        max_events: args.max_events.max(1),
        base_dir,
        eval: EvalHarness::from_env(),
    };

    if args.once {
        let handled = run_worker_once(&pool, &args.state, &mut state, &opts).await?;
        info!("deep-worker handled={}", handled);
        println!("[deep-worker] handled={handled}");
        return Ok(());
    }

    println!("[deep-worker] running");
    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_ctrl_c_watch(shutdown.clone());
    run_worker_forever(&pool, &args.state, &mut state, &opts, args.interval_sec, shutdown).await?;
    append_health_record(&pool, "deep-worker", "stopped", "").await?;
    Ok(())
}
