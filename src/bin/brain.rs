//! Brain-track driver: pulls pending events and runs the fast per-event
//! pipeline, once or forever.

use anyhow::{Context, Result};
use clap::Parser;
use resident::db::{append_event, append_health_record, connect_runtime_db};
use resident::scheduler::{run_brain_forever, run_brain_once, spawn_ctrl_c_watch};
use resident::state::RuntimeState;
use resident::BrainOptions;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "resident-brain", about = "Resident fast loop (brain track)")]
struct Args {
    /// Runtime database path
    #[arg(long, default_value = "resident.db")]
    db: PathBuf,

    /// Runtime state file path
    #[arg(long, default_value = "resident_state.json")]
    state: PathBuf,

    /// Idle sleep between passes in forever mode
    #[arg(long, default_value_t = 15.0)]
    interval_sec: f64,

    /// Requested per-cycle event budget
    #[arg(long, default_value_t = 12)]
    max_events: i64,

    /// Run a single fetch+process pass and exit
    #[arg(long)]
    once: bool,

    /// Inject a deep_request event and force deep escalation
    #[arg(long)]
    force_deep: bool,

    /// Inject a dream_request event before the first cycle
    #[arg(long)]
    force_dream: bool,

    /// Inject a devils-advocate input event before the first cycle
    #[arg(long)]
    force_debate: bool,
}

async fn inject_force_events(pool: &SqlitePool, args: &Args) -> Result<()> {
    if args.force_deep {
        append_event(
            pool,
            "brain-loop",
            "deep_request",
            "forced deep reflection",
            &serde_json::json!({"force": true}),
        )
        .await?;
    }
    if args.force_dream {
        append_event(
            pool,
            "brain-loop",
            "dream_request",
            "forced dream replay request",
            &serde_json::json!({"force": true, "mode": "dream"}),
        )
        .await?;
    }
    if args.force_debate {
        append_event(
            pool,
            "brain-loop",
            "input",
            "forced devils advocate request",
            &serde_json::json!({"force": true, "mode": "debate"}),
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
    append_health_record(&pool, "brain-loop", "started", "").await?;

    inject_force_events(&pool, &args).await?;
    let opts = BrainOptions {
        max_events: args.max_events.max(1),
        force_deep: args.force_deep,
        base_dir,
    };

    if args.once {
        let handled = run_brain_once(&pool, &args.state, &mut state, &opts).await?;
        info!("brain-loop handled={}", handled);
        println!("[brain-loop] handled={handled}");
        return Ok(());
    }

    println!("[brain-loop] running");
    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_ctrl_c_watch(shutdown.clone());
    run_brain_forever(&pool, &args.state, &mut state, &opts, args.interval_sec, shutdown).await?;
    append_health_record(&pool, "brain-loop", "stopped", "").await?;
    Ok(())
}
