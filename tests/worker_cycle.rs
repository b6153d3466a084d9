//! End-to-end worker-track tests: dream replay and the safety-gated deep
//! publish path, with a stubbed evaluation harness.

use resident::db::{append_event, connect_runtime_db, list_recent_decisions, read_version};
use resident::safety::EvalHarness;
use resident::state::RuntimeState;
use resident::worker::{run_single_worker_cycle, WorkerOptions};
use sqlx::SqlitePool;
use tempfile::TempDir;

async fn setup() -> (TempDir, SqlitePool, RuntimeState) {
    std::env::set_var(resident::TEST_GUARD_ENV, "1");
    let dir = tempfile::tempdir().unwrap();
    let pool = connect_runtime_db(&dir.path().join("resident.db")).await.unwrap();
    (dir, pool, RuntimeState::default())
}

fn harness(line: &str) -> EvalHarness {
    EvalHarness {
        command: vec!["sh".to_string(), "-c".to_string(), format!("echo '{line}'")],
        timeout_secs: 60,
        enabled: true,
    }
}

fn opts_for(dir: &TempDir, eval: EvalHarness) -> WorkerOptions {
    WorkerOptions {
        max_events: 6,
        base_dir: dir.path().to_path_buf(),
        eval,
    }
}

async fn count_events(pool: &SqlitePool, event_type: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(1) FROM events WHERE event_type = ?")
        .bind(event_type)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn latest_contract_payload(pool: &SqlitePool, kind: &str) -> serde_json::Value {
    let payload: String =
        sqlx::query_scalar("SELECT payload_json FROM contracts WHERE kind = ? ORDER BY id DESC LIMIT 1")
            .bind(kind)
            .fetch_one(pool)
            .await
            .unwrap();
    serde_json::from_str(&payload).unwrap()
}

#[tokio::test]
async fn test_deep_publish_happy_path() {
    let (dir, pool, mut state) = setup().await;
    let event_id = append_event(&pool, "manual", "iteration", "请重构协议流", &serde_json::json!({}))
        .await
        .unwrap();

    let handled = run_single_worker_cycle(&pool, &mut state, &opts_for(&dir, harness("3 passed")))
        .await
        .unwrap();
    assert_eq!(handled, 1);

    assert_eq!(count_events(&pool, "evidence").await, 1);
    assert_eq!(count_events(&pool, "proposal").await, 1);
    assert_eq!(count_events(&pool, "deep_release").await, 1);
    assert_eq!(count_events(&pool, "trace").await, 1);
    assert_eq!(count_events(&pool, "guard").await, 0);

    let gate_status: String =
        sqlx::query_scalar("SELECT status FROM eval_gates WHERE event_id = ? ORDER BY id DESC LIMIT 1")
            .bind(event_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(gate_status, "passed");

    let (actor, status): (String, String) = sqlx::query_as(
        "SELECT actor, status FROM commit_windows WHERE event_id = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(event_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(actor, "deep-worker");
    assert_eq!(status, "committed");
    assert_eq!(read_version(&pool).await.unwrap(), 1);
    assert_eq!(state.mvcc_version, 1);

    let decisions = list_recent_decisions(&pool, 5).await.unwrap();
    assert_eq!(decisions[0].action, "deep_publish");

    let eval = latest_contract_payload(&pool, "eval_result").await;
    assert_eq!(eval.get("suite").and_then(|v| v.as_str()), Some("deep_eval_harness"));
    assert_eq!(eval.get("pass"), Some(&serde_json::Value::Bool(true)));
    assert_eq!(eval.get("score").and_then(|v| v.as_f64()), Some(0.92));

    let reward = latest_contract_payload(&pool, "reward_update").await;
    assert_eq!(reward.get("actor_id").and_then(|v| v.as_str()), Some("deep-worker"));
    assert_eq!(reward.get("delta").and_then(|v| v.as_f64()), Some(0.45));
    assert!((state.reward_rep_deep_worker - 50.45).abs() < 1e-9);
}

#[tokio::test]
async fn test_dream_replay_no_commit() {
    let (dir, pool, mut state) = setup().await;
    // Some ambient history for the replay to weave.
    append_event(&pool, "manual", "input", "昨天讨论了缓存策略", &serde_json::json!({}))
        .await
        .unwrap();
    let event_id = append_event(&pool, "manual", "dream_request", "做一次记忆重放", &serde_json::json!({}))
        .await
        .unwrap();

    let handled = run_single_worker_cycle(&pool, &mut state, &opts_for(&dir, harness("1 passed")))
        .await
        .unwrap();
    assert_eq!(handled, 1);

    assert_eq!(count_events(&pool, "dream").await, 1);
    assert_eq!(count_events(&pool, "dream_release").await, 1);

    let decisions = list_recent_decisions(&pool, 5).await.unwrap();
    assert_eq!(decisions[0].action, "dream_reflect");

    let eval = latest_contract_payload(&pool, "eval_result").await;
    assert_eq!(eval.get("suite").and_then(|v| v.as_str()), Some("dream_replay"));
    assert_eq!(eval.get("pass"), Some(&serde_json::Value::Bool(true)));
    assert_eq!(eval.get("score").and_then(|v| v.as_f64()), Some(0.64));

    let reward = latest_contract_payload(&pool, "reward_update").await;
    assert_eq!(reward.get("actor_id").and_then(|v| v.as_str()), Some("dream-worker"));
    assert_eq!(reward.get("delta").and_then(|v| v.as_f64()), Some(0.10));

    // Dream replay never advances the state version.
    assert_eq!(read_version(&pool).await.unwrap(), 0);
    let status: String =
        sqlx::query_scalar("SELECT status FROM commit_windows WHERE event_id = ? ORDER BY id DESC LIMIT 1")
            .bind(event_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "dream_no_commit");
}

#[tokio::test]
async fn test_dream_replay_is_single_shot_per_request() {
    let (dir, pool, mut state) = setup().await;
    append_event(&pool, "manual", "dream_request", "重放一次", &serde_json::json!({}))
        .await
        .unwrap();
    run_single_worker_cycle(&pool, &mut state, &opts_for(&dir, harness("1 passed")))
        .await
        .unwrap();
    // Second pass: the request is worker_done, nothing new appears.
    let handled = run_single_worker_cycle(&pool, &mut state, &opts_for(&dir, harness("1 passed")))
        .await
        .unwrap();
    assert_eq!(handled, 0);
    assert_eq!(count_events(&pool, "dream").await, 1);
    assert_eq!(count_events(&pool, "dream_release").await, 1);
}

#[tokio::test]
async fn test_eval_gate_failure_rolls_back() {
    let (dir, pool, mut state) = setup().await;
    let event_id = append_event(&pool, "manual", "deep_request", "优化调度窗口", &serde_json::json!({}))
        .await
        .unwrap();

    run_single_worker_cycle(&pool, &mut state, &opts_for(&dir, harness("0 failed")))
        .await
        .unwrap();

    assert_eq!(count_events(&pool, "deep_release").await, 0);
    assert_eq!(count_events(&pool, "proposal").await, 0);
    assert_eq!(count_events(&pool, "guard").await, 1);
    assert_eq!(count_events(&pool, "evidence").await, 1);

    let decisions = list_recent_decisions(&pool, 5).await.unwrap();
    assert_eq!(decisions[0].action, "rollback");

    let status: String =
        sqlx::query_scalar("SELECT status FROM commit_windows WHERE event_id = ? ORDER BY id DESC LIMIT 1")
            .bind(event_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "blocked_eval_gate");
    assert_eq!(read_version(&pool).await.unwrap(), 0);

    // The rollback log artifact was written.
    let rollback_dir = dir.path().join("resident_output").join("rollback");
    assert!(rollback_dir.exists());
    assert!(std::fs::read_dir(&rollback_dir).unwrap().count() >= 1);

    let reward = latest_contract_payload(&pool, "reward_update").await;
    assert_eq!(reward.get("delta").and_then(|v| v.as_f64()), Some(-0.25));
    assert!((state.reward_rep_deep_worker - 49.75).abs() < 1e-9);

    let eval = latest_contract_payload(&pool, "eval_result").await;
    assert_eq!(eval.get("pass"), Some(&serde_json::Value::Bool(false)));
    assert_eq!(eval.get("regression"), Some(&serde_json::Value::Bool(true)));
}

#[tokio::test]
async fn test_sandbox_pattern_blocks_publish() {
    let (dir, pool, mut state) = setup().await;
    append_event(
        &pool,
        "manual",
        "iteration",
        "run rm -rf on the staging volume",
        &serde_json::json!({}),
    )
    .await
    .unwrap();

    run_single_worker_cycle(&pool, &mut state, &opts_for(&dir, harness("3 passed")))
        .await
        .unwrap();

    assert_eq!(count_events(&pool, "deep_release").await, 0);
    assert_eq!(count_events(&pool, "guard").await, 1);
    let decisions = list_recent_decisions(&pool, 5).await.unwrap();
    assert_eq!(decisions[0].action, "rollback");

    // Sandbox blocked before the eval gate, so no gate row exists.
    let gates: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM eval_gates").fetch_one(&pool).await.unwrap();
    assert_eq!(gates, 0);

    let eval = latest_contract_payload(&pool, "eval_result").await;
    assert_eq!(eval.get("score").and_then(|v| v.as_f64()), Some(0.3));
}

#[tokio::test]
async fn test_worker_handles_batch_in_id_order() {
    let (dir, pool, mut state) = setup().await;
    let first = append_event(&pool, "manual", "iteration", "第一个迭代请求", &serde_json::json!({}))
        .await
        .unwrap();
    let second = append_event(&pool, "manual", "deep_request", "第二个深化请求", &serde_json::json!({}))
        .await
        .unwrap();

    let handled = run_single_worker_cycle(&pool, &mut state, &opts_for(&dir, harness("2 passed")))
        .await
        .unwrap();
    assert_eq!(handled, 2);

    let windows: Vec<(i64, String)> =
        sqlx::query_as("SELECT event_id, status FROM commit_windows ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(windows.len(), 2);
    assert_eq!(windows[0].0, first);
    assert_eq!(windows[1].0, second);
    // Both published: versions 1 then 2, each from a clean window.
    assert!(windows.iter().all(|(_, status)| status == "committed"));
    assert_eq!(read_version(&pool).await.unwrap(), 2);
    assert_eq!(count_events(&pool, "deep_release").await, 2);
}
