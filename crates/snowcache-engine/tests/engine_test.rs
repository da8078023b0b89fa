//! End-to-end execution tests against a scripted warehouse

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use common::{eventually, open_engine, test_config, Script, Warehouse};
use snowcache_engine::coordinator::{ExecuteOptions, ExecuteOutcome};
use snowcache_engine::error::{EngineError, ErrorCode};
use snowcache_engine::session::{Session, SessionStatus};
use snowcache_engine::store::{self, ExtendedFilter, FilterOp, PageQuery, ScanQuery, SortOrder};
use snowcache_engine::Engine;
use snowcache_upstream::prelude::{ConnectionConfig, SqliteConnectionFactory, Value};

fn table_exists(engine: &Engine, id: &str) -> bool {
    engine.coordinator().store().table_exists(id).unwrap()
}

// ==================== Happy Path Tests ====================

#[tokio::test]
async fn test_small_select_is_cached_and_readable() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script(
        "SELECT 1 as a, 2 as b",
        Script::new(&["a", "b"], vec![vec![Value::Int64(1), Value::Int64(2)]]),
    );
    let engine = open_engine(test_config(&dir), &warehouse);

    let outcome = engine.execute("SELECT 1 as a, 2 as b", "alice", None).await.unwrap();
    let ExecuteOutcome::Completed {
        session_id,
        total,
        processed,
        columns,
        ..
    } = outcome
    else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(total, 1);
    assert_eq!(processed, 1);
    assert_eq!(columns, vec!["a", "b"]);
    assert!(session_id.starts_with("cache_alice_"));

    let page = engine.read(&session_id, &PageQuery::new(1, 10)).unwrap();
    assert_eq!(page.columns, vec!["a", "b"]);
    assert_eq!(page.rows, vec![vec!["1".to_string(), "2".to_string()]]);
    assert_eq!(page.total, 1);
    assert_eq!(page.total_pages, 1);

    let status = engine.status(&session_id).unwrap();
    assert_eq!(status.status, SessionStatus::Completed);
    assert_eq!(status.progress_pct, 100.0);
    assert!(status.error.is_none());
}

#[tokio::test]
async fn test_multi_chunk_stream_keeps_row_order() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM t", Script::numbered(35));
    let engine = open_engine(test_config(&dir), &warehouse);

    let outcome = engine.execute("SELECT * FROM t", "alice", None).await.unwrap();
    let id = outcome.session_id().unwrap().to_string();

    let page = engine.read(&id, &PageQuery::new(4, 10)).unwrap();
    assert_eq!(page.total, 35);
    assert_eq!(page.total_pages, 4);
    assert_eq!(page.rows.len(), 5);
    assert_eq!(page.rows[0], vec!["30".to_string(), "row-30".to_string()]);
}

#[tokio::test]
async fn test_empty_result_completes() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM empty", Script::numbered(0));
    let engine = open_engine(test_config(&dir), &warehouse);

    let outcome = engine.execute("SELECT * FROM empty", "alice", None).await.unwrap();
    let id = outcome.session_id().unwrap().to_string();

    assert_eq!(engine.status(&id).unwrap().status, SessionStatus::Completed);
    let page = engine.read(&id, &PageQuery::new(1, 10)).unwrap();
    assert!(page.rows.is_empty());
    assert_eq!(page.total, 0);
}

#[tokio::test]
async fn test_limit_caps_rows() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM t", Script::numbered(100));
    let engine = open_engine(test_config(&dir), &warehouse);

    let outcome = engine.execute("SELECT * FROM t", "alice", Some(15)).await.unwrap();
    let id = outcome.session_id().unwrap().to_string();
    assert_eq!(engine.status(&id).unwrap().processed, 15);
    assert_eq!(engine.read(&id, &PageQuery::new(1, 100)).unwrap().total, 15);

    // smaller than one chunk
    let outcome = engine.execute("SELECT * FROM t", "alice", Some(5)).await.unwrap();
    let id = outcome.session_id().unwrap().to_string();
    let page = engine.read(&id, &PageQuery::new(1, 100)).unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.rows[4][0], "4");
}

#[tokio::test]
async fn test_rows_beyond_count_are_truncated() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM growing", Script::numbered(25).with_count(12));
    let engine = open_engine(test_config(&dir), &warehouse);

    let outcome = engine.execute("SELECT * FROM growing", "alice", None).await.unwrap();
    let id = outcome.session_id().unwrap().to_string();
    assert_eq!(engine.read(&id, &PageQuery::new(1, 100)).unwrap().total, 12);
}

#[tokio::test]
async fn test_trailing_comments_and_terminators() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT a FROM t", Script::new(&["a"], vec![vec![Value::Int64(7)]]));
    let engine = open_engine(test_config(&dir), &warehouse);

    for stmt in ["SELECT a FROM t -- daily", "SELECT a FROM t; -- trailing note"] {
        let outcome = engine.execute(stmt, "alice", None).await.unwrap();
        assert!(
            matches!(outcome, ExecuteOutcome::Completed { processed: 1, .. }),
            "{}: {:?}",
            stmt,
            outcome
        );
    }
}

#[tokio::test]
async fn test_trailing_comments_against_sqlite() {
    let dir = TempDir::new().unwrap();
    let upstream = dir.path().join("warehouse.db");
    let conn = rusqlite::Connection::open(&upstream).unwrap();
    conn.execute_batch("CREATE TABLE t (a INTEGER); INSERT INTO t VALUES (1), (2), (3);")
        .unwrap();
    drop(conn);

    let engine = Engine::open(
        test_config(&dir),
        Arc::new(SqliteConnectionFactory::new()),
        ConnectionConfig::new(format!("sqlite://{}", upstream.display())),
    )
    .unwrap();

    for stmt in [
        "SELECT a FROM t",
        "SELECT a FROM t -- daily",
        "SELECT a FROM t; -- trailing note",
        "SELECT a FROM t /* block */;",
    ] {
        let outcome = engine.execute(stmt, "alice", None).await.unwrap();
        let id = outcome.session_id().unwrap().to_string();
        assert_eq!(engine.read(&id, &PageQuery::new(1, 10)).unwrap().total, 3, "{}", stmt);
    }
}

// ==================== Size Gate Tests ====================

#[tokio::test]
async fn test_display_gate_requires_confirmation() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM big", Script::numbered(25).with_count(1_500_000));
    let engine = open_engine(test_config(&dir), &warehouse);

    let outcome = engine.execute("SELECT * FROM big", "alice", None).await.unwrap();
    match outcome {
        ExecuteOutcome::RequiresConfirmation {
            total_count, limit, ..
        } => {
            assert_eq!(total_count, 1_500_000);
            assert_eq!(limit, 1_000_000);
        }
        other => panic!("expected confirmation, got {:?}", other),
    }
    assert_eq!(engine.stats().running, 0);
    assert!(engine.coordinator().store().list_cache_tables().unwrap().is_empty());

    // resubmitted as download-only it streams whatever the cursor yields
    let options = ExecuteOptions::default().download_only();
    let outcome = engine.execute_with("SELECT * FROM big", "alice", &options).await.unwrap();
    let id = outcome.session_id().unwrap().to_string();
    assert_eq!(engine.status(&id).unwrap().status, SessionStatus::Completed);
    assert_eq!(engine.read(&id, &PageQuery::new(1, 100)).unwrap().total, 25);
}

#[tokio::test]
async fn test_display_gate_boundary() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM exact", Script::numbered(20));
    warehouse.script("SELECT * FROM over", Script::numbered(21));
    let engine = open_engine(test_config(&dir).with_max_for_display(20), &warehouse);

    let outcome = engine.execute("SELECT * FROM exact", "alice", None).await.unwrap();
    assert!(matches!(outcome, ExecuteOutcome::Completed { processed: 20, .. }));

    let outcome = engine.execute("SELECT * FROM over", "alice", None).await.unwrap();
    assert!(matches!(
        outcome,
        ExecuteOutcome::RequiresConfirmation { total_count: 21, .. }
    ));

    // a limit under the display cap passes the gate
    let outcome = engine.execute("SELECT * FROM over", "alice", Some(20)).await.unwrap();
    assert!(matches!(outcome, ExecuteOutcome::Completed { processed: 20, .. }));
}

#[tokio::test]
async fn test_too_large_is_rejected() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM huge", Script::numbered(1).with_count(20_000_000));
    let engine = open_engine(test_config(&dir), &warehouse);

    let options = ExecuteOptions::default().download_only();
    let err = engine
        .execute_with("SELECT * FROM huge", "alice", &options)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::TooLarge {
            total: 20_000_000,
            cap: 10_000_000
        }
    ));
    assert_eq!(err.code(), ErrorCode::LimitExceeded);
    assert!(engine.coordinator().store().list_cache_tables().unwrap().is_empty());

    let sessions = engine.list_sessions("alice");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    assert_eq!(engine.stats().running, 0);
}

// ==================== Validation Tests ====================

#[tokio::test]
async fn test_non_select_is_rejected_before_admission() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    let engine = open_engine(test_config(&dir), &warehouse);

    let err = engine.execute("DELETE FROM orders", "alice", None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ValidationError);
    assert!(engine.list_sessions("alice").is_empty());
    assert_eq!(warehouse.executed.load(Ordering::SeqCst), 0);
}

// ==================== Failure Tests ====================

#[tokio::test]
async fn test_count_failure_marks_session_failed() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    let engine = open_engine(test_config(&dir), &warehouse);

    let err = engine.execute("SELECT * FROM missing", "alice", None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::UpstreamError);

    let sessions = engine.list_sessions("alice");
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    assert!(sessions[0].error_message.as_deref().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_mid_stream_failure_drops_table() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM flaky", Script::numbered(50).failing_at(2));
    let engine = open_engine(test_config(&dir), &warehouse);

    let err = engine.execute("SELECT * FROM flaky", "alice", None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::UpstreamError);

    let session = &engine.list_sessions("alice")[0];
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.processed_rows, 20);
    assert!(!table_exists(&engine, &session.session_id));

    let err = engine.read(&session.session_id, &PageQuery::new(1, 10)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoData);
}

#[tokio::test]
async fn test_background_failure_is_recorded() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM flaky", Script::numbered(50).failing_at(2));
    let engine = open_engine(test_config(&dir), &warehouse);

    let outcome = engine
        .execute_async("SELECT * FROM flaky", "alice", &ExecuteOptions::default())
        .await
        .unwrap();
    let id = outcome.session_id().unwrap().to_string();

    // the task swallows the stream error; join only reports a panicked task
    engine.join(&id).await.unwrap();

    let status = engine.status(&id).unwrap();
    assert_eq!(status.status, SessionStatus::Failed);
    assert!(status.error.is_some());
    assert_eq!(engine.stats().running, 0);
    assert!(!table_exists(&engine, &id));
}

#[tokio::test]
async fn test_unsupported_value_fails_session() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    let mut script = Script::numbered(15);
    script.rows[12][1] = Value::Array(vec![Value::Int64(1)]);
    warehouse.script("SELECT * FROM nested", script);
    let engine = open_engine(test_config(&dir), &warehouse);

    let err = engine.execute("SELECT * FROM nested", "alice", None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnsupportedType);

    let session = &engine.list_sessions("alice")[0];
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.processed_rows, 10);
    assert!(!table_exists(&engine, &session.session_id));
}

// ==================== Concurrency Tests ====================

#[tokio::test]
async fn test_concurrency_cap() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    let gate = Arc::new(Semaphore::new(0));
    warehouse.script("SELECT * FROM slow", Script::numbered(30).gated(Arc::clone(&gate)));
    warehouse.script("SELECT * FROM fast", Script::numbered(3));
    let engine = open_engine(test_config(&dir), &warehouse);

    let mut ids = Vec::new();
    for _ in 0..5 {
        let outcome = engine
            .execute_async("SELECT * FROM slow", "alice", &ExecuteOptions::default())
            .await
            .unwrap();
        assert!(matches!(outcome, ExecuteOutcome::Processing { total: 30, .. }));
        ids.push(outcome.session_id().unwrap().to_string());
    }
    assert_eq!(engine.stats().running, 5);

    let err = engine.execute("SELECT * FROM fast", "bob", None).await.unwrap_err();
    assert!(matches!(err, EngineError::Busy { limit: 5 }));
    assert_eq!(engine.stats().registry.rejected_busy, 1);

    gate.add_permits(1_000);
    for id in &ids {
        engine.join(id).await.unwrap();
        assert_eq!(engine.status(id).unwrap().status, SessionStatus::Completed);
    }

    let outcome = engine.execute("SELECT * FROM fast", "bob", None).await.unwrap();
    assert!(matches!(outcome, ExecuteOutcome::Completed { processed: 3, .. }));
}

#[tokio::test]
async fn test_read_while_streaming() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    let gate = Arc::new(Semaphore::new(0));
    warehouse.script("SELECT * FROM slow", Script::numbered(40).gated(Arc::clone(&gate)));
    let engine = open_engine(test_config(&dir), &warehouse);

    let outcome = engine
        .execute_async("SELECT * FROM slow", "alice", &ExecuteOptions::default())
        .await
        .unwrap();
    let id = outcome.session_id().unwrap().to_string();

    let err = engine.read(&id, &PageQuery::new(1, 10)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotReady);

    gate.add_permits(1);
    eventually(|| engine.status(&id).unwrap().processed == 10).await;
    let page = engine.read(&id, &PageQuery::new(1, 100)).unwrap();
    assert_eq!(page.total, 10);
    assert_eq!(engine.status(&id).unwrap().progress_pct, 25.0);

    gate.add_permits(1_000);
    engine.join(&id).await.unwrap();
    assert_eq!(engine.read(&id, &PageQuery::new(1, 100)).unwrap().total, 40);
}

// ==================== Cancellation Tests ====================

#[tokio::test]
async fn test_cancel_mid_stream() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    let gate = Arc::new(Semaphore::new(0));
    warehouse.script("SELECT * FROM slow", Script::numbered(100).gated(Arc::clone(&gate)));
    let engine = open_engine(test_config(&dir), &warehouse);

    let outcome = engine
        .execute_async("SELECT * FROM slow", "alice", &ExecuteOptions::default())
        .await
        .unwrap();
    let id = outcome.session_id().unwrap().to_string();

    gate.add_permits(2);
    eventually(|| engine.status(&id).unwrap().processed == 20).await;

    engine.cancel(&id).unwrap();
    engine.join(&id).await.unwrap();

    let status = engine.status(&id).unwrap();
    assert_eq!(status.status, SessionStatus::Cancelled);
    assert!(status.processed > 0 && status.processed < status.total);
    assert!(!table_exists(&engine, &id));
    assert!(!engine.coordinator().is_streaming(&id));

    let err = engine.read(&id, &PageQuery::new(1, 10)).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Cancelled);

    let err = engine.cancel(&id).unwrap_err();
    assert!(matches!(err, EngineError::NotCancellable { .. }));
    assert_eq!(engine.stats().running, 0);
}

#[tokio::test]
async fn test_cancel_before_first_chunk() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    let gate = Arc::new(Semaphore::new(0));
    warehouse.script("SELECT * FROM slow", Script::numbered(30).gated(Arc::clone(&gate)));
    let engine = open_engine(test_config(&dir), &warehouse);

    let outcome = engine
        .execute_async("SELECT * FROM slow", "alice", &ExecuteOptions::default())
        .await
        .unwrap();
    let id = outcome.session_id().unwrap().to_string();

    engine.cancel(&id).unwrap();
    engine.join(&id).await.unwrap();

    let status = engine.status(&id).unwrap();
    assert_eq!(status.status, SessionStatus::Cancelled);
    assert_eq!(status.processed, 0);
    assert!(!table_exists(&engine, &id));
}

#[tokio::test]
async fn test_cancel_unknown_session() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(test_config(&dir), &Warehouse::new());

    let err = engine.cancel("cache_nobody_20240101000000_001").unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidSession);
}

#[tokio::test]
async fn test_shutdown_cancels_running_sessions() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    let gate = Arc::new(Semaphore::new(0));
    warehouse.script("SELECT * FROM slow", Script::numbered(30).gated(Arc::clone(&gate)));
    let engine = open_engine(test_config(&dir), &warehouse);

    let outcome = engine
        .execute_async("SELECT * FROM slow", "alice", &ExecuteOptions::default())
        .await
        .unwrap();
    let id = outcome.session_id().unwrap().to_string();

    engine.shutdown().await.unwrap();
    assert_eq!(engine.status(&id).unwrap().status, SessionStatus::Cancelled);

    let err = engine.execute("SELECT * FROM slow", "alice", None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InternalError);
}

// ==================== Read Tests ====================

fn people() -> Script {
    let rows = [
        ("1", "ann", "berlin", Value::Int64(31)),
        ("2", "bob", "paris", Value::Null),
        ("3", "cid", "berlin", Value::Int64(7)),
        ("4", "dee", "rome", Value::Int64(54)),
        ("5", "eve", "paris", Value::Int64(19)),
    ]
    .into_iter()
    .map(|(id, name, city, age)| {
        vec![
            Value::String(id.into()),
            Value::String(name.into()),
            Value::String(city.into()),
            age,
        ]
    })
    .collect();
    Script::new(&["id", "name", "city", "age"], rows)
}

async fn people_session(engine: &Engine) -> String {
    let outcome = engine.execute("SELECT * FROM people", "alice", None).await.unwrap();
    outcome.session_id().unwrap().to_string()
}

#[tokio::test]
async fn test_filters_and_sort() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM people", people());
    let engine = open_engine(test_config(&dir), &warehouse);
    let id = people_session(&engine).await;

    let query = PageQuery::new(1, 10)
        .with_filter("city", vec!["paris".into(), "berlin".into()])
        .with_sort("name", SortOrder::Desc);
    let page = engine.read(&id, &query).unwrap();
    let names: Vec<&str> = page.rows.iter().map(|r| r[1].as_str()).collect();
    assert_eq!(names, vec!["eve", "cid", "bob", "ann"]);
    assert_eq!(page.total, 4);

    let query = PageQuery::new(1, 10).with_extended_filter(ExtendedFilter::new("age", FilterOp::Gt, 18));
    let page = engine.read(&id, &query).unwrap();
    assert_eq!(page.total, 3);

    let query = PageQuery::new(1, 10).with_extended_filter(ExtendedFilter::new(
        "age",
        FilterOp::IsNull,
        serde_json::Value::Null,
    ));
    let page = engine.read(&id, &query).unwrap();
    assert_eq!(page.rows.len(), 1);
    assert_eq!(page.rows[0][1], "bob");
    assert_eq!(page.rows[0][3], "");

    let query = PageQuery::new(1, 10).with_sort("nope", SortOrder::Asc);
    let err = engine.read(&id, &query).unwrap_err();
    assert!(matches!(err, EngineError::UnknownColumn(_)));
}

#[tokio::test]
async fn test_page_size_is_capped() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM t", Script::numbered(30));
    let engine = open_engine(test_config(&dir).with_max_page_size(8), &warehouse);

    let outcome = engine.execute("SELECT * FROM t", "alice", None).await.unwrap();
    let id = outcome.session_id().unwrap().to_string();

    let page = engine.read(&id, &PageQuery::new(0, 1_000)).unwrap();
    assert_eq!(page.page, 1);
    assert_eq!(page.page_size, 8);
    assert_eq!(page.rows.len(), 8);
    assert_eq!(page.total_pages, 4);
}

#[tokio::test]
async fn test_unique_values() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM people", people());
    let engine = open_engine(test_config(&dir).with_max_unique_limit(2), &warehouse);
    let id = people_session(&engine).await;

    let unique = engine.unique_values(&id, "city", 100, &ScanQuery::default()).unwrap();
    assert_eq!(unique.total_count, 3);
    assert_eq!(unique.values, vec!["berlin", "paris"]);
    assert!(unique.is_truncated);

    // empty cells are never offered as values
    let unique = engine.unique_values(&id, "age", 2, &ScanQuery::default()).unwrap();
    assert_eq!(unique.total_count, 4);
    assert!(!unique.values.contains(&String::new()));
}

#[tokio::test]
async fn test_read_unknown_session() {
    let dir = TempDir::new().unwrap();
    let engine = open_engine(test_config(&dir), &Warehouse::new());

    let err = engine
        .read("cache_ghost_20240101000000_001", &PageQuery::new(1, 10))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidSession);
}

// ==================== Lifecycle Tests ====================

#[tokio::test]
async fn test_cleanup_user() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM t", Script::numbered(3));
    let engine = open_engine(test_config(&dir), &warehouse);

    let first = engine.execute("SELECT * FROM t", "bob", None).await.unwrap();
    engine.execute("SELECT * FROM t", "bob", None).await.unwrap();
    engine.execute("SELECT * FROM t", "carol", None).await.unwrap();

    assert_eq!(engine.cleanup_user("bob").unwrap(), 2);
    assert!(engine.list_sessions("bob").is_empty());
    assert_eq!(engine.list_sessions("carol").len(), 1);
    assert!(!table_exists(&engine, first.session_id().unwrap()));
    assert_eq!(engine.coordinator().store().list_cache_tables().unwrap().len(), 1);

    // unknown ids are ignored
    engine.cleanup("cache_ghost_20240101000000_001").unwrap();
}

#[tokio::test]
async fn test_pool_leases_are_balanced() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM t", Script::numbered(25));
    warehouse.script("SELECT * FROM flaky", Script::numbered(25).failing_at(1));
    let engine = open_engine(test_config(&dir), &warehouse);

    engine.execute("SELECT * FROM t", "alice", None).await.unwrap();
    engine.execute("SELECT * FROM flaky", "alice", None).await.unwrap_err();
    engine.execute("SELECT * FROM missing", "alice", None).await.unwrap_err();
    assert!(engine.test_upstream().await);

    let pool = engine.stats().pool;
    assert!(pool.leases_issued > 0);
    assert_eq!(pool.leases_issued, pool.leases_released);
    assert_eq!(pool.leases_outstanding(), 0);
}

// ==================== Recovery Tests ====================

#[tokio::test]
async fn test_restart_recovery() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let now = Utc::now();
    let fresh_id = "cache_alice_20240101000000_001";
    let stale_id = "cache_alice_20240101000000_002";

    {
        let (cache, log) = store::open(&config.db_path).unwrap();
        let columns = vec!["id".to_string()];
        for (id, idle) in [(fresh_id, 10), (stale_id, 45 * 60)] {
            let mut session = Session::new(id, "alice", None, now - chrono::Duration::hours(1));
            session.status = SessionStatus::Active;
            session.total_rows = 100;
            session.processed_rows = 10;
            session.columns = columns.clone();
            session.last_progress_at = now - chrono::Duration::seconds(idle);
            log.upsert(&session).unwrap();

            cache.create_table(id, &columns).unwrap();
            let rows: Vec<_> = (0..10).map(|i| vec![Value::Int64(i)]).collect();
            cache.append_chunk(id, &rows).unwrap();
        }
    }

    let engine = open_engine(config, &Warehouse::new());
    assert_eq!(engine.status(fresh_id).unwrap().status, SessionStatus::Active);
    let stale = engine.status(stale_id).unwrap();
    assert_eq!(stale.status, SessionStatus::TimedOut);
    assert!(stale.error.is_some());

    // the recovered Active session keeps its rows readable
    assert_eq!(engine.read(fresh_id, &PageQuery::new(1, 5)).unwrap().total, 10);
    assert_eq!(engine.stats().running, 1);

    let report = engine.sweep_at(Utc::now()).unwrap();
    assert_eq!(report.tables_dropped, 1);
    assert!(table_exists(&engine, fresh_id));
    assert!(!table_exists(&engine, stale_id));
    // the registry row outlives the table until retention ends
    assert_eq!(engine.status(stale_id).unwrap().status, SessionStatus::TimedOut);
}

#[tokio::test]
async fn test_completed_sessions_survive_restart() {
    let dir = TempDir::new().unwrap();
    let warehouse = Warehouse::new();
    warehouse.script("SELECT * FROM t", Script::numbered(12));
    let config = test_config(&dir).with_sync_interval(Duration::from_secs(3600));

    let id = {
        let engine = open_engine(config.clone(), &warehouse);
        let outcome = engine.execute("SELECT * FROM t", "alice", None).await.unwrap();
        let id = outcome.session_id().unwrap().to_string();
        engine.shutdown().await.unwrap();
        id
    };

    let engine = open_engine(config, &warehouse);
    let status = engine.status(&id).unwrap();
    assert_eq!(status.status, SessionStatus::Completed);
    assert_eq!(status.processed, 12);
    assert_eq!(engine.read(&id, &PageQuery::new(1, 100)).unwrap().total, 12);
}
