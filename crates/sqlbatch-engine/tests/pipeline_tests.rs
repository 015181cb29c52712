//! End-to-end pipeline tests against a scripted source
//!
//! Each test builds a throwaway work directory, runs the configured stages and
//! inspects what landed on disk: partition files, run ledgers and the local
//! store.

mod common;

use common::{ledger_records, ScriptedConnector, Workspace};
use sqlbatch_engine::context::RunMode;
use sqlbatch_engine::error::EngineError;
use sqlbatch_engine::ledger::UnitStatus;
use sqlbatch_engine::pipeline::{run_pipeline, RunStatus, EXIT_PARTIAL, EXIT_STOPPED};
use sqlbatch_engine::store::LocalStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MONTHLY_JOB: &str = r#"
pipeline:
  stages: [export, load_local, report]
params:
  m: "202401,202402"
"#;

fn monthly_workspace() -> Workspace {
    Workspace::new(&[
        ("sales.sql", "select * from sales where m = '${m}';"),
        ("rate.sql", "select * from rate\n/"),
    ])
}

// ============================================================================
// Full Runs
// ============================================================================

#[tokio::test]
async fn test_run_exports_loads_and_reports() {
    let ws = monthly_workspace();
    let source = ScriptedConnector::new();
    source.rows_for("202401", 3);
    source.rows_for("202402", 4);

    let ctx = ws.context(ws.job(MONTHLY_JOB), RunMode::Run, CancellationToken::new());
    let report = run_pipeline(&ctx, Arc::new(source.clone())).await.unwrap();

    assert_eq!(report.status, RunStatus::Finished);
    assert_eq!(report.exit_code(), 0);
    let export = report.export.unwrap();
    assert_eq!(export.executed, 3);
    assert_eq!(export.rows, 3 + 4 + 3);

    assert_eq!(
        ws.export_files(),
        vec!["RATE.csv", "SALES__m=202401.csv", "SALES__m=202402.csv"]
    );
    // terminators never reach the source
    assert!(source.executed().iter().all(|sql| !sql.ends_with(';') && !sql.ends_with('/')));

    let load = report.load.unwrap();
    assert_eq!(load.loaded, 3);
    assert_eq!(load.views, 1);

    let store = LocalStore::open(&ws.path().join("data/local/result.sqlite")).unwrap();
    store.ensure_schema("job").unwrap();
    assert!(store.view_exists("job", "SALES").unwrap());
    assert_eq!(store.count_rows("job", "SALES").unwrap(), 7);
    assert_eq!(store.count_rows("job", "RATE").unwrap(), 3);

    let slow = report.report.unwrap();
    assert_eq!(slow.ok, 3);
    assert!(slow.slow_sql_file.unwrap().exists());

    let ledger = ledger_records(&ctx);
    assert_eq!(ledger.len(), 3);
    assert!(ledger.iter().all(|r| r.status == UnitStatus::Ok && r.host == common::HOST));
}

#[tokio::test]
async fn test_postwork_runs_after_load() {
    let ws = monthly_workspace();
    let postwork = ws.path().join("sql/postwork");
    std::fs::create_dir_all(&postwork).unwrap();
    std::fs::write(
        postwork.join("01_totals.sql"),
        "CREATE TABLE job.sales_total AS SELECT COUNT(*) AS n FROM job.SALES;",
    )
    .unwrap();
    std::fs::write(postwork.join("02_rates.sql"), "DELETE FROM job.RATE;").unwrap();

    let job = "pipeline:\n  stages: [export, load_local, postwork]\nparams:\n  m: \"202401,202402\"\n";
    let ctx = ws.context(ws.job(job), RunMode::Run, CancellationToken::new());
    let report = run_pipeline(&ctx, Arc::new(ScriptedConnector::new())).await.unwrap();

    assert_eq!(report.postwork.unwrap().executed, 2);
    let store = LocalStore::open(&ws.path().join("data/local/result.sqlite")).unwrap();
    store.ensure_schema("job").unwrap();
    assert_eq!(store.count_rows("job", "sales_total").unwrap(), 1);
    assert_eq!(store.count_rows("job", "RATE").unwrap(), 0);
}

#[tokio::test]
async fn test_failed_postwork_script_fails_the_run() {
    let ws = Workspace::new(&[("rate.sql", "select * from rate")]);
    let postwork = ws.path().join("sql/postwork");
    std::fs::create_dir_all(&postwork).unwrap();
    std::fs::write(postwork.join("bad.sql"), "SELECT * FROM job.NOPE;").unwrap();

    let job = "pipeline:\n  stages: [export, load_local, postwork]\n";
    let ctx = ws.context(ws.job(job), RunMode::Run, CancellationToken::new());
    let err = run_pipeline(&ctx, Arc::new(ScriptedConnector::new())).await.unwrap_err();

    assert!(matches!(err, EngineError::Postwork { .. }));
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let ws = monthly_workspace();
    let source = ScriptedConnector::new();

    let first = ws.context(ws.job(MONTHLY_JOB), RunMode::Run, CancellationToken::new());
    run_pipeline(&first, Arc::new(source.clone())).await.unwrap();
    assert_eq!(source.executed().len(), 3);
    source.clear_executed();

    let second = ws.context(ws.job(MONTHLY_JOB), RunMode::Run, CancellationToken::new());
    assert_ne!(first.run_id, second.run_id);
    let report = run_pipeline(&second, Arc::new(source.clone())).await.unwrap();

    assert!(source.executed().is_empty());
    assert_eq!(report.export.unwrap().skipped, 3);
    assert!(ledger_records(&second).is_empty());

    let load = report.load.unwrap();
    assert_eq!(load.loaded, 0);
    assert_eq!(load.skipped, 3);
}

#[tokio::test]
async fn test_overwrite_backs_up_previous_output() {
    let ws = Workspace::new(&[("rate.sql", "select * from rate")]);
    let job = "export:\n  overwrite: true\npipeline:\n  stages: [export]\n";
    let source = ScriptedConnector::new();

    for _ in 0..2 {
        let ctx = ws.context(ws.job(job), RunMode::Run, CancellationToken::new());
        run_pipeline(&ctx, Arc::new(source.clone())).await.unwrap();
    }

    assert_eq!(source.executed().len(), 2);
    let backups: Vec<_> = std::fs::read_dir(ws.export_dir().join("_backup"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(backups.len(), 1);
    assert!(backups[0].starts_with("RATE__"));
}

// ============================================================================
// Plan Mode and Configuration Failures
// ============================================================================

#[tokio::test]
async fn test_plan_mode_touches_no_store() {
    let ws = monthly_workspace();
    let source = ScriptedConnector::new();

    let ctx = ws.context(ws.job(MONTHLY_JOB), RunMode::Plan, CancellationToken::new());
    let report = run_pipeline(&ctx, Arc::new(source.clone())).await.unwrap();

    assert_eq!(report.exit_code(), 0);
    assert!(source.executed().is_empty());
    assert!(ws.export_files().is_empty());
    assert!(ledger_records(&ctx).is_empty());
    assert!(!ws.path().join("data/local/result.sqlite").exists());

    let plan = std::fs::read_to_string(ws.path().join("logs/plan_job_01.sql")).unwrap();
    assert_eq!(plan.matches("-- FILE: sales.sql").count(), 2);
    assert!(plan.contains("-- FILE: rate.sql"));
    assert!(plan.contains("where m = '202402'"));
}

#[tokio::test]
async fn test_expansion_failure_is_recorded_and_siblings_run() {
    let ws = Workspace::new(&[
        ("01_broken.sql", "select * from t where x = ${missing}"),
        ("02_rate.sql", "select * from rate"),
    ]);
    let source = ScriptedConnector::new();

    let ctx = ws.context(
        ws.job("pipeline:\n  stages: [export]\n"),
        RunMode::Run,
        CancellationToken::new(),
    );
    let report = run_pipeline(&ctx, Arc::new(source.clone())).await.unwrap();

    assert_eq!(report.exit_code(), EXIT_PARTIAL);
    assert_eq!(source.executed().len(), 1);

    let ledger = ledger_records(&ctx);
    let failed: Vec<_> = ledger.iter().filter(|r| r.status == UnitStatus::Fail).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].sql_file, "01_broken.sql");
    assert_eq!(failed[0].params, "-");
    assert!(failed[0].error_message.contains("missing"));
}

#[tokio::test]
async fn test_unknown_stage_fails_before_any_work() {
    let ws = monthly_workspace();
    let source = ScriptedConnector::new();

    let ctx = ws.context(
        ws.job("pipeline:\n  stages: [export, publish]\n"),
        RunMode::Run,
        CancellationToken::new(),
    );
    let err = run_pipeline(&ctx, Arc::new(source.clone())).await.unwrap_err();

    assert!(matches!(err, EngineError::UnknownStage(ref s) if s == "publish"));
    assert!(source.executed().is_empty());
}

// ============================================================================
// Failures, Retries and Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_reruns_only_failed_and_changed_units() {
    let ws = Workspace::new(&[
        ("01_a.sql", "select * from a"),
        ("02_b.sql", "select * from b"),
        ("03_c.sql", "select * from c"),
    ]);
    let job = "pipeline:\n  stages: [export]\n";
    let source = ScriptedConnector::new();
    source.fail_execute("from c", 3);

    let first = ws.context(ws.job(job), RunMode::Run, CancellationToken::new());
    let err = run_pipeline(&first, Arc::new(source.clone())).await.unwrap_err();
    assert!(matches!(err, EngineError::RetriesExhausted { attempts: 3, .. }));

    let statuses: Vec<_> = ledger_records(&first)
        .into_iter()
        .map(|r| (r.sql_file, r.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("01_a.sql".to_string(), UnitStatus::Ok),
            ("02_b.sql".to_string(), UnitStatus::Ok),
            ("03_c.sql".to_string(), UnitStatus::Fail),
        ]
    );

    ws.write_query("02_b.sql", "select b.* from b");
    source.clear_executed();

    let retry = ws.context(ws.job(job), RunMode::Retry, CancellationToken::new());
    let report = run_pipeline(&retry, Arc::new(source.clone())).await.unwrap();

    assert_eq!(source.executed(), vec!["select b.* from b", "select * from c"]);
    let export = report.export.unwrap();
    assert_eq!(export.executed, 2);
    assert_eq!(export.skipped, 1);
    assert_eq!(ledger_records(&retry).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_leaves_no_partial_file() {
    let ws = Workspace::new(&[("big.sql", "select * from big")]);
    let job = "pipeline:\n  stages: [export]\nexport:\n  fetch_size: 2\n";
    let source = ScriptedConnector::new();
    source.rows_for("big", 5);
    source.fail_fetch("big", 3);

    let ctx = ws.context(ws.job(job), RunMode::Run, CancellationToken::new());
    let err = run_pipeline(&ctx, Arc::new(source.clone())).await.unwrap_err();

    assert!(matches!(err, EngineError::RetriesExhausted { .. }));
    assert_eq!(source.executed().len(), 3);
    assert!(ws.export_files().is_empty());

    let ledger = ledger_records(&ctx);
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].status, UnitStatus::Fail);
    assert!(ledger[0].error_message.contains("scripted fetch failure"));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_fetch_is_retried() {
    let ws = Workspace::new(&[("slow.sql", "select * from slow")]);
    let job = "pipeline:\n  stages: [export]\nexport:\n  stall_seconds: 5\n";
    let source = ScriptedConnector::new();
    source.stall("slow", 1);

    let ctx = ws.context(ws.job(job), RunMode::Run, CancellationToken::new());
    let report = run_pipeline(&ctx, Arc::new(source.clone())).await.unwrap();

    assert_eq!(report.exit_code(), 0);
    assert_eq!(source.executed().len(), 2);
    assert_eq!(ws.export_files(), vec!["SLOW.csv"]);
    // the stalled connection was closed and the retry ran on a fresh one
    assert_eq!(source.connections(), (2, 2));

    let ledger = ledger_records(&ctx);
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].status, UnitStatus::Ok);
    assert_eq!(ledger[0].rows, 3);
}

#[tokio::test]
async fn test_cancellation_stops_dispatch() {
    let ws = Workspace::new(&[("sales.sql", "select * from sales where m = ${m}")]);
    let job = "pipeline:\n  stages: [export, load_local]\nparams:\n  m: \"1,2,3,4,5\"\n";

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    let source = ScriptedConnector::new().on_execute(move |_| signal.cancel());

    let ctx = ws.context(ws.job(job), RunMode::Run, cancel);
    let report = run_pipeline(&ctx, Arc::new(source.clone())).await.unwrap();

    assert_eq!(report.status, RunStatus::Stopped);
    assert_eq!(report.exit_code(), EXIT_STOPPED);
    assert!(report.load.is_none());

    // the in-flight unit finishes; nothing after the signal runs
    assert_eq!(source.executed(), vec!["select * from sales where m = 1"]);
    assert_eq!(ledger_records(&ctx).len(), 1);
    assert_eq!(ws.export_files(), vec!["SALES__m=1.csv"]);
}

#[tokio::test]
async fn test_cancellation_with_several_workers_drops_queued_units() {
    let ws = Workspace::new(&[("sales.sql", "select * from sales where m = ${m}")]);
    let job = "pipeline:\n  stages: [export]\nexport:\n  workers: 3\nparams:\n  m: \"1,2,3,4,5,6,7,8\"\n";

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    let seen = Arc::new(AtomicUsize::new(0));
    let source = ScriptedConnector::new().on_execute(move |_| {
        if seen.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
            signal.cancel();
        }
    });

    let ctx = ws.context(ws.job(job), RunMode::Run, cancel);
    let report = run_pipeline(&ctx, Arc::new(source.clone())).await.unwrap();
    assert_eq!(report.status, RunStatus::Stopped);

    // at most one unit per worker was past the check when the signal fired
    let executed = source.executed();
    assert!(executed.len() >= 2 && executed.len() <= 3, "{executed:?}");

    // every unit that started also finished and was recorded
    let ledger = ledger_records(&ctx);
    assert_eq!(ledger.len(), executed.len());
    assert!(ledger.iter().all(|r| r.status == UnitStatus::Ok));
    assert_eq!(ws.export_files().len(), executed.len());
}
