//! Product lifecycle operations driven through the engine facade.

mod common;

use chrono::Utc;

use common::{all_succeed, all_succeed_except, CallLog, Switchable, TestHarness};
use listing_engine::{
    EngineError, JobPriority, JobStatus, LogAction, Phase, PhaseOutput, PhaseStatus,
    PipelineStore, Product, ProductStatus, ValidationError,
};

#[tokio::test]
async fn manual_retry_after_permanent_failure() {
    let harness = TestHarness::new();
    let calls = CallLog::new();
    let pricing = Switchable::failing(&calls);
    let engine = harness.engine(all_succeed_except(&calls, Phase::Pricing, pricing.clone()));

    engine.submit_product("p", JobPriority::High).await.unwrap();
    engine.run_until_idle().await;
    assert_eq!(
        engine.store().get_product("p").await.unwrap().unwrap().status,
        ProductStatus::Error
    );

    pricing.set_failing(false);
    assert_eq!(engine.retry_failed_phase("p").await.unwrap(), Phase::Pricing);

    let store = engine.store();
    let product = store.get_product("p").await.unwrap().unwrap();
    assert_eq!(product.status, ProductStatus::Processing);
    assert!(!product.requires_manual_review);
    assert!(product.error_message.is_none());

    let phase = store.get_phase("p", Phase::Pricing).await.unwrap().unwrap();
    assert_eq!(phase.status, PhaseStatus::Pending);
    assert_eq!(phase.retry_count, 0);

    let job = store.active_job("p", Phase::Pricing).await.unwrap().unwrap();
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.priority, JobPriority::High);

    engine.run_until_idle().await;
    assert_eq!(calls.count("p", Phase::Pricing), 4);
    assert_eq!(
        store.get_product("p").await.unwrap().unwrap().status,
        ProductStatus::Completed
    );
    assert!(store
        .list_logs("p")
        .await
        .unwrap()
        .iter()
        .any(|l| l.action == LogAction::ManualRetry));
}

#[tokio::test]
async fn manual_retry_without_failure_is_rejected() {
    let harness = TestHarness::new();
    let engine = harness.engine(all_succeed(&CallLog::new()));
    engine.submit_product("p", JobPriority::Normal).await.unwrap();

    match engine.retry_failed_phase("p").await {
        Err(EngineError::Validation(ValidationError::NothingToRetry(id))) => assert_eq!(id, "p"),
        other => panic!("expected NothingToRetry, got {:?}", other),
    }
}

#[tokio::test]
async fn fix_stuck_phase_requeues_orphaned_running_phase() {
    let harness = TestHarness::new();
    let calls = CallLog::new();
    let engine = harness.engine(all_succeed(&calls));
    let store = engine.store();

    // Phase 1 completed through its output, phase 2 left running with no job.
    store
        .create_product(&Product::new("p", Utc::now()))
        .await
        .unwrap();
    store
        .save_phase_output(&PhaseOutput {
            product_id: "p".into(),
            phase: Phase::Recognition,
            payload: serde_json::json!({ "category": "lamps" }),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    assert!(store.complete_phase("p", Phase::Recognition).await.unwrap());
    assert!(store.start_phase("p", Phase::MarketResearch).await.unwrap());

    let fix = engine.fix_stuck_phases("p").await.unwrap();
    assert!(fix.repaired.is_empty());
    assert_eq!(fix.resumed, Some(Phase::MarketResearch));
    assert_eq!(
        store.get_product("p").await.unwrap().unwrap().status,
        ProductStatus::Processing
    );

    // Nothing more to do on a second call; the job is already active.
    let again = engine.fix_stuck_phases("p").await.unwrap();
    assert_eq!(again.resumed, None);

    engine.run_until_idle().await;
    assert_eq!(
        calls.phases_for("p"),
        vec![Phase::MarketResearch, Phase::Pricing, Phase::Seo]
    );
    assert_eq!(
        store.get_product("p").await.unwrap().unwrap().status,
        ProductStatus::Completed
    );
}

#[tokio::test]
async fn fix_stuck_phase_leaves_failed_phase_alone() {
    let harness = TestHarness::new();
    let calls = CallLog::new();
    let engine = harness.engine(all_succeed_except(
        &calls,
        Phase::Recognition,
        Switchable::failing(&calls),
    ));

    engine.submit_product("p", JobPriority::Normal).await.unwrap();
    engine.run_until_idle().await;

    let fix = engine.fix_stuck_phases("p").await.unwrap();
    assert!(fix.repaired.is_empty());
    assert_eq!(fix.resumed, None);
    assert!(engine
        .store()
        .active_job("p", Phase::Recognition)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn paused_product_keeps_its_pending_job() {
    let harness = TestHarness::new();
    let calls = CallLog::new();
    let engine = harness.engine(all_succeed(&calls));

    engine.submit_product("p", JobPriority::Normal).await.unwrap();
    engine.pause_product("p").await.unwrap();

    let product = engine.store().get_product("p").await.unwrap().unwrap();
    assert_eq!(product.status, ProductStatus::Paused);
    assert!(!product.is_pipeline_running);

    assert_eq!(engine.run_until_idle().await, 0);
    let job = engine
        .store()
        .active_job("p", Phase::Recognition)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    // Pausing twice is a state error, not a silent success.
    assert!(matches!(
        engine.pause_product("p").await,
        Err(EngineError::Validation(ValidationError::InvalidProductState { .. }))
    ));

    engine.resume_product("p").await.unwrap();
    engine.run_until_idle().await;
    assert_eq!(calls.total(), 4);
}

#[tokio::test]
async fn publish_requires_completed_pipeline() {
    let harness = TestHarness::new();
    let engine = harness.engine(all_succeed(&CallLog::new()));
    engine.submit_product("p", JobPriority::Normal).await.unwrap();

    assert!(engine.mark_published("p").await.is_err());
    engine.run_until_idle().await;
    engine.mark_published("p").await.unwrap();
    assert_eq!(
        engine.store().get_product("p").await.unwrap().unwrap().status,
        ProductStatus::Published
    );
}

#[tokio::test]
async fn started_engine_drains_work_in_background() {
    let harness = TestHarness::new();
    let calls = CallLog::new();
    let engine = harness.engine(all_succeed(&calls));
    let mut events = engine.subscribe();

    let handle = engine.start();
    engine.submit_product("p", JobPriority::Normal).await.unwrap();

    let finished = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            if let Ok(listing_engine::PipelineEvent::PipelineCompleted { product_id, .. }) =
                events.recv().await
            {
                return product_id;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(finished, "p");

    handle.shutdown().await.unwrap();
    assert_eq!(calls.total(), 4);
}
