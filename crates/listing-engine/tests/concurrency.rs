//! Several workers sharing one database file.
//!
//! Each engine below gets its own connection, so claims only coordinate
//! through the guarded UPDATE, as separate processes would.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use common::{all_succeed, CallLog, TestHarness};
use listing_engine::{BackgroundJob, JobPriority, Phase, PipelineStore, Product, ProductStatus};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner() {
    let harness = TestHarness::new();
    harness
        .store
        .create_product(&Product::new("p", Utc::now()))
        .await
        .unwrap();
    let job = BackgroundJob::pending("p", Phase::Recognition, JobPriority::Normal, 3, Utc::now());
    assert!(harness.store.insert_job(&job).await.unwrap());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let store = Arc::new(harness.open_store());
        let job_id = job.id.clone();
        tasks.push(tokio::spawn(async move {
            store.claim_job(&job_id, &format!("worker-{}", i)).await.unwrap()
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        if let Some(claimed) = task.await.unwrap() {
            winners.push(claimed.worker_id);
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = harness.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.worker_id, winners[0]);
}

#[tokio::test]
async fn duplicate_enqueue_is_ignored() {
    let harness = TestHarness::new();
    let engine = harness.engine(all_succeed(&CallLog::new()));
    assert!(engine
        .submit_product("p", JobPriority::Normal)
        .await
        .unwrap()
        .is_enqueued());
    let again = engine
        .context()
        .scheduler
        .enqueue("p", Phase::Recognition, JobPriority::High)
        .await
        .unwrap();
    assert!(!again.is_enqueued());
    assert_eq!(engine.store().list_jobs("p").await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_engines_run_each_phase_once_and_in_order() {
    let harness = TestHarness::new();
    let calls = CallLog::new();
    let engines: Vec<_> = (0..3)
        .map(|_| Arc::new(harness.separate_engine(all_succeed(&calls))))
        .collect();

    let products: Vec<String> = (0..10).map(|i| format!("product-{}", i)).collect();
    for (i, id) in products.iter().enumerate() {
        let priority = if i % 2 == 0 { JobPriority::High } else { JobPriority::Low };
        engines[i % engines.len()]
            .submit_product(id, priority)
            .await
            .unwrap();
    }

    let runs: Vec<_> = engines
        .iter()
        .map(|engine| {
            let engine = Arc::clone(engine);
            tokio::spawn(async move { engine.run_until_idle().await })
        })
        .collect();
    for run in runs {
        run.await.unwrap();
    }
    // Follow-up phases enqueued after a peer went idle.
    engines[0].run_until_idle().await;

    let worker_ids: HashSet<_> = engines
        .iter()
        .map(|e| e.worker_pool().worker_id().to_string())
        .collect();
    assert_eq!(worker_ids.len(), 3);

    for id in &products {
        assert_eq!(calls.phases_for(id), Phase::ALL.to_vec(), "product {}", id);
        let product = harness.store.get_product(id).await.unwrap().unwrap();
        assert_eq!(product.status, ProductStatus::Completed);
        assert!(harness.store.active_job(id, Phase::Seo).await.unwrap().is_none());
    }
    assert_eq!(calls.total(), products.len() * 4);
}

#[tokio::test]
async fn running_phase_blocks_the_next_one() {
    let harness = TestHarness::new();
    let store = &harness.store;
    store
        .create_product(&Product::new("p", Utc::now()))
        .await
        .unwrap();

    // Phase 2 cannot start before phase 1 completes.
    assert!(!store.start_phase("p", Phase::MarketResearch).await.unwrap());
    assert!(store.start_phase("p", Phase::Recognition).await.unwrap());
    assert!(store.complete_phase("p", Phase::Recognition).await.unwrap());
    assert!(store.start_phase("p", Phase::MarketResearch).await.unwrap());
    // Phase 3 is still blocked while phase 2 runs.
    assert!(!store.start_phase("p", Phase::Pricing).await.unwrap());
}
