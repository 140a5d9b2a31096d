//! Fan-in under redelivery and concurrent writers

mod helpers;

use docket_common::messages::{AnalysisItem, ResultMessage, WireMessage, RESULTS_QUEUE};
use docket_pipeline::broker::MessageBroker;
use docket_pipeline::models::{JobStatus, RecordOutcome};
use docket_pipeline::staging::item_id;
use docket_pipeline::workers::{ConsumeOutcome, Consumer, StoreHandler};
use helpers::{score_card, TestEnv, TARGET};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

const JOB: &str = "fanin-job-0001";

fn success(index: u64) -> ResultMessage {
    let item = AnalysisItem {
        item_id: item_id(JOB, index),
        display_name: format!("cv-{}.txt", index),
        extracted_text: "text".into(),
    };
    ResultMessage::success(JOB, "corr-1", score_card(&item, 70))
}

fn failure(index: u64) -> ResultMessage {
    ResultMessage::failure(JOB, "corr-1", item_id(JOB, index), format!("cv-{}.txt", index), "no extractable text")
}

#[tokio::test]
async fn test_redelivered_result_is_not_double_counted() {
    let env = TestEnv::new().await;
    env.ledger.create(JOB, "corr-1", TARGET, 2).await.unwrap();

    let first = env.coordinator.apply_result(&success(0)).await.unwrap();
    assert!(matches!(first.outcome, RecordOutcome::Applied(c) if c.success == 1));
    assert!(!first.completed);

    let again = env.coordinator.apply_result(&success(0)).await.unwrap();
    assert!(matches!(again.outcome, RecordOutcome::Duplicate(c) if c.processed() == 1));
    assert!(!again.completed);

    // Same item id with a different outcome is still a duplicate
    let conflicting = env.coordinator.apply_result(&failure(0)).await.unwrap();
    assert!(matches!(conflicting.outcome, RecordOutcome::Duplicate(_)));

    let last = env.coordinator.apply_result(&failure(1)).await.unwrap();
    assert!(last.completed);

    let job = env.ledger.get(JOB).await.unwrap();
    assert_eq!((job.results.len(), job.errors.len()), (1, 1));
    assert_eq!(job.status, JobStatus::Complete);

    // Redelivery after completion neither changes counts nor completes again
    let late = env.coordinator.apply_result(&success(1)).await.unwrap();
    assert!(!late.completed);
    assert!(matches!(late.outcome, RecordOutcome::Duplicate(_)));
}

#[tokio::test]
async fn test_result_beyond_expected_is_dropped() {
    let env = TestEnv::new().await;
    env.ledger.create(JOB, "corr-1", TARGET, 1).await.unwrap();
    env.coordinator.apply_result(&success(0)).await.unwrap();

    let broker: Arc<dyn MessageBroker> = env.broker.clone();
    broker.publish(RESULTS_QUEUE, &success(7).encode().unwrap()).await.unwrap();
    let consumer = Consumer::new(
        broker.clone(),
        Arc::new(StoreHandler::new(env.coordinator.clone())),
        "store-test",
        Duration::from_millis(1),
    );

    let outcome = consumer.run_once().await.unwrap();
    assert!(matches!(outcome, Some(ConsumeOutcome::Dropped(_))));
    assert_eq!(broker.depth(RESULTS_QUEUE).await.unwrap(), 0);
    assert_eq!(env.ledger.get(JOB).await.unwrap().counts().processed(), 1);
}

#[tokio::test]
async fn test_malformed_and_orphan_results_are_dropped_and_acked() {
    let env = TestEnv::new().await;
    let broker: Arc<dyn MessageBroker> = env.broker.clone();
    broker.publish(RESULTS_QUEUE, "{\"job_id\": 42}").await.unwrap();
    broker
        .publish(RESULTS_QUEUE, &success(0).encode().unwrap())
        .await
        .unwrap();

    let consumer = Consumer::new(
        broker.clone(),
        Arc::new(StoreHandler::new(env.coordinator.clone())),
        "store-test",
        Duration::from_millis(1),
    );
    assert!(matches!(consumer.run_once().await.unwrap(), Some(ConsumeOutcome::Dropped(_))));
    // No pending job for this result
    assert!(matches!(consumer.run_once().await.unwrap(), Some(ConsumeOutcome::Dropped(_))));
    assert_eq!(broker.depth(RESULTS_QUEUE).await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_final_results_complete_exactly_once() {
    let env = TestEnv::new().await;
    env.ledger.create(JOB, "corr-1", TARGET, 5).await.unwrap();
    for index in 0..3 {
        env.coordinator.apply_result(&success(index)).await.unwrap();
    }

    // Two "processes" with their own pools, each delivering both final
    // results several times
    let workers = [env.coordinator.clone(), env.second_coordinator().await];
    let mut join_set = JoinSet::new();
    for round in 0..4 {
        for (n, coordinator) in workers.iter().enumerate() {
            let coordinator = coordinator.clone();
            let message = if (round + n) % 2 == 0 { success(3) } else { failure(4) };
            join_set.spawn(async move { coordinator.apply_result(&message).await.unwrap() });
        }
    }

    let mut completions = 0;
    let mut applied = 0;
    while let Some(report) = join_set.join_next().await {
        let report = report.unwrap();
        if report.completed {
            completions += 1;
        }
        if matches!(report.outcome, RecordOutcome::Applied(_)) {
            applied += 1;
        }
    }

    assert_eq!(completions, 1, "completion must fire exactly once");
    assert_eq!(applied, 2, "each final item is applied once");

    let job = env.ledger.get(JOB).await.unwrap();
    assert_eq!(job.counts().processed(), 5);
    assert_eq!(job.status, JobStatus::Complete);
}

#[tokio::test]
async fn test_mark_complete_if_done_is_idempotent() {
    let env = TestEnv::new().await;
    env.ledger.create(JOB, "corr-1", TARGET, 1).await.unwrap();
    assert!(!env.ledger.mark_complete_if_done(JOB).await.unwrap());

    env.ledger
        .record_result(JOB, &docket_pipeline::models::ItemRecord::from_result(&success(0)))
        .await
        .unwrap();

    let mut join_set = JoinSet::new();
    for _ in 0..8 {
        let ledger = env.ledger.clone();
        join_set.spawn(async move { ledger.mark_complete_if_done(JOB).await.unwrap() });
    }
    let mut flips = 0;
    while let Some(flipped) = join_set.join_next().await {
        if flipped.unwrap() {
            flips += 1;
        }
    }
    assert_eq!(flips, 1);
}
