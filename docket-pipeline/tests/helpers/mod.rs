//! Test helper utilities
//!
//! A [`TestEnv`] is a complete pipeline over file-backed stores in a temp
//! directory. Stage consumers are driven synchronously with [`TestEnv::drain`].

#![allow(dead_code)]

use async_trait::async_trait;
use docket_common::config::TomlConfig;
use docket_common::db::{init_archive_store, init_broker_store, init_pending_store, ConnectRetry};
use docket_common::events::EventBus;
use docket_common::messages::{AnalysisItem, Level, Recommendation, ScoreCard};
use docket_common::{Error, Result};
use docket_pipeline::broker::{Delivery, MessageBroker, SqliteBroker};
use docket_pipeline::coordinator::Coordinator;
use docket_pipeline::db::{Archive, Ledger};
use docket_pipeline::migration::MigrationEngine;
use docket_pipeline::stages::{FileTextExtractor, ItemOutcome, Scorer};
use docket_pipeline::staging::{StagingArea, Upload};
use docket_pipeline::workers::{Consumer, ExtractHandler, ScoreHandler, StoreHandler};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Target description long enough to pass validation
pub const TARGET: &str =
    "Senior backend engineer with Rust, async networking and SQLite experience for a pipeline team";

pub fn text_upload(name: &str, body: &str) -> Upload {
    Upload {
        filename: name.to_string(),
        bytes: body.as_bytes().to_vec(),
    }
}

/// An upload that passes validation but has no extractable text
pub fn blank_upload(name: &str) -> Upload {
    text_upload(name, "   \n\t\n")
}

pub fn score_card(item: &AnalysisItem, match_score: u8) -> ScoreCard {
    ScoreCard {
        item_id: item.item_id.clone(),
        display_name: item.display_name.clone(),
        subject_name: "Test Candidate".to_string(),
        match_score,
        summary_headline: format!("Scored {}", item.display_name),
        conceptual_matches: Vec::new(),
        skill_gaps: Vec::new(),
        experience_analysis: "n/a".to_string(),
        recommendation: Recommendation::ReviewNeeded,
        risk_assessment: Level::Low,
        email: None,
        phone: None,
        linkedin_url: None,
        github_url: None,
        portfolio_url: None,
    }
}

/// Scorer that records every item it sees. Scores by display name, default 50.
#[derive(Default)]
pub struct RecordingScorer {
    pub seen: Mutex<Vec<String>>,
    pub scores: HashMap<String, u8>,
}

impl RecordingScorer {
    pub fn with_scores(scores: &[(&str, u8)]) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            scores: scores.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scorer for RecordingScorer {
    async fn score(&self, _target_text: &str, item: &AnalysisItem) -> ItemOutcome<ScoreCard> {
        self.seen.lock().unwrap().push(item.item_id.clone());
        let score = self.scores.get(&item.display_name).copied().unwrap_or(50);
        ItemOutcome::Ok(score_card(item, score))
    }
}

/// Scorer whose endpoint is down
pub struct UnavailableScorer;

#[async_trait]
impl Scorer for UnavailableScorer {
    async fn score(&self, _target_text: &str, _item: &AnalysisItem) -> ItemOutcome<ScoreCard> {
        ItemOutcome::Fatal("scoring endpoint unreachable".to_string())
    }
}

/// SQLite broker whose publishes to one queue can be made to fail
pub struct FlakyBroker {
    inner: SqliteBroker,
    failing_queue: Mutex<Option<String>>,
}

impl FlakyBroker {
    pub fn fail_publishes_to(&self, queue: &str) {
        *self.failing_queue.lock().unwrap() = Some(queue.to_string());
    }

    pub fn heal(&self) {
        *self.failing_queue.lock().unwrap() = None;
    }
}

#[async_trait]
impl MessageBroker for FlakyBroker {
    async fn publish(&self, queue: &str, body: &str) -> Result<()> {
        let failing = self.failing_queue.lock().unwrap().clone();
        if failing.as_deref() == Some(queue) {
            return Err(Error::Connection("broker unavailable: injected failure".into()));
        }
        self.inner.publish(queue, body).await
    }

    async fn claim(&self, queue: &str, consumer: &str) -> Result<Option<Delivery>> {
        self.inner.claim(queue, consumer).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.inner.ack(delivery).await
    }

    async fn depth(&self, queue: &str) -> Result<u64> {
        self.inner.depth(queue).await
    }
}

pub struct TestEnv {
    pub dir: TempDir,
    pub config: TomlConfig,
    pub ledger: Ledger,
    pub archive: Archive,
    pub broker: Arc<FlakyBroker>,
    pub events: EventBus,
    pub coordinator: Coordinator,
    pub migration: MigrationEngine,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = TomlConfig {
            data_dir: dir.path().to_path_buf(),
            ..TomlConfig::default()
        };

        let ledger = Ledger::new(
            init_pending_store(&config.pending_db_path(), ConnectRetry::once())
                .await
                .unwrap(),
            config.stores.max_lock_wait_ms,
        );
        let archive = Archive::new(
            init_archive_store(&config.archive_db_path(), ConnectRetry::once())
                .await
                .unwrap(),
            config.stores.max_lock_wait_ms,
        );
        let broker = Arc::new(FlakyBroker {
            inner: SqliteBroker::new(
                init_broker_store(&config.broker_db_path(), ConnectRetry::once())
                    .await
                    .unwrap(),
                Duration::from_secs(60),
                config.stores.max_lock_wait_ms,
            ),
            failing_queue: Mutex::new(None),
        });
        let events = EventBus::new(100);
        let coordinator = Coordinator::new(
            ledger.clone(),
            archive.clone(),
            broker.clone(),
            StagingArea::new(config.staging_root(), config.limits.clone()),
            events.clone(),
        );
        let migration = MigrationEngine::new(ledger.clone(), archive.clone(), events.clone());

        Self {
            dir,
            config,
            ledger,
            archive,
            broker,
            events,
            coordinator,
            migration,
        }
    }

    /// A coordinator with its own connection pools on the same databases,
    /// as a separate worker process would have
    pub async fn second_coordinator(&self) -> Coordinator {
        let ledger = Ledger::new(
            init_pending_store(&self.config.pending_db_path(), ConnectRetry::once())
                .await
                .unwrap(),
            self.config.stores.max_lock_wait_ms,
        );
        let archive = Archive::new(
            init_archive_store(&self.config.archive_db_path(), ConnectRetry::once())
                .await
                .unwrap(),
            self.config.stores.max_lock_wait_ms,
        );
        let broker = SqliteBroker::new(
            init_broker_store(&self.config.broker_db_path(), ConnectRetry::once())
                .await
                .unwrap(),
            Duration::from_secs(60),
            self.config.stores.max_lock_wait_ms,
        );
        Coordinator::new(
            ledger,
            archive,
            Arc::new(broker),
            StagingArea::new(self.config.staging_root(), self.config.limits.clone()),
            EventBus::new(100),
        )
    }

    pub fn staging_dir(&self, job_id: &str) -> PathBuf {
        self.config.staging_root().join(job_id)
    }

    /// Number of job directories under the staging root
    pub fn staged_job_count(&self) -> usize {
        match std::fs::read_dir(self.config.staging_root()) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    /// Run every stage until all queues are empty
    pub async fn drain(&self, scorer: Arc<dyn Scorer>) {
        let broker: Arc<dyn MessageBroker> = self.broker.clone();
        let poll = Duration::from_millis(1);
        let consumers = [
            Consumer::new(
                broker.clone(),
                Arc::new(ExtractHandler::new(broker.clone(), Arc::new(FileTextExtractor::new()))),
                "extract-test",
                poll,
            ),
            Consumer::new(
                broker.clone(),
                Arc::new(ScoreHandler::new(broker.clone(), scorer, Duration::ZERO)),
                "score-test",
                poll,
            ),
            Consumer::new(
                broker.clone(),
                Arc::new(StoreHandler::new(self.coordinator.clone())),
                "store-test",
                poll,
            ),
        ];

        loop {
            let mut progressed = false;
            for consumer in &consumers {
                while consumer.run_once().await.unwrap().is_some() {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }
}
