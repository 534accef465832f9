//! The intelligence-processing hub: the concurrent pipeline moving items
//! through submit -> dedupe -> cache -> AI analysis -> validate ->
//! post-process -> archive -> index, plus its scheduled jobs and the
//! public surface the transport layer calls.

pub mod queue;
pub mod stats;

mod post_process;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bson::{Bson, Document, doc};
use chrono::{Datelike, Duration as ChronoDuration, Local, Utc, Weekday};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::ai::{AiClientManager, ClientLease};
use crate::config::FulltextSource;
use crate::conversation::ConversationRecorder;
use crate::error::{Error, Result};
use crate::models::intelligence::{
    APPENDIX_ARCHIVED_FLAG, APPENDIX_MANUAL_RATING, APPENDIX_TIME_ARCHIVED, ArchiveFlag,
    FIELD_APPENDIX, FIELD_INFORMANT, FIELD_PUB_TIME, FIELD_TIME_GOT, FIELD_TOKEN, FIELD_UUID,
    informant_of, parse_flexible_time, str_field, validate_archived, validate_collected,
};
use crate::models::requests::{DbSelector, VectorSearchHit};
use crate::queries::IntelligenceQueryEngine;
use crate::queries::intelligence::QueryParams;
use crate::recommend::RecommendationManager;
use crate::scheduler::Scheduler;
use crate::storage::DocumentStore;
use crate::vector::VectorEngine;
use crate::vector::metadata::SearchFilter;

use queue::WorkQueue;
use stats::{HubCounters, HubStats};

/// The only blocking wait in the hot loops; keeps shutdown observable
/// within two seconds.
pub(crate) const QUEUE_POP_TIMEOUT: Duration = Duration::from_secs(1);

/// How long workers wait for the vector pipeline before proceeding anyway.
const VECTOR_GATE_TIMEOUT: Duration = Duration::from_secs(120);

const TASK_GENERATE_RECOMMENDATION: &str = "generate_recommendation_task";
const TASK_EXPORT_WEEKLY: &str = "export_mongodb_weekly_task";
const TASK_EXPORT_MONTHLY: &str = "export_mongodb_monthly_task";

#[derive(Debug, Clone)]
pub struct HubOptions {
    pub analysis_workers: usize,
    pub fulltext_source: FulltextSource,
    pub export_directory: PathBuf,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            analysis_workers: 3,
            fulltext_source: FulltextSource::Raw,
            export_directory: PathBuf::from("./_export"),
        }
    }
}

/// Point-in-time pipeline statistics.
#[derive(Debug, Clone, Serialize)]
pub struct HubStatistics {
    pub waiting_process: usize,
    pub post_process: usize,
    #[serde(flatten)]
    pub counters: HubCounters,
}

pub struct IntelligenceHub {
    pub(crate) cache_store: Option<Arc<DocumentStore>>,
    pub(crate) archive_store: Option<Arc<DocumentStore>>,
    pub(crate) cache_engine: Option<Arc<IntelligenceQueryEngine>>,
    pub(crate) archive_engine: Option<Arc<IntelligenceQueryEngine>>,
    pub(crate) recommendations: Option<Arc<RecommendationManager>>,
    pub(crate) clients: Arc<AiClientManager>,
    pub(crate) recorder: Arc<ConversationRecorder>,
    pub(crate) vector_engine: Option<Arc<VectorEngine>>,
    pub(crate) scheduler: Scheduler,

    pub(crate) original_queue: WorkQueue<Document>,
    pub(crate) unarchived_queue: WorkQueue<Document>,
    pub(crate) processed_queue: WorkQueue<Document>,
    pub(crate) stats: HubStats,
    pub(crate) options: HubOptions,

    shutdown_flag: AtomicBool,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    vector_gate: watch::Sender<bool>,
    pub(crate) vector_pipeline_enabled: AtomicBool,
    /// Join handles exist only for workers that actually started, so
    /// shutdown can never join a worker that was never spawned.
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl IntelligenceHub {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache_store: Option<Arc<DocumentStore>>,
        archive_store: Option<Arc<DocumentStore>>,
        recommendation_store: Option<Arc<DocumentStore>>,
        vector_engine: Option<Arc<VectorEngine>>,
        clients: Arc<AiClientManager>,
        recorder: Arc<ConversationRecorder>,
        shutdown_tx: broadcast::Sender<()>,
        options: HubOptions,
    ) -> Arc<Self> {
        let cache_engine = cache_store.clone().map(|s| Arc::new(IntelligenceQueryEngine::new(s)));
        let archive_engine = archive_store.clone().map(|s| Arc::new(IntelligenceQueryEngine::new(s)));
        let recommendations = archive_engine.clone().map(|engine| {
            Arc::new(RecommendationManager::new(
                engine,
                recommendation_store,
                clients.clone(),
                recorder.clone(),
            ))
        });

        let (vector_gate, _) = watch::channel(false);
        let hub = Arc::new(Self {
            cache_store,
            archive_store,
            cache_engine,
            archive_engine,
            recommendations,
            clients,
            recorder,
            vector_engine,
            scheduler: Scheduler::new(shutdown_tx.clone()),
            original_queue: WorkQueue::new(),
            unarchived_queue: WorkQueue::new(),
            processed_queue: WorkQueue::new(),
            stats: HubStats::default(),
            options,
            shutdown_flag: AtomicBool::new(false),
            shutdown_tx,
            vector_gate,
            vector_pipeline_enabled: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });
        tracing::info!("***** IntelligenceHub init complete *****");
        hub
    }

    // ------------------------------ Lifecycle ------------------------------

    /// Loads unarchived cache items, registers the scheduled jobs and
    /// starts the worker set.
    pub async fn startup(self: &Arc<Self>) {
        self.load_unarchived_data().await;
        self.init_scheduler();

        let mut workers = self.workers.lock();
        workers.push(tokio::spawn(post_process::vector_init_worker(self.clone())));
        for index in 0..self.options.analysis_workers {
            workers.push(tokio::spawn(worker::analysis_worker(self.clone(), index)));
        }
        workers.push(tokio::spawn(post_process::post_process_worker(self.clone())));
        tracing::info!(
            analysis_workers = self.options.analysis_workers,
            "Intelligence hub workers started"
        );
    }

    /// Drains the intake queue without processing, then joins the workers
    /// within the timeout and closes the store adapters. In-flight AI
    /// calls finish; their worker exits on the next iteration.
    pub async fn shutdown(&self, timeout: Duration) {
        tracing::info!("Intelligence hub shutting down...");
        self.shutdown_flag.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        self.scheduler.stop();

        let pending = self.original_queue.drain();
        if !pending.is_empty() {
            tracing::warn!(count = pending.len(), "Unprocessed items dropped at shutdown");
        }

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!("Workers did not stop within the shutdown timeout");
        }

        for store in [&self.cache_store, &self.archive_store].into_iter().flatten() {
            store.close().await;
        }
        tracing::info!("Intelligence hub has stopped.");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    // ---------------------------- Vector gating ----------------------------

    /// Fired exactly once by the vector-init worker, whether the pipeline
    /// came up enabled or not.
    pub(crate) fn signal_vector_gate(&self, enabled: bool) {
        self.vector_pipeline_enabled.store(enabled, Ordering::SeqCst);
        self.vector_gate.send_replace(true);
    }

    /// Waits for the vector gate; callers proceed regardless of outcome.
    pub(crate) async fn wait_vector_gate(&self, timeout: Duration) {
        if self.vector_engine.is_none() {
            return;
        }
        let mut rx = self.vector_gate.subscribe();
        let gate = async {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(timeout, gate).await.is_err() {
            tracing::warn!("Vector pipeline gate timed out, proceeding without it");
        }
    }

    pub(crate) fn vector_enabled(&self) -> bool {
        self.vector_engine.is_some() && self.vector_pipeline_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn vector_gate_timeout(&self) -> Duration {
        VECTOR_GATE_TIMEOUT
    }

    // ------------------------------ Submission ------------------------------

    /// Accepts a collected item. Domain failures are reported in the
    /// result, never raised.
    pub async fn submit_collected(&self, data: Document) -> crate::models::requests::SubmitResponse {
        use crate::models::requests::SubmitResponse;

        let uuid = str_field(&data, FIELD_UUID);
        match self.check_duplication(&data, false).await {
            Ok(true) => {
                let duplicate =
                    Error::Duplicate(format!("Collected message duplicated {}.", uuid));
                return SubmitResponse::fail(vec![display_domain_error(&duplicate)]);
            }
            Ok(false) => {}
            Err(e) => return SubmitResponse::fail(vec![display_domain_error(&e)]),
        }

        if let Err(e) = validate_collected(&data) {
            return SubmitResponse::fail(vec![display_domain_error(&e)]);
        }

        self.enqueue_collected(data).await;
        SubmitResponse::ok()
    }

    /// Accepts an externally-processed (already archived-form) item.
    pub async fn submit_archived(&self, data: Document) -> crate::models::requests::SubmitResponse {
        use crate::models::requests::SubmitResponse;

        let uuid = str_field(&data, FIELD_UUID);
        match self.check_duplication(&data, false).await {
            Ok(true) => {
                let duplicate =
                    Error::Duplicate(format!("Archived message duplicated {}.", uuid));
                return SubmitResponse::fail(vec![display_domain_error(&duplicate)]);
            }
            Ok(false) => {}
            Err(e) => return SubmitResponse::fail(vec![display_domain_error(&e)]),
        }

        if let Err(e) = validate_archived(&data) {
            return SubmitResponse::fail(vec![display_domain_error(&e)]);
        }

        match self.enqueue_processed(data) {
            Ok(()) => SubmitResponse::ok(),
            Err(e) => SubmitResponse::fail(vec![display_domain_error(&e)]),
        }
    }

    async fn enqueue_collected(&self, mut data: Document) {
        data.remove(FIELD_TOKEN);
        data.insert(
            FIELD_TIME_GOT,
            Bson::Double(Utc::now().timestamp_millis() as f64 / 1000.0),
        );

        if let Some(store) = &self.cache_store {
            if let Err(e) = store.insert(data.clone()).await {
                tracing::error!(error = %e, "Cache original data fail");
            }
        }
        self.original_queue.push(data);
    }

    /// Stamps the archive instant, applies the publication-time fallback
    /// and hands the record to the post-processor.
    pub(crate) fn enqueue_processed(&self, mut data: Document) -> Result<()> {
        let now = Utc::now();

        let pub_time = data
            .get(FIELD_PUB_TIME)
            .and_then(parse_flexible_time)
            .filter(|t| *t <= now)
            .unwrap_or(now);
        data.insert(FIELD_PUB_TIME, bson::DateTime::from_chrono(pub_time));

        let mut appendix = data
            .get_document(FIELD_APPENDIX)
            .cloned()
            .unwrap_or_default();
        appendix.insert(APPENDIX_TIME_ARCHIVED, bson::DateTime::from_chrono(now));
        data.insert(FIELD_APPENDIX, appendix);

        self.processed_queue.push(data);
        Ok(())
    }

    // ----------------------------- Duplication -----------------------------

    /// Duplication check: non-empty identifier, queue scans under their
    /// locks, then the archive store with `{UUID} OR {INFORMANT}` (the OR
    /// clause is built even when the informant is empty, preserved for
    /// compatibility).
    pub(crate) async fn check_duplication(
        &self,
        data: &Document,
        allow_empty_informant: bool,
    ) -> Result<bool> {
        let uuid = str_field(data, FIELD_UUID);
        if uuid.is_empty() {
            return Err(Error::Validation("No valid uuid.".to_string()));
        }
        let informant = informant_of(data);
        if !allow_empty_informant && informant.is_empty() {
            return Err(Error::Validation("No valid informant.".to_string()));
        }

        let matches = |doc: &Document| {
            str_field(doc, FIELD_UUID) == uuid
                || (!informant.is_empty() && informant_of(doc) == informant)
        };
        if self.original_queue.scan(matches)
            || self.unarchived_queue.scan(matches)
            || self.processed_queue.scan(matches)
        {
            return Ok(true);
        }

        if let Some(engine) = &self.archive_engine {
            let conditions = if informant.is_empty() {
                doc! { FIELD_UUID: &uuid }
            } else {
                doc! { FIELD_UUID: &uuid, FIELD_INFORMANT: &informant }
            };
            if engine.common_query(conditions, "$or").await?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---------------------------- Cache flagging ----------------------------

    /// Idempotent last-write-wins flag update on the cache record.
    pub(crate) async fn mark_cache_flag(&self, uuid: &str, flag: ArchiveFlag) {
        if uuid.is_empty() {
            return;
        }
        let Some(store) = &self.cache_store else {
            return;
        };
        let patch = doc! {
            format!("{}.{}", FIELD_APPENDIX, APPENDIX_ARCHIVED_FLAG): flag.as_str(),
        };
        if let Err(e) = store.update(doc! { FIELD_UUID: uuid }, patch).await {
            tracing::error!(uuid, flag = %flag, error = %e, "Mark archived flag fail");
        }
    }

    // --------------------------- Client acquisition ---------------------------

    /// Leases a client, retrying with jitter until one frees up or the
    /// hub shuts down. Logs every 10 failed attempts.
    pub(crate) async fn acquire_client(&self, owner: &str) -> Option<ClientLease> {
        let mut retries: u32 = 0;
        loop {
            if self.is_shutdown() {
                return None;
            }
            if let Some(lease) = self.clients.get_available_client(owner) {
                if retries > 0 {
                    tracing::info!(owner, retries, "Acquired AI client after waiting");
                }
                return Some(lease);
            }
            retries += 1;
            if retries % 10 == 0 {
                tracing::warn!(owner, retries, "Still waiting for an AI client");
            }
            let jitter_ms = rand::rng().random_range(0..500);
            tokio::time::sleep(Duration::from_millis(1000 + jitter_ms)).await;
        }
    }

    // ----------------------------- Startup loads -----------------------------

    /// Re-queues cache items without a terminal flag, recognizing both the
    /// legacy root-level flag layout and the appendix layout.
    async fn load_unarchived_data(&self) {
        let Some(store) = &self.cache_store else {
            return;
        };
        let query = doc! {
            "$and": [
                { APPENDIX_ARCHIVED_FLAG: { "$exists": false } },
                { format!("{}.{}", FIELD_APPENDIX, APPENDIX_ARCHIVED_FLAG): { "$exists": false } },
            ]
        };
        match store.find_many(query, None, 0, 0).await {
            Ok(documents) => {
                let count = documents.len();
                for document in documents {
                    self.unarchived_queue.push(document);
                }
                tracing::info!(count, "Unarchived data loaded");
            }
            Err(e) => tracing::error!(error = %e, "Loading unarchived data failed"),
        }
    }

    // --------------------------- Scheduled tasks ---------------------------

    fn init_scheduler(self: &Arc<Self>) {
        let hub = self.clone();
        let result = self.scheduler.add_hourly_task(
            TASK_GENERATE_RECOMMENDATION,
            Arc::new(move || {
                let hub = hub.clone();
                Box::pin(async move { hub.generate_recommendation_now().await })
            }),
        );
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to register recommendation task");
        }

        let hub = self.clone();
        let result = self.scheduler.add_weekly_task(
            TASK_EXPORT_WEEKLY,
            Weekday::Sun,
            Arc::new(move || {
                let hub = hub.clone();
                Box::pin(async move { hub.export_weekly().await })
            }),
        );
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to register weekly export task");
        }

        let hub = self.clone();
        let result = self.scheduler.add_monthly_task(
            TASK_EXPORT_MONTHLY,
            1,
            Arc::new(move || {
                let hub = hub.clone();
                Box::pin(async move { hub.export_monthly().await })
            }),
        );
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to register monthly export task");
        }

        // First digest shortly after startup
        if let Err(e) = self
            .scheduler
            .execute_task(TASK_GENERATE_RECOMMENDATION, Duration::from_secs(2))
        {
            tracing::error!(error = %e, "Failed to trigger initial recommendation");
        }
    }

    async fn generate_recommendation_now(&self) {
        let Some(manager) = &self.recommendations else {
            return;
        };
        let now = Utc::now();
        let period = (now - ChronoDuration::hours(24), now);
        match manager.generate(period, 6, 500).await {
            Ok(Some(r)) => tracing::info!(count = r.items.len(), "Recommendation generated"),
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "Recommendation generation failed"),
        }
    }

    /// Exports the current ISO week from the archive and cache stores.
    async fn export_weekly(&self) {
        let now = Local::now();
        let iso = now.date_naive().iso_week();
        for (store, time_field) in self.export_targets() {
            let directory = self.options.export_directory.join(store.name());
            if let Err(e) = store
                .export_by_week(iso.year(), iso.week(), &directory, time_field, true)
                .await
            {
                tracing::error!(collection = store.name(), error = %e, "Weekly export failed");
            }
        }
    }

    /// Exports the previous calendar month.
    async fn export_monthly(&self) {
        let now = Local::now();
        let (year, month) = if now.month() == 1 {
            (now.year() - 1, 12)
        } else {
            (now.year(), now.month() - 1)
        };
        for (store, time_field) in self.export_targets() {
            let directory = self.options.export_directory.join(store.name());
            if let Err(e) = store
                .export_by_month(year, month, &directory, time_field, true)
                .await
            {
                tracing::error!(collection = store.name(), error = %e, "Monthly export failed");
            }
        }
    }

    fn export_targets(&self) -> Vec<(Arc<DocumentStore>, &'static str)> {
        let mut targets = Vec::new();
        if let Some(store) = &self.archive_store {
            targets.push((store.clone(), "APPENDIX.__TIME_ARCHIVED__"));
        }
        if let Some(store) = &self.cache_store {
            targets.push((store.clone(), FIELD_TIME_GOT));
        }
        targets
    }

    // ------------------------------- Queries -------------------------------

    fn engine_for(&self, db: DbSelector) -> Result<&Arc<IntelligenceQueryEngine>> {
        let engine = match db {
            DbSelector::Cache => self.cache_engine.as_ref(),
            DbSelector::Archive => self.archive_engine.as_ref(),
        };
        engine.ok_or_else(|| {
            Error::ServiceUnavailable("Document store is not configured".to_string())
        })
    }

    pub async fn get_intelligence(
        &self,
        uuids: &[String],
        db: DbSelector,
    ) -> Result<Vec<serde_json::Value>> {
        self.engine_for(db)?.get(uuids).await
    }

    pub async fn query_intelligence(
        &self,
        db: DbSelector,
        params: QueryParams,
    ) -> Result<(Vec<serde_json::Value>, u64)> {
        self.engine_for(db)?.query(params).await
    }

    /// Semantic search over the summary and/or full-text collections.
    /// Results are collapsed to unique item ids carrying the best score
    /// across both collections, sorted by descending score.
    pub async fn vector_search(
        &self,
        text: &str,
        in_summary: bool,
        in_fulltext: bool,
        top_n: usize,
        score_threshold: f32,
        filter: SearchFilter,
    ) -> Result<Vec<VectorSearchHit>> {
        let Some(engine) = &self.vector_engine else {
            return Err(Error::ServiceUnavailable(
                "Vector service is not configured".to_string(),
            ));
        };

        let mut collections = Vec::new();
        if in_summary {
            collections.push(crate::models::intelligence::VECTOR_COLLECTION_SUMMARY);
        }
        if in_fulltext {
            collections.push(crate::models::intelligence::VECTOR_COLLECTION_FULL_TEXT);
        }

        let clauses = filter.to_clauses();
        let mut best: Vec<VectorSearchHit> = Vec::new();
        for collection in collections {
            let hits = engine
                .search(collection, text, top_n, score_threshold, clauses.clone())
                .await?;
            for hit in hits {
                match best.iter_mut().find(|b| b.id == hit.doc_id) {
                    Some(existing) => {
                        if hit.score > existing.score {
                            existing.score = hit.score;
                            existing.chunk_text = hit.content;
                        }
                    }
                    None => best.push(VectorSearchHit {
                        id: hit.doc_id,
                        score: hit.score,
                        chunk_text: hit.content,
                    }),
                }
            }
        }

        best.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(best)
    }

    pub async fn intelligence_summary(&self) -> Result<(u64, String)> {
        self.engine_for(DbSelector::Archive)?.summary().await
    }

    pub async fn aggregate(&self, pipeline: Vec<Document>) -> Result<Vec<serde_json::Value>> {
        let store = self
            .archive_store
            .as_ref()
            .ok_or_else(|| Error::ServiceUnavailable("Archive store not configured".to_string()))?;
        let documents = store.aggregate(pipeline).await?;
        Ok(documents
            .iter()
            .map(crate::storage::datetime::document_to_local_json)
            .collect())
    }

    pub async fn count_documents(&self, filter: Document) -> Result<u64> {
        let store = self
            .archive_store
            .as_ref()
            .ok_or_else(|| Error::ServiceUnavailable("Archive store not configured".to_string()))?;
        store.count(filter).await
    }

    pub async fn get_recommendations(&self) -> Result<Vec<serde_json::Value>> {
        match &self.recommendations {
            Some(manager) => manager.latest().await,
            None => Ok(Vec::new()),
        }
    }

    /// Manual rating override on an archived record.
    pub async fn submit_manual_rating(
        &self,
        uuid: &str,
        rating: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let store = self
            .archive_store
            .as_ref()
            .ok_or_else(|| Error::ServiceUnavailable("Archive store not configured".to_string()))?;
        let rating = bson::to_bson(&serde_json::Value::Object(rating))?;
        let patch = doc! {
            format!("{}.{}", FIELD_APPENDIX, APPENDIX_MANUAL_RATING): rating,
        };
        let (matched, _) = store.update(doc! { FIELD_UUID: uuid }, patch).await?;
        if matched == 0 {
            return Err(Error::NotFound(format!("No archived record for {}", uuid)));
        }
        Ok(())
    }

    pub fn statistics(&self) -> HubStatistics {
        HubStatistics {
            waiting_process: self.original_queue.len() + self.unarchived_queue.len(),
            post_process: self.processed_queue.len(),
            counters: self.stats.snapshot(),
        }
    }
}

/// Error text for the `{ok: false, errors: [...]}` envelope, without the
/// variant prefix the HTTP layer would add.
fn display_domain_error(error: &Error) -> String {
    match error {
        Error::Validation(msg) | Error::Duplicate(msg) => msg.clone(),
        other => other.to_string(),
    }
}
