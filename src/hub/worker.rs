//! The AI analysis worker loop.

use std::sync::Arc;
use std::time::Duration;

use bson::Document;

use crate::ai::types::AiErrorKind;
use crate::analyzer::{AnalyzedResponse, analyze_with_ai};
use crate::models::intelligence::{
    ArchiveFlag, FIELD_EVENT_TEXT, FIELD_INFORMANT, FIELD_RAW_DATA, FIELD_SUBMITTER, FIELD_UUID,
    informant_of, str_field, validate_archived,
};
use crate::prompts::ANALYSIS_PROMPT;

use super::{IntelligenceHub, QUEUE_POP_TIMEOUT};

const MAX_ANALYSIS_ATTEMPTS: u32 = 3;
const BACKOFF_CAP_SECS: u64 = 30;

/// Why an item left the analysis stage without reaching the post-processor.
enum AnalysisFailure {
    /// Duplicate or no-value: flag `D`
    Drop(String),
    /// Provider refusal (HTTP 400): flag `S`
    Sensitive(String),
    /// Everything else: flag `E`, eligible for re-analysis
    Fatal(String),
}

pub(crate) async fn analysis_worker(hub: Arc<IntelligenceHub>, worker_index: usize) {
    // Give the vector pipeline a chance to come up, then run regardless
    hub.wait_vector_gate(hub.vector_gate_timeout()).await;
    tracing::info!(worker = worker_index, "Analysis worker started");

    while !hub.is_shutdown() {
        // Strict priority: the low-priority queue is only touched after
        // observing the high-priority queue empty in this iteration
        let item = match hub.original_queue.pop(QUEUE_POP_TIMEOUT).await {
            Some(item) => item,
            None => match hub.unarchived_queue.try_pop() {
                Some(item) => item,
                None => continue,
            },
        };
        process_item(&hub, item, worker_index).await;
    }

    tracing::info!(worker = worker_index, "Analysis worker stopped");
}

/// Runs one item through analysis. Every exit path writes the terminal
/// flag and updates the counters; the client lease releases on drop.
async fn process_item(hub: &Arc<IntelligenceHub>, mut item: Document, worker_index: usize) {
    let uuid = {
        let existing = str_field(&item, FIELD_UUID);
        if existing.is_empty() {
            let generated = uuid::Uuid::new_v4().to_string();
            item.insert(FIELD_UUID, generated.clone());
            generated
        } else {
            existing
        }
    };

    match analyze_item(hub, &item, worker_index).await {
        Ok(result) => {
            if let Err(e) = hub.enqueue_processed(result) {
                tracing::error!(worker = worker_index, %uuid, error = %e, "Enqueue archived data error");
                hub.stats.incr_error();
                hub.mark_cache_flag(&uuid, ArchiveFlag::Error).await;
            }
        }
        Err(AnalysisFailure::Drop(reason)) => {
            tracing::info!(worker = worker_index, %uuid, %reason, "Item dropped");
            hub.stats.incr_dropped();
            hub.mark_cache_flag(&uuid, ArchiveFlag::Dropped).await;
        }
        Err(AnalysisFailure::Sensitive(message)) => {
            tracing::warn!(worker = worker_index, %uuid, %message, "Item refused by provider");
            hub.stats.incr_error();
            hub.mark_cache_flag(&uuid, ArchiveFlag::Sensitive).await;
        }
        Err(AnalysisFailure::Fatal(message)) => {
            tracing::error!(worker = worker_index, %uuid, %message, "Analysis error");
            hub.stats.incr_error();
            hub.mark_cache_flag(&uuid, ArchiveFlag::Error).await;
        }
    }
}

async fn analyze_item(
    hub: &Arc<IntelligenceHub>,
    item: &Document,
    worker_index: usize,
) -> Result<Document, AnalysisFailure> {
    // Check duplication before spending tokens
    match hub.check_duplication(item, true).await {
        Ok(true) => return Err(AnalysisFailure::Drop("Article duplicated".to_string())),
        Ok(false) => {}
        Err(e) => return Err(AnalysisFailure::Fatal(format!("Duplication check failed: {}", e))),
    }

    let response = robust_analyze(hub, item, worker_index).await?;
    let mut result = response
        .to_document()
        .map_err(|e| AnalysisFailure::Fatal(format!("Result encoding failed: {}", e)))?;

    // No EVENT_TEXT means the model judged the article worthless
    if !result.contains_key(FIELD_EVENT_TEXT) {
        return Err(AnalysisFailure::Drop("Article has no value".to_string()));
    }

    // The model's identity fields are advisory; the originals win
    result.insert(FIELD_UUID, str_field(item, FIELD_UUID));
    let original_informant = informant_of(item);
    if !original_informant.is_empty() {
        result.insert(FIELD_INFORMANT, original_informant);
    }

    validate_archived(&result)
        .map_err(|e| AnalysisFailure::Fatal(format!("Result validation failed: {}", e)))?;

    result.insert(FIELD_RAW_DATA, item.clone());
    result.insert(FIELD_SUBMITTER, "Analysis Thread");
    Ok(result)
}

/// The retry wrapper around the analysis call: up to three attempts with
/// exponential backoff (1 s base, 30 s cap), retrying only transient
/// failures. A sensitive refusal short-circuits on first sight.
async fn robust_analyze(
    hub: &Arc<IntelligenceHub>,
    item: &Document,
    worker_index: usize,
) -> Result<AnalyzedResponse, AnalysisFailure> {
    let owner = format!("IntelligenceHub-{}", worker_index);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        if hub.is_shutdown() {
            return Err(AnalysisFailure::Fatal("Shutdown during analysis".to_string()));
        }

        let Some(lease) = hub.acquire_client(&owner).await else {
            return Err(AnalysisFailure::Fatal(
                "Shutdown while waiting for an AI client".to_string(),
            ));
        };
        let result = analyze_with_ai(lease.client(), &hub.recorder, ANALYSIS_PROMPT, item).await;
        drop(lease);

        match result {
            Ok(response) => {
                hub.stats.count_conversation(response.json_repaired, false);
                return Ok(response);
            }
            Err(error) => {
                hub.stats.count_conversation(false, true);
                match error.kind {
                    AiErrorKind::Sensitive => {
                        return Err(AnalysisFailure::Sensitive(error.message));
                    }
                    AiErrorKind::Transient if attempt < MAX_ANALYSIS_ATTEMPTS => {
                        let delay = (1u64 << (attempt - 1)).min(BACKOFF_CAP_SECS);
                        tracing::warn!(
                            worker = worker_index,
                            attempt,
                            delay_s = delay,
                            error = %error,
                            "Transient analysis failure, backing off"
                        );
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                    }
                    _ => {
                        return Err(AnalysisFailure::Fatal(format!(
                            "AI process error after all retries: {}",
                            error
                        )));
                    }
                }
            }
        }
    }
}
