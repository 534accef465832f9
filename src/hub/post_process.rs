//! The post-processing worker (rate summary, vector indexing, archival)
//! and the vector pipeline initializer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::{Document, doc};
use chrono::Utc;

use crate::error::Result;
use crate::models::intelligence::{
    APPENDIX_MAX_RATE_CLASS, APPENDIX_MAX_RATE_SCORE, ArchiveFlag, FIELD_APPENDIX, FIELD_RATE,
    FIELD_UUID, FULL_TEXT_CHUNK_OVERLAP, FULL_TEXT_CHUNK_SIZE, SUMMARY_CHUNK_OVERLAP,
    SUMMARY_CHUNK_SIZE, VECTOR_COLLECTION_FULL_TEXT, VECTOR_COLLECTION_SUMMARY, compute_max_rate,
    str_field,
};
use crate::vector::metadata::{build_metadata, fulltext_text, summary_text};

use super::{IntelligenceHub, QUEUE_POP_TIMEOUT};

pub(crate) async fn post_process_worker(hub: Arc<IntelligenceHub>) {
    hub.wait_vector_gate(hub.vector_gate_timeout()).await;
    tracing::info!("Post-process worker started");

    while !hub.is_shutdown() {
        let Some(mut data) = hub.processed_queue.pop(QUEUE_POP_TIMEOUT).await else {
            continue;
        };
        let uuid = str_field(&data, FIELD_UUID);

        apply_max_rate(&mut data);

        match archive_and_index(&hub, &data).await {
            Ok(()) => {
                hub.stats.incr_archived();
                hub.mark_cache_flag(&uuid, ArchiveFlag::Archived).await;
                tracing::info!(%uuid, "Message archived");
            }
            Err(e) => {
                hub.stats.incr_error();
                tracing::error!(%uuid, error = %e, "Archive fail");
                hub.mark_cache_flag(&uuid, ArchiveFlag::Error).await;
            }
        }
    }

    tracing::info!("Post-process worker stopped");
}

/// Records the maximum-rating class and score in the appendix so queries
/// can filter without touching the full rate map.
fn apply_max_rate(data: &mut Document) {
    let rate = data
        .get_document(FIELD_RATE)
        .cloned()
        .unwrap_or_else(|_| doc! { "N/A": 0 });
    let (max_class, max_score) = compute_max_rate(&rate);

    let mut appendix = data
        .get_document(FIELD_APPENDIX)
        .cloned()
        .unwrap_or_default();
    appendix.insert(APPENDIX_MAX_RATE_CLASS, max_class);
    appendix.insert(APPENDIX_MAX_RATE_SCORE, max_score);
    data.insert(FIELD_APPENDIX, appendix);
}

async fn archive_and_index(hub: &Arc<IntelligenceHub>, data: &Document) -> Result<()> {
    let uuid = str_field(data, FIELD_UUID);

    if hub.vector_enabled() {
        if let Some(engine) = &hub.vector_engine {
            let clock = Instant::now();
            let metadata = build_metadata(data, Utc::now());

            let summary = summary_text(data);
            if !summary.is_empty() {
                engine
                    .upsert(VECTOR_COLLECTION_SUMMARY, &uuid, &summary, metadata.clone())
                    .await?;
            }

            let full_text = fulltext_text(data, hub.options.fulltext_source);
            if !full_text.is_empty() {
                engine
                    .upsert(VECTOR_COLLECTION_FULL_TEXT, &uuid, &full_text, metadata)
                    .await?;
            }

            tracing::debug!(
                %uuid,
                elapsed_ms = clock.elapsed().as_millis() as u64,
                "Message vectorized"
            );
        }
    }

    if let Some(store) = &hub.archive_store {
        store.insert(data.clone()).await?;
    }
    Ok(())
}

/// Polls the vector engine until its lifecycle settles, creates the two
/// intelligence collections, and fires the readiness gate exactly once.
/// On engine failure the gate still fires, with the pipeline disabled.
pub(crate) async fn vector_init_worker(hub: Arc<IntelligenceHub>) {
    let Some(engine) = hub.vector_engine.clone() else {
        hub.signal_vector_gate(false);
        return;
    };

    let clock = Instant::now();
    tracing::info!("Waiting for vector engine init...");
    loop {
        if hub.is_shutdown() {
            hub.signal_vector_gate(false);
            return;
        }
        match engine.state() {
            crate::vector::EngineState::Ready => {
                let setup = async {
                    engine
                        .ensure_repository(
                            VECTOR_COLLECTION_SUMMARY,
                            SUMMARY_CHUNK_SIZE,
                            SUMMARY_CHUNK_OVERLAP,
                        )
                        .await?;
                    engine
                        .ensure_repository(
                            VECTOR_COLLECTION_FULL_TEXT,
                            FULL_TEXT_CHUNK_SIZE,
                            FULL_TEXT_CHUNK_OVERLAP,
                        )
                        .await?;
                    Ok::<(), crate::error::Error>(())
                }
                .await;

                match setup {
                    Ok(()) => {
                        tracing::info!(
                            elapsed_ms = clock.elapsed().as_millis() as u64,
                            "Vector pipeline init successful"
                        );
                        hub.signal_vector_gate(true);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Vector collection setup failed");
                        hub.signal_vector_gate(false);
                    }
                }
                return;
            }
            crate::vector::EngineState::Error => {
                tracing::error!(
                    elapsed_s = clock.elapsed().as_secs(),
                    "Vector engine init failed, pipeline disabled"
                );
                hub.signal_vector_gate(false);
                return;
            }
            crate::vector::EngineState::Initializing => {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
