//! End-to-end pipeline scenarios over an in-memory hub: scripted AI
//! client, hash-embedder vector engine, no document stores.

mod common;

use std::time::Duration;

use common::{TestHub, collected_item, valid_analysis_reply};
use intelhub::ai::types::AiError;
use intelhub::models::intelligence::{
    VECTOR_COLLECTION_FULL_TEXT, VECTOR_COLLECTION_SUMMARY,
};

fn to_document(value: serde_json::Value) -> bson::Document {
    bson::to_document(&value).expect("object to document")
}

#[tokio::test]
async fn happy_path_archives_and_indexes() {
    let fixture = TestHub::start(vec![Ok(valid_analysis_reply("a"))]).await;

    let response = fixture
        .hub
        .submit_collected(to_document(collected_item("a", "https://x/1")))
        .await;
    assert!(response.ok, "submission must be accepted: {:?}", response.errors);

    assert!(
        fixture
            .wait_for(Duration::from_secs(10), |c| c.archived == 1)
            .await,
        "item must reach the archived counter"
    );

    // Both vector collections carry chunks for the parent id
    for collection in [VECTOR_COLLECTION_SUMMARY, VECTOR_COLLECTION_FULL_TEXT] {
        let repo = fixture.engine.get_repository(collection).expect("repo");
        assert!(
            repo.exists("a").expect("exists query"),
            "collection {} must hold chunks for 'a'",
            collection
        );
    }

    let stats = fixture.hub.statistics();
    assert_eq!(stats.counters.archived, 1);
    assert_eq!(stats.counters.dropped, 0);
    assert_eq!(stats.counters.error, 0);
    assert_eq!(stats.counters.conversation_total, 1);

    fixture.stop().await;
}

#[tokio::test]
async fn duplicate_submission_is_rejected() {
    // No workers: the first submission must still be queued when the
    // second arrives
    let fixture = TestHub::build(vec![]).await;

    let first = fixture
        .hub
        .submit_collected(to_document(collected_item("a", "https://x/1")))
        .await;
    assert!(first.ok);

    let second = fixture
        .hub
        .submit_collected(to_document(collected_item("a", "https://x/1")))
        .await;
    assert!(!second.ok);
    assert_eq!(second.errors, vec!["Collected message duplicated a.".to_string()]);
}

#[tokio::test]
async fn duplicate_informant_is_rejected() {
    let fixture = TestHub::build(vec![]).await;

    let first = fixture
        .hub
        .submit_collected(to_document(collected_item("a", "https://x/1")))
        .await;
    assert!(first.ok);

    // Different identifier, same origin
    let second = fixture
        .hub
        .submit_collected(to_document(collected_item("b", "https://x/1")))
        .await;
    assert!(!second.ok);
}

#[tokio::test]
async fn submission_without_uuid_or_informant_fails() {
    let fixture = TestHub::build(vec![]).await;

    let no_uuid = fixture
        .hub
        .submit_collected(to_document(serde_json::json!({
            "informant": "https://x/1",
            "content": "text",
        })))
        .await;
    assert!(!no_uuid.ok);
    assert_eq!(no_uuid.errors, vec!["No valid uuid.".to_string()]);

    let no_informant = fixture
        .hub
        .submit_collected(to_document(serde_json::json!({
            "UUID": "c",
            "content": "text",
        })))
        .await;
    assert!(!no_informant.ok);
    assert_eq!(no_informant.errors, vec!["No valid informant.".to_string()]);
}

#[tokio::test]
async fn no_value_response_is_dropped() {
    // The model answers without EVENT_TEXT: the article has no value
    let fixture = TestHub::start(vec![Ok(r#"{"UUID": "b"}"#.to_string())]).await;

    let response = fixture
        .hub
        .submit_collected(to_document(collected_item("b", "https://x/2")))
        .await;
    assert!(response.ok);

    assert!(
        fixture
            .wait_for(Duration::from_secs(10), |c| c.dropped == 1)
            .await,
        "item must be counted as dropped"
    );

    let stats = fixture.hub.statistics();
    assert_eq!(stats.counters.archived, 0);
    let repo = fixture
        .engine
        .get_repository(VECTOR_COLLECTION_SUMMARY)
        .expect("repo");
    assert!(!repo.exists("b").expect("exists query"), "no chunks for dropped items");

    fixture.stop().await;
}

#[tokio::test]
async fn sensitive_refusal_short_circuits() {
    // Three 400s scripted, but the loop must stop at the first one
    let fixture = TestHub::start(vec![
        Err(AiError::from_status(400, "policy refusal")),
        Err(AiError::from_status(400, "policy refusal")),
        Err(AiError::from_status(400, "policy refusal")),
    ])
    .await;

    let response = fixture
        .hub
        .submit_collected(to_document(collected_item("s", "https://x/3")))
        .await;
    assert!(response.ok);

    assert!(
        fixture
            .wait_for(Duration::from_secs(10), |c| c.error == 1)
            .await,
        "refusal must land in the error counter"
    );
    assert_eq!(fixture.client.call_count(), 1, "no retry after a 400");
    assert_eq!(fixture.hub.statistics().counters.archived, 0);

    fixture.stop().await;
}

#[tokio::test]
async fn transient_errors_retry_with_backoff_then_succeed() {
    let fixture = TestHub::start(vec![
        Err(AiError::from_status(503, "upstream flaky")),
        Err(AiError::from_status(503, "upstream flaky")),
        Ok(valid_analysis_reply("t")),
    ])
    .await;

    let response = fixture
        .hub
        .submit_collected(to_document(collected_item("t", "https://x/4")))
        .await;
    assert!(response.ok);

    assert!(
        fixture
            .wait_for(Duration::from_secs(30), |c| c.archived == 1)
            .await,
        "third attempt must archive the item"
    );

    assert_eq!(fixture.client.call_count(), 3, "total attempt count");
    let gaps = fixture.client.call_gaps();
    assert!(gaps[0] >= Duration::from_secs(1), "first backoff >= 1s, got {:?}", gaps[0]);
    assert!(gaps[1] >= Duration::from_secs(2), "second backoff >= 2s, got {:?}", gaps[1]);

    // Two failed conversations plus the successful one
    let stats = fixture.hub.statistics();
    assert_eq!(stats.counters.conversation_total, 3);
    assert_eq!(stats.counters.conversation_error, 2);

    fixture.stop().await;
}

#[tokio::test]
async fn transient_exhaustion_marks_error() {
    let fixture = TestHub::start(vec![
        Err(AiError::from_status(503, "down")),
        Err(AiError::from_status(503, "down")),
        Err(AiError::from_status(503, "down")),
    ])
    .await;

    let response = fixture
        .hub
        .submit_collected(to_document(collected_item("e", "https://x/5")))
        .await;
    assert!(response.ok);

    assert!(
        fixture
            .wait_for(Duration::from_secs(30), |c| c.error == 1)
            .await,
        "exhausted retries must land in the error counter"
    );
    assert_eq!(fixture.client.call_count(), 3);
    assert_eq!(fixture.hub.statistics().counters.archived, 0);

    fixture.stop().await;
}

#[tokio::test]
async fn repaired_json_counts_a_conversation_warning() {
    // Trailing comma and bare keys: parseable only through repair
    let almost_json = r#"{UUID: "r", EVENT_TITLE: "T", EVENT_BRIEF: "B",
        EVENT_TEXT: "Body of the event.", RATE: {ECONOMY: 5,},}"#;
    let fixture = TestHub::start(vec![Ok(almost_json.to_string())]).await;

    let response = fixture
        .hub
        .submit_collected(to_document(collected_item("r", "https://x/6")))
        .await;
    assert!(response.ok);

    assert!(
        fixture
            .wait_for(Duration::from_secs(10), |c| c.archived == 1)
            .await
    );
    assert_eq!(fixture.hub.statistics().counters.conversation_warning, 1);

    fixture.stop().await;
}
