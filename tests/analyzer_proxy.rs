//! Analyzer proxy behavior against a scripted client: conversation
//! recording, transcript linking, and the specialized prompt variants.

mod common;

use std::sync::Arc;

use bson::doc;
use common::ScriptedClient;
use intelhub::ai::client::AiClient;
use intelhub::ai::types::AiError;
use intelhub::analyzer::{aggressive_by_ai, analyze_with_ai, generate_recommendation_by_ai};
use intelhub::conversation::ConversationRecorder;
use intelhub::prompts::{AGGRESSIVE_PROMPT, ANALYSIS_PROMPT, RECOMMENDATION_PROMPT};

fn recorder() -> (tempfile::TempDir, Arc<ConversationRecorder>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = Arc::new(ConversationRecorder::open(dir.path()).expect("recorder"));
    (dir, recorder)
}

#[tokio::test]
async fn analysis_records_transcript_and_links_it() {
    let (dir, recorder) = recorder();
    let client: Arc<dyn AiClient> =
        ScriptedClient::new(vec![Ok(r#"{"UUID": "a", "EVENT_TEXT": "body"}"#.to_string())]);

    let item = doc! { "UUID": "a", "informant": "https://x/1", "content": "raw body" };
    let response = analyze_with_ai(&client, &recorder, ANALYSIS_PROMPT, &item)
        .await
        .expect("analysis");

    assert_eq!(response.data["UUID"], "a");
    assert!(!response.json_repaired);
    assert_eq!(response.record_file, "analysis/analysis_1.txt");

    // The transcript holds the prompt, the built user message and the reply
    let transcript = std::fs::read_to_string(dir.path().join(&response.record_file)).unwrap();
    assert!(transcript.contains("## metadata"));
    assert!(transcript.contains("- informant: https://x/1"));
    assert!(transcript.contains("## content\nraw body"));
    assert!(transcript.contains(r#"{"UUID": "a", "EVENT_TEXT": "body"}"#));
}

#[tokio::test]
async fn analysis_propagates_provider_classification() {
    let (_dir, recorder) = recorder();
    let client: Arc<dyn AiClient> =
        ScriptedClient::new(vec![Err(AiError::from_status(400, "refused"))]);

    let item = doc! { "UUID": "a", "content": "raw body" };
    let error = analyze_with_ai(&client, &recorder, ANALYSIS_PROMPT, &item)
        .await
        .expect_err("must fail");
    assert_eq!(error.kind, intelhub::ai::types::AiErrorKind::Sensitive);
    assert_eq!(error.api_error_code, Some(400));
}

#[tokio::test]
async fn aggressive_variant_builds_history_table() {
    let (dir, recorder) = recorder();
    let client: Arc<dyn AiClient> =
        ScriptedClient::new(vec![Ok(r#"{"prior-uuid": 2}"#.to_string())]);

    let new_item = doc! { "EVENT_TITLE": "New event", "EVENT_BRIEF": "Brief text" };
    let history = vec![doc! {
        "UUID": "prior-uuid",
        "EVENT_TITLE": "Old event",
        "EVENT_BRIEF": "Old brief",
    }];
    let response = aggressive_by_ai(&client, &recorder, AGGRESSIVE_PROMPT, &new_item, &history)
        .await
        .expect("aggressive");
    assert_eq!(response.data["prior-uuid"], 2);

    let transcript = std::fs::read_to_string(dir.path().join(&response.record_file)).unwrap();
    assert!(transcript.contains("| prior-uuid | Old event | Old brief |"));
}

#[tokio::test]
async fn recommendation_variant_parses_ranked_list() {
    let (_dir, recorder) = recorder();
    let reply = r#"```json
[{"UUID": "a", "REASON": "broad impact"}]
```"#;
    let client: Arc<dyn AiClient> = ScriptedClient::new(vec![Ok(reply.to_string())]);

    let items = vec![doc! {
        "UUID": "a",
        "EVENT_TITLE": "T",
        "EVENT_BRIEF": "B",
        "APPENDIX": { "__MAX_RATE_SCORE__": 7 },
    }];
    let (value, record_file) =
        generate_recommendation_by_ai(&client, &recorder, RECOMMENDATION_PROMPT, &items)
            .await
            .expect("recommendation");
    assert_eq!(value[0]["UUID"], "a");
    assert_eq!(record_file, "recommendation/recommendation_1.txt");
}
