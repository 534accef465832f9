//! Stateless analysis pipeline: prompt assembly, chat invocation, response
//! cleanup, JSON parsing with lenient repair, and conversation bookkeeping.

use std::sync::Arc;

use bson::{Bson, Document};

use crate::ai::client::AiClient;
use crate::ai::types::{AiError, ChatMessage};
use crate::conversation::ConversationRecorder;
use crate::error::{Error, Result};
use crate::models::intelligence::FIELD_CONTENT;

/// Output budget for every analysis call.
pub const MAX_OUTPUT_TOKENS: u32 = 8192;

/// A parsed model response with its transcript link.
#[derive(Debug, Clone)]
pub struct AnalyzedResponse {
    pub data: serde_json::Map<String, serde_json::Value>,
    pub record_file: String,
    pub json_repaired: bool,
}

impl AnalyzedResponse {
    /// The response as a BSON document, with the transcript link and the
    /// repair warning folded in as fields.
    pub fn to_document(&self) -> Result<Document> {
        let mut data = self.data.clone();
        data.insert(
            "record_file".to_string(),
            serde_json::Value::String(self.record_file.clone()),
        );
        if self.json_repaired {
            data.insert(
                "warning".to_string(),
                serde_json::Value::String("Json repaired.".to_string()),
            );
        }
        bson::to_document(&serde_json::Value::Object(data)).map_err(Error::from)
    }
}

/// Metadata fields rendered into the user message, in order.
const MESSAGE_METADATA_FIELDS: [&str; 5] = ["UUID", "title", "authors", "pub_time", "informant"];

/// Builds the user message: metadata as `- key: value` lines, body under a
/// `## content` header.
pub fn build_user_message(item: &Document) -> Result<String> {
    let content = match item.get(FIELD_CONTENT) {
        Some(Bson::String(s)) if !s.trim().is_empty() => s.trim(),
        _ => {
            return Err(Error::Validation(
                "Item has no content to analyze".to_string(),
            ));
        }
    };

    let mut lines = vec!["## metadata".to_string()];
    for field in MESSAGE_METADATA_FIELDS {
        if let Some(value) = item.get(field) {
            let rendered = render_metadata_value(value);
            if !rendered.is_empty() {
                lines.push(format!("- {}: {}", field, rendered));
            }
        }
    }
    Ok(format!("{}\n\n## content\n{}", lines.join("\n"), content))
}

fn render_metadata_value(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.trim().to_string(),
        Bson::Array(items) => items
            .iter()
            .map(render_metadata_value)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        Bson::DateTime(dt) => dt.to_chrono().to_rfc3339(),
        Bson::Null => String::new(),
        other => other.to_string(),
    }
}

/// Strips `<think>...</think>` segments and the `<answer>` wrapper.
pub fn extract_pure_response(text: &str) -> String {
    let mut text = text.to_string();
    while let (Some(start), Some(end_rel)) = (
        text.find("<think>"),
        text.find("<think>")
            .and_then(|s| text[s..].find("</think>").map(|e| s + e + "</think>".len())),
    ) {
        text = format!("{}{}", &text[..start], &text[end_rel..]);
    }
    text.replace("<answer>", "")
        .replace("</answer>", "")
        .trim()
        .to_string()
}

/// Strips a triple-backtick fence (with or without a `json` tag).
pub fn extract_pure_json_text(text: &str) -> String {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed);
    trimmed.trim().to_string()
}

/// Lenient JSON repair for almost-JSON model output. Tries, in order:
/// extracting the outer JSON value, stripping trailing commas, quoting
/// bare keys, and swapping single-quoted strings.
pub fn repair_json(text: &str) -> Option<serde_json::Value> {
    let candidate = extract_outer_json(text).unwrap_or_else(|| text.trim().to_string());

    let mut attempts = vec![candidate.clone()];
    let no_trailing = strip_trailing_commas(&candidate);
    attempts.push(no_trailing.clone());
    let quoted_keys = quote_bare_keys(&no_trailing);
    attempts.push(quoted_keys.clone());
    if !quoted_keys.contains('"') {
        attempts.push(quoted_keys.replace('\'', "\""));
    }

    attempts
        .into_iter()
        .find_map(|attempt| serde_json::from_str(&attempt).ok())
}

/// The first balanced `{...}` or `[...]` region of the text.
fn extract_outer_json(text: &str) -> Option<String> {
    let start = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let open = bytes[start] as char;
    let close = if open == '{' { '}' } else { ']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

static TRAILING_COMMA_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r",\s*([}\]])").expect("static pattern"));

static BARE_KEY_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).expect("static pattern")
});

fn strip_trailing_commas(text: &str) -> String {
    TRAILING_COMMA_RE.replace_all(text, "$1").to_string()
}

fn quote_bare_keys(text: &str) -> String {
    BARE_KEY_RE.replace_all(text, "$1\"$2\":").to_string()
}

/// Parses a cleaned assistant reply into a JSON object. Repaired results
/// are flagged; unparseable ones are a transient provider error.
fn parse_reply(reply: &str) -> std::result::Result<(serde_json::Map<String, serde_json::Value>, bool), AiError> {
    let answer = extract_pure_response(reply);
    let json_text = extract_pure_json_text(&answer);

    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(&json_text) {
        return Ok((map, false));
    }

    tracing::warn!("AI reply is not strict JSON, attempting repair");
    match repair_json(&json_text) {
        Some(serde_json::Value::Object(map)) => {
            tracing::info!("JSON repair succeeded");
            Ok((map, true))
        }
        _ => Err(AiError::transient("Cannot parse AI response to JSON")),
    }
}

async fn record_exchange(
    recorder: &Arc<ConversationRecorder>,
    category: &'static str,
    messages: &[ChatMessage],
    reply: &str,
) -> String {
    let recorder = recorder.clone();
    let messages = messages.to_vec();
    let reply = reply.to_string();
    let recorded = tokio::task::spawn_blocking(move || {
        recorder.record(category, &messages, Some(&reply))
    })
    .await;

    match recorded {
        Ok(Ok(record)) => record.rel_path,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Failed to record conversation");
            String::new()
        }
        Err(e) => {
            tracing::error!(error = %e, "Conversation record task failed");
            String::new()
        }
    }
}

async fn chat_and_parse(
    client: &Arc<dyn AiClient>,
    recorder: &Arc<ConversationRecorder>,
    category: &'static str,
    messages: Vec<ChatMessage>,
) -> std::result::Result<AnalyzedResponse, AiError> {
    let started = std::time::Instant::now();
    let response = client.chat(&messages, 0.0, MAX_OUTPUT_TOKENS).await?;
    tracing::debug!(
        client = client.name(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "AI response received"
    );

    let record_file = record_exchange(recorder, category, &messages, &response.content).await;

    match parse_reply(&response.content) {
        Ok((data, json_repaired)) => {
            tracing::debug!(category, %record_file, "AI conversation successful");
            Ok(AnalyzedResponse {
                data,
                record_file,
                json_repaired,
            })
        }
        Err(e) => {
            tracing::error!(category, %record_file, error = %e, "AI conversation failed");
            Err(e)
        }
    }
}

/// Runs the analysis prompt over one collected item.
pub async fn analyze_with_ai(
    client: &Arc<dyn AiClient>,
    recorder: &Arc<ConversationRecorder>,
    prompt: &str,
    item: &Document,
) -> std::result::Result<AnalyzedResponse, AiError> {
    let user_message = build_user_message(item).map_err(|e| AiError::terminal(e.to_string()))?;
    let messages = vec![ChatMessage::system(prompt), ChatMessage::user(user_message)];
    chat_and_parse(client, recorder, "analysis", messages).await
}

/// Runs the correlation prompt over a new item plus a history table.
pub async fn aggressive_by_ai(
    client: &Arc<dyn AiClient>,
    recorder: &Arc<ConversationRecorder>,
    prompt: &str,
    new_item: &Document,
    history: &[Document],
) -> std::result::Result<AnalyzedResponse, AiError> {
    let new_text = format!(
        "{}\n\n{}\n\n",
        new_item.get_str("EVENT_TITLE").unwrap_or_default(),
        new_item.get_str("EVENT_BRIEF").unwrap_or_default(),
    );
    let history_table =
        documents_to_markdown(history, &["UUID", "EVENT_TITLE", "EVENT_BRIEF"]);
    let user_message = format!("# new intelligence\n{}# history\n{}", new_text, history_table);
    let messages = vec![ChatMessage::system(prompt), ChatMessage::user(user_message)];
    chat_and_parse(client, recorder, "aggressive", messages).await
}

/// Runs the recommendation prompt over a table of archived items.
/// Returns the parsed JSON value (usually an array) and the record path.
pub async fn generate_recommendation_by_ai(
    client: &Arc<dyn AiClient>,
    recorder: &Arc<ConversationRecorder>,
    prompt: &str,
    items: &[Document],
) -> std::result::Result<(serde_json::Value, String), AiError> {
    let table = documents_to_markdown(
        items,
        &["UUID", "EVENT_TITLE", "EVENT_BRIEF", "__MAX_RATE_SCORE__"],
    );
    let messages = vec![ChatMessage::system(prompt), ChatMessage::user(table)];

    let response = client.chat(&messages, 0.0, MAX_OUTPUT_TOKENS).await?;
    let record_file = record_exchange(recorder, "recommendation", &messages, &response.content).await;

    let answer = extract_pure_response(&response.content);
    let json_text = extract_pure_json_text(&answer);
    let value = serde_json::from_str(&json_text)
        .ok()
        .or_else(|| repair_json(&json_text))
        .ok_or_else(|| AiError::transient("Cannot parse recommendation response"))?;
    Ok((value, record_file))
}

/// Renders documents as a markdown table over the given columns. Values
/// come from the top level or from `APPENDIX` as a fallback.
pub fn documents_to_markdown(documents: &[Document], columns: &[&str]) -> String {
    let mut out = String::new();
    out.push_str(&format!("| {} |\n", columns.join(" | ")));
    out.push_str(&format!(
        "|{}\n",
        columns.iter().map(|_| " --- |").collect::<String>()
    ));
    for doc in documents {
        let row: Vec<String> = columns
            .iter()
            .map(|column| {
                let value = doc.get(*column).or_else(|| {
                    doc.get_document("APPENDIX")
                        .ok()
                        .and_then(|appendix| appendix.get(*column))
                });
                value.map(render_metadata_value).unwrap_or_default()
            })
            .collect();
        out.push_str(&format!("| {} |\n", row.join(" | ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_build_user_message_layout() {
        let item = doc! {
            "UUID": "a",
            "title": "Test Title",
            "authors": ["One", "Two"],
            "informant": "https://x/1",
            "content": "body text here",
        };
        let message = build_user_message(&item).unwrap();
        assert!(message.starts_with("## metadata\n"));
        assert!(message.contains("- UUID: a"));
        assert!(message.contains("- authors: One, Two"));
        assert!(message.contains("- informant: https://x/1"));
        assert!(message.ends_with("## content\nbody text here"));
    }

    #[test]
    fn test_build_user_message_requires_content() {
        let item = doc! { "UUID": "a" };
        assert!(build_user_message(&item).is_err());
    }

    #[test]
    fn test_extract_pure_response_strips_think_blocks() {
        let text = "<think>reasoning...</think><answer>{\"a\": 1}</answer>";
        assert_eq!(extract_pure_response(text), "{\"a\": 1}");

        let multi = "<think>x</think>A<think>y</think>B";
        assert_eq!(extract_pure_response(multi), "AB");
    }

    #[test]
    fn test_extract_pure_json_text_strips_fences() {
        assert_eq!(extract_pure_json_text("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_pure_json_text("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_pure_json_text("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_repair_trailing_commas() {
        let repaired = repair_json("{\"a\": 1, \"b\": [1, 2,],}").unwrap();
        assert_eq!(repaired["b"], serde_json::json!([1, 2]));
    }

    #[test]
    fn test_repair_bare_keys() {
        let repaired = repair_json("{UUID: \"a\", RATE: {ECONOMY: 5}}").unwrap();
        assert_eq!(repaired["UUID"], "a");
        assert_eq!(repaired["RATE"]["ECONOMY"], 5);
    }

    #[test]
    fn test_repair_extracts_embedded_object() {
        let text = "Sure, here is the JSON you asked for: {\"a\": 1} Hope it helps!";
        let repaired = repair_json(text).unwrap();
        assert_eq!(repaired["a"], 1);
    }

    #[test]
    fn test_repair_single_quotes() {
        let repaired = repair_json("{'a': 'x'}").unwrap();
        assert_eq!(repaired["a"], "x");
    }

    #[test]
    fn test_repair_gives_up_on_garbage() {
        assert!(repair_json("not json at all").is_none());
    }

    #[test]
    fn test_parse_reply_happy_and_repaired() {
        let (data, repaired) = parse_reply("{\"UUID\": \"a\"}").unwrap();
        assert_eq!(data["UUID"], "a");
        assert!(!repaired);

        let (_, repaired) = parse_reply("{UUID: \"a\",}").unwrap();
        assert!(repaired);

        assert!(parse_reply("complete nonsense").is_err());
    }

    #[test]
    fn test_documents_to_markdown_reads_appendix_fallback() {
        let docs = vec![doc! {
            "UUID": "a",
            "EVENT_TITLE": "T",
            "EVENT_BRIEF": "B",
            "APPENDIX": { "__MAX_RATE_SCORE__": 7 },
        }];
        let table = documents_to_markdown(
            &docs,
            &["UUID", "EVENT_TITLE", "EVENT_BRIEF", "__MAX_RATE_SCORE__"],
        );
        assert!(table.contains("| a | T | B | 7 |"));
    }

    #[test]
    fn test_analyzed_response_to_document_folds_in_bookkeeping() {
        let mut data = serde_json::Map::new();
        data.insert("UUID".to_string(), serde_json::json!("a"));
        let response = AnalyzedResponse {
            data,
            record_file: "analysis/analysis_1.txt".to_string(),
            json_repaired: true,
        };
        let doc = response.to_document().unwrap();
        assert_eq!(doc.get_str("UUID").unwrap(), "a");
        assert_eq!(doc.get_str("record_file").unwrap(), "analysis/analysis_1.txt");
        assert_eq!(doc.get_str("warning").unwrap(), "Json repaired.");
    }
}
