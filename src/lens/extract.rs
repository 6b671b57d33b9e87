use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::LensError;
use crate::lens::store;
use crate::lens::timeparse;

const PREVIEW_LEN: usize = 100;

/// Per-thread metadata row kept in the merged `thread_list.json`. Times are
/// carried raw (string or `{"$date": ...}` object) exactly as found in the
/// export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMeta {
    pub id: String,
    pub message_count: usize,
    #[serde(default)]
    pub first_message_time: Value,
    #[serde(default)]
    pub last_message_time: Value,
    #[serde(default)]
    pub preview: String,
}

#[derive(Debug, Default)]
pub struct ExtractOutcome {
    pub thread_count: usize,
    pub new_message_count: usize,
    pub thread_list: Vec<ThreadMeta>,
}

fn bracket_stamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([\d\-: ]+)\]").unwrap())
}

/// Load an exported chat file as a flat list of message objects. A single
/// object is wrapped into a one-element list; an object with a `messages`
/// array contributes that array. HTML disguised as JSON and unparseable
/// content are both upload errors.
pub fn load_chat_messages(path: &Path) -> Result<Vec<Value>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("read upload {}", path.display()))?;

    let trimmed = content.trim_start();
    if trimmed.starts_with("<!DOCTYPE") || trimmed.starts_with("<html") {
        return Err(LensError::InvalidUpload(
            "file appears to be HTML, not JSON".to_string(),
        )
        .into());
    }

    let data: Value = serde_json::from_str(&content)
        .map_err(|e| LensError::InvalidUpload(e.to_string()))?;

    Ok(match data {
        Value::Array(messages) => messages,
        Value::Object(mut obj) => match obj.remove("messages") {
            Some(Value::Array(messages)) => messages,
            _ => vec![Value::Object(obj)],
        },
        other => vec![other],
    })
}

/// Flatten a possibly-nested identifier to a plain string: a bare string,
/// a `{"$oid": "..."}` object, or a string holding that object stringified.
pub fn flatten_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            if s.starts_with("{\"$oid\":") {
                if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(s) {
                    if let Some(Value::String(oid)) = obj.get("$oid") {
                        return Some(oid.clone());
                    }
                }
            }
            Some(s.clone())
        }
        Value::Object(obj) => match obj.get("$oid") {
            Some(Value::String(oid)) => Some(oid.clone()),
            _ => None,
        },
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn thread_id_of(message: &Value) -> Option<String> {
    if let Some(id) = message.get("threadId").and_then(flatten_id) {
        return Some(id);
    }
    message.get("_id").and_then(flatten_id)
}

fn sanitize_for_filename(id: &str) -> String {
    id.replace(['/', '\\', ':'], "_")
}

/// String coercion of whatever timestamp the message carries, for ordering.
/// Never fails; messages without any stamp sort first.
fn sortable_time(message: &Value) -> String {
    let raw = message
        .get("createdAt")
        .or_else(|| message.get("timestamp"));
    time_value_as_string(raw)
}

pub(crate) fn time_value_as_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => match obj.get("$date") {
            Some(Value::String(s)) => s.clone(),
            _ => Value::Object(obj.clone()).to_string(),
        },
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn raw_time(message: &Value) -> Value {
    message
        .get("createdAt")
        .or_else(|| message.get("timestamp"))
        .cloned()
        .unwrap_or(Value::Null)
}

/// Render a message content field to plain text. String content passes
/// through; block lists render text blocks verbatim and known structured
/// block types as bracketed placeholders.
pub fn format_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => parts.push(s.clone()),
                    Value::Object(obj) => {
                        let block_type = obj.get("type").and_then(Value::as_str).unwrap_or("");
                        let rendered = match block_type {
                            "text" => obj
                                .get("text")
                                .and_then(Value::as_str)
                                .unwrap_or("[text]")
                                .to_string(),
                            "sketch_upload_request" => "[Sketch upload request]".to_string(),
                            "reference_candidates" => "[Reference candidates]".to_string(),
                            "reference_selection" => "[Reference selection]".to_string(),
                            "song_rendering_start" => "[Song rendering started]".to_string(),
                            "" => "[Unknown content]".to_string(),
                            other => format!("[{other}]"),
                        };
                        parts.push(rendered);
                    }
                    other => parts.push(other.to_string()),
                }
            }
            parts.join("\n")
        }
        other => other.to_string(),
    }
}

/// Render a sorted thread as the transcript format the analyzer consumes:
/// `"{ROLE}: {content}\n\n"` blocks with uppercased roles.
pub fn render_transcript(messages: &[Value]) -> String {
    let mut out = String::new();
    for msg in messages {
        let role = msg
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_uppercase();
        let content = format_content(msg.get("content").unwrap_or(&Value::Null));
        out.push_str(&format!("{role}: {content}\n\n"));
    }
    out
}

fn preview_of(messages: &[Value]) -> String {
    let content = messages
        .first()
        .map(|m| format_content(m.get("content").unwrap_or(&Value::Null)))
        .unwrap_or_default();
    if content.is_empty() {
        return "No content".to_string();
    }
    let cut: String = content.chars().take(PREVIEW_LEN).collect();
    format!("{cut}...")
}

fn load_processed_ids(path: &Path) -> BTreeSet<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return BTreeSet::new();
    };
    serde_json::from_str::<Vec<String>>(&content)
        .map(BTreeSet::from_iter)
        .unwrap_or_default()
}

fn merge_thread_list(path: &Path, fresh: Vec<ThreadMeta>) -> Vec<ThreadMeta> {
    let mut merged: Vec<ThreadMeta> = fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default();

    let known: BTreeSet<String> = merged.iter().map(|t| t.id.clone()).collect();
    for meta in fresh {
        if !known.contains(&meta.id) {
            merged.push(meta);
        }
    }

    merged.sort_by(|a, b| {
        let ka = time_value_as_string(Some(&a.last_message_time));
        let kb = time_value_as_string(Some(&b.last_message_time));
        kb.cmp(&ka)
    });
    merged
}

/// Group the uploaded file's messages into per-thread JSON and transcript
/// files under `threads_dir`. Messages already seen in earlier runs (tracked
/// by a durable id set next to `threads_dir`) are skipped, so re-uploading
/// the same export is a no-op. Messages without any resolvable thread id are
/// skipped without aborting the run.
pub fn extract_threads(file: &Path, threads_dir: &Path) -> Result<ExtractOutcome> {
    let messages = load_chat_messages(file)?;
    fs::create_dir_all(threads_dir)
        .with_context(|| format!("create threads dir {}", threads_dir.display()))?;

    let session_dir = threads_dir.parent().unwrap_or(threads_dir);
    let processed_ids_file = session_dir.join("processed_messages.json");
    let thread_list_file = session_dir.join("thread_list.json");

    let mut processed = load_processed_ids(&processed_ids_file);
    let mut threads: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut new_messages = 0usize;

    for mut message in messages {
        let msg_id = message.get("id").and_then(flatten_id);
        if let Some(ref id) = msg_id {
            if processed.contains(id) {
                continue;
            }
        }

        let Some(thread_id) = thread_id_of(&message) else {
            continue;
        };

        if message.get("createdAt").is_none() && message.get("timestamp").is_none() {
            let content = format_content(message.get("content").unwrap_or(&Value::Null));
            let stamp = bracket_stamp_re()
                .captures(&content)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(timeparse::now_iso);
            if let Some(obj) = message.as_object_mut() {
                obj.insert("timestamp".to_string(), Value::String(stamp));
            }
        }

        threads.entry(thread_id).or_default().push(message);
        if let Some(id) = msg_id {
            processed.insert(id);
            new_messages += 1;
        }
    }

    let mut thread_list = Vec::with_capacity(threads.len());
    let thread_count = threads.len();

    for (thread_id, mut msgs) in threads {
        msgs.sort_by_key(sortable_time);

        let first_time = msgs.first().map(raw_time).unwrap_or(Value::Null);
        let last_time = msgs.last().map(raw_time).unwrap_or(Value::Null);
        let safe_id = sanitize_for_filename(&thread_id);

        let thread_data = json!({
            "thread_id": thread_id,
            "messages": msgs,
            "first_message_time": first_time,
            "last_message_time": last_time,
            "message_count": msgs.len(),
        });
        store::write_json_atomic(&threads_dir.join(format!("{safe_id}.json")), &thread_data)?;

        let transcript = render_transcript(&msgs);
        fs::write(threads_dir.join(format!("{safe_id}.txt")), &transcript)
            .with_context(|| format!("write transcript for thread {safe_id}"))?;

        thread_list.push(ThreadMeta {
            id: safe_id,
            message_count: msgs.len(),
            first_message_time: first_time,
            last_message_time: last_time,
            preview: preview_of(&msgs),
        });
    }

    let merged = merge_thread_list(&thread_list_file, thread_list);
    store::write_json_atomic(&thread_list_file, &serde_json::to_value(&merged)?)?;

    let processed_list: Vec<&String> = processed.iter().collect();
    store::write_json_atomic(&processed_ids_file, &serde_json::to_value(processed_list)?)?;

    Ok(ExtractOutcome {
        thread_count,
        new_message_count: new_messages,
        thread_list: merged,
    })
}
