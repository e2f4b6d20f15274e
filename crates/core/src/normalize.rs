//! Converts whatever a backend answered with into the canonical
//! chapters-plus-notes shape.

use serde_json::{Map, Value};

use crate::{
    error::NormalizationError,
    types::{Chapter, Note},
};

const TIMESTAMP_FIELDS: [&str; 3] = ["timestamp_original", "timestamp", "start_seconds"];
const PREVIEW_CHARS: usize = 120;

/// Raw backend output, tagged with the wire shape it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResponse {
    /// Body of a local model server `/api/generate` call.
    OllamaGenerate(Value),
    /// OpenAI-compatible chat completion body.
    ChatCompletion(Value),
    /// Plain generated text.
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub chapters: Vec<Chapter>,
    pub notes: Vec<Note>,
    pub warnings: Vec<String>,
}

pub fn normalize(raw: RawResponse) -> Result<Normalized, NormalizationError> {
    let text = response_text(raw)?;
    let object = extract_json_object(&text)?;
    normalize_object(object)
}

/// Pull the generated text out of a backend-specific envelope.
pub fn response_text(raw: RawResponse) -> Result<String, NormalizationError> {
    let text = match raw {
        RawResponse::Text(text) => text,
        RawResponse::OllamaGenerate(body) => body
            .get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| NormalizationError::UnexpectedShape {
                reason: "missing string field 'response'".to_string(),
            })?,
        RawResponse::ChatCompletion(body) => body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| NormalizationError::UnexpectedShape {
                reason: "missing 'choices[0].message.content'".to_string(),
            })?,
    };

    if text.trim().is_empty() {
        return Err(NormalizationError::EmptyResponse);
    }
    Ok(text)
}

/// Locate the JSON object in model output: the whole text, a fenced code
/// block, or the span between the first `{` and the last `}`.
pub fn extract_json_object(text: &str) -> Result<Map<String, Value>, NormalizationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(NormalizationError::EmptyResponse);
    }

    let candidate = if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return into_object(value);
    } else if let Some(block) = fenced_block(trimmed) {
        block
    } else {
        match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => {
                return Err(NormalizationError::NoJsonObject {
                    preview: trimmed.chars().take(PREVIEW_CHARS).collect(),
                });
            }
        }
    };

    let value = serde_json::from_str::<Value>(candidate.trim()).map_err(|e| {
        NormalizationError::InvalidJson {
            reason: e.to_string(),
        }
    })?;
    into_object(value)
}

fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_fence = &text[open + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

fn into_object(value: Value) -> Result<Map<String, Value>, NormalizationError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(NormalizationError::NotAnObject {
            found: type_name(&other),
        }),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Validate and repair a parsed response object. Repairs never fail the
/// call; each one leaves a warning.
pub fn normalize_object(mut object: Map<String, Value>) -> Result<Normalized, NormalizationError> {
    let mut warnings = Vec::new();

    let items = match object.remove("chapters") {
        None => return Err(NormalizationError::MissingChapters),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(NormalizationError::ChaptersNotArray {
                found: type_name(&other),
            });
        }
    };

    let mut chapters = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        if let Some(chapter) = parse_chapter(index, item, &mut warnings) {
            chapters.push(chapter);
        }
    }

    if !chapters
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp)
    {
        chapters.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        warnings.push("Chapters were out of order and have been sorted by timestamp".to_string());
    }

    let mut unique: Vec<Chapter> = Vec::with_capacity(chapters.len());
    for chapter in chapters {
        match unique.last() {
            Some(previous) if previous.timestamp == chapter.timestamp => {
                warnings.push(format!(
                    "Dropped duplicate chapter '{}' at {}s (kept '{}')",
                    chapter.title, chapter.timestamp, previous.title
                ));
            }
            _ => unique.push(chapter),
        }
    }

    if unique.is_empty() {
        return Err(NormalizationError::NoChapters);
    }

    let notes = parse_notes(object.remove("notes"), &mut warnings);

    Ok(Normalized {
        chapters: unique,
        notes,
        warnings,
    })
}

fn parse_chapter(index: usize, item: &Value, warnings: &mut Vec<String>) -> Option<Chapter> {
    let number = index + 1;
    let Some(fields) = item.as_object() else {
        warnings.push(format!(
            "Dropped chapter {number}: expected an object, got {}",
            type_name(item)
        ));
        return None;
    };

    let Some(raw_timestamp) = TIMESTAMP_FIELDS.iter().find_map(|f| fields.get(*f)) else {
        warnings.push(format!("Dropped chapter {number}: no timestamp field"));
        return None;
    };
    let timestamp = match parse_seconds(raw_timestamp) {
        Some(ts) if ts.is_finite() && ts >= 0.0 => ts,
        _ => {
            warnings.push(format!(
                "Dropped chapter {number}: invalid timestamp {raw_timestamp}"
            ));
            return None;
        }
    };

    let title = fields
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let title = match title {
        Some(title) => title.to_string(),
        None => {
            warnings.push(format!(
                "Chapter {number} at {timestamp}s had no title; using placeholder"
            ));
            format!("Chapter {number}")
        }
    };

    Some(Chapter { timestamp, title })
}

fn parse_seconds(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_notes(value: Option<Value>, warnings: &mut Vec<String>) -> Vec<Note> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => string_note(s).into_iter().collect(),
        Some(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match item {
                Value::Object(note) => Some(note),
                Value::String(s) => string_note(s),
                other => {
                    warnings.push(format!(
                        "Dropped note {}: expected an object, got {}",
                        index + 1,
                        type_name(&other)
                    ));
                    None
                }
            })
            .collect(),
        Some(other) => {
            warnings.push(format!(
                "Ignored notes: expected a list, got {}",
                type_name(&other)
            ));
            Vec::new()
        }
    }
}

fn string_note(details: String) -> Option<Note> {
    if details.trim().is_empty() {
        return None;
    }
    let mut note = Map::new();
    note.insert("details".to_string(), Value::String(details));
    Some(note)
}
