use serde_json::json;

use crate::{
    format::format_transcript_with_timestamps,
    types::{AnalysisResult, Transcript},
};

const RESPONSE_FORMAT: &str = r#"{
  "chapters": [
    {"timestamp_original": 0.0, "timestamp_in_minutes": 0.0, "title": "Introduction"},
    {"timestamp_original": 120.0, "timestamp_in_minutes": 2.0, "title": "Main Discussion"},
    {"timestamp_original": 300.0, "timestamp_in_minutes": 5.0, "title": "Conclusion"}
  ],
  "notes": [
    {"timestamp_original": 0.0, "timestamp_in_minutes": 0.0, "person_name": "Dana", "details": "Switch the test workspace branch back to main after the PR merge."}
  ]
}"#;

const TIMESTAMP_RULES: &str = r#"CRITICAL RULES FOR TIMESTAMPS:
- Every transcript line starts with its [MM:SS] start time.
- "timestamp_original" is that marker converted to seconds (MM * 60 + SS) for the line where the topic begins.
- "timestamp_in_minutes" is the same moment in minutes.
- List chapters in ascending chronological order (earliest first).
- Each chapter must have a unique timestamp."#;

pub const SYSTEM_PROMPT: &str = "You analyze meeting transcripts and answer with a single JSON object only.";

pub fn analysis_prompt(transcript: &Transcript) -> String {
    format!(
        r#"Analyze the following timestamped meeting transcript and identify logical chapter boundaries.

For each chapter provide the start time in seconds and a concise, descriptive title.
Chapters should mark major topic changes. Aim for 3-80 chapters depending on length.

Also extract actionable instructions and tasks as "notes": technical steps, action items
assigned to people, setup or configuration steps, and sequential workflows. Include the
order of steps when the speakers mention it. Use an empty array when there are none.

{TIMESTAMP_RULES}

Return ONLY valid JSON in exactly this format, starting with {{ and ending with }}:
{RESPONSE_FORMAT}

Transcript:
{transcript}
"#,
        transcript = format_transcript_with_timestamps(transcript),
    )
}

pub fn review_prompt(prior: &AnalysisResult, transcript: &Transcript) -> String {
    let original = serde_json::to_string_pretty(&json!({
        "chapters": prior.chapters.iter().map(|c| json!({
            "timestamp_original": c.timestamp,
            "timestamp_in_minutes": (c.timestamp / 60.0 * 100.0).round() / 100.0,
            "title": c.title,
        })).collect::<Vec<_>>(),
        "notes": prior.notes,
    }))
    .unwrap_or_default();

    format!(
        r#"Here are the chapters and notes produced for the meeting transcript below. Review them and add what is missing.

ORIGINAL ANALYSIS RESULT:
{original}

Keep every correct chapter and note. Only add missing content: topic transitions that
were skipped, and actionable instructions, tasks or steps that were not captured.

{TIMESTAMP_RULES}

Return ONLY valid JSON in exactly this format, starting with {{ and ending with }}:
{RESPONSE_FORMAT}

TRANSCRIPT REFERENCE:
{transcript}
"#,
        transcript = format_transcript_with_timestamps(transcript),
    )
}
