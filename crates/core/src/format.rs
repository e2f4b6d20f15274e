use crate::types::{PipelineResult, RunState, Transcript};

/// Format seconds as MM:SS timestamp
pub fn format_timestamp(seconds: f64) -> String {
    let mins = (seconds / 60.0) as u32;
    let secs = (seconds % 60.0) as u32;
    format!("{:02}:{:02}", mins, secs)
}

/// Format transcript segments with timestamps
pub fn format_transcript_with_timestamps(transcript: &Transcript) -> String {
    transcript
        .segments
        .iter()
        .map(|seg| format!("[{}] {}", format_timestamp(seg.start), seg.text.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Human-readable run summary. A halted run names the failing stage first,
/// and every warning is listed on its own line.
pub fn format_result_readable(result: &PipelineResult) -> String {
    let mut output = String::new();

    match (&result.state, &result.error) {
        (_, Some(failure)) => {
            output.push_str(&format!("# Halted at stage {}\n\n", failure.stage));
            output.push_str(&format!("**Error:** {}\n\n", failure.message));
        }
        (RunState::Completed, None) if !result.warnings.is_empty() => {
            output.push_str("# Completed with warnings\n\n");
        }
        _ => output.push_str("# Completed\n\n"),
    }

    if let Some(provider) = &result.provider_used {
        output.push_str(&format!("**Analyzed by:** {}\n\n", provider));
    }

    if let Some(chapters) = &result.chapters {
        output.push_str("## Chapters\n\n");
        for chapter in chapters {
            output.push_str(&format!(
                "• [{}] {}\n",
                format_timestamp(chapter.timestamp),
                chapter.title
            ));
        }
        output.push('\n');
    }

    if !result.artifacts.is_empty() {
        output.push_str("## Artifacts\n\n");
        for (stage, artifact) in &result.artifacts {
            let note = if artifact.reused { " (reused)" } else { "" };
            output.push_str(&format!(
                "• {}: {}{}\n",
                stage,
                artifact.path.display(),
                note
            ));
        }
        if let Some(notes) = &result.notes_file {
            output.push_str(&format!("• notes: {}\n", notes.display()));
        }
        for raw in &result.raw_responses {
            output.push_str(&format!("• raw response: {}\n", raw.display()));
        }
        output.push('\n');
    }

    if !result.warnings.is_empty() {
        output.push_str(&format!("## Warnings ({})\n\n", result.warnings.len()));
        for (i, warning) in result.warnings.iter().enumerate() {
            output.push_str(&format!("{}. {}\n", i + 1, warning));
        }
        output.push('\n');
    }

    output
}
