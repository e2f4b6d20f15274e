use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::{fs, process::Command};

use super::{ChapterMerger, stderr_tail};
use crate::{cache::part_path, error::StageError, types::Chapter};

/// Embeds chapters as container metadata with a stream copy; no re-encode.
#[derive(Debug, Clone, Default)]
pub struct FfmpegChapterMerger;

impl FfmpegChapterMerger {
    pub fn new() -> Self {
        Self
    }

    async fn media_duration(video: &Path) -> Option<f64> {
        let output = Command::new("ffprobe")
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(video)
            .kill_on_drop(true)
            .output()
            .await
            .ok()?;
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }
}

fn escape_metadata(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '=' | ';' | '#' | '\\' | '\n') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Render chapters as an `FFMETADATA1` document. Each chapter ends where the
/// next starts; the last ends at `duration` when known.
pub fn ffmetadata(chapters: &[Chapter], duration: Option<f64>) -> String {
    let mut doc = String::from(";FFMETADATA1\n");
    for (i, chapter) in chapters.iter().enumerate() {
        let start_ms = (chapter.timestamp * 1000.0) as u64;
        let end_ms = match chapters.get(i + 1) {
            Some(next) => (next.timestamp * 1000.0) as u64,
            None => duration
                .map(|d| (d * 1000.0) as u64)
                .filter(|end| *end > start_ms)
                .unwrap_or(start_ms),
        };
        doc.push_str("\n[CHAPTER]\nTIMEBASE=1/1000\n");
        doc.push_str(&format!("START={start_ms}\nEND={end_ms}\n"));
        doc.push_str(&format!("title={}\n", escape_metadata(&chapter.title)));
    }
    doc
}

#[async_trait]
impl ChapterMerger for FfmpegChapterMerger {
    async fn merge(
        &self,
        video: &Path,
        chapters: &[Chapter],
        output: &Path,
    ) -> Result<PathBuf, StageError> {
        let failed = |reason: String| StageError::MergeFailed {
            video_path: video.to_path_buf(),
            reason,
        };

        let duration = Self::media_duration(video).await;
        let metadata_path = part_path(&output.with_extension("ffmeta"));
        fs::write(&metadata_path, ffmetadata(chapters, duration))
            .await
            .map_err(|e| StageError::fs(&metadata_path, e))?;

        // Keep the container extension so ffmpeg picks the right muxer.
        let ext = output
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mkv".to_string());
        let temp_output = part_path(output).with_extension(format!("part.{ext}"));

        let result = Command::new("ffmpeg")
            .arg("-i")
            .arg(video)
            .arg("-i")
            .arg(&metadata_path)
            .args(["-map", "0", "-map_metadata", "1", "-map_chapters", "1", "-codec", "copy", "-y"])
            .arg(&temp_output)
            .kill_on_drop(true)
            .output()
            .await;
        let _ = fs::remove_file(&metadata_path).await;

        let status = match result {
            Ok(status) => status,
            Err(e) => {
                let _ = fs::remove_file(&temp_output).await;
                return Err(failed(format!("failed to run ffmpeg: {e}")));
            }
        };
        if !status.status.success() {
            let _ = fs::remove_file(&temp_output).await;
            return Err(failed(stderr_tail(&status.stderr)));
        }

        fs::rename(&temp_output, output)
            .await
            .map_err(|e| StageError::fs(output, e))?;
        tracing::debug!(output = %output.display(), chapters = chapters.len(), "Chapters merged");

        Ok(output.to_path_buf())
    }
}
