//! Thin wrappers around the external tools each pipeline stage delegates to.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{
    error::StageError,
    types::{Chapter, Transcript},
};

mod extract;
mod merge;
mod transcribe;

pub use extract::FfmpegAudioExtractor;
pub use merge::{FfmpegChapterMerger, ffmetadata};
pub use transcribe::{WhisperTranscriber, whisper_model_url};

const AUDIO_EXTENSIONS: [&str; 6] = ["mp3", "wav", "flac", "m4a", "aac", "ogg"];
const VIDEO_EXTENSIONS: [&str; 5] = ["mkv", "mp4", "avi", "mov", "webm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Classify a file by extension, case-insensitively.
pub fn detect_media_kind(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Audio)
    } else {
        None
    }
}

#[async_trait]
pub trait AudioExtractor: Send + Sync {
    /// Write the audio track of `video` to `audio`, returning the written path.
    /// `video` is never modified.
    async fn extract(&self, video: &Path, audio: &Path) -> Result<PathBuf, StageError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> Result<Transcript, StageError>;
}

#[async_trait]
pub trait ChapterMerger: Send + Sync {
    /// Write a copy of `video` carrying `chapters` to `output`. `video` is
    /// never modified.
    async fn merge(
        &self,
        video: &Path,
        chapters: &[Chapter],
        output: &Path,
    ) -> Result<PathBuf, StageError>;
}

/// Last few lines of a tool's stderr, enough to explain a failure.
pub(crate) fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(5)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_media_kind_by_extension() {
        assert_eq!(detect_media_kind(Path::new("a/b.MKV")), Some(MediaKind::Video));
        assert_eq!(detect_media_kind(Path::new("talk.webm")), Some(MediaKind::Video));
        assert_eq!(detect_media_kind(Path::new("talk.m4a")), Some(MediaKind::Audio));
        assert_eq!(detect_media_kind(Path::new("notes.txt")), None);
        assert_eq!(detect_media_kind(Path::new("no_extension")), None);
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let stderr = b"one\n\ntwo\nthree\nfour\nfive\nsix\n";
        assert_eq!(stderr_tail(stderr), "two\nthree\nfour\nfive\nsix");
    }
}
