use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::{fs, process::Command};

use super::{AudioExtractor, stderr_tail};
use crate::{cache::part_path, error::StageError};

/// Extracts 16 kHz mono PCM WAV, the format whisper expects.
#[derive(Debug, Clone, Default)]
pub struct FfmpegAudioExtractor;

impl FfmpegAudioExtractor {
    pub fn new() -> Self {
        Self
    }

    async fn has_audio_track(video: &Path) -> Result<bool, StageError> {
        let output = Command::new("ffprobe")
            .args(["-v", "error", "-select_streams", "a:0"])
            .args(["-show_entries", "stream=codec_type"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(video)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StageError::AudioExtractionFailed {
                video_path: video.to_path_buf(),
                reason: format!("failed to run ffprobe: {e}"),
            })?;

        Ok(String::from_utf8_lossy(&output.stdout)
            .to_lowercase()
            .contains("audio"))
    }
}

#[async_trait]
impl AudioExtractor for FfmpegAudioExtractor {
    async fn extract(&self, video: &Path, audio: &Path) -> Result<PathBuf, StageError> {
        let failed = |reason: String| StageError::AudioExtractionFailed {
            video_path: video.to_path_buf(),
            reason,
        };

        if !Self::has_audio_track(video).await? {
            return Err(failed("no audio track found".to_string()));
        }

        if let Some(parent) = audio.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StageError::fs(parent, e))?;
        }

        let temp_path = part_path(audio);
        let output = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(video)
            .arg("-vn")
            .args(["-ar", "16000", "-ac", "1", "-c:a", "pcm_s16le", "-f", "wav"])
            .arg(&temp_path)
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(failed(format!("failed to run ffmpeg: {e}")));
            }
        };
        if !output.status.success() {
            let _ = fs::remove_file(&temp_path).await;
            return Err(failed(stderr_tail(&output.stderr)));
        }

        fs::rename(&temp_path, audio)
            .await
            .map_err(|e| StageError::fs(audio, e))?;
        tracing::debug!(audio = %audio.display(), "Audio extracted");

        Ok(audio.to_path_buf())
    }
}
