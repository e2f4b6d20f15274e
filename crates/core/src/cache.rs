use std::path::{Path, PathBuf};

use tokio::{fs, process::Command};
use uuid::Uuid;

use crate::error::{ChapterlyError, Result};

pub fn get_root_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("chapterly")
}

pub fn get_model_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join("models")
}

/// Write `bytes` to a sibling temp file and rename it over `path`, so readers
/// never observe a half-written file.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = part_path(path);
    if let Err(e) = fs::write(&temp_path, bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    Ok(())
}

/// Unique scratch path next to `path`; concurrent writers never share one.
pub fn part_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(".{}.{}.part", file_name, Uuid::new_v4().simple()))
}

/// Make sure `name` is present in the shared model cache, downloading it from
/// `url` when missing. Safe under concurrent runs: each downloader writes its
/// own temp file and the rename is atomic, so the cache only ever holds
/// complete files.
pub async fn ensure_model(model_dir: &Path, name: &str, url: &str) -> Result<PathBuf> {
    if !model_dir.exists() {
        fs::create_dir_all(model_dir).await?;
    }

    let model_path = model_dir.join(name);
    if model_path.exists() {
        return Ok(model_path);
    }

    let temp_path = part_path(&model_path);
    tracing::info!(model = name, url, "Downloading model into cache");

    let output = Command::new("curl")
        .arg("-fL")
        .arg(url)
        .arg("-o")
        .arg(&temp_path)
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let _ = fs::remove_file(&temp_path).await;
        return Err(ChapterlyError::ModelDownloadFailed {
            url: url.to_string(),
            reason: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    fs::rename(&temp_path, &model_path).await?;
    tracing::info!(path = %model_path.display(), "Model cached");

    Ok(model_path)
}

/// Where each stage of a run reads and writes its artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub audio: PathBuf,
    pub transcript: PathBuf,
    pub analysis: PathBuf,
    /// Model text of the first analysis pass.
    pub raw_response: PathBuf,
    pub notes: PathBuf,
    pub merged: PathBuf,
    pub subtitles: PathBuf,
}

impl ArtifactPaths {
    /// Artifacts go to `output_dir` when given, else next to the input.
    pub fn new(input: &Path, output_dir: Option<&Path>) -> Self {
        let dir = output_dir
            .map(Path::to_path_buf)
            .or_else(|| input.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());
        let ext = input
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mkv".to_string());

        Self {
            audio: dir.join(format!("{stem}.wav")),
            transcript: dir.join(format!("{stem}_transcript.json")),
            analysis: dir.join(format!("{stem}_chapters.json")),
            raw_response: dir.join(format!("{stem}_chapters_raw.txt")),
            notes: dir.join(format!("{stem}_notes.json")),
            merged: dir.join(format!("{stem}_chaptered.{ext}")),
            subtitles: dir.join(format!("{stem}_chaptered.srt")),
        }
    }

    /// Raw model text for `pass`; review passes get their own file beside
    /// the first pass's.
    pub fn raw_response_for(&self, pass: u32) -> PathBuf {
        if pass <= 1 {
            return self.raw_response.clone();
        }
        let base = self
            .raw_response
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.raw_response
            .with_file_name(format!("{base}_review_pass_{pass}.txt"))
    }
}
