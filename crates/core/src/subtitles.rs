use std::path::Path;

use crate::{cache::atomic_write, error::Result, types::Transcript};

/// SubRip timestamp, `HH:MM:SS,mmm`.
pub fn srt_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{hours:02}:{minutes:02}:{secs:02},{millis:03}")
}

/// Render transcript segments as SubRip cues. Blank segments are skipped
/// and cue numbers stay contiguous.
pub fn to_srt(transcript: &Transcript) -> String {
    let mut srt = String::new();
    let cues = transcript
        .segments
        .iter()
        .filter(|seg| !seg.text.trim().is_empty());

    for (index, seg) in cues.enumerate() {
        srt.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            index + 1,
            srt_timestamp(seg.start),
            srt_timestamp(seg.end),
            seg.text.trim()
        ));
    }
    srt
}

pub async fn write_srt(transcript: &Transcript, path: &Path) -> Result<()> {
    atomic_write(path, to_srt(transcript).as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Segment;

    #[test]
    fn srt_timestamp_formats_hours_and_millis() {
        assert_eq!(srt_timestamp(0.0), "00:00:00,000");
        assert_eq!(srt_timestamp(3725.042), "01:02:05,042");
    }

    #[test]
    fn to_srt_numbers_non_blank_cues() {
        let transcript = Transcript::from_segments(
            vec![
                Segment {
                    start: 0.0,
                    end: 1.5,
                    text: " Hello ".into(),
                },
                Segment {
                    start: 1.5,
                    end: 2.0,
                    text: "   ".into(),
                },
                Segment {
                    start: 2.0,
                    end: 4.25,
                    text: "World".into(),
                },
            ],
            "en",
        );

        assert_eq!(
            to_srt(&transcript),
            "1\n00:00:00,000 --> 00:00:01,500\nHello\n\n2\n00:00:02,000 --> 00:00:04,250\nWorld\n\n"
        );
    }

    #[tokio::test]
    async fn write_srt_persists_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.srt");
        let transcript = Transcript::from_segments(
            vec![Segment {
                start: 0.0,
                end: 1.0,
                text: "Hi".into(),
            }],
            "en",
        );
        write_srt(&transcript, &path).await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("1\n00:00:00,000"));
    }
}
