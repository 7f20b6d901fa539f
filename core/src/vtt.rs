//! WebVTT subtitle output. Cues are sanitized on write: empty text skipped,
//! starts clamped to the previous end, every cue strictly positive length.

use std::io::Write;
use std::path::Path;

const EPS: f64 = 0.001;

/// One subtitle cue in seconds from session start.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// `hh:mm:ss.mmm` per the WebVTT timestamp grammar.
fn format_timestamp(sec: f64) -> String {
    let mut ms = (sec * 1000.0).round() as u64;
    let h = ms / 3_600_000;
    ms %= 3_600_000;
    let m = ms / 60_000;
    ms %= 60_000;
    let s = ms / 1000;
    ms %= 1000;
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

/// Drop empty cues and force ascending, non-overlapping, positive-length cues.
pub fn sanitize_cues(cues: &[Cue]) -> Vec<Cue> {
    let mut clean = Vec::with_capacity(cues.len());
    let mut last_end = 0.0f64;
    for cue in cues {
        let text = cue.text.trim();
        if text.is_empty() {
            continue;
        }
        let start = cue.start.max(last_end);
        let end = if cue.end <= start { start + EPS } else { cue.end };
        clean.push(Cue { start, end, text: text.to_string() });
        last_end = end;
    }
    clean
}

/// Write the sanitized cue list as a WebVTT file (parents created).
pub fn write_vtt(cues: &[Cue], path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    f.write_all(b"WEBVTT\n\n")?;
    for cue in sanitize_cues(cues) {
        writeln!(
            f,
            "{} --> {}\n{}\n",
            format_timestamp(cue.start),
            format_timestamp(cue.end),
            cue.text
        )?;
    }
    Ok(())
}
