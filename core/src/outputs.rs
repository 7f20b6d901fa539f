//! Per-session text artifacts materialized from the event stream: one-line
//! rolling partial files, line-capped final transcripts, and WebVTT cues.
//! All writes are best-effort; I/O failures are logged and absorbed so the
//! pump never stalls on disk trouble.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::event::{Envelope, EventPayload};
use crate::paths::ensure_out_path;
use crate::vtt::{write_vtt, Cue};

/// A UTF-8 text file that keeps either exactly one line (partial drafts) or
/// the last `max_lines` lines (finals). Always ends with a trailing newline.
pub struct RollingTextFile {
    path: PathBuf,
    /// 0 = unbounded.
    max_lines: usize,
}

impl RollingTextFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path, max_lines: 0 }
    }

    pub fn with_max_lines(path: PathBuf, max_lines: usize) -> Self {
        Self { path, max_lines }
    }

    /// Truncate to empty (creating parents).
    pub fn reset(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, "")
    }

    /// Replace the whole file with a single line: the latest draft.
    pub fn rewrite_current_line(&self, text: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, format!("{}\n", text.trim_end()))
    }

    /// Append one finalized line, then trim the file to the last `max_lines`.
    pub fn append_final_line(&self, text: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existing = std::fs::read_to_string(&self.path).unwrap_or_default();
        let mut lines: Vec<&str> = existing.lines().filter(|l| !l.is_empty()).collect();
        let line = text.trim_end();
        lines.push(line);
        if self.max_lines > 0 && lines.len() > self.max_lines {
            let excess = lines.len() - self.max_lines;
            lines.drain(..excess);
        }
        let mut body = lines.join("\n");
        body.push('\n');
        std::fs::write(&self.path, body)
    }
}

/// All artifact writers for one session's run directory.
pub struct SessionOutputs {
    partial_en: RollingTextFile,
    partial_zh: RollingTextFile,
    final_en: RollingTextFile,
    final_zh: RollingTextFile,
    vtt_en_path: PathBuf,
    vtt_zh_path: PathBuf,
    cues_en: Vec<Cue>,
    cues_zh: Vec<Cue>,
    last_end_en: f64,
    last_end_zh: f64,
}

impl SessionOutputs {
    /// Lay out writers under `run_dir`, which must live inside `out_root`.
    pub fn new(out_root: &Path, run_dir: &Path, max_lines: usize) -> Result<Self> {
        let rel = run_dir.strip_prefix(out_root).unwrap_or(run_dir);
        let file = |name: &str| ensure_out_path(out_root, &rel.join(name));
        Ok(Self {
            partial_en: RollingTextFile::new(file("live.partial.en.txt")?),
            partial_zh: RollingTextFile::new(file("live.partial.zh.txt")?),
            final_en: RollingTextFile::with_max_lines(file("live.final.en.txt")?, max_lines),
            final_zh: RollingTextFile::with_max_lines(file("live.final.zh.txt")?, max_lines),
            vtt_en_path: file("live.final.en.vtt")?,
            vtt_zh_path: file("live.final.zh.vtt")?,
            cues_en: Vec::new(),
            cues_zh: Vec::new(),
            last_end_en: 0.0,
            last_end_zh: 0.0,
        })
    }

    /// Route one stamped event into the artifact files.
    pub fn apply(&mut self, env: &Envelope) {
        let outcome = match &env.payload {
            EventPayload::PartialEn { text } => self.partial_en.rewrite_current_line(text),
            EventPayload::PartialZh { text } => self.partial_zh.rewrite_current_line(text),
            EventPayload::FinalEn { text } => {
                self.push_cue_en(env.ts_session, text);
                self.partial_en
                    .rewrite_current_line("")
                    .and_then(|_| self.final_en.append_final_line(text))
                    .and_then(|_| write_vtt(&self.cues_en, &self.vtt_en_path))
            }
            EventPayload::FinalZh { text } => {
                self.push_cue_zh(env.ts_session, text);
                self.partial_zh
                    .rewrite_current_line("")
                    .and_then(|_| self.final_zh.append_final_line(text))
                    .and_then(|_| write_vtt(&self.cues_zh, &self.vtt_zh_path))
            }
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            eprintln!("[LiveCap] output write failed for {:?}: {e}", env.payload);
        }
    }

    fn push_cue_en(&mut self, end: f64, text: &str) {
        self.cues_en.push(Cue { start: self.last_end_en, end, text: text.to_string() });
        self.last_end_en = end.max(self.last_end_en);
    }

    fn push_cue_zh(&mut self, end: f64, text: &str) {
        self.cues_zh.push(Cue { start: self.last_end_zh, end, text: text.to_string() });
        self.last_end_zh = end.max(self.last_end_zh);
    }
}
