//! Model discovery and ASR capability probing.
//!
//! Discovery scans the local model directory (CTranslate2 checkouts) and the
//! Hugging Face cache for MT checkpoints. The capability probe inspects a
//! model's vocabulary for `<|xx|>` language tokens, maps them to BCP-47, and
//! caches the report keyed by the model path's mtime; unknown models fall back
//! to a curated table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;

/// One discoverable model, as listed by /models/asr and /models/mt.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Whisper-size aliases that resolve without a local checkout.
const ASR_ALIASES: &[&str] = &["tiny.en", "tiny", "base.en", "base", "small.en", "small", "medium", "large-v3"];

/// Whisper language token -> BCP-47. Subset covering the languages the MT
/// side can target; everything else falls through the probe unmapped.
const WHISPER_LANG_TO_BCP47: &[(&str, &str)] = &[
    ("en", "en"),
    ("zh", "zh-Hans"),
    ("es", "es"),
    ("fr", "fr"),
    ("de", "de"),
    ("ja", "ja"),
    ("ko", "ko"),
    ("ru", "ru"),
    ("pt", "pt"),
    ("it", "it"),
    ("nl", "nl"),
    ("tr", "tr"),
    ("pl", "pl"),
    ("ar", "ar"),
    ("hi", "hi"),
    ("id", "id"),
    ("uk", "uk"),
    ("vi", "vi"),
    ("th", "th"),
    ("cs", "cs"),
    ("ro", "ro"),
    ("sv", "sv"),
    ("hu", "hu"),
    ("el", "el"),
    ("da", "da"),
    ("fi", "fi"),
    ("no", "no"),
    ("he", "he"),
    ("fa", "fa"),
    ("ms", "ms"),
    ("bn", "bn"),
    ("ta", "ta"),
    ("ur", "ur"),
    ("jw", "jv"),
];

fn bcp47_for(token: &str) -> Option<&'static str> {
    WHISPER_LANG_TO_BCP47.iter().find(|(k, _)| *k == token).map(|(_, v)| *v)
}

/// List local CT2 ASR model directories plus the well-known aliases.
pub fn list_asr_models(model_dir: &Path) -> Vec<ModelInfo> {
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir(model_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && path.join("model.bin").is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                out.push(ModelInfo {
                    id: name.clone(),
                    name,
                    path: Some(path.to_string_lossy().into_owned()),
                });
            }
        }
    }
    for alias in ASR_ALIASES {
        if !out.iter().any(|m| m.id == *alias) {
            out.push(ModelInfo { id: alias.to_string(), name: alias.to_string(), path: None });
        }
    }
    out
}

fn hf_cache_dir() -> Option<PathBuf> {
    if let Ok(home) = std::env::var("HF_HOME") {
        return Some(PathBuf::from(home).join("hub"));
    }
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".cache/huggingface/hub"))
}

/// List MT checkpoints (NLLB / M2M families) found in the HF cache.
pub fn list_mt_models() -> Vec<ModelInfo> {
    let mut out = Vec::new();
    let Some(hub) = hf_cache_dir() else {
        return out;
    };
    let Ok(entries) = std::fs::read_dir(&hub) else {
        return out;
    };
    for entry in entries.flatten() {
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        let Some(repo) = dir_name.strip_prefix("models--") else {
            continue;
        };
        let lower = repo.to_lowercase();
        if lower.contains("nllb") || lower.contains("m2m100") {
            let id = repo.replace("--", "/");
            out.push(ModelInfo {
                id: id.clone(),
                name: id,
                path: Some(entry.path().to_string_lossy().into_owned()),
            });
        }
    }
    out
}

/// Curated target languages per MT family. NLLB uses FLORES-200 codes, M2M
/// uses bare ISO codes.
pub fn mt_supported_languages(model_id: &str) -> Vec<String> {
    let lower = model_id.to_lowercase();
    let langs: &[&str] = if lower.contains("nllb") {
        &[
            "eng_Latn", "zho_Hans", "zho_Hant", "spa_Latn", "fra_Latn", "deu_Latn",
            "jpn_Jpan", "kor_Hang", "rus_Cyrl", "por_Latn", "ita_Latn", "nld_Latn",
            "tur_Latn", "pol_Latn", "arb_Arab", "hin_Deva", "ind_Latn", "ukr_Cyrl",
            "vie_Latn", "tha_Thai",
        ]
    } else if lower.contains("m2m100") {
        &[
            "en", "zh", "es", "fr", "de", "ja", "ko", "ru", "pt", "it", "nl", "tr",
            "pl", "ar", "hi", "id", "uk", "vi", "th",
        ]
    } else {
        &[]
    };
    langs.iter().map(|s| s.to_string()).collect()
}

/// Capability report for one ASR model.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CapabilityReport {
    pub kind: &'static str,
    pub model: String,
    pub supports_auto: bool,
    pub languages: Vec<String>,
    pub tokens: BTreeMap<String, String>,
}

struct CachedReport {
    mtime: Option<f64>,
    report: CapabilityReport,
}

/// Probes models for supported languages, with an mtime-validated cache.
/// `POST /admin/cache/clear` empties the cache.
pub struct CapabilityProbe {
    cache: DashMap<String, CachedReport>,
}

fn path_mtime(path: &Path) -> Option<f64> {
    std::fs::metadata(path)
        .ok()?
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs_f64())
}

impl CapabilityProbe {
    pub fn new() -> Self {
        Self { cache: DashMap::new() }
    }

    pub fn probe(&self, model_name: &str, model_path: Option<&Path>) -> CapabilityReport {
        let mtime = model_path.and_then(path_mtime);
        if let Some(cached) = self.cache.get(model_name) {
            if cached.mtime == mtime {
                return cached.report.clone();
            }
        }

        let report = self.probe_uncached(model_name, model_path);
        self.cache.insert(model_name.to_string(), CachedReport { mtime, report: report.clone() });
        report
    }

    /// Drop all cached reports; returns how many were evicted.
    pub fn clear(&self) -> usize {
        let n = self.cache.len();
        self.cache.clear();
        n
    }

    fn probe_uncached(&self, model_name: &str, model_path: Option<&Path>) -> CapabilityReport {
        let (mut languages, mut tokens) = (Vec::new(), BTreeMap::new());

        if let Some(dir) = model_path {
            if let Some((langs, toks)) = scan_vocabulary(dir) {
                languages = langs;
                tokens = toks;
            }
        }
        if languages.is_empty() {
            let (langs, toks) = fallback_languages(model_name);
            languages = langs;
            tokens = toks;
        }
        languages.sort();

        CapabilityReport {
            kind: "asr",
            model: model_name.to_string(),
            // Whisper-family models all support auto language detection.
            supports_auto: true,
            languages,
            tokens,
        }
    }
}

impl Default for CapabilityProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract `<|xx|>` language tokens from a CT2 checkout's vocabulary file.
fn scan_vocabulary(dir: &Path) -> Option<(Vec<String>, BTreeMap<String, String>)> {
    let vocab_path = ["vocabulary.txt", "vocab.txt"]
        .iter()
        .map(|f| dir.join(f))
        .find(|p| p.is_file())?;
    let body = std::fs::read_to_string(&vocab_path).ok()?;

    let lang_token = regex::Regex::new(r"^<\|([a-z]{2,3})\|>$").expect("static regex");
    let mut languages = Vec::new();
    let mut tokens = BTreeMap::new();
    for line in body.lines() {
        let token = line.trim();
        let Some(caps) = lang_token.captures(token) else {
            continue;
        };
        if let Some(bcp47) = bcp47_for(&caps[1]) {
            if !languages.contains(&bcp47.to_string()) {
                languages.push(bcp47.to_string());
                tokens.insert(bcp47.to_string(), token.to_string());
            }
        }
    }
    if languages.is_empty() {
        None
    } else {
        Some((languages, tokens))
    }
}

/// Curated list for models whose vocabulary is not inspectable.
fn fallback_languages(model_name: &str) -> (Vec<String>, BTreeMap<String, String>) {
    if model_name.ends_with(".en") {
        let mut tokens = BTreeMap::new();
        tokens.insert("en".to_string(), "<|en|>".to_string());
        return (vec!["en".to_string()], tokens);
    }
    let common = [
        "ar", "de", "en", "es", "fr", "hi", "it", "ja", "ko", "nl", "pl", "pt", "ru",
        "tr", "uk", "vi", "zh-Hans",
    ];
    let mut tokens = BTreeMap::new();
    for lang in common {
        let short: String = lang.chars().take(2).collect();
        tokens.insert(lang.to_string(), format!("<|{short}|>"));
    }
    (common.iter().map(|s| s.to_string()).collect(), tokens)
}
