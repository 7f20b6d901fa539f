//! Control-plane configuration from the environment. Built once at program
//! entry and passed by reference into the manager and handlers; nothing here
//! is a global.

use std::path::PathBuf;

use crate::error::{ControlError, Result};

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_MAX_CUDA_SESSIONS: usize = 1;
const DEFAULT_WORKER_CMD: &str = "livecap-pipeline";
const DEFAULT_RETENTION_TTL_SEC: u64 = 72 * 3600;
const DEFAULT_RETENTION_SWEEP_SEC: u64 = 3600;
const DEFAULT_MAX_LINES: usize = 1000;

/// Everything the server and manager need from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for per-session run dirs. Served read-only at /out.
    pub out_dir: PathBuf,
    /// Bind port for the HTTP/WS API.
    pub api_port: u16,
    /// Admission cap: max concurrent sessions with device == cuda.
    pub max_cuda_sessions: usize,
    /// Bearer token for /admin routes. None disables the admin surface.
    pub admin_token: Option<String>,
    /// Worker argv. Overridable for tests and alternate pipelines.
    pub worker_cmd: Vec<String>,
    /// Local ASR model directory (CTranslate2 checkouts).
    pub model_dir: PathBuf,
    pub retention_ttl_secs: u64,
    pub retention_max_bytes: Option<u64>,
    pub retention_sweep_secs: u64,
    /// Line cap for rolling final transcript files.
    pub max_lines: usize,
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env_nonempty(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ControlError::Config(format!("{name}={raw} is not a valid value"))),
    }
}

impl Config {
    /// Read LC_* variables. Unset values fall back to defaults; unparsable
    /// values are a config error (the server binary exits 2 on those).
    pub fn from_env() -> Result<Self> {
        let worker_cmd: Vec<String> = env_nonempty("LC_WORKER_CMD")
            .unwrap_or_else(|| DEFAULT_WORKER_CMD.to_string())
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();

        let retention_max_bytes = match env_nonempty("LC_RETENTION_MAX_BYTES") {
            None => None,
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                ControlError::Config(format!("LC_RETENTION_MAX_BYTES={raw} is not a valid value"))
            })?),
        };

        Ok(Self {
            out_dir: PathBuf::from(env_nonempty("LC_OUT_DIR").unwrap_or_else(|| "out".into())),
            api_port: env_parse("LC_API_PORT", DEFAULT_PORT)?,
            max_cuda_sessions: env_parse("LC_MAX_CUDA_SESSIONS", DEFAULT_MAX_CUDA_SESSIONS)?,
            admin_token: env_nonempty("LC_ADMIN_TOKEN"),
            worker_cmd,
            model_dir: PathBuf::from(env_nonempty("LC_MODEL_DIR").unwrap_or_else(|| ".models".into())),
            retention_ttl_secs: env_parse("LC_RETENTION_TTL_SEC", DEFAULT_RETENTION_TTL_SEC)?,
            retention_max_bytes,
            retention_sweep_secs: env_parse("LC_RETENTION_SWEEP_SEC", DEFAULT_RETENTION_SWEEP_SEC)?,
            max_lines: env_parse("LC_MAX_LINES", DEFAULT_MAX_LINES)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_number_is_config_error() {
        std::env::set_var("LC_PARSE_TEST_PROBE", "not-a-number");
        let err = env_parse::<u16>("LC_PARSE_TEST_PROBE", 8000).unwrap_err();
        assert!(matches!(err, ControlError::Config(_)));
        std::env::remove_var("LC_PARSE_TEST_PROBE");
    }

    #[test]
    fn unset_falls_back_to_default() {
        assert_eq!(env_parse("LC_NO_SUCH_VARIABLE", 42u32).unwrap(), 42);
    }
}
