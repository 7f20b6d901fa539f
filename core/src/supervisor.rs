//! Session supervisor: admission control, worker lifecycle, the shared pump
//! that turns worker stdout into stamped envelopes, VU metering, download
//! jobs, and the retention sweeper.
//!
//! The registry is one mutex-guarded map; iteration always works on snapshot
//! copies so no lock is held across sends or file I/O. Per-session event flow:
//! inbox line -> typed payload -> stamper -> replay buffer (+ storage for
//! durable commits, + artifact files) -> fan-out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;

use crate::clock::unix_now_secs;
use crate::config::Config;
use crate::error::{ControlError, Result};
use crate::event::{parse_worker_line, Envelope, EventPayload, EventStamper, Stage};
use crate::fanout::{SubscriberHub, DOWNLOAD_CHANNEL};
use crate::outputs::SessionOutputs;
use crate::queue::ReplayBuffer;
use crate::retention::{enforce_retention, RetentionPolicy};
use crate::storage::{CommitType, SessionStorage, StorageConfig};
use crate::worker::{spawn_worker, WorkerHandle};

const GPU_BUSY_MSG: &str = "GPU busy: maximum concurrent CUDA sessions reached";

/// Lines drained per session per pump tick. Bounds per-tick work so one
/// chatty worker cannot starve the others.
const PUMP_DRAIN_CAP: usize = 20;
const PUMP_INTERVAL: Duration = Duration::from_millis(200);
const VU_INTERVAL: Duration = Duration::from_millis(500);

const REPLAY_CAPACITY: usize = 500;
const REPLAY_TTL_SECS: f64 = 10.0;

/// Unique session identifier (UUID v4). Used in API paths and push channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

fn default_name() -> String {
    "session".to_string()
}
fn default_true() -> bool {
    true
}
fn default_dest_lang() -> String {
    "zho_Hans".to_string()
}
fn default_device() -> String {
    "auto".to_string()
}
fn default_beams() -> u32 {
    1
}
fn default_pause_flush() -> f64 {
    0.7
}
fn default_segment_max() -> f64 {
    7.0
}
fn default_partial_word_cap() -> u32 {
    10
}
fn default_save_audio() -> String {
    "off".to_string()
}

/// Immutable per-session configuration, as accepted by POST /sessions.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_name")]
    pub name: String,
    pub asr_model_id: String,
    #[serde(default = "default_true")]
    pub mt_enabled: bool,
    #[serde(default)]
    pub mt_model_id: Option<String>,
    #[serde(default = "default_dest_lang")]
    pub dest_lang: String,
    /// auto | cuda | cpu
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_true")]
    pub vad: bool,
    #[serde(default = "default_beams")]
    pub beams: u32,
    #[serde(default = "default_pause_flush")]
    pub pause_flush_sec: f64,
    #[serde(default = "default_segment_max")]
    pub segment_max_sec: f64,
    #[serde(default = "default_partial_word_cap")]
    pub partial_word_cap: u32,
    /// off | wav | flac
    #[serde(default = "default_save_audio")]
    pub save_audio: String,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.device.as_str(), "auto" | "cuda" | "cpu") {
            return Err(ControlError::Config(format!("unknown device: {}", self.device)));
        }
        if !matches!(self.save_audio.as_str(), "off" | "wav" | "flac") {
            return Err(ControlError::Config(format!("unknown save_audio mode: {}", self.save_audio)));
        }
        if self.beams == 0 {
            return Err(ControlError::Config("beams must be positive".into()));
        }
        Ok(())
    }

    /// Environment frozen into the worker at spawn. All values are strings;
    /// anything unset falls back to worker defaults.
    fn env_overrides(&self, run_dir: &std::path::Path) -> Vec<(String, String)> {
        let mut env = vec![
            ("LC_ASR_MODEL".into(), self.asr_model_id.clone()),
            ("LC_DEVICE".into(), self.device.clone()),
            ("LC_ASR_VAD".into(), if self.vad { "1" } else { "0" }.to_string()),
            ("LC_ASR_BEAM".into(), self.beams.to_string()),
            ("LC_PAUSE_FLUSH_SEC".into(), self.pause_flush_sec.to_string()),
            ("LC_SEGMENT_MAX_SEC".into(), self.segment_max_sec.to_string()),
            ("LC_PARTIAL_WORD_CAP".into(), self.partial_word_cap.to_string()),
            ("LC_OUT_DIR".into(), run_dir.to_string_lossy().into_owned()),
            ("LC_SAVE_AUDIO".into(), self.save_audio.clone()),
            ("LC_MT_ENABLED".into(), if self.mt_enabled { "1" } else { "0" }.to_string()),
            ("LC_DEST_LANG".into(), self.dest_lang.clone()),
        ];
        if let Some(mt_model) = &self.mt_model_id {
            env.push(("LC_MT_MODEL".into(), mt_model.clone()));
        }
        env
    }
}

/// Metadata written to `<run_dir>/session.json` at creation.
#[derive(Debug, serde::Serialize)]
struct SessionMetadata<'a> {
    session_id: String,
    name: &'a str,
    created_at: String,
    config: &'a SessionConfig,
}

/// One live session: worker, stamper, replay history, durable commits, and
/// artifact writers. Exclusively owned by the manager's registry.
pub struct SessionEntry {
    pub sid: SessionId,
    pub cfg: SessionConfig,
    pub run_dir: PathBuf,
    pub created_at: u64,
    state: RwLock<Stage>,
    stop_requested: AtomicBool,
    worker: WorkerHandle,
    stamper: Mutex<EventStamper>,
    replay: ReplayBuffer,
    storage: SessionStorage,
    outputs: Mutex<SessionOutputs>,
}

impl SessionEntry {
    pub fn state(&self) -> Stage {
        *self.state.read().expect("state lock")
    }

    fn set_state(&self, stage: Stage) {
        *self.state.write().expect("state lock") = stage;
    }

    pub fn storage(&self) -> &SessionStorage {
        &self.storage
    }

    pub fn replay_after(&self, last_seq: u64) -> Vec<Envelope> {
        self.replay.get_after(last_seq)
    }
}

/// Knobs the manager needs, decoupled from the process environment so tests
/// can construct managers directly.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub out_root: PathBuf,
    pub max_cuda_sessions: usize,
    pub worker_cmd: Vec<String>,
    pub model_dir: PathBuf,
    pub max_lines: usize,
    pub storage: StorageConfig,
}

impl ManagerOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            out_root: cfg.out_dir.clone(),
            max_cuda_sessions: cfg.max_cuda_sessions,
            worker_cmd: cfg.worker_cmd.clone(),
            model_dir: cfg.model_dir.clone(),
            max_lines: cfg.max_lines,
            storage: StorageConfig::default(),
        }
    }
}

/// Owns every session. Constructed once at program entry and shared behind an
/// Arc; handlers and background tasks all borrow the same instance.
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, Arc<SessionEntry>>>,
    hub: Arc<SubscriberHub>,
    opts: ManagerOptions,
    download_stamper: Mutex<EventStamper>,
}

impl SessionManager {
    pub fn new(opts: ManagerOptions) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            hub: Arc::new(SubscriberHub::new()),
            opts,
            download_stamper: Mutex::new(EventStamper::new()),
        })
    }

    pub fn hub(&self) -> &Arc<SubscriberHub> {
        &self.hub
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.opts
    }

    pub fn get(&self, sid: SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions.lock().expect("registry lock").get(&sid).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions.lock().expect("registry lock").values().cloned().collect()
    }

    /// Create and register a session. Spawn failure is synchronous: nothing is
    /// registered and no event is published. CUDA admission is re-checked under
    /// the registry lock at insert time, so the cap holds under concurrency.
    pub fn start_session(&self, cfg: SessionConfig) -> Result<SessionId> {
        cfg.validate()?;
        if cfg.device == "cuda" && self.running_cuda_count() >= self.opts.max_cuda_sessions {
            return Err(ControlError::Admission(GPU_BUSY_MSG.into()));
        }

        let sid = SessionId::new();
        let run_dir = self.opts.out_root.join(sid.to_string());
        std::fs::create_dir_all(&run_dir)?;
        self.write_metadata(sid, &cfg, &run_dir)?;

        let worker = spawn_worker(&self.opts.worker_cmd, &cfg.env_overrides(&run_dir))?;
        let entry = Arc::new(SessionEntry {
            sid,
            run_dir: run_dir.clone(),
            created_at: unix_now_secs(),
            state: RwLock::new(Stage::Initializing),
            stop_requested: AtomicBool::new(false),
            worker,
            stamper: Mutex::new(EventStamper::new()),
            replay: ReplayBuffer::new(REPLAY_CAPACITY, REPLAY_TTL_SECS)?,
            storage: SessionStorage::new(&sid.to_string(), self.opts.storage)?,
            outputs: Mutex::new(SessionOutputs::new(&self.opts.out_root, &run_dir, self.opts.max_lines)?),
            cfg,
        });

        {
            // Check-and-insert is atomic wrt other creations.
            let mut sessions = self.sessions.lock().expect("registry lock");
            if entry.cfg.device == "cuda" {
                let running_cuda = sessions.values().filter(|s| s.cfg.device == "cuda").count();
                if running_cuda >= self.opts.max_cuda_sessions {
                    entry.worker.stop();
                    let _ = std::fs::remove_dir_all(&run_dir);
                    return Err(ControlError::Admission(GPU_BUSY_MSG.into()));
                }
            }
            sessions.insert(sid, entry.clone());
        }

        println!("[LiveCap] session {sid} created (model={}, device={})", entry.cfg.asr_model_id, entry.cfg.device);
        self.emit(&entry, EventPayload::status_stage(Stage::Initializing));
        Ok(sid)
    }

    /// Stop and unregister. The stopped status still reaches subscribers
    /// because broadcast channels outlive registry membership.
    pub fn stop_session(&self, sid: SessionId) -> Result<()> {
        let entry = self
            .sessions
            .lock()
            .expect("registry lock")
            .remove(&sid)
            .ok_or_else(|| ControlError::NotFound(sid.to_string()))?;

        entry.stop_requested.store(true, Ordering::SeqCst);
        entry.set_state(Stage::Stopping);
        entry.worker.stop();
        entry.set_state(Stage::Stopped);
        self.emit(&entry, EventPayload::status_stage(Stage::Stopped));
        println!("[LiveCap] session {sid} stopped");
        Ok(())
    }

    fn running_cuda_count(&self) -> usize {
        self.sessions
            .lock()
            .expect("registry lock")
            .values()
            .filter(|s| s.cfg.device == "cuda")
            .count()
    }

    fn write_metadata(&self, sid: SessionId, cfg: &SessionConfig, run_dir: &std::path::Path) -> Result<()> {
        let meta = SessionMetadata {
            session_id: sid.to_string(),
            name: &cfg.name,
            created_at: chrono::Utc::now().to_rfc3339(),
            config: cfg,
        };
        let body = serde_json::to_string_pretty(&meta)
            .map_err(|e| ControlError::Worker(format!("metadata serialization: {e}")))?;
        std::fs::write(run_dir.join("session.json"), body)?;
        Ok(())
    }

    /// Stamp, buffer, commit (durables), materialize artifacts, broadcast.
    /// The stamper mutex serializes per-session sequencing.
    fn emit(&self, entry: &SessionEntry, payload: EventPayload) {
        if let EventPayload::Status { stage: Some(Stage::Operational), .. } = payload {
            if entry.state() == Stage::Initializing {
                entry.set_state(Stage::Operational);
            }
        }

        let env = entry.stamper.lock().expect("stamper lock").stamp(payload);
        entry.replay.add(env.seq, env.clone());

        let commit = match &env.payload {
            EventPayload::FinalEn { text } => Some((CommitType::Transcript, text.clone(), None)),
            EventPayload::FinalZh { text } => Some((CommitType::Translation, text.clone(), None)),
            EventPayload::Status { stage: Some(stage), log } => {
                Some((CommitType::Status, stage.to_string(), log.clone()))
            }
            _ => None,
        };
        if let Some((commit_type, value, log)) = commit {
            let mut data = serde_json::Map::new();
            match commit_type {
                CommitType::Status => {
                    data.insert("stage".into(), serde_json::Value::String(value));
                    if let Some(log) = log {
                        data.insert("log".into(), serde_json::Value::String(log));
                    }
                }
                _ => {
                    data.insert("text".into(), serde_json::Value::String(value));
                }
            }
            entry.storage.add_commit(commit_type, data, env.seq);
        }

        entry.outputs.lock().expect("outputs lock").apply(&env);
        self.hub.broadcast_envelope(&entry.sid.to_string(), &env);
    }

    /// One pump pass: drain up to [`PUMP_DRAIN_CAP`] lines per session (fair
    /// across sessions), then reap workers that died without a stop request.
    pub fn pump_tick(&self) {
        for entry in self.snapshot() {
            let mut drained = 0;
            while drained < PUMP_DRAIN_CAP {
                let Some(line) = entry.worker.inbox().get() else {
                    break;
                };
                drained += 1;
                if let Some(payload) = parse_worker_line(&line) {
                    self.emit(&entry, payload);
                }
            }

            let dropped = entry.worker.inbox().read_recent_drops();
            if dropped > 0 {
                eprintln!("[LiveCap] session {}: worker inbox dropped {dropped} line(s)", entry.sid);
            }

            let alive = entry.worker.is_running();
            let requested = entry.stop_requested.load(Ordering::SeqCst);
            if !alive
                && !requested
                && matches!(entry.state(), Stage::Initializing | Stage::Operational)
                && entry.worker.inbox().is_empty()
            {
                entry.set_state(Stage::Failed);
                self.emit(&entry, EventPayload::status_stage(Stage::Failed));
                self.sessions.lock().expect("registry lock").remove(&entry.sid);
                eprintln!(
                    "[LiveCap] session {} failed: worker exited unexpectedly (code {:?})",
                    entry.sid,
                    entry.worker.exit_code()
                );
            }
        }
    }

    /// One VU pass: synthetic rms/peak per running session. Real capture-path
    /// levels can replace the synthesis without touching the event flow.
    pub fn vu_tick(&self) {
        let mut rng = rand::thread_rng();
        for entry in self.snapshot() {
            if matches!(entry.state(), Stage::Initializing | Stage::Operational) {
                let payload = EventPayload::Vu {
                    rms: rng.gen_range(0.05..0.35),
                    peak: rng.gen_range(0.2..0.8),
                };
                self.emit(&entry, payload);
            }
        }
    }

    /// Start the shared pump and VU meter. Call once at program start.
    pub fn spawn_background(self: Arc<Self>) {
        let mgr = Arc::clone(&self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PUMP_INTERVAL);
            loop {
                tick.tick().await;
                mgr.pump_tick();
            }
        });

        let mgr = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(VU_INTERVAL);
            loop {
                tick.tick().await;
                mgr.vu_tick();
            }
        });
    }

    /// Periodic retention sweep over the output root.
    pub fn spawn_retention_sweeper(self: Arc<Self>, policy: RetentionPolicy, every: Duration) {
        let mgr = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                let root = mgr.opts.out_root.clone();
                let swept = tokio::task::spawn_blocking(move || enforce_retention(&root, &policy)).await;
                if let Ok((deleted, remaining)) = swept {
                    if deleted > 0 {
                        println!("[LiveCap] retention: deleted {deleted} file(s), {remaining} bytes remain");
                    }
                }
            }
        });
    }

    /// Kick off a background model download; progress is broadcast on the
    /// reserved `_download` channel. Returns the job id immediately.
    pub fn start_download(self: Arc<Self>, repo_id: &str, kind: &str) -> String {
        let job_id = uuid::Uuid::new_v4().to_string();
        let mgr = self;
        let job = job_id.clone();
        let repo = repo_id.to_string();
        let kind = kind.to_string();
        tokio::spawn(async move {
            mgr.emit_download(EventPayload::DownloadProgress {
                job_id: job.clone(),
                repo_id: repo.clone(),
                progress: 0,
            });
            match mgr.run_download(&job, &repo, &kind).await {
                Ok(()) => mgr.emit_download(EventPayload::DownloadProgress {
                    job_id: job.clone(),
                    repo_id: repo.clone(),
                    progress: 100,
                }),
                Err(e) => {
                    eprintln!("[LiveCap] download {job} failed: {e:#}");
                    mgr.emit_download(EventPayload::Error {
                        job_id: Some(job.clone()),
                        error: e.to_string(),
                    });
                }
            }
        });
        job_id
    }

    /// Fetch the repo's file list from the hub API, then each file. Progress
    /// granularity is per file; start and completion are always emitted.
    async fn run_download(&self, job_id: &str, repo_id: &str, kind: &str) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        let info: serde_json::Value = client
            .get(format!("https://huggingface.co/api/models/{repo_id}"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let files: Vec<String> = info["siblings"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|s| s["rfilename"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        anyhow::ensure!(!files.is_empty(), "repo {repo_id} has no downloadable files");

        let dest_root = self.opts.model_dir.join(kind).join(repo_id.replace('/', "--"));
        let total = files.len();
        for (i, file) in files.iter().enumerate() {
            let bytes = client
                .get(format!("https://huggingface.co/{repo_id}/resolve/main/{file}"))
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            let dest = dest_root.join(file);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dest, &bytes).await?;

            let progress = (((i + 1) * 100) / total).min(100) as u8;
            self.emit_download(EventPayload::DownloadProgress {
                job_id: job_id.to_string(),
                repo_id: repo_id.to_string(),
                progress,
            });
        }
        Ok(())
    }

    fn emit_download(&self, payload: EventPayload) {
        let env = self.download_stamper.lock().expect("stamper lock").stamp(payload);
        self.hub.broadcast_envelope(DOWNLOAD_CHANNEL, &env);
    }
}
