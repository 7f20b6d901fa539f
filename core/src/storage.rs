//! Rolling per-session storage of finalized commits, capped by count, bytes,
//! and age. Backs session rehydration: the snapshot API returns the most
//! recent commits plus storage stats as one JSON-serializable record.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::clock::{default_clock, ClockFn};
use crate::error::{ControlError, Result};

/// What kind of durable record a commit is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitType {
    Transcript,
    Translation,
    Status,
}

/// A finalized commit kept in session history.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionCommit {
    pub id: uuid::Uuid,
    /// Monotonic seconds; compared against `max_age_seconds`.
    pub timestamp: f64,
    pub seq: u64,
    pub commit_type: CommitType,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub size_bytes: usize,
}

impl SessionCommit {
    fn new(
        timestamp: f64,
        seq: u64,
        commit_type: CommitType,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        // Serialized length is a stable estimate of the memory footprint.
        let size_bytes = serde_json::to_string(&data).map(|s| s.len()).unwrap_or(0) + 64;
        Self { id: uuid::Uuid::new_v4(), timestamp, seq, commit_type, data, size_bytes }
    }
}

/// Caps for one session's storage. All three must be positive.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StorageConfig {
    pub max_commits: usize,
    pub max_size_bytes: usize,
    pub max_age_seconds: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { max_commits: 100, max_size_bytes: 1024 * 1024, max_age_seconds: 3600.0 }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_commits == 0 {
            return Err(ControlError::Config("max_commits must be positive".into()));
        }
        if self.max_size_bytes == 0 {
            return Err(ControlError::Config("max_size_bytes must be positive".into()));
        }
        if self.max_age_seconds <= 0.0 {
            return Err(ControlError::Config("max_age_seconds must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageStats {
    pub session_id: String,
    pub total_commits: usize,
    pub total_size_bytes: usize,
    pub commits_added: u64,
    pub commits_dropped: u64,
    pub config: StorageConfig,
    pub oldest_commit_age: f64,
}

/// Snapshot for session rehydration.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StorageSnapshot {
    pub session_id: String,
    pub timestamp: f64,
    pub total_commits: usize,
    pub recent_commits: Vec<SessionCommit>,
    pub storage_stats: StorageStats,
}

struct Inner {
    commits: VecDeque<SessionCommit>,
    total_size_bytes: usize,
    commits_added: u64,
    commits_dropped: u64,
}

/// Rolling capped archive of one session's commits. Thread-safe; every public
/// call re-enforces the caps before returning.
pub struct SessionStorage {
    session_id: String,
    config: StorageConfig,
    inner: Mutex<Inner>,
    clock: ClockFn,
}

impl SessionStorage {
    pub fn new(session_id: &str, config: StorageConfig) -> Result<Self> {
        Self::with_clock(session_id, config, default_clock())
    }

    pub(crate) fn with_clock(session_id: &str, config: StorageConfig, clock: ClockFn) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            session_id: session_id.to_string(),
            config,
            inner: Mutex::new(Inner {
                commits: VecDeque::new(),
                total_size_bytes: 0,
                commits_added: 0,
                commits_dropped: 0,
            }),
            clock,
        })
    }

    /// Append a commit stamped with now, then rotate: age first, then count,
    /// then total size.
    pub fn add_commit(
        &self,
        commit_type: CommitType,
        data: serde_json::Map<String, serde_json::Value>,
        seq: u64,
    ) -> SessionCommit {
        let commit = SessionCommit::new((self.clock)(), seq, commit_type, data);
        let mut g = self.inner.lock().expect("storage mutex");
        g.total_size_bytes += commit.size_bytes;
        g.commits.push_back(commit.clone());
        g.commits_added += 1;
        self.enforce_limits(&mut g);
        commit
    }

    fn enforce_limits(&self, g: &mut Inner) {
        let now = (self.clock)();

        while let Some(oldest) = g.commits.front() {
            if now - oldest.timestamp > self.config.max_age_seconds {
                let dropped = g.commits.pop_front().expect("front checked");
                g.total_size_bytes -= dropped.size_bytes;
                g.commits_dropped += 1;
            } else {
                break;
            }
        }

        while g.commits.len() > self.config.max_commits {
            let dropped = g.commits.pop_front().expect("len checked");
            g.total_size_bytes -= dropped.size_bytes;
            g.commits_dropped += 1;
        }

        while g.total_size_bytes > self.config.max_size_bytes && !g.commits.is_empty() {
            let dropped = g.commits.pop_front().expect("non-empty checked");
            g.total_size_bytes -= dropped.size_bytes;
            g.commits_dropped += 1;
        }
    }

    /// Stored commits, most recent first, after re-enforcing limits.
    pub fn get_commits(
        &self,
        limit: Option<usize>,
        commit_type: Option<CommitType>,
        since_timestamp: Option<f64>,
    ) -> Vec<SessionCommit> {
        let mut g = self.inner.lock().expect("storage mutex");
        self.enforce_limits(&mut g);

        let mut commits: Vec<SessionCommit> = g
            .commits
            .iter()
            .filter(|c| commit_type.map_or(true, |t| c.commit_type == t))
            .filter(|c| since_timestamp.map_or(true, |ts| c.timestamp > ts))
            .cloned()
            .collect();
        commits.sort_by(|a, b| b.timestamp.total_cmp(&a.timestamp));
        if let Some(limit) = limit {
            commits.truncate(limit);
        }
        commits
    }

    /// Snapshot for rehydration: the newest `max_commits` commits plus stats.
    pub fn get_snapshot(&self, max_commits: usize) -> StorageSnapshot {
        let recent_commits = self.get_commits(Some(max_commits), None, None);
        let g = self.inner.lock().expect("storage mutex");
        StorageSnapshot {
            session_id: self.session_id.clone(),
            timestamp: (self.clock)(),
            total_commits: g.commits.len(),
            recent_commits,
            storage_stats: self.stats_locked(&g),
        }
    }

    pub fn get_stats(&self) -> StorageStats {
        let g = self.inner.lock().expect("storage mutex");
        self.stats_locked(&g)
    }

    fn stats_locked(&self, g: &Inner) -> StorageStats {
        StorageStats {
            session_id: self.session_id.clone(),
            total_commits: g.commits.len(),
            total_size_bytes: g.total_size_bytes,
            commits_added: g.commits_added,
            commits_dropped: g.commits_dropped,
            config: self.config,
            oldest_commit_age: g
                .commits
                .front()
                .map(|c| (self.clock)() - c.timestamp)
                .unwrap_or(0.0),
        }
    }

    /// Remove all commits; returns how many were removed. Drop counters are
    /// untouched; clearing is not rotation.
    pub fn clear(&self) -> usize {
        let mut g = self.inner.lock().expect("storage mutex");
        let n = g.commits.len();
        g.commits.clear();
        g.total_size_bytes = 0;
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn manual_clock(start: f64) -> (Arc<Mutex<f64>>, ClockFn) {
        let t = Arc::new(Mutex::new(start));
        let clock: ClockFn = {
            let t = t.clone();
            Arc::new(move || *t.lock().unwrap())
        };
        (t, clock)
    }

    fn message(i: usize) -> serde_json::Map<String, serde_json::Value> {
        let mut m = serde_json::Map::new();
        m.insert("text".into(), serde_json::Value::String(format!("message {i}")));
        m
    }

    #[test]
    fn config_must_be_positive() {
        let bad = StorageConfig { max_commits: 0, ..StorageConfig::default() };
        assert!(SessionStorage::new("s", bad).is_err());
        let bad = StorageConfig { max_size_bytes: 0, ..StorageConfig::default() };
        assert!(SessionStorage::new("s", bad).is_err());
        let bad = StorageConfig { max_age_seconds: 0.0, ..StorageConfig::default() };
        assert!(SessionStorage::new("s", bad).is_err());
    }

    #[test]
    fn count_cap_drops_oldest_most_recent_first() {
        let (t, clock) = manual_clock(0.0);
        let config = StorageConfig { max_commits: 3, ..StorageConfig::default() };
        let storage = SessionStorage::with_clock("sess", config, clock).unwrap();

        for i in 0..5 {
            *t.lock().unwrap() = i as f64;
            storage.add_commit(CommitType::Transcript, message(i), i as u64);
        }

        let got = storage.get_commits(None, None, None);
        let texts: Vec<_> = got.iter().map(|c| c.data["text"].as_str().unwrap().to_string()).collect();
        assert_eq!(texts, vec!["message 4", "message 3", "message 2"]);
        assert_eq!(storage.get_stats().commits_dropped, 2);
    }

    #[test]
    fn age_cap_expires_old_commits() {
        let (t, clock) = manual_clock(0.0);
        let config = StorageConfig { max_age_seconds: 10.0, ..StorageConfig::default() };
        let storage = SessionStorage::with_clock("sess", config, clock).unwrap();

        storage.add_commit(CommitType::Transcript, message(0), 1);
        *t.lock().unwrap() = 20.0;
        storage.add_commit(CommitType::Transcript, message(1), 2);

        let got = storage.get_commits(None, None, None);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].seq, 2);
        assert_eq!(storage.get_stats().commits_dropped, 1);
    }

    #[test]
    fn size_cap_drops_from_head() {
        let (_, clock) = manual_clock(0.0);
        let config = StorageConfig { max_size_bytes: 200, ..StorageConfig::default() };
        let storage = SessionStorage::with_clock("sess", config, clock).unwrap();

        for i in 0..10 {
            storage.add_commit(CommitType::Transcript, message(i), i as u64);
        }
        let stats = storage.get_stats();
        assert!(stats.total_size_bytes <= 200);
        assert!(stats.commits_dropped > 0);
        assert!(stats.total_commits > 0);
    }

    #[test]
    fn type_and_time_filters() {
        let (t, clock) = manual_clock(0.0);
        let storage = SessionStorage::with_clock("sess", StorageConfig::default(), clock).unwrap();

        storage.add_commit(CommitType::Transcript, message(0), 1);
        *t.lock().unwrap() = 5.0;
        storage.add_commit(CommitType::Translation, message(1), 2);
        *t.lock().unwrap() = 9.0;
        storage.add_commit(CommitType::Status, message(2), 3);

        let translations = storage.get_commits(None, Some(CommitType::Translation), None);
        assert_eq!(translations.len(), 1);
        assert_eq!(translations[0].seq, 2);

        let recent = storage.get_commits(None, None, Some(4.0));
        assert_eq!(recent.len(), 2);

        let limited = storage.get_commits(Some(1), None, None);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].seq, 3);
    }

    #[test]
    fn clear_resets_stats_but_not_drop_counter() {
        let (_, clock) = manual_clock(0.0);
        let config = StorageConfig { max_commits: 1, ..StorageConfig::default() };
        let storage = SessionStorage::with_clock("sess", config, clock).unwrap();

        storage.add_commit(CommitType::Transcript, message(0), 1);
        storage.add_commit(CommitType::Transcript, message(1), 2);
        let dropped_before = storage.get_stats().commits_dropped;
        assert_eq!(dropped_before, 1);

        assert_eq!(storage.clear(), 1);
        let stats = storage.get_stats();
        assert_eq!(stats.total_commits, 0);
        assert_eq!(stats.total_size_bytes, 0);
        assert_eq!(stats.commits_dropped, dropped_before);
    }

    #[test]
    fn snapshot_is_serializable_and_bounded() {
        let (t, clock) = manual_clock(0.0);
        let storage = SessionStorage::with_clock("sess-1", StorageConfig::default(), clock).unwrap();
        for i in 0..5 {
            *t.lock().unwrap() = i as f64;
            storage.add_commit(CommitType::Transcript, message(i), i as u64 + 1);
        }

        let snap = storage.get_snapshot(2);
        assert_eq!(snap.session_id, "sess-1");
        assert_eq!(snap.total_commits, 5);
        assert_eq!(snap.recent_commits.len(), 2);
        assert_eq!(snap.recent_commits[0].seq, 5);

        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["storage_stats"]["total_commits"], 5);
    }
}
