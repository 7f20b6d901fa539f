//! Filesystem retention over the session output root: a TTL pass deletes
//! files past their age, then a size-cap pass deletes oldest-first until the
//! tree fits. Per-file failures are logged and skipped; the sweep never fails.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// TTL plus optional byte cap. `max_bytes: None` means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub ttl_seconds: u64,
    pub max_bytes: Option<u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { ttl_seconds: 72 * 3600, max_bytes: None }
    }
}

fn collect_files(root: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else if path.is_file() {
            out.push(path);
        }
    }
}

fn iter_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    collect_files(root, &mut out);
    out
}

fn mtime_secs(meta: &std::fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Already-gone files are fine; anything else is logged and the sweep moves on.
fn safe_remove(p: &Path) -> bool {
    match std::fs::remove_file(p) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            eprintln!("[LiveCap] retention: failed to remove {p:?}: {e}");
            false
        }
    }
}

/// Enforce `policy` over all files under `root`. Returns
/// `(deleted_count, remaining_bytes)`.
pub fn enforce_retention(root: &Path, policy: &RetentionPolicy) -> (usize, u64) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    let mut deleted = 0usize;

    // TTL pass
    if policy.ttl_seconds > 0 {
        let cutoff = now - policy.ttl_seconds as f64;
        for p in iter_files(root) {
            let meta = match std::fs::metadata(&p) {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    eprintln!("[LiveCap] retention: stat failed for {p:?}: {e}");
                    continue;
                }
            };
            if mtime_secs(&meta) < cutoff && safe_remove(&p) {
                deleted += 1;
            }
        }
    }

    // Re-enumerate, then size-cap pass: delete oldest-first until under cap.
    let mut total_bytes = 0u64;
    let mut by_mtime: Vec<(f64, PathBuf, u64)> = Vec::new();
    for p in iter_files(root) {
        let meta = match std::fs::metadata(&p) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                eprintln!("[LiveCap] retention: stat failed for {p:?}: {e}");
                continue;
            }
        };
        let size = meta.len();
        total_bytes += size;
        by_mtime.push((mtime_secs(&meta), p, size));
    }

    if let Some(max_bytes) = policy.max_bytes.filter(|&b| b > 0) {
        if total_bytes > max_bytes {
            by_mtime.sort_by(|a, b| a.0.total_cmp(&b.0));
            for (_, p, size) in by_mtime {
                if total_bytes <= max_bytes {
                    break;
                }
                if safe_remove(&p) {
                    deleted += 1;
                    total_bytes -= size;
                }
            }
        }
    }

    (deleted, total_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_file(p: &Path, size: usize) {
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(p, vec![b'x'; size]).unwrap();
    }

    fn backdate(p: &Path, secs_ago: u64) {
        let past = SystemTime::now() - std::time::Duration::from_secs(secs_ago);
        let f = fs::File::options().append(true).open(p).unwrap();
        f.set_modified(past).unwrap();
    }

    #[test]
    fn ttl_removes_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.txt");
        let new = dir.path().join("sub/new.txt");
        write_file(&old, 100);
        write_file(&new, 200);
        backdate(&old, 2 * 3600);

        let policy = RetentionPolicy { ttl_seconds: 3600, max_bytes: None };
        let (deleted, remaining) = enforce_retention(dir.path(), &policy);

        assert_eq!(deleted, 1);
        assert_eq!(remaining, 200);
        assert!(!old.exists());
        assert!(new.exists());
    }

    #[test]
    fn size_cap_deletes_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mb = 1024 * 1024;
        let f1 = dir.path().join("f1.bin");
        let f2 = dir.path().join("f2.bin");
        let f3 = dir.path().join("f3.bin");
        write_file(&f1, 2 * mb);
        write_file(&f2, 2 * mb);
        write_file(&f3, 2 * mb);
        backdate(&f1, 30);
        backdate(&f2, 20);
        backdate(&f3, 10);

        let policy = RetentionPolicy { ttl_seconds: 9_999_999, max_bytes: Some(4 * mb as u64) };
        let (deleted, remaining) = enforce_retention(dir.path(), &policy);

        assert_eq!(deleted, 1);
        assert_eq!(remaining, 4 * mb as u64);
        assert!(!f1.exists());
        assert!(f2.exists() && f3.exists());
    }

    #[test]
    fn sweep_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join("keep.txt");
        let drop = dir.path().join("drop.txt");
        write_file(&keep, 10);
        write_file(&drop, 10);
        backdate(&drop, 7200);

        let policy = RetentionPolicy { ttl_seconds: 3600, max_bytes: None };
        let first = enforce_retention(dir.path(), &policy);
        let second = enforce_retention(dir.path(), &policy);

        assert_eq!(first, (1, 10));
        assert_eq!(second, (0, 10));
        assert!(keep.exists());
    }

    #[test]
    fn zero_ttl_disables_age_pass() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("ancient.txt");
        write_file(&f, 10);
        backdate(&f, 1_000_000);

        let policy = RetentionPolicy { ttl_seconds: 0, max_bytes: None };
        let (deleted, remaining) = enforce_retention(dir.path(), &policy);
        assert_eq!(deleted, 0);
        assert_eq!(remaining, 10);
    }

    #[test]
    fn missing_root_is_empty_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let (deleted, remaining) = enforce_retention(&missing, &RetentionPolicy::default());
        assert_eq!((deleted, remaining), (0, 0));
    }
}
