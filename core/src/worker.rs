//! Worker process: the external inference pipeline, spawned with its
//! configuration frozen into environment variables. Both output streams are
//! drained line-by-line by dedicated reader threads into one bounded inbox
//! (drop-oldest), so a chatty worker can never block its readers or grow
//! memory without bound. Dropping the handle terminates the child.

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ControlError, Result};
use crate::queue::BoundedQueue;

/// Worker inbox capacity (lines). Overflow drops the oldest line.
pub const INBOX_CAPACITY: usize = 1000;

const STOP_GRACE: Duration = Duration::from_secs(3);
const REAP_POLL: Duration = Duration::from_millis(50);

/// A running worker: child handle, reader threads, and the shared line inbox.
pub struct WorkerHandle {
    child: Arc<Mutex<Child>>,
    inbox: Arc<BoundedQueue<String>>,
    readers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle").finish_non_exhaustive()
    }
}

/// Spawn `argv` with `env` overrides. Stdout and stderr are piped and both
/// feed the same inbox, line by line.
pub fn spawn_worker(argv: &[String], env: &[(String, String)]) -> Result<WorkerHandle> {
    let program = argv
        .first()
        .ok_or_else(|| ControlError::Worker("empty worker command".into()))?;
    let mut cmd = Command::new(program);
    cmd.args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in env {
        cmd.env(k, v);
    }
    let mut child = cmd
        .spawn()
        .map_err(|e| ControlError::Worker(format!("failed to spawn {program}: {e}")))?;

    let inbox = Arc::new(BoundedQueue::new(INBOX_CAPACITY, "worker_inbox")?);
    let mut readers = Vec::new();

    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, Arc::clone(&inbox)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, Arc::clone(&inbox)));
    }

    Ok(WorkerHandle {
        child: Arc::new(Mutex::new(child)),
        inbox,
        readers: Mutex::new(readers),
    })
}

/// Blocking thread: read lines until EOF (which follows process exit) and push
/// them into the inbox. Undecodable bytes are replaced, never dropped whole.
fn spawn_reader(
    stream: impl std::io::Read + Send + 'static,
    inbox: Arc<BoundedQueue<String>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    inbox.put(line);
                }
                Err(_) => break,
            }
        }
    })
}

impl WorkerHandle {
    /// The shared line inbox (drained by the supervisor pump).
    pub fn inbox(&self) -> &BoundedQueue<String> {
        &self.inbox
    }

    /// True while the child has not been reaped.
    pub fn is_running(&self) -> bool {
        match self.child.lock() {
            Ok(mut guard) => matches!(guard.try_wait(), Ok(None)),
            Err(_) => false,
        }
    }

    /// Exit code once the child has exited.
    pub fn exit_code(&self) -> Option<i32> {
        let mut guard = self.child.lock().ok()?;
        match guard.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }

    /// Graceful stop: SIGTERM, wait up to 3 s, then SIGKILL. Reader threads
    /// are joined once the streams hit EOF.
    pub fn stop(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if matches!(guard.try_wait(), Ok(None)) {
                terminate(&mut guard);
                let deadline = Instant::now() + STOP_GRACE;
                while Instant::now() < deadline {
                    if !matches!(guard.try_wait(), Ok(None)) {
                        break;
                    }
                    std::thread::sleep(REAP_POLL);
                }
                if matches!(guard.try_wait(), Ok(None)) {
                    let _ = guard.kill();
                    let _ = guard.wait();
                }
            }
        }
        self.join_readers();
    }

    fn join_readers(&self) {
        if let Ok(mut readers) = self.readers.lock() {
            for handle in readers.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.child.lock() {
            if matches!(guard.try_wait(), Ok(None)) {
                let _ = guard.kill();
                let _ = guard.wait();
            }
        }
        self.join_readers();
    }
}

/// Ask the child to exit. SIGTERM on unix; elsewhere only a hard kill exists.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn collects_stdout_and_stderr_lines() {
        let worker = spawn_worker(&sh("echo out-line; echo err-line 1>&2"), &[]).unwrap();
        // Wait for exit + drained streams.
        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        worker.stop();

        let lines: Vec<String> = worker.inbox().drain();
        let joined = lines.join("");
        assert!(joined.contains("out-line"));
        assert!(joined.contains("err-line"));
    }

    #[test]
    fn env_overrides_reach_the_child() {
        let worker = spawn_worker(
            &sh("echo model=$LC_ASR_MODEL"),
            &[("LC_ASR_MODEL".to_string(), "tiny.en".to_string())],
        )
        .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while worker.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        worker.stop();
        let joined = worker.inbox().drain().join("");
        assert!(joined.contains("model=tiny.en"));
    }

    #[test]
    fn stop_terminates_long_running_child() {
        let worker = spawn_worker(&sh("sleep 30"), &[]).unwrap();
        assert!(worker.is_running());
        let started = Instant::now();
        worker.stop();
        assert!(!worker.is_running());
        // Graceful path: sh dies on SIGTERM well inside the 3 s deadline.
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn spawn_failure_is_synchronous() {
        let err = spawn_worker(&["definitely-not-a-binary-xyz".to_string()], &[]).unwrap_err();
        assert!(matches!(err, ControlError::Worker(_)));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(matches!(spawn_worker(&[], &[]), Err(ControlError::Worker(_))));
    }
}
