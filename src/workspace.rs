use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

use crate::bench_error::BenchError;
use crate::lock::{self, LockGuard};
use crate::types::{Feedback, PhaseView, RunReport, TaskView};
use crate::{log_debug, log_warn};

// --- Protocol file names ---

pub const PROBLEM_FILE: &str = "problem";
pub const TASK_FILE: &str = "task";
pub const PHASE_FILE: &str = "phase";
pub const SOLUTION_FILE: &str = "solution";
pub const FEEDBACK_FILE: &str = "feedback";
pub const REPORT_FILE: &str = "report";

/// Workspace writes are retried this many times before the run dies.
const WRITE_RETRY_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY_MS: u64 = 50;

// --- Operator quit ---

/// Global shutdown flag shared with signal handlers and the stdin watcher.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal or operator input.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Request shutdown programmatically (used by the stdin quit watcher and by
/// tests).
pub fn request_shutdown() {
    shutdown_flag().store(true, Ordering::Relaxed);
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
///
/// Call once at program startup. Subsequent calls are safe.
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

/// Watch stdin for an operator quit (`q` + newline). Runs on the blocking
/// pool; sets the shutdown flag, which the broker's poll loop observes at
/// its next tick.
pub fn spawn_stdin_quit_watcher() {
    tokio::task::spawn_blocking(|| {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(text) if text.trim().eq_ignore_ascii_case("q") => {
                    request_shutdown();
                    return;
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    });
}

// --- Solution change detection ---

/// Identity of one observed `solution` state. Polling compares the cheap
/// `(mtime, size)` pair first and only hashes when that pair moves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolutionFingerprint {
    pub mtime: Option<SystemTime>,
    pub size: u64,
    pub content_hash: String,
}

pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Outcome of a watch cycle.
#[derive(Debug)]
pub enum SolutionWait {
    NewSolution {
        source: String,
        fingerprint: SolutionFingerprint,
    },
    Cancelled,
    QuitRequested,
}

// --- Broker ---

/// Owner of the agent-visible file protocol for one run.
///
/// The runner is the sole writer of every file except `solution`; the agent
/// is the sole writer of `solution`. All runner writes are temp-file plus
/// atomic rename, so the agent never observes a partial record.
pub struct Workspace {
    dir: PathBuf,
    _lock: LockGuard,
}

impl Workspace {
    /// Create (if needed) and take exclusive ownership of a workspace
    /// directory. Writes the initial empty `solution` if absent so the
    /// watch loop has something to poll.
    pub fn open(dir: &Path) -> Result<Self, BenchError> {
        let lock = lock::try_acquire(dir)?;

        let solution = dir.join(SOLUTION_FILE);
        if !solution.exists() {
            std::fs::write(&solution, "")
                .map_err(|e| BenchError::workspace(&solution, e.to_string()))?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            _lock: lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn publish_problem(&self, problem: &str) -> Result<(), BenchError> {
        self.write_atomic(PROBLEM_FILE, problem)
    }

    pub fn publish_task(&self, view: &TaskView) -> Result<(), BenchError> {
        self.write_json(TASK_FILE, view)
    }

    pub fn publish_phase(&self, view: &PhaseView) -> Result<(), BenchError> {
        self.write_json(PHASE_FILE, view)
    }

    pub fn write_feedback(&self, feedback: &Feedback) -> Result<(), BenchError> {
        self.write_json(FEEDBACK_FILE, feedback)
    }

    pub fn write_report(&self, report: &RunReport) -> Result<(), BenchError> {
        self.write_json(REPORT_FILE, report)
    }

    /// One-shot read of `solution` with its fingerprint.
    pub fn read_solution(&self) -> Result<(String, SolutionFingerprint), BenchError> {
        let path = self.dir.join(SOLUTION_FILE);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| BenchError::workspace(&path, e.to_string()))?;
        let fingerprint = SolutionFingerprint {
            mtime: std::fs::metadata(&path).and_then(|m| m.modified()).ok(),
            size: content.len() as u64,
            content_hash: content_hash(&content),
        };
        Ok((content, fingerprint))
    }

    /// Poll `solution` until its content differs from `prior`.
    ///
    /// Empty content and content whose hash equals the previously evaluated
    /// hash are not new attempts; redundant saves of identical bytes are
    /// collapsed. Cancellation and operator quit are honoured at the next
    /// poll tick.
    pub async fn wait_for_solution(
        &self,
        prior: &SolutionFingerprint,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> SolutionWait {
        let path = self.dir.join(SOLUTION_FILE);
        let mut seen = prior.clone();

        loop {
            if cancel.is_cancelled() {
                return SolutionWait::Cancelled;
            }
            if is_shutdown_requested() {
                return SolutionWait::QuitRequested;
            }

            let stat = std::fs::metadata(&path)
                .ok()
                .map(|m| (m.modified().ok(), m.len()));

            let moved = match stat {
                Some((mtime, size)) => mtime != seen.mtime || size != seen.size,
                // File missing mid-run (agent mid-rename): treat as unmoved
                None => false,
            };

            if moved {
                match self.read_solution() {
                    Ok((source, fingerprint)) => {
                        let is_new = !source.trim().is_empty()
                            && fingerprint.content_hash != seen.content_hash;
                        if is_new {
                            log_debug!(
                                "[workspace] New solution detected ({} bytes)",
                                fingerprint.size
                            );
                            return SolutionWait::NewSolution {
                                source,
                                fingerprint,
                            };
                        }
                        // Same or empty content under a fresh mtime: remember
                        // the new stat so we do not re-hash every tick.
                        seen = SolutionFingerprint {
                            content_hash: seen.content_hash.clone(),
                            ..fingerprint
                        };
                    }
                    Err(e) => {
                        // Transient read failure (agent mid-write); next tick retries
                        log_debug!("[workspace] Solution read failed, retrying: {}", e);
                    }
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    // --- Atomic writes ---

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), BenchError> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| BenchError::Internal(format!("Failed to serialize {}: {}", name, e)))?;
        self.write_atomic(name, &format!("{}\n", json))
    }

    /// Write-temp-plus-rename with a small retry budget. The file is either
    /// the old version or the new version, never partial.
    fn write_atomic(&self, name: &str, contents: &str) -> Result<(), BenchError> {
        let path = self.dir.join(name);

        let mut last_error = String::new();
        for attempt in 1..=WRITE_RETRY_ATTEMPTS {
            match write_atomic_once(&path, contents) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_error = e;
                    if attempt < WRITE_RETRY_ATTEMPTS {
                        log_warn!(
                            "Write of {} failed (attempt {}/{}): {}",
                            path.display(),
                            attempt,
                            WRITE_RETRY_ATTEMPTS,
                            last_error
                        );
                        std::thread::sleep(Duration::from_millis(WRITE_RETRY_DELAY_MS));
                    }
                }
            }
        }

        Err(BenchError::workspace(&path, last_error))
    }
}

fn write_atomic_once(path: &Path, contents: &str) -> Result<(), String> {
    let parent = path
        .parent()
        .ok_or_else(|| format!("Cannot determine parent directory of {}", path.display()))?;

    let temp_file = NamedTempFile::new_in(parent)
        .map_err(|e| format!("Failed to create temp file in {}: {}", parent.display(), e))?;

    std::fs::write(temp_file.path(), contents)
        .map_err(|e| format!("Failed to write temp file: {}", e))?;

    // sync to disk before rename
    let file = std::fs::File::open(temp_file.path())
        .map_err(|e| format!("Failed to open temp file for sync: {}", e))?;
    file.sync_all()
        .map_err(|e| format!("Failed to sync temp file: {}", e))?;

    temp_file
        .persist(path)
        .map_err(|e| format!("Failed to rename temp file to {}: {}", path.display(), e))?;

    Ok(())
}
