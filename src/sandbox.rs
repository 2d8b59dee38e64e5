use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::unistd::Pid;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};

use crate::log_debug;

/// Maximum time to wait for graceful shutdown after SIGTERM before SIGKILL.
const SIGTERM_GRACE_PERIOD_SECONDS: u64 = 5;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 100;

/// Default interpreter binary for executed code.
pub const DEFAULT_INTERPRETER: &str = "python3";

// --- Failure taxonomy ---

/// Failure to obtain a callable from submitted source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Missing function: {0}")]
    MissingFunction(String),

    #[error("Import violation: {0}")]
    ImportViolation(String),

    #[error("Load timed out after {0:.1}s")]
    Timeout(f64),

    #[error("{exception}: {message}")]
    Runtime { exception: String, message: String },

    #[error("Failed to start sandbox: {0}")]
    Spawn(String),
}

impl LoadError {
    /// Wire name for the feedback `error.type` field.
    pub fn error_type(&self) -> &'static str {
        match self {
            LoadError::Syntax(_) => "SyntaxError",
            LoadError::MissingFunction(_) => "MissingFunction",
            LoadError::ImportViolation(_) => "ImportViolation",
            LoadError::Timeout(_) => "Timeout",
            LoadError::Runtime { .. } => "RuntimeException",
            LoadError::Spawn(_) => "SpawnFailure",
        }
    }
}

/// Failure of one call on an already-loaded callable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("Call timed out after {0:.1}s")]
    Timeout(f64),

    #[error("{exception}: {message}")]
    RuntimeException { exception: String, message: String },

    /// The child died earlier in this evaluator pass (timeout or crash).
    #[error("Sandbox session is no longer alive")]
    SessionDead,
}

/// Result of one successful call: the return value plus the argument object
/// as the executed code left it. Comparing `argument_after` against the
/// pre-call deep copy is how mutation is detected.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutput {
    pub result: Value,
    pub argument_after: Value,
}

// --- Seams ---

/// One loaded solution, callable for the duration of a single evaluator pass.
/// May retain internal state between calls within the pass.
#[async_trait]
pub trait Callable: Send + std::fmt::Debug {
    async fn call(&mut self, input: &Value) -> Result<CallOutput, CallError>;
}

/// Produces callables from submitted source. Enables mocking in runner and
/// evaluator tests.
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    async fn load(
        &self,
        source: &str,
        function_name: &str,
        allowed_imports: &[String],
        timeout: Duration,
    ) -> Result<Box<dyn Callable>, LoadError>;
}

// --- Python subprocess sandbox ---

/// Harness executed by the child interpreter. The parent speaks a JSON-lines
/// protocol over stdin/stdout: one load request, then call requests until
/// stdin closes. The harness enforces the import allow-list and the builtins
/// deny-list; the parent enforces wall-clock deadlines and kills the process
/// group on expiry.
const PY_HARNESS: &str = r##"
import builtins
import json
import sys

DENIED_BUILTINS = {
    "eval", "exec", "compile", "open", "input",
    "exit", "quit", "breakpoint", "help", "__import__",
}


def _reply(obj):
    sys.stdout.write(json.dumps(obj) + "\n")
    sys.stdout.flush()


def _error(kind, message, exception=None):
    err = {"type": kind, "message": message}
    if exception is not None:
        err["exception"] = exception
    _reply({"ok": False, "error": err})


def main():
    line = sys.stdin.readline()
    if not line:
        return
    req = json.loads(line)
    source = req["source"]
    fn_name = req["function_name"]
    allowed = set(req.get("allowed_imports", []))

    real_import = builtins.__import__

    def guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
        top = name.split(".")[0]
        if top not in allowed:
            raise ImportError("import of '%s' is not allowed" % top)
        return real_import(name, globals, locals, fromlist, level)

    safe_builtins = {
        name: getattr(builtins, name)
        for name in dir(builtins)
        if name not in DENIED_BUILTINS
    }
    safe_builtins["__import__"] = guarded_import

    try:
        code = compile(source, "<solution>", "exec")
    except SyntaxError as e:
        _error("SyntaxError", str(e))
        return

    namespace = {"__builtins__": safe_builtins}
    try:
        exec(code, namespace)
    except ImportError as e:
        _error("ImportViolation", str(e))
        return
    except BaseException as e:
        _error("RuntimeException", str(e), exception=type(e).__name__)
        return

    fn = namespace.get(fn_name)
    if not callable(fn):
        _error("MissingFunction", "no callable named '%s' in solution" % fn_name)
        return

    _reply({"ok": True})

    for line in sys.stdin:
        if not line.strip():
            continue
        req = json.loads(line)
        if req.get("op") != "call":
            return
        arg = req.get("input")
        try:
            result = fn(arg)
        except ImportError as e:
            _error("ImportViolation", str(e))
            continue
        except BaseException as e:
            _error("RuntimeException", str(e), exception=type(e).__name__)
            continue
        try:
            text = json.dumps(
                {"ok": True, "result": result, "argument_after": arg},
                allow_nan=False,
            )
        except (TypeError, ValueError):
            _error(
                "RuntimeException",
                "return value is not JSON-serializable",
                exception="TypeError",
            )
            continue
        sys.stdout.write(text + "\n")
        sys.stdout.flush()


main()
"##;

/// Wire shape of a child reply line.
#[derive(Deserialize)]
struct Reply {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    argument_after: Option<Value>,
    #[serde(default)]
    error: Option<ReplyError>,
}

#[derive(Deserialize)]
struct ReplyError {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    exception: Option<String>,
    #[serde(default)]
    message: String,
}

/// Spawns one interpreter child per loaded solution.
pub struct PySandbox {
    interpreter: String,
}

impl PySandbox {
    pub fn new(interpreter: &str) -> Self {
        Self {
            interpreter: interpreter.to_string(),
        }
    }
}

#[async_trait]
impl SandboxLauncher for PySandbox {
    async fn load(
        &self,
        source: &str,
        function_name: &str,
        allowed_imports: &[String],
        timeout: Duration,
    ) -> Result<Box<dyn Callable>, LoadError> {
        let mut cmd = tokio::process::Command::new(&self.interpreter);
        cmd.arg("-c").arg(PY_HARNESS);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        // SAFETY: pre_exec runs between fork() and exec() where only
        // async-signal-safe functions are permitted. setpgid is
        // async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        log_debug!("[sandbox] Spawning {}...", self.interpreter);
        let mut child = cmd
            .spawn()
            .map_err(|e| LoadError::Spawn(format!("{}: {}", self.interpreter, e)))?;

        let pgid = child
            .id()
            .ok_or_else(|| LoadError::Spawn("failed to get child PID".to_string()))?
            as i32;
        log_debug!("[sandbox] Child spawned (pid={})", pgid);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LoadError::Spawn("failed to open child stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LoadError::Spawn("failed to open child stdout".to_string()))?;

        let mut session = PyCallable {
            _child: child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            pgid,
            timeout,
            dead: false,
        };

        let load_req = json!({
            "op": "load",
            "source": source,
            "function_name": function_name,
            "allowed_imports": allowed_imports,
        });

        let reply = match session.exchange(&load_req).await {
            Ok(reply) => reply,
            Err(CallError::Timeout(secs)) => return Err(LoadError::Timeout(secs)),
            Err(CallError::SessionDead) => {
                return Err(LoadError::Spawn("child exited during load".to_string()))
            }
            Err(CallError::RuntimeException { exception, message }) => {
                return Err(LoadError::Runtime { exception, message })
            }
        };

        if reply.ok {
            return Ok(Box::new(session));
        }

        let ReplyError {
            kind,
            exception,
            message,
        } = reply.error.unwrap_or(ReplyError {
            kind: "RuntimeException".to_string(),
            exception: None,
            message: "malformed load reply".to_string(),
        });
        Err(match kind.as_str() {
            "SyntaxError" => LoadError::Syntax(message),
            "MissingFunction" => LoadError::MissingFunction(message),
            "ImportViolation" => LoadError::ImportViolation(message),
            _ => LoadError::Runtime {
                exception: exception.unwrap_or_else(|| kind.clone()),
                message,
            },
        })
    }
}

/// A live child interpreter holding one loaded solution.
struct PyCallable {
    _child: Child,
    stdin: ChildStdin,
    lines: tokio::io::Lines<BufReader<ChildStdout>>,
    pgid: i32,
    timeout: Duration,
    dead: bool,
}

impl std::fmt::Debug for PyCallable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyCallable")
            .field("pgid", &self.pgid)
            .field("timeout", &self.timeout)
            .field("dead", &self.dead)
            .finish()
    }
}

impl PyCallable {
    /// Send one request line and await one reply line under the deadline.
    /// A deadline expiry kills the process group and marks the session dead.
    async fn exchange(&mut self, request: &Value) -> Result<Reply, CallError> {
        if self.dead {
            return Err(CallError::SessionDead);
        }

        let mut line = request.to_string();
        line.push('\n');
        if self.stdin.write_all(line.as_bytes()).await.is_err() {
            self.dead = true;
            return Err(CallError::SessionDead);
        }

        match tokio::time::timeout(self.timeout, self.lines.next_line()).await {
            Err(_) => {
                log_debug!(
                    "[sandbox] TIMEOUT after {:.1}s, killing process group",
                    self.timeout.as_secs_f64()
                );
                self.dead = true;
                kill_process_group(self.pgid).await;
                Err(CallError::Timeout(self.timeout.as_secs_f64()))
            }
            Ok(Ok(Some(text))) => serde_json::from_str(&text).map_err(|_| {
                self.dead = true;
                CallError::SessionDead
            }),
            Ok(_) => {
                // stdout closed or read failed: the child is gone
                self.dead = true;
                Err(CallError::SessionDead)
            }
        }
    }
}

#[async_trait]
impl Callable for PyCallable {
    async fn call(&mut self, input: &Value) -> Result<CallOutput, CallError> {
        let reply = self.exchange(&json!({"op": "call", "input": input})).await?;

        if reply.ok {
            return Ok(CallOutput {
                result: reply.result.unwrap_or(Value::Null),
                argument_after: reply.argument_after.unwrap_or(Value::Null),
            });
        }

        let error = reply.error.unwrap_or(ReplyError {
            kind: "RuntimeException".to_string(),
            exception: None,
            message: "malformed call reply".to_string(),
        });
        Err(CallError::RuntimeException {
            exception: error.exception.unwrap_or(error.kind),
            message: error.message,
        })
    }
}

impl Drop for PyCallable {
    fn drop(&mut self) {
        // Best-effort synchronous cleanup; kill_on_drop covers the direct
        // child, this covers anything it spawned into the group.
        let _ = nix::sys::signal::killpg(Pid::from_raw(self.pgid), nix::sys::signal::Signal::SIGKILL);
    }
}

/// Kill a process group. Sends SIGTERM, polls for exit, then SIGKILL.
///
/// The blocking poll-and-sleep loop runs on the tokio blocking thread pool
/// via `spawn_blocking` to avoid stalling async worker threads.
async fn kill_process_group(pgid: i32) {
    let join = tokio::task::spawn_blocking(move || {
        use nix::sys::signal::{killpg, Signal};

        let pgid = Pid::from_raw(pgid);

        if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
            return; // already gone
        }

        let deadline =
            std::time::Instant::now() + Duration::from_secs(SIGTERM_GRACE_PERIOD_SECONDS);
        let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

        while std::time::Instant::now() < deadline {
            // Signal 0 checks if the process group exists without sending one
            match killpg(pgid, None) {
                Err(nix::errno::Errno::ESRCH) => return,
                _ => std::thread::sleep(poll_interval),
            }
        }

        let _ = killpg(pgid, Signal::SIGKILL);
    });
    let _ = join.await;
}

// --- Mock sandbox ---

/// Reply produced by a mock program for one call.
#[derive(Clone)]
pub struct MockReply {
    pub result: Result<Value, CallError>,
    /// Argument as "left behind" by the call. `None` means unchanged.
    pub argument_after: Option<Value>,
}

impl MockReply {
    /// Successful call that leaves its argument untouched.
    pub fn returns(value: Value) -> Self {
        Self {
            result: Ok(value),
            argument_after: None,
        }
    }

    /// Successful call that mutated its argument to `after`.
    pub fn returns_mutating(value: Value, after: Value) -> Self {
        Self {
            result: Ok(value),
            argument_after: Some(after),
        }
    }

    pub fn fails(error: CallError) -> Self {
        Self {
            result: Err(error),
            argument_after: None,
        }
    }
}

type MockFn = Arc<dyn Fn(&Value) -> MockReply + Send + Sync>;

enum MockProgram {
    Loads(MockFn),
    FailsToLoad(LoadError),
}

/// Mock sandbox for evaluator and runner tests.
///
/// Maps exact solution source strings to host closures. Loading an
/// unregistered source yields a `MissingFunction` error, mirroring a
/// solution that defines the wrong name.
#[derive(Default)]
pub struct MockSandbox {
    programs: Mutex<HashMap<String, MockProgram>>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, source: &str, behavior: F)
    where
        F: Fn(&Value) -> MockReply + Send + Sync + 'static,
    {
        self.programs
            .lock()
            .expect("mock registry poisoned")
            .insert(source.to_string(), MockProgram::Loads(Arc::new(behavior)));
    }

    pub fn register_load_error(&self, source: &str, error: LoadError) {
        self.programs
            .lock()
            .expect("mock registry poisoned")
            .insert(source.to_string(), MockProgram::FailsToLoad(error));
    }
}

#[async_trait]
impl SandboxLauncher for MockSandbox {
    async fn load(
        &self,
        source: &str,
        function_name: &str,
        _allowed_imports: &[String],
        _timeout: Duration,
    ) -> Result<Box<dyn Callable>, LoadError> {
        let programs = self.programs.lock().expect("mock registry poisoned");
        match programs.get(source) {
            Some(MockProgram::Loads(f)) => Ok(Box::new(MockCallable {
                behavior: Arc::clone(f),
            })),
            Some(MockProgram::FailsToLoad(e)) => Err(e.clone()),
            None => Err(LoadError::MissingFunction(format!(
                "no callable named '{}' in solution",
                function_name
            ))),
        }
    }
}

struct MockCallable {
    behavior: MockFn,
}

impl std::fmt::Debug for MockCallable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCallable").finish()
    }
}

#[async_trait]
impl Callable for MockCallable {
    async fn call(&mut self, input: &Value) -> Result<CallOutput, CallError> {
        let reply = (self.behavior)(input);
        let result = reply.result?;
        Ok(CallOutput {
            result,
            argument_after: reply.argument_after.unwrap_or_else(|| input.clone()),
        })
    }
}
