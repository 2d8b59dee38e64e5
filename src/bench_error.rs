/// Error enum for failures that belong to the runner itself, not to the
/// agent's code. Sandbox load/call failures and evaluator check failures are
/// data (they become `Feedback`); only these categories propagate as `Err`.
///
/// Categories:
/// - Config: bad task directory or descriptor, task does not start
/// - Workspace: workspace I/O failed past the retry budget
/// - Spawn: the sandbox interpreter could not be started at all
/// - Internal: a bug in the runner's own state machine
#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    // Config -- task does not start
    #[error("Task configuration error: {0}")]
    Config(String),

    #[error("Task validation failed:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Validation(Vec<String>),

    // Workspace -- I/O failed past the retry budget
    #[error("Workspace error at {path}: {message}")]
    Workspace { path: String, message: String },

    #[error("Workspace is locked: {0}")]
    WorkspaceLocked(String),

    // Spawn -- interpreter missing or IPC setup failed
    #[error("Failed to start sandbox interpreter '{interpreter}': {message}")]
    Spawn {
        interpreter: String,
        message: String,
    },

    // Internal -- runner bug, propagates to the process boundary
    #[error("Internal runner error: {0}")]
    Internal(String),
}

impl BenchError {
    /// Returns true if the error is a task/configuration problem the
    /// operator must fix before the run can start.
    pub fn is_config(&self) -> bool {
        matches!(self, BenchError::Config(_) | BenchError::Validation(_))
    }

    pub fn workspace(path: &std::path::Path, message: impl Into<String>) -> Self {
        BenchError::Workspace {
            path: path.display().to_string(),
            message: message.into(),
        }
    }
}

/// Allows `?` to convert `BenchError` to `String` in code that still uses
/// `Result<T, String>` (CLI handlers).
impl From<BenchError> for String {
    fn from(err: BenchError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_each_issue() {
        let err = BenchError::Validation(vec!["first".to_string(), "second".to_string()]);
        let msg = err.to_string();
        assert!(msg.contains("  - first"));
        assert!(msg.contains("  - second"));
    }

    #[test]
    fn config_errors_are_config() {
        assert!(BenchError::Config("x".to_string()).is_config());
        assert!(BenchError::Validation(vec![]).is_config());
        assert!(!BenchError::Internal("x".to_string()).is_config());
    }
}
