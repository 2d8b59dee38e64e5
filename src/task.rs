use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::bench_error::BenchError;
use crate::log_warn;
use crate::types::{
    Difficulty, ExecutionConfig, InterfaceConfig, LimitsConfig, Phase, Rule, TaskConfig, TestCase,
};

// --- On-disk file names ---

pub const DESCRIPTOR_FILE: &str = "task.toml";
pub const PROBLEM_FILE: &str = "problem.md";
pub const EVALUATOR_FILE: &str = "evaluator.toml";
pub const TESTS_FILE: &str = "tests.json";

// --- Evaluator bindings ---

/// Binds one rule id to a checker archetype with optional parameters.
/// Parsed from `evaluator.toml`: one `[rules.<id>]` table per rule.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct RuleBinding {
    /// Name of the registered checker (e.g. `correct_output`).
    pub check: String,
    /// Fixed failure scope, overriding tag-derived scopes.
    #[serde(default)]
    pub scope: Option<String>,
    /// Number of calls for comparison checkers (`deterministic`). Min 2.
    #[serde(default)]
    pub calls: Option<u32>,
    /// Expected exception class name (`correct_error`).
    #[serde(default)]
    pub error_type: Option<String>,
    /// Required substring of the exception message (`correct_error`).
    #[serde(default)]
    pub message_contains: Option<String>,
}

#[derive(Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub rules: HashMap<String, RuleBinding>,
}

impl EvaluatorConfig {
    pub fn binding(&self, rule_id: &str) -> Option<&RuleBinding> {
        self.rules.get(rule_id)
    }
}

// --- Loaded task ---

/// Everything loaded from a task directory. Immutable after load.
#[derive(Clone, Debug)]
pub struct LoadedTask {
    pub config: TaskConfig,
    pub problem: String,
    pub evaluator: EvaluatorConfig,
    pub tests: Vec<TestCase>,
    pub dir: PathBuf,
}

// --- Descriptor parsing ---

/// Raw shape of `task.toml`. Converted to `TaskConfig` after parsing.
#[derive(Deserialize, Debug)]
struct RawDescriptor {
    task: RawIdentity,
    interface: InterfaceConfig,
    execution: ExecutionConfig,
    limits: LimitsConfig,
    #[serde(default)]
    phases: Vec<RawPhase>,
}

#[derive(Deserialize, Debug)]
struct RawIdentity {
    id: String,
    name: String,
    #[serde(default)]
    difficulty: Difficulty,
}

#[derive(Deserialize, Debug)]
struct RawPhase {
    id: u32,
    description: String,
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Load and structurally validate a task directory.
///
/// Produces the immutable `(TaskConfig, EvaluatorConfig, tests)` triple the
/// runner consumes. Rejects missing files and descriptor shapes that cannot
/// drive the state machine (non-contiguous phases, empty rule or scope sets,
/// non-positive limits). Binding-level checks live in `validate_static`.
pub fn load_task(dir: &Path) -> Result<LoadedTask, BenchError> {
    if !dir.is_dir() {
        return Err(BenchError::Config(format!(
            "Task directory not found: {}",
            dir.display()
        )));
    }

    let descriptor_path = dir.join(DESCRIPTOR_FILE);
    let contents = read_required(&descriptor_path)?;
    let raw: RawDescriptor = toml::from_str(&contents).map_err(|e| {
        BenchError::Config(format!("Failed to parse {}: {}", descriptor_path.display(), e))
    })?;

    let config = TaskConfig {
        task_id: raw.task.id,
        name: raw.task.name,
        difficulty: raw.task.difficulty,
        interface: raw.interface,
        execution: raw.execution,
        limits: raw.limits,
        phases: raw
            .phases
            .into_iter()
            .map(|p| Phase {
                id: p.id,
                description: p.description,
                rules: p.rules,
            })
            .collect(),
    };

    let problem = read_required(&dir.join(PROBLEM_FILE))?;

    let evaluator_path = dir.join(EVALUATOR_FILE);
    let evaluator_contents = read_required(&evaluator_path)?;
    let evaluator: EvaluatorConfig = toml::from_str(&evaluator_contents).map_err(|e| {
        BenchError::Config(format!("Failed to parse {}: {}", evaluator_path.display(), e))
    })?;

    let tests_path = dir.join(TESTS_FILE);
    let tests_contents = read_required(&tests_path)?;
    let tests: Vec<TestCase> = serde_json::from_str(&tests_contents).map_err(|e| {
        BenchError::Config(format!("Failed to parse {}: {}", tests_path.display(), e))
    })?;

    validate_config(&config, &tests).map_err(BenchError::Validation)?;

    Ok(LoadedTask {
        config,
        problem,
        evaluator,
        tests,
        dir: dir.to_path_buf(),
    })
}

fn read_required(path: &Path) -> Result<String, BenchError> {
    if !path.exists() {
        return Err(BenchError::Config(format!(
            "Missing task file: {}",
            path.display()
        )));
    }
    std::fs::read_to_string(path)
        .map_err(|e| BenchError::Config(format!("Failed to read {}: {}", path.display(), e)))
}

// --- Structural validation ---

/// Validate descriptor shape. Accumulates every problem instead of stopping
/// at the first, so the operator gets one complete report.
fn validate_config(config: &TaskConfig, tests: &[TestCase]) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config.task_id.trim().is_empty() {
        errors.push("task.id must not be empty".to_string());
    }

    if config.interface.function_name.trim().is_empty() {
        errors.push("interface.function_name must not be empty".to_string());
    }

    if config.execution.timeout_seconds <= 0.0 {
        errors.push("execution.timeout_seconds must be positive".to_string());
    }

    if config.limits.max_attempts_per_phase == 0 {
        errors.push("limits.max_attempts_per_phase must be >= 1".to_string());
    }

    if config.limits.max_total_attempts == 0 {
        errors.push("limits.max_total_attempts must be >= 1".to_string());
    }

    if config.limits.max_total_attempts < config.limits.max_attempts_per_phase {
        errors.push(
            "limits.max_total_attempts must be >= limits.max_attempts_per_phase".to_string(),
        );
    }

    if config.phases.is_empty() {
        errors.push("task must declare at least one phase".to_string());
    }

    // Phase ids must form the contiguous sequence 0..N-1 in order
    for (idx, phase) in config.phases.iter().enumerate() {
        if phase.id as usize != idx {
            errors.push(format!(
                "phases[{}]: id {} breaks the contiguous 0..{} sequence",
                idx,
                phase.id,
                config.phases.len().saturating_sub(1)
            ));
        }

        if phase.rules.is_empty() {
            errors.push(format!("phases[{}]: rule set must not be empty", idx));
        }

        for rule in &phase.rules {
            if rule.scopes.is_empty() {
                errors.push(format!(
                    "phases[{}]: rule '{}' must declare at least one scope",
                    idx, rule.id
                ));
            }
        }
    }

    for (idx, tc) in tests.iter().enumerate() {
        if !config.phases.is_empty() && tc.phase as usize >= config.phases.len() {
            errors.push(format!(
                "tests[{}]: phase {} does not exist in this task",
                idx, tc.phase
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

// --- Static validation (administrative `validate` command) ---

/// Verify evaluator bindings and per-phase test coverage.
///
/// `known_checks` is the set of checker archetypes the registry exposes.
/// Every rule id appearing in any phase must have a binding whose `check`
/// resolves; every phase must have at least one live test case. Unused
/// bindings are allowed (tasks may stage rules for later phases).
pub fn validate_static(task: &LoadedTask, known_checks: &[&str]) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    for phase in &task.config.phases {
        for rule in &phase.rules {
            match task.evaluator.binding(&rule.id) {
                None => errors.push(format!(
                    "phase {}: rule '{}' has no binding in {}",
                    phase.id, rule.id, EVALUATOR_FILE
                )),
                Some(binding) if !known_checks.contains(&binding.check.as_str()) => {
                    errors.push(format!(
                        "rule '{}': unknown checker '{}' (known: {})",
                        rule.id,
                        binding.check,
                        known_checks.join(", ")
                    ));
                }
                Some(binding) => {
                    if binding.check == "deterministic" {
                        if let Some(calls) = binding.calls {
                            if calls < 2 {
                                errors.push(format!(
                                    "rule '{}': deterministic checker needs calls >= 2, got {}",
                                    rule.id, calls
                                ));
                            }
                        }
                    }
                }
            }
        }

        let live = task.tests.iter().filter(|tc| tc.phase <= phase.id).count();
        if live == 0 {
            errors.push(format!("phase {}: no test case is live", phase.id));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

// --- Task listing ---

/// Summary row for the `list` command.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub name: String,
    pub difficulty: Difficulty,
    pub phases: u32,
}

/// Enumerate loadable tasks under a directory, sorted by task id.
///
/// Directories without a descriptor are skipped silently; directories whose
/// descriptor fails to load are skipped with a warning so one broken task
/// does not hide the rest.
pub fn list_tasks(tasks_dir: &Path) -> Result<Vec<TaskSummary>, BenchError> {
    let entries = std::fs::read_dir(tasks_dir).map_err(|e| {
        BenchError::Config(format!("Failed to read {}: {}", tasks_dir.display(), e))
    })?;

    let mut summaries = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            BenchError::Config(format!("Failed to read {}: {}", tasks_dir.display(), e))
        })?;
        let path = entry.path();
        if !path.is_dir() || !path.join(DESCRIPTOR_FILE).exists() {
            continue;
        }
        match load_task(&path) {
            Ok(task) => summaries.push(TaskSummary {
                task_id: task.config.task_id,
                name: task.config.name,
                difficulty: task.config.difficulty,
                phases: task.config.phases.len() as u32,
            }),
            Err(e) => {
                log_warn!("Skipping {}: {}", path.display(), e);
            }
        }
    }

    summaries.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    Ok(summaries)
}
