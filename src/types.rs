use serde::{Deserialize, Serialize};
use serde_json::Value;

// --- Enums ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
    Expert,
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Difficulty::Easy => write!(f, "easy"),
            Difficulty::Medium => write!(f, "medium"),
            Difficulty::Hard => write!(f, "hard"),
            Difficulty::Expert => write!(f, "expert"),
        }
    }
}

pub fn parse_difficulty(s: &str) -> Result<Difficulty, String> {
    match s.to_lowercase().as_str() {
        "easy" => Ok(Difficulty::Easy),
        "medium" => Ok(Difficulty::Medium),
        "hard" => Ok(Difficulty::Hard),
        "expert" => Ok(Difficulty::Expert),
        _ => Err(format!(
            "Invalid difficulty '{}': expected easy, medium, hard, or expert",
            s
        )),
    }
}

/// Classification of one counted attempt, as written to the `feedback` file.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// No violations and full coverage.
    Valid,
    /// Some tests pass, some rules fail.
    PartiallyValid,
    /// Zero coverage and every rule failed on every relevant test.
    Invalid,
    /// The callable could not be obtained or evaluation was cut short.
    Error,
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptStatus::Valid => write!(f, "valid"),
            AttemptStatus::PartiallyValid => write!(f, "partially_valid"),
            AttemptStatus::Invalid => write!(f, "invalid"),
            AttemptStatus::Error => write!(f, "error"),
        }
    }
}

/// Terminal outcome of a whole run.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Error,
    Timeout,
    Aborted,
}

impl RunOutcome {
    /// Process exit code for this outcome. Each class gets a distinct code;
    /// code 1 is reserved for configuration/usage errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Failed => 2,
            RunOutcome::Error => 3,
            RunOutcome::Timeout => 4,
            RunOutcome::Aborted => 5,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Failed => write!(f, "failed"),
            RunOutcome::Error => write!(f, "error"),
            RunOutcome::Timeout => write!(f, "timeout"),
            RunOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// Terminal status of a single phase, as reported in the run report.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Valid,
    Failed,
    Error,
    Aborted,
}

// --- Task configuration ---

/// Immutable descriptor of a task, parsed from `task.toml`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskConfig {
    pub task_id: String,
    pub name: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    pub interface: InterfaceConfig,
    pub execution: ExecutionConfig,
    pub limits: LimitsConfig,
    pub phases: Vec<Phase>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InterfaceConfig {
    /// Name of the callable the solution must define.
    pub function_name: String,
    /// Advisory signature text embedded in the agent's view. Never parsed.
    #[serde(default)]
    pub signature: String,
    /// Top-level module names the solution may import.
    #[serde(default)]
    pub allowed_imports: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecutionConfig {
    /// Wall-clock budget for each sandbox exchange, in seconds.
    pub timeout_seconds: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LimitsConfig {
    pub max_attempts_per_phase: u32,
    pub max_total_attempts: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Phase {
    pub id: u32,
    pub description: String,
    pub rules: Vec<Rule>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Rule {
    /// Stable identifier, e.g. `correct_output`. Bound to a checker by the
    /// task's evaluator config.
    pub id: String,
    pub description: String,
    /// Failure-mode labels this rule can emit. Never empty.
    pub scopes: Vec<String>,
}

// --- Test cases ---

/// One hidden test case. `input` and `expected` are arbitrary JSON values;
/// the case is live in every phase with id >= `phase`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TestCase {
    pub input: Value,
    pub expected: Value,
    #[serde(default)]
    pub phase: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TestCase {
    /// First tag, used as the default failure scope for output-style rules.
    pub fn primary_tag(&self) -> Option<&str> {
        self.tags.first().map(String::as_str)
    }
}

// --- Feedback ---

/// One aggregated violation: how many times a rule failed with a scope.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Violation {
    pub rule_id: String,
    pub scope: String,
    pub count: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FeedbackSummary {
    pub rules_total: u32,
    pub rules_passed: u32,
    pub rules_failed: u32,
    pub coverage: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct FeedbackDelta {
    pub coverage_change: f64,
    #[serde(default)]
    pub new_failures: Vec<String>,
    #[serde(default)]
    pub fixed_failures: Vec<String>,
}

/// Present when the callable itself could not be obtained or was cut off.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ExecutionError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub phase: u32,
}

/// The wire feedback record, written after every counted attempt and embedded
/// in the phase view for implicit evaluations.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Feedback {
    pub phase_id: u32,
    /// Absent for implicit phase-transition evaluations, which are not
    /// attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<u32>,
    pub status: AttemptStatus,
    pub status_reason: String,
    #[serde(default)]
    pub violations: Vec<Violation>,
    pub summary: FeedbackSummary,
    pub delta: FeedbackDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl Feedback {
    /// Rule ids with at least one violation, deduplicated, in first-seen order.
    pub fn failing_rule_ids(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for v in &self.violations {
            if !seen.contains(&v.rule_id) {
                seen.push(v.rule_id.clone());
            }
        }
        seen
    }
}

// --- Agent-facing views ---

/// Contents of the `task` workspace file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskView {
    pub task_id: String,
    pub name: String,
    pub difficulty: Difficulty,
    pub interface: InterfaceConfig,
    pub execution: ExecutionConfig,
    pub limits: LimitsConfig,
    pub total_phases: u32,
}

/// A rule as shown to the agent: scopes are post-obfuscation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RuleView {
    pub id: String,
    pub description: String,
    pub scopes: Vec<String>,
}

/// Contents of the `phase` workspace file, rewritten on every phase entry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PhaseView {
    pub phase_id: u32,
    pub description: String,
    pub rules: Vec<RuleView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implicit_evaluation: Option<Feedback>,
    pub attempts_used_this_phase: u32,
    pub attempts_remaining_this_phase: u32,
    pub total_attempts_remaining: u32,
}

// --- Run report ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PhaseReport {
    pub phase_id: u32,
    pub status: PhaseOutcome,
    pub attempts: u32,
    pub final_coverage: f64,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implicit_evaluation: Option<Feedback>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OverallReport {
    pub status: RunOutcome,
    pub total_attempts: u32,
    pub phases_completed: u32,
    pub total_duration_seconds: f64,
}

/// The `report` workspace file, written once on termination.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunReport {
    pub task_id: String,
    pub agent_id: String,
    pub timestamp: String,
    pub phases: Vec<PhaseReport>,
    pub overall: OverallReport,
}
