#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use phase_bench::task::{self, EvaluatorConfig, LoadedTask, RuleBinding};
use phase_bench::types::{
    Difficulty, ExecutionConfig, InterfaceConfig, LimitsConfig, Phase, Rule, TaskConfig, TestCase,
};

/// Creates a `Rule` with the given id and scopes.
pub fn make_rule(id: &str, scopes: &[&str]) -> Rule {
    Rule {
        id: id.to_string(),
        description: format!("Rule {}", id),
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
    }
}

/// Creates a `Phase` with the given id and rules.
pub fn make_phase(id: u32, rules: Vec<Rule>) -> Phase {
    Phase {
        id,
        description: format!("Phase {}", id),
        rules,
    }
}

/// Creates a `TestCase` from JSON values.
pub fn make_test_case(
    input: serde_json::Value,
    expected: serde_json::Value,
    phase: u32,
    tags: &[&str],
) -> TestCase {
    TestCase {
        input,
        expected,
        phase,
        tags: tags.iter().map(|s| s.to_string()).collect(),
    }
}

/// Creates a `TaskConfig` with sensible limits and the given phases.
pub fn make_task_config(task_id: &str, phases: Vec<Phase>) -> TaskConfig {
    TaskConfig {
        task_id: task_id.to_string(),
        name: format!("Task {}", task_id),
        difficulty: Difficulty::Easy,
        interface: InterfaceConfig {
            function_name: "solve".to_string(),
            signature: "def solve(x)".to_string(),
            allowed_imports: Vec::new(),
        },
        execution: ExecutionConfig {
            timeout_seconds: 5.0,
        },
        limits: LimitsConfig {
            max_attempts_per_phase: 3,
            max_total_attempts: 10,
        },
        phases,
    }
}

/// Binds every rule id to the `correct_output` archetype.
pub fn bind_all_correct_output(rule_ids: &[&str]) -> EvaluatorConfig {
    let mut evaluator = EvaluatorConfig::default();
    for id in rule_ids {
        evaluator.rules.insert(
            id.to_string(),
            RuleBinding {
                check: "correct_output".to_string(),
                scope: None,
                calls: None,
                error_type: None,
                message_contains: None,
            },
        );
    }
    evaluator
}

/// Creates a binding for an arbitrary archetype.
pub fn make_binding(check: &str) -> RuleBinding {
    RuleBinding {
        check: check.to_string(),
        scope: None,
        calls: None,
        error_type: None,
        message_contains: None,
    }
}

/// Assembles an in-memory `LoadedTask` without touching disk.
pub fn make_loaded_task(
    config: TaskConfig,
    evaluator: EvaluatorConfig,
    tests: Vec<TestCase>,
) -> LoadedTask {
    LoadedTask {
        config,
        problem: "# Problem\n\nSolve it.\n".to_string(),
        evaluator,
        tests,
        dir: PathBuf::from("."),
    }
}

// --- On-disk fixtures ---

/// The canonical two-phase FizzBuzz descriptor used across loader and
/// runner tests. Phase 1 extends the scope set with `divisible_by_7`.
pub const FIZZBUZZ_DESCRIPTOR: &str = r#"
[task]
id = "fizzbuzz"
name = "FizzBuzz"
difficulty = "easy"

[interface]
function_name = "fizzbuzz"
signature = "def fizzbuzz(n: int) -> str"
allowed_imports = []

[execution]
timeout_seconds = 5.0

[limits]
max_attempts_per_phase = 3
max_total_attempts = 10

[[phases]]
id = 0
description = "Classic FizzBuzz"

[[phases.rules]]
id = "correct_output"
description = "Return the expected string for each input"
scopes = ["divisible_by_3", "divisible_by_5", "divisible_by_15", "plain_number"]

[[phases]]
id = 1
description = "FizzBuzz with an extra divisor"

[[phases.rules]]
id = "correct_output"
description = "Return the expected string for each input"
scopes = ["divisible_by_3", "divisible_by_5", "divisible_by_15", "plain_number", "divisible_by_7"]
"#;

pub const FIZZBUZZ_EVALUATOR: &str = r#"
[rules.correct_output]
check = "correct_output"
"#;

pub const FIZZBUZZ_TESTS: &str = r#"[
  {"input": 3, "expected": "Fizz", "phase": 0, "tags": ["divisible_by_3"]},
  {"input": 5, "expected": "Buzz", "phase": 0, "tags": ["divisible_by_5"]},
  {"input": 15, "expected": "FizzBuzz", "phase": 0, "tags": ["divisible_by_15"]},
  {"input": 4, "expected": "4", "phase": 0, "tags": ["plain_number"]},
  {"input": 7, "expected": "Bazz", "phase": 1, "tags": ["divisible_by_7"]}
]"#;

pub const FIZZBUZZ_PROBLEM: &str = "# FizzBuzz\n\nImplement `fizzbuzz(n)`.\n";

/// Writes a complete task directory with the given file contents.
pub fn write_task_dir(
    dir: &Path,
    descriptor: &str,
    problem: &str,
    evaluator: &str,
    tests: &str,
) {
    fs::create_dir_all(dir).expect("Failed to create task dir");
    fs::write(dir.join(task::DESCRIPTOR_FILE), descriptor).expect("Failed to write descriptor");
    fs::write(dir.join(task::PROBLEM_FILE), problem).expect("Failed to write problem");
    fs::write(dir.join(task::EVALUATOR_FILE), evaluator).expect("Failed to write evaluator");
    fs::write(dir.join(task::TESTS_FILE), tests).expect("Failed to write tests");
}

/// Creates a temp directory containing the FizzBuzz fixture task.
pub fn fizzbuzz_task_dir() -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    write_task_dir(
        dir.path(),
        FIZZBUZZ_DESCRIPTOR,
        FIZZBUZZ_PROBLEM,
        FIZZBUZZ_EVALUATOR,
        FIZZBUZZ_TESTS,
    );
    dir
}

/// Loads the FizzBuzz fixture from a fresh temp directory.
pub fn load_fizzbuzz() -> (TempDir, LoadedTask) {
    let dir = fizzbuzz_task_dir();
    let task = task::load_task(dir.path()).expect("FizzBuzz fixture should load");
    (dir, task)
}
