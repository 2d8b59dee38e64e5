use crate::rules::{registry, RuleOutcome};
use crate::sandbox::Callable;
use crate::task::EvaluatorConfig;
use crate::types::{Phase, TestCase};
use crate::log_debug;

/// One rule failure occurrence, before aggregation. Scopes here are raw;
/// obfuscation happens at feedback emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawViolation {
    pub rule_id: String,
    pub scope: String,
}

/// Outcome of one evaluator pass over the live test set of a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub violations: Vec<RawViolation>,
    /// Fraction of live tests on which every phase rule passed.
    pub coverage: f64,
    pub tests_total: u32,
    /// Number of (rule, test) pairs checked.
    pub checks_total: u32,
    pub checks_failed: u32,
    /// Set when a sandbox call hit the deadline. The session died with it,
    /// so the pass was cut short and the attempt counts as an execution
    /// error rather than a verdict.
    pub timed_out: Option<f64>,
}

impl Evaluation {
    /// True when nothing passed at all: zero coverage and every rule failed
    /// on every relevant test.
    pub fn is_total_failure(&self) -> bool {
        self.checks_total > 0 && self.checks_failed == self.checks_total
    }
}

/// Tests that are live in `phase`: introduced in this phase or any earlier
/// one. A case introduced in phase k stays live forever, which is what keeps
/// later phases from regressing earlier ones.
pub fn live_tests<'a>(tests: &'a [TestCase], phase: &Phase) -> Vec<&'a TestCase> {
    tests.iter().filter(|tc| tc.phase <= phase.id).collect()
}

/// Run every rule of `phase` against every live test case.
///
/// Dispatch is a registry lookup from the rule's bound archetype to a check
/// function. A missing or unknown binding scores as an `error`-scoped
/// failure for each test rather than crashing the runner; `validate` catches
/// these before a run ever starts.
///
/// Coverage is a whole-test measure: a test counts only if all rules passed
/// on it.
pub async fn evaluate(
    callable: &mut dyn Callable,
    tests: &[TestCase],
    phase: &Phase,
    evaluator: &EvaluatorConfig,
) -> Evaluation {
    let checks = registry();
    let live = live_tests(tests, phase);

    let mut violations = Vec::new();
    let mut passed_tests = 0u32;
    let mut checks_total = 0u32;
    let mut checks_failed = 0u32;
    let mut timed_out = None;

    'tests: for &tc in &live {
        let mut test_clean = true;

        for rule in &phase.rules {
            checks_total += 1;

            let outcome = match evaluator
                .binding(&rule.id)
                .and_then(|b| checks.get(b.check.as_str()).map(|f| (f, b)))
            {
                Some((check, binding)) => check(callable, tc, binding).await,
                None => {
                    log_debug!("[eval] Rule '{}' has no usable binding", rule.id);
                    RuleOutcome::Errored
                }
            };

            if let RuleOutcome::TimedOut(secs) = outcome {
                // The deadline killed the session; nothing further can run.
                checks_failed += 1;
                timed_out = Some(secs);
                break 'tests;
            }

            if let Some(scope) = outcome.failure_scope() {
                test_clean = false;
                checks_failed += 1;
                violations.push(RawViolation {
                    rule_id: rule.id.clone(),
                    scope: scope.to_string(),
                });
            }
        }

        if test_clean {
            passed_tests += 1;
        }
    }

    let tests_total = live.len() as u32;
    let coverage = if timed_out.is_some() {
        0.0
    } else if tests_total == 0 {
        1.0
    } else {
        f64::from(passed_tests) / f64::from(tests_total)
    };

    Evaluation {
        violations,
        coverage,
        tests_total,
        checks_total,
        checks_failed,
        timed_out,
    }
}

