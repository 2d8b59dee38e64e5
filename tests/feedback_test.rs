mod common;

use phase_bench::evaluator::{Evaluation, RawViolation};
use phase_bench::feedback::{aggregate, build, build_error};
use phase_bench::obfuscate::short_digest;
use phase_bench::types::{AttemptStatus, Feedback};

fn raw(rule_id: &str, scope: &str) -> RawViolation {
    RawViolation {
        rule_id: rule_id.to_string(),
        scope: scope.to_string(),
    }
}

fn evaluation(
    violations: Vec<RawViolation>,
    coverage: f64,
    tests_total: u32,
    checks_total: u32,
    checks_failed: u32,
) -> Evaluation {
    Evaluation {
        violations,
        coverage,
        tests_total,
        checks_total,
        checks_failed,
        timed_out: None,
    }
}

fn two_rule_phase() -> phase_bench::types::Phase {
    common::make_phase(
        0,
        vec![
            common::make_rule("correct_output", &["divisible_by_7"]),
            common::make_rule("no_mutation", &["direct", "nested"]),
        ],
    )
}

// --- Aggregation ---

#[test]
fn aggregates_by_rule_and_raw_scope_in_first_seen_order() {
    let violations = vec![
        raw("correct_output", "divisible_by_7"),
        raw("no_mutation", "direct"),
        raw("correct_output", "divisible_by_7"),
        raw("correct_output", "plain_number"),
    ];

    let aggregated = aggregate(&violations);

    assert_eq!(aggregated.len(), 3);
    assert_eq!(aggregated[0].rule_id, "correct_output");
    assert_eq!(aggregated[0].scope, "divisible_by_7");
    assert_eq!(aggregated[0].count, 2);
    assert_eq!(aggregated[1].rule_id, "no_mutation");
    assert_eq!(aggregated[1].count, 1);
    assert_eq!(aggregated[2].scope, "plain_number");
}

// --- Status classification ---

#[test]
fn clean_evaluation_is_valid() {
    let phase = two_rule_phase();
    let fb = build(&phase, Some(1), &evaluation(vec![], 1.0, 4, 8, 0), None);

    assert_eq!(fb.status, AttemptStatus::Valid);
    assert!(fb.violations.is_empty());
    assert_eq!(fb.summary.rules_failed, 0);
    assert_eq!(fb.summary.rules_passed, 2);
    assert_eq!(fb.summary.coverage, 1.0);
    assert!(fb.status_reason.contains("All rules passed"));
}

#[test]
fn total_failure_is_invalid() {
    let phase = two_rule_phase();
    let violations = vec![
        raw("correct_output", "divisible_by_7"),
        raw("no_mutation", "direct"),
        raw("correct_output", "divisible_by_7"),
        raw("no_mutation", "direct"),
    ];
    let fb = build(&phase, Some(1), &evaluation(violations, 0.0, 2, 4, 4), None);

    assert_eq!(fb.status, AttemptStatus::Invalid);
    assert_eq!(fb.summary.rules_failed, 2);
}

#[test]
fn zero_coverage_with_some_passing_checks_is_partially_valid() {
    // Every test fails some rule, but not every (rule, test) pair failed.
    let phase = two_rule_phase();
    let violations = vec![raw("correct_output", "divisible_by_7")];
    let fb = build(&phase, Some(1), &evaluation(violations, 0.0, 1, 2, 1), None);

    assert_eq!(fb.status, AttemptStatus::PartiallyValid);
}

#[test]
fn partial_coverage_is_partially_valid() {
    let phase = two_rule_phase();
    let violations = vec![raw("correct_output", "divisible_by_7")];
    let fb = build(&phase, Some(1), &evaluation(violations, 0.5, 2, 4, 1), None);

    assert_eq!(fb.status, AttemptStatus::PartiallyValid);
    assert!(fb.status_reason.contains("correct_output"));
    assert_eq!(fb.summary.rules_passed, 1);
    assert_eq!(fb.summary.rules_failed, 1);
}

#[test]
fn load_failure_builds_error_feedback() {
    let phase = two_rule_phase();
    let fb = build_error(&phase, Some(1), "ImportViolation", "import of 'os' is not allowed");

    assert_eq!(fb.status, AttemptStatus::Error);
    assert!(fb.violations.is_empty());
    assert_eq!(fb.summary.coverage, 0.0);
    assert_eq!(fb.delta.coverage_change, 0.0);
    let error = fb.error.expect("error detail expected");
    assert_eq!(error.error_type, "ImportViolation");
    assert_eq!(error.phase, 0);
}

// --- Coverage bounds (invariants) ---

#[test]
fn full_coverage_implies_no_violations_and_no_failed_rules() {
    let phase = two_rule_phase();
    let fb = build(&phase, Some(3), &evaluation(vec![], 1.0, 5, 10, 0), None);

    assert_eq!(fb.summary.coverage, 1.0);
    assert!(fb.violations.is_empty());
    assert_eq!(fb.summary.rules_failed, 0);
}

// --- Delta ---

fn prior_feedback(coverage: f64, failing: &[&str]) -> Feedback {
    let phase = two_rule_phase();
    let violations = failing.iter().map(|id| raw(id, "direct")).collect();
    build(
        &phase,
        Some(1),
        &evaluation(violations, coverage, 4, 8, failing.len() as u32),
        None,
    )
}

#[test]
fn first_attempt_has_zero_coverage_change() {
    let phase = two_rule_phase();
    let violations = vec![raw("correct_output", "divisible_by_7")];
    let fb = build(&phase, Some(1), &evaluation(violations, 0.5, 2, 4, 1), None);

    assert_eq!(fb.delta.coverage_change, 0.0);
    assert_eq!(fb.delta.new_failures, vec!["correct_output"]);
    assert!(fb.delta.fixed_failures.is_empty());
}

#[test]
fn delta_tracks_new_and_fixed_failures() {
    let prior = prior_feedback(0.25, &["correct_output"]);

    let phase = two_rule_phase();
    let violations = vec![raw("no_mutation", "direct")];
    let fb = build(
        &phase,
        Some(2),
        &evaluation(violations, 0.75, 4, 8, 1),
        Some(&prior),
    );

    assert!((fb.delta.coverage_change - 0.5).abs() < 1e-9);
    assert_eq!(fb.delta.new_failures, vec!["no_mutation"]);
    assert_eq!(fb.delta.fixed_failures, vec!["correct_output"]);
}

#[test]
fn new_and_fixed_failures_are_disjoint() {
    let prior = prior_feedback(0.5, &["correct_output", "no_mutation"]);

    let phase = two_rule_phase();
    let violations = vec![raw("no_mutation", "nested")];
    let fb = build(
        &phase,
        Some(2),
        &evaluation(violations, 0.5, 4, 8, 1),
        Some(&prior),
    );

    for id in &fb.delta.new_failures {
        assert!(!fb.delta.fixed_failures.contains(id));
    }
    assert_eq!(fb.delta.fixed_failures, vec!["correct_output"]);
    assert!(fb.delta.new_failures.is_empty());
}

// --- Obfuscation on the wire ---

#[test]
fn transparent_scopes_survive_emission() {
    let phase = two_rule_phase();
    let violations = vec![raw("no_mutation", "direct"), raw("no_mutation", "nested")];
    let fb = build(&phase, Some(1), &evaluation(violations, 0.0, 1, 2, 2), None);

    let scopes: Vec<&str> = fb.violations.iter().map(|v| v.scope.as_str()).collect();
    assert_eq!(scopes, vec!["direct", "nested"]);
}

#[test]
fn opaque_scopes_are_digested_on_emission() {
    let phase = two_rule_phase();
    let violations = vec![
        raw("correct_output", "divisible_by_7"),
        raw("correct_output", "divisible_by_7"),
    ];
    let fb = build(&phase, Some(1), &evaluation(violations, 0.0, 1, 2, 2), None);

    assert_eq!(fb.violations.len(), 1);
    assert_eq!(
        fb.violations[0].scope,
        format!("scope_{}", short_digest("divisible_by_7"))
    );
    assert_eq!(fb.violations[0].count, 2);
    // Rule ids pass through verbatim.
    assert_eq!(fb.violations[0].rule_id, "correct_output");
}

#[test]
fn distinct_raw_scopes_stay_distinct_after_aggregation() {
    let phase = two_rule_phase();
    let violations = vec![
        raw("correct_output", "divisible_by_7"),
        raw("correct_output", "divisible_by_11"),
    ];
    let fb = build(&phase, Some(1), &evaluation(violations, 0.0, 1, 2, 2), None);

    assert_eq!(fb.violations.len(), 2);
    assert_ne!(fb.violations[0].scope, fb.violations[1].scope);
}

#[test]
fn implicit_feedback_carries_no_attempt_id() {
    let phase = two_rule_phase();
    let fb = build(&phase, None, &evaluation(vec![], 1.0, 1, 2, 0), None);

    assert_eq!(fb.attempt_id, None);
    let json = serde_json::to_value(&fb).unwrap();
    assert!(json.get("attempt_id").is_none());
}
