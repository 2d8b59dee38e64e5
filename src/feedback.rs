use crate::evaluator::{Evaluation, RawViolation};
use crate::obfuscate::obfuscate_scope;
use crate::types::{
    AttemptStatus, ExecutionError, Feedback, FeedbackDelta, FeedbackSummary, Phase, Violation,
};

/// Group raw violations by `(rule_id, scope)` in first-seen order, counting
/// occurrences. Aggregation keys on raw scopes; two scopes that collide
/// under the short digest still aggregate separately here.
pub fn aggregate(raw: &[RawViolation]) -> Vec<Violation> {
    let mut aggregated: Vec<Violation> = Vec::new();
    for v in raw {
        match aggregated
            .iter_mut()
            .find(|a| a.rule_id == v.rule_id && a.scope == v.scope)
        {
            Some(existing) => existing.count += 1,
            None => aggregated.push(Violation {
                rule_id: v.rule_id.clone(),
                scope: v.scope.clone(),
                count: 1,
            }),
        }
    }
    aggregated
}

/// Build the wire feedback for a completed evaluation.
///
/// `attempt_id` is `None` for implicit phase-transition evaluations, which
/// are not attempts. `prior` is the most recent feedback for this task
/// across phases; the delta is computed against it.
pub fn build(
    phase: &Phase,
    attempt_id: Option<u32>,
    evaluation: &Evaluation,
    prior: Option<&Feedback>,
) -> Feedback {
    let aggregated = aggregate(&evaluation.violations);

    let failing: Vec<String> = distinct_rule_ids(&aggregated);
    let rules_total = phase.rules.len() as u32;
    let rules_failed = failing.len() as u32;

    let status = if aggregated.is_empty() && evaluation.coverage >= 1.0 {
        AttemptStatus::Valid
    } else if evaluation.coverage <= 0.0 && evaluation.is_total_failure() {
        AttemptStatus::Invalid
    } else {
        AttemptStatus::PartiallyValid
    };

    let status_reason = match status {
        AttemptStatus::Valid => "All rules passed on all live tests".to_string(),
        _ => format!("Failing rules: {}", failing.join(", ")),
    };

    Feedback {
        phase_id: phase.id,
        attempt_id,
        status,
        status_reason,
        violations: obfuscate(aggregated),
        summary: FeedbackSummary {
            rules_total,
            rules_passed: rules_total.saturating_sub(rules_failed),
            rules_failed,
            coverage: evaluation.coverage,
        },
        delta: delta_against(prior, evaluation.coverage, &failing),
        error: None,
    }
}

/// Build the wire feedback for an attempt whose callable could not be
/// obtained (load failure or load timeout). Rule checks were skipped, so
/// there are no violations and nothing to delta: the record carries the
/// error taxonomy instead.
pub fn build_error(
    phase: &Phase,
    attempt_id: Option<u32>,
    error_type: &str,
    message: &str,
) -> Feedback {
    Feedback {
        phase_id: phase.id,
        attempt_id,
        status: AttemptStatus::Error,
        status_reason: format!("Execution error: {}", error_type),
        violations: Vec::new(),
        summary: FeedbackSummary {
            rules_total: phase.rules.len() as u32,
            rules_passed: 0,
            rules_failed: 0,
            coverage: 0.0,
        },
        delta: FeedbackDelta::default(),
        error: Some(ExecutionError {
            error_type: error_type.to_string(),
            message: message.to_string(),
            phase: phase.id,
        }),
    }
}

fn delta_against(prior: Option<&Feedback>, coverage: f64, failing: &[String]) -> FeedbackDelta {
    let Some(prior) = prior else {
        return FeedbackDelta {
            coverage_change: 0.0,
            new_failures: failing.to_vec(),
            fixed_failures: Vec::new(),
        };
    };

    let prior_failing = prior.failing_rule_ids();
    FeedbackDelta {
        coverage_change: coverage - prior.summary.coverage,
        new_failures: failing
            .iter()
            .filter(|id| !prior_failing.contains(id))
            .cloned()
            .collect(),
        fixed_failures: prior_failing
            .iter()
            .filter(|id| !failing.contains(id))
            .cloned()
            .collect(),
    }
}

fn distinct_rule_ids(violations: &[Violation]) -> Vec<String> {
    let mut seen = Vec::new();
    for v in violations {
        if !seen.contains(&v.rule_id) {
            seen.push(v.rule_id.clone());
        }
    }
    seen
}

fn obfuscate(violations: Vec<Violation>) -> Vec<Violation> {
    violations
        .into_iter()
        .map(|v| Violation {
            scope: obfuscate_scope(&v.scope),
            ..v
        })
        .collect()
}
