use std::collections::HashMap;
use std::pin::Pin;

use serde_json::Value;

use crate::sandbox::Callable;
use crate::task::RuleBinding;
use crate::types::TestCase;

/// Scope recorded when a check itself blows up (sandbox error, dead session,
/// unknown binding). Always transparent on the wire.
pub const ERROR_SCOPE: &str = "error";

/// Default number of calls for the `deterministic` checker.
const DETERMINISTIC_DEFAULT_CALLS: u32 = 2;

// --- Outcomes ---

/// Result of one rule applied to one test case.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Passed,
    Failed { scope: String },
    /// The check could not be completed. Scored as a failure with the
    /// `error` scope.
    Errored,
    /// A sandbox call hit the wall-clock deadline. The session is gone, so
    /// the whole attempt degrades to an execution error.
    TimedOut(f64),
}

impl RuleOutcome {
    pub fn failure_scope(&self) -> Option<&str> {
        match self {
            RuleOutcome::Passed => None,
            RuleOutcome::Failed { scope } => Some(scope),
            RuleOutcome::Errored | RuleOutcome::TimedOut(_) => Some(ERROR_SCOPE),
        }
    }
}

/// Map a sandbox call failure to an outcome: timeouts are surfaced
/// distinctly, everything else degrades to the `error` scope.
fn call_error_outcome(error: &crate::sandbox::CallError) -> RuleOutcome {
    match error {
        crate::sandbox::CallError::Timeout(secs) => RuleOutcome::TimedOut(*secs),
        _ => RuleOutcome::Errored,
    }
}

// --- Registry ---

pub type CheckFuture<'a> = Pin<Box<dyn std::future::Future<Output = RuleOutcome> + Send + 'a>>;

/// Common signature every checker shares. Tasks select checkers by archetype
/// name in their evaluator config; new checkers enter by registering here.
pub type CheckFn =
    for<'a> fn(&'a mut dyn Callable, &'a TestCase, &'a RuleBinding) -> CheckFuture<'a>;

/// Names of all built-in checkers, for static validation and diagnostics.
pub fn archetype_names() -> &'static [&'static str] {
    &[
        "correct_output",
        "no_mutation",
        "deterministic",
        "correct_type",
        "correct_error",
    ]
}

/// The built-in checker registry.
pub fn registry() -> HashMap<&'static str, CheckFn> {
    let mut map: HashMap<&'static str, CheckFn> = HashMap::new();
    map.insert("correct_output", check_correct_output);
    map.insert("no_mutation", check_no_mutation);
    map.insert("deterministic", check_deterministic);
    map.insert("correct_type", check_correct_type);
    map.insert("correct_error", check_correct_error);
    map
}

// --- Scope derivation ---

/// Failure scope for output-style checks: binding override, else the test's
/// first tag, else `unknown`.
fn failure_scope(tc: &TestCase, binding: &RuleBinding) -> String {
    if let Some(ref scope) = binding.scope {
        return scope.clone();
    }
    tc.primary_tag().unwrap_or("unknown").to_string()
}

/// Classify a detected mutation as `direct` or `nested`.
///
/// The classification keys on the element that changed, not on the shape of
/// the whole input: a scalar element changing beside an untouched inner list
/// is still `direct`. `nested` means the first differing element is itself a
/// container. Length and key-set changes are `direct`.
fn mutation_scope(before: &Value, after: &Value) -> &'static str {
    match (before, after) {
        (Value::Array(b), Value::Array(a)) => {
            if b.len() != a.len() {
                return "direct";
            }
            for (bv, av) in b.iter().zip(a.iter()) {
                if bv != av {
                    return if is_container(bv) { "nested" } else { "direct" };
                }
            }
            "direct"
        }
        (Value::Object(b), Value::Object(a)) => {
            if b.len() != a.len() {
                return "direct";
            }
            for (key, bv) in b {
                match a.get(key) {
                    Some(av) if bv != av => {
                        return if is_container(bv) { "nested" } else { "direct" };
                    }
                    Some(_) => {}
                    None => return "direct",
                }
            }
            "direct"
        }
        _ => "direct",
    }
}

fn is_container(value: &Value) -> bool {
    matches!(value, Value::Array(_) | Value::Object(_))
}

/// Structural kind of a value, for `correct_type`.
fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// --- Checkers ---

/// Compare the callable's output on a deep copy of the input against the
/// expected value.
fn check_correct_output<'a>(
    callable: &'a mut dyn Callable,
    tc: &'a TestCase,
    binding: &'a RuleBinding,
) -> CheckFuture<'a> {
    Box::pin(async move {
        let input = tc.input.clone();
        match callable.call(&input).await {
            Ok(out) if out.result == tc.expected => RuleOutcome::Passed,
            Ok(_) => RuleOutcome::Failed {
                scope: failure_scope(tc, binding),
            },
            Err(e) => call_error_outcome(&e),
        }
    })
}

/// Snapshot the input, call, and require the argument to be unchanged.
fn check_no_mutation<'a>(
    callable: &'a mut dyn Callable,
    tc: &'a TestCase,
    binding: &'a RuleBinding,
) -> CheckFuture<'a> {
    Box::pin(async move {
        let snapshot = tc.input.clone();
        match callable.call(&snapshot).await {
            Ok(out) if out.argument_after == snapshot => RuleOutcome::Passed,
            Ok(out) => RuleOutcome::Failed {
                scope: binding
                    .scope
                    .clone()
                    .unwrap_or_else(|| mutation_scope(&snapshot, &out.argument_after).to_string()),
            },
            Err(e) => call_error_outcome(&e),
        }
    })
}

/// Call repeatedly on independent deep copies and require identical outputs.
fn check_deterministic<'a>(
    callable: &'a mut dyn Callable,
    tc: &'a TestCase,
    binding: &'a RuleBinding,
) -> CheckFuture<'a> {
    Box::pin(async move {
        let calls = binding
            .calls
            .unwrap_or(DETERMINISTIC_DEFAULT_CALLS)
            .max(DETERMINISTIC_DEFAULT_CALLS);

        let mut first: Option<Value> = None;
        for _ in 0..calls {
            let input = tc.input.clone();
            match callable.call(&input).await {
                Ok(out) => match first {
                    None => first = Some(out.result),
                    Some(ref expected) if *expected == out.result => {}
                    Some(_) => {
                        return RuleOutcome::Failed {
                            scope: binding
                                .scope
                                .clone()
                                .unwrap_or_else(|| "ordering".to_string()),
                        }
                    }
                },
                Err(e) => return call_error_outcome(&e),
            }
        }
        RuleOutcome::Passed
    })
}

/// Structural kind check of the return value against the expected value.
fn check_correct_type<'a>(
    callable: &'a mut dyn Callable,
    tc: &'a TestCase,
    binding: &'a RuleBinding,
) -> CheckFuture<'a> {
    Box::pin(async move {
        let input = tc.input.clone();
        match callable.call(&input).await {
            Ok(out) if value_kind(&out.result) == value_kind(&tc.expected) => RuleOutcome::Passed,
            Ok(_) => RuleOutcome::Failed {
                scope: failure_scope(tc, binding),
            },
            Err(e) => call_error_outcome(&e),
        }
    })
}

/// Require the call to raise: the exception class must match `error_type`
/// (when set) and its message must contain `message_contains` (when set).
/// A normal return or the wrong exception fails; a timeout or dead session
/// is an error, not a verdict.
fn check_correct_error<'a>(
    callable: &'a mut dyn Callable,
    tc: &'a TestCase,
    binding: &'a RuleBinding,
) -> CheckFuture<'a> {
    Box::pin(async move {
        let input = tc.input.clone();
        match callable.call(&input).await {
            Ok(_) => RuleOutcome::Failed {
                scope: failure_scope(tc, binding),
            },
            Err(crate::sandbox::CallError::RuntimeException { exception, message }) => {
                let type_ok = binding
                    .error_type
                    .as_ref()
                    .map(|t| *t == exception)
                    .unwrap_or(true);
                let message_ok = binding
                    .message_contains
                    .as_ref()
                    .map(|m| message.contains(m.as_str()))
                    .unwrap_or(true);
                if type_ok && message_ok {
                    RuleOutcome::Passed
                } else {
                    RuleOutcome::Failed {
                        scope: failure_scope(tc, binding),
                    }
                }
            }
            Err(e) => call_error_outcome(&e),
        }
    })
}
