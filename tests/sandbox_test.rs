use std::time::Duration;

use serde_json::json;

use phase_bench::sandbox::{
    CallError, Callable, LoadError, PySandbox, SandboxLauncher, DEFAULT_INTERPRETER,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn sandbox() -> PySandbox {
    PySandbox::new(DEFAULT_INTERPRETER)
}

async fn load(source: &str) -> Result<Box<dyn Callable>, LoadError> {
    load_with_imports(source, &[]).await
}

async fn load_with_imports(
    source: &str,
    allowed: &[&str],
) -> Result<Box<dyn Callable>, LoadError> {
    let allowed: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
    sandbox().load(source, "f", &allowed, TIMEOUT).await
}

// --- Successful loads and calls ---

#[tokio::test]
async fn loads_and_calls_a_simple_function() {
    let mut callable = load("def f(n):\n    return n * 2\n").await.unwrap();

    let out = callable.call(&json!(21)).await.unwrap();
    assert_eq!(out.result, json!(42));
    assert_eq!(out.argument_after, json!(21));
}

#[tokio::test]
async fn handles_structured_values_across_the_boundary() {
    let source = "def f(data):\n    return {\"keys\": sorted(data.keys()), \"n\": len(data)}\n";
    let mut callable = load(source).await.unwrap();

    let out = callable
        .call(&json!({"b": 1, "a": [1, 2, {"x": null}]}))
        .await
        .unwrap();
    assert_eq!(out.result, json!({"keys": ["a", "b"], "n": 2}));
}

#[tokio::test]
async fn reports_argument_mutation() {
    let source = "def f(xs):\n    xs.append(99)\n    return sum(xs)\n";
    let mut callable = load(source).await.unwrap();

    let out = callable.call(&json!([1, 2, 3])).await.unwrap();
    assert_eq!(out.result, json!(105));
    assert_eq!(out.argument_after, json!([1, 2, 3, 99]));
}

#[tokio::test]
async fn retains_internal_state_across_calls_in_one_pass() {
    let source = "\
_seen = []

def f(n):
    _seen.append(n)
    return len(_seen)
";
    let mut callable = load(source).await.unwrap();

    assert_eq!(callable.call(&json!(1)).await.unwrap().result, json!(1));
    assert_eq!(callable.call(&json!(2)).await.unwrap().result, json!(2));
}

// --- Load failure taxonomy ---

#[tokio::test]
async fn syntax_errors_are_classified() {
    let err = load("def f(n:\n    return n\n").await.unwrap_err();
    assert!(matches!(err, LoadError::Syntax(_)), "got: {:?}", err);
    assert_eq!(err.error_type(), "SyntaxError");
}

#[tokio::test]
async fn missing_function_is_classified() {
    let err = load("def g(n):\n    return n\n").await.unwrap_err();
    assert!(matches!(err, LoadError::MissingFunction(_)), "got: {:?}", err);
    assert_eq!(err.error_type(), "MissingFunction");
}

#[tokio::test]
async fn disallowed_import_is_a_violation() {
    let err = load("import os\n\ndef f(n):\n    return n\n").await.unwrap_err();
    assert!(matches!(err, LoadError::ImportViolation(_)), "got: {:?}", err);
    assert_eq!(err.error_type(), "ImportViolation");
}

#[tokio::test]
async fn allowed_imports_and_their_submodules_work() {
    let source = "\
import collections
from collections import abc

def f(items):
    counts = collections.Counter(items)
    return counts[\"a\"]
";
    let mut callable = load_with_imports(source, &["collections"]).await.unwrap();

    let out = callable.call(&json!(["a", "b", "a"])).await.unwrap();
    assert_eq!(out.result, json!(2));
}

#[tokio::test]
async fn import_inside_function_body_is_still_gated() {
    let source = "def f(n):\n    import socket\n    return n\n";
    let mut callable = load(source).await.unwrap();

    let err = callable.call(&json!(1)).await.unwrap_err();
    match err {
        CallError::RuntimeException { exception, message } => {
            assert_eq!(exception, "ImportViolation");
            assert!(message.contains("socket"));
        }
        other => panic!("expected RuntimeException, got {:?}", other),
    }
}

#[tokio::test]
async fn module_level_exception_is_a_runtime_load_error() {
    let err = load("raise ValueError(\"boom\")\n\ndef f(n):\n    return n\n")
        .await
        .unwrap_err();
    match err {
        LoadError::Runtime { ref exception, .. } => assert_eq!(exception, "ValueError"),
        other => panic!("expected Runtime, got {:?}", other),
    }
    assert_eq!(err.error_type(), "RuntimeException");
}

#[tokio::test]
async fn missing_interpreter_is_a_spawn_error() {
    let sandbox = PySandbox::new("definitely-not-an-interpreter");
    let err = sandbox
        .load("def f(n):\n    return n\n", "f", &[], TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Spawn(_)), "got: {:?}", err);
}

// --- Builtins policy ---

#[tokio::test]
async fn dangerous_builtins_are_absent() {
    let source = "def f(n):\n    return eval(\"n + 1\")\n";
    let mut callable = load(source).await.unwrap();

    let err = callable.call(&json!(1)).await.unwrap_err();
    match err {
        CallError::RuntimeException { exception, .. } => assert_eq!(exception, "NameError"),
        other => panic!("expected NameError, got {:?}", other),
    }
}

#[tokio::test]
async fn open_is_not_exposed() {
    let source = "def f(path):\n    return open(path).read()\n";
    let mut callable = load(source).await.unwrap();

    let err = callable.call(&json!("/etc/hostname")).await.unwrap_err();
    assert!(matches!(err, CallError::RuntimeException { .. }));
}

// --- Call failures ---

#[tokio::test]
async fn runtime_exceptions_carry_type_and_message() {
    let source = "def f(n):\n    raise ValueError(\"negative size: %d\" % n)\n";
    let mut callable = load(source).await.unwrap();

    let err = callable.call(&json!(-5)).await.unwrap_err();
    match err {
        CallError::RuntimeException { exception, message } => {
            assert_eq!(exception, "ValueError");
            assert!(message.contains("negative size: -5"));
        }
        other => panic!("expected RuntimeException, got {:?}", other),
    }
}

#[tokio::test]
async fn unserializable_return_value_is_a_runtime_error() {
    let source = "def f(n):\n    return {1, 2, 3}\n";
    let mut callable = load(source).await.unwrap();

    let err = callable.call(&json!(1)).await.unwrap_err();
    match err {
        CallError::RuntimeException { exception, message } => {
            assert_eq!(exception, "TypeError");
            assert!(message.contains("not JSON-serializable"));
        }
        other => panic!("expected RuntimeException, got {:?}", other),
    }
}

#[tokio::test]
async fn runaway_call_times_out_and_kills_the_session() {
    let source = "def f(n):\n    while True:\n        pass\n";
    let sandbox = sandbox();
    let mut callable = sandbox
        .load(source, "f", &[], Duration::from_secs(1))
        .await
        .unwrap();

    let err = callable.call(&json!(1)).await.unwrap_err();
    assert!(matches!(err, CallError::Timeout(_)), "got: {:?}", err);

    // The child was killed; further calls in this pass report a dead session.
    let err = callable.call(&json!(1)).await.unwrap_err();
    assert!(matches!(err, CallError::SessionDead), "got: {:?}", err);
}

#[tokio::test]
async fn fresh_scope_per_load() {
    let stateful = "\
_seen = []

def f(n):
    _seen.append(n)
    return len(_seen)
";
    let sandbox = sandbox();
    let mut first = sandbox.load(stateful, "f", &[], TIMEOUT).await.unwrap();
    assert_eq!(first.call(&json!(1)).await.unwrap().result, json!(1));

    // A second load sees none of the first session's state.
    let mut second = sandbox.load(stateful, "f", &[], TIMEOUT).await.unwrap();
    assert_eq!(second.call(&json!(1)).await.unwrap().result, json!(1));
}
