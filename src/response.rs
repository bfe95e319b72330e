//! JSON envelopes returned to tool callers.
//!
//! Every answer is one JSON object with a `success` flag. Failures carry a
//! kind, a message and whether a retry may help; when enhanced errors are
//! enabled they also carry the (clipped) raw process output.

use serde_json::{json, Map, Value};

use crate::exec::ExecutionFailure;
use crate::mode::ModeError;
use crate::registry::RegistryError;

/// Raw output kept in enhanced failure payloads, per stream.
const RAW_OUTPUT_TAIL: usize = 4000;

/// `value` with `success: true`; non-objects are nested under `result`.
pub fn success(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            map.insert("success".into(), Value::Bool(true));
            Value::Object(map)
        }
        other => json!({ "success": true, "result": other }),
    }
}

/// Failure without process output.
pub fn error(kind: &str, message: impl Into<String>) -> Value {
    json!({
        "success": false,
        "error_kind": kind,
        "error": message.into(),
        "retryable": false,
    })
}

/// Failure payload for an execution.
pub fn execution_failure(failure: &ExecutionFailure, enhanced: bool) -> Value {
    let mut map = Map::new();
    map.insert("success".into(), Value::Bool(false));
    map.insert("error_kind".into(), json!(failure.kind));
    map.insert("error".into(), json!(failure.message));
    map.insert("retryable".into(), json!(failure.kind.is_retryable()));
    if let Some(error_type) = &failure.error_type {
        map.insert("error_type".into(), json!(error_type));
    }
    if let Some(container) = &failure.container {
        map.insert("container".into(), json!(container));
    }
    if enhanced {
        map.insert("exit_code".into(), json!(failure.exit_code));
        if let Some(traceback) = &failure.traceback {
            map.insert("traceback".into(), json!(tail(traceback)));
        }
        if !failure.raw_stdout.is_empty() {
            map.insert("raw_stdout".into(), json!(tail(&failure.raw_stdout)));
        }
        if !failure.raw_stderr.is_empty() {
            map.insert("raw_stderr".into(), json!(tail(&failure.raw_stderr)));
        }
    }
    Value::Object(map)
}

pub fn registry_failure(err: &RegistryError, enhanced: bool) -> Value {
    match err {
        RegistryError::Execution(failure) => execution_failure(failure, enhanced),
        RegistryError::Decode(_) => error("MalformedOutput", err.to_string()),
        RegistryError::EmptyIteration { expected } => {
            let mut value = error("EmptyIteration", err.to_string());
            value["expected_count"] = json!(expected);
            value["retryable"] = Value::Bool(true);
            value
        }
    }
}

pub fn mode_failure(err: &ModeError) -> Value {
    match err {
        ModeError::UnknownMode(_) => error("InvalidMode", err.to_string()),
        ModeError::LiveUnavailable { decision, .. } => {
            let mut value = error("ContainerUnavailable", err.to_string());
            value["decision"] = json!(decision);
            value["retryable"] = Value::Bool(true);
            value["hint"] = json!("Use mode 'fs' or 'auto' to answer from addon sources");
            value
        }
    }
}

/// Last `RAW_OUTPUT_TAIL` characters of `s`.
fn tail(s: &str) -> String {
    let total = s.chars().count();
    if total <= RAW_OUTPUT_TAIL {
        return s.to_string();
    }
    let skipped = total - RAW_OUTPUT_TAIL;
    let kept: String = s.chars().skip(skipped).collect();
    format!("…[{skipped} chars omitted]{kept}")
}
