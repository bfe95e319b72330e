//! Code harness and result extraction.
//!
//! The harness runs caller code inside the runtime shell, captures anything
//! the code prints, and writes exactly one JSON envelope as the final stdout
//! line:
//!
//! ```text
//! {"success": true, "value": <result>}
//! {"success": false, "error": "...", "error_type": "...", "traceback": "..."}
//! ```
//!
//! Extraction walks stdout backwards and takes the last line that parses as
//! JSON, so shell banners, deprecation warnings and log lines written before
//! the envelope are discarded.

use serde_json::Value;

/// Placeholder replaced with the caller's code as a string literal.
const CODE_SLOT: &str = "__MCP_CODE__";

/// Python wrapper around caller code.
///
/// The code is embedded as a JSON string literal (valid Python syntax) and
/// run with `exec` in a copy of the shell namespace, so `env` is in scope
/// and no re-indentation of the caller's code is needed.
const HARNESS: &str = r#"import json as _mcp_json
import sys as _mcp_sys
import traceback as _mcp_tb
from io import StringIO as _McpStringIO

_mcp_stdout = _mcp_sys.stdout
_mcp_sys.stdout = _McpStringIO()
_mcp_ns = dict(globals())
_mcp_ns.pop("result", None)


def _mcp_repr(value):
    try:
        return repr(value)[:4000]
    except Exception:
        return "<unrepresentable %s>" % type(value).__name__


def _mcp_encode(value):
    if hasattr(value, "_name") and hasattr(value, "ids"):
        return {
            "result_type": "recordset",
            "model": value._name,
            "count": len(value),
            "ids": list(value.ids[:100]),
            "display_names": [rec.display_name for rec in value[:10]],
        }
    return value


try:
    exec(compile(__MCP_CODE__, "<inspect>", "exec"), _mcp_ns)
    _mcp_captured = _mcp_sys.stdout.getvalue()
    _mcp_sys.stdout = _mcp_stdout
    if "result" in _mcp_ns:
        _mcp_payload = {"success": True, "value": _mcp_encode(_mcp_ns["result"])}
    elif _mcp_captured:
        _mcp_payload = {"success": True, "value": {"output": _mcp_captured}}
    else:
        _mcp_payload = {"success": True, "value": None}
except Exception as _mcp_exc:
    _mcp_sys.stdout = _mcp_stdout
    _mcp_payload = {
        "success": False,
        "error": str(_mcp_exc),
        "error_type": type(_mcp_exc).__name__,
        "traceback": _mcp_tb.format_exc()[-4000:],
    }
try:
    _mcp_line = _mcp_json.dumps(_mcp_payload, default=str, allow_nan=False)
except Exception as _mcp_exc:
    _mcp_line = _mcp_json.dumps({
        "success": True,
        "value": _mcp_repr(_mcp_payload.get("value")),
        "serialization_error": "%s: %s" % (type(_mcp_exc).__name__, _mcp_exc),
    })
_mcp_stdout.write("\n" + _mcp_line + "\n")
_mcp_stdout.flush()
"#;

/// Wrap `code` in the result harness.
pub fn wrap(code: &str) -> String {
    // A JSON string literal is also a valid Python string literal
    let literal = serde_json::to_string(code).unwrap_or_else(|_| "\"\"".to_string());
    HARNESS.replace(CODE_SLOT, &literal)
}

/// Last line of `stdout` that parses as a JSON value.
pub fn extract_last_json(stdout: &str) -> Option<Value> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(|line| serde_json::from_str::<Value>(line).ok())
}

/// Error raised by the executed code, as reported by the harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeError {
    pub message: String,
    pub error_type: Option<String>,
    pub traceback: Option<String>,
}

/// Split an extracted envelope into the result value or the code's error.
///
/// Values that are not harness envelopes are passed through unchanged.
pub fn interpret(value: Value) -> Result<Value, CodeError> {
    let mut map = match value {
        Value::Object(map) => map,
        other => return Ok(other),
    };

    match map.get("success") {
        Some(Value::Bool(true)) if map.contains_key("value") => {
            Ok(map.remove("value").unwrap_or(Value::Null))
        }
        Some(Value::Bool(false)) => Err(code_error(&mut map)),
        None if map.contains_key("error") => Err(code_error(&mut map)),
        _ => Ok(Value::Object(map)),
    }
}

fn code_error(map: &mut serde_json::Map<String, Value>) -> CodeError {
    let take_str = |map: &mut serde_json::Map<String, Value>, key: &str| match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };
    CodeError {
        message: take_str(map, "error").unwrap_or_else(|| "executed code failed".into()),
        error_type: take_str(map, "error_type"),
        traceback: take_str(map, "traceback"),
    }
}

/// Exception type and message from the last line of a Python traceback.
pub fn traceback_summary(stderr: &str) -> Option<(String, String)> {
    let last = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    let (name, message) = last.split_once(": ")?;
    let short = name.rsplit('.').next().unwrap_or(name);
    let is_exception = (short.ends_with("Error") || short.ends_with("Exception"))
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    is_exception.then(|| (short.to_string(), message.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::process::run_with_timeout;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn wrap_embeds_code_as_literal() {
        let wrapped = wrap("result = env['res.partner'].search_count([])\nprint(\"hi\")");
        assert!(wrapped.contains(r#"exec(compile("result = env['res.partner'].search_count([])\nprint(\"hi\")", "<inspect>", "exec"), _mcp_ns)"#));
        assert!(!wrapped.contains(CODE_SLOT));
    }

    #[test]
    fn wrap_keeps_harness_at_top_level() {
        let wrapped = wrap("if True:\n    result = 1");
        // The caller's indentation lives inside the literal, not the harness
        assert!(wrapped.lines().any(|l| l.starts_with("try:")));
        assert!(wrapped.lines().any(|l| l.starts_with("_mcp_stdout.write(")));
    }

    /// Run wrapped `code` under a local interpreter; `None` without python3.
    async fn run_wrapped(code: &str) -> Option<Value> {
        if std::process::Command::new("python3").arg("--version").output().is_err() {
            return None;
        }
        let mut cmd = tokio::process::Command::new("python3");
        cmd.arg("-");
        let output = run_with_timeout(cmd, &wrap(code), Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0, "stderr: {}", output.stderr);
        Some(extract_last_json(&output.stdout).expect("harness must end with a JSON line"))
    }

    #[tokio::test]
    async fn harness_reports_plain_results() {
        let Some(envelope) = run_wrapped("print('noise')\nresult = {'a': [1, 2]}").await else {
            return;
        };
        assert_eq!(interpret(envelope).unwrap(), json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn harness_keeps_json_line_for_nan_results() {
        let Some(envelope) = run_wrapped("result = {'ratio': float('nan')}").await else {
            return;
        };
        assert!(envelope["serialization_error"]
            .as_str()
            .unwrap()
            .starts_with("ValueError"));
        assert_eq!(interpret(envelope).unwrap(), json!("{'ratio': nan}"));
    }

    #[tokio::test]
    async fn harness_keeps_json_line_for_circular_results() {
        let Some(envelope) = run_wrapped("a = []\na.append(a)\nresult = a").await else {
            return;
        };
        assert_eq!(envelope["success"], json!(true));
        assert_eq!(interpret(envelope).unwrap(), json!("[[...]]"));
    }

    #[tokio::test]
    async fn harness_reports_raised_errors() {
        let Some(envelope) = run_wrapped("raise KeyError('foo.bar')").await else {
            return;
        };
        let err = interpret(envelope).unwrap_err();
        assert_eq!(err.error_type.as_deref(), Some("KeyError"));
        assert!(err.traceback.unwrap().contains("KeyError"));
    }

    #[test]
    fn extract_skips_leading_noise() {
        let stdout = "WARNING: deprecated\n{\"success\": true, \"value\": 42}\n";
        let value = extract_last_json(stdout).unwrap();
        assert_eq!(value, json!({"success": true, "value": 42}));
    }

    #[test]
    fn extract_prefers_last_json_line() {
        let stdout = "{\"first\": 1}\nINFO odoo: shutting down\n{\"second\": 2}\n\n";
        assert_eq!(extract_last_json(stdout), Some(json!({"second": 2})));
    }

    #[test]
    fn extract_without_json_is_none() {
        assert!(extract_last_json("Traceback (most recent call last):\n  boom").is_none());
        assert!(extract_last_json("").is_none());
    }

    #[test]
    fn interpret_unwraps_success_envelope() {
        let value = interpret(json!({"success": true, "value": {"count": 3}})).unwrap();
        assert_eq!(value, json!({"count": 3}));
        assert_eq!(interpret(json!({"success": true, "value": null})).unwrap(), Value::Null);
    }

    #[test]
    fn interpret_reports_code_errors() {
        let err = interpret(json!({
            "success": false,
            "error": "'foo.bar'",
            "error_type": "KeyError",
            "traceback": "Traceback..."
        }))
        .unwrap_err();
        assert_eq!(err.message, "'foo.bar'");
        assert_eq!(err.error_type.as_deref(), Some("KeyError"));
        assert_eq!(err.traceback.as_deref(), Some("Traceback..."));
    }

    #[test]
    fn interpret_legacy_error_object() {
        let err = interpret(json!({"error": "boom"})).unwrap_err();
        assert_eq!(err.message, "boom");
        assert!(err.error_type.is_none());
    }

    #[test]
    fn interpret_passes_through_plain_values() {
        assert_eq!(interpret(json!([1, 2])).unwrap(), json!([1, 2]));
        assert_eq!(
            interpret(json!({"success": true, "other": 1})).unwrap(),
            json!({"success": true, "other": 1})
        );
    }

    #[test]
    fn traceback_summary_reads_last_line() {
        let stderr = "Traceback (most recent call last):\n  File \"x\", line 1\npsycopg2.OperationalError: could not connect\n";
        assert_eq!(
            traceback_summary(stderr),
            Some(("OperationalError".into(), "could not connect".into()))
        );
        assert!(traceback_summary("plain failure: nothing").is_none());
    }
}
