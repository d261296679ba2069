use serde_json::Value;

use crate::calc::{self, EditOverlay, Score};
use crate::ipc::error::err;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn require_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(HandlerErr::bad_params(format!("missing {}", key))),
    }
}

pub fn require_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing/invalid {}", key)))
}

pub fn opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
}

/// Numeric field accepted as a JSON number or as the operator's raw
/// text (comma or dot decimals). Null and blank text mean "unset";
/// anything else non-numeric is a validation error.
pub fn decimal_from_value(v: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => match n.as_f64() {
            Some(x) if x.is_finite() => Ok(Some(x)),
            _ => Err(HandlerErr::bad_params(format!("{} must be finite", key))),
        },
        Value::String(s) => {
            if s.trim().is_empty() {
                Ok(None)
            } else {
                calc::parse_decimal(s).map(Some).ok_or_else(|| {
                    HandlerErr::bad_params(format!("{} must be numeric", key))
                        .with_details(serde_json::json!({ "value": s }))
                })
            }
        }
        _ => Err(HandlerErr::bad_params(format!(
            "{} must be a number, string or null",
            key
        ))),
    }
}

/// In-progress edits shipped with a read request:
/// `edits: [{id, valorMax?, nota?}]`. A key that is present overrides
/// the stored value; an explicit null means the field was cleared.
pub fn overlay_from_params(params: &Value) -> Result<EditOverlay, HandlerErr> {
    let mut overlay = EditOverlay::default();
    let Some(edits) = params.get("edits") else {
        return Ok(overlay);
    };
    if edits.is_null() {
        return Ok(overlay);
    }
    let Some(arr) = edits.as_array() else {
        return Err(HandlerErr::bad_params("edits must be an array"));
    };
    for (i, edit) in arr.iter().enumerate() {
        let Some(obj) = edit.as_object() else {
            return Err(HandlerErr::bad_params(format!(
                "edit at index {} must be an object",
                i
            )));
        };
        let id = obj.get("id").and_then(|v| v.as_i64()).ok_or_else(|| {
            HandlerErr::bad_params(format!("edit at index {} missing/invalid id", i))
        })?;
        if let Some(v) = obj.get("valorMax") {
            overlay.set_valor_max(id, decimal_from_value(v, "valorMax")?);
        }
        if let Some(v) = obj.get("nota") {
            overlay.set_nota(id, Score::from_option(decimal_from_value(v, "nota")?));
        }
    }
    Ok(overlay)
}
