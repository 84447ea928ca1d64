// SPDX-License-Identifier: MIT OR Apache-2.0
//! The append-only event envelope.
//!
//! An envelope is immutable once appended.  `type`, `src`, `ts_ms`, and
//! `data` are all required; the vault rejects anything less with a distinct
//! error per missing field so producers can tell what they forgot.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// One record in the event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Dotted namespace, e.g. `control.god_button.intent`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Stable node identifier of the emitter.
    pub src: String,
    /// Producer clock in integer milliseconds; never rewritten.
    pub ts_ms: i64,
    /// Free-form payload; per-type shapes are convention, not schema.
    pub data: Value,
}

impl Envelope {
    /// Build an envelope stamped with the current producer clock.
    pub fn new(kind: impl Into<String>, src: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            src: src.into(),
            ts_ms: crate::now_ms(),
            data,
        }
    }

    /// Validate a raw JSON value into an envelope.
    ///
    /// Each missing or mistyped required field maps to its own
    /// [`EnvelopeFieldError`] variant so the ingest surface can return a
    /// distinct error code per field.
    pub fn from_value(value: &Value) -> Result<Self, EnvelopeFieldError> {
        let obj = value.as_object().ok_or(EnvelopeFieldError::NotAnObject)?;

        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EnvelopeFieldError::MissingType)?;
        let src = obj
            .get("src")
            .and_then(Value::as_str)
            .ok_or(EnvelopeFieldError::MissingSrc)?;
        let ts_ms = obj
            .get("ts_ms")
            .and_then(Value::as_i64)
            .ok_or(EnvelopeFieldError::MissingTsMs)?;
        let data = obj.get("data").ok_or(EnvelopeFieldError::MissingData)?;

        Ok(Self {
            kind: kind.to_string(),
            src: src.to_string(),
            ts_ms,
            data: data.clone(),
        })
    }

    /// The `request_id` carried anywhere this plane's conventions put it:
    /// `data.request_id`, `data.requestId`, `data.request.request_id`, or
    /// top-level `request_id` inside `data`.
    pub fn request_id(&self) -> Option<&str> {
        let d = &self.data;
        d.get("request_id")
            .and_then(Value::as_str)
            .or_else(|| d.get("requestId").and_then(Value::as_str))
            .or_else(|| {
                d.get("request")
                    .and_then(|r| r.get("request_id"))
                    .and_then(Value::as_str)
            })
    }
}

/// Which required envelope field was missing or malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeFieldError {
    /// The body was not a JSON object at all.
    NotAnObject,
    /// `type` missing or not a string.
    MissingType,
    /// `src` missing or not a string.
    MissingSrc,
    /// `ts_ms` missing or not an integer.
    MissingTsMs,
    /// `data` missing.
    MissingData,
}

impl EnvelopeFieldError {
    /// Stable error code for the ingest response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAnObject => "not_an_object",
            Self::MissingType => "missing_type",
            Self::MissingSrc => "missing_src",
            Self::MissingTsMs => "missing_ts_ms",
            Self::MissingData => "missing_data",
        }
    }
}

impl fmt::Display for EnvelopeFieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "event body must be a JSON object"),
            Self::MissingType => write!(f, "missing required field: type"),
            Self::MissingSrc => write!(f, "missing required field: src"),
            Self::MissingTsMs => write!(f, "missing required field: ts_ms"),
            Self::MissingData => write!(f, "missing required field: data"),
        }
    }
}

impl std::error::Error for EnvelopeFieldError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrips_with_type_key() {
        let env = Envelope::new("control.god_button.intent", "router-1", json!({"a": 1}));
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains(r#""type":"control.god_button.intent""#));
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn from_value_accepts_complete() {
        let v = json!({"type": "t.x", "src": "n1", "ts_ms": 5, "data": {}});
        let env = Envelope::from_value(&v).unwrap();
        assert_eq!(env.kind, "t.x");
        assert_eq!(env.src, "n1");
        assert_eq!(env.ts_ms, 5);
    }

    #[test]
    fn from_value_distinct_errors() {
        let missing_type = json!({"src": "n", "ts_ms": 1, "data": {}});
        assert_eq!(
            Envelope::from_value(&missing_type),
            Err(EnvelopeFieldError::MissingType)
        );
        let missing_src = json!({"type": "t", "ts_ms": 1, "data": {}});
        assert_eq!(
            Envelope::from_value(&missing_src),
            Err(EnvelopeFieldError::MissingSrc)
        );
        let missing_ts = json!({"type": "t", "src": "n", "data": {}});
        assert_eq!(
            Envelope::from_value(&missing_ts),
            Err(EnvelopeFieldError::MissingTsMs)
        );
        let missing_data = json!({"type": "t", "src": "n", "ts_ms": 1});
        assert_eq!(
            Envelope::from_value(&missing_data),
            Err(EnvelopeFieldError::MissingData)
        );
        assert_eq!(
            Envelope::from_value(&json!([1, 2])),
            Err(EnvelopeFieldError::NotAnObject)
        );
    }

    #[test]
    fn ts_ms_must_be_integer() {
        let v = json!({"type": "t", "src": "n", "ts_ms": "soon", "data": {}});
        assert_eq!(
            Envelope::from_value(&v),
            Err(EnvelopeFieldError::MissingTsMs)
        );
    }

    #[test]
    fn request_id_lookup_spots() {
        let direct = Envelope::new("x", "n", json!({"request_id": "a"}));
        assert_eq!(direct.request_id(), Some("a"));

        let camel = Envelope::new("x", "n", json!({"requestId": "b"}));
        assert_eq!(camel.request_id(), Some("b"));

        let nested = Envelope::new("x", "n", json!({"request": {"request_id": "c"}}));
        assert_eq!(nested.request_id(), Some("c"));

        let none = Envelope::new("x", "n", json!({"other": true}));
        assert_eq!(none.request_id(), None);
    }
}
