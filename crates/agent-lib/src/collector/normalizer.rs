//! Log line normalization
//!
//! Turns one raw, timestamp-prefixed log line into a [`LogRecord`] that is
//! always a JSON object. Lines are handled in two stages:
//!
//! 1. If the container configures an extraction pattern, the leading
//!    timestamp token is stripped and the pattern's named groups become the
//!    fields of a new JSON object. When the pattern does not compile or does
//!    not match, the stripped line is carried forward instead.
//! 2. The working line is used as-is if it is a JSON object, otherwise with
//!    its first space-delimited token removed if that is. Anything else is
//!    wrapped as `{"message": <working line>}`.

use crate::error::NormalizeError;
use crate::models::LogRecord;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Compiled extraction pattern, kept until the configured source changes
struct CompiledPattern {
    source: String,
    regex: Result<Regex, String>,
}

/// Stateful normalizer owned by one tracker's log task.
///
/// Holds the last compiled extraction pattern so a pattern is compiled once
/// per label value rather than once per line.
#[derive(Default)]
pub struct LogNormalizer {
    compiled: Option<CompiledPattern>,
}

impl LogNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize one line, optionally using an extraction pattern
    pub fn normalize(&mut self, line: &str, pattern: Option<&str>) -> LogRecord {
        self.normalize_traced(line, pattern).0
    }

    /// Like [`normalize`](Self::normalize), also reporting whether the
    /// `message` fallback was used
    pub(crate) fn normalize_traced(
        &mut self,
        line: &str,
        pattern: Option<&str>,
    ) -> (LogRecord, bool) {
        let working = match pattern.filter(|p| !p.is_empty()) {
            Some(pattern) => {
                let text = strip_timestamp(line);
                match self.extract(pattern, text) {
                    Ok(extracted) => extracted,
                    Err(e) => {
                        debug!(error = %e, "Structured extraction failed");
                        text.to_string()
                    }
                }
            }
            None => line.to_string(),
        };

        match json_record(&working) {
            Ok(record) => (record, false),
            Err(e) => {
                debug!(error = %e, "Falling back to message record");
                (fallback_record(&working), true)
            }
        }
    }

    /// Build a JSON object from the named groups of `pattern` matched
    /// against `text`
    fn extract(&mut self, pattern: &str, text: &str) -> Result<String, NormalizeError> {
        let regex = self.compile(pattern)?;

        let mut body = BTreeMap::new();
        let mut matched = false;
        for captures in regex.captures_iter(text) {
            matched = true;
            for name in regex.capture_names().flatten() {
                let value = captures.name(name).map(|m| m.as_str()).unwrap_or_default();
                body.insert(name, value);
            }
        }

        if !matched {
            return Err(NormalizeError::PatternMismatch {
                pattern: pattern.to_string(),
            });
        }

        Ok(serde_json::to_string(&body)?)
    }

    fn compile(&mut self, pattern: &str) -> Result<&Regex, NormalizeError> {
        if self
            .compiled
            .as_ref()
            .is_some_and(|compiled| compiled.source != pattern)
        {
            self.compiled = None;
        }

        let compiled = self.compiled.get_or_insert_with(|| CompiledPattern {
            source: pattern.to_string(),
            regex: Regex::new(pattern).map_err(|e| e.to_string()),
        });

        compiled
            .regex
            .as_ref()
            .map_err(|reason| NormalizeError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: reason.clone(),
            })
    }
}

/// True when `text` parses as a JSON object
pub fn is_json_object(text: &str) -> bool {
    serde_json::from_str::<Map<String, Value>>(text).is_ok()
}

/// Drop the leading timestamp token and surrounding spaces.
///
/// A line without any space has no separate timestamp and is kept whole.
fn strip_timestamp(line: &str) -> &str {
    match line.split_once(' ') {
        Some((_, rest)) => rest.trim_matches(' '),
        None => line,
    }
}

/// Accept the line, or the line without its first token, if it is a JSON
/// object
fn json_record(text: &str) -> Result<LogRecord, NormalizeError> {
    if is_json_object(text) {
        return Ok(LogRecord::from_json(text));
    }

    if let Some((_, rest)) = text.split_once(' ') {
        if is_json_object(rest) {
            return Ok(LogRecord::from_json(rest));
        }
    }

    Err(NormalizeError::NotJson)
}

/// Wrap arbitrary text as `{"message": text}`; empty text yields `{}`
fn fallback_record(text: &str) -> LogRecord {
    let mut body = Map::new();
    if !text.is_empty() {
        body.insert("message".to_string(), Value::String(text.to_string()));
    }
    LogRecord::from_json(Value::Object(body).to_string())
}
