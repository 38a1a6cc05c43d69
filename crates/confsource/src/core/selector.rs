//! Selector-reference scanning and substitution
//!
//! A selector reference is a string scalar inside the configuration tree
//! of the form `source-name: selector` with an optional params suffix
//! `?key=value&key2=value2`. A string only counts as a reference when its
//! source name matches a registered binding; everything else stays a
//! literal scalar, so ordinary `"key: value"`-shaped strings survive
//! resolution untouched.

use serde_json::{Map, Number, Value};

use super::error::{SourceError, SourceResult};

/// A parsed selector reference.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SelectorRef {
    /// Name of the registered source binding.
    pub source_name: String,
    /// Selector string handed to the source.
    pub selector: String,
    /// Optional params map, passed through opaquely.
    pub params: Option<Map<String, Value>>,
}

/// One step into the document tree.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PathSeg {
    Key(String),
    Index(usize),
}

/// A reference found during a document scan, with its location.
#[derive(Debug, Clone)]
pub(crate) struct ScannedRef {
    pub path: Vec<PathSeg>,
    pub reference: SelectorRef,
}

/// Walk the document and collect every selector reference.
///
/// References are collected fresh on every pass and never retained across
/// resolutions. `is_registered` decides whether a marker-shaped string
/// names a real binding.
pub(crate) fn scan<F>(document: &Value, is_registered: &F) -> SourceResult<Vec<ScannedRef>>
where
    F: Fn(&str) -> bool,
{
    let mut found = Vec::new();
    scan_value(document, &mut Vec::new(), &mut found, is_registered)?;
    Ok(found)
}

fn scan_value<F>(
    value: &Value,
    path: &mut Vec<PathSeg>,
    found: &mut Vec<ScannedRef>,
    is_registered: &F,
) -> SourceResult<()>
where
    F: Fn(&str) -> bool,
{
    match value {
        Value::String(s) => {
            if let Some(reference) = parse_reference(s, is_registered)? {
                found.push(ScannedRef {
                    path: path.clone(),
                    reference,
                });
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                path.push(PathSeg::Key(key.clone()));
                scan_value(child, path, found, is_registered)?;
                path.pop();
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                path.push(PathSeg::Index(index));
                scan_value(child, path, found, is_registered)?;
                path.pop();
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replace the value at `path` inside the document.
///
/// Returns false when the path no longer exists; callers scan and
/// substitute against the same tree, so a miss indicates a logic error
/// upstream rather than a user-facing failure.
pub(crate) fn substitute(document: &mut Value, path: &[PathSeg], replacement: Value) -> bool {
    let mut current = document;
    for seg in path {
        current = match (seg, current) {
            (PathSeg::Key(key), Value::Object(map)) => match map.get_mut(key) {
                Some(child) => child,
                None => return false,
            },
            (PathSeg::Index(index), Value::Array(items)) => match items.get_mut(*index) {
                Some(child) => child,
                None => return false,
            },
            _ => return false,
        };
    }
    *current = replacement;
    true
}

/// Try to parse a string scalar as a selector reference.
///
/// Returns `Ok(None)` for strings that are not references (including
/// marker-shaped strings whose source name is not registered). Returns an
/// error only for a registered source name with a malformed selector or
/// params suffix.
fn parse_reference<F>(raw: &str, is_registered: &F) -> SourceResult<Option<SelectorRef>>
where
    F: Fn(&str) -> bool,
{
    let Some((name, rest)) = raw.split_once(':') else {
        return Ok(None);
    };
    let name = name.trim();
    if !is_valid_source_name(name) || !is_registered(name) {
        return Ok(None);
    }
    // The marker form requires whitespace after the colon.
    if !rest.starts_with(char::is_whitespace) {
        return Ok(None);
    }

    let body = rest.trim();
    let (selector, params) = match body.split_once('?') {
        Some((selector, query)) => (selector.trim_end(), Some(parse_params(raw, query)?)),
        None => (body, None),
    };
    if selector.is_empty() {
        return Err(SourceError::invalid_reference(raw, "selector is empty"));
    }

    Ok(Some(SelectorRef {
        source_name: name.to_string(),
        selector: selector.to_string(),
        params,
    }))
}

fn is_valid_source_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parse a `key=value&key2=value2` params suffix into a map.
fn parse_params(reference: &str, query: &str) -> SourceResult<Map<String, Value>> {
    let mut params = Map::new();
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(SourceError::invalid_reference(
                reference,
                format!("params entry `{pair}` is not of the form key=value"),
            ));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(SourceError::invalid_reference(
                reference,
                "params entry has an empty key",
            ));
        }
        params.insert(key.to_string(), coerce_scalar(value.trim()));
    }
    Ok(params)
}

/// Coerce a params value to bool/int/float before falling back to string.
fn coerce_scalar(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(int_val) = raw.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = raw.parse::<f64>() {
        if let Some(num) = Number::from_f64(float_val) {
            return Value::Number(num);
        }
    }
    Value::String(raw.to_string())
}
