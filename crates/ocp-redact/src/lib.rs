//! ocp-redact
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Recursive redaction of sensitive keys and values out of any JSON-typed
//! artifact, applied exactly once at the artifact boundary before
//! serialization (evidence files, episode records, and logs).

use serde_json::Value;

/// Key substrings (case-insensitive) that mark a field as sensitive.
const SENSITIVE_SUBSTRINGS: &[&str] = &[
    "token",
    "secret",
    "key",
    "auth",
    "password",
    "authorization",
];

const MASK: &str = "[REDACTED]";
const CYCLE_MARKER: &str = "[CYCLE]";

fn contains_sensitive_substring(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    SENSITIVE_SUBSTRINGS.iter().any(|needle| lower.contains(needle))
}

/// Mask the query string of a URL-shaped value, preserving scheme, host,
/// and path; the fragment (if any) is dropped entirely.
///
/// A string is considered URL-shaped if it contains a `<scheme>://`
/// prefix. Anything else is returned unchanged by this helper (the caller
/// decides whether non-URL strings need masking on other grounds).
fn mask_url_query(s: &str) -> Option<String> {
    let scheme_split = s.find("://")?;
    let (scheme, rest) = s.split_at(scheme_split + 3);
    let rest = &rest[..]; // rest starts right after "://"
    let without_fragment = rest.split('#').next().unwrap_or(rest);
    let (path_part, has_query) = match without_fragment.split_once('?') {
        Some((before, _)) => (before, true),
        None => (without_fragment, false),
    };
    if !has_query {
        return None;
    }
    Some(format!("{scheme}{path_part}?{MASK}"))
}

/// Recursively redact sensitive keys/values from `value`.
///
/// - A key matching (case-insensitive substring) any of
///   `{token, secret, key, auth, password, authorization}` has its entire
///   value replaced by the mask marker, regardless of the value's shape.
/// - A string value containing one of the same substrings is masked
///   outright.
/// - A string value shaped like a URL has its query string masked and its
///   fragment dropped; scheme, host, and path are preserved.
/// - Arrays are mapped element-wise; objects are cloned key-for-key.
/// - An object or array revisited along the current recursion path (a
///   structural cycle) becomes the literal string `"[CYCLE]"` instead of
///   being walked again.
#[must_use]
pub fn redact(value: &Value) -> Value {
    let mut ancestors: Vec<*const ()> = Vec::new();
    redact_inner(value, &mut ancestors)
}

fn identity(value: &Value) -> Option<*const ()> {
    match value {
        Value::Object(m) => Some(std::ptr::from_ref(m).cast::<()>()),
        Value::Array(a) => Some(std::ptr::from_ref(a).cast::<()>()),
        _ => None,
    }
}

fn redact_inner(value: &Value, ancestors: &mut Vec<*const ()>) -> Value {
    if let Some(id) = identity(value) {
        if ancestors.contains(&id) {
            return Value::String(CYCLE_MARKER.to_string());
        }
        ancestors.push(id);
        let result = match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    if contains_sensitive_substring(k) {
                        out.insert(k.clone(), Value::String(MASK.to_string()));
                    } else {
                        out.insert(k.clone(), redact_inner(v, ancestors));
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| redact_inner(v, ancestors)).collect())
            }
            _ => unreachable!("identity() only returns Some for Object/Array"),
        };
        ancestors.pop();
        return result;
    }

    match value {
        Value::String(s) => {
            if let Some(masked) = mask_url_query(s) {
                Value::String(masked)
            } else if contains_sensitive_substring(s) {
                Value::String(MASK.to_string())
            } else {
                Value::String(s.clone())
            }
        }
        other => other.clone(),
    }
}
