//! ocp-schema
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! JSON Schema registry for every boundary artifact: plans, tool pools,
//! instruction profiles, request envelopes, and episodes.
//!
//! `$ref` values are resolved by logical id, never by URL: an external ref
//! `https://<host>/schemas/<id>.schema.json` and a relative ref
//! `<id>.schema.json` both resolve to the same locally loaded document
//! `<id>`. This decouples validation from publication URLs and keeps the
//! registry usable offline.

use jsonschema::{Retrieve, Uri, Validator};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// Errors raised while loading schema documents from disk.
#[derive(Debug, Error)]
pub enum SchemaLoadError {
    /// A schema root directory could not be read.
    #[error("cannot read schema root {path}: {source}")]
    RootUnreadable {
        /// The offending directory.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A `*.schema.json` file contained invalid JSON.
    #[error("invalid JSON in schema file {path}: {source}")]
    InvalidJson {
        /// The offending file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// A schema failed to compile into a validator.
    #[error("schema {id} failed to compile: {message}")]
    CompileFailed {
        /// Logical id of the offending schema.
        id: String,
        /// Compiler diagnostic.
        message: String,
    },
}

/// One error entry produced by [`SchemaRegistry::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaValidationError {
    /// JSON Pointer to the offending subtree of the validated instance.
    pub instance_path: String,
    /// Human-readable diagnostic.
    pub message: String,
}

/// Result of one [`SchemaRegistry::validate`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOutcome {
    /// `true` iff `errors` is empty.
    pub ok: bool,
    /// Structured errors, empty when `ok`.
    pub errors: Vec<SchemaValidationError>,
}

impl ValidationOutcome {
    fn ok() -> Self {
        Self {
            ok: true,
            errors: Vec::new(),
        }
    }

    fn failed(errors: Vec<SchemaValidationError>) -> Self {
        Self { ok: false, errors }
    }
}

const SCHEME: &str = "ocp-schema";

/// Rewrite every `$ref` in `doc` so it points at our internal `ocp-schema:`
/// scheme keyed by logical id, and stamp `$id` the same way.
fn canonicalize_refs(id: &str, doc: &mut Value) {
    fn rewrite_ref_string(s: &str) -> Option<String> {
        // External: https://<host>/schemas/<id>.schema.json
        // Relative:  <id>.schema.json
        // Already internal: ocp-schema:<id> is left untouched.
        if s.starts_with(&format!("{SCHEME}:")) {
            return None;
        }
        let trailing = s.rsplit('/').next().unwrap_or(s);
        let logical = trailing.strip_suffix(".schema.json").unwrap_or(trailing);
        Some(format!("{SCHEME}:{logical}"))
    }

    fn walk(v: &mut Value) {
        match v {
            Value::Object(map) => {
                if let Some(Value::String(r)) = map.get("$ref") {
                    if let Some(rewritten) = rewrite_ref_string(r) {
                        map.insert("$ref".to_string(), Value::String(rewritten));
                    }
                }
                for value in map.values_mut() {
                    walk(value);
                }
            }
            Value::Array(items) => {
                for item in items {
                    walk(item);
                }
            }
            _ => {}
        }
    }

    walk(doc);
    if let Value::Object(map) = doc {
        map.insert(
            "$id".to_string(),
            Value::String(format!("{SCHEME}:{id}")),
        );
    }
}

/// Resolves `ocp-schema:<id>` refs against the documents the registry has
/// loaded, breaking cycles by handing back an empty (permissive) schema on
/// re-entry.
struct RegistryRetriever {
    docs: HashMap<String, Value>,
}

impl Retrieve for RegistryRetriever {
    fn retrieve(
        &self,
        uri: &Uri<String>,
    ) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
        let s = uri.as_str();
        let id = s.strip_prefix(&format!("{SCHEME}:")).unwrap_or(s);
        match self.docs.get(id) {
            Some(doc) => Ok(doc.clone()),
            // Missing referenced schema: a validation error for the
            // consumer, not a registry exception. An empty schema accepts
            // anything, surfacing as "no additional constraint" rather
            // than a hard failure deep in compilation.
            None => Ok(serde_json::json!({})),
        }
    }
}

/// Loads, compiles, and caches JSON Schema documents by logical id.
///
/// Schemas load once at startup and remain for the process; compilation of
/// an individual schema is lazy and memoized on first [`validate`](Self::validate)
/// call.
pub struct SchemaRegistry {
    docs: HashMap<String, Value>,
    compiled: RwLock<HashMap<String, std::sync::Arc<Validator>>>,
}

impl SchemaRegistry {
    /// Scan `canonical_root` then `local_root` for `*.schema.json` files,
    /// indexing each by its file stem (minus the `.schema` suffix) as its
    /// logical id. Documents in `local_root` shadow same-named documents in
    /// `canonical_root`.
    pub fn load_all(canonical_root: &Path, local_root: &Path) -> Result<Self, SchemaLoadError> {
        let mut docs = HashMap::new();
        for root in [canonical_root, local_root] {
            if !root.exists() {
                continue;
            }
            for entry in walkdir::WalkDir::new(root) {
                let entry = entry.map_err(|e| SchemaLoadError::RootUnreadable {
                    path: root.to_path_buf(),
                    source: std::io::Error::other(e),
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if !name.ends_with(".schema.json") {
                    continue;
                }
                let id = name.trim_end_matches(".schema.json").to_string();
                let text = std::fs::read_to_string(path).map_err(|e| {
                    SchemaLoadError::RootUnreadable {
                        path: path.to_path_buf(),
                        source: e,
                    }
                })?;
                let mut doc: Value =
                    serde_json::from_str(&text).map_err(|e| SchemaLoadError::InvalidJson {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                canonicalize_refs(&id, &mut doc);
                docs.insert(id, doc);
            }
        }
        Ok(Self {
            docs,
            compiled: RwLock::new(HashMap::new()),
        })
    }

    /// Construct a registry directly from in-memory documents, bypassing
    /// disk I/O. Useful for tests and for the two core schemas the
    /// contract requires to preload before cross-references resolve.
    pub fn from_documents(documents: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut docs = HashMap::new();
        for (id, mut doc) in documents {
            canonicalize_refs(&id, &mut doc);
            docs.insert(id, doc);
        }
        Self {
            docs,
            compiled: RwLock::new(HashMap::new()),
        }
    }

    /// Number of distinct schema ids loaded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// `true` if no schemas are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn compile(&self, schema_id: &str) -> Result<std::sync::Arc<Validator>, SchemaLoadError> {
        if let Some(v) = self.compiled.read().expect("lock poisoned").get(schema_id) {
            return Ok(v.clone());
        }
        let doc = self
            .docs
            .get(schema_id)
            .ok_or_else(|| SchemaLoadError::CompileFailed {
                id: schema_id.to_string(),
                message: "schema id not loaded".to_string(),
            })?
            .clone();
        let retriever = RegistryRetriever {
            docs: self.docs.clone(),
        };
        let validator = jsonschema::options()
            .with_retriever(retriever)
            .build(&doc)
            .map_err(|e| SchemaLoadError::CompileFailed {
                id: schema_id.to_string(),
                message: e.to_string(),
            })?;
        let validator = std::sync::Arc::new(validator);
        self.compiled
            .write()
            .expect("lock poisoned")
            .insert(schema_id.to_string(), validator.clone());
        Ok(validator)
    }

    /// Validate `value` against the schema registered under `schema_id`.
    ///
    /// A missing schema id, or any schema violation, surfaces as an `!ok`
    /// [`ValidationOutcome`] with structured errors — never as a panic or
    /// process-level failure of the registry itself.
    pub fn validate(&self, schema_id: &str, value: &Value) -> ValidationOutcome {
        let validator = match self.compile(schema_id) {
            Ok(v) => v,
            Err(e) => {
                return ValidationOutcome::failed(vec![SchemaValidationError {
                    instance_path: "".to_string(),
                    message: e.to_string(),
                }]);
            }
        };
        let errors: Vec<SchemaValidationError> = validator
            .iter_errors(value)
            .map(|e| SchemaValidationError {
                instance_path: e.instance_path.to_string(),
                message: e.to_string(),
            })
            .collect();
        if errors.is_empty() {
            ValidationOutcome::ok()
        } else {
            ValidationOutcome::failed(errors)
        }
    }
}
