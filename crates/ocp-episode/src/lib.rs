//! ocp-episode
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Schema-validated episode writer (component C3). Fills in the defaults a
//! caller-supplied partial omits, relocates any property a schema rejects
//! under `additionalProperties: false` into `meta_episode` rather than
//! dropping it, and appends every written episode to the run's append-only
//! `episodes/index.jsonl`.

use chrono::Utc;
use ocp_core::{Episode, EpisodeCommon, Executor, ResultStatus};
use ocp_schema::SchemaRegistry;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Schema id an execution episode is validated against.
pub const EXECUTION_SCHEMA_ID: &str = "episode_execution";
/// Schema id a security-event episode is validated against.
pub const SECURITY_EVENT_SCHEMA_ID: &str = "episode_security_event";

/// Top-level keys a caller may supply directly on an execution episode
/// without being relocated into `meta_episode`.
const EXECUTION_ALLOW_LIST: &[&str] = &[
    "episode_type_kind",
    "episode_id",
    "episode_type",
    "mova_version",
    "recorded_at",
    "executor",
    "result_status",
    "result_summary",
    "input_data_refs",
    "meta_episode",
];

/// Additional top-level keys a security-event episode allows beyond
/// [`EXECUTION_ALLOW_LIST`].
const SECURITY_EVENT_EXTRA_ALLOW_LIST: &[&str] = &[
    "security_event_type",
    "security_event_category",
    "severity",
    "policy_profile_id",
    "security_model_version",
    "detection_source",
];

/// Number of strip-and-revalidate passes attempted before giving up and
/// persisting diagnostics, per §4.3.
const MAX_STRIP_ITERATIONS: usize = 10;

/// Errors raised while writing an episode.
#[derive(Debug, Error)]
pub enum EpisodeWriteError {
    /// The candidate episode remained schema-invalid after
    /// [`MAX_STRIP_ITERATIONS`] strip-and-revalidate passes. Diagnostics
    /// were written alongside the run's `episodes/` directory.
    #[error("episode {episode_id} still invalid against {schema_id} after {MAX_STRIP_ITERATIONS} strip passes: see {dump_path}")]
    StillInvalid {
        /// The episode id that failed to validate.
        episode_id: String,
        /// Schema id validation ran against.
        schema_id: String,
        /// Path to the `*_episode_dump.json` diagnostic.
        dump_path: PathBuf,
    },
    /// The merged candidate could not be deserialized into the expected
    /// Rust type even though schema validation passed. Indicates a schema
    /// drift bug, not caller input.
    #[error("episode passed schema validation but failed to deserialize: {0}")]
    Deserialize(#[source] serde_json::Error),
    /// Writing the per-episode file or the index failed.
    #[error(transparent)]
    Evidence(#[from] ocp_evidence::EvidenceError),
}

/// Generate a `exec_<ms>_<rand>` or `sec_<ms>_<rand>` episode id.
fn generate_episode_id(prefix: &str) -> String {
    let ms = Utc::now().timestamp_millis();
    let rand = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{ms}_{}", &rand[..8])
}

fn default_meta_episode(request_id: Uuid, run_id: Uuid, evidence_dir: &Path) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("request_id".to_string(), Value::String(request_id.to_string()));
    m.insert("run_id".to_string(), Value::String(run_id.to_string()));
    m.insert(
        "evidence_dir".to_string(),
        Value::String(evidence_dir.display().to_string()),
    );
    m
}

/// Extract the quoted property names out of a jsonschema `additionalProperties`
/// violation message, e.g. `"Additional properties are not allowed ('foo',
/// 'bar' were unexpected)"` yields `["foo", "bar"]`.
fn unexpected_property_names(message: &str) -> Vec<String> {
    message
        .split('\'')
        .skip(1)
        .step_by(2)
        .map(str::to_string)
        .collect()
}

/// Move any top-level property of `candidate` that is not in `allow_list`
/// into `candidate.meta_episode`. Returns `true` if anything moved.
fn strip_into_meta_episode(candidate: &mut Value, allow_list: &[&str], property_names: &[String]) -> bool {
    let Some(obj) = candidate.as_object_mut() else {
        return false;
    };
    let mut moved = false;
    for name in property_names {
        if allow_list.contains(&name.as_str()) {
            continue;
        }
        if let Some(value) = obj.remove(name) {
            let meta = obj
                .entry("meta_episode".to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(meta_obj) = meta.as_object_mut() {
                meta_obj.insert(name.clone(), value);
            }
            moved = true;
        }
    }
    moved
}

/// Run-scoped writer for execution and security-event episodes.
///
/// `dir` must already exist with an `episodes/` subdirectory (see
/// [`ocp_evidence::create_run_dir`]).
pub struct EpisodeWriter<'a> {
    dir: &'a Path,
    schemas: &'a SchemaRegistry,
    request_id: Uuid,
    run_id: Uuid,
}

impl<'a> EpisodeWriter<'a> {
    /// Build a writer scoped to one run's evidence directory.
    #[must_use]
    pub fn new(dir: &'a Path, schemas: &'a SchemaRegistry, request_id: Uuid, run_id: Uuid) -> Self {
        Self {
            dir,
            schemas,
            request_id,
            run_id,
        }
    }

    /// Fill in defaults, validate, relocate unknown properties into
    /// `meta_episode`, write `episodes/<episode_id>.json`, and append the
    /// final object to `episodes/index.jsonl`.
    pub fn write_execution(&self, partial: Value) -> Result<Episode, EpisodeWriteError> {
        let episode_id = generate_episode_id("exec");
        let mut candidate = Map::new();
        candidate.insert("episode_type_kind".to_string(), Value::String("Execution".to_string()));
        candidate.insert("episode_id".to_string(), Value::String(episode_id.clone()));
        candidate.insert(
            "episode_type".to_string(),
            Value::String("execution_step".to_string()),
        );
        candidate.insert(
            "mova_version".to_string(),
            Value::String(ocp_core::MOVA_VERSION.to_string()),
        );
        candidate.insert("recorded_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        candidate.insert(
            "executor".to_string(),
            serde_json::to_value(Executor::default()).expect("Executor always serializes"),
        );
        candidate.insert(
            "result_status".to_string(),
            serde_json::to_value(ResultStatus::Completed).expect("ResultStatus always serializes"),
        );
        candidate.insert("input_data_refs".to_string(), Value::Array(Vec::new()));
        candidate.insert(
            "meta_episode".to_string(),
            Value::Object(default_meta_episode(self.request_id, self.run_id, self.dir)),
        );
        merge_partial(&mut candidate, partial);

        self.finish(Value::Object(candidate), episode_id, EXECUTION_SCHEMA_ID, EXECUTION_ALLOW_LIST)
    }

    /// Like [`write_execution`](Self::write_execution) but prefixes
    /// `sec_`, defaults `episode_type = security_event/policy_violation`,
    /// and requires the security-specific fields.
    pub fn write_security_event(&self, partial: Value) -> Result<Episode, EpisodeWriteError> {
        let episode_id = generate_episode_id("sec");
        let mut candidate = Map::new();
        candidate.insert("episode_type_kind".to_string(), Value::String("Security".to_string()));
        candidate.insert("episode_id".to_string(), Value::String(episode_id.clone()));
        candidate.insert(
            "episode_type".to_string(),
            Value::String("security_event/policy_violation".to_string()),
        );
        candidate.insert(
            "mova_version".to_string(),
            Value::String(ocp_core::MOVA_VERSION.to_string()),
        );
        candidate.insert("recorded_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        candidate.insert(
            "executor".to_string(),
            serde_json::to_value(Executor::default()).expect("Executor always serializes"),
        );
        candidate.insert(
            "result_status".to_string(),
            serde_json::to_value(ResultStatus::Failed).expect("ResultStatus always serializes"),
        );
        candidate.insert("input_data_refs".to_string(), Value::Array(Vec::new()));
        candidate.insert(
            "meta_episode".to_string(),
            Value::Object(default_meta_episode(self.request_id, self.run_id, self.dir)),
        );
        candidate.insert(
            "security_model_version".to_string(),
            Value::String(ocp_core::MOVA_VERSION.to_string()),
        );
        merge_partial(&mut candidate, partial);

        let allow_list: Vec<&str> = EXECUTION_ALLOW_LIST
            .iter()
            .chain(SECURITY_EVENT_EXTRA_ALLOW_LIST.iter())
            .copied()
            .collect();
        self.finish(Value::Object(candidate), episode_id, SECURITY_EVENT_SCHEMA_ID, &allow_list)
    }

    fn finish(
        &self,
        mut candidate: Value,
        episode_id: String,
        schema_id: &str,
        allow_list: &[&str],
    ) -> Result<Episode, EpisodeWriteError> {
        let mut last_outcome = self.schemas.validate(schema_id, &candidate);
        let mut iterations = 0;
        while !last_outcome.ok && iterations < MAX_STRIP_ITERATIONS {
            let property_names: Vec<String> = last_outcome
                .errors
                .iter()
                .flat_map(|e| unexpected_property_names(&e.message))
                .collect();
            if property_names.is_empty() {
                break;
            }
            if !strip_into_meta_episode(&mut candidate, allow_list, &property_names) {
                break;
            }
            last_outcome = self.schemas.validate(schema_id, &candidate);
            iterations += 1;
        }

        if !last_outcome.ok {
            let dump_path = ocp_evidence::write_artifact(
                self.dir,
                &format!("{episode_id}_episode_dump.json"),
                &candidate,
            )?;
            ocp_evidence::write_artifact(
                self.dir,
                &format!("{episode_id}_validation_errors.json"),
                &last_outcome
                    .errors
                    .iter()
                    .map(|e| format!("{}: {}", e.instance_path, e.message))
                    .collect::<Vec<_>>(),
            )?;
            tracing::warn!(episode_id, schema_id, "episode still invalid after strip passes");
            return Err(EpisodeWriteError::StillInvalid {
                episode_id,
                schema_id: schema_id.to_string(),
                dump_path,
            });
        }

        let episode: Episode =
            serde_json::from_value(candidate.clone()).map_err(EpisodeWriteError::Deserialize)?;

        let episodes_dir = self.dir.join("episodes");
        ocp_evidence::write_artifact(&episodes_dir, &format!("{episode_id}.json"), &candidate)?;
        let line = serde_json::to_string(&candidate).map_err(EpisodeWriteError::Deserialize)?;
        ocp_evidence::append_line(&episodes_dir, "index.jsonl", &line)?;

        Ok(episode)
    }
}

/// Overlay a caller-supplied partial object onto `candidate`, with the
/// partial's `meta_episode` entries merged (not replacing) the defaults.
fn merge_partial(candidate: &mut Map<String, Value>, partial: Value) {
    let Value::Object(partial) = partial else {
        return;
    };
    for (key, value) in partial {
        if key == "meta_episode" {
            if let Value::Object(extra) = value {
                let meta = candidate
                    .entry("meta_episode".to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Some(meta_obj) = meta.as_object_mut() {
                    for (k, v) in extra {
                        meta_obj.insert(k, v);
                    }
                }
            }
            continue;
        }
        candidate.insert(key, value);
    }
}
