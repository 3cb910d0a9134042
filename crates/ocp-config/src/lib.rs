// SPDX-License-Identifier: MIT OR Apache-2.0
//! ocp-config
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Ambient configuration for the runtime: reading `OCP_*`/`WEBHOOK_*`
//! environment variables exactly once into a resolved [`ocp_delivery::DeliveryEnv`],
//! selecting and loading [`ocp_core::PolicyProfile`] documents (TOML or JSON) by
//! `OCP_POLICY_PROFILE_ID`, and resolving the on-disk paths of the idempotency
//! and rate-limit stores. Business-logic crates never read `std::env`
//! themselves; this crate is the single seam where the process environment
//! enters the system.

use ocp_core::{PolicyProfile, RateLimitPolicy};
use ocp_delivery::DeliveryEnv;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default path for the idempotency store when `OCP_IDEMPOTENCY_STORE_PATH`
/// is unset.
pub const DEFAULT_IDEMPOTENCY_STORE_PATH: &str = "state/idempotency.json";
/// Default path for the rate-limit store when `OCP_RATE_LIMIT_STORE_PATH` is
/// unset.
pub const DEFAULT_RATE_LIMIT_STORE_PATH: &str = "state/rate_limit.json";
/// Timeout, in milliseconds, above which [`ConfigWarning::LargeTimeout`] is
/// raised for a loaded profile.
pub const LARGE_TIMEOUT_THRESHOLD_MS: u64 = 60_000;
/// Hard ceiling on a profile's `timeout_ms`; anything larger is a validation
/// error, not a warning.
pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No file exists at the resolved path.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// The path that was probed.
        path: PathBuf,
    },
    /// The file's extension is neither `.toml` nor `.json`.
    #[error("unsupported config file extension: {path}")]
    UnsupportedExtension {
        /// The offending path.
        path: PathBuf,
    },
    /// The file could not be read from disk.
    #[error("cannot read config file {path}: {source}")]
    Io {
        /// The offending path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file's contents did not parse as TOML.
    #[error("invalid TOML in {path}: {source}")]
    TomlParse {
        /// The offending path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
    /// The file's contents did not parse as JSON.
    #[error("invalid JSON in {path}: {source}")]
    JsonParse {
        /// The offending path.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// A loaded profile failed semantic validation.
    #[error("invalid policy profile {id}: {reason}")]
    InvalidProfile {
        /// The profile's declared id.
        id: String,
        /// Why validation failed.
        reason: String,
    },
    /// An overlay document targeted a different profile id than the base.
    #[error("overlay id {overlay_id} does not match base profile id {base_id}")]
    MergeConflict {
        /// The base profile's id.
        base_id: String,
        /// The overlay's id.
        overlay_id: String,
    },
}

/// Non-fatal advisories raised while validating a loaded [`PolicyProfile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// `require_hmac` is set but no signing secret is configured in the
    /// process environment, so every delivery under this profile will be
    /// rejected at the HMAC-required gate.
    RequireHmacWithoutSecret,
    /// `allow_real_send` is set but `OCP_ENABLE_REAL_SEND` was not armed, so
    /// the profile's intent cannot take effect this run.
    RealSendNotArmed,
    /// `timeout_ms` exceeds [`LARGE_TIMEOUT_THRESHOLD_MS`] but is still under
    /// the hard ceiling.
    LargeTimeout {
        /// The configured timeout.
        timeout_ms: u64,
    },
    /// `allowed_targets` is empty, so every destination will be denied by
    /// the allowlist rule.
    EmptyAllowedTargets,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RequireHmacWithoutSecret => write!(
                f,
                "profile requires HMAC signing but no signing secret is configured"
            ),
            Self::RealSendNotArmed => write!(
                f,
                "profile allows real sends but OCP_ENABLE_REAL_SEND is not armed"
            ),
            Self::LargeTimeout { timeout_ms } => {
                write!(f, "timeout_ms {timeout_ms} is unusually large")
            }
            Self::EmptyAllowedTargets => {
                write!(f, "allowed_targets is empty; every destination will be denied")
            }
        }
    }
}

fn parse_bool_env(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}

/// Read the `OCP_ENABLE_REAL_SEND`, `WEBHOOK_SIGNING_SECRET`,
/// `OCP_REQUIRE_IDEMPOTENCY`, and `ALLOW_NOOP_ONLY` environment variables
/// once, returning a resolved [`DeliveryEnv`]. Callers should invoke this a
/// single time at process entry and thread the result through; it is the
/// only place in the workspace that reads these variables.
#[must_use]
pub fn load_delivery_env() -> DeliveryEnv {
    DeliveryEnv {
        real_send_armed: parse_bool_env("OCP_ENABLE_REAL_SEND"),
        signing_secret: std::env::var("WEBHOOK_SIGNING_SECRET")
            .ok()
            .filter(|s| !s.is_empty()),
        require_idempotency: parse_bool_env("OCP_REQUIRE_IDEMPOTENCY"),
        allow_noop_only: parse_bool_env("ALLOW_NOOP_ONLY"),
    }
}

/// Resolved on-disk paths for the idempotency and rate-limit stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    /// Path to the idempotency store file.
    pub idempotency_path: PathBuf,
    /// Path to the rate-limit store file.
    pub rate_limit_path: PathBuf,
}

/// Resolve store paths from `OCP_IDEMPOTENCY_STORE_PATH` and
/// `OCP_RATE_LIMIT_STORE_PATH`, falling back to
/// [`DEFAULT_IDEMPOTENCY_STORE_PATH`] and [`DEFAULT_RATE_LIMIT_STORE_PATH`].
#[must_use]
pub fn resolve_store_paths() -> StorePaths {
    StorePaths {
        idempotency_path: std::env::var("OCP_IDEMPOTENCY_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_IDEMPOTENCY_STORE_PATH)),
        rate_limit_path: std::env::var("OCP_RATE_LIMIT_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_RATE_LIMIT_STORE_PATH)),
    }
}

/// Parse a [`PolicyProfile`] document from `path`, dispatching on its
/// extension (`.toml` or `.json`).
pub fn load_policy_profile(path: &Path) -> Result<PolicyProfile, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&text).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        }),
        Some("json") => {
            serde_json::from_str(&text).map_err(|source| ConfigError::JsonParse {
                path: path.to_path_buf(),
                source,
            })
        }
        _ => Err(ConfigError::UnsupportedExtension {
            path: path.to_path_buf(),
        }),
    }
}

/// Resolve the profile document path for `profile_id` under `profiles_dir`,
/// preferring a `.toml` file and falling back to `.json`.
#[must_use]
pub fn resolve_policy_profile_path(profiles_dir: &Path, profile_id: &str) -> PathBuf {
    let toml_path = profiles_dir.join(format!("{profile_id}.toml"));
    if toml_path.exists() {
        return toml_path;
    }
    profiles_dir.join(format!("{profile_id}.json"))
}

/// Load the profile selected by `OCP_POLICY_PROFILE_ID` from `profiles_dir`.
/// Returns [`ConfigError::FileNotFound`] if the variable is unset or no
/// matching document exists.
pub fn load_selected_policy_profile(profiles_dir: &Path) -> Result<PolicyProfile, ConfigError> {
    let profile_id = std::env::var("OCP_POLICY_PROFILE_ID").map_err(|_| ConfigError::FileNotFound {
        path: profiles_dir.join("<OCP_POLICY_PROFILE_ID unset>"),
    })?;
    let path = resolve_policy_profile_path(profiles_dir, &profile_id);
    load_policy_profile(&path)
}

/// A partial profile document that overrides fields of a base
/// [`PolicyProfile`], used for environment- or deployment-specific overlays.
/// Every field is optional; unset fields leave the base value untouched.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PolicyProfileOverlay {
    /// Must match the base profile's `id` if present.
    pub id: Option<String>,
    /// Replaces `allowed_targets` wholesale when present.
    pub allowed_targets: Option<Vec<String>>,
    /// Overrides `require_hmac`.
    pub require_hmac: Option<bool>,
    /// Overrides `timeout_ms`.
    pub timeout_ms: Option<u64>,
    /// Overrides `max_payload_bytes`.
    pub max_payload_bytes: Option<u64>,
    /// Overrides `allow_real_send`.
    pub allow_real_send: Option<bool>,
    /// Overrides `retry_enabled`.
    pub retry_enabled: Option<bool>,
    /// Overrides `max_attempts`.
    pub max_attempts: Option<u32>,
    /// Replaces `retry_on_status` wholesale when present.
    pub retry_on_status: Option<Vec<u16>>,
    /// Overrides `base_backoff_ms`.
    pub base_backoff_ms: Option<u64>,
    /// Overrides `max_backoff_ms`.
    pub max_backoff_ms: Option<u64>,
    /// Overrides the rate-limit sub-document wholesale when present.
    pub rate_limit: Option<RateLimitPolicy>,
}

/// Merge `overlay` onto `base`, returning a new profile. The overlay's `id`,
/// if present, must equal the base's `id`; any other value is a
/// [`ConfigError::MergeConflict`].
pub fn merge_policy_profile_overlay(
    base: PolicyProfile,
    overlay: PolicyProfileOverlay,
) -> Result<PolicyProfile, ConfigError> {
    if let Some(overlay_id) = &overlay.id {
        if overlay_id != &base.id {
            return Err(ConfigError::MergeConflict {
                base_id: base.id,
                overlay_id: overlay_id.clone(),
            });
        }
    }
    Ok(PolicyProfile {
        id: base.id,
        allowed_targets: overlay.allowed_targets.unwrap_or(base.allowed_targets),
        require_hmac: overlay.require_hmac.unwrap_or(base.require_hmac),
        timeout_ms: overlay.timeout_ms.unwrap_or(base.timeout_ms),
        max_payload_bytes: overlay.max_payload_bytes.unwrap_or(base.max_payload_bytes),
        allow_real_send: overlay.allow_real_send.unwrap_or(base.allow_real_send),
        retry_enabled: overlay.retry_enabled.unwrap_or(base.retry_enabled),
        max_attempts: overlay.max_attempts.unwrap_or(base.max_attempts),
        retry_on_status: overlay.retry_on_status.unwrap_or(base.retry_on_status),
        base_backoff_ms: overlay.base_backoff_ms.unwrap_or(base.base_backoff_ms),
        max_backoff_ms: overlay.max_backoff_ms.unwrap_or(base.max_backoff_ms),
        rate_limit: overlay.rate_limit.unwrap_or(base.rate_limit),
    })
}

/// Validate a loaded [`PolicyProfile`] against the resolved [`DeliveryEnv`],
/// returning structural errors and cross-cutting warnings separately.
pub fn validate_policy_profile(
    profile: &PolicyProfile,
    env: &DeliveryEnv,
) -> Result<Vec<ConfigWarning>, ConfigError> {
    if profile.timeout_ms > MAX_TIMEOUT_MS {
        return Err(ConfigError::InvalidProfile {
            id: profile.id.clone(),
            reason: format!(
                "timeout_ms {} exceeds the maximum of {MAX_TIMEOUT_MS}",
                profile.timeout_ms
            ),
        });
    }
    if profile.max_attempts == 0 && profile.retry_enabled {
        return Err(ConfigError::InvalidProfile {
            id: profile.id.clone(),
            reason: "retry_enabled is true but max_attempts is 0".to_string(),
        });
    }

    let mut warnings = Vec::new();
    if profile.require_hmac && env.signing_secret.is_none() {
        warnings.push(ConfigWarning::RequireHmacWithoutSecret);
    }
    if profile.allow_real_send && !env.real_send_armed {
        warnings.push(ConfigWarning::RealSendNotArmed);
    }
    if profile.timeout_ms > LARGE_TIMEOUT_THRESHOLD_MS {
        warnings.push(ConfigWarning::LargeTimeout {
            timeout_ms: profile.timeout_ms,
        });
    }
    if profile.allowed_targets.is_empty() {
        warnings.push(ConfigWarning::EmptyAllowedTargets);
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> PolicyProfile {
        PolicyProfile {
            id: "staging".to_string(),
            allowed_targets: vec!["hooks.example.com".to_string()],
            require_hmac: true,
            timeout_ms: 5_000,
            max_payload_bytes: 65_536,
            allow_real_send: false,
            retry_enabled: true,
            max_attempts: 3,
            retry_on_status: vec![429, 500, 502, 503],
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            rate_limit: RateLimitPolicy {
                enabled: true,
                cooldown_ms: 1_000,
                strict: false,
            },
        }
    }

    fn empty_env() -> DeliveryEnv {
        DeliveryEnv {
            real_send_armed: false,
            signing_secret: None,
            require_idempotency: false,
            allow_noop_only: false,
        }
    }

    #[test]
    fn load_policy_profile_rejects_missing_file() {
        let err = load_policy_profile(Path::new("/nonexistent/profile.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_policy_profile_rejects_unsupported_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("profile.yaml");
        std::fs::write(&path, "id: x").unwrap();
        let err = load_policy_profile(&path).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedExtension { .. }));
    }

    #[test]
    fn load_policy_profile_parses_toml() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("staging.toml");
        std::fs::write(
            &path,
            r#"
            id = "staging"
            allowed_targets = ["hooks.example.com"]
            require_hmac = true
            timeout_ms = 5000
            max_payload_bytes = 65536
            allow_real_send = false
            retry_enabled = true
            max_attempts = 3
            retry_on_status = [429, 500]
            base_backoff_ms = 200
            max_backoff_ms = 5000

            [rate_limit]
            enabled = true
            cooldown_ms = 1000
            strict = false
            "#,
        )
        .unwrap();
        let profile = load_policy_profile(&path).unwrap();
        assert_eq!(profile.id, "staging");
        assert!(profile.require_hmac);
    }

    #[test]
    fn load_policy_profile_parses_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("staging.json");
        std::fs::write(&path, serde_json::to_string(&sample_profile()).unwrap()).unwrap();
        let profile = load_policy_profile(&path).unwrap();
        assert_eq!(profile.id, "staging");
    }

    #[test]
    fn resolve_policy_profile_path_prefers_toml() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("staging.toml"), "").unwrap();
        std::fs::write(tmp.path().join("staging.json"), "").unwrap();
        let resolved = resolve_policy_profile_path(tmp.path(), "staging");
        assert_eq!(resolved.extension().unwrap(), "toml");
    }

    #[test]
    fn resolve_policy_profile_path_falls_back_to_json() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("staging.json"), "").unwrap();
        let resolved = resolve_policy_profile_path(tmp.path(), "staging");
        assert_eq!(resolved.extension().unwrap(), "json");
    }

    #[test]
    fn merge_overlay_overrides_only_present_fields() {
        let base = sample_profile();
        let overlay = PolicyProfileOverlay {
            timeout_ms: Some(9_000),
            ..Default::default()
        };
        let merged = merge_policy_profile_overlay(base.clone(), overlay).unwrap();
        assert_eq!(merged.timeout_ms, 9_000);
        assert_eq!(merged.max_attempts, base.max_attempts);
        assert_eq!(merged.allowed_targets, base.allowed_targets);
    }

    #[test]
    fn merge_overlay_rejects_mismatched_id() {
        let base = sample_profile();
        let overlay = PolicyProfileOverlay {
            id: Some("other".to_string()),
            ..Default::default()
        };
        let err = merge_policy_profile_overlay(base, overlay).unwrap_err();
        assert!(matches!(err, ConfigError::MergeConflict { .. }));
    }

    #[test]
    fn validate_rejects_timeout_above_ceiling() {
        let mut profile = sample_profile();
        profile.timeout_ms = MAX_TIMEOUT_MS + 1;
        let err = validate_policy_profile(&profile, &empty_env()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProfile { .. }));
    }

    #[test]
    fn validate_rejects_retry_enabled_with_zero_attempts() {
        let mut profile = sample_profile();
        profile.max_attempts = 0;
        let err = validate_policy_profile(&profile, &empty_env()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProfile { .. }));
    }

    #[test]
    fn validate_warns_on_require_hmac_without_secret() {
        let profile = sample_profile();
        let warnings = validate_policy_profile(&profile, &empty_env()).unwrap();
        assert!(warnings.contains(&ConfigWarning::RequireHmacWithoutSecret));
    }

    #[test]
    fn validate_does_not_warn_when_secret_configured() {
        let profile = sample_profile();
        let mut env = empty_env();
        env.signing_secret = Some("s3cr3t".to_string());
        let warnings = validate_policy_profile(&profile, &env).unwrap();
        assert!(!warnings.contains(&ConfigWarning::RequireHmacWithoutSecret));
    }

    #[test]
    fn validate_warns_on_real_send_not_armed() {
        let mut profile = sample_profile();
        profile.allow_real_send = true;
        let warnings = validate_policy_profile(&profile, &empty_env()).unwrap();
        assert!(warnings.contains(&ConfigWarning::RealSendNotArmed));
    }

    #[test]
    fn validate_warns_on_large_timeout() {
        let mut profile = sample_profile();
        profile.timeout_ms = LARGE_TIMEOUT_THRESHOLD_MS + 1;
        let warnings = validate_policy_profile(&profile, &empty_env()).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::LargeTimeout { .. })));
    }

    #[test]
    fn validate_warns_on_empty_allowed_targets() {
        let mut profile = sample_profile();
        profile.allowed_targets = Vec::new();
        let warnings = validate_policy_profile(&profile, &empty_env()).unwrap();
        assert!(warnings.contains(&ConfigWarning::EmptyAllowedTargets));
    }

    #[test]
    fn default_store_paths_match_published_constants() {
        assert_eq!(DEFAULT_IDEMPOTENCY_STORE_PATH, "state/idempotency.json");
        assert_eq!(DEFAULT_RATE_LIMIT_STORE_PATH, "state/rate_limit.json");
    }
}
