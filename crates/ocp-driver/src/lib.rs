#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Name-to-factory driver registry (component C6) and the built-in drivers
//! a plan step or delivery attempt can bind to.

use async_trait::async_trait;
use ocp_core::ToolBinding;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while resolving or executing a driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// No driver is registered under the requested name.
    #[error("no driver registered under {0:?}")]
    NotFound(String),
    /// The driver rejected its input (bad shape, disallowed command, etc.).
    #[error("driver {driver} rejected input: {reason}")]
    InvalidInput {
        /// The driver that rejected the input.
        driver: String,
        /// Why the input was rejected.
        reason: String,
    },
    /// The driver's underlying call failed.
    #[error("driver {driver} call failed: {source}")]
    CallFailed {
        /// The driver that failed.
        driver: String,
        /// Underlying error, formatted.
        #[source]
        source: anyhow::Error,
    },
}

/// Context passed alongside a step's input to a driver invocation, per
/// §4.5 step (f): `(input, {driverName, allowlist, limits, bindings})`.
#[derive(Debug, Clone)]
pub struct DriverContext {
    /// Name the step resolved this driver under.
    pub driver_name: String,
    /// Destination allowlist from the tool's binding, if any.
    pub allowlist: Option<Vec<String>>,
    /// Resource bounds from the tool's binding.
    pub limits: ocp_core::ToolLimits,
    /// The full tool binding, for drivers that need more than the above.
    pub binding: ToolBinding,
}

/// A side-effect driver: executes one step's resolved input and returns its
/// output, or a classified [`DriverError`]. Never panics on ordinary
/// rejection paths (bad input, disallowed destination); those are
/// `InvalidInput`.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Stable name this driver is registered and resolved under.
    fn name(&self) -> &'static str;
    /// Execute `input` under `ctx`.
    async fn execute(&self, input: Value, ctx: &DriverContext) -> Result<Value, DriverError>;
}

type Factory = Box<dyn Fn() -> Arc<dyn Driver> + Send + Sync>;

/// Name-to-factory registry. Factories are lazy: a driver is constructed on
/// first [`get`](Self::get) and cached for subsequent lookups.
pub struct DriverRegistry {
    factories: HashMap<String, Factory>,
    instances: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

impl DriverRegistry {
    /// An empty registry with no built-ins registered.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with every built-in driver registered:
    /// `noop`, `http`, `restricted_shell`, `noop_delivery_v0`,
    /// `noop_webhook_v0`, `http_webhook_delivery_v1`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("noop", || Arc::new(NoopDriver));
        registry.register("http", || Arc::new(HttpDriver::default()));
        registry.register("restricted_shell", || Arc::new(RestrictedShellDriver::default()));
        registry.register("noop_delivery_v0", || Arc::new(NoopDeliveryDriver));
        registry.register("noop_webhook_v0", || Arc::new(NoopWebhookDriver));
        registry.register("http_webhook_delivery_v1", || Arc::new(HttpWebhookDeliveryDriver::default()));
        registry
    }

    /// Register a factory under `name`, replacing any prior registration.
    pub fn register(&mut self, name: &str, factory: impl Fn() -> Arc<dyn Driver> + Send + Sync + 'static) {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Resolve `name` to a driver instance, constructing it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::NotFound`] if no factory is registered under
    /// `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>, DriverError> {
        if let Some(existing) = self.instances.read().expect("lock poisoned").get(name) {
            return Ok(existing.clone());
        }
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;
        let instance = factory();
        self.instances
            .write()
            .expect("lock poisoned")
            .insert(name.to_string(), instance.clone());
        Ok(instance)
    }

    /// The names of every registered driver, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Echoes its input back unchanged. Used for dry runs and tests.
pub struct NoopDriver;

#[async_trait]
impl Driver for NoopDriver {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn execute(&self, input: Value, _ctx: &DriverContext) -> Result<Value, DriverError> {
        Ok(json!({"echo": input}))
    }
}

/// Generic HTTP tool driver: issues a GET or POST against `input.url`
/// (honoring `input.method` and `input.body`) within the binding's
/// destination allowlist and timeout.
pub struct HttpDriver {
    client: reqwest::Client,
}

impl Default for HttpDriver {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Driver for HttpDriver {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn execute(&self, input: Value, ctx: &DriverContext) -> Result<Value, DriverError> {
        let url = input
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::InvalidInput {
                driver: self.name().to_string(),
                reason: "input.url is required".to_string(),
            })?;

        if let Some(allowlist) = &ctx.allowlist {
            if !allowlist.iter().any(|entry| url.contains(entry.as_str())) {
                return Err(DriverError::InvalidInput {
                    driver: self.name().to_string(),
                    reason: format!("{url} is not in the destination allowlist"),
                });
            }
        }

        let method = input
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        let mut request = match method.as_str() {
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            _ => self.client.get(url),
        };
        if let Some(body) = input.get("body") {
            request = request.json(body);
        }

        let send = request.timeout(Duration::from_millis(ctx.limits.timeout_ms)).send();
        let response = tokio::time::timeout(Duration::from_millis(ctx.limits.timeout_ms), send)
            .await
            .map_err(|_| DriverError::CallFailed {
                driver: self.name().to_string(),
                source: anyhow::anyhow!("request timed out after {}ms", ctx.limits.timeout_ms),
            })?
            .map_err(|e| DriverError::CallFailed {
                driver: self.name().to_string(),
                source: e.into(),
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(json!({"status": status, "body": body}))
    }
}

/// Binaries a `restricted_shell` invocation may name. Anything else is
/// rejected before a process is ever spawned.
const SHELL_COMMAND_ALLOWLIST: &[&str] = &["echo", "true", "false"];

/// Runs a tightly allowlisted external command directly (never through a
/// shell interpreter, so no shell metacharacter ever has effect). Only the
/// binaries in [`SHELL_COMMAND_ALLOWLIST`] may be named.
#[derive(Default)]
pub struct RestrictedShellDriver;

#[async_trait]
impl Driver for RestrictedShellDriver {
    fn name(&self) -> &'static str {
        "restricted_shell"
    }

    async fn execute(&self, input: Value, ctx: &DriverContext) -> Result<Value, DriverError> {
        let command = input
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::InvalidInput {
                driver: self.name().to_string(),
                reason: "input.command is required".to_string(),
            })?;
        if !SHELL_COMMAND_ALLOWLIST.contains(&command) {
            return Err(DriverError::InvalidInput {
                driver: self.name().to_string(),
                reason: format!("{command:?} is not on the restricted-shell allowlist"),
            });
        }
        let args: Vec<String> = input
            .get("args")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(&args);
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_millis(ctx.limits.timeout_ms), cmd.output())
            .await
            .map_err(|_| DriverError::CallFailed {
                driver: self.name().to_string(),
                source: anyhow::anyhow!("command timed out after {}ms", ctx.limits.timeout_ms),
            })?
            .map_err(|e| DriverError::CallFailed {
                driver: self.name().to_string(),
                source: e.into(),
            })?;

        Ok(json!({
            "exit_code": output.status.code(),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }))
    }
}

/// Always succeeds without sending anything. Used by `PolicyProfile`s with
/// `allow_real_send = false` to exercise the full orchestrator without a
/// network call.
pub struct NoopDeliveryDriver;

#[async_trait]
impl Driver for NoopDeliveryDriver {
    fn name(&self) -> &'static str {
        "noop_delivery_v0"
    }

    async fn execute(&self, input: Value, _ctx: &DriverContext) -> Result<Value, DriverError> {
        Ok(json!({"status": 200, "dry_run": true, "echo": input}))
    }
}

/// Dry-run counterpart of [`HttpWebhookDeliveryDriver`]; computes the same
/// hashes a real send would, but never issues the HTTP request.
pub struct NoopWebhookDriver;

#[async_trait]
impl Driver for NoopWebhookDriver {
    fn name(&self) -> &'static str {
        "noop_webhook_v0"
    }

    async fn execute(&self, input: Value, _ctx: &DriverContext) -> Result<Value, DriverError> {
        let payload = input.get("payload").cloned().unwrap_or(Value::Null);
        let body = ocp_webhook::canonical_body(&payload).unwrap_or_default();
        let body_sha256 = ocp_webhook::body_sha256(&body);
        Ok(json!({"status": 200, "dry_run": true, "request_body_sha256": body_sha256}))
    }
}

/// The signed webhook driver (C7), wired into the registry under the wire
/// name `http_webhook_delivery_v1`.
pub struct HttpWebhookDeliveryDriver {
    client: reqwest::Client,
}

impl Default for HttpWebhookDeliveryDriver {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Driver for HttpWebhookDeliveryDriver {
    fn name(&self) -> &'static str {
        "http_webhook_delivery_v1"
    }

    async fn execute(&self, input: Value, ctx: &DriverContext) -> Result<Value, DriverError> {
        let target_url = input
            .get("target_url")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::InvalidInput {
                driver: self.name().to_string(),
                reason: "input.target_url is required".to_string(),
            })?
            .to_string();
        let signing_secret = input
            .get("signing_secret")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::InvalidInput {
                driver: self.name().to_string(),
                reason: "input.signing_secret is required".to_string(),
            })?
            .to_string();
        let payload = input.get("payload").cloned().unwrap_or(Value::Null);

        let now_ms = u64::try_from(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis(),
        )
        .unwrap_or(u64::MAX);

        let response = ocp_webhook::send_signed_webhook(
            &self.client,
            ocp_webhook::WebhookRequest {
                target_url,
                payload,
                signing_secret,
                timeout_ms: ctx.limits.timeout_ms,
            },
            now_ms,
        )
        .await;

        Ok(json!({
            "status": response.status,
            "duration_ms": response.duration_ms,
            "response_body": response.response_body,
            "response_body_sha256": response.response_body_sha256,
            "request_body_sha256": response.request_body_sha256,
            "timestamp_ms": response.timestamp_ms,
        }))
    }
}
