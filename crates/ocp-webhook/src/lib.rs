//! ocp-webhook
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! HMAC-SHA256 signed webhook POST driver (component C7). Serializes a
//! payload once, hashes and signs those exact bytes, and POSTs them with a
//! hard per-call deadline. Never throws for a non-2xx response — that
//! classification is the delivery orchestrator's job (C11/`ocp-retry`);
//! this driver only distinguishes "got an HTTP response" from "transport
//! failed".

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

/// Header carrying the decimal-millisecond timestamp used in the signature.
pub const HEADER_TIMESTAMP: &str = "x-mova-ts";
/// Header carrying the hex-encoded SHA-256 of the request body.
pub const HEADER_BODY_SHA256: &str = "x-mova-body-sha256";
/// Header carrying the hex-encoded HMAC-SHA256 signature.
pub const HEADER_SIGNATURE: &str = "x-mova-sig";

/// Input to [`send_signed_webhook`].
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Destination URL.
    pub target_url: String,
    /// Payload to serialize, hash, sign, and send as the request body.
    pub payload: serde_json::Value,
    /// HMAC signing secret. Flows through memory only; never logged or
    /// persisted to evidence.
    pub signing_secret: String,
    /// Hard deadline for this single POST attempt.
    pub timeout_ms: u64,
}

/// Result of one webhook send attempt. Never represents the driver itself
/// erroring — timeouts and transport failures are normalized into this
/// type's `status`/`response_body`, never raised as an `Err`.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    /// HTTP status code, or a synthetic `408`/`500` for timeout/transport
    /// failure respectively.
    pub status: u16,
    /// Wall-clock duration of the attempt.
    pub duration_ms: u64,
    /// Response body text, or a synthetic message on timeout/transport
    /// failure.
    pub response_body: String,
    /// Hex-encoded SHA-256 of `response_body`, when a real response was
    /// received.
    pub response_body_sha256: Option<String>,
    /// Hex-encoded SHA-256 of the exact request body bytes sent.
    pub request_body_sha256: String,
    /// Epoch milliseconds used in the signature.
    pub timestamp_ms: u64,
}

/// Canonicalize `payload` into the exact bytes that will be hashed, signed,
/// and transmitted. Per `DESIGN.md`'s resolution of the canonicalization
/// open question, this is simply `serde_json::to_vec`: whatever bytes are
/// hashed are the bytes placed on the wire, by construction.
///
/// # Errors
///
/// Returns an error if `payload` cannot be serialized (never the case for
/// a `serde_json::Value` built from valid JSON).
pub fn canonical_body(payload: &serde_json::Value) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(payload)
}

/// Hex-encoded SHA-256 of `body`.
#[must_use]
pub fn body_sha256(body: &[u8]) -> String {
    use sha2::Digest;
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

/// Hex-encoded HMAC-SHA256 of `"{timestamp_ms}.{body_sha256}"` under
/// `signing_secret`.
#[must_use]
pub fn sign(signing_secret: &str, timestamp_ms: u64, body_sha256_hex: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC accepts a key of any length");
    mac.update(format!("{timestamp_ms}.{body_sha256_hex}").as_bytes());
    let bytes = mac.finalize().into_bytes();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Send one signed webhook POST, enforcing `request.timeout_ms` as a hard
/// deadline.
///
/// On timeout, returns `{status: 408, response_body: "timeout"}`. On any
/// other transport failure, returns `{status: 500, response_body:
/// <message>}`. Otherwise returns the real status and body. This function
/// never returns `Err` and never panics on a non-2xx response — only the
/// orchestrator classifies outcomes.
pub async fn send_signed_webhook(
    client: &reqwest::Client,
    request: WebhookRequest,
    now_ms: u64,
) -> WebhookResponse {
    let started = std::time::Instant::now();

    let body = match canonical_body(&request.payload) {
        Ok(b) => b,
        Err(e) => {
            return WebhookResponse {
                status: 500,
                duration_ms: elapsed_ms(started),
                response_body: format!("payload serialization failed: {e}"),
                response_body_sha256: None,
                request_body_sha256: String::new(),
                timestamp_ms: now_ms,
            };
        }
    };

    let req_body_sha256 = body_sha256(&body);
    let signature = sign(&request.signing_secret, now_ms, &req_body_sha256);

    let send_future = client
        .post(&request.target_url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(HEADER_TIMESTAMP, now_ms.to_string())
        .header(HEADER_BODY_SHA256, &req_body_sha256)
        .header(HEADER_SIGNATURE, &signature)
        .body(body)
        .send();

    match tokio::time::timeout(Duration::from_millis(request.timeout_ms), send_future).await {
        Err(_elapsed) => WebhookResponse {
            status: 408,
            duration_ms: elapsed_ms(started),
            response_body: "timeout".to_string(),
            response_body_sha256: None,
            request_body_sha256: req_body_sha256,
            timestamp_ms: now_ms,
        },
        Ok(Err(transport_err)) => WebhookResponse {
            status: 500,
            duration_ms: elapsed_ms(started),
            response_body: transport_err.to_string(),
            response_body_sha256: None,
            request_body_sha256: req_body_sha256,
            timestamp_ms: now_ms,
        },
        Ok(Ok(response)) => {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            let response_sha = body_sha256(text.as_bytes());
            WebhookResponse {
                status,
                duration_ms: elapsed_ms(started),
                response_body: text,
                response_body_sha256: Some(response_sha),
                request_body_sha256: req_body_sha256,
                timestamp_ms: now_ms,
            }
        }
    }
}

fn elapsed_ms(started: std::time::Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
