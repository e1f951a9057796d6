//! Webhook request decoding

use axum::http::HeaderMap;
use url::form_urlencoded;

use crate::error::DeployError;

/// A decoded webhook delivery.
///
/// `canonical_body` is the exact byte sequence the sender signed. For JSON
/// deliveries that is the HTTP body itself; for form-encoded deliveries it
/// is the extracted `payload` field, not the outer form envelope. Signature
/// verification must always run against `canonical_body`.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_type: String,
    pub delivery_id: String,
    pub signature_header: String,
    pub payload: serde_json::Value,
    pub canonical_body: Vec<u8>,
}

impl WebhookEvent {
    /// Assemble an event from request headers and body. Fails only on a
    /// malformed payload; missing headers become empty strings and fall out
    /// later as signature or dispatch failures.
    pub fn from_request(headers: &HeaderMap, body: &[u8]) -> Result<Self, DeployError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };

        let content_type = header("Content-Type");
        let (payload, canonical_body) = decode_body(&content_type, body)?;

        Ok(Self {
            event_type: header("X-GitHub-Event"),
            delivery_id: header("X-GitHub-Delivery"),
            signature_header: header("X-Hub-Signature-256"),
            payload,
            canonical_body,
        })
    }

    pub fn git_ref(&self) -> Option<&str> {
        self.payload.get("ref").and_then(|r| r.as_str())
    }

    pub fn repository_name(&self) -> Option<&str> {
        self.payload
            .get("repository")
            .and_then(|r| r.get("name"))
            .and_then(|n| n.as_str())
    }

    /// Branch name: the last path segment of the ref.
    pub fn branch(&self) -> Option<&str> {
        self.git_ref().and_then(|r| r.rsplit('/').next())
    }

    /// Only pushes to the main branches are deployed.
    pub fn is_deploy_ref(&self) -> bool {
        matches!(self.git_ref(), Some("refs/heads/main" | "refs/heads/master"))
    }
}

/// Normalizes the two webhook body encodings into a parsed payload plus the
/// canonical signed bytes.
pub fn decode_body(
    content_type: &str,
    body: &[u8],
) -> Result<(serde_json::Value, Vec<u8>), DeployError> {
    if content_type.starts_with("application/x-www-form-urlencoded") {
        let payload_field = form_urlencoded::parse(body)
            .find(|(key, _)| key == "payload")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_else(|| "{}".to_string());

        let payload: serde_json::Value = serde_json::from_str(&payload_field)
            .map_err(|e| DeployError::Decode(format!("invalid form payload field: {}", e)))?;
        Ok((payload, payload_field.into_bytes()))
    } else {
        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| DeployError::Decode(format!("invalid JSON body: {}", e)))?;
        Ok((payload, body.to_vec()))
    }
}
