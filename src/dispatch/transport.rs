//! Outbound transport: the capability that actually delivers one message.
//!
//! The dispatcher and the inbound handler only see the `OutboundTransport`
//! trait. `HttpGatewayTransport` talks to a device gateway over HTTP and maps
//! its responses onto the `DeliveryError` taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::DeliveryError;

/// Sends a single payload from a device to a recipient.
///
/// Returns the transport-assigned message id on success.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn send(
        &self,
        device_id: &str,
        recipient: &str,
        payload: &serde_json::Value,
    ) -> Result<String, DeliveryError>;
}

/// Transport backed by a device gateway's HTTP API.
pub struct HttpGatewayTransport {
    base_url: String,
    token: Option<SecretString>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SendResponse {
    message_id: String,
}

#[derive(Deserialize, Default)]
struct GatewayErrorBody {
    #[serde(default)]
    error: String,
}

impl HttpGatewayTransport {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn messages_url(&self, device_id: &str) -> String {
        format!("{}/devices/{device_id}/messages", self.base_url)
    }
}

#[async_trait]
impl OutboundTransport for HttpGatewayTransport {
    async fn send(
        &self,
        device_id: &str,
        recipient: &str,
        payload: &serde_json::Value,
    ) -> Result<String, DeliveryError> {
        let body = serde_json::json!({
            "recipient": recipient,
            "payload": payload,
        });

        let mut request = self.client.post(self.messages_url(device_id)).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Transient(format!("gateway request timed out: {e}"))
            } else {
                DeliveryError::Transient(format!("gateway unreachable: {e}"))
            }
        })?;

        let status = resp.status();
        if status.is_success() {
            let sent: SendResponse = resp.json().await.map_err(|e| {
                DeliveryError::Transient(format!("malformed gateway response: {e}"))
            })?;
            debug!(device_id, recipient, message_id = %sent.message_id, "Gateway accepted message");
            return Ok(sent.message_id);
        }

        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let text = resp.text().await.unwrap_or_default();
        let error = classify_response(status, &text, retry_after);

        warn!(
            device_id,
            recipient,
            status = status.as_u16(),
            error = %error,
            "Gateway rejected message"
        );
        Err(error)
    }
}

/// Parse a `Retry-After` header given in whole seconds.
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    header_value
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Map a non-success gateway response onto a delivery error.
pub fn classify_response(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> DeliveryError {
    let reason = serde_json::from_str::<GatewayErrorBody>(body)
        .map(|b| b.error)
        .ok()
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| format!("gateway returned {status}"));

    match status {
        StatusCode::TOO_MANY_REQUESTS => DeliveryError::RateLimited { retry_after },
        StatusCode::CONFLICT | StatusCode::GONE => DeliveryError::SessionLost(reason),
        // 404 on the device itself, as opposed to an unknown recipient
        StatusCode::NOT_FOUND if reason.to_lowercase().contains("device") => {
            DeliveryError::SessionLost(reason)
        }
        StatusCode::REQUEST_TIMEOUT => DeliveryError::Transient(reason),
        s if s.is_server_error() => DeliveryError::Transient(reason),
        _ => DeliveryError::Permanent(reason),
    }
}
