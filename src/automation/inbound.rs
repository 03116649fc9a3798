//! Inbound handler: glue between the transport callback and the manager.
//!
//! Each auto-reply attempt runs under the conversation lock and first checks
//! that the bot still has control, so a handoff that lands before an attempt
//! cancels it. The lock is released while waiting out a retry backoff.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::conversation::{Action, ControlState, ConversationKey};
use super::manager::ConversationManager;
use crate::dispatch::retry::{RetryDecision, RetryPolicy};
use crate::dispatch::transport::OutboundTransport;
use crate::error::{DeliveryError, Result, ValidationError};

/// A message received by a device, as reported by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub device_id: String,
    /// Person or group the message came from.
    pub sender_id: String,
    pub text: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

pub struct InboundHandler {
    manager: Arc<ConversationManager>,
    transport: Arc<dyn OutboundTransport>,
    retry: RetryPolicy,
    send_timeout: Duration,
}

impl InboundHandler {
    pub fn new(
        manager: Arc<ConversationManager>,
        transport: Arc<dyn OutboundTransport>,
        retry: RetryPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            transport,
            retry,
            send_timeout,
        }
    }

    /// Handle one inbound message; returns the action that was carried out.
    ///
    /// A failed auto-reply send surfaces as `Error::Delivery` and is not
    /// recorded as bot activity. If the conversation is handed off before a
    /// send attempt, nothing is sent and `NoAutoReply` is returned.
    pub async fn handle(&self, event: &InboundEvent) -> Result<Action> {
        if event.device_id.trim().is_empty() {
            return Err(ValidationError::EmptyDevice.into());
        }
        if event.sender_id.trim().is_empty() {
            return Err(ValidationError::InvalidField {
                field: "sender_id".into(),
                reason: "must not be empty".into(),
            }
            .into());
        }

        let key = ConversationKey::new(&event.device_id, &event.sender_id);
        let action = {
            let _guard = self.manager.lock_key(&key).await;
            self.manager
                .inbound_locked(&key, &event.text, event.timestamp)
                .await?
        };
        let Action::AutoReply { rule_id, response } = &action else {
            debug!(conversation = %key, "No auto-reply for inbound message");
            return Ok(action);
        };

        let payload = serde_json::json!({ "text": response });
        let mut attempt = 0;
        loop {
            attempt += 1;
            let guard = self.manager.lock_key(&key).await;
            if self.manager.state_locked(&key).await? == ControlState::Handoff {
                debug!(conversation = %key, attempt, "Handed off before the reply went out");
                return Ok(Action::NoAutoReply);
            }

            let error = match self.send_once(&key, &payload).await {
                Ok(message_id) => {
                    self.manager
                        .record_sent_locked(&key, *rule_id, &message_id)
                        .await?;
                    return Ok(action);
                }
                Err(error) => error,
            };
            drop(guard);

            match self.retry.decide(attempt, &error) {
                RetryDecision::Retry { delay } => {
                    debug!(conversation = %key, attempt, error = %error, "Auto-reply send failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    warn!(conversation = %key, attempt, error = %error, "Auto-reply not delivered");
                    return Err(error.into());
                }
            }
        }
    }

    async fn send_once(
        &self,
        key: &ConversationKey,
        payload: &serde_json::Value,
    ) -> std::result::Result<String, DeliveryError> {
        match tokio::time::timeout(
            self.send_timeout,
            self.transport
                .send(&key.device_id, &key.counterpart_id, payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.send_timeout)),
        }
    }
}
