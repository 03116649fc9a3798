//! Conversation control state (bot vs. human) per device/counterpart pair.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who is currently driving a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    /// Auto-replies are allowed.
    #[default]
    Bot,
    /// A human operator took over; auto-replies are frozen until resume.
    Handoff,
}

impl ControlState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::Handoff => "handoff",
        }
    }
}

impl FromStr for ControlState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bot" => Ok(Self::Bot),
            "handoff" => Ok(Self::Handoff),
            other => Err(format!("unknown control state: {other}")),
        }
    }
}

/// Identity of a conversation: one device talking to one person or group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub device_id: String,
    pub counterpart_id: String,
}

impl ConversationKey {
    pub fn new(device_id: impl Into<String>, counterpart_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            counterpart_id: counterpart_id.into(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.device_id, self.counterpart_id)
    }
}

/// Persisted conversation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub device_id: String,
    pub counterpart_id: String,
    pub state: ControlState,
    pub last_bot_activity_at: Option<DateTime<Utc>>,
    pub last_handoff_requested_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Why the last handoff was requested.
    pub handoff_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// A fresh conversation, starting under bot control.
    pub fn new(key: &ConversationKey) -> Self {
        Self {
            device_id: key.device_id.clone(),
            counterpart_id: key.counterpart_id.clone(),
            state: ControlState::Bot,
            last_bot_activity_at: None,
            last_handoff_requested_at: None,
            last_message_at: None,
            handoff_reason: None,
            created_at: Utc::now(),
        }
    }
}

/// Decision returned for an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Send `response` back to the counterpart, then report it as sent.
    AutoReply { rule_id: i64, response: String },
    /// Nothing to send: a human is driving or no rule matched.
    NoAutoReply,
}
