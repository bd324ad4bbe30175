use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chat message received on a tenant's inbound address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InboundMessage {
    #[serde(default = "new_message_id")]
    pub id: String,
    /// Sender address (phone number, chat handle, ...).
    pub from: String,
    /// Destination address; identifies the tenant.
    pub to: String,
    pub body: String,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

impl InboundMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            from: from.into(),
            to: to.into(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Interactive,
    Media,
    Template,
}

/// Severity hint a channel may use to style the message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

/// Channel metadata carried by every node and copied onto the outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DisplayMeta {
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default)]
    pub level: MessageLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// What the dispatcher is asked to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub identity_id: Option<String>,
    pub body: String,
    pub tenant_id: String,
    pub kind: MessageType,
    pub level: MessageLevel,
    pub title: Option<String>,
    pub session_id: Option<Uuid>,
    /// Set only for scripted replies that move the sender forward.
    pub branch_key: Option<String>,
}

impl OutboundMessage {
    pub fn display(&self) -> DisplayMeta {
        DisplayMeta {
            kind: self.kind,
            level: self.level,
            title: self.title.clone(),
        }
    }
}
