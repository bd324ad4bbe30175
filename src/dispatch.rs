use std::{
    fmt::Debug,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::message::OutboundMessage;

/// Delivers rendered messages on the tenant's channel.
#[async_trait]
pub trait MessageDispatcher: Send + Sync + Debug {
    async fn dispatch(&self, message: OutboundMessage) -> Result<()>;
}

/// Payload pushed to a live agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentNotification {
    pub session_id: Uuid,
    pub tenant_id: String,
    pub from: String,
    pub message: String,
}

/// Pushes live notifications to human agents.
#[async_trait]
pub trait AgentBridge: Send + Sync + Debug {
    async fn notify_agent(&self, agent_id: &str, payload: AgentNotification) -> Result<()>;
}

/// Writes every outbound message to the log; used when no channel is wired in.
#[derive(Debug, Default, Clone)]
pub struct TracingDispatcher;

#[async_trait]
impl MessageDispatcher for TracingDispatcher {
    async fn dispatch(&self, message: OutboundMessage) -> Result<()> {
        info!(
            to = %message.to,
            tenant = %message.tenant_id,
            kind = ?message.kind,
            level = ?message.level,
            title = message.title.as_deref().unwrap_or(""),
            branch = message.branch_key.as_deref().unwrap_or(""),
            "outbound: {}",
            message.body
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct TracingAgentBridge;

#[async_trait]
impl AgentBridge for TracingAgentBridge {
    async fn notify_agent(&self, agent_id: &str, payload: AgentNotification) -> Result<()> {
        info!(agent = %agent_id, session = %payload.session_id, "agent notified: {}", payload.message);
        Ok(())
    }
}

/// Forwards outbound messages into an mpsc channel, e.g. towards a channel adapter task.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<OutboundMessage>,
}

impl ChannelDispatcher {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MessageDispatcher for ChannelDispatcher {
    async fn dispatch(&self, message: OutboundMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("outbound channel closed"))
    }
}

/// Keeps everything it was asked to send, in order.
#[derive(Debug, Default, Clone)]
pub struct RecordingDispatcher {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl MessageDispatcher for RecordingDispatcher {
    async fn dispatch(&self, message: OutboundMessage) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct RecordingAgentBridge {
    notified: Arc<Mutex<Vec<(String, AgentNotification)>>>,
}

impl RecordingAgentBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<(String, AgentNotification)> {
        self.notified.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl AgentBridge for RecordingAgentBridge {
    async fn notify_agent(&self, agent_id: &str, payload: AgentNotification) -> Result<()> {
        self.notified
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((agent_id.to_string(), payload));
        Ok(())
    }
}
