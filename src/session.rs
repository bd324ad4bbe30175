// src/session.rs

use std::{fmt::Debug, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::tenant::{Identity, Tenant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    /// Scripted replies are produced by the flow engine.
    #[default]
    Chatbot,
    /// A live agent owns the conversation; inbound messages are forwarded.
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptChannel {
    Customer,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub channel: TranscriptChannel,
    pub body: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A chat session of a known identity with one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub identity_id: String,
    pub tenant_id: String,
    pub state: ChatState,
    pub agent: Option<AgentRef>,
    pub transcript: Vec<TranscriptEntry>,
    pub created_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(identity: &Identity, tenant: &Tenant) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity_id: identity.id.clone(),
            tenant_id: tenant.id.clone(),
            state: ChatState::Chatbot,
            agent: None,
            transcript: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Session lifecycle and transcript storage. Sessions only exist for known identities.
#[async_trait]
pub trait SessionManager: Send + Sync + Debug {
    /// Returns a snapshot of the session for (identity, tenant), creating it on first use.
    async fn load_or_create(&self, identity: &Identity, tenant: &Tenant) -> Result<ChatSession>;

    async fn append_transcript(&self, session_id: Uuid, channel: TranscriptChannel, body: &str) -> Result<()>;

    async fn get(&self, session_id: Uuid) -> Result<Option<ChatSession>>;

    /// Out-of-band handoff: the session moves to `Agent` with `agent` assigned.
    async fn assign_agent(&self, session_id: Uuid, agent: AgentRef) -> Result<()>;

    /// Hand the session back to the chatbot.
    async fn release(&self, session_id: Uuid) -> Result<()>;
}

type SharedSession = Arc<RwLock<ChatSession>>;

/// Idle sessions are evicted after `ttl`.
#[derive(Clone, Debug)]
pub struct InMemorySessionManager {
    by_owner: Cache<String, SharedSession>, // tenant|identity → session
    by_id: Cache<Uuid, SharedSession>,
}

impl InMemorySessionManager {
    pub fn new(ttl: Duration) -> Arc<Self> {
        let by_owner = Cache::builder()
            .time_to_idle(ttl)
            .eviction_listener(|key: Arc<String>, _value: SharedSession, cause| {
                info!("Chat session expired: owner={}, cause={:?}", key, cause);
            })
            .build();
        let by_id = Cache::builder().time_to_idle(ttl).build();
        Arc::new(Self { by_owner, by_id })
    }

    fn owner_key(tenant_id: &str, identity_id: &str) -> String {
        format!("{tenant_id}|{identity_id}")
    }

    /// Looks a session up by id and refreshes its owner entry, so both indexes
    /// idle out together.
    async fn shared(&self, session_id: Uuid) -> Option<SharedSession> {
        let shared = self.by_id.get(&session_id).await?;
        let owner = {
            let session = shared.read().await;
            Self::owner_key(&session.tenant_id, &session.identity_id)
        };
        let current = self.by_owner.get(&owner).await;
        if current.is_none() {
            self.by_owner.insert(owner, shared.clone()).await;
        }
        Some(shared)
    }

    async fn existing(&self, session_id: Uuid) -> Result<SharedSession> {
        self.shared(session_id)
            .await
            .ok_or_else(|| anyhow!("chat session {session_id} not found"))
    }
}

#[async_trait]
impl SessionManager for InMemorySessionManager {
    async fn load_or_create(&self, identity: &Identity, tenant: &Tenant) -> Result<ChatSession> {
        let key = Self::owner_key(&tenant.id, &identity.id);
        let entry = self
            .by_owner
            .entry(key)
            .or_insert_with(async { Arc::new(RwLock::new(ChatSession::new(identity, tenant))) })
            .await;
        let fresh = entry.is_fresh();
        let shared = entry.into_value();
        let snapshot = shared.read().await.clone();
        self.by_id.insert(snapshot.id, shared).await;
        if fresh {
            info!(tenant = %tenant.id, identity = %identity.id, session = %snapshot.id, "chat session created");
        }
        Ok(snapshot)
    }

    async fn append_transcript(&self, session_id: Uuid, channel: TranscriptChannel, body: &str) -> Result<()> {
        let shared = self.existing(session_id).await?;
        shared.write().await.transcript.push(TranscriptEntry {
            channel,
            body: body.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<ChatSession>> {
        match self.shared(session_id).await {
            Some(shared) => Ok(Some(shared.read().await.clone())),
            None => Ok(None),
        }
    }

    async fn assign_agent(&self, session_id: Uuid, agent: AgentRef) -> Result<()> {
        let shared = self.existing(session_id).await?;
        let mut session = shared.write().await;
        info!(session = %session_id, agent = %agent.id, "agent assigned");
        session.state = ChatState::Agent;
        session.agent = Some(agent);
        Ok(())
    }

    async fn release(&self, session_id: Uuid) -> Result<()> {
        let shared = self.existing(session_id).await?;
        let mut session = shared.write().await;
        info!(session = %session_id, "session handed back to chatbot");
        session.state = ChatState::Chatbot;
        session.agent = None;
        Ok(())
    }
}
