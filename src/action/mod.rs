//! Named, pluggable actions bound to conversation nodes.
//!
//! The orchestrator only knows the [`Action`] contract; implementations are
//! registered by name in an [`ActionRegistry`] and looked up when a node that
//! references them is reached.

pub mod builtin;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::{
    graph::Node,
    message::InboundMessage,
    render::RenderContext,
    session::ChatSession,
    tenant::{Identity, Tenant},
};

/// Everything an action gets to see.
#[derive(Debug, Clone, Copy)]
pub struct ActionInvocation<'a> {
    pub message: &'a InboundMessage,
    pub context: &'a RenderContext,
    pub tenant: &'a Tenant,
    pub identity: Option<&'a Identity>,
    pub session: Option<&'a ChatSession>,
    /// The node being moved to, when the action runs as part of a transition.
    pub target: Option<&'a Node>,
    pub params: &'a Value,
}

impl<'a> ActionInvocation<'a> {
    pub fn param_str(&self, key: &str) -> Option<&'a str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// What an action reports back to the flow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    /// User-facing message that replaces the scripted reply for this cycle.
    pub message: Option<String>,
    /// The action produced all necessary output itself; nothing else is sent.
    pub stop: bool,
}

impl ActionOutcome {
    pub fn proceed() -> Self {
        Self::default()
    }

    pub fn override_with(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            stop: false,
        }
    }

    pub fn stop() -> Self {
        Self {
            message: None,
            stop: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Action not registered: {0}")]
    Unregistered(String),
    #[error("Invalid action parameters: {0}")]
    InvalidParams(String),
    #[error("Action failed: {0}")]
    Failed(String),
    #[error("Action timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
}

#[async_trait]
pub trait Action: Send + Sync {
    /// Name nodes use to reference this action.
    fn name(&self) -> &str;

    async fn execute(&self, invocation: ActionInvocation<'_>) -> Result<ActionOutcome, ActionError>;
}

/// name → action
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: Arc<DashMap<String, Arc<dyn Action>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under its own name, replacing any previous one.
    pub fn register(&self, action: Arc<dyn Action>) {
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).map(|a| a.value().clone())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Action>, ActionError> {
        self.get(name)
            .ok_or_else(|| ActionError::Unregistered(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}
