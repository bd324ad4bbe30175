//! Small actions that ship with the crate: enough to drive gating, input
//! checks and agent handoff from a bundle without external code.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info};

use super::{Action, ActionError, ActionInvocation, ActionOutcome, ActionRegistry};
use crate::{
    dispatch::{AgentBridge, AgentNotification},
    session::{AgentRef, SessionManager},
    tenant::{Identity, InMemoryIdentityDirectory},
};

const DEFAULT_INVALID: &str = "That does not look right. Please try again.";

fn compile(pattern: &str) -> Result<Regex, ActionError> {
    Regex::new(pattern).map_err(|e| ActionError::InvalidParams(format!("pattern `{pattern}`: {e}")))
}

/// Binds the sender to an identity once they send something acceptable.
///
/// Params: `pattern` (optional regex the trimmed body must match). Meant for
/// gating, where the outcome is not shown to the sender: unacceptable input
/// just leaves them anonymous and the node's anonymous branches take over.
#[derive(Debug)]
pub struct LinkIdentityAction {
    directory: Arc<InMemoryIdentityDirectory>,
}

impl LinkIdentityAction {
    pub const NAME: &'static str = "link_identity";

    pub fn new(directory: Arc<InMemoryIdentityDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl Action for LinkIdentityAction {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, invocation: ActionInvocation<'_>) -> Result<ActionOutcome, ActionError> {
        let body = invocation.message.body.trim();
        let accepted = match invocation.param_str("pattern") {
            Some(pattern) => !body.is_empty() && compile(pattern)?.is_match(body),
            None => !body.is_empty(),
        };
        if !accepted {
            debug!(sender = %invocation.message.from, "identity link rejected");
            return Ok(ActionOutcome::proceed());
        }

        let tenant = invocation.tenant;
        self.directory.link(
            &invocation.message.from,
            Identity {
                id: format!("{}:{}", tenant.id, invocation.message.from),
                tenant_id: tenant.id.clone(),
                display_name: Some(body.to_string()),
            },
        );
        Ok(ActionOutcome::proceed())
    }
}

/// Rejects input that does not match `params.pattern`, answering with `params.message`.
#[derive(Debug, Default)]
pub struct ValidateAction;

impl ValidateAction {
    pub const NAME: &'static str = "validate";
}

#[async_trait]
impl Action for ValidateAction {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, invocation: ActionInvocation<'_>) -> Result<ActionOutcome, ActionError> {
        let pattern = invocation
            .param_str("pattern")
            .ok_or_else(|| ActionError::InvalidParams("missing `pattern`".to_string()))?;
        if compile(pattern)?.is_match(invocation.message.body.trim()) {
            Ok(ActionOutcome::proceed())
        } else {
            let message = invocation.param_str("message").unwrap_or(DEFAULT_INVALID);
            Ok(ActionOutcome::override_with(message))
        }
    }
}

/// Hands the conversation to a live agent and tells the agent about it.
///
/// Params: `agent_id` (required), `agent_name` (optional).
#[derive(Debug)]
pub struct HandoffAction {
    sessions: Arc<dyn SessionManager>,
    agents: Arc<dyn AgentBridge>,
}

impl HandoffAction {
    pub const NAME: &'static str = "handoff";

    pub fn new(sessions: Arc<dyn SessionManager>, agents: Arc<dyn AgentBridge>) -> Self {
        Self { sessions, agents }
    }
}

#[async_trait]
impl Action for HandoffAction {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, invocation: ActionInvocation<'_>) -> Result<ActionOutcome, ActionError> {
        let agent_id = invocation
            .param_str("agent_id")
            .ok_or_else(|| ActionError::InvalidParams("missing `agent_id`".to_string()))?;
        let session = invocation
            .session
            .ok_or_else(|| ActionError::Failed("handoff needs a chat session".to_string()))?;

        let agent = AgentRef {
            id: agent_id.to_string(),
            name: invocation.param_str("agent_name").unwrap_or_default().to_string(),
        };
        self.sessions
            .assign_agent(session.id, agent)
            .await
            .map_err(|e| ActionError::Failed(format!("{e:#}")))?;
        self.agents
            .notify_agent(
                agent_id,
                AgentNotification {
                    session_id: session.id,
                    tenant_id: invocation.tenant.id.clone(),
                    from: invocation.message.from.clone(),
                    message: invocation.message.body.clone(),
                },
            )
            .await
            .map_err(|e| ActionError::Failed(format!("{e:#}")))?;

        info!(session = %session.id, agent = %agent_id, "conversation handed off");
        Ok(ActionOutcome::stop())
    }
}

/// Register every built-in action.
pub fn register_builtins(
    registry: &ActionRegistry,
    identities: Arc<InMemoryIdentityDirectory>,
    sessions: Arc<dyn SessionManager>,
    agents: Arc<dyn AgentBridge>,
) {
    registry.register(Arc::new(LinkIdentityAction::new(identities)));
    registry.register(Arc::new(ValidateAction));
    registry.register(Arc::new(HandoffAction::new(sessions, agents)));
}
