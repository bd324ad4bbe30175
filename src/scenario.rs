//! Scripted replays: load bundles, pre-link identities, push a list of inbound
//! messages through a fresh orchestrator and collect everything it produced.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    action::{ActionRegistry, builtin::register_builtins},
    config::OrchestratorConfig,
    dispatch::{AgentBridge, AgentNotification, MessageDispatcher, RecordingAgentBridge, RecordingDispatcher},
    message::{InboundMessage, OutboundMessage},
    orchestrator::{Collaborators, FlowOrchestrator},
    session::InMemorySessionManager,
    store::{BundleLoader, InMemoryConversationStore, parse_document},
    tenant::{Identity, InMemoryIdentityDirectory, InMemoryTenantDirectory},
};

/// In-process collaborators, shared by replays and the `run` command.
#[derive(Debug, Clone)]
pub struct InMemoryBackends {
    pub tenants: Arc<InMemoryTenantDirectory>,
    pub identities: Arc<InMemoryIdentityDirectory>,
    pub store: Arc<InMemoryConversationStore>,
    pub sessions: Arc<InMemorySessionManager>,
}

impl InMemoryBackends {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            tenants: Arc::new(InMemoryTenantDirectory::new()),
            identities: Arc::new(InMemoryIdentityDirectory::new()),
            store: Arc::new(InMemoryConversationStore::new()),
            sessions: InMemorySessionManager::new(config.session_ttl),
        }
    }

    pub fn loader(&self) -> BundleLoader {
        BundleLoader::new(self.tenants.clone(), self.store.clone())
    }

    /// Wire everything together with the built-in actions registered.
    pub fn collaborators(
        &self,
        dispatcher: Arc<dyn MessageDispatcher>,
        agents: Arc<dyn AgentBridge>,
    ) -> Collaborators {
        let actions = ActionRegistry::new();
        register_builtins(&actions, self.identities.clone(), self.sessions.clone(), agents.clone());
        Collaborators {
            tenants: self.tenants.clone(),
            identities: self.identities.clone(),
            conversations: self.store.clone(),
            sessions: self.sessions.clone(),
            actions,
            dispatcher,
            agents,
        }
    }
}

/// A sender already known to a tenant when the replay starts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KnownSender {
    pub sender: String,
    #[serde(flatten)]
    pub identity: Identity,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Scenario {
    /// Bundle files, relative to the scenario file.
    #[serde(default)]
    pub bundles: Vec<PathBuf>,
    #[serde(default)]
    pub identities: Vec<KnownSender>,
    pub messages: Vec<InboundMessage>,
}

impl Scenario {
    /// Read a scenario and make its bundle paths absolute.
    pub fn load(path: &Path) -> Result<Self> {
        let mut scenario: Scenario = parse_document(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for bundle in scenario.bundles.iter_mut() {
            if bundle.is_relative() {
                *bundle = base.join(&*bundle);
            }
        }
        Ok(scenario)
    }
}

/// What one inbound message produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayStep {
    pub from: String,
    pub body: String,
    /// Outcome label, absent when the cycle failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub replies: Vec<OutboundMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayReport {
    pub steps: Vec<ReplayStep>,
    pub notifications: Vec<(String, AgentNotification)>,
}

impl ReplayReport {
    pub fn replies(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.steps.iter().flat_map(|s| s.replies.iter())
    }
}

/// Replay messages strictly in order, one cycle at a time.
pub async fn replay(scenario: &Scenario, config: OrchestratorConfig) -> Result<ReplayReport> {
    let backends = InMemoryBackends::new(&config);
    let loader = backends.loader();
    for bundle in &scenario.bundles {
        let tenant = loader
            .install(bundle)
            .with_context(|| format!("loading bundle {}", bundle.display()))?;
        info!(tenant = %tenant.id, file = %bundle.display(), "bundle installed");
    }
    for known in &scenario.identities {
        backends.identities.link(&known.sender, known.identity.clone());
    }

    let dispatcher = Arc::new(RecordingDispatcher::new());
    let agents = Arc::new(RecordingAgentBridge::new());
    let orchestrator = FlowOrchestrator::new(backends.collaborators(dispatcher.clone(), agents.clone()), config);

    let mut report = ReplayReport::default();
    for message in &scenario.messages {
        let result = orchestrator.handle_inbound(message.clone()).await;
        let (outcome, error) = match result {
            Ok(outcome) => (Some(outcome.label().to_string()), None),
            Err(err) => (None, Some(err.to_string())),
        };
        report.steps.push(ReplayStep {
            from: message.from.clone(),
            body: message.body.clone(),
            outcome,
            error,
            replies: dispatcher.take(),
        });
    }
    report.notifications = agents.notifications();
    Ok(report)
}
