//! The per-message conversation cycle.
//!
//! For one inbound message the orchestrator resolves the tenant and sender,
//! finds the sender's position in the tenant's conversation graph, runs the
//! gating and timed actions bound to the nodes involved, sends the scripted
//! reply (or the error-recovery pair) and moves the sender's branch pointer.
//! Senders whose session is owned by a live agent are forwarded instead.
//!
//! Everything between identity resolution and the pointer write runs under a
//! per-(tenant, sender) lock, so messages from one sender never interleave
//! while different senders proceed in parallel. The intake worker also keeps
//! each sender's messages in arrival order before they reach that lock.

use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::future::join;
use tokio::{
    sync::mpsc,
    task::{self, JoinHandle, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    action::{ActionError, ActionInvocation, ActionOutcome, ActionRegistry},
    config::OrchestratorConfig,
    dispatch::{AgentBridge, AgentNotification, MessageDispatcher},
    error::FlowError,
    graph::{ActionBinding, ConversationGraph, ExecutionTiming, Node, NodeId},
    lock::KeyedLocks,
    logger::CycleMetrics,
    message::{DisplayMeta, InboundMessage, OutboundMessage},
    render::{RenderContext, TemplateRenderer},
    session::{ChatSession, ChatState, SessionManager, TranscriptChannel},
    store::ConversationStore,
    tenant::{Identity, IdentityDirectory, Tenant, TenantDirectory},
};

/// The external services a cycle talks to.
#[derive(Clone, Debug)]
pub struct Collaborators {
    pub tenants: Arc<dyn TenantDirectory>,
    pub identities: Arc<dyn IdentityDirectory>,
    pub conversations: Arc<dyn ConversationStore>,
    pub sessions: Arc<dyn SessionManager>,
    pub actions: ActionRegistry,
    pub dispatcher: Arc<dyn MessageDispatcher>,
    pub agents: Arc<dyn AgentBridge>,
}

/// How a cycle ended. Failures are reported as [`FlowError`] instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The next node was sent and the pointer now names it.
    Replied { node: NodeId },
    /// No branch matched; the error node and the current node were re-sent.
    NoMatchingTransition { current: NodeId },
    /// A timed action failed; handled like a missing transition.
    ActionFailed {
        current: NodeId,
        action: String,
        reason: String,
    },
    /// An action's message was sent in place of the scripted reply; the pointer holds.
    Overridden { current: NodeId },
    /// An action asked to end the cycle; nothing was sent.
    Stopped { node: NodeId },
    /// The session is owned by a live agent; the message went to that agent.
    ForwardedToAgent {
        agent_id: String,
        transcript: bool,
        notified: bool,
    },
    /// The session is in agent mode but nobody has picked it up yet.
    AwaitingAgent { session_id: Uuid },
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Replied { .. } => "replied",
            CycleOutcome::NoMatchingTransition { .. } => "no_match",
            CycleOutcome::ActionFailed { .. } => "action_failed",
            CycleOutcome::Overridden { .. } => "overridden",
            CycleOutcome::Stopped { .. } => "stopped",
            CycleOutcome::ForwardedToAgent { .. } => "forwarded",
            CycleOutcome::AwaitingAgent { .. } => "awaiting_agent",
        }
    }
}

/// Fire-and-forget entry point for transports.
#[async_trait]
pub trait IncomingHandler: Send + Sync {
    async fn handle_incoming(&self, message: InboundMessage);
}

/// Run `fut` within `limit`, mapping failures to [`FlowError::CollaboratorUnavailable`].
async fn guarded<T>(
    collaborator: &'static str,
    limit: Duration,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, FlowError> {
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(FlowError::unavailable(collaborator, err)),
        Err(_) => Err(FlowError::timed_out(collaborator, limit)),
    }
}

/// (destination address, sender)
type LaneKey = (String, String);

/// One sender's queue inside the intake worker.
struct Lane {
    tx: mpsc::UnboundedSender<InboundMessage>,
    pending: usize,
    task: task::Id,
}

/// State of one cycle once the sender's position and identity are known.
struct Cycle<'a> {
    message: &'a InboundMessage,
    tenant: &'a Tenant,
    graph: &'a ConversationGraph,
    current: &'a Node,
    identity: Option<Identity>,
    session: Option<ChatSession>,
}

impl Cycle<'_> {
    fn context(&self) -> RenderContext {
        RenderContext::new(
            self.message,
            self.tenant,
            self.identity.as_ref(),
            self.session.as_ref().map(|s| s.id),
        )
    }

    fn session_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.id)
    }
}

#[derive(Debug)]
pub struct FlowOrchestrator {
    collaborators: Collaborators,
    config: OrchestratorConfig,
    renderer: TemplateRenderer,
    locks: KeyedLocks<(String, String)>,
    metrics: CycleMetrics,
}

impl FlowOrchestrator {
    pub fn new(collaborators: Collaborators, config: OrchestratorConfig) -> Self {
        Self {
            collaborators,
            config,
            renderer: TemplateRenderer::new(),
            locks: KeyedLocks::new(),
            metrics: CycleMetrics::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Process one inbound message end to end.
    pub async fn handle_inbound(&self, message: InboundMessage) -> Result<CycleOutcome, FlowError> {
        let started = Instant::now();
        self.metrics.started();

        let tenant = match self.resolve_tenant(&message).await {
            Ok(tenant) => tenant,
            Err(err) => {
                self.metrics.failed(&message.to, &err, started.elapsed());
                return Err(err);
            }
        };

        let result = {
            let _guard = self
                .locks
                .acquire((tenant.id.clone(), message.from.clone()))
                .await;
            self.run_cycle(&message, &tenant).await
        };

        match &result {
            Ok(outcome) => {
                debug!(tenant = %tenant.id, sender = %message.from, ?outcome, "cycle finished");
                self.metrics.finished(&tenant.id, outcome.label(), started.elapsed());
            }
            Err(err) => self.metrics.failed(&tenant.id, err, started.elapsed()),
        }
        result
    }

    /// Which node follows `current` for this input, if any.
    pub async fn compute_next(
        &self,
        identity: Option<&Identity>,
        current: &Node,
        conversation_id: &str,
        body: &str,
        anonymous: bool,
    ) -> Result<Option<Node>, FlowError> {
        guarded(
            "conversation_store",
            self.config.lookup_timeout,
            self.collaborators
                .conversations
                .match_next_node(identity, current, conversation_id, body, anonymous),
        )
        .await
    }

    /// Consume inbound messages. Each (destination, sender) pair gets a lane
    /// that handles its messages one at a time in arrival order; lanes run in
    /// parallel and are closed once drained. The returned handle completes
    /// once the channel is closed and every queued message has been handled.
    pub fn spawn_intake(self: Arc<Self>, mut rx: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (done_tx, mut done_rx) = mpsc::unbounded_channel::<LaneKey>();
            let mut lanes: HashMap<LaneKey, Lane> = HashMap::new();
            let mut workers = JoinSet::new();
            let mut open = true;

            while open || !lanes.is_empty() {
                tokio::select! {
                    received = rx.recv(), if open => {
                        let Some(message) = received else {
                            open = false;
                            continue;
                        };
                        let key = (message.to.clone(), message.from.clone());
                        let lane = lanes.entry(key.clone()).or_insert_with(|| {
                            let (tx, queue) = mpsc::unbounded_channel();
                            let task = workers.spawn(self.clone().drain_lane(key, queue, done_tx.clone())).id();
                            Lane { tx, pending: 0, task }
                        });
                        lane.pending += 1;
                        if let Err(lost) = lane.tx.send(message) {
                            warn!(message = %lost.0.id, "intake lane closed, message dropped");
                        }
                    }
                    Some(key) = done_rx.recv() => {
                        if let Some(lane) = lanes.get_mut(&key) {
                            lane.pending = lane.pending.saturating_sub(1);
                            if lane.pending == 0 {
                                lanes.remove(&key);
                            }
                        }
                    }
                    Some(joined) = workers.join_next(), if !workers.is_empty() => {
                        if let Err(err) = joined {
                            warn!("intake lane aborted: {err}");
                            let task = err.id();
                            lanes.retain(|_, lane| lane.task != task);
                        }
                    }
                }
            }
            while workers.join_next().await.is_some() {}
            info!("inbound channel closed, intake stopped");
        })
    }

    async fn drain_lane(
        self: Arc<Self>,
        key: LaneKey,
        mut queue: mpsc::UnboundedReceiver<InboundMessage>,
        done: mpsc::UnboundedSender<LaneKey>,
    ) {
        while let Some(message) = queue.recv().await {
            self.handle_incoming(message).await;
            if done.send(key.clone()).is_err() {
                break;
            }
        }
    }

    async fn resolve_tenant(&self, message: &InboundMessage) -> Result<Tenant, FlowError> {
        guarded(
            "tenant_directory",
            self.config.lookup_timeout,
            self.collaborators.tenants.resolve_tenant(&message.to),
        )
        .await?
        .ok_or_else(|| FlowError::TenantNotFound(message.to.clone()))
    }

    async fn resolve_identity(&self, sender: &str, tenant: &Tenant) -> Result<Option<Identity>, FlowError> {
        guarded(
            "identity_directory",
            self.config.lookup_timeout,
            self.collaborators.identities.resolve_identity(sender, tenant),
        )
        .await
    }

    async fn run_cycle(&self, message: &InboundMessage, tenant: &Tenant) -> Result<CycleOutcome, FlowError> {
        let lookup = self.config.lookup_timeout;
        let store = &self.collaborators.conversations;
        let sender = message.from.as_str();

        let identity = self.resolve_identity(sender, tenant).await?;
        let graph = guarded("conversation_store", lookup, store.conversation_graph(tenant)).await?;
        let pointer = guarded("conversation_store", lookup, store.branch_pointer(sender, tenant)).await?;
        let current = current_node(&graph, tenant, sender, pointer.as_deref())?;

        let mut cycle = Cycle {
            message,
            tenant,
            graph: &graph,
            current,
            identity,
            session: None,
        };

        // gating: an anonymous sender on a node with an action runs it first
        let mut skip_action = false;
        if cycle.identity.is_none() {
            if let Some(binding) = &current.action {
                skip_action = true;
                match self.run_action(&cycle, binding, None).await {
                    Ok(outcome) => debug!(
                        tenant = %tenant.id,
                        %sender,
                        action = %binding.name,
                        ?outcome,
                        "gating action ran"
                    ),
                    Err(err) => warn!(
                        tenant = %tenant.id,
                        %sender,
                        action = %binding.name,
                        "gating action failed: {err}"
                    ),
                }
                cycle.identity = self.resolve_identity(sender, tenant).await?;
            }
        }

        if let Some(identity) = &cycle.identity {
            let sessions = &self.collaborators.sessions;
            let session = guarded("session_manager", lookup, sessions.load_or_create(identity, tenant)).await?;
            guarded(
                "session_manager",
                lookup,
                sessions.append_transcript(session.id, TranscriptChannel::Customer, &message.body),
            )
            .await?;
            if session.state == ChatState::Agent {
                return Ok(self.forward_to_agent(&session, message, tenant).await);
            }
            cycle.session = Some(session);
        }

        let anonymous = cycle.identity.is_none();
        let next = self
            .compute_next(cycle.identity.as_ref(), current, &graph.id, &message.body, anonymous)
            .await?;
        let Some(next) = next else {
            info!(tenant = %tenant.id, %sender, node = %current.id, "no matching transition");
            self.recover(&cycle).await?;
            return Ok(CycleOutcome::NoMatchingTransition {
                current: current.id.clone(),
            });
        };

        if !anonymous && !skip_action {
            // leaving the current node can only stop the cycle
            if let Some(binding) = current.action_at(ExecutionTiming::OnLeave) {
                match self.run_action(&cycle, binding, Some(&next)).await {
                    Ok(ActionOutcome { stop: true, .. }) => return Ok(self.stopped(&cycle, binding)),
                    Ok(ActionOutcome { message, .. }) => {
                        if let Some(text) = message {
                            debug!(action = %binding.name, %text, "on_leave message ignored");
                        }
                    }
                    Err(err) => return self.action_failed(&cycle, binding, err).await,
                }
            }
            if let Some(binding) = next.action_at(ExecutionTiming::OnLoad) {
                match self.run_action(&cycle, binding, Some(&next)).await {
                    Ok(ActionOutcome { stop: true, .. }) => return Ok(self.stopped(&cycle, binding)),
                    Ok(ActionOutcome {
                        message: Some(text), ..
                    }) => {
                        self.send_override(&cycle, text).await?;
                        return Ok(CycleOutcome::Overridden {
                            current: current.id.clone(),
                        });
                    }
                    Ok(_) => {}
                    Err(err) => return self.action_failed(&cycle, binding, err).await,
                }
            }
        }

        let outbound = self.render_node(&cycle, &next, true)?;
        self.dispatch(outbound).await?;
        guarded(
            "conversation_store",
            lookup,
            store.set_branch_pointer(sender, tenant, next.branch_key()),
        )
        .await?;
        info!(tenant = %tenant.id, %sender, from = %current.id, to = %next.id, "advanced");
        Ok(CycleOutcome::Replied { node: next.id })
    }

    async fn run_action(
        &self,
        cycle: &Cycle<'_>,
        binding: &ActionBinding,
        target: Option<&Node>,
    ) -> Result<ActionOutcome, ActionError> {
        let action = self.collaborators.actions.resolve(&binding.name)?;
        let context = cycle.context();
        let invocation = ActionInvocation {
            message: cycle.message,
            context: &context,
            tenant: cycle.tenant,
            identity: cycle.identity.as_ref(),
            session: cycle.session.as_ref(),
            target,
            params: &binding.params,
        };
        match timeout(self.config.action_timeout, action.execute(invocation)).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::Timeout(self.config.action_timeout)),
        }
    }

    fn stopped(&self, cycle: &Cycle<'_>, binding: &ActionBinding) -> CycleOutcome {
        info!(
            tenant = %cycle.tenant.id,
            sender = %cycle.message.from,
            action = %binding.name,
            "cycle stopped by action"
        );
        CycleOutcome::Stopped {
            node: cycle.current.id.clone(),
        }
    }

    async fn action_failed(
        &self,
        cycle: &Cycle<'_>,
        binding: &ActionBinding,
        err: ActionError,
    ) -> Result<CycleOutcome, FlowError> {
        warn!(
            tenant = %cycle.tenant.id,
            sender = %cycle.message.from,
            action = %binding.name,
            "action failed: {err}"
        );
        self.recover(cycle).await?;
        Ok(CycleOutcome::ActionFailed {
            current: cycle.current.id.clone(),
            action: binding.name.clone(),
            reason: err.to_string(),
        })
    }

    /// Error node first, then the current node again so the sender can retry.
    async fn recover(&self, cycle: &Cycle<'_>) -> Result<(), FlowError> {
        let error_node = cycle.graph.error_node().map_err(|source| FlowError::GraphInvalid {
            tenant: cycle.tenant.id.clone(),
            source,
        })?;
        let error_message = self.render_node(cycle, error_node, false)?;
        let reprompt = self.render_node(cycle, cycle.current, false)?;
        self.dispatch(error_message).await?;
        self.dispatch(reprompt).await
    }

    /// An action's message goes out with the current node's display metadata.
    async fn send_override(&self, cycle: &Cycle<'_>, text: String) -> Result<(), FlowError> {
        let outbound = self.outbound(cycle, text, &cycle.current.display, None);
        self.dispatch(outbound).await
    }

    fn render_node(&self, cycle: &Cycle<'_>, node: &Node, advancing: bool) -> Result<OutboundMessage, FlowError> {
        let template = if cycle.identity.is_some() {
            node.body.as_str()
        } else {
            node.anonymous_template()
        };
        let body = self
            .renderer
            .render(template, &cycle.context())
            .map_err(|reason| FlowError::Render {
                node: node.id.clone(),
                reason,
            })?;
        let branch_key = advancing.then(|| node.branch_key().to_string());
        Ok(self.outbound(cycle, body, &node.display, branch_key))
    }

    fn outbound(
        &self,
        cycle: &Cycle<'_>,
        body: String,
        display: &DisplayMeta,
        branch_key: Option<String>,
    ) -> OutboundMessage {
        OutboundMessage {
            to: cycle.message.from.clone(),
            identity_id: cycle.identity.as_ref().map(|i| i.id.clone()),
            body,
            tenant_id: cycle.tenant.id.clone(),
            kind: display.kind,
            level: display.level,
            title: display.title.clone(),
            session_id: cycle.session_id(),
            branch_key,
        }
    }

    async fn dispatch(&self, message: OutboundMessage) -> Result<(), FlowError> {
        guarded(
            "dispatcher",
            self.config.dispatch_timeout,
            self.collaborators.dispatcher.dispatch(message),
        )
        .await
    }

    /// Transcript append and live notification run together; neither failure
    /// cancels or undoes the other.
    async fn forward_to_agent(&self, session: &ChatSession, message: &InboundMessage, tenant: &Tenant) -> CycleOutcome {
        let Some(agent) = &session.agent else {
            info!(tenant = %tenant.id, session = %session.id, "session waits for an agent");
            return CycleOutcome::AwaitingAgent { session_id: session.id };
        };

        let transcript = guarded(
            "session_manager",
            self.config.lookup_timeout,
            self.collaborators
                .sessions
                .append_transcript(session.id, TranscriptChannel::Agent, &message.body),
        );
        let notify = guarded(
            "agent_bridge",
            self.config.agent_timeout,
            self.collaborators.agents.notify_agent(
                &agent.id,
                AgentNotification {
                    session_id: session.id,
                    tenant_id: tenant.id.clone(),
                    from: message.from.clone(),
                    message: message.body.clone(),
                },
            ),
        );
        let (transcript, notified) = join(transcript, notify).await;

        if let Err(err) = &transcript {
            warn!(session = %session.id, agent = %agent.id, "agent transcript append failed: {err}");
        }
        if let Err(err) = &notified {
            warn!(session = %session.id, agent = %agent.id, "agent notification failed: {err}");
        }
        CycleOutcome::ForwardedToAgent {
            agent_id: agent.id.clone(),
            transcript: transcript.is_ok(),
            notified: notified.is_ok(),
        }
    }
}

/// The node a pointer names, the start node without one. A pointer to a node
/// that no longer exists restarts the conversation.
fn current_node<'g>(
    graph: &'g ConversationGraph,
    tenant: &Tenant,
    sender: &str,
    pointer: Option<&str>,
) -> Result<&'g Node, FlowError> {
    let found = match pointer {
        Some(key) => match graph.node_by_key(key) {
            Some(node) => Ok(node),
            None => {
                warn!(tenant = %tenant.id, %sender, pointer = %key, "pointer names an unknown node, restarting");
                graph.start_node()
            }
        },
        None => graph.start_node(),
    };
    found.map_err(|source| FlowError::GraphInvalid {
        tenant: tenant.id.clone(),
        source,
    })
}

#[async_trait]
impl IncomingHandler for FlowOrchestrator {
    async fn handle_incoming(&self, message: InboundMessage) {
        let id = message.id.clone();
        if let Err(err) = self.handle_inbound(message).await {
            // already counted and logged by the metrics layer
            debug!(message = %id, transient = err.is_transient(), "inbound message dropped: {err}");
        }
    }
}
