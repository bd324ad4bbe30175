use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use convoflow::{
    action::{Action, ActionError, ActionInvocation, ActionOutcome, ActionRegistry},
    config::OrchestratorConfig,
    dispatch::{RecordingAgentBridge, RecordingDispatcher},
    error::FlowError,
    graph::{BranchRule, ConversationGraph, ExecutionTiming, Node},
    message::{InboundMessage, MessageLevel, MessageType},
    orchestrator::{Collaborators, CycleOutcome, FlowOrchestrator},
    session::{AgentRef, ChatState, InMemorySessionManager, SessionManager, TranscriptChannel},
    store::{ConversationStore, InMemoryConversationStore},
    tenant::{Identity, InMemoryIdentityDirectory, InMemoryTenantDirectory, Tenant, TenantDirectory},
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

const ADDRESS: &str = "+15550100";

fn tenant() -> Tenant {
    Tenant {
        id: "acme".into(),
        name: "Acme".into(),
        inbound_address: ADDRESS.into(),
    }
}

fn identity(sender: &str) -> Identity {
    Identity {
        id: format!("u-{sender}"),
        tenant_id: "acme".into(),
        display_name: Some(sender.to_uppercase()),
    }
}

fn inbound(sender: &str, body: &str) -> InboundMessage {
    InboundMessage::new(sender, ADDRESS, body)
}

/// Counts its calls and answers with a fixed outcome. Optionally links the
/// sender, like a login action would.
struct ScriptedAction {
    name: &'static str,
    calls: AtomicUsize,
    outcome: ActionOutcome,
    link: Option<Arc<InMemoryIdentityDirectory>>,
    delay: Option<Duration>,
}

impl ScriptedAction {
    fn new(name: &'static str, outcome: ActionOutcome) -> Self {
        Self {
            name,
            calls: AtomicUsize::new(0),
            outcome,
            link: None,
            delay: None,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action for ScriptedAction {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, invocation: ActionInvocation<'_>) -> Result<ActionOutcome, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(directory) = &self.link {
            directory.link(&invocation.message.from, identity(&invocation.message.from));
        }
        Ok(self.outcome.clone())
    }
}

/// Tenant directory whose first lookup takes `delay`.
#[derive(Debug)]
struct SlowFirstLookup {
    inner: InMemoryTenantDirectory,
    first: AtomicBool,
    delay: Duration,
}

impl SlowFirstLookup {
    fn new(delay: Duration) -> Self {
        let inner = InMemoryTenantDirectory::new();
        inner.upsert(tenant());
        Self {
            inner,
            first: AtomicBool::new(true),
            delay,
        }
    }
}

#[async_trait]
impl TenantDirectory for SlowFirstLookup {
    async fn resolve_tenant(&self, destination: &str) -> anyhow::Result<Option<Tenant>> {
        if self.first.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.resolve_tenant(destination).await
    }
}

struct Harness {
    orchestrator: Arc<FlowOrchestrator>,
    store: Arc<InMemoryConversationStore>,
    identities: Arc<InMemoryIdentityDirectory>,
    sessions: Arc<InMemorySessionManager>,
    actions: ActionRegistry,
    dispatcher: RecordingDispatcher,
    agents: RecordingAgentBridge,
}

impl Harness {
    fn new(graph: ConversationGraph) -> Self {
        Self::with_config(graph, OrchestratorConfig::default())
    }

    fn with_config(graph: ConversationGraph, config: OrchestratorConfig) -> Self {
        let tenants = InMemoryTenantDirectory::new();
        tenants.upsert(tenant());
        Self::with_tenants(graph, config, Arc::new(tenants))
    }

    fn with_tenants(graph: ConversationGraph, config: OrchestratorConfig, tenants: Arc<dyn TenantDirectory>) -> Self {
        let store = Arc::new(InMemoryConversationStore::new());
        store.upsert_graph("acme", graph.build().unwrap()).unwrap();
        let identities = Arc::new(InMemoryIdentityDirectory::new());
        let sessions = InMemorySessionManager::new(Duration::from_secs(600));
        let actions = ActionRegistry::new();
        let dispatcher = RecordingDispatcher::new();
        let agents = RecordingAgentBridge::new();

        let orchestrator = Arc::new(FlowOrchestrator::new(
            Collaborators {
                tenants,
                identities: identities.clone(),
                conversations: store.clone(),
                sessions: sessions.clone(),
                actions: actions.clone(),
                dispatcher: Arc::new(dispatcher.clone()),
                agents: Arc::new(agents.clone()),
            },
            config,
        ));
        Self {
            orchestrator,
            store,
            identities,
            sessions,
            actions,
            dispatcher,
            agents,
        }
    }

    fn register(&self, action: ScriptedAction) -> Arc<ScriptedAction> {
        let action = Arc::new(action);
        self.actions.register(action.clone());
        action
    }

    fn know(&self, sender: &str) {
        self.identities.link(sender, identity(sender));
    }

    async fn send(&self, sender: &str, body: &str) -> Result<CycleOutcome, FlowError> {
        self.orchestrator.handle_inbound(inbound(sender, body)).await
    }

    async fn pointer(&self, sender: &str) -> Option<String> {
        self.store.branch_pointer(sender, &tenant()).await.unwrap()
    }

    fn bodies(&self) -> Vec<String> {
        self.dispatcher.sent().into_iter().map(|m| m.body).collect()
    }
}

fn exact(value: &str) -> BranchRule {
    BranchRule::Exact { value: value.into() }
}

/// menu --1--> hours, menu --2--> billing; `oops` is the error node.
fn menu_graph() -> ConversationGraph {
    ConversationGraph::new("acme-main", "menu", "oops")
        .with_node(
            "menu",
            Node::new("1) hours 2) billing")
                .with_anonymous_body("Log in first. 1) hours")
                .with_display(MessageType::Interactive, MessageLevel::Info, Some("Menu"))
                .with_anonymous_branch(exact("1"), "hours")
                .with_branch(exact("2"), "billing"),
        )
        .with_node(
            "hours",
            Node::new("9 to 5")
                .with_anonymous_body("9 to 5, log in for more")
                .with_branch(BranchRule::Any, "menu"),
        )
        .with_node("billing", Node::new("Your balance is zero").with_key("billing-home"))
        .with_node(
            "oops",
            Node::new("Sorry, try again").with_display(MessageType::Text, MessageLevel::Error, Some("Oops")),
        )
}

#[tokio::test]
async fn first_message_is_matched_against_start_node() {
    let h = Harness::new(menu_graph());
    h.know("alice");

    let outcome = h.send("alice", "2").await.unwrap();
    assert_eq!(outcome, CycleOutcome::Replied { node: "billing".into() });
    assert_eq!(h.bodies(), vec!["Your balance is zero"]);
    assert_eq!(h.pointer("alice").await.as_deref(), Some("billing-home"));

    let sent = h.dispatcher.sent();
    assert_eq!(sent[0].branch_key.as_deref(), Some("billing-home"));
    assert_eq!(sent[0].identity_id.as_deref(), Some("u-alice"));
    assert!(sent[0].session_id.is_some());
}

#[tokio::test]
async fn anonymous_sender_gets_anonymous_branches_and_templates() {
    let h = Harness::new(menu_graph());

    // "2" is not an anonymous branch
    let outcome = h.send("bob", "2").await.unwrap();
    assert_eq!(outcome, CycleOutcome::NoMatchingTransition { current: "menu".into() });
    assert_eq!(h.bodies(), vec!["Sorry, try again", "Log in first. 1) hours"]);
    h.dispatcher.take();

    let outcome = h.send("bob", "1").await.unwrap();
    assert_eq!(outcome, CycleOutcome::Replied { node: "hours".into() });
    let sent = h.dispatcher.sent();
    assert_eq!(sent[0].body, "9 to 5, log in for more");
    assert!(sent[0].identity_id.is_none());
    assert!(sent[0].session_id.is_none());
}

#[tokio::test]
async fn no_match_sends_error_then_current_and_keeps_pointer() {
    let h = Harness::new(menu_graph());
    h.know("alice");
    h.send("alice", "1").await.unwrap();
    // hours only has an `any` branch, so this goes back to the menu
    h.send("alice", "anything").await.unwrap();
    h.dispatcher.take();
    assert_eq!(h.pointer("alice").await.as_deref(), Some("menu"));

    let outcome = h.send("alice", "7").await.unwrap();
    assert_eq!(outcome, CycleOutcome::NoMatchingTransition { current: "menu".into() });
    assert_eq!(h.pointer("alice").await.as_deref(), Some("menu"));

    let sent = h.dispatcher.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].body, "Sorry, try again");
    assert_eq!(sent[0].level, MessageLevel::Error);
    assert_eq!(sent[0].title.as_deref(), Some("Oops"));
    assert_eq!(sent[1].body, "1) hours 2) billing");
    assert_eq!(sent[1].kind, MessageType::Interactive);
    assert_eq!(sent[1].title.as_deref(), Some("Menu"));
    assert!(sent.iter().all(|m| m.branch_key.is_none()));
}

#[tokio::test]
async fn gating_action_runs_once_and_suppresses_timed_actions() {
    let graph = ConversationGraph::new("acme-main", "login", "oops")
        .with_node(
            "login",
            Node::new("Who are you?")
                .with_action("login", ExecutionTiming::OnLeave, Value::Null)
                .with_anonymous_branch(BranchRule::Any, "home"),
        )
        .with_node(
            "home",
            Node::new("Welcome {{identity.display_name}}").with_action("greet", ExecutionTiming::OnLoad, Value::Null),
        )
        .with_node("oops", Node::new("Sorry"));
    let h = Harness::new(graph);

    let mut login = ScriptedAction::new("login", ActionOutcome::proceed());
    login.link = Some(h.identities.clone());
    let login = h.register(login);
    let greet = h.register(ScriptedAction::new("greet", ActionOutcome::override_with("nope")));

    let outcome = h.send("alice", "Alice").await.unwrap();
    assert_eq!(outcome, CycleOutcome::Replied { node: "home".into() });
    assert_eq!(login.calls(), 1);
    assert_eq!(greet.calls(), 0);

    // identity was resolved after gating, so the reply is personalised
    assert_eq!(h.bodies(), vec!["Welcome ALICE"]);
    let session = h.sessions.load_or_create(&identity("alice"), &tenant()).await.unwrap();
    assert_eq!(session.transcript.len(), 1);
    assert_eq!(session.transcript[0].channel, TranscriptChannel::Customer);
}

#[tokio::test]
async fn failed_gating_keeps_sender_anonymous() {
    let graph = ConversationGraph::new("acme-main", "login", "oops")
        .with_node(
            "login",
            Node::new("Who are you?")
                .with_action("login", ExecutionTiming::OnLeave, Value::Null)
                .with_anonymous_branch(exact("guest"), "home"),
        )
        .with_node("home", Node::new("Hello").with_anonymous_body("Hello guest"))
        .with_node("oops", Node::new("Sorry"));
    // `login` is never registered
    let h = Harness::new(graph);

    let outcome = h.send("bob", "guest").await.unwrap();
    assert_eq!(outcome, CycleOutcome::Replied { node: "home".into() });
    assert_eq!(h.bodies(), vec!["Hello guest"]);
}

/// a --any--> b --any--> c; a leaves with `leave`, b and c load with `load`.
fn timed_graph() -> ConversationGraph {
    ConversationGraph::new("acme-main", "a", "oops")
        .with_node(
            "a",
            Node::new("A")
                .with_action("leave", ExecutionTiming::OnLeave, Value::Null)
                .with_branch(BranchRule::Any, "b"),
        )
        .with_node(
            "b",
            Node::new("B")
                .with_action("load", ExecutionTiming::OnLoad, Value::Null)
                .with_branch(BranchRule::Any, "c"),
        )
        .with_node("c", Node::new("C").with_action("load", ExecutionTiming::OnLoad, Value::Null))
        .with_node("oops", Node::new("Sorry"))
}

#[tokio::test]
async fn on_leave_and_on_load_both_fire() {
    let h = Harness::new(timed_graph());
    h.know("alice");
    let leave = h.register(ScriptedAction::new("leave", ActionOutcome::proceed()));
    let load = h.register(ScriptedAction::new("load", ActionOutcome::proceed()));

    h.send("alice", "go").await.unwrap();
    assert_eq!((leave.calls(), load.calls()), (1, 1));

    h.send("alice", "go").await.unwrap();
    assert_eq!((leave.calls(), load.calls()), (1, 2));
    assert_eq!(h.bodies(), vec!["B", "C"]);
}

#[tokio::test]
async fn on_load_override_still_applies_after_on_leave() {
    let h = Harness::new(timed_graph());
    h.know("alice");
    let leave = h.register(ScriptedAction::new("leave", ActionOutcome::proceed()));
    let load = h.register(ScriptedAction::new("load", ActionOutcome::override_with("bad input")));

    let outcome = h.send("alice", "go").await.unwrap();
    assert_eq!(outcome, CycleOutcome::Overridden { current: "a".into() });
    assert_eq!((leave.calls(), load.calls()), (1, 1));
    assert_eq!(h.bodies(), vec!["bad input"]);
    assert_eq!(h.pointer("alice").await, None);
}

#[tokio::test]
async fn on_leave_message_does_not_replace_the_reply() {
    let h = Harness::new(timed_graph());
    h.know("alice");
    h.register(ScriptedAction::new("leave", ActionOutcome::override_with("note")));
    h.register(ScriptedAction::new("load", ActionOutcome::proceed()));

    let outcome = h.send("alice", "go").await.unwrap();
    assert_eq!(outcome, CycleOutcome::Replied { node: "b".into() });
    assert_eq!(h.bodies(), vec!["B"]);
    assert_eq!(h.pointer("alice").await.as_deref(), Some("b"));
}

#[tokio::test]
async fn on_leave_stop_ends_the_cycle() {
    let h = Harness::new(timed_graph());
    h.know("alice");
    let leave = h.register(ScriptedAction::new("leave", ActionOutcome::stop()));
    let load = h.register(ScriptedAction::new("load", ActionOutcome::proceed()));

    let outcome = h.send("alice", "go").await.unwrap();
    assert_eq!(outcome, CycleOutcome::Stopped { node: "a".into() });
    assert_eq!((leave.calls(), load.calls()), (1, 0));
    assert!(h.dispatcher.sent().is_empty());
    assert_eq!(h.pointer("alice").await, None);
}

#[tokio::test]
async fn stop_sends_nothing_and_keeps_pointer() {
    let graph = ConversationGraph::new("acme-main", "menu", "oops")
        .with_node("menu", Node::new("Menu").with_branch(exact("agent"), "transfer"))
        .with_node(
            "transfer",
            Node::new("Transferring").with_action("transfer", ExecutionTiming::OnLoad, json!({"queue": "vip"})),
        )
        .with_node("oops", Node::new("Sorry"));
    let h = Harness::new(graph);
    h.know("alice");
    let transfer = h.register(ScriptedAction::new("transfer", ActionOutcome::stop()));

    let outcome = h.send("alice", "agent").await.unwrap();
    assert_eq!(outcome, CycleOutcome::Stopped { node: "menu".into() });
    assert_eq!(transfer.calls(), 1);
    assert!(h.dispatcher.sent().is_empty());
    assert_eq!(h.pointer("alice").await, None);
}

#[tokio::test]
async fn override_uses_current_display_and_holds_pointer() {
    let graph = ConversationGraph::new("acme-main", "ask", "oops")
        .with_node(
            "ask",
            Node::new("Your order number?")
                .with_display(MessageType::Interactive, MessageLevel::Warning, Some("Orders"))
                .with_branch(BranchRule::Any, "found"),
        )
        .with_node(
            "found",
            Node::new("Found it")
                .with_display(MessageType::Text, MessageLevel::Success, Some("Done"))
                .with_action("lookup", ExecutionTiming::OnLoad, Value::Null),
        )
        .with_node("oops", Node::new("Sorry"));
    let h = Harness::new(graph);
    h.know("alice");
    h.register(ScriptedAction::new("lookup", ActionOutcome::override_with("No such order")));

    let outcome = h.send("alice", "123").await.unwrap();
    assert_eq!(outcome, CycleOutcome::Overridden { current: "ask".into() });

    let sent = h.dispatcher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].body, "No such order");
    assert_eq!(sent[0].kind, MessageType::Interactive);
    assert_eq!(sent[0].level, MessageLevel::Warning);
    assert_eq!(sent[0].title.as_deref(), Some("Orders"));
    assert!(sent[0].branch_key.is_none());
    assert_eq!(h.pointer("alice").await, None);
}

#[tokio::test]
async fn failing_action_recovers_without_advancing() {
    let graph = ConversationGraph::new("acme-main", "ask", "oops")
        .with_node("ask", Node::new("Ask").with_branch(BranchRule::Any, "next"))
        .with_node(
            "next",
            Node::new("Next").with_action("missing", ExecutionTiming::OnLoad, Value::Null),
        )
        .with_node("oops", Node::new("Sorry"));
    let h = Harness::new(graph);
    h.know("alice");

    let outcome = h.send("alice", "x").await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::ActionFailed { ref current, ref action, .. } if current == "ask" && action == "missing"
    ));
    assert_eq!(h.bodies(), vec!["Sorry", "Ask"]);
    assert_eq!(h.pointer("alice").await, None);
}

#[tokio::test]
async fn slow_action_times_out_as_failure() {
    let graph = ConversationGraph::new("acme-main", "ask", "oops")
        .with_node(
            "ask",
            Node::new("Ask")
                .with_action("slow", ExecutionTiming::OnLeave, Value::Null)
                .with_branch(BranchRule::Any, "next"),
        )
        .with_node("next", Node::new("Next"))
        .with_node("oops", Node::new("Sorry"));
    let config = OrchestratorConfig {
        action_timeout: Duration::from_millis(50),
        ..OrchestratorConfig::default()
    };
    let h = Harness::with_config(graph, config);
    h.know("alice");
    let mut slow = ScriptedAction::new("slow", ActionOutcome::proceed());
    slow.delay = Some(Duration::from_secs(5));
    h.register(slow);

    let outcome = h.send("alice", "x").await.unwrap();
    match outcome {
        CycleOutcome::ActionFailed { reason, .. } => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.bodies(), vec!["Sorry", "Ask"]);
    assert_eq!(h.pointer("alice").await, None);
}

#[tokio::test]
async fn agent_session_forwards_instead_of_replying() {
    let h = Harness::new(menu_graph());
    h.know("alice");
    h.send("alice", "1").await.unwrap();
    h.dispatcher.take();
    let pointer = h.pointer("alice").await;

    let session = h.sessions.load_or_create(&identity("alice"), &tenant()).await.unwrap();
    h.sessions
        .assign_agent(
            session.id,
            AgentRef {
                id: "agent-7".into(),
                name: "Sam".into(),
            },
        )
        .await
        .unwrap();

    let outcome = h.send("alice", "is anyone there?").await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::ForwardedToAgent {
            agent_id: "agent-7".into(),
            transcript: true,
            notified: true,
        }
    );
    assert!(h.dispatcher.sent().is_empty());
    assert_eq!(h.pointer("alice").await, pointer);

    let notified = h.agents.notifications();
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].0, "agent-7");
    assert_eq!(notified[0].1.message, "is anyone there?");
    assert_eq!(notified[0].1.session_id, session.id);

    let stored = h.sessions.get(session.id).await.unwrap().unwrap();
    let agent_entries: Vec<_> = stored
        .transcript
        .iter()
        .filter(|e| e.channel == TranscriptChannel::Agent)
        .collect();
    assert_eq!(agent_entries.len(), 1);
    assert_eq!(agent_entries[0].body, "is anyone there?");

    // handing back resumes the script where it was
    assert_eq!(stored.state, ChatState::Agent);
    h.sessions.release(session.id).await.unwrap();
    let outcome = h.send("alice", "back").await.unwrap();
    assert_eq!(outcome, CycleOutcome::Replied { node: "menu".into() });
}

#[tokio::test]
async fn stale_pointer_restarts_at_start_node() {
    let h = Harness::new(menu_graph());
    h.know("alice");
    h.store
        .set_branch_pointer("alice", &tenant(), "removed-node")
        .await
        .unwrap();

    let outcome = h.send("alice", "1").await.unwrap();
    assert_eq!(outcome, CycleOutcome::Replied { node: "hours".into() });
}

#[tokio::test]
async fn unknown_destination_is_dropped() {
    let h = Harness::new(menu_graph());
    let err = h
        .orchestrator
        .handle_inbound(InboundMessage::new("alice", "+10000000", "1"))
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::TenantNotFound(_)));
    assert!(h.dispatcher.sent().is_empty());
}

/// n0 -> n1 -> ... -> n{len}, every branch matches anything.
fn chain(len: usize) -> ConversationGraph {
    let mut graph = ConversationGraph::new("acme-chain", "n0", "oops").with_node("oops", Node::new("Sorry"));
    for i in 0..=len {
        let mut node = Node::new(format!("n{i}"));
        if i < len {
            node = node.with_branch(BranchRule::Any, format!("n{}", i + 1));
        }
        graph = graph.with_node(format!("n{i}"), node);
    }
    graph
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_messages_from_one_sender_are_serialized() {
    const MESSAGES: usize = 20;
    let h = Harness::new(chain(MESSAGES));
    h.know("alice");

    let mut handles = Vec::new();
    for i in 0..MESSAGES {
        let orchestrator = h.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.handle_inbound(inbound("alice", &format!("m{i}"))).await
        }));
    }
    for handle in handles {
        assert!(matches!(handle.await.unwrap(), Ok(CycleOutcome::Replied { .. })));
    }

    let expected: Vec<String> = (1..=MESSAGES).map(|i| format!("n{i}")).collect();
    assert_eq!(h.bodies(), expected);
    assert_eq!(h.pointer("alice").await, Some(format!("n{MESSAGES}")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn other_senders_are_not_blocked() {
    let graph = ConversationGraph::new("acme-main", "ask", "oops")
        .with_node(
            "ask",
            Node::new("Ask")
                .with_action("slow", ExecutionTiming::OnLeave, Value::Null)
                .with_branch(BranchRule::Any, "next"),
        )
        .with_node("next", Node::new("Next").with_branch(BranchRule::Any, "ask"))
        .with_node("oops", Node::new("Sorry"));
    let h = Harness::new(graph);
    h.know("alice");
    h.know("bob");
    // bob sits on a node without an action
    h.store.set_branch_pointer("bob", &tenant(), "next").await.unwrap();
    let mut slow = ScriptedAction::new("slow", ActionOutcome::proceed());
    slow.delay = Some(Duration::from_millis(500));
    h.register(slow);

    let orchestrator = h.orchestrator.clone();
    let alice = tokio::spawn(async move { orchestrator.handle_inbound(inbound("alice", "x")).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let bob = tokio::time::timeout(Duration::from_millis(300), h.send("bob", "x")).await;
    assert!(matches!(bob, Ok(Ok(CycleOutcome::Replied { .. }))));
    assert!(matches!(alice.await.unwrap(), Ok(CycleOutcome::Replied { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn intake_handles_one_sender_in_arrival_order() {
    let h = Harness::with_tenants(
        menu_graph(),
        OrchestratorConfig::default(),
        Arc::new(SlowFirstLookup::new(Duration::from_millis(100))),
    );
    h.know("alice");

    let (tx, rx) = mpsc::channel(8);
    let intake = h.orchestrator.clone().spawn_intake(rx);
    tx.send(inbound("alice", "2")).await.unwrap();
    tx.send(inbound("alice", "1")).await.unwrap();
    drop(tx);
    intake.await.unwrap();

    // "2" reaches billing first; "1" then has nowhere to go from there
    assert_eq!(
        h.bodies(),
        vec!["Your balance is zero", "Sorry, try again", "Your balance is zero"]
    );
    assert_eq!(h.pointer("alice").await.as_deref(), Some("billing-home"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn intake_drains_every_sender_before_finishing() {
    let h = Harness::new(chain(5));
    for sender in ["alice", "bob", "carol"] {
        h.know(sender);
    }

    let (tx, rx) = mpsc::channel(4);
    let intake = h.orchestrator.clone().spawn_intake(rx);
    for i in 0..5 {
        for sender in ["alice", "bob", "carol"] {
            tx.send(inbound(sender, &format!("m{i}"))).await.unwrap();
        }
    }
    drop(tx);
    intake.await.unwrap();

    assert_eq!(h.dispatcher.sent().len(), 15);
    for sender in ["alice", "bob", "carol"] {
        assert_eq!(h.pointer(sender).await.as_deref(), Some("n5"));
        let own: Vec<String> = h
            .dispatcher
            .sent()
            .into_iter()
            .filter(|m| m.to == sender)
            .map(|m| m.body)
            .collect();
        assert_eq!(own, vec!["n1", "n2", "n3", "n4", "n5"]);
    }
}
