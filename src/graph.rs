// src/graph.rs

use std::collections::{BTreeMap, HashMap};

use petgraph::{graph::NodeIndex, visit::Dfs, Graph};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{DisplayMeta, MessageLevel, MessageType};

pub type NodeId = String;

/// When a node's bound action fires relative to the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTiming {
    /// Fires once the node becomes the next node.
    OnLoad,
    /// Fires while the node is still current, before moving away from it.
    OnLeave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionBinding {
    pub name: String,
    pub timing: ExecutionTiming,
    /// Free-form parameters handed to the action as-is.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// How an inbound body is tested against one outgoing branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum BranchRule {
    /// Whole body equals `value`, ignoring case and surrounding whitespace.
    Exact { value: String },
    /// Body contains any of the keywords, ignoring case.
    Keywords { any: Vec<String> },
    Regex { pattern: String },
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Branch {
    #[serde(flatten)]
    pub rule: BranchRule,
    pub to: NodeId,
    /// Whether senders without an identity may take this branch.
    #[serde(default)]
    pub anonymous: bool,
}

/// One scripted step: a message template plus an optional bound action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Node {
    /// Injected from the key of the `nodes` map by [`ConversationGraph::build`].
    #[serde(default, skip_serializing)]
    #[schemars(skip)]
    pub id: NodeId,
    /// Branch key persisted once this node is shown. Defaults to the node id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_body: Option<String>,
    #[serde(flatten)]
    pub display: DisplayMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionBinding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
}

impl Node {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            key: None,
            body: body.into(),
            anonymous_body: None,
            display: DisplayMeta::default(),
            action: None,
            branches: Vec::new(),
        }
    }

    pub fn with_anonymous_body(mut self, body: impl Into<String>) -> Self {
        self.anonymous_body = Some(body.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_display(mut self, kind: MessageType, level: MessageLevel, title: Option<&str>) -> Self {
        self.display = DisplayMeta {
            kind,
            level,
            title: title.map(str::to_string),
        };
        self
    }

    pub fn with_action(mut self, name: impl Into<String>, timing: ExecutionTiming, params: Value) -> Self {
        self.action = Some(ActionBinding {
            name: name.into(),
            timing,
            params,
        });
        self
    }

    pub fn with_branch(mut self, rule: BranchRule, to: impl Into<String>) -> Self {
        self.branches.push(Branch {
            rule,
            to: to.into(),
            anonymous: false,
        });
        self
    }

    pub fn with_anonymous_branch(mut self, rule: BranchRule, to: impl Into<String>) -> Self {
        self.branches.push(Branch {
            rule,
            to: to.into(),
            anonymous: true,
        });
        self
    }

    pub fn branch_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.id)
    }

    /// Template used when the sender is anonymous.
    pub fn anonymous_template(&self) -> &str {
        self.anonymous_body.as_deref().unwrap_or(&self.body)
    }

    /// The bound action if it fires with the given timing.
    pub fn action_at(&self, timing: ExecutionTiming) -> Option<&ActionBinding> {
        self.action.as_ref().filter(|a| a.timing == timing)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("graph has no nodes")]
    Empty,
    #[error("start node `{0}` is not defined")]
    MissingStart(NodeId),
    #[error("error node `{0}` is not defined")]
    MissingErrorNode(NodeId),
    #[error("node `{from}` branches to unknown node `{to}`")]
    DanglingBranch { from: NodeId, to: NodeId },
    #[error("node `{node}` has an invalid pattern `{pattern}`: {reason}")]
    InvalidPattern {
        node: NodeId,
        pattern: String,
        reason: String,
    },
    #[error("branch key `{key}` is used by both `{first}` and `{second}`")]
    DuplicateKey {
        key: String,
        first: NodeId,
        second: NodeId,
    },
}

/// A tenant's conversation: nodes connected by branches, with a start node and
/// a designated error node used when no branch matches.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConversationGraph {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub start: NodeId,
    pub error: NodeId,
    nodes: BTreeMap<NodeId, Node>,

    #[serde(skip)]
    #[schemars(skip)]
    by_key: HashMap<String, NodeId>,
    #[serde(skip)]
    #[schemars(skip)]
    patterns: HashMap<String, Regex>,
}

impl ConversationGraph {
    pub fn new(id: impl Into<String>, start: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            start: start.into(),
            error: error.into(),
            nodes: BTreeMap::new(),
            by_key: HashMap::new(),
            patterns: HashMap::new(),
        }
    }

    pub fn with_node(mut self, id: impl Into<String>, node: Node) -> Self {
        self.nodes.insert(id.into(), node);
        self
    }

    /// Inject node ids, index branch keys, compile patterns and check references.
    pub fn build(mut self) -> Result<Self, GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }
        for (id, node) in self.nodes.iter_mut() {
            node.id = id.clone();
        }
        if !self.nodes.contains_key(&self.start) {
            return Err(GraphError::MissingStart(self.start.clone()));
        }
        if !self.nodes.contains_key(&self.error) {
            return Err(GraphError::MissingErrorNode(self.error.clone()));
        }

        let mut by_key: HashMap<String, NodeId> = HashMap::new();
        let mut patterns = HashMap::new();
        for node in self.nodes.values() {
            if let Some(first) = by_key.insert(node.branch_key().to_string(), node.id.clone()) {
                return Err(GraphError::DuplicateKey {
                    key: node.branch_key().to_string(),
                    first,
                    second: node.id.clone(),
                });
            }
            for branch in &node.branches {
                if !self.nodes.contains_key(&branch.to) {
                    return Err(GraphError::DanglingBranch {
                        from: node.id.clone(),
                        to: branch.to.clone(),
                    });
                }
                if let BranchRule::Regex { pattern } = &branch.rule {
                    let re = Regex::new(pattern).map_err(|e| GraphError::InvalidPattern {
                        node: node.id.clone(),
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    })?;
                    patterns.insert(pattern.clone(), re);
                }
            }
        }

        self.by_key = by_key;
        self.patterns = patterns;
        Ok(self)
    }

    /// Non-fatal findings: nodes that can never be reached from the start node.
    pub fn validate(&self) -> Vec<String> {
        let mut graph: Graph<&str, ()> = Graph::new();
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
        for id in self.nodes.keys() {
            index_of.insert(id.as_str(), graph.add_node(id.as_str()));
        }
        for (id, node) in &self.nodes {
            for branch in &node.branches {
                if let (Some(&from), Some(&to)) = (index_of.get(id.as_str()), index_of.get(branch.to.as_str())) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let Some(&start) = index_of.get(self.start.as_str()) else {
            return vec![format!("start node `{}` is not defined", self.start)];
        };
        let mut reachable = vec![false; graph.node_count()];
        let mut dfs = Dfs::new(&graph, start);
        while let Some(ix) = dfs.next(&graph) {
            reachable[ix.index()] = true;
        }

        self.nodes
            .keys()
            .filter(|id| **id != self.error)
            .filter(|id| {
                index_of
                    .get(id.as_str())
                    .is_some_and(|ix| !reachable[ix.index()])
            })
            .map(|id| format!("node `{id}` is unreachable from `{}`", self.start))
            .collect()
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Resolve a persisted branch key (or a plain node id) to its node.
    pub fn node_by_key(&self, key: &str) -> Option<&Node> {
        match self.by_key.get(key) {
            Some(id) => self.nodes.get(id),
            None => self.nodes.get(key),
        }
    }

    pub fn start_node(&self) -> Result<&Node, GraphError> {
        self.nodes
            .get(&self.start)
            .ok_or_else(|| GraphError::MissingStart(self.start.clone()))
    }

    pub fn error_node(&self) -> Result<&Node, GraphError> {
        self.nodes
            .get(&self.error)
            .ok_or_else(|| GraphError::MissingErrorNode(self.error.clone()))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// First branch of `current` (in declaration order) matching `body`.
    /// Anonymous senders only see branches flagged `anonymous`.
    pub fn next_for(&self, current: &Node, body: &str, anonymous: bool) -> Option<&Node> {
        let input = body.trim();
        current
            .branches
            .iter()
            .filter(|b| !anonymous || b.anonymous)
            .find(|b| self.matches(&b.rule, input))
            .and_then(|b| self.nodes.get(&b.to))
    }

    fn matches(&self, rule: &BranchRule, input: &str) -> bool {
        match rule {
            BranchRule::Exact { value } => value.trim().to_lowercase() == input.to_lowercase(),
            BranchRule::Keywords { any } => {
                let lowered = input.to_lowercase();
                any.iter()
                    .map(|k| k.trim().to_lowercase())
                    .any(|k| !k.is_empty() && lowered.contains(&k))
            }
            BranchRule::Regex { pattern } => self
                .patterns
                .get(pattern)
                .is_some_and(|re| re.is_match(input)),
            BranchRule::Any => true,
        }
    }
}
