// src/store.rs

use std::{
    fmt::Debug,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{info, warn};

use crate::{
    graph::{ConversationGraph, Node},
    tenant::{Identity, InMemoryTenantDirectory, Tenant},
    watcher::WatchedType,
};

/// Holds every tenant's conversation graph and the per-sender branch pointers.
#[async_trait]
pub trait ConversationStore: Send + Sync + Debug {
    /// The branch key the sender is currently at, if any.
    async fn branch_pointer(&self, sender: &str, tenant: &Tenant) -> Result<Option<String>>;

    async fn set_branch_pointer(&self, sender: &str, tenant: &Tenant, key: &str) -> Result<()>;

    async fn conversation_graph(&self, tenant: &Tenant) -> Result<Arc<ConversationGraph>>;

    /// Apply the matching rule of conversation `conversation_id` to `body`.
    async fn match_next_node(
        &self,
        identity: Option<&Identity>,
        current: &Node,
        conversation_id: &str,
        body: &str,
        anonymous: bool,
    ) -> Result<Option<Node>>;
}

#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    graphs: DashMap<String, Arc<ConversationGraph>>, // tenant id → graph
    conversations: DashMap<String, Arc<ConversationGraph>>, // graph id → graph
    pointers: DashMap<(String, String), String>, // (tenant id, sender) → branch key
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the graph of a tenant. The graph must already be built.
    pub fn upsert_graph(&self, tenant_id: &str, graph: ConversationGraph) -> Result<()> {
        if let Some(existing) = self.conversations.get(&graph.id) {
            let owner = self
                .graphs
                .iter()
                .find(|g| Arc::ptr_eq(g.value(), existing.value()))
                .map(|g| g.key().clone());
            if owner.as_deref().is_some_and(|o| o != tenant_id) {
                bail!(
                    "conversation id `{}` is already used by tenant `{}`",
                    graph.id,
                    owner.unwrap_or_default()
                );
            }
        }

        let graph = Arc::new(graph);
        if let Some(previous) = self.graphs.insert(tenant_id.to_string(), graph.clone()) {
            self.conversations.remove(&previous.id);
        }
        self.conversations.insert(graph.id.clone(), graph.clone());
        info!(tenant = %tenant_id, conversation = %graph.id, "conversation graph installed");
        Ok(())
    }

    /// Drop a tenant's graph together with every pointer into it.
    pub fn remove_tenant(&self, tenant_id: &str) {
        if let Some((_, graph)) = self.graphs.remove(tenant_id) {
            self.conversations.remove(&graph.id);
        }
        self.pointers.retain(|(tenant, _), _| tenant != tenant_id);
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn branch_pointer(&self, sender: &str, tenant: &Tenant) -> Result<Option<String>> {
        Ok(self
            .pointers
            .get(&(tenant.id.clone(), sender.to_string()))
            .map(|p| p.value().clone()))
    }

    async fn set_branch_pointer(&self, sender: &str, tenant: &Tenant, key: &str) -> Result<()> {
        self.pointers
            .insert((tenant.id.clone(), sender.to_string()), key.to_string());
        Ok(())
    }

    async fn conversation_graph(&self, tenant: &Tenant) -> Result<Arc<ConversationGraph>> {
        self.graphs
            .get(&tenant.id)
            .map(|g| g.value().clone())
            .ok_or_else(|| anyhow!("no conversation graph installed for tenant `{}`", tenant.id))
    }

    async fn match_next_node(
        &self,
        _identity: Option<&Identity>,
        current: &Node,
        conversation_id: &str,
        body: &str,
        anonymous: bool,
    ) -> Result<Option<Node>> {
        let graph = self
            .conversations
            .get(conversation_id)
            .map(|g| g.value().clone())
            .ok_or_else(|| anyhow!("unknown conversation `{conversation_id}`"))?;
        Ok(graph.next_for(current, body, anonymous).cloned())
    }
}

/// A tenant together with the graph it owns, as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TenantBundle {
    pub tenant: Tenant,
    pub graph: ConversationGraph,
}

/// Parse a YAML (`.yaml`/`.yml`) or JSON (`.json`) document.
pub fn parse_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON in file: {}", path.display())),
        Some("yaml") | Some("yml") => serde_yaml_bw::from_str(&content)
            .with_context(|| format!("Invalid YAML in file: {}", path.display())),
        _ => bail!("Unsupported file extension for: {}", path.display()),
    }
}

/// Read and build a tenant bundle.
pub fn load_bundle(path: &Path) -> Result<TenantBundle> {
    let raw: TenantBundle = parse_document(path)?;
    let graph = raw
        .graph
        .build()
        .with_context(|| format!("Invalid conversation graph in {}", path.display()))?;
    Ok(TenantBundle {
        tenant: raw.tenant,
        graph,
    })
}

/// Keeps the tenant directory and the conversation store in sync with a
/// directory of bundle files.
#[derive(Debug)]
pub struct BundleLoader {
    tenants: Arc<InMemoryTenantDirectory>,
    store: Arc<InMemoryConversationStore>,
    loaded: DashMap<PathBuf, String>, // file → tenant id
}

impl BundleLoader {
    pub fn new(tenants: Arc<InMemoryTenantDirectory>, store: Arc<InMemoryConversationStore>) -> Self {
        Self {
            tenants,
            store,
            loaded: DashMap::new(),
        }
    }

    pub fn install(&self, path: &Path) -> Result<Tenant> {
        let bundle = load_bundle(path)?;
        for warning in bundle.graph.validate() {
            warn!(file = %path.display(), "{warning}");
        }
        let tenant = bundle.tenant.clone();
        if let Some(previous) = self.loaded.get(path).map(|t| t.value().clone()) {
            if previous != tenant.id {
                self.tenants.remove(&previous);
                self.store.remove_tenant(&previous);
            }
        }
        self.store.upsert_graph(&tenant.id, bundle.graph)?;
        self.tenants.upsert(tenant.clone());
        self.loaded.insert(path.to_path_buf(), tenant.id.clone());
        Ok(tenant)
    }

    pub fn loaded_tenants(&self) -> Vec<String> {
        self.loaded.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl WatchedType for BundleLoader {
    fn is_relevant(&self, path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml") | Some("json")
        )
    }

    async fn on_create_or_modify(&self, path: &Path) -> Result<()> {
        let tenant = self.install(path)?;
        info!(file = %path.display(), tenant = %tenant.id, "tenant bundle loaded");
        Ok(())
    }

    async fn on_remove(&self, path: &Path) -> Result<()> {
        if let Some((_, tenant_id)) = self.loaded.remove(path) {
            self.tenants.remove(&tenant_id);
            self.store.remove_tenant(&tenant_id);
            info!(file = %path.display(), tenant = %tenant_id, "tenant bundle unloaded");
        }
        Ok(())
    }
}
