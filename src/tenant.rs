use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

/// The organisation owning a conversation graph and its senders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Tenant {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// The address inbound messages are sent to.
    pub inbound_address: String,
}

/// A known user of a tenant. Absence of an identity means "anonymous sender".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Identity {
    pub id: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[async_trait]
pub trait TenantDirectory: Send + Sync + Debug {
    async fn resolve_tenant(&self, destination: &str) -> Result<Option<Tenant>>;
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync + Debug {
    async fn resolve_identity(&self, sender: &str, tenant: &Tenant) -> Result<Option<Identity>>;
}

/// inbound address → tenant
#[derive(Debug, Default)]
pub struct InMemoryTenantDirectory {
    by_address: DashMap<String, Tenant>,
}

impl InMemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a tenant. Any previous address of the same tenant is unbound.
    pub fn upsert(&self, tenant: Tenant) {
        self.by_address
            .retain(|address, t| t.id != tenant.id || *address == tenant.inbound_address);
        info!(tenant = %tenant.id, address = %tenant.inbound_address, "tenant registered");
        self.by_address.insert(tenant.inbound_address.clone(), tenant);
    }

    pub fn remove(&self, tenant_id: &str) {
        self.by_address.retain(|_, t| t.id != tenant_id);
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn resolve_tenant(&self, destination: &str) -> Result<Option<Tenant>> {
        Ok(self.by_address.get(destination).map(|t| t.value().clone()))
    }
}

/// (tenant id, sender address) → identity
#[derive(Debug, Default)]
pub struct InMemoryIdentityDirectory {
    identities: DashMap<(String, String), Identity>,
}

impl InMemoryIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self, sender: &str, identity: Identity) {
        info!(tenant = %identity.tenant_id, %sender, identity = %identity.id, "sender linked to identity");
        self.identities
            .insert((identity.tenant_id.clone(), sender.to_string()), identity);
    }

    pub fn unlink(&self, sender: &str, tenant_id: &str) -> Option<Identity> {
        self.identities
            .remove(&(tenant_id.to_string(), sender.to_string()))
            .map(|(_, identity)| identity)
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryIdentityDirectory {
    async fn resolve_identity(&self, sender: &str, tenant: &Tenant) -> Result<Option<Identity>> {
        Ok(self
            .identities
            .get(&(tenant.id.clone(), sender.to_string()))
            .map(|i| i.value().clone()))
    }
}
