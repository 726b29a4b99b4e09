//! Tenant records and isolation checks.
//!
//! Tenants are small records at `tenant:{id}` carrying display metadata and
//! the tenant's CORS origin allow-list. Every admin surface is scoped to
//! the caller's tenant; cross-tenant reads resolve to "not found" so tenant
//! existence is never disclosed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::kv::{self, Kv};
use crate::{Error, Result};

/// A tenant record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Disabled tenants reject all traffic.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Tenant-specific CORS origins, consulted before the global policy.
    #[serde(rename = "allowedOrigins", default)]
    pub allowed_origins: Vec<String>,
    /// Creation time, ms since epoch.
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

fn default_true() -> bool {
    true
}

/// Tenant persistence.
pub struct TenantStore {
    kv: Arc<dyn Kv>,
}

impl TenantStore {
    /// Create a store over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    fn key(id: &str) -> String {
        format!("tenant:{id}")
    }

    /// Create or replace a tenant.
    pub async fn put(&self, tenant: &Tenant) -> Result<()> {
        self.kv
            .set(&Self::key(&tenant.id), &serde_json::to_string(tenant)?, None)
            .await
    }

    /// Fetch a tenant.
    pub async fn get(&self, id: &str) -> Result<Option<Tenant>> {
        match self.kv.get(&Self::key(id)).await? {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }

    /// List all tenants (admin path; pattern scan).
    pub async fn list(&self) -> Result<Vec<Tenant>> {
        let mut tenants = Vec::new();
        for key in self.kv.keys("tenant:*").await? {
            if let Some(json) = self.kv.get(&key).await? {
                if let Ok(tenant) = serde_json::from_str::<Tenant>(&json) {
                    tenants.push(tenant);
                }
            }
        }
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }

    /// Delete a tenant.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let removed = kv::del_one(self.kv.as_ref(), &Self::key(id)).await?;
        if removed == 0 {
            return Err(Error::PolicyNotFound(format!("tenant {id}")));
        }
        Ok(())
    }
}

/// Reject cross-tenant access: the caller's tenant must equal the target.
///
/// # Errors
///
/// [`Error::TenantAccessDenied`] on mismatch.
pub fn require_same_tenant(caller_tenant: &str, target_tenant: &str) -> Result<()> {
    if caller_tenant == target_tenant {
        Ok(())
    } else {
        Err(Error::TenantAccessDenied)
    }
}
