use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use switchyard_protocol::{ControlWord, HeartbeatRequest, LIVENESS_FACTOR};

use crate::tenant::Tenant;
use crate::TenancyError;

/// What the liveness worker should do after a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Reply `["TOPIC", topic]` so the node subscribes to its tenant.
    Subscribe { topic: String },
    /// The node left its tenant. No reply.
    Left,
    /// The organization is not configured. Logged, no reply.
    UnknownOrg,
}

/// Tenant id → tenant, plus the organization lookup used by heartbeats.
#[derive(Debug, Clone)]
pub struct TenantRegistry {
    tenants: HashMap<String, Tenant>,
    multi_tenant: bool,
    interval: Duration,
}

impl TenantRegistry {
    /// Multi-tenancy off: every authenticated node joins the default tenant.
    pub fn single(interval: Duration) -> Result<Self, TenancyError> {
        if interval.is_zero() {
            return Err(TenancyError::InvalidInterval);
        }
        let tenant = Tenant::default_tenant();
        Ok(Self {
            tenants: HashMap::from([(tenant.id().to_string(), tenant)]),
            multi_tenant: false,
            interval,
        })
    }

    /// One tenant per configured organization.
    pub fn from_orgs<I, S>(orgs: I, interval: Duration) -> Result<Self, TenancyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if interval.is_zero() {
            return Err(TenancyError::InvalidInterval);
        }
        let mut tenants = HashMap::new();
        for org in orgs {
            let org = org.as_ref().trim();
            if org.is_empty() {
                return Err(TenancyError::EmptyOrganization);
            }
            let tenant = Tenant::new(org);
            if tenants.insert(tenant.id().to_string(), tenant).is_some() {
                return Err(TenancyError::DuplicateOrganization(org.to_string()));
            }
        }
        tracing::info!(tenants = tenants.len(), "tenant registry loaded");
        Ok(Self {
            tenants,
            multi_tenant: true,
            interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Nodes silent for longer than this are swept.
    pub fn liveness_window(&self) -> Duration {
        self.interval.mul_f64(LIVENESS_FACTOR)
    }

    pub fn is_multi_tenant(&self) -> bool {
        self.multi_tenant
    }

    /// Tenant a node of `org` belongs to.
    pub fn resolve(&self, org: &str) -> Option<&Tenant> {
        if self.multi_tenant {
            self.tenants.get(&crate::tenant_id_for(org))
        } else {
            self.tenants.values().next()
        }
    }

    fn resolve_id(&self, org: &str) -> Option<String> {
        self.resolve(org).map(|t| t.id().to_string())
    }

    pub fn tenant(&self, id: &str) -> Option<&Tenant> {
        self.tenants.get(id)
    }

    pub fn tenants(&self) -> impl Iterator<Item = &Tenant> {
        self.tenants.values()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.tenants.keys().map(String::as_str)
    }

    pub fn is_known_topic(&self, topic: &[u8]) -> bool {
        std::str::from_utf8(topic).is_ok_and(|t| self.tenants.contains_key(t))
    }

    pub fn heartbeat(&mut self, req: &HeartbeatRequest, now: DateTime<Utc>) -> HeartbeatOutcome {
        let Some(id) = self.resolve_id(&req.org) else {
            tracing::warn!(peer = %req.peer, org = %req.org, "heartbeat from unknown organization");
            return HeartbeatOutcome::UnknownOrg;
        };
        let Some(tenant) = self.tenants.get_mut(&id) else {
            return HeartbeatOutcome::UnknownOrg;
        };
        match req.control {
            ControlWord::Finished => {
                if tenant.remove(&req.peer) {
                    tracing::info!(peer = %req.peer, tenant = %tenant.name(), "node left");
                }
                HeartbeatOutcome::Left
            }
            // REGISTER never reaches here; treat anything else as a refresh.
            ControlWord::Ident | ControlWord::Reload | ControlWord::Register => {
                if tenant.push_at(&req.peer, now) {
                    tracing::info!(peer = %req.peer, tenant = %tenant.name(), "node joined");
                } else {
                    tracing::debug!(peer = %req.peer, control = %req.control, "node refreshed");
                }
                HeartbeatOutcome::Subscribe { topic: id }
            }
        }
    }

    /// Drop a node whose connection went away. Returns whether it was a member.
    pub fn remove_node(&mut self, peer: &str, org: &str) -> bool {
        let Some(id) = self.resolve_id(org) else {
            return false;
        };
        self.tenants
            .get_mut(&id)
            .is_some_and(|tenant| tenant.remove(peer))
    }

    /// Evict every node silent for longer than the liveness window.
    /// Returns `(tenant_id, node)` for each eviction.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<(String, String)> {
        let window = chrono::Duration::from_std(self.liveness_window())
            .unwrap_or_else(|_| chrono::Duration::days(3650));
        let mut evicted = Vec::new();
        for tenant in self.tenants.values_mut() {
            for node in tenant.sweep(window, now) {
                tracing::info!(peer = %node, tenant = %tenant.name(), "node missed its heartbeats, evicted");
                evicted.push((tenant.id().to_string(), node));
            }
        }
        evicted
    }
}
