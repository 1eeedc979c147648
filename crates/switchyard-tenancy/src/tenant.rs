use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use switchyard_protocol::crypto::compute_cid;
use switchyard_protocol::{DEFAULT_TENANT_ID, DEFAULT_TENANT_NAME};

/// Topic / tenant id for an organization: hex SHA-256 of its name.
pub fn tenant_id_for(org: &str) -> String {
    compute_cid(org.as_bytes())
}

/// A node's membership in a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRecord {
    pub name: String,
    pub refreshed_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn last_seen(&self, now: DateTime<Utc>) -> Duration {
        now - self.refreshed_at
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    id: String,
    name: String,
    nodes: HashMap<String, NodeRecord>,
}

impl Tenant {
    pub fn new(name: &str) -> Self {
        Self {
            id: tenant_id_for(name),
            name: name.to_string(),
            nodes: HashMap::new(),
        }
    }

    /// The single tenant used when multi-tenancy is off.
    pub fn default_tenant() -> Self {
        Self {
            id: DEFAULT_TENANT_ID.to_string(),
            name: DEFAULT_TENANT_NAME.to_string(),
            nodes: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or refresh a node. Returns `true` when the node is new.
    pub fn push_at(&mut self, node: &str, now: DateTime<Utc>) -> bool {
        match self.nodes.get_mut(node) {
            Some(record) => {
                record.refreshed_at = now;
                false
            }
            None => {
                self.nodes.insert(
                    node.to_string(),
                    NodeRecord {
                        name: node.to_string(),
                        refreshed_at: now,
                    },
                );
                true
            }
        }
    }

    pub fn remove(&mut self, node: &str) -> bool {
        self.nodes.remove(node).is_some()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn get(&self, node: &str) -> Option<&NodeRecord> {
        self.nodes.get(node)
    }

    pub fn last_seen(&self, node: &str, now: DateTime<Utc>) -> Option<Duration> {
        self.nodes.get(node).map(|r| r.last_seen(now))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    /// Drop every node not seen for longer than `max_age`; returns their names.
    pub fn sweep(&mut self, max_age: Duration, now: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = self
            .nodes
            .values()
            .filter(|r| r.last_seen(now) > max_age)
            .map(|r| r.name.clone())
            .collect();
        for name in &stale {
            self.nodes.remove(name);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_is_idempotent() {
        let t0 = Utc::now();
        let mut tenant = Tenant::new("Alpha");
        assert!(tenant.push_at("n1", t0));
        assert!(!tenant.push_at("n1", t0));
        assert_eq!(tenant.len(), 1);
        assert_eq!(tenant.last_seen("n1", t0), Some(Duration::zero()));
    }

    #[test]
    fn test_push_refreshes_last_seen() {
        let t0 = Utc::now();
        let mut tenant = Tenant::new("Alpha");
        tenant.push_at("n1", t0);
        let t1 = t0 + Duration::seconds(40);
        assert_eq!(tenant.last_seen("n1", t1), Some(Duration::seconds(40)));
        tenant.push_at("n1", t1);
        assert_eq!(tenant.last_seen("n1", t1), Some(Duration::zero()));
    }

    #[test]
    fn test_sweep_boundary() {
        let t0 = Utc::now();
        let mut tenant = Tenant::new("Alpha");
        tenant.push_at("n1", t0);
        let max_age = Duration::seconds(90);
        assert!(tenant.sweep(max_age, t0 + Duration::seconds(61)).is_empty());
        assert!(tenant.sweep(max_age, t0 + Duration::seconds(90)).is_empty());
        assert_eq!(tenant.sweep(max_age, t0 + Duration::seconds(91)), vec!["n1"]);
        assert!(tenant.is_empty());
    }

    #[test]
    fn test_ids() {
        assert_eq!(Tenant::default_tenant().id(), DEFAULT_TENANT_ID);
        let alpha = Tenant::new("Alpha");
        assert_eq!(alpha.id(), tenant_id_for("Alpha"));
        assert_eq!(alpha.id().len(), 64);
        assert_ne!(alpha.id(), Tenant::new("Beta").id());
    }
}
