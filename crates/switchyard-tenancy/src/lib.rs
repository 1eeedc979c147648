//! Switchyard Tenancy - tenant registry and liveness tracking
//!
//! Tenants are derived from configured organization names. Each tenant keeps
//! the nodes that have heartbeated recently; a periodic sweep drops those
//! that went quiet for longer than 1.5 heartbeat intervals.

pub mod error;
pub mod registry;
pub mod tenant;

pub use error::TenancyError;
pub use registry::{HeartbeatOutcome, TenantRegistry};
pub use tenant::{tenant_id_for, NodeRecord, Tenant};
