//! Switchyard Broker - master and node runtimes
//!
//! The master terminates encrypted node sessions, routes requests to
//! in-process services and out-of-process workers, runs node registration
//! and tracks liveness per tenant. The node side registers with the master,
//! keeps its heartbeat going and verifies signed broadcasts.

pub mod config;
pub mod error;
pub mod master;
pub mod node;

pub use config::SwitchyardConfig;
pub use error::{ConfigError, RegistrationError};
