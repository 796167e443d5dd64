//! Node Agent - host runtime for remote-managed machines
//!
//! - Encrypted local store for telemetry, logs and credentials
//! - Periodic resource sampling
//! - Supervised modules (process, script, container)
//! - Authenticated link to the control plane with offline buffering

pub mod backoff;
pub mod comms;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod logging;
pub mod modules;
pub mod monitor;
pub mod records;
pub mod store;

pub use coordinator::{Agent, AgentBuilder, AgentState, HealthReport};
pub use error::{Classify, ErrorClass};
