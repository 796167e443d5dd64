//! Module Manager
//!
//! Deploys, supervises and retires modules. A single manager task owns every
//! `ModuleRecord` and receives typed requests over a bounded channel, so
//! transitions of one module are strictly serialized. Backends are selected
//! by the record's declared kind.

pub mod backend;
mod manager;
mod policy;
mod state;

pub use backend::{BackendContext, PollStatus, StopOutcome};
pub use manager::{ModuleManager, ModuleManagerHandle};
pub use policy::{CommandPolicy, ModuleAction};
pub use state::{BackendKind, BackendSpec, DesiredState, ModuleRecord, ModuleSpec, ModuleState};

use crate::error::{Classify, ErrorClass};
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("invalid transition for {module_id}: {from} -> {to}")]
    InvalidTransition {
        module_id: String,
        from: ModuleState,
        to: ModuleState,
    },

    #[error("command rejected: {0}")]
    CommandRejected(String),

    #[error("module not found: {0}")]
    NotFound(String),

    #[error("module already exists: {0}")]
    AlreadyExists(String),

    #[error("module failed to start: {0}")]
    StartFailed(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("module manager is shutting down")]
    ShuttingDown,

    #[error("module manager unavailable")]
    Unavailable,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for ModuleError {
    fn class(&self) -> ErrorClass {
        match self {
            ModuleError::Store(e) => e.class(),
            ModuleError::StartFailed(_) | ModuleError::Backend(_) | ModuleError::Unavailable => ErrorClass::Transient,
            _ => ErrorClass::Validation,
        }
    }
}
