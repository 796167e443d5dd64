//! Error classification shared by every agent component
//!
//! Each component keeps its own `thiserror` enum. This module maps them onto
//! the coarse classes the coordinator acts on:
//! - Transient: retried with backoff, never fatal
//! - Validation: rejected at the boundary with no partial effect
//! - Integrity: record quarantined while the store stays usable
//! - Fatal: local storage unavailable, subsystem restart or halt
//! - Authentication: session key rejected, re-registration required

use serde::Serialize;

/// Coarse error class driving propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Transient,
    Validation,
    Integrity,
    Fatal,
    Authentication,
}

impl ErrorClass {
    /// Whether the error must be surfaced to the coordinator
    pub fn is_cross_cutting(&self) -> bool {
        matches!(self, ErrorClass::Fatal | ErrorClass::Authentication)
    }
}

/// Errors that know their class
pub trait Classify {
    fn class(&self) -> ErrorClass;
}
