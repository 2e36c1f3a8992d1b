//! Error taxonomy for the credential lifecycle engine.
//!
//! The engine's public contract returns [`EngineError`] rather than `anyhow::Error`
//! so callers (the HTTP responder, the control-plane handler) can match on the
//! specific condition instead of inspecting a message string.

use thiserror::Error;

/// Errors the credential lifecycle engine can return.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// The named profile is not present in the profile store.
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    /// The profile requires a one-time code and none was supplied.
    #[error("MFA code required")]
    MfaRequired,

    /// The profile is marked `protected` and may not be assumed.
    #[error("profile is protected")]
    ProtectedProfile,

    /// An STS call failed without an operator-supplied code; recoverable on retry.
    #[error("transient STS failure: {0}")]
    Transient(String),

    /// An STS call that used an operator-supplied code failed; the engine is stalled.
    #[error("fatal STS failure: {0}")]
    Fatal(String),
}

impl EngineError {
    /// True for the two errors that are surfaced as "precondition-failed" over the wire.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, EngineError::MfaRequired | EngineError::UnknownProfile(_))
    }
}
