use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{EntityKind, SessionState};

/// Error kinds surfaced by the puppet contract.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PuppetErrorKind {
    /// State machine misuse (overlapping or no-op transition).
    InvalidTransition,
    /// `start()` called on a session that is already on.
    AlreadyOn,
    /// `start()` called while a start is still in flight.
    AlreadyStarting,
    /// `logout()` called without a logged-in identity, or the session it
    /// started in ended before it completed.
    NotLoggedIn,
    /// Session options contradict the backend they were paired with.
    InvalidOptions,
    /// Unknown entity id in query mode or raw fetch.
    NotFound,
    /// Raw payload did not match the normalized schema.
    MalformedPayload,
    /// The backend does not implement this operation.
    Unsupported,
    /// The backend rejected a mutation for the current identity.
    PermissionDenied,
    /// Transport-level or internal backend failure.
    BackendFailure,
}

/// How the automation layer is expected to react to an error kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PuppetErrorCategory {
    /// Programmer error in lifecycle or state machine use. Never retried.
    Lifecycle,
    /// Caller can skip, refetch or pick another target.
    Recoverable,
    /// Transport failure; may be retried with backoff.
    Transport,
}

impl PuppetErrorKind {
    /// Stable machine-readable code.
    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidTransition => "invalid_state_transition",
            Self::AlreadyOn => "already_on",
            Self::AlreadyStarting => "already_starting",
            Self::NotLoggedIn => "not_logged_in",
            Self::InvalidOptions => "invalid_options",
            Self::NotFound => "not_found",
            Self::MalformedPayload => "malformed_payload",
            Self::Unsupported => "unsupported",
            Self::PermissionDenied => "permission_denied",
            Self::BackendFailure => "backend_failure",
        }
    }

    pub fn category(self) -> PuppetErrorCategory {
        match self {
            Self::InvalidTransition
            | Self::AlreadyOn
            | Self::AlreadyStarting
            | Self::NotLoggedIn
            | Self::InvalidOptions => PuppetErrorCategory::Lifecycle,
            Self::NotFound
            | Self::MalformedPayload
            | Self::Unsupported
            | Self::PermissionDenied => PuppetErrorCategory::Recoverable,
            Self::BackendFailure => PuppetErrorCategory::Transport,
        }
    }
}

impl fmt::Display for PuppetErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Stable error payload returned by every puppet operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct PuppetError {
    /// Error kind from the contract taxonomy.
    pub kind: PuppetErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl PuppetError {
    pub fn new(kind: PuppetErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Stable machine-readable code of the underlying kind.
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Only transport failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind.category() == PuppetErrorCategory::Transport
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_transition(current: SessionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            PuppetErrorKind::InvalidTransition,
            format!("cannot run '{action}' while session is in state {current:?}"),
        )
    }

    pub fn not_found(entity: EntityKind, id: impl AsRef<str>) -> Self {
        Self::new(
            PuppetErrorKind::NotFound,
            format!("{entity} not found: {}", id.as_ref()),
        )
    }

    pub fn malformed(entity: EntityKind, reason: impl fmt::Display) -> Self {
        Self::new(
            PuppetErrorKind::MalformedPayload,
            format!("malformed {entity} payload: {reason}"),
        )
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        Self::new(
            PuppetErrorKind::Unsupported,
            format!("operation '{operation}' is not supported by this backend"),
        )
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(PuppetErrorKind::PermissionDenied, message)
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(PuppetErrorKind::BackendFailure, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_error_kinds() {
        assert_eq!(
            PuppetErrorKind::AlreadyOn.category(),
            PuppetErrorCategory::Lifecycle
        );
        assert_eq!(
            PuppetErrorKind::InvalidOptions.category(),
            PuppetErrorCategory::Lifecycle
        );
        assert_eq!(
            PuppetErrorKind::NotFound.category(),
            PuppetErrorCategory::Recoverable
        );
        assert_eq!(
            PuppetErrorKind::MalformedPayload.category(),
            PuppetErrorCategory::Recoverable
        );
        assert_eq!(
            PuppetErrorKind::BackendFailure.category(),
            PuppetErrorCategory::Transport
        );
    }

    #[test]
    fn only_backend_failures_are_retryable() {
        assert!(PuppetError::backend("socket closed").is_retryable());
        assert!(!PuppetError::not_found(EntityKind::Room, "r1").is_retryable());
        assert!(!PuppetError::invalid_transition(SessionState::On, "start").is_retryable());
    }

    #[test]
    fn keeps_invalid_transition_code_stable() {
        let err = PuppetError::invalid_transition(SessionState::PendingOn, "begin(on)");
        assert_eq!(err.code(), "invalid_state_transition");
        assert!(err.message.contains("PendingOn"));
    }

    #[test]
    fn formats_not_found_with_entity_and_id() {
        let err = PuppetError::not_found(EntityKind::Contact, "unknown-id");
        assert_eq!(err.to_string(), "not_found: contact not found: unknown-id");
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = PuppetError::backend("busy").with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }
}
