//! Core puppet contract shared by every messaging backend.
//!
//! This crate defines the session lifecycle model, the backend operation
//! surface, payload caching, liveness supervision, and the common error and
//! event abstractions. Concrete backends live in sibling crates.

/// Backend trait and dual-mode property access types.
pub mod backend;
/// Per-entity payload caches.
pub mod cache;
/// Event bus handed to backends and subscribers.
pub mod channel;
/// Stable puppet error types.
pub mod error;
/// Session handle wrapping a backend.
pub mod puppet;
/// Backoff policy used by retry loops.
pub mod retry;
/// Session lifecycle state machine.
pub mod state_machine;
/// Entity payloads, events and options.
pub mod types;
/// Liveness supervision.
pub mod watchdog;

pub use backend::{Access, Accessed, PuppetBackend, decode_raw, encode_raw};
pub use cache::{InMemoryPayloadCache, PayloadCache, PayloadCaches, room_member_key};
pub use channel::{EventSink, EventStream};
pub use error::{PuppetError, PuppetErrorCategory, PuppetErrorKind};
pub use puppet::Puppet;
pub use retry::{RetryPolicy, retry_with_backoff};
pub use state_machine::SessionStateMachine;
pub use types::{
    Attachment, BackendKind, ContactGender, ContactPayload, ContactType, EntityKind,
    FriendshipPayload, FriendshipType, MessagePayload, MessageType, PuppetEvent, PuppetOptions,
    RawPayload, Receiver, RoomMemberPayload, RoomPayload, ScanStatus, SessionState, StableState,
};
pub use watchdog::{DEFAULT_WATCHDOG_TIMEOUT, Starvation, Watchdog, WatchdogFood};
