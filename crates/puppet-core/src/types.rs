use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Backend-native entity representation, unstructured from the contract's point of view.
pub type RawPayload = serde_json::Value;

/// Session lifecycle state, including in-flight transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Session is stopped. Initial state, re-enterable.
    Off,
    /// A start is in flight.
    PendingOn,
    /// Session is running.
    On,
    /// A stop is in flight.
    PendingOff,
}

impl SessionState {
    /// Stable state this value has settled to, if any.
    pub fn stable(self) -> Option<StableState> {
        match self {
            Self::Off => Some(StableState::Off),
            Self::On => Some(StableState::On),
            Self::PendingOn | Self::PendingOff => None,
        }
    }

    pub fn is_pending(self) -> bool {
        self.stable().is_none()
    }
}

/// Target of a state transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StableState {
    Off,
    On,
}

impl StableState {
    /// Pending state used while transitioning toward `self`.
    pub fn pending(self) -> SessionState {
        match self {
            Self::Off => SessionState::PendingOff,
            Self::On => SessionState::PendingOn,
        }
    }
}

impl From<StableState> for SessionState {
    fn from(value: StableState) -> Self {
        match value {
            StableState::Off => Self::Off,
            StableState::On => Self::On,
        }
    }
}

/// Entity kinds exposed by the contract.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Contact,
    Room,
    RoomMember,
    Message,
    Friendship,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Contact => "contact",
            Self::Room => "room",
            Self::RoomMember => "room member",
            Self::Message => "message",
            Self::Friendship => "friendship",
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ContactGender {
    #[default]
    Unknown,
    Male,
    Female,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ContactType {
    #[default]
    Unknown,
    Personal,
    Official,
}

/// Normalized contact record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactPayload {
    pub id: String,
    pub gender: ContactGender,
    pub kind: ContactType,
    pub name: String,
    pub alias: Option<String>,
    /// Avatar locator when the backend exposes one.
    pub avatar: Option<String>,
    /// Whether the contact is a confirmed friend, when known.
    pub friend: Option<bool>,
}

/// Normalized room record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomPayload {
    pub id: String,
    pub topic: String,
    pub owner_id: Option<String>,
    pub member_ids: Vec<String>,
    pub avatar: Option<String>,
}

/// Per-room view of a member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMemberPayload {
    pub id: String,
    pub room_alias: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    Unknown,
    Text,
    Attachment,
    Contact,
    Image,
}

/// Normalized message record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePayload {
    pub id: String,
    /// Milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    pub from_id: String,
    pub to_id: Option<String>,
    pub room_id: Option<String>,
    pub kind: MessageType,
    pub text: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FriendshipType {
    /// Someone asked to become our friend.
    Receive,
    /// A friendship was confirmed.
    Confirm,
    /// We must verify ourselves before the request goes through.
    Verify,
}

/// Normalized friendship record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FriendshipPayload {
    pub id: String,
    pub contact_id: String,
    pub hello: Option<String>,
    pub kind: FriendshipType,
}

/// Opaque binary blob used for avatars and file messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(
        name: impl Into<String>,
        content_type: Option<&str>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.map(str::to_owned),
            data: data.into(),
        }
    }
}

/// Destination of an outgoing message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Receiver {
    Contact(String),
    Room(String),
}

impl Receiver {
    pub fn id(&self) -> &str {
        match self {
            Self::Contact(id) | Self::Room(id) => id,
        }
    }
}

/// Login QR-code progress reported by backends that need scanning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScanStatus {
    Waiting,
    Scanned,
    Confirmed,
    Timeout,
}

/// Notification published on the puppet event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PuppetEvent {
    /// Session state transition.
    StateChanged { state: SessionState },
    /// A login completed for `contact_id`.
    Login { contact_id: String },
    /// `contact_id` is being logged out. Emitted before the identity is cleared.
    Logout { contact_id: String },
    /// Inbound message announcement. Fetch the payload separately.
    Message { message_id: String },
    /// Inbound friendship request or confirmation.
    Friendship { friendship_id: String },
    RoomJoin {
        room_id: String,
        invitee_ids: Vec<String>,
        inviter_id: String,
    },
    RoomLeave {
        room_id: String,
        leaver_ids: Vec<String>,
        remover_id: Option<String>,
    },
    RoomTopic {
        room_id: String,
        topic: String,
        old_topic: String,
        changer_id: String,
    },
    Scan {
        qrcode: Option<String>,
        status: ScanStatus,
    },
    /// Reply to `ding`.
    Dong { data: String },
    /// The watchdog starved and the session is being stopped.
    Reset { reason: String },
    /// Backend-side failure not tied to a caller operation.
    Error {
        code: String,
        message: String,
        recoverable: bool,
    },
}

impl PuppetEvent {
    /// Whether this event originates from the remote side. Inbound events feed the watchdog.
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            Self::Message { .. }
                | Self::Friendship { .. }
                | Self::RoomJoin { .. }
                | Self::RoomLeave { .. }
                | Self::RoomTopic { .. }
                | Self::Scan { .. }
                | Self::Dong { .. }
        )
    }

    /// Short name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::Login { .. } => "login",
            Self::Logout { .. } => "logout",
            Self::Message { .. } => "message",
            Self::Friendship { .. } => "friendship",
            Self::RoomJoin { .. } => "room_join",
            Self::RoomLeave { .. } => "room_leave",
            Self::RoomTopic { .. } => "room_topic",
            Self::Scan { .. } => "scan",
            Self::Dong { .. } => "dong",
            Self::Reset { .. } => "reset",
            Self::Error { .. } => "error",
        }
    }
}

/// Concrete backend variants selectable at session construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Canned-value backend.
    #[default]
    Mock,
    /// Stateful in-process backend.
    Loopback,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "loopback" => Ok(Self::Loopback),
            other => Err(format!("unknown backend '{other}', expected 'mock' or 'loopback'")),
        }
    }
}

/// Session construction options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PuppetOptions {
    /// Session name used in logs.
    pub name: String,
    /// Backend variant the automation layer asked for.
    pub backend: BackendKind,
    /// Overrides the backend's default liveness timeout.
    pub watchdog_timeout_secs: Option<u64>,
    /// Backend-specific connection parameters.
    pub params: BTreeMap<String, String>,
}

impl PuppetOptions {
    pub fn new(name: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            name: name.into(),
            backend,
            ..Self::default()
        }
    }

    pub fn with_watchdog_timeout_secs(mut self, secs: u64) -> Self {
        self.watchdog_timeout_secs = Some(secs);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_states_have_no_stable_value() {
        assert_eq!(SessionState::Off.stable(), Some(StableState::Off));
        assert_eq!(SessionState::On.stable(), Some(StableState::On));
        assert!(SessionState::PendingOn.is_pending());
        assert!(SessionState::PendingOff.is_pending());
        assert_eq!(StableState::On.pending(), SessionState::PendingOn);
    }

    #[test]
    fn inbound_events_are_limited_to_remote_activity() {
        assert!(
            PuppetEvent::Message {
                message_id: "m1".into()
            }
            .is_inbound()
        );
        assert!(PuppetEvent::Dong { data: "x".into() }.is_inbound());
        assert!(
            !PuppetEvent::Login {
                contact_id: "me".into()
            }
            .is_inbound()
        );
        assert!(
            !PuppetEvent::StateChanged {
                state: SessionState::On
            }
            .is_inbound()
        );
    }

    #[test]
    fn parses_backend_kind_case_insensitively() {
        assert_eq!("Mock".parse::<BackendKind>(), Ok(BackendKind::Mock));
        assert_eq!(" loopback ".parse::<BackendKind>(), Ok(BackendKind::Loopback));
        assert!("matrix".parse::<BackendKind>().is_err());
    }

    #[test]
    fn options_builder_keeps_watchdog_override() {
        let options = PuppetOptions::new("bot", BackendKind::Mock)
            .with_watchdog_timeout_secs(30)
            .with_param("endpoint", "local");
        assert_eq!(options.watchdog_timeout_secs, Some(30));
        assert_eq!(options.params.get("endpoint").map(String::as_str), Some("local"));
    }
}
