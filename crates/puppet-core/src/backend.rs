use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::{
    channel::EventSink,
    error::PuppetError,
    types::{
        Attachment, BackendKind, ContactPayload, EntityKind, FriendshipPayload, MessagePayload,
        RawPayload, Receiver, RoomMemberPayload, RoomPayload,
    },
    watchdog::DEFAULT_WATCHDOG_TIMEOUT,
};

/// Mode of a dual-mode property access.
///
/// A property such as a room topic is one logical operation: called with only
/// the entity id it reads, called with a value it writes. Backends implement
/// both modes in a single method; [`crate::Puppet`] exposes them as a named
/// getter/setter pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access<T> {
    Query,
    Set(T),
}

/// Result of a dual-mode property access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accessed<T> {
    /// Current value, answered to [`Access::Query`].
    Value(T),
    /// Mutation accepted, answered to [`Access::Set`].
    Applied,
}

impl<T> Accessed<T> {
    /// Unwrap a query answer. A backend replying `Applied` to a query broke the contract.
    pub fn into_value(self, operation: &str) -> Result<T, PuppetError> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Applied => Err(PuppetError::backend(format!(
                "'{operation}' query was answered without a value"
            ))),
        }
    }

    /// Unwrap a mutation answer. A backend returning data to a set broke the contract.
    pub fn into_applied(self, operation: &str) -> Result<(), PuppetError> {
        match self {
            Self::Applied => Ok(()),
            Self::Value(_) => Err(PuppetError::backend(format!(
                "'{operation}' mutation returned a value"
            ))),
        }
    }
}

/// Operation surface every concrete backend implements.
///
/// Lifecycle bookkeeping (state machine, identity, watchdog, caches) lives in
/// [`crate::Puppet`]; implementors only do backend-specific work.
#[async_trait]
pub trait PuppetBackend: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Variant this backend implements. Checked against [`crate::PuppetOptions::backend`].
    fn kind(&self) -> BackendKind;

    /// Liveness timeout used when options do not override it.
    fn default_watchdog_timeout(&self) -> Duration {
        DEFAULT_WATCHDOG_TIMEOUT
    }

    /// Bring the backend up and return the logged-in identity.
    ///
    /// `events` stays valid for the whole session; backends must stop using it
    /// once [`PuppetBackend::tear_down`] returns. `params` are the
    /// backend-specific entries of [`crate::PuppetOptions::params`]; unknown
    /// keys are ignored.
    async fn bring_up(
        &self,
        events: EventSink,
        params: &BTreeMap<String, String>,
    ) -> Result<String, PuppetError>;

    /// Release everything acquired by `bring_up`.
    async fn tear_down(&self) -> Result<(), PuppetError>;

    /// Backend-side logout work, run before the `Logout` notification.
    async fn sign_out(&self, _contact_id: &str) -> Result<(), PuppetError> {
        Ok(())
    }

    /// Ask the backend to answer with a `Dong` event carrying `data`.
    async fn ding(&self, _data: &str) -> Result<(), PuppetError> {
        Err(PuppetError::unsupported("ding"))
    }

    async fn contact_raw_payload(&self, contact_id: &str) -> Result<RawPayload, PuppetError>;

    fn contact_parse(&self, raw: RawPayload) -> Result<ContactPayload, PuppetError>;

    async fn contact_list(&self) -> Result<Vec<String>, PuppetError>;

    /// `Set(None)` clears the alias.
    async fn contact_alias(
        &self,
        contact_id: &str,
        access: Access<Option<String>>,
    ) -> Result<Accessed<Option<String>>, PuppetError>;

    async fn contact_avatar(
        &self,
        _contact_id: &str,
        _access: Access<Attachment>,
    ) -> Result<Accessed<Attachment>, PuppetError> {
        Err(PuppetError::unsupported("contact_avatar"))
    }

    async fn contact_qrcode(&self, _contact_id: &str) -> Result<String, PuppetError> {
        Err(PuppetError::unsupported("contact_qrcode"))
    }

    async fn message_raw_payload(&self, message_id: &str) -> Result<RawPayload, PuppetError>;

    fn message_parse(&self, raw: RawPayload) -> Result<MessagePayload, PuppetError>;

    async fn message_list(&self) -> Result<Vec<String>, PuppetError>;

    async fn message_file(&self, _message_id: &str) -> Result<Attachment, PuppetError> {
        Err(PuppetError::unsupported("message_file"))
    }

    async fn message_send_text(&self, to: &Receiver, text: &str) -> Result<(), PuppetError>;

    async fn message_send_file(
        &self,
        _to: &Receiver,
        _file: Attachment,
    ) -> Result<(), PuppetError> {
        Err(PuppetError::unsupported("message_send_file"))
    }

    async fn message_send_contact(
        &self,
        _to: &Receiver,
        _contact_id: &str,
    ) -> Result<(), PuppetError> {
        Err(PuppetError::unsupported("message_send_contact"))
    }

    async fn message_forward(&self, _to: &Receiver, _message_id: &str) -> Result<(), PuppetError> {
        Err(PuppetError::unsupported("message_forward"))
    }

    async fn room_raw_payload(&self, room_id: &str) -> Result<RawPayload, PuppetError>;

    fn room_parse(&self, raw: RawPayload) -> Result<RoomPayload, PuppetError>;

    async fn room_list(&self) -> Result<Vec<String>, PuppetError>;

    /// Create a room and return its id.
    async fn room_create(&self, contact_ids: &[String], topic: &str)
    -> Result<String, PuppetError>;

    async fn room_add(&self, room_id: &str, contact_id: &str) -> Result<(), PuppetError>;

    async fn room_del(&self, room_id: &str, contact_id: &str) -> Result<(), PuppetError>;

    async fn room_quit(&self, room_id: &str) -> Result<(), PuppetError>;

    async fn room_topic(
        &self,
        room_id: &str,
        access: Access<String>,
    ) -> Result<Accessed<String>, PuppetError>;

    async fn room_announce(
        &self,
        _room_id: &str,
        _access: Access<String>,
    ) -> Result<Accessed<String>, PuppetError> {
        Err(PuppetError::unsupported("room_announce"))
    }

    async fn room_avatar(&self, _room_id: &str) -> Result<Attachment, PuppetError> {
        Err(PuppetError::unsupported("room_avatar"))
    }

    async fn room_qrcode(&self, _room_id: &str) -> Result<String, PuppetError> {
        Err(PuppetError::unsupported("room_qrcode"))
    }

    async fn room_member_list(&self, room_id: &str) -> Result<Vec<String>, PuppetError>;

    async fn room_member_raw_payload(
        &self,
        _room_id: &str,
        _contact_id: &str,
    ) -> Result<RawPayload, PuppetError> {
        Err(PuppetError::unsupported("room_member_raw_payload"))
    }

    fn room_member_parse(&self, _raw: RawPayload) -> Result<RoomMemberPayload, PuppetError> {
        Err(PuppetError::unsupported("room_member_parse"))
    }

    async fn friendship_raw_payload(&self, friendship_id: &str)
    -> Result<RawPayload, PuppetError>;

    fn friendship_parse(&self, raw: RawPayload) -> Result<FriendshipPayload, PuppetError>;

    async fn friendship_list(&self) -> Result<Vec<String>, PuppetError>;

    /// Send a friend request to `contact_id`.
    async fn friendship_verify(&self, contact_id: &str, hello: &str) -> Result<(), PuppetError>;

    async fn friendship_accept(&self, friendship_id: &str) -> Result<(), PuppetError>;
}

/// Deserialize a raw payload into a backend-native struct, mapping schema
/// violations to `MalformedPayload`.
pub fn decode_raw<T: DeserializeOwned>(
    entity: EntityKind,
    raw: RawPayload,
) -> Result<T, PuppetError> {
    serde_json::from_value(raw).map_err(|err| PuppetError::malformed(entity, err))
}

/// Serialize a backend-native struct into a raw payload.
pub fn encode_raw<T: serde::Serialize>(
    entity: EntityKind,
    value: &T,
) -> Result<RawPayload, PuppetError> {
    serde_json::to_value(value).map_err(|err| {
        PuppetError::backend(format!("failed encoding raw {entity} payload: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::error::PuppetErrorKind;

    #[derive(Debug, Deserialize, PartialEq)]
    struct RawRoom {
        topic: String,
        member_list: Vec<String>,
    }

    #[test]
    fn query_answers_unwrap_to_values() {
        let answer: Accessed<String> = Accessed::Value("T".into());
        assert_eq!(answer.into_value("room_topic").expect("value"), "T");
    }

    #[test]
    fn mismatched_answers_are_contract_violations() {
        let err = Accessed::<String>::Applied
            .into_value("room_topic")
            .expect_err("query without value must fail");
        assert_eq!(err.kind, PuppetErrorKind::BackendFailure);

        let err = Accessed::Value("T".to_owned())
            .into_applied("room_topic")
            .expect_err("mutation with value must fail");
        assert_eq!(err.kind, PuppetErrorKind::BackendFailure);
    }

    #[test]
    fn decodes_well_formed_raw_payloads() {
        let raw = json!({ "topic": "ops", "member_list": ["a", "b"] });
        let room: RawRoom = decode_raw(EntityKind::Room, raw).expect("decode");
        assert_eq!(room.member_list.len(), 2);
    }

    #[test]
    fn schema_violations_are_malformed_payloads() {
        let raw = json!({ "topic": 42 });
        let err = decode_raw::<RawRoom>(EntityKind::Room, raw).expect_err("decode must fail");
        assert_eq!(err.kind, PuppetErrorKind::MalformedPayload);
        assert!(err.message.starts_with("malformed room payload"));
    }
}
