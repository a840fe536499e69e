//! Canned-value puppet backend.
//!
//! Every query answers with fixed placeholder data and mutations are accepted
//! without being persisted: `set_room_topic` followed by `room_topic` still
//! returns the canned topic. Ids the backend never handed out are rejected
//! with `NotFound`. Lists report only rooms created through `room_create`;
//! the other lists stay empty. Connection params are ignored.
//!
//! While a session is up, a background ticker announces the canned message
//! every three seconds, which keeps the session watchdog fed.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use puppet_core::{
    Access, Accessed, Attachment, BackendKind, ContactGender, ContactPayload, ContactType,
    EntityKind, EventSink, FriendshipPayload, MessagePayload, MessageType, PuppetBackend,
    PuppetError, PuppetEvent, RawPayload, Receiver, RoomPayload, decode_raw, encode_raw,
};
use serde::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Identity reported after every successful bring-up.
pub const MOCK_SELF_ID: &str = "logined_user_id";
/// Id of the message announced by the ticker.
pub const MOCK_MESSAGE_ID: &str = "mockid";
/// Id returned by every `room_create`.
pub const MOCK_ROOM_ID: &str = "mock_room_id";

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);
const TICK_PERIOD: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize, Deserialize)]
struct MockContactRaw {
    id: String,
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct MockMessageRaw {
    id: String,
    from: String,
    to: String,
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MockRoomRaw {
    id: String,
    topic: String,
    member_list: Vec<String>,
    owner_id: String,
}

#[derive(Debug)]
struct RunningTicker {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
pub struct MockBackend {
    sink: Mutex<Option<EventSink>>,
    rooms: Mutex<HashSet<String>>,
    ticker: tokio::sync::Mutex<Option<RunningTicker>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn require_contact(&self, contact_id: &str) -> Result<(), PuppetError> {
        if contact_id == MOCK_SELF_ID {
            Ok(())
        } else {
            Err(PuppetError::not_found(EntityKind::Contact, contact_id))
        }
    }

    fn require_message(&self, message_id: &str) -> Result<(), PuppetError> {
        if message_id == MOCK_MESSAGE_ID {
            Ok(())
        } else {
            Err(PuppetError::not_found(EntityKind::Message, message_id))
        }
    }

    fn require_room(&self, room_id: &str) -> Result<(), PuppetError> {
        if lock(&self.rooms)?.contains(room_id) {
            Ok(())
        } else {
            Err(PuppetError::not_found(EntityKind::Room, room_id))
        }
    }

    fn emit(&self, event: PuppetEvent) -> Result<(), PuppetError> {
        match lock(&self.sink)?.as_ref() {
            Some(sink) => {
                sink.emit(event);
                Ok(())
            }
            None => Err(PuppetError::backend("mock backend is not running")),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, PuppetError> {
    mutex
        .lock()
        .map_err(|_: PoisonError<_>| PuppetError::backend("mock backend state lock poisoned"))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

fn canned_attachment(name: String) -> Attachment {
    Attachment::new(name, Some("application/octet-stream"), b"mock attachment".to_vec())
}

fn spawn_ticker(sink: EventSink) -> RunningTicker {
    let stop = CancellationToken::new();
    let stop_child = stop.child_token();
    let task = tokio::spawn(async move {
        let mut ticks = tokio::time::interval_at(Instant::now() + TICK_PERIOD, TICK_PERIOD);
        loop {
            tokio::select! {
                _ = stop_child.cancelled() => break,
                _ = ticks.tick() => {
                    trace!(message_id = MOCK_MESSAGE_ID, "pretending a new message arrived");
                    sink.emit(PuppetEvent::Message {
                        message_id: MOCK_MESSAGE_ID.to_owned(),
                    });
                }
            }
        }
    });
    RunningTicker { stop, task }
}

#[async_trait]
impl PuppetBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    fn default_watchdog_timeout(&self) -> Duration {
        WATCHDOG_TIMEOUT
    }

    async fn bring_up(
        &self,
        events: EventSink,
        _params: &BTreeMap<String, String>,
    ) -> Result<String, PuppetError> {
        let mut ticker = self.ticker.lock().await;
        if ticker.is_some() {
            return Err(PuppetError::backend("mock ticker is already running"));
        }

        *lock(&self.sink)? = Some(events.clone());
        *ticker = Some(spawn_ticker(events));

        debug!(self_id = MOCK_SELF_ID, "mock backend up");
        Ok(MOCK_SELF_ID.to_owned())
    }

    async fn tear_down(&self) -> Result<(), PuppetError> {
        let running = self.ticker.lock().await.take();
        if let Some(running) = running {
            running.stop.cancel();
            let _ = running.task.await;
        }
        *lock(&self.sink)? = None;

        debug!("mock backend down");
        Ok(())
    }

    async fn ding(&self, data: &str) -> Result<(), PuppetError> {
        self.emit(PuppetEvent::Dong {
            data: data.to_owned(),
        })
    }

    async fn contact_raw_payload(&self, contact_id: &str) -> Result<RawPayload, PuppetError> {
        trace!(contact_id, "contact_raw_payload");
        self.require_contact(contact_id)?;
        encode_raw(
            EntityKind::Contact,
            &MockContactRaw {
                id: contact_id.to_owned(),
                name: "mock name".to_owned(),
            },
        )
    }

    fn contact_parse(&self, raw: RawPayload) -> Result<ContactPayload, PuppetError> {
        let raw: MockContactRaw = decode_raw(EntityKind::Contact, raw)?;
        Ok(ContactPayload {
            id: raw.id,
            gender: ContactGender::Unknown,
            kind: ContactType::Unknown,
            name: raw.name,
            alias: None,
            avatar: None,
            friend: None,
        })
    }

    async fn contact_list(&self) -> Result<Vec<String>, PuppetError> {
        Ok(Vec::new())
    }

    async fn contact_alias(
        &self,
        contact_id: &str,
        access: Access<Option<String>>,
    ) -> Result<Accessed<Option<String>>, PuppetError> {
        self.require_contact(contact_id)?;
        match access {
            Access::Query => Ok(Accessed::Value(Some("mock alias".to_owned()))),
            Access::Set(_) => Ok(Accessed::Applied),
        }
    }

    async fn contact_avatar(
        &self,
        contact_id: &str,
        access: Access<Attachment>,
    ) -> Result<Accessed<Attachment>, PuppetError> {
        self.require_contact(contact_id)?;
        match access {
            Access::Query => Ok(Accessed::Value(canned_attachment(format!(
                "{contact_id}-avatar.png"
            )))),
            Access::Set(_) => Ok(Accessed::Applied),
        }
    }

    async fn contact_qrcode(&self, contact_id: &str) -> Result<String, PuppetError> {
        if contact_id != MOCK_SELF_ID {
            return Err(PuppetError::permission_denied(
                "qrcode is only available for the logged-in contact",
            ));
        }
        Err(PuppetError::unsupported("contact_qrcode"))
    }

    async fn message_raw_payload(&self, message_id: &str) -> Result<RawPayload, PuppetError> {
        trace!(message_id, "message_raw_payload");
        self.require_message(message_id)?;
        encode_raw(
            EntityKind::Message,
            &MockMessageRaw {
                id: message_id.to_owned(),
                from: "xxx".to_owned(),
                to: MOCK_SELF_ID.to_owned(),
                text: "mock text".to_owned(),
            },
        )
    }

    fn message_parse(&self, raw: RawPayload) -> Result<MessagePayload, PuppetError> {
        let raw: MockMessageRaw = decode_raw(EntityKind::Message, raw)?;
        Ok(MessagePayload {
            id: raw.id,
            timestamp_ms: now_ms(),
            from_id: raw.from,
            to_id: Some(raw.to),
            room_id: None,
            kind: MessageType::Text,
            text: Some(raw.text),
            filename: None,
        })
    }

    async fn message_list(&self) -> Result<Vec<String>, PuppetError> {
        Ok(Vec::new())
    }

    async fn message_file(&self, message_id: &str) -> Result<Attachment, PuppetError> {
        self.require_message(message_id)?;
        Ok(canned_attachment(format!("mock-file{message_id}.txt")))
    }

    async fn message_send_text(&self, to: &Receiver, text: &str) -> Result<(), PuppetError> {
        debug!(to = to.id(), text, "mock send text");
        Ok(())
    }

    async fn message_send_file(&self, to: &Receiver, file: Attachment) -> Result<(), PuppetError> {
        debug!(to = to.id(), file = %file.name, "mock send file");
        Ok(())
    }

    async fn message_send_contact(
        &self,
        to: &Receiver,
        contact_id: &str,
    ) -> Result<(), PuppetError> {
        self.require_contact(contact_id)?;
        debug!(to = to.id(), contact_id, "mock send contact");
        Ok(())
    }

    async fn message_forward(&self, to: &Receiver, message_id: &str) -> Result<(), PuppetError> {
        self.require_message(message_id)?;
        debug!(to = to.id(), message_id, "mock forward");
        Ok(())
    }

    async fn room_raw_payload(&self, room_id: &str) -> Result<RawPayload, PuppetError> {
        trace!(room_id, "room_raw_payload");
        self.require_room(room_id)?;
        encode_raw(
            EntityKind::Room,
            &MockRoomRaw {
                id: room_id.to_owned(),
                topic: "mock room topic".to_owned(),
                member_list: Vec::new(),
                owner_id: "mock_room_owner_id".to_owned(),
            },
        )
    }

    fn room_parse(&self, raw: RawPayload) -> Result<RoomPayload, PuppetError> {
        let raw: MockRoomRaw = decode_raw(EntityKind::Room, raw)?;
        Ok(RoomPayload {
            id: raw.id,
            topic: raw.topic,
            owner_id: Some(raw.owner_id),
            member_ids: raw.member_list,
            avatar: None,
        })
    }

    async fn room_list(&self) -> Result<Vec<String>, PuppetError> {
        let mut rooms = lock(&self.rooms)?.iter().cloned().collect::<Vec<_>>();
        rooms.sort();
        Ok(rooms)
    }

    async fn room_create(
        &self,
        contact_ids: &[String],
        topic: &str,
    ) -> Result<String, PuppetError> {
        debug!(members = contact_ids.len(), topic, "mock room create");
        lock(&self.rooms)?.insert(MOCK_ROOM_ID.to_owned());
        Ok(MOCK_ROOM_ID.to_owned())
    }

    async fn room_add(&self, room_id: &str, contact_id: &str) -> Result<(), PuppetError> {
        self.require_room(room_id)?;
        debug!(room_id, contact_id, "mock room add");
        Ok(())
    }

    async fn room_del(&self, room_id: &str, contact_id: &str) -> Result<(), PuppetError> {
        self.require_room(room_id)?;
        debug!(room_id, contact_id, "mock room del");
        Ok(())
    }

    async fn room_quit(&self, room_id: &str) -> Result<(), PuppetError> {
        self.require_room(room_id)?;
        debug!(room_id, "mock room quit");
        Ok(())
    }

    async fn room_topic(
        &self,
        room_id: &str,
        access: Access<String>,
    ) -> Result<Accessed<String>, PuppetError> {
        self.require_room(room_id)?;
        match access {
            Access::Query => Ok(Accessed::Value("mock room topic".to_owned())),
            Access::Set(_) => Ok(Accessed::Applied),
        }
    }

    async fn room_announce(
        &self,
        room_id: &str,
        access: Access<String>,
    ) -> Result<Accessed<String>, PuppetError> {
        self.require_room(room_id)?;
        match access {
            Access::Query => Ok(Accessed::Value(format!("mock announcement for {room_id}"))),
            Access::Set(_) => Ok(Accessed::Applied),
        }
    }

    async fn room_avatar(&self, room_id: &str) -> Result<Attachment, PuppetError> {
        self.require_room(room_id)?;
        Ok(canned_attachment(format!("{room_id}-avatar.png")))
    }

    async fn room_qrcode(&self, room_id: &str) -> Result<String, PuppetError> {
        self.require_room(room_id)?;
        Ok(format!("{room_id} mock qrcode"))
    }

    async fn room_member_list(&self, room_id: &str) -> Result<Vec<String>, PuppetError> {
        self.require_room(room_id)?;
        Ok(Vec::new())
    }

    async fn room_member_raw_payload(
        &self,
        room_id: &str,
        contact_id: &str,
    ) -> Result<RawPayload, PuppetError> {
        self.require_room(room_id)?;
        Err(PuppetError::not_found(
            EntityKind::RoomMember,
            format!("{room_id}/{contact_id}"),
        ))
    }

    async fn friendship_raw_payload(
        &self,
        friendship_id: &str,
    ) -> Result<RawPayload, PuppetError> {
        Err(PuppetError::not_found(EntityKind::Friendship, friendship_id))
    }

    fn friendship_parse(&self, raw: RawPayload) -> Result<FriendshipPayload, PuppetError> {
        decode_raw(EntityKind::Friendship, raw)
    }

    async fn friendship_list(&self) -> Result<Vec<String>, PuppetError> {
        Ok(Vec::new())
    }

    async fn friendship_verify(&self, contact_id: &str, hello: &str) -> Result<(), PuppetError> {
        debug!(contact_id, hello, "mock friendship verify");
        Ok(())
    }

    async fn friendship_accept(&self, friendship_id: &str) -> Result<(), PuppetError> {
        Err(PuppetError::not_found(EntityKind::Friendship, friendship_id))
    }
}
