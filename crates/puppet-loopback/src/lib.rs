//! Stateful in-process puppet backend.
//!
//! Keeps a small world of contacts, rooms, messages and friendships in
//! memory. Mutations persist, so accessor writes are visible to later reads,
//! and the simulation helpers ([`LoopbackBackend::add_contact`],
//! [`LoopbackBackend::inject_message`], ...) stand in for remote traffic by
//! emitting inbound events while a session is up.
//!
//! Bring-up simulates a QR login and reports it as `Scan` events. The
//! [`SELF_NAME_PARAM`] connection param renames the logged-in contact.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use puppet_core::{
    Access, Accessed, Attachment, BackendKind, ContactGender, ContactPayload, ContactType,
    EntityKind, EventSink, FriendshipPayload, FriendshipType, MessagePayload, MessageType,
    PuppetBackend, PuppetError, PuppetErrorKind, PuppetEvent, RawPayload, Receiver,
    RoomMemberPayload, RoomPayload, ScanStatus, decode_raw, encode_raw,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Param naming the display name of the logged-in contact.
pub const SELF_NAME_PARAM: &str = "self_name";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContactRecord {
    id: String,
    name: String,
    alias: Option<String>,
    gender: ContactGender,
    has_avatar: bool,
    friend: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoomRecord {
    id: String,
    topic: String,
    announcement: String,
    owner_id: Option<String>,
    member_ids: Vec<String>,
    member_aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemberRecord {
    id: String,
    room_alias: Option<String>,
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageRecord {
    id: String,
    timestamp_ms: u64,
    from: String,
    to: Option<String>,
    room: Option<String>,
    kind: MessageType,
    text: Option<String>,
    filename: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FriendshipRecord {
    id: String,
    contact_id: String,
    hello: Option<String>,
    kind: FriendshipType,
}

#[derive(Debug, Default)]
struct World {
    sink: Option<EventSink>,
    contacts: HashMap<String, ContactRecord>,
    avatars: HashMap<String, Attachment>,
    rooms: HashMap<String, RoomRecord>,
    messages: HashMap<String, MessageRecord>,
    files: HashMap<String, Attachment>,
    friendships: HashMap<String, FriendshipRecord>,
}

impl World {
    fn emit(&self, event: PuppetEvent) {
        match &self.sink {
            Some(sink) => sink.emit(event),
            None => trace!(event = event.name(), "loopback is down; dropping event"),
        }
    }

    fn contact(&self, contact_id: &str) -> Result<&ContactRecord, PuppetError> {
        self.contacts
            .get(contact_id)
            .ok_or_else(|| PuppetError::not_found(EntityKind::Contact, contact_id))
    }

    fn contact_mut(&mut self, contact_id: &str) -> Result<&mut ContactRecord, PuppetError> {
        self.contacts
            .get_mut(contact_id)
            .ok_or_else(|| PuppetError::not_found(EntityKind::Contact, contact_id))
    }

    fn room(&self, room_id: &str) -> Result<&RoomRecord, PuppetError> {
        self.rooms
            .get(room_id)
            .ok_or_else(|| PuppetError::not_found(EntityKind::Room, room_id))
    }

    fn room_mut(&mut self, room_id: &str) -> Result<&mut RoomRecord, PuppetError> {
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| PuppetError::not_found(EntityKind::Room, room_id))
    }

    fn message(&self, message_id: &str) -> Result<&MessageRecord, PuppetError> {
        self.messages
            .get(message_id)
            .ok_or_else(|| PuppetError::not_found(EntityKind::Message, message_id))
    }

    fn check_receiver(&self, to: &Receiver) -> Result<(), PuppetError> {
        match to {
            Receiver::Contact(id) => self.contact(id).map(|_| ()),
            Receiver::Room(id) => self.room(id).map(|_| ()),
        }
    }

    fn store_message(&mut self, mut record: MessageRecord) -> String {
        let id = new_id("msg");
        record.id = id.clone();
        self.messages.insert(id.clone(), record);
        id
    }
}

/// In-process backend whose world survives stop/start cycles.
#[derive(Debug)]
pub struct LoopbackBackend {
    self_id: String,
    self_name: String,
    world: Mutex<World>,
}

impl LoopbackBackend {
    pub fn new(self_name: impl Into<String>) -> Self {
        Self {
            self_id: new_id("contact"),
            self_name: self_name.into(),
            world: Mutex::new(World::default()),
        }
    }

    /// Identity reported by `bring_up`.
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Register a remote contact and return its id.
    pub fn add_contact(&self, name: impl Into<String>) -> Result<String, PuppetError> {
        let id = new_id("contact");
        let record = ContactRecord {
            id: id.clone(),
            name: name.into(),
            alias: None,
            gender: ContactGender::Unknown,
            has_avatar: false,
            friend: false,
        };
        debug!(contact_id = %id, name = %record.name, "loopback contact added");
        self.world()?.contacts.insert(id.clone(), record);
        Ok(id)
    }

    /// Simulate a room created remotely by `owner_id` and return its id.
    pub fn inject_room(
        &self,
        owner_id: &str,
        topic: impl Into<String>,
        member_ids: &[String],
    ) -> Result<String, PuppetError> {
        let mut world = self.world()?;
        world.contact(owner_id)?;
        for member in member_ids {
            world.contact(member)?;
        }

        let id = new_id("room");
        let mut members = vec![owner_id.to_owned()];
        members.extend(member_ids.iter().filter(|m| *m != owner_id).cloned());
        world.rooms.insert(
            id.clone(),
            RoomRecord {
                id: id.clone(),
                topic: topic.into(),
                announcement: String::new(),
                owner_id: Some(owner_id.to_owned()),
                member_ids: members.clone(),
                member_aliases: BTreeMap::new(),
            },
        );
        world.emit(PuppetEvent::RoomJoin {
            room_id: id.clone(),
            invitee_ids: members,
            inviter_id: owner_id.to_owned(),
        });
        Ok(id)
    }

    /// Simulate an inbound text message and return its id.
    pub fn inject_message(
        &self,
        from: &str,
        to: Receiver,
        text: impl Into<String>,
    ) -> Result<String, PuppetError> {
        let mut world = self.world()?;
        world.contact(from)?;
        world.check_receiver(&to)?;

        let (to_id, room_id) = match to {
            Receiver::Contact(id) => (Some(id), None),
            Receiver::Room(id) => (None, Some(id)),
        };
        let id = world.store_message(MessageRecord {
            id: String::new(),
            timestamp_ms: now_ms(),
            from: from.to_owned(),
            to: to_id,
            room: room_id,
            kind: MessageType::Text,
            text: Some(text.into()),
            filename: None,
        });
        world.emit(PuppetEvent::Message {
            message_id: id.clone(),
        });
        Ok(id)
    }

    /// Simulate a friend request from `contact_id` and return the friendship id.
    pub fn request_friendship(
        &self,
        contact_id: &str,
        hello: impl Into<String>,
    ) -> Result<String, PuppetError> {
        let mut world = self.world()?;
        world.contact(contact_id)?;

        let id = new_id("friendship");
        world.friendships.insert(
            id.clone(),
            FriendshipRecord {
                id: id.clone(),
                contact_id: contact_id.to_owned(),
                hello: Some(hello.into()),
                kind: FriendshipType::Receive,
            },
        );
        world.emit(PuppetEvent::Friendship {
            friendship_id: id.clone(),
        });
        Ok(id)
    }

    /// Report a simulated backend fault on the event bus.
    pub fn inject_error(&self, error: &PuppetError, recoverable: bool) -> Result<(), PuppetError> {
        self.world()?.emit(PuppetEvent::Error {
            code: error.code().to_owned(),
            message: error.message.clone(),
            recoverable,
        });
        Ok(())
    }

    fn world(&self) -> Result<MutexGuard<'_, World>, PuppetError> {
        self.world
            .lock()
            .map_err(|_| PuppetError::backend("loopback world lock poisoned"))
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut keys = map.keys().cloned().collect::<Vec<_>>();
    keys.sort();
    keys
}

#[async_trait]
impl PuppetBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Loopback
    }

    async fn bring_up(
        &self,
        events: EventSink,
        params: &BTreeMap<String, String>,
    ) -> Result<String, PuppetError> {
        let mut world = self.world()?;
        if world.sink.is_some() {
            return Err(PuppetError::backend("loopback backend is already up"));
        }

        events.emit(PuppetEvent::Scan {
            qrcode: Some(format!("loopback://login/{}", self.self_id)),
            status: ScanStatus::Waiting,
        });
        let me = world
            .contacts
            .entry(self.self_id.clone())
            .or_insert_with(|| ContactRecord {
                id: self.self_id.clone(),
                name: self.self_name.clone(),
                alias: None,
                gender: ContactGender::Unknown,
                has_avatar: false,
                friend: false,
            });
        if let Some(name) = params.get(SELF_NAME_PARAM) {
            me.name = name.clone();
        }
        events.emit(PuppetEvent::Scan {
            qrcode: None,
            status: ScanStatus::Confirmed,
        });
        world.sink = Some(events);

        info!(self_id = %self.self_id, "loopback backend up");
        Ok(self.self_id.clone())
    }

    async fn tear_down(&self) -> Result<(), PuppetError> {
        self.world()?.sink = None;
        info!("loopback backend down");
        Ok(())
    }

    async fn ding(&self, data: &str) -> Result<(), PuppetError> {
        let world = self.world()?;
        if world.sink.is_none() {
            return Err(PuppetError::backend("loopback backend is not running"));
        }
        world.emit(PuppetEvent::Dong {
            data: data.to_owned(),
        });
        Ok(())
    }

    async fn contact_raw_payload(&self, contact_id: &str) -> Result<RawPayload, PuppetError> {
        let world = self.world()?;
        encode_raw(EntityKind::Contact, world.contact(contact_id)?)
    }

    fn contact_parse(&self, raw: RawPayload) -> Result<ContactPayload, PuppetError> {
        let record: ContactRecord = decode_raw(EntityKind::Contact, raw)?;
        Ok(ContactPayload {
            avatar: record
                .has_avatar
                .then(|| format!("loopback://avatar/{}", record.id)),
            id: record.id,
            gender: record.gender,
            kind: ContactType::Personal,
            name: record.name,
            alias: record.alias,
            friend: Some(record.friend),
        })
    }

    async fn contact_list(&self) -> Result<Vec<String>, PuppetError> {
        Ok(sorted_keys(&self.world()?.contacts))
    }

    async fn contact_alias(
        &self,
        contact_id: &str,
        access: Access<Option<String>>,
    ) -> Result<Accessed<Option<String>>, PuppetError> {
        let mut world = self.world()?;
        let contact = world.contact_mut(contact_id)?;
        match access {
            Access::Query => Ok(Accessed::Value(contact.alias.clone())),
            Access::Set(alias) => {
                contact.alias = alias;
                Ok(Accessed::Applied)
            }
        }
    }

    async fn contact_avatar(
        &self,
        contact_id: &str,
        access: Access<Attachment>,
    ) -> Result<Accessed<Attachment>, PuppetError> {
        let mut world = self.world()?;
        world.contact(contact_id)?;
        match access {
            Access::Query => world.avatars.get(contact_id).cloned().map(Accessed::Value).ok_or_else(
                || {
                    PuppetError::new(
                        PuppetErrorKind::NotFound,
                        format!("contact {contact_id} has no avatar"),
                    )
                },
            ),
            Access::Set(avatar) => {
                if contact_id != self.self_id {
                    return Err(PuppetError::permission_denied(
                        "can only set the avatar of the logged-in contact",
                    ));
                }
                world.avatars.insert(contact_id.to_owned(), avatar);
                world.contact_mut(contact_id)?.has_avatar = true;
                Ok(Accessed::Applied)
            }
        }
    }

    async fn contact_qrcode(&self, contact_id: &str) -> Result<String, PuppetError> {
        self.world()?.contact(contact_id)?;
        if contact_id != self.self_id {
            return Err(PuppetError::permission_denied(
                "qrcode is only available for the logged-in contact",
            ));
        }
        Ok(format!("loopback://contact/{contact_id}"))
    }

    async fn message_raw_payload(&self, message_id: &str) -> Result<RawPayload, PuppetError> {
        let world = self.world()?;
        encode_raw(EntityKind::Message, world.message(message_id)?)
    }

    fn message_parse(&self, raw: RawPayload) -> Result<MessagePayload, PuppetError> {
        let record: MessageRecord = decode_raw(EntityKind::Message, raw)?;
        Ok(MessagePayload {
            id: record.id,
            timestamp_ms: record.timestamp_ms,
            from_id: record.from,
            to_id: record.to,
            room_id: record.room,
            kind: record.kind,
            text: record.text,
            filename: record.filename,
        })
    }

    async fn message_list(&self) -> Result<Vec<String>, PuppetError> {
        let world = self.world()?;
        let mut messages = world.messages.values().collect::<Vec<_>>();
        messages.sort_by(|a, b| a.timestamp_ms.cmp(&b.timestamp_ms).then(a.id.cmp(&b.id)));
        Ok(messages.into_iter().map(|m| m.id.clone()).collect())
    }

    async fn message_file(&self, message_id: &str) -> Result<Attachment, PuppetError> {
        let world = self.world()?;
        world.message(message_id)?;
        world.files.get(message_id).cloned().ok_or_else(|| {
            PuppetError::new(
                PuppetErrorKind::NotFound,
                format!("message {message_id} carries no file"),
            )
        })
    }

    async fn message_send_text(&self, to: &Receiver, text: &str) -> Result<(), PuppetError> {
        let mut world = self.world()?;
        world.check_receiver(to)?;
        let id = world.store_message(outgoing(&self.self_id, to, MessageType::Text));
        if let Some(record) = world.messages.get_mut(&id) {
            record.text = Some(text.to_owned());
        }
        debug!(message_id = %id, to = to.id(), "loopback text sent");
        Ok(())
    }

    async fn message_send_file(&self, to: &Receiver, file: Attachment) -> Result<(), PuppetError> {
        let mut world = self.world()?;
        world.check_receiver(to)?;
        let mut record = outgoing(&self.self_id, to, MessageType::Attachment);
        record.filename = Some(file.name.clone());
        let id = world.store_message(record);
        world.files.insert(id.clone(), file);
        debug!(message_id = %id, to = to.id(), "loopback file sent");
        Ok(())
    }

    async fn message_send_contact(
        &self,
        to: &Receiver,
        contact_id: &str,
    ) -> Result<(), PuppetError> {
        let mut world = self.world()?;
        world.check_receiver(to)?;
        world.contact(contact_id)?;
        let mut record = outgoing(&self.self_id, to, MessageType::Contact);
        record.text = Some(contact_id.to_owned());
        let id = world.store_message(record);
        debug!(message_id = %id, to = to.id(), contact_id, "loopback contact card sent");
        Ok(())
    }

    async fn message_forward(&self, to: &Receiver, message_id: &str) -> Result<(), PuppetError> {
        let mut world = self.world()?;
        world.check_receiver(to)?;
        let original = world.message(message_id)?.clone();
        let file = world.files.get(message_id).cloned();

        let mut record = outgoing(&self.self_id, to, original.kind);
        record.text = original.text;
        record.filename = original.filename;
        let id = world.store_message(record);
        if let Some(file) = file {
            world.files.insert(id.clone(), file);
        }
        debug!(message_id = %id, forwarded = message_id, "loopback message forwarded");
        Ok(())
    }

    async fn room_raw_payload(&self, room_id: &str) -> Result<RawPayload, PuppetError> {
        let world = self.world()?;
        encode_raw(EntityKind::Room, world.room(room_id)?)
    }

    fn room_parse(&self, raw: RawPayload) -> Result<RoomPayload, PuppetError> {
        let record: RoomRecord = decode_raw(EntityKind::Room, raw)?;
        Ok(RoomPayload {
            id: record.id,
            topic: record.topic,
            owner_id: record.owner_id,
            member_ids: record.member_ids,
            avatar: None,
        })
    }

    async fn room_list(&self) -> Result<Vec<String>, PuppetError> {
        Ok(sorted_keys(&self.world()?.rooms))
    }

    async fn room_create(
        &self,
        contact_ids: &[String],
        topic: &str,
    ) -> Result<String, PuppetError> {
        let mut world = self.world()?;
        for contact_id in contact_ids {
            world.contact(contact_id)?;
        }

        let id = new_id("room");
        let mut members = vec![self.self_id.clone()];
        for contact_id in contact_ids {
            if !members.contains(contact_id) {
                members.push(contact_id.clone());
            }
        }
        world.rooms.insert(
            id.clone(),
            RoomRecord {
                id: id.clone(),
                topic: topic.to_owned(),
                announcement: String::new(),
                owner_id: Some(self.self_id.clone()),
                member_ids: members.clone(),
                member_aliases: BTreeMap::new(),
            },
        );
        world.emit(PuppetEvent::RoomJoin {
            room_id: id.clone(),
            invitee_ids: members,
            inviter_id: self.self_id.clone(),
        });
        info!(room_id = %id, topic, "loopback room created");
        Ok(id)
    }

    async fn room_add(&self, room_id: &str, contact_id: &str) -> Result<(), PuppetError> {
        let mut world = self.world()?;
        world.contact(contact_id)?;
        let room = world.room_mut(room_id)?;
        if room.member_ids.iter().any(|m| m == contact_id) {
            return Ok(());
        }
        room.member_ids.push(contact_id.to_owned());
        world.emit(PuppetEvent::RoomJoin {
            room_id: room_id.to_owned(),
            invitee_ids: vec![contact_id.to_owned()],
            inviter_id: self.self_id.clone(),
        });
        Ok(())
    }

    async fn room_del(&self, room_id: &str, contact_id: &str) -> Result<(), PuppetError> {
        let mut world = self.world()?;
        let room = world.room_mut(room_id)?;
        if room.owner_id.as_deref() != Some(self.self_id.as_str()) {
            return Err(PuppetError::permission_denied(format!(
                "only the owner can remove members from {room_id}"
            )));
        }
        let before = room.member_ids.len();
        room.member_ids.retain(|m| m != contact_id);
        if room.member_ids.len() == before {
            return Err(PuppetError::not_found(
                EntityKind::RoomMember,
                format!("{room_id}/{contact_id}"),
            ));
        }
        room.member_aliases.remove(contact_id);
        world.emit(PuppetEvent::RoomLeave {
            room_id: room_id.to_owned(),
            leaver_ids: vec![contact_id.to_owned()],
            remover_id: Some(self.self_id.clone()),
        });
        Ok(())
    }

    async fn room_quit(&self, room_id: &str) -> Result<(), PuppetError> {
        let mut world = self.world()?;
        let room = world.room_mut(room_id)?;
        let before = room.member_ids.len();
        room.member_ids.retain(|m| *m != self.self_id);
        if room.member_ids.len() == before {
            return Err(PuppetError::permission_denied(format!(
                "not a member of {room_id}"
            )));
        }
        if room.owner_id.as_deref() == Some(self.self_id.as_str()) {
            room.owner_id = room.member_ids.first().cloned();
        }
        world.emit(PuppetEvent::RoomLeave {
            room_id: room_id.to_owned(),
            leaver_ids: vec![self.self_id.clone()],
            remover_id: None,
        });
        Ok(())
    }

    async fn room_topic(
        &self,
        room_id: &str,
        access: Access<String>,
    ) -> Result<Accessed<String>, PuppetError> {
        let mut world = self.world()?;
        let room = world.room_mut(room_id)?;
        match access {
            Access::Query => Ok(Accessed::Value(room.topic.clone())),
            Access::Set(topic) => {
                let old_topic = std::mem::replace(&mut room.topic, topic.clone());
                world.emit(PuppetEvent::RoomTopic {
                    room_id: room_id.to_owned(),
                    topic,
                    old_topic,
                    changer_id: self.self_id.clone(),
                });
                Ok(Accessed::Applied)
            }
        }
    }

    async fn room_announce(
        &self,
        room_id: &str,
        access: Access<String>,
    ) -> Result<Accessed<String>, PuppetError> {
        let mut world = self.world()?;
        let room = world.room_mut(room_id)?;
        match access {
            Access::Query => Ok(Accessed::Value(room.announcement.clone())),
            Access::Set(text) => {
                if room.owner_id.as_deref() != Some(self.self_id.as_str()) {
                    return Err(PuppetError::permission_denied(format!(
                        "only the owner can announce in {room_id}"
                    )));
                }
                room.announcement = text;
                Ok(Accessed::Applied)
            }
        }
    }

    async fn room_qrcode(&self, room_id: &str) -> Result<String, PuppetError> {
        self.world()?.room(room_id)?;
        Ok(format!("loopback://room/{room_id}"))
    }

    async fn room_member_list(&self, room_id: &str) -> Result<Vec<String>, PuppetError> {
        Ok(self.world()?.room(room_id)?.member_ids.clone())
    }

    async fn room_member_raw_payload(
        &self,
        room_id: &str,
        contact_id: &str,
    ) -> Result<RawPayload, PuppetError> {
        let world = self.world()?;
        let room = world.room(room_id)?;
        if !room.member_ids.iter().any(|m| m == contact_id) {
            return Err(PuppetError::not_found(
                EntityKind::RoomMember,
                format!("{room_id}/{contact_id}"),
            ));
        }
        let contact = world.contact(contact_id)?;
        encode_raw(
            EntityKind::RoomMember,
            &MemberRecord {
                id: contact.id.clone(),
                room_alias: room.member_aliases.get(contact_id).cloned(),
                name: contact.name.clone(),
            },
        )
    }

    fn room_member_parse(&self, raw: RawPayload) -> Result<RoomMemberPayload, PuppetError> {
        let record: MemberRecord = decode_raw(EntityKind::RoomMember, raw)?;
        Ok(RoomMemberPayload {
            id: record.id,
            room_alias: record.room_alias,
            name: Some(record.name),
        })
    }

    async fn friendship_raw_payload(
        &self,
        friendship_id: &str,
    ) -> Result<RawPayload, PuppetError> {
        let world = self.world()?;
        let record = world
            .friendships
            .get(friendship_id)
            .ok_or_else(|| PuppetError::not_found(EntityKind::Friendship, friendship_id))?;
        encode_raw(EntityKind::Friendship, record)
    }

    fn friendship_parse(&self, raw: RawPayload) -> Result<FriendshipPayload, PuppetError> {
        let record: FriendshipRecord = decode_raw(EntityKind::Friendship, raw)?;
        Ok(FriendshipPayload {
            id: record.id,
            contact_id: record.contact_id,
            hello: record.hello,
            kind: record.kind,
        })
    }

    async fn friendship_list(&self) -> Result<Vec<String>, PuppetError> {
        Ok(sorted_keys(&self.world()?.friendships))
    }

    async fn friendship_verify(&self, contact_id: &str, hello: &str) -> Result<(), PuppetError> {
        let mut world = self.world()?;
        world.contact(contact_id)?;
        let id = new_id("friendship");
        world.friendships.insert(
            id.clone(),
            FriendshipRecord {
                id: id.clone(),
                contact_id: contact_id.to_owned(),
                hello: Some(hello.to_owned()),
                kind: FriendshipType::Verify,
            },
        );
        debug!(friendship_id = %id, contact_id, "loopback friend request sent");
        Ok(())
    }

    async fn friendship_accept(&self, friendship_id: &str) -> Result<(), PuppetError> {
        let mut world = self.world()?;
        let record = world
            .friendships
            .get_mut(friendship_id)
            .ok_or_else(|| PuppetError::not_found(EntityKind::Friendship, friendship_id))?;
        if record.kind != FriendshipType::Receive {
            return Err(PuppetError::permission_denied(format!(
                "friendship {friendship_id} is not awaiting acceptance"
            )));
        }
        record.kind = FriendshipType::Confirm;
        let contact_id = record.contact_id.clone();
        world.contact_mut(&contact_id)?.friend = true;
        world.emit(PuppetEvent::Friendship {
            friendship_id: friendship_id.to_owned(),
        });
        Ok(())
    }
}

fn outgoing(self_id: &str, to: &Receiver, kind: MessageType) -> MessageRecord {
    let (to_id, room_id) = match to {
        Receiver::Contact(id) => (Some(id.clone()), None),
        Receiver::Room(id) => (None, Some(id.clone())),
    };
    MessageRecord {
        id: String::new(),
        timestamp_ms: now_ms(),
        from: self_id.to_owned(),
        to: to_id,
        room: room_id,
        kind,
        text: None,
        filename: None,
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use puppet_core::{EventStream, Puppet, PuppetOptions, SessionState};
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;

    fn session() -> (Arc<LoopbackBackend>, Puppet) {
        let backend = Arc::new(LoopbackBackend::new("loopback bot"));
        let puppet = Puppet::new(
            Arc::clone(&backend) as Arc<dyn PuppetBackend>,
            PuppetOptions::new("loopback-test", BackendKind::Loopback),
        )
        .expect("loopback options");
        (backend, puppet)
    }

    async fn next_event(events: &mut EventStream) -> PuppetEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event timeout")
            .expect("event receive")
    }

    #[tokio::test]
    async fn lists_are_empty_before_anything_exists() {
        let (_, puppet) = session();
        assert!(puppet.contact_list().await.expect("contacts").is_empty());
        assert!(puppet.room_list().await.expect("rooms").is_empty());
        assert!(puppet.message_list().await.expect("messages").is_empty());
        assert!(puppet.friendship_list().await.expect("friendships").is_empty());
    }

    #[tokio::test]
    async fn start_registers_self_contact() {
        let (backend, puppet) = session();
        puppet.start().await.expect("start");
        assert_eq!(puppet.self_id().as_deref(), Some(backend.self_id()));

        let me = puppet.contact_payload(backend.self_id()).await.expect("self");
        assert_eq!(me.name, "loopback bot");
        assert_eq!(
            puppet.contact_list().await.expect("contacts"),
            vec![backend.self_id().to_owned()]
        );
        puppet.stop().await.expect("stop");
        assert_eq!(puppet.state(), SessionState::Off);
    }

    #[tokio::test]
    async fn bring_up_reports_a_confirmed_scan() {
        let (backend, puppet) = session();
        let mut events = puppet.subscribe();
        puppet.start().await.expect("start");

        let mut scans = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PuppetEvent::Scan { qrcode, status } = event {
                scans.push((qrcode, status));
            }
        }
        assert_eq!(
            scans,
            vec![
                (
                    Some(format!("loopback://login/{}", backend.self_id())),
                    ScanStatus::Waiting
                ),
                (None, ScanStatus::Confirmed),
            ]
        );
        puppet.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn self_name_param_renames_the_logged_in_contact() {
        let backend = Arc::new(LoopbackBackend::new("loopback bot"));
        let puppet = Puppet::new(
            Arc::clone(&backend) as Arc<dyn PuppetBackend>,
            PuppetOptions::new("loopback-test", BackendKind::Loopback)
                .with_param(SELF_NAME_PARAM, "renamed bot"),
        )
        .expect("loopback options");

        puppet.start().await.expect("start");
        let me = puppet.contact_payload(backend.self_id()).await.expect("self");
        assert_eq!(me.name, "renamed bot");
        puppet.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn rejects_mock_options() {
        let err = Puppet::new(
            Arc::new(LoopbackBackend::new("loopback bot")),
            PuppetOptions::new("loopback-test", BackendKind::Mock),
        )
        .expect_err("kind mismatch");
        assert_eq!(err.kind, PuppetErrorKind::InvalidOptions);
    }

    #[tokio::test]
    async fn injected_errors_reach_subscribers_while_up() {
        let (backend, puppet) = session();
        let mut events = puppet.subscribe();
        let fault = PuppetError::backend("relay dropped");

        backend.inject_error(&fault, true).expect("inject while down");
        assert!(events.try_recv().is_err());

        puppet.start().await.expect("start");
        backend.inject_error(&fault, false).expect("inject while up");
        let reported = loop {
            if let event @ PuppetEvent::Error { .. } = next_event(&mut events).await {
                break event;
            }
        };
        assert_eq!(
            reported,
            PuppetEvent::Error {
                code: "backend_failure".into(),
                message: "relay dropped".into(),
                recoverable: false,
            }
        );
        puppet.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn room_topic_persists_and_notifies() {
        let (_, puppet) = session();
        let mut events = puppet.subscribe();
        puppet.start().await.expect("start");

        let room_id = puppet.room_create(&[], "before").await.expect("create");
        puppet.set_room_topic(&room_id, "T").await.expect("set topic");
        assert_eq!(puppet.room_topic(&room_id).await.expect("topic"), "T");
        assert_eq!(
            puppet.room_payload(&room_id).await.expect("payload").topic,
            "T"
        );

        let changed = loop {
            if let event @ PuppetEvent::RoomTopic { .. } = next_event(&mut events).await {
                break event;
            }
        };
        let PuppetEvent::RoomTopic {
            topic, old_topic, ..
        } = changed
        else {
            unreachable!()
        };
        assert_eq!((topic.as_str(), old_topic.as_str()), ("T", "before"));
        puppet.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn contact_alias_can_be_set_and_cleared() {
        let (backend, puppet) = session();
        let friend = backend.add_contact("friend").expect("add contact");

        assert_eq!(puppet.contact_alias(&friend).await.expect("alias"), None);
        puppet
            .set_contact_alias(&friend, Some("buddy".into()))
            .await
            .expect("set alias");
        assert_eq!(
            puppet.contact_payload(&friend).await.expect("payload").alias,
            Some("buddy".to_owned())
        );
        puppet
            .set_contact_alias(&friend, None)
            .await
            .expect("clear alias");
        assert_eq!(puppet.contact_alias(&friend).await.expect("alias"), None);
    }

    #[tokio::test]
    async fn avatar_round_trips_for_self_only() {
        let (backend, puppet) = session();
        puppet.start().await.expect("start");
        let friend = backend.add_contact("friend").expect("add contact");
        let avatar = Attachment::new("me.png", Some("image/png"), vec![1, 2, 3]);

        puppet
            .set_contact_avatar(backend.self_id(), avatar.clone())
            .await
            .expect("set avatar");
        assert_eq!(
            puppet.contact_avatar(backend.self_id()).await.expect("avatar"),
            avatar
        );
        assert!(
            puppet
                .contact_payload(backend.self_id())
                .await
                .expect("payload")
                .avatar
                .is_some()
        );

        let err = puppet
            .set_contact_avatar(&friend, avatar)
            .await
            .expect_err("other avatar");
        assert_eq!(err.kind, PuppetErrorKind::PermissionDenied);
        let err = puppet.contact_avatar(&friend).await.expect_err("no avatar");
        assert_eq!(err.kind, PuppetErrorKind::NotFound);
        puppet.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn injected_messages_are_announced_and_fetchable() {
        let (backend, puppet) = session();
        let mut events = puppet.subscribe();
        puppet.start().await.expect("start");
        let friend = backend.add_contact("friend").expect("add contact");

        let sent = backend
            .inject_message(&friend, Receiver::Contact(backend.self_id().to_owned()), "hi")
            .expect("inject");
        let announced = loop {
            if let PuppetEvent::Message { message_id } = next_event(&mut events).await {
                break message_id;
            }
        };
        assert_eq!(announced, sent);

        let message = puppet.message_payload(&announced).await.expect("payload");
        assert_eq!(message.from_id, friend);
        assert_eq!(message.text.as_deref(), Some("hi"));
        puppet.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn outgoing_messages_are_recorded() {
        let (backend, puppet) = session();
        puppet.start().await.expect("start");
        let friend = backend.add_contact("friend").expect("add contact");
        let to = Receiver::Contact(friend.clone());

        puppet.message_send_text(&to, "hello").await.expect("text");
        puppet
            .message_send_file(&to, Attachment::new("a.txt", None, b"abc".to_vec()))
            .await
            .expect("file");

        let ids = puppet.message_list().await.expect("list");
        assert_eq!(ids.len(), 2);
        let mut file_message = None;
        for id in &ids {
            let payload = puppet.message_payload(id).await.expect("payload");
            if payload.kind == MessageType::Attachment {
                assert_eq!(payload.filename.as_deref(), Some("a.txt"));
                file_message = Some(id.clone());
            }
        }
        let file_message = file_message.expect("file message");
        let file = puppet.message_file(&file_message).await.expect("file");
        assert_eq!(file.data, b"abc".to_vec());

        puppet.message_forward(&to, &file_message).await.expect("forward");
        assert_eq!(puppet.message_list().await.expect("list").len(), 3);

        let err = puppet
            .message_send_text(&Receiver::Room("room-unknown".into()), "x")
            .await
            .expect_err("unknown room");
        assert_eq!(err.kind, PuppetErrorKind::NotFound);
        puppet.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn only_owner_can_remove_members() {
        let (backend, puppet) = session();
        puppet.start().await.expect("start");
        let owner = backend.add_contact("owner").expect("owner");
        let room_id = backend
            .inject_room(&owner, "theirs", &[backend.self_id().to_owned()])
            .expect("inject room");

        let err = puppet
            .room_del(&room_id, &owner)
            .await
            .expect_err("not owner");
        assert_eq!(err.kind, PuppetErrorKind::PermissionDenied);

        puppet.room_quit(&room_id).await.expect("quit");
        assert_eq!(
            puppet.room_member_list(&room_id).await.expect("members"),
            vec![owner.clone()]
        );
        puppet.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn membership_changes_update_room_payload() {
        let (backend, puppet) = session();
        puppet.start().await.expect("start");
        let guest = backend.add_contact("guest").expect("guest");
        let room_id = puppet.room_create(&[], "ours").await.expect("create");

        puppet.room_payload(&room_id).await.expect("warm cache");
        puppet.room_add(&room_id, &guest).await.expect("add");
        assert!(
            puppet
                .room_payload(&room_id)
                .await
                .expect("payload")
                .member_ids
                .contains(&guest)
        );
        let member = puppet
            .room_member_payload(&room_id, &guest)
            .await
            .expect("member");
        assert_eq!(member.name.as_deref(), Some("guest"));

        puppet.room_del(&room_id, &guest).await.expect("del");
        let err = puppet
            .room_member_payload(&room_id, &guest)
            .await
            .expect_err("removed member");
        assert_eq!(err.kind, PuppetErrorKind::NotFound);
        puppet.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn accepting_a_request_confirms_the_friendship() {
        let (backend, puppet) = session();
        puppet.start().await.expect("start");
        let stranger = backend.add_contact("stranger").expect("stranger");
        let request = backend
            .request_friendship(&stranger, "add me")
            .expect("request");

        let pending = puppet.friendship_payload(&request).await.expect("payload");
        assert_eq!(pending.kind, FriendshipType::Receive);

        puppet.friendship_accept(&request).await.expect("accept");
        let confirmed = puppet.friendship_payload(&request).await.expect("payload");
        assert_eq!(confirmed.kind, FriendshipType::Confirm);
        assert_eq!(
            puppet.contact_payload(&stranger).await.expect("contact").friend,
            Some(true)
        );

        let err = puppet
            .friendship_accept(&request)
            .await
            .expect_err("second accept");
        assert_eq!(err.kind, PuppetErrorKind::PermissionDenied);
        puppet.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn malformed_raw_payloads_are_rejected() {
        let (_, puppet) = session();
        let err = puppet
            .contact_parse(json!({ "id": "c1" }))
            .expect_err("missing fields");
        assert_eq!(err.kind, PuppetErrorKind::MalformedPayload);
        let err = puppet
            .friendship_parse(json!({ "id": "f1", "kind": "Unknown" }))
            .expect_err("bad kind");
        assert_eq!(err.kind, PuppetErrorKind::MalformedPayload);
    }

    #[tokio::test]
    async fn world_survives_restart_but_events_stop_with_session() {
        let (backend, puppet) = session();
        puppet.start().await.expect("start");
        let room_id = puppet.room_create(&[], "kept").await.expect("create");
        puppet.stop().await.expect("stop");

        let mut events = puppet.subscribe();
        let friend = backend.add_contact("late").expect("add contact");
        backend
            .inject_message(&friend, Receiver::Room(room_id.clone()), "while down")
            .expect("inject");
        assert!(events.try_recv().is_err());

        puppet.start().await.expect("restart");
        assert_eq!(puppet.room_topic(&room_id).await.expect("topic"), "kept");
        puppet.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn ding_answers_with_dong() {
        let (_, puppet) = session();
        let mut events = puppet.subscribe();
        puppet.start().await.expect("start");
        puppet.ding("probe").await.expect("ding");
        let data = loop {
            if let PuppetEvent::Dong { data } = next_event(&mut events).await {
                break data;
            }
        };
        assert_eq!(data, "probe");
        puppet.stop().await.expect("stop");
    }
}
