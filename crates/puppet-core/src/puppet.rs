use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    backend::{Access, PuppetBackend},
    cache::{PayloadCache, PayloadCaches, room_member_key},
    channel::{EventSink, EventStream},
    error::{PuppetError, PuppetErrorKind},
    state_machine::SessionStateMachine,
    types::{
        Attachment, ContactPayload, EntityKind, FriendshipPayload, MessagePayload, PuppetEvent,
        PuppetOptions, RawPayload, Receiver, RoomMemberPayload, RoomPayload, SessionState,
        StableState,
    },
    watchdog::{Watchdog, WatchdogFood},
};

const EVENT_BUFFER: usize = 512;

/// Backend-agnostic session handle used by the automation layer.
///
/// Clones share one session. All state mutation goes through the lifecycle
/// operations; entity operations read through the payload caches before
/// reaching the backend.
#[derive(Clone)]
pub struct Puppet {
    inner: Arc<PuppetInner>,
}

struct PuppetInner {
    options: PuppetOptions,
    backend: Arc<dyn PuppetBackend>,
    state: SessionStateMachine,
    identity: RwLock<SessionIdentity>,
    logout_lock: tokio::sync::Mutex<()>,
    watchdog: Arc<Watchdog>,
    supervisor: Mutex<Option<CancellationToken>>,
    events: EventSink,
    caches: PayloadCaches,
}

/// Logged-in identity tagged with the login it belongs to.
#[derive(Debug, Default)]
struct SessionIdentity {
    /// Bumped on every login.
    generation: u64,
    contact_id: Option<String>,
}

impl fmt::Debug for Puppet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Puppet")
            .field("name", &self.inner.options.name)
            .field("backend", &self.inner.backend.name())
            .field("state", &self.state())
            .field("self_id", &self.self_id())
            .finish()
    }
}

impl Puppet {
    /// Pair `backend` with `options`. Fails with `InvalidOptions` when
    /// `options.backend` names a different backend variant.
    pub fn new(
        backend: Arc<dyn PuppetBackend>,
        options: PuppetOptions,
    ) -> Result<Self, PuppetError> {
        Self::with_caches(backend, options, PayloadCaches::default())
    }

    /// Build a session over caller-provided payload caches.
    pub fn with_caches(
        backend: Arc<dyn PuppetBackend>,
        options: PuppetOptions,
        caches: PayloadCaches,
    ) -> Result<Self, PuppetError> {
        if options.backend != backend.kind() {
            return Err(PuppetError::new(
                PuppetErrorKind::InvalidOptions,
                format!(
                    "options ask for the {:?} backend but '{}' is a {:?} backend",
                    options.backend,
                    backend.name(),
                    backend.kind()
                ),
            ));
        }

        let timeout = options
            .watchdog_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| backend.default_watchdog_timeout());
        let watchdog = Arc::new(Watchdog::new(timeout));
        let events = EventSink::new(EVENT_BUFFER, Arc::clone(&watchdog));

        debug!(
            name = %options.name,
            backend = backend.name(),
            watchdog_timeout_secs = timeout.as_secs(),
            "constructed puppet"
        );

        Ok(Self {
            inner: Arc::new(PuppetInner {
                options,
                backend,
                state: SessionStateMachine::default(),
                identity: RwLock::new(SessionIdentity::default()),
                logout_lock: tokio::sync::Mutex::new(()),
                watchdog,
                supervisor: Mutex::new(None),
                events,
                caches,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn options(&self) -> &PuppetOptions {
        &self.inner.options
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.state()
    }

    /// Liveness timeout consumed by the watchdog supervisor.
    pub fn watchdog_timeout(&self) -> Duration {
        self.inner.watchdog.timeout()
    }

    /// Subscribe to lifecycle and inbound notifications.
    pub fn subscribe(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    /// Watch raw session state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Suspend until the session reaches `target`.
    pub async fn await_state(&self, target: StableState) -> Result<(), PuppetError> {
        self.inner.state.await_state(target).await
    }

    /// Identity of the logged-in user, if any.
    pub fn self_id(&self) -> Option<String> {
        self.read_identity().contact_id.clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.self_id().is_some()
    }

    pub async fn start(&self) -> Result<(), PuppetError> {
        info!(
            name = %self.name(),
            backend = self.backend_name(),
            "starting puppet"
        );

        if let Err(current) = self.inner.state.try_begin(StableState::On) {
            return Err(match current {
                SessionState::PendingOn => PuppetError::new(
                    PuppetErrorKind::AlreadyStarting,
                    "start() called while a start is in flight",
                ),
                SessionState::On => PuppetError::new(
                    PuppetErrorKind::AlreadyOn,
                    "start() called on a running puppet",
                ),
                other => PuppetError::invalid_transition(other, "start"),
            });
        }
        self.emit_state(SessionState::PendingOn);

        let identity = match self.bring_up().await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(error = %err, "backend bring-up failed; rolling back to off");
                self.inner.state.rollback()?;
                self.emit_state(SessionState::Off);
                return Err(err);
            }
        };

        self.login(identity.clone());
        self.inner.events.emit(PuppetEvent::Login {
            contact_id: identity.clone(),
        });

        // Armed while still PendingOn: stop() cannot disarm before it sees On.
        self.inner.watchdog.feed(WatchdogFood::Started);
        self.arm_watchdog();
        if let Err(err) = self.inner.state.complete(StableState::On) {
            self.disarm_watchdog();
            return Err(err);
        }
        self.emit_state(SessionState::On);

        info!(self_id = %identity, "puppet started");
        Ok(())
    }

    /// Stop the session. Stopping a stopped session is not an error.
    pub async fn stop(&self) -> Result<(), PuppetError> {
        loop {
            match self.state() {
                SessionState::Off => {
                    debug!("stop() called on an off puppet");
                    return Ok(());
                }
                SessionState::PendingOff => {
                    warn!("stop() called while a stop is in flight; waiting for off");
                    return self.await_state(StableState::Off).await;
                }
                SessionState::PendingOn => {
                    debug!("stop() waiting for in-flight start to settle");
                    self.inner.state.await_settled().await?;
                }
                SessionState::On => {
                    if self.inner.state.try_begin(StableState::Off).is_ok() {
                        break;
                    }
                }
            }
        }
        info!(name = %self.name(), "stopping puppet");
        self.emit_state(SessionState::PendingOff);
        self.disarm_watchdog();

        let teardown = self.inner.backend.tear_down().await;
        self.write_identity().contact_id = None;
        self.inner.state.complete(StableState::Off)?;
        self.emit_state(SessionState::Off);

        if let Err(err) = &teardown {
            warn!(error = %err, "backend teardown failed; session is off regardless");
        }
        teardown
    }

    /// Log the current identity out. Session on/off state is left untouched.
    ///
    /// If the session is stopped or restarted while the backend signs out,
    /// the newer session's identity is left alone and `NotLoggedIn` is
    /// returned without a `Logout` event.
    pub async fn logout(&self) -> Result<(), PuppetError> {
        let _guard = self.inner.logout_lock.lock().await;
        let (generation, contact_id) = {
            let identity = self.read_identity();
            match &identity.contact_id {
                Some(contact_id) => (identity.generation, contact_id.clone()),
                None => {
                    return Err(PuppetError::new(
                        PuppetErrorKind::NotLoggedIn,
                        "logout() called before login",
                    ));
                }
            }
        };

        self.inner.backend.sign_out(&contact_id).await?;

        {
            let mut identity = self.write_identity();
            if identity.generation != generation
                || identity.contact_id.as_deref() != Some(contact_id.as_str())
            {
                warn!(%contact_id, "session ended while signing out; identity left as is");
                return Err(PuppetError::new(
                    PuppetErrorKind::NotLoggedIn,
                    format!("session of {contact_id} ended before logout completed"),
                ));
            }
            self.inner.events.emit(PuppetEvent::Logout {
                contact_id: contact_id.clone(),
            });
            identity.contact_id = None;
        }

        info!(%contact_id, "logged out");
        Ok(())
    }

    /// Liveness probe; the backend answers with a `Dong` event.
    pub async fn ding(&self, data: &str) -> Result<(), PuppetError> {
        trace!(data, "ding");
        self.inner.backend.ding(data).await
    }

    // Contact

    pub async fn contact_raw_payload(&self, contact_id: &str) -> Result<RawPayload, PuppetError> {
        self.inner.backend.contact_raw_payload(contact_id).await
    }

    pub fn contact_parse(&self, raw: RawPayload) -> Result<ContactPayload, PuppetError> {
        self.inner.backend.contact_parse(raw)
    }

    pub async fn contact_payload(&self, contact_id: &str) -> Result<ContactPayload, PuppetError> {
        let backend = &self.inner.backend;
        read_through(
            self.inner.caches.contact.as_ref(),
            EntityKind::Contact,
            contact_id,
            || async { backend.contact_parse(backend.contact_raw_payload(contact_id).await?) },
        )
        .await
    }

    pub fn contact_payload_dirty(&self, contact_id: &str) {
        self.inner.caches.contact.delete(contact_id);
    }

    pub async fn contact_list(&self) -> Result<Vec<String>, PuppetError> {
        self.inner.backend.contact_list().await
    }

    /// Query half of the contact alias accessor. `None` means no alias is set.
    pub async fn contact_alias(&self, contact_id: &str) -> Result<Option<String>, PuppetError> {
        self.inner
            .backend
            .contact_alias(contact_id, Access::Query)
            .await?
            .into_value("contact_alias")
    }

    /// Mutation half of the contact alias accessor. `None` clears the alias.
    pub async fn set_contact_alias(
        &self,
        contact_id: &str,
        alias: Option<String>,
    ) -> Result<(), PuppetError> {
        debug!(contact_id, ?alias, "set_contact_alias");
        self.inner
            .backend
            .contact_alias(contact_id, Access::Set(alias))
            .await?
            .into_applied("contact_alias")?;
        self.contact_payload_dirty(contact_id);
        Ok(())
    }

    /// Query half of the contact avatar accessor.
    pub async fn contact_avatar(&self, contact_id: &str) -> Result<Attachment, PuppetError> {
        self.inner
            .backend
            .contact_avatar(contact_id, Access::Query)
            .await?
            .into_value("contact_avatar")
    }

    /// Mutation half of the contact avatar accessor.
    pub async fn set_contact_avatar(
        &self,
        contact_id: &str,
        avatar: Attachment,
    ) -> Result<(), PuppetError> {
        debug!(contact_id, avatar = %avatar.name, "set_contact_avatar");
        self.inner
            .backend
            .contact_avatar(contact_id, Access::Set(avatar))
            .await?
            .into_applied("contact_avatar")?;
        self.contact_payload_dirty(contact_id);
        Ok(())
    }

    pub async fn contact_qrcode(&self, contact_id: &str) -> Result<String, PuppetError> {
        self.inner.backend.contact_qrcode(contact_id).await
    }

    // Message

    pub async fn message_raw_payload(&self, message_id: &str) -> Result<RawPayload, PuppetError> {
        self.inner.backend.message_raw_payload(message_id).await
    }

    pub fn message_parse(&self, raw: RawPayload) -> Result<MessagePayload, PuppetError> {
        self.inner.backend.message_parse(raw)
    }

    pub async fn message_payload(&self, message_id: &str) -> Result<MessagePayload, PuppetError> {
        let backend = &self.inner.backend;
        read_through(
            self.inner.caches.message.as_ref(),
            EntityKind::Message,
            message_id,
            || async { backend.message_parse(backend.message_raw_payload(message_id).await?) },
        )
        .await
    }

    pub fn message_payload_dirty(&self, message_id: &str) {
        self.inner.caches.message.delete(message_id);
    }

    pub async fn message_list(&self) -> Result<Vec<String>, PuppetError> {
        self.inner.backend.message_list().await
    }

    pub async fn message_file(&self, message_id: &str) -> Result<Attachment, PuppetError> {
        self.inner.backend.message_file(message_id).await
    }

    pub async fn message_send_text(&self, to: &Receiver, text: &str) -> Result<(), PuppetError> {
        debug!(?to, len = text.len(), "message_send_text");
        self.inner.backend.message_send_text(to, text).await
    }

    pub async fn message_send_file(
        &self,
        to: &Receiver,
        file: Attachment,
    ) -> Result<(), PuppetError> {
        debug!(?to, file = %file.name, "message_send_file");
        self.inner.backend.message_send_file(to, file).await
    }

    pub async fn message_send_contact(
        &self,
        to: &Receiver,
        contact_id: &str,
    ) -> Result<(), PuppetError> {
        debug!(?to, contact_id, "message_send_contact");
        self.inner.backend.message_send_contact(to, contact_id).await
    }

    pub async fn message_forward(
        &self,
        to: &Receiver,
        message_id: &str,
    ) -> Result<(), PuppetError> {
        debug!(?to, message_id, "message_forward");
        self.inner.backend.message_forward(to, message_id).await
    }

    // Room

    pub async fn room_raw_payload(&self, room_id: &str) -> Result<RawPayload, PuppetError> {
        self.inner.backend.room_raw_payload(room_id).await
    }

    pub fn room_parse(&self, raw: RawPayload) -> Result<RoomPayload, PuppetError> {
        self.inner.backend.room_parse(raw)
    }

    pub async fn room_payload(&self, room_id: &str) -> Result<RoomPayload, PuppetError> {
        let backend = &self.inner.backend;
        read_through(
            self.inner.caches.room.as_ref(),
            EntityKind::Room,
            room_id,
            || async { backend.room_parse(backend.room_raw_payload(room_id).await?) },
        )
        .await
    }

    pub fn room_payload_dirty(&self, room_id: &str) {
        self.inner.caches.room.delete(room_id);
    }

    pub async fn room_list(&self) -> Result<Vec<String>, PuppetError> {
        self.inner.backend.room_list().await
    }

    pub async fn room_create(
        &self,
        contact_ids: &[String],
        topic: &str,
    ) -> Result<String, PuppetError> {
        debug!(members = contact_ids.len(), topic, "room_create");
        self.inner.backend.room_create(contact_ids, topic).await
    }

    pub async fn room_add(&self, room_id: &str, contact_id: &str) -> Result<(), PuppetError> {
        debug!(room_id, contact_id, "room_add");
        self.inner.backend.room_add(room_id, contact_id).await?;
        self.room_payload_dirty(room_id);
        Ok(())
    }

    pub async fn room_del(&self, room_id: &str, contact_id: &str) -> Result<(), PuppetError> {
        debug!(room_id, contact_id, "room_del");
        self.inner.backend.room_del(room_id, contact_id).await?;
        self.room_payload_dirty(room_id);
        self.inner
            .caches
            .room_member
            .delete(&room_member_key(room_id, contact_id));
        Ok(())
    }

    pub async fn room_quit(&self, room_id: &str) -> Result<(), PuppetError> {
        debug!(room_id, "room_quit");
        self.inner.backend.room_quit(room_id).await?;
        self.room_payload_dirty(room_id);
        Ok(())
    }

    /// Query half of the room topic accessor.
    pub async fn room_topic(&self, room_id: &str) -> Result<String, PuppetError> {
        self.inner
            .backend
            .room_topic(room_id, Access::Query)
            .await?
            .into_value("room_topic")
    }

    /// Mutation half of the room topic accessor.
    pub async fn set_room_topic(&self, room_id: &str, topic: &str) -> Result<(), PuppetError> {
        debug!(room_id, topic, "set_room_topic");
        self.inner
            .backend
            .room_topic(room_id, Access::Set(topic.to_owned()))
            .await?
            .into_applied("room_topic")?;
        self.room_payload_dirty(room_id);
        Ok(())
    }

    /// Query half of the room announcement accessor.
    pub async fn room_announce(&self, room_id: &str) -> Result<String, PuppetError> {
        self.inner
            .backend
            .room_announce(room_id, Access::Query)
            .await?
            .into_value("room_announce")
    }

    /// Mutation half of the room announcement accessor.
    pub async fn set_room_announce(&self, room_id: &str, text: &str) -> Result<(), PuppetError> {
        debug!(room_id, "set_room_announce");
        self.inner
            .backend
            .room_announce(room_id, Access::Set(text.to_owned()))
            .await?
            .into_applied("room_announce")
    }

    pub async fn room_avatar(&self, room_id: &str) -> Result<Attachment, PuppetError> {
        self.inner.backend.room_avatar(room_id).await
    }

    pub async fn room_qrcode(&self, room_id: &str) -> Result<String, PuppetError> {
        self.inner.backend.room_qrcode(room_id).await
    }

    pub async fn room_member_list(&self, room_id: &str) -> Result<Vec<String>, PuppetError> {
        self.inner.backend.room_member_list(room_id).await
    }

    pub async fn room_member_payload(
        &self,
        room_id: &str,
        contact_id: &str,
    ) -> Result<RoomMemberPayload, PuppetError> {
        let backend = &self.inner.backend;
        read_through(
            self.inner.caches.room_member.as_ref(),
            EntityKind::RoomMember,
            &room_member_key(room_id, contact_id),
            || async {
                backend.room_member_parse(
                    backend
                        .room_member_raw_payload(room_id, contact_id)
                        .await?,
                )
            },
        )
        .await
    }

    // Friendship

    pub async fn friendship_raw_payload(
        &self,
        friendship_id: &str,
    ) -> Result<RawPayload, PuppetError> {
        self.inner.backend.friendship_raw_payload(friendship_id).await
    }

    pub fn friendship_parse(&self, raw: RawPayload) -> Result<FriendshipPayload, PuppetError> {
        self.inner.backend.friendship_parse(raw)
    }

    pub async fn friendship_payload(
        &self,
        friendship_id: &str,
    ) -> Result<FriendshipPayload, PuppetError> {
        let backend = &self.inner.backend;
        read_through(
            self.inner.caches.friendship.as_ref(),
            EntityKind::Friendship,
            friendship_id,
            || async {
                backend.friendship_parse(backend.friendship_raw_payload(friendship_id).await?)
            },
        )
        .await
    }

    pub fn friendship_payload_dirty(&self, friendship_id: &str) {
        self.inner.caches.friendship.delete(friendship_id);
    }

    pub async fn friendship_list(&self) -> Result<Vec<String>, PuppetError> {
        self.inner.backend.friendship_list().await
    }

    pub async fn friendship_verify(
        &self,
        contact_id: &str,
        hello: &str,
    ) -> Result<(), PuppetError> {
        debug!(contact_id, hello, "friendship_verify");
        self.inner.backend.friendship_verify(contact_id, hello).await
    }

    pub async fn friendship_accept(&self, friendship_id: &str) -> Result<(), PuppetError> {
        debug!(friendship_id, "friendship_accept");
        self.inner.backend.friendship_accept(friendship_id).await?;
        self.friendship_payload_dirty(friendship_id);
        Ok(())
    }

    async fn bring_up(&self) -> Result<String, PuppetError> {
        let identity = self
            .inner
            .backend
            .bring_up(self.inner.events.clone(), &self.inner.options.params)
            .await?;
        if !identity.trim().is_empty() {
            return Ok(identity);
        }

        if let Err(err) = self.inner.backend.tear_down().await {
            warn!(error = %err, "teardown after empty identity failed");
        }
        Err(PuppetError::backend("backend logged in without an identity"))
    }

    fn login(&self, contact_id: String) {
        let mut identity = self.write_identity();
        identity.generation += 1;
        identity.contact_id = Some(contact_id);
    }

    fn read_identity(&self) -> RwLockReadGuard<'_, SessionIdentity> {
        self.inner
            .identity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_identity(&self) -> RwLockWriteGuard<'_, SessionIdentity> {
        self.inner
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_state(&self, state: SessionState) {
        self.inner.events.emit(PuppetEvent::StateChanged { state });
    }

    fn arm_watchdog(&self) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.lock_supervisor().replace(cancel.clone()) {
            previous.cancel();
        }

        let watchdog = Arc::clone(&self.inner.watchdog);
        let session = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let Some(starvation) = watchdog.supervise(cancel).await else {
                return;
            };
            let Some(inner) = session.upgrade() else {
                return;
            };
            let puppet = Puppet { inner };

            warn!(
                timeout_secs = starvation.timeout.as_secs(),
                last_food = ?starvation.last_food,
                "watchdog starved; stopping puppet"
            );
            puppet.inner.events.emit(PuppetEvent::Reset {
                reason: format!("no activity for {}s", starvation.timeout.as_secs()),
            });
            if let Err(err) = puppet.stop().await {
                warn!(error = %err, "stop after watchdog starvation failed");
            }
        });
    }

    fn disarm_watchdog(&self) {
        if let Some(cancel) = self.lock_supervisor().take() {
            cancel.cancel();
        }
    }

    fn lock_supervisor(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn read_through<T, F, Fut>(
    cache: &dyn PayloadCache<T>,
    entity: EntityKind,
    id: &str,
    load: F,
) -> Result<T, PuppetError>
where
    T: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, PuppetError>>,
{
    if let Some(payload) = cache.get(id) {
        trace!(%entity, id, "payload cache hit");
        return Ok(payload);
    }
    let payload = load().await?;
    cache.set(id, payload.clone());
    Ok(payload)
}
