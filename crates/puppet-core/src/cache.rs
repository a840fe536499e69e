use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use crate::types::{
    ContactPayload, FriendshipPayload, MessagePayload, RoomMemberPayload, RoomPayload,
};

/// Side store for normalized payloads keyed by entity id.
///
/// The puppet reads through and writes through it but never treats it as the
/// source of truth. Eviction is left to the implementation.
pub trait PayloadCache<T>: Send + Sync {
    fn get(&self, id: &str) -> Option<T>;

    /// Replace the record for `id`. Last writer wins.
    fn set(&self, id: &str, payload: T);

    fn has(&self, id: &str) -> bool;

    /// Drop the record for `id`, returning whether one was present.
    fn delete(&self, id: &str) -> bool;
}

/// Unbounded map-backed cache.
#[derive(Debug)]
pub struct InMemoryPayloadCache<T> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T> Default for InMemoryPayloadCache<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> InMemoryPayloadCache<T> {
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Records are replaced whole under the write lock, so a poisoned lock still
// holds only complete entries.
impl<T: Clone + Send + Sync> PayloadCache<T> for InMemoryPayloadCache<T> {
    fn get(&self, id: &str) -> Option<T> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn set(&self, id: &str, payload: T) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_owned(), payload);
    }

    fn has(&self, id: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    fn delete(&self, id: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }
}

/// One cache per entity kind, shared by all clones of a puppet.
#[derive(Clone)]
pub struct PayloadCaches {
    pub contact: Arc<dyn PayloadCache<ContactPayload>>,
    pub room: Arc<dyn PayloadCache<RoomPayload>>,
    pub room_member: Arc<dyn PayloadCache<RoomMemberPayload>>,
    pub message: Arc<dyn PayloadCache<MessagePayload>>,
    pub friendship: Arc<dyn PayloadCache<FriendshipPayload>>,
}

impl Default for PayloadCaches {
    fn default() -> Self {
        Self {
            contact: Arc::new(InMemoryPayloadCache::default()),
            room: Arc::new(InMemoryPayloadCache::default()),
            room_member: Arc::new(InMemoryPayloadCache::default()),
            message: Arc::new(InMemoryPayloadCache::default()),
            friendship: Arc::new(InMemoryPayloadCache::default()),
        }
    }
}

/// Cache key for a member record scoped to its room.
///
/// The room id is length-prefixed so ids containing the separator cannot
/// collide with another (room, contact) pair.
pub fn room_member_key(room_id: &str, contact_id: &str) -> String {
    format!("{}:{room_id}/{contact_id}", room_id.len())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::types::{ContactGender, ContactType};

    fn contact(id: &str, name: &str) -> ContactPayload {
        ContactPayload {
            id: id.to_owned(),
            gender: ContactGender::Unknown,
            kind: ContactType::Personal,
            name: name.to_owned(),
            alias: None,
            avatar: None,
            friend: None,
        }
    }

    #[test]
    fn set_get_has_delete() {
        let cache = InMemoryPayloadCache::default();
        assert!(!cache.has("c1"));
        assert_eq!(cache.get("c1"), None);

        cache.set("c1", contact("c1", "alice"));
        assert!(cache.has("c1"));
        assert_eq!(cache.get("c1").map(|c| c.name), Some("alice".to_owned()));

        assert!(cache.delete("c1"));
        assert!(!cache.delete("c1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn last_writer_wins_per_id() {
        let cache = InMemoryPayloadCache::default();
        cache.set("c1", contact("c1", "alice"));
        cache.set("c1", contact("c1", "alicia"));
        assert_eq!(cache.get("c1").map(|c| c.name), Some("alicia".to_owned()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_writers_never_expose_torn_records() {
        let cache = Arc::new(InMemoryPayloadCache::default());
        let writers = (0..4)
            .map(|n| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let name = format!("writer-{n}");
                        cache.set("shared", contact(&name, &name));
                    }
                })
            })
            .collect::<Vec<_>>();

        for _ in 0..200 {
            if let Some(record) = cache.get("shared") {
                assert_eq!(record.id, record.name);
            }
        }
        for writer in writers {
            writer.join().expect("writer thread");
        }
    }

    #[test]
    fn member_keys_are_scoped_by_room() {
        assert_ne!(room_member_key("r1", "c1"), room_member_key("r2", "c1"));
    }

    #[test]
    fn member_keys_survive_separators_in_ids() {
        assert_ne!(room_member_key("a/b", "c"), room_member_key("a", "b/c"));
        assert_ne!(room_member_key("1:a", "b"), room_member_key("1", "a/b"));

        let cache = InMemoryPayloadCache::default();
        cache.set(&room_member_key("a/b", "c"), contact("c", "in a/b"));
        assert!(!cache.has(&room_member_key("a", "b/c")));
    }
}
