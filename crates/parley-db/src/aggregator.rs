//! Conversation list per user, derived from the message log and presence.
//!
//! Lists are built by a full scan the first time a user asks, then patched by
//! every message event the stores emit instead of being rescanned. Patching
//! happens inside the write that produced the event, so a list read after a
//! write has returned always reflects it. Partner profiles and presence are
//! filled in at read time.
//!
//! Lock order is always database, then cache map.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use parley_types::conversation::{CachePatch, ConversationCache};
use parley_types::events::ChangeEvent;
use parley_types::models::{Conversation, Presence, User, UserId, normalize_email};
use parley_types::{ChatError, ChatResult};

use crate::Database;
use crate::queries;

/// How many users keep a materialized list before the least recently read is dropped.
pub const DEFAULT_CACHED_USERS: usize = 1024;

struct Slot {
    cache: ConversationCache,
    /// Partners whose display fields have not been loaded yet.
    unfilled: HashSet<UserId>,
    last_read: u64,
}

#[derive(Default)]
struct Caches {
    slots: HashMap<UserId, Slot>,
    reads: u64,
}

impl Caches {
    fn touch(&mut self, user: UserId) -> Option<&mut Slot> {
        self.reads += 1;
        let reads = self.reads;
        let slot = self.slots.get_mut(&user)?;
        slot.last_read = reads;
        Some(slot)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_read)
            .map(|(user, _)| *user);
        if let Some(user) = oldest {
            self.slots.remove(&user);
            debug!("Evicted conversation list of {}", user);
        }
    }
}

#[derive(Clone)]
pub struct ConversationAggregator {
    db: Arc<Database>,
    capacity: usize,
    caches: Arc<Mutex<Caches>>,
}

impl ConversationAggregator {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_capacity(db, DEFAULT_CACHED_USERS)
    }

    pub fn with_capacity(db: Arc<Database>, capacity: usize) -> Self {
        Self {
            db,
            capacity: capacity.max(1),
            caches: Arc::new(Mutex::new(Caches::default())),
        }
    }

    /// Distinct partners of `user` with last message, unread count and presence.
    pub fn list_conversations(&self, user: UserId) -> ChatResult<Vec<Conversation>> {
        let cached = self.lock_caches().touch(user).map(|slot| {
            (slot.cache.conversations(), slot.unfilled.iter().copied().collect::<Vec<_>>())
        });
        let (mut conversations, unfilled) = match cached {
            Some(hit) => hit,
            None => self.materialize(user)?,
        };

        let partners: Vec<UserId> = conversations.iter().map(|c| c.partner_id).collect();
        let (profiles, presence) = self.db.with_conn(|conn| {
            Ok((load_profiles(conn, &unfilled)?, load_presence(conn, &partners)?))
        })?;

        for conversation in &mut conversations {
            if let Some(profile) = profiles.get(&conversation.partner_id) {
                conversation.partner_display_name = profile.display_name.clone();
                conversation.partner_email = profile.email.clone();
            }
            conversation.is_online = presence
                .get(&conversation.partner_id)
                .is_some_and(|p| p.is_online);
        }

        if !unfilled.is_empty() {
            let mut caches = self.lock_caches();
            if let Some(slot) = caches.slots.get_mut(&user) {
                for partner in &unfilled {
                    match profiles.get(partner) {
                        Some(profile) => {
                            slot.cache.set_partner_profile(profile);
                        }
                        None => warn!("Conversation partner {} has no profile", partner),
                    }
                    slot.unfilled.remove(partner);
                }
            }
        }

        Ok(conversations)
    }

    /// Resolve a partner by email and return their conversation summary,
    /// zero-history if they never exchanged messages. Nothing is persisted.
    pub fn start_conversation(&self, user: UserId, partner_email: &str) -> ChatResult<Conversation> {
        let not_found = || ChatError::NotFound(format!("no user with email '{}'", partner_email.trim()));
        let Ok(email) = normalize_email(partner_email) else {
            return Err(not_found());
        };

        let (partner, is_online, rows) = self.db.with_conn(|conn| {
            let Some(row) = queries::user_by_email(conn, &email)? else {
                return Err(not_found());
            };
            let partner = row.to_user()?;
            if partner.id == user {
                return Err(ChatError::SelfConversation);
            }
            let partner_id = partner.id.to_string();
            let is_online = match queries::presence_by_user(conn, &partner_id)? {
                Some(row) => row.into_presence()?.is_online,
                None => false,
            };
            let rows = queries::conversation_messages(conn, &user.to_string(), &partner_id, None)?;
            Ok((partner, is_online, rows))
        })?;

        let mut pair = ConversationCache::new(user);
        for row in rows {
            pair.apply_message(&row.into_message()?);
        }
        pair.insert_started(Conversation::empty(&partner, is_online));
        pair.set_partner_profile(&partner);

        let mut conversation = pair
            .get(partner.id)
            .cloned()
            .ok_or_else(|| ChatError::Internal("started conversation vanished".into()))?;
        conversation.is_online = is_online;
        Ok(conversation)
    }

    /// Patch materialized lists with one store event. Called by the stores
    /// while the database lock is held, so it must not touch the database.
    pub fn apply(&self, event: &ChangeEvent) {
        let Some(message) = event.message() else {
            return;
        };
        let mut caches = self.lock_caches();
        for owner in [message.sender_id, message.receiver_id] {
            let Some(slot) = caches.slots.get_mut(&owner) else {
                continue;
            };
            if let CachePatch::Created(partner) = slot.cache.apply(event) {
                slot.unfilled.insert(partner);
            }
        }
    }

    /// Drop one user's materialized list.
    pub fn forget(&self, user: UserId) {
        self.lock_caches().slots.remove(&user);
    }

    pub fn is_materialized(&self, user: UserId) -> bool {
        self.lock_caches().slots.contains_key(&user)
    }

    /// Scan the log and cache the result. The database lock is held across
    /// scan and insert so no write can slip in between.
    fn materialize(&self, user: UserId) -> ChatResult<(Vec<Conversation>, Vec<UserId>)> {
        self.db.with_conn(|conn| {
            let mut caches = self.lock_caches();
            if let Some(slot) = caches.touch(user) {
                let unfilled = slot.unfilled.iter().copied().collect();
                return Ok((slot.cache.conversations(), unfilled));
            }

            let mut cache = ConversationCache::new(user);
            for row in queries::messages_for_user(conn, &user.to_string())? {
                cache.apply_message(&row.into_message()?);
            }
            let conversations = cache.conversations();
            let unfilled: HashSet<UserId> = cache.partners().collect();
            debug!("Materialized {} conversations for {}", cache.len(), user);

            if caches.slots.len() >= self.capacity {
                caches.evict_oldest();
            }
            let last_read = caches.reads;
            let partners = unfilled.iter().copied().collect();
            caches.slots.insert(user, Slot { cache, unfilled, last_read });
            Ok((conversations, partners))
        })
    }

    fn lock_caches(&self) -> MutexGuard<'_, Caches> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_profiles(conn: &rusqlite::Connection, ids: &[UserId]) -> ChatResult<HashMap<UserId, User>> {
    let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    queries::users_by_ids(conn, &ids)?
        .iter()
        .map(|row| row.to_user().map(|u| (u.id, u)))
        .collect()
}

fn load_presence(conn: &rusqlite::Connection, ids: &[UserId]) -> ChatResult<HashMap<UserId, Presence>> {
    let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    queries::presence_for_users(conn, &ids)?
        .into_iter()
        .map(|row| row.into_presence().map(|p| (p.user_id, p)))
        .collect()
}

#[cfg(test)]
mod tests {
    use parley_types::models::MessageStatus;

    use super::*;
    use crate::testing::{RecordingSink, stores};

    #[test]
    fn lists_partners_with_last_message_and_unread() {
        let (stores, _) = stores();
        let ada = stores.users.create("ada@example.com", "Ada", "x").unwrap().id;
        let bob = stores.users.create("bob@example.com", "Bob", "x").unwrap().id;
        let cy = stores.users.create("cy@example.com", "Cy", "x").unwrap().id;

        stores.messages.send(bob, ada, "hey ada").unwrap();
        let read_me = stores.messages.send(bob, ada, "you there?").unwrap();
        stores.messages.send(ada, cy, "lunch?").unwrap();
        stores.messages.send(ada, bob, "yes").unwrap();
        stores.messages.mark_read(read_me.id, ada).unwrap();
        stores.presence.set_online(bob, true).unwrap();

        let list = stores.conversations.list_conversations(ada).unwrap();
        assert_eq!(list.len(), 2);

        let bob_conv = &list[0];
        assert_eq!(bob_conv.partner_id, bob);
        assert_eq!(bob_conv.partner_display_name, "Bob");
        assert_eq!(bob_conv.partner_email, "bob@example.com");
        assert_eq!(bob_conv.last_message.as_deref(), Some("yes"));
        assert_eq!(bob_conv.unread_count, 1);
        assert!(bob_conv.is_online);

        let cy_conv = &list[1];
        assert_eq!(cy_conv.partner_id, cy);
        assert_eq!(cy_conv.unread_count, 0);
        assert!(!cy_conv.is_online);
    }

    #[test]
    fn unread_matches_the_message_log() {
        let (stores, _) = stores();
        let ada = stores.users.create("ada@example.com", "Ada", "x").unwrap().id;
        let bob = stores.users.create("bob@example.com", "Bob", "x").unwrap().id;

        for i in 0..5 {
            let m = stores.messages.send(bob, ada, &format!("msg {}", i)).unwrap();
            if i % 2 == 0 {
                stores.messages.mark_read(m.id, ada).unwrap();
            }
        }
        stores.messages.send(ada, bob, "mine").unwrap();

        let expected = stores
            .messages
            .list_conversation(ada, bob)
            .unwrap()
            .iter()
            .filter(|m| m.sender_id == bob && m.receiver_id == ada && m.status != MessageStatus::Read)
            .count();
        let list = stores.conversations.list_conversations(ada).unwrap();
        assert_eq!(list[0].unread_count, expected);
        assert_eq!(expected, 2);
    }

    #[test]
    fn writes_patch_materialized_lists_before_returning() {
        let (stores, _) = stores();
        let ada = stores.users.create("ada@example.com", "Ada", "x").unwrap().id;
        let bob = stores.users.create("bob@example.com", "Bob", "x").unwrap().id;
        let cy = stores.users.create("cy@example.com", "Cy", "x").unwrap().id;

        stores.messages.send(bob, ada, "first").unwrap();
        assert_eq!(stores.conversations.list_conversations(ada).unwrap().len(), 1);

        let m = stores.messages.send(cy, ada, "new partner").unwrap();
        stores.messages.send(bob, ada, "second").unwrap();
        stores.messages.mark_read(m.id, ada).unwrap();
        stores.presence.set_online(cy, true).unwrap();

        let patched = stores.conversations.list_conversations(ada).unwrap();
        stores.conversations.forget(ada);
        let rescanned = stores.conversations.list_conversations(ada).unwrap();
        assert_eq!(patched, rescanned);
        assert_eq!(patched[0].last_message.as_deref(), Some("second"));
        assert_eq!(patched[0].unread_count, 2);
        assert_eq!(patched[1].partner_display_name, "Cy");
        assert_eq!(patched[1].unread_count, 0);
        assert!(patched[1].is_online);
    }

    #[test]
    fn both_participants_see_a_new_partner() {
        let (stores, _) = stores();
        let ada = stores.users.create("ada@example.com", "Ada", "x").unwrap().id;
        let bob = stores.users.create("bob@example.com", "Bob", "x").unwrap().id;

        assert!(stores.conversations.list_conversations(ada).unwrap().is_empty());
        assert!(stores.conversations.list_conversations(bob).unwrap().is_empty());

        let m = stores.messages.send(ada, bob, "hi bob").unwrap();

        let ada_side = stores.conversations.list_conversations(ada).unwrap();
        let bob_side = stores.conversations.list_conversations(bob).unwrap();
        assert_eq!(ada_side[0].partner_display_name, "Bob");
        assert_eq!(ada_side[0].unread_count, 0);
        assert_eq!(bob_side[0].partner_email, "ada@example.com");
        assert_eq!(bob_side[0].unread_count, 1);

        stores.messages.mark_read(m.id, bob).unwrap();
        assert_eq!(stores.conversations.list_conversations(bob).unwrap()[0].unread_count, 0);
    }

    #[test]
    fn least_recently_read_list_is_evicted() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let stores = crate::Stores::new(db.clone(), Arc::new(RecordingSink::default()));
        let conversations = ConversationAggregator::with_capacity(db, 2);
        let ada = stores.users.create("ada@example.com", "Ada", "x").unwrap().id;
        let bob = stores.users.create("bob@example.com", "Bob", "x").unwrap().id;
        let cy = stores.users.create("cy@example.com", "Cy", "x").unwrap().id;

        conversations.list_conversations(ada).unwrap();
        conversations.list_conversations(bob).unwrap();
        conversations.list_conversations(ada).unwrap();
        conversations.list_conversations(cy).unwrap();

        assert!(conversations.is_materialized(ada));
        assert!(!conversations.is_materialized(bob));
        assert!(conversations.is_materialized(cy));
    }

    #[test]
    fn lists_stay_unmaterialized_until_read() {
        let (stores, _) = stores();
        let ada = stores.users.create("ada@example.com", "Ada", "x").unwrap().id;
        let bob = stores.users.create("bob@example.com", "Bob", "x").unwrap().id;
        stores.messages.send(bob, ada, "hi").unwrap();
        assert!(!stores.conversations.is_materialized(ada));
        assert!(!stores.conversations.is_materialized(bob));
    }

    #[test]
    fn start_conversation_resolves_by_email() {
        let (stores, _) = stores();
        let ada = stores.users.create("ada@example.com", "Ada", "x").unwrap().id;
        let bob = stores.users.create("bob@example.com", "Bob", "x").unwrap().id;

        let fresh = stores.conversations.start_conversation(ada, " BOB@example.com").unwrap();
        assert_eq!(fresh.partner_id, bob);
        assert_eq!(fresh.partner_display_name, "Bob");
        assert!(fresh.last_message.is_none());
        assert_eq!(fresh.unread_count, 0);

        // Not persisted: the list stays empty until a message is sent.
        assert!(stores.conversations.list_conversations(ada).unwrap().is_empty());

        stores.messages.send(bob, ada, "hello").unwrap();
        let existing = stores.conversations.start_conversation(ada, "bob@example.com").unwrap();
        assert_eq!(existing.last_message.as_deref(), Some("hello"));
        assert_eq!(existing.unread_count, 1);
    }

    #[test]
    fn start_conversation_errors() {
        let (stores, _) = stores();
        let ada = stores.users.create("ada@example.com", "Ada", "x").unwrap().id;

        assert!(matches!(
            stores.conversations.start_conversation(ada, "ghost@example.com"),
            Err(ChatError::NotFound(_))
        ));
        assert!(matches!(
            stores.conversations.start_conversation(ada, "ada@example.com"),
            Err(ChatError::SelfConversation)
        ));
    }
}
