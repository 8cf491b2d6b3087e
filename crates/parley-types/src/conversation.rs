//! Per-user conversation list maintained by folding messages into it.
//!
//! The same fold backs both the full rescan (every message of a user applied in
//! order) and incremental patching from live change events, so the two modes
//! cannot disagree. Applying the same message twice is a no-op.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::events::ChangeEvent;
use crate::models::{Conversation, Message, MessageId, User, UserId};

/// What a single `apply` did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePatch {
    Ignored,
    Updated(UserId),
    /// A partner seen for the first time; its profile fields are still blank.
    Created(UserId),
}

#[derive(Debug, Clone)]
struct Entry {
    conversation: Conversation,
    unread: BTreeSet<MessageId>,
    last_key: Option<(DateTime<Utc>, MessageId)>,
}

impl Entry {
    fn blank(partner_id: UserId) -> Self {
        Self {
            conversation: Conversation {
                partner_id,
                partner_display_name: String::new(),
                partner_email: String::new(),
                last_message: None,
                last_message_id: None,
                last_message_time: None,
                unread_count: 0,
                is_online: false,
            },
            unread: BTreeSet::new(),
            last_key: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationCache {
    owner: UserId,
    entries: HashMap<UserId, Entry>,
}

impl ConversationCache {
    pub fn new(owner: UserId) -> Self {
        Self {
            owner,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn apply(&mut self, event: &ChangeEvent) -> CachePatch {
        match event {
            ChangeEvent::MessageInserted { message } | ChangeEvent::MessageUpdated { message } => {
                self.apply_message(message)
            }
            ChangeEvent::PresenceChanged { presence } => {
                if self.set_online(presence.user_id, presence.is_online) {
                    CachePatch::Updated(presence.user_id)
                } else {
                    CachePatch::Ignored
                }
            }
            ChangeEvent::TypingChanged { .. } => CachePatch::Ignored,
        }
    }

    pub fn apply_message(&mut self, message: &Message) -> CachePatch {
        if message.sender_id == message.receiver_id {
            return CachePatch::Ignored;
        }
        let Some(partner) = message.partner_of(self.owner) else {
            return CachePatch::Ignored;
        };

        let created = !self.entries.contains_key(&partner);
        let entry = self
            .entries
            .entry(partner)
            .or_insert_with(|| Entry::blank(partner));

        // Latest by created_at, ties to the larger (later inserted) id.
        let key = message.order_key();
        if entry.last_key.is_none_or(|current| key >= current) {
            entry.last_key = Some(key);
            entry.conversation.last_message = Some(message.content.clone());
            entry.conversation.last_message_id = Some(message.id);
            entry.conversation.last_message_time = Some(message.created_at);
        }

        if message.is_unread_for(self.owner) {
            entry.unread.insert(message.id);
        } else {
            entry.unread.remove(&message.id);
        }
        entry.conversation.unread_count = entry.unread.len();

        if created {
            CachePatch::Created(partner)
        } else {
            CachePatch::Updated(partner)
        }
    }

    /// Fill in the display fields of a partner. Returns false if the partner is unknown.
    pub fn set_partner_profile(&mut self, partner: &User) -> bool {
        match self.entries.get_mut(&partner.id) {
            Some(entry) => {
                entry.conversation.partner_display_name = partner.display_name.clone();
                entry.conversation.partner_email = partner.email.clone();
                true
            }
            None => false,
        }
    }

    pub fn set_online(&mut self, partner: UserId, is_online: bool) -> bool {
        match self.entries.get_mut(&partner) {
            Some(entry) if entry.conversation.is_online != is_online => {
                entry.conversation.is_online = is_online;
                true
            }
            _ => false,
        }
    }

    /// Add a zero-history conversation unless the partner is already present.
    pub fn insert_started(&mut self, conversation: Conversation) -> bool {
        if conversation.partner_id == self.owner || self.entries.contains_key(&conversation.partner_id) {
            return false;
        }
        let mut entry = Entry::blank(conversation.partner_id);
        entry.conversation = Conversation {
            last_message: None,
            last_message_id: None,
            last_message_time: None,
            unread_count: 0,
            ..conversation
        };
        self.entries.insert(entry.conversation.partner_id, entry);
        true
    }

    pub fn get(&self, partner: UserId) -> Option<&Conversation> {
        self.entries.get(&partner).map(|e| &e.conversation)
    }

    pub fn partners(&self) -> impl Iterator<Item = UserId> + '_ {
        self.entries.keys().copied()
    }

    /// Conversations without history first, then most recent activity first.
    pub fn conversations(&self) -> Vec<Conversation> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| (e.last_key.is_some(), Reverse(e.last_key), e.conversation.partner_id));
        entries.into_iter().map(|e| e.conversation.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    use super::*;
    use crate::models::{MessageStatus, Presence};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: MessageId, from: UserId, to: UserId, secs: i64, status: MessageStatus) -> Message {
        Message {
            id,
            sender_id: from,
            receiver_id: to,
            content: format!("m{}", id),
            status,
            created_at: at(secs),
            read_at: None,
        }
    }

    #[test]
    fn groups_by_partner_and_keeps_latest_message() {
        let (me, bob, eve) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut cache = ConversationCache::new(me);

        assert_eq!(cache.apply_message(&msg(1, me, bob, 0, MessageStatus::Sent)), CachePatch::Created(bob));
        assert_eq!(cache.apply_message(&msg(2, bob, me, 5, MessageStatus::Sent)), CachePatch::Updated(bob));
        cache.apply_message(&msg(3, eve, me, 3, MessageStatus::Sent));
        // Out-of-order arrival must not regress last_message.
        cache.apply_message(&msg(4, me, bob, 1, MessageStatus::Sent));

        let bob_conv = cache.get(bob).unwrap();
        assert_eq!(bob_conv.last_message.as_deref(), Some("m2"));
        assert_eq!(bob_conv.last_message_time, Some(at(5)));

        let order: Vec<UserId> = cache.conversations().iter().map(|c| c.partner_id).collect();
        assert_eq!(order, vec![bob, eve]);
    }

    #[test]
    fn created_at_ties_go_to_the_larger_id() {
        let (me, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut cache = ConversationCache::new(me);
        cache.apply_message(&msg(9, bob, me, 10, MessageStatus::Sent));
        cache.apply_message(&msg(8, me, bob, 10, MessageStatus::Sent));
        assert_eq!(cache.get(bob).unwrap().last_message_id, Some(9));
    }

    #[test]
    fn unread_counts_received_unread_messages_and_is_idempotent() {
        let (me, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let mut cache = ConversationCache::new(me);

        let first = msg(1, bob, me, 0, MessageStatus::Sent);
        cache.apply_message(&first);
        cache.apply_message(&first);
        cache.apply_message(&msg(2, bob, me, 1, MessageStatus::Delivered));
        cache.apply_message(&msg(3, me, bob, 2, MessageStatus::Sent));
        assert_eq!(cache.get(bob).unwrap().unread_count, 2);

        let mut read = first.clone();
        read.status = MessageStatus::Read;
        read.read_at = Some(at(3));
        cache.apply(&ChangeEvent::MessageUpdated { message: read.clone() });
        cache.apply(&ChangeEvent::MessageUpdated { message: read });
        assert_eq!(cache.get(bob).unwrap().unread_count, 1);
    }

    #[test]
    fn ignores_messages_not_involving_the_owner() {
        let (me, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut cache = ConversationCache::new(me);
        assert_eq!(cache.apply_message(&msg(1, a, b, 0, MessageStatus::Sent)), CachePatch::Ignored);
        assert!(cache.is_empty());
    }

    #[test]
    fn presence_patches_only_known_partners() {
        let (me, bob, stranger) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut cache = ConversationCache::new(me);
        cache.apply_message(&msg(1, me, bob, 0, MessageStatus::Sent));

        let online = |user_id| ChangeEvent::PresenceChanged {
            presence: Presence { user_id, is_online: true, last_seen: at(1) },
        };
        assert_eq!(cache.apply(&online(bob)), CachePatch::Updated(bob));
        assert_eq!(cache.apply(&online(bob)), CachePatch::Ignored);
        assert_eq!(cache.apply(&online(stranger)), CachePatch::Ignored);
        assert!(cache.get(bob).unwrap().is_online);
    }

    #[test]
    fn started_conversations_sort_first_and_are_not_duplicated() {
        let (me, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut cache = ConversationCache::new(me);
        cache.apply_message(&msg(1, bob, me, 0, MessageStatus::Sent));

        let carol_user = User {
            id: carol,
            email: "carol@example.com".into(),
            display_name: "Carol".into(),
            created_at: at(0) - Duration::days(1),
        };
        assert!(cache.insert_started(Conversation::empty(&carol_user, false)));
        assert!(!cache.insert_started(Conversation::empty(&carol_user, false)));

        let convs = cache.conversations();
        assert_eq!(convs[0].partner_id, carol);
        assert_eq!(convs[0].partner_display_name, "Carol");
        assert_eq!(convs[1].partner_id, bob);
    }
}
