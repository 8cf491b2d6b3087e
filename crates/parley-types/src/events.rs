use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::models::{Message, Presence, TypingIndicator, UserId};

/// A mutation emitted by one of the stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ChangeEvent {
    MessageInserted { message: Message },
    MessageUpdated { message: Message },
    TypingChanged { indicator: TypingIndicator },
    PresenceChanged { presence: Presence },
}

/// Which store produced an event. Ordering is only guaranteed within one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Messages,
    Typing,
    Presence,
}

impl ChangeEvent {
    pub fn source(&self) -> EventSource {
        match self {
            Self::MessageInserted { .. } | Self::MessageUpdated { .. } => EventSource::Messages,
            Self::TypingChanged { .. } => EventSource::Typing,
            Self::PresenceChanged { .. } => EventSource::Presence,
        }
    }

    pub fn message(&self) -> Option<&Message> {
        match self {
            Self::MessageInserted { message } | Self::MessageUpdated { message } => Some(message),
            _ => None,
        }
    }

    /// Events that no store could legally have produced.
    pub fn malformed_reason(&self) -> Option<&'static str> {
        match self {
            Self::MessageInserted { message } | Self::MessageUpdated { message } => {
                if message.sender_id == message.receiver_id {
                    Some("message sender equals receiver")
                } else if message.content.trim().is_empty() {
                    Some("message content is empty")
                } else {
                    None
                }
            }
            Self::TypingChanged { indicator } => {
                (indicator.user_id == indicator.conversation_partner_id)
                    .then_some("typing indicator targets its own user")
            }
            Self::PresenceChanged { .. } => None,
        }
    }
}

/// Anything that consumes store mutations.
///
/// Stores call `publish` while holding their write lock, so implementations
/// must not block and must not call back into a store.
pub trait ChangeSink: Send + Sync {
    fn publish(&self, event: ChangeEvent);
}

/// Interest a live connection registers with the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubscriptionFilter {
    /// Message inserts/updates addressed to `user_id`.
    Incoming { user_id: UserId },
    /// Message inserts/updates sent by `user_id`.
    Outgoing { user_id: UserId },
    /// Every message between `user_id` and `partner_id`, both directions.
    Conversation { user_id: UserId, partner_id: UserId },
    /// `partner_id` typing to `user_id`.
    Typing { user_id: UserId, partner_id: UserId },
    /// Presence changes of every user.
    Presence,
}

impl SubscriptionFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match (self, event) {
            (Self::Incoming { user_id }, ChangeEvent::MessageInserted { message })
            | (Self::Incoming { user_id }, ChangeEvent::MessageUpdated { message }) => {
                message.receiver_id == *user_id
            }
            (Self::Outgoing { user_id }, ChangeEvent::MessageInserted { message })
            | (Self::Outgoing { user_id }, ChangeEvent::MessageUpdated { message }) => {
                message.sender_id == *user_id
            }
            (Self::Conversation { user_id, partner_id }, ChangeEvent::MessageInserted { message })
            | (Self::Conversation { user_id, partner_id }, ChangeEvent::MessageUpdated { message }) => {
                message.is_between(*user_id, *partner_id)
            }
            (Self::Typing { user_id, partner_id }, ChangeEvent::TypingChanged { indicator }) => {
                indicator.user_id == *partner_id && indicator.conversation_partner_id == *user_id
            }
            (Self::Presence, ChangeEvent::PresenceChanged { .. }) => true,
            _ => false,
        }
    }

    /// Whether a connection authenticated as `user` may hold this filter.
    pub fn authorized_for(&self, user: UserId) -> bool {
        match self {
            Self::Incoming { user_id }
            | Self::Outgoing { user_id }
            | Self::Conversation { user_id, .. }
            | Self::Typing { user_id, .. } => *user_id == user,
            Self::Presence => true,
        }
    }

    /// The conversation partner this filter is scoped to, if any.
    pub fn partner(&self) -> Option<UserId> {
        match self {
            Self::Conversation { partner_id, .. } | Self::Typing { partner_id, .. } => Some(*partner_id),
            _ => None,
        }
    }
}

/// Opaque handle returned by the broker for one active subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Commands sent FROM client TO server over the gateway WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate a connection that did not pass a token on upgrade
    Identify { token: String },

    /// Register an interest; answered with `Subscribed`
    Subscribe { filter: SubscriptionFilter },

    /// Drop a subscription; unknown handles are ignored
    Unsubscribe { subscription: SubscriptionHandle },

    /// Upsert the caller's typing state towards a partner
    SetTyping { partner_id: UserId, is_typing: bool },
}

/// Events sent FROM server TO client over the gateway WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Connection authenticated and registered
    Ready { user_id: UserId, email: String },

    Subscribed {
        subscription: SubscriptionHandle,
        filter: SubscriptionFilter,
    },

    Unsubscribed { subscription: SubscriptionHandle },

    /// A store event matched one of this connection's subscriptions
    Change {
        subscription: SubscriptionHandle,
        event: ChangeEvent,
    },

    /// A command failed
    Error { kind: ErrorKind, message: String },
}
