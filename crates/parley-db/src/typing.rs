use std::sync::Arc;

use tracing::{debug, warn};

use parley_types::events::{ChangeEvent, ChangeSink};
use parley_types::models::{TypingIndicator, UserId};
use parley_types::{ChatError, ChatResult};

use crate::Database;
use crate::clock::format_ts;
use crate::queries;

/// Ephemeral typing state per ordered (user, partner) pair. Last write wins.
///
/// There is no TTL here: clients clear their own state after an idle window,
/// and the gateway clears whatever a user left behind when they disconnect.
#[derive(Clone)]
pub struct TypingTracker {
    db: Arc<Database>,
    sink: Arc<dyn ChangeSink>,
}

impl TypingTracker {
    pub fn new(db: Arc<Database>, sink: Arc<dyn ChangeSink>) -> Self {
        Self { db, sink }
    }

    pub fn set_typing(&self, user: UserId, partner: UserId, is_typing: bool) -> ChatResult<TypingIndicator> {
        if user == partner {
            return Err(ChatError::Validation("cannot type to yourself".into()));
        }
        self.db.with_write(|conn, now| {
            queries::upsert_typing(conn, &user.to_string(), &partner.to_string(), is_typing, &format_ts(now))?;
            let indicator = TypingIndicator {
                user_id: user,
                conversation_partner_id: partner,
                is_typing,
            };
            self.sink.publish(ChangeEvent::TypingChanged {
                indicator: indicator.clone(),
            });
            Ok(indicator)
        })
    }

    pub fn get(&self, user: UserId, partner: UserId) -> ChatResult<Option<TypingIndicator>> {
        self.db
            .with_conn(|conn| queries::typing_row(conn, &user.to_string(), &partner.to_string()))?
            .map(|row| row.into_indicator())
            .transpose()
    }

    /// Clear every pair where `user` is still marked typing. Returns the cleared indicators.
    pub fn clear_all_for(&self, user: UserId) -> ChatResult<Vec<TypingIndicator>> {
        let cleared = self.db.with_write(|conn, now| {
            let user_key = user.to_string();
            let mut cleared = Vec::new();
            for partner in queries::active_typing_partners(conn, &user_key)? {
                let Ok(partner_id) = partner.parse::<UserId>() else {
                    warn!("Corrupt typing partner '{}' for {}", partner, user);
                    continue;
                };
                queries::upsert_typing(conn, &user_key, &partner, false, &format_ts(now))?;
                let indicator = TypingIndicator {
                    user_id: user,
                    conversation_partner_id: partner_id,
                    is_typing: false,
                };
                self.sink.publish(ChangeEvent::TypingChanged {
                    indicator: indicator.clone(),
                });
                cleared.push(indicator);
            }
            Ok(cleared)
        })?;

        if !cleared.is_empty() {
            debug!("Cleared {} stale typing indicators of {}", cleared.len(), user);
        }
        Ok(cleared)
    }
}
