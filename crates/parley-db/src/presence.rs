use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info};

use parley_types::events::{ChangeEvent, ChangeSink};
use parley_types::models::{Presence, UserId};
use parley_types::ChatResult;

use crate::Database;
use crate::clock::format_ts;
use crate::queries;

/// Per-user online state with last-seen timestamp.
#[derive(Clone)]
pub struct PresenceTracker {
    db: Arc<Database>,
    sink: Arc<dyn ChangeSink>,
}

impl PresenceTracker {
    pub fn new(db: Arc<Database>, sink: Arc<dyn ChangeSink>) -> Self {
        Self { db, sink }
    }

    /// Upsert presence with `last_seen = now`. Emits on every call.
    pub fn set_online(&self, user: UserId, is_online: bool) -> ChatResult<Presence> {
        let presence = self.db.with_write(|conn, now| {
            queries::upsert_presence(conn, &user.to_string(), is_online, &format_ts(now))?;
            let presence = Presence {
                user_id: user,
                is_online,
                last_seen: now,
            };
            self.sink.publish(ChangeEvent::PresenceChanged {
                presence: presence.clone(),
            });
            Ok(presence)
        })?;

        debug!("{} is now {}", user, if is_online { "online" } else { "offline" });
        Ok(presence)
    }

    /// Refresh `last_seen` of an online user without emitting.
    /// Returns false if the user is not currently online.
    pub fn heartbeat(&self, user: UserId) -> ChatResult<bool> {
        let touched = self
            .db
            .with_write(|conn, now| queries::touch_presence(conn, &user.to_string(), &format_ts(now)))?;
        Ok(touched > 0)
    }

    pub fn get(&self, user: UserId) -> ChatResult<Option<Presence>> {
        self.db
            .with_conn(|conn| queries::presence_by_user(conn, &user.to_string()))?
            .map(|row| row.into_presence())
            .transpose()
    }

    pub fn get_many(&self, users: &[UserId]) -> ChatResult<HashMap<UserId, Presence>> {
        let ids: Vec<String> = users.iter().map(|id| id.to_string()).collect();
        let rows = self.db.with_conn(|conn| queries::presence_for_users(conn, &ids))?;
        rows.into_iter()
            .map(|row| row.into_presence().map(|p| (p.user_id, p)))
            .collect()
    }

    /// Mark offline every online user not heard from within `window`.
    /// `last_seen` keeps the time of the last heartbeat.
    pub fn expire_stale(&self, window: Duration) -> ChatResult<Vec<Presence>> {
        let expired = self.db.with_write(|conn, now| {
            let cutoff = format_ts(now - window);
            let mut expired = Vec::new();
            for user_id in queries::stale_online_users(conn, &cutoff)? {
                queries::set_presence_offline(conn, &user_id)?;
                if let Some(row) = queries::presence_by_user(conn, &user_id)? {
                    let presence = row.into_presence()?;
                    self.sink.publish(ChangeEvent::PresenceChanged {
                        presence: presence.clone(),
                    });
                    expired.push(presence);
                }
            }
            Ok(expired)
        })?;

        if !expired.is_empty() {
            info!("Presence: expired {} silent users", expired.len());
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stores;

    #[test]
    fn set_online_upserts_and_emits() {
        let (stores, sink) = stores();
        let ada = stores.users.create("ada@example.com", "Ada", "x").unwrap().id;

        assert!(stores.presence.get(ada).unwrap().is_none());

        let online = stores.presence.set_online(ada, true).unwrap();
        let offline = stores.presence.set_online(ada, false).unwrap();
        assert!(offline.last_seen > online.last_seen);
        assert_eq!(stores.presence.get(ada).unwrap(), Some(offline.clone()));

        assert_eq!(
            sink.take(),
            vec![
                ChangeEvent::PresenceChanged { presence: online },
                ChangeEvent::PresenceChanged { presence: offline },
            ]
        );
    }

    #[test]
    fn heartbeat_only_refreshes_online_users() {
        let (stores, sink) = stores();
        let ada = stores.users.create("ada@example.com", "Ada", "x").unwrap().id;

        assert!(!stores.presence.heartbeat(ada).unwrap());
        let first = stores.presence.set_online(ada, true).unwrap();
        sink.take();

        assert!(stores.presence.heartbeat(ada).unwrap());
        let refreshed = stores.presence.get(ada).unwrap().unwrap();
        assert!(refreshed.is_online);
        assert!(refreshed.last_seen > first.last_seen);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn expire_stale_flips_silent_users_offline() {
        let (stores, sink) = stores();
        let ada = stores.users.create("ada@example.com", "Ada", "x").unwrap().id;
        let bob = stores.users.create("bob@example.com", "Bob", "x").unwrap().id;
        stores.presence.set_online(ada, true).unwrap();
        stores.presence.set_online(bob, false).unwrap();
        sink.take();

        // Nobody is older than an hour.
        assert!(stores.presence.expire_stale(Duration::hours(1)).unwrap().is_empty());

        // A negative window makes every online user stale.
        let expired = stores.presence.expire_stale(Duration::seconds(-1)).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].user_id, ada);
        assert!(!expired[0].is_online);
        assert_eq!(sink.take().len(), 1);

        let all = stores.presence.get_many(&[ada, bob]).unwrap();
        assert!(all.values().all(|p| !p.is_online));
    }
}
