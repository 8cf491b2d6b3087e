pub mod aggregator;
pub mod clock;
pub mod migrations;
pub mod models;
pub mod presence;
pub mod queries;
pub mod store;
pub mod typing;
pub mod users;

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode};
use tracing::{error, info};

use parley_types::events::{ChangeEvent, ChangeSink};
use parley_types::{ChatError, ChatResult};

use crate::aggregator::ConversationAggregator;
use crate::clock::MonotonicClock;
use crate::presence::PresenceTracker;
use crate::store::MessageStore;
use crate::typing::TypingTracker;
use crate::users::UserDirectory;

/// Single SQLite connection guarded by a mutex. Every write, and the change
/// event it emits, happens under this lock, which is what gives each store a
/// total emission order.
pub struct Database {
    conn: Mutex<Connection>,
    clock: MonotonicClock,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        migrations::run(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            clock: MonotonicClock::new(),
        }
    }

    pub fn with_conn<F, T>(&self, f: F) -> ChatResult<T>
    where
        F: FnOnce(&Connection) -> ChatResult<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ChatError::Internal(format!("DB lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Like `with_conn`, but also hands out a write timestamp that is never
    /// earlier than any previously issued one.
    pub fn with_write<F, T>(&self, f: F) -> ChatResult<T>
    where
        F: FnOnce(&Connection, DateTime<Utc>) -> ChatResult<T>,
    {
        self.with_conn(|conn| f(conn, self.clock.tick()))
    }
}

/// Every store over one database, wired to the same change sink.
///
/// Events reach the conversation aggregator first, inside the emitting write,
/// and are then handed to the outer sink.
#[derive(Clone)]
pub struct Stores {
    pub messages: MessageStore,
    pub presence: PresenceTracker,
    pub typing: TypingTracker,
    pub users: UserDirectory,
    pub conversations: ConversationAggregator,
}

impl Stores {
    pub fn new(db: Arc<Database>, sink: Arc<dyn ChangeSink>) -> Self {
        let conversations = ConversationAggregator::new(db.clone());
        let sink: Arc<dyn ChangeSink> = Arc::new(PatchingSink {
            conversations: conversations.clone(),
            next: sink,
        });
        Self {
            messages: MessageStore::new(db.clone(), sink.clone()),
            presence: PresenceTracker::new(db.clone(), sink.clone()),
            typing: TypingTracker::new(db.clone(), sink),
            users: UserDirectory::new(db),
            conversations,
        }
    }
}

struct PatchingSink {
    conversations: ConversationAggregator,
    next: Arc<dyn ChangeSink>,
}

impl ChangeSink for PatchingSink {
    fn publish(&self, event: ChangeEvent) {
        self.conversations.apply(&event);
        self.next.publish(event);
    }
}

/// Conversion of driver errors into the chat taxonomy.
pub(crate) trait SqlResultExt<T> {
    fn db(self) -> ChatResult<T>;
    fn optional(self) -> ChatResult<Option<T>>;
}

impl<T> SqlResultExt<T> for std::result::Result<T, rusqlite::Error> {
    fn db(self) -> ChatResult<T> {
        self.map_err(map_sqlite_error)
    }

    fn optional(self) -> ChatResult<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(map_sqlite_error(e)),
        }
    }
}

pub(crate) fn map_sqlite_error(e: rusqlite::Error) -> ChatError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            ChatError::Transient(e.to_string())
        }
        Some(ErrorCode::ConstraintViolation) => ChatError::Conflict(e.to_string()),
        _ => {
            error!("SQLite error: {}", e);
            ChatError::Internal(e.to_string())
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use parley_types::events::{ChangeEvent, ChangeSink};

    /// Sink that remembers every event in emission order.
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<ChangeEvent>>,
    }

    impl RecordingSink {
        pub fn take(&self) -> Vec<ChangeEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl ChangeSink for RecordingSink {
        fn publish(&self, event: ChangeEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    pub fn stores() -> (super::Stores, Arc<RecordingSink>) {
        let db = Arc::new(super::Database::open_in_memory().unwrap());
        let sink = Arc::new(RecordingSink::default());
        (super::Stores::new(db, sink.clone()), sink)
    }
}
