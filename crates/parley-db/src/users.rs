use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use parley_types::models::{User, UserId, normalize_email};
use parley_types::{ChatError, ChatResult};

use crate::Database;
use crate::clock::format_ts;
use crate::models::UserRow;
use crate::queries;

/// Minimal profile storage behind identity lookups.
#[derive(Clone)]
pub struct UserDirectory {
    db: Arc<Database>,
}

impl UserDirectory {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a user. The email must be unused; `password_hash` is stored as given.
    pub fn create(&self, email: &str, display_name: &str, password_hash: &str) -> ChatResult<User> {
        let email = normalize_email(email)?;
        let display_name = display_name.trim();
        if display_name.is_empty() || display_name.chars().count() > 64 {
            return Err(ChatError::Validation("display name must be 1-64 characters".into()));
        }

        let user = self.db.with_write(|conn, now| {
            if queries::user_by_email(conn, &email)?.is_some() {
                return Err(ChatError::Conflict(format!("email {} is already registered", email)));
            }
            let user = User {
                id: Uuid::new_v4(),
                email: email.clone(),
                display_name: display_name.to_string(),
                created_at: now,
            };
            queries::insert_user(
                conn,
                &user.id.to_string(),
                &user.email,
                &user.display_name,
                password_hash,
                &format_ts(now),
            )?;
            Ok(user)
        })?;

        info!("Registered user {} ({})", user.email, user.id);
        Ok(user)
    }

    pub fn find_by_id(&self, id: UserId) -> ChatResult<Option<User>> {
        self.db
            .with_conn(|conn| queries::user_by_id(conn, &id.to_string()))?
            .map(|row| row.to_user())
            .transpose()
    }

    /// Unique external-facing lookup. Malformed emails simply match nobody.
    pub fn find_by_email(&self, email: &str) -> ChatResult<Option<User>> {
        match self.credentials_by_email(email)? {
            Some(row) => row.to_user().map(Some),
            None => Ok(None),
        }
    }

    /// Raw row including the password hash, for login.
    pub fn credentials_by_email(&self, email: &str) -> ChatResult<Option<UserRow>> {
        let Ok(email) = normalize_email(email) else {
            return Ok(None);
        };
        self.db.with_conn(|conn| queries::user_by_email(conn, &email))
    }

    pub fn find_many(&self, ids: &[UserId]) -> ChatResult<HashMap<UserId, User>> {
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let rows = self.db.with_conn(|conn| queries::users_by_ids(conn, &ids))?;
        rows.iter()
            .map(|row| row.to_user().map(|u| (u.id, u)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stores;

    #[test]
    fn email_lookup_is_case_insensitive() {
        let (stores, _) = stores();
        let ada = stores.users.create("Ada@Example.com", "Ada", "hash").unwrap();
        assert_eq!(ada.email, "ada@example.com");

        let found = stores.users.find_by_email("  ADA@example.COM ").unwrap().unwrap();
        assert_eq!(found, ada);
        assert!(stores.users.find_by_email("nobody@example.com").unwrap().is_none());
        assert!(stores.users.find_by_email("not-an-email").unwrap().is_none());
    }

    #[test]
    fn duplicate_email_conflicts() {
        let (stores, _) = stores();
        stores.users.create("ada@example.com", "Ada", "hash").unwrap();
        let err = stores.users.create("ADA@example.com", "Other Ada", "hash").unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)));
    }

    #[test]
    fn display_name_is_required() {
        let (stores, _) = stores();
        let err = stores.users.create("ada@example.com", "   ", "hash").unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[test]
    fn find_many_returns_known_ids_only() {
        let (stores, _) = stores();
        let ada = stores.users.create("ada@example.com", "Ada", "hash").unwrap();
        let found = stores.users.find_many(&[ada.id, Uuid::new_v4()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&ada.id].display_name, "Ada");
    }
}
