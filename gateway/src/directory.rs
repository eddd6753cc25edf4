//! User directory and search index.
//!
//! The gateway consumes user accounts through two interfaces:
//!
//! - [`UserDirectory`] - lookup, sign-up, profile updates and credential
//!   checks
//! - [`SearchIndex`] - prefix search over user, first and last names
//!
//! [`MemoryDirectory`] implements both in process. It has no persistence;
//! accounts live as long as the gateway does.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use email_address::EmailAddress;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::UserSnapshot;

/// Base URL for Gravatar photos.
pub const GRAVATAR_BASE_URL: &str = "https://www.gravatar.com/avatar/";

/// Minimum password length accepted at sign-up.
pub const MIN_PASSWORD_LENGTH: usize = 6;

/// Errors returned by a user directory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("user not found")]
    NotFound,

    /// The email address or user name is already taken.
    #[error("{0} is already in use")]
    Duplicate(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("{0}")]
    Validation(String),

    /// Password hashing failed.
    #[error("password hashing failed: {0}")]
    Hash(String),
}

/// A user account.
///
/// The email address and password hash are never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    #[serde(skip)]
    pub email: String,
    #[serde(skip)]
    pub pass_hash: String,
    pub user_name: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(rename = "photoURL")]
    pub photo_url: String,
}

impl User {
    /// Returns the identity carried in sessions and the `X-User` header.
    pub fn snapshot(&self) -> UserSnapshot {
        UserSnapshot {
            id: self.id,
            user_name: self.user_name.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            photo_url: self.photo_url.clone(),
        }
    }

    /// Returns "First Last", without the space if either part is empty.
    pub fn full_name(&self) -> String {
        if self.first_name.is_empty() || self.last_name.is_empty() {
            format!("{}{}", self.first_name, self.last_name)
        } else {
            format!("{} {}", self.first_name, self.last_name)
        }
    }
}

/// Sign-up request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub password_conf: String,
    pub user_name: String,
    pub first_name: String,
    pub last_name: String,
}

impl NewUser {
    /// Checks the sign-up rules.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Validation`] describing the first rule
    /// that fails.
    pub fn validate(&self) -> Result<(), DirectoryError> {
        if !EmailAddress::is_valid(self.email.trim()) {
            return Err(DirectoryError::Validation(
                "invalid email address".to_string(),
            ));
        }
        if self.password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(DirectoryError::Validation(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters"
            )));
        }
        if self.password != self.password_conf {
            return Err(DirectoryError::Validation(
                "password and confirmation must match".to_string(),
            ));
        }
        if self.user_name.is_empty() || self.user_name.contains(char::is_whitespace) {
            return Err(DirectoryError::Validation(
                "user name must be non-empty and contain no spaces".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sign-in request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Profile changes a user may make.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Updates {
    pub first_name: String,
    pub last_name: String,
}

impl Updates {
    /// # Errors
    ///
    /// Returns [`DirectoryError::Validation`] if both names are empty.
    pub fn validate(&self) -> Result<(), DirectoryError> {
        if self.first_name.is_empty() && self.last_name.is_empty() {
            return Err(DirectoryError::Validation(
                "first and last name cannot both be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Returns the Gravatar URL for `email`.
pub fn gravatar_url(email: &str) -> String {
    let normalized = email.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("{GRAVATAR_BASE_URL}{hex}")
}

/// Account storage consumed by the session and user endpoints.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<User, DirectoryError>;

    async fn get_by_email(&self, email: &str) -> Result<User, DirectoryError>;

    /// Validates `new_user`, hashes its password and stores it with a fresh
    /// ID.
    async fn insert(&self, new_user: NewUser) -> Result<User, DirectoryError>;

    /// Applies `updates` to the user with `id`.
    async fn update(&self, id: i64, updates: &Updates) -> Result<User, DirectoryError>;

    /// Returns the user whose email and password match.
    ///
    /// Unknown emails and wrong passwords both yield
    /// [`DirectoryError::InvalidCredentials`] and take comparable time.
    async fn authenticate(&self, credentials: &Credentials) -> Result<User, DirectoryError>;
}

/// Prefix search over user names.
pub trait SearchIndex: Send + Sync {
    /// Returns up to `limit` distinct user IDs whose indexed names start
    /// with `prefix` (case-insensitive), ordered by matching name.
    fn query(&self, prefix: &str, limit: usize) -> Vec<i64>;
}

#[derive(Debug, Default)]
struct DirectoryState {
    users: HashMap<i64, User>,
    by_email: HashMap<String, i64>,
    by_user_name: HashMap<String, i64>,
    index: BTreeMap<String, BTreeSet<i64>>,
    next_id: i64,
}

impl DirectoryState {
    fn index_names(&mut self, user: &User) {
        for name in [&user.user_name, &user.first_name, &user.last_name] {
            let key = name.to_lowercase();
            if !key.is_empty() {
                self.index.entry(key).or_default().insert(user.id);
            }
        }
    }

    fn unindex_names(&mut self, user: &User) {
        for name in [&user.user_name, &user.first_name, &user.last_name] {
            let key = name.to_lowercase();
            if let Some(ids) = self.index.get_mut(&key) {
                ids.remove(&user.id);
                if ids.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
    }
}

/// In-memory [`UserDirectory`] and [`SearchIndex`].
///
/// Cloning is cheap; clones share the same accounts.
#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    state: Arc<RwLock<DirectoryState>>,
    bcrypt_cost: u32,
    dummy_hash: Arc<str>,
}

impl MemoryDirectory {
    /// Creates an empty directory hashing passwords at `bcrypt_cost`.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Hash`] if the cost is outside bcrypt's
    /// accepted range.
    pub fn new(bcrypt_cost: u32) -> Result<Self, DirectoryError> {
        let dummy_hash = bcrypt::hash("portico-dummy-password", bcrypt_cost)
            .map_err(|err| DirectoryError::Hash(err.to_string()))?;

        Ok(Self {
            state: Arc::new(RwLock::new(DirectoryState {
                next_id: 1,
                ..DirectoryState::default()
            })),
            bcrypt_cost,
            dummy_hash: Arc::from(dummy_hash),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, DirectoryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, DirectoryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().users.is_empty()
    }

    async fn hash_password(&self, password: String) -> Result<String, DirectoryError> {
        let cost = self.bcrypt_cost;
        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|err| DirectoryError::Hash(err.to_string()))?
            .map_err(|err| DirectoryError::Hash(err.to_string()))
    }

    async fn verify_password(password: String, hash: String) -> bool {
        tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash).unwrap_or(false))
            .await
            .unwrap_or(false)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn get_by_id(&self, id: i64) -> Result<User, DirectoryError> {
        self.read()
            .users
            .get(&id)
            .cloned()
            .ok_or(DirectoryError::NotFound)
    }

    async fn get_by_email(&self, email: &str) -> Result<User, DirectoryError> {
        let state = self.read();
        state
            .by_email
            .get(&normalize_email(email))
            .and_then(|id| state.users.get(id))
            .cloned()
            .ok_or(DirectoryError::NotFound)
    }

    async fn insert(&self, new_user: NewUser) -> Result<User, DirectoryError> {
        new_user.validate()?;

        let email = normalize_email(&new_user.email);
        let user_name_key = new_user.user_name.to_lowercase();
        {
            let state = self.read();
            if state.by_email.contains_key(&email) {
                return Err(DirectoryError::Duplicate("email".to_string()));
            }
            if state.by_user_name.contains_key(&user_name_key) {
                return Err(DirectoryError::Duplicate("user name".to_string()));
            }
        }

        let pass_hash = self.hash_password(new_user.password).await?;

        let mut state = self.write();
        // Re-check: another sign-up may have won while hashing.
        if state.by_email.contains_key(&email) {
            return Err(DirectoryError::Duplicate("email".to_string()));
        }
        if state.by_user_name.contains_key(&user_name_key) {
            return Err(DirectoryError::Duplicate("user name".to_string()));
        }

        let id = state.next_id;
        state.next_id += 1;

        let user = User {
            id,
            photo_url: gravatar_url(&email),
            email: email.clone(),
            pass_hash,
            user_name: new_user.user_name,
            first_name: new_user.first_name,
            last_name: new_user.last_name,
        };

        state.by_email.insert(email, id);
        state.by_user_name.insert(user_name_key, id);
        state.index_names(&user);
        state.users.insert(id, user.clone());

        info!(user_id = id, "User created");
        Ok(user)
    }

    async fn update(&self, id: i64, updates: &Updates) -> Result<User, DirectoryError> {
        updates.validate()?;

        let mut state = self.write();
        let previous = state.users.get(&id).cloned().ok_or(DirectoryError::NotFound)?;

        let mut updated = previous.clone();
        updated.first_name = updates.first_name.clone();
        updated.last_name = updates.last_name.clone();

        state.unindex_names(&previous);
        state.index_names(&updated);
        state.users.insert(id, updated.clone());

        debug!(user_id = id, "User updated");
        Ok(updated)
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<User, DirectoryError> {
        let found = self.get_by_email(&credentials.email).await.ok();
        let hash = match &found {
            Some(user) => user.pass_hash.clone(),
            None => self.dummy_hash.to_string(),
        };

        let matches = Self::verify_password(credentials.password.clone(), hash).await;
        match found {
            Some(user) if matches => Ok(user),
            _ => Err(DirectoryError::InvalidCredentials),
        }
    }
}

impl SearchIndex for MemoryDirectory {
    fn query(&self, prefix: &str, limit: usize) -> Vec<i64> {
        let prefix = prefix.to_lowercase();
        let state = self.read();

        let mut seen = BTreeSet::new();
        let mut ids = Vec::new();
        for (_, matched) in state
            .index
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
        {
            for id in matched {
                if ids.len() == limit {
                    return ids;
                }
                if seen.insert(*id) {
                    ids.push(*id);
                }
            }
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> MemoryDirectory {
        MemoryDirectory::new(4).unwrap()
    }

    fn new_user(email: &str, user_name: &str, first: &str, last: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            password: "hunter22".to_string(),
            password_conf: "hunter22".to_string(),
            user_name: user_name.to_string(),
            first_name: first.to_string(),
            last_name: last.to_string(),
        }
    }

    #[test]
    fn validate_rejects_bad_sign_ups() {
        let mut user = new_user("not-an-email", "ada", "", "");
        assert!(matches!(user.validate(), Err(DirectoryError::Validation(_))));

        user.email = "ada@example.com".to_string();
        user.password = "short".to_string();
        user.password_conf = "short".to_string();
        assert!(matches!(user.validate(), Err(DirectoryError::Validation(_))));

        user.password = "longenough".to_string();
        assert!(matches!(user.validate(), Err(DirectoryError::Validation(_))));

        user.password_conf = "longenough".to_string();
        user.user_name = "ada l".to_string();
        assert!(matches!(user.validate(), Err(DirectoryError::Validation(_))));

        user.user_name = "ada".to_string();
        assert!(user.validate().is_ok());
    }

    #[test]
    fn updates_require_a_name() {
        assert!(Updates::default().validate().is_err());
        let updates = Updates {
            first_name: "Ada".to_string(),
            last_name: String::new(),
        };
        assert!(updates.validate().is_ok());
    }

    #[test]
    fn full_name_joins_parts() {
        let mut user = User {
            id: 1,
            email: String::new(),
            pass_hash: String::new(),
            user_name: "ada".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            photo_url: String::new(),
        };
        assert_eq!(user.full_name(), "Ada Lovelace");
        user.last_name.clear();
        assert_eq!(user.full_name(), "Ada");
    }

    #[test]
    fn gravatar_url_normalizes_email() {
        assert_eq!(
            gravatar_url("  Ada@Example.com "),
            gravatar_url("ada@example.com")
        );
        let url = gravatar_url("ada@example.com");
        assert!(url.starts_with(GRAVATAR_BASE_URL));
        assert_eq!(url.len(), GRAVATAR_BASE_URL.len() + 64);
    }

    #[test]
    fn user_json_omits_secrets() {
        let user = User {
            id: 3,
            email: "ada@example.com".to_string(),
            pass_hash: "$2b$04$hash".to_string(),
            user_name: "ada".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            photo_url: "https://www.gravatar.com/avatar/x".to_string(),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("ada@example.com"));
        assert!(!json.contains("$2b$"));
        assert!(json.contains(r#""photoURL""#));
        assert!(json.contains(r#""userName":"ada""#));
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_hashes_password() {
        let dir = directory();
        let ada = dir
            .insert(new_user("ada@example.com", "ada", "Ada", "Lovelace"))
            .await
            .unwrap();
        let bob = dir
            .insert(new_user("bob@example.com", "bob", "Bob", "Babbage"))
            .await
            .unwrap();

        assert_ne!(ada.id, bob.id);
        assert_ne!(ada.pass_hash, "hunter22");
        assert_eq!(dir.get_by_id(ada.id).await.unwrap(), ada);
        assert_eq!(dir.get_by_email("ADA@example.com").await.unwrap(), ada);
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let dir = directory();
        dir.insert(new_user("ada@example.com", "ada", "", ""))
            .await
            .unwrap();

        assert!(matches!(
            dir.insert(new_user("ada@example.com", "other", "", "")).await,
            Err(DirectoryError::Duplicate(_))
        ));
        assert!(matches!(
            dir.insert(new_user("other@example.com", "ADA", "", "")).await,
            Err(DirectoryError::Duplicate(_))
        ));
        assert_eq!(dir.len(), 1);
    }

    #[tokio::test]
    async fn authenticate_checks_password() {
        let dir = directory();
        let ada = dir
            .insert(new_user("ada@example.com", "ada", "", ""))
            .await
            .unwrap();

        let good = Credentials {
            email: "ada@example.com".to_string(),
            password: "hunter22".to_string(),
        };
        assert_eq!(dir.authenticate(&good).await.unwrap().id, ada.id);

        let wrong = Credentials {
            password: "wrong-password".to_string(),
            ..good.clone()
        };
        assert_eq!(
            dir.authenticate(&wrong).await,
            Err(DirectoryError::InvalidCredentials)
        );

        let unknown = Credentials {
            email: "nobody@example.com".to_string(),
            ..good
        };
        assert_eq!(
            dir.authenticate(&unknown).await,
            Err(DirectoryError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn update_changes_names_and_reindexes() {
        let dir = directory();
        let ada = dir
            .insert(new_user("ada@example.com", "ada", "Ada", "Lovelace"))
            .await
            .unwrap();

        let updated = dir
            .update(
                ada.id,
                &Updates {
                    first_name: "Augusta".to_string(),
                    last_name: "King".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.first_name, "Augusta");
        assert!(dir.query("love", 20).is_empty());
        assert_eq!(dir.query("aug", 20), vec![ada.id]);
        assert_eq!(dir.query("ada", 20), vec![ada.id]);
    }

    #[tokio::test]
    async fn update_unknown_user_is_not_found() {
        let dir = directory();
        let updates = Updates {
            first_name: "X".to_string(),
            last_name: String::new(),
        };
        assert_eq!(dir.update(99, &updates).await, Err(DirectoryError::NotFound));
    }

    #[tokio::test]
    async fn query_matches_any_name_case_insensitively() {
        let dir = directory();
        let ada = dir
            .insert(new_user("ada@example.com", "ada", "Ada", "Lovelace"))
            .await
            .unwrap();
        let al = dir
            .insert(new_user("al@example.com", "turing", "Alan", "Turing"))
            .await
            .unwrap();
        dir.insert(new_user("bob@example.com", "bob", "Bob", "Smith"))
            .await
            .unwrap();

        let mut found = dir.query("A", 20);
        found.sort_unstable();
        assert_eq!(found, vec![ada.id, al.id]);

        assert_eq!(dir.query("tur", 20), vec![al.id]);
        assert!(dir.query("zzz", 20).is_empty());
    }

    #[tokio::test]
    async fn query_respects_limit_and_deduplicates() {
        let dir = directory();
        for n in 0..5 {
            dir.insert(new_user(
                &format!("u{n}@example.com"),
                &format!("sam{n}"),
                "Sam",
                "Sample",
            ))
            .await
            .unwrap();
        }

        let ids = dir.query("sam", 3);
        assert_eq!(ids.len(), 3);

        let all = dir.query("sam", 20);
        assert_eq!(all.len(), 5);
        let unique: BTreeSet<_> = all.iter().collect();
        assert_eq!(unique.len(), 5);
    }
}
