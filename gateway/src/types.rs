//! Shared identity types for the Portico gateway.
//!
//! These are the values that flow between the session store, the push
//! channel, and the proxy: the snapshot of an authenticated user and the
//! session state stored against a [`SessionId`](crate::sid::SessionId).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimal identity of an authenticated user.
///
/// This is what gets stored in a session and what backends receive in the
/// `X-User` header. It never carries an email address or password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSnapshot {
    pub id: i64,
    pub user_name: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(rename = "photoURL")]
    pub photo_url: String,
}

/// State stored for a live session.
///
/// A fetched `SessionState` is a copy. Changing it has no effect on the
/// stored session until it is saved again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// When the session began.
    pub created_at: DateTime<Utc>,

    /// The authenticated user.
    pub user: UserSnapshot,
}

impl SessionState {
    /// Creates a state for a session beginning now.
    pub fn begin(user: UserSnapshot) -> Self {
        Self {
            created_at: Utc::now(),
            user,
        }
    }
}
