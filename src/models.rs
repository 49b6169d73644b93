use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::guard::Owned;
use crate::records::Record;

/// Metadata for one stored image. `name` is the blob store key and its
/// extension implies the encoded format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record for ImageRecord {
    const KIND: &'static str = "image";
    const UNIQUE_FIELDS: &'static [&'static str] = &["name"];
    const IMMUTABLE_FIELDS: &'static [&'static str] = &["owner_id"];

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Owned for ImageRecord {
    fn owner_id(&self) -> Uuid {
        self.owner_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    /// Argon2id PHC string.
    pub password_hash: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl Record for UserRecord {
    const KIND: &'static str = "user";
    const UNIQUE_FIELDS: &'static [&'static str] = &["email"];

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Public view of a user, without the password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

impl From<&UserRecord> for UserProfile {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
        }
    }
}
