use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use time::OffsetDateTime;
use uuid::Uuid;

/// Which identity path created or linked an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Local,
    Google,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Local => "local",
            Provider::Google => "google",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown provider tag {0:?}")]
pub struct UnknownProvider(String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Provider::Local),
            "google" => Ok(Provider::Google),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// User record in the database.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: Uuid,
    pub full_name: String,
    pub email: String, // unique across users
    #[serde(skip_serializing)]
    pub password_hash: Option<String>, // Argon2 PHC string; None for federated-only accounts
    pub verified: bool,
    #[serde(skip_serializing)]
    pub verification_code: Option<String>, // set only while verification is pending
    pub google_id: Option<String>,
    pub avatar: Option<String>,
    pub provider: Option<Provider>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl User {
    /// A local registration awaiting email verification.
    pub fn pending_local(full_name: &str, email: &str, password_hash: String, code: String) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            full_name: full_name.to_string(),
            email: email.to_string(),
            password_hash: Some(password_hash),
            verified: false,
            verification_code: Some(code),
            google_id: None,
            avatar: None,
            provider: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// An account created by a first Google sign-in. The provider has already
    /// verified the email, so the record starts verified and has no password.
    pub fn federated(
        full_name: &str,
        email: &str,
        google_id: &str,
        avatar: Option<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            full_name: full_name.to_string(),
            email: email.to_string(),
            password_hash: None,
            verified: true,
            verification_code: None,
            google_id: Some(google_id.to_string()),
            avatar,
            provider: Some(Provider::Google),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach a Google identity to this record.
    pub fn link_google(&mut self, google_id: &str, avatar: Option<String>) {
        self.google_id = Some(google_id.to_string());
        if avatar.is_some() {
            self.avatar = avatar;
        }
        self.provider = Some(Provider::Google);
        self.verified = true;
        self.verification_code = None;
    }
}

impl<'r> FromRow<'r, PgRow> for User {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let provider = row
            .try_get::<Option<String>, _>("provider")?
            .map(|tag| tag.parse::<Provider>())
            .transpose()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "provider".into(),
                source: Box::new(e),
            })?;

        Ok(Self {
            id: row.try_get("id")?,
            full_name: row.try_get("full_name")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            verified: row.try_get("verified")?,
            verification_code: row.try_get("verification_code")?,
            google_id: row.try_get("google_id")?,
            avatar: row.try_get("avatar")?,
            provider,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
