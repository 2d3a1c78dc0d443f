use std::{fmt, str::FromStr, time::Duration};

use serde::Deserialize;

pub const GOOGLE_SCOPES: [&str; 3] = [
    "openid",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
];

#[derive(Clone, Deserialize)]
pub struct SessionConfig {
    pub secret: String,
    pub issuer: String,
    pub ttl_minutes: i64,
    pub cookie_secure: bool,
}

#[derive(Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
}

#[derive(Clone, Deserialize)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub store_timeout_secs: u64,
    pub host: String,
    pub port: u16,
    pub base_url: String,
    pub session: SessionConfig,
    pub smtp: SmtpConfig,
    pub google: GoogleConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")?;
        let session = SessionConfig {
            secret: std::env::var("SESSION_SECRET")?,
            issuer: env_or("SESSION_ISSUER", "fmj"),
            ttl_minutes: env_parse("SESSION_TTL_MINUTES", 60 * 24 * 7),
            cookie_secure: env_parse("SESSION_COOKIE_SECURE", false),
        };
        let smtp = SmtpConfig {
            host: env_or("SMTP_HOST", "localhost"),
            port: env_parse("SMTP_PORT", 587),
            username: env_or("SMTP_USERNAME", ""),
            password: env_or("SMTP_PASSWORD", ""),
            from_email: env_or("FROM_EMAIL", "noreply@localhost"),
        };
        let google = GoogleConfig {
            client_id: std::env::var("GOOGLE_CLIENT_ID")?,
            client_secret: std::env::var("GOOGLE_CLIENT_SECRET")?,
            redirect_uri: std::env::var("GOOGLE_CALLBACK_URL")?,
            scopes: GOOGLE_SCOPES.iter().map(|s| s.to_string()).collect(),
        };
        Ok(Self {
            database_url,
            store_timeout_secs: env_parse("STORE_TIMEOUT_SECS", 5),
            host: env_or("APP_HOST", "0.0.0.0"),
            port: env_parse("APP_PORT", 8080),
            base_url: env_or("BASE_URL", "http://localhost:8080")
                .trim_end_matches('/')
                .to_string(),
            session,
            smtp,
            google,
        })
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    parse_or(std::env::var(key).ok().as_deref(), default)
}

fn parse_or<T: FromStr>(raw: Option<&str>, default: T) -> T {
    raw.and_then(|v| v.trim().parse::<T>().ok()).unwrap_or(default)
}

const REDACTED: &str = "<redacted>";

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("secret", &REDACTED)
            .field("issuer", &self.issuer)
            .field("ttl_minutes", &self.ttl_minutes)
            .field("cookie_secure", &self.cookie_secure)
            .finish()
    }
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &REDACTED)
            .field("from_email", &self.from_email)
            .finish()
    }
}

impl fmt::Debug for GoogleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &REDACTED)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .finish()
    }
}
