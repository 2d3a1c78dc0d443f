use std::time::Duration;

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{config::SessionConfig, error::AuthError};

pub const SESSION_COOKIE: &str = "fmj_session";
pub const OAUTH_STATE_COOKIE: &str = "fmj_oauth_state";

const OAUTH_STATE_TTL: TimeDuration = TimeDuration::minutes(10);

/// Payload of the signed session cookie.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: Uuid,   // user ID
    pub iat: usize,  // issued at
    pub exp: usize,  // expires at
    pub iss: String, // issuer
}

#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    ttl: Duration,
    secure: bool,
}

impl SessionKeys {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            ttl: Duration::from_secs((config.ttl_minutes.max(1) as u64) * 60),
            secure: config.cookie_secure,
        }
    }

    pub fn sign(&self, user_id: Uuid) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let exp = now + TimeDuration::seconds(self.ttl.as_secs() as i64);
        let claims = SessionClaims {
            sub: user_id,
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)?;
        debug!(user_id = %user_id, "session signed");
        Ok(token)
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<SessionClaims> {
        let mut validation = Validation::default();
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        let data = decode::<SessionClaims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }

    /// Session cookie carrying a freshly signed token for `user_id`.
    pub fn issue(&self, user_id: Uuid) -> anyhow::Result<Cookie<'static>> {
        let token = self.sign(user_id)?;
        Ok(Cookie::build((SESSION_COOKIE, token))
            .path("/")
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .max_age(TimeDuration::seconds(self.ttl.as_secs() as i64))
            .build())
    }

    pub fn oauth_state_cookie(&self, state: String) -> Cookie<'static> {
        Cookie::build((OAUTH_STATE_COOKIE, state))
            .path("/auth/google")
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .max_age(OAUTH_STATE_TTL)
            .build()
    }
}

pub fn session_removal() -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE).path("/").build()
}

pub fn oauth_state_removal() -> Cookie<'static> {
    Cookie::build(OAUTH_STATE_COOKIE).path("/auth/google").build()
}

/// Signed-in user id, read from the session cookie.
#[derive(Debug)]
pub struct SessionUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for SessionUser
where
    S: Send + Sync,
    SessionKeys: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = SessionKeys::from_ref(state);
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(SESSION_COOKIE)
            .map(|c| c.value().to_owned())
            .ok_or(AuthError::Unauthenticated)?;

        match keys.verify(&token) {
            Ok(claims) => Ok(SessionUser(claims.sub)),
            Err(_) => {
                warn!("invalid or expired session");
                Err(AuthError::Unauthenticated)
            }
        }
    }
}
