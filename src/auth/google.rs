use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{
    decode, decode_header, errors::ErrorKind, jwk::JwkSet, Algorithm, DecodingKey, Validation,
};
use reqwest::{Client, Url};
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::GoogleConfig;
use crate::error::AuthError;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const CERTS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

const JWKS_TTL: Duration = Duration::from_secs(60 * 60);
/// Floor between two fetches of the key set, whatever `kid` a token names.
const JWKS_MIN_REFETCH: Duration = Duration::from_secs(60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Tokens expiring sooner than this are refreshed before use.
const REFRESH_WINDOW: time::Duration = time::Duration::minutes(5);

/// Verified claims of a Google ID token.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleClaims {
    pub sub: String,
    pub email: String,
    pub email_verified: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

impl GoogleClaims {
    /// Display name, falling back to the email's local part.
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => self.email.split('@').next().unwrap_or(&self.email),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

/// Result of an authorization-code exchange or a refresh.
#[derive(Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
}

impl TokenSet {
    fn from_response(resp: TokenResponse, now: OffsetDateTime) -> Self {
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            id_token: resp.id_token,
            expires_at: resp
                .expires_in
                .map(|secs| now + time::Duration::seconds(secs)),
        }
    }
}

#[async_trait]
pub trait FederatedVerifier: Send + Sync {
    fn client_id(&self) -> &str;

    /// Consent-screen URL carrying the anti-forgery `state`.
    fn authorize_url(&self, state: &str) -> Result<String, AuthError>;

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, AuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AuthError>;

    /// Verify signature, audience, issuer and expiry of an ID token.
    async fn validate(&self, id_token: &str, audience: &str) -> Result<GoogleClaims, AuthError>;

    /// Trade an authorization code for verified claims.
    async fn claims_for_code(&self, code: &str) -> Result<GoogleClaims, AuthError> {
        let mut tokens = self.exchange_code(code).await?;
        let now = OffsetDateTime::now_utc();

        if let Some(expires_at) = tokens.expires_at {
            if expires_at <= now {
                warn!("exchanged token already expired");
                return Err(AuthError::TokenExpired);
            }
            if expires_at - now < REFRESH_WINDOW {
                if let Some(refresh_token) = tokens.refresh_token.clone() {
                    debug!("token close to expiry, refreshing");
                    let refreshed = self.refresh(&refresh_token).await?;
                    tokens = TokenSet {
                        id_token: refreshed.id_token.or(tokens.id_token),
                        refresh_token: refreshed.refresh_token.or(Some(refresh_token)),
                        ..refreshed
                    };
                }
            }
        }

        let id_token = tokens
            .id_token
            .ok_or_else(|| AuthError::InvalidAssertion("id_token missing from response".into()))?;
        self.validate(&id_token, self.client_id()).await
    }
}

struct CachedKeys {
    set: JwkSet,
    fetched_at: Instant,
}

pub struct GoogleVerifier {
    config: GoogleConfig,
    http: Client,
    keys: RwLock<Option<CachedKeys>>,
}

impl GoogleVerifier {
    pub fn new(config: GoogleConfig) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            config,
            http,
            keys: RwLock::new(None),
        })
    }

    /// Current key set, refetched when stale or when `kid` is unknown.
    async fn signing_keys(&self, kid: &str) -> Result<JwkSet, AuthError> {
        {
            let cached = self.keys.read().await;
            if let Some(c) = cached.as_ref() {
                if !needs_refetch(c.fetched_at.elapsed(), c.set.find(kid).is_some()) {
                    return Ok(c.set.clone());
                }
            }
        }

        let set: JwkSet = self
            .http
            .get(CERTS_URL)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("fetch google certs: {e}")))?
            .json()
            .await
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("parse google certs: {e}")))?;
        info!(keys = set.keys.len(), "fetched google signing keys");

        *self.keys.write().await = Some(CachedKeys {
            set: set.clone(),
            fetched_at: Instant::now(),
        });
        Ok(set)
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenSet, String> {
        let resp = self
            .http
            .post(TOKEN_URL)
            .form(form)
            .send()
            .await
            .map_err(|e| format!("http error: {e}"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("status {status}: {body}"));
        }
        let parsed = resp
            .json::<TokenResponse>()
            .await
            .map_err(|e| format!("json parse error: {e}"))?;
        Ok(TokenSet::from_response(parsed, OffsetDateTime::now_utc()))
    }
}

/// An unknown `kid` only forces a fetch once the cached set is older than
/// `JWKS_MIN_REFETCH`; a stale set is always refetched.
fn needs_refetch(age: Duration, kid_known: bool) -> bool {
    if age >= JWKS_TTL {
        return true;
    }
    !kid_known && age >= JWKS_MIN_REFETCH
}

#[async_trait]
impl FederatedVerifier for GoogleVerifier {
    fn client_id(&self) -> &str {
        &self.config.client_id
    }

    fn authorize_url(&self, state: &str) -> Result<String, AuthError> {
        let scope = self.config.scopes.join(" ");
        let url = Url::parse_with_params(
            AUTH_URL,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("state", state),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|e| AuthError::Internal(e.into()))?;
        Ok(url.into())
    }

    #[instrument(skip_all)]
    async fn exchange_code(&self, code: &str) -> Result<TokenSet, AuthError> {
        self.token_request(&[
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ])
        .await
        .map_err(|reason| {
            warn!(%reason, "authorization code exchange failed");
            AuthError::ExchangeFailed(reason)
        })
    }

    #[instrument(skip_all)]
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AuthError> {
        self.token_request(&[
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .await
        .map_err(|reason| {
            warn!(%reason, "token refresh failed");
            AuthError::RefreshFailed(reason)
        })
    }

    #[instrument(skip_all)]
    async fn validate(&self, id_token: &str, audience: &str) -> Result<GoogleClaims, AuthError> {
        let kid = match decode_header(id_token).map(|h| h.kid) {
            Ok(Some(kid)) => kid,
            Ok(None) => {
                warn!("id token header has no kid");
                return Err(AuthError::InvalidAssertion("header has no kid".into()));
            }
            Err(e) => {
                let err = assertion_error(e);
                warn!(error = ?err, "id token header unreadable");
                return Err(err);
            }
        };
        let keys = self.signing_keys(&kid).await?;
        let claims = verify_id_token(id_token, &keys, audience).map_err(|e| {
            if let AuthError::InvalidAssertion(reason) = &e {
                warn!(%reason, "id token rejected");
            }
            e
        })?;
        debug!(sub = %claims.sub, "id token verified");
        Ok(claims)
    }
}

/// Verify an RS256 ID token against `keys` and parse its claims.
pub fn verify_id_token(
    id_token: &str,
    keys: &JwkSet,
    audience: &str,
) -> Result<GoogleClaims, AuthError> {
    let header = decode_header(id_token).map_err(assertion_error)?;
    let kid = header
        .kid
        .ok_or_else(|| AuthError::InvalidAssertion("header has no kid".into()))?;
    let jwk = keys
        .find(&kid)
        .ok_or_else(|| AuthError::InvalidAssertion(format!("unknown signing key {kid}")))?;
    let key = DecodingKey::from_jwk(jwk).map_err(assertion_error)?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_issuer(&ISSUERS);
    validation.set_audience(&[audience]);
    validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

    let claims = decode::<GoogleClaims>(id_token, &key, &validation)
        .map_err(assertion_error)?
        .claims;
    if claims.sub.is_empty() || claims.email.is_empty() {
        return Err(AuthError::InvalidAssertion("empty sub or email claim".into()));
    }
    Ok(claims)
}

fn assertion_error(e: jsonwebtoken::errors::Error) -> AuthError {
    let reason = match e.kind() {
        ErrorKind::InvalidSignature => "signature verification failed".to_string(),
        ErrorKind::ExpiredSignature => "assertion expired".to_string(),
        ErrorKind::InvalidAudience => "audience mismatch".to_string(),
        ErrorKind::InvalidIssuer => "unexpected issuer".to_string(),
        ErrorKind::InvalidAlgorithm => "unexpected signing algorithm".to_string(),
        ErrorKind::MissingRequiredClaim(claim) => format!("missing claim {claim}"),
        ErrorKind::Json(_) => "malformed claims".to_string(),
        other => format!("malformed token: {other:?}"),
    };
    AuthError::InvalidAssertion(reason)
}
