use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Redirect,
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use lazy_static::lazy_static;
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::{
            AuthResponse, GoogleCallbackQuery, LoginRequest, MessageResponse, PublicUser,
            RegisterRequest, VerifyQuery,
        },
        password::MAX_PASSWORD_BYTES,
        service::normalize_email,
        session::{oauth_state_removal, session_removal, SessionUser, OAUTH_STATE_COOKIE},
    },
    error::AuthError,
    state::AppState,
};

const MIN_PASSWORD_BYTES: usize = 8;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/verify", get(verify_email))
        .route("/auth/logout", get(logout))
        .route("/auth/google/login", get(google_login))
        .route("/auth/google/callback", get(google_callback))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn check_password(password: &str) -> Result<(), AuthError> {
    if password.len() < MIN_PASSWORD_BYTES {
        return Err(AuthError::InvalidInput("password too short"));
    }
    if password.len() > MAX_PASSWORD_BYTES {
        return Err(AuthError::InvalidInput("password too long"));
    }
    Ok(())
}

fn random_state() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<PublicUser>), AuthError> {
    let email = normalize_email(&payload.email);
    let full_name = payload.full_name.trim();

    if full_name.is_empty() {
        return Err(AuthError::InvalidInput("full name is required"));
    }
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(AuthError::InvalidInput("invalid email"));
    }
    check_password(&payload.password)?;

    let user = state
        .identity
        .register(full_name, &email, &payload.password)
        .await?;
    Ok((StatusCode::CREATED, Json(PublicUser::from(&user))))
}

#[instrument(skip(state, jar, payload))]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Result<(CookieJar, Json<AuthResponse>), AuthError> {
    let email = normalize_email(&payload.email);
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(AuthError::InvalidInput("invalid email"));
    }
    if payload.password.len() > MAX_PASSWORD_BYTES {
        return Err(AuthError::InvalidCredentials);
    }

    let user = state.identity.login(&email, &payload.password).await?;
    let cookie = state.session.issue(user.id)?;
    Ok((
        jar.add(cookie),
        Json(AuthResponse {
            user: PublicUser::from(&user),
        }),
    ))
}

#[instrument(skip_all)]
pub async fn verify_email(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Result<Json<MessageResponse>, AuthError> {
    state.identity.verify_email(query.code.trim()).await?;
    Ok(Json(MessageResponse {
        message: "email verified, you can now log in",
    }))
}

pub async fn logout(jar: CookieJar) -> (CookieJar, Json<MessageResponse>) {
    (
        jar.remove(session_removal()),
        Json(MessageResponse {
            message: "logged out",
        }),
    )
}

#[instrument(skip_all)]
pub async fn google_login(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<(CookieJar, Redirect), AuthError> {
    let oauth_state = random_state();
    let url = state.google.authorize_url(&oauth_state)?;
    Ok((
        jar.add(state.session.oauth_state_cookie(oauth_state)),
        Redirect::to(&url),
    ))
}

#[instrument(skip_all)]
pub async fn google_callback(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(query): Query<GoogleCallbackQuery>,
) -> Result<(CookieJar, Json<AuthResponse>), AuthError> {
    if let Some(reason) = query.error {
        warn!(reason = %reason, "google returned an error to the callback");
        return Err(AuthError::ExchangeFailed(reason));
    }

    let expected = jar.get(OAUTH_STATE_COOKIE).map(|c| c.value().to_owned());
    match (expected.as_deref(), query.state.as_deref()) {
        (Some(expected), Some(got)) if !expected.is_empty() && expected == got => {}
        _ => {
            warn!("oauth state mismatch");
            return Err(AuthError::StateMismatch);
        }
    }

    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or(AuthError::InvalidInput("missing authorization code"))?;

    let claims = state.google.claims_for_code(&code).await?;
    let user = state.identity.handle_google_login(&claims).await?;
    let cookie = state.session.issue(user.id)?;

    info!(user_id = %user.id, "google sign-in complete");
    Ok((
        jar.remove(oauth_state_removal()).add(cookie),
        Json(AuthResponse {
            user: PublicUser::from(&user),
        }),
    ))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    SessionUser(user_id): SessionUser,
) -> Result<Json<PublicUser>, AuthError> {
    let user = state.identity.current_user(user_id).await?;
    Ok(Json(PublicUser::from(&user)))
}
