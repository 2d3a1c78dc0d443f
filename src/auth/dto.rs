use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::repo_types::{Provider, User};

/// Request body for user registration.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub full_name: String,
    pub email: String,
    pub password: String,
}

/// Request body for login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(default)]
    pub code: String,
}

/// Query string Google appends to the callback redirect.
#[derive(Debug, Deserialize)]
pub struct GoogleCallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Public part of the user returned to the client.
#[derive(Debug, Serialize)]
pub struct PublicUser {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub verified: bool,
    pub avatar: Option<String>,
    pub provider: Option<Provider>,
}

impl From<&User> for PublicUser {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            full_name: user.full_name.clone(),
            email: user.email.clone(),
            verified: user.verified,
            avatar: user.avatar.clone(),
            provider: user.provider,
        }
    }
}

/// Response returned after login or Google sign-in; the session itself
/// travels in a cookie.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: PublicUser,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}
