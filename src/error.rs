use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

/// Failures raised by a `UserStore` implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("user not found")]
    NotFound,
    #[error("email already exists")]
    DuplicateEmail,
    #[error("federated id already linked to another user")]
    DuplicateFederatedId,
    #[error("no pending user for verification code")]
    InvalidCode,
    #[error("store operation timed out")]
    Timeout,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Identity core error. Business-rule variants are expected and user-facing;
/// `Storage`, `Dispatch` and `Internal` are operational.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{0}")]
    InvalidInput(&'static str),
    #[error("email already registered")]
    AlreadyRegistered,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("email not verified")]
    EmailNotVerified,
    #[error("invalid verification code")]
    InvalidVerificationCode,
    #[error("invalid identity assertion")]
    InvalidAssertion(String),
    #[error("oauth state mismatch")]
    StateMismatch,
    #[error("authorization code exchange failed")]
    ExchangeFailed(String),
    #[error("federated token expired")]
    TokenExpired,
    #[error("federated token refresh failed")]
    RefreshFailed(String),
    #[error("not signed in")]
    Unauthenticated,
    #[error("notification dispatch failed")]
    Dispatch(#[source] anyhow::Error),
    #[error("storage failure")]
    Storage(#[from] StoreError),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::AlreadyRegistered => "ALREADY_REGISTERED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::EmailNotVerified => "EMAIL_NOT_VERIFIED",
            Self::InvalidVerificationCode => "INVALID_VERIFICATION_CODE",
            Self::InvalidAssertion(_) => "INVALID_ASSERTION",
            Self::StateMismatch => "STATE_MISMATCH",
            Self::ExchangeFailed(_) => "EXCHANGE_FAILED",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::RefreshFailed(_) => "REFRESH_FAILED",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Dispatch(_) => "DISPATCH",
            Self::Storage(StoreError::Timeout) => "STORAGE_TIMEOUT",
            Self::Storage(_) => "STORAGE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// True for failures that warrant an operational alert rather than a
    /// user-facing message.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Dispatch(_) | Self::Storage(_) | Self::Internal(_))
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::InvalidVerificationCode | Self::StateMismatch => {
                StatusCode::BAD_REQUEST
            }
            Self::AlreadyRegistered => StatusCode::CONFLICT,
            Self::InvalidCredentials
            | Self::InvalidAssertion(_)
            | Self::TokenExpired
            | Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::EmailNotVerified => StatusCode::FORBIDDEN,
            Self::ExchangeFailed(_) | Self::RefreshFailed(_) | Self::Dispatch(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Storage(StoreError::Timeout) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        // 4xx are already visible through the trace layer; only the causes of
        // operational failures are logged here.
        if self.is_operational() {
            tracing::error!(error = ?self, kind = self.kind(), "operational failure");
        }
        let body = serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
