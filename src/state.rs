use std::sync::Arc;

use anyhow::Context;
use axum::extract::FromRef;
use sqlx::PgPool;

use crate::{
    auth::{
        google::{FederatedVerifier, GoogleVerifier},
        repo::PgUserStore,
        service::IdentityService,
        session::SessionKeys,
    },
    config::AppConfig,
    notify::{Notifier, SmtpNotifier, WelcomeQueue},
};

const WELCOME_QUEUE_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub identity: IdentityService,
    pub google: Arc<dyn FederatedVerifier>,
    pub session: SessionKeys,
}

impl AppState {
    pub fn init(config: &AppConfig, db: PgPool) -> anyhow::Result<Self> {
        let store = Arc::new(PgUserStore::new(db, config.store_timeout()));
        let notifier: Arc<dyn Notifier> =
            Arc::new(SmtpNotifier::new(&config.smtp, &config.base_url).context("smtp notifier")?);
        let (welcome, _worker) = WelcomeQueue::spawn(notifier.clone(), WELCOME_QUEUE_CAPACITY);
        let google = Arc::new(GoogleVerifier::new(config.google.clone()).context("google verifier")?);

        Ok(Self::from_parts(
            IdentityService::new(store, notifier, welcome),
            google,
            SessionKeys::new(&config.session),
        ))
    }

    pub fn from_parts(
        identity: IdentityService,
        google: Arc<dyn FederatedVerifier>,
        session: SessionKeys,
    ) -> Self {
        Self {
            identity,
            google,
            session,
        }
    }
}

impl FromRef<AppState> for SessionKeys {
    fn from_ref(state: &AppState) -> Self {
        state.session.clone()
    }
}
