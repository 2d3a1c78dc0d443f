use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        google::GoogleClaims,
        password::{generate_verification_code, hash_password, verify_password},
        repo::UserStore,
        repo_types::User,
    },
    error::{AuthError, StoreError},
    notify::{Notifier, WelcomeQueue},
};

/// Canonical form of an email address; every store lookup and insert uses it.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Owns every identity state transition: registration, local login, email
/// verification and Google login/linking. Holds no state of its own between
/// calls.
#[derive(Clone)]
pub struct IdentityService {
    store: Arc<dyn UserStore>,
    notifier: Arc<dyn Notifier>,
    welcome: WelcomeQueue,
}

impl IdentityService {
    pub fn new(store: Arc<dyn UserStore>, notifier: Arc<dyn Notifier>, welcome: WelcomeQueue) -> Self {
        Self {
            store,
            notifier,
            welcome,
        }
    }

    #[instrument(skip(self, full_name, password))]
    pub async fn register(
        &self,
        full_name: &str,
        email: &str,
        password: &str,
    ) -> Result<User, AuthError> {
        let email = normalize_email(email);
        let email = email.as_str();
        match self.store.find_by_email(email).await {
            Ok(_) => {
                warn!("email already registered");
                return Err(AuthError::AlreadyRegistered);
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let plain = password.to_owned();
        let hash = tokio::task::spawn_blocking(move || hash_password(&plain))
            .await
            .map_err(anyhow::Error::from)??;
        let code = generate_verification_code();

        // The unique index decides concurrent registrations for the same email.
        let user = match self
            .store
            .create(User::pending_local(full_name, email, hash, code))
            .await
        {
            Ok(u) => u,
            Err(StoreError::DuplicateEmail) => {
                warn!("lost registration race on email");
                return Err(AuthError::AlreadyRegistered);
            }
            Err(e) => return Err(e.into()),
        };

        let code = user.verification_code.as_deref().unwrap_or_default();
        self.notifier
            .send_verification(&user.email, &user.full_name, code)
            .await
            .map_err(AuthError::Dispatch)?;

        info!(user_id = %user.id, "user registered, verification sent");
        Ok(user)
    }

    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let email = normalize_email(email);
        let user = match self.store.find_by_email(&email).await {
            Ok(u) => u,
            Err(StoreError::NotFound) => {
                warn!("login unknown email");
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => return Err(e.into()),
        };

        if !user.verified {
            warn!(user_id = %user.id, "login before email verification");
            return Err(AuthError::EmailNotVerified);
        }

        let Some(hash) = user.password_hash.clone() else {
            // Federated-only account, no local password to compare.
            warn!(user_id = %user.id, "login without local password");
            return Err(AuthError::InvalidCredentials);
        };
        let plain = password.to_owned();
        let ok = tokio::task::spawn_blocking(move || verify_password(&plain, &hash))
            .await
            .map_err(anyhow::Error::from)?;
        if !ok {
            warn!(user_id = %user.id, "login invalid password");
            return Err(AuthError::InvalidCredentials);
        }

        info!(user_id = %user.id, "user logged in");
        Ok(user)
    }

    #[instrument(skip_all)]
    pub async fn verify_email(&self, code: &str) -> Result<User, AuthError> {
        if code.is_empty() {
            return Err(AuthError::InvalidVerificationCode);
        }
        match self.store.mark_verified(code).await {
            Ok(user) => {
                info!(user_id = %user.id, "email verified");
                Ok(user)
            }
            Err(StoreError::InvalidCode | StoreError::NotFound) => {
                warn!("unknown or used verification code");
                Err(AuthError::InvalidVerificationCode)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolves validated Google claims to a user: an already linked account
    /// first, then an account with the same email (which gets linked), then a
    /// brand new verified account.
    #[instrument(skip_all, fields(sub = %claims.sub))]
    pub async fn handle_google_login(&self, claims: &GoogleClaims) -> Result<User, AuthError> {
        let email = normalize_email(&claims.email);
        if let Some(user) = self.resolve_existing(claims, &email).await? {
            return Ok(user);
        }

        let created = self
            .store
            .create(User::federated(
                claims.display_name(),
                &email,
                &claims.sub,
                claims.picture.clone(),
            ))
            .await;
        match created {
            Ok(user) => {
                self.welcome.enqueue(&user.email, &user.full_name);
                info!(user_id = %user.id, "user created from google login");
                Ok(user)
            }
            // A concurrent first login won the insert; resolve against its row.
            Err(StoreError::DuplicateEmail | StoreError::DuplicateFederatedId) => {
                warn!("lost federated create race, re-resolving");
                self.resolve_existing(claims, &email)
                    .await?
                    .ok_or(AuthError::Storage(StoreError::DuplicateFederatedId))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_existing(
        &self,
        claims: &GoogleClaims,
        email: &str,
    ) -> Result<Option<User>, AuthError> {
        match self.store.find_by_federated_id(&claims.sub).await {
            Ok(user) => {
                debug!(user_id = %user.id, "google identity already linked");
                return Ok(Some(user));
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        match self.store.find_by_email(email).await {
            Ok(mut user) => {
                user.link_google(&claims.sub, claims.picture.clone());
                let user = self.store.update(user).await?;
                info!(user_id = %user.id, "google identity linked to existing account");
                Ok(Some(user))
            }
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads the user behind a session; a vanished user ends the session.
    pub async fn current_user(&self, id: Uuid) -> Result<User, AuthError> {
        match self.store.find_by_id(id).await {
            Ok(user) => Ok(user),
            Err(StoreError::NotFound) => Err(AuthError::Unauthenticated),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::auth::memory::MemoryUserStore;
    use crate::auth::repo_types::Provider;
    use crate::notify::testing::{RecordingNotifier, Sent};

    struct Harness {
        store: Arc<MemoryUserStore>,
        notifier: Arc<RecordingNotifier>,
        service: IdentityService,
    }

    fn harness_with(notifier: RecordingNotifier) -> Harness {
        let store = Arc::new(MemoryUserStore::new());
        let notifier = Arc::new(notifier);
        let (welcome, _worker) = WelcomeQueue::spawn(notifier.clone(), 8);
        let service = IdentityService::new(store.clone(), notifier.clone(), welcome);
        Harness {
            store,
            notifier,
            service,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingNotifier::default())
    }

    fn ada_claims() -> GoogleClaims {
        GoogleClaims {
            sub: "g-1".into(),
            email: "ada@example.com".into(),
            email_verified: true,
            name: Some("Ada".into()),
            picture: Some("http://img.example/ada.png".into()),
        }
    }

    async fn wait_for_mail(notifier: &RecordingNotifier) {
        for _ in 0..100 {
            if !notifier.sent().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn ada_registers_verifies_and_logs_in() {
        let h = harness();
        let user = h
            .service
            .register("Ada Lovelace", "ada@example.com", "S3cret!")
            .await
            .expect("register");
        assert!(!user.verified);
        assert_eq!(user.provider, None);

        let stored = h.store.snapshot("ada@example.com").expect("stored");
        let code = stored.verification_code.clone().expect("pending code");
        assert_eq!(code.len(), 64);
        assert_ne!(stored.password_hash.as_deref(), Some("S3cret!"));
        assert_eq!(
            h.notifier.sent(),
            vec![Sent::Verification {
                to: "ada@example.com".into(),
                code: code.clone()
            }]
        );

        let verified = h.service.verify_email(&code).await.expect("verify");
        assert!(verified.verified);
        assert_eq!(verified.verification_code, None);

        let again = h.service.verify_email(&code).await.unwrap_err();
        assert!(matches!(again, AuthError::InvalidVerificationCode));

        let logged_in = h
            .service
            .login("ada@example.com", "S3cret!")
            .await
            .expect("login");
        assert_eq!(logged_in.id, user.id);

        let wrong = h.service.login("ada@example.com", "wrong").await.unwrap_err();
        assert!(matches!(wrong, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn register_twice_is_already_registered() {
        let h = harness();
        h.service
            .register("Ada", "ada@example.com", "S3cret!")
            .await
            .unwrap();
        let before = h.store.snapshot("ada@example.com").unwrap();

        let err = h
            .service
            .register("Other", "ada@example.com", "different")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AlreadyRegistered));
        assert_eq!(h.store.len(), 1);
        let after = h.store.snapshot("ada@example.com").unwrap();
        assert_eq!(after.full_name, before.full_name);
        assert_eq!(after.password_hash, before.password_hash);
    }

    #[tokio::test]
    async fn concurrent_registrations_admit_one() {
        let h = harness();
        let (a, b) = tokio::join!(
            h.service.register("A", "race@example.com", "password-a"),
            h.service.register("B", "race@example.com", "password-b"),
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(AuthError::AlreadyRegistered))));
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn verification_dispatch_failure_fails_registration() {
        let h = harness_with(RecordingNotifier::failing());
        let err = h
            .service
            .register("Ada", "ada@example.com", "S3cret!")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Dispatch(_)));
        assert!(err.is_operational());
    }

    #[tokio::test]
    async fn login_unknown_email_is_invalid_credentials() {
        let h = harness();
        let err = h
            .service
            .login("nobody@example.com", "whatever")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn login_unverified_is_email_not_verified() {
        let h = harness();
        h.service
            .register("Ada", "ada@example.com", "S3cret!")
            .await
            .unwrap();
        let err = h
            .service
            .login("ada@example.com", "S3cret!")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::EmailNotVerified));
    }

    #[tokio::test]
    async fn login_federated_only_account_is_invalid_credentials() {
        let h = harness();
        h.service.handle_google_login(&ada_claims()).await.unwrap();
        let err = h
            .service
            .login("ada@example.com", "anything")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn empty_or_unknown_code_is_rejected() {
        let h = harness();
        assert!(matches!(
            h.service.verify_email("").await.unwrap_err(),
            AuthError::InvalidVerificationCode
        ));
        assert!(matches!(
            h.service.verify_email("deadbeef").await.unwrap_err(),
            AuthError::InvalidVerificationCode
        ));
    }

    #[tokio::test]
    async fn google_login_links_existing_local_account() {
        let h = harness();
        h.service
            .register("Ada Lovelace", "ada@example.com", "S3cret!")
            .await
            .unwrap();
        let code = h
            .store
            .snapshot("ada@example.com")
            .unwrap()
            .verification_code
            .unwrap();
        let local = h.service.verify_email(&code).await.unwrap();

        let linked = h.service.handle_google_login(&ada_claims()).await.unwrap();
        assert_eq!(linked.id, local.id);
        assert_eq!(linked.google_id.as_deref(), Some("g-1"));
        assert_eq!(linked.provider, Some(Provider::Google));
        assert_eq!(linked.avatar.as_deref(), Some("http://img.example/ada.png"));
        assert_eq!(linked.password_hash, local.password_hash);
        assert!(linked.verified);
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn google_login_links_and_verifies_pending_account() {
        let h = harness();
        h.service
            .register("Ada", "ada@example.com", "S3cret!")
            .await
            .unwrap();
        let linked = h.service.handle_google_login(&ada_claims()).await.unwrap();
        assert!(linked.verified);
        assert_eq!(linked.verification_code, None);
    }

    #[tokio::test]
    async fn google_login_returns_linked_user_unchanged() {
        let h = harness();
        let first = h.service.handle_google_login(&ada_claims()).await.unwrap();

        let mut changed = ada_claims();
        changed.email = "new-address@example.com".into();
        changed.picture = Some("http://img.example/other.png".into());
        let second = h.service.handle_google_login(&changed).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.email, "ada@example.com");
        assert_eq!(second.avatar, first.avatar);
        assert_eq!(second.updated_at, first.updated_at);
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn google_login_creates_verified_user_and_sends_welcome() {
        let h = harness();
        let user = h.service.handle_google_login(&ada_claims()).await.unwrap();
        assert!(user.verified);
        assert_eq!(user.password_hash, None);
        assert_eq!(user.full_name, "Ada");
        assert_eq!(user.provider, Some(Provider::Google));

        wait_for_mail(&h.notifier).await;
        assert_eq!(
            h.notifier.sent(),
            vec![Sent::Welcome {
                to: "ada@example.com".into()
            }]
        );
    }

    #[tokio::test]
    async fn welcome_failure_does_not_fail_login() {
        let h = harness_with(RecordingNotifier::failing());
        let user = h.service.handle_google_login(&ada_claims()).await;
        assert!(user.is_ok());
    }

    #[tokio::test]
    async fn google_login_matches_local_email_case_insensitively() {
        let h = harness();
        let local = h
            .service
            .register("Ada", "ada@example.com", "S3cret!")
            .await
            .unwrap();

        let mut claims = ada_claims();
        claims.email = "Ada@Example.com".into();
        let linked = h.service.handle_google_login(&claims).await.unwrap();

        assert_eq!(linked.id, local.id);
        assert_eq!(linked.email, "ada@example.com");
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn login_and_register_ignore_email_case() {
        let h = harness();
        h.service
            .register("Ada", " Ada@Example.com", "S3cret!")
            .await
            .unwrap();
        assert!(h.store.snapshot("ada@example.com").is_some());

        let err = h
            .service
            .register("Ada", "ADA@example.com", "S3cret!")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::AlreadyRegistered));

        let err = h
            .service
            .login("ADA@EXAMPLE.COM", "S3cret!")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::EmailNotVerified));
    }

    /// Inserts a competing Google account right before the first `create`,
    /// as a concurrent first login would.
    struct RacingStore {
        inner: MemoryUserStore,
        rival: std::sync::Mutex<Option<User>>,
    }

    #[async_trait::async_trait]
    impl UserStore for RacingStore {
        async fn create(&self, user: User) -> Result<User, StoreError> {
            let rival = self.rival.lock().unwrap().take();
            if let Some(rival) = rival {
                self.inner.create(rival).await?;
            }
            self.inner.create(user).await
        }
        async fn find_by_id(&self, id: Uuid) -> Result<User, StoreError> {
            self.inner.find_by_id(id).await
        }
        async fn find_by_email(&self, email: &str) -> Result<User, StoreError> {
            self.inner.find_by_email(email).await
        }
        async fn find_by_federated_id(&self, google_id: &str) -> Result<User, StoreError> {
            self.inner.find_by_federated_id(google_id).await
        }
        async fn update(&self, user: User) -> Result<User, StoreError> {
            self.inner.update(user).await
        }
        async fn mark_verified(&self, code: &str) -> Result<User, StoreError> {
            self.inner.mark_verified(code).await
        }
    }

    #[tokio::test]
    async fn concurrent_first_google_login_resolves_to_winner() {
        let rival = User::federated("Ada", "ada@example.com", "g-1", None);
        let rival_id = rival.id;
        let store = Arc::new(RacingStore {
            inner: MemoryUserStore::new(),
            rival: std::sync::Mutex::new(Some(rival)),
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let (welcome, _worker) = WelcomeQueue::spawn(notifier.clone(), 8);
        let service = IdentityService::new(store.clone(), notifier, welcome);

        let user = service.handle_google_login(&ada_claims()).await.unwrap();
        assert_eq!(user.id, rival_id);
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test]
    async fn current_user_of_missing_id_is_unauthenticated() {
        let h = harness();
        let err = h.service.current_user(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated));

        let user = h.service.handle_google_login(&ada_claims()).await.unwrap();
        assert_eq!(h.service.current_user(user.id).await.unwrap().id, user.id);
    }
}
