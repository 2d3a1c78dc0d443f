use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::{repo::UserStore, repo_types::User};
use crate::error::StoreError;

/// `UserStore` backed by a mutex-guarded map. Every operation takes the lock
/// once, so the uniqueness checks and the write happen atomically.
#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.users.lock().unwrap().len()
    }

    pub fn snapshot(&self, email: &str) -> Option<User> {
        self.users
            .lock()
            .unwrap()
            .values()
            .find(|u| u.email == email)
            .cloned()
    }

    fn conflicts(users: &HashMap<Uuid, User>, user: &User) -> Option<StoreError> {
        users.values().filter(|u| u.id != user.id).find_map(|u| {
            if u.email == user.email {
                Some(StoreError::DuplicateEmail)
            } else if user.google_id.is_some() && u.google_id == user.google_id {
                Some(StoreError::DuplicateFederatedId)
            } else {
                None
            }
        })
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, mut user: User) -> Result<User, StoreError> {
        let mut users = self.users.lock().unwrap();
        if let Some(err) = Self::conflicts(&users, &user) {
            return Err(err);
        }
        let now = OffsetDateTime::now_utc();
        user.created_at = now;
        user.updated_at = now;
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<User, StoreError> {
        self.users
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_by_email(&self, email: &str) -> Result<User, StoreError> {
        self.snapshot(email).ok_or(StoreError::NotFound)
    }

    async fn find_by_federated_id(&self, google_id: &str) -> Result<User, StoreError> {
        self.users
            .lock()
            .unwrap()
            .values()
            .find(|u| u.google_id.as_deref() == Some(google_id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn update(&self, mut user: User) -> Result<User, StoreError> {
        let mut users = self.users.lock().unwrap();
        if !users.contains_key(&user.id) {
            return Err(StoreError::NotFound);
        }
        if let Some(err) = Self::conflicts(&users, &user) {
            return Err(err);
        }
        user.updated_at = OffsetDateTime::now_utc();
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn mark_verified(&self, code: &str) -> Result<User, StoreError> {
        let mut users = self.users.lock().unwrap();
        let user = users
            .values_mut()
            .find(|u| !u.verified && u.verification_code.as_deref() == Some(code))
            .ok_or(StoreError::InvalidCode)?;
        user.verified = true;
        user.verification_code = None;
        user.updated_at = OffsetDateTime::now_utc();
        Ok(user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(email: &str, code: &str) -> User {
        User::pending_local("Test", email, "hash".into(), code.into())
    }

    #[tokio::test]
    async fn create_rejects_duplicate_email() {
        let store = MemoryUserStore::new();
        store.create(pending("a@example.com", "c1")).await.unwrap();
        let err = store.create(pending("a@example.com", "c2")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_creates_for_same_email_admit_one() {
        let store = std::sync::Arc::new(MemoryUserStore::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.create(pending("race@example.com", &format!("c{i}"))).await
            }));
        }
        let mut ok = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn mark_verified_is_single_use() {
        let store = MemoryUserStore::new();
        store.create(pending("a@example.com", "abc")).await.unwrap();
        let user = store.mark_verified("abc").await.unwrap();
        assert!(user.verified);
        assert!(user.verification_code.is_none());
        let err = store.mark_verified("abc").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidCode));
    }

    #[tokio::test]
    async fn lookups_report_not_found() {
        let store = MemoryUserStore::new();
        assert!(matches!(
            store.find_by_email("nobody@example.com").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.find_by_federated_id("g-404").await,
            Err(StoreError::NotFound)
        ));
    }
}
