use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::domain::IdempotencyRecord;
use crate::error::{AppError, AppResult};
use crate::ports::{Store, UnitOfWork};

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Caller-keyed response cache.
///
/// A key belongs to one user and one request fingerprint. Replaying it with
/// the same payload returns the cached response; a different payload or a
/// different user is a `Conflict`. Expired records are invisible and removed
/// by [`IdempotencyStore::purge_expired`].
#[derive(Clone)]
pub struct IdempotencyStore {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached response for `key`, outside any scope.
    pub async fn lookup<T: DeserializeOwned>(
        &self,
        key: &str,
        user_id: &str,
    ) -> AppResult<Option<T>> {
        match self.store.find_idempotency(key, Utc::now()).await? {
            Some(record) if record.user_id != user_id => Err(foreign_key(key)),
            Some(record) => Ok(Some(serde_json::from_value(record.response)?)),
            None => Ok(None),
        }
    }

    /// Cached response for `key` read inside `uow`, checked against the
    /// request fingerprint.
    pub async fn replay_in<T: DeserializeOwned>(
        &self,
        uow: &mut dyn UnitOfWork,
        key: &str,
        user_id: &str,
        request_hash: &str,
    ) -> AppResult<Option<T>> {
        let Some(record) = uow.find_idempotency(key, Utc::now()).await? else {
            return Ok(None);
        };

        if record.user_id != user_id {
            return Err(foreign_key(key));
        }
        if record.request_hash != request_hash {
            return Err(AppError::Conflict(format!(
                "idempotency key {key} was used with a different request"
            )));
        }

        tracing::info!(idempotency_key = key, user_id, "Replaying cached response");
        Ok(Some(serde_json::from_value(record.response)?))
    }

    /// Cache `response` under `key` for the configured TTL.
    pub async fn save<T: Serialize>(
        &self,
        uow: &mut dyn UnitOfWork,
        key: &str,
        user_id: &str,
        request_hash: &str,
        response: &T,
    ) -> AppResult<IdempotencyRecord> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| AppError::Internal(format!("idempotency ttl out of range: {e}")))?;
        let record = IdempotencyRecord {
            key: key.to_string(),
            user_id: user_id.to_string(),
            request_hash: request_hash.to_string(),
            response: serde_json::to_value(response)?,
            created_at: now,
            expires_at: now + ttl,
        };

        uow.save_idempotency(&record).await?;
        Ok(record)
    }

    /// Delete expired records. Returns how many were removed.
    pub async fn purge_expired(&self) -> AppResult<u64> {
        let purged = self.store.purge_expired_idempotency(Utc::now()).await?;
        if purged > 0 {
            tracing::info!(purged, "Purged expired idempotency records");
        }
        Ok(purged)
    }
}

fn foreign_key(key: &str) -> AppError {
    AppError::Conflict(format!("idempotency key {key} belongs to another user"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use serde_json::json;

    fn store() -> (Arc<MemoryStore>, IdempotencyStore) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), IdempotencyStore::new(store, DEFAULT_TTL))
    }

    #[tokio::test]
    async fn test_save_then_lookup() {
        let (store, idempotency) = store();
        let mut uow = store.begin().await.unwrap();
        idempotency
            .save(uow.as_mut(), "k1", "u1", "h1", &json!({"status": "COMPLETED"}))
            .await
            .unwrap();
        uow.commit().await.unwrap();

        let cached: Option<serde_json::Value> = idempotency.lookup("k1", "u1").await.unwrap();
        assert_eq!(cached, Some(json!({"status": "COMPLETED"})));

        let missing: Option<serde_json::Value> = idempotency.lookup("k2", "u1").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_key_reuse_with_other_payload_conflicts() {
        let (store, idempotency) = store();
        let mut uow = store.begin().await.unwrap();
        idempotency
            .save(uow.as_mut(), "k1", "u1", "h1", &json!(1))
            .await
            .unwrap();

        let replay: Option<i32> = idempotency
            .replay_in(uow.as_mut(), "k1", "u1", "h1")
            .await
            .unwrap();
        assert_eq!(replay, Some(1));

        let other = idempotency
            .replay_in::<i32>(uow.as_mut(), "k1", "u1", "h2")
            .await;
        assert!(matches!(other, Err(AppError::Conflict(_))));

        let foreign = idempotency
            .replay_in::<i32>(uow.as_mut(), "k1", "u2", "h1")
            .await;
        assert!(matches!(foreign, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_expired_records_are_invisible_and_purged() {
        let store = Arc::new(MemoryStore::new());
        let idempotency = IdempotencyStore::new(store.clone(), Duration::ZERO);

        let mut uow = store.begin().await.unwrap();
        idempotency
            .save(uow.as_mut(), "k-old", "u1", "h", &json!(null))
            .await
            .unwrap();
        uow.commit().await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let cached: Option<serde_json::Value> = idempotency.lookup("k-old", "u1").await.unwrap();
        assert!(cached.is_none());
        assert_eq!(idempotency.purge_expired().await.unwrap(), 1);
    }
}
