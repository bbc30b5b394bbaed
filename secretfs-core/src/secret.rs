//! The secret abstraction the filesystem and the plugin surfaces consume.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use crate::error::SecretError;

/// Lease attached to a fetched secret or auth token.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub lease_id: String,
    pub renewable: bool,
    /// Remaining validity in seconds, as reported by the backend.
    pub lease_duration: u64,
}

/// Immutable snapshot of one fetched secret.
///
/// A body is never mutated after construction; refreshes replace it
/// wholesale. The `unique_id` is freshly generated per fetch so consumers can
/// detect no-change refreshes by comparing ids.
#[derive(Clone)]
pub struct SecretBody {
    unique_id: String,
    received_at: SystemTime,
    cache_ttl: Duration,
    created_at: Option<DateTime<Utc>>,
    data: HashMap<String, String>,
    lease: Option<LeaseInfo>,
}

impl SecretBody {
    pub fn new(
        unique_id: String,
        cache_ttl: Duration,
        created_at: Option<DateTime<Utc>>,
        data: HashMap<String, String>,
        lease: Option<LeaseInfo>,
    ) -> Self {
        Self {
            unique_id,
            received_at: SystemTime::now(),
            cache_ttl,
            created_at,
            data,
            lease,
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn lease(&self) -> Option<&LeaseInfo> {
        self.lease.as_ref()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// A cached body is fresh while its TTL has not elapsed; TTL zero means
    /// "cache forever until explicitly invalidated".
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.cache_ttl.is_zero() || now < self.received_at + self.cache_ttl
    }
}

impl std::fmt::Debug for SecretBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBody")
            .field("unique_id", &self.unique_id)
            .field("received_at", &self.received_at)
            .field("cache_ttl", &self.cache_ttl)
            .field("created_at", &self.created_at)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .field("values", &"[redacted]")
            .field("lease", &self.lease)
            .finish()
    }
}

/// One live reference to a remote secret.
///
/// Implementations own a backend session reference and a body cache;
/// `fetch(false)` serves from cache while fresh, `fetch(true)` always hits
/// the backend. `close` releases the session reference and stops any lease
/// watcher — a handle must not be used after `close`.
#[async_trait::async_trait]
pub trait Secret: Send + Sync {
    async fn fetch(&self, no_cache: bool) -> Result<Arc<SecretBody>, SecretError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_with_ttl(ttl: Duration) -> SecretBody {
        let mut data = HashMap::new();
        data.insert("username".to_string(), "u".to_string());
        SecretBody::new("id-1".to_string(), ttl, None, data, None)
    }

    #[test]
    fn zero_ttl_is_always_fresh() {
        let body = body_with_ttl(Duration::ZERO);
        let far_future = SystemTime::now() + Duration::from_secs(3600 * 24 * 365);
        assert!(body.is_fresh(far_future));
    }

    #[test]
    fn nonzero_ttl_expires() {
        let body = body_with_ttl(Duration::from_secs(60));
        assert!(body.is_fresh(SystemTime::now() + Duration::from_secs(10)));
        assert!(!body.is_fresh(SystemTime::now() + Duration::from_secs(61)));
    }

    #[test]
    fn debug_redacts_values() {
        let body = body_with_ttl(Duration::ZERO);
        let debug = format!("{body:?}");
        assert!(debug.contains("username"));
        assert!(debug.contains("[redacted]"));
        assert!(!debug.contains("\"u\""));
    }
}
