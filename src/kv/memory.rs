//! In-memory stand-in for the cache, used by tests that need real
//! set-if-absent and sorted-set semantics rather than per-call mocks.

use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::KeyValueStore;

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, (String, Instant)>,
    zsets: HashMap<String, BTreeMap<String, i64>>,
}

impl Inner {
    fn live_entry(&mut self, key: &str) -> Option<&String> {
        if let Some((_, expires_at)) = self.entries.get(key) {
            if *expires_at <= Instant::now() {
                self.entries.remove(key);
                return None;
            }
        }
        self.entries.get(key).map(|(value, _)| value)
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.inner.lock().live_entry(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.inner
            .lock()
            .entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let expires_at = Instant::now() + ttl;
        for (key, value) in entries {
            inner
                .entries
                .insert(key.clone(), (value.clone(), expires_at));
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock();
        if inner.live_entry(key).is_some() {
            return Ok(false);
        }
        inner
            .entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.inner.lock().entries.remove(key).is_some())
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> anyhow::Result<()> {
        self.inner
            .lock()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        if let Some(zset) = self.inner.lock().zsets.get_mut(key) {
            zset.remove(member);
        }
        Ok(())
    }

    async fn zcard(&self, key: &str) -> anyhow::Result<u64> {
        Ok(self
            .inner
            .lock()
            .zsets
            .get(key)
            .map(|zset| zset.len() as u64)
            .unwrap_or(0))
    }

    async fn zscore(&self, key: &str, member: &str) -> anyhow::Result<Option<i64>> {
        Ok(self
            .inner
            .lock()
            .zsets
            .get(key)
            .and_then(|zset| zset.get(member).copied()))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<String>> {
        let inner = self.inner.lock();
        let Some(zset) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(i64, String)> = zset
            .iter()
            .filter(|(_, score)| **score >= min && **score <= max)
            .map(|(member, score)| (*score, member.clone()))
            .collect();
        members.sort();
        Ok(members
            .into_iter()
            .take(limit)
            .map(|(_, member)| member)
            .collect())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_exclusive() {
        let store = InMemoryStore::default();
        assert!(store
            .set_nx("bundle:lock", "a", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!store
            .set_nx("bundle:lock", "b", Duration::from_secs(30))
            .await
            .unwrap());
        assert!(store.delete("bundle:lock").await.unwrap());
        assert!(store
            .set_nx("bundle:lock", "b", Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_not_served() {
        let store = InMemoryStore::default();
        store
            .set("mempool:0xabc", "op", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("mempool:0xabc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zrange_orders_by_score() {
        let store = InMemoryStore::default();
        store.zadd("mempool:index", "c", 3).await.unwrap();
        store.zadd("mempool:index", "a", 1).await.unwrap();
        store.zadd("mempool:index", "b", 2).await.unwrap();
        assert_eq!(store.zcard("mempool:index").await.unwrap(), 3);
        assert_eq!(
            store
                .zrange_by_score("mempool:index", i64::MIN, i64::MAX, 10)
                .await
                .unwrap(),
            vec!["a", "b", "c"]
        );
    }
}
