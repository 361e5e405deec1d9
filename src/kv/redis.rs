use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};

use super::KeyValueStore;

/// Redis-backed cache. The connection manager transparently reconnects and is
/// cheap to clone per command.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .context("should connect to redis")?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let value: Option<String> = self.conn().get(key).await.context("redis GET failed")?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let _: () = self
            .conn()
            .set_ex(key, value, ttl.as_secs() as usize)
            .await
            .context("redis SET failed")?;
        Ok(())
    }

    async fn set_many(&self, entries: &[(String, String)], ttl: Duration) -> anyhow::Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl.as_secs())
                .ignore();
        }
        let _: () = pipe
            .query_async(&mut self.conn())
            .await
            .context("redis pipelined SET failed")?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.conn())
            .await
            .context("redis SET NX failed")?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let removed: u64 = self.conn().del(key).await.context("redis DEL failed")?;
        Ok(removed > 0)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> anyhow::Result<()> {
        let _: () = self
            .conn()
            .zadd(key, member, score)
            .await
            .context("redis ZADD failed")?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let _: () = self
            .conn()
            .zrem(key, member)
            .await
            .context("redis ZREM failed")?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> anyhow::Result<u64> {
        let count: u64 = self.conn().zcard(key).await.context("redis ZCARD failed")?;
        Ok(count)
    }

    async fn zscore(&self, key: &str, member: &str) -> anyhow::Result<Option<i64>> {
        let score: Option<i64> = self
            .conn()
            .zscore(key, member)
            .await
            .context("redis ZSCORE failed")?;
        Ok(score)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> anyhow::Result<Vec<String>> {
        let members: Vec<String> = self
            .conn()
            .zrangebyscore_limit(key, min, max, 0, limit as isize)
            .await
            .context("redis ZRANGEBYSCORE failed")?;
        Ok(members)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn())
            .await
            .context("redis PING failed")?;
        Ok(())
    }
}
