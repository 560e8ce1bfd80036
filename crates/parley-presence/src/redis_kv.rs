use crate::kv::PresenceKv;
use crate::PresenceError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tokio::sync::Mutex;

/// Redis-backed [`PresenceKv`]. One multiplexed connection behind a
/// mutex; presence traffic is small commands, not pipelines.
pub struct RedisKv {
    conn: Mutex<MultiplexedConnection>,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, PresenceError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[async_trait]
impl PresenceKv for RedisKv {
    async fn set(&self, key: &str, value: &str) -> Result<(), PresenceError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), PresenceError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn set_nx_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, PresenceError> {
        let mut conn = self.conn.lock().await;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PresenceError> {
        let mut conn = self.conn.lock().await;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
        Ok(value)
    }

    async fn exists(&self, key: &str) -> Result<bool, PresenceError> {
        let mut conn = self.conn.lock().await;
        let n: u64 = redis::cmd("EXISTS").arg(key).query_async(&mut *conn).await?;
        Ok(n > 0)
    }

    async fn del(&self, key: &str) -> Result<(), PresenceError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut *conn).await?;
        Ok(())
    }

    async fn expire_if_exists(&self, key: &str, ttl: Duration) -> Result<bool, PresenceError> {
        let mut conn = self.conn.lock().await;
        // PEXPIRE returns 0 when the key does not exist, so it never
        // resurrects an expired heartbeat.
        let n: u64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut *conn)
            .await?;
        Ok(n > 0)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), PresenceError> {
        let mut conn = self.conn.lock().await;
        redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, PresenceError> {
        let mut conn = self.conn.lock().await;
        let n: u64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut *conn)
            .await?;
        Ok(n > 0)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, PresenceError> {
        let mut conn = self.conn.lock().await;
        let mut members: Vec<String> =
            redis::cmd("SMEMBERS").arg(key).query_async(&mut *conn).await?;
        members.sort();
        Ok(members)
    }

    async fn scard(&self, key: &str) -> Result<usize, PresenceError> {
        let mut conn = self.conn.lock().await;
        let n: u64 = redis::cmd("SCARD").arg(key).query_async(&mut *conn).await?;
        Ok(n as usize)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, PresenceError> {
        let mut conn = self.conn.lock().await;
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut *conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
