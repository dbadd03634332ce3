//! Thin Redis client wrapper used for health checks and simple KV
//! access. The job queue and instance store wrap their own
//! `ConnectionManager` directly, since their access patterns (sorted
//! sets, hashes, transactions) don't fit a generic helper.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::info;

use crate::error::Result;

pub struct RedisClient {
    manager: ConnectionManager,
}

impl RedisClient {
    pub async fn new(redis_url: &str) -> Result<Self> {
        info!(redis_url, "connecting to redis");
        let client = Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    pub async fn ping(&mut self) -> Result<String> {
        let result: String = redis::cmd("PING").query_async(&mut self.manager).await?;
        Ok(result)
    }

    pub async fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.manager.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<String>> {
        let result: Option<String> = self.manager.get(key).await?;
        Ok(result)
    }

    pub async fn del(&mut self, key: &str) -> Result<()> {
        self.manager.del::<_, ()>(key).await?;
        Ok(())
    }

    /// Clone the underlying connection manager for crates that need
    /// direct access to sorted-set/hash primitives.
    pub fn connection_manager(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_roundtrips_against_live_redis() {
        if let Ok(redis_url) = std::env::var("REDIS_URL") {
            let mut client = RedisClient::new(&redis_url).await.unwrap();
            let pong = client.ping().await.unwrap();
            assert_eq!(pong, "PONG");
        } else {
            println!("skipping: REDIS_URL not set");
        }
    }
}
