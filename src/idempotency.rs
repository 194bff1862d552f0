use redis::AsyncCommands;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Fresh,
    /// The correlation id was seen before; `row_key` is the row it started.
    Duplicate { row_key: String },
}

/// Remembers trigger correlation ids so a re-delivered trigger does not start
/// a second run. Redis `SET NX EX` when configured, process memory otherwise
/// or when redis is unreachable.
#[derive(Clone)]
pub struct TriggerLedger {
    redis: Option<redis::Client>,
    local: Arc<Mutex<HashMap<String, (String, Instant)>>>,
    ttl: Duration,
}

impl TriggerLedger {
    pub fn new(redis: Option<redis::Client>, ttl: Duration) -> Self {
        Self {
            redis,
            local: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    fn key(correlation_id: &str) -> String {
        format!("research:trigger:{correlation_id}")
    }

    pub async fn claim(&self, correlation_id: &str, row_key: &str) -> Claim {
        if let Some(client) = &self.redis {
            match redis_claim(client, &Self::key(correlation_id), row_key, self.ttl).await {
                Ok(claim) => return claim,
                Err(err) => warn!(
                    target = "research.api",
                    error = %err,
                    "trigger ledger unavailable in redis; using process memory"
                ),
            }
        }
        self.local_claim(correlation_id, row_key).await
    }

    /// Forgets a claim whose trigger was not accepted after all, so the
    /// sender's retry is treated as fresh.
    pub async fn release(&self, correlation_id: &str) {
        if let Some(client) = &self.redis {
            let key = Self::key(correlation_id);
            let released: redis::RedisResult<()> = async {
                let mut conn = client.get_multiplexed_async_connection().await?;
                conn.del(&key).await
            }
            .await;
            if let Err(err) = released {
                warn!(
                    target = "research.api",
                    error = %err,
                    "could not release trigger claim in redis"
                );
            }
        }
        self.local.lock().await.remove(correlation_id);
    }

    async fn local_claim(&self, correlation_id: &str, row_key: &str) -> Claim {
        let mut guard = self.local.lock().await;
        let now = Instant::now();
        guard.retain(|_, (_, expires)| *expires > now);
        if let Some((existing, _)) = guard.get(correlation_id) {
            return Claim::Duplicate {
                row_key: existing.clone(),
            };
        }
        guard.insert(
            correlation_id.to_string(),
            (row_key.to_string(), now + self.ttl),
        );
        Claim::Fresh
    }
}

async fn redis_claim(
    client: &redis::Client,
    key: &str,
    row_key: &str,
    ttl: Duration,
) -> redis::RedisResult<Claim> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let reply: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(row_key)
        .arg("NX")
        .arg("EX")
        .arg(ttl.as_secs().max(1))
        .query_async(&mut conn)
        .await?;
    if reply.is_some() {
        return Ok(Claim::Fresh);
    }
    let existing: Option<String> = conn.get(key).await?;
    debug!(target = "research.api", key, "duplicate trigger");
    Ok(Claim::Duplicate {
        row_key: existing.unwrap_or_else(|| row_key.to_string()),
    })
}
