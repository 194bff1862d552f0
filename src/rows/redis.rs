use super::{Applied, RowError, RowRecord, RowStatus, RowStore, StoreError, Transition, apply};
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_ATTEMPTS: usize = 8;

// ARGV[1] is the JSON the caller read ("" when absent).
const CAS_SCRIPT: &str = r#"
local current = redis.call("GET", KEYS[1])
if (current == false and ARGV[1] == "") or current == ARGV[1] then
  redis.call("SET", KEYS[1], ARGV[2], "EX", ARGV[3])
  return 1
end
return 0
"#;

// Deletes KEYS[1] only while it still holds ARGV[1].
const WITHDRAW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Rows shared across processes. Each transition is an optimistic
/// read-apply-compare-and-set, retried when another writer got there first.
#[derive(Clone)]
pub struct RedisRowStore {
    client: redis::Client,
    ttl: Duration,
}

impl RedisRowStore {
    pub fn new(client: redis::Client, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    fn key(row_key: &str) -> String {
        format!("research:row:{row_key}")
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

fn decode(raw: Option<&str>) -> Result<Option<RowRecord>, StoreError> {
    raw.map(|json| serde_json::from_str(json).map_err(|err| StoreError::Corrupt(err.to_string())))
        .transpose()
}

#[async_trait]
impl RowStore for RedisRowStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn load(&self, row_key: &str) -> Result<Option<RowRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(Self::key(row_key))
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        decode(raw.as_deref())
    }

    async fn transition(
        &self,
        row_key: &str,
        transition: Transition,
    ) -> Result<RowRecord, RowError> {
        let key = Self::key(row_key);
        let mut conn = self.connection().await?;
        let script = redis::Script::new(CAS_SCRIPT);
        for attempt in 1..=MAX_ATTEMPTS {
            let raw: Option<String> = conn
                .get(&key)
                .await
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            let current = decode(raw.as_deref())?;
            let record = match apply(row_key, current.as_ref(), &transition, Utc::now())? {
                Applied::Changed(record) => record,
                Applied::Unchanged => {
                    return current.ok_or_else(|| {
                        StoreError::Corrupt(format!("row {row_key} vanished")).into()
                    });
                }
            };
            let json = serde_json::to_string(&record)
                .map_err(|err| StoreError::Corrupt(err.to_string()))?;
            let swapped: i64 = script
                .key(&key)
                .arg(raw.as_deref().unwrap_or(""))
                .arg(&json)
                .arg(self.ttl.as_secs().max(1))
                .invoke_async(&mut conn)
                .await
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            if swapped == 1 {
                debug!(
                    target = "research.rows",
                    row_key,
                    transition = transition.name(),
                    status = %record.status,
                    attempt,
                    "row updated"
                );
                return Ok(record);
            }
            warn!(
                target = "research.rows",
                row_key,
                attempt,
                "lost row update race; retrying"
            );
        }
        Err(StoreError::Contention(row_key.to_string()).into())
    }

    async fn withdraw(&self, row_key: &str) -> Result<bool, StoreError> {
        let key = Self::key(row_key);
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(&key)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let Some(raw) = raw else {
            return Ok(false);
        };
        if decode(Some(&raw))?.map(|row| row.status) != Some(RowStatus::Pending) {
            return Ok(false);
        }
        let deleted: i64 = redis::Script::new(WITHDRAW_SCRIPT)
            .key(&key)
            .arg(&raw)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        if deleted == 1 {
            debug!(target = "research.rows", row_key, "pending row withdrawn");
        }
        Ok(deleted == 1)
    }
}
