use super::bridge::{BridgeError, CalculationBridge, SurfaceLayout};
use rand::Rng;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{Duration, Instant, sleep, timeout},
};
use tracing::{debug, warn};
use uuid::Uuid;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LeaseError {
    #[error("no scratch row became free within {waited_ms}ms")]
    ContentionTimeout { waited_ms: u64 },
    #[error("surface fence unavailable: {0}")]
    Fence(String),
    #[error("surface pool closed")]
    Closed,
}

/// Exclusive, bounded-wait access to the scratch rows of the calculation
/// surface. In-process exclusion uses a semaphore and a free list; the
/// optional redis fence extends it across processes sharing one sheet.
#[derive(Clone)]
pub struct SurfacePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    slots: Vec<Arc<CalculationBridge>>,
    available: Mutex<Vec<usize>>,
    semaphore: Arc<Semaphore>,
    fence: Option<RedisFence>,
}

impl PoolInner {
    fn give_back(&self, index: usize) {
        self.available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(index);
    }
}

impl SurfacePool {
    pub fn new(slots: Vec<CalculationBridge>, fence: Option<RedisFence>) -> Result<Self, BridgeError> {
        if slots.is_empty() {
            return Err(BridgeError::Layout("surface pool needs at least one row".into()));
        }
        for (i, left) in slots.iter().enumerate() {
            for right in &slots[i + 1..] {
                if left.layout().overlaps(right.layout()) {
                    return Err(BridgeError::Layout(format!(
                        "scratch rows {} and {} share cells",
                        left.layout().row,
                        right.layout().row
                    )));
                }
            }
        }
        let count = slots.len();
        // popped from the back, so the first configured row is handed out first
        let available = (0..count).rev().collect();
        Ok(Self {
            inner: Arc::new(PoolInner {
                slots: slots.into_iter().map(Arc::new).collect(),
                available: Mutex::new(available),
                semaphore: Arc::new(Semaphore::new(count)),
                fence,
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn idle(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    pub async fn acquire(&self, wait: Duration) -> Result<SurfaceLease, LeaseError> {
        let started = Instant::now();
        let permit = match timeout(wait, self.inner.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(LeaseError::Closed),
            Err(_) => {
                return Err(LeaseError::ContentionTimeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
        };
        let index = self
            .inner
            .available
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop()
            .ok_or(LeaseError::Closed)?;
        let mut lease = SurfaceLease {
            pool: self.inner.clone(),
            index,
            fence_token: None,
            _permit: permit,
        };
        if let Some(fence) = &self.inner.fence {
            let remaining = wait.saturating_sub(started.elapsed());
            let key = fence.key_for(lease.bridge().layout());
            lease.fence_token = Some(fence.acquire(key, remaining).await?);
        }
        debug!(
            target = "research.surface",
            row = lease.bridge().layout().row,
            waited_ms = started.elapsed().as_millis() as u64,
            "surface lease acquired"
        );
        Ok(lease)
    }
}

/// Held across write, propagation and read. Dropping the lease returns the
/// row to the pool; `release` also clears the inputs and the fence.
pub struct SurfaceLease {
    pool: Arc<PoolInner>,
    index: usize,
    fence_token: Option<FenceToken>,
    _permit: OwnedSemaphorePermit,
}

impl SurfaceLease {
    pub fn bridge(&self) -> &CalculationBridge {
        &self.pool.slots[self.index]
    }

    pub async fn release(mut self) {
        if let Err(err) = self.bridge().clear_inputs().await {
            warn!(
                target = "research.surface",
                row = self.bridge().layout().row,
                error = %err,
                "failed to clear scratch row"
            );
        }
        if let (Some(fence), Some(token)) = (self.pool.fence.clone(), self.fence_token.take())
            && let Err(err) = fence.release(&token).await
        {
            warn!(
                target = "research.surface",
                key = %token.key,
                error = %err,
                "failed to release surface fence"
            );
        }
    }
}

impl Drop for SurfaceLease {
    fn drop(&mut self) {
        // runs before the permit field is dropped, so the index is back in the
        // free list by the time a waiter is woken
        self.pool.give_back(self.index);
    }
}

#[derive(Debug, Clone)]
pub struct FenceToken {
    key: String,
    token: String,
}

/// Cross-process lock on a scratch row: `SET key token NX PX ttl`, released by
/// compare-and-delete so an expired holder cannot free someone else's lock.
#[derive(Clone)]
pub struct RedisFence {
    client: redis::Client,
    ttl: Duration,
}

impl RedisFence {
    pub fn new(client: redis::Client, ttl: Duration) -> Self {
        Self { client, ttl }
    }

    fn key_for(&self, layout: &SurfaceLayout) -> String {
        format!("research:surface:{}:{}", layout.sheet, layout.row)
    }

    async fn acquire(&self, key: String, wait: Duration) -> Result<FenceToken, LeaseError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| LeaseError::Fence(err.to_string()))?;
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        loop {
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(|err| LeaseError::Fence(err.to_string()))?;
            if reply.is_some() {
                return Ok(FenceToken { key, token });
            }
            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Err(LeaseError::ContentionTimeout {
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            let jitter = Duration::from_millis(rand::rng().random_range(50..=250));
            sleep(jitter.min(wait - elapsed)).await;
        }
    }

    async fn release(&self, token: &FenceToken) -> Result<bool, LeaseError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| LeaseError::Fence(err.to_string()))?;
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&token.key)
            .arg(&token.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| LeaseError::Fence(err.to_string()))?;
        Ok(deleted == 1)
    }
}
