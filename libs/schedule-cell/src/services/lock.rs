use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use deadpool_redis::{Config, Pool, Runtime};
use tokio::runtime::Handle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ScheduleError, ScheduleResult};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);
const LOCK_KEY_PREFIX: &str = "slot_generation_lock";

// Deletes the key only while it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

type HeldSet = Arc<Mutex<HashSet<i64>>>;

#[derive(Clone)]
enum LockBackend {
    Local(HeldSet),
    Redis { pool: Pool, lease: Duration },
}

/// Proof of holding the generation lock for one doctor-branch.
///
/// Dropping the token releases the lock, so a cancelled run cannot leave the
/// doctor-branch locked. [`GenerationLock::release`] does the same but waits for
/// the Redis round trip.
pub struct LockToken {
    pub doctor_branch_id: i64,
    token: String,
    backend: Option<LockBackend>,
}

impl std::fmt::Debug for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockToken")
            .field("doctor_branch_id", &self.doctor_branch_id)
            .field("held", &self.backend.is_some())
            .finish()
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        let doctor_branch_id = self.doctor_branch_id;

        match backend {
            LockBackend::Local(held) => {
                lock_set(&held).remove(&doctor_branch_id);
                debug!("Dropped generation lock for doctor-branch {}", doctor_branch_id);
            }
            LockBackend::Redis { pool, .. } => {
                let token = std::mem::take(&mut self.token);
                match Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            if let Err(e) = release_redis(&pool, doctor_branch_id, &token).await {
                                warn!(
                                    "Failed to release dropped generation lock of doctor-branch {}: {}",
                                    doctor_branch_id, e
                                );
                            }
                        });
                    }
                    Err(_) => warn!(
                        "Generation lock of doctor-branch {} dropped outside a runtime, left to expire",
                        doctor_branch_id
                    ),
                }
            }
        }
    }
}

/// Serializes slot generation per doctor-branch, either within this process
/// or across instances through Redis.
pub struct GenerationLock {
    backend: LockBackend,
}

impl GenerationLock {
    pub fn local() -> Self {
        Self {
            backend: LockBackend::Local(Arc::new(Mutex::new(HashSet::new()))),
        }
    }

    /// `lease` bounds how long a crashed holder can keep the key.
    pub async fn redis(redis_url: &str, lease: Duration) -> ScheduleResult<Self> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ScheduleError::LockBackend(format!("Failed to create Redis pool: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| ScheduleError::LockBackend(format!("Failed to connect to Redis: {}", e)))?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!("Redis generation lock initialized");
        Ok(Self {
            backend: LockBackend::Redis { pool, lease },
        })
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self.backend, LockBackend::Redis { .. })
    }

    pub async fn try_acquire(&self, doctor_branch_id: i64) -> ScheduleResult<Option<LockToken>> {
        let token = Uuid::new_v4().to_string();

        let acquired = match &self.backend {
            LockBackend::Local(held) => lock_set(held).insert(doctor_branch_id),
            LockBackend::Redis { pool, lease } => {
                let mut conn = pool
                    .get()
                    .await
                    .map_err(|e| ScheduleError::LockBackend(e.to_string()))?;
                let reply: Option<String> = redis::cmd("SET")
                    .arg(lock_key(doctor_branch_id))
                    .arg(&token)
                    .arg("NX")
                    .arg("PX")
                    .arg(lease.as_millis() as u64)
                    .query_async(&mut conn)
                    .await?;
                reply.is_some()
            }
        };

        Ok(acquired.then(|| LockToken {
            doctor_branch_id,
            token,
            backend: Some(self.backend.clone()),
        }))
    }

    /// Waits up to `wait` for the lock, then gives up with [`ScheduleError::Busy`].
    pub async fn acquire(&self, doctor_branch_id: i64, wait: Duration) -> ScheduleResult<LockToken> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(token) = self.try_acquire(doctor_branch_id).await? {
                debug!("Acquired generation lock for doctor-branch {}", doctor_branch_id);
                return Ok(token);
            }
            if Instant::now() >= deadline {
                warn!(
                    "Gave up waiting {:?} for generation lock of doctor-branch {}",
                    wait, doctor_branch_id
                );
                return Err(ScheduleError::Busy(doctor_branch_id));
            }
            sleep(RETRY_INTERVAL).await;
        }
    }

    pub async fn release(&self, mut token: LockToken) -> ScheduleResult<()> {
        let doctor_branch_id = token.doctor_branch_id;
        match token.backend.take() {
            Some(LockBackend::Local(held)) => {
                lock_set(&held).remove(&doctor_branch_id);
            }
            Some(LockBackend::Redis { pool, .. }) => {
                release_redis(&pool, doctor_branch_id, &token.token).await?;
            }
            None => {}
        }
        debug!("Released generation lock for doctor-branch {}", doctor_branch_id);
        Ok(())
    }
}

fn lock_set(held: &HeldSet) -> MutexGuard<'_, HashSet<i64>> {
    held.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn release_redis(pool: &Pool, doctor_branch_id: i64, token: &str) -> ScheduleResult<()> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| ScheduleError::LockBackend(e.to_string()))?;
    let released: i32 = redis::Script::new(RELEASE_SCRIPT)
        .key(lock_key(doctor_branch_id))
        .arg(token)
        .invoke_async(&mut conn)
        .await?;
    if released == 0 {
        warn!(
            "Generation lock of doctor-branch {} expired before release",
            doctor_branch_id
        );
    }
    Ok(())
}

fn lock_key(doctor_branch_id: i64) -> String {
    format!("{}:{}", LOCK_KEY_PREFIX, doctor_branch_id)
}
