//! TTL-bound distributed locks layered over [`crate::engine::KvEngine`].
//!
//! The engine owns the actual lease primitive (it is Raft-backed, so the
//! lease survives as long as the acquiring node can keep renewing it
//! against a live quorum); this module is just the keep-alive loop and RAII
//! guard the rest of the crate reaches for, instead of pairing acquire and
//! release by hand at every call site.

use crate::engine::KvEngine;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;

/// Cadence at which a held lock's lease is refreshed, fixed per the
/// concurrency model regardless of the lock's own TTL.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

pub struct LockGuard {
    name: String,
    token: u64,
    engine: Arc<dyn KvEngine>,
    stop_keepalive: Option<oneshot::Sender<()>>,
}

impl LockGuard {
    /// Acquire `name` with the given lease TTL and start a background
    /// keep-alive renewal loop. Dropping the guard stops the renewal loop
    /// and best-effort releases the lock.
    pub async fn acquire(engine: Arc<dyn KvEngine>, name: impl Into<String>, ttl: Duration) -> Result<Self> {
        let name = name.into();
        let token = engine.acquire_lock(&name, ttl).await?;

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let keepalive_engine = engine.clone();
        let keepalive_name = name.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = keepalive_engine.renew_lock(&keepalive_name, token, ttl).await {
                            warn!(name = %keepalive_name, error = %e, "lock: keepalive renewal failed");
                        }
                    }
                }
            }
        });

        Ok(Self {
            name,
            token,
            engine,
            stop_keepalive: Some(stop_tx),
        })
    }

    pub async fn release(mut self) -> Result<()> {
        if let Some(tx) = self.stop_keepalive.take() {
            let _ = tx.send(());
        }
        self.engine.release_lock(&self.name, self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_keepalive.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::FakeEngine;

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let engine: Arc<dyn KvEngine> = Arc::new(FakeEngine::new());
        let guard = LockGuard::acquire(engine.clone(), "name-lock", Duration::from_secs(10)).await.unwrap();
        let second = engine.acquire_lock("name-lock", Duration::from_secs(10)).await;
        assert!(second.is_err());
        guard.release().await.unwrap();
        let third = engine.acquire_lock("name-lock", Duration::from_secs(10)).await;
        assert!(third.is_ok());
    }
}
