//! Pre-warmed sandbox slots, one fixed-size pool per image and memory budget.
//!
//! A pool is created the first time its image is asked for. Every slot is
//! started up front, and after that the pool only hands out exclusive leases
//! and recreates slots that an execution failure found dead.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{Mutex, Notify, OnceCell, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

use crate::config::{PoolSettings, SlotLimits};
use crate::constants::{SLOT_NAME_PREFIX, SLOT_RESTART_PAUSE_MS};
use crate::core::errors::PoolError;
use crate::core::traits::backend::Backend;

#[derive(Debug)]
pub struct PoolManager {
    backend: Arc<dyn Backend>,
    settings: PoolSettings,
    pools: DashMap<String, Arc<ImagePool>>,
    seq: AtomicU64,
    closed: AtomicBool,
}

#[derive(Debug)]
struct ImagePool {
    image: String,
    memory_mb: u64,
    seq: u64,
    slots: OnceCell<Vec<Arc<Slot>>>,
    /// Permits == slots not leased.
    semaphore: Arc<Semaphore>,
    /// Signalled whenever a lease unlocks its slot.
    released: Notify,
    cursor: AtomicUsize,
}

#[derive(Debug)]
struct Slot {
    name: String,
    lock: Arc<Mutex<()>>,
}

impl Slot {
    fn new(name: String) -> Self {
        Self {
            name,
            lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Exclusive use of one slot. Dropping the lease releases it.
#[derive(Debug)]
pub struct Lease {
    pool: Arc<ImagePool>,
    slot: Arc<Slot>,
    guard: Option<OwnedMutexGuard<()>>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn image(&self) -> &str {
        &self.pool.image
    }

    pub fn release(self) {
        tracing::debug!("Releasing slot {}", self.slot.name);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        // The slot is unlocked before the permit goes back.
        drop(self.guard.take());
        self.pool.released.notify_waiters();
    }
}

impl ImagePool {
    fn new(image: &str, memory_mb: u64, seq: u64, size: usize) -> Self {
        Self {
            image: image.to_string(),
            memory_mb,
            seq,
            slots: OnceCell::new(),
            semaphore: Arc::new(Semaphore::new(size)),
            released: Notify::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    fn slot_name(&self, index: usize) -> String {
        format!(
            "{SLOT_NAME_PREFIX}_{}_{}_{index}",
            sanitize_image(&self.image),
            self.seq
        )
    }

    /// Callers hold a permit, so at least one slot is unlocked or about to be.
    /// A scan that loses every race waits for the next release and scans again.
    async fn take_free_slot(&self, slots: &[Arc<Slot>]) -> (Arc<Slot>, OwnedMutexGuard<()>) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let start = self.cursor.fetch_add(1, Ordering::Relaxed);
            for offset in 0..slots.len() {
                let slot = &slots[(start + offset) % slots.len()];
                if let Ok(guard) = slot.lock.clone().try_lock_owned() {
                    return (slot.clone(), guard);
                }
            }

            tracing::trace!("Every slot of {} is locked, waiting for a release", self.image);
            released.await;
        }
    }
}

pub fn sanitize_image(image: &str) -> String {
    image.replace([':', '/', '.'], "_")
}

fn pool_key(image: &str, memory_mb: u64) -> String {
    format!("{image}@{memory_mb}m")
}

impl PoolManager {
    pub fn new(backend: Arc<dyn Backend>, settings: PoolSettings) -> Self {
        Self {
            backend,
            settings: PoolSettings {
                size: settings.size.max(1),
                ..settings
            },
            pools: DashMap::new(),
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Waits for a free slot of `image`, starting the pool on first use.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, image: &str, memory_mb: u64) -> Result<Lease, PoolError> {
        let closed = || PoolError::Closed {
            image: image.to_string(),
        };
        let key = pool_key(image, memory_mb);
        let pool = self.pool_for(&key, image, memory_mb);
        // A shutdown may have cleared the registry just before this pool went in.
        if self.closed.load(Ordering::Acquire) {
            self.pools.remove_if(&key, |_, registered| Arc::ptr_eq(registered, &pool));
            return Err(closed());
        }
        let slots = pool.slots.get_or_init(|| self.start_pool(&pool)).await;

        let permit = pool
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| closed())?;
        let (slot, guard) = pool.take_free_slot(slots).await;
        tracing::debug!("Leased slot {}", slot.name);

        Ok(Lease {
            pool,
            slot,
            guard: Some(guard),
            _permit: permit,
        })
    }

    /// Recreates the leased slot in place if it no longer responds.
    #[tracing::instrument(skip(self, lease), fields(slot = lease.name()))]
    pub async fn health_repair(&self, lease: &Lease) {
        if self.backend.is_alive(lease.name()).await {
            return;
        }

        tracing::warn!("Slot {} is not running, recreating it", lease.name());
        self.backend.destroy_slot(lease.name()).await;
        tokio::time::sleep(Duration::from_millis(SLOT_RESTART_PAUSE_MS)).await;

        let limits = SlotLimits::with_memory(lease.pool.memory_mb);
        match self
            .backend
            .create_slot(lease.name(), &lease.pool.image, &limits)
            .await
        {
            Ok(()) => tracing::info!("Slot {} recreated", lease.name()),
            Err(err) => tracing::error!("Failed to recreate slot {}: {}", lease.name(), err),
        }
    }

    /// Destroys every slot of every pool. Pending and later acquires fail
    /// with [`PoolError::Closed`].
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);

        let pools: Vec<Arc<ImagePool>> = self
            .pools
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.pools.clear();

        for pool in &pools {
            pool.semaphore.close();
        }

        let names: Vec<&str> = pools
            .iter()
            .filter_map(|pool| pool.slots.get())
            .flatten()
            .map(|slot| slot.name.as_str())
            .collect();
        tracing::info!("Destroying {} slots in {} pools", names.len(), pools.len());
        join_all(names.iter().map(|name| self.backend.destroy_slot(name))).await;
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    fn pool_for(&self, key: &str, image: &str, memory_mb: u64) -> Arc<ImagePool> {
        self.pools
            .entry(key.to_string())
            .or_insert_with(|| {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                Arc::new(ImagePool::new(image, memory_mb, seq, self.settings.size))
            })
            .value()
            .clone()
    }

    async fn start_pool(&self, pool: &ImagePool) -> Vec<Arc<Slot>> {
        tracing::info!(
            "Starting {} slots for {} ({} MB)",
            self.settings.size,
            pool.image,
            pool.memory_mb
        );

        let limits = SlotLimits::with_memory(pool.memory_mb);
        let names: Vec<String> = (0..self.settings.size)
            .map(|index| pool.slot_name(index))
            .collect();

        let results = join_all(
            names
                .iter()
                .map(|name| self.backend.create_slot(name, &pool.image, &limits)),
        )
        .await;
        for (name, result) in names.iter().zip(results) {
            if let Err(err) = result {
                tracing::warn!("Slot {} failed to start: {}", name, err);
            }
        }

        tokio::time::sleep(self.settings.settle_delay).await;

        names
            .into_iter()
            .map(|name| Arc::new(Slot::new(name)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::time::Instant;

    use super::*;
    use crate::core::traits::backend::{Invocation, RawOutput};
    use crate::stubs::backend::BackendStub;

    fn manager(backend: Arc<BackendStub>, size: usize) -> PoolManager {
        PoolManager::new(
            backend,
            PoolSettings {
                size,
                settle_delay: Duration::ZERO,
            },
        )
    }

    fn stub() -> Arc<BackendStub> {
        Arc::new(BackendStub::new(Ok(RawOutput::default()), Duration::ZERO))
    }

    #[test]
    fn test_sanitize_image() {
        assert_eq!(sanitize_image("node:20-alpine"), "node_20-alpine");
        assert_eq!(
            sanitize_image("mcr.microsoft.com/dotnet/sdk:8.0"),
            "mcr_microsoft_com_dotnet_sdk_8_0"
        );
    }

    #[tokio::test]
    async fn test_pool_created_once_under_concurrency() {
        let backend = stub();
        let pools = manager(backend.clone(), 4);

        let leases = join_all((0..4).map(|_| pools.acquire("python:3.11", 256))).await;
        let names: HashSet<String> = leases
            .iter()
            .map(|lease| lease.as_ref().unwrap().name().to_string())
            .collect();

        assert_eq!(names.len(), 4);
        assert_eq!(backend.created().len(), 4);
        assert_eq!(pools.pool_count(), 1);
        assert!(names.iter().all(|n| n.starts_with("judge_pool_python_3_11_0_")));
    }

    #[tokio::test]
    async fn test_memory_budget_gets_its_own_pool() {
        let backend = stub();
        let pools = manager(backend.clone(), 1);

        let small = pools.acquire("gcc:13", 256).await.unwrap();
        let large = pools.acquire("gcc:13", 768).await.unwrap();

        assert_ne!(small.name(), large.name());
        assert_eq!(pools.pool_count(), 2);
        assert_eq!(backend.created().len(), 2);
    }

    #[tokio::test]
    async fn test_acquire_blocks_past_pool_size() {
        let pools = manager(stub(), 2);

        let first = pools.acquire("gcc:13", 256).await.unwrap();
        let second = pools.acquire("gcc:13", 256).await.unwrap();
        assert_ne!(first.name(), second.name());

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), pools.acquire("gcc:13", 256)).await;
        assert!(blocked.is_err());

        let released = first.name().to_string();
        first.release();

        let third = tokio::time::timeout(Duration::from_secs(1), pools.acquire("gcc:13", 256))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.name(), released);
    }

    #[tokio::test]
    async fn test_leased_slots_never_run_two_batches_at_once() {
        let output = RawOutput {
            stdout: b"ok".to_vec(),
            ..Default::default()
        };
        let backend = Arc::new(BackendStub::new(Ok(output), Duration::from_millis(30)));
        let pools = manager(backend.clone(), 2);
        let invocation = Invocation {
            command: "sh /w/_runner.sh".to_string(),
            privileged: true,
            timeout_ms: 1000,
            stdin: None,
        };

        let (pools, backend, invocation) = (&pools, &backend, &invocation);
        let runs = join_all((0..5).map(|_| async move {
            let lease = pools.acquire("python:3.11", 256).await.unwrap();
            let started = Instant::now();
            let raw = backend.exec(lease.name(), &invocation).await.unwrap();
            let finished = Instant::now();
            let name = lease.name().to_string();
            lease.release();
            (name, started, finished, raw)
        }))
        .await;

        let mut by_slot: HashMap<String, Vec<(Instant, Instant)>> = HashMap::new();
        for (name, started, finished, raw) in runs {
            assert_eq!(raw.stdout, b"ok");
            by_slot.entry(name).or_default().push((started, finished));
        }
        assert_eq!(by_slot.len(), 2);
        for spans in by_slot.values_mut() {
            spans.sort();
            for pair in spans.windows(2) {
                assert!(pair[1].0 >= pair[0].1, "slot reused before its run finished");
            }
        }
    }

    #[tokio::test]
    async fn test_waiter_takes_whichever_slot_frees_up() {
        let pool = Arc::new(ImagePool::new("gcc:13", 256, 0, 2));
        let slots: Vec<Arc<Slot>> = (0..2)
            .map(|index| Arc::new(Slot::new(pool.slot_name(index))))
            .collect();
        let first = slots[0].lock.clone().lock_owned().await;
        let second = Lease {
            pool: pool.clone(),
            slot: slots[1].clone(),
            guard: Some(slots[1].lock.clone().lock_owned().await),
            _permit: pool.semaphore.clone().try_acquire_owned().unwrap(),
        };

        // the scan starts at slot 0, which stays locked throughout
        let waiter = {
            let pool = pool.clone();
            let slots = slots.clone();
            tokio::spawn(async move { pool.take_free_slot(&slots).await.0.name.clone() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(second);

        let name = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, slots[1].name);
        drop(first);
    }

    #[tokio::test]
    async fn test_failed_creation_still_registers_slot() {
        let backend = Arc::new(
            BackendStub::new(Ok(RawOutput::default()), Duration::ZERO).with_failing_creates(),
        );
        let pools = manager(backend.clone(), 2);

        let lease = pools.acquire("swift:5.9-slim", 256).await;

        assert!(lease.is_ok());
        assert_eq!(backend.created().len(), 2);
    }

    #[tokio::test]
    async fn test_health_repair_recreates_dead_slot() {
        let backend = stub();
        let pools = manager(backend.clone(), 1);
        let lease = pools.acquire("ruby:3.2-alpine", 256).await.unwrap();

        backend.mark_dead(lease.name());
        pools.health_repair(&lease).await;

        assert_eq!(backend.destroyed(), vec![lease.name().to_string()]);
        assert_eq!(backend.created().len(), 2);
        assert!(backend.is_alive(lease.name()).await);
    }

    #[tokio::test]
    async fn test_health_repair_leaves_live_slot() {
        let backend = stub();
        let pools = manager(backend.clone(), 1);
        let lease = pools.acquire("ruby:3.2-alpine", 256).await.unwrap();

        pools.health_repair(&lease).await;

        assert!(backend.destroyed().is_empty());
        assert_eq!(backend.created().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_destroys_slots_and_fails_waiters() {
        let backend = stub();
        let pools = Arc::new(manager(backend.clone(), 1));

        let lease = pools.acquire("php:8.2-alpine", 256).await.unwrap();
        pools.acquire("dart:stable", 256).await.unwrap().release();

        let waiter = {
            let pools = pools.clone();
            tokio::spawn(async move { pools.acquire("php:8.2-alpine", 256).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pools.shutdown().await;

        assert!(matches!(
            waiter.await.unwrap(),
            Err(PoolError::Closed { image }) if image == "php:8.2-alpine"
        ));
        assert!(matches!(
            pools.acquire("php:8.2-alpine", 256).await,
            Err(PoolError::Closed { .. })
        ));
        assert_eq!(backend.destroyed().len(), 2);
        assert_eq!(pools.pool_count(), 0);
        drop(lease);
    }

    #[tokio::test]
    async fn test_acquire_after_shutdown_registers_nothing() {
        let backend = stub();
        let pools = manager(backend.clone(), 2);

        pools.shutdown().await;
        let result = pools.acquire("golang:1.21-alpine", 256).await;

        assert!(matches!(
            result,
            Err(PoolError::Closed { image }) if image == "golang:1.21-alpine"
        ));
        assert_eq!(pools.pool_count(), 0);
        assert!(backend.created().is_empty());
    }
}
