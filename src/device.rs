//! The `Device` data model (`spec.md` §3): a logical unit presenting a block
//! device backed by a [`crate::backend::StoreBackend`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::backend::StoreBackend;
use crate::error::CoreError;
use crate::tracker::AioTracker;
use crate::worker_pool::{WorkerPool, WorkerPoolConfig};

/// Lock state transitions from `spec.md` §3/§4.8: `acquire()` moves
/// `Unlocked -> Owned` or leaves it `Unlocked`; `notify_lock_lost` moves any
/// state to `Lost`; `notify_conn_lost` moves any state to `ConnectionLost`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Owned,
    Lost,
    ConnectionLost,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    pub block_size: u32,
    pub num_lbas: u64,
    pub max_xfer_len: u32,
    pub write_cache_enabled: bool,
}

/// A logical unit. Created when the transport opens a LUN; destroyed only
/// after [`AioTracker::is_idle`] and the worker pool (if any) has drained
/// (`spec.md` §3 lifecycle).
pub struct Device {
    /// Stable identity for log correlation, independent of `name` (which a
    /// transport may reuse across LUN re-opens). Mirrors the teacher's
    /// `BlockDevice`/replica `Uuid` convention (`core/block_device.rs`).
    pub id: Uuid,
    pub name: String,
    pub config: DeviceConfig,
    pub backend: Arc<dyn StoreBackend>,
    pub tracker: AioTracker,
    /// Present iff the backend is not `aio_supported` (`spec.md` §3).
    pub worker_pool: Option<WorkerPool>,
    lock_state: Mutex<LockState>,
    next_id: AtomicU32,
}

impl Device {
    pub fn new(config: DeviceConfig, backend: Arc<dyn StoreBackend>) -> Result<Self, CoreError> {
        Self::named("unnamed".to_string(), config, backend)
    }

    pub fn named(
        name: String,
        config: DeviceConfig,
        backend: Arc<dyn StoreBackend>,
    ) -> Result<Self, CoreError> {
        let worker_pool = if backend.aio_supported() {
            None
        } else {
            Some(
                WorkerPool::start(name.clone(), WorkerPoolConfig::default()).map_err(|err| {
                    CoreError::WorkerPoolStart { device: name.clone(), reason: err.to_string() }
                })?,
            )
        };

        backend.open();
        let id = Uuid::new_v4();
        info!(%id, device = %name, "device opened");

        Ok(Self {
            id,
            name,
            config,
            backend,
            tracker: AioTracker::new(),
            worker_pool,
            lock_state: Mutex::new(LockState::Unlocked),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    pub fn num_lbas(&self) -> u64 {
        self.config.num_lbas
    }

    pub fn max_xfer_len(&self) -> u32 {
        self.config.max_xfer_len
    }

    pub fn lba_to_offset(&self, lba: u64) -> u64 {
        lba * self.config.block_size as u64
    }

    pub fn lock_state(&self) -> LockState {
        *self.lock_state.lock()
    }

    pub fn set_lock_state(&self, state: LockState) {
        *self.lock_state.lock() = state;
    }

    /// Graceful teardown: asserts the device is idle, then drains the
    /// worker pool. Per `spec.md` §5, the tracker reaching zero is the only
    /// precondition; the worker pool itself has nothing left to run once
    /// idle, so draining is a cooperative-shutdown join rather than a
    /// cancellation of in-flight work.
    pub fn shutdown(&self) {
        debug_assert!(self.tracker.is_idle(), "device torn down with commands still in flight");
        if let Some(pool) = &self.worker_pool {
            pool.shutdown();
        }
        self.backend.close();
    }

    pub(crate) fn next_request_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
