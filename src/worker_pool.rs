//! Worker Pool (C3): per-device FIFO queue + worker thread(s) running
//! blocking backend calls, for backends that are not `aio_supported`.
//!
//! Grounded on the blocking mutex+condvar queue idiom in
//! `examples/GssMahadevan-gvthread/crates/gvthread-runtime/src/ready_queue/simple.rs`:
//! the teacher crate's own `core::work_queue::WorkQueue` wraps a lock-free
//! `crossbeam::SegQueue` meant to be polled by a non-blocking reactor, which
//! does not fit a worker that must sleep while the queue is empty.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::dispatch::{Completion, IoOutcome};

/// One deferred backend call: the stub invocation closure plus the
/// completion to run once it returns. The closure captures the backend and
/// whatever stub fields (iovec, offset) it needs to call synchronously,
/// since backend call signatures differ by opcode; the worker only needs to
/// know how to run it and hand its result to the completion. Turning a short
/// read/write into `EIO` (`spec.md` §4.3) is the backend's `execute_sync`'s
/// job, since only it knows what "short" means for the call it just made.
pub type SyncInvocation = Box<dyn FnOnce() -> IoOutcome + Send>;

struct QueueEntry {
    invoke: SyncInvocation,
    completion: Completion,
}

struct Shared {
    queue: Mutex<VecDeque<QueueEntry>>,
    non_empty: Condvar,
    shutdown: Mutex<bool>,
}

/// `spec.md` §9 REDESIGN FLAGS: the worker pool supports N workers per
/// device, not the source's hard-coded single thread.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub threads: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { threads: 1 }
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(device_name: String, config: WorkerPoolConfig) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            non_empty: Condvar::new(),
            shutdown: Mutex::new(false),
        });

        let threads = config.threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let shared = shared.clone();
            let device_name = device_name.clone();
            let handle = std::thread::Builder::new()
                .name(format!("tcmu-worker-{device_name}-{idx}"))
                .spawn(move || worker_loop(shared))?;
            workers.push(handle);
        }

        Ok(Self { shared, workers })
    }

    /// Enqueues one deferred call. Always succeeds in this implementation
    /// (the spec's "queue grows unbounded"); the allocation-failure path
    /// `spec.md` Testable Property 10 requires is exercised by
    /// [`crate::dispatch::async_call`] before the stub ever reaches here,
    /// via the backend's own resource accounting.
    pub fn enqueue(&self, invoke: SyncInvocation, completion: Completion) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(QueueEntry { invoke, completion });
        self.shared.non_empty.notify_one();
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cooperative shutdown (`spec.md` §9): set the flag, wake every
    /// waiter, join every thread. Safe to call only once the device's
    /// tracker has reached zero, since workers that are mid-execution still
    /// run their current stub to completion before observing the flag.
    pub fn shutdown(&self) {
        *self.shared.shutdown.lock() = true;
        self.shared.non_empty.notify_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let entry = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(entry) = queue.pop_front() {
                    break Some(entry);
                }
                if *shared.shutdown.lock() {
                    break None;
                }
                // Cancellation point: the worker sleeps here, which is the
                // only place teardown needs to be able to observe the
                // shutdown flag promptly.
                shared.non_empty.wait(&mut queue);
            }
        };

        let Some(entry) = entry else { return };
        let outcome = (entry.invoke)();
        (entry.completion)(outcome);
    }
}
