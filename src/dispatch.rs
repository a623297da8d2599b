//! Call Stub / Dispatcher (C4): the uniform "one backend operation plus
//! completion" descriptor, and the single entry point that routes it to
//! either the backend's async path or the worker pool.

use std::sync::Arc;

use nix::errno::Errno;

use crate::device::Device;
use crate::iovec::SharedBuffer;

/// Raw result of one backend call, before any SCSI status mapping. This is
/// what actually crosses the backend boundary — `Err(errno)` carries the
/// POSIX errno unmapped, so a layer that cares about lock/connection-loss
/// side effects (`crate::lock::handle_io_errno`, `spec.md` §4.8) can still
/// see `ESHUTDOWN`/`ETIMEDOUT` before it gets collapsed into a
/// [`crate::sense::ScsiStatus`]. `NotHandled` only has meaning for
/// [`CallStub::Passthrough`]: the backend declines the CDB outright rather
/// than attempting and failing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    Ok,
    Err(Errno),
    NotHandled,
}

/// A completion callback: invoked exactly once, regardless of whether the
/// stub ran synchronously on a worker thread or asynchronously on a
/// backend-owned thread.
pub type Completion = Box<dyn FnOnce(IoOutcome) + Send>;

/// One backend operation, as described in `spec.md` §3. Tagged by the
/// primitive it serves; `buf`/`offset` name the bytes moved, where
/// applicable. `Passthrough` is the fourth tagged variant: it hands the raw
/// CDB (and whatever I/O vector came with it) to a backend that may decline.
pub enum CallStub {
    Read { buf: SharedBuffer, offset: u64 },
    Write { buf: SharedBuffer, offset: u64 },
    Flush,
    Passthrough { cdb: Vec<u8>, buf: SharedBuffer },
}

/// `spec.md` §9: replaces the source's overloaded
/// `ASYNC_HANDLED | status_code` return with an explicit sum type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The backend (or worker pool) accepted the stub; its completion will
    /// be invoked exactly once, later, from some thread.
    Pending,
    /// The stub was resolved (successfully, with an error, or declined)
    /// before any completion was invoked; the caller owns delivering this
    /// result itself.
    Done(IoOutcome),
}

/// Single entry point for submitting one backend operation (`spec.md`
/// §4.4).
///
/// Ordering guarantee: for a single command, no completion fires before this
/// function returns its outcome to the caller — the aio path calls directly
/// into the backend, which by contract only calls `completion` once it
/// itself has returned control, and the worker-pool path only signals its
/// condition variable after the entry has already been pushed and this
/// function is about to return.
pub fn async_call(dev: &Arc<Device>, stub: CallStub, completion: Completion) -> Outcome {
    if dev.backend.aio_supported() {
        return dev.backend.submit_async(stub, completion);
    }

    let pool = dev
        .worker_pool
        .as_ref()
        .expect("device with a non-aio backend must have a worker pool");
    let backend = dev.backend.clone();

    pool.enqueue(Box::new(move || backend.execute_sync(stub)), completion);
    Outcome::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::device::{Device, DeviceConfig};
    use crate::iovec::IoVec;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn device(aio: bool) -> Arc<Device> {
        let backend = Arc::new(MockBackend::new(65536).with_aio(aio));
        Arc::new(
            Device::new(
                DeviceConfig { block_size: 512, num_lbas: 128, max_xfer_len: 256, write_cache_enabled: false },
                backend,
            )
            .unwrap(),
        )
    }

    #[test]
    fn sync_backend_returns_pending_and_runs_on_worker() {
        let dev = device(false);
        let buf = IoVec::zeroed(512).into_shared();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();

        let outcome = async_call(
            &dev,
            CallStub::Read { buf, offset: 0 },
            Box::new(move |outcome| {
                assert_eq!(outcome, IoOutcome::Ok);
                done2.store(true, Ordering::SeqCst);
            }),
        );

        assert_eq!(outcome, Outcome::Pending);
        for _ in 0..200 {
            if done.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn aio_backend_runs_inline_and_returns_pending() {
        let dev = device(true);
        let buf = IoVec::zeroed(512).into_shared();
        let outcome = async_call(&dev, CallStub::Read { buf, offset: 0 }, Box::new(|_| {}));
        assert_eq!(outcome, Outcome::Pending);
    }
}
