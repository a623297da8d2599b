//! Primitive Ops (C5): read, write, flush, passthrough.
//!
//! Also hosts the small "run exactly once" plumbing ([`run_stub`]) that both
//! the whole-command primitives here and the composite sub-legs in
//! `crate::composite` build on, since a composite step is itself just a
//! primitive read/write whose completion chains into the next step instead
//! of delivering to the transport (`spec.md` §1, §4.6).

use std::sync::Arc;

use parking_lot::Mutex;

use crate::command::Command;
use crate::device::Device;
use crate::dispatch::{self, CallStub, IoOutcome, Outcome};
use crate::iovec::{shared_to_iovec, IoVec, SharedBuffer};
use crate::lock;
use crate::sense::{Asc, ScsiStatus, SenseKey};
use crate::transport::Transport;

/// Runs one backend call, guaranteeing `on_result` is invoked exactly once
/// with the raw [`IoOutcome`] — whether the backend (or worker pool)
/// completed it asynchronously, or the dispatcher reported an immediate
/// synchronous result. `spec.md` §9's "shared ownership of the original
/// command" note is what this exists to satisfy: `on_result` typically owns
/// the in-flight `Command` by capture, and must get it back on exactly one
/// of the two possible code paths below, never both.
fn run_stub(dev: &Arc<Device>, stub: CallStub, on_result: impl FnOnce(IoOutcome) + Send + 'static) {
    let slot: Arc<Mutex<Option<Box<dyn FnOnce(IoOutcome) + Send>>>> =
        Arc::new(Mutex::new(Some(Box::new(on_result))));
    let slot2 = slot.clone();

    let outcome = dispatch::async_call(
        dev,
        stub,
        Box::new(move |outcome| {
            if let Some(f) = slot2.lock().take() {
                f(outcome);
            }
        }),
    );

    if let Outcome::Done(outcome) = outcome {
        if let Some(f) = slot.lock().take() {
            f(outcome);
        }
    }
}

/// One primitive backend call. The [`crate::tracker::AioTracker`] is
/// bracketed once per *command* (by the whole-command primitives and
/// composite entry points below), not once per leg — a composite issues
/// several of these in sequence (read then write) and must only count as one
/// in-flight command, matching [`command_finish`]'s single matching
/// `track_finish`.
fn submit_leg(dev: &Arc<Device>, stub: CallStub, on_result: impl FnOnce(IoOutcome) + Send + 'static) {
    run_stub(dev, stub, on_result);
}

/// Maps one backend leg's raw outcome to the [`ScsiStatus`] a primitive or
/// composite step reports, routing any error through
/// [`crate::lock::handle_io_errno`] so `ESHUTDOWN`/`ETIMEDOUT` raise the
/// lock/connection-loss notifications `spec.md` §4.8 requires before the
/// status ever reaches a composite's `status != ScsiStatus::Good` check.
/// `NotHandled` never occurs for a `Read`/`Write`/`Flush` leg — only
/// [`CallStub::Passthrough`] produces it — so it is handled defensively here
/// rather than asserted away.
fn leg_status(dev: &Arc<Device>, transport: &Arc<dyn Transport>, outcome: IoOutcome) -> ScsiStatus {
    match outcome {
        IoOutcome::Ok => ScsiStatus::Good,
        IoOutcome::Err(errno) => lock::handle_io_errno(dev, transport, errno),
        IoOutcome::NotHandled => {
            error!("backend declined a non-passthrough primitive leg");
            ScsiStatus::CheckCondition(SenseKey::MediumError, Asc::READ_ERROR)
        }
    }
}

/// A primitive read sub-leg, handing the filled buffer to `on_result` rather
/// than assuming it should land straight in a `Command`'s I/O vector, since
/// composite reads fill a scratch buffer instead (`crate::composite`).
pub(crate) fn primitive_read(
    dev: &Arc<Device>,
    transport: &Arc<dyn Transport>,
    offset: u64,
    len: usize,
    on_result: impl FnOnce(IoVec, ScsiStatus) + Send + 'static,
) {
    let buf = IoVec::zeroed(len).into_shared();
    let result_buf = buf.clone();
    let dev = dev.clone();
    let transport = transport.clone();
    submit_leg(&dev, CallStub::Read { buf, offset }, move |outcome| {
        let status = leg_status(&dev, &transport, outcome);
        on_result(shared_to_iovec(&result_buf), status);
    });
}

pub(crate) fn primitive_write(
    dev: &Arc<Device>,
    transport: &Arc<dyn Transport>,
    offset: u64,
    data: IoVec,
    on_result: impl FnOnce(ScsiStatus) + Send + 'static,
) {
    let buf: SharedBuffer = data.into_shared();
    let dev = dev.clone();
    let transport = transport.clone();
    submit_leg(&dev, CallStub::Write { buf, offset }, move |outcome| {
        on_result(leg_status(&dev, &transport, outcome));
    });
}

pub(crate) fn primitive_flush(
    dev: &Arc<Device>,
    transport: &Arc<dyn Transport>,
    on_result: impl FnOnce(ScsiStatus) + Send + 'static,
) {
    let dev = dev.clone();
    let transport = transport.clone();
    submit_leg(&dev, CallStub::Flush, move |outcome| {
        on_result(leg_status(&dev, &transport, outcome));
    });
}

/// Delivers `status` to the transport for `cmd` and performs the
/// processing-complete signal if the tracker just went idle (`spec.md`
/// §4.2/§4.5's `finish_primitive`/`command_finish(cmd, status,
/// complete=true)`).
pub fn command_finish(dev: &Arc<Device>, transport: &Arc<dyn Transport>, cmd: Command, status: ScsiStatus) {
    let idle = dev.tracker.track_finish();
    transport.complete(cmd, status);
    if idle {
        transport.processing_complete(&dev.name);
    }
}

/// Whole-command READ (`spec.md` §4.5 / opcode table READ_6/10/12/16).
pub fn read(dev: &Arc<Device>, transport: &Arc<dyn Transport>, mut cmd: Command, offset: u64) {
    dev.tracker.track_start();
    let len = cmd.iovec.len();
    let request_id = dev.next_request_id();
    trace!(request_id, offset, len, "READ dispatched");
    let dev2 = dev.clone();
    let transport2 = transport.clone();
    primitive_read(dev, transport, offset, len, move |data, status| {
        if status == ScsiStatus::Good {
            cmd.iovec = data;
        }
        trace!(request_id, ?status, "READ finished");
        command_finish(&dev2, &transport2, cmd, status);
    });
}

/// Whole-command WRITE (`spec.md` §4.5 / opcode table WRITE_6/10/12/16).
pub fn write(dev: &Arc<Device>, transport: &Arc<dyn Transport>, cmd: Command, offset: u64) {
    dev.tracker.track_start();
    let request_id = dev.next_request_id();
    let len = cmd.iovec.len();
    trace!(request_id, offset, len, "WRITE dispatched");
    let dev2 = dev.clone();
    let transport2 = transport.clone();
    let data = cmd.iovec.clone();
    primitive_write(dev, transport, offset, data, move |status| {
        trace!(request_id, ?status, "WRITE finished");
        command_finish(&dev2, &transport2, cmd, status);
    });
}

/// Whole-command SYNCHRONIZE_CACHE(_16) (`spec.md` opcode table).
pub fn flush(dev: &Arc<Device>, transport: &Arc<dyn Transport>, cmd: Command) {
    dev.tracker.track_start();
    let request_id = dev.next_request_id();
    trace!(request_id, "FLUSH dispatched");
    let dev2 = dev.clone();
    let transport2 = transport.clone();
    primitive_flush(dev, transport, move |status| {
        trace!(request_id, ?status, "FLUSH finished");
        command_finish(&dev2, &transport2, cmd, status);
    });
}

/// Passthrough (`spec.md` §4.5/§6): gives the backend first refusal on the
/// CDB. Routed through [`submit_leg`] exactly like every other primitive —
/// on a non-aio backend that means the worker pool, not a thread of its own,
/// so passthrough shares the device's bounded FIFO and thread-reuse and
/// teardown-join guarantees instead of bypassing them (`crate::worker_pool`).
/// `NotHandled` becomes an ILLEGAL_REQUEST/INVALID_CDB check condition, the
/// same fallback the opcode table uses for a CDB it does not recognize at
/// all (`crate::opcode`).
pub fn passthrough(dev: &Arc<Device>, transport: &Arc<dyn Transport>, mut cmd: Command) {
    dev.tracker.track_start();

    let cdb = cmd.cdb.clone();
    let buf: SharedBuffer = std::mem::replace(&mut cmd.iovec, IoVec::zeroed(0)).into_shared();
    let result_buf = buf.clone();
    let dev2 = dev.clone();
    let transport2 = transport.clone();

    submit_leg(dev, CallStub::Passthrough { cdb, buf }, move |outcome| {
        finish_passthrough(&dev2, &transport2, cmd, &result_buf, outcome);
    });
}

fn finish_passthrough(
    dev: &Arc<Device>,
    transport: &Arc<dyn Transport>,
    mut cmd: Command,
    result_buf: &SharedBuffer,
    outcome: IoOutcome,
) {
    match outcome {
        IoOutcome::NotHandled => {
            let status = crate::sense::encode_sense(
                &mut cmd.sense,
                ScsiStatus::CheckCondition(SenseKey::IllegalRequest, Asc::INVALID_CDB),
                None,
            );
            command_finish(dev, transport, cmd, status);
        }
        other => {
            cmd.iovec = shared_to_iovec(result_buf);
            let status = leg_status(dev, transport, other);
            command_finish(dev, transport, cmd, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::device::DeviceConfig;
    use crate::iovec::IoVec;
    use crate::test_support::RecordingTransport;

    fn device(capacity: usize, aio: bool) -> (Arc<Device>, Arc<RecordingTransport>) {
        let backend = Arc::new(MockBackend::new(capacity).with_aio(aio));
        let dev = Arc::new(
            Device::new(
                DeviceConfig {
                    block_size: 512,
                    num_lbas: (capacity / 512) as u64,
                    max_xfer_len: 256,
                    write_cache_enabled: false,
                },
                backend,
            )
            .expect("device"),
        );
        (dev, Arc::new(RecordingTransport::default()))
    }

    /// Regression test for the tracker bookkeeping: one whole-command
    /// `track_start` must be matched by exactly one `track_finish` inside
    /// [`command_finish`], regardless of how many backend legs the command
    /// issues underneath. A double-decrement here would trip the
    /// `AioTracker` underflow assertion in debug builds.
    #[test]
    fn single_write_leaves_tracker_idle() {
        let (dev, transport) = device(4096, false);
        let cmd = Command::new(IoVec::from_bytes(vec![0x11u8; 512]));

        write(&dev, &(transport.clone() as Arc<dyn Transport>), cmd, 0);
        transport.wait_for_completion();

        assert_eq!(transport.last_status(), Some(ScsiStatus::Good));
        assert!(dev.tracker.is_idle());
    }

    /// Transport that accumulates every completion instead of the
    /// single-slot rendezvous `RecordingTransport` uses, so a test can fire
    /// several commands without waiting between them and still observe every
    /// completion once all of them land.
    #[derive(Default)]
    struct CountingTransport {
        statuses: Mutex<Vec<ScsiStatus>>,
        processing_complete: std::sync::atomic::AtomicUsize,
    }

    impl CountingTransport {
        fn completed(&self) -> usize {
            self.statuses.lock().len()
        }
    }

    impl Transport for CountingTransport {
        fn complete(&self, _cmd: Command, status: ScsiStatus) {
            self.statuses.lock().push(status);
        }

        fn processing_complete(&self, _device: &str) {
            self.processing_complete.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        fn notify_lock_lost(&self, _device: &str) {}

        fn notify_conn_lost(&self, _device: &str) {}
    }

    /// S6: a sync (non-aio) backend shunts primitives onto the worker pool.
    /// Eight writes are dispatched from separate threads, genuinely
    /// overlapping in flight through the command-dispatch path (not waited on
    /// one at a time), and must all complete with the tracker returning to
    /// zero and at least one `processing_complete` (batched-reap signal)
    /// observed.
    #[test]
    fn s6_sync_backend_drains_concurrent_writes_on_worker_pool() {
        let (dev, _) = device(8192, false);
        let transport: Arc<CountingTransport> = Arc::new(CountingTransport::default());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dev = dev.clone();
                let transport = transport.clone() as Arc<dyn Transport>;
                std::thread::spawn(move || {
                    let cmd = Command::new(IoVec::from_bytes(vec![0x22u8; 512]));
                    write(&dev, &transport, cmd, 0);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while transport.completed() < 8 {
            assert!(std::time::Instant::now() < deadline, "timed out waiting for all 8 writes to complete");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert!(transport.statuses.lock().iter().all(|&s| s == ScsiStatus::Good));
        assert!(dev.tracker.is_idle());
        assert!(transport.processing_complete.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }

    #[test]
    fn passthrough_not_handled_reports_invalid_cdb_and_stays_balanced() {
        let (dev, transport) = device(1024, false);
        let cmd = Command::with_cdb(vec![0xffu8], IoVec::zeroed(0));

        passthrough(&dev, &(transport.clone() as Arc<dyn Transport>), cmd);
        transport.wait_for_completion();

        assert_eq!(
            transport.last_status(),
            Some(ScsiStatus::CheckCondition(SenseKey::IllegalRequest, Asc::INVALID_CDB))
        );
        assert!(dev.tracker.is_idle());
    }

    /// S5: a READ whose backend call fails with `ESHUTDOWN` must route
    /// through `crate::lock::handle_io_errno` — notifying `notify_lock_lost`
    /// exactly once and reporting NOT_READY/STATE_TRANSITION — instead of the
    /// failure dead-ending as a bare `MediumError` the way it would if the
    /// lock coordinator were never consulted on the I/O path.
    #[test]
    fn s5_read_eshutdown_notifies_lock_lost_exactly_once() {
        let backend = Arc::new(MockBackend::new(4096));
        backend.fail_next_call(nix::errno::Errno::ESHUTDOWN);
        let dev = Arc::new(
            Device::new(
                DeviceConfig { block_size: 512, num_lbas: 8, max_xfer_len: 256, write_cache_enabled: false },
                backend,
            )
            .expect("device"),
        );
        let transport = Arc::new(RecordingTransport::default());
        let cmd = Command::new(IoVec::zeroed(512));

        read(&dev, &(transport.clone() as Arc<dyn Transport>), cmd, 0);
        transport.wait_for_completion();

        assert_eq!(
            transport.last_status(),
            Some(ScsiStatus::CheckCondition(SenseKey::NotReady, Asc::STATE_TRANSITION))
        );
        assert_eq!(dev.lock_state(), crate::device::LockState::Lost);
        assert_eq!(transport.lock_lost_events(), vec![dev.name.clone()]);
        assert!(transport.conn_lost_events().is_empty());
        assert!(dev.tracker.is_idle());
    }

    /// Companion to the S5 test above: `ETIMEDOUT` on a WRITE must notify
    /// `notify_conn_lost` instead, reporting BUSY.
    #[test]
    fn write_etimedout_notifies_conn_lost_exactly_once() {
        let backend = Arc::new(MockBackend::new(4096));
        backend.fail_next_call(nix::errno::Errno::ETIMEDOUT);
        let dev = Arc::new(
            Device::new(
                DeviceConfig { block_size: 512, num_lbas: 8, max_xfer_len: 256, write_cache_enabled: false },
                backend,
            )
            .expect("device"),
        );
        let transport = Arc::new(RecordingTransport::default());
        let cmd = Command::new(IoVec::from_bytes(vec![0xAAu8; 512]));

        write(&dev, &(transport.clone() as Arc<dyn Transport>), cmd, 0);
        transport.wait_for_completion();

        assert_eq!(transport.last_status(), Some(ScsiStatus::Busy));
        assert_eq!(dev.lock_state(), crate::device::LockState::ConnectionLost);
        assert_eq!(transport.conn_lost_events(), vec![dev.name.clone()]);
        assert!(transport.lock_lost_events().is_empty());
        assert!(dev.tracker.is_idle());
    }
}
