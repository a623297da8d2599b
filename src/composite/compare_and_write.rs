//! COMPARE-AND-WRITE (CAW) state machine (`spec.md` §4.6.1).
//!
//! ```text
//! START -> ISSUE_READ -> AWAIT_READ -> { VERIFY, FAIL }
//! VERIFY -> { ISSUE_WRITE, MISCOMPARE }
//! ISSUE_WRITE -> AWAIT_WRITE -> DONE
//! ```

use std::sync::Arc;

use crate::command::Command;
use crate::device::Device;
use crate::iovec::{compare_bytes, IoVec};
use crate::primitives::{self, primitive_read, primitive_write};
use crate::sense::{Asc, ScsiStatus, SenseKey};
use crate::transport::Transport;

/// State retained on the original command between the read and write legs.
#[derive(Debug)]
pub struct CompareAndWriteState {
    pub offset: u64,
    pub requested: usize,
}

/// Entry point: decomposes a COMPARE-AND-WRITE CDB into its read/compare/
/// write sub-operations and drives them to completion.
///
/// `cmd`'s I/O vector carries `2 * requested` bytes: `requested` bytes to
/// compare against the pre-image, followed by `requested` bytes to write if
/// the compare succeeds. Per `spec.md` Testable Property 8, a zero-length
/// payload completes GOOD without touching the backend.
pub fn compare_and_write(dev: Arc<Device>, transport: Arc<dyn Transport>, mut cmd: Command, offset: u64) {
    dev.tracker.track_start();
    let total = cmd.iovec.len();
    if total == 0 {
        primitives::command_finish(&dev, &transport, cmd, ScsiStatus::Good);
        return;
    }

    let requested = total / 2;
    let compare_half = cmd.iovec.truncated(requested);
    let write_half = cmd.iovec.seek(requested);

    cmd.state = Some(crate::composite::CompositeState::CompareAndWrite(CompareAndWriteState {
        offset,
        requested,
    }));

    issue_read(dev, transport, cmd, offset, requested, compare_half, write_half);
}

fn issue_read(
    dev: Arc<Device>,
    transport: Arc<dyn Transport>,
    cmd: Command,
    offset: u64,
    requested: usize,
    compare_half: IoVec,
    write_half: IoVec,
) {
    let dev2 = dev.clone();
    let transport2 = transport.clone();

    primitive_read(&dev, &transport, offset, requested, move |shadow, status| {
        await_read(dev2, transport2, cmd, offset, requested, shadow, compare_half, write_half, status);
    });
}

fn await_read(
    dev: Arc<Device>,
    transport: Arc<dyn Transport>,
    mut cmd: Command,
    offset: u64,
    requested: usize,
    shadow_buf: IoVec,
    compare_half: IoVec,
    write_half: IoVec,
    status: ScsiStatus,
) {
    if status != ScsiStatus::Good {
        primitives::command_finish(&dev, &transport, cmd, status);
        return;
    }

    // §4.6.1 / §9: the source treats `cmp_offset == -1` (no mismatch) as the
    // MISCOMPARE branch, inverted from WRITE-VERIFY. We resolve the open
    // question the way `spec.md` recommends: `cmp_offset != -1` is the
    // mismatch condition in both composites.
    match compare_bytes(shadow_buf.as_slice(), compare_half.as_slice()) {
        Some(mismatch_at) => {
            let status = crate::sense::encode_sense(
                &mut cmd.sense,
                ScsiStatus::CheckCondition(SenseKey::Miscompare, Asc::MISCOMPARE_DURING_VERIFY),
                Some(mismatch_at as u32),
            );
            primitives::command_finish(&dev, &transport, cmd, status);
        }
        None => {
            issue_write(dev, transport, cmd, offset, write_half);
        }
    }
}

fn issue_write(dev: Arc<Device>, transport: Arc<dyn Transport>, cmd: Command, offset: u64, write_half: IoVec) {
    let dev2 = dev.clone();
    let transport2 = transport.clone();
    primitive_write(&dev, &transport, offset, write_half, move |status| {
        primitives::command_finish(&dev2, &transport2, cmd, status);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::device::DeviceConfig;
    use crate::test_support::RecordingTransport;

    fn setup(pre_image: Vec<u8>) -> (Arc<Device>, Arc<RecordingTransport>, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new(pre_image.len()));
        backend.write_raw(0, &pre_image);
        let dev = Arc::new(
            Device::new(
                DeviceConfig { block_size: 512, num_lbas: 1024, max_xfer_len: 256, write_cache_enabled: false },
                backend.clone(),
            )
            .expect("device"),
        );
        let transport = Arc::new(RecordingTransport::default());
        (dev, transport, backend)
    }

    #[test]
    fn s1_caw_success() {
        let mut pre_image = vec![0u8; 10240];
        pre_image[5120..5632].fill(0xAA);
        let (dev, transport, backend) = setup(pre_image);

        let mut iov = vec![0xAAu8; 512];
        iov.extend(vec![0xBBu8; 512]);
        let cmd = Command::new(IoVec::from_bytes(iov));

        compare_and_write(dev.clone(), transport.clone(), cmd, 5120);
        transport.wait_for_completion();

        assert_eq!(transport.last_status(), Some(ScsiStatus::Good));
        assert_eq!(&backend.read_raw(5120, 512), &vec![0xBBu8; 512]);
    }

    #[test]
    fn s2_caw_miscompare() {
        let mut pre_image = vec![0u8; 10240];
        pre_image[5120..5632].fill(0xAA);
        pre_image[5120 + 17] = 0x00;
        let (dev, transport, backend) = setup(pre_image);

        let mut iov = vec![0xAAu8; 512];
        iov.extend(vec![0xBBu8; 512]);
        let cmd = Command::new(IoVec::from_bytes(iov));

        compare_and_write(dev.clone(), transport.clone(), cmd, 5120);
        transport.wait_for_completion();

        assert_eq!(
            transport.last_status(),
            Some(ScsiStatus::CheckCondition(SenseKey::Miscompare, Asc::MISCOMPARE_DURING_VERIFY))
        );
        let sense = transport.last_sense().unwrap();
        assert_eq!(&sense[3..7], &17u32.to_be_bytes());
        // no write happened: byte 17 of pre-image is still 0x00
        assert_eq!(backend.read_raw(5120, 512)[17], 0x00);
    }

    #[test]
    fn zero_length_caw_completes_good_without_backend_call() {
        let (dev, transport, backend) = setup(vec![0u8; 1024]);
        let cmd = Command::new(IoVec::from_bytes(vec![]));
        let calls_before = backend.call_count();

        compare_and_write(dev, transport.clone(), cmd, 0);
        transport.wait_for_completion();

        assert_eq!(transport.last_status(), Some(ScsiStatus::Good));
        assert_eq!(backend.call_count(), calls_before);
    }
}
