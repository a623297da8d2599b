//! CDB opcode decode + dispatch table (`spec.md` §6).
//!
//! CDB field layout (LBA position, byte order) follows the standard SCSI
//! Block Commands CDB formats; this module only decodes the starting LBA —
//! transfer length comes from the command's already-sized I/O vector, which
//! the transport is responsible for handing the core correctly sized
//! (`spec.md` §1: byte movement into/out of host memory is a transport/
//! backend concern, out of scope here).

use std::sync::Arc;

use crate::command::Command;
use crate::composite::{compare_and_write, write_verify};
use crate::device::Device;
use crate::primitives;
use crate::sense::{Asc, ScsiStatus, SenseKey};
use crate::transport::Transport;

const READ_6: u8 = 0x08;
const WRITE_6: u8 = 0x0a;
const READ_10: u8 = 0x28;
const WRITE_10: u8 = 0x2a;
const WRITE_VERIFY_10: u8 = 0x2e;
const SYNCHRONIZE_CACHE_10: u8 = 0x35;
const WRITE_SAME_10: u8 = 0x41;
const READ_12: u8 = 0xa8;
const WRITE_12: u8 = 0xaa;
const WRITE_VERIFY_12: u8 = 0xae;
const COMPARE_AND_WRITE: u8 = 0x89;
const READ_16: u8 = 0x88;
const WRITE_16: u8 = 0x8a;
const WRITE_VERIFY_16: u8 = 0x8e;
const SYNCHRONIZE_CACHE_16: u8 = 0x91;
const WRITE_SAME_16: u8 = 0x93;

/// Starting LBA encoded in `cdb`, per the CDB format implied by its opcode.
/// Returns `None` for a CDB too short to be valid, or a CDB this decoder
/// does not recognize as carrying an LBA at all.
fn decode_lba(cdb: &[u8]) -> Option<u64> {
    if cdb.is_empty() {
        return None;
    }
    match cdb[0] {
        READ_6 | WRITE_6 => {
            if cdb.len() < 4 {
                return None;
            }
            // 21-bit LBA across the low 5 bits of byte1 and all of bytes2-3.
            let lba = ((cdb[1] & 0x1f) as u64) << 16 | (cdb[2] as u64) << 8 | cdb[3] as u64;
            Some(lba)
        }
        READ_10 | WRITE_10 | WRITE_VERIFY_10 | WRITE_SAME_10 => {
            if cdb.len() < 6 {
                return None;
            }
            Some(u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64)
        }
        READ_12 | WRITE_12 | WRITE_VERIFY_12 => {
            if cdb.len() < 6 {
                return None;
            }
            Some(u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64)
        }
        READ_16 | WRITE_16 | WRITE_VERIFY_16 | SYNCHRONIZE_CACHE_16 | WRITE_SAME_16 | COMPARE_AND_WRITE => {
            if cdb.len() < 10 {
                return None;
            }
            Some(u64::from_be_bytes([
                cdb[2], cdb[3], cdb[4], cdb[5], cdb[6], cdb[7], cdb[8], cdb[9],
            ]))
        }
        SYNCHRONIZE_CACHE_10 => {
            if cdb.len() < 6 {
                return None;
            }
            Some(u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64)
        }
        _ => None,
    }
}

/// Routes `cmd` to the primitive or composite op its CDB's opcode names
/// (`spec.md` §6's opcode table), handing off ownership of `cmd` to
/// whichever op is selected.
pub fn dispatch(dev: &Arc<Device>, transport: &Arc<dyn Transport>, cmd: Command) {
    let Some(&opcode) = cmd.cdb.first() else {
        fail_invalid_cdb(dev, transport, cmd);
        return;
    };

    match opcode {
        READ_6 | READ_10 | READ_12 | READ_16 => {
            let Some(lba) = decode_lba(&cmd.cdb) else {
                fail_invalid_cdb(dev, transport, cmd);
                return;
            };
            primitives::read(dev, transport, cmd, dev.lba_to_offset(lba));
        }
        WRITE_6 | WRITE_10 | WRITE_12 | WRITE_16 => {
            let Some(lba) = decode_lba(&cmd.cdb) else {
                fail_invalid_cdb(dev, transport, cmd);
                return;
            };
            primitives::write(dev, transport, cmd, dev.lba_to_offset(lba));
        }
        SYNCHRONIZE_CACHE_10 | SYNCHRONIZE_CACHE_16 => {
            primitives::flush(dev, transport, cmd);
        }
        COMPARE_AND_WRITE => {
            let Some(lba) = decode_lba(&cmd.cdb) else {
                fail_invalid_cdb(dev, transport, cmd);
                return;
            };
            compare_and_write(dev.clone(), transport.clone(), cmd, dev.lba_to_offset(lba));
        }
        WRITE_VERIFY_10 | WRITE_VERIFY_12 | WRITE_VERIFY_16 => {
            let Some(lba) = decode_lba(&cmd.cdb) else {
                fail_invalid_cdb(dev, transport, cmd);
                return;
            };
            write_verify(dev.clone(), transport.clone(), cmd, dev.lba_to_offset(lba));
        }
        WRITE_SAME_10 | WRITE_SAME_16 => {
            primitives::passthrough(dev, transport, cmd);
        }
        _ => {
            primitives::passthrough(dev, transport, cmd);
        }
    }
}

fn fail_invalid_cdb(dev: &Arc<Device>, transport: &Arc<dyn Transport>, mut cmd: Command) {
    dev.tracker.track_start();
    let status = crate::sense::encode_sense(
        &mut cmd.sense,
        ScsiStatus::CheckCondition(SenseKey::IllegalRequest, Asc::INVALID_CDB),
        None,
    );
    primitives::command_finish(dev, transport, cmd, status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::device::DeviceConfig;
    use crate::iovec::IoVec;
    use crate::test_support::RecordingTransport;

    fn setup() -> (Arc<Device>, Arc<RecordingTransport>, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new(65536));
        let dev = Arc::new(
            Device::new(
                DeviceConfig { block_size: 512, num_lbas: 128, max_xfer_len: 256, write_cache_enabled: false },
                backend.clone(),
            )
            .expect("device"),
        );
        let transport = Arc::new(RecordingTransport::default());
        (dev, transport, backend)
    }

    #[test]
    fn decodes_read_10_lba() {
        let cdb = vec![READ_10, 0, 0x00, 0x00, 0x00, 0x0a, 0, 0x00, 0x01, 0];
        assert_eq!(decode_lba(&cdb), Some(10));
    }

    #[test]
    fn decodes_read_6_lba() {
        let cdb = vec![READ_6, 0x00, 0x00, 0x05, 0x01, 0x00];
        assert_eq!(decode_lba(&cdb), Some(5));
    }

    #[test]
    fn decodes_read_16_lba() {
        let mut cdb = vec![READ_16];
        cdb.extend_from_slice(&[0u8; 1]);
        cdb.extend_from_slice(&42u64.to_be_bytes());
        cdb.extend_from_slice(&[0u8; 5]);
        assert_eq!(decode_lba(&cdb), Some(42));
    }

    #[test]
    fn dispatches_read_to_backend() {
        let (dev, transport, backend) = setup();
        backend.write_raw(5120, &[0xAAu8; 512]);
        let cdb = vec![READ_10, 0, 0x00, 0x00, 0x00, 0x0a, 0, 0x02, 0x00, 0];
        let cmd = Command::with_cdb(cdb, IoVec::zeroed(512));

        dispatch(&dev, &(transport.clone() as Arc<dyn Transport>), cmd);
        transport.wait_for_completion();

        assert_eq!(transport.last_status(), Some(ScsiStatus::Good));
        assert_eq!(transport.last_iovec().unwrap().as_slice(), &[0xAAu8; 512][..]);
    }

    #[test]
    fn unrecognized_opcode_goes_to_passthrough_not_handled() {
        let (dev, transport, _backend) = setup();
        let cmd = Command::with_cdb(vec![0xffu8, 0, 0, 0, 0, 0], IoVec::zeroed(0));

        dispatch(&dev, &(transport.clone() as Arc<dyn Transport>), cmd);
        transport.wait_for_completion();

        assert_eq!(
            transport.last_status(),
            Some(ScsiStatus::CheckCondition(SenseKey::IllegalRequest, Asc::INVALID_CDB))
        );
    }

    #[test]
    fn empty_cdb_fails_invalid_cdb() {
        let (dev, transport, _backend) = setup();
        let cmd = Command::with_cdb(Vec::new(), IoVec::zeroed(0));

        dispatch(&dev, &(transport.clone() as Arc<dyn Transport>), cmd);
        transport.wait_for_completion();

        assert_eq!(
            transport.last_status(),
            Some(ScsiStatus::CheckCondition(SenseKey::IllegalRequest, Asc::INVALID_CDB))
        );
    }
}
