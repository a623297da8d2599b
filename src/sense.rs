//! Fixed-format SCSI sense data encoding (C1).
//!
//! Pure functions only: no I/O, no locking. `encode_sense` is the single
//! place that knows the byte layout of a fixed-format sense buffer, so every
//! caller (primitives, composites, the lock coordinator) goes through it
//! rather than poking the sense buffer directly.

use nix::errno::Errno;

/// Fixed sense buffer size used throughout the core. 18 bytes covers fixed
/// format sense data plus the single descriptor we emit (miscompare offset);
/// transports that want more room can still write past what we fill in.
pub const SENSE_BUFFER_SIZE: usize = 252;

/// Offset of the "information"/descriptor field in fixed-format sense data
/// where the CAW/WV miscompare byte offset is stashed.
const MISCOMPARE_OFFSET_FIELD: usize = 3;

/// The subset of SCSI statuses this core ever returns to the transport.
/// `AsyncHandled` and `NotHandled` are internal sentinels the dispatcher
/// and passthrough path use and must never reach the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiStatus {
    Good,
    Busy,
    TaskSetFull,
    CheckCondition(SenseKey, Asc),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseKey {
    NoSense,
    NotReady,
    MediumError,
    IllegalRequest,
    Miscompare,
}

/// Additional Sense Code / Additional Sense Code Qualifier, bundled because
/// every caller in this crate only ever needs the pair, never one alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Asc {
    pub code: u8,
    pub qualifier: u8,
}

impl Asc {
    pub const READ_ERROR: Asc = Asc { code: 0x11, qualifier: 0x00 };
    pub const WRITE_ERROR: Asc = Asc { code: 0x0c, qualifier: 0x00 };
    pub const MISCOMPARE_DURING_VERIFY: Asc = Asc { code: 0x1d, qualifier: 0x00 };
    pub const STATE_TRANSITION: Asc = Asc { code: 0x04, qualifier: 0x0a };
    pub const INVALID_CDB: Asc = Asc { code: 0x24, qualifier: 0x00 };
}

/// Encodes `status` into `buf` as fixed-format sense data, returning the
/// status to hand back to the transport.
///
/// When `status` is `CheckCondition(Miscompare, _)`, `descriptor` is
/// interpreted as the byte offset of the first mismatch and written
/// big-endian at [`MISCOMPARE_OFFSET_FIELD`], per `spec.md` §4.1/§6.
pub fn encode_sense(
    buf: &mut [u8; SENSE_BUFFER_SIZE],
    status: ScsiStatus,
    descriptor: Option<u32>,
) -> ScsiStatus {
    buf.fill(0);

    if let ScsiStatus::CheckCondition(key, asc) = status {
        buf[0] = 0x70; // fixed format, current errors
        buf[2] = sense_key_byte(key);
        buf[7] = 10; // additional sense length
        buf[12] = asc.code;
        buf[13] = asc.qualifier;

        if key == SenseKey::Miscompare {
            if let Some(off) = descriptor {
                buf[MISCOMPARE_OFFSET_FIELD..MISCOMPARE_OFFSET_FIELD + 4]
                    .copy_from_slice(&off.to_be_bytes());
            }
            warn!(offset = descriptor, "encoded MISCOMPARE sense data");
        } else {
            warn!(?key, code = asc.code, qualifier = asc.qualifier, "encoded CHECK_CONDITION sense data");
        }
    }

    status
}

fn sense_key_byte(key: SenseKey) -> u8 {
    match key {
        SenseKey::NoSense => 0x00,
        SenseKey::NotReady => 0x02,
        SenseKey::MediumError => 0x03,
        SenseKey::IllegalRequest => 0x05,
        SenseKey::Miscompare => 0x0e,
    }
}

/// Maps a negative backend return value (a POSIX errno) to the SCSI status
/// the core reports, per `spec.md` §4.1 and §4.8's errno contract. Lock-loss
/// and connection-loss handling (`ESHUTDOWN`/`ETIMEDOUT`) happen one layer up
/// in [`crate::lock`] since they also flip device lock state; this function
/// only performs the status mapping.
pub fn status_for_errno(errno: Errno) -> ScsiStatus {
    match errno {
        Errno::ENOMEM => ScsiStatus::TaskSetFull,
        Errno::EIO => ScsiStatus::CheckCondition(SenseKey::MediumError, Asc::READ_ERROR),
        Errno::ETIMEDOUT => ScsiStatus::Busy,
        Errno::ESHUTDOWN => {
            ScsiStatus::CheckCondition(SenseKey::NotReady, Asc::STATE_TRANSITION)
        }
        other => {
            error!(?other, "unmapped backend errno, reporting MEDIUM_ERROR");
            ScsiStatus::CheckCondition(SenseKey::MediumError, Asc::WRITE_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miscompare_descriptor_is_big_endian() {
        let mut buf = [0u8; SENSE_BUFFER_SIZE];
        let status = encode_sense(
            &mut buf,
            ScsiStatus::CheckCondition(SenseKey::Miscompare, Asc::MISCOMPARE_DURING_VERIFY),
            Some(17),
        );
        assert_eq!(status, ScsiStatus::CheckCondition(SenseKey::Miscompare, Asc::MISCOMPARE_DURING_VERIFY));
        assert_eq!(&buf[3..7], &17u32.to_be_bytes());
        assert_eq!(buf[2], 0x0e);
    }

    #[test]
    fn good_status_leaves_sense_data_clear() {
        let mut buf = [0xffu8; SENSE_BUFFER_SIZE];
        encode_sense(&mut buf, ScsiStatus::Good, None);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn errno_mapping_matches_spec_table() {
        assert_eq!(status_for_errno(Errno::ENOMEM), ScsiStatus::TaskSetFull);
        assert_eq!(
            status_for_errno(Errno::EIO),
            ScsiStatus::CheckCondition(SenseKey::MediumError, Asc::READ_ERROR)
        );
        assert_eq!(status_for_errno(Errno::ETIMEDOUT), ScsiStatus::Busy);
        assert_eq!(
            status_for_errno(Errno::ESHUTDOWN),
            ScsiStatus::CheckCondition(SenseKey::NotReady, Asc::STATE_TRANSITION)
        );
    }
}
