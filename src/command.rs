//! The in-flight SCSI command (`spec.md` §3).

use crate::composite::CompositeState;
use crate::iovec::IoVec;
use crate::sense::SENSE_BUFFER_SIZE;

/// One SCSI CDB in flight.
///
/// Invariant: exactly one `Transport::complete` is ever invoked per command;
/// after that the command is owned by the transport and this core never
/// touches it again.
#[derive(Debug)]
pub struct Command {
    pub cdb: Vec<u8>,
    pub iovec: IoVec,
    pub sense: [u8; SENSE_BUFFER_SIZE],
    /// Per-command scratch state used by composite ops (the `cmdstate` slot
    /// in `spec.md` §3/§9). `None` for primitive commands.
    pub state: Option<CompositeState>,
}

impl Command {
    pub fn new(iovec: IoVec) -> Self {
        Self { cdb: Vec::new(), iovec, sense: [0u8; SENSE_BUFFER_SIZE], state: None }
    }

    pub fn with_cdb(cdb: Vec<u8>, iovec: IoVec) -> Self {
        Self { cdb, iovec, sense: [0u8; SENSE_BUFFER_SIZE], state: None }
    }
}
