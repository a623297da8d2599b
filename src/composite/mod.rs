//! Composite SCSI commands (C6): COMPARE-AND-WRITE and WRITE-VERIFY, each
//! decomposed into chained read/verify/write primitive sub-operations.

pub mod compare_and_write;
pub mod write_verify;

pub use compare_and_write::{compare_and_write, CompareAndWriteState};
pub use write_verify::{write_verify, WriteVerifyState};

/// Per-command scratch state for a composite op in flight (the `cmdstate`
/// slot from `spec.md` §3/§9). Owned by the `Command` for the duration of
/// the composite so it survives arbitrary async hops between sub-op
/// completions.
#[derive(Debug)]
pub enum CompositeState {
    CompareAndWrite(CompareAndWriteState),
    WriteVerify(WriteVerifyState),
}
