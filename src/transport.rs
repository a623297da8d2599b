//! The boundary this core talks outward through (`spec.md` §1, §7): the
//! kernel-facing transport that owns delivering completions, and the
//! per-device signals the lock coordinator needs to raise on it.
//!
//! The core never talks to the kernel directly — it only ever calls back
//! into whatever implements this trait, mirroring how the teacher crate
//! keeps `Nexus` free of any gRPC/NVMe-oF wire detail and pushes that to its
//! own transport layer.

use crate::command::Command;
use crate::sense::ScsiStatus;

/// Implemented by whatever sits on the other side of the kernel interface
/// (uio/nl, in production; `crate::test_support::RecordingTransport` in this
/// crate's own tests).
pub trait Transport: Send + Sync {
    /// Delivers the final status for `cmd`. Invoked exactly once per command
    /// accepted by the dispatcher (`spec.md` §4's core invariant).
    fn complete(&self, cmd: Command, status: ScsiStatus);

    /// Raised once per device whenever the tracker transitions from
    /// non-idle to idle at the moment a command completes (`spec.md`
    /// §4.2/§4.5); lets the transport batch kernel notifications instead of
    /// signalling after every single completion.
    fn processing_complete(&self, device: &str);

    /// The cluster lock was revoked out from under this client
    /// (`ESHUTDOWN`, `spec.md` §4.8). The transport is expected to fence
    /// further writes at a layer above this core.
    fn notify_lock_lost(&self, device: &str);

    /// The cluster connection needed to hold the lock was lost
    /// (`ETIMEDOUT`, `spec.md` §4.8).
    fn notify_conn_lost(&self, device: &str);
}
