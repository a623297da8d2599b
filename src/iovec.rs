//! Scatter/gather I/O vector helpers shared by primitives and composites.
//!
//! The real transport hands the core a scatter/gather list over pinned host
//! memory; byte movement into/out of that memory is backend-specific and out
//! of scope for this core (`spec.md` §1). What the core itself needs is the
//! "seek in iovec" operation used by the composite ops and a byte-compare
//! that reports the offset of the first mismatch, both of which behave
//! identically whether the memory is one segment or many. We therefore model
//! `IoVec` as a single owned buffer rather than a true multi-segment list;
//! see DESIGN.md for why this simplification is safe here.

use std::sync::Arc;

use parking_lot::Mutex;

/// An owned, contiguous view of command data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoVec {
    data: Vec<u8>,
}

impl IoVec {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn zeroed(len: usize) -> Self {
        Self { data: vec![0u8; len] }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Wraps this view's bytes into a buffer shared with the backend for the
    /// duration of one dispatched call.
    pub fn into_shared(self) -> SharedBuffer {
        Arc::new(Mutex::new(self.data))
    }

    /// Advances past the first `n` bytes, returning the remainder as a fresh
    /// view. `spec.md` §9 notes the source relies on seeking the original
    /// iovec in place; we instead construct a truncated view per sub-op,
    /// which the spec explicitly allows as long as the composite invariants
    /// (monotonic, non-destructive advance) hold.
    pub fn seek(&self, n: usize) -> IoVec {
        let n = n.min(self.data.len());
        IoVec { data: self.data[n..].to_vec() }
    }

    /// Returns the first `n` bytes as a fresh view (used to split a CAW
    /// payload into its compare/write halves).
    pub fn truncated(&self, n: usize) -> IoVec {
        let n = n.min(self.data.len());
        IoVec { data: self.data[..n].to_vec() }
    }
}

/// Buffer handed to a backend call, shared with the caller so the result of
/// a read is visible once the (possibly cross-thread) completion fires.
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

/// Copies a shared buffer's current contents out into an owned [`IoVec`].
pub fn shared_to_iovec(buf: &SharedBuffer) -> IoVec {
    IoVec::from_bytes(buf.lock().clone())
}

/// Byte-compares `a` against `b` over `min(a.len(), b.len())` bytes.
///
/// Returns the offset of the first differing byte, or `None` if the
/// compared region is identical. Source tooling uses a `-1` sentinel for
/// "no mismatch"; this is that sentinel's Rust-native form.
pub fn compare_bytes(a: &[u8], b: &[u8]) -> Option<usize> {
    let len = a.len().min(b.len());
    (0..len).find(|&i| a[i] != b[i])
}
