//! Backend Adapter (C7): the abstract interface the core consumes from a
//! storage backend, plus the `/`-delimited config string grammar and a
//! `MockBackend` used by the crate's own tests.

use nix::errno::Errno;

use crate::dispatch::{CallStub, Completion, IoOutcome, Outcome};
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Shared,
    Other,
}

/// The contract the core consumes from a storage backend (`spec.md` §4.7).
///
/// Optional capabilities (passthrough, the cluster lock primitives) carry
/// default implementations that decline/no-op, which is the trait-based
/// rendition of "missing capabilities map to opcode-level NOT_HANDLED"
/// from `spec.md` §9 — a minimal backend only has to implement
/// `aio_supported`, `submit_async`/`execute_sync` for whichever of those two
/// paths it uses, `open`, and `close`.
pub trait StoreBackend: Send + Sync {
    /// If true, `submit_async` MUST be non-blocking and deliver its
    /// completion asynchronously. If false, the core shunts calls through
    /// the device's worker pool, which invokes `execute_sync` and calls the
    /// completion itself.
    fn aio_supported(&self) -> bool;

    /// Async entry point. MUST return promptly. Returning `Outcome::Done`
    /// means the call resolved synchronously and `completion` MUST NOT have
    /// been invoked; returning `Outcome::Pending` is a promise to invoke
    /// `completion` exactly once, later, from some thread. The result is a
    /// raw [`IoOutcome`], not a pre-mapped [`crate::sense::ScsiStatus`] —
    /// the core maps it (and raises lock/connection-loss notifications
    /// along the way) once it reaches `crate::primitives`.
    ///
    /// The default declines [`CallStub::Passthrough`] with `NotHandled` and
    /// panics for every other stub, since `Read`/`Write`/`Flush` are not
    /// optional: every backend must implement one of `submit_async` or
    /// `execute_sync` for them, matching whichever of `aio_supported` it
    /// reports.
    fn submit_async(&self, stub: CallStub, completion: Completion) -> Outcome {
        let _ = completion;
        match stub {
            CallStub::Passthrough { .. } => Outcome::Done(IoOutcome::NotHandled),
            _ => unimplemented!("aio_supported() backend must override submit_async"),
        }
    }

    /// Blocking entry point, run from a worker thread when `aio_supported`
    /// is false. Same passthrough default as `submit_async`.
    fn execute_sync(&self, stub: CallStub) -> IoOutcome {
        match stub {
            CallStub::Passthrough { .. } => IoOutcome::NotHandled,
            _ => unimplemented!("non-aio backend must override execute_sync"),
        }
    }

    // --- exclusive-lock primitives consumed by crate::lock (§4.8) ---

    /// Whether this client is already the lock owner.
    fn has_lock(&self) -> bool {
        false
    }

    fn lock_mode(&self) -> Result<LockMode, Errno> {
        Ok(LockMode::Exclusive)
    }

    /// Current set of lock owners known to the cluster, if any.
    fn query_owners(&self) -> Result<Vec<String>, Errno> {
        Ok(Vec::new())
    }

    fn break_lock(&self, owner: &str) -> Result<(), Errno> {
        let _ = owner;
        Ok(())
    }

    fn acquire_exclusive(&self) -> Result<(), Errno> {
        Ok(())
    }

    fn open(&self) {}

    fn close(&self) {}
}

/// Parses the `/`-delimited backend config grammar from `spec.md` §6:
/// `backend-subtype/backend-specific-path[/opt=value[,opt=value]*]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub subtype: String,
    pub path: String,
    pub options: Vec<(String, String)>,
}

pub fn parse_config_str(s: &str) -> Result<BackendConfig, CoreError> {
    let mut parts = s.splitn(3, '/');
    let subtype = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| CoreError::InvalidConfig {
        reason: "missing backend subtype".to_string(),
    })?;
    let path = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| CoreError::InvalidConfig {
        reason: "missing backend path".to_string(),
    })?;

    let options = match parts.next() {
        None | Some("") => Vec::new(),
        Some(opts) => opts
            .split(',')
            .map(|kv| {
                let mut kv = kv.splitn(2, '=');
                let key = kv.next().unwrap_or_default();
                let value = kv.next().ok_or_else(|| CoreError::InvalidConfig {
                    reason: format!("option '{kv_src}' is missing a value", kv_src = key),
                })?;
                Ok((key.to_string(), value.to_string()))
            })
            .collect::<Result<Vec<_>, CoreError>>()?,
    };

    Ok(BackendConfig { subtype: subtype.to_string(), path: path.to_string(), options })
}

/// In-memory backend used by this crate's own tests and by the CLI smoke
/// harness. Can simulate: a sync or aio backend, a byte corruption at a
/// fixed offset (for miscompare scenarios), and a forced errno on the next
/// call (for S5/S6-style fault injection), mirroring in spirit the teacher
/// crate's `core::fault_injection` hooks, scaled down to an in-process mock.
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    pub struct MockBackend {
        store: Mutex<Vec<u8>>,
        aio: AtomicBool,
        calls: AtomicUsize,
        #[cfg(feature = "fault-injection")]
        corrupt_at: Mutex<Option<(usize, u8)>>,
        #[cfg(feature = "fault-injection")]
        fail_next: Mutex<Option<Errno>>,
    }

    impl MockBackend {
        pub fn new(capacity: usize) -> Self {
            Self {
                store: Mutex::new(vec![0u8; capacity]),
                aio: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                #[cfg(feature = "fault-injection")]
                corrupt_at: Mutex::new(None),
                #[cfg(feature = "fault-injection")]
                fail_next: Mutex::new(None),
            }
        }

        pub fn with_aio(self, aio: bool) -> Self {
            self.aio.store(aio, Ordering::SeqCst);
            self
        }

        pub fn write_raw(&self, offset: u64, data: &[u8]) {
            let mut store = self.store.lock();
            let start = offset as usize;
            store[start..start + data.len()].copy_from_slice(data);
        }

        pub fn read_raw(&self, offset: u64, len: usize) -> Vec<u8> {
            let store = self.store.lock();
            let start = offset as usize;
            store[start..start + len].to_vec()
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Corrupts one byte the next time it is read, at `offset` relative
        /// to the start of the backing store. Used for S4-style miscompare
        /// injection.
        #[cfg(feature = "fault-injection")]
        pub fn corrupt_on_next_read(&self, offset: usize, value: u8) {
            *self.corrupt_at.lock() = Some((offset, value));
        }

        /// Forces the next `read`/`write`/`flush` call to fail with `errno`.
        #[cfg(feature = "fault-injection")]
        pub fn fail_next_call(&self, errno: Errno) {
            *self.fail_next.lock() = Some(errno);
        }

        #[cfg(feature = "fault-injection")]
        fn take_forced_failure(&self) -> Option<Errno> {
            self.fail_next.lock().take()
        }

        #[cfg(not(feature = "fault-injection"))]
        fn take_forced_failure(&self) -> Option<Errno> {
            None
        }

        #[cfg(feature = "fault-injection")]
        fn apply_read_corruption(&self, store: &mut [u8]) {
            if let Some((corrupt_offset, value)) = self.corrupt_at.lock().take() {
                if corrupt_offset < store.len() {
                    store[corrupt_offset] = value;
                }
            }
        }

        #[cfg(not(feature = "fault-injection"))]
        fn apply_read_corruption(&self, _store: &mut [u8]) {}

        fn run(&self, stub: &CallStub) -> IoOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if let Some(errno) = self.take_forced_failure() {
                return IoOutcome::Err(errno);
            }

            match stub {
                CallStub::Read { buf, offset } => {
                    let len = buf.lock().len();
                    let mut store = self.store.lock();
                    let start = *offset as usize;
                    if start + len > store.len() {
                        return IoOutcome::Err(Errno::EIO);
                    }
                    self.apply_read_corruption(&mut store);
                    buf.lock().copy_from_slice(&store[start..start + len]);
                    IoOutcome::Ok
                }
                CallStub::Write { buf, offset } => {
                    let data = buf.lock().clone();
                    let mut store = self.store.lock();
                    let start = *offset as usize;
                    if start + data.len() > store.len() {
                        return IoOutcome::Err(Errno::EIO);
                    }
                    store[start..start + data.len()].copy_from_slice(&data);
                    IoOutcome::Ok
                }
                CallStub::Flush => IoOutcome::Ok,
                // This mock never claims a CDB of its own; a real backend
                // that offers e.g. WRITE_SAME would answer here instead.
                CallStub::Passthrough { .. } => IoOutcome::NotHandled,
            }
        }
    }

    impl StoreBackend for MockBackend {
        fn aio_supported(&self) -> bool {
            self.aio.load(Ordering::SeqCst)
        }

        fn submit_async(&self, stub: CallStub, completion: Completion) -> Outcome {
            let outcome = self.run(&stub);
            // Respect the dispatcher ordering guarantee: invoke the
            // completion from a different thread than the caller of
            // `async_call`, never inline.
            std::thread::spawn(move || completion(outcome));
            Outcome::Pending
        }

        fn execute_sync(&self, stub: CallStub) -> IoOutcome {
            self.run(&stub)
        }
    }

    /// Backend that always reports itself as the current cluster lock
    /// owner-in-waiting, used by `crate::lock`'s tests. Lets tests script a
    /// sequence of owners/errnos across successive `try_lock` attempts.
    pub struct ScriptedLockBackend {
        pub inner: Arc<MockBackend>,
        pub mode: Mutex<LockMode>,
        pub owners: Mutex<Vec<Vec<String>>>,
        pub query_errno: Mutex<Option<Errno>>,
        pub break_results: Mutex<Vec<Result<(), Errno>>>,
        pub acquire_results: Mutex<Vec<Result<(), Errno>>>,
        pub already_owned: AtomicBool,
    }

    impl ScriptedLockBackend {
        pub fn new() -> Self {
            Self {
                inner: Arc::new(MockBackend::new(4096)),
                mode: Mutex::new(LockMode::Exclusive),
                owners: Mutex::new(Vec::new()),
                query_errno: Mutex::new(None),
                break_results: Mutex::new(Vec::new()),
                acquire_results: Mutex::new(Vec::new()),
                already_owned: AtomicBool::new(false),
            }
        }

        /// Forces the next [`StoreBackend::query_owners`] call to fail,
        /// simulating a cluster connection timeout mid lock-acquisition.
        pub fn fail_next_query(&self, errno: Errno) {
            *self.query_errno.lock() = Some(errno);
        }
    }

    impl Default for ScriptedLockBackend {
        fn default() -> Self {
            Self::new()
        }
    }

    impl StoreBackend for ScriptedLockBackend {
        fn aio_supported(&self) -> bool {
            self.inner.aio_supported()
        }

        fn submit_async(&self, stub: CallStub, completion: Completion) -> Outcome {
            self.inner.submit_async(stub, completion)
        }

        fn execute_sync(&self, stub: CallStub) -> IoOutcome {
            self.inner.execute_sync(stub)
        }

        fn has_lock(&self) -> bool {
            self.already_owned.load(Ordering::SeqCst)
        }

        fn lock_mode(&self) -> Result<LockMode, Errno> {
            Ok(*self.mode.lock())
        }

        fn query_owners(&self) -> Result<Vec<String>, Errno> {
            if let Some(errno) = self.query_errno.lock().take() {
                return Err(errno);
            }
            let mut owners = self.owners.lock();
            if owners.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(owners.remove(0))
            }
        }

        fn break_lock(&self, _owner: &str) -> Result<(), Errno> {
            let mut results = self.break_results.lock();
            if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            }
        }

        fn acquire_exclusive(&self) -> Result<(), Errno> {
            let mut results = self.acquire_results.lock();
            let result = if results.is_empty() { Ok(()) } else { results.remove(0) };
            if result.is_ok() {
                self.already_owned.store(true, Ordering::SeqCst);
            }
            result
        }
    }
}

pub use mock::{MockBackend, ScriptedLockBackend};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let cfg = parse_config_str("rbd/mypool-myimage").unwrap();
        assert_eq!(cfg.subtype, "rbd");
        assert_eq!(cfg.path, "mypool-myimage");
        assert!(cfg.options.is_empty());
    }

    #[test]
    fn parses_config_with_options() {
        let cfg = parse_config_str("rbd/mypool-myimage/conf=/etc/ceph.conf,id=admin").unwrap();
        assert_eq!(cfg.subtype, "rbd");
        assert_eq!(cfg.path, "mypool-myimage");
        assert_eq!(
            cfg.options,
            vec![("conf".to_string(), "/etc/ceph.conf".to_string()), ("id".to_string(), "admin".to_string())]
        );
    }

    #[test]
    fn rejects_empty_subtype() {
        assert!(parse_config_str("/path").is_err());
    }
}
