//! Fault-injecting storage backend.
//!
//! Wraps any backend and fails a chosen operation once, then disarms
//! itself. One-shot faults matter: after a write fault the engine rolls
//! the transaction back through the same backend, and that replay must
//! succeed for the atomicity guarantee to be observable.

use muxfile_storage::{StorageBackend, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn injected(op: &str) -> muxfile_storage::StorageError {
    muxfile_storage::StorageError::Io(std::io::Error::other(format!("injected {op} fault")))
}

/// Shared switchboard controlling a [`FaultBackend`].
///
/// Obtained from [`FaultBackend::controls`] before the backend is handed to
/// the engine.
#[derive(Debug, Default)]
pub struct FaultControls {
    fail_writes_after: AtomicUsize,
    write_fault_armed: AtomicBool,
    fail_next_sync: AtomicBool,
    faults_injected: AtomicUsize,
}

impl FaultControls {
    /// Arms a one-shot write fault: the next `writes` mutating calls
    /// succeed, the one after fails.
    pub fn fail_write_after(&self, writes: usize) {
        self.fail_writes_after.store(writes, Ordering::SeqCst);
        self.write_fault_armed.store(true, Ordering::SeqCst);
    }

    /// Arms a one-shot fault on the next `sync` call.
    pub fn fail_next_sync(&self) {
        self.fail_next_sync.store(true, Ordering::SeqCst);
    }

    /// Disarms all pending faults.
    pub fn disarm(&self) {
        self.write_fault_armed.store(false, Ordering::SeqCst);
        self.fail_next_sync.store(false, Ordering::SeqCst);
    }

    /// Number of faults injected so far.
    pub fn faults_injected(&self) -> usize {
        self.faults_injected.load(Ordering::SeqCst)
    }

    /// Returns whether a mutating call should fail now, consuming the
    /// armed fault when it fires.
    fn take_write_fault(&self) -> bool {
        if !self.write_fault_armed.load(Ordering::SeqCst) {
            return false;
        }
        let remaining = self.fail_writes_after.load(Ordering::SeqCst);
        if remaining == 0 {
            self.write_fault_armed.store(false, Ordering::SeqCst);
            self.faults_injected.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        self.fail_writes_after.store(remaining - 1, Ordering::SeqCst);
        false
    }

    fn take_sync_fault(&self) -> bool {
        if self.fail_next_sync.swap(false, Ordering::SeqCst) {
            self.faults_injected.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        false
    }
}

/// A storage backend wrapper that injects one-shot failures.
pub struct FaultBackend {
    inner: Box<dyn StorageBackend>,
    controls: Arc<FaultControls>,
}

impl FaultBackend {
    /// Wraps a backend with disarmed fault controls.
    pub fn new(inner: Box<dyn StorageBackend>) -> Self {
        Self {
            inner,
            controls: Arc::new(FaultControls::default()),
        }
    }

    /// Returns the shared controls for this backend.
    pub fn controls(&self) -> Arc<FaultControls> {
        Arc::clone(&self.controls)
    }
}

impl StorageBackend for FaultBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if self.controls.take_write_fault() {
            return Err(injected("write"));
        }
        self.inner.write_at(offset, data)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if self.controls.take_write_fault() {
            return Err(injected("append"));
        }
        self.inner.append(data)
    }

    fn set_len(&mut self, new_size: u64) -> StorageResult<()> {
        if self.controls.take_write_fault() {
            return Err(injected("resize"));
        }
        self.inner.set_len(new_size)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.controls.take_sync_fault() {
            return Err(injected("sync"));
        }
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }
}
