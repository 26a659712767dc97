//! Self-wiping, access-guarded byte container.
//!
//! `SecureBuffer` owns a page-aligned allocation that is locked into physical
//! memory (`mlock`) and, on Linux, excluded from core dumps and from child
//! processes after `fork`. Bytes are only reachable through scoped closures
//! (`with_bytes` / `with_bytes_mut`); no pointer or slice escapes the borrow.
//!
//! Wiping is a 4-pass overwrite (zero, 0xFF, random, zero) and happens on
//! `clear()`, on drop, when the access ceiling is reached, and when a
//! [`BufferGuardian`] relays a background/suspend signal.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{compiler_fence, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use rand::RngCore;
use tracing::{debug, error, warn};
use zeroize::Zeroize;

use crate::error::{SecurityError, SecurityResult};
use crate::events::LifecycleSignal;

/// Largest secret a buffer may hold (1 MiB).
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Accesses after which a buffer wipes itself. Far above any legitimate use.
pub const DEFAULT_ACCESS_CEILING: u64 = 10_000_000;

/// What to do when the pages cannot be locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Refuse to hold the secret.
    Required,
    /// Log a warning and keep going.
    BestEffort,
}

impl LockPolicy {
    /// `Required` in release builds, `BestEffort` when debug assertions are on.
    pub fn for_build() -> Self {
        if cfg!(debug_assertions) {
            LockPolicy::BestEffort
        } else {
            LockPolicy::Required
        }
    }
}

fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no memory-safety preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

/// Write `byte` over `bytes` in a way the optimizer cannot drop.
fn overwrite(bytes: &mut [u8], byte: u8) {
    for b in bytes.iter_mut() {
        // SAFETY: `b` is a valid, aligned, exclusive reference.
        unsafe { std::ptr::write_volatile(b, byte) };
    }
    compiler_fence(Ordering::SeqCst);
}

/// Zero, 0xFF, random, zero.
pub(crate) fn wipe_four_pass(bytes: &mut [u8]) {
    bytes.zeroize();
    overwrite(bytes, 0xFF);
    rand::rng().fill_bytes(bytes);
    compiler_fence(Ordering::SeqCst);
    bytes.zeroize();
}

/// A page-aligned heap allocation with optional memory locking.
struct LockedRegion {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    locked: bool,
}

// SAFETY: the region is uniquely owned; all access goes through &self/&mut self.
unsafe impl Send for LockedRegion {}
unsafe impl Sync for LockedRegion {}

impl LockedRegion {
    fn allocate(len: usize) -> SecurityResult<Self> {
        let page = page_size();
        let capacity = len.max(1).div_ceil(page) * page;
        let layout = Layout::from_size_align(capacity, page)
            .map_err(|e| SecurityError::MemoryProtectionFailed(format!("bad layout: {}", e)))?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| SecurityError::MemoryProtectionFailed("allocation failed".into()))?;

        Ok(Self {
            ptr,
            len,
            layout,
            locked: false,
        })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for `layout.size() >= len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    fn whole_mut(&mut self) -> &mut [u8] {
        // SAFETY: the full capacity was allocated and zero-initialized.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }

    /// Lock pages and advise the kernel to keep them out of dumps and forks.
    fn protect(&mut self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            let addr = self.ptr.as_ptr() as *mut libc::c_void;
            let size = self.layout.size();

            // SAFETY: addr/size describe memory we own.
            let ret = unsafe { libc::mlock(addr, size) };
            if ret != 0 {
                return Err(std::io::Error::last_os_error());
            }
            self.locked = true;

            #[cfg(target_os = "linux")]
            {
                // SAFETY: addr is page-aligned and size is a page multiple.
                unsafe {
                    if libc::madvise(addr, size, libc::MADV_DONTDUMP) != 0 {
                        warn!("madvise(DONTDUMP) failed: {}", std::io::Error::last_os_error());
                    }
                    if libc::madvise(addr, size, libc::MADV_DONTFORK) != 0 {
                        warn!("madvise(DONTFORK) failed: {}", std::io::Error::last_os_error());
                    }
                }
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "memory locking not supported on this platform",
            ))
        }
    }

    fn unprotect(&mut self) {
        if !self.locked {
            return;
        }
        #[cfg(unix)]
        {
            // SAFETY: same region that was passed to mlock.
            let ret = unsafe {
                libc::munlock(self.ptr.as_ptr() as *mut libc::c_void, self.layout.size())
            };
            if ret != 0 {
                warn!("munlock failed: {}", std::io::Error::last_os_error());
            }
        }
        self.locked = false;
    }
}

impl Drop for LockedRegion {
    fn drop(&mut self) {
        wipe_four_pass(self.whole_mut());
        self.unprotect();
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A secret byte container that wipes itself.
pub struct SecureBuffer {
    region: Mutex<Option<LockedRegion>>,
    len: usize,
    accesses: AtomicU64,
    ceiling: u64,
}

impl SecureBuffer {
    /// Copy `bytes` into a new buffer using the build's lock policy.
    pub fn new(bytes: &[u8]) -> SecurityResult<Self> {
        Self::with_policy(bytes, LockPolicy::for_build())
    }

    /// Copy `bytes` into a new buffer, failing per `policy` if locking fails.
    pub fn with_policy(bytes: &[u8], policy: LockPolicy) -> SecurityResult<Self> {
        if bytes.len() > MAX_BUFFER_SIZE {
            return Err(SecurityError::InvalidInput(format!(
                "secure buffer limited to {} bytes, got {}",
                MAX_BUFFER_SIZE,
                bytes.len()
            )));
        }

        let mut region = LockedRegion::allocate(bytes.len())?;
        if let Err(e) = region.protect() {
            match policy {
                LockPolicy::Required => {
                    error!("Refusing to hold secret: memory lock failed: {}", e);
                    return Err(SecurityError::MemoryProtectionFailed(e.to_string()));
                }
                LockPolicy::BestEffort => {
                    warn!("Memory lock failed, continuing unlocked: {}", e);
                }
            }
        }
        region.as_mut_slice().copy_from_slice(bytes);

        Ok(Self {
            region: Mutex::new(Some(region)),
            len: bytes.len(),
            accesses: AtomicU64::new(0),
            ceiling: DEFAULT_ACCESS_CEILING,
        })
    }

    /// Move a vector into a buffer; the vector's heap copy is zeroized.
    pub fn from_vec(mut bytes: Vec<u8>, policy: LockPolicy) -> SecurityResult<Self> {
        let result = Self::with_policy(&bytes, policy);
        bytes.zeroize();
        result
    }

    /// Override the automatic-wipe access ceiling.
    pub fn with_access_ceiling(mut self, ceiling: u64) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn access_count(&self) -> u64 {
        self.accesses.load(Ordering::SeqCst)
    }

    pub fn is_cleared(&self) -> bool {
        self.state().is_none()
    }

    /// Whether the pages are currently locked in memory.
    pub fn is_memory_locked(&self) -> bool {
        self.state().as_ref().is_some_and(|r| r.locked)
    }

    /// Run `f` with read access to the secret bytes.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> SecurityResult<R> {
        let mut state = self.state();
        self.count_access(&mut state)?;
        let region = state.as_ref().ok_or(SecurityError::AlreadyCleared)?;
        Ok(f(region.as_slice()))
    }

    /// Run `f` with write access to the secret bytes.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> SecurityResult<R> {
        let mut state = self.state();
        self.count_access(&mut state)?;
        let region = state.as_mut().ok_or(SecurityError::AlreadyCleared)?;
        Ok(f(region.as_mut_slice()))
    }

    /// Wipe and release the bytes. Idempotent.
    pub fn clear(&self) {
        let mut state = self.state();
        if let Some(region) = state.take() {
            // Drop performs the 4-pass overwrite and munlock.
            drop(region);
            debug!("Secure buffer cleared ({} bytes)", self.len);
        }
    }

    fn count_access(&self, state: &mut Option<LockedRegion>) -> SecurityResult<()> {
        if state.is_none() {
            return Err(SecurityError::AlreadyCleared);
        }
        let previous = self.accesses.fetch_add(1, Ordering::SeqCst);
        if previous >= self.ceiling {
            warn!("Secure buffer access ceiling reached, wiping");
            state.take();
            return Err(SecurityError::AccessLimitExceeded);
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, Option<LockedRegion>> {
        // The guarded region is still wipeable after a panic elsewhere.
        self.region.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("len", &self.len)
            .field("cleared", &self.is_cleared())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Clears every registered buffer when the app is backgrounded or suspended.
#[derive(Default)]
pub struct BufferGuardian {
    buffers: Mutex<Vec<Weak<SecureBuffer>>>,
}

impl BufferGuardian {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `buffer`; the guardian holds only a weak reference.
    pub fn register(&self, buffer: &Arc<SecureBuffer>) {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        buffers.retain(|w| w.strong_count() > 0);
        buffers.push(Arc::downgrade(buffer));
    }

    /// Wipe every live buffer. Returns how many were wiped.
    pub fn clear_all(&self) -> usize {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cleared = 0;
        for buffer in buffers.iter().filter_map(Weak::upgrade) {
            if !buffer.is_cleared() {
                buffer.clear();
                cleared += 1;
            }
        }
        buffers.clear();
        cleared
    }

    /// React to a lifecycle signal; returns how many buffers were wiped.
    pub fn handle(&self, signal: LifecycleSignal) -> usize {
        if !signal.requires_wipe() {
            return 0;
        }
        let cleared = self.clear_all();
        debug!("Lifecycle {:?}: cleared {} secure buffers", signal, cleared);
        cleared
    }
}
