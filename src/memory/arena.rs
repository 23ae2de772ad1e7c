use std::ptr::NonNull;

use super::commit::CommitTracker;
use super::diag;
use super::platform::{PlatformInfo, align_backward, is_aligned};
use super::stats;
use super::vm::{PlatformVmOps, Protection, VmError, VmOps};
use super::vmem::Reservation;

/// Configuration for an [`Arena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Bytes of address space reserved up front. Rounded up to the page size.
    /// Default: 64 MiB.
    pub capacity: usize,
    /// Bytes committed at construction. Default: 0.
    pub initial_commit: usize,
    /// Protection of committed pages. Must be writable. Default: `ReadWrite`.
    pub protection: Protection,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024 * 1024,
            initial_commit: 0,
            protection: Protection::ReadWrite,
        }
    }
}

impl ArenaConfig {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity, ..Self::default() }
    }

    #[must_use]
    pub fn with_initial_commit(mut self, bytes: usize) -> Self {
        self.initial_commit = bytes;
        self
    }

    #[must_use]
    pub fn with_protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }
}

/// A linear bump allocator over one fixed reservation.
///
/// Address space is reserved once; pages are committed as the cursor grows.
/// Every range returned by [`push`](Self::push) keeps its address for the
/// life of the arena.
pub struct Arena<V: VmOps = PlatformVmOps> {
    /// `None` once released.
    base: Option<NonNull<u8>>,
    /// `None` for arenas over caller-owned memory.
    reservation: Option<Reservation<V>>,
    tracker: CommitTracker,
    protection: Protection,
    committed: usize,
    len: usize,
}

// Safety: Arena exclusively owns (or was handed exclusive use of) its region.
unsafe impl<V: VmOps> Send for Arena<V> {}

impl Arena<PlatformVmOps> {
    /// Reserve an arena of `capacity` bytes with default settings.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if `capacity` is zero or reservation fails.
    pub fn new(capacity: usize) -> Result<Self, VmError> {
        Self::new_in(ArenaConfig::new(capacity))
    }

    pub fn with_config(config: ArenaConfig) -> Result<Self, VmError> {
        Self::new_in(config)
    }

    /// Build an arena over memory the caller already reserved.
    ///
    /// The arena commits and decommits inside the region but never releases
    /// it. `capacity` is rounded down to whole pages.
    ///
    /// # Safety
    /// `ptr` must start a reserved region of at least `capacity` bytes that
    /// stays reserved, and is used by nothing else, for the arena's lifetime.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, capacity: usize) -> Result<Self, VmError> {
        // Safety: forwarded to caller.
        unsafe { Self::from_raw_parts_in(ptr, capacity) }
    }
}

impl<V: VmOps> Arena<V> {
    /// Reserve an arena through an explicit backend.
    pub fn new_in(config: ArenaConfig) -> Result<Self, VmError> {
        Self::create(config).inspect_err(diag::record)
    }

    fn create(config: ArenaConfig) -> Result<Self, VmError> {
        if config.capacity == 0 {
            return Err(VmError::invalid("arena capacity must be non-zero"));
        }
        // as_slice/as_mut_slice hand out committed bytes, so they must be writable.
        if !config.protection.is_writable() {
            return Err(VmError::invalid(format!(
                "arena protection {:?} is not writable",
                config.protection
            )));
        }
        let info = PlatformInfo::of::<V>();
        let capacity = info
            .page_align(config.capacity)
            .ok_or_else(|| VmError::invalid(format!("arena capacity {} overflows", config.capacity)))?;
        let reservation = Reservation::<V>::new_in(capacity)?;

        let mut arena = Self {
            base: Some(reservation.as_ptr()),
            tracker: CommitTracker::new(info.page_size(), capacity),
            reservation: Some(reservation),
            protection: config.protection,
            committed: 0,
            len: 0,
        };
        if config.initial_commit > 0 {
            arena.commit_to(config.initial_commit)?;
        }

        tracing::debug!(capacity, initial_commit = arena.committed, "arena created");
        Ok(arena)
    }

    /// See [`Arena::from_raw_parts`].
    ///
    /// # Safety
    /// See [`Arena::from_raw_parts`].
    pub unsafe fn from_raw_parts_in(ptr: NonNull<u8>, capacity: usize) -> Result<Self, VmError> {
        Self::wrap(ptr, capacity).inspect_err(diag::record)
    }

    fn wrap(ptr: NonNull<u8>, capacity: usize) -> Result<Self, VmError> {
        let page_size = PlatformInfo::of::<V>().page_size();
        if !is_aligned(ptr.as_ptr() as usize, page_size) {
            return Err(VmError::invalid(format!("arena base {ptr:p} is not page-aligned")));
        }
        let capacity = align_backward(capacity, page_size);
        if capacity == 0 {
            return Err(VmError::invalid("arena region is smaller than one page"));
        }
        tracing::debug!(ptr = ?ptr, capacity, "arena created over existing region");
        Ok(Self {
            base: Some(ptr),
            reservation: None,
            tracker: CommitTracker::new(page_size, capacity),
            protection: Protection::ReadWrite,
            committed: 0,
            len: 0,
        })
    }

    /// Bump-allocate `size` bytes, committing pages as needed.
    ///
    /// The returned range is zero-filled the first time its pages are committed.
    /// `push(0)` returns an empty range at the cursor.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::CapacityExhausted`] past the reserved capacity,
    /// [`VmError::Released`] after [`release`](Self::release), or the OS
    /// commit failure.
    pub fn push(&mut self, size: usize) -> Result<NonNull<[u8]>, VmError> {
        self.push_inner(size).inspect_err(diag::record)
    }

    fn push_inner(&mut self, size: usize) -> Result<NonNull<[u8]>, VmError> {
        let base = self.base.ok_or(VmError::Released)?;
        let new_len = self.len.checked_add(size).ok_or(VmError::CapacityExhausted {
            requested: usize::MAX,
            capacity: self.tracker.capacity(),
        })?;
        if new_len > self.committed {
            self.commit_to(new_len)?;
        }
        // Safety: len <= committed <= capacity, inside our region.
        let start = unsafe { base.add(self.len) };
        self.len = new_len;
        Ok(NonNull::slice_from_raw_parts(start, size))
    }

    /// Move the commit boundary to cover `bytes` (rounded up to whole pages).
    ///
    /// Committing ahead avoids syscalls on later pushes. Going below
    /// [`len`](Self::len) truncates the arena to `bytes` and invalidates every
    /// range past it.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::CapacityExhausted`] past the reserved capacity,
    /// [`VmError::Released`] after release, or the OS commit or decommit
    /// failure. The arena is unchanged on error.
    pub fn set_committed(&mut self, bytes: usize) -> Result<(), VmError> {
        self.commit_to(bytes).inspect_err(diag::record)?;
        self.len = self.len.min(bytes);
        Ok(())
    }

    /// Shrink the arena to `len` bytes and decommit the whole pages past it.
    /// A `len` at or past the current length does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Released`] after release, or the OS decommit
    /// failure. The arena is unchanged on error.
    pub fn truncate(&mut self, len: usize) -> Result<(), VmError> {
        if len >= self.len {
            return Ok(());
        }
        self.commit_to(len).inspect_err(diag::record)?;
        self.len = len;
        Ok(())
    }

    fn commit_to(&mut self, requested: usize) -> Result<(), VmError> {
        let base = self.base.ok_or(VmError::Released)?;
        // Safety: base starts our region of tracker.capacity() bytes and
        // self.committed is its current commit boundary.
        let committed = unsafe {
            self.tracker
                .adjust::<V>(base, self.protection, self.committed, requested)?
        };
        stats::track_commit(&stats::ARENA_COMMITTED, self.committed, committed);
        self.committed = committed;
        Ok(())
    }

    /// Give the region back. Owned reservations are released; borrowed ones
    /// are decommitted and forgotten. Calling this again does nothing.
    ///
    /// # Errors
    ///
    /// Returns the OS failure to decommit a borrowed region or to release an
    /// owned one.
    pub fn release(&mut self) -> Result<(), VmError> {
        if self.base.is_none() {
            return Ok(());
        }
        if self.reservation.is_none() {
            self.commit_to(0).inspect_err(diag::record)?;
        }
        self.base = None;
        stats::track_commit(&stats::ARENA_COMMITTED, self.committed, 0);
        self.committed = 0;
        self.len = 0;
        tracing::debug!(capacity = self.tracker.capacity(), "arena released");
        match self.reservation.take() {
            Some(reservation) => reservation.release(),
            None => Ok(()),
        }
    }

    /// `true` while the arena holds a region.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.base.is_some() && self.tracker.capacity() > 0
    }

    #[must_use]
    pub fn owns_reservation(&self) -> bool {
        self.reservation.is_some()
    }

    #[must_use]
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tracker.capacity()
    }

    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.committed
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.tracker.capacity() - self.len
    }

    #[must_use]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Whether `ptr` falls inside the pushed bytes.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.base.is_some_and(|base| {
            let start = base.as_ptr() as usize;
            (start..start + self.len).contains(&(ptr as usize))
        })
    }

    /// The pushed bytes. Empty after release.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self.base {
            // Safety: [base, base + len) is committed.
            Some(base) => unsafe { std::slice::from_raw_parts(base.as_ptr(), self.len) },
            None => &[],
        }
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.base {
            // Safety: [base, base + len) is committed and we hold &mut self.
            Some(base) => unsafe { std::slice::from_raw_parts_mut(base.as_ptr(), self.len) },
            None => &mut [],
        }
    }
}

impl<V: VmOps> Drop for Arena<V> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "arena release failed during drop");
        }
    }
}

impl<V: VmOps> std::fmt::Debug for Arena<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("base", &self.base)
            .field("capacity", &self.tracker.capacity())
            .field("committed", &self.committed)
            .field("len", &self.len)
            .field("owned", &self.reservation.is_some())
            .finish()
    }
}
