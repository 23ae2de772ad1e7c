//! Checked entry points over [`PlatformVmOps`].
//!
//! These validate their arguments before touching the OS, round addresses
//! and sizes to page boundaries, and record every failure in the calling
//! thread's diagnostic buffer. Commit-style operations act on every page that
//! contains at least one byte of the given range.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::memory::diag;
use crate::memory::platform::{PlatformInfo, align_backward, is_aligned};
use crate::memory::stats;
use crate::memory::vm::{PlatformVmOps, Protection, RangeInfo, UsageStatus, VmError, VmOps};

#[must_use]
pub fn page_size() -> usize {
    PlatformInfo::get().page_size()
}

#[must_use]
pub fn allocation_granularity() -> usize {
    PlatformInfo::get().allocation_granularity()
}

fn reservation_size(size: usize, granularity: usize) -> Result<usize, VmError> {
    if size == 0 {
        return Err(VmError::invalid("cannot reserve zero bytes"));
    }
    size.checked_next_multiple_of(granularity)
        .ok_or_else(|| VmError::invalid(format!("reservation of {size} bytes overflows")))
}

/// Expand `[ptr, ptr + len)` to whole pages.
fn page_span(ptr: *const u8, len: usize, page_size: usize) -> Result<(NonNull<u8>, usize), VmError> {
    if ptr.is_null() {
        return Err(VmError::invalid("null address"));
    }
    if len == 0 {
        return Err(VmError::invalid("zero-length range"));
    }
    let start = ptr as usize;
    let end = start
        .checked_add(len)
        .and_then(|end| end.checked_next_multiple_of(page_size))
        .ok_or_else(|| VmError::invalid(format!("range {start:#x}+{len} overflows")))?;
    let aligned = align_backward(start, page_size);
    let base = NonNull::new(ptr.cast_mut().wrapping_sub(start - aligned))
        .ok_or_else(|| VmError::invalid("range starts in the null page"))?;
    Ok((base, end - aligned))
}

/// Reserve `size` bytes of address space, rounded up to the allocation
/// granularity. Nothing is committed; touching the range faults until
/// [`commit`] is called.
pub fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
    reserve_with::<PlatformVmOps>(size).inspect_err(diag::record)
}

fn reserve_with<V: VmOps>(size: usize) -> Result<NonNull<u8>, VmError> {
    let size = reservation_size(size, V::allocation_granularity())?;
    // Safety: size is non-zero and granularity-aligned.
    unsafe { V::reserve(size) }
}

/// Reserve `size` bytes and commit the whole range with `protection`.
/// `NoAccess` is equivalent to [`reserve`].
pub fn reserve_protect(size: usize, protection: Protection) -> Result<NonNull<u8>, VmError> {
    reserve_protect_with::<PlatformVmOps>(size, protection).inspect_err(diag::record)
}

fn reserve_protect_with<V: VmOps>(
    size: usize,
    protection: Protection,
) -> Result<NonNull<u8>, VmError> {
    let ptr = reserve_with::<V>(size)?;
    if protection == Protection::NoAccess {
        return Ok(ptr);
    }
    let size = reservation_size(size, V::allocation_granularity())?;
    // Safety: the range is the reservation we just created.
    if let Err(e) = unsafe { V::commit(ptr, size, protection) } {
        // Safety: same reservation, nothing references it yet.
        drop(unsafe { V::release(ptr, size) });
        return Err(e);
    }
    Ok(ptr)
}

/// Release a reservation made by [`reserve`] or [`reserve_protect`].
///
/// # Safety
/// `ptr` and `size` must be the exact values used to reserve, and no
/// references into the range may outlive this call.
pub unsafe fn release(ptr: *mut u8, size: usize) -> Result<(), VmError> {
    // Safety: forwarded to caller.
    unsafe { release_with::<PlatformVmOps>(ptr, size) }.inspect_err(diag::record)
}

unsafe fn release_with<V: VmOps>(ptr: *mut u8, size: usize) -> Result<(), VmError> {
    let granularity = V::allocation_granularity();
    let Some(ptr) = NonNull::new(ptr) else {
        return Err(VmError::invalid("cannot release a null address"));
    };
    if !is_aligned(ptr.as_ptr() as usize, granularity) {
        return Err(VmError::invalid(format!(
            "release address {ptr:p} is not aligned to the allocation granularity {granularity}"
        )));
    }
    let size = reservation_size(size, granularity)?;
    // Safety: forwarded to caller.
    unsafe { V::release(ptr, size) }
}

/// Commit the pages overlapping `[ptr, ptr + len)` read-write.
///
/// # Safety
/// The range must lie inside a reservation owned by the caller.
pub unsafe fn commit(ptr: *mut u8, len: usize) -> Result<(), VmError> {
    // Safety: forwarded to caller.
    unsafe { commit_protect(ptr, len, Protection::ReadWrite) }
}

/// Commit the pages overlapping `[ptr, ptr + len)` with `protection`.
/// Freshly committed pages read as zero.
///
/// # Safety
/// The range must lie inside a reservation owned by the caller.
pub unsafe fn commit_protect(
    ptr: *mut u8,
    len: usize,
    protection: Protection,
) -> Result<(), VmError> {
    page_span(ptr, len, page_size())
        // Safety: forwarded to caller.
        .and_then(|(base, len)| unsafe { PlatformVmOps::commit(base, len, protection) })
        .inspect_err(diag::record)
}

/// Return the pages overlapping `[ptr, ptr + len)` to the OS, keeping the
/// address range reserved. Their contents read as zero after a recommit.
///
/// # Safety
/// The range must lie inside a reservation owned by the caller and no live
/// references may point into it.
pub unsafe fn decommit(ptr: *mut u8, len: usize) -> Result<(), VmError> {
    page_span(ptr, len, page_size())
        // Safety: forwarded to caller.
        .and_then(|(base, len)| unsafe { PlatformVmOps::decommit(base, len) })
        .inspect_err(diag::record)
}

/// Change the protection of the committed pages overlapping `[ptr, ptr + len)`.
///
/// # Safety
/// The range must lie inside a reservation owned by the caller, and no live
/// references may rely on access the new protection revokes.
pub unsafe fn protect(ptr: *mut u8, len: usize, protection: Protection) -> Result<(), VmError> {
    page_span(ptr, len, page_size())
        // Safety: forwarded to caller.
        .and_then(|(base, len)| unsafe { PlatformVmOps::protect(base, len, protection) })
        .inspect_err(diag::record)
}

/// Pin the pages overlapping `[ptr, ptr + len)` in physical memory.
///
/// # Safety
/// The range must lie inside a reservation owned by the caller.
pub unsafe fn lock(ptr: *mut u8, len: usize) -> Result<(), VmError> {
    page_span(ptr, len, page_size())
        // Safety: forwarded to caller.
        .and_then(|(base, len)| unsafe { PlatformVmOps::lock(base, len) })
        .inspect_err(diag::record)
}

/// Undo [`lock`].
///
/// # Safety
/// The range must lie inside a reservation owned by the caller.
pub unsafe fn unlock(ptr: *mut u8, len: usize) -> Result<(), VmError> {
    page_span(ptr, len, page_size())
        // Safety: forwarded to caller.
        .and_then(|(base, len)| unsafe { PlatformVmOps::unlock(base, len) })
        .inspect_err(diag::record)
}

/// Commit state and protection of the pages overlapping `[ptr, ptr + len)`.
pub fn query_range_info(ptr: *const u8, len: usize) -> Result<Vec<RangeInfo>, VmError> {
    page_span(ptr, len, page_size())
        .and_then(|(base, len)| PlatformVmOps::query_range_info(base, len))
        .inspect_err(diag::record)
}

/// Physical memory totals of the machine.
pub fn query_usage_status() -> Result<UsageStatus, VmError> {
    usage_status().inspect_err(diag::record)
}

fn usage_status() -> Result<UsageStatus, VmError> {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let total = system.total_memory();
    if total == 0 {
        return Err(VmError::QueryFailed(std::io::Error::other(
            "physical memory size unavailable",
        )));
    }
    Ok(UsageStatus {
        total_physical_bytes: total,
        avail_physical_bytes: system.available_memory().min(total),
    })
}

/// An owned reservation, released on drop.
///
/// The size is rounded up to the backend's allocation granularity at creation.
pub struct Reservation<V: VmOps = PlatformVmOps> {
    ptr: NonNull<u8>,
    size: usize,
    _ops: PhantomData<fn() -> V>,
}

// Safety: the reservation is exclusively owned address space.
unsafe impl<V: VmOps> Send for Reservation<V> {}
// Safety: shared access only reads the pointer and size.
unsafe impl<V: VmOps> Sync for Reservation<V> {}

impl Reservation<PlatformVmOps> {
    pub fn new(size: usize) -> Result<Self, VmError> {
        Self::new_in(size)
    }
}

impl<V: VmOps> Reservation<V> {
    /// Reserve through an explicit backend.
    pub fn new_in(size: usize) -> Result<Self, VmError> {
        Self::reserve(size).inspect_err(diag::record)
    }

    fn reserve(size: usize) -> Result<Self, VmError> {
        let size = reservation_size(size, V::allocation_granularity())?;
        // Safety: size is non-zero and granularity-aligned.
        let ptr = unsafe { V::reserve(size)? };
        stats::TOTAL_RESERVED.add(size);
        tracing::debug!(ptr = ?ptr, size, "reserved address space");
        Ok(Self { ptr, size, _ops: PhantomData })
    }

    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.ptr.as_ptr() as usize;
        (start..start + self.size).contains(&(ptr as usize))
    }

    /// Release explicitly, surfacing the OS error that `Drop` would swallow.
    pub fn release(self) -> Result<(), VmError> {
        let this = std::mem::ManuallyDrop::new(self);
        // Safety: ptr/size describe the reservation we own; `this` is never used again.
        unsafe { this.release_raw() }.inspect_err(diag::record)
    }

    unsafe fn release_raw(&self) -> Result<(), VmError> {
        stats::TOTAL_RESERVED.sub(self.size);
        tracing::debug!(ptr = ?self.ptr, size = self.size, "releasing address space");
        // Safety: forwarded to caller.
        unsafe { V::release(self.ptr, self.size) }
    }
}

impl<V: VmOps> Drop for Reservation<V> {
    fn drop(&mut self) {
        // Safety: we own the reservation and this is its last use.
        if let Err(e) = unsafe { self.release_raw() } {
            diag::record(&e);
            tracing::warn!(ptr = ?self.ptr, size = self.size, error = %e, "failed to release reservation");
        }
    }
}

impl<V: VmOps> std::fmt::Debug for Reservation<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;
    use crate::memory::diag::{clear_last_error, last_error_message};

    #[test]
    fn test_reserve_commit_write_release() {
        let page = page_size();
        let ptr = reserve(page * 4).unwrap();
        // Safety: Test code.
        unsafe {
            commit(ptr.as_ptr(), page).unwrap();
            ptr.as_ptr().write_bytes(0x5A, page);
            assert_eq!(*ptr.as_ptr().add(page - 1), 0x5A);
            decommit(ptr.as_ptr(), page).unwrap();
            release(ptr.as_ptr(), page * 4).unwrap();
        }
    }

    #[test]
    fn test_commit_rounds_to_pages() {
        let page = page_size();
        let ptr = reserve(page * 4).unwrap();
        // Safety: Test code.
        unsafe {
            // One byte straddling the first page boundary commits two pages.
            commit(ptr.as_ptr().add(page - 1), 2).unwrap();
            *ptr.as_ptr() = 1;
            *ptr.as_ptr().add(2 * page - 1) = 2;
            assert_eq!(*ptr.as_ptr(), 1);
            assert_eq!(*ptr.as_ptr().add(2 * page - 1), 2);
            release(ptr.as_ptr(), page * 4).unwrap();
        }
    }

    #[test]
    fn test_reserve_protect_commits_whole_range() {
        let page = page_size();
        let ptr = reserve_protect(page * 2, Protection::ReadWrite).unwrap();
        // Safety: Test code.
        unsafe {
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), page * 2);
            assert!(slice.iter().all(|&b| b == 0));
            slice.fill(0xFF);
            release(ptr.as_ptr(), page * 2).unwrap();
        }
    }

    #[test]
    fn test_argument_validation_records_message() {
        clear_last_error();
        assert!(matches!(reserve(0), Err(VmError::InvalidArgument(_))));
        assert!(!last_error_message().is_empty());

        clear_last_error();
        // Safety: Test code; validation fails before any syscall.
        unsafe {
            assert!(matches!(
                commit(std::ptr::null_mut(), 16),
                Err(VmError::InvalidArgument(_))
            ));
            assert!(last_error_message().contains("null"));

            assert!(matches!(
                release(std::ptr::dangling_mut::<u8>(), 1),
                Err(VmError::InvalidArgument(_))
            ));
            assert!(last_error_message().contains("aligned"));
        }

        let ptr = reserve(page_size()).unwrap();
        // Safety: Test code.
        unsafe {
            assert!(matches!(commit(ptr.as_ptr(), 0), Err(VmError::InvalidArgument(_))));
            release(ptr.as_ptr(), page_size()).unwrap();
        }
        clear_last_error();
    }

    #[test]
    fn test_protect_and_lock_committed_pages() {
        let page = page_size();
        let ptr = reserve(page * 2).unwrap();
        // Safety: Test code.
        unsafe {
            commit(ptr.as_ptr(), page * 2).unwrap();
            protect(ptr.as_ptr(), page, Protection::Read).unwrap();
            protect(ptr.as_ptr(), page, Protection::ReadWrite).unwrap();
            *ptr.as_ptr() = 3;

            match lock(ptr.as_ptr(), 1024) {
                Ok(()) => unlock(ptr.as_ptr(), 1024).unwrap(),
                Err(e) => eprintln!("test_protect_and_lock_committed_pages: lock unavailable: {e}"),
            }
            release(ptr.as_ptr(), page * 2).unwrap();
        }
    }

    #[test]
    fn test_usage_status() {
        let status = query_usage_status().unwrap();
        assert!(status.total_physical_bytes > 0);
        assert!(status.avail_physical_bytes <= status.total_physical_bytes);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_query_range_info_after_partial_commit() {
        let page = page_size();
        let size = 1024 * 1024;
        let ptr = reserve(size).unwrap();
        // Safety: Test code.
        unsafe {
            commit_protect(ptr.as_ptr().add(page), 1, Protection::Read).unwrap();
        }
        let info = query_range_info(ptr.as_ptr(), size).unwrap();
        assert_eq!(info.len(), 3, "unexpected segments: {info:?}");
        assert!(info[1].committed);
        assert_eq!(info[1].protection, Protection::Read);
        assert_eq!(info.iter().map(|s| s.size).sum::<usize>(), size);
        // Safety: Test code.
        unsafe { release(ptr.as_ptr(), size).unwrap() };
    }

    #[test]
    fn test_query_range_info_rejects_null() {
        assert!(matches!(
            query_range_info(std::ptr::null(), 16),
            Err(VmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reservation_rounds_and_releases() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let reservation = Reservation::new(1).unwrap();
        assert_eq!(reservation.size(), allocation_granularity());
        assert!(reservation.contains(reservation.as_ptr().as_ptr()));
        // Safety: Test code.
        let past_end = unsafe { reservation.as_ptr().as_ptr().add(reservation.size()) };
        assert!(!reservation.contains(past_end));
        reservation.release().unwrap();
    }
}
