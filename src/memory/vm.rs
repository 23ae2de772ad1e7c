use std::io;
use std::ptr::NonNull;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] io::Error),
    #[error("VM decommit failed: {0}")]
    DecommitFailed(#[source] io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] io::Error),
    #[error("VM protection change failed: {0}")]
    ProtectFailed(#[source] io::Error),
    #[error("VM page lock failed: {0}")]
    LockFailed(#[source] io::Error),
    #[error("VM page unlock failed: {0}")]
    UnlockFailed(#[source] io::Error),
    #[error("VM query failed: {0}")]
    QueryFailed(#[source] io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("VM initialization failed: {0}")]
    InitializationFailed(String),
    /// The reserved region cannot hold the requested size. Usually means the
    /// reservation was sized too small up-front or something is leaking.
    #[error("capacity exhausted: requested {requested} bytes, capacity is {capacity} bytes")]
    CapacityExhausted { requested: usize, capacity: usize },
    #[error("memory region has already been released")]
    Released,
    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),
}

impl VmError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        VmError::InvalidArgument(msg.into())
    }
}

/// Page access protection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Protection {
    NoAccess,
    Read,
    #[default]
    ReadWrite,
    Execute,
    ExecuteRead,
    ExecuteReadWrite,
}

impl Protection {
    /// Map `rwx` permission bits onto the closest protection.
    /// Write-only does not exist on any supported platform and reads as `ReadWrite`.
    #[must_use]
    pub fn from_rwx(read: bool, write: bool, execute: bool) -> Self {
        match (read || write, write, execute) {
            (false, _, false) => Protection::NoAccess,
            (true, false, false) => Protection::Read,
            (_, true, false) => Protection::ReadWrite,
            (false, _, true) => Protection::Execute,
            (true, false, true) => Protection::ExecuteRead,
            (_, true, true) => Protection::ExecuteReadWrite,
        }
    }

    #[must_use]
    pub fn is_readable(self) -> bool {
        !matches!(self, Protection::NoAccess | Protection::Execute)
    }

    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, Protection::ReadWrite | Protection::ExecuteReadWrite)
    }
}

/// One contiguous segment of a queried address range sharing the same state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeInfo {
    pub address: usize,
    pub size: usize,
    pub committed: bool,
    pub protection: Protection,
}

impl RangeInfo {
    #[must_use]
    pub fn end(&self) -> usize {
        self.address + self.size
    }
}

/// Physical memory usage of the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageStatus {
    pub total_physical_bytes: u64,
    pub avail_physical_bytes: u64,
}

/// Abstract interface for virtual memory operations.
///
/// One implementation per target, selected at build time. All pointer/size
/// arguments are page-aligned; the checked wrappers in
/// [`vmem`](super::vmem) do the rounding and validation.
pub trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    ///
    /// # Safety
    /// `size` must be non-zero and a multiple of the allocation granularity.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Release address space entirely (after which pointers are invalid).
    ///
    /// # Safety
    /// `ptr`/`size` must describe exactly one live reservation returned by
    /// [`reserve`](Self::reserve).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    /// Freshly committed pages read as zero.
    ///
    /// # Safety
    /// The range must lie inside a reservation owned by the caller.
    unsafe fn commit(ptr: NonNull<u8>, size: usize, protection: Protection)
    -> Result<(), VmError>;

    /// Decommit (return physical pages, keep address range reserved).
    ///
    /// # Safety
    /// The range must lie inside a reservation owned by the caller and no
    /// live references may point into it.
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Change the protection of committed pages.
    ///
    /// # Safety
    /// Same as [`commit`](Self::commit).
    unsafe fn protect(ptr: NonNull<u8>, size: usize, protection: Protection)
    -> Result<(), VmError>;

    /// Pin committed pages in physical memory.
    ///
    /// # Safety
    /// Same as [`commit`](Self::commit).
    unsafe fn lock(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Undo [`lock`](Self::lock).
    ///
    /// # Safety
    /// Same as [`commit`](Self::commit).
    unsafe fn unlock(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size. Queried once and cached.
    fn page_size() -> usize;

    /// Alignment/size unit of reservations. May exceed the page size.
    fn allocation_granularity() -> usize;

    /// Describe the commit state and protection of `[ptr, ptr + size)` as a
    /// list of merged segments.
    fn query_range_info(ptr: NonNull<u8>, size: usize) -> Result<Vec<RangeInfo>, VmError>;
}

pub struct PlatformVmOps;

/// Append `info` to `out`, merging it into the last segment when both are
/// adjacent and share the same state.
#[allow(dead_code)]
fn push_merged(out: &mut Vec<RangeInfo>, info: RangeInfo) {
    if info.size == 0 {
        return;
    }
    if let Some(last) = out.last_mut() {
        if last.end() == info.address
            && last.committed == info.committed
            && last.protection == info.protection
        {
            last.size += info.size;
            return;
        }
    }
    out.push(info);
}

#[cfg(all(any(target_os = "linux", target_os = "macos"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, Protection, RangeInfo, VmError, VmOps};
    use std::io;

    fn prot_flags(protection: Protection) -> libc::c_int {
        match protection {
            Protection::NoAccess => libc::PROT_NONE,
            Protection::Read => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::Execute => libc::PROT_EXEC,
            Protection::ExecuteRead => libc::PROT_EXEC | libc::PROT_READ,
            Protection::ExecuteReadWrite => libc::PROT_EXEC | libc::PROT_READ | libc::PROT_WRITE,
        }
    }

    /// Linux: walk `/proc/self/maps`, clip each mapping to the queried range.
    /// Reserved pages are `PROT_NONE`, so "committed" is any other protection.
    #[cfg(target_os = "linux")]
    fn query_range_info_impl(ptr: NonNull<u8>, size: usize) -> Result<Vec<RangeInfo>, VmError> {
        let maps = std::fs::read_to_string("/proc/self/maps").map_err(VmError::QueryFailed)?;
        let start = ptr.as_ptr() as usize;
        let end = start + size;
        let mut out = Vec::new();

        for line in maps.lines() {
            let Some((lo, hi, perms)) = parse_maps_line(line) else {
                continue;
            };
            if hi <= start || lo >= end {
                continue;
            }
            let perms = perms.as_bytes();
            let protection = Protection::from_rwx(
                perms.first() == Some(&b'r'),
                perms.get(1) == Some(&b'w'),
                perms.get(2) == Some(&b'x'),
            );
            let clipped_lo = lo.max(start);
            let clipped_hi = hi.min(end);
            super::push_merged(
                &mut out,
                RangeInfo {
                    address: clipped_lo,
                    size: clipped_hi - clipped_lo,
                    committed: protection != Protection::NoAccess,
                    protection,
                },
            );
        }

        if out.is_empty() {
            return Err(VmError::QueryFailed(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no mapping covers {start:#x}..{end:#x}"),
            )));
        }
        Ok(out)
    }

    /// `7f12a000-7f12b000 rw-p 00000000 00:00 0  [path]`
    #[cfg(target_os = "linux")]
    fn parse_maps_line(line: &str) -> Option<(usize, usize, &str)> {
        let mut fields = line.split_ascii_whitespace();
        let (lo, hi) = fields.next()?.split_once('-')?;
        let perms = fields.next()?;
        let lo = usize::from_str_radix(lo, 16).ok()?;
        let hi = usize::from_str_radix(hi, 16).ok()?;
        Some((lo, hi, perms))
    }

    #[cfg(not(target_os = "linux"))]
    fn query_range_info_impl(
        _ptr: NonNull<u8>,
        _size: usize,
    ) -> Result<Vec<RangeInfo>, VmError> {
        Err(VmError::Unsupported("range info queries need /proc/self/maps"))
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn commit(
            ptr: NonNull<u8>,
            size: usize,
            protection: Protection,
        ) -> Result<(), VmError> {
            // Private anonymous pages are zero-filled on first touch, so
            // opening up the protection is all a commit needs.
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    prot_flags(protection),
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        #[cfg(target_os = "linux")]
        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_DONTNEED drops the pages immediately; the next touch after
            // recommit maps a fresh zero page.
            // Safety: FFI call to madvise.
            if unsafe {
                libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_DONTNEED)
            } != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        #[cfg(not(target_os = "linux"))]
        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_FREE on macOS/BSD may keep stale data. Mapping a fresh
            // PROT_NONE range over the pages guarantees zero-fill on recommit.
            // Safety: FFI call to mmap over a range we own.
            let result = unsafe {
                libc::mmap(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };
            if result == libc::MAP_FAILED {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn protect(
            ptr: NonNull<u8>,
            size: usize,
            protection: Protection,
        ) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    prot_flags(protection),
                )
            } != 0
            {
                return Err(VmError::ProtectFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn lock(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mlock.
            if unsafe { libc::mlock(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::LockFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn unlock(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munlock.
            if unsafe { libc::munlock(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::UnlockFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                match usize::try_from(raw) {
                    Ok(size) if size > 0 => size,
                    _ => panic!(
                        "sysconf(_SC_PAGESIZE) failed: {}",
                        io::Error::last_os_error()
                    ),
                }
            })
        }

        fn allocation_granularity() -> usize {
            // mmap hands out page-aligned ranges.
            Self::page_size()
        }

        fn query_range_info(ptr: NonNull<u8>, size: usize) -> Result<Vec<RangeInfo>, VmError> {
            query_range_info_impl(ptr, size)
        }
    }
}

#[cfg(all(windows, not(any(loom, miri))))]
mod windows {
    use super::{NonNull, PlatformVmOps, Protection, RangeInfo, VmError, VmOps};
    use core::ffi::c_void;
    use std::io;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_DECOMMIT, MEM_FREE, MEM_RELEASE, MEM_RESERVE, MEMORY_BASIC_INFORMATION,
        PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
        PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
        VirtualAlloc, VirtualFree, VirtualLock, VirtualProtect, VirtualQuery, VirtualUnlock,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    fn page_flags(protection: Protection) -> PAGE_PROTECTION_FLAGS {
        match protection {
            Protection::NoAccess => PAGE_NOACCESS,
            Protection::Read => PAGE_READONLY,
            Protection::ReadWrite => PAGE_READWRITE,
            Protection::Execute => PAGE_EXECUTE,
            Protection::ExecuteRead => PAGE_EXECUTE_READ,
            Protection::ExecuteReadWrite => PAGE_EXECUTE_READWRITE,
        }
    }

    fn protection_from_flags(flags: PAGE_PROTECTION_FLAGS) -> Protection {
        // Low byte holds the access kind; the rest are modifiers (guard, nocache...).
        match flags & 0xFF {
            PAGE_READONLY => Protection::Read,
            PAGE_READWRITE | PAGE_WRITECOPY => Protection::ReadWrite,
            PAGE_EXECUTE => Protection::Execute,
            PAGE_EXECUTE_READ => Protection::ExecuteRead,
            PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY => Protection::ExecuteReadWrite,
            _ => Protection::NoAccess,
        }
    }

    fn system_info() -> &'static SYSTEM_INFO {
        use crate::sync::OnceLock;
        struct Info(SYSTEM_INFO);
        // Safety: SYSTEM_INFO is plain data; the pointer fields are never dereferenced.
        unsafe impl Send for Info {}
        // Safety: see above.
        unsafe impl Sync for Info {}
        static INFO: OnceLock<Info> = OnceLock::new();
        &INFO
            .get_or_init(|| {
                // Safety: FFI call to GetSystemInfo.
                unsafe {
                    let mut info: SYSTEM_INFO = std::mem::zeroed();
                    GetSystemInfo(&mut info);
                    Info(info)
                }
            })
            .0
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe { VirtualAlloc(std::ptr::null(), size, MEM_RESERVE, PAGE_NOACCESS) };

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::last_os_error())),
            }
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            // VirtualFree with MEM_RELEASE must have size 0 and the base address of the region.
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), 0, MEM_RELEASE) } == 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn commit(
            ptr: NonNull<u8>,
            size: usize,
            protection: Protection,
        ) -> Result<(), VmError> {
            // Safety: FFI call to VirtualAlloc.
            let result = unsafe {
                VirtualAlloc(
                    ptr.as_ptr().cast::<c_void>(),
                    size,
                    MEM_COMMIT,
                    page_flags(protection),
                )
            };

            if result.is_null() {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), size, MEM_DECOMMIT) } == 0 {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn protect(
            ptr: NonNull<u8>,
            size: usize,
            protection: Protection,
        ) -> Result<(), VmError> {
            let mut old: PAGE_PROTECTION_FLAGS = 0;
            // Safety: FFI call to VirtualProtect.
            if unsafe {
                VirtualProtect(
                    ptr.as_ptr().cast::<c_void>(),
                    size,
                    page_flags(protection),
                    &mut old,
                )
            } == 0
            {
                return Err(VmError::ProtectFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn lock(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to VirtualLock.
            if unsafe { VirtualLock(ptr.as_ptr().cast::<c_void>(), size) } == 0 {
                return Err(VmError::LockFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn unlock(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to VirtualUnlock.
            if unsafe { VirtualUnlock(ptr.as_ptr().cast::<c_void>(), size) } == 0 {
                return Err(VmError::UnlockFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            system_info().dwPageSize as usize
        }

        fn allocation_granularity() -> usize {
            system_info().dwAllocationGranularity as usize
        }

        fn query_range_info(ptr: NonNull<u8>, size: usize) -> Result<Vec<RangeInfo>, VmError> {
            let start = ptr.as_ptr() as usize;
            let end = start + size;
            let mut cursor = start;
            let mut out = Vec::new();

            while cursor < end {
                // Safety: MEMORY_BASIC_INFORMATION is plain data.
                let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
                // Safety: FFI call to VirtualQuery with a valid out-buffer.
                let written = unsafe {
                    VirtualQuery(
                        cursor as *const c_void,
                        &mut mbi,
                        std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                    )
                };
                if written == 0 {
                    return Err(VmError::QueryFailed(io::Error::last_os_error()));
                }

                let region_lo = mbi.BaseAddress as usize;
                let region_hi = region_lo + mbi.RegionSize;
                let clipped_hi = region_hi.min(end);

                if mbi.State != MEM_FREE {
                    let committed = mbi.State == MEM_COMMIT;
                    let protection = if committed {
                        protection_from_flags(mbi.Protect)
                    } else {
                        Protection::NoAccess
                    };
                    super::push_merged(
                        &mut out,
                        RangeInfo {
                            address: cursor,
                            size: clipped_hi - cursor,
                            committed,
                            protection,
                        },
                    );
                }
                cursor = clipped_hi;
            }

            Ok(out)
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` we cannot issue real VM syscalls; loom runs inside a
// single OS process with its own scheduler. Instead we back every "reservation"
// with a plain zeroed heap allocation.
//
// `commit` is a no-op: the memory is always accessible once reserved.
// `decommit` zeroes the range so the zero-fill-on-recommit contract holds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
const MOCK_PAGE_SIZE: usize = 4096;

#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, MOCK_PAGE_SIZE)
            .map_err(|e| VmError::ReservationFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, MOCK_PAGE_SIZE)
            .map_err(|e| VmError::ReleaseFailed(io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize, _protection: Protection) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        // Safety: range lies inside a live mock reservation.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(())
    }

    unsafe fn protect(_ptr: NonNull<u8>, _size: usize, _protection: Protection) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn lock(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn unlock(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    fn page_size() -> usize {
        MOCK_PAGE_SIZE
    }

    fn allocation_granularity() -> usize {
        MOCK_PAGE_SIZE
    }

    fn query_range_info(_ptr: NonNull<u8>, _size: usize) -> Result<Vec<RangeInfo>, VmError> {
        Err(VmError::Unsupported("range info queries are not modelled by the heap mock"))
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");

            PlatformVmOps::commit(ptr, size, Protection::ReadWrite).expect("Commit failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            PlatformVmOps::decommit(ptr, size).expect("Decommit failed");
            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_commit_idempotent() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");

            PlatformVmOps::commit(ptr, size, Protection::ReadWrite).expect("First commit failed");
            PlatformVmOps::commit(ptr, size, Protection::ReadWrite)
                .expect("Second commit failed (idempotency check)");

            *(ptr.as_ptr()) = 123;

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_decommit_recommit_reads_zero() {
        // commit → write → decommit → recommit must hand back zero-filled pages.
        let size = PlatformVmOps::page_size() * 2;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size, Protection::ReadWrite).expect("Commit failed");

            std::ptr::write_bytes(ptr.as_ptr(), 0xAA, size);

            PlatformVmOps::decommit(ptr, size).expect("Decommit failed");
            PlatformVmOps::commit(ptr, size, Protection::ReadWrite).expect("Recommit failed");

            let slice = std::slice::from_raw_parts(ptr.as_ptr(), size);
            assert!(slice.iter().all(|&b| b == 0), "Recommitted memory is not zero-filled");

            ptr.as_ptr().write(0x42);
            assert_eq!(*ptr.as_ptr(), 0x42, "Recommitted memory is not writable");

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_decommit_twice_then_release() {
        let size = PlatformVmOps::page_size() * 4;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size, Protection::ReadWrite).expect("Commit failed");
            PlatformVmOps::decommit(ptr, size).expect("First decommit failed");
            PlatformVmOps::decommit(ptr, size).expect("Decommit of decommitted pages failed");
            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_partial_commit() {
        let page_size = PlatformVmOps::page_size();
        let total_size = page_size * 4;
        let commit_size = page_size * 2;

        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(total_size).expect("Reserve failed");
            let commit_ptr = NonNull::new(ptr.as_ptr().add(page_size)).unwrap();

            PlatformVmOps::commit(commit_ptr, commit_size, Protection::ReadWrite)
                .expect("Partial commit failed");

            let slice = std::slice::from_raw_parts_mut(commit_ptr.as_ptr(), commit_size);
            slice[0] = 10;
            slice[commit_size - 1] = 20;
            assert_eq!(slice[0], 10);
            assert_eq!(slice[commit_size - 1], 20);

            PlatformVmOps::release(ptr, total_size).expect("Release failed");
        }
    }

    #[test]
    fn test_protect_cycle() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size, Protection::ReadWrite).expect("Commit failed");

            for protection in [
                Protection::NoAccess,
                Protection::Read,
                Protection::ExecuteRead,
                Protection::ReadWrite,
            ] {
                PlatformVmOps::protect(ptr, size, protection)
                    .unwrap_or_else(|e| panic!("protect({protection:?}) failed: {e}"));
            }

            // The cycle ends writable again.
            *ptr.as_ptr() = 7;
            assert_eq!(*ptr.as_ptr(), 7);
            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_lock_unlock_committed_page() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            PlatformVmOps::commit(ptr, size, Protection::ReadWrite).expect("Commit failed");

            // RLIMIT_MEMLOCK / working-set quotas may forbid locking in
            // restricted environments.
            match PlatformVmOps::lock(ptr, size) {
                Ok(()) => PlatformVmOps::unlock(ptr, size).expect("Unlock failed"),
                Err(e) => eprintln!("test_lock_unlock_committed_page: not available: {e}"),
            }

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert!(size.is_power_of_two(), "Page size {size} is not power of two");
    }

    #[test]
    fn test_granularity_is_multiple_of_page_size() {
        let page = PlatformVmOps::page_size();
        let granularity = PlatformVmOps::allocation_granularity();
        assert!(granularity >= page);
        assert!(granularity.is_multiple_of(page));
    }

    #[test]
    fn test_reserve_very_large() {
        // Reserving 1GB of address space costs no physical memory.
        let size = 1024 * 1024 * 1024;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Failed to reserve 1GB");
            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_multiple_reservations() {
        let page_size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr1 = PlatformVmOps::reserve(page_size).expect("Reserve 1 failed");
            let ptr2 = PlatformVmOps::reserve(page_size).expect("Reserve 2 failed");
            assert_ne!(ptr1, ptr2);

            PlatformVmOps::commit(ptr1, page_size, Protection::ReadWrite).expect("Commit 1 failed");
            PlatformVmOps::commit(ptr2, page_size, Protection::ReadWrite).expect("Commit 2 failed");

            *(ptr1.as_ptr()) = 1;
            *(ptr2.as_ptr()) = 2;

            PlatformVmOps::release(ptr1, page_size).expect("Release 1 failed");

            // ptr2 should still be valid
            assert_eq!(*(ptr2.as_ptr()), 2);

            PlatformVmOps::release(ptr2, page_size).expect("Release 2 failed");
        }
    }

    #[cfg(any(target_os = "linux", windows))]
    #[test]
    fn test_query_range_info_segments() {
        let page = PlatformVmOps::page_size();
        let size = 256 * page;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");
            let base = ptr.as_ptr() as usize;

            let info = PlatformVmOps::query_range_info(ptr, size).expect("query failed");
            assert_eq!(
                info,
                vec![RangeInfo {
                    address: base,
                    size,
                    committed: false,
                    protection: Protection::NoAccess,
                }]
            );

            let second = NonNull::new_unchecked(ptr.as_ptr().add(page));
            PlatformVmOps::commit(second, page, Protection::Read).expect("Commit failed");

            let info = PlatformVmOps::query_range_info(ptr, size).expect("query failed");
            assert_eq!(info.len(), 3, "unexpected segments: {info:?}");
            assert_eq!(info[0].address, base);
            assert_eq!(info[0].size, page);
            assert!(!info[0].committed);
            assert_eq!(info[1].address, base + page);
            assert_eq!(info[1].size, page);
            assert!(info[1].committed);
            assert_eq!(info[1].protection, Protection::Read);
            assert_eq!(info[2].address, base + 2 * page);
            assert_eq!(info[2].size, size - 2 * page);
            assert!(!info[2].committed);

            // Querying only the first page sees a single uncommitted segment.
            let info = PlatformVmOps::query_range_info(ptr, page).expect("query failed");
            assert_eq!(info.len(), 1);
            assert_eq!(info[0].size, page);
            assert!(!info[0].committed);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_protection_from_rwx() {
        assert_eq!(Protection::from_rwx(false, false, false), Protection::NoAccess);
        assert_eq!(Protection::from_rwx(true, false, false), Protection::Read);
        assert_eq!(Protection::from_rwx(true, true, false), Protection::ReadWrite);
        assert_eq!(Protection::from_rwx(false, true, false), Protection::ReadWrite);
        assert_eq!(Protection::from_rwx(false, false, true), Protection::Execute);
        assert_eq!(Protection::from_rwx(true, false, true), Protection::ExecuteRead);
        assert_eq!(Protection::from_rwx(true, true, true), Protection::ExecuteReadWrite);
        assert!(Protection::ReadWrite.is_writable());
        assert!(!Protection::Execute.is_readable());
    }

    #[test]
    fn test_push_merged_joins_adjacent_equal_segments() {
        let mut out = Vec::new();
        let seg = |address, size, committed| RangeInfo {
            address,
            size,
            committed,
            protection: if committed { Protection::ReadWrite } else { Protection::NoAccess },
        };
        push_merged(&mut out, seg(0x1000, 0x1000, false));
        push_merged(&mut out, seg(0x2000, 0x1000, false));
        push_merged(&mut out, seg(0x3000, 0x2000, true));
        push_merged(&mut out, seg(0x5000, 0, false));
        push_merged(&mut out, seg(0x6000, 0x1000, true));
        assert_eq!(
            out,
            vec![seg(0x1000, 0x2000, false), seg(0x3000, 0x2000, true), seg(0x6000, 0x1000, true)]
        );
    }
}
