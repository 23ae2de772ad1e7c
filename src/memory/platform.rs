use crate::memory::vm::{PlatformVmOps, VmOps};
use crate::sync::OnceLock;

/// Page size and allocation granularity of the running system.
///
/// Queried once per process and cached; every allocator copies the values it
/// needs at construction time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlatformInfo {
    page_size: usize,
    allocation_granularity: usize,
}

impl PlatformInfo {
    /// Process-wide info for the native VM backend.
    pub fn get() -> &'static PlatformInfo {
        static INFO: OnceLock<PlatformInfo> = OnceLock::new();
        INFO.get_or_init(Self::of::<PlatformVmOps>)
    }

    /// Info for an arbitrary backend. Backends cache their own values.
    #[must_use]
    pub fn of<V: VmOps>() -> PlatformInfo {
        let page_size = V::page_size();
        let allocation_granularity = V::allocation_granularity();
        debug_assert!(page_size.is_power_of_two(), "page size {page_size} is not a power of two");
        debug_assert!(
            allocation_granularity >= page_size,
            "allocation granularity {allocation_granularity} below page size {page_size}"
        );
        PlatformInfo { page_size, allocation_granularity }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn allocation_granularity(&self) -> usize {
        self.allocation_granularity
    }

    /// Round `size` up to whole pages. `None` on overflow.
    #[must_use]
    pub fn page_align(&self, size: usize) -> Option<usize> {
        size.checked_next_multiple_of(self.page_size)
    }
}

/// Query and cache the platform info. Idempotent; the allocators call this
/// implicitly, so explicit initialization is optional.
pub fn init_platform() -> &'static PlatformInfo {
    let info = PlatformInfo::get();
    tracing::debug!(
        page_size = info.page_size,
        allocation_granularity = info.allocation_granularity,
        "platform info initialized"
    );
    info
}

/// Round `value` up to a multiple of `align`.
///
/// `align` must be a power of two.
#[must_use]
pub fn align_forward(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
    value.next_multiple_of(align)
}

/// Round `value` down to a multiple of `align`.
///
/// `align` must be a power of two.
#[must_use]
pub fn align_backward(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
    value & !(align - 1)
}

/// Whether `value` is a multiple of `align`. Zero or non-power-of-two
/// alignments are never satisfied.
#[must_use]
pub fn is_aligned(value: usize, align: usize) -> bool {
    align.is_power_of_two() && value & (align - 1) == 0
}
