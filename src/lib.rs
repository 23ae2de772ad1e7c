#[cfg(not(target_pointer_width = "64"))]
compile_error!("vmem supports only 64-bit targets.");

pub(crate) mod sync;

// public module: submodules stay pub(crate); the API is re-exported below
pub mod memory;

// raw virtual memory
pub use memory::platform::{PlatformInfo, align_backward, align_forward, init_platform, is_aligned};
pub use memory::vm::{PlatformVmOps, Protection, RangeInfo, UsageStatus, VmOps};
pub use memory::vmem::{
    Reservation, allocation_granularity, commit, commit_protect, decommit, lock, page_size,
    protect, query_range_info, query_usage_status, release, reserve, reserve_protect, unlock,
};

// growth algorithm
pub use memory::commit::{CommitAction, CommitPlan, CommitTracker, calc_bytes_used_for_size};

// allocators/containers
pub use memory::arena::{Arena, ArenaConfig};
pub use memory::slot_pool::{SLOT_INDEX_INVALID, SlotIndex, SlotPool, SlotPoolConfig};
pub use memory::varray::VArray;
pub use memory::vpool::VPool;

// diagnostics/stats
pub use memory::diag::{clear_last_error, last_error_message};
pub use memory::stats::{MemoryStats, snapshot as memory_stats};

// errors
pub use memory::vm::VmError;
