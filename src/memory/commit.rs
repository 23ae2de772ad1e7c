use std::ptr::NonNull;

use crate::memory::platform::{PlatformInfo, align_forward};
use crate::memory::vm::{Protection, VmError, VmOps};

/// Physical footprint of `size` bytes of a region: `size` rounded up to
/// whole pages.
#[must_use]
pub fn calc_bytes_used_for_size(size: usize) -> usize {
    align_forward(size, PlatformInfo::get().page_size())
}

/// The syscall a commit adjustment needs, as an offset range from the region base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitAction {
    None,
    Commit { offset: usize, len: usize },
    Decommit { offset: usize, len: usize },
}

/// Outcome of [`CommitTracker::plan`]: the new page-aligned committed size and
/// the single range operation that gets there.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitPlan {
    pub committed: usize,
    pub action: CommitAction,
}

/// Growth/shrink algorithm shared by [`Arena`](super::arena::Arena) and
/// [`SlotPool`](super::slot_pool::SlotPool).
///
/// Holds only the region's page size and capacity. The committed size lives
/// with the owner and is passed in on every call, so planning is a pure
/// function of `(previous, requested)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitTracker {
    page_size: usize,
    capacity: usize,
}

impl CommitTracker {
    #[must_use]
    pub fn new(page_size: usize, capacity: usize) -> Self {
        debug_assert!(page_size.is_power_of_two(), "page size {page_size} is not a power of two");
        Self { page_size, capacity }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Work out how to move the committed size from `previous` to cover
    /// `requested` bytes.
    ///
    /// Growth commits only the pages in `[old, new)`; shrinking decommits
    /// whole pages past the new boundary. Staying within the same page is a
    /// no-op.
    ///
    /// # Errors
    /// [`VmError::CapacityExhausted`] if growing past the capacity. Reaching
    /// the capacity exactly is allowed.
    pub fn plan(&self, previous: usize, requested: usize) -> Result<CommitPlan, VmError> {
        let old = align_forward(previous, self.page_size);
        if requested == previous {
            return Ok(CommitPlan { committed: old, action: CommitAction::None });
        }

        if requested > self.capacity {
            tracing::error!(requested, capacity = self.capacity, "commit past reserved capacity");
            return Err(VmError::CapacityExhausted { requested, capacity: self.capacity });
        }

        let new = align_forward(requested, self.page_size);
        let action = match new.cmp(&old) {
            std::cmp::Ordering::Equal => CommitAction::None,
            std::cmp::Ordering::Greater => CommitAction::Commit { offset: old, len: new - old },
            std::cmp::Ordering::Less => CommitAction::Decommit { offset: new, len: old - new },
        };
        Ok(CommitPlan { committed: new, action })
    }

    /// Plan and apply an adjustment to the region at `base`. Returns the new
    /// committed size.
    ///
    /// # Safety
    /// `base` must be the start of a region of at least `capacity` reserved
    /// bytes owned by the caller, `previous` must be its current committed
    /// size, and nothing may reference bytes that get decommitted.
    pub unsafe fn adjust<V: VmOps>(
        &self,
        base: NonNull<u8>,
        protection: Protection,
        previous: usize,
        requested: usize,
    ) -> Result<usize, VmError> {
        let plan = self.plan(previous, requested)?;
        match plan.action {
            CommitAction::None => {}
            CommitAction::Commit { offset, len } => {
                tracing::trace!(base = ?base, offset, len, "commit");
                // Safety: offset + len <= capacity, within the caller's region.
                unsafe { V::commit(base.add(offset), len, protection)? };
            }
            CommitAction::Decommit { offset, len } => {
                tracing::trace!(base = ?base, offset, len, "decommit");
                // Safety: see above; caller guarantees no live references.
                unsafe { V::decommit(base.add(offset), len)? };
            }
        }
        Ok(plan.committed)
    }
}
