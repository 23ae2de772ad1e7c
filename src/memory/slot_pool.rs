use std::ptr::NonNull;

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

use super::commit::CommitTracker;
use super::diag;
use super::platform::{PlatformInfo, is_aligned};
use super::stats;
use super::vm::{PlatformVmOps, Protection, VmError, VmOps};
use super::vmem::Reservation;

/// Index of a slot inside a [`SlotPool`].
pub type SlotIndex = u32;

/// Free-list terminator. Never a valid slot.
pub const SLOT_INDEX_INVALID: SlotIndex = SlotIndex::MAX;

/// Configuration for a [`SlotPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotPoolConfig {
    /// Upper bound on slots ever handed out. Must be below [`SLOT_INDEX_INVALID`].
    /// Default: 65536.
    pub max_slots: usize,
    /// Stride in bytes. At least `size_of::<SlotIndex>()`. Default: 64.
    pub slot_size: usize,
    /// Slots committed at construction. Default: 0.
    pub initial_slots: usize,
    /// Protection of committed pages. Must be writable. Default: `ReadWrite`.
    pub protection: Protection,
}

impl Default for SlotPoolConfig {
    fn default() -> Self {
        Self {
            max_slots: 65536,
            slot_size: 64,
            initial_slots: 0,
            protection: Protection::ReadWrite,
        }
    }
}

impl SlotPoolConfig {
    #[must_use]
    pub fn new(max_slots: usize, slot_size: usize) -> Self {
        Self { max_slots, slot_size, ..Self::default() }
    }

    #[must_use]
    pub fn with_initial_slots(mut self, slots: usize) -> Self {
        self.initial_slots = slots;
        self
    }

    #[must_use]
    pub fn with_protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }

    fn validate(&self) -> Result<usize, VmError> {
        if self.slot_size < size_of::<SlotIndex>() {
            return Err(VmError::invalid(format!(
                "slot size {} is smaller than a free-list link ({} bytes)",
                self.slot_size,
                size_of::<SlotIndex>()
            )));
        }
        if self.max_slots == 0 {
            return Err(VmError::invalid("slot pool needs at least one slot"));
        }
        // Free slots hold their list link, so committed pages must be writable.
        if !self.protection.is_writable() {
            return Err(VmError::invalid(format!(
                "slot pool protection {:?} is not writable",
                self.protection
            )));
        }
        if self.max_slots >= SLOT_INDEX_INVALID as usize {
            return Err(VmError::invalid(format!(
                "max_slots {} does not fit a slot index",
                self.max_slots
            )));
        }
        self.max_slots.checked_mul(self.slot_size).ok_or_else(|| {
            VmError::invalid(format!(
                "{} slots of {} bytes overflow the address space",
                self.max_slots, self.slot_size
            ))
        })
    }
}

/// Fixed-stride allocator over one reservation.
///
/// Slots are bump-allocated up to a high-water mark (`head_slot`); freed
/// slots go on an intrusive LIFO free list whose links live in the first
/// bytes of each free slot. Slot addresses never move.
pub struct SlotPool<V: VmOps = PlatformVmOps> {
    base: Option<NonNull<u8>>,
    reservation: Option<Reservation<V>>,
    tracker: CommitTracker,
    protection: Protection,
    max_slots: usize,
    slot_size: usize,
    committed: usize,
    head_slot: SlotIndex,
    first_free_slot: SlotIndex,
    live: usize,
    /// Tracks which slots are currently allocated
    #[cfg(debug_assertions)]
    live_mask: FixedBitSet,
}

// Safety: SlotPool exclusively owns (or was handed exclusive use of) its region.
unsafe impl<V: VmOps> Send for SlotPool<V> {}

impl SlotPool<PlatformVmOps> {
    /// Reserve room for `max_slots` slots of `slot_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the geometry is invalid or reservation fails.
    pub fn new(max_slots: usize, slot_size: usize) -> Result<Self, VmError> {
        Self::new_in(SlotPoolConfig::new(max_slots, slot_size))
    }

    pub fn with_config(config: SlotPoolConfig) -> Result<Self, VmError> {
        Self::new_in(config)
    }

    /// Build a pool over memory the caller already reserved. The pool never
    /// releases it.
    ///
    /// # Safety
    /// `ptr` must be page-aligned and start a reserved region covering
    /// `max_slots * slot_size` bytes rounded up to whole pages. The region
    /// must stay reserved, and be used by nothing else, for the pool's
    /// lifetime.
    pub unsafe fn from_raw_parts(
        ptr: NonNull<u8>,
        max_slots: usize,
        slot_size: usize,
    ) -> Result<Self, VmError> {
        // Safety: forwarded to caller.
        unsafe { Self::from_raw_parts_in(ptr, max_slots, slot_size) }
    }
}

impl<V: VmOps> SlotPool<V> {
    /// Reserve a pool through an explicit backend.
    pub fn new_in(config: SlotPoolConfig) -> Result<Self, VmError> {
        Self::create(config).inspect_err(diag::record)
    }

    fn create(config: SlotPoolConfig) -> Result<Self, VmError> {
        let bytes = config.validate()?;
        let info = PlatformInfo::of::<V>();
        let capacity = info
            .page_align(bytes)
            .ok_or_else(|| VmError::invalid(format!("slot pool of {bytes} bytes overflows")))?;
        let reservation = Reservation::<V>::new_in(capacity)?;

        let mut pool = Self::assemble(
            reservation.as_ptr(),
            Some(reservation),
            CommitTracker::new(info.page_size(), capacity),
            &config,
        );
        if config.initial_slots > 0 {
            let initial = config.initial_slots.min(config.max_slots) * config.slot_size;
            pool.commit_to(initial)?;
        }

        tracing::debug!(
            max_slots = config.max_slots,
            slot_size = config.slot_size,
            capacity,
            "slot pool created"
        );
        Ok(pool)
    }

    /// See [`SlotPool::from_raw_parts`].
    ///
    /// # Safety
    /// See [`SlotPool::from_raw_parts`].
    pub unsafe fn from_raw_parts_in(
        ptr: NonNull<u8>,
        max_slots: usize,
        slot_size: usize,
    ) -> Result<Self, VmError> {
        Self::wrap(ptr, SlotPoolConfig::new(max_slots, slot_size)).inspect_err(diag::record)
    }

    fn wrap(ptr: NonNull<u8>, config: SlotPoolConfig) -> Result<Self, VmError> {
        let bytes = config.validate()?;
        let info = PlatformInfo::of::<V>();
        if !is_aligned(ptr.as_ptr() as usize, info.page_size()) {
            return Err(VmError::invalid(format!("slot pool base {ptr:p} is not page-aligned")));
        }
        let capacity = info
            .page_align(bytes)
            .ok_or_else(|| VmError::invalid(format!("slot pool of {bytes} bytes overflows")))?;
        tracing::debug!(ptr = ?ptr, max_slots = config.max_slots, slot_size = config.slot_size, "slot pool created over existing region");
        Ok(Self::assemble(ptr, None, CommitTracker::new(info.page_size(), capacity), &config))
    }

    fn assemble(
        base: NonNull<u8>,
        reservation: Option<Reservation<V>>,
        tracker: CommitTracker,
        config: &SlotPoolConfig,
    ) -> Self {
        Self {
            base: Some(base),
            reservation,
            tracker,
            protection: config.protection,
            max_slots: config.max_slots,
            slot_size: config.slot_size,
            committed: 0,
            head_slot: 0,
            first_free_slot: SLOT_INDEX_INVALID,
            live: 0,
            #[cfg(debug_assertions)]
            live_mask: FixedBitSet::new(),
        }
    }

    /// Free-list link stored in the first bytes of a free slot. Slot sizes
    /// need not be multiples of 4, so the link is accessed unaligned.
    ///
    /// # Safety
    /// `index < head_slot`.
    unsafe fn link_ptr(&self, base: NonNull<u8>, index: SlotIndex) -> *mut SlotIndex {
        // Safety: index < head_slot <= max_slots, inside the region.
        unsafe { base.as_ptr().add(index as usize * self.slot_size).cast::<SlotIndex>() }
    }

    /// Take a slot: the most recently freed one if any, else a fresh one past
    /// the high-water mark (committing pages as needed).
    ///
    /// # Errors
    ///
    /// Returns [`VmError::CapacityExhausted`] once `max_slots` slots are live,
    /// [`VmError::Released`] after release, or the OS commit failure.
    pub fn alloc_slot(&mut self) -> Result<SlotIndex, VmError> {
        self.alloc_slot_inner().inspect_err(diag::record)
    }

    // head < max_slots < SLOT_INDEX_INVALID, so the index cast is lossless.
    #[allow(clippy::cast_possible_truncation)]
    fn alloc_slot_inner(&mut self) -> Result<SlotIndex, VmError> {
        let base = self.base.ok_or(VmError::Released)?;

        let index = if self.first_free_slot == SLOT_INDEX_INVALID {
            let head = self.head_slot as usize;
            if head >= self.max_slots {
                let err = VmError::CapacityExhausted {
                    requested: (head + 1) * self.slot_size,
                    capacity: self.max_slots * self.slot_size,
                };
                tracing::error!(max_slots = self.max_slots, "slot pool exhausted");
                return Err(err);
            }
            let needed = (head + 1) * self.slot_size;
            if needed > self.committed {
                self.commit_to(needed)?;
            }
            #[cfg(debug_assertions)]
            self.live_mask.grow(head + 1);
            self.head_slot += 1;
            head as SlotIndex
        } else {
            let index = self.first_free_slot;
            // Safety: free-list entries are < head_slot.
            self.first_free_slot = unsafe { self.link_ptr(base, index).read_unaligned() };
            index
        };

        #[cfg(debug_assertions)]
        {
            debug_assert!(
                !self.live_mask.contains(index as usize),
                "Free list handed out live slot {index}"
            );
            self.live_mask.insert(index as usize);
        }
        self.live += 1;
        stats::SLOT_POOL_LIVE.add(1);
        Ok(index)
    }

    /// Return a slot to the free list.
    ///
    /// # Safety
    /// `index` must come from [`alloc_slot`](Self::alloc_slot) on this pool
    /// and must not be freed twice. Nothing may use the slot afterwards: its
    /// first bytes are overwritten with the free-list link. Violations panic
    /// in debug builds and are undefined behaviour in release builds.
    pub unsafe fn free_slot(&mut self, index: SlotIndex) {
        let Some(base) = self.base else {
            debug_assert!(false, "free_slot({index}) on a released SlotPool");
            return;
        };
        debug_assert!(
            index < self.head_slot,
            "Slot {index} is past the high-water mark {}",
            self.head_slot
        );
        #[cfg(debug_assertions)]
        {
            assert!(
                self.live_mask.contains(index as usize),
                "Double free detected for slot {index}"
            );
            self.live_mask.set(index as usize, false);
        }

        // Safety: index < head_slot per the caller contract.
        unsafe { self.link_ptr(base, index).write_unaligned(self.first_free_slot) };
        self.first_free_slot = index;
        self.live -= 1;
        stats::SLOT_POOL_LIVE.sub(1);
    }

    /// Pointer flavour of [`alloc_slot`](Self::alloc_slot).
    pub fn alloc(&mut self) -> Result<NonNull<u8>, VmError> {
        let index = self.alloc_slot()?;
        let base = self.base.ok_or(VmError::Released)?;
        // Safety: index < head_slot.
        Ok(unsafe { base.add(index as usize * self.slot_size) })
    }

    /// Pointer flavour of [`free_slot`](Self::free_slot).
    ///
    /// # Safety
    /// `ptr` must come from [`alloc`](Self::alloc) on this pool; otherwise as
    /// [`free_slot`](Self::free_slot).
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let Some(index) = self.index_of(ptr.as_ptr()) else {
            debug_assert!(false, "Pointer {ptr:p} does not belong to this SlotPool");
            return;
        };
        // Safety: forwarded to caller.
        unsafe { self.free_slot(index) };
    }

    /// Address of slot `index`, or `None` past the high-water mark.
    #[must_use]
    pub fn address_of(&self, index: SlotIndex) -> Option<NonNull<u8>> {
        if index >= self.head_slot {
            return None;
        }
        // Safety: index < head_slot.
        self.base.map(|base| unsafe { base.add(index as usize * self.slot_size) })
    }

    /// Slot starting exactly at `ptr`, or `None` for foreign or interior pointers.
    #[must_use]
    pub fn index_of(&self, ptr: *const u8) -> Option<SlotIndex> {
        let base = self.base?.as_ptr() as usize;
        let offset = (ptr as usize).checked_sub(base)?;
        if offset >= self.head_slot as usize * self.slot_size
            || !offset.is_multiple_of(self.slot_size)
        {
            return None;
        }
        SlotIndex::try_from(offset / self.slot_size).ok()
    }

    /// Forget every slot and decommit all pages. Outstanding slot indices and
    /// pointers become invalid.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Released`] after release, or the OS decommit
    /// failure. The pool is unchanged on error.
    pub fn clear_and_decommit(&mut self) -> Result<(), VmError> {
        self.commit_to(0).inspect_err(diag::record)?;
        self.head_slot = 0;
        self.first_free_slot = SLOT_INDEX_INVALID;
        stats::SLOT_POOL_LIVE.sub(self.live);
        self.live = 0;
        #[cfg(debug_assertions)]
        self.live_mask.clear();
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
        stats::track_commit(&stats::SLOT_POOL_COMMITTED, self.committed, committed);
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
        stats::track_commit(&stats::SLOT_POOL_COMMITTED, self.committed, 0);
        stats::SLOT_POOL_LIVE.sub(self.live);
        self.committed = 0;
        self.live = 0;
        self.head_slot = 0;
        self.first_free_slot = SLOT_INDEX_INVALID;
        tracing::debug!(max_slots = self.max_slots, slot_size = self.slot_size, "slot pool released");
        match self.reservation.take() {
            Some(reservation) => reservation.release(),
            None => Ok(()),
        }
    }

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

    /// Slots ever bump-allocated (high-water mark), not the live count.
    #[must_use]
    pub fn head_slot(&self) -> SlotIndex {
        self.head_slot
    }

    /// Top of the free stack, or [`SLOT_INDEX_INVALID`].
    #[must_use]
    pub fn first_free_slot(&self) -> SlotIndex {
        self.first_free_slot
    }

    #[must_use]
    pub fn live_slots(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.tracker.capacity()
    }

    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.committed
    }
}

impl<V: VmOps> Drop for SlotPool<V> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "slot pool release failed during drop");
        }
    }
}

impl<V: VmOps> std::fmt::Debug for SlotPool<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("base", &self.base)
            .field("max_slots", &self.max_slots)
            .field("slot_size", &self.slot_size)
            .field("committed", &self.committed)
            .field("head_slot", &self.head_slot)
            .field("first_free_slot", &self.first_free_slot)
            .field("live", &self.live)
            .finish_non_exhaustive()
    }
}
