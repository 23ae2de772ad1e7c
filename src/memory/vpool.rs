use std::marker::PhantomData;
use std::mem::ManuallyDrop;

use fixedbitset::FixedBitSet;

use super::diag;
use super::platform::PlatformInfo;
use super::slot_pool::{SlotIndex, SlotPool, SlotPoolConfig};
use super::vm::{PlatformVmOps, VmError, VmOps};

/// Storage of one pool slot: a live value or the free-list link.
///
/// `repr(C)` puts both fields at offset 0, which is where [`SlotPool`]
/// reads and writes its links.
#[repr(C)]
union Slot<T> {
    value: ManuallyDrop<T>,
    // Accessed by SlotPool through its raw link pointer.
    #[allow(dead_code)]
    next_free: SlotIndex,
}

/// A typed object pool with stable addresses and O(1) put/remove.
///
/// Values are addressed by [`SlotIndex`]. A removed slot is reused by the
/// next [`put`](Self::put) (most recently removed first).
pub struct VPool<T, V: VmOps = PlatformVmOps> {
    pool: SlotPool<V>,
    /// Tracks which slots hold a value
    live: FixedBitSet,
    _marker: PhantomData<T>,
}

impl<T> VPool<T, PlatformVmOps> {
    /// Reserve room for `max_items` values.
    pub fn with_capacity(max_items: usize) -> Result<Self, VmError> {
        Self::with_capacity_in(max_items)
    }
}

impl<T, V: VmOps> VPool<T, V> {
    pub fn with_capacity_in(max_items: usize) -> Result<Self, VmError> {
        if align_of::<Slot<T>>() > PlatformInfo::of::<V>().page_size() {
            let err = VmError::invalid(format!(
                "value alignment {} exceeds the page size",
                align_of::<T>()
            ));
            diag::record(&err);
            return Err(err);
        }
        Ok(Self {
            pool: SlotPool::new_in(SlotPoolConfig::new(max_items, size_of::<Slot<T>>()))?,
            live: FixedBitSet::new(),
            _marker: PhantomData,
        })
    }

    fn slot(&self, index: SlotIndex) -> Option<*mut Slot<T>> {
        if !self.live.contains(index as usize) {
            return None;
        }
        self.pool.address_of(index).map(|p| p.as_ptr().cast::<Slot<T>>())
    }

    /// Store `value`, returning its slot.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::CapacityExhausted`] once `max_items` values are
    /// live; `value` is dropped.
    pub fn put(&mut self, value: T) -> Result<SlotIndex, VmError> {
        let index = self.pool.alloc_slot()?;
        let slot = self.pool.address_of(index).ok_or(VmError::Released)?.cast::<Slot<T>>();
        // Safety: the slot is committed, aligned to Slot<T> and unoccupied.
        unsafe {
            slot.as_ptr().write(Slot { value: ManuallyDrop::new(value) });
        }
        self.live.grow(index as usize + 1);
        self.live.insert(index as usize);
        Ok(index)
    }

    #[must_use]
    pub fn get(&self, index: SlotIndex) -> Option<&T> {
        // Safety: live slots hold an initialized value.
        self.slot(index).map(|slot| unsafe { &*(*slot).value })
    }

    #[must_use]
    pub fn get_mut(&mut self, index: SlotIndex) -> Option<&mut T> {
        // Safety: live slots hold an initialized value and we hold &mut self.
        self.slot(index).map(|slot| unsafe { &mut *(*slot).value })
    }

    /// Take the value out of `index`, freeing the slot. `None` if the slot
    /// holds nothing.
    pub fn remove(&mut self, index: SlotIndex) -> Option<T> {
        let slot = self.slot(index)?;
        // Safety: the slot is live; after the read it is logically vacant.
        let value = unsafe { ManuallyDrop::into_inner(slot.read().value) };
        self.live.set(index as usize, false);
        // Safety: index came from alloc on this pool and was live.
        unsafe { self.pool.free_slot(index) };
        Some(value)
    }

    #[must_use]
    pub fn contains(&self, index: SlotIndex) -> bool {
        self.live.contains(index as usize)
    }

    /// Number of live values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pool.live_slots()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// See [`SlotPool::head_slot`].
    #[must_use]
    pub fn head_slot(&self) -> SlotIndex {
        self.pool.head_slot()
    }

    /// See [`SlotPool::first_free_slot`].
    #[must_use]
    pub fn first_free_slot(&self) -> SlotIndex {
        self.pool.first_free_slot()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool.max_slots()
    }

    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.pool.committed_bytes()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.pool.is_valid()
    }

    /// Live `(index, value)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotIndex, &T)> + '_ {
        self.live.ones().filter_map(|i| {
            let index = SlotIndex::try_from(i).ok()?;
            self.get(index).map(|v| (index, v))
        })
    }

    /// Drop every value and decommit all pages.
    pub fn clear(&mut self) -> Result<(), VmError> {
        self.drop_values();
        self.pool.clear_and_decommit()
    }

    /// Drop every value and release the backing pool.
    pub fn release(&mut self) -> Result<(), VmError> {
        self.drop_values();
        self.pool.release()
    }

    // Bits are only ever set for valid slot indices.
    #[allow(clippy::cast_possible_truncation)]
    fn drop_values(&mut self) {
        let live: Vec<usize> = self.live.ones().collect();
        self.live.clear();
        for i in live {
            if let Some(slot) = self.pool.address_of(i as SlotIndex) {
                // Safety: the slot was live and is no longer reachable.
                unsafe { ManuallyDrop::drop(&mut (*slot.as_ptr().cast::<Slot<T>>()).value) };
            }
        }
    }
}

impl<T, V: VmOps> Drop for VPool<T, V> {
    fn drop(&mut self) {
        if std::mem::needs_drop::<T>() {
            self.drop_values();
        }
    }
}

impl<T: std::fmt::Debug, V: VmOps> std::fmt::Debug for VPool<T, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
