use std::marker::PhantomData;
use std::ptr::NonNull;

use super::arena::{Arena, ArenaConfig};
use super::diag;
use super::platform::PlatformInfo;
use super::vm::{PlatformVmOps, VmError, VmOps};

/// A growable array with stable element addresses, backed by an [`Arena`].
///
/// Elements never move on growth; `&T` obtained earlier stays valid as long
/// as the element is not removed.
pub struct VArray<T, V: VmOps = PlatformVmOps> {
    arena: Arena<V>,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> VArray<T, PlatformVmOps> {
    /// Reserve room for `max_items` elements.
    pub fn with_capacity(max_items: usize) -> Result<Self, VmError> {
        Self::with_capacity_in(max_items)
    }

    /// Build an array over memory the caller already reserved.
    ///
    /// # Safety
    /// Same contract as [`Arena::from_raw_parts`].
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, bytes: usize) -> Result<Self, VmError> {
        // Safety: forwarded to caller.
        unsafe { Self::from_raw_parts_in(ptr, bytes) }
    }
}

impl<T, V: VmOps> VArray<T, V> {
    fn element_size() -> Result<usize, VmError> {
        let size = size_of::<T>();
        if size == 0 {
            return Err(VmError::invalid("zero-sized element types are not supported"));
        }
        if align_of::<T>() > PlatformInfo::of::<V>().page_size() {
            return Err(VmError::invalid(format!(
                "element alignment {} exceeds the page size",
                align_of::<T>()
            )));
        }
        Ok(size)
    }

    pub fn with_capacity_in(max_items: usize) -> Result<Self, VmError> {
        let size = Self::element_size().inspect_err(diag::record)?;
        let capacity = max_items.checked_mul(size).ok_or_else(|| {
            let err = VmError::invalid(format!("{max_items} elements overflow the address space"));
            diag::record(&err);
            err
        })?;
        Ok(Self {
            arena: Arena::new_in(ArenaConfig::new(capacity))?,
            len: 0,
            _marker: PhantomData,
        })
    }

    /// # Safety
    /// Same contract as [`Arena::from_raw_parts`].
    pub unsafe fn from_raw_parts_in(ptr: NonNull<u8>, bytes: usize) -> Result<Self, VmError> {
        Self::element_size().inspect_err(diag::record)?;
        Ok(Self {
            // Safety: forwarded to caller.
            arena: unsafe { Arena::from_raw_parts_in(ptr, bytes)? },
            len: 0,
            _marker: PhantomData,
        })
    }

    fn ptr(&self) -> Option<*mut T> {
        self.arena.base().map(|base| base.as_ptr().cast::<T>())
    }

    /// Append `value`, returning its index.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::CapacityExhausted`] when full; `value` is dropped.
    pub fn push(&mut self, value: T) -> Result<usize, VmError> {
        let size = size_of::<T>();
        let slot = if (self.len + 1) * size <= self.arena.len() {
            // Reuse room left behind by swap_remove.
            let base = self.ptr().ok_or(VmError::Released)?;
            // Safety: len < arena.len() / size, inside the pushed bytes.
            unsafe { base.add(self.len) }
        } else {
            self.arena.push(size)?.cast::<T>().as_ptr()
        };
        // Safety: slot is committed, aligned (page-aligned base, stride size_of::<T>) and unoccupied.
        unsafe { slot.write(value) };
        self.len += 1;
        Ok(self.len - 1)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.as_slice().get(index)
    }

    #[must_use]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.as_mut_slice().get_mut(index)
    }

    /// Like [`get`](Self::get), but reports out-of-range access as an error.
    pub fn try_get(&self, index: usize) -> Result<&T, VmError> {
        self.get(index).ok_or_else(|| {
            let err = VmError::invalid(format!("index {index} out of bounds (len {})", self.len));
            diag::record(&err);
            err
        })
    }

    /// Remove the element at `index`, moving the last element into its place.
    /// `None` if `index` is out of bounds.
    pub fn swap_remove(&mut self, index: usize) -> Option<T> {
        if index >= self.len {
            return None;
        }
        let base = self.ptr()?;
        let last = self.len - 1;
        // Safety: index and last are < len, both initialized; the last slot
        // is logically vacated by the len decrement.
        unsafe {
            let value = base.add(index).read();
            if index != last {
                std::ptr::copy_nonoverlapping(base.add(last), base.add(index), 1);
            }
            self.len = last;
            Some(value)
        }
    }

    /// Drop elements past `len` and decommit the pages they occupied.
    pub fn truncate(&mut self, len: usize) -> Result<(), VmError> {
        if len >= self.len {
            return Ok(());
        }
        if let Some(base) = self.ptr() {
            let tail = std::ptr::slice_from_raw_parts_mut(
                // Safety: len < self.len.
                unsafe { base.add(len) },
                self.len - len,
            );
            self.len = len;
            // Safety: the tail is initialized and no longer reachable.
            unsafe { std::ptr::drop_in_place(tail) };
        }
        self.arena.truncate(len * size_of::<T>())
    }

    pub fn clear(&mut self) -> Result<(), VmError> {
        self.truncate(0)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        match self.ptr() {
            // Safety: [0, len) are initialized elements.
            Some(base) => unsafe { std::slice::from_raw_parts(base, self.len) },
            None => &[],
        }
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match self.ptr() {
            // Safety: [0, len) are initialized and we hold &mut self.
            Some(base) => unsafe { std::slice::from_raw_parts_mut(base, self.len) },
            None => &mut [],
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of elements.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.capacity() / size_of::<T>()
    }

    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.arena.committed_bytes()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.arena.is_valid()
    }

    /// Drop all elements and release the backing arena.
    pub fn release(&mut self) -> Result<(), VmError> {
        self.drop_elements();
        self.arena.release()
    }

    fn drop_elements(&mut self) {
        let elements: *mut [T] = self.as_mut_slice();
        self.len = 0;
        // Safety: elements were initialized and are no longer reachable.
        unsafe { std::ptr::drop_in_place(elements) };
    }
}

impl<T, V: VmOps> Drop for VArray<T, V> {
    fn drop(&mut self) {
        self.drop_elements();
    }
}

impl<'a, T, V: VmOps> IntoIterator for &'a VArray<T, V> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: std::fmt::Debug, V: VmOps> std::fmt::Debug for VArray<T, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}
