// SPDX-License-Identifier: Apache-2.0

//! First-fit allocation inside a mapped region, released by address

use std::alloc::Layout;
use std::collections::BTreeMap;
use std::ptr::{self, NonNull};

use linked_list_allocator::Heap;
use postern_abi::addr::{Address, Region};
use postern_abi::call::BUFFER_ALIGNMENT;
use postern_abi::{Error, Result};

/// A [`linked_list_allocator::Heap`] over a region, with the layout of every
/// live allocation so that callers can free by address alone
pub struct Arena {
    region: Region,
    allocator: Heap,
    live: BTreeMap<usize, Layout>,
}

impl Arena {
    /// Creates an arena over `region`.
    ///
    /// # Safety
    ///
    /// `region` must be mapped writable and used by nothing but this arena
    /// for as long as the arena lives.
    pub unsafe fn new(region: Region) -> Self {
        let mut allocator = Heap::empty();
        allocator.init(region.start().as_mut_ptr(), region.len());

        Self {
            region,
            allocator,
            live: BTreeMap::new(),
        }
    }

    /// Bytes currently handed out, including alignment padding
    #[inline]
    pub fn used(&self) -> usize {
        self.allocator.used()
    }

    /// Allocates `size` zeroed bytes aligned to [`BUFFER_ALIGNMENT`].
    pub fn alloc(&mut self, size: usize) -> Result<Address> {
        let layout = Layout::from_size_align(size.max(1), BUFFER_ALIGNMENT)
            .map_err(|_| Error::OutOfMemory)?;
        let ptr = self
            .allocator
            .allocate_first_fit(layout)
            .map_err(|()| Error::OutOfMemory)?;

        // SAFETY: the allocator hands out disjoint ranges of the region.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, layout.size()) };

        let addr = Address::from_ptr(ptr.as_ptr());
        self.live.insert(addr.raw(), layout);
        Ok(addr)
    }

    /// Size of the live allocation starting at `addr`
    pub fn size_of(&self, addr: Address) -> Option<usize> {
        self.live.get(&addr.raw()).map(Layout::size)
    }

    /// Releases the allocation starting at `addr` and returns its size.
    ///
    /// Fails with [`Error::InvalidParameter`] unless `addr` is the start of a
    /// live allocation.
    pub fn free(&mut self, addr: Address) -> Result<usize> {
        let layout = self
            .live
            .remove(&addr.raw())
            .ok_or(Error::InvalidParameter)?;

        debug_assert!(self.region.is_inside(addr, layout.size()));
        let ptr = NonNull::new(addr.as_mut_ptr::<u8>()).ok_or(Error::InvalidParameter)?;

        // SAFETY: `ptr` was returned by `allocate_first_fit` with `layout`
        // and has been removed from the live set, so it is released once.
        unsafe { self.allocator.deallocate(ptr, layout) };
        Ok(layout.size())
    }
}
