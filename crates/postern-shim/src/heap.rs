// SPDX-License-Identifier: Apache-2.0

//! The enclave's private heap

use std::io;
use std::ops::{Deref, DerefMut};
use std::slice;

use crate::arena::Arena;

use mmarinus::{perms, Map};
use postern_abi::addr::{Address, Region};
use postern_abi::Result;
use spin::Mutex;

/// Size of a page
pub const PAGE_SIZE: usize = 4096;

/// Anonymous private memory making up the protected region
///
/// Call marshaling takes its scratch buffers from here so that trusted copies
/// of call data never leave the region.
pub struct Heap {
    _map: Map<perms::ReadWrite>,
    region: Region,
    arena: Mutex<Arena>,
}

impl Heap {
    /// Maps a heap of `pages` pages.
    pub fn new(pages: usize) -> io::Result<Self> {
        let size = pages
            .checked_mul(PAGE_SIZE)
            .filter(|&size| size > 0)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

        let map = Map::bytes(size)
            .anywhere()
            .anonymously()
            .with(perms::ReadWrite)
            .map_err(|e| e.err)?;

        let region = Region::new(Address::new(map.addr()), map.size())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

        // SAFETY: the mapping is private to this heap and outlives the arena.
        let arena = unsafe { Arena::new(region) };

        Ok(Self {
            _map: map,
            region,
            arena: Mutex::new(arena),
        })
    }

    /// The protected region
    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    /// Bytes currently handed out
    pub fn used(&self) -> usize {
        self.arena.lock().used()
    }

    /// Allocates `size` zeroed bytes, released when the returned buffer drops.
    pub fn alloc(&self, size: usize) -> Result<Scratch<'_>> {
        let addr = self.arena.lock().alloc(size)?;
        Ok(Scratch {
            heap: self,
            addr,
            size,
        })
    }
}

/// A buffer allocated from a [`Heap`]
pub struct Scratch<'a> {
    heap: &'a Heap,
    addr: Address,
    size: usize,
}

impl Deref for Scratch<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the range is mapped and reserved for this buffer until drop.
        unsafe { slice::from_raw_parts(self.addr.as_ptr(), self.size) }
    }
}

impl DerefMut for Scratch<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: the range is mapped and reserved for this buffer until drop.
        unsafe { slice::from_raw_parts_mut(self.addr.as_mut_ptr(), self.size) }
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        // An unknown scratch buffer means the heap bookkeeping is corrupt.
        if let Err(e) = self.heap.arena.lock().free(self.addr) {
            tracing::error!("scratch buffer {} was not allocated: {e}", self.addr);
            std::process::abort();
        }
    }
}
