// SPDX-License-Identifier: Apache-2.0

//! Memory visible to both the host and the guest

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use mmarinus::{perms, Map, Shared};
use postern_abi::addr::{Address, Region};
use postern_abi::{Error, Result};
use postern_shim::arena::Arena;
use postern_shim::heap::PAGE_SIZE;
use tracing::trace;

/// A memfd mapped shared into the host, handed to the guest by descriptor
///
/// The guest maps it at the same address, so addresses inside the segment
/// mean the same thing on both sides.
pub struct SharedSegment {
    file: File,
    map: Map<perms::ReadWrite, Shared>,
    region: Region,
    arena: Mutex<Arena>,
}

impl SharedSegment {
    /// Creates a segment of `pages` pages.
    pub fn new(pages: usize) -> io::Result<Self> {
        let size = pages
            .checked_mul(PAGE_SIZE)
            .filter(|&size| size > 0)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

        let name = b"postern-shared\0";
        let fd = unsafe { libc::memfd_create(name.as_ptr().cast(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `fd` was just created and is owned by nobody else.
        let mut file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size as u64)?;

        let map = Map::bytes(size)
            .anywhere()
            .from(&mut file, 0)
            .with_kind(Shared)
            .with(perms::ReadWrite)
            .map_err(|e| e.err)?;

        let region = Region::new(Address::new(map.addr()), map.size())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;

        // SAFETY: the mapping lives as long as the segment and only the
        // arena hands out parts of it.
        let arena = unsafe { Arena::new(region) };

        Ok(Self {
            file,
            map,
            region,
            arena: Mutex::new(arena),
        })
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// How the guest finds the segment: `fd:addr:len`
    pub fn describe(&self) -> String {
        format!("{}:{:#x}:{}", self.fd(), self.map.addr(), self.map.size())
    }

    fn arena(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates `size` zeroed bytes.
    pub fn alloc(&self, size: usize) -> Result<Address> {
        let addr = self.arena().alloc(size)?;
        trace!("segment alloc {size} = {addr}");
        Ok(addr)
    }

    /// Resizes the allocation at `addr` to `size` bytes, keeping its contents
    /// up to the smaller of the two sizes.
    ///
    /// A null `addr` allocates. On failure the old allocation is untouched.
    pub fn realloc(&self, addr: Address, size: usize) -> Result<Address> {
        if addr.is_null() {
            return self.alloc(size);
        }

        let mut arena = self.arena();
        let old = arena.size_of(addr).ok_or(Error::InvalidParameter)?;
        let new = arena.alloc(size)?;

        let len = old.min(size);
        // SAFETY: both are live, disjoint allocations of the arena.
        unsafe { ptr::copy_nonoverlapping(addr.as_ptr::<u8>(), new.as_mut_ptr::<u8>(), len) };
        arena.free(addr)?;

        trace!("segment realloc {addr} {size} = {new}");
        Ok(new)
    }

    /// Releases an allocation made by [`SharedSegment::alloc`].
    pub fn free(&self, addr: Address) -> Result<usize> {
        trace!("segment free {addr}");
        self.arena().free(addr)
    }

    /// Bytes currently handed out
    pub fn used(&self) -> usize {
        self.arena().used()
    }
}

/// A [`SharedSegment`] allocation released on drop
pub struct Lease<'a> {
    segment: &'a SharedSegment,
    addr: Address,
}

impl<'a> Lease<'a> {
    pub fn new(segment: &'a SharedSegment, size: usize) -> Result<Self> {
        let addr = segment.alloc(size)?;
        Ok(Self { segment, addr })
    }

    #[inline]
    pub fn addr(&self) -> Address {
        self.addr
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        // A lease the arena does not know means the segment bookkeeping is
        // corrupt.
        if let Err(e) = self.segment.free(self.addr) {
            tracing::error!("failed to release segment memory {}: {e}", self.addr);
            std::process::abort();
        }
    }
}
