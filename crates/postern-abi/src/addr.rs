// SPDX-License-Identifier: Apache-2.0

//! Addresses and the protected region
//!
//! All boundary checks in postern are expressed as [`Region::is_inside`] and
//! [`Region::is_outside`]. Every span end is computed with checked
//! arithmetic; a span whose end overflows the address space is neither
//! inside nor outside.

use core::fmt;

/// A virtual address on either side of the boundary
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    /// The null address
    pub const NULL: Self = Self(0);

    /// Wraps a raw address.
    #[inline(always)]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Converts a wire value, failing if it does not fit a native pointer.
    #[inline]
    pub fn from_wire(raw: u64) -> Option<Self> {
        usize::try_from(raw).ok().map(Self)
    }

    /// The address of `ptr`
    #[inline(always)]
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr.cast::<u8>() as usize)
    }

    /// The raw address value
    #[inline(always)]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// The wire representation
    #[inline(always)]
    pub const fn to_wire(self) -> u64 {
        self.0 as u64
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether the address is a multiple of `align`, which must be a power of two.
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// `self + len`, or `None` on overflow
    #[inline]
    pub fn checked_add(self, len: usize) -> Option<Self> {
        self.0.checked_add(len).map(Self)
    }

    /// Rounds the address up to a multiple of `boundary`, or `None` on overflow.
    #[inline]
    pub fn align_up(self, boundary: usize) -> Option<Self> {
        debug_assert!(boundary.is_power_of_two());
        let sum = self.0.checked_add(boundary - 1)?;
        Some(Self(sum & !(boundary - 1)))
    }

    #[inline(always)]
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline(always)]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl From<usize> for Address {
    #[inline(always)]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// The contiguous, non-empty address range `[start, end)` owned by the protected side
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    start: Address,
    end: Address,
}

impl Region {
    /// Creates the region `[base, base + len)`.
    ///
    /// Returns `None` if `len` is zero or the end overflows.
    pub fn new(base: Address, len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }

        let end = base.checked_add(len)?;
        Some(Self { start: base, end })
    }

    #[inline(always)]
    pub fn start(&self) -> Address {
        self.start
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.end
    }

    #[inline(always)]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.end.0 - self.start.0
    }

    /// Whether the single address `addr` lies in the region
    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Whether all of `[ptr, ptr + size)` lies within the region.
    ///
    /// A zero-sized span is classified by its start address.
    pub fn is_inside(&self, ptr: Address, size: usize) -> bool {
        let end = match ptr.checked_add(size) {
            Some(end) => end,
            None => return false,
        };

        if size == 0 {
            return self.contains(ptr);
        }

        self.start <= ptr && end <= self.end
    }

    /// Whether all of `[ptr, ptr + size)` lies outside of the region.
    ///
    /// A zero-sized span is classified by its start address.
    pub fn is_outside(&self, ptr: Address, size: usize) -> bool {
        let end = match ptr.checked_add(size) {
            Some(end) => end,
            None => return false,
        };

        if size == 0 {
            return !self.contains(ptr);
        }

        end <= self.start || ptr >= self.end
    }
}
