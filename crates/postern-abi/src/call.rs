// SPDX-License-Identifier: Apache-2.0

//! The call argument record and the callee contract

use crate::addr::Address;
use crate::status::{Error, Result, Status};

use core::mem::{align_of, size_of};
use core::ptr::{addr_of_mut, read_volatile, write_volatile};

/// Required granularity of input and output buffer sizes
pub const BUFFER_ALIGNMENT: usize = 2 * size_of::<usize>();

/// Size of the status code a callee writes at the start of its output
pub const STATUS_SIZE: usize = size_of::<u32>();

/// The wire record describing one call across the boundary
///
/// The record always lives in memory the receiving side does not own.
/// Receivers take a single copy with [`CallArgs::read`] and work from the
/// copy only.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CallArgs {
    /// Function table id, or [`DEFAULT_TABLE`](crate::table::DEFAULT_TABLE)
    pub table_id: u64,
    /// Index into the function table
    pub function_id: u64,
    /// Address of the input buffer
    pub input_buffer: u64,
    pub input_buffer_size: u64,
    /// Address of the output buffer
    pub output_buffer: u64,
    pub output_buffer_size: u64,
    /// [`Status`] of the call, written by the receiver
    pub result: u32,
    /// Bytes of output produced, written by the receiver
    pub output_bytes_written: u64,
}

impl CallArgs {
    /// Size of the record in bytes
    pub const SIZE: usize = size_of::<Self>();

    /// Whether `addr` may point at a record
    #[inline]
    pub fn is_aligned_non_null(addr: Address) -> bool {
        !addr.is_null() && addr.is_aligned(align_of::<Self>())
    }

    /// Copies the record at `addr` into local memory with a single read.
    ///
    /// # Safety
    ///
    /// `addr` must be non-null, aligned and point at [`Self::SIZE`] readable bytes.
    /// The contents may be changed concurrently by another party; the returned
    /// copy is not affected by later changes.
    #[inline]
    pub unsafe fn read(addr: Address) -> Self {
        read_volatile(addr.as_ptr::<Self>())
    }

    /// Stores `result` and `written` into the record at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be non-null, aligned and point at [`Self::SIZE`] writable bytes.
    #[inline]
    pub unsafe fn publish(addr: Address, result: Status, written: u64) {
        let ptr = addr.as_mut_ptr::<Self>();
        write_volatile(addr_of_mut!((*ptr).output_bytes_written), written);
        write_volatile(addr_of_mut!((*ptr).result), result.into());
    }

    /// Writes the whole record to `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be non-null, aligned and point at [`Self::SIZE`] writable bytes.
    #[inline]
    pub unsafe fn write(&self, addr: Address) {
        write_volatile(addr.as_mut_ptr::<Self>(), *self)
    }

    /// The embedded [`Status`]
    #[inline]
    pub fn status(&self) -> Result<Status> {
        Status::try_from(self.result)
    }
}

/// Whether `size` is a valid buffer size: a multiple of [`BUFFER_ALIGNMENT`]
/// large enough to hold the status code.
#[inline]
pub fn is_valid_buffer_size(size: usize) -> bool {
    size >= STATUS_SIZE && size % BUFFER_ALIGNMENT == 0
}

/// Writes `status` into the leading status field of a callee's `output`.
///
/// Does nothing if `output` is too short to hold a status.
#[inline]
pub fn write_status(output: &mut [u8], status: Status) {
    if let Some(field) = output.get_mut(..STATUS_SIZE) {
        field.copy_from_slice(&u32::from(status).to_le_bytes());
    }
}

/// Reads the status a callee wrote into the leading field of `output`.
#[inline]
pub fn read_status(output: &[u8]) -> Result<Status> {
    let field = output.get(..STATUS_SIZE).ok_or(Error::InvalidParameter)?;
    let mut raw = [0u8; STATUS_SIZE];
    raw.copy_from_slice(field);
    Status::try_from(u32::from_le_bytes(raw))
}

/// Rounds `size` up to the next multiple of [`BUFFER_ALIGNMENT`], at least one status field.
#[inline]
pub fn buffer_size_for(size: usize) -> Option<usize> {
    let size = size.max(STATUS_SIZE);
    let sum = size.checked_add(BUFFER_ALIGNMENT - 1)?;
    Some(sum / BUFFER_ALIGNMENT * BUFFER_ALIGNMENT)
}

/// Enclave sizing reported to the host
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    /// Pages of private heap backing the protected region
    pub heap_pages: u64,
    /// Pages of stack per worker thread
    pub stack_pages: u64,
    /// Number of worker threads
    pub threads: u64,
}
