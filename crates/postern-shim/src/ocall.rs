// SPDX-License-Identifier: Apache-2.0

//! Outbound calls to the host
//!
//! The host cannot see the protected region, so an outbound call builds its
//! [`CallArgs`] record and both buffers in host-visible memory, hands the
//! record's address to the host and copies the output back once the host
//! returns.

use std::ptr;

use postern_abi::addr::{Address, Region};
use postern_abi::call::{buffer_size_for, CallArgs, BUFFER_ALIGNMENT, STATUS_SIZE};
use postern_abi::table::DEFAULT_TABLE;
use postern_abi::{Error, Result, Status};
use tracing::debug;

/// Memory the host can read and write
pub trait HostMemory {
    /// Allocates `size` zeroed bytes.
    fn alloc(&self, size: usize) -> Result<Address>;

    /// Releases an allocation made by [`HostMemory::alloc`].
    fn free(&self, addr: Address);
}

/// A host that can dispatch calls
pub trait HostCall: HostMemory {
    /// Asks the host to dispatch the record at `args`.
    ///
    /// Returns the host's raw return value, zero on success.
    fn call_host(&self, args: Address) -> Result<u64>;
}

/// Host-visible memory released on drop
struct HostBox<'a, H: HostMemory + ?Sized> {
    host: &'a H,
    addr: Address,
}

impl<'a, H: HostMemory + ?Sized> HostBox<'a, H> {
    fn new(host: &'a H, size: usize) -> Result<Self> {
        let addr = host.alloc(size)?;
        Ok(Self { host, addr })
    }
}

impl<H: HostMemory + ?Sized> Drop for HostBox<'_, H> {
    fn drop(&mut self) {
        self.host.free(self.addr)
    }
}

/// Calls function `function_id` of host table `table_id`.
///
/// `input` must not be empty and `output` must hold at least a status code.
/// Returns the number of bytes the host wrote to `output`, status included.
pub fn call_host<H>(
    host: &H,
    trusted: &Region,
    table_id: u64,
    function_id: u64,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize>
where
    H: HostCall + ?Sized,
{
    if input.is_empty() || output.len() < STATUS_SIZE {
        return Err(Error::InvalidParameter);
    }

    let input_size = buffer_size_for(input.len()).ok_or(Error::OutOfMemory)?;
    let output_size = buffer_size_for(output.len()).ok_or(Error::OutOfMemory)?;
    let total = CallArgs::SIZE
        .checked_add(input_size)
        .and_then(|size| size.checked_add(output_size))
        .ok_or(Error::OutOfMemory)?;

    let block = HostBox::new(host, total)?;
    let args = block.addr;

    if !args.is_aligned(BUFFER_ALIGNMENT) || !trusted.is_outside(args, total) {
        debug!("host allocation {args} is not usable");
        return Err(Error::Failure);
    }

    let input_addr = Address::new(args.raw() + CallArgs::SIZE);
    let output_addr = Address::new(input_addr.raw() + input_size);

    // SAFETY: the host handed out `total` bytes at `args`, outside the protected region.
    unsafe {
        ptr::copy_nonoverlapping(input.as_ptr(), input_addr.as_mut_ptr(), input.len());
        ptr::write_bytes(
            input_addr.as_mut_ptr::<u8>().add(input.len()),
            0,
            input_size - input.len(),
        );
        ptr::write_bytes(output_addr.as_mut_ptr::<u8>(), 0, output_size);

        CallArgs {
            table_id,
            function_id,
            input_buffer: input_addr.to_wire(),
            input_buffer_size: input_size as u64,
            output_buffer: output_addr.to_wire(),
            output_buffer_size: output_size as u64,
            result: Status::Failure.into(),
            output_bytes_written: 0,
        }
        .write(args);
    }

    let ret = host.call_host(args).map_err(|e| {
        debug!("host call {table_id}:{function_id} failed: {e}");
        Error::Failure
    })?;

    if ret != 0 {
        debug!("host call {table_id}:{function_id} returned {ret:#x}");
        return Err(Error::Failure);
    }

    // SAFETY: the record lies in the allocation made above.
    let reply = unsafe { CallArgs::read(args) };
    if reply.status() != Ok(Status::Ok) {
        return Err(Error::Failure);
    }

    let written = usize::try_from(reply.output_bytes_written).map_err(|_| Error::Unexpected)?;
    if written > output.len() {
        return Err(Error::Unexpected);
    }

    // SAFETY: `written` fits the output buffer allocated above.
    unsafe { ptr::copy_nonoverlapping(output_addr.as_ptr::<u8>(), output.as_mut_ptr(), written) };

    Ok(written)
}

/// Calls function `function_id` of the host's default table.
pub fn call_host_default<H>(
    host: &H,
    trusted: &Region,
    function_id: u64,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize>
where
    H: HostCall + ?Sized,
{
    call_host(host, trusted, DEFAULT_TABLE, function_id, input, output)
}
