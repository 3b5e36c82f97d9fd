// SPDX-License-Identifier: Apache-2.0

//! The guest process of the virtual boundary backend
//!
//! Without hardware isolation, an enclave runs as its own OS process. Each
//! worker thread is bound to one socket connected to the host. The thread
//! performs the syscalls in [`postern_abi::syscall::DIRECT`] itself and
//! forwards every other syscall to the host, blocking until the host replies.

mod runtime;
mod serve;

pub use runtime::{Runtime, ENV_CHANNELS, ENV_HEAP_PAGES, ENV_SHARED, ENV_STACK_PAGES};
pub use serve::serve;

use crate::ocall::{self, HostCall, HostMemory};
use crate::Enclave;

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::net::UnixStream;
use std::ptr;
use std::sync::Arc;

use libc::c_long;
use postern_abi::addr::Address;
use postern_abi::frame::{Frame, Function, Request};
use postern_abi::syscall::is_direct;
use postern_abi::transport::{Channel, Transport};
use postern_abi::{Error, Result};
use tracing::{error, instrument, trace};

thread_local! {
    static CHANNEL: RefCell<Option<Channel<UnixStream>>> = RefCell::new(None);
    static ENCLAVE: RefCell<Option<Arc<Enclave>>> = RefCell::new(None);
    static STATE: Cell<ThreadState> = Cell::new(ThreadState::Running);
}

/// What a guest thread is doing
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    /// Waiting for the host to answer a forwarded request
    BlockedOnForward,
}

/// Binds the calling thread to `enclave` and its host `channel`.
pub fn bind(enclave: Arc<Enclave>, channel: Channel<UnixStream>) {
    ENCLAVE.with(|e| *e.borrow_mut() = Some(enclave));
    CHANNEL.with(|c| *c.borrow_mut() = Some(channel));
}

/// Releases the calling thread's binding and returns its channel.
pub fn unbind() -> Option<Channel<UnixStream>> {
    ENCLAVE.with(|e| e.borrow_mut().take());
    CHANNEL.with(|c| c.borrow_mut().take())
}

/// The calling thread's state
pub fn state() -> ThreadState {
    STATE.with(Cell::get)
}

pub(crate) fn enclave() -> Option<Arc<Enclave>> {
    ENCLAVE.with(|e| e.borrow().clone())
}

/// The calling thread's channel
///
/// Each operation borrows the channel only for its own duration, so requests
/// nested inside a forwarded call can use it too.
pub(crate) struct Local;

impl Transport for Local {
    fn send(&mut self, frame: &Frame) -> io::Result<()> {
        CHANNEL.with(|c| match c.borrow_mut().as_mut() {
            Some(channel) => channel.send(frame),
            None => Err(io::ErrorKind::NotConnected.into()),
        })
    }

    fn recv(&mut self) -> io::Result<Frame> {
        CHANNEL.with(|c| match c.borrow_mut().as_mut() {
            Some(channel) => channel.recv(),
            None => Err(io::ErrorKind::NotConnected.into()),
        })
    }
}

/// Performs syscall `num`, directly if it is allowed in the guest and
/// through the host otherwise.
///
/// Returns the raw result: negative errno values signal failure. A syscall
/// the host does not handle fails with [`Error::NotImplemented`].
pub fn syscall(num: c_long, argv: [usize; 6]) -> Result<isize> {
    if is_direct(num) {
        Ok(direct(num, argv))
    } else {
        forward(Request::syscall(num as u64, argv.map(|arg| arg as u64)))
            .map(|ret| ret as i64 as isize)
    }
}

fn direct(num: c_long, argv: [usize; 6]) -> isize {
    // SAFETY: the caller vouches for the arguments just like for a raw syscall.
    let ret = unsafe { libc::syscall(num, argv[0], argv[1], argv[2], argv[3], argv[4], argv[5]) };

    if ret == -1 {
        -(io::Error::last_os_error().raw_os_error().unwrap_or(libc::ENOSYS) as isize)
    } else {
        ret as isize
    }
}

/// Sends `request` to the host and blocks for the reply.
#[instrument(level = "trace")]
pub(crate) fn forward(request: Request) -> Result<u64> {
    let previous = STATE.with(|s| s.replace(ThreadState::BlockedOnForward));
    let response = Local.call(request, |_, nested| serve::handle(nested));
    STATE.with(|s| s.set(previous));

    let response = response.map_err(|e| {
        error!("forwarding {request:?} failed: {e}");
        Error::Failure
    })?;

    trace!(?response);
    response.into_result()
}

/// Host-visible memory and host calls over the calling thread's channel
#[derive(Copy, Clone, Debug, Default)]
pub struct Host;

impl HostMemory for Host {
    fn alloc(&self, size: usize) -> Result<Address> {
        match forward(Request::function(Function::Calloc, &[1, size as u64]))? {
            0 => Err(Error::OutOfMemory),
            addr => Address::from_wire(addr).ok_or(Error::Unexpected),
        }
    }

    fn free(&self, addr: Address) {
        if let Err(e) = forward(Request::function(Function::Free, &[addr.to_wire()])) {
            error!("failed to release host memory {addr}: {e}");
        }
    }
}

impl Host {
    /// Resizes the host-visible allocation at `addr` to `size` bytes.
    ///
    /// A null `addr` allocates. On failure the old allocation stays valid.
    pub fn realloc(&self, addr: Address, size: usize) -> Result<Address> {
        match forward(Request::function(Function::Realloc, &[addr.to_wire(), size as u64]))? {
            0 => Err(Error::OutOfMemory),
            addr => Address::from_wire(addr).ok_or(Error::Unexpected),
        }
    }

    /// Copies `text` up to its first NUL, and at most `max` bytes of it, into
    /// new host-visible memory as a NUL-terminated string.
    pub fn strndup(&self, text: &[u8], max: usize) -> Result<Address> {
        let text = &text[..text.len().min(max)];
        let len = text.iter().position(|b| *b == 0).unwrap_or(text.len());
        let size = len.checked_add(1).ok_or(Error::OutOfMemory)?;

        let enclave = enclave().ok_or(Error::Failure)?;
        let addr = self.alloc(size)?;
        if !enclave.region().is_outside(addr, size) {
            error!("host memory {addr} overlaps the protected region");
            self.free(addr);
            return Err(Error::Failure);
        }

        // SAFETY: the host handed out `size` zeroed bytes at `addr`, outside
        // the protected region. The last one stays as the terminator.
        unsafe { ptr::copy_nonoverlapping(text.as_ptr(), addr.as_mut_ptr(), len) };
        Ok(addr)
    }
}

impl HostCall for Host {
    fn call_host(&self, args: Address) -> Result<u64> {
        forward(Request::function(Function::CallHost, &[args.to_wire()]))
    }
}

/// Calls function `function_id` of host table `table_id` from a bound thread.
///
/// See [`ocall::call_host`].
pub fn call_host(
    table_id: u64,
    function_id: u64,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize> {
    let enclave = enclave().ok_or(Error::Failure)?;
    ocall::call_host(&Host, &enclave.region(), table_id, function_id, input, output)
}

/// Calls function `function_id` of the host's default table from a bound thread.
pub fn call_host_default(function_id: u64, input: &[u8], output: &mut [u8]) -> Result<usize> {
    call_host(postern_abi::table::DEFAULT_TABLE, function_id, input, output)
}

#[cfg(test)]
mod tests;
