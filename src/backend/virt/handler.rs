// SPDX-License-Identifier: Apache-2.0

//! Requests the guest sends to the host

use super::segment::SharedSegment;

use std::io;
use std::mem::size_of;

use libc::c_long;
use postern_abi::addr::Address;
use postern_abi::call::{write_status, STATUS_SIZE};
use postern_abi::frame::{Function, Request, Response};
use postern_abi::table::{EntryPoint, Registry};
use postern_abi::{Error, Status};
use postern_shim::ecall::{heap_scratch, marshal, Inside};
use tracing::{debug, instrument, trace};

/// Host table function: upper-cases its NUL-terminated input.
pub const UPPERCASE: u64 = 0;

fn uppercase(input: &[u8], output: &mut [u8], written: &mut usize) {
    let text = match input.iter().position(|b| *b == 0) {
        Some(end) => &input[..end],
        None => input,
    };

    let room = output.len().saturating_sub(STATUS_SIZE);
    let len = text.len().min(room);

    write_status(output, Status::Ok);
    for (dst, src) in output[STATUS_SIZE..][..len].iter_mut().zip(text) {
        *dst = src.to_ascii_uppercase();
    }
    *written = STATUS_SIZE + len;
}

/// The host's function tables
pub fn registry() -> Registry {
    let table: Vec<Option<EntryPoint>> = vec![Some(uppercase)];
    Registry::new(table)
}

/// Serves guest requests against one keep's segment and host tables
pub struct Handler<'a> {
    segment: &'a SharedSegment,
    registry: &'a Registry,
}

impl<'a> Handler<'a> {
    pub fn new(segment: &'a SharedSegment, registry: &'a Registry) -> Self {
        Self { segment, registry }
    }

    #[instrument(level = "trace", skip(self))]
    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Syscall { num, argv } => self.syscall(num, argv),
            Request::Function { num, argv } => match Function::try_from(num) {
                Ok(function) => self.function(function, argv),
                Err(e) => {
                    debug!("unknown function {num}");
                    Response::error(e)
                }
            },
        }
    }

    fn function(&self, function: Function, argv: [u64; 6]) -> Response {
        match function {
            Function::Malloc => self.malloc(argv[0]),

            Function::Calloc => match argv[0].checked_mul(argv[1]) {
                Some(size) => self.malloc(size),
                None => Response::ok(0),
            },

            Function::Realloc => self.realloc(argv[0], argv[1]),

            Function::Free => {
                let freed = Address::from_wire(argv[0])
                    .ok_or(Error::InvalidParameter)
                    .and_then(|addr| self.segment.free(addr));

                match freed {
                    Ok(_) => Response::ok(0),
                    Err(e) => Response::error(e),
                }
            }

            Function::CallHost => {
                let args = Address::from_wire(argv[0]).unwrap_or(Address::NULL);
                let status = Status::from(marshal(
                    &Inside(self.segment.region()),
                    self.registry,
                    heap_scratch,
                    args,
                ));
                trace!("host call at {args}: {status}");
                Response::ok(u32::from(status).into())
            }

            Function::Ping => Response::ok(argv[0]),

            Function::CallEnclave | Function::GetSettings | Function::Terminate => {
                Response::not_implemented()
            }
        }
    }

    /// Returns the segment address, or 0 if the segment is exhausted.
    fn malloc(&self, size: u64) -> Response {
        let addr = usize::try_from(size)
            .map_err(|_| Error::OutOfMemory)
            .and_then(|size| self.segment.alloc(size));

        match addr {
            Ok(addr) => Response::ok(addr.to_wire()),
            Err(e) => {
                debug!("segment allocation of {size} bytes failed: {e}");
                Response::ok(0)
            }
        }
    }

    /// Returns the resized allocation, or 0 with the old one left in place.
    fn realloc(&self, addr: u64, size: u64) -> Response {
        let resized = Address::from_wire(addr)
            .ok_or(Error::InvalidParameter)
            .and_then(|addr| {
                let size = usize::try_from(size).map_err(|_| Error::OutOfMemory)?;
                self.segment.realloc(addr, size)
            });

        match resized {
            Ok(addr) => Response::ok(addr.to_wire()),
            Err(e) => {
                debug!("segment reallocation of {addr:#x} to {size} bytes failed: {e}");
                Response::ok(0)
            }
        }
    }

    fn syscall(&self, num: u64, argv: [u64; 6]) -> Response {
        let num = num as c_long;

        let ret = match num {
            // The guest's parent is this process.
            // SAFETY: getpid takes no arguments and cannot fail.
            libc::SYS_getppid => unsafe { libc::getpid() as i64 },

            libc::SYS_getuid
            | libc::SYS_geteuid
            | libc::SYS_getgid
            | libc::SYS_getegid
            | libc::SYS_sched_yield
            | libc::SYS_sync => {
                // SAFETY: none of these take arguments or touch memory.
                unsafe { libc::syscall(num) as i64 }
            }

            // SAFETY: getpgrp takes no arguments and touches no memory.
            #[cfg(target_arch = "x86_64")]
            libc::SYS_getpgrp => unsafe { libc::syscall(num) as i64 },

            libc::SYS_umask => {
                // SAFETY: umask takes a mode by value and touches no memory.
                unsafe { libc::syscall(num, argv[0] as libc::mode_t) as i64 }
            }

            libc::SYS_uname => {
                let buf = Address::from_wire(argv[0]).unwrap_or(Address::NULL);
                let size = size_of::<libc::utsname>();
                if buf.is_null() || !self.segment.region().is_inside(buf, size) {
                    -(libc::EFAULT as i64)
                } else {
                    // SAFETY: the buffer lies inside the shared segment.
                    unsafe { libc::uname(buf.as_mut_ptr()) as i64 }
                }
            }

            _ => {
                debug!("guest syscall {num} is not forwarded");
                return Response::not_implemented();
            }
        };

        let ret = if ret == -1 {
            -(io::Error::last_os_error().raw_os_error().unwrap_or(libc::ENOSYS) as i64)
        } else {
            ret
        };

        trace!("guest syscall {num} = {ret}");
        Response::ok(ret as u64)
    }
}
