// SPDX-License-Identifier: Apache-2.0

use super::{enclave, Local};
use crate::ecall::{self, Boundary};

use std::cell::Cell;
use std::io;
use std::mem::{align_of, size_of};
use std::ptr;

use postern_abi::addr::Address;
use postern_abi::call::Settings;
use postern_abi::frame::{Frame, Function, Request, Response};
use postern_abi::transport::Transport;
use postern_abi::{Error, Result, Status};
use tracing::{debug, error, trace, warn};

thread_local! {
    static EXIT: Cell<Option<i32>> = Cell::new(None);
}

/// Serves host requests on the calling thread's channel until the host
/// sends [`Function::Terminate`], and returns the requested exit status.
pub fn serve() -> Result<i32> {
    loop {
        let request = match Local.recv() {
            Ok(Frame::Request(request)) => request,
            Ok(Frame::Response(response)) => {
                error!("unsolicited response from the host: {response:?}");
                attacked()
            }
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                error!("malformed frame from the host: {e}");
                attacked()
            }
            Err(e) => {
                warn!("host channel closed: {e}");
                return Err(Error::Failure);
            }
        };

        let response = handle(request);
        if let Err(e) = Local.send(&Frame::Response(response)) {
            warn!("host channel closed: {e}");
            return Err(Error::Failure);
        }

        if let Some(status) = EXIT.with(Cell::take) {
            debug!("terminating with status {status}");
            return Ok(status);
        }
    }
}

/// Handles one request from the host.
pub(crate) fn handle(request: Request) -> Response {
    trace!(?request, "host request");

    let (num, argv) = match request {
        Request::Function { num, argv } => (num, argv),
        Request::Syscall { num, .. } => {
            debug!("host forwarded syscall {num}");
            return Response::not_implemented();
        }
    };

    let function = match Function::try_from(num) {
        Ok(function) => function,
        Err(e) => return Response::error(e),
    };

    let enclave = match enclave() {
        Some(enclave) => enclave,
        None => return Response::error(Error::Failure),
    };

    match function {
        Function::CallEnclave => {
            let args = Address::from_wire(argv[0]).unwrap_or(Address::NULL);
            let status = Status::from(ecall::dispatch(&enclave, args));
            Response::ok(u32::from(status).into())
        }

        Function::GetSettings => {
            let addr = match Address::from_wire(argv[0]) {
                Some(addr) => addr,
                None => return Response::error(Error::InvalidParameter),
            };

            if addr.is_null()
                || !addr.is_aligned(align_of::<Settings>())
                || !enclave.admits(addr, size_of::<Settings>())
            {
                return Response::error(Error::InvalidParameter);
            }

            // SAFETY: the destination is aligned and admitted as untrusted memory.
            unsafe { ptr::write_volatile(addr.as_mut_ptr::<Settings>(), enclave.settings()) };
            Response::ok(0)
        }

        Function::Ping => Response::ok(argv[0]),

        Function::Terminate => {
            EXIT.with(|e| e.set(Some(argv[0] as i32)));
            Response::ok(0)
        }

        Function::CallHost
        | Function::Malloc
        | Function::Calloc
        | Function::Realloc
        | Function::Free => {
            Response::not_implemented()
        }
    }
}

/// The host broke the protocol on this thread's channel. There is no way to
/// resynchronize, so the process ends here.
fn attacked() -> ! {
    std::process::abort()
}
