// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::heap::Heap;

use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use postern_abi::call::{
    read_status, write_status, CallArgs, Settings, BUFFER_ALIGNMENT, STATUS_SIZE,
};
use postern_abi::frame::Response;
use postern_abi::table::{EntryPoint, Registry};
use postern_abi::Status;

fn echo(input: &[u8], output: &mut [u8], written: &mut usize) {
    let len = input.iter().rposition(|b| *b != 0).map_or(0, |last| last + 1);
    write_status(output, Status::Ok);
    output[STATUS_SIZE..][..len].copy_from_slice(&input[..len]);
    *written = STATUS_SIZE + len;
}

/// 0 unset, 1 running, 2 blocked on forward
static OBSERVED: AtomicU8 = AtomicU8::new(0);

fn observe(_: &[u8], output: &mut [u8], written: &mut usize) {
    let state = match state() {
        ThreadState::Running => 1,
        ThreadState::BlockedOnForward => 2,
    };
    OBSERVED.store(state, Ordering::SeqCst);
    write_status(output, Status::Ok);
    *written = STATUS_SIZE;
}

fn enclave() -> Arc<Enclave> {
    let table: Vec<Option<EntryPoint>> = vec![Some(echo), Some(observe)];
    let settings = Settings {
        heap_pages: 1,
        stack_pages: 2,
        threads: 3,
    };
    Arc::new(Enclave::new(Heap::new(1).unwrap(), Registry::new(table)).with_settings(settings))
}

/// Runs `guest` on a thread bound to one end of a socket pair and returns
/// the other end with the thread's handle.
fn spawn<T, F>(guest: F) -> (Channel<UnixStream>, thread::JoinHandle<T>)
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (host, guest_end) = UnixStream::pair().unwrap();
    let enclave = enclave();
    let handle = thread::spawn(move || {
        bind(enclave, Channel::new(guest_end));
        let result = guest();
        unbind();
        result
    });
    (Channel::new(host), handle)
}

fn expect_request(host: &mut Channel<UnixStream>) -> Request {
    match host.recv().unwrap() {
        Frame::Request(request) => request,
        frame => panic!("expected a request, got {frame:?}"),
    }
}

fn host_call(host: &mut Channel<UnixStream>, request: Request) -> Response {
    host.call(request, |_, _| Response::not_implemented()).unwrap()
}

#[repr(C, align(64))]
struct HostPage([u8; 256]);

#[repr(C, align(16))]
struct Call {
    args: CallArgs,
    input: [u8; BUFFER_ALIGNMENT],
    output: [u8; BUFFER_ALIGNMENT],
}

impl Call {
    fn new(function_id: u64, payload: &[u8]) -> Box<Self> {
        let mut call = Box::new(Self {
            args: CallArgs::default(),
            input: [0; BUFFER_ALIGNMENT],
            output: [0; BUFFER_ALIGNMENT],
        });
        call.input[..payload.len()].copy_from_slice(payload);
        call.args = CallArgs {
            table_id: postern_abi::table::DEFAULT_TABLE,
            function_id,
            input_buffer: call.input.as_ptr() as u64,
            input_buffer_size: BUFFER_ALIGNMENT as u64,
            output_buffer: call.output.as_ptr() as u64,
            output_buffer_size: BUFFER_ALIGNMENT as u64,
            result: u32::MAX,
            output_bytes_written: 0,
        };
        call
    }

    fn addr(&self) -> u64 {
        &self.args as *const CallArgs as u64
    }
}

#[test]
fn direct_syscall_needs_no_host() {
    let pid = syscall(libc::SYS_getpid, [0; 6]).unwrap();
    assert_eq!(pid, std::process::id() as isize);
    assert_eq!(state(), ThreadState::Running);
}

#[test]
fn forward_without_channel() {
    assert_eq!(syscall(libc::SYS_getppid, [0; 6]), Err(Error::Failure));
    assert_eq!(call_host_default(0, b"x", &mut [0u8; 16]), Err(Error::Failure));
}

#[test]
fn forward_blocks_until_host_replies() {
    const DELAY: Duration = Duration::from_millis(200);

    let (mut host, guest) = spawn(|| {
        let start = Instant::now();
        let ret = syscall(libc::SYS_getppid, [1, 2, 3, 4, 5, 6]);
        (ret, start.elapsed(), state())
    });

    let request = expect_request(&mut host);
    assert_eq!(
        request,
        Request::syscall(libc::SYS_getppid as u64, [1, 2, 3, 4, 5, 6])
    );

    thread::sleep(DELAY);
    host.send(&Frame::Response(Response::ok(4242))).unwrap();

    let (ret, elapsed, after) = guest.join().unwrap();
    assert_eq!(ret, Ok(4242));
    assert!(elapsed >= DELAY, "{elapsed:?}");
    assert_eq!(after, ThreadState::Running);
}

#[test]
fn forward_returns_negative_errno() {
    let (mut host, guest) = spawn(|| syscall(libc::SYS_getppid, [0; 6]));

    expect_request(&mut host);
    let errno = -(libc::EPERM as i64) as u64;
    host.send(&Frame::Response(Response::ok(errno))).unwrap();

    assert_eq!(guest.join().unwrap(), Ok(-(libc::EPERM as isize)));
}

#[test]
fn unknown_forward_is_not_implemented() {
    let (mut host, guest) = spawn(|| syscall(libc::SYS_mount, [0; 6]));

    expect_request(&mut host);
    host.send(&Frame::Response(Response::not_implemented())).unwrap();

    assert_eq!(guest.join().unwrap(), Err(Error::NotImplemented));
}

#[test]
fn host_calls_in_while_blocked() {
    let (mut host, guest) = spawn(|| syscall(libc::SYS_getppid, [0; 6]));

    expect_request(&mut host);

    // While the guest waits, the host calls into the enclave.
    let call = Call::new(1, b"");
    let response = host_call(&mut host, Request::function(Function::CallEnclave, &[call.addr()]));
    assert_eq!(response, Response::ok(0));
    assert_eq!(OBSERVED.load(Ordering::SeqCst), 2);

    let response = host_call(&mut host, Request::function(Function::Ping, &[9]));
    assert_eq!(response, Response::ok(9));

    host.send(&Frame::Response(Response::ok(1))).unwrap();
    assert_eq!(guest.join().unwrap(), Ok(1));
}

#[test]
fn serve_requests() {
    let (mut host, guest) = spawn(serve);

    let response = host_call(&mut host, Request::function(Function::Ping, &[0xfeed]));
    assert_eq!(response, Response::ok(0xfeed));

    let call = Call::new(0, b"ping");
    let response = host_call(&mut host, Request::function(Function::CallEnclave, &[call.addr()]));
    assert_eq!(response, Response::ok(0));
    assert_eq!(call.args.output_bytes_written, 8);
    assert_eq!(read_status(&call.output), Ok(Status::Ok));
    assert_eq!(&call.output[STATUS_SIZE..8], b"ping");

    let call = Call::new(7, b"ping");
    let response = host_call(&mut host, Request::function(Function::CallEnclave, &[call.addr()]));
    assert_eq!(response, Response::ok(Status::NotFound as u64));

    let response = host_call(&mut host, Request::function(Function::CallEnclave, &[0]));
    assert_eq!(response, Response::ok(Status::InvalidParameter as u64));

    let settings = Box::new(Settings::default());
    let addr = &*settings as *const Settings as u64;
    let response = host_call(&mut host, Request::function(Function::GetSettings, &[addr]));
    assert_eq!(response, Response::ok(0));
    assert_eq!(
        *settings,
        Settings {
            heap_pages: 1,
            stack_pages: 2,
            threads: 3
        }
    );

    let response = host_call(&mut host, Request::function(Function::GetSettings, &[0]));
    assert_eq!(response.status, Status::InvalidParameter);

    let response = host_call(&mut host, Request::syscall(libc::SYS_getpid as u64, [0; 6]));
    assert_eq!(response, Response::not_implemented());

    let response = host_call(&mut host, Request::Function { num: 99, argv: [0; 6] });
    assert_eq!(response, Response::not_implemented());

    let response = host_call(&mut host, Request::function(Function::Malloc, &[16]));
    assert_eq!(response, Response::not_implemented());

    let response = host_call(&mut host, Request::function(Function::Realloc, &[0, 16]));
    assert_eq!(response, Response::not_implemented());

    let response = host_call(&mut host, Request::function(Function::Terminate, &[3]));
    assert_eq!(response, Response::ok(0));
    assert_eq!(guest.join().unwrap(), Ok(3));
}

#[test]
fn serve_ends_when_host_leaves() {
    let (host, guest) = spawn(serve);
    drop(host);
    assert_eq!(guest.join().unwrap(), Err(Error::Failure));
}

#[test]
fn outbound_call_through_host() {
    let (mut host, guest) = spawn(|| {
        let mut output = [0u8; 16];
        let written = call_host_default(3, b"hi", &mut output)?;
        Ok::<_, Error>(output[..written].to_vec())
    });

    // The guest asks for host memory first.
    let mut memory = Box::new(HostPage([0; 256]));
    let base = memory.0.as_mut_ptr() as u64;
    match expect_request(&mut host) {
        Request::Function { num, argv } => {
            assert_eq!(num, Function::Calloc as u64);
            assert_eq!(argv[0] * argv[1], (CallArgs::SIZE + 2 * BUFFER_ALIGNMENT) as u64);
        }
        request => panic!("unexpected {request:?}"),
    }
    host.send(&Frame::Response(Response::ok(base))).unwrap();

    // Then for the call itself.
    assert_eq!(
        expect_request(&mut host),
        Request::function(Function::CallHost, &[base])
    );
    let args = unsafe { CallArgs::read(Address::new(base as usize)) };
    assert_eq!(args.function_id, 3);
    assert_eq!(args.status(), Ok(Status::Failure));
    let input = unsafe { std::slice::from_raw_parts(args.input_buffer as *const u8, 2) };
    assert_eq!(input, b"hi");

    let output = args.output_buffer as *mut u8;
    unsafe {
        std::ptr::copy_nonoverlapping([0u8, 0, 0, 0, b'o', b'k'].as_ptr(), output, 6);
        CallArgs::publish(Address::new(base as usize), Status::Ok, 6);
    }
    host.send(&Frame::Response(Response::ok(0))).unwrap();

    // And finally releases the memory.
    assert_eq!(
        expect_request(&mut host),
        Request::function(Function::Free, &[base])
    );
    host.send(&Frame::Response(Response::ok(0))).unwrap();

    assert_eq!(guest.join().unwrap(), Ok(vec![0, 0, 0, 0, b'o', b'k']));
    drop(memory);
}

#[test]
fn realloc_through_host() {
    let (mut host, guest) = spawn(|| {
        let first = Host.realloc(Address::NULL, 64)?;
        let second = Host.realloc(first, 1 << 20);
        Ok::<_, Error>((first, second))
    });

    assert_eq!(
        expect_request(&mut host),
        Request::function(Function::Realloc, &[0, 64])
    );
    host.send(&Frame::Response(Response::ok(0x7000))).unwrap();

    assert_eq!(
        expect_request(&mut host),
        Request::function(Function::Realloc, &[0x7000, 1 << 20])
    );
    host.send(&Frame::Response(Response::ok(0))).unwrap();

    let (first, second) = guest.join().unwrap().unwrap();
    assert_eq!(first, Address::new(0x7000));
    assert_eq!(second, Err(Error::OutOfMemory));
}

#[test]
fn strndup_through_host() {
    let (mut host, guest) = spawn(|| {
        let whole = Host.strndup(b"hello\0world", 32)?;
        let clipped = Host.strndup(b"hello", 3)?;
        Ok::<_, Error>((whole, clipped))
    });

    let mut memory = Box::new(HostPage([0xff; 256]));
    memory.0[..64].fill(0);
    let base = memory.0.as_mut_ptr() as u64;

    assert_eq!(
        expect_request(&mut host),
        Request::function(Function::Calloc, &[1, 6])
    );
    host.send(&Frame::Response(Response::ok(base))).unwrap();

    assert_eq!(
        expect_request(&mut host),
        Request::function(Function::Calloc, &[1, 4])
    );
    host.send(&Frame::Response(Response::ok(base + 32))).unwrap();

    let (whole, clipped) = guest.join().unwrap().unwrap();
    assert_eq!(whole.to_wire(), base);
    assert_eq!(clipped.to_wire(), base + 32);
    assert_eq!(&memory.0[..7], b"hello\0\0");
    assert_eq!(&memory.0[32..36], b"hel\0");
}

#[test]
fn strndup_refuses_protected_memory() {
    let (inside_tx, inside_rx) = std::sync::mpsc::channel();
    let (mut host, guest) = spawn(move || {
        let region = super::enclave().ok_or(Error::Failure)?.region();
        inside_tx.send(region.start().to_wire()).unwrap();
        Host.strndup(b"secret", 16)
    });

    let inside = inside_rx.recv().unwrap();
    assert_eq!(
        expect_request(&mut host),
        Request::function(Function::Calloc, &[1, 7])
    );
    host.send(&Frame::Response(Response::ok(inside))).unwrap();

    // The guest hands the memory back without writing to it.
    assert_eq!(
        expect_request(&mut host),
        Request::function(Function::Free, &[inside])
    );
    host.send(&Frame::Response(Response::ok(0))).unwrap();

    assert_eq!(guest.join().unwrap(), Err(Error::Failure));
}
