// SPDX-License-Identifier: Apache-2.0

//! Inbound call marshaling
//!
//! A call arrives as the address of a [`CallArgs`] record in untrusted
//! memory. The record is copied exactly once and every later decision is
//! made on the copy. Input and output contents are copied into one trusted
//! scratch buffer for the duration of the call. Contents can still change
//! while that copy is taken; callees must treat their input as arbitrary
//! bytes.

use crate::Enclave;

use std::ops::DerefMut;
use std::ptr;

use postern_abi::addr::{Address, Region};
use postern_abi::call::{is_valid_buffer_size, read_status, CallArgs};
use postern_abi::table::Registry;
use postern_abi::{Error, Result, Status};
use tracing::{debug, trace};

/// Decides which memory a marshaler may read call data from and write results to
pub trait Boundary {
    /// Whether `[ptr, ptr + size)` is acceptable untrusted memory.
    fn admits(&self, ptr: Address, size: usize) -> bool;
}

/// Admits spans wholly outside the region
#[derive(Copy, Clone, Debug)]
pub struct Outside(pub Region);

impl Boundary for Outside {
    #[inline]
    fn admits(&self, ptr: Address, size: usize) -> bool {
        self.0.is_outside(ptr, size)
    }
}

/// Admits spans wholly inside the region
#[derive(Copy, Clone, Debug)]
pub struct Inside(pub Region);

impl Boundary for Inside {
    #[inline]
    fn admits(&self, ptr: Address, size: usize) -> bool {
        self.0.is_inside(ptr, size)
    }
}

/// Dispatches the call described by the record at `args` into `enclave`.
///
/// On success the callee's output has been copied back and the record
/// carries [`Status::Ok`] and the number of bytes written.
pub fn dispatch(enclave: &Enclave, args: Address) -> Result<()> {
    marshal(enclave, enclave.registry(), |size| enclave.heap().alloc(size), args)
}

/// A scratch buffer from the process heap
pub fn heap_scratch(size: usize) -> Result<Vec<u8>> {
    let mut scratch = Vec::new();
    scratch
        .try_reserve_exact(size)
        .map_err(|_| Error::OutOfMemory)?;
    scratch.resize(size, 0);
    Ok(scratch)
}

/// Validates, copies and dispatches the call at `args` through `registry`.
///
/// Nothing is written to untrusted memory unless the callee ran.
pub fn marshal<B, F, S>(boundary: &B, registry: &Registry, scratch: F, args: Address) -> Result<()>
where
    B: Boundary + ?Sized,
    F: FnOnce(usize) -> Result<S>,
    S: DerefMut<Target = [u8]>,
{
    if !CallArgs::is_aligned_non_null(args) || !boundary.admits(args, CallArgs::SIZE) {
        debug!("rejected call record at {args}");
        return Err(Error::InvalidParameter);
    }

    // SAFETY: the record is aligned, non-null and admitted by the boundary.
    let call = unsafe { CallArgs::read(args) };
    trace!(?call, "ecall");

    let input = Span::untrusted(boundary, call.input_buffer, call.input_buffer_size)?;
    let output = Span::untrusted(boundary, call.output_buffer, call.output_buffer_size)?;

    let total = input
        .size
        .checked_add(output.size)
        .ok_or(Error::OutOfMemory)?;

    let entry = registry.lookup(call.table_id, call.function_id)?;

    let mut scratch = scratch(total)?;
    let scratch = scratch.get_mut(..total).ok_or(Error::OutOfMemory)?;
    let (input_copy, output_copy) = scratch.split_at_mut(input.size);

    // SAFETY: the input span was admitted by the boundary.
    unsafe {
        ptr::copy_nonoverlapping(input.addr.as_ptr::<u8>(), input_copy.as_mut_ptr(), input.size)
    };
    output_copy.fill(0);

    let mut written = 0usize;
    entry(input_copy, output_copy, &mut written);

    let outcome = match read_status(output_copy) {
        Ok(Status::Ok) if written <= output_copy.len() => Ok(()),
        Ok(Status::Ok) => Err(Error::Unexpected),
        Ok(status) => status.into_result(),
        Err(_) => Err(Error::Unexpected),
    };

    match outcome {
        Ok(()) => {
            // SAFETY: `written` fits the output span, which was admitted by the
            // boundary, as was the record.
            unsafe {
                ptr::copy_nonoverlapping(output_copy.as_ptr(), output.addr.as_mut_ptr(), written);
                CallArgs::publish(args, Status::Ok, written as u64);
            }
            Ok(())
        }

        Err(e) => {
            debug!("callee {}:{} failed: {e}", call.table_id, call.function_id);
            // SAFETY: the record was admitted by the boundary.
            unsafe { CallArgs::publish(args, e.into(), 0) };
            Err(e)
        }
    }
}

struct Span {
    addr: Address,
    size: usize,
}

impl Span {
    fn untrusted<B: Boundary + ?Sized>(boundary: &B, addr: u64, size: u64) -> Result<Self> {
        let addr = Address::from_wire(addr).ok_or(Error::InvalidParameter)?;
        let size = usize::try_from(size).map_err(|_| Error::InvalidParameter)?;

        if addr.is_null() || !is_valid_buffer_size(size) || !boundary.admits(addr, size) {
            debug!("rejected buffer {addr} of {size:#x} bytes");
            return Err(Error::InvalidParameter);
        }

        Ok(Self { addr, size })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Heap, PAGE_SIZE};

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use postern_abi::call::{write_status, BUFFER_ALIGNMENT, STATUS_SIZE};
    use postern_abi::table::{EntryPoint, DEFAULT_TABLE};

    #[derive(Copy, Clone)]
    #[repr(C, align(16))]
    struct Block([u8; 16]);

    /// A 16-byte aligned byte buffer
    struct Buffer(Vec<Block>);

    impl Buffer {
        fn new(size: usize, fill: u8) -> Self {
            assert_eq!(size % 16, 0);
            let mut buf = Self(vec![Block([0; 16]); size / 16]);
            buf.bytes_mut().fill(fill);
            buf
        }

        fn with(bytes: &[u8], size: usize) -> Self {
            let mut buf = Self::new(size, 0);
            buf.bytes_mut()[..bytes.len()].copy_from_slice(bytes);
            buf
        }

        fn addr(&self) -> u64 {
            self.0.as_ptr() as u64
        }

        fn bytes(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self.0.as_ptr().cast(), self.0.len() * 16) }
        }

        fn bytes_mut(&mut self) -> &mut [u8] {
            unsafe { std::slice::from_raw_parts_mut(self.0.as_mut_ptr().cast(), self.0.len() * 16) }
        }
    }

    fn echo(input: &[u8], output: &mut [u8], written: &mut usize) {
        let payload = match input.iter().rposition(|b| *b != 0) {
            Some(last) => &input[..=last],
            None => &[][..],
        };

        if STATUS_SIZE + payload.len() > output.len() {
            write_status(output, Status::OutOfMemory);
            return;
        }

        write_status(output, Status::Ok);
        output[STATUS_SIZE..][..payload.len()].copy_from_slice(payload);
        *written = STATUS_SIZE + payload.len();
    }

    fn partial(_: &[u8], output: &mut [u8], written: &mut usize) {
        output.fill(0xab);
        write_status(output, Status::Ok);
        *written = 10;
    }

    fn fail(_: &[u8], output: &mut [u8], written: &mut usize) {
        output.fill(0xab);
        write_status(output, Status::Failure);
        *written = 12;
    }

    fn overrun(_: &[u8], output: &mut [u8], written: &mut usize) {
        write_status(output, Status::Ok);
        *written = output.len() + 1;
    }

    fn garbage(_: &[u8], output: &mut [u8], written: &mut usize) {
        output[..STATUS_SIZE].copy_from_slice(&99u32.to_le_bytes());
        *written = STATUS_SIZE;
    }

    fn requires_zeroed(_: &[u8], output: &mut [u8], written: &mut usize) {
        let status = if output.iter().all(|b| *b == 0) {
            Status::Ok
        } else {
            Status::Failure
        };
        write_status(output, status);
        *written = STATUS_SIZE;
    }

    static NEVER_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn never(_: &[u8], _: &mut [u8], _: &mut usize) {
        NEVER_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    static ENTERED: AtomicBool = AtomicBool::new(false);
    static RELEASED: AtomicBool = AtomicBool::new(false);

    fn gated(input: &[u8], output: &mut [u8], written: &mut usize) {
        ENTERED.store(true, Ordering::SeqCst);
        while !RELEASED.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        echo(input, output, written);
    }

    fn enclave(pages: usize) -> Enclave {
        let table: Vec<Option<EntryPoint>> = vec![
            Some(echo),
            Some(partial),
            Some(fail),
            Some(overrun),
            Some(garbage),
            Some(never),
            Some(gated),
        ];
        let registry = Registry::default();
        registry.register(0, table).unwrap();
        Enclave::new(Heap::new(pages).unwrap(), registry)
    }

    fn record(function_id: u64, input: &Buffer, output: &Buffer) -> Box<CallArgs> {
        Box::new(CallArgs {
            table_id: 0,
            function_id,
            input_buffer: input.addr(),
            input_buffer_size: input.bytes().len() as u64,
            output_buffer: output.addr(),
            output_buffer_size: output.bytes().len() as u64,
            result: u32::MAX,
            output_bytes_written: u64::MAX,
        })
    }

    fn addr_of(args: &CallArgs) -> Address {
        Address::from_ptr(args as *const CallArgs)
    }

    #[test]
    fn ping() {
        let enclave = enclave(1);
        let input = Buffer::with(b"ping", BUFFER_ALIGNMENT);
        let output = Buffer::new(BUFFER_ALIGNMENT, 0xee);
        let args = record(0, &input, &output);

        assert_eq!(dispatch(&enclave, addr_of(&args)), Ok(()));
        assert_eq!(args.status(), Ok(Status::Ok));
        assert_eq!(args.output_bytes_written, 8);
        assert_eq!(read_status(output.bytes()), Ok(Status::Ok));
        assert_eq!(&output.bytes()[STATUS_SIZE..8], b"ping");
        assert_eq!(output.bytes()[8..], [0xee; BUFFER_ALIGNMENT - 8]);
        assert_eq!(enclave.heap().used(), 0);
    }

    #[test]
    fn default_table() {
        let echo_only: Vec<Option<EntryPoint>> = vec![Some(echo)];
        let enclave = Enclave::new(Heap::new(1).unwrap(), Registry::new(echo_only));
        let input = Buffer::with(b"hi", BUFFER_ALIGNMENT);
        let output = Buffer::new(BUFFER_ALIGNMENT, 0);
        let mut args = record(0, &input, &output);
        args.table_id = DEFAULT_TABLE;

        assert_eq!(dispatch(&enclave, addr_of(&args)), Ok(()));
        assert_eq!(&output.bytes()[STATUS_SIZE..6], b"hi");

        args.table_id = 0;
        assert_eq!(dispatch(&enclave, addr_of(&args)), Err(Error::NotFound));
    }

    #[test]
    fn copies_exactly_bytes_written() {
        let enclave = enclave(1);
        let input = Buffer::new(BUFFER_ALIGNMENT, 0);
        let output = Buffer::new(4 * BUFFER_ALIGNMENT, 0xee);
        let args = record(1, &input, &output);

        assert_eq!(dispatch(&enclave, addr_of(&args)), Ok(()));
        assert_eq!(args.output_bytes_written, 10);
        assert_eq!(output.bytes()[STATUS_SIZE..10], [0xab; 6]);
        assert!(output.bytes()[10..].iter().all(|b| *b == 0xee));
    }

    #[test]
    fn output_is_zeroed_before_call() {
        let heap = Heap::new(1).unwrap();
        let table: Vec<Option<EntryPoint>> = vec![Some(requires_zeroed)];
        let registry = Registry::new(table);

        let input = Buffer::new(BUFFER_ALIGNMENT, 0xee);
        let output = Buffer::new(4 * BUFFER_ALIGNMENT, 0xee);
        let mut args = record(0, &input, &output);
        args.table_id = DEFAULT_TABLE;

        // Scratch memory still holding stale bytes
        let dirty = |size: usize| -> Result<Vec<u8>> { Ok(vec![0xff; size]) };
        let boundary = Outside(heap.region());

        assert_eq!(marshal(&boundary, &registry, dirty, addr_of(&args)), Ok(()));
        assert_eq!(args.status(), Ok(Status::Ok));
        assert_eq!(args.output_bytes_written, STATUS_SIZE as u64);
        assert_eq!(read_status(output.bytes()), Ok(Status::Ok));
        assert!(output.bytes()[STATUS_SIZE..].iter().all(|b| *b == 0xee));
    }

    #[test]
    fn callee_failure_copies_nothing() {
        let enclave = enclave(1);
        let input = Buffer::new(BUFFER_ALIGNMENT, 0);
        let output = Buffer::new(2 * BUFFER_ALIGNMENT, 0xee);
        let args = record(2, &input, &output);

        assert_eq!(dispatch(&enclave, addr_of(&args)), Err(Error::Failure));
        assert_eq!(args.status(), Ok(Status::Failure));
        assert_eq!(args.output_bytes_written, 0);
        assert!(output.bytes().iter().all(|b| *b == 0xee));
        assert_eq!(enclave.heap().used(), 0);
    }

    #[test]
    fn broken_callee_contract() {
        let enclave = enclave(1);
        let input = Buffer::new(BUFFER_ALIGNMENT, 0);

        for function in [3, 4] {
            let output = Buffer::new(BUFFER_ALIGNMENT, 0xee);
            let args = record(function, &input, &output);

            assert_eq!(dispatch(&enclave, addr_of(&args)), Err(Error::Unexpected));
            assert_eq!(args.status(), Ok(Status::Unexpected));
            assert_eq!(args.output_bytes_written, 0);
            assert!(output.bytes().iter().all(|b| *b == 0xee));
        }
    }

    #[test]
    fn rejects_invalid_buffers() {
        let enclave = enclave(1);
        let input = Buffer::new(2 * BUFFER_ALIGNMENT, 0);
        let output = Buffer::new(2 * BUFFER_ALIGNMENT, 0xee);
        let inside = enclave.region().start().to_wire();

        let cases: [(&str, fn(&mut CallArgs)); 8] = [
            ("misaligned input size", |a| a.input_buffer_size = 20),
            ("misaligned output size", |a| a.output_buffer_size = BUFFER_ALIGNMENT as u64 + 4),
            ("short output", |a| a.output_buffer_size = 0),
            ("short input", |a| a.input_buffer_size = 0),
            ("null input", |a| a.input_buffer = 0),
            ("null output", |a| a.output_buffer = 0),
            ("wrapping input", |a| a.input_buffer = u64::MAX - 15),
            ("overlong output", |a| a.output_buffer_size = u64::MAX & !15),
        ];

        for (name, mutate) in cases {
            let mut args = record(5, &input, &output);
            mutate(&mut args);
            assert_eq!(
                dispatch(&enclave, addr_of(&args)),
                Err(Error::InvalidParameter),
                "{name}"
            );
            assert_eq!(args.result, u32::MAX, "{name}");
            assert_eq!(args.output_bytes_written, u64::MAX, "{name}");
        }

        let mut args = record(5, &input, &output);
        args.input_buffer = inside;
        assert_eq!(dispatch(&enclave, addr_of(&args)), Err(Error::InvalidParameter));

        let mut args = record(5, &input, &output);
        args.output_buffer = inside + 2 * BUFFER_ALIGNMENT as u64;
        assert_eq!(dispatch(&enclave, addr_of(&args)), Err(Error::InvalidParameter));

        assert_eq!(NEVER_CALLS.load(Ordering::SeqCst), 0);
        assert!(output.bytes().iter().all(|b| *b == 0xee));
    }

    #[test]
    fn rejects_invalid_records() {
        let enclave = enclave(1);

        assert_eq!(dispatch(&enclave, Address::NULL), Err(Error::InvalidParameter));

        let args = Box::new([CallArgs::default(); 2]);
        let misaligned = Address::new(addr_of(&args[0]).raw() + 4);
        assert_eq!(dispatch(&enclave, misaligned), Err(Error::InvalidParameter));

        // A record inside the region is never read.
        let inside = enclave.heap().alloc(CallArgs::SIZE).unwrap();
        let addr = Address::from_ptr(inside.as_ptr());
        assert_eq!(dispatch(&enclave, addr), Err(Error::InvalidParameter));

        // A record straddling the region's start is neither inside nor outside.
        let straddle = Address::new(enclave.region().start().raw() - 8);
        assert_eq!(dispatch(&enclave, straddle), Err(Error::InvalidParameter));
    }

    #[test]
    fn not_found() {
        let enclave = enclave(1);
        let input = Buffer::new(BUFFER_ALIGNMENT, 0);
        let output = Buffer::new(BUFFER_ALIGNMENT, 0xee);

        for (table, function) in [(0, 7), (0, u64::MAX), (1, 0), (63, 0), (64, 0), (1 << 40, 0)] {
            let mut args = record(function, &input, &output);
            args.table_id = table;
            assert_eq!(
                dispatch(&enclave, addr_of(&args)),
                Err(Error::NotFound),
                "{table} {function}"
            );
            assert_eq!(args.result, u32::MAX);
        }
    }

    #[test]
    fn size_overflow() {
        let enclave = enclave(1);

        // Both buffers sit above the region and each ends below the top of
        // the address space, but their sizes add up past it.
        let base = enclave.region().end().align_up(BUFFER_ALIGNMENT).unwrap();
        let size = (usize::MAX - base.raw()) / BUFFER_ALIGNMENT * BUFFER_ALIGNMENT;
        assert!(size.checked_add(size).is_none());

        let args = Box::new(CallArgs {
            table_id: 0,
            function_id: 5,
            input_buffer: base.to_wire(),
            input_buffer_size: size as u64,
            output_buffer: base.to_wire(),
            output_buffer_size: size as u64,
            result: u32::MAX,
            output_bytes_written: u64::MAX,
        });

        assert_eq!(dispatch(&enclave, addr_of(&args)), Err(Error::OutOfMemory));
        assert_eq!(args.result, u32::MAX);
        assert_eq!(args.output_bytes_written, u64::MAX);
        assert_eq!(NEVER_CALLS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn scratch_exhausted() {
        let enclave = enclave(1);
        let input = Buffer::new(PAGE_SIZE, 0);
        let output = Buffer::new(PAGE_SIZE, 0xee);
        let args = record(0, &input, &output);

        assert_eq!(dispatch(&enclave, addr_of(&args)), Err(Error::OutOfMemory));
        assert_eq!(args.result, u32::MAX);
        assert!(output.bytes().iter().all(|b| *b == 0xee));
        assert_eq!(enclave.heap().used(), 0);

        let input = Buffer::with(b"ok", PAGE_SIZE / 2);
        let output = Buffer::new(PAGE_SIZE / 2, 0);
        let fits = record(0, &input, &output);
        assert_eq!(dispatch(&enclave, addr_of(&fits)), Ok(()));
        assert_eq!(&output.bytes()[STATUS_SIZE..6], b"ok");
    }

    #[test]
    fn record_changes_after_handoff_are_ignored() {
        let enclave = Arc::new(enclave(1));
        let input = Buffer::with(b"original", BUFFER_ALIGNMENT);
        let output = Buffer::new(2 * BUFFER_ALIGNMENT, 0xee);
        let decoy = Buffer::new(2 * BUFFER_ALIGNMENT, 0xdd);
        let args = record(6, &input, &output);
        let addr = addr_of(&args);

        let dispatcher = {
            let enclave = enclave.clone();
            thread::spawn(move || dispatch(&enclave, addr))
        };

        while !ENTERED.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        // Point every field of the record elsewhere while the callee runs.
        let tampered = CallArgs {
            table_id: 1,
            function_id: 5,
            input_buffer: decoy.addr(),
            input_buffer_size: 16,
            output_buffer: decoy.addr(),
            output_buffer_size: 2 * BUFFER_ALIGNMENT as u64,
            result: Status::Failure.into(),
            output_bytes_written: 1,
        };
        unsafe { tampered.write(addr) };
        RELEASED.store(true, Ordering::SeqCst);

        assert_eq!(dispatcher.join().unwrap(), Ok(()));

        let reply = unsafe { CallArgs::read(addr) };
        assert_eq!(reply.status(), Ok(Status::Ok));
        assert_eq!(reply.output_bytes_written, 12);
        assert_eq!(&output.bytes()[STATUS_SIZE..12], b"original");
        assert!(decoy.bytes().iter().all(|b| *b == 0xdd));
        assert_eq!(NEVER_CALLS.load(Ordering::SeqCst), 0);
        drop(args);
    }

    #[test]
    fn inside_boundary() {
        let heap = Heap::new(1).unwrap();
        let region = heap.region();
        let echo_only: Vec<Option<EntryPoint>> = vec![Some(echo)];
        let registry = Registry::new(echo_only);

        let mut block = heap.alloc(CallArgs::SIZE + 2 * BUFFER_ALIGNMENT).unwrap();
        let base = Address::from_ptr(block.as_ptr());
        block[CallArgs::SIZE..][..3].copy_from_slice(b"abc");

        let input = base.checked_add(CallArgs::SIZE).unwrap();
        let output = input.checked_add(BUFFER_ALIGNMENT).unwrap();
        let args = CallArgs {
            table_id: DEFAULT_TABLE,
            function_id: 0,
            input_buffer: input.to_wire(),
            input_buffer_size: BUFFER_ALIGNMENT as u64,
            output_buffer: output.to_wire(),
            output_buffer_size: BUFFER_ALIGNMENT as u64,
            ..Default::default()
        };
        unsafe { args.write(base) };

        assert_eq!(marshal(&Inside(region), &registry, heap_scratch, base), Ok(()));
        let reply = unsafe { CallArgs::read(base) };
        assert_eq!(reply.output_bytes_written, 7);
        assert_eq!(&block[CallArgs::SIZE + BUFFER_ALIGNMENT..][STATUS_SIZE..7], b"abc");

        // The same record is rejected by a boundary that requires the outside.
        assert_eq!(
            marshal(&Outside(region), &registry, heap_scratch, base),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn shared_segment_restriction() {
        let input = Buffer::with(b"ping", BUFFER_ALIGNMENT);
        let output = Buffer::new(BUFFER_ALIGNMENT, 0);
        let args = record(0, &input, &output);

        // Only the input buffer lies in the host-visible segment.
        let shared = Region::new(Address::new(input.addr() as usize), BUFFER_ALIGNMENT).unwrap();
        let enclave = enclave(1).with_shared(shared);
        assert_eq!(dispatch(&enclave, addr_of(&args)), Err(Error::InvalidParameter));
    }
}
