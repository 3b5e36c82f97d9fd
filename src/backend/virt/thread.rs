// SPDX-License-Identifier: Apache-2.0

use super::handler::Handler;
use super::segment::Lease;
use super::Keep;
use crate::backend;

use std::mem::size_of;
use std::os::unix::net::UnixStream;
use std::ptr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use postern_abi::addr::Address;
use postern_abi::call::{buffer_size_for, CallArgs, Settings, STATUS_SIZE};
use postern_abi::frame::{Function, Request};
use postern_abi::transport::{Channel, Transport};
use postern_abi::{Error, Status};
use tracing::{instrument, trace, trace_span};

/// One guest thread, reached over its own channel
pub struct Thread {
    keep: Arc<Keep>,
    channel: Option<Channel<UnixStream>>,
}

impl Thread {
    pub(super) fn new(keep: Arc<Keep>, channel: Channel<UnixStream>) -> Self {
        Self {
            keep,
            channel: Some(channel),
        }
    }

    /// Sends `request` to the guest, serving its requests until it answers.
    fn call(&mut self, request: Request) -> Result<u64> {
        let span = trace_span!("Thread");
        let _enter = span.enter();

        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| anyhow!("thread has no channel"))?;
        let handler = Handler::new(&self.keep.segment, &self.keep.registry);

        let response = channel
            .call(request, |_, nested| handler.handle(nested))
            .with_context(|| format!("guest channel failed during {request:?}"))?;

        trace!(?response);
        Ok(response.into_result()?)
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.keep.channels().push(channel);
        }
    }
}

impl backend::Thread for Thread {
    #[instrument(level = "trace", skip(self, input, output))]
    fn ecall(
        &mut self,
        table_id: u64,
        function_id: u64,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize> {
        let input_size = buffer_size_for(input.len()).ok_or(Error::OutOfMemory)?;
        let output_size = buffer_size_for(output.len()).ok_or(Error::OutOfMemory)?;
        let total = CallArgs::SIZE
            .checked_add(input_size)
            .and_then(|size| size.checked_add(output_size))
            .ok_or(Error::OutOfMemory)?;

        let keep = self.keep.clone();
        let block = Lease::new(&keep.segment, total)?;
        let args = block.addr();
        let input_addr = Address::new(args.raw() + CallArgs::SIZE);
        let output_addr = Address::new(input_addr.raw() + input_size);

        // SAFETY: the lease covers `total` bytes of the segment, zeroed.
        unsafe {
            ptr::copy_nonoverlapping(input.as_ptr(), input_addr.as_mut_ptr(), input.len());

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

        let ret = self.call(Request::function(Function::CallEnclave, &[args.to_wire()]))?;
        let status = u32::try_from(ret)
            .map_err(|_| Error::Unexpected)
            .and_then(Status::try_from)?;
        status
            .into_result()
            .with_context(|| format!("enclave call {table_id}:{function_id} failed"))?;

        // SAFETY: the record lies in the lease.
        let reply = unsafe { CallArgs::read(args) };
        let written = usize::try_from(reply.output_bytes_written)
            .ok()
            .filter(|&written| written >= STATUS_SIZE && written <= output.len())
            .ok_or(Error::Unexpected)?;

        // SAFETY: `written` fits the output buffer in the lease.
        unsafe {
            ptr::copy_nonoverlapping(output_addr.as_ptr::<u8>(), output.as_mut_ptr(), written)
        };

        Ok(written)
    }

    fn ping(&mut self, value: u64) -> Result<u64> {
        self.call(Request::function(Function::Ping, &[value]))
    }

    fn settings(&mut self) -> Result<Settings> {
        let keep = self.keep.clone();
        let block = Lease::new(&keep.segment, size_of::<Settings>())?;

        self.call(Request::function(Function::GetSettings, &[block.addr().to_wire()]))?;

        // SAFETY: the lease is aligned for `Settings` and large enough.
        Ok(unsafe { ptr::read_volatile(block.addr().as_ptr::<Settings>()) })
    }
}
