// SPDX-License-Identifier: Apache-2.0

use super::{bind, serve, unbind};
use crate::heap::{Heap, PAGE_SIZE};
use crate::Enclave;

use std::env;
use std::fs::File;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

use mmarinus::{perms, Map, Shared};
use postern_abi::addr::{Address, Region};
use postern_abi::call::Settings;
use postern_abi::table::Registry;
use postern_abi::transport::Channel;
use tracing::{debug, error, trace_span};

/// Comma-separated socket descriptors, one per worker thread
pub const ENV_CHANNELS: &str = "POSTERN_CHANNELS";

/// The host-visible segment as `fd:addr:len`
pub const ENV_SHARED: &str = "POSTERN_SHARED";

/// Pages of private heap
pub const ENV_HEAP_PAGES: &str = "POSTERN_HEAP_PAGES";

/// Pages of stack per worker thread
pub const ENV_STACK_PAGES: &str = "POSTERN_STACK_PAGES";

const DEFAULT_HEAP_PAGES: usize = 256;
const DEFAULT_STACK_PAGES: usize = 64;

/// A guest process attached to its host
pub struct Runtime {
    channels: Vec<Channel<UnixStream>>,
    shared: Option<Map<perms::ReadWrite, Shared>>,
    heap_pages: usize,
    stack_pages: usize,
}

impl Runtime {
    /// Attaches to the host described by the process environment.
    pub fn from_env() -> io::Result<Self> {
        let channels = env::var(ENV_CHANNELS)
            .map_err(|_| invalid(format!("{ENV_CHANNELS} is not set")))?;
        let channels = parse_channels(&channels)
            .ok_or_else(|| invalid(format!("{ENV_CHANNELS} is malformed: {channels:?}")))?;

        let shared = match env::var(ENV_SHARED) {
            Ok(value) => {
                let (fd, addr, len) = parse_shared(&value)
                    .ok_or_else(|| invalid(format!("{ENV_SHARED} is malformed: {value:?}")))?;
                Some(attach(fd, addr, len)?)
            }
            Err(_) => None,
        };

        let heap_pages = pages(ENV_HEAP_PAGES, DEFAULT_HEAP_PAGES)?;
        let stack_pages = pages(ENV_STACK_PAGES, DEFAULT_STACK_PAGES)?;

        // SAFETY: the host hands each descriptor to exactly one guest thread.
        let channels = channels
            .into_iter()
            .map(|fd| Channel::new(unsafe { UnixStream::from_raw_fd(fd) }))
            .collect();

        Ok(Self {
            channels,
            shared,
            heap_pages,
            stack_pages,
        })
    }

    /// Serves the host with the function tables in `registry` until every
    /// worker thread is told to terminate.
    ///
    /// Returns the exit status requested on the first channel.
    pub fn run(self, registry: Registry) -> io::Result<i32> {
        let Self {
            channels,
            shared,
            heap_pages,
            stack_pages,
        } = self;

        let settings = Settings {
            heap_pages: heap_pages as u64,
            stack_pages: stack_pages as u64,
            threads: channels.len() as u64,
        };

        let mut enclave = Enclave::new(Heap::new(heap_pages)?, registry).with_settings(settings);
        if let Some(map) = shared.as_ref() {
            let region = Region::new(Address::new(map.addr()), map.size())
                .ok_or_else(|| invalid("empty shared segment".into()))?;
            enclave = enclave.with_shared(region);
        }
        let enclave = Arc::new(enclave);
        debug!(?settings, region = %enclave.region().start(), "enclave ready");

        let handles = channels
            .into_iter()
            .enumerate()
            .map(|(id, channel)| {
                let enclave = enclave.clone();
                thread::Builder::new()
                    .name(format!("postern-{id}"))
                    .stack_size(stack_pages * PAGE_SIZE)
                    .spawn(move || {
                        let span = trace_span!("Thread", id);
                        let _enter = span.enter();

                        bind(enclave, channel);
                        let status = serve();
                        unbind();
                        status
                    })
            })
            .collect::<io::Result<Vec<_>>>()?;

        let mut exit = 0;
        for (id, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(status)) if id == 0 => exit = status,
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!("worker thread {id} failed: {e}");
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, e));
                }
                Err(_) => {
                    return Err(io::Error::new(io::ErrorKind::Other, "worker thread panicked"));
                }
            }
        }

        drop(shared);
        Ok(exit)
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

fn pages(var: &str, default: usize) -> io::Result<usize> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .ok()
            .filter(|&pages: &usize| pages > 0)
            .ok_or_else(|| invalid(format!("{var} is malformed: {value:?}"))),
        Err(_) => Ok(default),
    }
}

/// Maps the host's segment at the address the host uses for it.
fn attach(fd: RawFd, addr: usize, len: usize) -> io::Result<Map<perms::ReadWrite, Shared>> {
    // SAFETY: the host passes the segment's descriptor to us alone.
    let mut file = unsafe { File::from_raw_fd(fd) };

    Map::bytes(len)
        .at(addr)
        .from(&mut file, 0)
        .with_kind(Shared)
        .with(perms::ReadWrite)
        .map_err(|e| e.err)
}

pub(crate) fn parse_channels(value: &str) -> Option<Vec<RawFd>> {
    let fds = value
        .split(',')
        .map(|fd| fd.trim().parse::<RawFd>().ok().filter(|fd| *fd >= 0))
        .collect::<Option<Vec<_>>>()?;

    (!fds.is_empty()).then_some(fds)
}

pub(crate) fn parse_shared(value: &str) -> Option<(RawFd, usize, usize)> {
    let mut parts = value.split(':');
    let fd = parts.next()?.parse::<RawFd>().ok().filter(|fd| *fd >= 0)?;
    let addr = parse_hex(parts.next()?)?;
    let len = parts.next()?.parse::<usize>().ok().filter(|len| *len > 0)?;

    if parts.next().is_some() || addr == 0 || addr % PAGE_SIZE != 0 {
        return None;
    }

    Some((fd, addr, len))
}

fn parse_hex(value: &str) -> Option<usize> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    usize::from_str_radix(digits, 16).ok()
}
