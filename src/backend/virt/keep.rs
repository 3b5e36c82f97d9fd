// SPDX-License-Identifier: Apache-2.0

use super::handler;
use super::segment::SharedSegment;
use super::thread::Thread;
use crate::backend;

use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::{io, mem};

use anyhow::{anyhow, bail, Context, Result};
use postern_abi::frame::{Function, Request};
use postern_abi::table::Registry;
use postern_abi::transport::{Channel, Transport};
use postern_config::Config;
use postern_shim::guest::{ENV_CHANNELS, ENV_HEAP_PAGES, ENV_SHARED, ENV_STACK_PAGES};
use tracing::{debug, info, warn};

/// A running guest process
pub struct Keep {
    pub(super) segment: SharedSegment,
    pub(super) registry: Registry,
    channels: Mutex<Vec<Channel<UnixStream>>>,
    threads: usize,
    child: Mutex<Option<Child>>,
}

impl Keep {
    /// Starts `guest` with one channel per configured thread.
    pub fn launch(config: &Config, guest: &Path) -> Result<Arc<Self>> {
        let keep = &config.keep;
        let segment =
            SharedSegment::new(keep.shared_pages).context("failed to create shared segment")?;

        let mut hosts = Vec::with_capacity(keep.threads);
        let mut guests = Vec::with_capacity(keep.threads);
        for _ in 0..keep.threads {
            let (host, guest) = UnixStream::pair().context("failed to create channel")?;
            hosts.push(Channel::new(host));
            guests.push(guest);
        }

        let mut inherit: Vec<RawFd> = guests.iter().map(AsRawFd::as_raw_fd).collect();
        let channels = inherit
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        inherit.push(segment.fd());

        let mut command = Command::new(guest);
        command
            .env(ENV_CHANNELS, &channels)
            .env(ENV_SHARED, segment.describe())
            .env(ENV_HEAP_PAGES, keep.heap_pages.to_string())
            .env(ENV_STACK_PAGES, keep.stack_pages.to_string());

        // SAFETY: only async-signal-safe calls run between fork and exec.
        unsafe {
            command.pre_exec(move || {
                for fd in &inherit {
                    inheritable(*fd)?;
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to start guest {}", guest.display()))?;
        info!("guest {} started as pid {}", guest.display(), child.id());

        // The child holds its own copies now.
        drop(guests);

        Ok(Arc::new(Self {
            segment,
            registry: handler::registry(),
            channels: Mutex::new(hosts),
            threads: keep.threads,
            child: Mutex::new(Some(child)),
        }))
    }
}

impl Keep {
    pub(super) fn channels(&self) -> MutexGuard<'_, Vec<Channel<UnixStream>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn inheritable(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

impl backend::Keep for Keep {
    fn spawn(self: Arc<Self>) -> Result<Option<Box<dyn backend::Thread>>> {
        let channel = self.channels().pop();
        Ok(channel.map(|channel| {
            Box::new(Thread::new(self.clone(), channel)) as Box<dyn backend::Thread>
        }))
    }

    fn shutdown(&self, status: i32) -> Result<i32> {
        let channels = mem::take(&mut *self.channels());
        if channels.len() != self.threads {
            let busy = self.threads - channels.len();
            self.channels().extend(channels);
            bail!("{busy} keep threads are still in use");
        }

        let handler = handler::Handler::new(&self.segment, &self.registry);
        for mut channel in channels {
            let request = Request::function(Function::Terminate, &[status as u32 as u64]);
            let response = channel
                .call(request, |_, nested| handler.handle(nested))
                .context("guest thread did not acknowledge termination")?;
            response
                .into_result()
                .map_err(|e| anyhow!("guest refused to terminate: {e}"))?;
        }

        let mut child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| anyhow!("keep was already shut down"))?;
        let exit = child.wait().context("failed to wait for guest")?;
        debug!(
            "guest exited: {exit}, {} segment bytes still allocated",
            self.segment.used()
        );

        exit.code()
            .ok_or_else(|| anyhow!("guest was terminated by a signal: {exit}"))
    }
}

impl Drop for Keep {
    fn drop(&mut self) {
        let child = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut child) = child.take() {
            warn!("killing guest pid {}", child.id());
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
