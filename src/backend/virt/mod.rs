// SPDX-License-Identifier: Apache-2.0

//! The virtual boundary backend
//!
//! The guest runs as a child process. It maps a host-provided memfd segment
//! at the host's address and talks to the host over one socket per thread.
//! There is no hardware isolation: the separate address space is the
//! boundary.

mod handler;
mod keep;
mod segment;
mod thread;

pub use keep::Keep;

use crate::backend::{self, Datum};

use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use postern_config::Config;

fn memfd() -> Datum {
    let segment = segment::SharedSegment::new(1);

    Datum {
        name: "Shared memory".into(),
        pass: segment.is_ok(),
        info: Some("memfd_create".into()),
        mesg: segment
            .err()
            .map(|e| format!("Unable to create a shared segment: {e}")),
    }
}

fn sockets() -> Datum {
    let pair = UnixStream::pair();

    Datum {
        name: "Channels".into(),
        pass: pair.is_ok(),
        info: Some("AF_UNIX socketpair".into()),
        mesg: pair
            .err()
            .map(|e| format!("Unable to create a socket pair: {e}")),
    }
}

pub struct Backend;

impl backend::Backend for Backend {
    #[inline]
    fn name(&self) -> &'static str {
        "virt"
    }

    fn data(&self) -> Vec<Datum> {
        vec![memfd(), sockets()]
    }

    fn keep(&self, config: &Config, guest: &Path) -> Result<Arc<dyn backend::Keep>> {
        Ok(Keep::launch(config, guest)?)
    }
}
