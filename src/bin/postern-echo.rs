// SPDX-License-Identifier: Apache-2.0

//! A guest for `postern run`
//!
//! Its default table holds:
//!
//! 0. echo: returns its input
//! 1. shout: returns its input upper-cased by the host
//! 2. whoami: returns the host's pid and the user id, both asked of the host

#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

use std::io::Write;

use postern_abi::call::{write_status, STATUS_SIZE};
use postern_abi::table::{EntryPoint, Registry};
use postern_abi::Status;
use postern_shim::guest::{self, Runtime};

/// Host function upper-casing its input
const HOST_UPPERCASE: u64 = 0;

/// The input without the zero padding of its buffer
fn text(input: &[u8]) -> &[u8] {
    let len = input.iter().rposition(|b| *b != 0).map_or(0, |last| last + 1);
    &input[..len]
}

/// Writes `payload` after an [`Status::Ok`] status.
fn reply(output: &mut [u8], payload: &[u8], written: &mut usize) {
    let room = output.len().saturating_sub(STATUS_SIZE);
    if payload.len() > room {
        write_status(output, Status::OutOfMemory);
        *written = STATUS_SIZE;
        return;
    }

    write_status(output, Status::Ok);
    output[STATUS_SIZE..][..payload.len()].copy_from_slice(payload);
    *written = STATUS_SIZE + payload.len();
}

fn echo(input: &[u8], output: &mut [u8], written: &mut usize) {
    reply(output, text(input), written)
}

fn shout(input: &[u8], output: &mut [u8], written: &mut usize) {
    let text = text(input);
    let mut upper = vec![0u8; STATUS_SIZE + text.len()];

    // The host needs a non-empty input.
    let mut request = text.to_vec();
    request.push(0);

    match guest::call_host_default(HOST_UPPERCASE, &request, &mut upper) {
        Ok(len) => reply(output, &upper[STATUS_SIZE..len], written),
        Err(e) => {
            log::error!("host call failed: {e}");
            write_status(output, e.into());
            *written = STATUS_SIZE;
        }
    }
}

fn whoami(_: &[u8], output: &mut [u8], written: &mut usize) {
    let ppid = guest::syscall(libc::SYS_getppid, [0; 6]);
    let uid = guest::syscall(libc::SYS_getuid, [0; 6]);

    match (ppid, uid) {
        (Ok(ppid), Ok(uid)) => {
            let mut payload = Vec::new();
            let _ = write!(payload, "ppid={ppid} uid={uid}");
            reply(output, &payload, written)
        }
        (Err(e), _) | (_, Err(e)) => {
            write_status(output, e.into());
            *written = STATUS_SIZE;
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env("POSTERN_LOG").init();

    let table: Vec<Option<EntryPoint>> = vec![Some(echo), Some(shout), Some(whoami)];
    let status = Runtime::from_env()?.run(Registry::new(table))?;

    std::process::exit(status)
}
