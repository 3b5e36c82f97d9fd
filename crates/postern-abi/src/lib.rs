// SPDX-License-Identifier: Apache-2.0

//! API for the postern enclave boundary
//!
//! `postern-abi` is the protocol crate shared by both sides of a postern
//! enclave: the untrusted host and the protected guest. A
//! [postern](https://en.wikipedia.org/wiki/Postern) is a small secondary gate
//! in a fortification, the only way in or out that is not the main entrance.
//!
//! # Mechanism of action
//!
//! Calls cross the boundary in two directions:
//!
//! * ECALL: the host asks the guest to run an entry point of a registered
//!   [function table](table::Registry).
//! * OCALL: the guest asks the host to run one of the host's entry points.
//!
//! Both directions describe the call with a [`CallArgs`](call::CallArgs)
//! record. The receiving side copies the record into memory it owns before
//! looking at a single field, and only then validates the buffers the record
//! points at against the protected [`Region`](addr::Region).
//!
//! # Frame format
//!
//! Requests and responses travel over a [transport](transport::Transport) as
//! fixed-size [frames](frame::Frame) of nine little-endian `u64` words:
//!
//! * `kind`: `u64` - `1` syscall request, `2` function request, `3` response
//! * `num`: `u64` - syscall number, function id, or response status
//! * `arg0` .. `arg5`: `u64` - request arguments
//! * `ret`: `u64` - the raw return value of a response
//!
//! Every request is answered by exactly one response on the same channel.
//! While a side waits for its response it may receive nested requests from
//! the peer, which it serves before it resumes waiting.

#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod addr;
pub mod call;
pub mod frame;
pub mod status;
pub mod syscall;
pub mod table;
pub mod transport;

pub use status::{Error, Result, Status};

/// The postern-abi version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
