// SPDX-License-Identifier: Apache-2.0

//! The protected side of a postern enclave
//!
//! An [`Enclave`] owns the private [`Heap`](heap::Heap) whose address range is
//! the protected [`Region`](postern_abi::addr::Region), and the
//! [`Registry`](postern_abi::table::Registry) of function tables the host may
//! call into. [`ecall::dispatch`] serves one inbound call and
//! [`ocall::call_host`] performs one outbound call.
//!
//! The [`guest`] module runs an enclave as a separate OS process connected to
//! the host over per-thread sockets.

#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod arena;
pub mod ecall;
pub mod guest;
pub mod heap;
pub mod ocall;

mod enclave;

pub use enclave::Enclave;
