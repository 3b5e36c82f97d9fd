// SPDX-License-Identifier: Apache-2.0

//! Host for postern keeps
//!
//! `postern run` starts a guest executable in a keep, calls one function of
//! its tables and prints what the function wrote. `postern info` reports
//! which backends this system supports.

#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

mod backend;
mod cli;

use clap::Parser;

fn main() -> anyhow::Result<()> {
    let app = cli::Options::parse();
    app.execute()
}
