// SPDX-License-Identifier: Apache-2.0

mod info;
mod log;
mod run;

use crate::backend::{Backend, BACKENDS};

use std::ops::Deref;

use anyhow::anyhow;
use clap::{Args, Parser, Subcommand};
use tracing::info;

/// Tool to run guests inside postern keeps
///
/// A keep hosts a guest whose functions the host calls through a validated
/// call record, and which may call back into the host the same way.
#[derive(Parser, Debug)]
#[command(version)]
pub struct Options {
    /// Logging options
    #[command(flatten)]
    logger: log::LogOptions,

    /// Subcommands (with their own options)
    #[command(subcommand)]
    cmd: Subcommands,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        self.logger.init();

        info!("logging initialized!");
        info!("CLI opts: {:?}", self);

        self.cmd.dispatch()
    }
}

/// `postern` subcommands and their options/arguments.
#[derive(Subcommand, Debug)]
enum Subcommands {
    Run(run::Options),
    Info(info::Options),
}

impl Subcommands {
    fn dispatch(self) -> anyhow::Result<()> {
        match self {
            Self::Run(cmd) => cmd.execute(),
            Self::Info(cmd) => cmd.display(),
        }
    }
}

/// Common backend options
#[derive(Args, Debug)]
pub struct BackendOptions {
    /// Set which backend to use
    #[arg(long, env = "POSTERN_BACKEND")]
    backend: Option<String>,
}

impl BackendOptions {
    pub fn pick(&self) -> anyhow::Result<&dyn Backend> {
        if let Some(ref name) = self.backend {
            BACKENDS
                .deref()
                .iter()
                .find(|b| b.have() && b.name() == name)
                .ok_or_else(|| anyhow!("Keep backend {:?} is unsupported.", name))
        } else {
            BACKENDS.deref().iter().find(|b| b.have()).ok_or_else(|| {
                anyhow!(
                    "No supported backend found. Please check your machine with `$ postern info`."
                )
            })
        }
        .map(|b| &**b)
    }
}
