// SPDX-License-Identifier: Apache-2.0

use crate::cli::BackendOptions;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{anyhow, ensure, Context};
use clap::Args;
use postern_abi::call::STATUS_SIZE;
use postern_abi::table::DEFAULT_TABLE;
use postern_config::Config;
use tracing::info;

const PING: u64 = 0x706f_7374_6572_6e00;

/// Run a guest inside a postern keep and call one of its functions.
#[derive(Args, Debug)]
pub struct Options {
    #[command(flatten)]
    pub backend: BackendOptions,

    /// Path of the keep configuration file
    #[arg(long, env = "POSTERN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Function table to call, the default table if unset
    #[arg(long)]
    pub table: Option<u64>,

    /// Function to call
    #[arg(long, default_value_t = 0)]
    pub function: u64,

    /// Input passed to the function
    #[arg(long, default_value = "")]
    pub input: String,

    /// Capacity of the output buffer in bytes
    #[arg(long, default_value_t = 4096)]
    pub output_size: usize,

    /// Path of the guest executable
    #[arg(value_name = "GUEST")]
    pub guest: PathBuf,
}

impl Options {
    pub fn execute(self) -> anyhow::Result<()> {
        let Self {
            backend,
            config,
            table,
            function,
            input,
            output_size,
            guest,
        } = self;

        ensure!(
            output_size >= STATUS_SIZE,
            "output buffer must hold at least {STATUS_SIZE} bytes"
        );

        let backend = backend.pick()?;
        let config = match config {
            Some(path) => Config::load(&path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => Config::default(),
        };

        let keep = backend.keep(&config, &guest)?;
        let mut thread = keep
            .clone()
            .spawn()?
            .ok_or_else(|| anyhow!("keep has no free thread"))?;

        ensure!(thread.ping(PING)? == PING, "guest answered ping incorrectly");
        let settings = thread.settings()?;
        info!(
            "keep ready: {} threads, {} heap pages, {} stack pages",
            settings.threads, settings.heap_pages, settings.stack_pages
        );

        let mut output = vec![0u8; output_size];
        let table = table.unwrap_or(DEFAULT_TABLE);
        let result = thread.ecall(table, function, input.as_bytes(), &mut output);

        drop(thread);
        let code = keep.shutdown(0)?;

        let written = result?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(&output[STATUS_SIZE..written])?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;

        std::process::exit(code);
    }
}
