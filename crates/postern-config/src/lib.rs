// SPDX-License-Identifier: Apache-2.0

//! Configuration for a postern keep
//!
//! A keep is read from a TOML file shaped like [`CONFIG_TEMPLATE`]. Every key
//! is optional.
//!
//! ```
//! use postern_config::Config;
//!
//! let config: Config = toml::from_str("[keep]\nthreads = 4").unwrap();
//! assert_eq!(config.keep.threads, 4);
//! assert!(config.validate().is_ok());
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(rust_2018_idioms)]

use std::path::Path;
use std::{fs, io};

use serde::{Deserialize, Serialize};

/// Configuration file template
pub const CONFIG_TEMPLATE: &str = r#"## Configuration for a postern keep

[keep]
## Worker threads, each with its own host channel
# threads = 1

## Pages of private heap, also the protected region
# heap_pages = 256

## Pages of stack per worker thread
# stack_pages = 64

## Pages of host-visible memory shared with the guest
# shared_pages = 64
"#;

const fn default_threads() -> usize {
    1
}

const fn default_heap_pages() -> usize {
    256
}

const fn default_stack_pages() -> usize {
    64
}

const fn default_shared_pages() -> usize {
    64
}

/// Errors reading a configuration
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The file could not be read
    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),

    /// The file is not valid TOML for a [`Config`]
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range
    #[error("invalid value for `{0}`: {1}")]
    Invalid(&'static str, String),
}

/// The configuration of a keep
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Sizing of the guest process
    #[serde(default)]
    pub keep: Keep,
}

/// Sizing of the guest process
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Keep {
    /// Worker threads, each with its own host channel
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Pages of private heap
    #[serde(default = "default_heap_pages")]
    pub heap_pages: usize,

    /// Pages of stack per worker thread
    #[serde(default = "default_stack_pages")]
    pub stack_pages: usize,

    /// Pages of host-visible memory shared with the guest
    #[serde(default = "default_shared_pages")]
    pub shared_pages: usize,
}

impl Default for Keep {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            heap_pages: default_heap_pages(),
            stack_pages: default_stack_pages(),
            shared_pages: default_shared_pages(),
        }
    }
}

impl Config {
    /// Reads and validates the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), Error> {
        let keep = &self.keep;
        for (name, value) in [
            ("threads", keep.threads),
            ("heap_pages", keep.heap_pages),
            ("stack_pages", keep.stack_pages),
            ("shared_pages", keep.shared_pages),
        ] {
            if value == 0 {
                return Err(Error::Invalid(name, "must not be zero".into()));
            }
        }
        Ok(())
    }
}
