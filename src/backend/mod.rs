// SPDX-License-Identifier: Apache-2.0

pub mod virt;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use once_cell::sync::Lazy;
use postern_abi::call::Settings;
use postern_config::Config;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

pub trait Backend: Sync + Send {
    /// The name of the backend
    fn name(&self) -> &'static str;

    /// Whether or not the platform has support for this keep type
    fn have(&self) -> bool {
        !self.data().iter().fold(false, |e, d| e | !d.pass)
    }

    /// The tests that show platform support for the backend
    fn data(&self) -> Vec<Datum>;

    /// Create a keep instance running the guest executable at `guest`
    fn keep(&self, config: &Config, guest: &Path) -> Result<Arc<dyn Keep>>;
}

impl Serialize for dyn Backend {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut backend = serializer.serialize_struct("Backend", 2)?;
        backend.serialize_field("backend", self.name())?;
        backend.serialize_field("data", &self.data())?;
        backend.end()
    }
}

#[derive(Serialize)]
pub struct Datum {
    /// The name of this datum.
    pub name: String,

    /// Whether the datum indicates support for the platform or not.
    pub pass: bool,

    /// Short additional information to display to the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,

    /// Longer explanatory message on how to resolve problems.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesg: Option<String>,
}

pub trait Keep: Sync + Send {
    /// Creates a new thread in the keep.
    ///
    /// Returns `None` when every guest thread is already taken.
    fn spawn(self: Arc<Self>) -> Result<Option<Box<dyn Thread>>>;

    /// Asks every guest thread to terminate with `status` and waits for the
    /// guest to exit. All threads must have been dropped.
    fn shutdown(&self, status: i32) -> Result<i32>;
}

pub trait Thread {
    /// Calls function `function_id` of enclave table `table_id`.
    ///
    /// Returns the number of bytes written to `output`, status code included.
    fn ecall(&mut self, table_id: u64, function_id: u64, input: &[u8], output: &mut [u8])
        -> Result<usize>;

    /// Checks that the guest thread is responsive.
    fn ping(&mut self, value: u64) -> Result<u64>;

    /// Asks the guest for its sizing.
    fn settings(&mut self) -> Result<Settings>;
}

pub static BACKENDS: Lazy<Vec<Box<dyn Backend>>> = Lazy::new(|| vec![Box::new(virt::Backend)]);
