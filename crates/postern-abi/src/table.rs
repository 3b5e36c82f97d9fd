// SPDX-License-Identifier: Apache-2.0

//! Function tables and their registry

use crate::status::{Error, Result};

use std::fmt;
use std::sync::Arc;

use spin::Mutex;

/// Number of function table slots in a [`Registry`]
pub const MAX_TABLES: usize = 64;

/// Table id selecting the registry's default table
pub const DEFAULT_TABLE: u64 = u64::MAX;

/// A callable entry point
///
/// The callee reads `input`, writes its [`Status`](crate::Status) into the
/// first [`STATUS_SIZE`](crate::call::STATUS_SIZE) bytes of `output`
/// followed by its results, and sets `bytes_written` to the number of output
/// bytes produced, status included.
pub type EntryPoint = fn(input: &[u8], output: &mut [u8], bytes_written: &mut usize);

/// An ordered, fixed-length sequence of entry points
///
/// `None` marks an unpopulated slot.
pub type FunctionTable = Arc<[Option<EntryPoint>]>;

const UNREGISTERED: Option<FunctionTable> = None;

/// A bounded set of function tables
///
/// Tables are indexed by table id in `[0, MAX_TABLES)` and may be replaced
/// but never removed. The [`DEFAULT_TABLE`] id resolves to the table given at
/// construction without taking the lock.
pub struct Registry {
    default: FunctionTable,
    tables: Mutex<[Option<FunctionTable>; MAX_TABLES]>,
}

impl Registry {
    /// Creates a registry with the given default table and no other tables.
    pub fn new(default: impl Into<FunctionTable>) -> Self {
        Self {
            default: default.into(),
            tables: Mutex::new([UNREGISTERED; MAX_TABLES]),
        }
    }

    /// Installs `entries` as table `table_id`, replacing any previous table.
    pub fn register(&self, table_id: u64, entries: impl Into<FunctionTable>) -> Result<()> {
        let slot = slot(table_id).ok_or(Error::InvalidParameter)?;
        let entries = entries.into();
        self.tables.lock()[slot] = Some(entries);
        Ok(())
    }

    /// Resolves `function_id` in table `table_id`.
    pub fn lookup(&self, table_id: u64, function_id: u64) -> Result<EntryPoint> {
        let table = if table_id == DEFAULT_TABLE {
            self.default.clone()
        } else {
            let slot = slot(table_id).ok_or(Error::NotFound)?;
            let tables = self.tables.lock();
            tables[slot].clone().ok_or(Error::NotFound)?
        };

        let index = usize::try_from(function_id).map_err(|_| Error::NotFound)?;
        table
            .get(index)
            .copied()
            .flatten()
            .ok_or(Error::NotFound)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Vec::<Option<EntryPoint>>::new())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<usize> = self
            .tables
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|_| i))
            .collect();

        f.debug_struct("Registry")
            .field("default", &self.default.len())
            .field("registered", &registered)
            .finish()
    }
}

fn slot(table_id: u64) -> Option<usize> {
    usize::try_from(table_id).ok().filter(|&i| i < MAX_TABLES)
}
