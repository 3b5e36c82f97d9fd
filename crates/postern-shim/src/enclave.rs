// SPDX-License-Identifier: Apache-2.0

use crate::ecall::Boundary;
use crate::heap::Heap;

use postern_abi::addr::{Address, Region};
use postern_abi::call::Settings;
use postern_abi::table::Registry;

/// One enclave instance: its protected heap and its function tables
pub struct Enclave {
    heap: Heap,
    registry: Registry,
    shared: Option<Region>,
    settings: Settings,
}

impl Enclave {
    pub fn new(heap: Heap, registry: Registry) -> Self {
        let settings = Settings {
            heap_pages: (heap.region().len() / crate::heap::PAGE_SIZE) as u64,
            stack_pages: 0,
            threads: 1,
        };

        Self {
            heap,
            registry,
            shared: None,
            settings,
        }
    }

    /// Restricts untrusted memory to the host-visible segment `shared`.
    ///
    /// Without a segment, anything outside the protected region is untrusted.
    pub fn with_shared(mut self, shared: Region) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// The protected region
    #[inline]
    pub fn region(&self) -> Region {
        self.heap.region()
    }

    #[inline]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub fn settings(&self) -> Settings {
        self.settings
    }
}

impl Boundary for Enclave {
    fn admits(&self, ptr: Address, size: usize) -> bool {
        self.region().is_outside(ptr, size)
            && self.shared.map_or(true, |shared| shared.is_inside(ptr, size))
    }
}
