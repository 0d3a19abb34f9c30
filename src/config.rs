//! Configuration and allocation profiling for the heap coordinator.

use crate::error::{Error, Result};

/// Configuration for the heap coordinator. Immutable after startup.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Initial committed heap size (bytes).
    pub starting_size: usize,
    /// Hard upper bound on the heap footprint (bytes).
    pub maximum_size: usize,
    /// Soft upper bound the heap may grow to on demand (bytes). A value of
    /// `0` means the growth limit equals `maximum_size`.
    pub growth_limit: usize,
    /// Allocated-byte threshold past which a concurrent collection is
    /// requested after a successful allocation. A value of `0` disables the
    /// automatic trigger; an embedder can still call
    /// [`request_concurrent_gc`](crate::GcHeap::request_concurrent_gc).
    pub concurrent_start: usize,
    /// Verify roots and the live bitmap before each collection.
    pub pre_verify: bool,
    /// Verify the heap after each collection.
    pub post_verify: bool,
    /// Verify the card table before re-scanning dirty cards.
    pub verify_card_table: bool,
    /// Count allocations and failed allocations per heap.
    pub alloc_prof_enabled: bool,
}

impl Default for Configuration {
    /// Creates a default configuration:
    /// - `starting_size` of 2MB
    /// - `maximum_size` of 16MB
    /// - `growth_limit` of `0` (equal to `maximum_size`)
    /// - automatic concurrent trigger disabled
    /// - all verification and profiling off
    fn default() -> Self {
        Self {
            starting_size: 2 * 1024 * 1024,
            maximum_size: 16 * 1024 * 1024,
            growth_limit: 0,
            concurrent_start: 0,
            pre_verify: false,
            post_verify: false,
            verify_card_table: false,
            alloc_prof_enabled: false,
        }
    }
}

impl Configuration {
    /// Validates the configuration and resolves the growth limit, returning
    /// the configuration the heap actually runs with.
    ///
    /// # Errors
    ///
    /// Returns an error if any size is zero or the sizes are not ordered
    /// `starting_size <= growth_limit <= maximum_size`.
    pub(crate) fn resolved(mut self) -> Result<Self> {
        if self.starting_size == 0 {
            return Err(Error::Configuration("starting size is zero".to_string()));
        }
        if self.maximum_size == 0 {
            return Err(Error::Configuration("maximum size is zero".to_string()));
        }
        if self.starting_size > self.maximum_size {
            return Err(Error::Configuration(format!(
                "starting size {} exceeds maximum size {}",
                self.starting_size, self.maximum_size
            )));
        }
        if self.growth_limit == 0 {
            self.growth_limit = self.maximum_size;
        }
        if self.growth_limit > self.maximum_size {
            return Err(Error::Configuration(format!(
                "growth limit {} exceeds maximum size {}",
                self.growth_limit, self.maximum_size
            )));
        }
        if self.growth_limit < self.starting_size {
            return Err(Error::Configuration(format!(
                "growth limit {} is below starting size {}",
                self.growth_limit, self.starting_size
            )));
        }
        Ok(self)
    }
}

/// Allocation counters maintained under the heap lock when
/// `alloc_prof_enabled` is set.
#[derive(Clone, Debug, Default)]
pub struct AllocationProfile {
    pub allocations: usize,
    pub allocated_bytes: usize,
    pub failed_allocations: usize,
    pub failed_bytes: usize,
}
