//! Object references and allocation flags.

use bitflags::bitflags;
use std::fmt;

/// Alignment of every user-visible object pointer, in bytes.
pub const OBJECT_ALIGNMENT: usize = 8;

/// An opaque reference to a managed object.
///
/// The coordinator never dereferences object storage; an `ObjectRef` is a
/// chunk identifier understood by the heap source. Queues and tables store
/// these identifiers rather than borrowed references, so the coordinator and
/// the heap source never hold pointers into each other.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectRef(usize);

impl ObjectRef {
    /// Creates an object reference from a raw chunk address.
    #[must_use]
    pub const fn from_address(address: usize) -> Self {
        Self(address)
    }

    /// Returns the raw chunk address.
    #[must_use]
    pub const fn address(self) -> usize {
        self.0
    }

    /// Returns `true` if the reference is the null address.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if the address satisfies the object alignment that all
    /// user-visible pointers carry.
    #[must_use]
    pub const fn is_aligned(self) -> bool {
        self.0 % OBJECT_ALIGNMENT == 0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

bitflags! {
    /// Flags accepted by [`GcHeap::alloc`](crate::GcHeap::alloc).
    ///
    /// Multiple flags can be combined with bitwise OR.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct AllocFlags: u32 {
        /// The object's class overrides finalization; the allocator records
        /// it so the collector can hand it to the finalizer worker when it
        /// becomes unreachable.
        const FINALIZABLE = 0x0001;
        /// Skip the tracked-allocation insertion after the heap lock is
        /// released. Used when the object is immediately reachable from the
        /// root set, or when the allocating thread is not yet on the thread
        /// list and has no tracked-allocation table.
        const DONT_TRACK = 0x0002;
    }
}
