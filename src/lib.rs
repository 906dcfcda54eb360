//! Quarry is a segregated-size virtual-memory allocator: one large
//! reserved address range is carved into segments (one chunk-size
//! class each), chunks (one element-size class each) and elements
//! (user allocations).  All bookkeeping lives in a separate
//! side-metadata reservation and is addressed by compact 32-bit
//! handles, so payload pages never hold allocator state — freed
//! memory is never overwritten by internal metadata, and a stray
//! write into a payload page cannot corrupt the allocator.
//!
//! Allocation and deallocation are O(1): sizes route to bins through
//! a closed-form expression, free elements come off hierarchical
//! bitmaps whose find-first-free is a handful of bit scans, and a
//! pointer decomposes into its (segment, chunk, element) triple by
//! shifts alone.  Each allocation carries a 32-bit tag for debugging
//! or accounting.
//!
//! The core is single-threaded by design: an [`Allocator`] is `Send`
//! but not `Sync`, and a thread-safe layer is expected to keep one
//! instance per thread.
pub mod allocator;
pub mod binmap;
pub mod config;
pub mod file_backed_mapper;
pub mod fsa;
pub mod heap;
pub mod llist;
pub mod map;
pub mod mapper;
pub mod space;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_allocation_map;
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_arange_map;

pub use allocator::Allocator;
pub use allocator::Stats;
pub use config::AllocatorConfig;
pub use config::SizePolicy;
pub use file_backed_mapper::set_file_backed_slab_directory;
pub use mapper::register_mapper;
pub use mapper::Mapper;

// The address arithmetic and the 256 GiB default reservation assume a
// 64-bit address space.
static_assertions::const_assert_eq!(std::mem::size_of::<usize>(), 8);
