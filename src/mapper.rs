//! A `Mapper` is responsible for acquiring address space and backing
//! memory from the operating system.  The allocator's reservations
//! (payload space, bump heap, fixed-size arena) are each parameterised
//! on such a `Mapper`.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_arange_map;

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait Mapper: std::fmt::Debug + Sync {
    /// Returns the mapping granularity for this mapper.  All calls
    /// into the mapper align addresses and sizes to that page size.
    ///
    /// The page size must be constant for the lifetime of a process.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Attempts to reserve a range of address space of `size` bytes.
    /// On success, returns the address of the first byte in the
    /// reserved range.  The pages are inaccessible until committed.
    #[requires(size > 0)]
    #[requires(size % self.page_size() == 0)]
    #[ensures(ret.is_ok() ->
              debug_arange_map::reserve_range(ret.unwrap().as_ptr() as usize, size).is_ok())]
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().as_ptr() as usize % self.page_size() == 0,
              "The reserved range is page-aligned")]
    #[ensures(ret.is_ok() -> size < usize::MAX - ret.as_ref().unwrap().as_ptr() as usize,
              "The reserved range never overflows")]
    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32>;

    /// Backs a page-aligned range with zero-filled memory.  The range
    /// is always a subset of a range returned by a single `reserve`
    /// call on this mapper.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    #[requires(debug_arange_map::in_reserved_range(base.as_ptr() as usize, size).is_ok())]
    #[ensures(ret.is_ok() ->
              debug_arange_map::mark_committed(base.as_ptr() as usize, size).is_ok())]
    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;

    /// Returns the backing memory of a page-aligned committed range
    /// to the operating system.  The address range itself remains
    /// reserved, and a later `commit` yields fresh zero-filled pages.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    #[requires(debug_arange_map::in_reserved_range(base.as_ptr() as usize, size).is_ok())]
    #[ensures(ret.is_ok() ->
              debug_arange_map::mark_decommitted(base.as_ptr() as usize, size).is_ok())]
    fn decommit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;

    /// Releases a whole range previously obtained with a single call
    /// to `reserve`.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    #[requires(debug_arange_map::releasable_range(base.as_ptr() as usize, size).is_ok())]
    #[ensures(ret.is_ok() ->
              debug_arange_map::release_range(base.as_ptr() as usize, size).is_ok())]
    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;
}

#[derive(Debug)]
struct DefaultMapper {}

lazy_static::lazy_static! {
    static ref NAMED_MAPPERS: Mutex<HashMap<String, &'static dyn Mapper>> = {
        let mut map: HashMap<String, &'static dyn Mapper> = HashMap::new();

        map.insert("file".to_string(), Box::leak(Box::new(crate::file_backed_mapper::FileBackedMapper{})));
        Mutex::new(map)
    };
}

/// Upserts the mapper associated with `name`.
pub fn register_mapper(name: String, mapper: &'static dyn Mapper) {
    let mut mappers = NAMED_MAPPERS.lock().unwrap();

    mappers.insert(name, mapper);
}

/// Returns the mapper for the given `name`, if one exists, or the
/// default mapper if `name` is `None`.
///
/// # Errors
///
/// Returns `Err` if no such mapper is defined.
pub fn get_mapper(name: Option<&str>) -> Result<&'static dyn Mapper, &'static str> {
    lazy_static::lazy_static! {
        static ref DEFAULT_MAPPER: DefaultMapper = DefaultMapper{};
    }

    match name {
        Some(key) => {
            let mappers = NAMED_MAPPERS.lock().unwrap();

            Ok(*mappers.get(key).ok_or("Mapper not found")?)
        }
        None => Ok(&*DEFAULT_MAPPER),
    }
}

#[contract_trait]
impl Mapper for DefaultMapper {
    fn page_size(&self) -> usize {
        crate::map::page_size()
    }

    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32> {
        crate::map::reserve_region(size)
    }

    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::commit_region(base, size)
    }

    fn decommit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::decommit_region(base, size)
    }

    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::release_region(base, size)
    }
}
