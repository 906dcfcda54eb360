//! The public allocator: routes sizes to bins, keeps the per-bin
//! rings of active chunks, and implements allocate / deallocate /
//! get_size / set_tag / get_tag on top of the segment/chunk space.
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

use std::ffi::c_void;
use std::ptr::NonNull;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_allocation_map;

use crate::binmap::Binmap;
use crate::config::{AllocatorConfig, BinConfig, SizePolicy};
use crate::fsa::{Fsa, Handle};
use crate::heap::Heap;
use crate::llist::LlHead;
use crate::mapper::get_mapper;
use crate::space::{ChunkRecord, Space};

/// Written into an element's tag slot on deallocation; reading it
/// back on a later deallocate flags a double free.
const TAG_FREE_POISON: u32 = 0xFEFE_EFEE;

/// `get_tag` result for the null pointer.
const TAG_NULL: u32 = 0xFFFF_FFFF;

/// Commit accounting across the allocator's three reservations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub live_allocations: usize,
    pub payload_reserved: usize,
    pub payload_committed: usize,
    pub metadata_reserved: usize,
    pub metadata_committed: usize,
}

/// One allocator instance: three private reservations (payload space,
/// bump heap, FSA) and the size-class router state.  Instances are
/// fully independent; the type is `Send` but deliberately not `Sync`
/// (the core is single-threaded).
pub struct Allocator {
    policy: SizePolicy,
    bins: &'static [BinConfig],
    heap: Heap,
    fsa: Fsa,
    space: Space,
    /// Per bin: circular list of chunks that are neither empty nor
    /// full.
    active_chunks: *mut LlHead,
    live_allocations: usize,
}

unsafe impl Send for Allocator {}

impl Allocator {
    /// Builds an allocator from `config`.  Returns `None` when any of
    /// the three reservations cannot be obtained.
    pub fn new(config: AllocatorConfig) -> Option<Allocator> {
        if cfg!(debug_assertions) {
            config.verify();
        }

        let mapper = get_mapper(config.mapper_name.as_deref()).ok()?;
        let mut heap = Heap::new(mapper, config.heap_range, config.heap_pre_commit)?;
        let mut fsa = Fsa::new(&mut heap, mapper, config.fsa_range, config.fsa_section_size)?;
        let space = Space::new(
            &mut heap,
            mapper,
            config.space_range,
            config.segment_shift,
            config.chunk_cache_watermark,
        )?;

        let bins = config.policy.bins();
        let active_chunks = heap.alloc_array::<LlHead>(bins.len())?.as_ptr();
        for i in 0..bins.len() {
            unsafe { std::ptr::write(active_chunks.add(i), LlHead::new()) };
        }

        Some(Allocator {
            policy: config.policy,
            bins,
            heap,
            fsa,
            space,
            active_chunks,
            live_allocations: 0,
        })
    }

    /// Attempts to allocate `size` bytes aligned to `align` (a power
    /// of two).  Returns `None` when the request exceeds the largest
    /// bin or the system is out of memory; failure leaves no partial
    /// state behind.
    #[requires(size >= 1)]
    #[requires(align > 0 && align & (align - 1) == 0, "align must be a power of 2")]
    #[ensures(ret.is_some() -> ret.unwrap().as_ptr() as usize % align == 0,
              "allocations are aligned as requested")]
    #[ensures(ret.is_some() ->
              debug_allocation_map::mark_allocated(&ret.unwrap()).is_ok(),
              "Successful allocations avoid double-allocation.")]
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<c_void>> {
        let size = size.max(1).checked_add(align - 1)? & !(align - 1);
        let bin_index = self.policy.bin_index(size)?;
        let bin = self.bins[bin_index];

        let head = unsafe { &mut *self.active_chunks.add(bin_index) };
        let (handle, record) = if head.is_nil() {
            let (handle, record) =
                self.space
                    .checkout_chunk(bin_index as u16, &bin, &mut self.fsa, &mut self.heap)?;
            head.insert(&self.fsa, handle.raw());
            (handle, record)
        } else {
            let handle = Handle::from_raw(head.index);
            let record = self
                .fsa
                .idx2ptr(handle)
                .expect("active chunks have a live record")
                .as_ptr() as *mut ChunkRecord;
            (handle, record)
        };

        debug_assert_eq!(unsafe { (*record).bin_index }, bin_index as u16);

        // Take a freed element if the binmap has one, else the next
        // untouched slot.
        let map = self
            .fsa
            .idx2ptr(unsafe { (*record).elem_free_map })
            .expect("active chunks have a free-element map")
            .as_ptr() as *mut Binmap;
        let element = match unsafe { (*map).find_and_set() } {
            Some(index) => index,
            None => {
                let index = unsafe { (*record).elem_free_index } as u32;
                debug_assert!(index < bin.max_alloc_count);
                if index % 32 == 0 {
                    unsafe { (*map).lazy_init(index) };
                }
                unsafe { (*record).elem_free_index += 1 };
                index
            }
        };

        let tags = self
            .fsa
            .idx2ptr(unsafe { (*record).elem_tags })
            .expect("active chunks have a tag array")
            .as_ptr() as *mut u32;
        unsafe { *tags.add(element as usize) = 0 };

        unsafe { (*record).elems_used += 1 };
        if unsafe { (*record).elems_used } as u32 == bin.max_alloc_count {
            // Full chunks leave the ring.
            head.remove(&self.fsa, handle.raw());
        }

        self.live_allocations += 1;
        let address =
            self.space.chunk_address(record) + element as usize * bin.alloc_size as usize;
        NonNull::new(address as *mut c_void)
    }

    /// Releases an allocation obtained from this instance.  `None` is
    /// a no-op.  Freeing a foreign pointer or freeing twice is a
    /// fatal assertion in debug builds.
    #[requires(ptr.is_none() ||
               debug_allocation_map::mark_released(&ptr.unwrap()).is_ok(),
               "Released pointers are live and not double-freed.")]
    pub fn deallocate(&mut self, ptr: Option<NonNull<c_void>>) {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return,
        };

        debug_assert!(
            self.space.contains(ptr.as_ptr()),
            "pointer is outside the payload range"
        );
        let (handle, record) = self
            .space
            .address_to_chunk(ptr.as_ptr(), &self.fsa)
            .expect("pointer maps to a live chunk");
        let bin_index = unsafe { (*record).bin_index } as usize;
        let bin = self.bins[bin_index];

        let chunk_address = self.space.chunk_address(record);
        let element = (ptr.as_ptr() as usize - chunk_address) / bin.alloc_size as usize;
        debug_assert!((element as u32) < bin.max_alloc_count);

        // The poison check must precede any state change.
        let tags = self
            .fsa
            .idx2ptr(unsafe { (*record).elem_tags })
            .expect("live chunks have a tag array")
            .as_ptr() as *mut u32;
        debug_assert!(
            unsafe { *tags.add(element) } != TAG_FREE_POISON,
            "double free"
        );
        unsafe { *tags.add(element) = TAG_FREE_POISON };

        let map = self
            .fsa
            .idx2ptr(unsafe { (*record).elem_free_map })
            .expect("live chunks have a free-element map")
            .as_ptr() as *mut Binmap;
        unsafe { (*map).clr(element as u32) };

        let was_full = unsafe { (*record).elems_used } as u32 == bin.max_alloc_count;
        unsafe { (*record).elems_used -= 1 };
        self.live_allocations -= 1;

        let head = unsafe { &mut *self.active_chunks.add(bin_index) };
        if unsafe { (*record).elems_used } == 0 {
            if !was_full {
                head.remove(&self.fsa, handle.raw());
            }
            self.space.release_chunk(handle, &mut self.fsa);
        } else if was_full {
            // Partial again: rejoin the ring.
            head.insert(&self.fsa, handle.raw());
        }
    }

    /// Returns the slot size backing `ptr` (the bin's allocation
    /// size), or 0 for `None`.
    pub fn get_size(&self, ptr: Option<NonNull<c_void>>) -> usize {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return 0,
        };

        debug_assert!(self.space.contains(ptr.as_ptr()));
        let (_, record) = self
            .space
            .address_to_chunk(ptr.as_ptr(), &self.fsa)
            .expect("pointer maps to a live chunk");
        self.bins[unsafe { (*record).bin_index } as usize].alloc_size as usize
    }

    fn tag_slot(&self, ptr: NonNull<c_void>) -> *mut u32 {
        debug_assert!(self.space.contains(ptr.as_ptr()));
        let (_, record) = self
            .space
            .address_to_chunk(ptr.as_ptr(), &self.fsa)
            .expect("pointer maps to a live chunk");
        let bin = self.bins[unsafe { (*record).bin_index } as usize];

        let chunk_address = self.space.chunk_address(record);
        let element = (ptr.as_ptr() as usize - chunk_address) / bin.alloc_size as usize;
        debug_assert!((element as u32) < bin.max_alloc_count);

        let tags = self
            .fsa
            .idx2ptr(unsafe { (*record).elem_tags })
            .expect("live chunks have a tag array")
            .as_ptr() as *mut u32;
        unsafe { tags.add(element) }
    }

    /// Stores a 32-bit annotation for the allocation at `ptr`.
    #[requires(debug_allocation_map::is_live(&ptr).is_ok(),
               "Tags can only be set on live allocations.")]
    pub fn set_tag(&mut self, ptr: NonNull<c_void>, tag: u32) {
        unsafe { *self.tag_slot(ptr) = tag };
    }

    /// Reads the annotation for `ptr`; `TAG_NULL` for `None`.
    pub fn get_tag(&self, ptr: Option<NonNull<c_void>>) -> u32 {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return TAG_NULL,
        };

        let tag = unsafe { *self.tag_slot(ptr) };
        debug_assert!(tag != TAG_FREE_POISON, "tag read on a freed element");
        tag
    }

    /// Drains the chunk caches and releases empty segments, handing
    /// their pages back to the OS.  A no-op when the cache watermark
    /// is zero.
    pub fn trim(&mut self) {
        self.space.trim(&mut self.fsa);
    }

    pub fn stats(&self) -> Stats {
        Stats {
            live_allocations: self.live_allocations,
            payload_reserved: self.space.reserved_bytes(),
            payload_committed: self.space.committed_bytes(),
            metadata_reserved: self.heap.reserved_bytes() + self.fsa.reserved_bytes(),
            metadata_committed: self.heap.committed_bytes() + self.fsa.committed_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MB;
    use proptest::collection::vec;
    use proptest::prelude::*;

    fn default_allocator() -> Allocator {
        Allocator::new(AllocatorConfig::default()).expect("reservations should succeed")
    }

    #[test]
    fn tiny_roundtrip() {
        let mut alloc = default_allocator();

        let p = alloc.allocate(10, 1).expect("allocate should succeed");
        assert_eq!(alloc.get_size(Some(p)), 16);
        assert_eq!(alloc.stats().live_allocations, 1);
        assert!(alloc.stats().payload_committed > 0);

        alloc.deallocate(Some(p));
        assert_eq!(alloc.stats().live_allocations, 0);
        assert_eq!(alloc.stats().payload_committed, 0);
    }

    #[test]
    fn null_pointer_conventions() {
        let mut alloc = default_allocator();

        alloc.deallocate(None);
        assert_eq!(alloc.get_size(None), 0);
        assert_eq!(alloc.get_tag(None), 0xFFFF_FFFF);
    }

    #[test]
    fn oversized_requests_fail_cleanly() {
        let mut alloc = default_allocator();

        assert!(alloc.allocate(600 << 20, 1).is_none());
        assert_eq!(alloc.stats().live_allocations, 0);
        assert_eq!(alloc.stats().payload_committed, 0);
    }

    #[test]
    fn fill_a_chunk() {
        let mut alloc = default_allocator();

        // 8-byte requests ride the 16-byte bin: 4096 elements fill
        // one 64 KiB chunk.
        let per_chunk = 4096;
        let mut ptrs = Vec::new();
        for _ in 0..per_chunk {
            ptrs.push(alloc.allocate(8, 1).expect("allocate should succeed"));
        }

        let chunk_of = |p: NonNull<c_void>| p.as_ptr() as usize >> 16;
        assert!(ptrs[1..].iter().all(|p| chunk_of(*p) == chunk_of(ptrs[0])));

        // One more lands in a second chunk.
        let extra = alloc.allocate(8, 1).expect("allocate should succeed");
        assert_ne!(chunk_of(extra), chunk_of(ptrs[0]));

        // Freeing everything returns both chunks to the segment.
        alloc.deallocate(Some(extra));
        for p in ptrs {
            alloc.deallocate(Some(p));
        }
        assert_eq!(alloc.stats().payload_committed, 0);
    }

    #[test]
    fn refill_a_full_chunk() {
        let mut alloc = default_allocator();

        let mut ptrs = Vec::new();
        for _ in 0..4096 {
            ptrs.push(alloc.allocate(16, 1).expect("allocate should succeed"));
        }

        // The chunk is full and off the ring; freeing one element
        // relinks it, and the freed slot serves the next allocation.
        let freed = ptrs.pop().unwrap();
        alloc.deallocate(Some(freed));
        let again = alloc.allocate(16, 1).expect("allocate should succeed");
        assert_eq!(again, freed);

        alloc.deallocate(Some(again));
        for p in ptrs {
            alloc.deallocate(Some(p));
        }
    }

    #[test]
    fn tagging() {
        let mut alloc = default_allocator();

        let mut ptrs = Vec::new();
        for i in 0..10usize {
            let p = alloc
                .allocate(8 << i, 1)
                .expect("allocate should succeed");
            alloc.set_tag(p, (i as u32).wrapping_mul(0x0102_0304));
            ptrs.push(p);
        }

        // Interleave other allocations, then read every tag back.
        let noise: Vec<_> = (0..64)
            .map(|_| alloc.allocate(24, 1).expect("allocate should succeed"))
            .collect();

        for (i, p) in ptrs.iter().enumerate() {
            assert_eq!(
                alloc.get_tag(Some(*p)),
                (i as u32).wrapping_mul(0x0102_0304)
            );
        }

        // Fresh allocations start with a zero tag.
        assert!(noise.iter().all(|p| alloc.get_tag(Some(*p)) == 0));

        for p in ptrs.into_iter().chain(noise) {
            alloc.deallocate(Some(p));
        }
    }

    #[test]
    fn large_allocation() {
        let mut alloc = default_allocator();

        let p = alloc.allocate(32 << 20, 1).expect("allocate should succeed");
        assert_eq!(alloc.get_size(Some(p)), (32 * MB) as usize);
        assert_eq!(alloc.stats().payload_committed, 32 << 20);

        unsafe {
            std::ptr::write(p.as_ptr() as *mut u8, 0x5A);
            std::ptr::write((p.as_ptr() as *mut u8).add((32 << 20) - 1), 0x5A);
        }

        alloc.deallocate(Some(p));
        assert_eq!(alloc.stats().payload_committed, 0);

        // Reallocating the class recommits the same amount: no
        // residual growth.
        let q = alloc.allocate(32 << 20, 1).expect("allocate should succeed");
        assert_eq!(alloc.stats().payload_committed, 32 << 20);
        alloc.deallocate(Some(q));
        assert_eq!(alloc.stats().payload_committed, 0);
    }

    #[test]
    fn alloc_dealloc_does_not_grow_commit() {
        let mut alloc = default_allocator();

        let p = alloc.allocate(100, 1).expect("allocate should succeed");
        let peak = alloc.stats().payload_committed;
        alloc.deallocate(Some(p));

        for _ in 0..100 {
            let p = alloc.allocate(100, 1).expect("allocate should succeed");
            assert_eq!(alloc.stats().payload_committed, peak);
            alloc.deallocate(Some(p));
        }
    }

    #[test]
    fn chunk_cache_watermark() {
        let mut alloc = Allocator::new(AllocatorConfig {
            chunk_cache_watermark: 1,
            ..AllocatorConfig::default()
        })
        .expect("reservations should succeed");

        let p = alloc.allocate(100, 1).expect("allocate should succeed");
        let peak = alloc.stats().payload_committed;

        // The chunk stays committed in the segment's cache...
        alloc.deallocate(Some(p));
        assert_eq!(alloc.stats().payload_committed, peak);

        // ...and the next checkout reuses it as-is.
        let q = alloc.allocate(100, 1).expect("allocate should succeed");
        assert_eq!(alloc.stats().payload_committed, peak);
        alloc.deallocate(Some(q));

        // A different bin of the same chunk class also reuses the
        // cached pages, adjusting the commit.
        let r = alloc.allocate(40, 1).expect("allocate should succeed");
        assert!(alloc.stats().payload_committed <= peak);
        alloc.deallocate(Some(r));

        // Trim drains the cache and releases the segment.
        alloc.trim();
        assert_eq!(alloc.stats().payload_committed, 0);
    }

    #[test]
    fn ten_percent_policy() {
        let mut alloc = Allocator::new(AllocatorConfig {
            policy: SizePolicy::TenPercent,
            ..AllocatorConfig::default()
        })
        .expect("reservations should succeed");

        let p = alloc.allocate(8, 1).expect("allocate should succeed");
        assert_eq!(alloc.get_size(Some(p)), 8);
        let q = alloc.allocate(17, 1).expect("allocate should succeed");
        assert_eq!(alloc.get_size(Some(q)), 24);

        alloc.deallocate(Some(p));
        alloc.deallocate(Some(q));
        assert_eq!(alloc.stats().payload_committed, 0);
    }

    /// Delegates to the real mapper but fails `commit` while armed.
    #[derive(Debug)]
    struct FlakyMapper {
        fail_commits: std::sync::atomic::AtomicBool,
    }

    #[contract_trait]
    impl crate::mapper::Mapper for FlakyMapper {
        fn page_size(&self) -> usize {
            crate::map::page_size()
        }

        fn reserve(&self, size: usize) -> Result<NonNull<c_void>, i32> {
            crate::map::reserve_region(size)
        }

        fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
            if self.fail_commits.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(libc::ENOMEM);
            }
            crate::map::commit_region(base, size)
        }

        fn decommit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
            crate::map::decommit_region(base, size)
        }

        fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
            crate::map::release_region(base, size)
        }
    }

    #[test]
    fn commit_failure_leaves_no_partial_state() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let mapper: &'static FlakyMapper = Box::leak(Box::new(FlakyMapper {
            fail_commits: AtomicBool::new(false),
        }));
        crate::mapper::register_mapper("flaky".to_string(), mapper);

        let mut alloc = Allocator::new(AllocatorConfig {
            mapper_name: Some("flaky".to_string()),
            ..AllocatorConfig::default()
        })
        .expect("reservations should succeed");

        // Warm up one small class so the failures below hit the
        // payload commit path, not metadata bootstrap.
        let warm = alloc.allocate(16, 1).expect("allocate should succeed");
        let baseline = alloc.stats();

        // Out of physical pages: allocate fails cleanly and restores
        // the space's state.
        mapper.fail_commits.store(true, Ordering::Relaxed);
        assert!(alloc.allocate(32 << 20, 1).is_none());

        mapper.fail_commits.store(false, Ordering::Relaxed);
        assert_eq!(alloc.stats(), baseline);

        // Once pages are available again the same request succeeds.
        let big = alloc.allocate(32 << 20, 1).expect("allocate should succeed");
        alloc.deallocate(Some(big));
        alloc.deallocate(Some(warm));
        assert_eq!(alloc.stats().payload_committed, 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn double_free_trap() {
        let mut alloc = default_allocator();

        let p = alloc.allocate(32, 1).expect("allocate should succeed");
        alloc.deallocate(Some(p));
        alloc.deallocate(Some(p));
    }

    proptest! {
        // Random mix of operations; every pointer distinct, sizes
        // honoured, commit returns to zero at the end.
        #[test]
        fn many_sizes_stress(ops in vec((8usize..=1024, proptest::bool::ANY), 1..400)) {
            use std::collections::HashMap;

            let mut alloc = default_allocator();
            let mut live: HashMap<usize, usize> = HashMap::new();

            for (size, dealloc) in ops {
                if dealloc && !live.is_empty() {
                    let addr = *live.keys().next().unwrap();
                    let expected = live.remove(&addr).unwrap();
                    let ptr = NonNull::new(addr as *mut c_void).unwrap();
                    prop_assert!(alloc.get_size(Some(ptr)) >= expected);
                    alloc.deallocate(Some(ptr));
                } else {
                    let ptr = alloc.allocate(size, 1).expect("allocate should succeed");
                    prop_assert!(alloc.get_size(Some(ptr)) >= size);
                    prop_assert!(live.insert(ptr.as_ptr() as usize, size).is_none(),
                                 "allocations must be distinct");
                }

                prop_assert_eq!(alloc.stats().live_allocations, live.len());
            }

            for (addr, _) in live {
                alloc.deallocate(Some(NonNull::new(addr as *mut c_void).unwrap()));
            }
            prop_assert_eq!(alloc.stats().live_allocations, 0);
            prop_assert_eq!(alloc.stats().payload_committed, 0);
        }

        // The returned address honours any power-of-two alignment
        // that fits the slot.
        #[test]
        fn alignment(size in 1usize..=65536, align_shift in 0u32..=12) {
            let mut alloc = default_allocator();
            let align = 1usize << align_shift;

            let ptr = alloc.allocate(size, align).expect("allocate should succeed");
            prop_assert_eq!(ptr.as_ptr() as usize % align, 0);
            prop_assert!(alloc.get_size(Some(ptr)) >= size);
            alloc.deallocate(Some(ptr));
        }
    }
}
