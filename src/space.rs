//! The segment/chunk space owns the payload address range.  A segment
//! is a fixed-size slice of that range dedicated to one chunk-size
//! class; a chunk is a run of pages inside a segment serving elements
//! of exactly one bin.  Exactly the pages a chunk needs are committed
//! at checkout and decommitted at release (or retained while the
//! chunk sits in its segment's cache).
//!
//! Pointers never carry metadata: a payload address decomposes into
//! (segment, chunk, element) by shifts alone, and every record lives
//! in the side-metadata region behind a compact handle.
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

use static_assertions::const_assert_eq;

use std::ffi::c_void;
use std::ptr::NonNull;

use crate::binmap::Binmap;
use crate::config::{BinConfig, ChunkConfig, CHUNK_CONFIGS};
use crate::fsa::{Fsa, Handle};
use crate::heap::Heap;
use crate::llist::LlNode;
use crate::mapper::Mapper;

/// Side-metadata record for one checked-out chunk: an FSA item, with
/// the list node first so the FSA can serve as node storage for the
/// per-bin rings.
#[repr(C)]
pub struct ChunkRecord {
    pub node: LlNode,
    pub segment_index: u16,
    pub bin_index: u16,
    pub chunk_index: u32,
    pub elems_used: u16,
    /// Elements at `[0, elem_free_index)` are governed by the binmap;
    /// the tail is implicitly free.
    pub elem_free_index: u16,
    /// Handle of the free-element binmap (a `Binmap` stored in the
    /// FSA; its level arrays are separate FSA items).
    pub elem_free_map: Handle,
    /// Handle of the `u32` tag array.
    pub elem_tags: Handle,
    /// Pages currently committed for this chunk.
    pub physical_pages: u32,
}

const_assert_eq!(std::mem::size_of::<ChunkRecord>(), 32);

/// Heap-resident record for one segment.
#[repr(C)]
struct Segment {
    segment_index: u32,
    chunk_config: ChunkConfig,
    chunks_free_index: u32,
    chunks_used: u32,
    chunks_cached: u32,
    chunks_max: u32,
    /// FSA array of raw chunk-record handles, `NIL` where untracked;
    /// null pointer while the segment is not checked out.
    chunks_handle: Handle,
    chunks_ptr: *mut u32,
    chunks_free_map: Binmap,
    chunks_cached_map: Binmap,
}

/// Rolls back FSA allocations when a multi-step checkout fails
/// partway.
struct Unwind {
    handles: [Handle; 8],
    len: usize,
}

impl Unwind {
    fn new() -> Unwind {
        Unwind {
            handles: [Handle::NIL; 8],
            len: 0,
        }
    }

    fn push(&mut self, handle: Handle) {
        self.handles[self.len] = handle;
        self.len += 1;
    }

    fn run(self, fsa: &mut Fsa) {
        for handle in &self.handles[..self.len] {
            fsa.deallocate(*handle);
        }
    }
}

/// Allocates the level arrays for a binmap over `count` bits out of
/// the FSA, recording them in `unwind`.
fn alloc_binmap_levels(
    fsa: &mut Fsa,
    heap: &mut Heap,
    count: u32,
    unwind: &mut Unwind,
) -> Option<[*mut u32; 3]> {
    let words = Binmap::level_words(count);
    let mut levels = [std::ptr::null_mut(); 3];
    for (l, &w) in words.iter().enumerate() {
        if w > 0 {
            let (handle, ptr) = fsa.allocate(heap, w as usize * 4)?;
            unwind.push(handle);
            levels[l] = ptr.as_ptr() as *mut u32;
        }
    }
    Some(levels)
}

pub struct Space {
    mapper: &'static dyn Mapper,
    base: NonNull<c_void>,
    range: usize,
    segment_shift: u32,
    page_shift: u32,
    segment_count: u32,
    segments: *mut Segment,
    segments_free_index: u32,
    segments_free_map: Binmap,
    /// Per chunk config: segments with at least one checkout-able
    /// chunk.
    active_segments: *mut Binmap,
    /// Empty chunks retained committed per segment.
    cache_watermark: u32,
    committed_pages: usize,
}

impl Space {
    pub fn new(
        heap: &mut Heap,
        mapper: &'static dyn Mapper,
        range: usize,
        segment_shift: u32,
        cache_watermark: u32,
    ) -> Option<Space> {
        debug_assert!(range.is_power_of_two());
        debug_assert!(range >> segment_shift >= 1);

        let page_size = mapper.page_size();
        let segment_count = (range >> segment_shift) as u32;

        let base = mapper.reserve(range).ok()?;

        let segments = heap.alloc_array::<Segment>(segment_count as usize)?.as_ptr();
        for i in 0..segment_count {
            unsafe {
                std::ptr::write(
                    segments.add(i as usize),
                    Segment {
                        segment_index: i,
                        chunk_config: CHUNK_CONFIGS[0],
                        chunks_free_index: 0,
                        chunks_used: 0,
                        chunks_cached: 0,
                        chunks_max: 0,
                        chunks_handle: Handle::NIL,
                        chunks_ptr: std::ptr::null_mut(),
                        chunks_free_map: Binmap::unattached(),
                        chunks_cached_map: Binmap::unattached(),
                    },
                );
            }
        }

        let words = Binmap::level_words(segment_count);
        let mut alloc_levels = |heap: &mut Heap| -> Option<[*mut u32; 3]> {
            let mut levels = [std::ptr::null_mut(); 3];
            for (l, &w) in words.iter().enumerate() {
                if w > 0 {
                    levels[l] = heap.alloc_array::<u32>(w as usize)?.as_ptr();
                }
            }
            Some(levels)
        };

        let segments_free_map =
            unsafe { Binmap::new_all_used_lazy(segment_count, alloc_levels(heap)?) };

        let active_segments = heap.alloc_array::<Binmap>(CHUNK_CONFIGS.len())?.as_ptr();
        for i in 0..CHUNK_CONFIGS.len() {
            let map = unsafe { Binmap::new_all_used(segment_count, alloc_levels(heap)?) };
            unsafe { std::ptr::write(active_segments.add(i), map) };
        }

        Some(Space {
            mapper,
            base,
            range,
            segment_shift,
            page_shift: page_size.trailing_zeros(),
            segment_count,
            segments,
            segments_free_index: 0,
            segments_free_map,
            active_segments,
            cache_watermark,
            committed_pages: 0,
        })
    }

    #[inline]
    fn segment(&self, index: usize) -> *mut Segment {
        debug_assert!(index < self.segment_count as usize);
        unsafe { self.segments.add(index) }
    }

    #[inline]
    fn active_map(&self, config: ChunkConfig) -> *mut Binmap {
        unsafe { self.active_segments.add(config.index as usize) }
    }

    /// Pages a chunk of `bin` must keep committed while in use.
    pub fn chunk_physical_pages(&self, bin: &BinConfig) -> u32 {
        let bytes = bin.alloc_size as u64 * bin.max_alloc_count as u64;
        ((bytes + (1u64 << self.page_shift) - 1) >> self.page_shift) as u32
    }

    /// Claims a free segment index for `config` and builds its chunk
    /// bookkeeping out of the FSA.  Segment pages are not committed
    /// here; commits are per-chunk.
    fn checkout_segment(
        &mut self,
        config: ChunkConfig,
        fsa: &mut Fsa,
        heap: &mut Heap,
    ) -> Option<u32> {
        let index = match self.segments_free_map.find_and_set() {
            Some(index) => index,
            None => {
                if self.segments_free_index < self.segment_count {
                    let index = self.segments_free_index;
                    self.segments_free_map.lazy_init(index);
                    self.segments_free_index += 1;
                    index
                } else {
                    return None;
                }
            }
        };

        let chunks_max = 1u32 << (self.segment_shift - config.shift as u32);
        let mut unwind = Unwind::new();

        let built = (|| {
            let (chunks_handle, chunks_ptr) = fsa.allocate(heap, chunks_max as usize * 4)?;
            unwind.push(chunks_handle);
            let chunks_ptr = chunks_ptr.as_ptr() as *mut u32;
            // NIL-fill so a stale pointer faults an assertion instead
            // of chasing garbage.
            for i in 0..chunks_max as usize {
                unsafe { std::ptr::write(chunks_ptr.add(i), Handle::NIL.raw()) };
            }

            let cached_levels = alloc_binmap_levels(fsa, heap, chunks_max, &mut unwind)?;
            let free_levels = alloc_binmap_levels(fsa, heap, chunks_max, &mut unwind)?;
            Some((chunks_handle, chunks_ptr, cached_levels, free_levels))
        })();

        let (chunks_handle, chunks_ptr, cached_levels, free_levels) = match built {
            Some(parts) => parts,
            None => {
                unwind.run(fsa);
                self.segments_free_map.clr(index);
                return None;
            }
        };

        let segment = unsafe { &mut *self.segment(index as usize) };
        segment.chunk_config = config;
        segment.chunks_free_index = 0;
        segment.chunks_used = 0;
        segment.chunks_cached = 0;
        segment.chunks_max = chunks_max;
        segment.chunks_handle = chunks_handle;
        segment.chunks_ptr = chunks_ptr;
        segment.chunks_cached_map = unsafe { Binmap::new_all_used_lazy(chunks_max, cached_levels) };
        segment.chunks_free_map = unsafe { Binmap::new_all_used_lazy(chunks_max, free_levels) };

        Some(index)
    }

    /// Builds fresh element metadata (free binmap, tag array) for
    /// `record` and points it at (`segment_index`, `chunk_index`).
    /// `physical_pages` is left untouched.
    fn activate_chunk(
        record: *mut ChunkRecord,
        bin_index: u16,
        bin: &BinConfig,
        segment_index: u16,
        chunk_index: u32,
        fsa: &mut Fsa,
        heap: &mut Heap,
    ) -> Option<()> {
        let mut unwind = Unwind::new();

        let built = (|| {
            let (tags, _) = fsa.allocate(heap, bin.max_alloc_count as usize * 4)?;
            unwind.push(tags);

            let levels = alloc_binmap_levels(fsa, heap, bin.max_alloc_count, &mut unwind)?;
            let (map_handle, map_ptr) = fsa.allocate(heap, std::mem::size_of::<Binmap>())?;
            unwind.push(map_handle);
            unsafe {
                std::ptr::write(
                    map_ptr.as_ptr() as *mut Binmap,
                    Binmap::new_all_used_lazy(bin.max_alloc_count, levels),
                );
            }
            Some((tags, map_handle))
        })();

        let (tags, map_handle) = match built {
            Some(parts) => parts,
            None => {
                unwind.run(fsa);
                return None;
            }
        };

        unsafe {
            (*record).node = LlNode::unlinked();
            (*record).segment_index = segment_index;
            (*record).bin_index = bin_index;
            (*record).chunk_index = chunk_index;
            (*record).elems_used = 0;
            (*record).elem_free_index = 0;
            (*record).elem_free_map = map_handle;
            (*record).elem_tags = tags;
        }
        Some(())
    }

    /// Frees a chunk's element metadata (binmap struct, its level
    /// arrays, the tag array).
    fn deinit_chunk_metadata(record: *mut ChunkRecord, fsa: &mut Fsa) {
        let (map_handle, tags) = unsafe { ((*record).elem_free_map, (*record).elem_tags) };

        if let Some(map_ptr) = fsa.idx2ptr(map_handle) {
            let map = unsafe { &*(map_ptr.as_ptr() as *const Binmap) };
            for level in map.level_arrays().iter() {
                if !level.is_null() {
                    fsa.deallocate_ptr(NonNull::new(*level as *mut u8).expect("level is non-null"));
                }
            }
            fsa.deallocate(map_handle);
        }
        if !tags.is_nil() {
            fsa.deallocate(tags);
        }

        unsafe {
            (*record).elem_free_map = Handle::NIL;
            (*record).elem_tags = Handle::NIL;
        }
    }

    /// Checks a chunk out for `bin`, claiming a segment if no active
    /// one has room, and commits exactly the pages the bin needs.
    ///
    /// Returns `None` with all state restored when address space,
    /// side metadata, or physical pages are exhausted.
    #[ensures(ret.is_some() -> !ret.unwrap().0.is_nil())]
    pub fn checkout_chunk(
        &mut self,
        bin_index: u16,
        bin: &BinConfig,
        fsa: &mut Fsa,
        heap: &mut Heap,
    ) -> Option<(Handle, *mut ChunkRecord)> {
        let active = self.active_map(bin.chunk);

        let segment_index = match unsafe { (*active).find() } {
            Some(index) => index,
            None => {
                let index = self.checkout_segment(bin.chunk, fsa, heap)?;
                unsafe { (*active).clr(index) };
                index
            }
        };

        let segment = unsafe { &mut *self.segment(segment_index as usize) };
        debug_assert!(segment.chunk_config == bin.chunk);

        // Prefer a cached chunk: its pages are already committed.
        let (handle, record, already_committed, chunk_index) = if segment.chunks_cached > 0 {
            segment.chunks_cached -= 1;
            let chunk_index = segment
                .chunks_cached_map
                .find_and_set()
                .expect("cached count and cached map agree");
            let handle = Handle::from_raw(unsafe { *segment.chunks_ptr.add(chunk_index as usize) });
            let record = fsa
                .idx2ptr(handle)
                .expect("cached chunks keep their record")
                .as_ptr() as *mut ChunkRecord;
            let pages = unsafe { (*record).physical_pages };
            (handle, record, pages, chunk_index)
        } else {
            let chunk_index = match segment.chunks_free_map.find() {
                Some(index) => index,
                None => {
                    debug_assert!(
                        segment.chunks_free_index < segment.chunks_max,
                        "active segment must have a checkout-able chunk"
                    );
                    let index = segment.chunks_free_index;
                    // Both binmaps initialise one 32-bit word at a
                    // time as the fresh index crosses word bounds.
                    if index % 32 == 0 {
                        segment.chunks_cached_map.lazy_init(index);
                        segment.chunks_free_map.lazy_init(index);
                    }
                    segment.chunks_free_index += 1;
                    index
                }
            };

            match fsa.allocate(heap, std::mem::size_of::<ChunkRecord>()) {
                Some((handle, ptr)) => {
                    unsafe {
                        *segment.chunks_ptr.add(chunk_index as usize) = handle.raw();
                    }
                    (handle, ptr.as_ptr() as *mut ChunkRecord, 0, chunk_index)
                }
                None => {
                    self.abandon_chunk(segment_index, chunk_index, fsa);
                    return None;
                }
            }
        };

        if Space::activate_chunk(
            record,
            bin_index,
            bin,
            segment_index as u16,
            chunk_index,
            fsa,
            heap,
        )
        .is_none()
        {
            // Roll the chunk (and its pages, if cached) all the way
            // back to free.
            let pages = already_committed;
            if pages > 0 {
                let address = self.chunk_address_in(segment_index, chunk_index);
                let _ = self.mapper.decommit(
                    NonNull::new(address as *mut c_void).expect("payload addresses are non-null"),
                    (pages as usize) << self.page_shift,
                );
                self.committed_pages -= pages as usize;
            }
            fsa.deallocate(handle);
            self.abandon_chunk(segment_index, chunk_index, fsa);
            return None;
        }

        segment.chunks_free_map.set(chunk_index);

        // Adjust the commit to exactly what this bin needs.
        let required = self.chunk_physical_pages(bin);
        let address = self.chunk_address_in(segment_index, chunk_index);
        if self
            .adjust_commit(address, already_committed, required)
            .is_none()
        {
            // A cached chunk going back to the free pool must drop
            // its pages, or the commit accounting drifts.
            if already_committed > 0 {
                let _ = self.mapper.decommit(
                    NonNull::new(address as *mut c_void).expect("payload addresses are non-null"),
                    (already_committed as usize) << self.page_shift,
                );
                self.committed_pages -= already_committed as usize;
            }
            Space::deinit_chunk_metadata(record, fsa);
            fsa.deallocate(handle);
            self.abandon_chunk(segment_index, chunk_index, fsa);
            return None;
        }
        unsafe { (*record).physical_pages = required };

        segment.chunks_used += 1;
        if segment.chunks_used == segment.chunks_max {
            // No checkout-able chunk remains in this segment.
            unsafe { (*active).set(segment_index) };
        }

        Some((handle, record))
    }

    /// Returns a chunk slot to the free pool after a failed checkout,
    /// releasing the segment if nothing else holds it.
    fn abandon_chunk(&mut self, segment_index: u32, chunk_index: u32, fsa: &mut Fsa) {
        let segment = unsafe { &mut *self.segment(segment_index as usize) };
        segment.chunks_free_map.clr(chunk_index);
        unsafe { *segment.chunks_ptr.add(chunk_index as usize) = Handle::NIL.raw() };
        if segment.chunks_used == 0 && segment.chunks_cached == 0 {
            self.release_segment(segment_index, fsa);
        }
    }

    /// Commits or decommits the tail so that exactly `required` pages
    /// back the chunk at `address`.
    fn adjust_commit(&mut self, address: usize, committed: u32, required: u32) -> Option<()> {
        let page = 1usize << self.page_shift;

        if required > committed {
            let start = NonNull::new((address + (committed as usize) * page) as *mut c_void)
                .expect("payload addresses are non-null");
            self.mapper
                .commit(start, (required - committed) as usize * page)
                .ok()?;
            self.committed_pages += (required - committed) as usize;
        } else if required < committed {
            let start = NonNull::new((address + (required as usize) * page) as *mut c_void)
                .expect("payload addresses are non-null");
            self.mapper
                .decommit(start, (committed - required) as usize * page)
                .ok()?;
            self.committed_pages -= (committed - required) as usize;
        }
        Some(())
    }

    /// Releases an empty chunk: either parks it in its segment's
    /// cache with pages committed, or decommits and frees it.  When
    /// the segment's last chunk goes, the segment goes too.
    #[requires(!handle.is_nil())]
    pub fn release_chunk(&mut self, handle: Handle, fsa: &mut Fsa) {
        let record = fsa
            .idx2ptr(handle)
            .expect("released chunks have a live record")
            .as_ptr() as *mut ChunkRecord;
        debug_assert!(unsafe { (*record).elems_used } == 0);

        let segment_index = unsafe { (*record).segment_index } as u32;
        let chunk_index = unsafe { (*record).chunk_index };
        let segment = unsafe { &mut *self.segment(segment_index as usize) };

        // The segment can serve checkouts again.
        if segment.chunks_used == segment.chunks_max {
            unsafe { (*self.active_map(segment.chunk_config)).clr(segment_index) };
        }

        if segment.chunks_cached < self.cache_watermark {
            // Keep the pages; the record survives with its commit
            // count, the element metadata does not.
            Space::deinit_chunk_metadata(record, fsa);
            segment.chunks_cached_map.clr(chunk_index);
            segment.chunks_cached += 1;
            segment.chunks_used -= 1;
        } else {
            let pages = unsafe { (*record).physical_pages };
            let address = self.chunk_address_in(segment_index, chunk_index);
            let _ = self.mapper.decommit(
                NonNull::new(address as *mut c_void).expect("payload addresses are non-null"),
                (pages as usize) << self.page_shift,
            );
            self.committed_pages -= pages as usize;

            Space::deinit_chunk_metadata(record, fsa);
            fsa.deallocate(handle);
            segment.chunks_free_map.clr(chunk_index);
            unsafe { *segment.chunks_ptr.add(chunk_index as usize) = Handle::NIL.raw() };
            segment.chunks_used -= 1;
        }

        if segment.chunks_used == 0 && segment.chunks_cached == 0 {
            self.release_segment(segment_index, fsa);
        }
    }

    /// Decommits and frees every cached chunk of `segment_index`.
    fn drain_cached(&mut self, segment_index: u32, fsa: &mut Fsa) {
        let segment = unsafe { &mut *self.segment(segment_index as usize) };

        while segment.chunks_cached > 0 {
            let chunk_index = segment
                .chunks_cached_map
                .find_and_set()
                .expect("cached count and cached map agree");
            let handle = Handle::from_raw(unsafe { *segment.chunks_ptr.add(chunk_index as usize) });
            let record = fsa
                .idx2ptr(handle)
                .expect("cached chunks keep their record")
                .as_ptr() as *mut ChunkRecord;

            let pages = unsafe { (*record).physical_pages };
            let address = self.chunk_address_in(segment_index, chunk_index);
            let _ = self.mapper.decommit(
                NonNull::new(address as *mut c_void).expect("payload addresses are non-null"),
                (pages as usize) << self.page_shift,
            );
            self.committed_pages -= pages as usize;

            // Element metadata was already freed when the chunk was
            // cached.
            fsa.deallocate(handle);
            unsafe { *segment.chunks_ptr.add(chunk_index as usize) = Handle::NIL.raw() };
            segment.chunks_cached -= 1;
            segment.chunks_free_map.clr(chunk_index);
        }
    }

    /// Returns a fully empty segment to the free pool, freeing its
    /// FSA bookkeeping.
    fn release_segment(&mut self, segment_index: u32, fsa: &mut Fsa) {
        self.drain_cached(segment_index, fsa);

        let segment = unsafe { &mut *self.segment(segment_index as usize) };
        debug_assert!(segment.chunks_used == 0 && segment.chunks_cached == 0);

        unsafe { (*self.active_map(segment.chunk_config)).set(segment_index) };

        for map in [&segment.chunks_cached_map, &segment.chunks_free_map] {
            for level in map.level_arrays().iter() {
                if !level.is_null() {
                    fsa.deallocate_ptr(NonNull::new(*level as *mut u8).expect("level is non-null"));
                }
            }
        }
        segment.chunks_cached_map = Binmap::unattached();
        segment.chunks_free_map = Binmap::unattached();

        fsa.deallocate(segment.chunks_handle);
        segment.chunks_handle = Handle::NIL;
        segment.chunks_ptr = std::ptr::null_mut();
        segment.chunks_max = 0;

        self.segments_free_map.clr(segment_index);
    }

    /// Drains every segment's chunk cache and releases segments that
    /// become empty, returning their pages to the OS.
    pub fn trim(&mut self, fsa: &mut Fsa) {
        for i in 0..self.segment_count {
            let segment = unsafe { &*self.segment(i as usize) };
            if segment.chunks_ptr.is_null() {
                continue;
            }

            self.drain_cached(i, fsa);
            let segment = unsafe { &*self.segment(i as usize) };
            if segment.chunks_used == 0 {
                self.release_segment(i, fsa);
            }
        }
    }

    #[inline]
    fn chunk_address_in(&self, segment_index: u32, chunk_index: u32) -> usize {
        let segment = unsafe { &*self.segment(segment_index as usize) };
        self.base.as_ptr() as usize
            + ((segment_index as usize) << self.segment_shift)
            + ((chunk_index as usize) << segment.chunk_config.shift)
    }

    /// Base address of `record`'s chunk.
    pub fn chunk_address(&self, record: *const ChunkRecord) -> usize {
        let (segment_index, chunk_index) =
            unsafe { ((*record).segment_index as u32, (*record).chunk_index) };
        self.chunk_address_in(segment_index, chunk_index)
    }

    /// Element size shift boundaries for `record`'s chunk.
    pub fn chunk_size(&self, record: *const ChunkRecord) -> usize {
        let segment = unsafe { &*self.segment((*record).segment_index as usize) };
        1usize << segment.chunk_config.shift
    }

    /// Decomposes a payload address into its chunk record, in
    /// constant time.  Returns `None` for addresses in segments or
    /// chunk slots that are not checked out.
    #[requires(self.contains(ptr))]
    pub fn address_to_chunk(&self, ptr: *const c_void, fsa: &Fsa) -> Option<(Handle, *mut ChunkRecord)> {
        let offset = ptr as usize - self.base.as_ptr() as usize;
        let segment_index = offset >> self.segment_shift;
        let segment = unsafe { &*self.segment(segment_index) };
        if segment.chunks_ptr.is_null() {
            return None;
        }

        let chunk_index =
            (offset - (segment_index << self.segment_shift)) >> segment.chunk_config.shift;
        debug_assert!(chunk_index < segment.chunks_max as usize);
        let handle = Handle::from_raw(unsafe { *segment.chunks_ptr.add(chunk_index) });
        let record = fsa.idx2ptr(handle)?.as_ptr() as *mut ChunkRecord;
        Some((handle, record))
    }

    /// Returns whether `ptr` falls inside the payload reservation.
    pub fn contains(&self, ptr: *const c_void) -> bool {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.range
    }

    pub fn committed_pages(&self) -> usize {
        self.committed_pages
    }

    pub fn committed_bytes(&self) -> usize {
        self.committed_pages << self.page_shift
    }

    pub fn reserved_bytes(&self) -> usize {
        self.range
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        let _ = self.mapper.release(self.base, self.range);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SizePolicy;
    use crate::mapper::get_mapper;

    fn fixture(cache_watermark: u32) -> (Heap, Fsa, Space) {
        let mapper = get_mapper(None).expect("default mapper exists");
        let mut heap = Heap::new(mapper, 16 << 20, 0).expect("heap should build");
        let mut fsa = Fsa::new(&mut heap, mapper, 64 << 20, 4 << 20).expect("fsa should build");
        let space = Space::new(&mut heap, mapper, 4 << 30, 30, cache_watermark)
            .expect("space should build");
        (heap, fsa, space)
    }

    fn small_bin() -> (u16, BinConfig) {
        let policy = SizePolicy::TwentyFivePercent;
        let index = policy.bin_index(10).unwrap();
        (index as u16, policy.bins()[index])
    }

    #[test]
    fn checkout_commits_exactly_what_the_bin_needs() {
        let (mut heap, mut fsa, mut space) = fixture(0);
        let (bin_index, bin) = small_bin();

        let (handle, record) = space
            .checkout_chunk(bin_index, &bin, &mut fsa, &mut heap)
            .expect("checkout should succeed");

        let required = space.chunk_physical_pages(&bin) as usize;
        assert_eq!(space.committed_pages(), required);
        assert_eq!(unsafe { (*record).physical_pages } as usize, required);
        assert_eq!(unsafe { (*record).bin_index }, bin_index);
        assert_eq!(unsafe { (*record).elems_used }, 0);

        // The chunk's base address round-trips through the pointer
        // decomposition.
        let address = space.chunk_address(record);
        let (found, found_record) = space
            .address_to_chunk(address as *const c_void, &fsa)
            .expect("chunk address resolves");
        assert_eq!(found, handle);
        assert_eq!(found_record, record);

        // So does an interior address.
        let (found, _) = space
            .address_to_chunk((address + 1000) as *const c_void, &fsa)
            .expect("interior address resolves");
        assert_eq!(found, handle);

        space.release_chunk(handle, &mut fsa);
        assert_eq!(space.committed_pages(), 0);

        // The segment went with its last chunk; the slot no longer
        // resolves.
        assert!(space.address_to_chunk(address as *const c_void, &fsa).is_none());
    }

    #[test]
    fn chunks_share_a_segment_until_full() {
        let (mut heap, mut fsa, mut space) = fixture(0);
        let (bin_index, bin) = small_bin();

        let (h0, r0) = space
            .checkout_chunk(bin_index, &bin, &mut fsa, &mut heap)
            .expect("checkout should succeed");
        let (h1, r1) = space
            .checkout_chunk(bin_index, &bin, &mut fsa, &mut heap)
            .expect("checkout should succeed");

        assert_ne!(h0, h1);
        let (s0, c0) = unsafe { ((*r0).segment_index, (*r0).chunk_index) };
        let (s1, c1) = unsafe { ((*r1).segment_index, (*r1).chunk_index) };
        assert_eq!(s0, s1, "same chunk class shares the segment");
        assert_ne!(c0, c1);
        assert_eq!(
            space.chunk_address(r1) - space.chunk_address(r0),
            space.chunk_size(r0)
        );

        space.release_chunk(h0, &mut fsa);
        space.release_chunk(h1, &mut fsa);
        assert_eq!(space.committed_pages(), 0);
    }

    #[test]
    fn released_chunk_slot_is_reused() {
        let (mut heap, mut fsa, mut space) = fixture(0);
        let (bin_index, bin) = small_bin();

        let (h0, r0) = space
            .checkout_chunk(bin_index, &bin, &mut fsa, &mut heap)
            .expect("checkout should succeed");
        let (_h1, _r1) = space
            .checkout_chunk(bin_index, &bin, &mut fsa, &mut heap)
            .expect("checkout should succeed");

        let freed_index = unsafe { (*r0).chunk_index };
        space.release_chunk(h0, &mut fsa);

        // The freed slot is the lowest free index and gets reused.
        let (_h2, r2) = space
            .checkout_chunk(bin_index, &bin, &mut fsa, &mut heap)
            .expect("checkout should succeed");
        assert_eq!(unsafe { (*r2).chunk_index }, freed_index);
    }

    #[test]
    fn cache_watermark_retains_pages() {
        let (mut heap, mut fsa, mut space) = fixture(1);
        let (bin_index, bin) = small_bin();

        let (h0, _r0) = space
            .checkout_chunk(bin_index, &bin, &mut fsa, &mut heap)
            .expect("checkout should succeed");
        let committed = space.committed_pages();

        // Release parks the chunk in the cache, pages intact.
        space.release_chunk(h0, &mut fsa);
        assert_eq!(space.committed_pages(), committed);

        // The next checkout takes the cached chunk without touching
        // the commit.
        let (h1, _r1) = space
            .checkout_chunk(bin_index, &bin, &mut fsa, &mut heap)
            .expect("checkout should succeed");
        assert_eq!(space.committed_pages(), committed);

        space.release_chunk(h1, &mut fsa);
        space.trim(&mut fsa);
        assert_eq!(space.committed_pages(), 0);
    }
}
