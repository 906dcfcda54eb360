//! A two-level fixed-size allocator for small metadata objects (chunk
//! records, binmap arrays, tag arrays).  Its reservation is cut into
//! equal-sized sections; a section is cut into equal-sized blocks,
//! each serving exactly one item size; a block hands out items off an
//! intrusive 16-bit free list plus a lazy bump index for the
//! untouched tail.
//!
//! Allocations are identified by compact 32-bit handles encoding
//! `{section:8, block:8, item:16}`, so records that reference other
//! metadata stay pointer-free and small.
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
use crate::heap::Heap;
use crate::llist::{Dexer, LlNode};
use crate::mapper::Mapper;

const NIL16: u16 = u16::MAX;

/// A compact reference to one FSA item: `{section:8, block:8, item:16}`.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Handle(u32);

const_assert_eq!(std::mem::size_of::<Handle>(), 4);

impl Handle {
    pub const NIL: Handle = Handle(u32::MAX);

    fn new(section: u32, block: u32, item: u32) -> Handle {
        debug_assert!(section <= 0xFE && block <= 0xFE && item <= 0xFFFF);
        Handle((section << 24) | (block << 16) | item)
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self == Handle::NIL
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u32) -> Handle {
        Handle(raw)
    }

    #[inline]
    fn section(self) -> usize {
        ((self.0 >> 24) & 0xFF) as usize
    }

    #[inline]
    fn block(self) -> usize {
        ((self.0 >> 16) & 0xFF) as usize
    }

    #[inline]
    fn item(self) -> usize {
        (self.0 & 0xFFFF) as usize
    }
}

#[derive(Clone, Copy, Debug)]
struct BlockClass {
    index: u8,
    shift: u8,
}

#[derive(Clone, Copy, Debug)]
struct ItemClass {
    index: u8,
    shift: u8,
    block: BlockClass,
}

const B64K: BlockClass = BlockClass {
    index: 0,
    shift: 16,
};
const B256K: BlockClass = BlockClass {
    index: 1,
    shift: 18,
};
const B1M: BlockClass = BlockClass {
    index: 2,
    shift: 20,
};
const B4M: BlockClass = BlockClass {
    index: 3,
    shift: 22,
};

const BLOCK_CLASSES: [BlockClass; 4] = [B64K, B256K, B1M, B4M];

/// Item sizes 2^3 .. 2^21 and the block size each is carved from.
const ITEM_CLASSES: [ItemClass; 19] = [
    ItemClass { index: 0, shift: 3, block: B64K },
    ItemClass { index: 1, shift: 4, block: B64K },
    ItemClass { index: 2, shift: 5, block: B64K },
    ItemClass { index: 3, shift: 6, block: B64K },
    ItemClass { index: 4, shift: 7, block: B64K },
    ItemClass { index: 5, shift: 8, block: B64K },
    ItemClass { index: 6, shift: 9, block: B64K },
    ItemClass { index: 7, shift: 10, block: B64K },
    ItemClass { index: 8, shift: 11, block: B64K },
    ItemClass { index: 9, shift: 12, block: B64K },
    ItemClass { index: 10, shift: 13, block: B64K },
    ItemClass { index: 11, shift: 14, block: B64K },
    ItemClass { index: 12, shift: 15, block: B256K },
    ItemClass { index: 13, shift: 16, block: B256K },
    ItemClass { index: 14, shift: 17, block: B1M },
    ItemClass { index: 15, shift: 18, block: B1M },
    ItemClass { index: 16, shift: 19, block: B4M },
    ItemClass { index: 17, shift: 20, block: B4M },
    ItemClass { index: 18, shift: 21, block: B4M },
];

/// Routes an allocation size to its item class: sizes round up to a
/// multiple of 8, then to the next power of two.
fn item_class_for(size: usize) -> Option<ItemClass> {
    if size == 0 {
        return None;
    }

    let size = ((size + 7) & !7).checked_next_power_of_two()?;
    let shift = size.trailing_zeros() as usize;
    ITEM_CLASSES.get(shift - 3).copied()
}

/// Per-block record; the block's payload lives in the section, the
/// record lives in a heap-allocated array.
#[repr(C)]
struct Block {
    next: *mut Block,
    prev: *mut Block,
    section_index: u16,
    block_index: u16,
    item_free_index: u16,
    item_count: u16,
    item_count_max: u16,
    item_free_list: u16,
    item_class: u8,
    item_shift: u8,
}

const_assert_eq!(std::mem::size_of::<Block>(), 32);

impl Block {
    fn initialize(&mut self, section_index: u16, block_index: u16, class: &ItemClass) {
        debug_assert!(section_index <= 0xFE);
        debug_assert!(block_index <= 0xFE);

        self.next = std::ptr::null_mut();
        self.prev = std::ptr::null_mut();
        self.section_index = section_index;
        self.block_index = block_index;
        self.item_free_index = 0;
        self.item_count = 0;
        self.item_count_max = 1u16 << (class.block.shift - class.shift);
        self.item_free_list = NIL16;
        self.item_class = class.index;
        self.item_shift = class.shift;
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.item_count == self.item_count_max
    }

    #[inline]
    fn item_ptr(&self, block_base: usize, index: usize) -> *mut u8 {
        (block_base + (index << self.item_shift)) as *mut u8
    }

    #[inline]
    fn item_index(&self, block_base: usize, ptr: *const u8) -> usize {
        (ptr as usize - block_base) >> self.item_shift
    }

    /// Pops an item off the free list, or takes the next untouched
    /// slot.  The caller guarantees the block is not full.
    fn allocate_item(&mut self, block_base: usize) -> (u16, *mut u8) {
        debug_assert!(!self.is_full());

        let index;
        let ptr;
        if self.item_free_list != NIL16 {
            index = self.item_free_list;
            ptr = self.item_ptr(block_base, index as usize);
            // The first two bytes of a free item hold the next link.
            self.item_free_list = unsafe { std::ptr::read(ptr as *const u16) };
        } else {
            debug_assert!(self.item_free_index < self.item_count_max);
            index = self.item_free_index;
            self.item_free_index += 1;
            ptr = self.item_ptr(block_base, index as usize);
        }

        self.item_count += 1;
        (index, ptr)
    }

    fn deallocate_item(&mut self, block_base: usize, index: u16) {
        debug_assert!(self.item_count > 0);
        debug_assert!(index < self.item_free_index);

        let ptr = self.item_ptr(block_base, index as usize);
        unsafe { std::ptr::write(ptr as *mut u16, self.item_free_list) };
        self.item_free_list = index;
        self.item_count -= 1;
    }
}

/// One slice of the FSA reservation.  Committed on first checkout and
/// bound to a single block size from then on.
#[repr(C)]
struct Section {
    base: usize,
    section_index: u32,
    block_class: u8,
    blocks_free_index: u16,
    blocks_used: u16,
    blocks_max: u16,
    blocks: *mut Block,
    block_free_map: Binmap,
}

impl Section {
    fn checkout(
        &mut self,
        heap: &mut Heap,
        section_shift: u32,
        class: &BlockClass,
    ) -> Option<()> {
        self.block_class = class.index;
        self.blocks_free_index = 0;
        self.blocks_used = 0;
        self.blocks_max = 1u16 << (section_shift - class.shift as u32);
        self.blocks = heap.alloc_array::<Block>(self.blocks_max as usize)?.as_ptr();

        let words = Binmap::level_words(self.blocks_max as u32);
        let l1 = if words[0] > 0 {
            heap.alloc_array::<u32>(words[0] as usize)?.as_ptr()
        } else {
            std::ptr::null_mut()
        };
        self.block_free_map = unsafe {
            Binmap::new_all_used_lazy(
                self.blocks_max as u32,
                [l1, std::ptr::null_mut(), std::ptr::null_mut()],
            )
        };
        Some(())
    }

    #[inline]
    fn block_shift(&self) -> u32 {
        BLOCK_CLASSES[self.block_class as usize].shift as u32
    }

    #[inline]
    fn block_address(&self, block_index: usize) -> usize {
        self.base + (block_index << self.block_shift())
    }

    #[inline]
    fn block_of(&self, ptr: *const u8) -> usize {
        (ptr as usize - self.base) >> self.block_shift()
    }

    /// All blocks handed out.
    #[inline]
    fn is_full(&self) -> bool {
        self.blocks_used == self.blocks_max
    }

    fn checkout_block(&mut self, class: &ItemClass) -> Option<*mut Block> {
        let block_index = match self.block_free_map.find_and_set() {
            Some(index) => index,
            None => {
                if self.blocks_free_index < self.blocks_max {
                    let index = self.blocks_free_index as u32;
                    self.block_free_map.lazy_init(index);
                    self.blocks_free_index += 1;
                    index
                } else {
                    return None;
                }
            }
        };

        self.blocks_used += 1;
        let block = unsafe { &mut *self.blocks.add(block_index as usize) };
        block.initialize(self.section_index as u16, block_index as u16, class);
        Some(block)
    }
}

pub struct Fsa {
    mapper: &'static dyn Mapper,
    base: NonNull<c_void>,
    range: usize,
    section_shift: u32,
    section_count: u32,
    sections: *mut Section,
    sections_free_index: u32,
    sections_free_map: Binmap,
    /// Per block class: sections with at least one free block.
    active_sections: *mut Binmap,
    /// Per item class: ring of not-yet-full blocks.
    active_blocks: [*mut Block; ITEM_CLASSES.len()],
    committed_bytes: usize,
}

impl Fsa {
    /// The largest size `allocate` can serve.
    pub const MAX_ITEM_SIZE: usize = 1 << 21;

    /// Reserves `range` bytes carved into `section_size` sections.
    /// All bookkeeping arrays come from `heap`.
    pub fn new(
        heap: &mut Heap,
        mapper: &'static dyn Mapper,
        range: usize,
        section_size: usize,
    ) -> Option<Fsa> {
        debug_assert!(section_size.is_power_of_two());
        debug_assert!(range % section_size == 0);

        let section_shift = section_size.trailing_zeros();
        let section_count = (range >> section_shift) as u32;
        assert!(
            section_count >= 1 && section_count <= 0xFF,
            "section indices must fit the handle encoding"
        );
        assert!(
            section_size >> B64K.shift <= 0xFF,
            "block indices must fit the handle encoding"
        );

        let base = mapper.reserve(range).ok()?;

        let sections = heap.alloc_array::<Section>(section_count as usize)?.as_ptr();
        for i in 0..section_count {
            unsafe {
                std::ptr::write(
                    sections.add(i as usize),
                    Section {
                        base: base.as_ptr() as usize + ((i as usize) << section_shift),
                        section_index: i,
                        block_class: 0,
                        blocks_free_index: 0,
                        blocks_used: 0,
                        blocks_max: 0,
                        blocks: std::ptr::null_mut(),
                        block_free_map: Binmap::unattached(),
                    },
                );
            }
        }

        let words = Binmap::level_words(section_count);
        let mut alloc_levels = |heap: &mut Heap| -> Option<[*mut u32; 3]> {
            let mut levels = [std::ptr::null_mut(); 3];
            for (l, &w) in words.iter().enumerate() {
                if w > 0 {
                    levels[l] = heap.alloc_array::<u32>(w as usize)?.as_ptr();
                }
            }
            Some(levels)
        };

        let sections_free_map =
            unsafe { Binmap::new_all_used_lazy(section_count, alloc_levels(heap)?) };

        let active_sections = heap.alloc_array::<Binmap>(BLOCK_CLASSES.len())?.as_ptr();
        for i in 0..BLOCK_CLASSES.len() {
            let map = unsafe { Binmap::new_all_used(section_count, alloc_levels(heap)?) };
            unsafe { std::ptr::write(active_sections.add(i), map) };
        }

        Some(Fsa {
            mapper,
            base,
            range,
            section_shift,
            section_count,
            sections,
            sections_free_index: 0,
            sections_free_map,
            active_sections,
            active_blocks: [std::ptr::null_mut(); ITEM_CLASSES.len()],
            committed_bytes: 0,
        })
    }

    fn section(&self, index: usize) -> &mut Section {
        debug_assert!(index < self.section_count as usize);
        unsafe { &mut *self.sections.add(index) }
    }

    /// Finds a section with a free block for `class`, claiming and
    /// committing a new section if needed, then checks a block out of
    /// it.
    fn checkout_block(&mut self, heap: &mut Heap, class: &ItemClass) -> Option<*mut Block> {
        let active = unsafe { &mut *self.active_sections.add(class.block.index as usize) };

        let section_index = match active.find() {
            Some(index) => index,
            None => {
                let index = match self.sections_free_map.find_and_set() {
                    Some(index) => index,
                    None => {
                        if self.sections_free_index < self.section_count {
                            let index = self.sections_free_index;
                            self.sections_free_map.lazy_init(index);
                            self.sections_free_index += 1;
                            index
                        } else {
                            return None;
                        }
                    }
                };

                let section_shift = self.section_shift;
                let section = self.section(index as usize);
                let section_base = section.base;
                if section.checkout(heap, section_shift, &class.block).is_none() {
                    // Bookkeeping failed; put the section back.
                    self.sections_free_map.clr(index);
                    return None;
                }

                // Sections commit in full at checkout and stay
                // committed until teardown.
                let commit_base =
                    NonNull::new(section_base as *mut c_void).expect("section base is non-null");
                if self.mapper.commit(commit_base, 1 << section_shift).is_err() {
                    self.sections_free_map.clr(index);
                    return None;
                }
                self.committed_bytes += 1 << section_shift;

                active.clr(index);
                index
            }
        };

        let section = unsafe { &mut *self.sections.add(section_index as usize) };
        let block = section.checkout_block(class)?;
        if section.is_full() {
            unsafe { &mut *self.active_sections.add(class.block.index as usize) }.set(section_index);
        }
        Some(block)
    }

    /// Attempts to allocate an item of at least `size` bytes.
    /// Returns the item's handle and address.
    #[requires(size > 0)]
    #[ensures(ret.is_some() -> !ret.unwrap().0.is_nil())]
    #[ensures(ret.is_some() ->
              self.idx2ptr(ret.unwrap().0) == Some(ret.unwrap().1),
              "the handle resolves back to the returned address")]
    pub fn allocate(&mut self, heap: &mut Heap, size: usize) -> Option<(Handle, NonNull<u8>)> {
        let class = item_class_for(size)?;
        debug_assert!(size <= 1usize << class.shift);

        let class_index = class.index as usize;
        let mut block = self.active_blocks[class_index];
        if block.is_null() {
            block = self.checkout_block(heap, &class)?;
            unsafe {
                (*block).next = block;
                (*block).prev = block;
            }
            self.active_blocks[class_index] = block;
        }

        let section = unsafe { &*self.sections.add((*block).section_index as usize) };
        let block_base = section.block_address(unsafe { (*block).block_index } as usize);
        let (item_index, ptr) = unsafe { (*block).allocate_item(block_base) };

        if unsafe { (*block).is_full() } {
            // Unlink the block from its ring.
            unsafe {
                let head = &mut self.active_blocks[class_index];
                if *head == block {
                    *head = (*block).next;
                    if *head == block {
                        *head = std::ptr::null_mut();
                    }
                }
                (*(*block).prev).next = (*block).next;
                (*(*block).next).prev = (*block).prev;
            }
        }

        let handle = unsafe {
            Handle::new(
                (*block).section_index as u32,
                (*block).block_index as u32,
                item_index as u32,
            )
        };
        Some((handle, NonNull::new(ptr)?))
    }

    /// Releases the item behind `handle`.
    #[requires(!handle.is_nil())]
    pub fn deallocate(&mut self, handle: Handle) {
        debug_assert!(handle.section() < self.section_count as usize);
        let section = unsafe { &mut *self.sections.add(handle.section()) };
        debug_assert!(handle.block() < section.blocks_max as usize);
        let block = unsafe { section.blocks.add(handle.block()) };

        let class_index = unsafe { (*block).item_class } as usize;
        let was_full = unsafe { (*block).is_full() };
        let block_base = section.block_address(handle.block());
        unsafe { (*block).deallocate_item(block_base, handle.item() as u16) };

        if was_full {
            // The block can serve allocations again; rejoin the ring.
            let head = self.active_blocks[class_index];
            unsafe {
                if head.is_null() {
                    (*block).next = block;
                    (*block).prev = block;
                    self.active_blocks[class_index] = block;
                } else {
                    (*block).next = head;
                    (*block).prev = (*head).prev;
                    (*(*head).prev).next = block;
                    (*head).prev = block;
                }
            }
        }
    }

    /// Releases the item at `ptr`.
    pub fn deallocate_ptr(&mut self, ptr: NonNull<u8>) {
        let handle = self.ptr2idx(ptr.as_ptr());
        self.deallocate(handle);
    }

    /// Resolves a handle to the item's address.
    pub fn idx2ptr(&self, handle: Handle) -> Option<NonNull<u8>> {
        if handle.is_nil() {
            return None;
        }

        debug_assert!(handle.section() < self.section_count as usize);
        let section = unsafe { &*self.sections.add(handle.section()) };
        debug_assert!(handle.block() < section.blocks_max as usize);
        let block = unsafe { &*section.blocks.add(handle.block()) };
        let block_base = section.block_address(handle.block());
        NonNull::new(block.item_ptr(block_base, handle.item()))
    }

    /// Recovers the handle of the item at `ptr`.
    #[requires(self.contains(ptr as *const c_void))]
    pub fn ptr2idx(&self, ptr: *const u8) -> Handle {
        let offset = ptr as usize - self.base.as_ptr() as usize;
        let section_index = offset >> self.section_shift;
        let section = unsafe { &*self.sections.add(section_index) };
        let block_index = section.block_of(ptr);
        let block = unsafe { &*section.blocks.add(block_index) };
        let item_index = block.item_index(section.block_address(block_index), ptr);
        Handle::new(section_index as u32, block_index as u32, item_index as u32)
    }

    /// Returns whether `ptr` falls inside the FSA's reservation.
    pub fn contains(&self, ptr: *const c_void) -> bool {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.range
    }

    pub fn committed_bytes(&self) -> usize {
        self.committed_bytes
    }

    pub fn reserved_bytes(&self) -> usize {
        self.range
    }
}

impl Drop for Fsa {
    fn drop(&mut self) {
        let _ = self.mapper.release(self.base, self.range);
    }
}

/// Chunk records are FSA items that embed their list node first, so
/// the FSA doubles as the node store for the per-bin chunk rings.
impl Dexer for Fsa {
    fn idx2node(&self, index: u32) -> *mut LlNode {
        match self.idx2ptr(Handle::from_raw(index)) {
            Some(ptr) => ptr.as_ptr() as *mut LlNode,
            None => std::ptr::null_mut(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::get_mapper;

    const SECTION_SIZE: usize = 4 << 20;

    fn fixture() -> (Heap, Fsa) {
        let mapper = get_mapper(None).expect("default mapper exists");
        let mut heap = Heap::new(mapper, 8 << 20, 0).expect("heap reservation should succeed");
        let fsa =
            Fsa::new(&mut heap, mapper, 8 * SECTION_SIZE, SECTION_SIZE).expect("fsa should build");
        (heap, fsa)
    }

    #[test]
    fn size_routing() {
        assert_eq!(item_class_for(1).unwrap().shift, 3);
        assert_eq!(item_class_for(8).unwrap().shift, 3);
        assert_eq!(item_class_for(9).unwrap().shift, 4);
        assert_eq!(item_class_for(24).unwrap().shift, 5);
        assert_eq!(item_class_for(4096).unwrap().shift, 12);
        assert_eq!(item_class_for(1 << 21).unwrap().shift, 21);
        assert!(item_class_for((1 << 21) + 1).is_none());
        assert!(item_class_for(0).is_none());
    }

    #[test]
    fn handle_roundtrip() {
        let (mut heap, mut fsa) = fixture();

        let mut live = Vec::new();
        for size in [8usize, 16, 24, 100, 4096, 1 << 16] {
            let (handle, ptr) = fsa.allocate(&mut heap, size).expect("allocate should succeed");
            assert_eq!(fsa.idx2ptr(handle), Some(ptr));
            assert_eq!(fsa.ptr2idx(ptr.as_ptr()), handle);
            live.push((handle, ptr));
        }

        // Distinct addresses.
        for (i, (_, p)) in live.iter().enumerate() {
            for (_, q) in live.iter().skip(i + 1) {
                assert_ne!(p, q);
            }
        }

        for (handle, _) in live {
            fsa.deallocate(handle);
        }
    }

    #[test]
    fn free_list_reuse_is_lifo() {
        let (mut heap, mut fsa) = fixture();

        let (h0, p0) = fsa.allocate(&mut heap, 32).expect("allocate should succeed");
        let (_h1, _p1) = fsa.allocate(&mut heap, 32).expect("allocate should succeed");

        fsa.deallocate(h0);
        let (h2, p2) = fsa.allocate(&mut heap, 32).expect("allocate should succeed");

        // The freed item comes back first, with the same address.
        assert_eq!(p2, p0);
        assert_eq!(h2, h0);
    }

    #[test]
    fn fill_a_block() {
        let (mut heap, mut fsa) = fixture();

        // 2 KiB items in a 64 KiB block: 32 items per block.
        let per_block = 64 / 2;
        let mut handles = Vec::new();
        for _ in 0..per_block {
            handles.push(fsa.allocate(&mut heap, 2048).expect("allocate should succeed"));
        }

        // The block is full; the next allocation opens a second one.
        let (extra_handle, extra_ptr) =
            fsa.allocate(&mut heap, 2048).expect("allocate should succeed");
        assert!(handles.iter().all(|(_, p)| *p != extra_ptr));

        // Free one item from the full block: it rejoins the ring and
        // serves the next allocation.
        let (h, p) = handles.pop().unwrap();
        fsa.deallocate(h);
        let (h2, p2) = fsa.allocate(&mut heap, 2048).expect("allocate should succeed");
        assert_eq!((h2, p2), (h, p));

        fsa.deallocate(extra_handle);
        fsa.deallocate(h2);
        for (h, _) in handles {
            fsa.deallocate(h);
        }
    }

    #[test]
    fn deallocate_by_pointer() {
        let (mut heap, mut fsa) = fixture();

        let (h0, p0) = fsa.allocate(&mut heap, 64).expect("allocate should succeed");
        fsa.deallocate_ptr(p0);

        let (h1, p1) = fsa.allocate(&mut heap, 64).expect("allocate should succeed");
        assert_eq!((h1, p1), (h0, p0));
    }

    #[test]
    fn commit_grows_by_section() {
        let (mut heap, mut fsa) = fixture();
        assert_eq!(fsa.committed_bytes(), 0);

        fsa.allocate(&mut heap, 64).expect("allocate should succeed");
        assert_eq!(fsa.committed_bytes(), SECTION_SIZE);

        // A second item size of the same block class shares the
        // section.
        fsa.allocate(&mut heap, 128).expect("allocate should succeed");
        assert_eq!(fsa.committed_bytes(), SECTION_SIZE);

        // A 4 MiB-block item class needs a fresh section.
        fsa.allocate(&mut heap, 1 << 20).expect("allocate should succeed");
        assert_eq!(fsa.committed_bytes(), 2 * SECTION_SIZE);
    }
}
