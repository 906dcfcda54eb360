//! This module tracks metadata about mapped address ranges in debug
//! builds.
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Clone)]
struct AddressRange {
    /// The range of address space reserved.
    begin: usize,
    size: usize,

    /// Committed page runs inside the reservation, keyed by their
    /// first address.  Runs never overlap.
    committed: BTreeMap<usize, usize>,
}

lazy_static::lazy_static! {
    static ref ADDRESS_RANGE_MAP: Mutex<BTreeMap<usize, AddressRange>> = Default::default();
}

/// Returns the `(begin, size)` of the reservation with the highest
/// base address less than or equal to `ptr`.
fn predecessor(ptr: usize) -> Option<(usize, usize)> {
    let map = ADDRESS_RANGE_MAP.lock().unwrap();
    map.range(0..=ptr).last().map(|x| (x.1.begin, x.1.size))
}

/// Registers a new address range.  It must not overlap with any other
/// registered range.
pub fn reserve_range(begin: usize, size: usize) -> Result<(), &'static str> {
    if usize::MAX - begin < size {
        return Err("Address is too high.");
    }

    let mut map = ADDRESS_RANGE_MAP.lock().unwrap();

    // Make sure nothing overlaps with the new range.
    for (_, info) in map.range(0..=(begin + size)).rev() {
        // We're walking reservations from the top down.  If the
        // current reservation is too high, keep looking.
        if info.begin >= begin + size {
            continue;
        }

        // If the current reservation is too low, stop.
        if begin >= info.begin + info.size {
            break;
        }

        return Err("Reservations overlap");
    }

    map.insert(
        begin,
        AddressRange {
            begin,
            size,
            committed: BTreeMap::new(),
        },
    );
    Ok(())
}

/// Confirms that `[begin, begin + size)` is exactly one registered
/// reservation.
pub fn releasable_range(begin: usize, size: usize) -> Result<(), &'static str> {
    let (parent_begin, parent_size) = predecessor(begin).ok_or("Parent range not found")?;

    if parent_begin != begin || parent_size != size {
        return Err("Released range is not a whole reservation");
    }

    Ok(())
}

/// Unregisters a reservation.  The allocator only ever releases whole
/// reservations, at teardown.
pub fn release_range(begin: usize, size: usize) -> Result<(), &'static str> {
    releasable_range(begin, size)?;

    let mut map = ADDRESS_RANGE_MAP.lock().unwrap();
    map.remove(&begin).ok_or("Range not found")?;
    Ok(())
}

/// Confirms that `[begin, begin + size)` falls inside a single
/// registered reservation.
pub fn in_reserved_range(begin: usize, size: usize) -> Result<(), &'static str> {
    if usize::MAX - begin < size {
        return Err("Range too large");
    }

    let (parent_begin, parent_size) = predecessor(begin).ok_or("Parent range not found")?;

    if begin >= parent_begin + parent_size {
        return Err("Parent range too short for begin");
    }

    if begin + size > parent_begin + parent_size {
        return Err("Parent range too short for size");
    }

    Ok(())
}

/// Marks `[begin, begin + size)` as committed, merging with any runs
/// it touches.
pub fn mark_committed(begin: usize, size: usize) -> Result<(), &'static str> {
    in_reserved_range(begin, size)?;

    let mut map = ADDRESS_RANGE_MAP.lock().unwrap();
    let (parent_begin, _) = map
        .range(0..=begin)
        .last()
        .map(|x| (x.1.begin, x.1.size))
        .ok_or("Parent range not found")?;
    let parent = map.get_mut(&parent_begin).ok_or("Parent range not found")?;

    let mut new_begin = begin;
    let mut new_end = begin + size;

    // Absorb every committed run that intersects or abuts the new one.
    let absorbed: Vec<usize> = parent
        .committed
        .range(..=new_end)
        .filter(|(run_begin, run_size)| **run_begin + **run_size >= new_begin)
        .map(|(run_begin, _)| *run_begin)
        .collect();
    for run_begin in absorbed {
        let run_size = parent.committed.remove(&run_begin).unwrap();
        new_begin = new_begin.min(run_begin);
        new_end = new_end.max(run_begin + run_size);
    }

    parent.committed.insert(new_begin, new_end - new_begin);
    Ok(())
}

/// Confirms that `[begin, begin + size)` is fully committed, then
/// marks it decommitted.
pub fn mark_decommitted(begin: usize, size: usize) -> Result<(), &'static str> {
    in_reserved_range(begin, size)?;

    let mut map = ADDRESS_RANGE_MAP.lock().unwrap();
    let (parent_begin, _) = map
        .range(0..=begin)
        .last()
        .map(|x| (x.1.begin, x.1.size))
        .ok_or("Parent range not found")?;
    let parent = map.get_mut(&parent_begin).ok_or("Parent range not found")?;

    let (run_begin, run_size) = parent
        .committed
        .range(..=begin)
        .last()
        .map(|(b, s)| (*b, *s))
        .ok_or("Decommitted range was never committed")?;

    if begin + size > run_begin + run_size {
        return Err("Decommitted range exceeds the committed run");
    }

    // Split the run around the decommitted span.
    parent.committed.remove(&run_begin);
    if run_begin < begin {
        parent.committed.insert(run_begin, begin - run_begin);
    }
    if begin + size < run_begin + run_size {
        parent
            .committed
            .insert(begin + size, (run_begin + run_size) - (begin + size));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Addresses in these tests are synthetic: the map never
    // dereferences anything.  Base them low, where the kernel does
    // not place real mappings, so they cannot collide with actual
    // reservations registered by other tests.
    const BASE: usize = 0x20_0000;

    #[test]
    fn commit_decommit_roundtrip() {
        reserve_range(BASE, 1 << 20).expect("reserve should succeed");

        mark_committed(BASE + 4096, 8192).expect("commit should succeed");
        mark_committed(BASE + 12288, 4096).expect("adjacent commit should merge");
        mark_decommitted(BASE + 8192, 4096).expect("decommit inside the run should succeed");

        assert!(mark_decommitted(BASE + 32768, 4096).is_err());

        release_range(BASE, 1 << 20).expect("release should succeed");
    }

    #[test]
    fn release_requires_whole_reservation() {
        reserve_range(BASE + (1 << 30), 1 << 20).expect("reserve should succeed");

        assert!(release_range(BASE + (1 << 30), 4096).is_err());
        release_range(BASE + (1 << 30), 1 << 20).expect("release should succeed");
    }
}
