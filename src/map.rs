//! Thin safe wrappers around the OS virtual memory primitive: reserve
//! address space, commit and decommit backing pages, release ranges.
//! Everything above this module works in page multiples.
use std::ffi::c_void;
use std::fs::File;
use std::ptr::NonNull;

use log::warn;

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", last_errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Attempts to reserve an *address space* region of `size` bytes.
/// The pages are inaccessible until committed.
///
/// The `size` argument must be a multiple of the page size.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        let errno = last_errno();
        warn!("mmap reserve failed: size={} errno={}", size, errno);
        return Err(errno);
    }

    NonNull::new(base).ok_or(0)
}

/// Releases a region of `size` bytes starting at `base`.
///
/// The size argument must be a multiple of the page size.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    if unsafe { libc::munmap(base.as_ptr(), size) } == 0 {
        Ok(())
    } else {
        let errno = last_errno();
        warn!(
            "munmap failed: base={:p} size={} errno={}",
            base.as_ptr(),
            size,
            errno
        );
        Err(errno)
    }
}

/// Backs a region of `size` bytes starting at `base` with
/// (demand-faulted, zero-filled) memory.
///
/// The size argument must be a multiple of the page size, and the
/// region must lie inside a range obtained from `reserve_region`.
pub fn commit_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    if unsafe { libc::mprotect(base.as_ptr(), size, libc::PROT_READ | libc::PROT_WRITE) } == 0 {
        Ok(())
    } else {
        let errno = last_errno();
        warn!(
            "mprotect commit failed: base={:p} size={} errno={}",
            base.as_ptr(),
            size,
            errno
        );
        Err(errno)
    }
}

/// Returns the physical pages backing `[base, base + size)` to the OS
/// and makes the range inaccessible again.  A later `commit_region`
/// of the same range yields fresh zero-filled pages.
///
/// Replacing the range with a fresh inaccessible anonymous mapping
/// drops the backing store in one call, whether the previous commit
/// was anonymous or file-backed.
pub fn decommit_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let remapped = unsafe {
        libc::mmap(
            base.as_ptr(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
            -1,
            0,
        )
    };

    if remapped == base.as_ptr() {
        Ok(())
    } else {
        let errno = last_errno();
        warn!(
            "mmap decommit failed: base={:p} size={} errno={}",
            base.as_ptr(),
            size,
            errno
        );
        Err(errno)
    }
}

/// Backs a region of `size` bytes starting at `base` with a shared
/// mapping of `file`, grown to `size` bytes.  The mapping outlives
/// the `File`, which may be closed on return.
///
/// The size argument must be a multiple of the page size.
pub fn commit_file_region(file: File, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    use std::os::unix::io::AsRawFd;

    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    file.set_len(size as u64)
        .map_err(|e| e.raw_os_error().unwrap_or(0))?;

    let mapped = unsafe {
        libc::mmap(
            base.as_ptr(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            file.as_raw_fd(),
            0,
        )
    };

    if mapped == base.as_ptr() {
        Ok(())
    } else {
        let errno = last_errno();
        warn!(
            "mmap file commit failed: base={:p} size={} errno={}",
            base.as_ptr(),
            size,
            errno
        );
        Err(errno)
    }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);

    // Power of two, and nothing exotic.
    assert_eq!(page_size() & (page_size() - 1), 0);
    assert!(page_size() >= 4096);
}

// Simulate the allocator's workflow: reserve a large range, commit a
// few page runs inside it, decommit one, and release everything.
#[test]
fn smoke_test() {
    let region_size = 1usize << 21;
    let base = reserve_region(region_size).expect("reserve should succeed");

    assert!(region_size > 4 * page_size());

    let second = NonNull::new((base.as_ptr() as usize + 2 * page_size()) as *mut c_void)
        .expect("Should be non-null");

    // Commit the first page and a two-page run further in.
    commit_region(base, page_size()).expect("should commit the first page");
    commit_region(second, 2 * page_size()).expect("should commit the second run");

    // Committed pages must read as zero and be writable.
    unsafe {
        assert_eq!(std::ptr::read(base.as_ptr() as *const u8), 0);
        std::ptr::write(second.as_ptr() as *mut u8, 42u8);
    }

    // Decommit the second run; recommitting yields zeroes again.
    decommit_region(second, 2 * page_size()).expect("should decommit");
    commit_region(second, 2 * page_size()).expect("should recommit");
    unsafe {
        assert_eq!(std::ptr::read(second.as_ptr() as *const u8), 0);
    }

    release_region(base, region_size).expect("should release everything");
}

#[test]
fn file_backed_smoke_test() {
    let region_size = 1usize << 20;
    let base = reserve_region(region_size).expect("reserve should succeed");

    let file = tempfile::tempfile().expect("should create a temporary file");
    commit_file_region(file, base, region_size).expect("should commit the file region");

    unsafe {
        assert_eq!(std::ptr::read(base.as_ptr() as *const u8), 0);
        std::ptr::write(base.as_ptr() as *mut u8, 42u8);
    }

    decommit_region(base, region_size).expect("should decommit");
    release_region(base, region_size).expect("should release everything");
}
