//! OS platform layer: virtual memory, CPU topology, residency probing, and
//! the cross-CPU rseq fence.
//!
//! Everything here goes through libc. Memory is obtained with anonymous
//! `mmap` so slab regions come back page-aligned and zeroed; `madvise` with
//! `MADV_DONTNEED` releases physical pages without giving up the address
//! range.

use core::ptr;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

// ── Virtual memory ──────────────────────────────────────────────────────────

/// Allocate `size` bytes of virtual memory, page-aligned and zeroed.
/// Returns null on failure.
///
/// # Safety
///
/// Caller must eventually call `page_dealloc` with the returned pointer and
/// the same `size`.
pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        ptr as *mut u8
    }
}

/// Free virtual memory previously allocated by `page_alloc`.
///
/// # Safety
///
/// `ptr` must have been returned by `page_alloc` and `size` must match the
/// original allocation size.
pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { libc::munmap(ptr as *mut libc::c_void, size) };
}

/// Return physical pages to the OS while keeping the virtual address range.
///
/// # Safety
///
/// `ptr` and `size` must refer to a range within a live `page_alloc`
/// allocation.
pub unsafe fn page_decommit(ptr: *mut u8, size: usize) {
    unsafe { libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_DONTNEED) };
}

/// OS small page size, cached after the first query.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let sz = if sz <= 0 { 4096 } else { sz as usize };
    PAGE_SIZE.store(sz, Ordering::Relaxed);
    sz
}

// ── CPU topology ────────────────────────────────────────────────────────────

/// Number of configured CPUs, cached after the first query.
pub fn num_cpus() -> usize {
    static NUM_CPUS: AtomicUsize = AtomicUsize::new(0);
    let cached = NUM_CPUS.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    let n = if n <= 0 { 1 } else { n as usize };
    NUM_CPUS.store(n, Ordering::Relaxed);
    n
}

/// Size of the rseq fields the kernel maintains, from the auxiliary vector.
/// 0 on kernels predating extensible rseq. A value >= 28 means `mm_cid`
/// is maintained.
pub fn rseq_feature_size() -> usize {
    const AT_RSEQ_FEATURE_SIZE: libc::c_ulong = 27;
    unsafe { libc::getauxval(AT_RSEQ_FEATURE_SIZE) as usize }
}

// ── Residency probing ───────────────────────────────────────────────────────

/// Number of bytes of `[addr, addr + size)` that are currently resident,
/// probed page by page with `mincore`. Works on a fixed stack buffer in
/// chunks so it never allocates.
pub fn resident_size(addr: *mut u8, size: usize) -> usize {
    const CHUNK_PAGES: usize = 512;

    let page = page_size();
    let mut vec = [0u8; CHUNK_PAGES];
    let mut resident_pages = 0usize;

    let end = addr as usize + size;
    let mut cur = addr as usize & !(page - 1);
    while cur < end {
        let chunk_pages = CHUNK_PAGES.min((end - cur).div_ceil(page));
        let rc = unsafe {
            libc::mincore(
                cur as *mut libc::c_void,
                chunk_pages * page,
                vec.as_mut_ptr() as *mut libc::c_uchar,
            )
        };
        if rc != 0 {
            // Range not mapped (already madvised away or unmapped): not resident.
            return resident_pages * page;
        }
        resident_pages += vec[..chunk_pages].iter().filter(|&&v| v & 1 != 0).count();
        cur += chunk_pages * page;
    }
    resident_pages * page
}

// ── Cross-CPU rseq fence ────────────────────────────────────────────────────

// membarrier(2) commands; kernel >= 5.10.
const MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ: libc::c_int = 1 << 7;
const MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_RSEQ: libc::c_int = 1 << 8;
const MEMBARRIER_CMD_FLAG_CPU: libc::c_uint = 1 << 0;

const FENCE_UNTRIED: u8 = 0;
const FENCE_READY: u8 = 1;
const FENCE_UNAVAILABLE: u8 = 2;

static FENCE_STATE: AtomicU8 = AtomicU8::new(FENCE_UNTRIED);

fn membarrier(cmd: libc::c_int, flags: libc::c_uint, cpu: libc::c_int) -> i64 {
    unsafe { libc::syscall(libc::SYS_membarrier, cmd, flags, cpu) as i64 }
}

/// Register this process for expedited rseq membarriers. Returns `true` if
/// the fence is usable. Must succeed before any fast path is enabled; a
/// kernel without `MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ` leaves the slow
/// path with no way to quiesce critical sections.
pub fn ensure_fence_registered() -> bool {
    match FENCE_STATE.load(Ordering::Acquire) {
        FENCE_READY => return true,
        FENCE_UNAVAILABLE => return false,
        _ => {}
    }
    let rc = membarrier(MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_RSEQ, 0, 0);
    let state = if rc == 0 { FENCE_READY } else { FENCE_UNAVAILABLE };
    FENCE_STATE.store(state, Ordering::Release);
    rc == 0
}

/// Interrupt any rseq critical section running on `cpu`: when this returns,
/// every critical section that was in progress there has either completed or
/// been aborted, and all its memory effects are visible.
///
/// The kernel treats the fence as an rseq event on the target CPU, so it also
/// rewrites `cpu_id_start` for threads running there, invalidating their
/// cached slab words.
///
/// No-op when the fence is unavailable, in which case no fast path ever runs
/// and there is nothing to quiesce.
pub fn fence_cpu(cpu: usize) {
    if FENCE_STATE.load(Ordering::Acquire) != FENCE_READY {
        return;
    }
    let rc = membarrier(
        MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ,
        MEMBARRIER_CMD_FLAG_CPU,
        cpu as libc::c_int,
    );
    if rc != 0 {
        // The targeted form can fail for a racing CPU hot-unplug; the
        // process-wide fence covers every case.
        fence_all_cpus();
    }
}

/// [`fence_cpu`] for every CPU at once.
pub fn fence_all_cpus() {
    if FENCE_STATE.load(Ordering::Acquire) != FENCE_READY {
        return;
    }
    let rc = membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ, 0, 0);
    assert!(rc == 0, "membarrier(PRIVATE_EXPEDITED_RSEQ) failed after registration");
}
