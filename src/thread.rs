//! Per-thread rseq area management and the cached-slabs word.
//!
//! Each thread owns a [`SlabArea`]: the kernel rseq area preceded by 4 bytes
//! of crate-owned storage. Together those 8 bytes form the *cached-slabs
//! word*:
//!
//! ```text
//!                    byte 28      byte 32              byte 36
//! ┌───────────────────┬────────────┬────────────────────┬───────────────┐
//! │ state + padding   │ slabs_lo   │ rseq.cpu_id_start  │ rseq.cpu_id … │
//! └───────────────────┴────────────┴────────────────────┴───────────────┘
//!                     └────── cached-slabs word ────────┘
//! ```
//!
//! When bit 63 of the word is set, the remaining bits hold the base address
//! of the current CPU's slab region. The upper half of the word aliases
//! `cpu_id_start`, which the kernel rewrites with the CPU number on every
//! preemption, migration, and signal delivery, so any reschedule clears
//! bit 63. A set bit therefore proves the thread has not been rescheduled
//! since the base was cached, which is what the fast path and
//! `store_current_cpu` rely on.
//!
//! Registration supports two situations:
//!
//! - No existing registration: register our own area via the raw syscall.
//! - glibc (>= 2.35) registered its area at thread start: our registration
//!   fails with EBUSY. We locate glibc's area through `__rseq_offset` /
//!   `__rseq_size` (resolved with `dlsym` so no weak-symbol linkage is
//!   needed), unregister it, and register our own. glibc's cached CPU id
//!   for `sched_getcpu` goes stale, which is harmless: the kernel keeps
//!   serving the syscall.
//!
//! Any failure leaves the thread in "always miss" mode; ENOSYS additionally
//! flips a process-wide flag so other threads skip the syscall entirely.

use core::cell::{Cell, UnsafeCell};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::abi::{CACHED_SLABS_MASK, RSEQ_MIN_SIZE, RSEQ_OFF_CPU_ID, RSEQ_OFF_MM_CID, Rseq};
use crate::{sys, syscall};

// ── Registration state ──────────────────────────────────────────────────────

const AREA_UNTRIED: u8 = 0;
const AREA_ACTIVE: u8 = 1;
const AREA_UNAVAILABLE: u8 = 2;

/// Process-wide "give up" flag: rseq or the membarrier fence is missing.
static RSEQ_UNAVAILABLE: AtomicBool = AtomicBool::new(false);

/// Returns `true` if rseq is (still believed to be) available on this
/// system. Before the first registration attempt on any thread this is
/// optimistically `true`.
pub fn rseq_available() -> bool {
    !RSEQ_UNAVAILABLE.load(Ordering::Relaxed)
}

// ── SlabArea ────────────────────────────────────────────────────────────────

/// Per-thread rseq area plus the cached-slabs word, in the fixed layout the
/// module docs describe. Lives in thread-local storage and is registered
/// with the kernel lazily on first use.
#[repr(C, align(32))]
pub struct SlabArea {
    /// Registration state of this thread's area.
    state: Cell<u8>,
    _pad: [u8; 27],
    /// Low half of the cached-slabs word. The high half is
    /// `rseq.cpu_id_start`.
    slabs_lo: Cell<u32>,
    /// The kernel-shared area. Must immediately follow `slabs_lo`.
    rseq: UnsafeCell<Rseq>,
}

// The cached-slabs word spans `slabs_lo` and `rseq.cpu_id_start`, and the
// kernel needs the rseq area 32-byte aligned.
const _: () = {
    assert!(core::mem::offset_of!(SlabArea, rseq) == core::mem::offset_of!(SlabArea, slabs_lo) + 4);
    assert!(core::mem::offset_of!(SlabArea, rseq) % 32 == 0);
};

impl SlabArea {
    /// Create an unregistered area. The cached-slabs word starts at zero.
    pub const fn new() -> Self {
        Self {
            state: Cell::new(AREA_UNTRIED),
            _pad: [0; 27],
            slabs_lo: Cell::new(0),
            rseq: UnsafeCell::new(Rseq::new()),
        }
    }

    /// Pointer to the kernel rseq area.
    #[inline(always)]
    pub fn rseq_ptr(&self) -> *mut Rseq {
        self.rseq.get()
    }

    /// Pointer to the 8-byte cached-slabs word (4 bytes before the rseq
    /// area). Only 4-byte aligned; all Rust-side accesses go through the
    /// 32-bit halves. Derived from the whole struct so it may span both
    /// `slabs_lo` and `rseq.cpu_id_start`.
    #[inline(always)]
    pub fn slabs_word_ptr(&self) -> *mut u64 {
        let base = self as *const SlabArea as *mut u8;
        unsafe { base.add(core::mem::offset_of!(SlabArea, slabs_lo)) as *mut u64 }
    }

    /// Read the cached-slabs word. The kernel only writes the word while
    /// this thread is off-CPU, so reading it in two halves cannot observe
    /// a torn update.
    #[inline(always)]
    pub fn read_word(&self) -> u64 {
        let p = self.slabs_word_ptr() as *const u32;
        let lo = unsafe { ptr::read_volatile(p) } as u64;
        let hi = unsafe { ptr::read_volatile(p.add(1)) } as u64;
        lo | (hi << 32)
    }

    /// Plain (non-restartable) write of the cached-slabs word. Used to
    /// uncache and to arm the caching loop; publishing a valid base goes
    /// through `ops::store_current_cpu` instead.
    #[inline(always)]
    pub fn write_word(&self, value: u64) {
        let p = self.slabs_word_ptr() as *mut u32;
        unsafe {
            ptr::write_volatile(p.add(1), (value >> 32) as u32);
            ptr::write_volatile(p, value as u32);
        }
    }

    /// The cached CPU region base, if the validity bit is still set.
    #[inline(always)]
    pub fn cached_base(&self) -> Option<*mut u8> {
        let word = self.read_word();
        if word & CACHED_SLABS_MASK != 0 {
            Some((word & !CACHED_SLABS_MASK) as *mut u8)
        } else {
            None
        }
    }

    /// Clear the cached-slabs word so the next fast-path operation misses.
    #[inline(always)]
    pub fn uncache(&self) {
        self.write_word(0);
    }

    /// Read the current (virtual) CPU id from the kernel-maintained field at
    /// `offset` bytes into the rseq area.
    #[inline(always)]
    pub fn virtual_cpu(&self, offset: usize) -> i32 {
        debug_assert!(offset == RSEQ_OFF_CPU_ID || offset == RSEQ_OFF_MM_CID);
        unsafe { ptr::read_volatile((self.rseq_ptr() as *const u8).add(offset) as *const u32) as i32 }
    }

    /// Whether this thread's area is registered and the fast path usable.
    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.state.get() == AREA_ACTIVE
    }

    /// Register this area with the kernel if not yet attempted. Returns
    /// `true` when the fast path is usable on this thread.
    #[inline(always)]
    pub fn ensure_registered(&self) -> bool {
        match self.state.get() {
            AREA_ACTIVE => true,
            AREA_UNAVAILABLE => false,
            _ => self.register_slow(),
        }
    }

    #[cold]
    #[inline(never)]
    fn register_slow(&self) -> bool {
        if RSEQ_UNAVAILABLE.load(Ordering::Relaxed) {
            self.state.set(AREA_UNAVAILABLE);
            return false;
        }

        // The slow path cannot quiesce fast paths without the expedited
        // rseq membarrier, so the fast path is all-or-nothing with it.
        if !sys::ensure_fence_registered() {
            log::warn!("membarrier(PRIVATE_EXPEDITED_RSEQ) unavailable, per-CPU fast path disabled");
            RSEQ_UNAVAILABLE.store(true, Ordering::Relaxed);
            self.state.set(AREA_UNAVAILABLE);
            return false;
        }

        let ok = match unsafe { syscall::rseq_register(self.rseq_ptr()) } {
            Ok(()) => true,
            Err(syscall::ENOSYS) => {
                log::warn!("rseq(2) unsupported by this kernel, per-CPU fast path disabled");
                RSEQ_UNAVAILABLE.store(true, Ordering::Relaxed);
                false
            }
            Err(syscall::EBUSY) => unsafe { take_over_existing_registration(self.rseq_ptr()) },
            Err(_) => false,
        };

        self.state.set(if ok { AREA_ACTIVE } else { AREA_UNAVAILABLE });
        ok
    }
}

impl Default for SlabArea {
    fn default() -> Self {
        Self::new()
    }
}

// ── glibc takeover ──────────────────────────────────────────────────────────

/// Read the thread pointer from the `fs` segment base (x86_64 Linux ABI).
#[cfg(target_arch = "x86_64")]
fn thread_pointer() -> usize {
    let tp: usize;
    unsafe {
        core::arch::asm!(
            "mov {tp}, fs:0",
            tp = out(reg) tp,
            options(nostack, preserves_flags, readonly, pure)
        );
    }
    tp
}

/// EBUSY from registration means another runtime (in practice glibc >= 2.35)
/// already registered an rseq area for this thread. Unregister it and claim
/// the slot for our own area. Returns `true` on success.
///
/// # Safety
///
/// `area` must be this thread's [`SlabArea`] rseq pointer.
#[cfg(target_arch = "x86_64")]
unsafe fn take_over_existing_registration(area: *mut Rseq) -> bool {
    let offset_sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"__rseq_offset".as_ptr()) };
    let size_sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"__rseq_size".as_ptr()) };
    if offset_sym.is_null() || size_sym.is_null() {
        // EBUSY from something other than glibc: leave it alone.
        return false;
    }

    let offset = unsafe { *(offset_sym as *const isize) };
    let size = unsafe { *(size_sym as *const libc::c_uint) };
    if size == 0 {
        return false;
    }

    let glibc_area = (thread_pointer() as i64 + offset as i64) as *mut Rseq;
    // glibc registers with the published size, except some versions expose
    // the feature size while registering the padded minimum.
    let registered = unsafe { syscall::rseq_unregister(glibc_area, size.max(RSEQ_MIN_SIZE)) }
        .or_else(|_| unsafe { syscall::rseq_unregister(glibc_area, RSEQ_MIN_SIZE) });
    if registered.is_err() {
        return false;
    }

    unsafe { syscall::rseq_register(area) }.is_ok()
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn take_over_existing_registration(_area: *mut Rseq) -> bool {
    false
}

// ── Thread-local storage ────────────────────────────────────────────────────

#[cfg(feature = "nightly")]
mod tls {
    use super::SlabArea;

    #[thread_local]
    static AREA: SlabArea = SlabArea::new();

    #[inline(always)]
    pub fn area_ptr() -> *const SlabArea {
        &AREA
    }
}

#[cfg(all(feature = "std", not(feature = "nightly")))]
mod tls {
    use super::SlabArea;

    std::thread_local! {
        static AREA: SlabArea = const { SlabArea::new() };
    }

    #[inline(always)]
    pub fn area_ptr() -> *const SlabArea {
        AREA.with(|a| a as *const SlabArea)
    }
}

#[cfg(not(any(feature = "std", feature = "nightly")))]
mod tls {
    use super::SlabArea;

    pub fn area_ptr() -> *const SlabArea {
        core::ptr::null()
    }
}

/// The calling thread's registered [`SlabArea`], registering it on first
/// use. `None` when rseq is unavailable (old kernel, registration conflict,
/// no membarrier, unsupported target, or neither `std` nor `nightly`
/// enabled); every fast-path operation then reports a miss.
///
/// The returned pointer is valid for the lifetime of the calling thread and
/// must not be shared with other threads.
#[inline(always)]
pub fn current_area() -> Option<*const SlabArea> {
    let area = tls::area_ptr();
    if area.is_null() {
        return None;
    }
    if unsafe { (*area).ensure_registered() } { Some(area) } else { None }
}

/// Clear the calling thread's cached slab base, if any, so the next
/// fast-path operation misses and re-derives it through the slow path.
pub fn uncache_current_cpu() {
    let area = tls::area_ptr();
    if !area.is_null() {
        let area = unsafe { &*area };
        if area.is_active() {
            area.uncache();
        }
    }
}

/// The CPU the calling thread is currently running on, from the rseq area.
/// `None` when rseq is unavailable.
pub fn current_cpu() -> Option<u32> {
    let area = current_area()?;
    let cpu = unsafe { (*area).virtual_cpu(RSEQ_OFF_CPU_ID) };
    if cpu < 0 { None } else { Some(cpu as u32) }
}
