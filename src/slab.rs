//! Per-CPU slab bank: LIFO pointer stacks per (CPU, size class) with
//! lock-free push/pop through restartable sequences.
//!
//! A single contiguous region is divided among CPUs. Each CPU gets
//! `2^shift` bytes containing:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │ Header[0]  (8 bytes, unused; class 0 is reserved)   │
//! │ Header[1]  {current | end_copy | begin | end}       │
//! │ ...                                                 │
//! │ Header[NUM_CLASSES-1]                               │
//! │ sentinel slot (low bit set)                         │
//! │ Slot array for class 1: [*mut u8; capacity(1)]      │
//! │ sentinel slot                                       │
//! │ Slot array for class 2: [*mut u8; capacity(2)]      │
//! │ ...                                                 │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The sentinel below each class doubles as the begin-of-stack marker and as
//! a safe prefetch target: pop prefetches the slot below the returned item,
//! and the sentinel keeps that read in bounds when the stack runs empty.
//! Consecutive classes share a sentinel when the earlier class has zero
//! capacity.
//!
//! Fast-path operations only ever commit a 16-bit `current`; the slow path
//! performs full-header stores, but only after parking the CPU behind a
//! `stopped` flag and interrupting its critical sections with a cross-CPU
//! rseq fence. The two never write the same bytes concurrently.
//!
//! The slab does **not** own the backing memory; the caller allocates it
//! (page-aligned, zeroed, e.g. `sys::page_alloc`) and receives it back from
//! [`PerCpuSlab::destroy`] or [`PerCpuSlab::resize_slabs`].

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering, compiler_fence};
use core::{cmp, mem, ptr, slice};

use crate::abi::{CACHED_SLABS_MASK, RSEQ_OFF_CPU_ID, RSEQ_OFF_MM_CID};
use crate::header::{self, Header};
use crate::thread::{self, SlabArea};
use crate::{ops, sys};

/// Low bit marking a slot value as a begin-of-stack sentinel rather than a
/// cached object. Object pointers are word-aligned so the bit is never set
/// on a real item.
pub const BEGIN_MARK: usize = 1;

/// The shift occupies the low byte of the packed `(slabs, shift)` word; the
/// page-aligned slabs pointer provides at least that much alignment.
const SHIFT_MASK: usize = 0xff;

/// Source of the per-thread CPU index used to pick a slab region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VirtualCpuMode {
    /// Physical CPU number (`rseq.cpu_id`).
    Physical,
    /// Per-process concurrency id (`rseq.mm_cid`, kernel >= 6.3). Denser
    /// than CPU numbers when a process runs on a restricted CPU set.
    MmCid,
}

/// Virtual and resident footprint of the slab bank plus its side metadata.
#[derive(Clone, Copy, Debug)]
pub struct MetadataMemoryUsage {
    pub virtual_size: usize,
    pub resident_size: usize,
}

/// Result of [`PerCpuSlab::resize_slabs`]: the previous region, ready to be
/// released with `sys::page_decommit`. A thread that was never rescheduled
/// since before the resize may still read the old region's (locked) headers
/// through its stale cached base, so the address range must stay mapped;
/// unmap it only once such threads cannot exist (for instance at teardown).
#[derive(Debug)]
pub struct ResizeInfo {
    pub old_slabs: *mut u8,
    pub old_slabs_size: usize,
}

// ── PerCpuSlab ───────────────────────────────────────────────────────────────

/// Per-CPU slab bank with LIFO stacks per size class.
///
/// `NUM_CLASSES` is the total number of size classes including the reserved
/// class 0. Fast-path operations take the class index of the *current*
/// thread's CPU region; all cross-CPU maintenance goes through the slow
/// path, which callers must serialize with one external mutex.
pub struct PerCpuSlab<const NUM_CLASSES: usize> {
    /// Packed `(slabs_ptr | shift)`; a single atomic word so both swap
    /// together during a resize.
    slabs_and_shift: AtomicUsize,
    /// Per-CPU flags forcing every fast path on that CPU to miss; set by the
    /// slow path and made effective by a cross-CPU fence. Allocated through
    /// the `alloc` callback passed to `init`.
    stopped: *mut AtomicBool,
    /// CPUs provisioned at init.
    num_cpus: usize,
    /// Byte offset of the CPU index field within the rseq area.
    virtual_cpu_id_offset: usize,
    /// Per-class begin offsets in slots. Identical across CPUs (the layout
    /// depends only on the capacity schedule).
    begins: [AtomicU16; NUM_CLASSES],
}

// Safety: shared state is the region (each CPU's part touched only by
// threads on that CPU or behind stopped+fence), `stopped`, and atomics.
unsafe impl<const N: usize> Sync for PerCpuSlab<N> {}
unsafe impl<const N: usize> Send for PerCpuSlab<N> {}

#[inline]
fn cpu_memory_start(slabs: *mut u8, shift: u32, cpu: usize) -> *mut u8 {
    slabs.wrapping_add(cpu << shift)
}

#[inline]
fn header_ptr(slabs: *mut u8, shift: u32, cpu: usize, size_class: usize) -> *const AtomicU64 {
    debug_assert!(size_class != 0);
    cpu_memory_start(slabs, shift, cpu).wrapping_add(size_class * 8) as *const AtomicU64
}

impl<const NUM_CLASSES: usize> PerCpuSlab<NUM_CLASSES> {
    /// Create an empty slab bank. [`init`](Self::init) must be called before
    /// any other method.
    pub const fn new() -> Self {
        Self {
            slabs_and_shift: AtomicUsize::new(0),
            stopped: ptr::null_mut(),
            num_cpus: 0,
            virtual_cpu_id_offset: RSEQ_OFF_CPU_ID,
            begins: [const { AtomicU16::new(0) }; NUM_CLASSES],
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// Whether `init` has run (and `destroy` has not).
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.slabs_and_shift.load(Ordering::Relaxed) != 0
    }

    /// Current `(slabs, shift)`, read once so both halves are consistent.
    #[inline]
    fn slabs_and_shift(&self, order: Ordering) -> (*mut u8, u32) {
        let raw = self.slabs_and_shift.load(order);
        ((raw & !SHIFT_MASK) as *mut u8, (raw & SHIFT_MASK) as u32)
    }

    /// Log2 of the per-CPU region size in bytes.
    #[inline]
    pub fn shift(&self) -> u8 {
        self.slabs_and_shift(Ordering::Relaxed).1 as u8
    }

    /// CPUs provisioned at init.
    #[inline]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Begin offset of a size class, in slots. Identical for every CPU.
    #[inline]
    pub fn begin(&self, size_class: usize) -> u16 {
        self.begins[size_class].load(Ordering::Relaxed)
    }

    #[inline]
    fn stopped_ref(&self, cpu: usize) -> &AtomicBool {
        debug_assert!(cpu < self.num_cpus);
        unsafe { &*self.stopped.add(cpu) }
    }

    /// Number of cached objects for `size_class` on `cpu`. 0 while locked.
    pub fn length(&self, cpu: usize, size_class: usize) -> usize {
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        let hdr = unsafe { header::load(header_ptr(slabs, shift, cpu, size_class)) };
        if hdr.is_locked() { 0 } else { (hdr.current - hdr.begin) as usize }
    }

    /// Currently allowed capacity for `size_class` on `cpu`. 0 while locked.
    pub fn capacity(&self, cpu: usize, size_class: usize) -> usize {
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        let hdr = unsafe { header::load(header_ptr(slabs, shift, cpu, size_class)) };
        if hdr.is_locked() { 0 } else { (hdr.end - hdr.begin) as usize }
    }

    // ── Init ─────────────────────────────────────────────────────────

    /// One-time initialization over a caller-provided region.
    ///
    /// - `alloc(size, align)`: allocator for the `stopped` metadata array.
    /// - `slabs`: zeroed region of `num_cpus << shift` bytes, page-aligned.
    /// - `capacity(size_class)`: maximum slot count per class; defines the
    ///   region layout. Every slab starts at capacity 0 and must be grown.
    /// - `vcpu`: which kernel-maintained index selects the CPU region.
    ///
    /// CPU 0 is initialized eagerly; other CPUs lazily via
    /// [`init_cpu`](Self::init_cpu).
    ///
    /// # Safety
    ///
    /// `slabs` must be valid, zeroed, and remain valid until `destroy` or
    /// `resize_slabs` hands it back.
    pub unsafe fn init(
        &mut self,
        mut alloc: impl FnMut(usize, usize) -> *mut u8,
        slabs: *mut u8,
        num_cpus: usize,
        shift: u32,
        capacity: impl Fn(usize) -> u16,
        vcpu: VirtualCpuMode,
    ) {
        assert!(NUM_CLASSES >= 2, "need at least one usable size class");
        assert!(!self.is_initialized(), "init called twice");
        assert!(!slabs.is_null() && num_cpus > 0);
        assert_eq!(slabs as usize & SHIFT_MASK, 0, "slabs region under-aligned");

        self.num_cpus = num_cpus;
        self.virtual_cpu_id_offset = match vcpu {
            VirtualCpuMode::Physical => RSEQ_OFF_CPU_ID,
            VirtualCpuMode::MmCid => {
                assert!(
                    sys::rseq_feature_size() >= RSEQ_OFF_MM_CID + 4,
                    "kernel does not maintain mm_cid"
                );
                RSEQ_OFF_MM_CID
            }
        };

        let stopped_bytes = num_cpus * mem::size_of::<AtomicBool>();
        self.stopped = alloc(stopped_bytes, 64) as *mut AtomicBool;
        assert!(!self.stopped.is_null(), "stopped[] allocation failed");
        for cpu in 0..num_cpus {
            unsafe { ptr::write(self.stopped.add(cpu), AtomicBool::new(false)) };
        }

        self.slabs_and_shift
            .store(slabs as usize | shift as usize, Ordering::Relaxed);
        unsafe { self.init_cpu_impl(slabs, shift, 0, true, &capacity) };

        // CPU 0 is populated eagerly; no other thread can race this.
        self.stopped_ref(0).store(true, Ordering::Relaxed);
        unsafe { self.init_cpu_impl(slabs, shift, 0, false, &capacity) };
        self.stopped_ref(0).store(false, Ordering::Relaxed);

        // A previous slab bank may have left a cached base in this thread.
        thread::uncache_current_cpu();

        log::info!(
            "per-cpu slab bank initialized: {} cpus, {} classes, {} KiB per cpu",
            num_cpus,
            NUM_CLASSES - 1,
            (1usize << shift) >> 10,
        );
    }

    /// Lay out one CPU's region. With `init_begins` only the shared
    /// `begins[]` array is written (the CPU index is then irrelevant);
    /// otherwise headers and sentinels are stored into the region.
    ///
    /// # Safety
    ///
    /// Unless `init_begins`, `cpu` must be stopped and `slabs`/`shift` must
    /// describe a live region.
    unsafe fn init_cpu_impl(
        &self,
        slabs: *mut u8,
        shift: u32,
        cpu: usize,
        init_begins: bool,
        capacity: &impl Fn(usize) -> u16,
    ) {
        assert!(init_begins || self.stopped_ref(cpu).load(Ordering::Relaxed));
        // Every offset must fit the headers' u16 fields.
        assert!(
            (1usize << shift) <= (1usize << 16) * mem::size_of::<*mut u8>(),
            "shift {shift} exceeds the addressable offset range"
        );

        let slots = cpu_memory_start(slabs, shift, cpu) as *mut usize;
        // Headers occupy the first NUM_CLASSES slots.
        let mut idx = NUM_CLASSES;
        let mut prev_empty = false;
        for size_class in 1..NUM_CLASSES {
            let cap = capacity(size_class);

            // Sentinel below the class: begin-of-stack marker and valid
            // prefetch target. A zero-capacity predecessor shares its own.
            if !prev_empty {
                if !init_begins {
                    unsafe {
                        let sentinel = slots.add(idx);
                        sentinel.write(sentinel as usize | BEGIN_MARK);
                    }
                }
                idx += 1;
            }
            prev_empty = cap == 0;

            debug_assert!(idx <= u16::MAX as usize);
            let off = idx as u16;
            if init_begins {
                self.begins[size_class].store(off, Ordering::Relaxed);
            } else {
                let hdr = Header { current: off, end_copy: off, begin: off, end: off };
                unsafe { header::store(header_ptr(slabs, shift, cpu, size_class), hdr) };
            }

            idx += cap as usize;
            let bytes_used = idx * mem::size_of::<usize>();
            if bytes_used > (1usize << shift) {
                panic!(
                    "per-cpu region exceeded: have {} bytes (shift {shift}), need {bytes_used}",
                    1usize << shift
                );
            }
        }
    }

    /// Lazily initialize the slab for `cpu`. Until this (or init, for
    /// CPU 0) has run, only push/pop/batch operations are valid for the CPU
    /// and they always miss.
    ///
    /// # Safety
    ///
    /// Caller holds the external slow-path mutex.
    pub unsafe fn init_cpu(&self, cpu: usize, capacity: impl Fn(usize) -> u16) {
        let _stop = ScopedCpuStop::new(self, cpu);
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        unsafe { self.init_cpu_impl(slabs, shift, cpu, false, &capacity) };
    }

    // ── Fast path ────────────────────────────────────────────────────

    /// Add `item` to the current CPU's slab. Returns `true` on success;
    /// on `false` (no cached slab, class full or locked, or restart) the
    /// caller serves the item through its overflow path.
    #[inline]
    pub fn push(&self, size_class: usize, item: *mut u8) -> bool {
        debug_assert!(size_class != 0 && size_class < NUM_CLASSES);
        debug_assert!(!item.is_null() && (item as usize & BEGIN_MARK) == 0);
        match thread::current_area() {
            Some(area) => {
                let area = unsafe { &*area };
                unsafe { ops::push(area.rseq_ptr(), area.slabs_word_ptr(), size_class, item) }
            }
            None => false,
        }
    }

    /// Remove the most recently pushed item for `size_class` on the current
    /// CPU. `None` (empty, locked, no cached slab, or restart) sends the
    /// caller to its underflow path.
    ///
    /// On a hit the next object to be popped is prefetched.
    #[inline]
    pub fn pop(&self, size_class: usize) -> Option<*mut u8> {
        debug_assert!(size_class != 0 && size_class < NUM_CLASSES);
        let area = thread::current_area()?;
        let area = unsafe { &*area };
        let (item, next) =
            unsafe { ops::pop(area.rseq_ptr(), area.slabs_word_ptr(), size_class) }?;
        debug_assert!(!item.is_null());
        ops::prefetch_next_object(next);
        Some(item)
    }

    /// Push up to `batch.len()` items. Returns the number pushed, taken
    /// from the tail of `batch`; unprocessed items stay at the start. The
    /// processed suffix commits atomically with respect to restarts.
    #[inline]
    pub fn push_batch(&self, size_class: usize, batch: &[*mut u8]) -> usize {
        debug_assert!(size_class != 0 && size_class < NUM_CLASSES);
        assert!(!batch.is_empty());
        match thread::current_area() {
            Some(area) => {
                let area = unsafe { &*area };
                unsafe {
                    ops::push_batch(
                        area.rseq_ptr(),
                        area.slabs_word_ptr(),
                        size_class,
                        batch.as_ptr(),
                        batch.len(),
                    )
                }
            }
            None => 0,
        }
    }

    /// Pop up to `batch.len()` items into `batch[0..n]`, most recently
    /// pushed first. Returns `n`; atomic like [`push_batch`].
    #[inline]
    pub fn pop_batch(&self, size_class: usize, batch: &mut [*mut u8]) -> usize {
        debug_assert!(size_class != 0 && size_class < NUM_CLASSES);
        assert!(!batch.is_empty());
        match thread::current_area() {
            Some(area) => {
                let area = unsafe { &*area };
                unsafe {
                    ops::pop_batch(
                        area.rseq_ptr(),
                        area.slabs_word_ptr(),
                        size_class,
                        batch.as_mut_ptr(),
                        batch.len(),
                    )
                }
            }
            None => 0,
        }
    }

    // ── Caching the CPU region ───────────────────────────────────────

    /// Ensure the calling thread has its CPU's region base cached. Returns
    /// `(cpu, newly_cached)`, or `None` when the fast path cannot be used
    /// right now (rseq unavailable, or the CPU is stopped by a concurrent
    /// resize); the caller then serves through its fallback handlers.
    #[inline]
    pub fn cache_cpu_slab(&self) -> Option<(usize, bool)> {
        let area = thread::current_area()?;
        let area = unsafe { &*area };
        if area.read_word() & CACHED_SLABS_MASK == 0 {
            return self.cache_cpu_slab_slow(area);
        }
        let cpu = area.virtual_cpu(self.virtual_cpu_id_offset);
        debug_assert!(cpu >= 0);
        Some((cpu as usize, false))
    }

    #[cold]
    #[inline(never)]
    fn cache_cpu_slab_slow(&self, area: &SlabArea) -> Option<(usize, bool)> {
        let cpu;
        loop {
            debug_assert_eq!(area.read_word() & CACHED_SLABS_MASK, 0);
            // Arm the word with an empty base. Any reschedule from here on
            // clears the bit again and fails the publishing store.
            area.write_word(CACHED_SLABS_MASK);
            compiler_fence(Ordering::SeqCst);
            let c = area.virtual_cpu(self.virtual_cpu_id_offset);
            if c < 0 {
                area.uncache();
                return None;
            }
            let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
            let start = cpu_memory_start(slabs, shift, c as usize);
            let word = start as u64 | CACHED_SLABS_MASK;
            if unsafe {
                ops::store_current_cpu(
                    area.rseq_ptr(),
                    area.slabs_word_ptr(),
                    area.slabs_word_ptr(),
                    word,
                )
            } {
                cpu = c as usize;
                break;
            }
        }
        // A concurrent resize may have swapped `slabs_and_shift` between our
        // read and the publish. Its fence cannot abort us once the store
        // committed, so re-check `stopped`: the resize sets it before
        // fencing and clears it only after the swap, and a miss here just
        // sends this request through the fallback path.
        compiler_fence(Ordering::SeqCst);
        debug_assert!(cpu < self.num_cpus);
        if self.stopped_ref(cpu).load(Ordering::Acquire) {
            area.uncache();
            return None;
        }
        Some((cpu, true))
    }

    /// Drop the calling thread's cached region base so subsequent fast-path
    /// operations miss until [`cache_cpu_slab`](Self::cache_cpu_slab) runs
    /// again.
    #[inline]
    pub fn uncache_cpu_slab(&self) {
        thread::uncache_current_cpu();
    }

    // ── Capacity management ──────────────────────────────────────────

    /// If the calling thread is still on `cpu`, raise the class capacity to
    /// at most `min(capacity + len, max_capacity(shift))` and return the
    /// applied increment. Returns 0 if rescheduled, locked, or already at
    /// the cap.
    ///
    /// `cpu` must be the value returned by a preceding
    /// [`cache_cpu_slab`](Self::cache_cpu_slab) on this thread.
    pub fn grow(
        &self,
        cpu: usize,
        size_class: usize,
        len: usize,
        max_capacity: impl FnOnce(u8) -> usize,
    ) -> usize {
        debug_assert!(size_class != 0 && size_class < NUM_CLASSES);
        debug_assert!(cpu < self.num_cpus);
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        let max_cap = max_capacity(shift as u8);
        let hdrp = header_ptr(slabs, shift, cpu, size_class);
        let mut hdr = unsafe { header::load(hdrp) };
        if hdr.is_locked() {
            return 0;
        }
        let used = (hdr.end - hdr.begin) as usize;
        if max_cap <= used {
            return 0;
        }
        let n = cmp::min(len, max_cap - used) as u16;
        hdr.end += n;
        hdr.end_copy += n;

        let Some(area) = thread::current_area() else { return 0 };
        let area = unsafe { &*area };
        // The full-header store is gated on the cached-slabs word, so a
        // reschedule between the load above and here makes it a no-op.
        if unsafe {
            ops::store_current_cpu(
                area.rseq_ptr(),
                area.slabs_word_ptr(),
                hdrp as *mut u64,
                hdr.to_bits(),
            )
        } {
            n as usize
        } else {
            0
        }
    }

    /// [`grow`](Self::grow) for a CPU the caller is not running on.
    ///
    /// # Safety
    ///
    /// `cpu` must be stopped (see [`stop_cpu`](Self::stop_cpu)) and its slab
    /// initialized; caller holds the external slow-path mutex.
    pub unsafe fn grow_other_cache(
        &self,
        cpu: usize,
        size_class: usize,
        len: usize,
        max_capacity: impl FnOnce(u8) -> usize,
    ) -> usize {
        debug_assert!(size_class != 0 && size_class < NUM_CLASSES);
        assert!(self.stopped_ref(cpu).load(Ordering::Relaxed));
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        let max_cap = max_capacity(shift as u8);
        let hdrp = header_ptr(slabs, shift, cpu, size_class);
        let mut hdr = unsafe { header::load(hdrp) };
        assert!(hdr.is_initialized());
        let begin = self.begins[size_class].load(Ordering::Relaxed);
        debug_assert_eq!(begin, hdr.begin);
        let used = (hdr.end - begin) as usize;
        if max_cap <= used {
            return 0;
        }
        let n = cmp::min(len, max_cap - used) as u16;
        hdr.end += n;
        hdr.end_copy += n;
        unsafe { header::store(hdrp, hdr) };
        n as usize
    }

    /// Lower the class capacity on `cpu` by up to `len`, popping cached
    /// items through `shrink_handler` first if the unused capacity alone
    /// does not cover the request. Returns the applied decrement.
    ///
    /// # Safety
    ///
    /// Same requirements as [`grow_other_cache`](Self::grow_other_cache).
    pub unsafe fn shrink_other_cache(
        &self,
        cpu: usize,
        size_class: usize,
        len: usize,
        mut shrink_handler: impl FnMut(usize, &mut [*mut u8]),
    ) -> usize {
        debug_assert!(size_class != 0 && size_class < NUM_CLASSES);
        assert!(len > 0);
        assert!(self.stopped_ref(cpu).load(Ordering::Relaxed));
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        let hdrp = header_ptr(slabs, shift, cpu, size_class);
        let mut hdr = unsafe { header::load(hdrp) };
        assert!(hdr.is_initialized());
        let begin = self.begins[size_class].load(Ordering::Relaxed);
        debug_assert_eq!(begin, hdr.begin);

        let unused = (hdr.end - hdr.current) as usize;
        if unused < len && hdr.current != begin {
            let pop = cmp::min((len - unused) as u16, hdr.current - begin);
            let slots = cpu_memory_start(slabs, shift, cpu) as *mut *mut u8;
            let batch = unsafe {
                slice::from_raw_parts_mut(slots.add((hdr.current - pop) as usize), pop as usize)
            };
            shrink_handler(size_class, batch);
            hdr.current -= pop;
        }

        let to_shrink = cmp::min(len, (hdr.end - hdr.current) as usize) as u16;
        hdr.end -= to_shrink;
        hdr.end_copy -= to_shrink;
        unsafe { header::store(hdrp, hdr) };
        to_shrink as usize
    }

    // ── Stop / drain ─────────────────────────────────────────────────

    /// Park `cpu`: set its `stopped` flag and interrupt any critical section
    /// running there. On return no fast path on `cpu` is mid-commit and all
    /// further ones miss until [`start_cpu`](Self::start_cpu).
    pub fn stop_cpu(&self, cpu: usize) {
        assert!(cpu < self.num_cpus);
        assert!(!self.stopped_ref(cpu).load(Ordering::Relaxed));
        // Relaxed is enough: the fence orders this store before any
        // subsequent critical section on the target CPU.
        self.stopped_ref(cpu).store(true, Ordering::Relaxed);
        self.fence_cpu(cpu);
    }

    /// Reopen `cpu` for fast-path traffic.
    pub fn start_cpu(&self, cpu: usize) {
        assert!(cpu < self.num_cpus);
        assert!(self.stopped_ref(cpu).load(Ordering::Relaxed));
        self.stopped_ref(cpu).store(false, Ordering::Release);
    }

    fn fence_cpu(&self, cpu: usize) {
        if self.virtual_cpu_id_offset == RSEQ_OFF_MM_CID {
            // A concurrency id does not name a physical CPU; fence them all.
            sys::fence_all_cpus();
        } else {
            sys::fence_cpu(cpu);
        }
    }

    /// Remove all items of all classes from `cpu`'s slab and reset every
    /// capacity to zero. For each initialized class the handler receives
    /// `(cpu, size_class, items, capacity)` with `items` pointing into the
    /// slab. The CPU is restarted even if the handler panics.
    ///
    /// # Safety
    ///
    /// Caller holds the external slow-path mutex; no concurrent `drain` for
    /// the same CPU. Concurrent push/pop (any CPU) is fine.
    pub unsafe fn drain(&self, cpu: usize, mut drain_handler: impl FnMut(usize, usize, &mut [*mut u8], usize)) {
        let _stop = ScopedCpuStop::new(self, cpu);
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        unsafe { self.drain_cpu(slabs, shift, cpu, &mut drain_handler) };
    }

    /// Drain one CPU of a specific region. Reads `begin` from the headers
    /// themselves: during a resize `begins[]` already describes the *new*
    /// region while old-region headers are still being drained.
    ///
    /// # Safety
    ///
    /// `cpu` is stopped; `slabs`/`shift` describe a region whose headers
    /// are not concurrently mutated.
    unsafe fn drain_cpu(
        &self,
        slabs: *mut u8,
        shift: u32,
        cpu: usize,
        drain_handler: &mut impl FnMut(usize, usize, &mut [*mut u8], usize),
    ) {
        debug_assert!(self.stopped_ref(cpu).load(Ordering::Relaxed));
        for size_class in 1..NUM_CLASSES {
            let hdrp = header_ptr(slabs, shift, cpu, size_class);
            let mut hdr = unsafe { header::load(hdrp) };
            if !hdr.is_initialized() {
                continue;
            }
            let begin = hdr.begin;
            let size = (hdr.current - begin) as usize;
            let cap = (hdr.end - begin) as usize;

            let slots = cpu_memory_start(slabs, shift, cpu) as *mut *mut u8;
            let batch = unsafe { slice::from_raw_parts_mut(slots.add(begin as usize), size) };
            drain_handler(cpu, size_class, batch, cap);

            hdr.current = begin;
            hdr.end = begin;
            unsafe { header::store(hdrp, hdr) };
        }
    }

    // ── Resize ───────────────────────────────────────────────────────

    /// Move the slab bank to `new_slabs` with a new per-CPU region size of
    /// `1 << new_shift` bytes, draining old contents through
    /// `drain_handler`, without stopping the world:
    ///
    /// 1. Stop every CPU and lay out the new region for each populated one;
    ///    publish `begins[]` for the new layout.
    /// 2. Fence all CPUs: no critical section against the old region
    ///    survives, and every thread's cached base is invalidated.
    /// 3. Drain the old region (old contents are authoritative until here),
    ///    then lock its headers; a stale reader finds only dead ends.
    /// 4. Swap `(slabs, shift)` in one store and reconfirm `begins[]`.
    /// 5. Restart all CPUs.
    ///
    /// Returns the old region for the caller to release.
    ///
    /// # Safety
    ///
    /// Caller holds the external slow-path mutex; no concurrent `init_cpu`,
    /// `shrink_other_cache`, or `drain`. `new_slabs` must be valid, zeroed,
    /// page-aligned, and `num_cpus << new_shift` bytes.
    pub unsafe fn resize_slabs(
        &self,
        new_shift: u32,
        new_slabs: *mut u8,
        capacity: impl Fn(usize) -> u16,
        populated: impl Fn(usize) -> bool,
        mut drain_handler: impl FnMut(usize, usize, &mut [*mut u8], usize),
    ) -> ResizeInfo {
        let (old_slabs, old_shift) = self.slabs_and_shift(Ordering::Relaxed);
        assert!(self.is_initialized());
        assert_ne!(new_shift, old_shift);
        assert!(!new_slabs.is_null());
        assert_eq!(new_slabs as usize & SHIFT_MASK, 0, "new region under-aligned");
        log::debug!("resizing slab bank: shift {old_shift} -> {new_shift}");

        // Phase 1: stop everything, pre-build the new region.
        for cpu in 0..self.num_cpus {
            assert!(!self.stopped_ref(cpu).load(Ordering::Relaxed));
            self.stopped_ref(cpu).store(true, Ordering::Relaxed);
            if populated(cpu) {
                unsafe { self.init_cpu_impl(new_slabs, new_shift, cpu, false, &capacity) };
            }
        }
        unsafe { self.init_cpu_impl(new_slabs, new_shift, 0, true, &capacity) };

        // Phase 2: after this, nothing commits against the old region.
        sys::fence_all_cpus();

        // Phase 3: hand old contents back, exactly once, then shut the door.
        for cpu in 0..self.num_cpus {
            if !populated(cpu) {
                continue;
            }
            unsafe { self.drain_cpu(old_slabs, old_shift, cpu, &mut drain_handler) };
            for size_class in 1..NUM_CLASSES {
                unsafe { header::lock(header_ptr(old_slabs, old_shift, cpu, size_class)) };
            }
        }

        // Phase 4: swap. Relaxed suffices; a stale read only costs a
        // slow-path retry, and the phase-2 fence rules out stale commits.
        self.slabs_and_shift
            .store(new_slabs as usize | new_shift as usize, Ordering::Relaxed);
        unsafe { self.init_cpu_impl(new_slabs, new_shift, 0, true, &capacity) };

        // Phase 5: reopen.
        for cpu in 0..self.num_cpus {
            self.stopped_ref(cpu).store(false, Ordering::Release);
        }

        // The fence invalidated cached bases on every CPU, but the calling
        // thread itself may have kept its word across the syscall. Clear it;
        // every other thread heals on its next reschedule.
        thread::uncache_current_cpu();

        ResizeInfo {
            old_slabs,
            old_slabs_size: self.num_cpus << old_shift,
        }
    }

    // ── Teardown / observability ─────────────────────────────────────

    /// Release the metadata and forget the region. Returns the region
    /// pointer for the caller to unmap or madvise away.
    ///
    /// # Safety
    ///
    /// No concurrent use of `self`; `free` must match the `alloc` passed to
    /// `init`.
    pub unsafe fn destroy(&mut self, mut free: impl FnMut(*mut u8, usize, usize)) -> *mut u8 {
        assert!(self.is_initialized());
        free(
            self.stopped as *mut u8,
            self.num_cpus * mem::size_of::<AtomicBool>(),
            64,
        );
        self.stopped = ptr::null_mut();
        for begin in &self.begins {
            begin.store(0, Ordering::Relaxed);
        }
        let (slabs, _) = self.slabs_and_shift(Ordering::Relaxed);
        self.slabs_and_shift.store(0, Ordering::Relaxed);
        slabs
    }

    /// Virtual and resident bytes held by the slab bank and its metadata.
    /// Residency of the (lazily faulted) region is probed page by page.
    pub fn metadata_memory_usage(&self) -> MetadataMemoryUsage {
        let (slabs, shift) = self.slabs_and_shift(Ordering::Relaxed);
        let slabs_size = self.num_cpus << shift;
        let virtual_size = slabs_size
            + self.num_cpus * mem::size_of::<AtomicBool>()
            + NUM_CLASSES * mem::size_of::<AtomicU16>();
        let resident_size = if slabs.is_null() {
            0
        } else {
            sys::resident_size(slabs, slabs_size)
        };
        MetadataMemoryUsage { virtual_size, resident_size }
    }
}

impl<const N: usize> Default for PerCpuSlab<N> {
    fn default() -> Self {
        Self::new()
    }
}

// ── ScopedCpuStop ────────────────────────────────────────────────────────────

/// Stops a CPU for the guard's lifetime. Restarting on drop keeps the CPU
/// usable even when a drain or init handler panics.
struct ScopedCpuStop<'a, const NUM_CLASSES: usize> {
    slab: &'a PerCpuSlab<NUM_CLASSES>,
    cpu: usize,
}

impl<'a, const NUM_CLASSES: usize> ScopedCpuStop<'a, NUM_CLASSES> {
    fn new(slab: &'a PerCpuSlab<NUM_CLASSES>, cpu: usize) -> Self {
        slab.stop_cpu(cpu);
        Self { slab, cpu }
    }
}

impl<const N: usize> Drop for ScopedCpuStop<'_, N> {
    fn drop(&mut self) {
        self.slab.start_cpu(self.cpu);
    }
}

// ── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const NUM_CLASSES: usize = 4;

    fn capacities(size_class: usize) -> u16 {
        [0u16, 6, 0, 10][size_class]
    }

    fn metadata_alloc(size: usize, align: usize) -> *mut u8 {
        let layout = std::alloc::Layout::from_size_align(size, align).unwrap();
        unsafe { std::alloc::alloc_zeroed(layout) }
    }

    fn metadata_free(ptr: *mut u8, size: usize, align: usize) {
        let layout = std::alloc::Layout::from_size_align(size, align).unwrap();
        unsafe { std::alloc::dealloc(ptr, layout) };
    }

    fn make_slab(num_cpus: usize, shift: u32) -> (PerCpuSlab<NUM_CLASSES>, *mut u8) {
        let region = unsafe { sys::page_alloc(num_cpus << shift) };
        assert!(!region.is_null());
        let mut slab = PerCpuSlab::<NUM_CLASSES>::new();
        unsafe {
            slab.init(
                metadata_alloc,
                region,
                num_cpus,
                shift,
                capacities,
                VirtualCpuMode::Physical,
            );
        }
        (slab, region)
    }

    fn teardown(mut slab: PerCpuSlab<NUM_CLASSES>, num_cpus: usize, shift: u32) {
        let slabs = unsafe { slab.destroy(metadata_free) };
        unsafe { sys::page_dealloc(slabs, num_cpus << shift) };
    }

    #[test]
    fn slabs_and_shift_packing() {
        let (slab, region) = make_slab(2, 15);
        let (slabs, shift) = slab.slabs_and_shift(Ordering::Relaxed);
        assert_eq!(slabs, region);
        assert_eq!(shift, 15);
        assert_eq!(slab.shift(), 15);
        teardown(slab, 2, 15);
    }

    #[test]
    fn layout_matches_begins_and_is_disjoint() {
        let (slab, region) = make_slab(1, 15);

        // begins[] mirrors each header's begin field.
        let mut prev_end = NUM_CLASSES as u16;
        for class in 1..NUM_CLASSES {
            let hdrp = header_ptr(region, 15, 0, class);
            let hdr = unsafe { header::load(hdrp) };
            assert_eq!(slab.begin(class), hdr.begin, "class {class}");
            assert_eq!(hdr.current, hdr.begin);
            assert_eq!(hdr.end, hdr.begin);
            assert_eq!(hdr.end_copy, hdr.begin);

            // Slot ranges, grown to their layout capacity, stay disjoint
            // and above the header array.
            assert!(hdr.begin >= prev_end, "class {class} overlaps");
            prev_end = hdr.begin + capacities(class);
        }
        assert!((prev_end as usize) * 8 <= 1 << 15);
        teardown(slab, 1, 15);
    }

    #[test]
    fn sentinels_carry_the_begin_mark() {
        let (slab, region) = make_slab(1, 15);
        let slots = region as *const usize;
        // Class 1 always has a sentinel right below begin; class 3 follows
        // the zero-capacity class 2, which shares class 1's band.
        for class in [1usize, 3] {
            let begin = slab.begin(class) as usize;
            let sentinel = unsafe { slots.add(begin - 1).read() };
            assert_eq!(sentinel & BEGIN_MARK, BEGIN_MARK, "class {class}");
        }
        teardown(slab, 1, 15);
    }

    #[test]
    fn zero_capacity_class_shares_sentinel() {
        let (slab, _region) = make_slab(1, 15);
        // Class 2 has capacity 0: its begin equals class 3's begin minus
        // nothing extra, and both sit one past class 1's band.
        let after_class1 = NUM_CLASSES as u16 + 1 + capacities(1);
        assert_eq!(slab.begin(2), after_class1 + 1);
        assert_eq!(slab.begin(3), slab.begin(2));
        teardown(slab, 1, 15);
    }

    #[test]
    fn fresh_slab_is_empty_with_zero_capacity() {
        let (slab, _region) = make_slab(2, 15);
        for class in 1..NUM_CLASSES {
            assert_eq!(slab.length(0, class), 0);
            assert_eq!(slab.capacity(0, class), 0);
            // CPU 1 is not initialized yet; its all-zero headers read as
            // locked and report zero as well.
            assert_eq!(slab.length(1, class), 0);
            assert_eq!(slab.capacity(1, class), 0);
        }
        teardown(slab, 2, 15);
    }

    #[test]
    fn grow_other_and_shrink_other_adjust_capacity() {
        let (slab, _region) = make_slab(1, 15);

        slab.stop_cpu(0);
        let grown = unsafe { slab.grow_other_cache(0, 1, 10, |_| 6) };
        assert_eq!(grown, 6);
        slab.start_cpu(0);
        assert_eq!(slab.capacity(0, 1), 6);
        assert_eq!(slab.length(0, 1), 0);

        slab.stop_cpu(0);
        let mut handler_calls = 0;
        let shrunk = unsafe {
            slab.shrink_other_cache(0, 1, 4, |_, _| handler_calls += 1)
        };
        assert_eq!(shrunk, 4);
        // All shrunk capacity was unused; nothing to hand back.
        assert_eq!(handler_calls, 0);
        slab.start_cpu(0);
        assert_eq!(slab.capacity(0, 1), 2);

        teardown(slab, 1, 15);
    }

    #[test]
    fn drain_resets_headers() {
        let (slab, _region) = make_slab(1, 15);
        slab.stop_cpu(0);
        unsafe { slab.grow_other_cache(0, 3, 10, |_| 10) };
        slab.start_cpu(0);
        assert_eq!(slab.capacity(0, 3), 10);

        let mut seen = std::vec::Vec::new();
        unsafe {
            slab.drain(0, |cpu, class, items, cap| {
                seen.push((cpu, class, items.len(), cap));
            });
        }
        assert_eq!(seen, std::vec![(0, 1, 0, 0), (0, 2, 0, 0), (0, 3, 0, 10)]);
        for class in 1..NUM_CLASSES {
            assert_eq!(slab.length(0, class), 0);
            assert_eq!(slab.capacity(0, class), 0);
        }
        teardown(slab, 1, 15);
    }

    #[test]
    fn destroy_clears_the_bank() {
        let (mut slab, region) = make_slab(1, 15);
        let returned = unsafe { slab.destroy(metadata_free) };
        assert_eq!(returned, region);
        assert!(!slab.is_initialized());
        assert_eq!(slab.shift(), 0);
        unsafe { sys::page_dealloc(region, 1 << 15) };
    }

    #[test]
    #[should_panic(expected = "per-cpu region exceeded")]
    fn oversized_layout_panics() {
        let region = unsafe { sys::page_alloc(1 << 15) };
        let mut slab = PerCpuSlab::<NUM_CLASSES>::new();
        unsafe {
            // 3000 slots per class cannot fit a 32 KiB region.
            slab.init(
                metadata_alloc,
                region,
                1,
                15,
                |_| 3000,
                VirtualCpuMode::Physical,
            );
        }
    }
}
