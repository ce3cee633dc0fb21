//! End-to-end slab cache behavior on a live kernel.
//!
//! Fast-path assertions need rseq (Linux x86_64, kernel >= 4.18, plus the
//! expedited rseq membarrier); tests that depend on it skip with a message
//! when it is unavailable. Slow-path behavior is asserted unconditionally.
//!
//! The test thread pins itself to CPU 0 so that grow/push/pop land on a
//! predictable region; every fast-path step still tolerates spurious
//! restarts by retrying.

use rseq_slab::{PerCpuSlab, VirtualCpuMode, sys};

const NUM_CLASSES: usize = 3;
const SHIFT: u32 = 18;

/// Layout capacities: class 1 holds 2 slots, class 2 holds 3.
fn caps(size_class: usize) -> u16 {
    [0u16, 2, 3][size_class]
}

fn metadata_alloc(size: usize, align: usize) -> *mut u8 {
    let layout = std::alloc::Layout::from_size_align(size, align).unwrap();
    unsafe { std::alloc::alloc_zeroed(layout) }
}

fn metadata_free(ptr: *mut u8, size: usize, align: usize) {
    let layout = std::alloc::Layout::from_size_align(size, align).unwrap();
    unsafe { std::alloc::dealloc(ptr, layout) };
}

struct Bank {
    slab: PerCpuSlab<NUM_CLASSES>,
    region: *mut u8,
    region_size: usize,
}

impl Bank {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let num_cpus = sys::num_cpus();
        let region_size = num_cpus << SHIFT;
        let region = unsafe { sys::page_alloc(region_size) };
        assert!(!region.is_null());
        let mut slab = PerCpuSlab::<NUM_CLASSES>::new();
        unsafe {
            slab.init(metadata_alloc, region, num_cpus, SHIFT, caps, VirtualCpuMode::Physical);
        }
        Bank { slab, region, region_size }
    }
}

impl Drop for Bank {
    fn drop(&mut self) {
        if self.slab.is_initialized() {
            unsafe { self.slab.destroy(metadata_free) };
        }
        unsafe { sys::page_dealloc(self.region, self.region_size) };
    }
}

/// Pin the calling thread to the first CPU its affinity mask allows, so the
/// whole test observes one region. Best effort.
fn pin_to_first_cpu() -> bool {
    unsafe {
        let mut allowed: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut allowed) != 0 {
            return false;
        }
        let Some(cpu) = (0..libc::CPU_SETSIZE as usize).find(|&c| libc::CPU_ISSET(c, &allowed))
        else {
            return false;
        };
        let mut one: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut one);
        libc::CPU_SET(cpu, &mut one);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &one) == 0
    }
}

/// Cache the current CPU's slab and make sure its headers exist. Returns
/// the CPU, or `None` when the fast path is unavailable.
fn ready_cpu(bank: &Bank) -> Option<usize> {
    let (cpu, _) = bank.slab.cache_cpu_slab()?;
    if cpu != 0 {
        // Pinning failed or was moved; provision the CPU we actually got.
        unsafe { bank.slab.init_cpu(cpu, caps) };
    }
    Some(cpu)
}

/// Retry a fast-path step until it reports success or stabilizes as a miss.
/// A genuine miss (full/empty) keeps failing; only kernel restarts are
/// transient.
fn retry<T>(mut op: impl FnMut() -> Option<T>) -> Option<T> {
    for _ in 0..1000 {
        if let Some(v) = op() {
            return Some(v);
        }
        std::hint::spin_loop();
    }
    None
}

macro_rules! require_rseq {
    ($bank:expr) => {{
        let _ = pin_to_first_cpu();
        match ready_cpu(&$bank) {
            Some(cpu) => cpu,
            None => {
                eprintln!("rseq unavailable; skipping fast-path test");
                return;
            }
        }
    }};
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[test]
fn fresh_bank_has_empty_zero_capacity_slabs() {
    let bank = Bank::new();
    assert!(bank.slab.is_initialized());
    assert_eq!(bank.slab.shift(), SHIFT as u8);
    for class in 1..NUM_CLASSES {
        assert_eq!(bank.slab.length(0, class), 0);
        assert_eq!(bank.slab.capacity(0, class), 0);
    }
}

#[test]
fn grow_is_bounded_by_max_capacity() {
    let bank = Bank::new();
    let cpu = require_rseq!(bank);

    let grown = retry(|| match bank.slab.grow(cpu, 1, 4, |_| 2) {
        0 => None,
        n => Some(n),
    });
    assert_eq!(grown, Some(2));
    assert_eq!(bank.slab.capacity(cpu, 1), 2);
    assert_eq!(bank.slab.length(cpu, 1), 0);

    // Already at the cap.
    assert_eq!(bank.slab.grow(cpu, 1, 4, |_| 2), 0);
}

#[test]
fn push_pop_is_lifo_with_overflow_and_underflow() {
    let bank = Bank::new();
    let cpu = require_rseq!(bank);
    retry(|| (bank.slab.grow(cpu, 1, 2, |_| 2) == 2).then_some(())).unwrap();

    let a = 0xA0 as *mut u8;
    let b = 0xB0 as *mut u8;
    let c = 0xC0 as *mut u8;

    assert!(retry(|| bank.slab.push(1, a).then_some(())).is_some());
    assert!(retry(|| bank.slab.push(1, b).then_some(())).is_some());
    assert_eq!(bank.slab.length(cpu, 1), 2);
    // Full: the miss is definitive, the caller would run its overflow
    // handler and retire items elsewhere.
    assert!(retry(|| bank.slab.push(1, c).then_some(())).is_none());

    assert_eq!(retry(|| bank.slab.pop(1)), Some(b));
    assert_eq!(retry(|| bank.slab.pop(1)), Some(a));
    // Empty: underflow.
    assert_eq!(retry(|| bank.slab.pop(1)), None);
}

#[test]
fn push_batch_then_drain_delivers_in_slab_order() {
    let bank = Bank::new();
    let cpu = require_rseq!(bank);
    retry(|| (bank.slab.grow(cpu, 2, 3, |_| 3) == 3).then_some(())).unwrap();

    let batch = [0x10 as *mut u8, 0x20 as *mut u8, 0x30 as *mut u8];
    let pushed = retry(|| match bank.slab.push_batch(2, &batch) {
        0 => None,
        n => Some(n),
    });
    assert_eq!(pushed, Some(3));

    let mut seen = Vec::new();
    unsafe {
        bank.slab.drain(cpu, |dcpu, class, items, cap| {
            seen.push((dcpu, class, items.to_vec(), cap));
        });
    }
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (cpu, 1, vec![], 0));
    assert_eq!(seen[1], (cpu, 2, batch.to_vec(), 3));

    for class in 1..NUM_CLASSES {
        assert_eq!(bank.slab.length(cpu, class), 0);
        assert_eq!(bank.slab.capacity(cpu, class), 0);
    }
}

#[test]
fn pop_batch_returns_newest_first() {
    let bank = Bank::new();
    let cpu = require_rseq!(bank);
    retry(|| (bank.slab.grow(cpu, 2, 3, |_| 3) == 3).then_some(())).unwrap();

    for p in [0x10usize, 0x20, 0x30] {
        assert!(retry(|| bank.slab.push(2, p as *mut u8).then_some(())).is_some());
    }

    let mut out = [std::ptr::null_mut(); 8];
    let n = retry(|| match bank.slab.pop_batch(2, &mut out) {
        0 => None,
        n => Some(n),
    });
    assert_eq!(n, Some(3));
    assert_eq!(&out[..3], &[0x30 as *mut u8, 0x20 as *mut u8, 0x10 as *mut u8]);
}

#[test]
fn partial_push_batch_takes_the_tail() {
    let bank = Bank::new();
    let cpu = require_rseq!(bank);
    retry(|| (bank.slab.grow(cpu, 1, 2, |_| 2) == 2).then_some(())).unwrap();

    let batch = [0x10 as *mut u8, 0x20 as *mut u8, 0x30 as *mut u8];
    let pushed = retry(|| match bank.slab.push_batch(1, &batch) {
        0 => None,
        n => Some(n),
    });
    // Room for two: batch[0] stays with the caller, the tail goes in.
    assert_eq!(pushed, Some(2));
    assert_eq!(retry(|| bank.slab.pop(1)), Some(0x30 as *mut u8));
    assert_eq!(retry(|| bank.slab.pop(1)), Some(0x20 as *mut u8));
    assert_eq!(retry(|| bank.slab.pop(1)), None);
}

#[test]
fn shrink_other_cache_hands_back_cached_items() {
    let bank = Bank::new();
    let cpu = require_rseq!(bank);
    retry(|| (bank.slab.grow(cpu, 1, 2, |_| 2) == 2).then_some(())).unwrap();

    let a = 0xA0 as *mut u8;
    let b = 0xB0 as *mut u8;
    assert!(retry(|| bank.slab.push(1, a).then_some(())).is_some());
    assert!(retry(|| bank.slab.push(1, b).then_some(())).is_some());

    bank.slab.stop_cpu(cpu);
    let mut returned = Vec::new();
    let shrunk = unsafe {
        bank.slab.shrink_other_cache(cpu, 1, 2, |class, items| {
            assert_eq!(class, 1);
            returned.extend_from_slice(items);
        })
    };
    bank.slab.start_cpu(cpu);

    assert_eq!(shrunk, 2);
    assert_eq!(returned, vec![a, b]);
    assert_eq!(bank.slab.capacity(cpu, 1), 0);
    assert_eq!(bank.slab.length(cpu, 1), 0);
}

#[test]
fn init_cpu_is_idempotent_after_drain() {
    let bank = Bank::new();

    unsafe { bank.slab.drain(0, |_, _, _, _| {}) };
    let begins: Vec<u16> = (1..NUM_CLASSES).map(|c| bank.slab.begin(c)).collect();

    unsafe { bank.slab.init_cpu(0, caps) };
    for class in 1..NUM_CLASSES {
        assert_eq!(bank.slab.length(0, class), 0);
        assert_eq!(bank.slab.capacity(0, class), 0);
        assert_eq!(bank.slab.begin(class), begins[class - 1]);
    }

    // A second round through stop + drain + init leaves the same layout.
    unsafe { bank.slab.drain(0, |_, _, _, _| {}) };
    unsafe { bank.slab.init_cpu(0, caps) };
    for class in 1..NUM_CLASSES {
        assert_eq!(bank.slab.begin(class), begins[class - 1]);
    }
}

#[test]
fn drain_restarts_the_cpu_when_the_handler_panics() {
    let bank = Bank::new();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
        bank.slab.drain(0, |_, _, _, _| panic!("handler failure"));
    }));
    assert!(result.is_err());

    // The scoped stop released the CPU despite the panic: stopping it
    // again must not trip the "already stopped" assertion.
    bank.slab.stop_cpu(0);
    bank.slab.start_cpu(0);
}

#[test]
fn metadata_memory_usage_tracks_the_bank() {
    let bank = Bank::new();
    let usage = bank.slab.metadata_memory_usage();
    let num_cpus = sys::num_cpus();
    assert_eq!(
        usage.virtual_size,
        (num_cpus << SHIFT) + num_cpus + NUM_CLASSES * 2
    );
    // CPU 0's headers were written at init, so at least one page is in.
    assert!(usage.resident_size >= sys::page_size());
    assert!(usage.resident_size <= num_cpus << SHIFT);
}

#[test]
fn fallback_mode_misses_everything() {
    let bank = Bank::new();
    // Caching forces thread registration; when it works there is no
    // fallback behavior to observe here.
    if bank.slab.cache_cpu_slab().is_some() {
        return;
    }
    assert!(!bank.slab.push(1, 0xA0 as *mut u8));
    assert_eq!(bank.slab.pop(1), None);
    assert_eq!(bank.slab.push_batch(1, &[0xA0 as *mut u8]), 0);
    let mut out = [std::ptr::null_mut(); 4];
    assert_eq!(bank.slab.pop_batch(1, &mut out), 0);
    assert!(bank.slab.cache_cpu_slab().is_none());
}
