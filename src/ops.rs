//! Fast-path restartable critical sections (x86_64).
//!
//! Each operation is one rseq critical section over the caller's cached
//! slab region:
//!
//! 1. Load the cached-slabs word; if bit 63 is clear the thread has been
//!    rescheduled (or never cached) and the operation reports a miss.
//! 2. Compare `current` against `end` (push) or `begin` (pop) in the
//!    size-class header.
//! 3. Move the item(s), then commit with a single 16-bit store of `current`.
//!
//! Slot writes before the commit are invisible: if the kernel aborts the
//! sequence, `current` was never updated and the slots are dead bytes. This
//! also makes the batch operations all-or-nothing over their processed
//! prefix.
//!
//! The headers are 8 bytes per size class at the start of the CPU region:
//! `current` at offset 0, `end_copy` at 2, `begin` at 4, `end` at 6.
//!
//! # Abort handler contract
//!
//! Every abort label must be preceded by the 4-byte `RSEQ_SIG` signature
//! (`0x53053053`). On x86_64 this encodes as `ud1 %edi, %eax`, a
//! guaranteed-illegal instruction that provides control-flow integrity.

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
use core::arch::asm;

use crate::abi::Rseq;

// ── helpers ──────────────────────────────────────────────────────────────────

/// Byte offset of `rseq_cs` within `struct Rseq`.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
const RSEQ_CS_OFF: u32 = 8;

/// Prefetch the object expected to be popped next. Pop reports the slot
/// below the returned item for this purpose; the sentinel below `begin`
/// keeps the address dereferenceable even when the stack runs empty.
#[inline(always)]
pub fn prefetch_next_object(target: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_mm_prefetch::<{ core::arch::x86_64::_MM_HINT_T0 }>(target as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = target;
}

// ── push ─────────────────────────────────────────────────────────────────────

/// Store `item` in the current CPU's slab for `size_class`.
///
/// Returns `false` if the cached-slabs word is invalid, the class is full
/// (or locked), or the critical section was aborted.
///
/// # Safety
///
/// - `rseq` must be the calling thread's registered rseq area and
///   `slabs_word` the cached-slabs word 4 bytes below it.
/// - If the word is valid it must point at a CPU region with initialized
///   headers for `size_class`.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[inline(never)]
pub unsafe fn push(rseq: *mut Rseq, slabs_word: *mut u64, size_class: usize, item: *mut u8) -> bool {
    let class_off = (size_class * 8) as u64;
    let success: u64;

    unsafe {
        asm!(
            // rseq_cs descriptor in a relocatable data section.
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",                     // version
            ".long 0",                     // flags
            ".quad 3f",                    // start_ip
            ".quad (4f - 3f)",             // post_commit_offset
            ".quad 6f",                    // abort_ip
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            // ── start of critical section ────────────────────────
            "3:",

            // base = cached-slabs word; bit 63 is the validity marker.
            "mov {base}, qword ptr [{slabs}]",
            "btr {base}, 63",
            "jnc 7f",

            // current (16-bit) from the class header
            "movzx {cur:e}, word ptr [{base} + {off}]",

            // Full check: current >= end (also covers locked: end == 0)
            "cmp {cur:x}, word ptr [{base} + {off} + 6]",
            "jae 7f",

            // Store item at slot[current]
            "mov qword ptr [{base} + {cur} * 8], {item}",

            // COMMIT: store current + 1 (16-bit write)
            "inc {cur:e}",
            "mov word ptr [{base} + {off}], {cur:x}",
            "4:",

            // ── post-commit cleanup ──────────────────────────────
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {succ:e}, 1",
            "jmp 5f",

            // ── miss: uncached, full, or locked ──────────────────
            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",
            "jmp 5f",

            // ── abort handler ────────────────────────────────────
            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",

            "5:",

            rseq = in(reg) rseq,
            slabs = in(reg) slabs_word,
            off = in(reg) class_off,
            item = in(reg) item,
            base = out(reg) _,
            cur = out(reg) _,
            succ = out(reg) success,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFF,
            options(nostack),
        );
    }

    success != 0
}

// ── pop ──────────────────────────────────────────────────────────────────────

/// Pop the most recently pushed item for `size_class` on the current CPU.
///
/// Returns `(item, prefetch_target)` on success, where `prefetch_target` is
/// the contents of the slot below the popped item, or `None` if the class is
/// empty (or locked), the cached-slabs word is invalid, or the critical
/// section was aborted.
///
/// # Safety
///
/// Same requirements as [`push`].
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[inline(never)]
pub unsafe fn pop(rseq: *mut Rseq, slabs_word: *mut u64, size_class: usize) -> Option<(*mut u8, *mut u8)> {
    let class_off = (size_class * 8) as u64;
    let result: u64;
    let next: u64;
    let success: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            // ── start of critical section ────────────────────────
            "3:",

            "mov {base}, qword ptr [{slabs}]",
            "btr {base}, 63",
            "jnc 7f",

            "movzx {cur:e}, word ptr [{base} + {off}]",

            // Empty check: current <= begin (also covers locked: begin == 0xffff)
            "cmp {cur:x}, word ptr [{base} + {off} + 4]",
            "jbe 7f",

            // result = slot[current - 1], next = slot[current - 2].
            // The sentinel below begin keeps the second load in bounds.
            "mov {next}, qword ptr [{base} + {cur} * 8 - 16]",
            "mov {result}, qword ptr [{base} + {cur} * 8 - 8]",

            // COMMIT: store current - 1 (16-bit write)
            "dec {cur:e}",
            "mov word ptr [{base} + {off}], {cur:x}",
            "4:",

            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {succ:e}, 1",
            "jmp 5f",

            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",

            "5:",

            rseq = in(reg) rseq,
            slabs = in(reg) slabs_word,
            off = in(reg) class_off,
            base = out(reg) _,
            cur = out(reg) _,
            result = out(reg) result,
            next = out(reg) next,
            succ = out(reg) success,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFF,
            options(nostack),
        );
    }

    if success != 0 {
        Some((result as *mut u8, next as *mut u8))
    } else {
        None
    }
}

// ── push_batch ───────────────────────────────────────────────────────────────

/// Push up to `len` items from `batch` onto the current CPU's slab.
///
/// Items are taken from the tail of `batch` in array order, so a full push
/// leaves the slab holding `batch[0] .. batch[len-1]` bottom to top and a
/// partial push leaves the unprocessed items at the start of `batch`.
/// Returns the number pushed; 0 on miss or abort. The copy loop runs inside
/// the critical section with a single commit, so the processed prefix is
/// all-or-nothing.
///
/// # Safety
///
/// - Same requirements as [`push`].
/// - `batch` must point to `len` readable pointers, `len > 0`.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[inline(never)]
pub unsafe fn push_batch(
    rseq: *mut Rseq,
    slabs_word: *mut u64,
    size_class: usize,
    batch: *const *mut u8,
    len: usize,
) -> usize {
    let class_off = (size_class * 8) as u64;
    let pushed: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            // ── start of critical section ────────────────────────
            "3:",

            "mov {base}, qword ptr [{slabs}]",
            "btr {base}, 63",
            "jnc 7f",

            "movzx {cur:e}, word ptr [{base} + {off}]",
            "movzx {n:e}, word ptr [{base} + {off} + 6]",

            // Full check, then n = min(end - current, len)
            "cmp {cur:e}, {n:e}",
            "jae 7f",
            "sub {n:e}, {cur:e}",
            "cmp {n}, {len}",
            "cmova {n}, {len}",
            "mov {ret}, {n}",

            // First source element: batch[len - n]
            "sub {len}, {n}",
            "lea {batch}, [{batch} + {len} * 8]",

            "8:",
            "mov {item}, qword ptr [{batch}]",
            "add {batch}, 8",
            "mov qword ptr [{base} + {cur} * 8], {item}",
            "inc {cur:e}",
            "dec {n:e}",
            "jnz 8b",

            // COMMIT: single 16-bit store of the new current
            "mov word ptr [{base} + {off}], {cur:x}",
            "4:",

            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "jmp 5f",

            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {ret:e}, {ret:e}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {ret:e}, {ret:e}",

            "5:",

            rseq = in(reg) rseq,
            slabs = in(reg) slabs_word,
            off = in(reg) class_off,
            batch = inout(reg) batch => _,
            len = inout(reg) len => _,
            base = out(reg) _,
            cur = out(reg) _,
            n = out(reg) _,
            item = out(reg) _,
            ret = out(reg) pushed,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFF,
            options(nostack),
        );
    }

    pushed as usize
}

// ── pop_batch ────────────────────────────────────────────────────────────────

/// Pop up to `len` items from the current CPU's slab into `batch`, most
/// recently pushed first.
///
/// Returns the number popped, written to `batch[0..n]`; 0 on empty, miss,
/// or abort. All-or-nothing like [`push_batch`].
///
/// # Safety
///
/// - Same requirements as [`push`].
/// - `batch` must point to `len` writable pointer slots, `len > 0`.
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[inline(never)]
pub unsafe fn pop_batch(
    rseq: *mut Rseq,
    slabs_word: *mut u64,
    size_class: usize,
    batch: *mut *mut u8,
    len: usize,
) -> usize {
    let class_off = (size_class * 8) as u64;
    let popped: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            // ── start of critical section ────────────────────────
            "3:",

            "mov {base}, qword ptr [{slabs}]",
            "btr {base}, 63",
            "jnc 7f",

            "movzx {cur:e}, word ptr [{base} + {off}]",
            "movzx {n:e}, word ptr [{base} + {off} + 4]",

            // Empty check, then n = min(current - begin, len)
            "cmp {cur:e}, {n:e}",
            "jbe 7f",
            "neg {n:e}",
            "add {n:e}, {cur:e}",
            "cmp {n}, {len}",
            "cmova {n}, {len}",
            "mov {ret}, {n}",

            "8:",
            "dec {cur:e}",
            "mov {item}, qword ptr [{base} + {cur} * 8]",
            "mov qword ptr [{batch}], {item}",
            "add {batch}, 8",
            "dec {n:e}",
            "jnz 8b",

            // COMMIT: single 16-bit store of the new current
            "mov word ptr [{base} + {off}], {cur:x}",
            "4:",

            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "jmp 5f",

            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {ret:e}, {ret:e}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {ret:e}, {ret:e}",

            "5:",

            rseq = in(reg) rseq,
            slabs = in(reg) slabs_word,
            off = in(reg) class_off,
            batch = inout(reg) batch => _,
            len = in(reg) len,
            base = out(reg) _,
            cur = out(reg) _,
            n = out(reg) _,
            item = out(reg) _,
            ret = out(reg) popped,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFF,
            options(nostack),
        );
    }

    popped as usize
}

// ── store_current_cpu ────────────────────────────────────────────────────────

/// Store `value` to `dst` if the calling thread still holds a valid
/// cached-slabs word, meaning it has not been rescheduled since the base
/// was cached.
///
/// Returns `true` iff the store committed. This is the only way a valid
/// cached base is published and the only way a fast-path header (or the
/// word itself) is written outside push/pop.
///
/// # Safety
///
/// - `rseq` / `slabs_word` as for [`push`].
/// - `dst` must be valid for an 8-byte write and belong to the current
///   CPU's state (a header, or the cached-slabs word itself).
#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[inline(never)]
pub unsafe fn store_current_cpu(rseq: *mut Rseq, slabs_word: *mut u64, dst: *mut u64, value: u64) -> bool {
    let success: u64;

    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            // ── start of critical section ────────────────────────
            "3:",

            "mov {word}, qword ptr [{slabs}]",
            "bt {word}, 63",
            "jnc 7f",

            // COMMIT: the store itself
            "mov qword ptr [{dst}], {val}",
            "4:",

            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {succ:e}, 1",
            "jmp 5f",

            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",

            "5:",

            rseq = in(reg) rseq,
            slabs = in(reg) slabs_word,
            dst = in(reg) dst,
            val = in(reg) value,
            word = out(reg) _,
            succ = out(reg) success,
            tmp = out(reg) _,
            rseq_cs_off = const RSEQ_CS_OFF,
            options(nostack),
        );
    }

    success != 0
}

// ── Fallback (no restartable sequences on this target) ──────────────────────

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
mod fallback {
    use crate::abi::Rseq;

    /// Always a miss; the caller serves through its overflow handler.
    pub unsafe fn push(_: *mut Rseq, _: *mut u64, _: usize, _: *mut u8) -> bool {
        false
    }

    /// Always a miss; the caller serves through its underflow handler.
    pub unsafe fn pop(_: *mut Rseq, _: *mut u64, _: usize) -> Option<(*mut u8, *mut u8)> {
        None
    }

    pub unsafe fn push_batch(_: *mut Rseq, _: *mut u64, _: usize, _: *const *mut u8, _: usize) -> usize {
        0
    }

    pub unsafe fn pop_batch(_: *mut Rseq, _: *mut u64, _: usize, _: *mut *mut u8, _: usize) -> usize {
        0
    }

    pub unsafe fn store_current_cpu(_: *mut Rseq, _: *mut u64, _: *mut u64, _: u64) -> bool {
        false
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
pub use fallback::*;
