//! aarch64 context switching (AAPCS64)

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved state of a suspended context
///
/// x19-x28, frame pointer, link register, stack pointer and the low halves
/// of v8-v15. Offsets are hard-coded in `context_switch`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub x: [u64; 10], // 0x00: x19..x28
    pub fp: u64,      // 0x50
    pub lr: u64,      // 0x58
    pub sp: u64,      // 0x60
    _pad: u64,        // 0x68
    pub d: [u64; 8],  // 0x70: d8..d15
}

/// Prepare `regs` so that switching to it calls `entry(arg)` on the stack
/// ending at `stack_top`
///
/// # Safety
///
/// `stack_top` must be the upper end of a writable stack that stays mapped
/// for as long as the context can run.
#[inline]
pub unsafe fn init_context(regs: &mut SavedRegs, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    *regs = SavedRegs::default();
    regs.sp = ((stack_top as usize) & !0xF) as u64;
    regs.lr = task_entry_trampoline as usize as u64;
    regs.x[0] = entry as usize as u64; // x19
    regs.x[1] = arg as u64; // x20
}

#[unsafe(naked)]
unsafe extern "C" fn task_entry_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "brk #0x1",
    );
}

/// Save the current context into `old`, resume `new`
///
/// # Safety
///
/// `new` must hold either a context saved by this function or one prepared
/// by `init_context` whose stack is still mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save into old (x0)
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "mov x9, sp",
        "str x9, [x0, #0x60]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xa0]",
        // Load from new (x1)
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldr x9, [x1, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xa0]",
        // lr is either the saved return address or the trampoline
        "ret",
    );
}
