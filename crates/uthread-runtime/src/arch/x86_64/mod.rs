//! x86_64 context switching (System V AMD64)
//!
//! Uses naked functions, stable since Rust 1.88.

use super::EntryFn;
use std::arch::naked_asm;

/// Default MXCSR: all exceptions masked, round-to-nearest
const MXCSR_DEFAULT: u32 = 0x1F80;

/// Default x87 control word
const FPUCW_DEFAULT: u16 = 0x037F;

/// Callee-saved state of a suspended context
///
/// Layout is fixed: `context_switch` addresses fields by offset.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
    pub mxcsr: u32, // 0x40
    pub fpucw: u16, // 0x44
    _pad: u16,
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
    // The trampoline issues a `call`, so rsp must be 16-byte aligned there
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs::default();
    regs.rsp = sp as u64;
    regs.rip = task_entry_trampoline as usize as u64;
    regs.r12 = entry as usize as u64;
    regs.r13 = arg as u64;
    regs.mxcsr = MXCSR_DEFAULT;
    regs.fpucw = FPUCW_DEFAULT;
}

/// First instruction of every task: `entry(arg)`; `entry` never returns
#[unsafe(naked)]
unsafe extern "C" fn task_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save the current context into `old`, resume `new`
///
/// Returns when some other context switches back into `old`.
///
/// # Safety
///
/// `new` must hold either a context saved by this function or one prepared
/// by `init_context` whose stack is still mapped.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save into old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr dword ptr [rdi + 0x40]",
        "fnstcw word ptr [rdi + 0x44]",
        // Load from new (RSI)
        "ldmxcsr dword ptr [rsi + 0x40]",
        "fldcw word ptr [rsi + 0x44]",
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // A saved context resumes here and returns to its caller
        "1:",
        "ret",
    );
}
