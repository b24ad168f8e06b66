//! Architecture-specific context switching
//!
//! Each target provides:
//! - `SavedRegs`: the callee-saved register file of a suspended context
//! - `init_context`: prepare `SavedRegs` so the first switch enters
//!   `entry(arg)` on a fresh stack
//! - `context_switch`: save the current registers into `old`, load `new`

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{context_switch, init_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{context_switch, init_context, SavedRegs};
    } else {
        compile_error!("Unsupported architecture");
    }
}

/// Entry point run on a task's own stack; never returns to its caller
pub type EntryFn = extern "C" fn(usize) -> !;
