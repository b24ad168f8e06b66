//! # uthread-runtime
//!
//! Linux implementation of the uthread cooperative runtime.
//!
//! This crate provides:
//! - Stack memory with optional guard pages (mmap/mprotect)
//! - Context switching (architecture-specific assembly)
//! - The task slot pool (`TaskRuntime`)
//! - Deadline tracking (`TimerHeap`)
//! - The epoll event-loop `Scheduler` and its cross-thread `RemoteScheduler`
//! - Connection handles with blocking-shim I/O (`UThreadSocket`)

pub mod config;
pub mod memory;
pub mod arch;
pub mod context;
pub mod runtime;
pub mod timer;
pub mod events;
pub mod scheduler;
pub mod socket;
pub mod notifier;

// Re-exports
pub use config::{ConfigError, RuntimeConfig};
pub use events::Events;
pub use memory::StackMemory;
pub use notifier::{NotifySender, UThreadNotifier};
pub use runtime::TaskRuntime;
pub use scheduler::{RemoteScheduler, Scheduler};
pub use socket::UThreadSocket;
pub use timer::{now_ms, TimerHeap, TimerNode};

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("uthread-runtime requires Linux (epoll)");
    }
}

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
