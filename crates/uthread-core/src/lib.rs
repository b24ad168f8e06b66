//! # uthread-core
//!
//! Core types shared by the uthread cooperative runtime and the server
//! pipeline built on top of it.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Stacks, register switching and the event loop live in `uthread-runtime`.
//!
//! ## Modules
//!
//! - `id` - Task identifier type
//! - `state` - Task slot status
//! - `error` - Error taxonomy (runtime, memory, transport)
//! - `kprint` - Kernel-style leveled logging macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod error;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::TaskId;
pub use state::TaskStatus;
pub use error::{MemoryError, StreamError, UThreadError, UThreadResult};
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};

/// Constants shared across the runtime and the pipeline
pub mod constants {
    cfg_if::cfg_if! {
        if #[cfg(feature = "large-stack")] {
            /// Default task stack size (1 MB)
            pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;
        } else {
            /// Default task stack size (64 KB)
            pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
        }
    }

    /// Smallest stack a task may be created with
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Guard region size on each side of a protected stack
    pub const GUARD_SIZE: usize = 4096;

    /// Upper bound on a single readiness wait, keeps timers responsive
    pub const EPOLL_WAIT_TIMEOUT_MS: i32 = 4;

    /// Queue-wait time at or above which a request skips dispatch
    pub const DEFAULT_SHED_THRESHOLD_MS: u64 = 500;

    /// Timeout value meaning "wait forever"
    pub const NO_TIMEOUT: i32 = -1;
}
