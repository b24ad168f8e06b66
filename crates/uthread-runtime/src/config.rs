//! Scheduler configuration
//!
//! ```rust,ignore
//! use uthread_runtime::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env().max_task(4096).stack_protect(true);
//! let scheduler = Scheduler::with_config(&config)?;
//! ```

use uthread_core::constants::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use uthread_core::env::{env_get, env_get_bool};

pub const DEFAULT_MAX_TASK: usize = 1024;

/// Per-scheduler settings, builder style
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Usable stack bytes per task
    pub stack_size: usize,
    /// Upper bound on live plus queued tasks (`is_task_full`)
    pub max_task: usize,
    /// Fence every stack with PROT_NONE guard pages
    pub stack_protect: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    /// Library defaults, no environment lookup
    pub fn new() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            max_task: DEFAULT_MAX_TASK,
            stack_protect: false,
        }
    }

    /// Defaults overridden by environment variables (all optional):
    /// - `UTHREAD_STACK_SIZE` - stack bytes per task
    /// - `UTHREAD_MAX_TASK` - task limit per scheduler
    /// - `UTHREAD_STACK_PROTECT` - guard pages (0/1)
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("UTHREAD_STACK_SIZE", DEFAULT_STACK_SIZE),
            max_task: env_get("UTHREAD_MAX_TASK", DEFAULT_MAX_TASK),
            stack_protect: env_get_bool("UTHREAD_STACK_PROTECT", false),
        }
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn max_task(mut self, n: usize) -> Self {
        self.max_task = n;
        self
    }

    pub fn stack_protect(mut self, enable: bool) -> Self {
        self.stack_protect = enable;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_task == 0 {
            return Err(ConfigError::InvalidValue("max_task must be > 0"));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        Ok(())
    }

    pub fn print(&self) {
        uthread_core::kprintln!("Runtime Configuration:");
        uthread_core::kprintln!("  stack_size:     {}", self.stack_size);
        uthread_core::kprintln!("  max_task:       {}", self.max_task);
        uthread_core::kprintln!("  stack_protect:  {}", self.stack_protect);
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
