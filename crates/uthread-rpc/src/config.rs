//! Server configuration
//!
//! ```rust,ignore
//! let config = ServerConfig::from_env()
//!     .port(9000)
//!     .io_thread_count(4)
//!     .worker_uthread_count(256);
//! config.validate()?;
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use uthread_core::constants::{DEFAULT_SHED_THRESHOLD_MS, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use uthread_core::env::{env_get, env_get_bool, env_get_str};
use uthread_runtime::RuntimeConfig;

pub use uthread_runtime::ConfigError;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    /// Worker threads in total, spread evenly over the units
    pub worker_thread_count: usize,
    pub socket_timeout_ms: i32,
    /// Live connections across all units before new ones are refused
    pub max_connections: usize,
    /// Per-unit request queue bound (admission control)
    pub max_queue_length: usize,
    /// Number of units, one I/O thread each
    pub io_thread_count: usize,
    /// Tasks per worker thread; 0 runs workers in thread mode
    pub worker_uthread_count: usize,
    /// Stack size for connection and worker tasks
    pub worker_uthread_stack_size: usize,
    /// Fence connection and worker task stacks with guard pages
    pub stack_protect: bool,
    /// Queue wait at which a request is answered without dispatch
    pub shed_threshold_ms: u64,
    /// Accepted descriptors buffered per unit
    pub accept_queue_capacity: usize,
    /// Prefix for thread names
    pub package_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            worker_thread_count: 120,
            socket_timeout_ms: 30_000,
            max_connections: 800_000,
            max_queue_length: 20_480,
            io_thread_count: 3,
            worker_uthread_count: 0,
            worker_uthread_stack_size: DEFAULT_STACK_SIZE,
            stack_protect: false,
            shed_threshold_ms: DEFAULT_SHED_THRESHOLD_MS,
            accept_queue_capacity: 1024,
            package_name: "uthread".to_string(),
        }
    }

    /// Defaults overridden by `UTHREAD_*` environment variables
    pub fn from_env() -> Self {
        let d = Self::new();
        let bind_ip = env_get_str("UTHREAD_BIND_IP", "")
            .parse()
            .unwrap_or(d.bind_ip);
        Self {
            bind_ip,
            port: env_get("UTHREAD_PORT", d.port),
            worker_thread_count: env_get("UTHREAD_WORKER_THREADS", d.worker_thread_count),
            socket_timeout_ms: env_get("UTHREAD_SOCKET_TIMEOUT_MS", d.socket_timeout_ms),
            max_connections: env_get("UTHREAD_MAX_CONNECTIONS", d.max_connections),
            max_queue_length: env_get("UTHREAD_MAX_QUEUE_LENGTH", d.max_queue_length),
            io_thread_count: env_get("UTHREAD_IO_THREADS", d.io_thread_count),
            worker_uthread_count: env_get("UTHREAD_WORKER_UTHREADS", d.worker_uthread_count),
            worker_uthread_stack_size: env_get("UTHREAD_WORKER_STACK_SIZE", d.worker_uthread_stack_size),
            stack_protect: env_get_bool("UTHREAD_STACK_PROTECT", d.stack_protect),
            shed_threshold_ms: env_get("UTHREAD_SHED_THRESHOLD_MS", d.shed_threshold_ms),
            ..d
        }
    }

    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn worker_thread_count(mut self, n: usize) -> Self {
        self.worker_thread_count = n;
        self
    }

    pub fn socket_timeout_ms(mut self, ms: i32) -> Self {
        self.socket_timeout_ms = ms;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn max_queue_length(mut self, n: usize) -> Self {
        self.max_queue_length = n;
        self
    }

    pub fn io_thread_count(mut self, n: usize) -> Self {
        self.io_thread_count = n;
        self
    }

    pub fn worker_uthread_count(mut self, n: usize) -> Self {
        self.worker_uthread_count = n;
        self
    }

    pub fn worker_uthread_stack_size(mut self, size: usize) -> Self {
        self.worker_uthread_stack_size = size;
        self
    }

    pub fn stack_protect(mut self, enable: bool) -> Self {
        self.stack_protect = enable;
        self
    }

    pub fn shed_threshold_ms(mut self, ms: u64) -> Self {
        self.shed_threshold_ms = ms;
        self
    }

    pub fn accept_queue_capacity(mut self, n: usize) -> Self {
        self.accept_queue_capacity = n;
        self
    }

    pub fn package_name(mut self, name: impl Into<String>) -> Self {
        self.package_name = name.into();
        self
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    /// Worker threads given to each unit (at least one)
    pub fn workers_per_unit(&self) -> usize {
        (self.worker_thread_count / self.io_thread_count.max(1)).max(1)
    }

    /// Scheduler settings for a unit's I/O thread: one task per connection
    pub fn io_runtime(&self) -> RuntimeConfig {
        RuntimeConfig::new()
            .stack_size(self.worker_uthread_stack_size)
            .max_task((self.max_connections / self.io_thread_count.max(1)).max(1))
            .stack_protect(self.stack_protect)
    }

    /// Scheduler settings for a task-mode worker; `None` in thread mode
    pub fn worker_runtime(&self) -> Option<RuntimeConfig> {
        (self.worker_uthread_count > 0).then(|| {
            RuntimeConfig::new()
                .stack_size(self.worker_uthread_stack_size)
                .max_task(self.worker_uthread_count)
                .stack_protect(self.stack_protect)
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_thread_count == 0 {
            return Err(ConfigError::InvalidValue("io_thread_count must be > 0"));
        }
        if self.worker_thread_count == 0 {
            return Err(ConfigError::InvalidValue("worker_thread_count must be > 0"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("max_connections must be > 0"));
        }
        if self.max_queue_length == 0 {
            return Err(ConfigError::InvalidValue("max_queue_length must be > 0"));
        }
        if self.accept_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("accept_queue_capacity must be > 0"));
        }
        if self.worker_uthread_stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::InvalidValue("worker_uthread_stack_size must be >= 16KB"));
        }
        Ok(())
    }

    pub fn print(&self) {
        uthread_core::kprintln!("Server Configuration:");
        uthread_core::kprintln!("  bind:                 {}", self.bind_addr());
        uthread_core::kprintln!("  io_thread_count:      {}", self.io_thread_count);
        uthread_core::kprintln!("  worker_thread_count:  {}", self.worker_thread_count);
        uthread_core::kprintln!("  worker_uthread_count: {}", self.worker_uthread_count);
        uthread_core::kprintln!("  worker_stack_size:    {}", self.worker_uthread_stack_size);
        uthread_core::kprintln!("  stack_protect:        {}", self.stack_protect);
        uthread_core::kprintln!("  socket_timeout_ms:    {}", self.socket_timeout_ms);
        uthread_core::kprintln!("  max_connections:      {}", self.max_connections);
        uthread_core::kprintln!("  max_queue_length:     {}", self.max_queue_length);
        uthread_core::kprintln!("  shed_threshold_ms:    {}", self.shed_threshold_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new();
        assert_eq!(config.port, 8080);
        assert_eq!(config.io_thread_count, 3);
        assert_eq!(config.worker_thread_count, 120);
        assert_eq!(config.workers_per_unit(), 40);
        assert_eq!(config.bind_addr().to_string(), "0.0.0.0:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_workers_per_unit_floor() {
        let config = ServerConfig::new().worker_thread_count(2).io_thread_count(4);
        assert_eq!(config.workers_per_unit(), 1);
    }

    #[test]
    fn test_validation() {
        assert!(ServerConfig::new().io_thread_count(0).validate().is_err());
        assert!(ServerConfig::new().max_queue_length(0).validate().is_err());
        assert_eq!(
            ServerConfig::new().worker_uthread_stack_size(4096).validate(),
            Err(ConfigError::InvalidValue("worker_uthread_stack_size must be >= 16KB"))
        );
    }

    #[test]
    fn test_runtime_configs_follow_server_config() {
        let config = ServerConfig::new()
            .max_connections(1000)
            .io_thread_count(4)
            .worker_uthread_stack_size(128 * 1024)
            .stack_protect(true);
        let io = config.io_runtime();
        assert_eq!(io.max_task, 250);
        assert_eq!(io.stack_size, 128 * 1024);
        assert!(io.stack_protect);
        assert!(io.validate().is_ok());

        assert!(config.worker_runtime().is_none());
        let worker = config.worker_uthread_count(16).worker_runtime().unwrap();
        assert_eq!(worker.max_task, 16);
        assert!(worker.stack_protect);
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("UTHREAD_IO_THREADS", "7");
        std::env::set_var("UTHREAD_BIND_IP", "127.0.0.1");
        std::env::set_var("UTHREAD_STACK_PROTECT", "1");
        let config = ServerConfig::from_env();
        std::env::remove_var("UTHREAD_IO_THREADS");
        std::env::remove_var("UTHREAD_BIND_IP");
        std::env::remove_var("UTHREAD_STACK_PROTECT");
        assert_eq!(config.io_thread_count, 7);
        assert!(config.stack_protect);
        assert_eq!(config.bind_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
