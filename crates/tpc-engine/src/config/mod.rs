//! Engine configuration.
//!
//! Library defaults with runtime environment overrides. The engine takes an
//! immutable snapshot at construction; nothing reads the environment after
//! `Engine::new`.
//!
//! ```rust,ignore
//! use tpc_engine::config::{EngineConfig, SchedulingMode};
//!
//! let config = EngineConfig::from_env()
//!     .reactor_count(4)
//!     .port_range(12000, 12100)
//!     .scheduling(SchedulingMode::Spin);
//! config.validate()?;
//! ```

pub mod defaults;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use tpc_core::env::{env_get, env_get_bool, env_get_millis, env_get_opt, env_get_size, env_get_str};
use tpc_core::error::{Result, TpcError};
use tpc_module::socket::SocketOptions;
use tpc_module::DriverKind;

/// How a reactor waits for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingMode {
    /// Block in the completion wait; cross-thread work wakes it through the
    /// wakeup signal.
    #[default]
    Blocking,
    /// Never block: poll completions and the task queue in a tight loop.
    /// Producers skip the wakeup write entirely.
    Spin,
}

impl FromStr for SchedulingMode {
    type Err = TpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blocking" | "block" => Ok(Self::Blocking),
            "spin" => Ok(Self::Spin),
            other => Err(TpcError::Config(format!("unknown scheduling mode '{other}'"))),
        }
    }
}

impl fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Blocking => "blocking",
            Self::Spin => "spin",
        })
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Reactor threads; each owns one partition slice and one listener.
    pub reactor_count: usize,
    pub bind_host: IpAddr,
    /// Inclusive listening port range. Reactor `i` binds `base + i`.
    pub port_start: u16,
    pub port_end: u16,
    pub listen_backlog: i32,
    pub socket: SocketOptions,
    /// Read buffer top-up per channel.
    pub read_buffer_size: usize,
    /// Small queued writes are merged into one send up to this size.
    pub write_coalesce_bytes: usize,
    pub ring_entries: u32,
    /// Completions processed per loop iteration.
    pub completion_batch: usize,
    pub scheduling: SchedulingMode,
    pub driver: DriverKind,
    pub fragment_threshold: usize,
    pub max_frame_payload: usize,
    pub max_message_size: usize,
    pub connect_timeout: Duration,
    /// Extra connect attempts after the first one fails.
    pub connect_retries: u32,
    /// Delay before retry `n` is `connect_backoff * n`.
    pub connect_backoff: Duration,
    /// Pooled operation instances kept per opcode.
    pub op_pool_capacity: usize,
    pub pin_threads: bool,
    pub cpu_offset: usize,
    /// Bound used by `Drop` when waiting for reactors to exit.
    pub termination_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl EngineConfig {
    /// Library defaults, no environment lookups.
    pub fn new() -> Self {
        Self {
            reactor_count: available_cpus(),
            bind_host: IpAddr::from([127, 0, 0, 1]),
            port_start: defaults::PORT_START,
            port_end: defaults::PORT_END,
            listen_backlog: defaults::LISTEN_BACKLOG,
            socket: SocketOptions {
                tcp_nodelay: defaults::TCP_NODELAY,
                keep_alive: defaults::KEEP_ALIVE,
                send_buffer: None,
                recv_buffer: None,
            },
            read_buffer_size: defaults::READ_BUFFER_SIZE,
            write_coalesce_bytes: defaults::WRITE_COALESCE_BYTES,
            ring_entries: defaults::RING_ENTRIES,
            completion_batch: defaults::COMPLETION_BATCH,
            scheduling: SchedulingMode::Blocking,
            driver: DriverKind::Auto,
            fragment_threshold: defaults::FRAGMENT_THRESHOLD,
            max_frame_payload: defaults::MAX_FRAME_PAYLOAD,
            max_message_size: defaults::MAX_MESSAGE_SIZE,
            connect_timeout: defaults::CONNECT_TIMEOUT,
            connect_retries: defaults::CONNECT_RETRIES,
            connect_backoff: defaults::CONNECT_BACKOFF,
            op_pool_capacity: defaults::OP_POOL_CAPACITY,
            pin_threads: defaults::PIN_THREADS,
            cpu_offset: defaults::CPU_OFFSET,
            termination_timeout: defaults::TERMINATION_TIMEOUT,
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `TPC_REACTORS` - Reactor thread count (0 = available CPUs)
    /// - `TPC_BIND_HOST` - Listening address
    /// - `TPC_PORT_START`, `TPC_PORT_END` - Inclusive port range
    /// - `TPC_TCP_NODELAY`, `TPC_KEEP_ALIVE` - Socket flags (0/1)
    /// - `TPC_SO_SNDBUF`, `TPC_SO_RCVBUF` - Socket buffer sizes (`64K`, `1M`)
    /// - `TPC_READ_BUFFER`, `TPC_WRITE_COALESCE` - Channel buffer sizes
    /// - `TPC_RING_ENTRIES`, `TPC_COMPLETION_BATCH` - Driver sizing
    /// - `TPC_SCHEDULING` - `blocking` or `spin`
    /// - `TPC_IO_DRIVER` - `auto`, `io_uring` or `poll`
    /// - `TPC_FRAGMENT_THRESHOLD`, `TPC_MAX_FRAME`, `TPC_MAX_MESSAGE` - Framing limits
    /// - `TPC_CONNECT_TIMEOUT_MS`, `TPC_CONNECT_RETRIES`, `TPC_CONNECT_BACKOFF_MS`
    /// - `TPC_OP_POOL` - Pooled operations per opcode
    /// - `TPC_PIN_THREADS`, `TPC_CPU_OFFSET` - CPU pinning
    /// - `TPC_TERMINATION_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let base = Self::new();
        let reactors = env_get("TPC_REACTORS", defaults::REACTOR_COUNT);
        Self {
            reactor_count: if reactors == 0 { base.reactor_count } else { reactors },
            bind_host: env_get_str("TPC_BIND_HOST", defaults::BIND_HOST)
                .parse()
                .unwrap_or(base.bind_host),
            port_start: env_get("TPC_PORT_START", base.port_start),
            port_end: env_get("TPC_PORT_END", base.port_end),
            listen_backlog: env_get("TPC_LISTEN_BACKLOG", base.listen_backlog),
            socket: SocketOptions {
                tcp_nodelay: env_get_bool("TPC_TCP_NODELAY", base.socket.tcp_nodelay),
                keep_alive: env_get_bool("TPC_KEEP_ALIVE", base.socket.keep_alive),
                send_buffer: env_get_opt::<String>("TPC_SO_SNDBUF")
                    .map(|_| env_get_size("TPC_SO_SNDBUF", 0))
                    .filter(|&n| n > 0),
                recv_buffer: env_get_opt::<String>("TPC_SO_RCVBUF")
                    .map(|_| env_get_size("TPC_SO_RCVBUF", 0))
                    .filter(|&n| n > 0),
            },
            read_buffer_size: env_get_size("TPC_READ_BUFFER", base.read_buffer_size),
            write_coalesce_bytes: env_get_size("TPC_WRITE_COALESCE", base.write_coalesce_bytes),
            ring_entries: env_get("TPC_RING_ENTRIES", base.ring_entries),
            completion_batch: env_get("TPC_COMPLETION_BATCH", base.completion_batch),
            scheduling: env_get("TPC_SCHEDULING", base.scheduling),
            driver: env_get("TPC_IO_DRIVER", base.driver),
            fragment_threshold: env_get_size("TPC_FRAGMENT_THRESHOLD", base.fragment_threshold),
            max_frame_payload: env_get_size("TPC_MAX_FRAME", base.max_frame_payload),
            max_message_size: env_get_size("TPC_MAX_MESSAGE", base.max_message_size),
            connect_timeout: env_get_millis("TPC_CONNECT_TIMEOUT_MS", base.connect_timeout),
            connect_retries: env_get("TPC_CONNECT_RETRIES", base.connect_retries),
            connect_backoff: env_get_millis("TPC_CONNECT_BACKOFF_MS", base.connect_backoff),
            op_pool_capacity: env_get("TPC_OP_POOL", base.op_pool_capacity),
            pin_threads: env_get_bool("TPC_PIN_THREADS", base.pin_threads),
            cpu_offset: env_get("TPC_CPU_OFFSET", base.cpu_offset),
            termination_timeout: env_get_millis(
                "TPC_TERMINATION_TIMEOUT_MS",
                base.termination_timeout,
            ),
        }
    }

    // Builder methods

    pub fn reactor_count(mut self, n: usize) -> Self {
        self.reactor_count = n;
        self
    }

    pub fn bind_host(mut self, host: IpAddr) -> Self {
        self.bind_host = host;
        self
    }

    pub fn port_range(mut self, start: u16, end: u16) -> Self {
        self.port_start = start;
        self.port_end = end;
        self
    }

    pub fn socket_options(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn scheduling(mut self, mode: SchedulingMode) -> Self {
        self.scheduling = mode;
        self
    }

    pub fn driver(mut self, kind: DriverKind) -> Self {
        self.driver = kind;
        self
    }

    pub fn fragment_threshold(mut self, size: usize) -> Self {
        self.fragment_threshold = size;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn connect_retries(mut self, n: u32, backoff: Duration) -> Self {
        self.connect_retries = n;
        self.connect_backoff = backoff;
        self
    }

    pub fn op_pool_capacity(mut self, n: usize) -> Self {
        self.op_pool_capacity = n;
        self
    }

    pub fn pin_threads(mut self, enable: bool, cpu_offset: usize) -> Self {
        self.pin_threads = enable;
        self.cpu_offset = cpu_offset;
        self
    }

    pub fn termination_timeout(mut self, d: Duration) -> Self {
        self.termination_timeout = d;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(TpcError::Config(msg.to_string()));
        if self.reactor_count == 0 {
            return invalid("reactor_count must be > 0");
        }
        if self.reactor_count > 1024 {
            return invalid("reactor_count must be <= 1024");
        }
        if self.port_start == 0 {
            return invalid("port_start must be > 0");
        }
        if (self.port_end as usize) < self.port_start as usize + self.reactor_count - 1 {
            return invalid("port range must hold at least reactor_count ports");
        }
        if self.read_buffer_size < 1024 {
            return invalid("read_buffer_size must be >= 1KB");
        }
        if self.ring_entries == 0 || self.completion_batch == 0 {
            return invalid("ring_entries and completion_batch must be > 0");
        }
        if self.fragment_threshold == 0 || self.fragment_threshold > self.max_frame_payload {
            return invalid("fragment_threshold must be in 1..=max_frame_payload");
        }
        if self.max_message_size < self.max_frame_payload {
            return invalid("max_message_size must be >= max_frame_payload");
        }
        if self.connect_timeout.is_zero() {
            return invalid("connect_timeout must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env() {
        let config = EngineConfig::from_env();
        assert!(config.reactor_count >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .reactor_count(3)
            .port_range(20000, 20010)
            .scheduling(SchedulingMode::Spin)
            .driver(DriverKind::Poll)
            .connect_retries(1, Duration::from_millis(5));

        assert_eq!(config.reactor_count, 3);
        assert_eq!((config.port_start, config.port_end), (20000, 20010));
        assert_eq!(config.scheduling, SchedulingMode::Spin);
        assert_eq!(config.driver, DriverKind::Poll);
        assert_eq!(config.connect_retries, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::new().reactor_count(0).validate().is_err());
        assert!(EngineConfig::new().reactor_count(8).port_range(30000, 30003).validate().is_err());
        assert!(EngineConfig::new().fragment_threshold(0).validate().is_err());
        assert!(EngineConfig::new()
            .max_message_size(1024)
            .validate()
            .is_err());
        assert!(EngineConfig::new().port_range(0, 10).validate().is_err());
    }

    #[test]
    fn test_scheduling_mode_parse() {
        assert_eq!("spin".parse::<SchedulingMode>().unwrap(), SchedulingMode::Spin);
        assert_eq!("Blocking".parse::<SchedulingMode>().unwrap(), SchedulingMode::Blocking);
        assert!("busy".parse::<SchedulingMode>().is_err());
    }
}
