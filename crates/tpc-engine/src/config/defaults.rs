//! Library defaults for `EngineConfig`.

use std::time::Duration;

/// 0 = one reactor per available CPU.
pub const REACTOR_COUNT: usize = 0;
pub const BIND_HOST: &str = "127.0.0.1";
pub const PORT_START: u16 = 11000;
pub const PORT_END: u16 = 11200;
pub const LISTEN_BACKLOG: i32 = 1024;

pub const TCP_NODELAY: bool = true;
pub const KEEP_ALIVE: bool = true;

pub const READ_BUFFER_SIZE: usize = 64 * 1024;
pub const WRITE_COALESCE_BYTES: usize = 64 * 1024;

pub const RING_ENTRIES: u32 = 512;
pub const COMPLETION_BATCH: usize = 256;

pub const FRAGMENT_THRESHOLD: usize = 64 * 1024;
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const CONNECT_RETRIES: u32 = 3;
pub const CONNECT_BACKOFF: Duration = Duration::from_millis(50);

pub const OP_POOL_CAPACITY: usize = 64;

pub const PIN_THREADS: bool = false;
pub const CPU_OFFSET: usize = 0;

pub const TERMINATION_TIMEOUT: Duration = Duration::from_secs(5);
