//! Wakeup signal implementations.
//!
//! The platform default is picked at compile time; the pipe variant is
//! always built so it can be exercised anywhere.

use tpc_core::error::Result;
use tpc_core::wakeup::WakeupSignal;

mod pipe;
pub use pipe::PipeSignal;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod eventfd_linux;
        pub use eventfd_linux::EventFdSignal as PlatformSignal;
    } else {
        pub use pipe::PipeSignal as PlatformSignal;
    }
}

/// Create the platform-appropriate wakeup signal.
pub fn new_signal() -> Result<Box<dyn WakeupSignal>> {
    Ok(Box::new(PlatformSignal::create()?))
}

/// Consume pending wakeups without blocking. Returns bytes read.
pub fn drain(fd: std::os::unix::io::RawFd) -> usize {
    let mut buf = [0u8; 64];
    let mut total = 0;
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            return total;
        }
        total += n as usize;
    }
}
