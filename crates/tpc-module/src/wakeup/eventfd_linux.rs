//! `EventFdSignal`: Linux wakeup signal backed by an eventfd.
//!
//! Counter semantics coalesce any number of `signal()` calls made before the
//! reactor's read completes into a single wakeup.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use tpc_core::error::{Result, TpcError};
use tpc_core::wakeup::WakeupSignal;

pub struct EventFdSignal {
    fd: RawFd,
}

impl EventFdSignal {
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(TpcError::Driver(Errno::last() as i32));
        }
        Ok(Self { fd })
    }
}

impl WakeupSignal for EventFdSignal {
    fn signal(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            // EAGAIN: counter saturated, a wakeup is already pending.
            let errno = Errno::last();
            if errno == Errno::EAGAIN {
                return Ok(());
            }
            return Err(TpcError::Driver(errno as i32));
        }
        Ok(())
    }

    fn read_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFdSignal {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}
