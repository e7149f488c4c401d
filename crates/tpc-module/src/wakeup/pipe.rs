//! `PipeSignal`: self-pipe wakeup for targets without eventfd.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use tpc_core::error::{Result, TpcError};
use tpc_core::wakeup::WakeupSignal;

pub struct PipeSignal {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl PipeSignal {
    pub fn create() -> Result<Self> {
        let mut fds = [-1 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(TpcError::Driver(Errno::last() as i32));
        }
        let signal = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        for fd in fds {
            set_nonblocking_cloexec(fd)?;
        }
        Ok(signal)
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(TpcError::Driver(Errno::last() as i32));
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(TpcError::Driver(Errno::last() as i32));
        }
    }
    Ok(())
}

impl WakeupSignal for PipeSignal {
    fn signal(&self) -> Result<()> {
        let byte = 1u8;
        let ret = unsafe { libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1) };
        if ret < 0 {
            // EAGAIN: pipe full, the reader has plenty to wake up on.
            let errno = Errno::last();
            if errno == Errno::EAGAIN {
                return Ok(());
            }
            return Err(TpcError::Driver(errno as i32));
        }
        Ok(())
    }

    fn read_fd(&self) -> RawFd {
        self.read_fd
    }
}

impl Drop for PipeSignal {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
