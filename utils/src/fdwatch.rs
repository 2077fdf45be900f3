// Helper for watching file descriptors
//
// The layer blocks on a handful of foreign fds: the DRM card while
// waiting for a page flip event, the Wayland connection while waiting
// for buffer releases, and the X11 connection while waiting for
// Present events. The fds are borrowed, FdWatch never closes them.
extern crate nix;

use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};
use std::os::unix::io::RawFd;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitStatus {
    Ready,
    TimedOut,
    Interrupted,
    Error,
}

// A file descriptor watcher
pub struct FdWatch {
    // fds to watch for readability
    fdw_events: Vec<RawFd>,
}

impl FdWatch {
    pub fn new() -> FdWatch {
        FdWatch {
            fdw_events: Vec::new(),
        }
    }

    pub fn add_fd(&mut self, fd: RawFd) {
        self.fdw_events.push(fd);
    }

    /// Wait for any of the registered fds to become readable.
    ///
    /// A timeout of None blocks indefinitely. EINTR is reported
    /// instead of retried, the caller decides whether to loop.
    pub fn wait_for_events(&mut self, timeout_ms: Option<usize>) -> WaitStatus {
        let mut fdset = FdSet::new();
        let mut max_fd = 0;
        for fd in self.fdw_events.iter() {
            fdset.insert(*fd);
            max_fd = std::cmp::max(max_fd, *fd);
        }

        let mut tv = timeout_ms.map(|ms| TimeVal::milliseconds(ms as i64));
        match select(max_fd + 1, Some(&mut fdset), None, None, tv.as_mut()) {
            Ok(0) => WaitStatus::TimedOut,
            Ok(_) => WaitStatus::Ready,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => WaitStatus::Interrupted,
            Err(_) => WaitStatus::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{pipe, write};

    #[test]
    fn times_out_on_silent_fd() {
        let (rd, _wr) = pipe().unwrap();
        let mut watch = FdWatch::new();
        watch.add_fd(rd);
        assert_eq!(watch.wait_for_events(Some(10)), WaitStatus::TimedOut);
    }

    #[test]
    fn wakes_on_readable_fd() {
        let (rd, wr) = pipe().unwrap();
        let mut watch = FdWatch::new();
        watch.add_fd(rd);
        write(wr, &[1u8]).unwrap();
        assert_eq!(watch.wait_for_events(Some(1000)), WaitStatus::Ready);
    }
}
