use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;
use nix::NixPath;
use std::os::unix::io::RawFd;

/// An owned file descriptor. The fd is closed when this goes out of scope.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> ScopedFd {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> ScopedFd {
        ScopedFd { fd }
    }

    pub fn open_path<P: ?Sized + NixPath>(path: &P, oflag: OFlag) -> ScopedFd {
        let fd = open(path, oflag, Mode::empty()).unwrap_or(-1);
        ScopedFd { fd }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // The fd may already be dead, e.g. when the tracee that owned the
            // other end has been reaped. Ignore errors.
            close(self.fd).unwrap_or(());
        }
        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Return the fd and relinquish ownership of it.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }
}

impl Default for ScopedFd {
    fn default() -> ScopedFd {
        ScopedFd::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::fcntl;
    use nix::fcntl::FcntlArg;

    #[test]
    fn closed_by_default() {
        let fd = ScopedFd::new();
        assert!(!fd.is_open());
        assert_eq!(-1, fd.as_raw());
    }

    #[test]
    fn open_and_drop() {
        let raw;
        {
            let fd = ScopedFd::open_path("/dev/null", OFlag::O_RDONLY);
            assert!(fd.is_open());
            raw = fd.as_raw();
            assert!(fcntl(raw, FcntlArg::F_GETFD).is_ok());
        }
        assert!(fcntl(raw, FcntlArg::F_GETFD).is_err());
    }

    #[test]
    fn extract_relinquishes_ownership() {
        let mut fd = ScopedFd::open_path("/dev/null", OFlag::O_RDONLY);
        let raw = fd.extract();
        assert!(!fd.is_open());
        assert!(fcntl(raw, FcntlArg::F_GETFD).is_ok());
        nix::unistd::close(raw).unwrap();
    }
}
