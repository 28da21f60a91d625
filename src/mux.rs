use std::os::fd::{AsFd, BorrowedFd, RawFd};

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

/// Readiness direction a caller wants notified for a fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Wraps a `nix` epoll instance with the edge-triggered, one-shot
/// discipline this design depends on baked into every registration —
/// callers can never accidentally register a fd level-triggered or
/// persistent, which would break the single-owner-per-dispatch guarantee
/// (SPEC_FULL.md §3, §5).
pub struct Reactor {
    epoll: Epoll,
}

impl Reactor {
    pub fn new() -> nix::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::empty())?;
        Ok(Reactor { epoll })
    }

    fn flags_for(interest: Interest) -> EpollFlags {
        let base = EpollFlags::EPOLLONESHOT | EpollFlags::EPOLLET;
        match interest {
            Interest::Read => base | EpollFlags::EPOLLIN,
            Interest::Write => base | EpollFlags::EPOLLOUT,
        }
    }

    pub fn add(&self, fd: BorrowedFd<'_>, token: u64, interest: Interest) -> nix::Result<()> {
        let mut event = EpollEvent::new(Self::flags_for(interest), token);
        self.epoll.add(fd, &mut event)
    }

    /// Re-arms a fd that has already fired once. Required after every
    /// dispatch because `EPOLLONESHOT` disables further notifications for
    /// the fd until explicitly re-armed.
    pub fn rearm(&self, fd: BorrowedFd<'_>, token: u64, interest: Interest) -> nix::Result<()> {
        let mut event = EpollEvent::new(Self::flags_for(interest), token);
        self.epoll.modify(fd, &mut event)
    }

    pub fn remove(&self, fd: BorrowedFd<'_>) -> nix::Result<()> {
        self.epoll.delete(fd)
    }

    /// Blocks until at least one fd is ready or `timeout` elapses. Returns
    /// the tokens (not raw fds — callers register whatever token they find
    /// meaningful, typically the fd itself cast to `u64`) for ready fds.
    pub fn wait(&self, events: &mut [EpollEvent], timeout: EpollTimeout) -> nix::Result<usize> {
        self.epoll.wait(events, timeout)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.epoll.as_fd().as_raw_fd_compat()
    }
}

/// `nix::sys::epoll::Epoll` exposes `AsFd` but not `AsRawFd` directly in
/// every version; this keeps the raw-fd extraction in one place so the
/// rest of the codebase never has to special-case it.
trait AsRawFdCompat {
    fn as_raw_fd_compat(&self) -> RawFd;
}

impl AsRawFdCompat for BorrowedFd<'_> {
    fn as_raw_fd_compat(&self) -> RawFd {
        use std::os::fd::AsRawFd;
        self.as_raw_fd()
    }
}
