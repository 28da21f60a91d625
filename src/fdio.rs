use std::os::fd::{BorrowedFd, RawFd};

/// Bridges the raw integer fds this design stores in the Connection
/// Record (SPEC_FULL.md §3 keeps them as plain `RawFd`, matching the
/// source's `int` handles) to `nix`'s fd-safe call signatures. The
/// `borrow_raw` is sound here because every call site holds the fd for
/// the duration of the call only, and the Connection Table (not this
/// module) owns the fd's lifetime and closes it exactly once in the
/// Terminator.
fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    nix::unistd::read(borrow(fd), buf)
}

pub fn write(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    nix::unistd::write(borrow(fd), buf)
}

pub fn close(fd: RawFd) {
    if let Err(e) = nix::unistd::close(fd) {
        tracing::warn!(event = "fd_close_failed", fd, error = %e);
    }
}

pub fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    use nix::fcntl::{FcntlArg, OFlag, fcntl};
    let flags = fcntl(borrow(fd), FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(borrow(fd), FcntlArg::F_SETFL(flags))?;
    Ok(())
}

pub fn is_would_block(err: &nix::Error) -> bool {
    matches!(err, nix::Error::EAGAIN)
}
