use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

/// Arms a one-shot handshake deadline timer and returns its raw fd, a
/// generalization of `original_source/Lab5/server.c`'s `initiate_handshake`
/// (`timerfd_create` + `timerfd_settime` with a one-shot `itimerspec`).
/// Ownership of the fd moves to the caller (the Connection Record, per
/// SPEC_FULL.md §3's `timer_fd: integer handle`); it is closed explicitly
/// by the Terminator, not by a Rust drop, to match the raw-fd lifetime
/// model the rest of the Connection Record fields use.
pub fn arm(timeout: Duration) -> nix::Result<RawFd> {
    let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK)?;
    let spec = TimeSpec::from_duration(timeout);
    timer.set(Expiration::OneShot(spec), TimerSetTimeFlags::empty())?;
    let raw = timer.as_fd().as_raw_fd();
    std::mem::forget(timer);
    Ok(raw)
}

/// Consumes the expiration counter so the fd stops reporting readiness,
/// mirroring the C source's `read(timer_fd, &expirations, sizeof(expirations))`.
pub fn acknowledge(fd: RawFd) {
    let mut buf = [0u8; 8];
    let _ = crate::fdio::read(fd, &mut buf);
}
