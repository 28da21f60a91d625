use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use nix::sys::socket::{SockFlag, accept4};
use parking_lot::Mutex;

use crate::conn::{ConnState, Connection};
use crate::ctx::DaemonCtx;
use crate::fdio;
use crate::mux::Interest;
use crate::shell::spawn_shell;
use crate::timer;

fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

/// The I/O Dispatcher: given a fd token pulled off the job queue, inspects
/// what it is and routes to the matching branch in SPEC_FULL.md §4.
/// `listen_fd` lets the dispatcher recognize connection-establishment
/// events without a table lookup.
pub fn dispatch(fd: RawFd, ctx: &Arc<DaemonCtx>, listen_fd: RawFd) {
    if fd == listen_fd {
        accept_connections(ctx, listen_fd);
        return;
    }

    if let Some(conn) = ctx.table.lock().lookup_client(fd) {
        handle_client_fd(fd, &conn, ctx);
        return;
    }

    if let Some(conn) = ctx.table.lock().lookup_pty(fd) {
        handle_pty_fd(fd, &conn, ctx);
        return;
    }

    tracing::warn!(event = "dispatch_unknown_fd", fd, "fd not found in any table");
}

/// §4.4 Connection Establishment. Invoked when the dispatcher receives
/// the listening fd.
fn accept_connections(ctx: &Arc<DaemonCtx>, listen_fd: RawFd) {
    loop {
        match accept4(listen_fd, SockFlag::SOCK_NONBLOCK) {
            Ok(client_fd) => establish(client_fd, ctx),
            Err(nix::Error::EAGAIN) => break,
            Err(e) => {
                tracing::warn!(event = "accept_failed", error = %e);
                break;
            }
        }
    }

    // Re-arm the listening fd itself (§4.8's "common tail").
    if let Err(e) = ctx.main_mux.rearm(borrow(listen_fd), listen_fd as u64, Interest::Read) {
        tracing::error!(event = "listen_fd_rearm_failed", error = %e);
    }
}

fn establish(client_fd: RawFd, ctx: &Arc<DaemonCtx>) {
    let idx = client_fd as usize;
    if idx >= ctx.config.max_clients * 2 + 16 {
        tracing::warn!(event = "conn_rejected_capacity", fd = client_fd);
        fdio::close(client_fd);
        return;
    }

    let deadline = Instant::now() + ctx.config.handshake_timeout();
    let conn = Arc::new(Mutex::new(Connection::new(client_fd, ctx.config.chunk_size, deadline)));
    ctx.table.lock().insert_client(client_fd, conn.clone());

    if let Err(e) = ctx.main_mux.add(borrow(client_fd), client_fd as u64, Interest::Read) {
        tracing::warn!(event = "conn_register_failed", fd = client_fd, error = %e);
        terminate(client_fd, ctx);
        return;
    }

    if let Err(e) = fdio::write(client_fd, ctx.config.challenge.as_bytes()) {
        tracing::warn!(event = "challenge_write_failed", fd = client_fd, error = %e);
        terminate(client_fd, ctx);
        return;
    }

    match timer::arm(ctx.config.handshake_timeout()) {
        Ok(timer_fd) => {
            conn.lock().timer_fd = Some(timer_fd);
            ctx.table.lock().bind_timer(timer_fd, conn.clone());
            if let Err(e) = ctx.timer_mux.add(borrow(timer_fd), timer_fd as u64, Interest::Read) {
                tracing::error!(event = "handshake_timer_register_failed", fd = client_fd, error = %e);
                terminate(client_fd, ctx);
            }
        }
        Err(e) => {
            tracing::error!(event = "handshake_timer_create_failed", fd = client_fd, error = %e);
            terminate(client_fd, ctx);
        }
    }

    tracing::info!(event = "conn_accepted", fd = client_fd);
}

fn handle_client_fd(fd: RawFd, conn: &Arc<Mutex<Connection>>, ctx: &Arc<DaemonCtx>) {
    let state = conn.lock().state;
    match state {
        ConnState::New => handle_handshake(fd, conn, ctx),
        ConnState::Established => transfer_from_established(fd, conn, ctx, true),
        ConnState::Unwritten => transfer_from_unwritten(fd, conn, ctx, true),
        ConnState::Validated | ConnState::Terminated => {
            // Validated is transient (see conn.rs); observing it here on a
            // re-armed event would indicate a logic error upstream.
            tracing::warn!(event = "dispatch_unexpected_state", fd, ?state);
        }
    }
}

fn handle_pty_fd(fd: RawFd, conn: &Arc<Mutex<Connection>>, ctx: &Arc<DaemonCtx>) {
    let state = conn.lock().state;
    match state {
        ConnState::Established => transfer_from_established(fd, conn, ctx, false),
        ConnState::Unwritten => transfer_from_unwritten(fd, conn, ctx, false),
        _ => tracing::warn!(event = "dispatch_unexpected_pty_state", fd, ?state),
    }
}

/// §4.5 Handshake Completion and Shell Attachment.
fn handle_handshake(client_fd: RawFd, conn: &Arc<Mutex<Connection>>, ctx: &Arc<DaemonCtx>) {
    let mut buf = vec![0u8; ctx.config.chunk_size];
    let n = match fdio::read(client_fd, &mut buf) {
        Ok(0) => {
            terminate(client_fd, ctx);
            return;
        }
        Ok(n) => n,
        Err(e) if fdio::is_would_block(&e) => {
            rearm(ctx, client_fd, Interest::Read);
            return;
        }
        Err(_) => {
            terminate(client_fd, ctx);
            return;
        }
    };

    if &buf[..n] != ctx.config.secret_line().as_bytes() {
        let _ = fdio::write(client_fd, ctx.config.error.as_bytes());
        tracing::info!(event = "handshake_mismatch", fd = client_fd);
        terminate(client_fd, ctx);
        return;
    }

    conn.lock().state = ConnState::Validated;

    let spawned = match spawn_shell(client_fd) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(event = "shell_spawn_failed", fd = client_fd, error = %e);
            terminate(client_fd, ctx);
            return;
        }
    };

    if let Err(e) = fdio::set_nonblocking(spawned.pty_master) {
        tracing::warn!(event = "pty_nonblocking_failed", fd = client_fd, error = %e);
        terminate(client_fd, ctx);
        return;
    }

    {
        let mut guard = conn.lock();
        guard.pty_fd = Some(spawned.pty_master);
        guard.child_pid = Some(spawned.child_pid);
    }
    ctx.table.lock().bind_pty(spawned.pty_master, conn.clone());

    if let Err(e) = ctx.main_mux.add(borrow(spawned.pty_master), spawned.pty_master as u64, Interest::Read) {
        tracing::warn!(event = "pty_register_failed", fd = client_fd, error = %e);
        terminate(client_fd, ctx);
        return;
    }

    if let Err(e) = fdio::write(client_fd, ctx.config.ok.as_bytes()) {
        tracing::warn!(event = "ok_write_failed", fd = client_fd, error = %e);
        terminate(client_fd, ctx);
        return;
    }

    conn.lock().state = ConnState::Established;
    tracing::info!(event = "conn_established", fd = client_fd, pty = spawned.pty_master, pid = spawned.child_pid.as_raw());

    // The handshake timer is intentionally left armed; the Timer Reaper
    // (§4.6) will observe the connection is no longer `New` and reap it
    // harmlessly when it fires.
    rearm(ctx, client_fd, Interest::Read);
}

/// §4.7 Data Transfer, `Established` branch. `from_client` tells us which
/// side is ready: `true` means the client socket fired, `false` the PTY.
fn transfer_from_established(from_fd: RawFd, conn: &Arc<Mutex<Connection>>, ctx: &Arc<DaemonCtx>, from_client: bool) {
    let (client_fd, pty_fd) = {
        let guard = conn.lock();
        (guard.client_fd, guard.pty_fd.expect("established connection has a pty"))
    };
    let to_fd = if from_client { pty_fd } else { client_fd };

    let mut buf = vec![0u8; ctx.config.chunk_size];
    let n = match fdio::read(from_fd, &mut buf) {
        Ok(0) => {
            terminate(client_fd, ctx);
            return;
        }
        Ok(n) => n,
        Err(e) if fdio::is_would_block(&e) => {
            rearm(ctx, from_fd, Interest::Read);
            return;
        }
        Err(_) => {
            terminate(client_fd, ctx);
            return;
        }
    };

    match fdio::write(to_fd, &buf[..n]) {
        Ok(w) if w == n => {
            rearm(ctx, from_fd, Interest::Read);
        }
        Ok(w) => {
            // Partial write: buffer the tail, flip to Unwritten, arm `to`
            // for write, leave `from` un-armed until the buffer drains.
            conn.lock().enter_unwritten(&buf[w..n]);
            rearm(ctx, to_fd, Interest::Write);
        }
        Err(e) if fdio::is_would_block(&e) => {
            // Full EAGAIN: nothing was written, buffer all n bytes. This
            // is the explicit policy from SPEC_FULL.md Open Question 2 —
            // distinct from a partial-write-then-EAGAIN, which the `Ok(w)`
            // arm above already handles because `write` either returns a
            // byte count or an error, never both.
            conn.lock().enter_unwritten(&buf[..n]);
            rearm(ctx, to_fd, Interest::Write);
        }
        Err(_) => {
            terminate(client_fd, ctx);
        }
    }
}

/// §4.7 Data Transfer, `Unwritten` branch. Only the write-armed fd (`to`)
/// triggers this, so `ready_fd` here is always the peer of `from` in the
/// sense that it is the side that previously produced a short write.
fn transfer_from_unwritten(ready_fd: RawFd, conn: &Arc<Mutex<Connection>>, ctx: &Arc<DaemonCtx>, _from_client: bool) {
    let (client_fd, to_fd, pending_len) = {
        let guard = conn.lock();
        (guard.client_fd, ready_fd, guard.pending.len())
    };

    let write_result = {
        let guard = conn.lock();
        fdio::write(to_fd, &guard.pending[..pending_len])
    };

    match write_result {
        Ok(n) => {
            let mut guard = conn.lock();
            let fully_drained = guard.advance_unwritten(n);
            let from_fd = fully_drained.then(|| other_side(&guard, to_fd));
            drop(guard);
            rearm(ctx, to_fd, if fully_drained { Interest::Read } else { Interest::Write });
            if let Some(from_fd) = from_fd {
                rearm(ctx, from_fd, Interest::Read);
            }
        }
        Err(e) if fdio::is_would_block(&e) => {
            rearm(ctx, to_fd, Interest::Write);
        }
        Err(_) => {
            terminate(client_fd, ctx);
        }
    }
}

fn other_side(conn: &Connection, fd: RawFd) -> RawFd {
    let pty = conn.pty_fd.expect("unwritten connection has a pty");
    if fd == conn.client_fd { pty } else { conn.client_fd }
}

fn rearm(ctx: &Arc<DaemonCtx>, fd: RawFd, interest: Interest) {
    if let Err(e) = ctx.main_mux.rearm(borrow(fd), fd as u64, interest) {
        tracing::warn!(event = "rearm_failed", fd, error = %e);
    }
}

/// §4.6 Timer Reaper. Drains every expired timer in `timer_mux` without
/// blocking. Called inline from the Listener Loop, never from a worker.
pub fn reap_timers(ctx: &Arc<DaemonCtx>) {
    use nix::sys::epoll::{EpollEvent, EpollTimeout};

    let mut events = [EpollEvent::empty(); 64];
    loop {
        let n = match ctx.timer_mux.wait(&mut events, EpollTimeout::ZERO) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(event = "timer_mux_wait_failed", error = %e);
                return;
            }
        };
        if n == 0 {
            return;
        }
        for event in &events[..n] {
            let timer_fd = event.data() as RawFd;
            timer::acknowledge(timer_fd);

            let owner = ctx.table.lock().lookup_timer(timer_fd);
            if let Some(conn) = owner {
                // Read the state and, if still `New`, claim the
                // connection for termination under the same lock
                // acquisition — otherwise a worker could advance
                // New -> Validated in the gap between observing the
                // state and acting on it, and this reaper would
                // wrongly tear down a session that just completed its
                // handshake.
                let claimed = {
                    let mut guard = conn.lock();
                    if guard.state == ConnState::New {
                        guard.state = ConnState::Terminated;
                        Some(guard.client_fd)
                    } else {
                        None
                    }
                };
                if let Some(client_fd) = claimed {
                    tracing::info!(event = "handshake_timeout", fd = client_fd);
                    teardown(client_fd, &conn, ctx);
                }
            }

            let _ = ctx.timer_mux.remove(borrow(timer_fd));
            ctx.table.lock().remove_timer(timer_fd);
            fdio::close(timer_fd);
        }
    }
}

/// §4.8 Terminator. Idempotent teardown: safe to call multiple times or
/// on an fd whose connection has already been released. `fd` may be
/// either the client socket or the PTY master — a PTY hangup (the shell
/// exiting) arrives on the pty fd, which is never a key in `by_client_fd`,
/// so both tables are consulted and teardown always proceeds from the
/// connection's canonical `client_fd`.
pub fn terminate(fd: RawFd, ctx: &Arc<DaemonCtx>) {
    let conn = {
        let table = ctx.table.lock();
        table.lookup_client(fd).or_else(|| table.lookup_pty(fd))
    };
    let conn = match conn {
        Some(c) => c,
        None => return,
    };

    let client_fd = {
        let mut guard = conn.lock();
        if guard.is_terminated() {
            return;
        }
        guard.state = ConnState::Terminated;
        guard.client_fd
    };

    teardown(client_fd, &conn, ctx);
}

/// Releases the fds and table entries of a connection whose state has
/// already been claimed as `Terminated` by the caller under its own lock
/// scope. Kept separate from `terminate` so the Timer Reaper can perform
/// its New-check-and-claim atomically without a second, redundant
/// is-terminated check racing against the one it already did.
fn teardown(client_fd: RawFd, conn: &Arc<Mutex<Connection>>, ctx: &Arc<DaemonCtx>) {
    let _ = nix::sys::socket::shutdown(client_fd, nix::sys::socket::Shutdown::Both);
    let _ = ctx.main_mux.remove(borrow(client_fd));
    fdio::close(client_fd);
    ctx.table.lock().remove_client(client_fd);

    let pty_fd = conn.lock().pty_fd;
    if let Some(pty_fd) = pty_fd {
        let _ = ctx.main_mux.remove(borrow(pty_fd));
        fdio::close(pty_fd);
        ctx.table.lock().remove_pty(pty_fd);
    }

    tracing::info!(event = "conn_terminated", fd = client_fd);
    // The Connection Record is released here: this was the last Arc held
    // by the table; any in-flight worker holding the other clone finishes
    // its own dispatch and drops its reference too.
}
