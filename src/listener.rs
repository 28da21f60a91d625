use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;

use nix::sys::epoll::{EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, bind, listen as nix_listen, setsockopt, socket,
};
use nix::sys::socket::sockopt::ReuseAddr;

use crate::config::Config;
use crate::ctx::DaemonCtx;
use crate::dispatch;
use crate::error::StartupError;
use crate::mux::{Interest, Reactor};
use crate::pool::WorkerPool;

fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

/// The bootstrapped daemon: the listening socket, both readiness
/// multiplexers, the shared context, and the worker pool. `run` blocks
/// the calling thread forever — it *is* the Listener Loop thread
/// (SPEC_FULL.md §2/§5: "single thread calling the readiness wait
/// primitive").
pub struct Daemon {
    ctx: Arc<DaemonCtx>,
    pool: WorkerPool,
    listen_fd: RawFd,
}

impl Daemon {
    pub fn bootstrap(config: Config) -> Result<Self, StartupError> {
        nix::sys::signal::signal(nix::sys::signal::Signal::SIGPIPE, nix::sys::signal::SigHandler::SigIgn)
            .map_err(StartupError::Signal)?;
        nix::sys::signal::signal(nix::sys::signal::Signal::SIGCHLD, nix::sys::signal::SigHandler::SigIgn)
            .map_err(StartupError::Signal)?;

        let listen_fd = create_listener(&config)?;

        let main_mux = Reactor::new().map_err(StartupError::Epoll)?;
        let timer_mux = Reactor::new().map_err(StartupError::Epoll)?;

        main_mux
            .add(borrow(listen_fd), listen_fd as u64, Interest::Read)
            .map_err(StartupError::Epoll)?;

        let timer_mux_fd = timer_mux_raw_fd(&timer_mux);
        main_mux
            .add(borrow(timer_mux_fd), timer_mux_fd as u64, Interest::Read)
            .map_err(StartupError::Epoll)?;

        let worker_count = config.worker_count();
        let queue_capacity = config.queue_capacity();
        let ctx = Arc::new(DaemonCtx::new(config, main_mux, timer_mux));

        let dispatch_ctx = ctx.clone();
        let dispatch_listen_fd = listen_fd;
        let pool = WorkerPool::start(worker_count, queue_capacity, move |fd| {
            dispatch::dispatch(fd, &dispatch_ctx, dispatch_listen_fd);
        });

        tracing::info!(
            event = "daemon_bootstrapped",
            port = ctx.config.port,
            workers = worker_count,
            queue_capacity
        );

        Ok(Daemon { ctx, pool, listen_fd })
    }

    /// Runs the Listener Loop forever. Never returns under normal
    /// operation (§6: "exit codes: 0 never").
    pub fn run(self) -> ! {
        tracing::info!(event = "listener_started", fd = self.listen_fd);
        let timer_mux_fd = timer_mux_raw_fd(&self.ctx.timer_mux);
        let mut events = [EpollEvent::empty(); 1024];

        loop {
            let n = match self.ctx.main_mux.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    tracing::error!(event = "main_mux_wait_failed", error = %e);
                    continue;
                }
            };

            for event in &events[..n] {
                let token = event.data() as RawFd;
                let flags = event.events();

                if token == timer_mux_fd {
                    dispatch::reap_timers(&self.ctx);
                    if let Err(e) = self.ctx.main_mux.rearm(borrow(timer_mux_fd), timer_mux_fd as u64, Interest::Read) {
                        tracing::error!(event = "timer_mux_rearm_failed", error = %e);
                    }
                    continue;
                }

                if flags.contains(EpollFlags::EPOLLHUP) || flags.contains(EpollFlags::EPOLLERR) {
                    dispatch::terminate(token, &self.ctx);
                    continue;
                }

                self.pool.submit(token);
            }
        }
    }
}

fn create_listener(config: &Config) -> Result<RawFd, StartupError> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(StartupError::Socket)?;

    setsockopt(&fd, ReuseAddr, &true).map_err(StartupError::Socket)?;

    let addr = SockaddrIn::new(0, 0, 0, 0, config.port);
    bind(fd.as_raw_fd(), &addr).map_err(StartupError::Bind)?;

    let backlog = Backlog::new(config.listen_backlog).map_err(StartupError::Listen)?;
    nix_listen(&fd, backlog).map_err(StartupError::Listen)?;

    let raw = fd.as_raw_fd();
    std::mem::forget(fd);
    Ok(raw)
}

fn timer_mux_raw_fd(reactor: &Reactor) -> RawFd {
    reactor.as_raw_fd()
}
