use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::pty::{PtyMaster, grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::stat::Mode;
use nix::unistd::{ForkResult, Pid, close, dup2, execvp, fork, setsid};

use crate::error::ConnError;

/// Result of successfully spawning a shell: the PTY master fd (registered
/// in the Readiness Multiplexer by the caller) and the child's pid (never
/// waited on — `SIGCHLD` is ignored process-wide so the kernel auto-reaps
/// it, per SPEC_FULL.md §9).
pub struct SpawnedShell {
    pub pty_master: RawFd,
    pub child_pid: Pid,
}

/// Opens a PTY master/slave pair and forks a session leader that execs
/// `bash` with the slave bound to its standard streams. `client_fd` is the
/// connection's socket — it is inherited across `fork` (the listening
/// socket is opened `SOCK_NONBLOCK` only, no `CLOEXEC`) and must be closed
/// in the child per spec.md §4.5 step 7 ("close the PTY master and socket
/// copies"), or the shell holds a live reference that keeps the client's
/// socket open after the server's own copy is closed. Grounded on
/// `original_source/Lab5/server.c`'s `open_pty`/`create_bash_process`.
pub fn spawn_shell(client_fd: RawFd) -> Result<SpawnedShell, ConnError> {
    let master: PtyMaster = posix_openpt(nix::fcntl::OFlag::O_RDWR).map_err(to_conn_error)?;
    grantpt(&master).map_err(to_conn_error)?;
    unlockpt(&master).map_err(to_conn_error)?;
    let slave_name = unsafe { ptsname_r(&master) }.map_err(to_conn_error)?;

    let master_fd = master.as_raw_fd();

    match unsafe { fork() }.map_err(to_conn_error)? {
        ForkResult::Parent { child } => {
            // Ownership of the master fd now lives in the Connection
            // Record; prevent PtyMaster's drop from closing it under us.
            std::mem::forget(master);
            Ok(SpawnedShell {
                pty_master: master_fd,
                child_pid: child,
            })
        }
        ForkResult::Child => {
            // Any failure from here on terminates the child; there is no
            // path back to the parent's control flow.
            child_exec(&slave_name, master_fd, client_fd);
            unreachable!("child_exec always exits or replaces the process image");
        }
    }
}

/// Runs entirely in the forked child. Never returns: either `execvp`
/// replaces the process image or the child exits non-zero on setup
/// failure, matching `original_source/Lab5/server.c`'s
/// `create_bash_process` ("Any failure before exec terminates the child").
fn child_exec(slave_name: &str, master_fd: RawFd, client_fd: RawFd) -> ! {
    let setup = || -> nix::Result<()> {
        setsid()?;
        close(master_fd)?;
        close(client_fd)?;

        let slave_path = CString::new(slave_name).expect("pty slave path has no interior NUL");
        let slave_fd = nix::fcntl::open(slave_path.as_c_str(), nix::fcntl::OFlag::O_RDWR, Mode::empty())?;
        let slave_borrowed: BorrowedFd<'_> = unsafe { BorrowedFd::borrow_raw(slave_fd) };

        dup2(slave_borrowed, 0)?;
        dup2(slave_borrowed, 1)?;
        dup2(slave_borrowed, 2)?;
        if slave_fd > 2 {
            close(slave_fd)?;
        }

        let bash = CString::new("bash").expect("constant string");
        execvp(&bash, &[bash.clone()])?;
        unreachable!("execvp does not return on success");
    };

    if setup().is_err() {
        std::process::exit(1);
    }
    std::process::exit(0)
}

fn to_conn_error(e: nix::Error) -> ConnError {
    ConnError::ShellSpawn(anyhow::anyhow!(e))
}
