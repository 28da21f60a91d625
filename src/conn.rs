use std::os::fd::RawFd;
use std::time::Instant;

use nix::unistd::Pid;

/// Lifecycle states from SPEC_FULL.md §3: `New -> Validated -> Established
/// <-> Unwritten -> Terminated`. `Validated` is transient — a connection
/// moves straight through it into `Established` once the shell is spawned,
/// but it exists as a distinct state so a timer firing between secret
/// validation and PTY spawn still has a well-defined state to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Validated,
    Established,
    Unwritten,
    Terminated,
}

/// One remote shell connection. Exactly one of `client_fd`/`pty_fd` is the
/// "other side" of the data transfer once `Established`: bytes read from
/// one are written to the other. `pending` buffers at most one read-chunk
/// of unwritten bytes — never more, since at most one `read` is ever
/// outstanding per dispatch (SPEC_FULL.md §9).
pub struct Connection {
    pub client_fd: RawFd,
    pub pty_fd: Option<RawFd>,
    pub timer_fd: Option<RawFd>,
    pub child_pid: Option<Pid>,
    pub state: ConnState,
    pub pending: Vec<u8>,
    pub handshake_deadline: Instant,
}

impl Connection {
    pub fn new(client_fd: RawFd, chunk_size: usize, handshake_deadline: Instant) -> Self {
        Connection {
            client_fd,
            pty_fd: None,
            timer_fd: None,
            child_pid: None,
            state: ConnState::New,
            pending: Vec::with_capacity(chunk_size),
            handshake_deadline,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ConnState::Terminated
    }

    /// Enters `Unwritten` with `tail` as the bytes still owed to the peer,
    /// replacing whatever was buffered before (there is never more than
    /// one short write outstanding at a time — the caller only reaches
    /// this from `Established`). Which direction the pending bytes flow
    /// is implicit in which fd is write-armed (SPEC_FULL.md §4.7); the
    /// dispatcher tracks that via `to_fd`/`other_side`, not this struct.
    pub fn enter_unwritten(&mut self, tail: &[u8]) {
        self.pending.clear();
        self.pending.extend_from_slice(tail);
        self.state = ConnState::Unwritten;
    }

    /// Records that `n` more bytes of the pending buffer drained
    /// successfully. Returns `true` once the buffer is fully drained, in
    /// which case the caller transitions back to `Established`; otherwise
    /// the remaining tail stays buffered and `state` stays `Unwritten`.
    pub fn advance_unwritten(&mut self, n: usize) -> bool {
        self.pending.drain(0..n);
        if self.pending.is_empty() {
            self.state = ConnState::Established;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fresh() -> Connection {
        Connection::new(3, 4096, Instant::now())
    }

    #[test]
    fn enter_unwritten_then_full_drain_returns_to_established() {
        let mut conn = fresh();
        conn.enter_unwritten(b"hello");
        assert_eq!(conn.state, ConnState::Unwritten);
        assert_eq!(conn.pending.len(), 5);
        assert!(conn.advance_unwritten(5));
        assert_eq!(conn.state, ConnState::Established);
        assert!(conn.pending.is_empty());
    }

    #[test]
    fn enter_unwritten_replaces_prior_buffer() {
        let mut conn = fresh();
        conn.enter_unwritten(b"first-chunk");
        conn.enter_unwritten(b"xy");
        assert_eq!(conn.pending, b"xy".to_vec());
    }

    proptest! {
        // No byte read is ever discarded while the connection stays
        // non-Terminated (spec.md §8 invariant 2): the buffered tail
        // never exceeds the chunk that produced it, and draining it in
        // arbitrary increments always accounts for every byte.
        #[test]
        fn partial_drain_preserves_every_byte(
            tail in prop::collection::vec(any::<u8>(), 0..4096),
            drain_steps in prop::collection::vec(1usize..=4096, 0..20),
        ) {
            let mut conn = fresh();
            conn.enter_unwritten(&tail);
            prop_assert!(conn.pending.len() <= 4096);
            prop_assert_eq!(&conn.pending[..], &tail[..]);

            let mut remaining = tail.len();
            for step in drain_steps {
                if remaining == 0 {
                    break;
                }
                let n = step.min(remaining);
                let fully_drained = conn.advance_unwritten(n);
                remaining -= n;
                prop_assert_eq!(conn.pending.len(), remaining);
                prop_assert_eq!(fully_drained, remaining == 0);
                prop_assert_eq!(
                    conn.state,
                    if remaining == 0 { ConnState::Established } else { ConnState::Unwritten }
                );
            }
        }
    }
}
