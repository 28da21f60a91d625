use thiserror::Error;

/// Failures that abort startup before the listener loop can run.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to create listening socket: {0}")]
    Socket(#[source] nix::Error),
    #[error("failed to bind listening socket: {0}")]
    Bind(#[source] nix::Error),
    #[error("failed to listen on socket: {0}")]
    Listen(#[source] nix::Error),
    #[error("epoll setup failed: {0}")]
    Epoll(#[source] nix::Error),
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
    #[error("failed to set signal disposition: {0}")]
    Signal(#[source] nix::Error),
}

/// Failures scoped to a single connection. These never propagate out of
/// the dispatcher — they are caught there, logged, and routed to the
/// Terminator. EAGAIN/EWOULDBLOCK is not a variant here: it is handled
/// inline at the call site and never becomes an error value.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("peer closed the connection")]
    Eof,
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
    #[error("peer hung up or reported an error")]
    HangupOrError,
    #[error("handshake not completed within the deadline")]
    HandshakeTimeout,
    #[error("handshake secret did not match")]
    ProtocolMismatch,
    #[error("failed to spawn shell: {0}")]
    ShellSpawn(#[source] anyhow::Error),
}

impl From<std::io::Error> for ConnError {
    fn from(e: std::io::Error) -> Self {
        ConnError::Io(e)
    }
}
