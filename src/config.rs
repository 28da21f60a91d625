use std::env;
use std::time::Duration;

/// Runtime configuration for the daemon. Every field has a compiled-in
/// default matching the protocol; each can be overridden by an environment
/// variable for testing and operability. There is no config file — the
/// daemon persists no state and takes no CLI arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub secret: String,
    pub challenge: String,
    pub ok: String,
    pub error: String,
    pub handshake_timeout_ms: u64,
    pub max_clients: usize,
    pub chunk_size: usize,
    pub listen_backlog: i32,
    pub tasks_per_thread: usize,
    pub worker_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 4070,
            secret: "cs407rembash".to_string(),
            challenge: "<rembash>\n".to_string(),
            ok: "<ok>\n".to_string(),
            error: "<error>\n".to_string(),
            handshake_timeout_ms: 3000,
            max_clients: 64_000,
            chunk_size: 4096,
            listen_backlog: 10,
            tasks_per_thread: 2,
            worker_threads: 0,
        }
    }
}

impl Config {
    /// Applies `REMBASH_*` environment overrides on top of the defaults.
    /// Malformed numeric overrides are ignored in favor of the default
    /// rather than treated as startup errors — they only ever matter in
    /// test harnesses, not in the production deployment path.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Some(v) = env_u16("REMBASH_PORT") {
            cfg.port = v;
        }
        if let Ok(v) = env::var("REMBASH_SECRET") {
            cfg.secret = v;
        }
        if let Some(v) = env_u64("REMBASH_HANDSHAKE_TIMEOUT_MS") {
            cfg.handshake_timeout_ms = v;
        }
        if let Some(v) = env_usize("REMBASH_MAX_CLIENTS") {
            cfg.max_clients = v;
        }
        if let Some(v) = env_usize("REMBASH_TASKS_PER_THREAD") {
            cfg.tasks_per_thread = v;
        }
        if let Some(v) = env_usize("REMBASH_WORKER_THREADS") {
            cfg.worker_threads = v;
        }

        cfg
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Secret line as transmitted on the wire, including the trailing
    /// newline the client is expected to send.
    pub fn secret_line(&self) -> String {
        format!("{}\n", self.secret)
    }

    pub fn worker_count(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.worker_count() * self.tasks_per_thread.max(1)
    }
}

fn env_u16(key: &str) -> Option<u16> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
