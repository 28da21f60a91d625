use rembash::config::Config;
use rembash::listener::Daemon;
use rembash::logging;

fn main() -> anyhow::Result<()> {
    logging::init();

    let config = Config::from_env();
    let daemon = Daemon::bootstrap(config).map_err(|e| {
        tracing::error!(event = "startup_failed", error = %e);
        e
    })?;

    daemon.run();
}
