use parking_lot::Mutex;

use crate::config::Config;
use crate::mux::Reactor;
use crate::table::ConnTable;

/// Process-wide state shared by the Listener Loop and every worker.
/// Encapsulates the connection/timer tables and both readiness-multiplexer
/// handles in a single owning context, per SPEC_FULL.md §9's note that
/// these are "effectively singletons" that "may be encapsulated in a
/// single owning context passed to workers at startup."
pub struct DaemonCtx {
    pub config: Config,
    pub main_mux: Reactor,
    pub timer_mux: Reactor,
    pub table: Mutex<ConnTable>,
}

impl DaemonCtx {
    pub fn new(config: Config, main_mux: Reactor, timer_mux: Reactor) -> Self {
        let table = ConnTable::new(config.max_clients * 2 + 16);
        DaemonCtx {
            config,
            main_mux,
            timer_mux,
            table: Mutex::new(table),
        }
    }
}
