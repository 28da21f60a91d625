use std::os::fd::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::conn::Connection;

/// Dense fd-indexed connection registry, generalizing the C source's
/// `client_fd_tuples`/`timer_fd_tuples` arrays (`original_source/Lab5/server.c`)
/// into an owned Rust container. The table exclusively owns each
/// `Connection`; one-shot epoll arming is what guarantees only one worker
/// ever touches a given entry at a time, so the `Mutex` here is a belt
/// to the kernel's suspenders, not the primary exclusion mechanism.
pub struct ConnTable {
    by_client_fd: Vec<Option<Arc<Mutex<Connection>>>>,
    by_pty_fd: Vec<Option<Arc<Mutex<Connection>>>>,
    by_timer_fd: Vec<Option<Arc<Mutex<Connection>>>>,
}

impl ConnTable {
    pub fn new(capacity: usize) -> Self {
        ConnTable {
            by_client_fd: (0..capacity).map(|_| None).collect(),
            by_pty_fd: (0..capacity).map(|_| None).collect(),
            by_timer_fd: (0..capacity).map(|_| None).collect(),
        }
    }

    fn grow_to(slots: &mut Vec<Option<Arc<Mutex<Connection>>>>, fd: RawFd) {
        let idx = fd as usize;
        if idx >= slots.len() {
            slots.resize(idx + 1, None);
        }
    }

    pub fn insert_client(&mut self, fd: RawFd, conn: Arc<Mutex<Connection>>) {
        Self::grow_to(&mut self.by_client_fd, fd);
        self.by_client_fd[fd as usize] = Some(conn);
    }

    pub fn bind_pty(&mut self, fd: RawFd, conn: Arc<Mutex<Connection>>) {
        Self::grow_to(&mut self.by_pty_fd, fd);
        self.by_pty_fd[fd as usize] = Some(conn);
    }

    pub fn bind_timer(&mut self, fd: RawFd, conn: Arc<Mutex<Connection>>) {
        Self::grow_to(&mut self.by_timer_fd, fd);
        self.by_timer_fd[fd as usize] = Some(conn);
    }

    pub fn lookup_client(&self, fd: RawFd) -> Option<Arc<Mutex<Connection>>> {
        self.by_client_fd.get(fd as usize).and_then(|c| c.clone())
    }

    pub fn lookup_pty(&self, fd: RawFd) -> Option<Arc<Mutex<Connection>>> {
        self.by_pty_fd.get(fd as usize).and_then(|c| c.clone())
    }

    pub fn lookup_timer(&self, fd: RawFd) -> Option<Arc<Mutex<Connection>>> {
        self.by_timer_fd.get(fd as usize).and_then(|c| c.clone())
    }

    pub fn remove_client(&mut self, fd: RawFd) {
        if let Some(slot) = self.by_client_fd.get_mut(fd as usize) {
            *slot = None;
        }
    }

    pub fn remove_pty(&mut self, fd: RawFd) {
        if let Some(slot) = self.by_pty_fd.get_mut(fd as usize) {
            *slot = None;
        }
    }

    pub fn remove_timer(&mut self, fd: RawFd) {
        if let Some(slot) = self.by_timer_fd.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnState;
    use std::time::Instant;

    fn fresh_conn(fd: RawFd) -> Arc<Mutex<Connection>> {
        Arc::new(Mutex::new(Connection::new(fd, 4096, Instant::now())))
    }

    #[test]
    fn insert_and_lookup_round_trips() {
        let mut table = ConnTable::new(16);
        let conn = fresh_conn(5);
        table.insert_client(5, conn.clone());
        let found = table.lookup_client(5).expect("should find connection");
        assert_eq!(found.lock().client_fd, 5);
    }

    #[test]
    fn lookup_of_unknown_fd_is_none() {
        let table = ConnTable::new(16);
        assert!(table.lookup_client(3).is_none());
    }

    #[test]
    fn table_grows_past_initial_capacity() {
        let mut table = ConnTable::new(4);
        let conn = fresh_conn(100);
        table.insert_client(100, conn);
        assert!(table.lookup_client(100).is_some());
    }

    #[test]
    fn remove_clears_the_slot() {
        let mut table = ConnTable::new(16);
        table.insert_client(2, fresh_conn(2));
        table.remove_client(2);
        assert!(table.lookup_client(2).is_none());
    }

    #[test]
    fn separate_namespaces_do_not_collide() {
        let mut table = ConnTable::new(16);
        let client = fresh_conn(3);
        let pty = fresh_conn(3);
        table.insert_client(3, client.clone());
        table.bind_pty(3, pty.clone());
        assert!(Arc::ptr_eq(&table.lookup_client(3).unwrap(), &client));
        assert!(Arc::ptr_eq(&table.lookup_pty(3).unwrap(), &pty));
    }

    #[test]
    fn fresh_connection_starts_in_new_state() {
        let conn = fresh_conn(1);
        assert_eq!(conn.lock().state, ConnState::New);
    }
}
