//! The blocking connection pool.

use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{debug, trace, warn};

use crate::errors::{ErrorKind, RedisResult};
use crate::events::{Command, PipelinedCommands};
use crate::types::Value;

use super::connection::Connection;

#[derive(Debug)]
struct PoolState {
    free: VecDeque<Connection>,
    in_use: HashSet<usize>,
    acquiring: usize,
}

/// A bounded pool of blocking connections.
///
/// The pool keeps up to `max_connections` live connections, eagerly holding
/// `min_connections` of them. When every connection is checked out, callers
/// block on a condition variable until one is released (or fail immediately
/// when the pool is configured not to block).
#[derive(Debug)]
pub struct ConnectionPool {
    protocol: Arc<crate::protocol::RedisProtocol>,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl ConnectionPool {
    pub fn new(protocol: Arc<crate::protocol::RedisProtocol>) -> ConnectionPool {
        ConnectionPool {
            protocol,
            state: Mutex::new(PoolState {
                free: VecDeque::new(),
                in_use: HashSet::new(),
                acquiring: 0,
            }),
            released: Condvar::new(),
        }
    }

    pub fn protocol(&self) -> &Arc<crate::protocol::RedisProtocol> {
        &self.protocol
    }

    /// Total connections owned by or being added to the pool.
    pub fn size(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.free.len() + state.in_use.len() + state.acquiring
    }

    /// Connections ready for checkout.
    pub fn available(&self) -> usize {
        self.state.lock().unwrap().free.len()
    }

    /// Executes a single command on a pooled connection. Timeouts are
    /// retried once on a fresh connection when so configured.
    pub fn execute_command(&self, cmd: Command) -> RedisResult<Value> {
        let mut guard = self.checkout()?;
        guard.check_health()?;
        match guard.execute_command(cmd.clone()) {
            Err(err) if err.is_timeout() && self.protocol.socket.retry_on_timeout => {
                // The timed-out connection is poisoned; its release drops it.
                drop(guard);
                let mut guard = self.checkout()?;
                guard.execute_command(cmd)
            }
            result => result,
        }
    }

    /// Executes a pipeline on a pooled connection.
    pub fn execute_pipeline(&self, pipeline: PipelinedCommands) -> RedisResult<Vec<Value>> {
        let mut guard = self.checkout()?;
        guard.check_health()?;
        match guard.execute_pipeline(pipeline.clone()) {
            Err(err) if err.is_timeout() && self.protocol.socket.retry_on_timeout => {
                drop(guard);
                let mut guard = self.checkout()?;
                guard.execute_pipeline(pipeline)
            }
            result => result,
        }
    }

    /// Checks out a connection, released back to the pool when the guard is
    /// dropped.
    pub fn connection(&self) -> RedisResult<PoolConnection<'_>> {
        self.checkout()
    }

    fn checkout(&self) -> RedisResult<PoolConnection<'_>> {
        // Fast path: grab a live free connection without filling or waiting.
        {
            let mut state = self.state.lock().unwrap();
            if let Some(conn) = Self::pop_free(&mut state) {
                state.in_use.insert(conn.id());
                return Ok(PoolConnection {
                    pool: self,
                    conn: Some(conn),
                });
            }
        }
        let conn = self.acquire()?;
        Ok(PoolConnection {
            pool: self,
            conn: Some(conn),
        })
    }

    /// Acquires a connection, blocking while the pool is at capacity with
    /// nothing free.
    pub fn acquire(&self) -> RedisResult<Connection> {
        let mut state = self.state.lock().unwrap();
        loop {
            // Add at least one connection to the pool, if capacity allows.
            self.fill_locked(&mut state, true)?;
            if let Some(conn) = Self::pop_free(&mut state) {
                state.in_use.insert(conn.id());
                trace!(id = conn.id(), "connection acquired");
                return Ok(conn);
            }
            if !self.protocol.pool.block {
                fail!((ErrorKind::Connection, "No connection available."));
            }
            state = self.released.wait(state).unwrap();
        }
    }

    /// Returns a connection to the pool. Foreign or already-released
    /// connections are disconnected and dropped, as are dead ones.
    pub fn release(&self, mut conn: Connection) {
        let mut state = self.state.lock().unwrap();
        if !state.in_use.remove(&conn.id()) {
            drop(state);
            warn!(id = conn.id(), "released a connection the pool does not own");
            conn.disconnect();
            self.released.notify_one();
            return;
        }
        if conn.is_connected() {
            trace!(id = conn.id(), "connection released");
            state.free.push_back(conn);
        } else {
            trace!(id = conn.id(), "released connection was dead; dropping");
        }
        drop(state);
        self.released.notify_one();
    }

    /// Fills the pool to `min_connections`. With `override_min`, keeps
    /// adding until a connection is free or `max_connections` is reached.
    pub fn fill(&self, override_min: bool) -> RedisResult<()> {
        let mut state = self.state.lock().unwrap();
        self.fill_locked(&mut state, override_min)?;
        drop(state);
        self.released.notify_one();
        Ok(())
    }

    fn fill_locked(&self, state: &mut MutexGuard<'_, PoolState>, override_min: bool) -> RedisResult<()> {
        let min = self.protocol.pool.min_connections;
        let max = self.protocol.pool.max_connections;
        Self::drop_closed(state);
        while Self::size_locked(state) < min {
            self.add_connection(state)?;
            Self::drop_closed(state);
        }
        if override_min {
            while Self::size_locked(state) < max && state.free.is_empty() {
                self.add_connection(state)?;
                Self::drop_closed(state);
            }
        }
        Ok(())
    }

    fn add_connection(&self, state: &mut MutexGuard<'_, PoolState>) -> RedisResult<()> {
        let mut conn = Connection::new(self.protocol.clone());
        state.acquiring += 1;
        let connected = conn.connect();
        state.acquiring -= 1;
        connected?;
        debug!(id = conn.id(), size = Self::size_locked(state) + 1, "pool connection added");
        state.free.push_back(conn);
        Ok(())
    }

    fn size_locked(state: &MutexGuard<'_, PoolState>) -> usize {
        state.free.len() + state.in_use.len() + state.acquiring
    }

    /// Prunes closed connections from the front of the deque, preserving the
    /// relative order of live ones.
    fn drop_closed(state: &mut MutexGuard<'_, PoolState>) {
        for _ in 0..state.free.len() {
            let Some(conn) = state.free.front() else {
                break;
            };
            if conn.is_connected() {
                state.free.rotate_left(1);
            } else {
                state.free.pop_front();
            }
        }
    }

    /// Rotates the deque so checkouts round-robin across connections, then
    /// pops the first live one.
    fn pop_free(state: &mut MutexGuard<'_, PoolState>) -> Option<Connection> {
        for _ in 0..state.free.len() {
            state.free.rotate_left(1);
            if state
                .free
                .back()
                .map(Connection::is_connected)
                .unwrap_or(false)
            {
                return state.free.pop_back();
            }
        }
        None
    }

    /// Disconnects every free connection; with `inuse`, checked-out
    /// connections are disowned so their eventual release drops them too.
    pub fn disconnect(&self, inuse: bool) -> RedisResult<()> {
        let mut state = self.state.lock().unwrap();
        while let Some(mut conn) = state.free.pop_front() {
            conn.disconnect();
        }
        if inuse {
            state.in_use.clear();
        }
        drop(state);
        self.released.notify_one();
        Ok(())
    }

    /// Discards all current connections and refills to the minimum.
    pub fn reset(&self, inuse: bool) -> RedisResult<()> {
        self.disconnect(inuse)?;
        self.fill(false)
    }
}

/// RAII checkout of a pooled connection; released on drop.
pub struct PoolConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl Deref for PoolConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("present until dropped")
    }
}

impl DerefMut for PoolConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("present until dropped")
    }
}

impl Drop for PoolConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
