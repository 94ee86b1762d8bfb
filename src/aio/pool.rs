//! The cooperative connection pool.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

use crate::errors::{ErrorKind, RedisResult};
use crate::events::{Command, PipelinedCommands};
use crate::protocol::RedisProtocol;
use crate::types::Value;

use super::connection::Connection;

struct PoolState {
    free: VecDeque<Connection>,
    in_use: HashSet<usize>,
    acquiring: usize,
}

/// A bounded pool of tokio connections.
///
/// Tasks acquiring at capacity suspend until a release signals the pool;
/// the checkout fast path rotates the free deque so load spreads across
/// connections round-robin.
pub struct ConnectionPool {
    protocol: Arc<RedisProtocol>,
    state: Mutex<PoolState>,
    released: Notify,
}

impl ConnectionPool {
    pub fn new(protocol: Arc<RedisProtocol>) -> ConnectionPool {
        ConnectionPool {
            protocol,
            state: Mutex::new(PoolState {
                free: VecDeque::new(),
                in_use: HashSet::new(),
                acquiring: 0,
            }),
            released: Notify::new(),
        }
    }

    pub fn protocol(&self) -> &Arc<RedisProtocol> {
        &self.protocol
    }

    /// Total connections owned by or being added to the pool.
    pub async fn size(&self) -> usize {
        let state = self.state.lock().await;
        state.free.len() + state.in_use.len() + state.acquiring
    }

    /// Connections ready for checkout.
    pub async fn available(&self) -> usize {
        self.state.lock().await.free.len()
    }

    /// Executes a single command on a pooled connection. Timeouts are
    /// retried once on a fresh connection when so configured.
    pub async fn execute_command(&self, cmd: Command) -> RedisResult<Value> {
        let mut conn = self.checkout().await?;
        let result = match conn.check_health().await {
            Ok(()) => conn.execute_command(cmd.clone()).await,
            Err(err) => Err(err),
        };
        self.release(conn).await;
        match result {
            Err(err) if err.is_timeout() && self.protocol.socket.retry_on_timeout => {
                let mut conn = self.checkout().await?;
                let result = conn.execute_command(cmd).await;
                self.release(conn).await;
                result
            }
            result => result,
        }
    }

    /// Executes a pipeline on a pooled connection.
    pub async fn execute_pipeline(&self, pipeline: PipelinedCommands) -> RedisResult<Vec<Value>> {
        let mut conn = self.checkout().await?;
        let result = match conn.check_health().await {
            Ok(()) => conn.execute_pipeline(pipeline.clone()).await,
            Err(err) => Err(err),
        };
        self.release(conn).await;
        match result {
            Err(err) if err.is_timeout() && self.protocol.socket.retry_on_timeout => {
                let mut conn = self.checkout().await?;
                let result = conn.execute_pipeline(pipeline).await;
                self.release(conn).await;
                result
            }
            result => result,
        }
    }

    async fn checkout(&self) -> RedisResult<Connection> {
        // Fast path: a live free connection, no filling, no waiting.
        {
            let mut state = self.state.lock().await;
            if let Some(conn) = Self::pop_free(&mut state) {
                state.in_use.insert(conn.id());
                return Ok(conn);
            }
        }
        self.acquire().await
    }

    /// Acquires a connection, suspending while the pool is at capacity with
    /// nothing free.
    pub async fn acquire(&self) -> RedisResult<Connection> {
        loop {
            let mut state = self.state.lock().await;
            // Add at least one connection to the pool, if capacity allows.
            self.fill_locked(&mut state, true).await?;
            if let Some(conn) = Self::pop_free(&mut state) {
                state.in_use.insert(conn.id());
                trace!(id = conn.id(), "connection acquired");
                return Ok(conn);
            }
            if !self.protocol.pool.block {
                fail!((ErrorKind::Connection, "No connection available."));
            }
            // Register for the wakeup before releasing the lock so a release
            // in between is not missed.
            let released = self.released.notified();
            drop(state);
            released.await;
        }
    }

    /// Returns a connection to the pool. Foreign or already-released
    /// connections are disconnected and dropped, as are dead ones.
    pub async fn release(&self, mut conn: Connection) {
        let mut state = self.state.lock().await;
        if !state.in_use.remove(&conn.id()) {
            drop(state);
            warn!(id = conn.id(), "released a connection the pool does not own");
            conn.disconnect().await;
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
    pub async fn fill(&self, override_min: bool) -> RedisResult<()> {
        let mut state = self.state.lock().await;
        self.fill_locked(&mut state, override_min).await?;
        drop(state);
        self.released.notify_one();
        Ok(())
    }

    async fn fill_locked(&self, state: &mut PoolState, override_min: bool) -> RedisResult<()> {
        let min = self.protocol.pool.min_connections;
        let max = self.protocol.pool.max_connections;
        Self::drop_closed(state);
        while Self::size_locked(state) < min {
            self.add_connection(state).await?;
            Self::drop_closed(state);
        }
        if override_min {
            while Self::size_locked(state) < max && state.free.is_empty() {
                self.add_connection(state).await?;
                Self::drop_closed(state);
            }
        }
        Ok(())
    }

    async fn add_connection(&self, state: &mut PoolState) -> RedisResult<()> {
        let mut conn = Connection::new(self.protocol.clone());
        state.acquiring += 1;
        let connected = conn.connect().await;
        state.acquiring -= 1;
        connected?;
        debug!(
            id = conn.id(),
            size = Self::size_locked(state) + 1,
            "pool connection added"
        );
        state.free.push_back(conn);
        Ok(())
    }

    fn size_locked(state: &PoolState) -> usize {
        state.free.len() + state.in_use.len() + state.acquiring
    }

    /// Prunes closed connections, preserving the relative order of live
    /// ones.
    fn drop_closed(state: &mut PoolState) {
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
    fn pop_free(state: &mut PoolState) -> Option<Connection> {
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
    pub async fn disconnect(&self, inuse: bool) -> RedisResult<()> {
        let mut state = self.state.lock().await;
        while let Some(mut conn) = state.free.pop_front() {
            conn.disconnect().await;
        }
        if inuse {
            state.in_use.clear();
        }
        drop(state);
        self.released.notify_one();
        Ok(())
    }

    /// Discards all current connections and refills to the minimum.
    pub async fn reset(&self, inuse: bool) -> RedisResult<()> {
        self.disconnect(inuse).await?;
        self.fill(false).await
    }
}
