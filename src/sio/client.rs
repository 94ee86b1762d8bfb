//! The blocking client facade and transactional pipeline builder.

use std::sync::Arc;

use tracing::debug;

use crate::commands;
use crate::errors::{ErrorKind, RedisResult};
use crate::events::{Command, PipelinedCommands};
use crate::protocol::{RedisConfig, RedisProtocol};
use crate::types::{Encodable, Value};

use super::connection::Connection;
use super::pool::ConnectionPool;

/// A blocking client.
///
/// Commands go to the pinned connection when the client was built as a
/// single-connection client, otherwise to the pool.
pub struct Client {
    protocol: Arc<RedisProtocol>,
    pool: Arc<ConnectionPool>,
    connection: Option<Connection>,
    auto_close_connection_pool: bool,
}

impl Client {
    pub fn new(config: RedisConfig) -> RedisResult<Client> {
        let single_connection_client = config.single_connection_client;
        let auto_close_connection_pool = config.auto_close_connection_pool;
        let protocol = Arc::new(config.into_protocol()?);
        let pool = Arc::new(ConnectionPool::new(protocol.clone()));
        let connection = single_connection_client.then(|| Connection::new(protocol.clone()));
        Ok(Client {
            protocol,
            pool,
            connection,
            auto_close_connection_pool,
        })
    }

    /// Builds a client from a `redis://` / `rediss://` / `unix://` URL.
    pub fn open(url: &str) -> RedisResult<Client> {
        Client::new(RedisConfig::from_url(url)?)
    }

    /// Builds a client over an existing pool; the pool's lifetime stays with
    /// its owner.
    pub fn with_pool(pool: Arc<ConnectionPool>) -> Client {
        Client {
            protocol: pool.protocol().clone(),
            pool,
            connection: None,
            auto_close_connection_pool: false,
        }
    }

    pub fn protocol(&self) -> &Arc<RedisProtocol> {
        &self.protocol
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Connects eagerly: the pinned connection if one exists, and the pool's
    /// minimum when pre-fill is configured.
    pub fn connect(&mut self) -> RedisResult<()> {
        if let Some(conn) = &mut self.connection {
            conn.connect()?;
        }
        if self.protocol.pool.pre_fill {
            self.pool.fill(false)?;
        }
        Ok(())
    }

    pub fn execute_command(&mut self, cmd: Command) -> RedisResult<Value> {
        match &mut self.connection {
            Some(conn) => {
                conn.connect()?;
                conn.check_health()?;
                conn.execute_command(cmd)
            }
            None => self.pool.execute_command(cmd),
        }
    }

    pub fn execute_pipeline(&mut self, pipeline: PipelinedCommands) -> RedisResult<Vec<Value>> {
        match &mut self.connection {
            Some(conn) => {
                conn.connect()?;
                conn.execute_pipeline(pipeline)
            }
            None => self.pool.execute_pipeline(pipeline),
        }
    }

    /// Starts building a pipeline. With `transaction`, execution wraps the
    /// commands in `MULTI`/`EXEC`.
    pub fn pipeline(&self, transaction: bool) -> Pipeline {
        Pipeline::new(self.pool.clone(), self.protocol.clone(), transaction)
    }

    /// Disconnects the pinned connection and, when this client owns its
    /// pool's lifetime, the pool.
    pub fn close(&mut self) -> RedisResult<()> {
        if let Some(mut conn) = self.connection.take() {
            conn.disconnect();
        }
        if self.auto_close_connection_pool {
            self.pool.disconnect(true)?;
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A buffered command list executed in one round-trip, with optimistic
/// locking via `WATCH`.
///
/// Commands append to the stack instead of being sent. `watch` pins a pool
/// connection so the lock and the later `EXEC` observe the same session;
/// the connection is released (with a best-effort `UNWATCH`) when the
/// pipeline executes or resets.
#[derive(Debug)]
pub struct Pipeline {
    protocol: Arc<RedisProtocol>,
    pool: Arc<ConnectionPool>,
    stack: PipelinedCommands,
    base_transaction: bool,
    watching: bool,
    explicit_transaction: bool,
    connection: Option<Connection>,
}

impl Pipeline {
    fn new(pool: Arc<ConnectionPool>, protocol: Arc<RedisProtocol>, transaction: bool) -> Pipeline {
        Pipeline {
            protocol,
            pool,
            stack: PipelinedCommands::new(transaction, true),
            base_transaction: transaction,
            watching: false,
            explicit_transaction: false,
            connection: None,
        }
    }

    /// Appends a command to the stack.
    pub fn command(&mut self, cmd: Command) -> RedisResult<&mut Pipeline> {
        if cmd.verb.eq_ignore_ascii_case("WATCH") {
            fail!((ErrorKind::ClientError, "'WATCH' cannot be pipelined."));
        }
        self.protocol.extend_pipeline(&mut self.stack, cmd);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Watches keys for the next transaction. Runs immediately on a pinned
    /// connection; it cannot be part of the buffered stack.
    pub fn watch<I, K>(&mut self, keys: I) -> RedisResult<Value>
    where
        I: IntoIterator<Item = K>,
        K: Into<Encodable>,
    {
        if self.explicit_transaction {
            fail!((ErrorKind::ClientError, "Cannot issue a WATCH after a MULTI"));
        }
        let conn = self.pinned_connection()?;
        let reply = conn.execute_command(commands::watch(keys))?;
        self.watching = true;
        Ok(reply)
    }

    /// Starts the transactional block after `WATCH` commands were issued.
    /// Ends with [`execute`](Pipeline::execute).
    pub fn multi(&mut self) -> RedisResult<()> {
        if self.explicit_transaction {
            return Ok(());
        }
        if !self.stack.is_empty() {
            fail!((
                ErrorKind::ClientError,
                "Commands without an initial WATCH have already been issued"
            ));
        }
        self.explicit_transaction = true;
        Ok(())
    }

    /// Clears all watched keys on the pinned connection.
    pub fn unwatch(&mut self) -> RedisResult<Value> {
        let reply = match &mut self.connection {
            Some(conn) => conn.execute_command(commands::unwatch())?,
            None => Value::Okay,
        };
        self.watching = false;
        Ok(reply)
    }

    /// Appends a `DISCARD` to the stack.
    pub fn discard(&mut self) -> RedisResult<&mut Pipeline> {
        self.command(commands::discard())
    }

    /// Packs and sends the stack, raising the first error in the replies.
    pub fn execute(&mut self) -> RedisResult<Vec<Value>> {
        self.execute_with(true)
    }

    /// Packs and sends the stack. Without `raise_on_error`, per-command
    /// errors come back in the reply array instead.
    pub fn execute_with(&mut self, raise_on_error: bool) -> RedisResult<Vec<Value>> {
        let mut stack = std::mem::take(&mut self.stack);
        self.stack = PipelinedCommands::new(self.base_transaction, true);
        if stack.is_empty() {
            self.finish();
            return Ok(Vec::new());
        }
        stack.transaction = self.base_transaction || self.explicit_transaction;
        stack.raise_on_error = raise_on_error;
        // Only bound to an explicit connection when WATCH was issued.
        let result = match &mut self.connection {
            Some(conn) => conn.execute_pipeline(stack),
            None => self.pool.execute_pipeline(stack),
        };
        self.finish();
        result
    }

    /// Drops the buffered commands and releases the pinned connection.
    pub fn reset(&mut self) {
        self.stack = PipelinedCommands::new(self.base_transaction, true);
        self.finish();
    }

    fn pinned_connection(&mut self) -> RedisResult<&mut Connection> {
        if self.connection.is_none() {
            let conn = self.pool.acquire()?;
            self.connection = Some(conn);
        }
        Ok(self.connection.as_mut().expect("pinned above"))
    }

    /// Releases the pinned connection, clearing any watch left on it first.
    /// A lost connection has nothing to unwatch.
    fn finish(&mut self) {
        self.explicit_transaction = false;
        if let Some(mut conn) = self.connection.take() {
            if self.watching {
                if let Err(err) = conn.execute_command(commands::unwatch()) {
                    if !err.is_connection_dropped() && err.kind() != ErrorKind::Connection {
                        debug!(error = %err, "UNWATCH on pipeline release failed");
                    }
                }
            }
            self.pool.release(conn);
        }
        self.watching = false;
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.finish();
    }
}
