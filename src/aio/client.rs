//! The tokio client facade and transactional pipeline builder.

use std::sync::Arc;

use tracing::debug;

use crate::commands;
use crate::errors::{ErrorKind, RedisResult};
use crate::events::{Command, PipelinedCommands};
use crate::protocol::{RedisConfig, RedisProtocol};
use crate::types::{Encodable, Value};

use super::connection::Connection;
use super::pool::ConnectionPool;

/// A tokio client.
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
    pub async fn connect(&mut self) -> RedisResult<()> {
        if let Some(conn) = &mut self.connection {
            conn.connect().await?;
        }
        if self.protocol.pool.pre_fill {
            self.pool.fill(false).await?;
        }
        Ok(())
    }

    pub async fn execute_command(&mut self, cmd: Command) -> RedisResult<Value> {
        match &mut self.connection {
            Some(conn) => {
                conn.connect().await?;
                conn.check_health().await?;
                conn.execute_command(cmd).await
            }
            None => self.pool.execute_command(cmd).await,
        }
    }

    pub async fn execute_pipeline(
        &mut self,
        pipeline: PipelinedCommands,
    ) -> RedisResult<Vec<Value>> {
        match &mut self.connection {
            Some(conn) => {
                conn.connect().await?;
                conn.execute_pipeline(pipeline).await
            }
            None => self.pool.execute_pipeline(pipeline).await,
        }
    }

    /// Starts building a pipeline. With `transaction`, execution wraps the
    /// commands in `MULTI`/`EXEC`.
    pub fn pipeline(&self, transaction: bool) -> Pipeline {
        Pipeline::new(self.pool.clone(), self.protocol.clone(), transaction)
    }

    /// Disconnects the pinned connection and, when this client owns its
    /// pool's lifetime, the pool.
    pub async fn close(&mut self) -> RedisResult<()> {
        if let Some(mut conn) = self.connection.take() {
            conn.disconnect().await;
        }
        if self.auto_close_connection_pool {
            self.pool.disconnect(true).await?;
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Best effort: shut the pool down in the background when this client
        // owned its lifetime and was dropped without an explicit close.
        if self.auto_close_connection_pool {
            let pool = self.pool.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = pool.disconnect(true).await;
                });
            }
        }
    }
}

/// A buffered command list executed in one round-trip, with optimistic
/// locking via `WATCH`.
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
    pub async fn watch<I, K>(&mut self, keys: I) -> RedisResult<Value>
    where
        I: IntoIterator<Item = K>,
        K: Into<Encodable>,
    {
        if self.explicit_transaction {
            fail!((ErrorKind::ClientError, "Cannot issue a WATCH after a MULTI"));
        }
        if self.connection.is_none() {
            self.connection = Some(self.pool.acquire().await?);
        }
        let conn = self.connection.as_mut().expect("pinned above");
        let reply = conn.execute_command(commands::watch(keys)).await?;
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
    pub async fn unwatch(&mut self) -> RedisResult<Value> {
        let reply = match &mut self.connection {
            Some(conn) => conn.execute_command(commands::unwatch()).await?,
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
    pub async fn execute(&mut self) -> RedisResult<Vec<Value>> {
        self.execute_with(true).await
    }

    /// Packs and sends the stack. Without `raise_on_error`, per-command
    /// errors come back in the reply array instead.
    pub async fn execute_with(&mut self, raise_on_error: bool) -> RedisResult<Vec<Value>> {
        let mut stack = std::mem::take(&mut self.stack);
        self.stack = PipelinedCommands::new(self.base_transaction, true);
        if stack.is_empty() {
            self.finish().await;
            return Ok(Vec::new());
        }
        stack.transaction = self.base_transaction || self.explicit_transaction;
        stack.raise_on_error = raise_on_error;
        // Only bound to an explicit connection when WATCH was issued.
        let result = match &mut self.connection {
            Some(conn) => conn.execute_pipeline(stack).await,
            None => self.pool.execute_pipeline(stack).await,
        };
        self.finish().await;
        result
    }

    /// Drops the buffered commands and releases the pinned connection.
    pub async fn reset(&mut self) {
        self.stack = PipelinedCommands::new(self.base_transaction, true);
        self.finish().await;
    }

    /// Releases the pinned connection, clearing any watch left on it first.
    /// A lost connection has nothing to unwatch.
    async fn finish(&mut self) {
        self.explicit_transaction = false;
        if let Some(mut conn) = self.connection.take() {
            if self.watching {
                if let Err(err) = conn.execute_command(commands::unwatch()).await {
                    if !err.is_connection_dropped() && err.kind() != ErrorKind::Connection {
                        debug!(error = %err, "UNWATCH on pipeline release failed");
                    }
                }
            }
            self.pool.release(conn).await;
        }
        self.watching = false;
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // A pipeline dropped mid-watch still returns its pinned connection
        // to the pool, from a background task since drop cannot suspend.
        if let Some(conn) = self.connection.take() {
            let pool = self.pool.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    pool.release(conn).await;
                });
            }
        }
    }
}
