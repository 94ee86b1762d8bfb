//! The cooperative single-threaded driver: tokio sockets, a task-owned
//! framed transport per connection, and a suspend-on-acquire pool.

mod client;
mod connection;
mod pool;

pub use client::{Client, Pipeline};
pub use connection::{AsyncStream, Connection, ReplyReceiver};
pub use pool::ConnectionPool;
