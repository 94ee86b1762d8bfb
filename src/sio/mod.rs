//! The multi-threaded blocking driver: OS sockets, an OS mutex and condition
//! variable around the pool.

mod client;
mod connection;
mod pool;

pub use client::{Client, Pipeline};
pub use connection::Connection;
pub use pool::{ConnectionPool, PoolConnection};

pub(crate) use connection::{
    lost_connection_error, next_connection_id, unpaired_reply_error, wrap_handshake_error,
};
