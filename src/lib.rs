//! redis-sansio is a Redis client core built around a sans-I/O protocol
//! engine: the RESP2/RESP3 codec, the command/response event model and the
//! reply normalization logic are pure state machines over byte buffers,
//! shared by two drivers — a multi-threaded blocking one ([`sio`]) and a
//! cooperative tokio one ([`aio`]) — each with a bounded connection pool.
//!
//! # Basic operation
//!
//! Commands are plain data built by the free functions in [`commands`] (or
//! directly via [`Command`]), executed through a client:
//!
//! ```rust,no_run
//! use redis_sansio::{commands, sio::Client};
//!
//! # fn run() -> redis_sansio::RedisResult<()> {
//! let mut client = Client::open("redis://127.0.0.1/")?;
//! client.execute_command(commands::set("answer", 42, Default::default()))?;
//! let value = client.execute_command(commands::get("answer"))?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```
//!
//! The tokio variant mirrors the same surface:
//!
//! ```rust,no_run
//! use redis_sansio::{commands, aio::Client};
//!
//! # async fn run() -> redis_sansio::RedisResult<()> {
//! let mut client = Client::open("redis://127.0.0.1/")?;
//! let value = client.execute_command(commands::get("answer")).await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```
//!
//! # Pipelines and transactions
//!
//! A pipeline buffers commands and sends them in one round-trip; with a
//! transaction the commands run under `MULTI`/`EXEC`, optionally guarded by
//! `WATCH` on a pinned connection:
//!
//! ```rust,no_run
//! use redis_sansio::{commands, sio::Client};
//!
//! # fn run() -> redis_sansio::RedisResult<()> {
//! # let client = Client::open("redis://127.0.0.1/")?;
//! let mut pipe = client.pipeline(true);
//! pipe.watch(["balance"])?;
//! pipe.multi()?;
//! pipe.command(commands::incr("balance"))?;
//! pipe.command(commands::incr("balance"))?;
//! let replies = pipe.execute()?;
//! # let _ = replies;
//! # Ok(())
//! # }
//! ```
//!
//! # Protocol support
//!
//! Outbound frames are always RESP multi-bulk. Inbound parsing covers RESP2
//! and the RESP3 additions (doubles, booleans, maps, sets, verbatim
//! strings, big numbers, push frames). The handshake speaks `HELLO` to
//! servers at 6.0 and newer and falls back to `AUTH`/`CLIENT SETNAME`/
//! `SELECT` — and RESP2 — below that.

#![deny(unsafe_code)]

#[macro_use]
mod macros;

pub mod aio;
pub mod callbacks;
pub mod commands;
mod errors;
pub mod events;
mod operator;
pub mod parser;
mod protocol;
pub mod sio;
mod types;
mod writer;

pub use crate::errors::{classify_error, ErrorKind, RedisError, RedisResult, ServerError};
pub use crate::events::{
    CallbackArgs, Command, CommandEvent, PackedCommand, PipelinedCommands, PipelinedResponses,
    ReplyEvent, Response, ResponseCallback,
};
pub use crate::operator::Operator;
pub use crate::parser::{BytesReader, Parsed, ReplyEncoding, ValueCodec};
pub use crate::protocol::{
    AddressInfo, CertificateRequirements, ClientInfo, KeepaliveOptions, PoolInfo, RedisConfig,
    RedisProtocol, ServerVersion, SocketInfo, SslInfo,
};
pub use crate::types::{Encodable, PushKind, RespVersion, Value, VerbatimFormat};
pub use crate::writer::Writer;
