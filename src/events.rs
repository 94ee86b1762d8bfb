//! The command/response event model.
//!
//! Commands and pipelines are plain data until they are packed into wire
//! bytes; parsed replies travel back as [`Response`] or
//! [`PipelinedResponses`] events. The types here carry no I/O.

use std::borrow::Cow;
use std::fmt;

use crate::errors::RedisResult;
use crate::types::{Encodable, Value};

/// A reply post-processing hook, run on the raw parsed value before it is
/// handed back to the caller.
///
/// Callbacks normalize server replies whose wire shape is awkward for
/// consumers (`INFO` text, `CLIENT LIST` lines, RESP2 flat maps, …). They
/// receive the arguments captured on the command at build time.
pub type ResponseCallback = fn(Value, &CallbackArgs) -> RedisResult<Value>;

/// A single argument value captured for a [`ResponseCallback`].
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackArg {
    Bool(bool),
    Int(i64),
    Str(String),
}

/// A small heterogeneous map of per-command callback arguments.
///
/// Keys are static names chosen by the command builder, e.g. the `get` flag
/// of `SET … GET`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallbackArgs {
    entries: Vec<(&'static str, CallbackArg)>,
}

impl CallbackArgs {
    pub fn new() -> CallbackArgs {
        CallbackArgs::default()
    }

    pub fn set_flag(&mut self, name: &'static str, value: bool) {
        self.entries.push((name, CallbackArg::Bool(value)));
    }

    pub fn set_int(&mut self, name: &'static str, value: i64) {
        self.entries.push((name, CallbackArg::Int(value)));
    }

    pub fn set_str(&mut self, name: &'static str, value: impl Into<String>) {
        self.entries.push((name, CallbackArg::Str(value.into())));
    }

    /// A boolean argument; absent names read as `false`.
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.get(name), Some(CallbackArg::Bool(true)))
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(CallbackArg::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(CallbackArg::Str(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    fn get(&self, name: &str) -> Option<&CallbackArg> {
        self.entries
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}

/// A command the client may send to the server.
///
/// The verb may contain spaces (`CLIENT SETNAME`); it is split into tokens
/// when packed. Immutable once handed to the operator.
#[derive(Debug, Clone)]
pub struct Command {
    /// The top-level verb.
    pub verb: Cow<'static, str>,
    /// Arguments and modifiers, in order.
    pub modifiers: Vec<Encodable>,
    /// An optional hook run on the raw reply.
    pub callback: Option<ResponseCallback>,
    /// Arguments captured for the callback.
    pub callback_args: CallbackArgs,
}

impl Command {
    pub fn new(verb: impl Into<Cow<'static, str>>) -> Command {
        Command {
            verb: verb.into(),
            modifiers: Vec::new(),
            callback: None,
            callback_args: CallbackArgs::new(),
        }
    }

    /// Appends a single argument.
    pub fn arg(mut self, arg: impl Into<Encodable>) -> Command {
        self.modifiers.push(arg.into());
        self
    }

    /// Appends a sequence of arguments.
    pub fn args<I, T>(mut self, args: I) -> Command
    where
        I: IntoIterator<Item = T>,
        T: Into<Encodable>,
    {
        self.modifiers.extend(args.into_iter().map(Into::into));
        self
    }

    /// Attaches a reply callback.
    pub fn with_callback(mut self, callback: ResponseCallback) -> Command {
        self.callback = Some(callback);
        self
    }

    /// Attaches callback arguments.
    pub fn with_callback_args(mut self, args: CallbackArgs) -> Command {
        self.callback_args = args;
        self
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.verb)
    }
}

/// A series of commands sent to the server in a single round-trip,
/// optionally wrapped in `MULTI`/`EXEC`.
#[derive(Debug, Clone, Default)]
pub struct PipelinedCommands {
    /// The commands, in send order. Append-only until packed.
    pub commands: Vec<Command>,
    /// Whether to run the commands under a single `MULTI`/`EXEC`.
    pub transaction: bool,
    /// Whether to raise received errors, or return them in the replies.
    pub raise_on_error: bool,
}

impl PipelinedCommands {
    pub fn new(transaction: bool, raise_on_error: bool) -> PipelinedCommands {
        PipelinedCommands {
            commands: Vec::new(),
            transaction,
            raise_on_error,
        }
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// The origin of a packed payload: a single command or a whole pipeline.
#[derive(Debug, Clone)]
pub enum CommandEvent {
    Single(Command),
    Pipeline(PipelinedCommands),
}

impl CommandEvent {
    /// A short name for logs and error messages.
    pub fn describe(&self) -> Cow<'_, str> {
        match self {
            CommandEvent::Single(cmd) => Cow::Borrowed(cmd.verb.as_ref()),
            CommandEvent::Pipeline(p) => Cow::Owned(format!("pipeline of {} commands", p.len())),
        }
    }
}

/// A command or pipeline encoded into wire bytes.
#[derive(Debug, Clone)]
pub struct PackedCommand {
    /// The originating un-encoded event.
    pub origin: CommandEvent,
    /// The RESP multi-bulk payload.
    pub payload: Vec<u8>,
    /// How many wire replies this payload will produce. One for a single
    /// command, `k` for a vanilla pipeline of `k` commands, `k + 2` for a
    /// transaction (the `MULTI` ack, `k` queued acks and the `EXEC` body).
    pub expected_replies: usize,
}

/// A normalized reply to a single command.
#[derive(Debug, Clone)]
pub struct Response {
    /// The originating command.
    pub origin: Command,
    /// The parsed reply, with the command's callback applied.
    pub reply: Value,
}

/// The normalized replies to a pipeline, in command order.
#[derive(Debug, Clone)]
pub struct PipelinedResponses {
    /// The originating pipeline.
    pub origin: PipelinedCommands,
    /// One entry per command; errors appear in-line unless the pipeline was
    /// built with `raise_on_error`.
    pub replies: Vec<Value>,
}

/// A reply event delivered to a per-command waiter.
#[derive(Debug, Clone)]
pub enum ReplyEvent {
    Response(Response),
    Pipelined(PipelinedResponses),
    /// The connection was closing when the command was submitted; nothing
    /// was sent. Callers decide whether this is an error.
    ConnectionClosed,
}
