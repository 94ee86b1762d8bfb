use std::borrow::Cow;
use std::fmt;

use crate::errors::{ErrorKind, RedisResult, ServerError};

/// A value that can be written into a command frame.
///
/// Redis only understands byte strings on the wire; numbers are sent in their
/// canonical text form. Anything the caller wants to send must first be
/// converted into one of these shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum Encodable {
    /// Raw bytes, written as-is.
    Bytes(Vec<u8>),
    /// A UTF-8 string, written as its bytes.
    Str(Cow<'static, str>),
    /// A signed integer, written in decimal text form.
    Int(i64),
    /// A float, written in its shortest round-trippable text form.
    Float(f64),
}

impl From<&'static str> for Encodable {
    fn from(value: &'static str) -> Self {
        Encodable::Str(Cow::Borrowed(value))
    }
}

impl From<String> for Encodable {
    fn from(value: String) -> Self {
        Encodable::Str(Cow::Owned(value))
    }
}

impl From<Vec<u8>> for Encodable {
    fn from(value: Vec<u8>) -> Self {
        Encodable::Bytes(value)
    }
}

impl From<&[u8]> for Encodable {
    fn from(value: &[u8]) -> Self {
        Encodable::Bytes(value.to_vec())
    }
}

impl From<i64> for Encodable {
    fn from(value: i64) -> Self {
        Encodable::Int(value)
    }
}

impl From<i32> for Encodable {
    fn from(value: i32) -> Self {
        Encodable::Int(value as i64)
    }
}

impl From<u32> for Encodable {
    fn from(value: u32) -> Self {
        Encodable::Int(value as i64)
    }
}

impl From<usize> for Encodable {
    fn from(value: usize) -> Self {
        Encodable::Int(value as i64)
    }
}

impl From<u64> for Encodable {
    fn from(value: u64) -> Self {
        Encodable::Int(value as i64)
    }
}

impl From<f64> for Encodable {
    fn from(value: f64) -> Self {
        Encodable::Float(value)
    }
}

/// The format of a RESP3 verbatim string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerbatimFormat {
    /// Plain text (`txt`).
    Text,
    /// Markdown (`mkd`).
    Markdown,
    /// A format this client does not know about.
    Unknown(String),
}

impl VerbatimFormat {
    pub(crate) fn from_prefix(prefix: &str) -> VerbatimFormat {
        match prefix {
            "txt" => VerbatimFormat::Text,
            "mkd" => VerbatimFormat::Markdown,
            other => VerbatimFormat::Unknown(other.to_string()),
        }
    }
}

/// The kind of a RESP3 push frame, taken from its first element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushKind {
    Message,
    PMessage,
    SMessage,
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    SSubscribe,
    SUnsubscribe,
    /// Server-side invalidation notifications (client-side caching).
    Invalidate,
    Other(String),
}

impl PushKind {
    pub(crate) fn from_kind_bytes(kind: &[u8]) -> PushKind {
        match kind {
            b"message" => PushKind::Message,
            b"pmessage" => PushKind::PMessage,
            b"smessage" => PushKind::SMessage,
            b"subscribe" => PushKind::Subscribe,
            b"unsubscribe" => PushKind::Unsubscribe,
            b"psubscribe" => PushKind::PSubscribe,
            b"punsubscribe" => PushKind::PUnsubscribe,
            b"ssubscribe" => PushKind::SSubscribe,
            b"sunsubscribe" => PushKind::SUnsubscribe,
            b"invalidate" => PushKind::Invalidate,
            other => PushKind::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }
}

/// A single parsed reply from the server.
///
/// Covers both RESP2 and the RESP3 additions. Server error replies (`-ERR …`)
/// are carried as [`Value::ServerError`] so that the parser never has to
/// abort the stream for an application-level error.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A `$-1`/`*-1`/`_` nil reply.
    Nil,
    /// A `:` integer reply.
    Int(i64),
    /// A `$` bulk string reply.
    BulkString(Vec<u8>),
    /// A `*` array reply. May be nested and may contain nils.
    Array(Vec<Value>),
    /// A `+` simple string reply, or a decoded bulk string.
    SimpleString(String),
    /// A `+OK` reply, the canonical status.
    Okay,
    /// A `%` RESP3 map reply, in insertion order.
    Map(Vec<(Value, Value)>),
    /// A `~` RESP3 set reply, in wire order.
    Set(Vec<Value>),
    /// A `,` RESP3 double reply.
    Double(f64),
    /// A `#` RESP3 boolean reply.
    Boolean(bool),
    /// An `=` RESP3 verbatim string reply.
    VerbatimString {
        format: VerbatimFormat,
        text: String,
    },
    /// A `(` RESP3 big number reply, kept as its text form.
    BigNumber(String),
    /// A `>` RESP3 out-of-band push frame.
    Push { kind: PushKind, data: Vec<Value> },
    /// A `-` error reply, returned in-band rather than raised.
    ServerError(ServerError),
}

impl Value {
    /// Whether this value is a server error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Value::ServerError(_))
    }

    /// Lifts a server error out of the value, classifying it through the
    /// error taxonomy. Non-error values pass through.
    pub fn extract_error(self) -> RedisResult<Value> {
        match self {
            Value::ServerError(err) => Err(err.into()),
            other => Ok(other),
        }
    }

    /// The bytes of a bulk or simple string, if this value is one.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::BulkString(bytes) => Some(bytes),
            Value::SimpleString(s) => Some(s.as_bytes()),
            Value::VerbatimString { text, .. } => Some(text.as_bytes()),
            Value::Okay => Some(b"OK"),
            _ => None,
        }
    }

    /// The value as UTF-8 text, if it is string-shaped and valid UTF-8.
    pub fn as_str(&self) -> Option<Cow<'_, str>> {
        match self {
            Value::BulkString(bytes) => std::str::from_utf8(bytes).ok().map(Cow::Borrowed),
            Value::SimpleString(s) => Some(Cow::Borrowed(s.as_str())),
            Value::VerbatimString { text, .. } => Some(Cow::Borrowed(text.as_str())),
            Value::Okay => Some(Cow::Borrowed("OK")),
            Value::Int(i) => Some(Cow::Owned(i.to_string())),
            _ => None,
        }
    }

    /// The value as an integer, if it is one or parses as one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::BulkString(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
            Value::SimpleString(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "(nil)"),
            Value::Int(i) => write!(f, "{i}"),
            Value::BulkString(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            Value::SimpleString(s) => write!(f, "{s}"),
            Value::Okay => write!(f, "OK"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::BigNumber(n) => write!(f, "{n}"),
            Value::VerbatimString { text, .. } => write!(f, "{text}"),
            Value::Array(items) | Value::Set(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Push { kind, data } => {
                write!(f, "push({kind:?}, {})", Value::Array(data.clone()))
            }
            Value::ServerError(err) => write!(f, "{err}"),
        }
    }
}

/// The RESP protocol revision spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespVersion {
    Resp2,
    Resp3,
}

impl RespVersion {
    /// The argument form used by `HELLO`.
    pub fn as_arg(&self) -> &'static str {
        match self {
            RespVersion::Resp2 => "2",
            RespVersion::Resp3 => "3",
        }
    }

    /// Parses the `"2"` / `"3"` configuration form.
    pub fn parse(value: &str) -> RedisResult<RespVersion> {
        match value {
            "2" => Ok(RespVersion::Resp2),
            "3" => Ok(RespVersion::Resp3),
            other => Err((
                ErrorKind::Data,
                "Invalid RESP version",
                format!("expected \"2\" or \"3\", got {other:?}"),
            )
                .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_error_classifies_server_errors() {
        let err = Value::ServerError(ServerError::new("NOAUTH", "Authentication required."))
            .extract_error()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(Value::Okay.extract_error().unwrap(), Value::Okay);
    }

    #[test]
    fn value_accessors() {
        assert_eq!(Value::Int(12).as_int(), Some(12));
        assert_eq!(Value::BulkString(b"12".to_vec()).as_int(), Some(12));
        assert_eq!(
            Value::BulkString(b"hello".to_vec()).as_str().as_deref(),
            Some("hello")
        );
        assert_eq!(Value::Okay.as_bytes(), Some(&b"OK"[..]));
        assert!(Value::Nil.as_bytes().is_none());
    }
}
