use std::error;
use std::fmt;
use std::io;

/// Result type returned from all fallible operations in this crate.
pub type RedisResult<T> = Result<T, RedisError>;

/// The broad classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The server returned an error reply with no more specific class.
    ResponseError,
    /// A transaction was aborted (`EXECABORT`).
    ExecAbort,
    /// The server is loading its dataset (`LOADING`).
    BusyLoading,
    /// A script was not present in the script cache (`NOSCRIPT`).
    NoScript,
    /// A write was attempted against a read-only replica (`READONLY`).
    ReadOnly,
    /// The current user lacks permission for the command (`NOPERM`).
    NoPermission,
    /// A module failed to load or unload.
    Module,
    /// Authentication was required or rejected.
    Authentication,
    /// `AUTH` was called with the wrong number of arguments.
    AuthenticationWrongNumberOfArgs,
    /// The connection to the server was lost or refused.
    Connection,
    /// An operation exceeded its deadline.
    Timeout,
    /// The byte stream was not a valid RESP reply stream.
    InvalidResponse,
    /// The protocol state machine was driven incorrectly.
    Protocol,
    /// The caller supplied input that cannot be encoded or understood.
    Data,
    /// A watched key changed before `EXEC`.
    Watch,
    /// An error in pub/sub subscription handling.
    PubSub,
    /// An error acquiring or releasing a lock.
    Lock,
    /// A lock was extended or released while no longer owned.
    LockNotOwned,
    /// A child process deadlocked after `fork()`.
    ChildDeadlocked,
    /// One or more commands in a pipeline returned errors.
    PipelineResponse,
    /// The client API was misused.
    ClientError,
    /// An I/O error from the transport.
    Io,
}

impl ErrorKind {
    fn description(&self) -> &'static str {
        match self {
            ErrorKind::ResponseError => "response error",
            ErrorKind::ExecAbort => "transaction aborted",
            ErrorKind::BusyLoading => "server is loading the dataset in memory",
            ErrorKind::NoScript => "script not found in cache",
            ErrorKind::ReadOnly => "replica is read-only",
            ErrorKind::NoPermission => "permission denied",
            ErrorKind::Module => "module error",
            ErrorKind::Authentication => "authentication failed",
            ErrorKind::AuthenticationWrongNumberOfArgs => {
                "wrong number of arguments for 'auth' command"
            }
            ErrorKind::Connection => "connection error",
            ErrorKind::Timeout => "timed out",
            ErrorKind::InvalidResponse => "invalid response",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Data => "invalid input data",
            ErrorKind::Watch => "watch error",
            ErrorKind::PubSub => "pub/sub error",
            ErrorKind::Lock => "lock error",
            ErrorKind::LockNotOwned => "lock not owned",
            ErrorKind::ChildDeadlocked => "child process deadlocked",
            ErrorKind::PipelineResponse => "pipeline response error",
            ErrorKind::ClientError => "client error",
            ErrorKind::Io => "I/O error",
        }
    }
}

/// An error reply received from the server, as carried inside
/// [`Value::ServerError`](crate::Value::ServerError).
///
/// The reply keeps its original error code and message; classification into
/// an [`ErrorKind`] happens when the value is lifted into a [`RedisError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    code: String,
    message: String,
}

impl ServerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> ServerError {
        ServerError {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Splits a raw `-…` reply line into code and message.
    pub fn from_reply_line(line: &str) -> ServerError {
        match line.split_once(' ') {
            Some((code, message)) => ServerError::new(code, message),
            None => ServerError::new(line, ""),
        }
    }

    /// The leading error code, e.g. `ERR` or `NOAUTH`.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The message after the code.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Classifies the reply through the prefix-driven error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        classify_error(&self.code, &self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.message)
        }
    }
}

const MODULE_LOAD_ERROR: &str = "Error loading the extension. Please check the server logs.";
const NO_SUCH_MODULE_ERROR: &str = "Error unloading module: no such module with that name";
const MODULE_UNLOAD_NOT_POSSIBLE_ERROR: &str = "Error unloading module: operation not possible.";
const MODULE_EXPORTS_DATA_TYPES_ERROR: &str = "Error unloading module: the module exports one \
     or more module-side data types, can't unload";

/// Maps a server error code (and, for `ERR`, the message) onto an
/// [`ErrorKind`]. Unrecognized codes stay [`ErrorKind::ResponseError`].
pub fn classify_error(code: &str, message: &str) -> ErrorKind {
    match code {
        "EXECABORT" => ErrorKind::ExecAbort,
        "LOADING" => ErrorKind::BusyLoading,
        "NOSCRIPT" => ErrorKind::NoScript,
        "READONLY" => ErrorKind::ReadOnly,
        "NOAUTH" => ErrorKind::Authentication,
        "NOPERM" => ErrorKind::NoPermission,
        "ERR" => match message {
            "max number of clients reached" => ErrorKind::Connection,
            "invalid password" => ErrorKind::Authentication,
            "Client sent AUTH, but no password is set" => ErrorKind::Authentication,
            // some server versions report invalid command syntax in lowercase,
            // some in uppercase
            "wrong number of arguments for 'auth' command" => {
                ErrorKind::AuthenticationWrongNumberOfArgs
            }
            "wrong number of arguments for 'AUTH' command" => {
                ErrorKind::AuthenticationWrongNumberOfArgs
            }
            MODULE_LOAD_ERROR
            | NO_SUCH_MODULE_ERROR
            | MODULE_UNLOAD_NOT_POSSIBLE_ERROR
            | MODULE_EXPORTS_DATA_TYPES_ERROR => ErrorKind::Module,
            _ => ErrorKind::ResponseError,
        },
        _ => ErrorKind::ResponseError,
    }
}

enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    Pipeline {
        detail: String,
        errors: Vec<RedisError>,
    },
    Io(io::Error),
}

/// The error type used throughout the crate.
///
/// A `RedisError` carries an [`ErrorKind`] for programmatic matching, a
/// static description and an optional dynamic detail. Pipeline composites
/// additionally carry the per-command errors.
pub struct RedisError {
    repr: ErrorRepr,
}

impl RedisError {
    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::Pipeline { .. } => ErrorKind::PipelineResponse,
            ErrorRepr::Io(_) => ErrorKind::Io,
        }
    }

    /// The dynamic portion of the error message, if any.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, detail)
            | ErrorRepr::Pipeline { detail, .. } => Some(detail.as_str()),
            _ => None,
        }
    }

    /// The per-command errors of a pipeline composite; empty otherwise.
    pub fn pipeline_errors(&self) -> &[RedisError] {
        match &self.repr {
            ErrorRepr::Pipeline { errors, .. } => errors,
            _ => &[],
        }
    }

    /// Builds a composite error out of annotated per-command errors.
    pub fn pipeline(errors: Vec<RedisError>) -> RedisError {
        RedisError {
            repr: ErrorRepr::Pipeline {
                detail: format!("Got {} errors in pipeline.", errors.len()),
                errors,
            },
        }
    }

    /// Whether this error was caused by an elapsed deadline.
    pub fn is_timeout(&self) -> bool {
        match &self.repr {
            ErrorRepr::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => self.kind() == ErrorKind::Timeout,
        }
    }

    /// Whether this error indicates the connection to the server is gone.
    pub fn is_connection_dropped(&self) -> bool {
        match &self.repr {
            ErrorRepr::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => self.kind() == ErrorKind::Connection,
        }
    }

    /// Returns a clone of this error. `io::Error` sources are flattened into
    /// their message, everything else is preserved verbatim.
    pub fn clone_mostly(&self) -> RedisError {
        let repr = match &self.repr {
            ErrorRepr::WithDescription(kind, desc) => ErrorRepr::WithDescription(*kind, desc),
            ErrorRepr::WithDescriptionAndDetail(kind, desc, detail) => {
                ErrorRepr::WithDescriptionAndDetail(*kind, desc, detail.clone())
            }
            ErrorRepr::Pipeline { detail, errors } => ErrorRepr::Pipeline {
                detail: detail.clone(),
                errors: errors.iter().map(RedisError::clone_mostly).collect(),
            },
            ErrorRepr::Io(err) => ErrorRepr::Io(io::Error::new(err.kind(), err.to_string())),
        };
        RedisError { repr }
    }
}

impl fmt::Debug for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for RedisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                write!(f, "{desc} ({:?})", kind)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, detail) => {
                write!(f, "{desc} ({kind:?}): {detail}")
            }
            ErrorRepr::Pipeline { detail, errors } => {
                write!(f, "{detail}")?;
                for err in errors {
                    write!(f, " {err}")?;
                }
                Ok(())
            }
            ErrorRepr::Io(err) => err.fmt(f),
        }
    }
}

impl error::Error for RedisError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for RedisError {
    fn from(err: io::Error) -> RedisError {
        RedisError {
            repr: ErrorRepr::Io(err),
        }
    }
}

impl From<(ErrorKind, &'static str)> for RedisError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for RedisError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> RedisError {
        RedisError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

impl From<ServerError> for RedisError {
    fn from(err: ServerError) -> RedisError {
        let kind = err.kind();
        RedisError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                kind,
                "server returned an error",
                err.message().to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_prefixed_codes() {
        assert_eq!(
            classify_error("NOAUTH", "Authentication required."),
            ErrorKind::Authentication
        );
        assert_eq!(classify_error("EXECABORT", "whatever"), ErrorKind::ExecAbort);
        assert_eq!(classify_error("LOADING", ""), ErrorKind::BusyLoading);
        assert_eq!(classify_error("NOSCRIPT", ""), ErrorKind::NoScript);
        assert_eq!(classify_error("READONLY", ""), ErrorKind::ReadOnly);
        assert_eq!(classify_error("NOPERM", ""), ErrorKind::NoPermission);
    }

    #[test]
    fn classifies_err_submessages() {
        assert_eq!(
            classify_error("ERR", "max number of clients reached"),
            ErrorKind::Connection
        );
        assert_eq!(
            classify_error("ERR", "invalid password"),
            ErrorKind::Authentication
        );
        assert_eq!(
            classify_error("ERR", "wrong number of arguments for 'auth' command"),
            ErrorKind::AuthenticationWrongNumberOfArgs
        );
        assert_eq!(
            classify_error("ERR", "wrong number of arguments for 'AUTH' command"),
            ErrorKind::AuthenticationWrongNumberOfArgs
        );
        assert_eq!(classify_error("ERR", MODULE_LOAD_ERROR), ErrorKind::Module);
        assert_eq!(
            classify_error("ERR", "unknown command 'BADCMD'"),
            ErrorKind::ResponseError
        );
        assert_eq!(classify_error("WRONGTYPE", "…"), ErrorKind::ResponseError);
    }

    #[test]
    fn server_error_round_trip() {
        let err = ServerError::from_reply_line("NOAUTH Authentication required.");
        assert_eq!(err.code(), "NOAUTH");
        assert_eq!(err.message(), "Authentication required.");
        let redis_err: RedisError = err.into();
        assert_eq!(redis_err.kind(), ErrorKind::Authentication);
        assert_eq!(redis_err.detail(), Some("Authentication required."));
    }

    #[test]
    fn io_timeouts_are_timeouts() {
        let err: RedisError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(err.is_timeout());
        let err: RedisError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(err.is_connection_dropped());
    }

    #[test]
    fn pipeline_composite_keeps_errors() {
        let composite = RedisError::pipeline(vec![
            (ErrorKind::ResponseError, "server returned an error", "a".to_string()).into(),
            (ErrorKind::ReadOnly, "server returned an error", "b".to_string()).into(),
        ]);
        assert_eq!(composite.kind(), ErrorKind::PipelineResponse);
        assert_eq!(composite.pipeline_errors().len(), 2);
        assert_eq!(composite.detail(), Some("Got 2 errors in pipeline."));
    }
}
