//! Command builders used by the core and its tests.
//!
//! These are free functions over the event model; the full command surface
//! of the server is out of scope here, but everything the handshake, the
//! health check, the pipeline machinery and everyday smoke testing need is
//! built the same way, so extending the set is mechanical.

use crate::callbacks;
use crate::events::{CallbackArgs, Command};
use crate::types::Encodable;

pub fn ping() -> Command {
    Command::new("PING").with_callback(callbacks::parse_pong)
}

pub fn info(section: Option<&'static str>) -> Command {
    let cmd = Command::new("INFO").with_callback(callbacks::parse_info);
    match section {
        Some(section) => cmd.arg(section),
        None => cmd,
    }
}

pub fn hello(
    resp: &'static str,
    auth: Option<(String, String)>,
    client_name: Option<String>,
) -> Command {
    let mut cmd = Command::new("HELLO").arg(resp);
    if let Some((username, password)) = auth {
        cmd = cmd.arg("AUTH").arg(username).arg(password);
    }
    if let Some(name) = client_name {
        cmd = cmd.arg("SETNAME").arg(name);
    }
    cmd
}

pub fn auth(username: Option<String>, password: String) -> Command {
    let cmd = Command::new("AUTH");
    match username {
        Some(username) => cmd.arg(username).arg(password),
        None => cmd.arg(password),
    }
}

pub fn select(db: i64) -> Command {
    Command::new("SELECT").arg(db)
}

pub fn client_setname(name: String) -> Command {
    Command::new("CLIENT SETNAME").arg(name)
}

pub fn get(key: impl Into<Encodable>) -> Command {
    Command::new("GET").arg(key)
}

/// Optional behavior for [`set`].
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Expiry in seconds (`EX`).
    pub ex: Option<i64>,
    /// Expiry in milliseconds (`PX`).
    pub px: Option<i64>,
    /// Only set if the key does not exist (`NX`).
    pub nx: bool,
    /// Only set if the key exists (`XX`).
    pub xx: bool,
    /// Return the previous value (`GET`).
    pub get: bool,
}

pub fn set(key: impl Into<Encodable>, value: impl Into<Encodable>, options: SetOptions) -> Command {
    let mut cmd = Command::new("SET").arg(key).arg(value);
    if let Some(ex) = options.ex {
        cmd = cmd.arg("EX").arg(ex);
    }
    if let Some(px) = options.px {
        cmd = cmd.arg("PX").arg(px);
    }
    if options.nx {
        cmd = cmd.arg("NX");
    }
    if options.xx {
        cmd = cmd.arg("XX");
    }
    if options.get {
        cmd = cmd.arg("GET");
    }
    let mut args = CallbackArgs::new();
    args.set_flag("get", options.get);
    cmd.with_callback(callbacks::parse_set).with_callback_args(args)
}

pub fn setex(key: impl Into<Encodable>, seconds: i64, value: impl Into<Encodable>) -> Command {
    Command::new("SETEX").arg(key).arg(seconds).arg(value)
}

pub fn incr(key: impl Into<Encodable>) -> Command {
    Command::new("INCR").arg(key)
}

pub fn del<I, K>(keys: I) -> Command
where
    I: IntoIterator<Item = K>,
    K: Into<Encodable>,
{
    Command::new("DEL").args(keys)
}

pub fn flushdb() -> Command {
    Command::new("FLUSHDB")
}

pub fn watch<I, K>(keys: I) -> Command
where
    I: IntoIterator<Item = K>,
    K: Into<Encodable>,
{
    Command::new("WATCH").args(keys)
}

pub fn unwatch() -> Command {
    Command::new("UNWATCH")
}

pub fn multi() -> Command {
    Command::new("MULTI")
}

pub fn exec() -> Command {
    Command::new("EXEC")
}

pub fn discard() -> Command {
    Command::new("DISCARD")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Encodable;

    #[test]
    fn set_collects_modifiers_in_order() {
        let cmd = set(
            "k",
            1,
            SetOptions {
                ex: Some(600),
                nx: true,
                get: true,
                ..SetOptions::default()
            },
        );
        let rendered: Vec<String> = cmd
            .modifiers
            .iter()
            .map(|m| match m {
                Encodable::Str(s) => s.to_string(),
                Encodable::Int(i) => i.to_string(),
                other => format!("{other:?}"),
            })
            .collect();
        assert_eq!(rendered, ["k", "1", "EX", "600", "NX", "GET"]);
        assert!(cmd.callback_args.flag("get"));
        assert!(cmd.callback.is_some());
    }

    #[test]
    fn auth_handles_optional_username() {
        assert_eq!(auth(None, "pw".into()).modifiers.len(), 1);
        assert_eq!(auth(Some("user".into()), "pw".into()).modifiers.len(), 2);
    }
}
