//! Reply normalization callbacks.
//!
//! Callbacks reshape raw wire replies into the forms callers expect; the
//! registry below maps command verbs whose RESP2 reply shape needs
//! client-side normalization onto their default callback. The registry is
//! populated once at startup and never mutated afterwards.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::errors::{ErrorKind, RedisResult};
use crate::events::{CallbackArgs, ResponseCallback};
use crate::types::Value;

static RESP2_CALLBACKS: Lazy<HashMap<&'static str, ResponseCallback>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, ResponseCallback> = HashMap::new();
    table.insert("INFO", parse_info);
    table.insert("CLIENT LIST", parse_client_list);
    table.insert("CLIENT INFO", parse_client_info);
    table.insert("SCAN", parse_scan);
    table.insert("SSCAN", parse_scan);
    table.insert("ZSCAN", parse_scan);
    table.insert("HSCAN", parse_scan);
    table.insert("XPENDING", parse_xpending_summary);
    table
});

/// The default RESP2 callback for a verb, if one is registered.
pub fn resp2_default(verb: &str) -> Option<ResponseCallback> {
    RESP2_CALLBACKS
        .get(verb.to_ascii_uppercase().as_str())
        .copied()
}

fn shape_error(detail: &'static str) -> crate::errors::RedisError {
    (ErrorKind::InvalidResponse, detail).into()
}

fn text_of(value: &Value) -> RedisResult<String> {
    value
        .as_bytes()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .ok_or_else(|| shape_error("expected a string reply"))
}

fn scalar(text: &str) -> Value {
    match text.parse::<i64>() {
        Ok(int) => Value::Int(int),
        Err(_) => Value::SimpleString(text.to_string()),
    }
}

/// `PING` health check: case-insensitive `PONG` becomes `true`.
pub fn parse_pong(value: Value, _: &CallbackArgs) -> RedisResult<Value> {
    let ok = value
        .as_bytes()
        .map(|bytes| bytes.eq_ignore_ascii_case(b"PONG"))
        .unwrap_or(false);
    Ok(Value::Boolean(ok))
}

/// `SET`: plain invocations report success as a boolean (`nil` means a
/// conditional set did not happen); with the `GET` modifier the reply is the
/// previous value and is passed through, nil included.
pub fn parse_set(value: Value, args: &CallbackArgs) -> RedisResult<Value> {
    if args.flag("get") {
        return Ok(value);
    }
    Ok(match value {
        Value::Nil => Value::Boolean(false),
        Value::Okay => Value::Boolean(true),
        other => other,
    })
}

/// `INFO`: the bulk text becomes a map of `key` to scalar, section headers
/// dropped.
pub fn parse_info(value: Value, _: &CallbackArgs) -> RedisResult<Value> {
    let text = text_of(&value)?;
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once(':') {
            entries.push((Value::SimpleString(key.to_string()), scalar(val)));
        }
    }
    Ok(Value::Map(entries))
}

fn parse_client_line(line: &str) -> Value {
    let entries = line
        .split(' ')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, val)| (Value::SimpleString(key.to_string()), scalar(val)))
        .collect();
    Value::Map(entries)
}

/// `CLIENT LIST`: one map per connected client.
pub fn parse_client_list(value: Value, _: &CallbackArgs) -> RedisResult<Value> {
    let text = text_of(&value)?;
    Ok(Value::Array(
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_client_line)
            .collect(),
    ))
}

/// `CLIENT INFO`: a single `CLIENT LIST`-shaped line.
pub fn parse_client_info(value: Value, _: &CallbackArgs) -> RedisResult<Value> {
    let text = text_of(&value)?;
    Ok(parse_client_line(text.trim()))
}

/// `SCAN` family: the cursor comes back as a bulk string; normalize it to an
/// integer next to the page of results.
pub fn parse_scan(value: Value, _: &CallbackArgs) -> RedisResult<Value> {
    let Value::Array(mut items) = value else {
        return Err(shape_error("expected a two-element scan reply"));
    };
    if items.len() != 2 {
        return Err(shape_error("expected a two-element scan reply"));
    }
    let page = items.pop().expect("length checked above");
    let cursor = items.pop().expect("length checked above");
    let cursor = cursor
        .as_int()
        .ok_or_else(|| shape_error("scan cursor is not an integer"))?;
    Ok(Value::Array(vec![Value::Int(cursor), page]))
}

/// `XPENDING` summary form: `[count, min-id, max-id, consumers]` becomes a
/// map with per-consumer pending counts.
pub fn parse_xpending_summary(value: Value, _: &CallbackArgs) -> RedisResult<Value> {
    let Value::Array(items) = value else {
        return Err(shape_error("expected an xpending summary reply"));
    };
    if items.len() != 4 {
        return Err(shape_error("expected an xpending summary reply"));
    }
    let mut items = items.into_iter();
    let pending = items.next().expect("length checked above");
    let min = items.next().expect("length checked above");
    let max = items.next().expect("length checked above");
    let consumers = match items.next().expect("length checked above") {
        Value::Array(consumers) => {
            let mut parsed = Vec::with_capacity(consumers.len());
            for entry in consumers {
                let Value::Array(pair) = entry else {
                    return Err(shape_error("malformed xpending consumer entry"));
                };
                let mut pair = pair.into_iter();
                let (Some(name), Some(count)) = (pair.next(), pair.next()) else {
                    return Err(shape_error("malformed xpending consumer entry"));
                };
                parsed.push(Value::Map(vec![
                    (Value::SimpleString("name".into()), name),
                    (
                        Value::SimpleString("pending".into()),
                        Value::Int(count.as_int().unwrap_or(0)),
                    ),
                ]));
            }
            Value::Array(parsed)
        }
        Value::Nil => Value::Array(Vec::new()),
        _ => return Err(shape_error("malformed xpending consumer list")),
    };
    Ok(Value::Map(vec![
        (Value::SimpleString("pending".into()), pending),
        (Value::SimpleString("min".into()), min),
        (Value::SimpleString("max".into()), max),
        (Value::SimpleString("consumers".into()), consumers),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> CallbackArgs {
        CallbackArgs::new()
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        assert!(resp2_default("info").is_some());
        assert!(resp2_default("INFO").is_some());
        assert!(resp2_default("client list").is_some());
        assert!(resp2_default("GET").is_none());
    }

    #[test]
    fn pong_is_case_insensitive() {
        let reply = parse_pong(Value::SimpleString("PONG".into()), &args()).unwrap();
        assert_eq!(reply, Value::Boolean(true));
        let reply = parse_pong(Value::BulkString(b"pong".to_vec()), &args()).unwrap();
        assert_eq!(reply, Value::Boolean(true));
        let reply = parse_pong(Value::SimpleString("nope".into()), &args()).unwrap();
        assert_eq!(reply, Value::Boolean(false));
    }

    #[test]
    fn set_reads_the_get_flag() {
        let mut with_get = CallbackArgs::new();
        with_get.set_flag("get", true);
        // With GET the previous value passes through, nil included.
        assert_eq!(parse_set(Value::Nil, &with_get).unwrap(), Value::Nil);
        assert_eq!(
            parse_set(Value::BulkString(b"old".to_vec()), &with_get).unwrap(),
            Value::BulkString(b"old".to_vec())
        );
        // Without it the reply is a success flag.
        assert_eq!(parse_set(Value::Okay, &args()).unwrap(), Value::Boolean(true));
        assert_eq!(parse_set(Value::Nil, &args()).unwrap(), Value::Boolean(false));
    }

    #[test]
    fn info_parses_into_a_map() {
        let text = "# Server\r\nredis_version:7.2.4\r\nuptime_in_seconds:100\r\n\r\n";
        let reply = parse_info(Value::BulkString(text.into()), &args()).unwrap();
        let Value::Map(entries) = reply else {
            panic!("expected a map");
        };
        assert_eq!(
            entries[0],
            (
                Value::SimpleString("redis_version".into()),
                Value::SimpleString("7.2.4".into())
            )
        );
        assert_eq!(
            entries[1],
            (
                Value::SimpleString("uptime_in_seconds".into()),
                Value::Int(100)
            )
        );
    }

    #[test]
    fn client_list_parses_lines() {
        let text = "id=3 addr=127.0.0.1:60 name=worker\nid=4 addr=127.0.0.1:61 name=\n";
        let reply = parse_client_list(Value::BulkString(text.into()), &args()).unwrap();
        let Value::Array(clients) = reply else {
            panic!("expected an array");
        };
        assert_eq!(clients.len(), 2);
        let Value::Map(first) = &clients[0] else {
            panic!("expected a map");
        };
        assert_eq!(
            first[0],
            (Value::SimpleString("id".into()), Value::Int(3))
        );
    }

    #[test]
    fn scan_normalizes_the_cursor() {
        let reply = parse_scan(
            Value::Array(vec![
                Value::BulkString(b"17".to_vec()),
                Value::Array(vec![Value::BulkString(b"k1".to_vec())]),
            ]),
            &args(),
        )
        .unwrap();
        assert_eq!(
            reply,
            Value::Array(vec![
                Value::Int(17),
                Value::Array(vec![Value::BulkString(b"k1".to_vec())]),
            ])
        );
    }

    #[test]
    fn xpending_summary_becomes_a_map() {
        let reply = parse_xpending_summary(
            Value::Array(vec![
                Value::Int(2),
                Value::BulkString(b"1-0".to_vec()),
                Value::BulkString(b"2-0".to_vec()),
                Value::Array(vec![Value::Array(vec![
                    Value::BulkString(b"consumer-a".to_vec()),
                    Value::BulkString(b"2".to_vec()),
                ])]),
            ]),
            &args(),
        )
        .unwrap();
        let Value::Map(entries) = reply else {
            panic!("expected a map");
        };
        assert_eq!(entries[0].1, Value::Int(2));
    }
}
