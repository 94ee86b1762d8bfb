//! Incremental RESP2/RESP3 reply parsing.
//!
//! The parser consumes a byte stream fed in arbitrary chunks and yields one
//! complete [`Value`] at a time. Replies split across chunk boundaries are
//! handled by returning [`Parsed::NeedMore`] without consuming anything, so
//! feeding the same frame in any partition of its bytes yields the same
//! values. Server error replies come back in-band as
//! [`Value::ServerError`]; only protocol-framing violations are raised.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{ErrorKind, RedisResult, ServerError};
use crate::types::{PushKind, Value, VerbatimFormat};

/// How decoding failures are handled when an encoding is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodingErrors {
    /// Raise on invalid bytes.
    #[default]
    Strict,
    /// Substitute the replacement character.
    Replace,
    /// Drop invalid bytes.
    Ignore,
}

/// Reply decoding configuration. Only UTF-8 is supported; requesting any
/// other codec is rejected up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyEncoding {
    errors: EncodingErrors,
}

impl ReplyEncoding {
    pub fn new(encoding: &str, errors: Option<&str>) -> RedisResult<ReplyEncoding> {
        if !matches!(
            encoding.to_ascii_lowercase().as_str(),
            "utf-8" | "utf8" | "utf_8"
        ) {
            fail!((
                ErrorKind::Data,
                "Unsupported encoding",
                format!("only UTF-8 is supported, got {encoding:?}"),
            ));
        }
        let errors = match errors.unwrap_or("strict") {
            "strict" => EncodingErrors::Strict,
            "replace" => EncodingErrors::Replace,
            "ignore" => EncodingErrors::Ignore,
            other => fail!((
                ErrorKind::Data,
                "Unsupported encoding error handler",
                format!("expected strict/replace/ignore, got {other:?}"),
            )),
        };
        Ok(ReplyEncoding { errors })
    }
}

/// The outcome of one parse attempt. `NeedMore` means the buffer holds a
/// strict prefix of a frame; it is never confused with a parsed nil.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    NeedMore,
    Value(Value),
}

/// An incremental reply reader over an internal buffer.
#[derive(Debug, Default)]
pub struct BytesReader {
    buf: BytesMut,
    encoding: Option<ReplyEncoding>,
}

impl BytesReader {
    pub fn new() -> BytesReader {
        BytesReader::default()
    }

    pub fn with_encoding(encoding: Option<ReplyEncoding>) -> BytesReader {
        BytesReader {
            buf: BytesMut::new(),
            encoding,
        }
    }

    /// Appends received bytes to the parse buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Tries to produce one complete value from the buffered bytes.
    pub fn gets(&mut self) -> RedisResult<Parsed> {
        match parse_value(&self.buf, self.encoding.as_ref())? {
            None => Ok(Parsed::NeedMore),
            Some((value, consumed)) => {
                self.buf.advance(consumed);
                Ok(Parsed::Value(value))
            }
        }
    }

    /// Whether unparsed bytes remain in the buffer.
    pub fn has_data(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Reconfigures reply decoding. `None` leaves replies as raw bytes.
    pub fn set_encoding(
        &mut self,
        encoding: Option<&str>,
        errors: Option<&str>,
    ) -> RedisResult<()> {
        self.encoding = match encoding {
            Some(name) => Some(ReplyEncoding::new(name, errors)?),
            None => None,
        };
        Ok(())
    }
}

/// A `tokio_util` codec over the same parser, used to frame async
/// connections. Outbound items are pre-packed payloads written verbatim.
#[derive(Debug, Clone, Default)]
pub struct ValueCodec {
    encoding: Option<ReplyEncoding>,
}

impl ValueCodec {
    pub fn new(encoding: Option<ReplyEncoding>) -> ValueCodec {
        ValueCodec { encoding }
    }
}

impl Decoder for ValueCodec {
    type Item = Value;
    type Error = crate::errors::RedisError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, Self::Error> {
        match parse_value(src, self.encoding.as_ref())? {
            None => Ok(None),
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
        }
    }
}

impl Encoder<Vec<u8>> for ValueCodec {
    type Error = crate::errors::RedisError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

fn invalid(detail: &'static str) -> crate::errors::RedisError {
    (ErrorKind::InvalidResponse, detail).into()
}

fn read_line(input: &[u8]) -> Option<(&[u8], usize)> {
    let pos = input.windows(2).position(|w| w == b"\r\n")?;
    Some((&input[..pos], pos + 2))
}

fn parse_int(bytes: &[u8]) -> RedisResult<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid("expected an integer line"))
}

fn decode_text(bytes: &[u8], errors: EncodingErrors) -> RedisResult<String> {
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => match errors {
            EncodingErrors::Strict => Err(invalid("reply is not valid UTF-8")),
            EncodingErrors::Replace => Ok(String::from_utf8_lossy(bytes).into_owned()),
            EncodingErrors::Ignore => Ok(String::from_utf8_lossy(bytes)
                .chars()
                .filter(|c| *c != char::REPLACEMENT_CHARACTER)
                .collect()),
        },
    }
}

fn decode_bulk(body: &[u8], encoding: Option<&ReplyEncoding>) -> RedisResult<Value> {
    match encoding {
        Some(enc) => Ok(Value::SimpleString(decode_text(body, enc.errors)?)),
        None => Ok(Value::BulkString(body.to_vec())),
    }
}

/// Parses one value from the front of `input`.
///
/// Returns `None` when `input` holds only a strict prefix of a frame, and
/// `Some((value, consumed_bytes))` once a frame is complete. Nothing in
/// `input` is mutated either way.
fn parse_value(
    input: &[u8],
    encoding: Option<&ReplyEncoding>,
) -> RedisResult<Option<(Value, usize)>> {
    let Some((line, consumed)) = read_line(input) else {
        return Ok(None);
    };
    if line.is_empty() {
        fail!(invalid("empty reply line"));
    }
    let (marker, rest) = (line[0], &line[1..]);
    match marker {
        b'+' => {
            let value = if rest == b"OK" {
                Value::Okay
            } else {
                Value::SimpleString(String::from_utf8_lossy(rest).into_owned())
            };
            Ok(Some((value, consumed)))
        }
        b'-' => {
            let line = String::from_utf8_lossy(rest);
            Ok(Some((
                Value::ServerError(ServerError::from_reply_line(&line)),
                consumed,
            )))
        }
        b':' => Ok(Some((Value::Int(parse_int(rest)?), consumed))),
        b'$' => parse_blob(input, consumed, rest, encoding, |body, encoding| {
            decode_bulk(body, encoding)
        }),
        b'=' => parse_blob(input, consumed, rest, encoding, |body, _| {
            if body.len() < 4 || body[3] != b':' {
                fail!(invalid("verbatim string is missing its format prefix"));
            }
            let format = VerbatimFormat::from_prefix(&String::from_utf8_lossy(&body[..3]));
            Ok(Value::VerbatimString {
                format,
                text: String::from_utf8_lossy(&body[4..]).into_owned(),
            })
        }),
        b'*' => {
            let len = parse_int(rest)?;
            if len == -1 {
                return Ok(Some((Value::Nil, consumed)));
            }
            match parse_elements(input, consumed, len, encoding)? {
                None => Ok(None),
                Some((items, used)) => Ok(Some((Value::Array(items), used))),
            }
        }
        b'~' => match parse_elements(input, consumed, parse_int(rest)?, encoding)? {
            None => Ok(None),
            Some((items, used)) => Ok(Some((Value::Set(items), used))),
        },
        b'%' => {
            let pairs = parse_int(rest)?;
            if pairs < 0 {
                fail!(invalid("negative map length"));
            }
            match parse_elements(input, consumed, pairs * 2, encoding)? {
                None => Ok(None),
                Some((items, used)) => {
                    let mut entries = Vec::with_capacity(pairs as usize);
                    let mut iter = items.into_iter();
                    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
                        entries.push((key, value));
                    }
                    Ok(Some((Value::Map(entries), used)))
                }
            }
        }
        b'>' => match parse_elements(input, consumed, parse_int(rest)?, encoding)? {
            None => Ok(None),
            Some((mut items, used)) => {
                if items.is_empty() {
                    fail!(invalid("push frame without a kind"));
                }
                let kind = match items.remove(0).as_bytes() {
                    Some(bytes) => PushKind::from_kind_bytes(bytes),
                    None => fail!(invalid("push frame kind is not a string")),
                };
                Ok(Some((Value::Push { kind, data: items }, used)))
            }
        },
        b',' => {
            let text = std::str::from_utf8(rest).map_err(|_| invalid("invalid double line"))?;
            let value: f64 = text.parse().map_err(|_| invalid("invalid double line"))?;
            Ok(Some((Value::Double(value), consumed)))
        }
        b'#' => match rest {
            b"t" => Ok(Some((Value::Boolean(true), consumed))),
            b"f" => Ok(Some((Value::Boolean(false), consumed))),
            _ => Err(invalid("invalid boolean line")),
        },
        b'_' => Ok(Some((Value::Nil, consumed))),
        b'(' => {
            let text = std::str::from_utf8(rest).map_err(|_| invalid("invalid big number"))?;
            let digits = text.strip_prefix('-').unwrap_or(text);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                fail!(invalid("invalid big number"));
            }
            Ok(Some((Value::BigNumber(text.to_string()), consumed)))
        }
        _ => Err(invalid("invalid reply type marker")),
    }
}

/// Parses a `$`-style length-prefixed blob ending in CRLF.
fn parse_blob(
    input: &[u8],
    consumed: usize,
    len_line: &[u8],
    encoding: Option<&ReplyEncoding>,
    finish: impl FnOnce(&[u8], Option<&ReplyEncoding>) -> RedisResult<Value>,
) -> RedisResult<Option<(Value, usize)>> {
    let len = parse_int(len_line)?;
    if len == -1 {
        return Ok(Some((Value::Nil, consumed)));
    }
    if len < -1 {
        fail!(invalid("negative bulk string length"));
    }
    let len = len as usize;
    let total = consumed + len + 2;
    if input.len() < total {
        return Ok(None);
    }
    if &input[consumed + len..total] != b"\r\n" {
        fail!(invalid("bulk string is not terminated by CRLF"));
    }
    let value = finish(&input[consumed..consumed + len], encoding)?;
    Ok(Some((value, total)))
}

fn parse_elements(
    input: &[u8],
    consumed: usize,
    count: i64,
    encoding: Option<&ReplyEncoding>,
) -> RedisResult<Option<(Vec<Value>, usize)>> {
    if count < 0 {
        fail!(invalid("negative aggregate length"));
    }
    let mut items = Vec::with_capacity(count.min(4096) as usize);
    let mut offset = consumed;
    for _ in 0..count {
        match parse_value(&input[offset..], encoding)? {
            None => return Ok(None),
            Some((value, used)) => {
                items.push(value);
                offset += used;
            }
        }
    }
    Ok(Some((items, offset)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(reader: &mut BytesReader) -> Vec<Value> {
        let mut values = Vec::new();
        while let Parsed::Value(v) = reader.gets().unwrap() {
            values.push(v);
        }
        values
    }

    #[test]
    fn parses_scalars() {
        let mut reader = BytesReader::new();
        reader.feed(b"+OK\r\n+PONG\r\n:42\r\n$5\r\nhello\r\n$-1\r\n");
        assert_eq!(
            parse_all(&mut reader),
            vec![
                Value::Okay,
                Value::SimpleString("PONG".into()),
                Value::Int(42),
                Value::BulkString(b"hello".to_vec()),
                Value::Nil,
            ]
        );
        assert!(!reader.has_data());
    }

    #[test]
    fn parses_resp3_types() {
        let mut reader = BytesReader::new();
        reader.feed(b",3.25\r\n#t\r\n#f\r\n_\r\n(3492890328409238509324850943850943825024385\r\n");
        reader.feed(b"=9\r\ntxt:hello\r\n%2\r\n$1\r\na\r\n:1\r\n$1\r\nb\r\n:2\r\n~2\r\n:1\r\n:2\r\n");
        let values = parse_all(&mut reader);
        assert_eq!(values[0], Value::Double(3.25));
        assert_eq!(values[1], Value::Boolean(true));
        assert_eq!(values[2], Value::Boolean(false));
        assert_eq!(values[3], Value::Nil);
        assert_eq!(
            values[4],
            Value::BigNumber("3492890328409238509324850943850943825024385".into())
        );
        assert_eq!(
            values[5],
            Value::VerbatimString {
                format: VerbatimFormat::Text,
                text: "hello".into()
            }
        );
        assert_eq!(
            values[6],
            Value::Map(vec![
                (Value::BulkString(b"a".to_vec()), Value::Int(1)),
                (Value::BulkString(b"b".to_vec()), Value::Int(2)),
            ])
        );
        assert_eq!(values[7], Value::Set(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn parses_push_frames() {
        let mut reader = BytesReader::new();
        reader.feed(b">3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$5\r\nhello\r\n");
        let values = parse_all(&mut reader);
        assert_eq!(
            values[0],
            Value::Push {
                kind: PushKind::Message,
                data: vec![
                    Value::BulkString(b"ch".to_vec()),
                    Value::BulkString(b"hello".to_vec()),
                ],
            }
        );
    }

    #[test]
    fn nested_arrays_with_nils() {
        let mut reader = BytesReader::new();
        reader.feed(b"*3\r\n:1\r\n$-1\r\n*2\r\n+a\r\n*-1\r\n");
        assert_eq!(
            parse_all(&mut reader),
            vec![Value::Array(vec![
                Value::Int(1),
                Value::Nil,
                Value::Array(vec![Value::SimpleString("a".into()), Value::Nil]),
            ])]
        );
    }

    #[test]
    fn chunked_feeding_is_equivalent() {
        let frame = b"*2\r\n$3\r\nfoo\r\n*2\r\n:7\r\n$3\r\nbar\r\n";
        let expected = {
            let mut reader = BytesReader::new();
            reader.feed(frame);
            parse_all(&mut reader)
        };
        // Any partition of the frame into chunks yields the same value.
        for split in 1..frame.len() {
            let mut reader = BytesReader::new();
            reader.feed(&frame[..split]);
            let mut values = parse_all(&mut reader);
            reader.feed(&frame[split..]);
            values.extend(parse_all(&mut reader));
            assert_eq!(values, expected, "split at {split}");
        }
        // Byte-at-a-time as well.
        let mut reader = BytesReader::new();
        let mut values = Vec::new();
        for byte in frame {
            reader.feed(&[*byte]);
            values.extend(parse_all(&mut reader));
        }
        assert_eq!(values, expected);
    }

    #[test]
    fn need_more_is_distinct_from_nil() {
        let mut reader = BytesReader::new();
        reader.feed(b"$-1");
        // Strict prefix of a nil frame: no value yet.
        assert_eq!(reader.gets().unwrap(), Parsed::NeedMore);
        reader.feed(b"\r\n");
        assert_eq!(reader.gets().unwrap(), Parsed::Value(Value::Nil));
        assert_eq!(reader.gets().unwrap(), Parsed::NeedMore);
    }

    #[test]
    fn error_replies_are_returned_not_raised() {
        let mut reader = BytesReader::new();
        reader.feed(b"-ERR unknown command 'BADCMD'\r\n");
        match reader.gets().unwrap() {
            Parsed::Value(Value::ServerError(err)) => {
                assert_eq!(err.code(), "ERR");
                assert_eq!(err.message(), "unknown command 'BADCMD'");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn framing_violations_are_raised() {
        let mut reader = BytesReader::new();
        reader.feed(b"$-2\r\n");
        assert_eq!(reader.gets().unwrap_err().kind(), ErrorKind::InvalidResponse);

        let mut reader = BytesReader::new();
        reader.feed(b"$3\r\nfooXY");
        assert_eq!(reader.gets().unwrap_err().kind(), ErrorKind::InvalidResponse);

        let mut reader = BytesReader::new();
        reader.feed(b"!bogus\r\n");
        assert_eq!(reader.gets().unwrap_err().kind(), ErrorKind::InvalidResponse);
    }

    #[test]
    fn doubles_cover_special_values() {
        let mut reader = BytesReader::new();
        reader.feed(b",inf\r\n,-inf\r\n,nan\r\n,10\r\n");
        let values = parse_all(&mut reader);
        assert_eq!(values[0], Value::Double(f64::INFINITY));
        assert_eq!(values[1], Value::Double(f64::NEG_INFINITY));
        assert!(matches!(values[2], Value::Double(d) if d.is_nan()));
        assert_eq!(values[3], Value::Double(10.0));
    }

    #[test]
    fn decodes_replies_when_encoding_is_set() {
        let mut reader = BytesReader::new();
        reader.set_encoding(Some("utf-8"), Some("strict")).unwrap();
        reader.feed(b"$5\r\nhello\r\n");
        assert_eq!(
            reader.gets().unwrap(),
            Parsed::Value(Value::SimpleString("hello".into()))
        );

        reader.feed(b"$2\r\n\xff\xfe\r\n");
        assert_eq!(reader.gets().unwrap_err().kind(), ErrorKind::InvalidResponse);

        let mut reader = BytesReader::new();
        reader.set_encoding(Some("utf-8"), Some("replace")).unwrap();
        reader.feed(b"$2\r\n\xff\xfe\r\n");
        assert!(matches!(
            reader.gets().unwrap(),
            Parsed::Value(Value::SimpleString(_))
        ));
    }

    #[test]
    fn rejects_unknown_encodings() {
        let mut reader = BytesReader::new();
        let err = reader.set_encoding(Some("latin-1"), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Data);
    }

    #[test]
    fn codec_decodes_from_bytesmut() {
        let mut codec = ValueCodec::default();
        let mut buf = BytesMut::from(&b"+OK\r\n:5\r"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Value::Okay));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Value::Int(5)));
    }
}
