//! Packing of commands into RESP multi-bulk frames.

use crate::events::{Command, CommandEvent, PackedCommand, PipelinedCommands};
use crate::types::Encodable;

/// Packs [`Command`]s and [`PipelinedCommands`] into the wire form the
/// server understands: `*<N>\r\n` followed by `N` bulk strings.
#[derive(Debug, Clone, Default)]
pub struct Writer;

impl Writer {
    pub fn new() -> Writer {
        Writer
    }

    /// Packs an event into a contiguous payload, remembering how many wire
    /// replies the payload will produce.
    pub fn pack_command(&self, event: CommandEvent) -> PackedCommand {
        match event {
            CommandEvent::Single(cmd) => {
                let mut payload = Vec::new();
                write_command(&mut payload, &cmd);
                PackedCommand {
                    origin: CommandEvent::Single(cmd),
                    payload,
                    expected_replies: 1,
                }
            }
            CommandEvent::Pipeline(pipeline) => {
                let payload = pack_pipeline(&pipeline);
                let expected_replies = if pipeline.transaction {
                    // MULTI ack + one queued ack per command + the EXEC body.
                    pipeline.len() + 2
                } else {
                    pipeline.len()
                };
                PackedCommand {
                    origin: CommandEvent::Pipeline(pipeline),
                    payload,
                    expected_replies,
                }
            }
        }
    }
}

fn pack_pipeline(pipeline: &PipelinedCommands) -> Vec<u8> {
    let mut payload = Vec::new();
    if pipeline.transaction {
        write_command(&mut payload, &Command::new("MULTI"));
        for cmd in &pipeline.commands {
            write_command(&mut payload, cmd);
        }
        write_command(&mut payload, &Command::new("EXEC"));
    } else {
        for cmd in &pipeline.commands {
            write_command(&mut payload, cmd);
        }
    }
    payload
}

fn write_command(buf: &mut Vec<u8>, cmd: &Command) {
    let verb_tokens: Vec<&str> = cmd.verb.split_whitespace().collect();
    write_header(buf, b'*', (verb_tokens.len() + cmd.modifiers.len()) as i64);
    for token in verb_tokens {
        write_bulk(buf, token.as_bytes());
    }
    let mut int_buf = itoa::Buffer::new();
    let mut float_buf = ryu::Buffer::new();
    for arg in &cmd.modifiers {
        match arg {
            Encodable::Bytes(bytes) => write_bulk(buf, bytes),
            Encodable::Str(s) => write_bulk(buf, s.as_bytes()),
            Encodable::Int(i) => write_bulk(buf, int_buf.format(*i).as_bytes()),
            Encodable::Float(f) => write_bulk(buf, float_buf.format(*f).as_bytes()),
        }
    }
}

fn write_header(buf: &mut Vec<u8>, prefix: u8, length: i64) {
    buf.push(prefix);
    let mut len_buf = itoa::Buffer::new();
    buf.extend_from_slice(len_buf.format(length).as_bytes());
    buf.extend_from_slice(b"\r\n");
}

fn write_bulk(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_header(buf, b'$', bytes.len() as i64);
    buf.extend_from_slice(bytes);
    buf.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_single(cmd: Command) -> PackedCommand {
        Writer::new().pack_command(CommandEvent::Single(cmd))
    }

    #[test]
    fn packs_get() {
        let packed = pack_single(Command::new("GET").arg("key:1"));
        assert_eq!(packed.payload, b"*2\r\n$3\r\nGET\r\n$5\r\nkey:1\r\n");
        assert_eq!(packed.expected_replies, 1);
    }

    #[test]
    fn packs_setex_with_numeric_args() {
        let packed = pack_single(Command::new("SETEX").arg("key:1").arg(600).arg(1));
        assert_eq!(
            packed.payload,
            b"*4\r\n$5\r\nSETEX\r\n$5\r\nkey:1\r\n$3\r\n600\r\n$1\r\n1\r\n"
        );
    }

    #[test]
    fn splits_multi_word_verbs() {
        let packed = pack_single(Command::new("CLIENT SETNAME").arg("worker-1"));
        assert_eq!(
            packed.payload,
            b"*3\r\n$6\r\nCLIENT\r\n$7\r\nSETNAME\r\n$8\r\nworker-1\r\n"
        );
    }

    #[test]
    fn floats_use_shortest_form() {
        let packed = pack_single(Command::new("INCRBYFLOAT").arg("k").arg(1.5));
        assert_eq!(
            packed.payload,
            b"*3\r\n$11\r\nINCRBYFLOAT\r\n$1\r\nk\r\n$3\r\n1.5\r\n"
        );
    }

    #[test]
    fn pipeline_frames_concatenate() {
        let mut pipeline = PipelinedCommands::new(false, false);
        pipeline.push(Command::new("SET").arg("k1").arg(1));
        pipeline.push(Command::new("GET").arg("k1"));
        let packed = Writer::new().pack_command(CommandEvent::Pipeline(pipeline));
        let mut expected = Vec::new();
        expected.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$2\r\nk1\r\n$1\r\n1\r\n");
        expected.extend_from_slice(b"*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n");
        assert_eq!(packed.payload, expected);
        assert_eq!(packed.expected_replies, 2);
    }

    #[test]
    fn packed_commands_parse_back_to_their_tokens() {
        use crate::parser::{BytesReader, Parsed};
        use crate::types::Value;

        let cmd = Command::new("CLIENT SETNAME")
            .arg("worker")
            .arg(17)
            .arg(2.5)
            .arg(b"raw\x00bytes".as_slice());
        let packed = pack_single(cmd);

        let mut reader = BytesReader::new();
        reader.feed(&packed.payload);
        let Parsed::Value(Value::Array(tokens)) = reader.gets().unwrap() else {
            panic!("expected a multi-bulk frame");
        };
        let tokens: Vec<Vec<u8>> = tokens
            .into_iter()
            .map(|token| match token {
                Value::BulkString(bytes) => bytes,
                other => panic!("expected bulk strings, got {other:?}"),
            })
            .collect();
        assert_eq!(
            tokens,
            vec![
                b"CLIENT".to_vec(),
                b"SETNAME".to_vec(),
                b"worker".to_vec(),
                b"17".to_vec(),
                b"2.5".to_vec(),
                b"raw\x00bytes".to_vec(),
            ]
        );
    }

    #[test]
    fn transactions_bracket_with_multi_exec() {
        let mut pipeline = PipelinedCommands::new(true, true);
        pipeline.push(Command::new("INCR").arg("k"));
        let packed = Writer::new().pack_command(CommandEvent::Pipeline(pipeline));
        assert!(packed.payload.starts_with(b"*1\r\n$5\r\nMULTI\r\n"));
        assert!(packed.payload.ends_with(b"*1\r\n$4\r\nEXEC\r\n"));
        assert_eq!(packed.expected_replies, 3);
    }
}
