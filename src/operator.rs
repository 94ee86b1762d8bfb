//! Glue between the wire codec and the event model.
//!
//! The operator packs outgoing commands and pipelines into wire payloads and
//! normalizes raw parsed replies into [`Response`] / [`PipelinedResponses`]
//! events, applying per-command callbacks and untangling `MULTI`/`EXEC`
//! pipelines from vanilla ones.

use crate::callbacks;
use crate::errors::{ErrorKind, RedisError, RedisResult, ServerError};
use crate::events::{
    Command, CommandEvent, PackedCommand, PipelinedCommands, PipelinedResponses, ReplyEvent,
    Response,
};
use crate::parser::{BytesReader, Parsed, ReplyEncoding, ValueCodec};
use crate::types::Value;
use crate::writer::Writer;

/// Encodes and decodes data between a client and the server.
#[derive(Debug)]
pub struct Operator {
    reader: BytesReader,
    writer: Writer,
    encoding: Option<ReplyEncoding>,
    resp2: bool,
}

impl Operator {
    pub fn new(resp2: bool, encoding: Option<ReplyEncoding>) -> Operator {
        Operator {
            reader: BytesReader::with_encoding(encoding),
            writer: Writer::new(),
            encoding,
            resp2,
        }
    }

    /// Whether replies are normalized through the RESP2 defaults.
    pub fn is_resp2(&self) -> bool {
        self.resp2
    }

    /// Drops down to RESP2 semantics (servers below 6.0).
    pub fn force_resp2(&mut self) {
        self.resp2 = true;
    }

    /// A framing codec sharing this operator's decode configuration.
    pub fn codec(&self) -> ValueCodec {
        ValueCodec::new(self.encoding)
    }

    /// Packs a command or pipeline into a wire payload.
    ///
    /// Under RESP2 the registry of default callbacks is consulted for
    /// commands whose RESP2 reply shape needs client-side normalization.
    pub fn pack_command(&self, mut event: CommandEvent) -> PackedCommand {
        if self.resp2 {
            match &mut event {
                CommandEvent::Single(cmd) => attach_resp2_default(cmd),
                CommandEvent::Pipeline(pipeline) => {
                    for cmd in &mut pipeline.commands {
                        attach_resp2_default(cmd);
                    }
                }
            }
        }
        self.writer.pack_command(event)
    }

    /// Feeds received bytes to the reply parser.
    pub fn receive_data(&mut self, data: &[u8]) {
        self.reader.feed(data);
    }

    /// Tries to produce one parsed reply from the buffered bytes.
    pub fn gets(&mut self) -> RedisResult<Parsed> {
        self.reader.gets()
    }

    /// Iterates over the replies parsed from received data, stopping when
    /// the buffer runs dry.
    pub fn iterparse(&mut self) -> IterParse<'_> {
        IterParse {
            reader: &mut self.reader,
        }
    }

    /// Drops any partially buffered reply bytes.
    pub fn reset(&mut self) {
        self.reader = BytesReader::with_encoding(self.encoding);
    }

    /// Normalizes the raw wire replies for an event into a reply event.
    ///
    /// `raws` holds exactly the wire replies the packed event produced: one
    /// for a single command, `k` for a vanilla pipeline and `k + 2` for a
    /// transaction.
    pub fn read_response(&self, event: &CommandEvent, raws: Vec<Value>) -> RedisResult<ReplyEvent> {
        match event {
            CommandEvent::Single(cmd) => {
                let mut raws = raws;
                let raw = match (raws.pop(), raws.is_empty()) {
                    (Some(raw), true) => raw,
                    _ => fail!((
                        ErrorKind::Protocol,
                        "a single command must resolve from exactly one reply"
                    )),
                };
                Ok(ReplyEvent::Response(normalize_single(cmd, raw)?))
            }
            CommandEvent::Pipeline(pipeline) => Ok(ReplyEvent::Pipelined(normalize_pipeline(
                pipeline, raws,
            )?)),
        }
    }
}

/// Iterator over complete parsed replies; ends at the first `NeedMore`.
pub struct IterParse<'a> {
    reader: &'a mut BytesReader,
}

impl Iterator for IterParse<'_> {
    type Item = RedisResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.gets() {
            Ok(Parsed::NeedMore) => None,
            Ok(Parsed::Value(value)) => Some(Ok(value)),
            Err(err) => Some(Err(err)),
        }
    }
}

fn attach_resp2_default(cmd: &mut Command) {
    if cmd.callback.is_none() {
        cmd.callback = callbacks::resp2_default(&cmd.verb);
    }
}

fn normalize_single(cmd: &Command, raw: Value) -> RedisResult<Response> {
    let raw = match raw {
        Value::ServerError(err) => return Err(err.into()),
        raw => raw,
    };
    let reply = match cmd.callback {
        Some(callback) => callback(raw, &cmd.callback_args)?,
        None => raw,
    };
    Ok(Response {
        origin: cmd.clone(),
        reply,
    })
}

fn normalize_pipeline(
    pipeline: &PipelinedCommands,
    raws: Vec<Value>,
) -> RedisResult<PipelinedResponses> {
    if pipeline.transaction {
        normalize_transaction(pipeline, raws)
    } else {
        normalize_vanilla(pipeline, raws)
    }
}

/// A vanilla pipeline: one reply per command, zipped in order.
fn normalize_vanilla(
    pipeline: &PipelinedCommands,
    raws: Vec<Value>,
) -> RedisResult<PipelinedResponses> {
    let mut replies = Vec::with_capacity(raws.len());
    let mut errors = Vec::new();
    for (pos, (cmd, raw)) in pipeline.commands.iter().zip(raws).enumerate() {
        match raw {
            Value::ServerError(err) => {
                if pipeline.raise_on_error {
                    errors.push(annotate(pos + 1, cmd, &err).into());
                } else {
                    replies.push(Value::ServerError(err));
                }
            }
            raw => replies.push(apply_callback(cmd, raw)?),
        }
    }
    if !errors.is_empty() {
        return Err(RedisError::pipeline(errors));
    }
    Ok(PipelinedResponses {
        origin: pipeline.clone(),
        replies,
    })
}

/// A `MULTI`/`EXEC` pipeline. The wire carries the `MULTI` ack, one queued
/// ack per command, and the `EXEC` body; replies for commands rejected at
/// queue time are missing from the body and are spliced back in at their
/// positions.
fn normalize_transaction(
    pipeline: &PipelinedCommands,
    mut raws: Vec<Value>,
) -> RedisResult<PipelinedResponses> {
    if raws.len() != pipeline.len() + 2 {
        fail!((
            ErrorKind::InvalidResponse,
            "Wrong number of response items from pipeline execution."
        ));
    }
    let exec_body = raws.pop().expect("length checked above");
    let watch_ack = raws.remove(0);
    let mut watch_error = match watch_ack {
        Value::ServerError(err) => Some(err),
        _ => None,
    };
    if pipeline.raise_on_error {
        if let Some(err) = watch_error.take() {
            return Err(err.into());
        }
    }

    // Errors received while queueing the commands, annotated with their
    // 1-based position.
    let mut queued: Vec<(usize, ServerError)> = Vec::new();
    for (pos, (cmd, ack)) in pipeline.commands.iter().zip(&raws).enumerate() {
        if let Value::ServerError(err) = ack {
            queued.push((pos, annotate(pos + 1, cmd, err)));
        }
    }

    let mut body = match exec_body {
        Value::ServerError(exec_err) => {
            // The execution was aborted; surface the offending queued
            // command if we saw one, otherwise the EXEC error itself.
            return match queued.pop() {
                Some((_, err)) => Err(err.into()),
                None => Err(exec_err.into()),
            };
        }
        Value::Nil => fail!((ErrorKind::Watch, "Watched variable changed.")),
        Value::Array(items) => items,
        _ => fail!((
            ErrorKind::InvalidResponse,
            "Invalid response when parsing the transaction body"
        )),
    };

    let queued_positions: Vec<usize> = queued.iter().map(|(pos, _)| *pos).collect();
    for (pos, err) in queued {
        if pos > body.len() {
            fail!((
                ErrorKind::InvalidResponse,
                "Wrong number of response items from pipeline execution."
            ));
        }
        body.insert(pos, Value::ServerError(err));
    }
    if body.len() != pipeline.len() {
        fail!((
            ErrorKind::ResponseError,
            "Wrong number of response items from pipeline execution."
        ));
    }

    let mut replies = Vec::with_capacity(body.len() + 1);
    let mut errors: Vec<RedisError> = Vec::new();
    if let Some(err) = watch_error {
        replies.push(Value::ServerError(err));
    }
    for (pos, (cmd, raw)) in pipeline.commands.iter().zip(body).enumerate() {
        match raw {
            Value::ServerError(err) => {
                if pipeline.raise_on_error {
                    // Queue-time errors were annotated when spliced in.
                    let annotated = if queued_positions.contains(&pos) {
                        err
                    } else {
                        annotate(pos + 1, cmd, &err)
                    };
                    errors.push(annotated.into());
                } else {
                    replies.push(Value::ServerError(err));
                }
            }
            raw => replies.push(apply_callback(cmd, raw)?),
        }
    }
    if !errors.is_empty() {
        return Err(RedisError::pipeline(errors));
    }
    Ok(PipelinedResponses {
        origin: pipeline.clone(),
        replies,
    })
}

fn apply_callback(cmd: &Command, raw: Value) -> RedisResult<Value> {
    match cmd.callback {
        Some(callback) => callback(raw, &cmd.callback_args),
        None => Ok(raw),
    }
}

fn annotate(pos: usize, cmd: &Command, err: &ServerError) -> ServerError {
    ServerError::new(
        err.code(),
        format!(
            "Command # {pos} ({:?}) of pipeline caused error: {:?}",
            cmd.verb.as_ref(),
            err.message()
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator() -> Operator {
        Operator::new(false, None)
    }

    fn pipeline_of(verbs: &[&'static str], transaction: bool, raise: bool) -> PipelinedCommands {
        let mut pipeline = PipelinedCommands::new(transaction, raise);
        for verb in verbs {
            pipeline.push(Command::new(*verb).arg("k"));
        }
        pipeline
    }

    fn server_err(code: &str, message: &str) -> Value {
        Value::ServerError(ServerError::new(code, message))
    }

    #[test]
    fn single_command_applies_callback() {
        fn double(v: Value, _: &crate::events::CallbackArgs) -> RedisResult<Value> {
            Ok(Value::Int(v.as_int().unwrap() * 2))
        }
        let cmd = Command::new("INCR").arg("k").with_callback(double);
        let event = CommandEvent::Single(cmd);
        let reply = operator().read_response(&event, vec![Value::Int(21)]).unwrap();
        match reply {
            ReplyEvent::Response(response) => assert_eq!(response.reply, Value::Int(42)),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn single_command_errors_are_classified_and_raised() {
        let event = CommandEvent::Single(Command::new("GET").arg("k"));
        let err = operator()
            .read_response(&event, vec![server_err("NOAUTH", "Authentication required.")])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.detail(), Some("Authentication required."));
    }

    #[test]
    fn vanilla_pipeline_keeps_errors_inline() {
        let pipeline = pipeline_of(&["SET", "BADCMD", "SET"], false, false);
        let event = CommandEvent::Pipeline(pipeline);
        let raws = vec![
            Value::Okay,
            server_err("ERR", "unknown command 'BADCMD'"),
            Value::Okay,
        ];
        match operator().read_response(&event, raws).unwrap() {
            ReplyEvent::Pipelined(responses) => {
                assert_eq!(responses.replies.len(), 3);
                assert_eq!(responses.replies[0], Value::Okay);
                assert_eq!(
                    responses.replies[1],
                    server_err("ERR", "unknown command 'BADCMD'")
                );
                assert_eq!(responses.replies[2], Value::Okay);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn vanilla_pipeline_raises_composite() {
        let pipeline = pipeline_of(&["SET", "BADCMD"], false, true);
        let event = CommandEvent::Pipeline(pipeline);
        let raws = vec![Value::Okay, server_err("ERR", "unknown command 'BADCMD'")];
        let err = operator().read_response(&event, raws).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PipelineResponse);
        let errors = err.pipeline_errors();
        assert_eq!(errors.len(), 1);
        let detail = errors[0].detail().unwrap();
        assert!(detail.starts_with("Command # 2 (\"BADCMD\") of pipeline caused error:"));
    }

    #[test]
    fn transaction_unwraps_exec_body() {
        let pipeline = pipeline_of(&["INCR", "INCR"], true, false);
        let event = CommandEvent::Pipeline(pipeline);
        let raws = vec![
            Value::Okay,
            Value::SimpleString("QUEUED".into()),
            Value::SimpleString("QUEUED".into()),
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
        ];
        match operator().read_response(&event, raws).unwrap() {
            ReplyEvent::Pipelined(responses) => {
                assert_eq!(responses.replies, vec![Value::Int(1), Value::Int(2)]);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn transaction_callbacks_are_applied_to_the_body() {
        fn double(v: Value, _: &crate::events::CallbackArgs) -> RedisResult<Value> {
            Ok(Value::Int(v.as_int().unwrap() * 2))
        }
        let mut pipeline = PipelinedCommands::new(true, false);
        pipeline.push(Command::new("INCR").arg("k").with_callback(double));
        let event = CommandEvent::Pipeline(pipeline);
        let raws = vec![
            Value::Okay,
            Value::SimpleString("QUEUED".into()),
            Value::Array(vec![Value::Int(3)]),
        ];
        match operator().read_response(&event, raws).unwrap() {
            ReplyEvent::Pipelined(responses) => {
                assert_eq!(responses.replies, vec![Value::Int(6)]);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn nil_exec_body_means_watched_key_changed() {
        let pipeline = pipeline_of(&["INCR"], true, true);
        let event = CommandEvent::Pipeline(pipeline);
        let raws = vec![
            Value::Okay,
            Value::SimpleString("QUEUED".into()),
            Value::Nil,
        ];
        let err = operator().read_response(&event, raws).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Watch);
        assert!(err.to_string().contains("Watched variable changed."));
    }

    #[test]
    fn queue_time_errors_are_spliced_into_the_body() {
        // Three commands; the middle one was rejected at queue time, so the
        // EXEC body only has two entries.
        let pipeline = pipeline_of(&["SET", "BADCMD", "SET"], true, false);
        let event = CommandEvent::Pipeline(pipeline);
        let raws = vec![
            Value::Okay,
            Value::SimpleString("QUEUED".into()),
            server_err("ERR", "unknown command 'BADCMD'"),
            Value::SimpleString("QUEUED".into()),
            Value::Array(vec![Value::Okay, Value::Okay]),
        ];
        match operator().read_response(&event, raws).unwrap() {
            ReplyEvent::Pipelined(responses) => {
                assert_eq!(responses.replies.len(), 3);
                assert_eq!(responses.replies[0], Value::Okay);
                match &responses.replies[1] {
                    Value::ServerError(err) => {
                        assert!(err
                            .message()
                            .starts_with("Command # 2 (\"BADCMD\") of pipeline caused error:"));
                    }
                    other => panic!("expected an error at position 1, got {other:?}"),
                }
                assert_eq!(responses.replies[2], Value::Okay);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn aborted_exec_raises_the_queued_error() {
        let pipeline = pipeline_of(&["BADCMD"], true, true);
        let event = CommandEvent::Pipeline(pipeline);
        let raws = vec![
            Value::Okay,
            server_err("ERR", "unknown command 'BADCMD'"),
            server_err("EXECABORT", "Transaction discarded because of previous errors."),
        ];
        let err = operator().read_response(&event, raws).unwrap_err();
        // The queued command error is surfaced rather than the bare abort.
        assert!(err
            .detail()
            .unwrap()
            .starts_with("Command # 1 (\"BADCMD\") of pipeline caused error:"));
    }

    #[test]
    fn watch_error_is_raised_or_collected() {
        let raws = |_: ()| {
            vec![
                server_err("ERR", "watch failed"),
                Value::SimpleString("QUEUED".into()),
                Value::Array(vec![Value::Okay]),
            ]
        };
        let raising = pipeline_of(&["SET"], true, true);
        let err = operator()
            .read_response(&CommandEvent::Pipeline(raising), raws(()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResponseError);

        let collecting = pipeline_of(&["SET"], true, false);
        match operator()
            .read_response(&CommandEvent::Pipeline(collecting), raws(()))
            .unwrap()
        {
            ReplyEvent::Pipelined(responses) => {
                assert_eq!(responses.replies.len(), 2);
                assert!(responses.replies[0].is_error());
                assert_eq!(responses.replies[1], Value::Okay);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn wrong_reply_count_is_rejected() {
        let pipeline = pipeline_of(&["SET", "SET"], true, false);
        let event = CommandEvent::Pipeline(pipeline);
        // Body claims three replies for two commands.
        let raws = vec![
            Value::Okay,
            Value::SimpleString("QUEUED".into()),
            Value::SimpleString("QUEUED".into()),
            Value::Array(vec![Value::Okay, Value::Okay, Value::Okay]),
        ];
        let err = operator().read_response(&event, raws).unwrap_err();
        assert!(err.to_string().contains("Wrong number of response items"));
    }

    #[test]
    fn resp2_defaults_attach_from_the_registry() {
        let op = Operator::new(true, None);
        let packed = op.pack_command(CommandEvent::Single(Command::new("INFO")));
        match packed.origin {
            CommandEvent::Single(cmd) => assert!(cmd.callback.is_some()),
            other => panic!("unexpected origin: {other:?}"),
        }
        // Explicit callbacks are left alone, and unregistered verbs get none.
        let packed = op.pack_command(CommandEvent::Single(Command::new("GET").arg("k")));
        match packed.origin {
            CommandEvent::Single(cmd) => assert!(cmd.callback.is_none()),
            other => panic!("unexpected origin: {other:?}"),
        }
    }
}
