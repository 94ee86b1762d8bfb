//! The cooperative (tokio) connection driver.
//!
//! A connection spawns one driver task that owns the framed transport.
//! Requests travel to it over a channel as `(payload, origin, waiter)`
//! messages; the driver writes the payload and keeps an in-flight FIFO so
//! the n-th parsed reply resolves the n-th waiter. Pipelines count down
//! their expected wire replies before resolving.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{self, Poll};
use std::time::Instant;

use futures_util::{
    future::{Future, FutureExt},
    ready,
    sink::Sink,
    stream::{self, Stream, StreamExt},
};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use crate::commands;
use crate::errors::{ErrorKind, RedisError, RedisResult};
use crate::events::{Command, CommandEvent, PackedCommand, PipelinedCommands, ReplyEvent};
use crate::operator::Operator;
use crate::protocol::{server_version_from_info, RedisProtocol};
use crate::sio::{
    lost_connection_error, next_connection_id, unpaired_reply_error, wrap_handshake_error,
};
use crate::types::Value;

/// Trait for transports the driver can be built over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<S> AsyncStream for S where S: AsyncRead + AsyncWrite + Send + Unpin {}

type BoxedStream = Box<dyn AsyncStream>;

type ReplySender = oneshot::Sender<RedisResult<ReplyEvent>>;

/// The waiter handle returned by `send_command`; resolves when the matching
/// reply has been parsed.
pub type ReplyReceiver = oneshot::Receiver<RedisResult<ReplyEvent>>;

type FatalSlot = Arc<Mutex<Option<RedisError>>>;

struct DriverMessage {
    payload: Vec<u8>,
    origin: CommandEvent,
    expected: usize,
    output: ReplySender,
}

struct InFlight {
    origin: CommandEvent,
    expected: usize,
    buffer: Vec<Value>,
    output: ReplySender,
}

pin_project! {
    struct DriverSink<T> {
        #[pin]
        sink_stream: T,
        in_flight: VecDeque<InFlight>,
        error: Option<RedisError>,
        operator: Operator,
        fatal: FatalSlot,
        is_stream_closed: Arc<AtomicBool>,
    }
}

impl<T> DriverSink<T>
where
    T: Stream<Item = RedisResult<Value>> + 'static,
{
    // Read replies from the stream and resolve waiters with them.
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<Result<(), ()>> {
        loop {
            let item = match ready!(self.as_mut().project().sink_stream.poll_next(cx)) {
                Some(result) => result,
                // The reply stream is gone; fail every outstanding waiter and
                // break out of the forward combinator.
                None => {
                    let this = self.as_mut().project();
                    this.is_stream_closed.store(true, Ordering::Relaxed);
                    for entry in this.in_flight.drain(..) {
                        let _ = entry.output.send(Err(lost_connection_error()));
                    }
                    return Poll::Ready(Err(()));
                }
            };
            self.as_mut().send_result(item);
        }
    }

    fn send_result(self: Pin<&mut Self>, result: RedisResult<Value>) {
        let this = self.project();
        let Some(entry) = this.in_flight.front_mut() else {
            // A reply with no matching command: the stream is out of step.
            let err = match result {
                Ok(_) => unpaired_reply_error(),
                Err(err) => err,
            };
            warn!("unpaired reply received; poisoning connection");
            *this.fatal.lock().unwrap() = Some(err.clone_mostly());
            *this.error = Some(err);
            return;
        };
        match result {
            Ok(value) => {
                entry.buffer.push(value);
                if entry.buffer.len() < entry.expected {
                    // Need to gather more wire replies first.
                    return;
                }
                let entry = this
                    .in_flight
                    .pop_front()
                    .expect("front_mut succeeded above");
                let response = this.operator.read_response(&entry.origin, entry.buffer);
                // A send error means the waiter was cancelled; the reply is
                // simply dropped.
                entry.output.send(response).ok();
            }
            Err(err) => {
                let entry = this
                    .in_flight
                    .pop_front()
                    .expect("front_mut succeeded above");
                entry.output.send(Err(err)).ok();
            }
        }
    }
}

impl<T> Sink<DriverMessage> for DriverSink<T>
where
    T: Sink<Vec<u8>, Error = RedisError> + Stream<Item = RedisResult<Value>> + 'static,
{
    type Error = ();

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
    ) -> Poll<Result<(), Self::Error>> {
        match ready!(self.as_mut().project().sink_stream.poll_ready(cx)) {
            Ok(()) => Ok(()).into(),
            Err(err) => {
                *self.project().error = Some(err);
                Ok(()).into()
            }
        }
    }

    fn start_send(
        mut self: Pin<&mut Self>,
        DriverMessage {
            payload,
            origin,
            expected,
            output,
        }: DriverMessage,
    ) -> Result<(), Self::Error> {
        // Nothing is listening for the result; don't burden the connection.
        if output.is_closed() {
            return Ok(());
        }
        let this = self.as_mut().project();
        if let Some(err) = this.error.take() {
            let _ = output.send(Err(err));
            return Err(());
        }
        match this.sink_stream.start_send(payload) {
            Ok(()) => {
                this.in_flight.push_back(InFlight {
                    origin,
                    expected,
                    buffer: Vec::new(),
                    output,
                });
                Ok(())
            }
            Err(err) => {
                let _ = output.send(Err(err));
                Err(())
            }
        }
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
    ) -> Poll<Result<(), Self::Error>> {
        ready!(self
            .as_mut()
            .project()
            .sink_stream
            .poll_flush(cx)
            .map_err(|err| {
                self.as_mut().send_result(Err(err));
            }))?;
        self.poll_read(cx)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context,
    ) -> Poll<Result<(), Self::Error>> {
        // Complete any in-progress requests before closing.
        if !self.in_flight.is_empty() {
            ready!(self.as_mut().poll_flush(cx))?;
        }
        let this = self.as_mut().project();
        this.sink_stream.poll_close(cx).map_err(|err| {
            self.send_result(Err(err));
        })
    }
}

/// Handle to a running driver task.
#[derive(Debug)]
struct Driver {
    sender: mpsc::Sender<DriverMessage>,
    is_stream_closed: Arc<AtomicBool>,
}

impl Driver {
    fn new<T>(sink_stream: T, operator: Operator, fatal: FatalSlot) -> (Driver, impl Future<Output = ()>)
    where
        T: Sink<Vec<u8>, Error = RedisError> + Stream<Item = RedisResult<Value>> + Send + 'static,
    {
        const BUFFER_SIZE: usize = 50;
        let (sender, mut receiver) = mpsc::channel(BUFFER_SIZE);
        let is_stream_closed = Arc::new(AtomicBool::new(false));
        let sink = DriverSink {
            sink_stream,
            in_flight: VecDeque::new(),
            error: None,
            operator,
            fatal,
            is_stream_closed: is_stream_closed.clone(),
        };
        let task = stream::poll_fn(move |cx| receiver.poll_recv(cx))
            .map(Ok)
            .forward(sink)
            .map(|_| ());
        (
            Driver {
                sender,
                is_stream_closed,
            },
            task,
        )
    }
}

/// A tokio connection to one server.
#[derive(Debug)]
pub struct Connection {
    id: usize,
    protocol: Arc<RedisProtocol>,
    operator: Operator,
    driver: Option<Driver>,
    fatal: FatalSlot,
    connect_routine: Option<(Option<PackedCommand>, Option<PackedCommand>)>,
    next_health_check: Option<Instant>,
}

impl Connection {
    pub fn new(protocol: Arc<RedisProtocol>) -> Connection {
        let operator = protocol.new_operator();
        let connect_routine = protocol
            .server_version()
            .map(|_| protocol.get_on_connect_routine());
        Connection {
            id: next_connection_id(),
            protocol,
            operator,
            driver: None,
            fatal: Arc::new(Mutex::new(None)),
            connect_routine,
            next_health_check: None,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub fn protocol(&self) -> &Arc<RedisProtocol> {
        &self.protocol
    }

    pub fn is_connected(&self) -> bool {
        if self.fatal.lock().unwrap().is_some() {
            return false;
        }
        match &self.driver {
            Some(driver) => {
                !driver.is_stream_closed.load(Ordering::Relaxed) && !driver.sender.is_closed()
            }
            None => false,
        }
    }

    /// Connects to the server if not already connected. Exclusive access is
    /// guaranteed by `&mut self`; repeat calls are no-ops.
    pub async fn connect(&mut self) -> RedisResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let stream = self.open_stream().await?;
        self.fatal = Arc::new(Mutex::new(None));
        self.operator = self.protocol.new_operator();
        let codec = self.operator.codec();
        let (driver, task) = Driver::new(
            codec.framed(stream),
            self.protocol.new_operator(),
            self.fatal.clone(),
        );
        tokio::spawn(task);
        self.driver = Some(driver);
        debug!(id = self.id, "connection established");
        if let Err(err) = self.on_connect().await {
            self.disconnect().await;
            return Err(err);
        }
        Ok(())
    }

    async fn open_stream(&self) -> RedisResult<BoxedStream> {
        match self.protocol.socket.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.do_open_stream())
                .await
                .map_err(|_| {
                    RedisError::from((ErrorKind::Timeout, "Timeout connecting to server"))
                })?,
            None => self.do_open_stream().await,
        }
    }

    async fn do_open_stream(&self) -> RedisResult<BoxedStream> {
        if self.protocol.socket.is_unix_socket {
            return self.open_unix_stream().await;
        }
        let address = &self.protocol.address;
        let stream = TcpStream::connect((address.host.as_str(), address.port))
            .await
            .map_err(|err| self.protocol.connection_error(&err))?;
        stream.set_nodelay(true)?;
        #[cfg(feature = "keep-alive")]
        let stream = match self.protocol.tcp_keepalive() {
            Some(keepalive) => {
                let socket: socket2::Socket = stream.into_std()?.into();
                socket.set_tcp_keepalive(&keepalive)?;
                TcpStream::from_std(socket.into())?
            }
            None => stream,
        };
        self.maybe_wrap_tls(stream).await
    }

    #[cfg(unix)]
    async fn open_unix_stream(&self) -> RedisResult<BoxedStream> {
        let stream = UnixStream::connect(&self.protocol.address.host)
            .await
            .map_err(|err| self.protocol.connection_error(&err))?;
        Ok(Box::new(stream))
    }

    #[cfg(not(unix))]
    async fn open_unix_stream(&self) -> RedisResult<BoxedStream> {
        Err((
            ErrorKind::Connection,
            "Unix sockets are not supported on this platform",
        )
            .into())
    }

    #[cfg(feature = "tokio-native-tls-comp")]
    async fn maybe_wrap_tls(&self, stream: TcpStream) -> RedisResult<BoxedStream> {
        let Some(ssl) = &self.protocol.ssl else {
            return Ok(Box::new(stream));
        };
        let connector = tokio_native_tls::TlsConnector::from(ssl.connector()?);
        let tls = connector
            .connect(&self.protocol.address.host, stream)
            .await
            .map_err(|err| {
                RedisError::from((
                    ErrorKind::Connection,
                    "TLS handshake failed",
                    err.to_string(),
                ))
            })?;
        Ok(Box::new(tls))
    }

    #[cfg(not(feature = "tokio-native-tls-comp"))]
    async fn maybe_wrap_tls(&self, stream: TcpStream) -> RedisResult<BoxedStream> {
        if self.protocol.ssl.is_some() {
            fail!((
                ErrorKind::Connection,
                "TLS was requested but this build has no TLS support"
            ));
        }
        Ok(Box::new(stream))
    }

    async fn on_connect(&mut self) -> RedisResult<()> {
        if self.protocol.server_version().is_none() {
            let info = self.execute_command(commands::info(Some("server"))).await?;
            self.protocol
                .set_server_version(server_version_from_info(&info)?);
        }
        let routine = match &self.connect_routine {
            Some(routine) => routine.clone(),
            None => {
                let routine = self.protocol.get_on_connect_routine();
                self.connect_routine = Some(routine.clone());
                routine
            }
        };
        if self.protocol.is_resp2() {
            self.operator.force_resp2();
        }
        let (init, stack) = routine;
        // The init payload must go first; it enables everything after it.
        if let Some(init) = init {
            self.run_handshake_step(init).await?;
        }
        if let Some(stack) = stack {
            self.run_handshake_step(stack).await?;
        }
        self.next_health_check = self.protocol.next_health_check();
        Ok(())
    }

    async fn run_handshake_step(&mut self, packed: PackedCommand) -> RedisResult<()> {
        let receiver = self.send_command(packed).await?;
        match self.read_reply(receiver).await {
            Ok(_) => Ok(()),
            Err(err) => Err(wrap_handshake_error(&self.protocol, err)),
        }
    }

    /// Submits a packed payload; the returned waiter resolves when the
    /// matching reply arrives. A connection that is already closing resolves
    /// the waiter with [`ReplyEvent::ConnectionClosed`] instead of sending.
    pub async fn send_command(&mut self, packed: PackedCommand) -> RedisResult<ReplyReceiver> {
        if let Some(cause) = self.fatal.lock().unwrap().as_ref() {
            return Err(cause.clone_mostly());
        }
        let Some(driver) = &self.driver else {
            fail!((
                ErrorKind::Connection,
                "connection error",
                format!(
                    "Lost connection while sending command: {}",
                    packed.origin.describe()
                ),
            ));
        };
        let (sender, receiver) = oneshot::channel();
        if driver.is_stream_closed.load(Ordering::Relaxed) {
            let _ = sender.send(Ok(ReplyEvent::ConnectionClosed));
            return Ok(receiver);
        }
        trace!(id = self.id, origin = %packed.origin.describe(), "command submitted");
        let message = DriverMessage {
            payload: packed.payload,
            origin: packed.origin,
            expected: packed.expected_replies.max(1),
            output: sender,
        };
        if let Err(mpsc::error::SendError(message)) = driver.sender.send(message).await {
            let _ = message.output.send(Ok(ReplyEvent::ConnectionClosed));
        }
        Ok(receiver)
    }

    /// Awaits a waiter under the configured reply timeout. A timeout poisons
    /// the connection: the reply FIFO can no longer be trusted.
    pub async fn read_reply(&mut self, receiver: ReplyReceiver) -> RedisResult<ReplyEvent> {
        let result = match self.protocol.socket.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
                Ok(result) => result,
                Err(_) => {
                    let err: RedisError =
                        (ErrorKind::Timeout, "Timed out waiting for response.").into();
                    *self.fatal.lock().unwrap() = Some(err.clone_mostly());
                    return Err(err);
                }
            },
            None => receiver.await,
        };
        match result {
            Ok(reply) => reply,
            // The driver dropped the waiter: the connection died under us.
            Err(_) => Err(lost_connection_error()),
        }
    }

    /// Packs, sends and awaits a single command.
    pub async fn execute_command(&mut self, cmd: Command) -> RedisResult<Value> {
        let packed = self.operator.pack_command(CommandEvent::Single(cmd));
        let receiver = self.send_command(packed).await?;
        match self.read_reply(receiver).await? {
            ReplyEvent::Response(response) => Ok(response.reply),
            ReplyEvent::ConnectionClosed => Err(lost_connection_error()),
            ReplyEvent::Pipelined(_) => fail!((
                ErrorKind::Protocol,
                "pipeline reply for a single command"
            )),
        }
    }

    /// Packs, sends and awaits a pipeline in one round-trip.
    pub async fn execute_pipeline(
        &mut self,
        pipeline: PipelinedCommands,
    ) -> RedisResult<Vec<Value>> {
        let packed = self.operator.pack_command(CommandEvent::Pipeline(pipeline));
        let receiver = self.send_command(packed).await?;
        match self.read_reply(receiver).await? {
            ReplyEvent::Pipelined(responses) => Ok(responses.replies),
            ReplyEvent::ConnectionClosed => Err(lost_connection_error()),
            ReplyEvent::Response(_) => fail!((
                ErrorKind::Protocol,
                "single reply for a pipelined command"
            )),
        }
    }

    /// Winds the driver task down; outstanding waiters resolve with a lost
    /// connection error once the task drains.
    pub async fn disconnect(&mut self) {
        if self.driver.take().is_some() {
            debug!(id = self.id, "disconnected");
        }
        *self.fatal.lock().unwrap() = None;
    }

    /// Verifies the connection with `PING` when the check interval elapsed,
    /// reconnecting and retrying once before giving up.
    pub async fn check_health(&mut self) -> RedisResult<()> {
        if !self.protocol.health_check_due(self.next_health_check) {
            return Ok(());
        }
        trace!(id = self.id, "running health check");
        if let Err(err) = self.ping_once().await {
            if !(err.is_timeout() || err.is_connection_dropped()) {
                return Err(err);
            }
            warn!(id = self.id, error = %err, "health check failed; reconnecting");
            self.disconnect().await;
            self.connect().await?;
            self.ping_once().await?;
        }
        self.next_health_check = self.protocol.next_health_check();
        Ok(())
    }

    async fn ping_once(&mut self) -> RedisResult<()> {
        let reply = self
            .execute_command(self.protocol.health_check_command())
            .await?;
        self.protocol.check_health_reply(&reply)
    }
}
