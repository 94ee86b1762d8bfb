//! The blocking connection driver.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::commands;
use crate::errors::{ErrorKind, RedisError, RedisResult};
use crate::events::{Command, CommandEvent, PackedCommand, PipelinedCommands, ReplyEvent};
use crate::operator::Operator;
use crate::parser::Parsed;
use crate::protocol::{server_version_from_info, RedisProtocol};
use crate::types::Value;

static CONNECTION_IDS: AtomicUsize = AtomicUsize::new(1);

pub(crate) fn next_connection_id() -> usize {
    CONNECTION_IDS.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn unpaired_reply_error() -> RedisError {
    (
        ErrorKind::InvalidResponse,
        "Got additional data on the stream. Are you connected to a supported Redis instance?",
    )
        .into()
}

pub(crate) fn lost_connection_error() -> RedisError {
    (ErrorKind::Connection, "Lost connection to server.").into()
}

#[derive(Debug)]
enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(feature = "tls-native-tls")]
    Tls(Box<native_tls::TlsStream<TcpStream>>),
}

impl Transport {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => stream.write_all(buf),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.write_all(buf),
            #[cfg(feature = "tls-native-tls")]
            Transport::Tls(stream) => stream.write_all(buf),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.read(buf),
            #[cfg(feature = "tls-native-tls")]
            Transport::Tls(stream) => stream.read(buf),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(feature = "tls-native-tls")]
            Transport::Tls(stream) => stream.get_ref().shutdown(Shutdown::Both),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            Transport::Unix(stream) => stream.set_read_timeout(timeout),
            #[cfg(feature = "tls-native-tls")]
            Transport::Tls(stream) => stream.get_ref().set_read_timeout(timeout),
        }
    }
}

#[derive(Debug)]
enum ConnectionState {
    NotConnected,
    Connected,
    /// Terminal until the next `disconnect`/`connect` cycle; the stored
    /// cause is re-raised on every send.
    Error(RedisError),
}

#[derive(Debug)]
struct InFlight {
    origin: CommandEvent,
    expected: usize,
    buffer: Vec<Value>,
}

/// A blocking connection to one server.
///
/// Commands are written immediately; replies are pulled from the socket when
/// the caller asks for them, pairing the n-th parsed reply with the n-th
/// pending command.
#[derive(Debug)]
pub struct Connection {
    id: usize,
    protocol: Arc<RedisProtocol>,
    operator: Operator,
    transport: Option<Transport>,
    state: ConnectionState,
    waiters: VecDeque<InFlight>,
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
            transport: None,
            state: ConnectionState::NotConnected,
            waiters: VecDeque::new(),
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
        matches!(self.state, ConnectionState::Connected) && self.transport.is_some()
    }

    /// Connects to the server if not already connected. Safe to call again
    /// after a failure; exclusive access is guaranteed by `&mut self`.
    pub fn connect(&mut self) -> RedisResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.open_transport()?;
        debug!(id = self.id, "connection established");
        if let Err(err) = self.on_connect() {
            // Clean up after any error in the handshake.
            self.disconnect();
            return Err(err);
        }
        Ok(())
    }

    fn open_transport(&mut self) -> RedisResult<()> {
        let timeout = self.protocol.socket.connect_timeout;
        let transport = if self.protocol.socket.is_unix_socket {
            self.open_unix_transport()?
        } else {
            let stream = self.open_tcp_stream(timeout)?;
            stream.set_nodelay(true)?;
            #[cfg(feature = "keep-alive")]
            if let Some(keepalive) = self.protocol.tcp_keepalive() {
                socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
            }
            self.maybe_wrap_tls(stream)?
        };
        transport.set_read_timeout(self.protocol.socket.timeout)?;
        self.transport = Some(transport);
        self.state = ConnectionState::Connected;
        self.operator = self.protocol.new_operator();
        self.waiters.clear();
        Ok(())
    }

    #[cfg(unix)]
    fn open_unix_transport(&self) -> RedisResult<Transport> {
        UnixStream::connect(&self.protocol.address.host)
            .map(Transport::Unix)
            .map_err(|err| self.protocol.connection_error(&err))
    }

    #[cfg(not(unix))]
    fn open_unix_transport(&self) -> RedisResult<Transport> {
        Err((
            ErrorKind::Connection,
            "Unix sockets are not supported on this platform",
        )
            .into())
    }

    fn open_tcp_stream(&self, timeout: Option<Duration>) -> RedisResult<TcpStream> {
        let address = &self.protocol.address;
        let addrs = (address.host.as_str(), address.port)
            .to_socket_addrs()
            .map_err(|err| self.protocol.connection_error(&err))?;
        let mut last_error: Option<io::Error> = None;
        for addr in addrs {
            let attempt = match timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(err) => last_error = Some(err),
            }
        }
        match last_error {
            Some(err)
                if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) =>
            {
                Err((ErrorKind::Timeout, "Timeout connecting to server").into())
            }
            Some(err) => Err(self.protocol.connection_error(&err)),
            None => Err(self.protocol.connection_error(&"no address found for host")),
        }
    }

    #[cfg(feature = "tls-native-tls")]
    fn maybe_wrap_tls(&self, stream: TcpStream) -> RedisResult<Transport> {
        let Some(ssl) = &self.protocol.ssl else {
            return Ok(Transport::Tcp(stream));
        };
        let connector = ssl.connector()?;
        let tls = connector
            .connect(&self.protocol.address.host, stream)
            .map_err(|err| {
                RedisError::from((
                    ErrorKind::Connection,
                    "TLS handshake failed",
                    format!("{err:?}"),
                ))
            })?;
        Ok(Transport::Tls(Box::new(tls)))
    }

    #[cfg(not(feature = "tls-native-tls"))]
    fn maybe_wrap_tls(&self, stream: TcpStream) -> RedisResult<Transport> {
        if self.protocol.ssl.is_some() {
            fail!((
                ErrorKind::Connection,
                "TLS was requested but this build has no TLS support"
            ));
        }
        Ok(Transport::Tcp(stream))
    }

    /// Runs the post-connect routine: discover the server version if it is
    /// unknown, then authenticate, name the client and select the database.
    fn on_connect(&mut self) -> RedisResult<()> {
        if self.protocol.server_version().is_none() {
            let info = self.execute_command(commands::info(Some("server")))?;
            self.protocol.set_server_version(server_version_from_info(&info)?);
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
            self.run_handshake_step(init)?;
        }
        if let Some(stack) = stack {
            self.run_handshake_step(stack)?;
        }
        self.next_health_check = self.protocol.next_health_check();
        Ok(())
    }

    fn run_handshake_step(&mut self, packed: PackedCommand) -> RedisResult<()> {
        self.send_command(packed)?;
        match self.read_reply() {
            Ok(_) => Ok(()),
            Err(err) => Err(wrap_handshake_error(&self.protocol, err)),
        }
    }

    /// Writes a packed payload and registers a waiter for its replies.
    pub fn send_command(&mut self, packed: PackedCommand) -> RedisResult<()> {
        match &self.state {
            ConnectionState::Connected => {}
            ConnectionState::NotConnected => fail!((
                ErrorKind::Connection,
                "connection error",
                format!(
                    "Lost connection while sending command: {}",
                    packed.origin.describe()
                ),
            )),
            ConnectionState::Error(cause) => return Err(cause.clone_mostly()),
        }
        let transport = self
            .transport
            .as_mut()
            .expect("connected state implies a transport");
        if let Err(err) = transport.write_all(&packed.payload) {
            let err: RedisError = err.into();
            self.state = ConnectionState::Error(err.clone_mostly());
            return Err(err);
        }
        trace!(id = self.id, origin = %packed.origin.describe(), "command sent");
        self.waiters.push_back(InFlight {
            origin: packed.origin,
            expected: packed.expected_replies.max(1),
            buffer: Vec::new(),
        });
        Ok(())
    }

    /// Blocks until the oldest pending command has all of its wire replies,
    /// then normalizes them.
    pub fn read_reply(&mut self) -> RedisResult<ReplyEvent> {
        if self.waiters.is_empty() {
            fail!((ErrorKind::Protocol, "no command is awaiting a reply"));
        }
        loop {
            loop {
                match self.operator.gets() {
                    Ok(Parsed::NeedMore) => break,
                    Ok(Parsed::Value(value)) => {
                        let front = self
                            .waiters
                            .front_mut()
                            .expect("loop precondition: a waiter exists");
                        front.buffer.push(value);
                        if front.buffer.len() == front.expected {
                            let entry = self
                                .waiters
                                .pop_front()
                                .expect("front_mut succeeded above");
                            let result = self.operator.read_response(&entry.origin, entry.buffer);
                            if self.waiters.is_empty() {
                                self.poison_on_stray_data();
                            }
                            return result;
                        }
                    }
                    Err(err) => {
                        self.state = ConnectionState::Error(err.clone_mostly());
                        return Err(err);
                    }
                }
            }
            self.read_from_socket()?;
        }
    }

    /// Anything parseable left after the last waiter resolved means the
    /// reply stream is out of step with the commands we sent.
    fn poison_on_stray_data(&mut self) {
        match self.operator.gets() {
            Ok(Parsed::NeedMore) => {}
            Ok(Parsed::Value(_)) => {
                warn!(id = self.id, "unpaired reply received; poisoning connection");
                self.state = ConnectionState::Error(unpaired_reply_error());
            }
            Err(err) => {
                self.state = ConnectionState::Error(err);
            }
        }
    }

    fn read_from_socket(&mut self) -> RedisResult<()> {
        let read_size = self.protocol.socket.read_size.max(1);
        let mut chunk = vec![0u8; read_size];
        let Some(transport) = self.transport.as_mut() else {
            return Err(lost_connection_error());
        };
        match transport.read(&mut chunk) {
            Ok(0) => {
                let err: RedisError =
                    (ErrorKind::Connection, "Connection closed by server.").into();
                self.state = ConnectionState::Error(err.clone_mostly());
                self.waiters.clear();
                Err(err)
            }
            Ok(n) => {
                self.operator.receive_data(&chunk[..n]);
                Ok(())
            }
            Err(err)
                if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) =>
            {
                // The waiter/reply alignment is now uncertain.
                let err: RedisError =
                    (ErrorKind::Timeout, "Timeout reading from socket").into();
                self.state = ConnectionState::Error(err.clone_mostly());
                Err(err)
            }
            Err(err) => {
                let err: RedisError = (
                    ErrorKind::Connection,
                    "connection error",
                    format!("Error while reading from socket: {err}"),
                )
                    .into();
                self.state = ConnectionState::Error(err.clone_mostly());
                Err(err)
            }
        }
    }

    /// Packs, sends and waits out a single command.
    pub fn execute_command(&mut self, cmd: Command) -> RedisResult<Value> {
        let packed = self.operator.pack_command(CommandEvent::Single(cmd));
        self.send_command(packed)?;
        match self.read_reply()? {
            ReplyEvent::Response(response) => Ok(response.reply),
            ReplyEvent::ConnectionClosed => Err(lost_connection_error()),
            ReplyEvent::Pipelined(_) => fail!((
                ErrorKind::Protocol,
                "pipeline reply for a single command"
            )),
        }
    }

    /// Packs, sends and waits out a pipeline in one round-trip.
    pub fn execute_pipeline(&mut self, pipeline: PipelinedCommands) -> RedisResult<Vec<Value>> {
        let packed = self.operator.pack_command(CommandEvent::Pipeline(pipeline));
        self.send_command(packed)?;
        match self.read_reply()? {
            ReplyEvent::Pipelined(responses) => Ok(responses.replies),
            ReplyEvent::ConnectionClosed => Err(lost_connection_error()),
            ReplyEvent::Response(_) => fail!((
                ErrorKind::Protocol,
                "single reply for a pipelined command"
            )),
        }
    }

    /// Shuts the socket down (best effort) and resets the driver state.
    pub fn disconnect(&mut self) {
        if let Some(transport) = self.transport.take() {
            let _ = transport.shutdown();
            debug!(id = self.id, "disconnected");
        }
        self.state = ConnectionState::NotConnected;
        self.waiters.clear();
        self.operator.reset();
    }

    /// Verifies the connection with `PING` when the check interval elapsed,
    /// reconnecting and retrying once before giving up.
    pub fn check_health(&mut self) -> RedisResult<()> {
        if !self.protocol.health_check_due(self.next_health_check) {
            return Ok(());
        }
        trace!(id = self.id, "running health check");
        if let Err(err) = self.ping_once() {
            if !(err.is_timeout() || err.is_connection_dropped()) {
                return Err(err);
            }
            warn!(id = self.id, error = %err, "health check failed; reconnecting");
            self.disconnect();
            self.connect()?;
            self.ping_once()?;
        }
        self.next_health_check = self.protocol.next_health_check();
        Ok(())
    }

    fn ping_once(&mut self) -> RedisResult<()> {
        let reply = self.execute_command(self.protocol.health_check_command())?;
        self.protocol.check_health_reply(&reply)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Authentication failures surface verbatim; any other server rejection of
/// the handshake means the connection is unusable.
pub(crate) fn wrap_handshake_error(protocol: &RedisProtocol, err: RedisError) -> RedisError {
    match err.kind() {
        ErrorKind::Authentication | ErrorKind::AuthenticationWrongNumberOfArgs => err,
        ErrorKind::Connection
        | ErrorKind::Timeout
        | ErrorKind::Io
        | ErrorKind::InvalidResponse
        | ErrorKind::Protocol => err,
        _ => protocol.connection_error(&err),
    }
}
