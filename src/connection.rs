use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use strum_macros::Display;
use tokio::sync::{mpsc, oneshot, watch, Notify, Semaphore};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::command::{Command, ToArg};
use crate::config::{Config, ProtocolVersion};
use crate::frame::Frame;
use crate::pipeline::{Pipeline, Request, ResponseFuture};
use crate::pubsub::{Listener, Subscription};
use crate::transport::{self, BoxedTransport};
use crate::Error;

type FramedTransport = Framed<BoxedTransport, FrameCodec>;

/// Called once with the error that broke the connection.
pub type Observer = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ConnectionState {
    /// No connection yet, or closed by [`Client::close`](crate::Client::close).
    Disconnected,
    /// Transport and handshake in progress, as reported by [`Client::state`](crate::Client::state).
    Connecting,
    Ready,
    /// Subscribed to at least one channel or pattern. Over RESP2 only the pub/sub commands,
    /// `PING` and `QUIT` are accepted in this state.
    Subscribed,
    Closing,
    Closed,
}

impl ConnectionState {
    fn is_open(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Subscribed)
    }
}

/// A multiplexed connection to a Redis server.
///
/// Handles are cheap to clone and may be used from any number of tasks at once. Commands are
/// written in the order they are submitted and their replies are handed back in that same
/// order. The socket is driven by a writer task and a reader task; it is closed by `close`, on
/// any I/O or protocol error, or once every handle has been dropped and the pending replies have
/// been read.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    requests: mpsc::UnboundedSender<Request>,
}

struct Shared {
    id: Uuid,
    address: String,
    connect_timeout: Duration,
    command_timeout: Option<Duration>,
    max_pipeline_depth: usize,
    state: watch::Sender<ConnectionState>,
    pipeline: Mutex<Pipeline>,
    // One permit per request that has been submitted and not answered yet.
    permits: Arc<Semaphore>,
    // Notified whenever the pipeline runs empty.
    idle: Notify,
    shutdown: CancellationToken,
    observer: Option<Observer>,
}

impl Connection {
    /// Connects to the server and runs the handshake: protocol negotiation, authentication,
    /// database selection and client name, as configured. The returned connection is `Ready`.
    pub async fn connect(config: Config) -> Result<Connection, Error> {
        establish(config, None).await
    }

    /// Like [`Connection::connect`], with a callback invoked if the connection is later lost.
    /// It is not invoked when the connection is closed with [`Connection::close`].
    pub async fn connect_with_observer<F>(config: Config, observer: F) -> Result<Connection, Error>
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        establish(config, Some(Arc::new(observer))).await
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn state(&self) -> ConnectionState {
        let state = *self.shared.state.borrow();
        if !state.is_open() {
            return state;
        }

        // The pipeline is updated before any caller is resolved, the watched state right after.
        if self.shared.pipeline().is_subscribed() {
            ConnectionState::Subscribed
        } else {
            ConnectionState::Ready
        }
    }

    /// Resolves once the connection is `Closed`.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    /// Whether a `MULTI` has been submitted without its `EXEC` or `DISCARD`.
    pub fn in_transaction(&self) -> bool {
        self.shared.pipeline().in_transaction()
    }

    /// Queues the command for writing and returns the future of its reply.
    ///
    /// The command is queued when this method is called, not when the future is first polled,
    /// so commands submitted one after the other are written in that order even if their futures
    /// are awaited out of order. An error reply resolves as [`Error::Server`].
    pub fn submit(&self, command: Command) -> ResponseFuture {
        self.enqueue(command, None, self.shared.command_timeout)
    }

    /// Like [`Connection::submit`] with a timeout overriding the configured one. A command that
    /// times out still runs on the server; its reply is discarded when it arrives.
    pub fn submit_with_timeout(&self, command: Command, timeout: Duration) -> ResponseFuture {
        self.enqueue(command, None, Some(timeout))
    }

    /// Subscribes to `channels`. Resolves once the server acknowledged every channel.
    pub fn subscribe<I>(&self, channels: I) -> impl Future<Output = Result<Subscription, Error>>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.listen(Command::new("SUBSCRIBE").args(channels))
    }

    /// Subscribes to channels matching the glob-style `patterns`.
    pub fn psubscribe<I>(&self, patterns: I) -> impl Future<Output = Result<Subscription, Error>>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.listen(Command::new("PSUBSCRIBE").args(patterns))
    }

    /// Unsubscribes from `channels`, or from every channel when empty. Resolves with the
    /// acknowledgments, and ends the streams of the dropped channels.
    pub fn unsubscribe<I>(&self, channels: I) -> ResponseFuture
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.submit(Command::new("UNSUBSCRIBE").args(channels))
    }

    pub fn punsubscribe<I>(&self, patterns: I) -> ResponseFuture
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.submit(Command::new("PUNSUBSCRIBE").args(patterns))
    }

    /// Starts a transaction. Until `exec` or `discard`, the futures of submitted commands resolve
    /// only once `EXEC` returns, each with its own result.
    pub fn multi(&self) -> ResponseFuture {
        self.submit(Command::new("MULTI"))
    }

    /// Runs the queued commands and returns their results in order. Fails with
    /// [`Error::TransactionAborted`] when a watched key was modified.
    pub fn exec(&self) -> impl Future<Output = Result<Vec<Frame>, Error>> {
        let response = self.submit(Command::new("EXEC"));

        async move {
            match response.await? {
                Frame::Array(results) => Ok(results),
                frame => Err(Error::UnexpectedReply(frame)),
            }
        }
    }

    /// Drops the queued commands; their futures fail with [`Error::TransactionAborted`].
    pub fn discard(&self) -> ResponseFuture {
        self.submit(Command::new("DISCARD"))
    }

    pub fn watch<I>(&self, keys: I) -> ResponseFuture
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.submit(Command::new("WATCH").args(keys))
    }

    pub fn unwatch(&self) -> ResponseFuture {
        self.submit(Command::new("UNWATCH"))
    }

    /// Sends `RESET`. Once acknowledged, every subscription stream ends, commands queued in an
    /// open transaction fail with [`Error::TransactionAborted`] and the connection speaks RESP2.
    /// The server also drops the authentication and database chosen by the handshake.
    pub fn reset(&self) -> ResponseFuture {
        self.submit(Command::new("RESET"))
    }

    /// Sends `QUIT` and closes the connection. Requests still pending fail with
    /// [`Error::ConnectionLost`].
    pub async fn close(&self) {
        let closing = self.shared.state.send_if_modified(|state| {
            if state.is_open() {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });

        if closing {
            let timeout = self
                .shared
                .command_timeout
                .unwrap_or(self.shared.connect_timeout);
            if let Err(err) = self.submit_with_timeout(Command::new("QUIT"), timeout).await {
                debug!("QUIT failed: {}", err);
            }
        }

        self.shared.terminate(None);
    }

    fn listen(&self, command: Command) -> impl Future<Output = Result<Subscription, Error>> {
        let (listener, rx) = mpsc::unbounded_channel();
        let response = self.enqueue(command, Some(listener), self.shared.command_timeout);

        let connection = self.clone();

        async move {
            response.await?;
            Ok(Subscription::new(rx).keep_alive(connection))
        }
    }

    fn enqueue(
        &self,
        command: Command,
        listener: Option<Listener>,
        timeout: Option<Duration>,
    ) -> ResponseFuture {
        let state = self.state();
        let accepted = match state {
            ConnectionState::Ready => true,
            ConnectionState::Subscribed => {
                self.shared.pipeline().protocol() == ProtocolVersion::Resp3
                    || command.allowed_in_subscribed_mode()
            }
            ConnectionState::Closing => command.is("QUIT"),
            _ => false,
        };
        if !accepted {
            return ResponseFuture::failed(Error::NotReady {
                state,
                command: command.name(),
            });
        }

        let Ok(permit) = self.shared.permits.clone().try_acquire_owned() else {
            return ResponseFuture::failed(Error::Backpressure(self.shared.max_pipeline_depth));
        };

        let (responder, rx) = oneshot::channel();
        let request = Request {
            command,
            responder,
            listener,
            permit: Some(permit),
        };

        if self.requests.send(request).is_err() {
            return ResponseFuture::failed(Error::ConnectionLost(
                "connection closed".to_string(),
            ));
        }

        ResponseFuture::new(rx, timeout)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .finish()
    }
}

#[instrument(name = "connect", skip_all, fields(address = %config.address()))]
async fn establish(config: Config, observer: Option<Observer>) -> Result<Connection, Error> {
    let (state, _) = watch::channel(ConnectionState::Connecting);

    let stream = transport::open(&config).await?;
    let mut framed = Framed::new(stream, FrameCodec::new(config.max_frame_size));

    match timeout(config.connect_timeout, handshake(&mut framed, &config)).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::Timeout(config.connect_timeout)),
    }

    let max_pipeline_depth = config.max_pipeline_depth.max(1);
    let shared = Arc::new(Shared {
        id: Uuid::new_v4(),
        address: config.address(),
        connect_timeout: config.connect_timeout,
        command_timeout: config.command_timeout,
        max_pipeline_depth,
        state,
        pipeline: Mutex::new(Pipeline::new(config.protocol)),
        permits: Arc::new(Semaphore::new(max_pipeline_depth)),
        idle: Notify::new(),
        shutdown: CancellationToken::new(),
        observer,
    });

    let (requests, rx) = mpsc::unbounded_channel();
    let (sink, stream) = framed.split::<Command>();

    let span = info_span!(
        "connection",
        connection_id = %shared.id,
        address = %shared.address
    );
    tokio::spawn(write_loop(shared.clone(), sink, rx).instrument(span.clone()));
    tokio::spawn(read_loop(shared.clone(), stream).instrument(span));

    shared.state.send_replace(ConnectionState::Ready);
    info!(connection_id = %shared.id, protocol = %config.protocol, "connection ready");

    Ok(Connection { shared, requests })
}

/// Runs before the connection is handed out, so callers only ever see an authenticated
/// connection on the configured database.
async fn handshake(framed: &mut FramedTransport, config: &Config) -> Result<(), Error> {
    if config.protocol == ProtocolVersion::Resp3 {
        let mut hello = Command::new("HELLO").arg(3);
        if let Some(password) = &config.password {
            let username = config.username.as_deref().unwrap_or("default");
            hello = hello.arg("AUTH").arg(username).arg(password);
        }
        round_trip(framed, hello).await?;
    } else if let Some(password) = &config.password {
        let mut auth = Command::new("AUTH");
        if let Some(username) = &config.username {
            auth = auth.arg(username);
        }
        round_trip(framed, auth.arg(password)).await?;
    }

    if config.database != 0 {
        round_trip(framed, Command::new("SELECT").arg(config.database)).await?;
    }

    if let Some(name) = &config.client_name {
        round_trip(framed, Command::new("CLIENT").arg("SETNAME").arg(name)).await?;
    }

    Ok(())
}

async fn round_trip(framed: &mut FramedTransport, command: Command) -> Result<Frame, Error> {
    debug!("handshake: {}", command.name());
    framed.send(command).await?;

    match framed.next().await {
        Some(Ok(Frame::Error(msg))) => Err(Error::Server(msg)),
        Some(Ok(frame)) => Ok(frame),
        Some(Err(err)) => Err(err),
        None => Err(Error::ConnectionLost(
            "connection closed during handshake".to_string(),
        )),
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut sink: SplitSink<FramedTransport, Command>,
    mut requests: mpsc::UnboundedReceiver<Request>,
) {
    let result = loop {
        let request = tokio::select! {
            _ = shared.shutdown.cancelled() => break Ok(()),
            request = requests.recv() => request,
        };

        let Some(request) = request else {
            debug!("every handle was dropped, closing once pending replies are read");
            shared.wait_idle().await;
            break Ok(());
        };

        if let Err(err) = write_batch(&shared, &mut sink, &mut requests, request).await {
            break Err(err);
        }
    };

    shared.terminate(result.err());

    requests.close();
    while let Ok(request) = requests.try_recv() {
        let _ = request
            .responder
            .send(Err(Error::ConnectionLost("connection closed".to_string())));
    }

    let _ = sink.close().await;
}

/// Writes `first` and every request already waiting behind it, then flushes once.
async fn write_batch(
    shared: &Shared,
    sink: &mut SplitSink<FramedTransport, Command>,
    requests: &mut mpsc::UnboundedReceiver<Request>,
    first: Request,
) -> Result<(), Error> {
    let mut written = 0;
    let mut next = Some(first);

    while let Some(request) = next {
        if let Some(command) = shared.admit(request) {
            sink.feed(command).await?;
            written += 1;
        }
        next = requests.try_recv().ok();
    }

    if written > 0 {
        sink.flush().await?;
    }

    Ok(())
}

async fn read_loop(shared: Arc<Shared>, mut stream: SplitStream<FramedTransport>) {
    let err = loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(frame)) => {
                debug!("received {}", frame);
                if let Err(err) = shared.dispatch(frame) {
                    break err;
                }
            }
            Some(Err(err)) => break err,
            None => break Error::ConnectionLost("connection closed by server".to_string()),
        }
    };

    shared.terminate(Some(err));
}

impl Shared {
    fn pipeline(&self) -> MutexGuard<'_, Pipeline> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers the request as pending. Returns the command to write, if any.
    fn admit(&self, request: Request) -> Option<Command> {
        let mut pipeline = self.pipeline();

        // Checked under the lock so nothing is admitted after `terminate` failed the pipeline.
        if self.shutdown.is_cancelled() {
            let _ = request
                .responder
                .send(Err(Error::ConnectionLost("connection closed".to_string())));
            return None;
        }

        let command = pipeline.admit(request);
        self.sync_state(pipeline.is_subscribed());
        command
    }

    fn dispatch(&self, frame: Frame) -> Result<(), Error> {
        let mut pipeline = self.pipeline();
        pipeline.dispatch(frame)?;
        self.sync_state(pipeline.is_subscribed());

        if pipeline.is_empty() {
            self.idle.notify_one();
        }

        Ok(())
    }

    fn sync_state(&self, subscribed: bool) {
        self.state.send_if_modified(|state| {
            let next = match *state {
                ConnectionState::Ready if subscribed => ConnectionState::Subscribed,
                ConnectionState::Subscribed if !subscribed => ConnectionState::Ready,
                _ => return false,
            };
            debug!("{} -> {}", state, next);
            *state = next;
            true
        });
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.pipeline().is_empty();
            if idle {
                return;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = self.idle.notified() => {}
            }
        }
    }

    /// Closes the connection and fails everything still pending. Only the first call has an
    /// effect.
    fn terminate(&self, err: Option<Error>) {
        let previous = self.state.send_replace(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return;
        }

        self.shutdown.cancel();

        let lost = previous != ConnectionState::Closing;
        let err = match err {
            Some(err) if lost => {
                let outstanding = self.pipeline().len();
                error!(outstanding, "connection lost: {}", err);
                if let Some(observer) = &self.observer {
                    observer(&err);
                }
                err
            }
            _ => {
                info!("connection closed");
                Error::ConnectionLost("connection closed".to_string())
            }
        };

        self.pipeline().fail_all(&err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Subscribed.to_string(), "Subscribed");
        assert!(ConnectionState::Ready.is_open());
        assert!(!ConnectionState::Closing.is_open());
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = Config {
            port,
            ..Config::default()
        };

        let err = Connection::connect(config).await.unwrap_err();

        assert!(matches!(err, Error::Connect { .. }));
        assert!(err.is_retryable());
    }
}
