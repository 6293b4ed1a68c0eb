use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::command::{Command, ToArg};
use crate::config::Config;
use crate::connection::{Connection, ConnectionState};
use crate::frame::Frame;
use crate::pubsub::Subscription;
use crate::reconnect::ReconnectPolicy;
use crate::Error;

/// Keeps one connection alive, reconnecting with backoff when it is lost.
///
/// Requests that were in flight when the connection broke are not retried; they fail with
/// [`Error::ConnectionLost`] and the next call reconnects.
#[derive(Debug)]
pub struct Client {
    config: Config,
    policy: ReconnectPolicy,
    current: Mutex<Option<Connection>>,
    connecting: AtomicBool,
}

impl Client {
    pub fn new(config: Config, policy: ReconnectPolicy) -> Self {
        Self {
            config,
            policy: policy.normalized(),
            current: Mutex::new(None),
            connecting: AtomicBool::new(false),
        }
    }

    /// Client for a `redis://` url with the default reconnect policy. Does not connect yet.
    pub fn open(url: &str) -> Result<Self, Error> {
        Ok(Self::new(Config::from_url(url)?, ReconnectPolicy::default()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `Disconnected` before the first call and after `close`, `Connecting` while a connection is
    /// being established, and the state of the current connection otherwise.
    pub async fn state(&self) -> ConnectionState {
        // The lock is held for the whole reconnect, so check the flag first.
        if self.connecting.load(Ordering::Acquire) {
            return ConnectionState::Connecting;
        }

        match self.current.lock().await.as_ref() {
            Some(connection) => connection.state(),
            None => ConnectionState::Disconnected,
        }
    }

    /// The live connection, reconnecting first when there is none or it was closed.
    pub async fn connection(&self) -> Result<Connection, Error> {
        let mut current = self.current.lock().await;

        if let Some(connection) = current.as_ref() {
            match connection.state() {
                ConnectionState::Closing | ConnectionState::Closed => {
                    debug!(connection_id = %connection.id(), "connection is gone");
                }
                _ => return Ok(connection.clone()),
            }
        }

        let connection = {
            let _connecting = ConnectingGuard::new(&self.connecting);
            self.reconnect().await?
        };
        *current = Some(connection.clone());

        Ok(connection)
    }

    pub async fn submit(&self, command: Command) -> Result<Frame, Error> {
        self.connection().await?.submit(command).await
    }

    pub async fn subscribe<I>(&self, channels: I) -> Result<Subscription, Error>
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.connection().await?.subscribe(channels).await
    }

    /// Closes the current connection, if any. A later call reconnects.
    pub async fn close(&self) {
        if let Some(connection) = self.current.lock().await.take() {
            connection.close().await;
        }
    }

    #[instrument(name = "reconnect", skip(self), fields(address = %self.config.address()))]
    async fn reconnect(&self) -> Result<Connection, Error> {
        let mut attempt = 0;

        loop {
            match Connection::connect(self.config.clone()).await {
                Ok(connection) => return Ok(connection),
                Err(err) if err.is_retryable() && self.policy.should_retry(attempt) => {
                    let delay = self.policy.delay(attempt);
                    warn!(attempt, ?delay, "connect failed: {}", err);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Raises the connecting flag until dropped, including when the reconnect is cancelled.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl<'a> ConnectingGuard<'a> {
    fn new(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
