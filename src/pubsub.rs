use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::frame::Frame;

/// A message published to a channel the connection is subscribed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub channel: Bytes,
    /// The pattern that matched, for messages received through `PSUBSCRIBE`.
    pub pattern: Option<Bytes>,
    pub payload: Bytes,
}

pub(crate) type Listener = mpsc::UnboundedSender<Message>;

/// Stream of messages for the channels or patterns of one `subscribe`/`psubscribe` call.
///
/// Messages are buffered without bound, so a slow consumer never holds up the connection's read
/// loop. The stream ends when the connection closes or the channels are unsubscribed. It holds
/// a handle to its connection, which stays open while the subscription is alive even after
/// every other handle was dropped.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Message>,
    connection: Option<Connection>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            rx,
            connection: None,
        }
    }

    pub(crate) fn keep_alive(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    /// The connection the messages arrive on.
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub async fn next_message(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum SubscriptionKind {
    Channel,
    Pattern,
}

impl SubscriptionKind {
    pub(crate) fn of_command(name: &str) -> Self {
        if name.starts_with('P') {
            SubscriptionKind::Pattern
        } else {
            SubscriptionKind::Channel
        }
    }
}

/// A pub/sub frame recognized among the inbound frames.
#[derive(Debug, PartialEq)]
pub(crate) enum PubSubFrame {
    Message(Message),
    Subscribed {
        kind: SubscriptionKind,
        name: Bytes,
    },
    Unsubscribed {
        kind: SubscriptionKind,
        name: Option<Bytes>,
    },
}

impl PubSubFrame {
    /// Recognizes `message`, `pmessage` and the subscription acknowledgments, sent as arrays in
    /// RESP2 and as push frames in RESP3.
    pub(crate) fn parse(frame: &Frame) -> Option<Self> {
        let elements = match frame {
            Frame::Array(elements) | Frame::Push(elements) => elements,
            _ => return None,
        };

        let (kind, rest) = elements.split_first()?;
        let kind = kind.as_bytes()?.to_ascii_lowercase();

        match (&kind[..], rest) {
            (b"message", [channel, payload]) => Some(PubSubFrame::Message(Message {
                channel: bulk(channel)?,
                pattern: None,
                payload: bulk(payload)?,
            })),
            (b"pmessage", [pattern, channel, payload]) => Some(PubSubFrame::Message(Message {
                channel: bulk(channel)?,
                pattern: Some(bulk(pattern)?),
                payload: bulk(payload)?,
            })),
            (b"subscribe", [name, _count]) => Some(PubSubFrame::Subscribed {
                kind: SubscriptionKind::Channel,
                name: bulk(name)?,
            }),
            (b"psubscribe", [name, _count]) => Some(PubSubFrame::Subscribed {
                kind: SubscriptionKind::Pattern,
                name: bulk(name)?,
            }),
            (b"unsubscribe", [name, _count]) => Some(PubSubFrame::Unsubscribed {
                kind: SubscriptionKind::Channel,
                name: bulk(name),
            }),
            (b"punsubscribe", [name, _count]) => Some(PubSubFrame::Unsubscribed {
                kind: SubscriptionKind::Pattern,
                name: bulk(name),
            }),
            _ => None,
        }
    }
}

fn bulk(frame: &Frame) -> Option<Bytes> {
    match frame {
        Frame::Bulk(bytes) => Some(bytes.clone()),
        Frame::Simple(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
        _ => None,
    }
}

/// Channels and patterns acknowledged by the server, with the listeners attached to each.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    channels: HashMap<Bytes, Vec<Listener>>,
    patterns: HashMap<Bytes, Vec<Listener>>,
}

impl Registry {
    fn entries(&mut self, kind: SubscriptionKind) -> &mut HashMap<Bytes, Vec<Listener>> {
        match kind {
            SubscriptionKind::Channel => &mut self.channels,
            SubscriptionKind::Pattern => &mut self.patterns,
        }
    }

    pub(crate) fn add(&mut self, kind: SubscriptionKind, name: Bytes, listener: Option<Listener>) {
        let listeners = self.entries(kind).entry(name).or_default();
        listeners.extend(listener);
    }

    pub(crate) fn remove(&mut self, kind: SubscriptionKind, name: &[u8]) {
        self.entries(kind).remove(name);
    }

    pub(crate) fn len(&self, kind: SubscriptionKind) -> usize {
        match kind {
            SubscriptionKind::Channel => self.channels.len(),
            SubscriptionKind::Pattern => self.patterns.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }

    /// Hands the message to every listener of its channel or pattern without waiting on any of
    /// them. Listeners whose subscription was dropped are forgotten.
    pub(crate) fn deliver(&mut self, message: Message) {
        let (entries, key) = match &message.pattern {
            Some(pattern) => (&mut self.patterns, pattern),
            None => (&mut self.channels, &message.channel),
        };

        let Some(listeners) = entries.get_mut(key) else {
            warn!(
                "dropping message for unknown subscription {:?}",
                String::from_utf8_lossy(key)
            );
            return;
        };

        listeners.retain(|listener| listener.send(message.clone()).is_ok());

        if listeners.is_empty() {
            debug!(
                "no listener left for {:?}, message dropped",
                String::from_utf8_lossy(&message.channel)
            );
        }
    }

    /// Forgets every subscription, ending all subscription streams.
    pub(crate) fn clear(&mut self) {
        self.channels.clear();
        self.patterns.clear();
    }
}
