use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::time::{sleep, Sleep};
use tracing::{debug, warn};

use crate::command::Command;
use crate::config::ProtocolVersion;
use crate::connection::ConnectionState;
use crate::frame::Frame;
use crate::pubsub::{Listener, PubSubFrame, Registry, SubscriptionKind};
use crate::transaction::Transaction;
use crate::Error;

pub(crate) type Responder = oneshot::Sender<Result<Frame, Error>>;

/// How the reply, or replies, to a written command are interpreted.
#[derive(Debug)]
pub(crate) enum ReplyKind {
    Direct,
    /// `MULTI` opening a transaction; an error reply closes it again.
    Multi,
    /// Written inside `MULTI`; the reply is a `QUEUED` acknowledgment.
    Queued,
    Exec,
    Discard,
    /// `RESET` drops subscriptions and any open transaction, and switches back to RESP2.
    Reset,
    /// One acknowledgment arrives per channel or pattern.
    Subscribe {
        kind: SubscriptionKind,
        remaining: usize,
        listener: Option<Listener>,
        acks: Vec<Frame>,
    },
    /// Without explicit names the server acknowledges every subscription it drops, or a single
    /// null one when there was nothing to drop.
    Unsubscribe {
        kind: SubscriptionKind,
        remaining: Option<usize>,
        acks: Vec<Frame>,
    },
}

/// A submitted command that has not been answered yet.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    responder: Responder,
    kind: ReplyKind,
    // Frees a pipeline slot once the reply has been read.
    _permit: Option<OwnedSemaphorePermit>,
}

impl PendingRequest {
    fn resolve(self, result: Result<Frame, Error>) {
        // The slot is free before the caller wakes up and possibly submits again.
        drop(self._permit);
        // The caller may have timed out or given up; the reply is still consumed.
        let _ = self.responder.send(result);
    }
}

/// A command travelling from a caller to the writer task.
#[derive(Debug)]
pub(crate) struct Request {
    pub(crate) command: Command,
    pub(crate) responder: Responder,
    pub(crate) listener: Option<Listener>,
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

/// The FIFO of pending requests together with the protocol state that decides how replies are
/// routed. Replies carry no correlation id, so the Nth reply read belongs to the Nth command
/// written.
#[derive(Debug)]
pub(crate) struct Pipeline {
    queue: VecDeque<PendingRequest>,
    protocol: ProtocolVersion,
    registry: Registry,
    transaction: Transaction,
    subscribes_in_flight: usize,
}

impl Pipeline {
    pub(crate) fn new(protocol: ProtocolVersion) -> Self {
        Self {
            queue: VecDeque::new(),
            protocol,
            registry: Registry::default(),
            transaction: Transaction::default(),
            subscribes_in_flight: 0,
        }
    }

    /// Number of requests still waiting for a reply.
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether the connection has, or is about to have, active subscriptions.
    pub(crate) fn is_subscribed(&self) -> bool {
        self.subscribes_in_flight > 0 || !self.registry.is_empty()
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.transaction.is_queuing()
    }

    pub(crate) fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Registers the request as pending, right before its command is written. Returns the
    /// command to write, or `None` when the request was rejected and already answered.
    pub(crate) fn admit(&mut self, request: Request) -> Option<Command> {
        let Request {
            command,
            responder,
            listener,
            permit,
        } = request;

        if self.protocol == ProtocolVersion::Resp2
            && self.is_subscribed()
            && !command.allowed_in_subscribed_mode()
        {
            let _ = responder.send(Err(Error::NotReady {
                state: ConnectionState::Subscribed,
                command: command.name(),
            }));
            return None;
        }

        let kind = self.reply_kind(&command, listener);
        debug!(?kind, "writing {}", command);

        self.queue.push_back(PendingRequest {
            responder,
            kind,
            _permit: permit,
        });

        Some(command)
    }

    fn reply_kind(&mut self, command: &Command, listener: Option<Listener>) -> ReplyKind {
        if command.is("MULTI") {
            // A nested MULTI is refused without touching the open transaction.
            if self.transaction.is_queuing() {
                return ReplyKind::Direct;
            }
            self.transaction.begin();
            return ReplyKind::Multi;
        }
        if command.is("EXEC") {
            self.transaction.end();
            return ReplyKind::Exec;
        }
        if command.is("DISCARD") {
            self.transaction.end();
            return ReplyKind::Discard;
        }
        // Runs right away even inside MULTI.
        if command.is("RESET") {
            self.transaction.end();
            return ReplyKind::Reset;
        }
        if self.transaction.is_queuing() && !command.is("WATCH") {
            return ReplyKind::Queued;
        }

        let kind = SubscriptionKind::of_command(&command.name());
        let names = command.params().len();

        if command.is_subscribe() {
            self.subscribes_in_flight += 1;
            ReplyKind::Subscribe {
                kind,
                remaining: names,
                listener,
                acks: Vec::with_capacity(names),
            }
        } else if command.is_unsubscribe() {
            ReplyKind::Unsubscribe {
                kind,
                remaining: (names > 0).then_some(names),
                acks: Vec::new(),
            }
        } else {
            ReplyKind::Direct
        }
    }

    /// Routes one inbound frame: pub/sub messages go to listeners, anything else answers the
    /// oldest pending request. An error means the stream can no longer be trusted.
    pub(crate) fn dispatch(&mut self, frame: Frame) -> Result<(), Error> {
        let is_push = matches!(frame, Frame::Push(_));

        // RESP3 sends every pub/sub frame as a push, so plain arrays are always replies there.
        let sniff = is_push || (self.protocol == ProtocolVersion::Resp2 && self.is_subscribed());
        let pubsub = if sniff { PubSubFrame::parse(&frame) } else { None };

        let pubsub = match pubsub {
            Some(PubSubFrame::Message(message)) => {
                self.registry.deliver(message);
                return Ok(());
            }
            other => other,
        };

        let expects_ack = matches!(
            self.queue.front().map(|pending| &pending.kind),
            Some(ReplyKind::Subscribe { .. } | ReplyKind::Unsubscribe { .. })
        );

        if is_push && !(expects_ack && pubsub.is_some()) {
            warn!("dropping unsolicited push frame {}", frame);
            return Ok(());
        }

        let pending = self
            .queue
            .pop_front()
            .ok_or_else(|| Error::Protocol(format!("unexpected reply {}", frame)))?;

        self.complete(pending, frame, pubsub);

        Ok(())
    }

    fn complete(&mut self, mut pending: PendingRequest, frame: Frame, pubsub: Option<PubSubFrame>) {
        match &mut pending.kind {
            ReplyKind::Direct => pending.resolve(into_result(frame)),
            ReplyKind::Multi => {
                let later_multi = self
                    .queue
                    .iter()
                    .any(|queued| matches!(queued.kind, ReplyKind::Multi));
                if matches!(frame, Frame::Error(_)) && !later_multi {
                    self.transaction.end();
                }
                pending.resolve(into_result(frame));
            }
            ReplyKind::Queued => match frame {
                Frame::Simple(s) if s.eq_ignore_ascii_case("QUEUED") => {
                    self.transaction.defer(pending.responder);
                }
                frame => pending.resolve(into_result(frame)),
            },
            ReplyKind::Exec => {
                let result = self.transaction.resolve_exec(frame);
                pending.resolve(result);
            }
            ReplyKind::Discard => {
                self.transaction.resolve_discard();
                pending.resolve(into_result(frame));
            }
            ReplyKind::Reset => {
                if !matches!(frame, Frame::Error(_)) {
                    self.reset();
                }
                pending.resolve(into_result(frame));
            }
            ReplyKind::Subscribe {
                kind,
                remaining,
                listener,
                acks,
            } => {
                // Anything else than an acknowledgment, typically an error, ends the request.
                let pubsub = pubsub.or_else(|| PubSubFrame::parse(&frame));
                let name = match pubsub {
                    Some(PubSubFrame::Subscribed { kind: acked, name }) if acked == *kind => name,
                    _ => {
                        self.subscribes_in_flight -= 1;
                        pending.resolve(into_result(frame));
                        return;
                    }
                };

                self.registry.add(*kind, name, listener.clone());
                acks.push(frame);
                *remaining = remaining.saturating_sub(1);

                if *remaining == 0 {
                    self.subscribes_in_flight -= 1;
                    let acks = std::mem::take(acks);
                    pending.resolve(Ok(Frame::Array(acks)));
                } else {
                    self.queue.push_front(pending);
                }
            }
            ReplyKind::Unsubscribe {
                kind,
                remaining,
                acks,
            } => {
                let pubsub = pubsub.or_else(|| PubSubFrame::parse(&frame));
                let name = match pubsub {
                    Some(PubSubFrame::Unsubscribed { kind: acked, name }) if acked == *kind => name,
                    _ => {
                        pending.resolve(into_result(frame));
                        return;
                    }
                };

                if let Some(name) = name {
                    self.registry.remove(*kind, &name);
                }
                acks.push(frame);

                let done = match remaining {
                    Some(remaining) => {
                        *remaining = remaining.saturating_sub(1);
                        *remaining == 0
                    }
                    None => self.registry.len(*kind) == 0,
                };

                if done {
                    let acks = std::mem::take(acks);
                    pending.resolve(Ok(Frame::Array(acks)));
                } else {
                    self.queue.push_front(pending);
                }
            }
        }
    }

    /// Mirrors a `RESET` the server acknowledged. Only requests written after it are left in the
    /// queue, so the subscribes among them are the ones still in flight.
    fn reset(&mut self) {
        debug!("connection reset, dropping subscriptions and transaction");
        self.registry.clear();
        self.subscribes_in_flight = self
            .queue
            .iter()
            .filter(|pending| matches!(pending.kind, ReplyKind::Subscribe { .. }))
            .count();
        self.transaction.resolve_discard();
        self.protocol = ProtocolVersion::Resp2;
    }

    /// Fails everything still waiting for a reply. Subscriptions are dropped as well, which
    /// ends their streams.
    pub(crate) fn fail_all(&mut self, err: &Error) {
        for pending in self.queue.drain(..) {
            pending.resolve(Err(err.for_outstanding()));
        }
        self.transaction.fail(err);
        self.registry.clear();
        self.subscribes_in_flight = 0;
    }
}

fn into_result(frame: Frame) -> Result<Frame, Error> {
    match frame {
        Frame::Error(msg) => Err(Error::Server(msg)),
        frame => Ok(frame),
    }
}

/// The eventual reply to a submitted command.
///
/// The command is already queued for writing when this future is created; polling it only waits
/// for the reply. Dropping it, or letting it time out, does not take the command back: its reply
/// is still read off the stream and discarded so later replies stay aligned.
#[must_use = "the reply is lost unless the future is awaited"]
#[derive(Debug)]
pub struct ResponseFuture {
    state: ResponseState,
}

#[derive(Debug)]
enum ResponseState {
    Failed(Option<Error>),
    Waiting {
        rx: oneshot::Receiver<Result<Frame, Error>>,
        timeout: Option<(Duration, Pin<Box<Sleep>>)>,
    },
}

impl ResponseFuture {
    pub(crate) fn new(
        rx: oneshot::Receiver<Result<Frame, Error>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            state: ResponseState::Waiting {
                rx,
                timeout: timeout.map(|duration| (duration, Box::pin(sleep(duration)))),
            },
        }
    }

    pub(crate) fn failed(err: Error) -> Self {
        Self {
            state: ResponseState::Failed(Some(err)),
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Frame, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ResponseState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or_else(|| {
                Error::ConnectionLost("reply already taken".to_string())
            }))),
            ResponseState::Waiting { rx, timeout } => {
                if let Poll::Ready(result) = Pin::new(rx).poll(cx) {
                    return Poll::Ready(result.unwrap_or_else(|_| {
                        Err(Error::ConnectionLost(
                            "connection closed before the reply arrived".to_string(),
                        ))
                    }));
                }

                if let Some((duration, sleep)) = timeout {
                    if sleep.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(Error::Timeout(*duration)));
                    }
                }

                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn submit(
        pipeline: &mut Pipeline,
        command: Command,
    ) -> (Option<Command>, oneshot::Receiver<Result<Frame, Error>>) {
        submit_with_listener(pipeline, command, None)
    }

    fn submit_with_listener(
        pipeline: &mut Pipeline,
        command: Command,
        listener: Option<Listener>,
    ) -> (Option<Command>, oneshot::Receiver<Result<Frame, Error>>) {
        let (responder, rx) = oneshot::channel();
        let written = pipeline.admit(Request {
            command,
            responder,
            listener,
            permit: None,
        });
        (written, rx)
    }

    fn bulk_array(parts: &[&str]) -> Frame {
        Frame::Array(
            parts
                .iter()
                .map(|part| Frame::Bulk(Bytes::copy_from_slice(part.as_bytes())))
                .collect(),
        )
    }

    fn ack(kind: &str, name: &str, count: i64) -> Frame {
        Frame::Array(vec![
            Frame::Bulk(Bytes::copy_from_slice(kind.as_bytes())),
            Frame::Bulk(Bytes::copy_from_slice(name.as_bytes())),
            Frame::Integer(count),
        ])
    }

    #[test]
    fn replies_are_matched_in_submission_order() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);
        let (_, mut first) = submit(&mut pipeline, Command::new("GET").arg("a"));
        let (_, mut second) = submit(&mut pipeline, Command::new("GET").arg("b"));
        let (_, mut third) = submit(&mut pipeline, Command::new("INCR").arg("c"));

        pipeline.dispatch(Frame::Bulk(Bytes::from("1"))).unwrap();
        pipeline.dispatch(Frame::NullBulk).unwrap();
        pipeline
            .dispatch(Frame::Error("ERR value is not an integer".to_string()))
            .unwrap();

        assert_eq!(first.try_recv().unwrap().unwrap(), Frame::Bulk(Bytes::from("1")));
        assert_eq!(second.try_recv().unwrap().unwrap(), Frame::NullBulk);
        assert!(matches!(third.try_recv().unwrap(), Err(Error::Server(_))));
        assert!(pipeline.is_empty());
    }

    #[test]
    fn abandoned_requests_still_consume_their_reply() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);
        let (_, slow) = submit(&mut pipeline, Command::new("DEBUG").arg("SLEEP").arg(1));
        let (_, mut fast) = submit(&mut pipeline, Command::new("PING"));
        drop(slow);

        pipeline.dispatch(Frame::Simple("OK".to_string())).unwrap();
        pipeline.dispatch(Frame::Simple("PONG".to_string())).unwrap();

        assert_eq!(
            fast.try_recv().unwrap().unwrap(),
            Frame::Simple("PONG".to_string())
        );
    }

    #[test]
    fn reply_without_request_is_a_protocol_error() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);

        let result = pipeline.dispatch(Frame::Simple("OK".to_string()));

        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn messages_bypass_the_queue_while_subscribed() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);
        let (listener, mut messages) = mpsc::unbounded_channel();

        let (_, mut subscribed) = submit_with_listener(
            &mut pipeline,
            Command::new("SUBSCRIBE").arg("foo"),
            Some(listener),
        );
        assert!(pipeline.is_subscribed());

        pipeline.dispatch(ack("subscribe", "foo", 1)).unwrap();
        assert!(subscribed.try_recv().unwrap().is_ok());

        let (_, mut ping) = submit(&mut pipeline, Command::new("PING"));
        pipeline
            .dispatch(bulk_array(&["message", "foo", "hello"]))
            .unwrap();

        assert_eq!(messages.try_recv().unwrap().payload, Bytes::from("hello"));
        assert!(ping.try_recv().is_err());

        pipeline.dispatch(bulk_array(&["pong", ""])).unwrap();
        assert_eq!(ping.try_recv().unwrap().unwrap(), bulk_array(&["pong", ""]));
    }

    #[test]
    fn resp2_subscribed_mode_rejects_regular_commands() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);
        let (listener, _messages) = mpsc::unbounded_channel();
        submit_with_listener(
            &mut pipeline,
            Command::new("SUBSCRIBE").arg("foo"),
            Some(listener),
        );

        let (written, mut get) = submit(&mut pipeline, Command::new("GET").arg("k"));

        assert!(written.is_none());
        assert!(matches!(get.try_recv().unwrap(), Err(Error::NotReady { .. })));
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn resp3_allows_regular_commands_while_subscribed() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp3);
        let (listener, _messages) = mpsc::unbounded_channel();
        submit_with_listener(
            &mut pipeline,
            Command::new("SUBSCRIBE").arg("foo"),
            Some(listener),
        );

        let (written, _get) = submit(&mut pipeline, Command::new("GET").arg("k"));

        assert!(written.is_some());
    }

    #[test]
    fn subscribe_waits_for_every_acknowledgment() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);
        let (listener, _messages) = mpsc::unbounded_channel();
        let (_, mut subscribed) = submit_with_listener(
            &mut pipeline,
            Command::new("SUBSCRIBE").arg("a").arg("b"),
            Some(listener),
        );

        pipeline.dispatch(ack("subscribe", "a", 1)).unwrap();
        assert!(subscribed.try_recv().is_err());

        pipeline.dispatch(ack("subscribe", "b", 2)).unwrap();
        assert_eq!(
            subscribed.try_recv().unwrap().unwrap(),
            Frame::Array(vec![ack("subscribe", "a", 1), ack("subscribe", "b", 2)])
        );
    }

    #[test]
    fn unsubscribe_all_returns_to_ready() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);
        let (listener, mut messages) = mpsc::unbounded_channel();
        submit_with_listener(
            &mut pipeline,
            Command::new("SUBSCRIBE").arg("a").arg("b"),
            Some(listener),
        );
        pipeline.dispatch(ack("subscribe", "a", 1)).unwrap();
        pipeline.dispatch(ack("subscribe", "b", 2)).unwrap();

        let (_, mut unsubscribed) = submit(&mut pipeline, Command::new("UNSUBSCRIBE"));
        pipeline.dispatch(ack("unsubscribe", "b", 1)).unwrap();
        assert!(unsubscribed.try_recv().is_err());
        assert!(pipeline.is_subscribed());

        pipeline.dispatch(ack("unsubscribe", "a", 0)).unwrap();
        assert!(unsubscribed.try_recv().unwrap().is_ok());
        assert!(!pipeline.is_subscribed());
        assert_eq!(
            messages.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );

        // Ordinary commands are accepted again.
        let (written, _) = submit(&mut pipeline, Command::new("GET").arg("k"));
        assert!(written.is_some());
    }

    #[test]
    fn unsolicited_pushes_are_dropped() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp3);
        let (_, mut get) = submit(&mut pipeline, Command::new("GET").arg("k"));

        pipeline
            .dispatch(Frame::Push(vec![
                Frame::Bulk(Bytes::from("invalidate")),
                Frame::Array(vec![Frame::Bulk(Bytes::from("k"))]),
            ]))
            .unwrap();
        assert!(get.try_recv().is_err());

        pipeline.dispatch(Frame::Bulk(Bytes::from("v"))).unwrap();
        assert_eq!(get.try_recv().unwrap().unwrap(), Frame::Bulk(Bytes::from("v")));
    }

    #[test]
    fn transaction_results_arrive_with_exec() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);
        let (_, mut multi) = submit(&mut pipeline, Command::new("MULTI"));
        let (_, mut set) = submit(&mut pipeline, Command::new("SET").arg("a").arg(1));
        let (_, mut incr) = submit(&mut pipeline, Command::new("INCR").arg("a"));
        assert!(pipeline.in_transaction());
        let (_, mut exec) = submit(&mut pipeline, Command::new("EXEC"));
        assert!(!pipeline.in_transaction());

        pipeline.dispatch(Frame::Simple("OK".to_string())).unwrap();
        pipeline.dispatch(Frame::Simple("QUEUED".to_string())).unwrap();
        pipeline.dispatch(Frame::Simple("QUEUED".to_string())).unwrap();

        assert!(multi.try_recv().unwrap().is_ok());
        assert!(set.try_recv().is_err());
        assert!(incr.try_recv().is_err());

        pipeline
            .dispatch(Frame::Array(vec![
                Frame::Simple("OK".to_string()),
                Frame::Integer(2),
            ]))
            .unwrap();

        assert_eq!(set.try_recv().unwrap().unwrap(), Frame::Simple("OK".to_string()));
        assert_eq!(incr.try_recv().unwrap().unwrap(), Frame::Integer(2));
        assert!(exec.try_recv().unwrap().is_ok());
    }

    #[test]
    fn command_rejected_while_queuing_fails_alone() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);
        submit(&mut pipeline, Command::new("MULTI"));
        let (_, mut bad) = submit(&mut pipeline, Command::new("NOPE"));
        let (_, mut exec) = submit(&mut pipeline, Command::new("EXEC"));

        pipeline.dispatch(Frame::Simple("OK".to_string())).unwrap();
        pipeline
            .dispatch(Frame::Error("ERR unknown command 'NOPE'".to_string()))
            .unwrap();
        assert!(matches!(bad.try_recv().unwrap(), Err(Error::Server(_))));

        pipeline
            .dispatch(Frame::Error(
                "EXECABORT Transaction discarded because of previous errors.".to_string(),
            ))
            .unwrap();
        let err = exec.try_recv().unwrap().unwrap_err();
        assert_eq!(err.server_code(), Some("EXECABORT"));
    }

    #[test]
    fn failed_multi_closes_the_transaction() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);
        let (_, mut multi) = submit(&mut pipeline, Command::new("MULTI"));
        assert!(pipeline.in_transaction());

        pipeline
            .dispatch(Frame::Error("NOAUTH Authentication required.".to_string()))
            .unwrap();

        assert!(matches!(multi.try_recv().unwrap(), Err(Error::Server(_))));
        assert!(!pipeline.in_transaction());
    }

    #[test]
    fn nested_multi_keeps_the_transaction_open() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);
        submit(&mut pipeline, Command::new("MULTI"));
        pipeline.dispatch(Frame::Simple("OK".to_string())).unwrap();

        let (_, mut nested) = submit(&mut pipeline, Command::new("MULTI"));
        pipeline
            .dispatch(Frame::Error("ERR MULTI calls can not be nested".to_string()))
            .unwrap();

        assert!(matches!(nested.try_recv().unwrap(), Err(Error::Server(_))));
        assert!(pipeline.in_transaction());
    }

    #[test]
    fn reset_drops_subscriptions() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);
        let (listener, mut messages) = mpsc::unbounded_channel();
        submit_with_listener(
            &mut pipeline,
            Command::new("SUBSCRIBE").arg("foo"),
            Some(listener),
        );
        pipeline.dispatch(ack("subscribe", "foo", 1)).unwrap();

        let (written, mut reset) = submit(&mut pipeline, Command::new("RESET"));
        assert!(written.is_some());
        pipeline.dispatch(Frame::Simple("RESET".to_string())).unwrap();

        assert_eq!(reset.try_recv().unwrap().unwrap(), Frame::Simple("RESET".to_string()));
        assert!(!pipeline.is_subscribed());
        assert_eq!(
            messages.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        );

        let (written, _) = submit(&mut pipeline, Command::new("GET").arg("k"));
        assert!(written.is_some());
    }

    #[test]
    fn reset_keeps_subscribes_written_after_it() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp3);
        submit(&mut pipeline, Command::new("RESET"));
        let (listener, _messages) = mpsc::unbounded_channel();
        submit_with_listener(
            &mut pipeline,
            Command::new("SUBSCRIBE").arg("bar"),
            Some(listener),
        );

        pipeline.dispatch(Frame::Simple("RESET".to_string())).unwrap();

        assert!(pipeline.is_subscribed());
        assert_eq!(pipeline.protocol(), ProtocolVersion::Resp2);
    }

    #[test]
    fn reset_aborts_the_open_transaction() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);
        submit(&mut pipeline, Command::new("MULTI"));
        let (_, mut set) = submit(&mut pipeline, Command::new("SET").arg("a").arg(1));
        let (_, mut reset) = submit(&mut pipeline, Command::new("RESET"));
        assert!(!pipeline.in_transaction());
        let (_, mut get) = submit(&mut pipeline, Command::new("GET").arg("a"));

        pipeline.dispatch(Frame::Simple("OK".to_string())).unwrap();
        pipeline.dispatch(Frame::Simple("QUEUED".to_string())).unwrap();
        pipeline.dispatch(Frame::Simple("RESET".to_string())).unwrap();
        pipeline.dispatch(Frame::NullBulk).unwrap();

        assert!(matches!(set.try_recv().unwrap(), Err(Error::TransactionAborted)));
        assert!(reset.try_recv().unwrap().is_ok());
        assert_eq!(get.try_recv().unwrap().unwrap(), Frame::NullBulk);
    }

    #[test]
    fn fail_all_reaches_every_caller() {
        let mut pipeline = Pipeline::new(ProtocolVersion::Resp2);
        submit(&mut pipeline, Command::new("MULTI"));
        let (_, mut queued) = submit(&mut pipeline, Command::new("SET").arg("a").arg(1));
        pipeline.dispatch(Frame::Simple("OK".to_string())).unwrap();
        pipeline.dispatch(Frame::Simple("QUEUED".to_string())).unwrap();
        let (_, mut waiting) = submit(&mut pipeline, Command::new("GET").arg("a"));

        pipeline.fail_all(&Error::ConnectionLost("reset by peer".to_string()));

        assert!(matches!(queued.try_recv().unwrap(), Err(Error::ConnectionLost(_))));
        assert!(matches!(waiting.try_recv().unwrap(), Err(Error::ConnectionLost(_))));
        assert!(pipeline.is_empty());
        assert!(!pipeline.in_transaction());
    }

    #[tokio::test(start_paused = true)]
    async fn response_future_times_out() {
        let (_responder, rx) = oneshot::channel();
        let response = ResponseFuture::new(rx, Some(Duration::from_millis(50)));

        let result = response.await;

        assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn response_future_reports_closed_connections() {
        let (responder, rx) = oneshot::channel::<Result<Frame, Error>>();
        drop(responder);

        let result = ResponseFuture::new(rx, None).await;

        assert!(matches!(result, Err(Error::ConnectionLost(_))));
    }
}
