use tracing::debug;

use crate::frame::Frame;
use crate::pipeline::Responder;
use crate::Error;

/// Tracks a `MULTI` block on a connection.
///
/// The writer side flips `queuing` as `MULTI`, `EXEC` and `DISCARD` go out, so every command
/// written in between is known to be answered with `QUEUED`. The reader side parks the callers
/// of those commands in `deferred`, in queue order, until the `EXEC` reply hands out their
/// real results by position.
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    queuing: bool,
    deferred: Vec<Responder>,
}

impl Transaction {
    pub(crate) fn is_queuing(&self) -> bool {
        self.queuing
    }

    pub(crate) fn begin(&mut self) {
        self.queuing = true;
    }

    pub(crate) fn end(&mut self) {
        self.queuing = false;
    }

    pub(crate) fn defer(&mut self, responder: Responder) {
        self.deferred.push(responder);
    }

    /// Resolves every deferred caller from the `EXEC` reply and returns the result for the
    /// caller of `EXEC` itself.
    pub(crate) fn resolve_exec(&mut self, reply: Frame) -> Result<Frame, Error> {
        let deferred = std::mem::take(&mut self.deferred);

        match reply {
            Frame::Array(results) => {
                if results.len() != deferred.len() {
                    debug!(
                        "EXEC returned {} results for {} queued commands",
                        results.len(),
                        deferred.len()
                    );
                }

                let mut results_iter = results.iter().cloned();
                for responder in deferred {
                    let result = match results_iter.next() {
                        Some(Frame::Error(msg)) => Err(Error::Server(msg)),
                        Some(frame) => Ok(frame),
                        None => Err(Error::Protocol(
                            "EXEC returned fewer results than queued commands".to_string(),
                        )),
                    };
                    let _ = responder.send(result);
                }

                Ok(Frame::Array(results))
            }
            // A watched key was modified, nothing was executed.
            Frame::NullArray | Frame::Null => {
                for responder in deferred {
                    let _ = responder.send(Err(Error::TransactionAborted));
                }
                Err(Error::TransactionAborted)
            }
            // `EXECABORT` after a command was rejected while queuing, or `EXEC` without `MULTI`.
            Frame::Error(msg) => {
                for responder in deferred {
                    let _ = responder.send(Err(Error::Server(msg.clone())));
                }
                Err(Error::Server(msg))
            }
            other => {
                for responder in deferred {
                    let _ = responder.send(Err(Error::UnexpectedReply(other.clone())));
                }
                Err(Error::UnexpectedReply(other))
            }
        }
    }

    /// `DISCARD` was acknowledged, none of the queued commands will run.
    pub(crate) fn resolve_discard(&mut self) {
        for responder in self.deferred.drain(..) {
            let _ = responder.send(Err(Error::TransactionAborted));
        }
    }

    pub(crate) fn fail(&mut self, err: &Error) {
        self.queuing = false;
        for responder in self.deferred.drain(..) {
            let _ = responder.send(Err(err.for_outstanding()));
        }
    }
}
