use std::collections::VecDeque;
use tracing::{debug, error, warn};

use crate::frame::Frame;
use crate::pubsub::{Inbound, Multiplexer, Progress, SubscriptionEvent, SubscriptionRequest};
use crate::reply::{outcome_of, CommandError, Completion};
use crate::transaction;

/// What the connection is waiting for, one entry per command on the wire.
#[derive(Debug)]
pub(crate) enum Pending {
    /// An ordinary command: completed by the next reply.
    Reply(Completion),
    /// A command inside MULTI. The server acknowledges it with `+QUEUED`; its value arrives later
    /// as an element of the EXEC reply.
    Queued(Completion),
    /// The synthetic MULTI of a transaction.
    Begin,
    /// The synthetic EXEC of a transaction, fanning its reply out to the members.
    Exec { members: Vec<Completion> },
    Subscription(SubscriptionRequest),
}

impl Pending {
    fn fail(self, cause: &CommandError) {
        match self {
            Pending::Reply(completion) | Pending::Queued(completion) => {
                completion.fail(cause.clone());
            }
            Pending::Begin => {}
            Pending::Exec { members } => {
                for member in members {
                    member.fail(cause.clone());
                }
            }
            Pending::Subscription(request) => {
                request.completion.fail(cause.clone());
            }
        }
    }
}

/// Matches inbound values to outstanding commands. Replies arrive in the order commands were
/// written, so the head of the queue is always the command being answered.
#[derive(Debug)]
pub(crate) struct PairingEngine {
    pending: VecDeque<Pending>,
    pubsub: Multiplexer,
}

impl PairingEngine {
    pub(crate) fn new(pubsub: Multiplexer) -> Self {
        Self {
            pending: VecDeque::new(),
            pubsub,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Records commands whose bytes were written to the transport.
    pub(crate) fn sent(&mut self, pending: Vec<Pending>) {
        for entry in pending {
            if let Pending::Subscription(request) = &entry {
                self.pubsub.expect(request);
            }
            self.pending.push_back(entry);
        }
        debug!(outstanding = self.pending.len(), "commands sent");
    }

    /// Fails commands whose write did not go through. They never join the queue.
    pub(crate) fn fail(pending: Vec<Pending>, cause: &CommandError) {
        for entry in pending {
            entry.fail(cause);
        }
    }

    pub(crate) fn receive(&mut self, frame: Frame) {
        match self.pubsub.classify(frame) {
            Inbound::Message(message) => self.pubsub.publish(message),
            Inbound::SubscriptionChange(event) => self.subscription_event(event),
            Inbound::Reply(frame) => self.reply(frame),
        }
    }

    fn subscription_event(&mut self, event: SubscriptionEvent) {
        let request = match self.pending.front() {
            Some(Pending::Subscription(request)) if request.kind == event.kind => request,
            head => {
                error!(
                    kind = %event.kind,
                    topic = ?event.topic,
                    head = ?head,
                    "subscription event does not match the oldest outstanding command; dropping it"
                );
                return;
            }
        };

        if let Progress::Satisfied { active } = self.pubsub.confirm(&event, request) {
            if let Some(Pending::Subscription(request)) = self.pending.pop_front() {
                request.completion.complete(Ok(Frame::Integer(active)));
            }
        }
    }

    fn reply(&mut self, frame: Frame) {
        let Some(head) = self.pending.pop_front() else {
            error!(reply = %frame, "reply arrived with no outstanding command; dropping it");
            return;
        };

        match head {
            Pending::Reply(completion) => {
                completion.complete(outcome_of(frame));
            }
            Pending::Queued(completion) => {
                // A command rejected at queue time fails right away and gets no element of the
                // EXEC reply.
                if let Frame::Error(message) = frame {
                    completion.fail(CommandError::server(message));
                } else if !frame.is_queued() {
                    warn!(reply = %frame, "unexpected acknowledgement for a queued command");
                }
            }
            Pending::Begin => {
                if let Frame::Error(message) = frame {
                    error!(%message, "MULTI failed");
                }
            }
            Pending::Exec { members } => transaction::fan_out(members, frame),
            Pending::Subscription(request) => {
                self.pubsub.abandon(request.kind);
                request.completion.complete(outcome_of(frame).and_then(|frame| {
                    Err(CommandError::Conversion(format!(
                        "expected {} confirmation, got {}",
                        request.kind,
                        frame.type_name()
                    )))
                }));
            }
        }
    }

    /// Fails every outstanding command and forgets all subscription expectations.
    pub(crate) fn connection_closed(&mut self) {
        let outstanding = self.pending.len();
        for entry in self.pending.drain(..) {
            entry.fail(&CommandError::ConnectionClosed);
        }
        self.pubsub.reset();

        if outstanding > 0 {
            debug!(outstanding, "failed outstanding commands on close");
        }
    }
}
