use bytes::BytesMut;
use itertools::{EitherOrBoth, Itertools};
use tracing::error;

use crate::codec::{write_keyword, RespCodec};
use crate::command::{Arg, Command};
use crate::commands::Keyword;
use crate::connection::Request;
use crate::frame::Frame;
use crate::pairing::Pending;
use crate::pubsub::SubscriptionKind;
use crate::reply::{outcome_of, CommandError, Completion, Reply};

/// Collects the commands of a MULTI/EXEC block. Nothing is sent until the closure given to
/// [`Client::transaction`](crate::Client::transaction) returns; the whole block is then written
/// at once.
///
/// Ref: <https://redis.io/docs/latest/develop/interact/transactions/>
pub struct Transaction {
    codec: RespCodec,
    payload: BytesMut,
    members: Vec<Completion>,
}

impl Transaction {
    pub(crate) fn new(codec: RespCodec) -> Self {
        Self {
            codec,
            payload: BytesMut::new(),
            members: Vec::new(),
        }
    }

    /// Queues a command. Its reply resolves once EXEC returns.
    pub fn submit<T>(&mut self, command: Command<T>) -> Reply<T> {
        if let Some(keyword) = forbidden_keyword(command.name()) {
            return Reply::failed(CommandError::Usage(format!(
                "{} is not allowed inside a transaction",
                keyword
            )));
        }

        let (args, convert) = command.into_parts();
        if let Err(err) = self.codec.encode_command(&args, &mut self.payload) {
            return Reply::failed(err.into());
        }

        let (completion, reply) = Reply::pending(convert);
        self.members.push(completion);
        reply
    }

    /// Always fails: transactions do not nest.
    pub fn multi(&mut self) -> Reply<()> {
        Reply::failed(CommandError::Usage(
            "MULTI calls can not be nested".to_string(),
        ))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The MULTI, member and EXEC commands as one write. `None` when nothing was queued.
    pub(crate) fn into_request(self) -> Option<Request> {
        if self.members.is_empty() {
            return None;
        }

        let mut payload = BytesMut::with_capacity(self.payload.len() + 32);
        write_keyword(Keyword::Multi.into(), &mut payload);
        payload.extend_from_slice(&self.payload);
        write_keyword(Keyword::Exec.into(), &mut payload);

        let mut pending = Vec::with_capacity(self.members.len() + 2);
        pending.push(Pending::Begin);
        pending.extend(self.members.iter().cloned().map(Pending::Queued));
        pending.push(Pending::Exec {
            members: self.members,
        });

        Some(Request::new(payload.freeze(), pending))
    }
}

fn forbidden_keyword(name: &Arg) -> Option<&'static str> {
    [Keyword::Multi, Keyword::Exec, Keyword::Discard]
        .into_iter()
        .map(<&'static str>::from)
        .chain(
            [
                SubscriptionKind::Subscribe,
                SubscriptionKind::Unsubscribe,
                SubscriptionKind::PSubscribe,
                SubscriptionKind::PUnsubscribe,
            ]
            .iter()
            .map(SubscriptionKind::keyword),
        )
        .find(|keyword| name.is_keyword(keyword))
}

/// Resolves each member with its element of the EXEC reply, in order. Members already rejected at
/// queue time have no element and are skipped. When EXEC itself fails every member fails with the
/// same cause.
pub(crate) fn fan_out(members: Vec<Completion>, frame: Frame) {
    let replies = match frame {
        Frame::Array(replies) => replies,
        Frame::NullArray => return fail_all(members, CommandError::TransactionAborted),
        Frame::Error(message) => return fail_all(members, CommandError::server(message)),
        frame => {
            return fail_all(
                members,
                CommandError::Conversion(format!(
                    "expected EXEC reply array, got {}",
                    frame.type_name()
                )),
            )
        }
    };

    let members: Vec<Completion> = members
        .into_iter()
        .filter(|member| !member.is_completed())
        .collect();

    let expected = members.len();
    let actual = replies.len();
    if expected != actual {
        error!(expected, actual, "EXEC reply length does not match queued commands");
    }

    for pair in members.into_iter().zip_longest(replies) {
        match pair {
            EitherOrBoth::Both(member, reply) => {
                member.complete(outcome_of(reply));
            }
            EitherOrBoth::Left(member) => {
                member.fail(CommandError::TransactionMismatch { expected, actual });
            }
            EitherOrBoth::Right(_) => {}
        }
    }
}

fn fail_all(members: Vec<Completion>, cause: CommandError) {
    for member in members {
        member.fail(cause.clone());
    }
}
