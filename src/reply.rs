use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};
use thiserror::Error as ThisError;
use tokio::sync::oneshot;

use crate::command::{Converter, EncodeError};
use crate::frame::Frame;

/// An error reply sent by the server, e.g. `-WRONGTYPE Operation against a key holding the wrong
/// kind of value`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerError {
    message: String,
}

impl ServerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error category: the text up to the first space (`ERR`, `WRONGTYPE`, `MOVED`...).
    pub fn prefix(&self) -> &str {
        self.message
            .split_once(' ')
            .map_or(self.message.as_str(), |(prefix, _)| prefix)
    }

    /// The whole error line as sent by the server, prefix included.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ServerError {}

/// Why a command did not resolve to a value. Delivered through the command's [`Reply`].
#[derive(Clone, Debug, ThisError, PartialEq)]
pub enum CommandError {
    #[error("server error; {0}")]
    Server(ServerError),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("write failed; {0}")]
    Write(String),
    #[error("failed to encode command; {0}")]
    Encode(String),
    #[error("unexpected reply; {0}")]
    Conversion(String),
    #[error("invalid usage; {0}")]
    Usage(String),
    #[error("transaction aborted by the server")]
    TransactionAborted,
    #[error("transaction returned {actual} replies for {expected} commands")]
    TransactionMismatch { expected: usize, actual: usize },
}

impl From<EncodeError> for CommandError {
    fn from(err: EncodeError) -> Self {
        CommandError::Encode(err.to_string())
    }
}

impl CommandError {
    pub fn server(message: impl Into<String>) -> Self {
        CommandError::Server(ServerError::new(message))
    }
}

pub type Outcome = Result<Frame, CommandError>;

/// Turns an inbound value into the outcome of the command it answers. Error frames fail it.
pub(crate) fn outcome_of(frame: Frame) -> Outcome {
    match frame {
        Frame::Error(message) => Err(CommandError::server(message)),
        frame => Ok(frame),
    }
}

/// The resolving side of a command. Resolves at most once; later attempts are ignored.
#[derive(Clone)]
pub struct Completion(Arc<Mutex<Option<oneshot::Sender<Outcome>>>>);

impl Completion {
    /// Returns `false` when the command was already resolved.
    pub fn complete(&self, outcome: Outcome) -> bool {
        let sender = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            // The caller may have dropped its reply; that still counts as resolved.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn fail(&self, cause: CommandError) -> bool {
        self.complete(Err(cause))
    }

    pub fn is_completed(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// The awaitable result of a submitted command.
///
/// The reply value is converted when the future is polled, on the caller's task, so slow or
/// failing conversions never hold up the connection.
#[must_use = "replies do nothing unless awaited"]
pub struct Reply<T> {
    rx: oneshot::Receiver<Outcome>,
    convert: Option<Converter<T>>,
}

impl<T> Reply<T> {
    pub(crate) fn pending(convert: Converter<T>) -> (Completion, Self) {
        let (tx, rx) = oneshot::channel();
        let completion = Completion(Arc::new(Mutex::new(Some(tx))));
        let reply = Self {
            rx,
            convert: Some(convert),
        };

        (completion, reply)
    }

    /// A reply that is already failed, for commands rejected before reaching the connection.
    pub(crate) fn failed(cause: CommandError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(cause));

        Self { rx, convert: None }
    }
}

impl<T> Future for Reply<T> {
    type Output = Result<T, CommandError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = ready!(Pin::new(&mut self.rx).poll(cx));

        let frame = match outcome {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => return Poll::Ready(Err(err)),
            // The connection dropped the command without resolving it.
            Err(_) => return Poll::Ready(Err(CommandError::ConnectionClosed)),
        };

        let result = match self.convert.take() {
            Some(convert) => convert(frame),
            None => Err(CommandError::Usage("reply polled after completion".to_string())),
        };

        Poll::Ready(result)
    }
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply").finish_non_exhaustive()
    }
}
