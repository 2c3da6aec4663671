use bytes::Bytes;

use crate::command::Command;
use crate::commands::Keyword;

/// Returns PONG if no argument is provided, otherwise return a copy of the argument as a bulk.
///
/// Ref: <https://redis.io/docs/latest/commands/ping>
#[derive(Debug, Default, PartialEq)]
pub struct Ping {
    pub payload: Option<Bytes>,
}

impl Ping {
    pub fn new(payload: Option<Bytes>) -> Self {
        Self { payload }
    }
}

impl From<Ping> for Command<Bytes> {
    fn from(ping: Ping) -> Self {
        let command = Command::new(Keyword::Ping);

        match ping.payload {
            Some(payload) => command.arg(payload),
            None => command,
        }
    }
}
