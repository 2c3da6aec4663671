use crate::command::{Arg, Command};
use crate::commands::Keyword;

/// Returns the length of the list stored at key. A key that does not exist is an empty list.
///
/// Ref: <https://redis.io/docs/latest/commands/llen>
#[derive(Debug, PartialEq)]
pub struct Llen {
    pub key: Arg,
}

impl Llen {
    pub fn new(key: impl Into<Arg>) -> Self {
        Self { key: key.into() }
    }
}

impl From<Llen> for Command<i64> {
    fn from(llen: Llen) -> Self {
        Command::new(Keyword::Llen).arg(llen.key)
    }
}
