use crate::command::{Arg, Command};
use crate::commands::Keyword;

#[derive(Debug, PartialEq)]
pub enum Memory {
    Usage(Usage),
}

/// Ref: <https://redis.io/docs/latest/commands/memory-usage>
///
/// The MEMORY USAGE command reports the number of bytes that a key and its value require to be
/// stored in RAM. Resolves to `None` when the key does not exist.
#[derive(Debug, PartialEq)]
pub struct Usage {
    pub key: Arg,
    pub samples: Option<u64>,
}

impl Memory {
    pub fn usage(key: impl Into<Arg>) -> Self {
        Self::Usage(Usage {
            key: key.into(),
            samples: None,
        })
    }
}

impl Usage {
    pub fn samples(mut self, samples: u64) -> Self {
        self.samples = Some(samples);
        self
    }
}

impl From<Memory> for Command<Option<i64>> {
    fn from(memory: Memory) -> Self {
        match memory {
            Memory::Usage(usage) => usage.into(),
        }
    }
}

impl From<Usage> for Command<Option<i64>> {
    fn from(usage: Usage) -> Self {
        let command = Command::new(Keyword::Memory)
            .arg(Keyword::Usage)
            .arg(usage.key);

        match usage.samples {
            Some(samples) => command.arg(Keyword::Samples).arg(samples),
            None => command,
        }
    }
}
