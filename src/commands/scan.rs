use bytes::Bytes;

use crate::command::{Command, FromFrame};
use crate::commands::Keyword;
use crate::frame::Frame;
use crate::reply::CommandError;

/// The SCAN command is used in order to incrementally iterate over a collection of elements.
///
/// Ref: <https://redis.io/docs/latest/commands/scan>
#[derive(Debug, PartialEq)]
pub struct Scan {
    pub cursor: Bytes,
    pub pattern: Option<String>,
    pub count: Option<u64>,
    pub type_: Option<String>,
}

impl Scan {
    /// An iteration starts, and ends, at cursor `0`.
    pub const START: &'static [u8] = b"0";

    pub fn new(cursor: impl Into<Bytes>) -> Self {
        Self {
            cursor: cursor.into(),
            pattern: None,
            count: None,
            type_: None,
        }
    }

    pub fn start() -> Self {
        Self::new(Bytes::from_static(Self::START))
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn type_(mut self, type_: impl Into<String>) -> Self {
        self.type_ = Some(type_.into());
        self
    }
}

impl From<Scan> for Command<ScanResponse> {
    fn from(scan: Scan) -> Self {
        let mut command = Command::new(Keyword::Scan).arg(scan.cursor);

        if let Some(pattern) = scan.pattern {
            command = command.arg(Keyword::Match).arg(pattern);
        }
        if let Some(count) = scan.count {
            command = command.arg(Keyword::Count).arg(count);
        }
        if let Some(type_) = scan.type_ {
            command = command.arg(Keyword::Type).arg(type_);
        }

        command
    }
}

/// One page of a SCAN iteration: the cursor to continue from and the keys found.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResponse {
    pub cursor: Bytes,
    pub keys: Vec<Bytes>,
}

impl ScanResponse {
    pub fn is_last(&self) -> bool {
        self.cursor == Scan::START
    }
}

impl FromFrame for ScanResponse {
    fn from_frame(frame: Frame) -> Result<Self, CommandError> {
        let parts = match frame {
            Frame::Array(parts) => parts,
            frame => {
                return Err(CommandError::Conversion(format!(
                    "expected SCAN reply array, got {}",
                    frame.type_name()
                )))
            }
        };

        let [cursor, keys]: [Frame; 2] = parts.try_into().map_err(|parts: Vec<Frame>| {
            CommandError::Conversion(format!(
                "expected cursor and keys, got {} elements",
                parts.len()
            ))
        })?;

        Ok(Self {
            cursor: Bytes::from_frame(cursor)?,
            keys: Vec::<Bytes>::from_frame(keys)?,
        })
    }
}
