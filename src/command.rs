use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error as ThisError;

use crate::frame::Frame;
use crate::reply::CommandError;

/// Character set used to turn text arguments into bytes, and channel names back into text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(ascii_case_insensitive)]
pub enum Charset {
    #[default]
    #[strum(to_string = "utf-8", serialize = "utf8")]
    Utf8,
    #[strum(to_string = "iso-8859-1", serialize = "latin1")]
    Latin1,
    #[strum(to_string = "us-ascii", serialize = "ascii")]
    Ascii,
}

#[derive(Clone, Debug, ThisError, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{charset} cannot encode {character:?} in {text:?}")]
    Unmappable {
        charset: Charset,
        character: char,
        text: String,
    },
}

impl Charset {
    pub fn encode<'a>(&self, text: &'a str) -> Result<Cow<'a, [u8]>, EncodeError> {
        let limit = match self {
            Charset::Utf8 => return Ok(Cow::Borrowed(text.as_bytes())),
            Charset::Ascii if text.is_ascii() => return Ok(Cow::Borrowed(text.as_bytes())),
            Charset::Ascii => 0x7f,
            Charset::Latin1 => 0xff,
        };

        text.chars()
            .map(|c| {
                u8::try_from(u32::from(c))
                    .ok()
                    .filter(|b| u32::from(*b) <= limit)
                    .ok_or_else(|| EncodeError::Unmappable {
                        charset: *self,
                        character: c,
                        text: text.to_string(),
                    })
            })
            .collect::<Result<Vec<u8>, _>>()
            .map(Cow::Owned)
    }

    /// Decodes never fail: bytes the charset cannot map become U+FFFD.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes),
            Charset::Latin1 => Cow::Owned(bytes.iter().map(|b| char::from(*b)).collect()),
            Charset::Ascii if bytes.is_ascii() => String::from_utf8_lossy(bytes),
            Charset::Ascii => Cow::Owned(
                bytes
                    .iter()
                    .map(|b| {
                        if b.is_ascii() {
                            char::from(*b)
                        } else {
                            char::REPLACEMENT_CHARACTER
                        }
                    })
                    .collect(),
            ),
        }
    }
}

/// One component of an outgoing command. Every component is sent as a bulk string.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Bytes(Bytes),
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Sent as the null bulk string `$-1`.
    Null,
}

impl Arg {
    pub(crate) fn to_bytes(&self, charset: Charset) -> Result<Option<Cow<'_, [u8]>>, EncodeError> {
        let bytes = match self {
            Arg::Bytes(bytes) => Cow::Borrowed(&bytes[..]),
            Arg::Str(s) => charset.encode(s)?,
            Arg::Int(i) => Cow::Owned(i.to_string().into_bytes()),
            Arg::UInt(u) => Cow::Owned(u.to_string().into_bytes()),
            Arg::Float(f) => Cow::Owned(f.to_string().into_bytes()),
            Arg::Null => return Ok(None),
        };

        Ok(Some(bytes))
    }

    /// Case-insensitive comparison against a command keyword.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        match self {
            Arg::Str(s) => s.eq_ignore_ascii_case(keyword),
            Arg::Bytes(b) => b.eq_ignore_ascii_case(keyword.as_bytes()),
            _ => false,
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Bytes(b) => write!(f, "{}", b.escape_ascii()),
            Arg::Str(s) => write!(f, "{}", s),
            Arg::Int(i) => write!(f, "{}", i),
            Arg::UInt(u) => write!(f, "{}", u),
            Arg::Float(v) => write!(f, "{}", v),
            Arg::Null => write!(f, "(nil)"),
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Str(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Arg::Str(s.clone())
    }
}

impl From<Bytes> for Arg {
    fn from(b: Bytes) -> Self {
        Arg::Bytes(b)
    }
}

impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Arg::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Arg::Bytes(Bytes::from(b))
    }
}

macro_rules! arg_from_number {
    ($variant:ident as $target:ty: $($t:ty),*) => {
        $(
            impl From<$t> for Arg {
                fn from(n: $t) -> Self {
                    Arg::$variant(<$target>::from(n))
                }
            }
        )*
    };
}

arg_from_number!(Int as i64: i8, i16, i32, i64);
arg_from_number!(UInt as u64: u8, u16, u32, u64);
arg_from_number!(Float as f64: f32, f64);

impl From<usize> for Arg {
    fn from(n: usize) -> Self {
        Arg::UInt(n as u64)
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(value: Option<T>) -> Self {
        value.map_or(Arg::Null, Into::into)
    }
}

/// Turns a reply value into the type a command resolves to. Runs on the caller's task, never on
/// the connection reader.
pub type Converter<T> = Box<dyn FnOnce(Frame) -> Result<T, CommandError> + Send>;

/// A command ready to be submitted: its wire components and the conversion of its reply.
pub struct Command<T> {
    args: Vec<Arg>,
    convert: Converter<T>,
}

impl<T: FromFrame + 'static> Command<T> {
    pub fn new(name: impl Into<Arg>) -> Self {
        Self::with_converter(name, T::from_frame)
    }
}

impl<T> Command<T> {
    pub fn with_converter<F>(name: impl Into<Arg>, convert: F) -> Self
    where
        F: FnOnce(Frame) -> Result<T, CommandError> + Send + 'static,
    {
        Self {
            args: vec![name.into()],
            convert: Box::new(convert),
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The command keyword, always the first component.
    pub fn name(&self) -> &Arg {
        &self.args[0]
    }

    pub fn components(&self) -> &[Arg] {
        &self.args
    }

    pub fn into_parts(self) -> (Vec<Arg>, Converter<T>) {
        (self.args, self.convert)
    }
}

impl<T> fmt::Debug for Command<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command").field("args", &self.args).finish()
    }
}

/// Builds a command that resolves to the raw reply value.
pub fn cmd(name: &str) -> Command<Frame> {
    Command::new(name)
}

/// Conversion from a successful (non-error) reply value.
pub trait FromFrame: Sized + Send {
    fn from_frame(frame: Frame) -> Result<Self, CommandError>;
}

fn unexpected(expected: &str, actual: &Frame) -> CommandError {
    CommandError::Conversion(format!(
        "expected {}, got {}",
        expected,
        actual.type_name()
    ))
}

impl FromFrame for Frame {
    fn from_frame(frame: Frame) -> Result<Self, CommandError> {
        Ok(frame)
    }
}

/// Any reply is accepted; used by commands whose value carries no information (`+OK`).
impl FromFrame for () {
    fn from_frame(_frame: Frame) -> Result<Self, CommandError> {
        Ok(())
    }
}

impl FromFrame for i64 {
    fn from_frame(frame: Frame) -> Result<Self, CommandError> {
        match frame {
            Frame::Integer(i) => Ok(i),
            Frame::Bulk(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| unexpected("integer", &Frame::Bulk(bytes.clone()))),
            Frame::Simple(s) => match s.parse::<i64>() {
                Ok(i) => Ok(i),
                Err(_) => Err(unexpected("integer", &Frame::Simple(s))),
            },
            frame => Err(unexpected("integer", &frame)),
        }
    }
}

impl FromFrame for String {
    fn from_frame(frame: Frame) -> Result<Self, CommandError> {
        match frame {
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|e| CommandError::Conversion(format!("invalid UTF-8 string: {}", e))),
            Frame::Integer(i) => Ok(i.to_string()),
            frame => Err(unexpected("string", &frame)),
        }
    }
}

impl FromFrame for Bytes {
    fn from_frame(frame: Frame) -> Result<Self, CommandError> {
        match frame {
            Frame::Bulk(bytes) => Ok(bytes),
            Frame::Simple(s) => Ok(Bytes::from(s)),
            frame => Err(unexpected("bulk string", &frame)),
        }
    }
}

/// `None` for the null bulk string and the null array.
impl<T: FromFrame> FromFrame for Option<T> {
    fn from_frame(frame: Frame) -> Result<Self, CommandError> {
        match frame {
            Frame::Null | Frame::NullArray => Ok(None),
            frame => T::from_frame(frame).map(Some),
        }
    }
}

impl<T: FromFrame> FromFrame for Vec<T> {
    fn from_frame(frame: Frame) -> Result<Self, CommandError> {
        match frame {
            Frame::Array(frames) => frames.into_iter().map(T::from_frame).collect(),
            frame => Err(unexpected("array", &frame)),
        }
    }
}
