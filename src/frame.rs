// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::Buf;
use bytes::Bytes;
use std::io::Cursor;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

/// Deepest array nesting accepted in a reply. Scanning and parsing recurse once per level.
pub const MAX_NESTING_DEPTH: usize = 128;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame data type: {0:#04x}")]
    InvalidDataType(u8),
    /// The stream is desynchronized; nothing after this point can be trusted.
    #[error("protocol error; {0}")]
    Malformed(String),
}

impl Error {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Incomplete)
    }
}

/// A single RESP2 value. Null bulk strings and null arrays are distinct values, neither of them is
/// an empty collection.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
    NullArray,
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Frame {
    /// Returns the length in bytes of the next frame in `src`, including its prefix, any nested
    /// elements and every trailing CRLF. Nothing is consumed.
    ///
    /// Returns [`Error::Incomplete`] when `src` does not hold enough bytes yet to tell; callers
    /// keep the buffer and try again once more data arrives.
    pub fn check(src: &[u8]) -> Result<usize, Error> {
        Self::check_nested(src, 0)
    }

    fn check_nested(src: &[u8], depth: usize) -> Result<usize, Error> {
        let first_byte = *src.first().ok_or(Error::Incomplete)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString | DataType::SimpleError | DataType::Integer => {
                let line = find_crlf(&src[1..]).ok_or(Error::Incomplete)?;
                Ok(1 + line + CRLF.len())
            }
            // $<length>\r\n<data>\r\n
            DataType::BulkString => {
                let (length, header) = read_length(src)?;

                // "$-1\r\n" has neither payload nor a closing CRLF.
                if length < 0 {
                    return Ok(header);
                }

                let total = header + length as usize + CRLF.len();
                if src.len() < total {
                    return Err(Error::Incomplete);
                }

                Ok(total)
            }
            // *<number-of-elements>\r\n<element-1>...<element-n>
            DataType::Array => {
                let (length, header) = read_length(src)?;
                if length > 0 {
                    enter_array(depth)?;
                }

                let mut total = header;
                for _ in 0..length.max(0) {
                    total += Self::check_nested(&src[total..], depth + 1)?;
                }

                Ok(total)
            }
        }
    }

    /// Consumes exactly one frame from `src`. Text is not interpreted beyond what the frame type
    /// requires: bulk strings stay raw bytes.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        Self::parse_nested(src, 0)
    }

    fn parse_nested(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Self, Error> {
        // The first byte in an RESP-serialized payload always identifies its type.
        // Subsequent bytes constitute the type's contents.
        let first_byte = get_byte(src)?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString => {
                // Servers echo arbitrary bytes back in status lines, so text is decoded leniently.
                let string = String::from_utf8_lossy(get_line(src)?).into_owned();
                Ok(Frame::Simple(string))
            }
            DataType::SimpleError => {
                let string = String::from_utf8_lossy(get_line(src)?).into_owned();
                Ok(Frame::Error(string))
            }
            DataType::Integer => {
                let integer = parse_decimal(get_line(src)?)?;
                Ok(Frame::Integer(integer))
            }
            DataType::BulkString => {
                let length = parse_decimal(get_line(src)?)?;
                if length < 0 {
                    return Ok(Frame::Null);
                }

                // The payload is binary and may itself contain CRLF, so it is read by length.
                let data = Bytes::copy_from_slice(get_bytes(src, length as usize)?);
                if get_bytes(src, CRLF.len())? != CRLF {
                    return Err(Error::Malformed(
                        "bulk string is not terminated by CRLF".to_string(),
                    ));
                }

                Ok(Frame::Bulk(data))
            }
            DataType::Array => {
                let length = parse_decimal(get_line(src)?)?;
                if length < 0 {
                    return Ok(Frame::NullArray);
                }
                if length > 0 {
                    enter_array(depth)?;
                }

                let capacity = (length as usize).min(src.remaining());
                let mut frames = Vec::with_capacity(capacity);
                for _ in 0..length {
                    let frame = Self::parse_nested(src, depth + 1)?;
                    frames.push(frame);
                }

                Ok(Frame::Array(frames))
            }
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Frame::Simple(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(u8::from(DataType::SimpleString));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Error(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(u8::from(DataType::SimpleError));
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Integer(i) => {
                let digits = i.to_string();
                let mut bytes = Vec::with_capacity(1 + digits.len() + CRLF.len());
                bytes.push(u8::from(DataType::Integer));
                bytes.extend_from_slice(digits.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Frame::Bulk(bytes) => {
                let length_str = bytes.len().to_string();
                let mut result = Vec::with_capacity(
                    1 + length_str.len() + CRLF.len() + bytes.len() + CRLF.len(),
                );
                result.push(u8::from(DataType::BulkString));
                result.extend_from_slice(length_str.as_bytes());
                result.extend_from_slice(CRLF);
                result.extend_from_slice(bytes);
                result.extend_from_slice(CRLF);
                result
            }
            Frame::Null => b"$-1\r\n".to_vec(),
            Frame::Array(arr) => {
                let length_str = arr.len().to_string();
                let mut bytes = Vec::with_capacity(1 + length_str.len() + CRLF.len());
                bytes.push(u8::from(DataType::Array));
                bytes.extend_from_slice(length_str.as_bytes());
                bytes.extend_from_slice(CRLF);
                for frame in arr {
                    bytes.extend(frame.serialize());
                }
                bytes
            }
            Frame::NullArray => b"*-1\r\n".to_vec(),
        }
    }

    /// True for the `+QUEUED` acknowledgement a server sends for each command inside MULTI.
    pub fn is_queued(&self) -> bool {
        matches!(self, Frame::Simple(s) if s == "QUEUED")
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Simple(_) => "simple string",
            Frame::Error(_) => "error",
            Frame::Integer(_) => "integer",
            Frame::Bulk(_) => "bulk string",
            Frame::Null => "null bulk string",
            Frame::Array(_) => "array",
            Frame::NullArray => "null array",
        }
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::Null => write!(f, "$-1"),
            Frame::Array(arr) => {
                write!(f, "*{}", arr.len())?;
                for frame in arr {
                    write!(f, " {}", frame)?;
                }
                Ok(())
            }
            Frame::NullArray => write!(f, "*-1"),
        }
    }
}

fn enter_array(depth: usize) -> Result<(), Error> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(Error::Malformed(format!(
            "arrays nested deeper than {} levels",
            MAX_NESTING_DEPTH
        )));
    }
    Ok(())
}

fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(2).position(|window| window == CRLF)
}

/// Reads the decimal length field of a bulk string or array header. Returns the length and the
/// size of the whole header, prefix and CRLF included.
fn read_length(src: &[u8]) -> Result<(i64, usize), Error> {
    let digits = find_crlf(&src[1..]).ok_or(Error::Incomplete)?;
    let length = parse_decimal(&src[1..1 + digits])?;

    Ok((length, 1 + digits + CRLF.len()))
}

fn parse_decimal(bytes: &[u8]) -> Result<i64, Error> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::Malformed(format!(
                "invalid decimal field {:?}",
                String::from_utf8_lossy(bytes)
            ))
        })
}

fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let buf: &'a [u8] = src.get_ref();
    let start = src.position() as usize;

    let line_end = find_crlf(&buf[start..])
        .map(|index| start + index)
        .ok_or(Error::Incomplete)?;

    src.set_position((line_end + CRLF.len()) as u64);

    Ok(&buf[start..line_end])
}

fn get_bytes<'a>(src: &mut Cursor<&'a [u8]>, count: usize) -> Result<&'a [u8], Error> {
    if src.remaining() < count {
        return Err(Error::Incomplete);
    }

    let buf: &'a [u8] = src.get_ref();
    let start = src.position() as usize;
    src.advance(count);

    Ok(&buf[start..start + count])
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

#[derive(Debug)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    Array,        // '*'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'*' => Ok(Self::Array),
            _ => Err(Error::InvalidDataType(byte)),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::Array => b'*',
        }
    }
}
