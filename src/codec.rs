use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::env;
use std::io::{self, Cursor};
use thiserror::Error as ThisError;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{error, trace};

use crate::command::{Arg, Charset, EncodeError};
use crate::frame::{self, Frame};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

#[derive(Debug, ThisError)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] frame::Error),
    #[error("frame size exceeds limit; buffered {size} bytes, limit is {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// RESP codec for the client side of a connection: decodes reply frames, encodes commands as
/// arrays of bulk strings.
#[derive(Clone, Debug)]
pub struct RespCodec {
    charset: Charset,
    max_frame_size: usize,
}

impl Default for RespCodec {
    fn default() -> Self {
        Self::new(Charset::default())
    }
}

impl RespCodec {
    pub fn new(charset: Charset) -> Self {
        Self {
            charset,
            max_frame_size: Self::max_frame_size_from_env(),
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    fn max_frame_size_from_env() -> usize {
        env::var("MAX_FRAME_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Appends `*<n>\r\n` followed by one bulk string per component. Nothing is written when any
    /// component cannot be encoded.
    pub fn encode_command(&self, args: &[Arg], dst: &mut BytesMut) -> Result<(), EncodeError> {
        let parts = args
            .iter()
            .map(|arg| arg.to_bytes(self.charset))
            .collect::<Result<Vec<_>, _>>()?;

        write_array(&parts, dst);
        Ok(())
    }

    pub fn encode_to_bytes(&self, args: &[Arg]) -> Result<Bytes, EncodeError> {
        let mut dst = BytesMut::new();
        self.encode_command(args, &mut dst)?;
        Ok(dst.freeze())
    }
}

pub(crate) fn write_array<B: AsRef<[u8]>>(parts: &[Option<B>], dst: &mut BytesMut) {
    dst.put_u8(b'*');
    dst.put_slice(parts.len().to_string().as_bytes());
    dst.put_slice(b"\r\n");

    for part in parts {
        match part {
            Some(bytes) => {
                let bytes = bytes.as_ref();
                dst.put_u8(b'$');
                dst.put_slice(bytes.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                dst.put_slice(bytes);
                dst.put_slice(b"\r\n");
            }
            None => dst.put_slice(b"$-1\r\n"),
        }
    }
}

/// Encodes a bare keyword command such as `MULTI`.
pub(crate) fn write_keyword(keyword: &str, dst: &mut BytesMut) {
    write_array(&[Some(keyword)], dst);
}

impl Decoder for RespCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match Frame::check(&src[..]) {
            Ok(length) => length,
            Err(frame::Error::Incomplete) => {
                // Check if the frame size exceeds a certain limit to prevent DoS attacks
                if src.len() > self.max_frame_size {
                    return Err(CodecError::FrameTooLarge {
                        size: src.len(),
                        limit: self.max_frame_size,
                    });
                }
                src.reserve(4096);
                return Ok(None); // Not enough data to parse a frame.
            }
            Err(err) => {
                error!("malformed frame from server: {}", err);
                return Err(err.into());
            }
        };

        if tracing::enabled!(tracing::Level::TRACE) {
            trace!("READ {}", src[..length].escape_ascii());
        }

        let mut cursor = Cursor::new(&src[..length]);
        let frame = Frame::parse(&mut cursor)?;

        // Remove the parsed frame from the buffer.
        src.advance(length);

        Ok(Some(frame))
    }
}

/// Requests are encoded before they reach the connection; this writes them through.
impl Encoder<Bytes> for RespCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if tracing::enabled!(tracing::Level::TRACE) {
            trace!("WRITE {}", item.escape_ascii());
        }

        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn args(parts: &[&str]) -> Vec<Arg> {
        parts.iter().map(|p| Arg::from(*p)).collect()
    }

    #[test]
    fn encode_llen() {
        let bytes = RespCodec::default()
            .encode_to_bytes(&args(&["LLEN", "mylist"]))
            .unwrap();

        assert_eq!(&bytes[..], b"*2\r\n$4\r\nLLEN\r\n$6\r\nmylist\r\n");
    }

    #[test]
    fn encode_mixed_components() {
        let command = vec![
            Arg::from("SET"),
            Arg::from(&b"k\r\n"[..]),
            Arg::from(-12),
            Arg::Null,
        ];

        let bytes = RespCodec::default().encode_to_bytes(&command).unwrap();

        assert_eq!(
            &bytes[..],
            b"*4\r\n$3\r\nSET\r\n$3\r\nk\r\n\r\n$3\r\n-12\r\n$-1\r\n"
        );
    }

    #[test]
    fn encode_matches_redis_crate() {
        let bytes = RespCodec::default()
            .encode_to_bytes(&[
                Arg::from("SET"),
                Arg::from("greeting"),
                Arg::from("héllo"),
                Arg::from(42),
            ])
            .unwrap();

        let expected = redis::cmd("SET")
            .arg("greeting")
            .arg("héllo")
            .arg(42)
            .get_packed_command();

        assert_eq!(&bytes[..], &expected[..]);
    }

    #[test]
    fn encode_uses_configured_charset() {
        let codec = RespCodec::new(Charset::Latin1);
        let bytes = codec.encode_to_bytes(&[Arg::from("é")]).unwrap();

        assert_eq!(&bytes[..], b"*1\r\n$1\r\n\xe9\r\n");
    }

    #[test]
    fn encode_unmappable_writes_nothing() {
        let codec = RespCodec::new(Charset::Ascii);
        let mut dst = BytesMut::new();

        let result = codec.encode_command(&args(&["SET", "k", "ünïcode"]), &mut dst);

        assert!(matches!(result, Err(EncodeError::Unmappable { .. })));
        assert!(dst.is_empty());
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"+OK"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"+OK");

        buf.extend_from_slice(b"\r\n:1");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Simple("OK".to_string()))
        );
        assert_eq!(&buf[..], b":1");
    }

    #[test]
    fn decode_rejects_malformed_stream() {
        let mut codec = RespCodec::default();
        let mut buf = BytesMut::from(&b"!oops\r\n"[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Frame(frame::Error::InvalidDataType(b'!')))
        ));
    }

    #[test]
    fn decode_enforces_frame_limit() {
        let mut codec = RespCodec::default().with_max_frame_size(8);
        let mut buf = BytesMut::from(&b"$100\r\n0123456789"[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge { limit: 8, .. })
        ));
    }

    #[test]
    fn decode_random_chunks() {
        let frames = vec![
            Frame::Simple("OK".to_string()),
            Frame::Error("ERR unknown command".to_string()),
            Frame::Integer(1000),
            Frame::Bulk(Bytes::from("foo\r\nbar")),
            Frame::Null,
            Frame::Array(vec![
                Frame::Bulk(Bytes::from("message")),
                Frame::Bulk(Bytes::from("news")),
                Frame::Bulk(Bytes::from("hello")),
            ]),
            Frame::NullArray,
            Frame::Array(vec![]),
        ];
        let wire: Vec<u8> = frames.iter().flat_map(|f| f.serialize()).collect();

        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut codec = RespCodec::default();
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();
            let mut rest = &wire[..];

            while !rest.is_empty() {
                let split = rng.gen_range(1..=rest.len().min(7));
                buf.extend_from_slice(&rest[..split]);
                rest = &rest[split..];

                while let Some(frame) = codec.decode(&mut buf).unwrap() {
                    decoded.push(frame);
                }
            }

            assert_eq!(decoded, frames);
            assert!(buf.is_empty());
        }
    }
}
