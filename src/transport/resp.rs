//! RESP2 framing for backend connections
//!
//! Zero-copy values over `Bytes`, exposed as a tokio-util codec so a
//! `Framed<TcpStream, RespCodec>` can be driven with `SinkExt`/`StreamExt`.

use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Command frame: an array of bulk strings
    pub fn command<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        RespValue::Array(Some(
            args.into_iter()
                .map(|a| RespValue::BulkString(Some(a.into())))
                .collect(),
        ))
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RespValue::SimpleString(b) | RespValue::BulkString(Some(b)) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, RespValue::BulkString(None) | RespValue::Array(None))
    }

    /// Turn an error reply into `Err`, pass everything else through
    pub fn into_result(self) -> Result<RespValue, TransportError> {
        match self {
            RespValue::Error(msg) => Err(TransportError::Server(
                String::from_utf8_lossy(&msg).to_string(),
            )),
            other => Ok(other),
        }
    }

    pub fn into_array(self) -> Result<Vec<RespValue>, TransportError> {
        match self {
            RespValue::Array(Some(items)) => Ok(items),
            RespValue::Array(None) | RespValue::BulkString(None) => Ok(Vec::new()),
            other => Err(TransportError::Protocol(format!("expected array, got {:?}", other))),
        }
    }
}

/// Largest bulk string accepted, matching the server's default
/// `proto-max-bulk-len`
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

enum ParseError {
    Incomplete,
    Invalid(String),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl RespCodec {
    fn try_parse(input: &[u8]) -> Result<(RespValue, usize), ParseError> {
        if input.is_empty() {
            return Err(ParseError::Incomplete);
        }

        match input[0] {
            b'+' => Self::parse_line(input).map(|(b, n)| (RespValue::SimpleString(b), n)),
            b'-' => Self::parse_line(input).map(|(b, n)| (RespValue::Error(b), n)),
            b':' => {
                let (n, consumed) = Self::parse_length(input)?;
                Ok((RespValue::Integer(n), consumed))
            }
            b'$' => Self::parse_bulk_string(input),
            b'*' => Self::parse_array(input),
            other => Err(ParseError::Invalid(format!(
                "Unknown RESP type: {}",
                other as char
            ))),
        }
    }

    fn parse_line(input: &[u8]) -> Result<(Bytes, usize), ParseError> {
        let pos = Self::find_crlf(input).ok_or(ParseError::Incomplete)?;
        Ok((Bytes::copy_from_slice(&input[1..pos]), pos + 2))
    }

    fn parse_length(input: &[u8]) -> Result<(i64, usize), ParseError> {
        let pos = Self::find_crlf(input).ok_or(ParseError::Incomplete)?;
        let s = std::str::from_utf8(&input[1..pos])
            .map_err(|e| ParseError::Invalid(e.to_string()))?;
        let n = s
            .parse::<i64>()
            .map_err(|e| ParseError::Invalid(e.to_string()))?;
        Ok((n, pos + 2))
    }

    fn parse_bulk_string(input: &[u8]) -> Result<(RespValue, usize), ParseError> {
        let (len, start) = Self::parse_length(input)?;
        if len < 0 {
            return Ok((RespValue::BulkString(None), start));
        }
        if len > MAX_BULK_LEN {
            return Err(ParseError::Invalid(format!("bulk string length {} too large", len)));
        }

        let end = start + len as usize;
        if end + 2 > input.len() {
            return Err(ParseError::Incomplete);
        }

        let data = Bytes::copy_from_slice(&input[start..end]);
        Ok((RespValue::BulkString(Some(data)), end + 2))
    }

    fn parse_array(input: &[u8]) -> Result<(RespValue, usize), ParseError> {
        let (len, mut offset) = Self::parse_length(input)?;
        if len < 0 {
            return Ok((RespValue::Array(None), offset));
        }

        // An element is at least three bytes
        let room = input.len().saturating_sub(offset) / 3;
        let mut elements = Vec::with_capacity((len as usize).min(room));
        for _ in 0..len {
            if offset >= input.len() {
                return Err(ParseError::Incomplete);
            }
            let (value, consumed) = Self::try_parse(&input[offset..])?;
            elements.push(value);
            offset += consumed;
        }

        Ok((RespValue::Array(Some(elements)), offset))
    }

    #[inline]
    fn find_crlf(input: &[u8]) -> Option<usize> {
        memchr::memmem::find(input, b"\r\n")
    }

    fn encode_into(value: &RespValue, buf: &mut BytesMut) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::BulkString(None) => buf.extend_from_slice(b"$-1\r\n"),
            RespValue::BulkString(Some(data)) => {
                buf.put_u8(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            RespValue::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
                for elem in elements {
                    Self::encode_into(elem, buf);
                }
            }
        }
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespValue>, TransportError> {
        match Self::try_parse(src) {
            Ok((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            Err(ParseError::Incomplete) => Ok(None),
            Err(ParseError::Invalid(msg)) => Err(TransportError::Protocol(msg)),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = TransportError;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<(), TransportError> {
        Self::encode_into(&item, dst);
        Ok(())
    }
}
