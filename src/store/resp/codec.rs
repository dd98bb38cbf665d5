//! RESP2 framing.
//!
//! Replies are decoded into [`RespValue`]; commands are encoded as arrays of
//! bulk strings, the only request shape a RESP2 server accepts besides inline
//! commands.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

use super::RespValue;
use crate::Error;
use crate::ProtocolError;
use crate::Result;

/// Largest accepted bulk string (512 MiB, the server-side limit)
const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Deepest accepted array nesting
const MAX_NESTING_DEPTH: usize = 32;

#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<RespValue>> {
        match parse_value(&src[..], 0)? {
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Vec<Bytes>> for RespCodec {
    type Error = Error;

    fn encode(
        &mut self,
        args: Vec<Bytes>,
        dst: &mut BytesMut,
    ) -> Result<()> {
        let payload: usize = args.iter().map(|a| a.len() + 16).sum();
        dst.reserve(payload + 16);

        put_header(dst, b'*', args.len());
        for arg in args {
            put_header(dst, b'$', arg.len());
            dst.put_slice(&arg);
            dst.put_slice(b"\r\n");
        }
        Ok(())
    }
}

fn put_header(
    dst: &mut BytesMut,
    tag: u8,
    len: usize,
) {
    dst.put_u8(tag);
    dst.put_slice(len.to_string().as_bytes());
    dst.put_slice(b"\r\n");
}

/// Parses one value, returning it with the number of bytes consumed, or
/// `None` when `buf` holds an incomplete frame.
fn parse_value(
    buf: &[u8],
    depth: usize,
) -> Result<Option<(RespValue, usize)>> {
    let Some(&tag) = buf.first() else {
        return Ok(None);
    };
    let Some(line_len) = find_crlf(&buf[1..]) else {
        return Ok(None);
    };
    let line = &buf[1..1 + line_len];
    let body_start = 1 + line_len + 2;

    match tag {
        b'+' => Ok(Some((RespValue::Simple(lossy(line)), body_start))),
        b'-' => Ok(Some((RespValue::Error(lossy(line)), body_start))),
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), body_start))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Nil, body_start)));
            }
            let len = len as usize;
            if len > MAX_BULK_SIZE {
                return Err(invalid(format!("bulk string too large: {len}")));
            }
            let end = body_start + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(invalid("missing CRLF after bulk string".to_string()));
            }
            let bytes = Bytes::copy_from_slice(&buf[body_start..end]);
            Ok(Some((RespValue::Bulk(bytes), end + 2)))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((RespValue::Nil, body_start)));
            }
            if depth >= MAX_NESTING_DEPTH {
                return Err(invalid("maximum nesting depth exceeded".to_string()));
            }

            let mut items = Vec::with_capacity((len as usize).min(1024));
            let mut offset = body_start;
            for _ in 0..len {
                match parse_value(&buf[offset..], depth + 1)? {
                    Some((item, consumed)) => {
                        items.push(item);
                        offset += consumed;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), offset)))
        }
        other => Err(invalid(format!("unknown type byte {other:#04x}"))),
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| invalid(format!("invalid integer {:?}", lossy(line))))
}

fn invalid(message: String) -> Error {
    ProtocolError::InvalidFrame(message).into()
}
