//! Varint length framing for the local socket.
//!
//! Each direction carries a stream of frames: a base-128 varint byte count
//! (at most 5 bytes, value capped at 32 bits) followed by a protobuf
//! message of exactly that length. The reader enforces a per-message
//! maximum and treats anything else as garbage.

use prost::Message;

use crate::error::{ArborError, ArborResult};

/// Hard cap on a framed message, both directions.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Longest legal varint prefix (32-bit length).
pub const MAX_VARINT_BYTES: usize = 5;

/// Encode a length prefix into `out`.
pub fn put_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a varint from the head of `buf`.
///
/// Returns `Ok(None)` when the buffer holds an incomplete prefix and more
/// bytes are needed. A prefix longer than [`MAX_VARINT_BYTES`] or a value
/// above 32 bits is `InvalidData`.
pub fn get_varint(buf: &[u8]) -> ArborResult<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_BYTES {
            return Err(ArborError::invalid_data("message length prefix too long"));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            if value > u64::from(u32::MAX) {
                return Err(ArborError::invalid_data("message length exceeds 32 bits"));
            }
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

/// Serialize one message with its length prefix.
pub fn encode_frame<M: Message>(msg: &M, out: &mut Vec<u8>) {
    let len = msg.encoded_len();
    put_varint(len as u64, out);
    msg.encode(out).expect("Vec<u8> writes are infallible");
}

/// Streaming frame decoder over a growable read buffer.
///
/// Bytes from the socket are appended to the internal buffer; each call to
/// [`FrameDecoder::next_frame`] either yields one complete payload, asks
/// for more bytes, or reports a framing error (after which the connection
/// must be dropped).
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame payload, if any.
    pub fn next_frame(&mut self) -> ArborResult<Option<Vec<u8>>> {
        let (len, prefix) = match get_varint(&self.buf)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let len = len as usize;
        if len > MAX_MESSAGE_BYTES {
            return Err(ArborError::invalid_data(format!(
                "message of {} bytes exceeds the {} byte limit",
                len, MAX_MESSAGE_BYTES
            )));
        }
        if self.buf.len() < prefix + len {
            return Ok(None);
        }
        let payload = self.buf[prefix..prefix + len].to_vec();
        self.buf.drain(..prefix + len);
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc;

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16383, 16384, u32::MAX as u64] {
            let mut buf = Vec::new();
            put_varint(value, &mut buf);
            assert!(buf.len() <= MAX_VARINT_BYTES);
            let (decoded, used) = get_varint(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn test_varint_incomplete() {
        assert!(get_varint(&[0x80]).unwrap().is_none());
        assert!(get_varint(&[]).unwrap().is_none());
    }

    #[test]
    fn test_varint_over_32_bits() {
        let mut buf = Vec::new();
        put_varint(u64::from(u32::MAX) + 1, &mut buf);
        assert!(get_varint(&buf).is_err());
    }

    #[test]
    fn test_varint_too_long() {
        // Six continuation bytes never form a legal prefix.
        let buf = [0x80u8, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert!(get_varint(&buf).is_err());
    }

    #[test]
    fn test_frame_roundtrip_split_delivery() {
        let req = rpc::Request {
            body: Some(rpc::request::Body::Create(rpc::CreateRequest {
                name: "a/b".into(),
                weak: false,
            })),
        };
        let mut wire = Vec::new();
        encode_frame(&req, &mut wire);

        let mut dec = FrameDecoder::new();
        // Deliver one byte at a time; only the final byte completes a frame.
        for (i, byte) in wire.iter().enumerate() {
            dec.extend(std::slice::from_ref(byte));
            let frame = dec.next_frame().unwrap();
            if i + 1 < wire.len() {
                assert!(frame.is_none());
            } else {
                let payload = frame.unwrap();
                let decoded = <rpc::Request as prost::Message>::decode(&payload[..]).unwrap();
                assert_eq!(decoded, req);
            }
        }
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut dec = FrameDecoder::new();
        let mut wire = Vec::new();
        put_varint((MAX_MESSAGE_BYTES + 1) as u64, &mut wire);
        dec.extend(&wire);
        assert!(dec.next_frame().is_err());
    }
}
