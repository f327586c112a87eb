//! RFC 6455 frame codec for the door client.
//!
//! Client-to-server frames are always masked. The parser works on an
//! accumulating buffer and reports `Incomplete` until a whole frame is
//! present, so TCP can split frames anywhere.

use crate::error::BridgeError;

/// Frames larger than this are treated as a protocol error.
pub const MAX_FRAME_PAYLOAD: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

/// Result of parsing the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Parsed<'a> {
    /// Not enough bytes for a whole frame yet.
    Incomplete,
    /// Text, binary or continuation frame.
    Data {
        opcode: Opcode,
        fin: bool,
        payload: Vec<u8>,
        remaining: &'a [u8],
    },
    Ping {
        payload: Vec<u8>,
        remaining: &'a [u8],
    },
    Pong {
        payload: Vec<u8>,
        remaining: &'a [u8],
    },
    Close {
        code: Option<u16>,
        reason: String,
        remaining: &'a [u8],
    },
}

impl<'a> Parsed<'a> {
    /// Bytes after the parsed frame; `None` when incomplete.
    pub fn remaining(&self) -> Option<&'a [u8]> {
        match self {
            Parsed::Incomplete => None,
            Parsed::Data { remaining, .. }
            | Parsed::Ping { remaining, .. }
            | Parsed::Pong { remaining, .. }
            | Parsed::Close { remaining, .. } => Some(remaining),
        }
    }
}

/// Encode one final frame. `mask` is required for client-to-server frames.
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(0x80 | opcode.bits());

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Encode a masked client frame with a fresh random key.
pub fn client_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    encode_frame(opcode, payload, Some(rand::random::<[u8; 4]>()))
}

/// Payload of a close frame: status code then UTF-8 reason.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Parse one frame from the front of `buf`. Masked frames are unmasked.
pub fn parse_frame(buf: &[u8]) -> Result<Parsed<'_>, BridgeError> {
    if buf.len() < 2 {
        return Ok(Parsed::Incomplete);
    }
    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        return Err(BridgeError::Protocol("reserved bits set".to_string()));
    }
    let opcode = Opcode::from_bits(buf[0] & 0x0F).ok_or_else(|| {
        BridgeError::Protocol(format!("unknown opcode {:#x}", buf[0] & 0x0F))
    })?;
    let masked = buf[1] & 0x80 != 0;

    let (len, mut offset) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(Parsed::Incomplete);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(Parsed::Incomplete);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(bytes), 10)
        }
        n => (u64::from(n), 2),
    };
    if len > MAX_FRAME_PAYLOAD {
        return Err(BridgeError::Protocol(format!("frame of {} bytes", len)));
    }

    let key = if masked {
        if buf.len() < offset + 4 {
            return Ok(Parsed::Incomplete);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let end = offset + len as usize;
    if buf.len() < end {
        return Ok(Parsed::Incomplete);
    }
    let mut payload = buf[offset..end].to_vec();
    if let Some(key) = key {
        for (i, b) in payload.iter_mut().enumerate() {
            *b ^= key[i % 4];
        }
    }
    let remaining = &buf[end..];

    Ok(match opcode {
        Opcode::Continuation | Opcode::Text | Opcode::Binary => Parsed::Data {
            opcode,
            fin,
            payload,
            remaining,
        },
        Opcode::Ping => Parsed::Ping { payload, remaining },
        Opcode::Pong => Parsed::Pong { payload, remaining },
        Opcode::Close => {
            let (code, reason) = if payload.len() >= 2 {
                (
                    Some(u16::from_be_bytes([payload[0], payload[1]])),
                    String::from_utf8_lossy(&payload[2..]).into_owned(),
                )
            } else {
                (None, String::new())
            };
            Parsed::Close {
                code,
                reason,
                remaining,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_frame_split_across_chunks() {
        let payload: Vec<u8> = (0..130u8).map(|i| b'a' + i % 26).collect();
        let frame = encode_frame(Opcode::Text, &payload, Some([0x37, 0xFA, 0x21, 0x3D]));
        // 2-byte header, 16-bit length, mask key, payload.
        assert_eq!(frame.len(), 2 + 2 + 4 + 130);
        assert_eq!(frame[1], 0x80 | 126);

        let mut buf = Vec::new();
        buf.extend_from_slice(&frame[..61]);
        assert_eq!(parse_frame(&buf).unwrap(), Parsed::Incomplete);

        buf.extend_from_slice(&frame[61..]);
        match parse_frame(&buf).unwrap() {
            Parsed::Data {
                opcode,
                fin,
                payload: got,
                remaining,
            } => {
                assert_eq!(opcode, Opcode::Text);
                assert!(fin);
                assert_eq!(got, payload);
                assert!(remaining.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn header_split_is_incomplete() {
        let frame = encode_frame(Opcode::Text, &[b'x'; 300], Some([1, 2, 3, 4]));
        for cut in [1, 3, 5, 7] {
            assert_eq!(parse_frame(&frame[..cut]).unwrap(), Parsed::Incomplete);
        }
    }

    #[test]
    fn back_to_back_frames_leave_remainder() {
        let mut buf = encode_frame(Opcode::Ping, b"hi", None);
        let second = encode_frame(Opcode::Text, b"there", None);
        buf.extend_from_slice(&second);

        let parsed = parse_frame(&buf).unwrap();
        assert_eq!(parsed.remaining(), Some(&second[..]));
        match parsed {
            Parsed::Ping { payload, .. } => assert_eq!(payload, b"hi"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn close_frame_carries_code_and_reason() {
        let frame = encode_frame(Opcode::Close, &close_payload(1008, "bad token"), None);
        match parse_frame(&frame).unwrap() {
            Parsed::Close { code, reason, .. } => {
                assert_eq!(code, Some(1008));
                assert_eq!(reason, "bad token");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn client_frames_are_masked() {
        let frame = client_frame(Opcode::Text, b"hello");
        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 0x80 | 5);
        match parse_frame(&frame).unwrap() {
            Parsed::Data { payload, .. } => assert_eq!(payload, b"hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn large_payload_uses_64_bit_length() {
        let payload = vec![0u8; 70_000];
        let frame = encode_frame(Opcode::Binary, &payload, None);
        assert_eq!(frame[1], 127);
        assert_eq!(&frame[2..10], &70_000u64.to_be_bytes());
        match parse_frame(&frame).unwrap() {
            Parsed::Data { payload: got, .. } => assert_eq!(got.len(), 70_000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_opcode() {
        assert!(matches!(
            parse_frame(&[0x83, 0x00]),
            Err(BridgeError::Protocol(_))
        ));
    }
}
