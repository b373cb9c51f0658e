//! Framing: length-prefix (4 bytes LE) + bincode payload, optionally sealed
//! with the wire cipher.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::identity::{decrypt_wire, encrypt_wire, WireCryptoError};

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a message into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    prefix(payload)
}

/// Encode and encrypt a message under `key` with per-direction counter `nonce`.
pub fn seal_frame<T: Serialize>(
    key: &[u8; 32],
    nonce: u64,
    msg: &T,
) -> Result<Vec<u8>, FrameEncodeError> {
    let plain = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let cipher = encrypt_wire(key, nonce, &plain).map_err(FrameEncodeError::Crypto)?;
    prefix(cipher)
}

fn prefix(payload: Vec<u8>) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode, cipher or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
    #[error("seal error: {0}")]
    Crypto(WireCryptoError),
}

/// Body length announced by a 4-byte header, checked against the frame limit.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = decode_body(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Decode a frame body whose length prefix was already consumed.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, FrameDecodeError> {
    bincode::deserialize(body).map_err(FrameDecodeError::Decode)
}

/// Decrypt and decode a sealed frame body whose length prefix was already consumed.
pub fn open_body<T: DeserializeOwned>(
    key: &[u8; 32],
    nonce: u64,
    body: &[u8],
) -> Result<T, FrameDecodeError> {
    let plain = decrypt_wire(key, nonce, body).map_err(FrameDecodeError::Crypto)?;
    decode_body(&plain)
}

/// Error decoding a frame (need more bytes, too large, bad seal or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("open error: {0}")]
    Crypto(WireCryptoError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake;
    use crate::identity::NodeIdentity;
    use crate::protocol::{AuthMode, ControlMessage, Frame, Opening, Service};

    fn sample_opening() -> Opening {
        let identity = NodeIdentity::generate();
        let hs = handshake::dial(&identity, Service::X11, AuthMode::Pake, None);
        Opening::Hello(hs.hello().clone())
    }

    #[test]
    fn roundtrip_opening() {
        let msg = sample_opening();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame::<Opening>(&frame).unwrap();
        assert_eq!(n, frame.len());
        match (&msg, &decoded) {
            (Opening::Hello(a), Opening::Hello(b)) => {
                assert_eq!(a.node_id, b.node_id);
                assert_eq!(a.ephemeral, b.ephemeral);
            }
            _ => panic!("expected Hello"),
        }
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_opening()).unwrap();
        assert!(matches!(
            decode_frame::<Opening>(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame::<Opening>(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversize_header_rejected() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame::<Opening>(&bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn sealed_frames_need_right_key_and_counter() {
        let key = [9u8; 32];
        let frame = seal_frame(&key, 3, &Frame::Control(ControlMessage::Busy)).unwrap();
        let body = &frame[LEN_SIZE..];
        assert_eq!(frame_len(frame[..LEN_SIZE].try_into().unwrap()).unwrap(), body.len());
        let opened: Frame = open_body(&key, 3, body).unwrap();
        assert!(matches!(opened, Frame::Control(ControlMessage::Busy)));
        assert!(matches!(
            open_body::<Frame>(&key, 4, body),
            Err(FrameDecodeError::Crypto(_))
        ));
        assert!(matches!(
            open_body::<Frame>(&[8u8; 32], 3, body),
            Err(FrameDecodeError::Crypto(_))
        ));
    }

    #[test]
    fn multiple_messages() {
        let a = sample_opening();
        let b = Frame::Data {
            stream: 1,
            payload: b"xauth".to_vec(),
        };
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame::<Opening>(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame::<Frame>(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m1, Opening::Hello(_)));
        assert!(matches!(m2, Frame::Data { stream: 1, .. }));
    }
}
