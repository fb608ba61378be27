//! Framing: length-prefix (2 bytes BE) + encoded envelope.

use crate::rlp::{self, DecodeError, Fields, Value};

const LEN_SIZE: usize = 2;
/// Largest envelope one frame can carry.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Top-level wire unit: request id plus nested payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub request_id: u64,
    pub payload: Value,
}

impl Envelope {
    pub fn new(request_id: u64, payload: Value) -> Self {
        Self {
            request_id,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(&Value::List(vec![
            Value::uint(self.request_id),
            self.payload.clone(),
        ]))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value = rlp::decode(bytes)?;
        let mut fields = Fields::new(&value, "envelope")?;
        let request_id = fields.uint("request_id")?;
        let payload = fields.value("payload")?.clone();
        fields.finish()?;
        Ok(Self {
            request_id,
            payload,
        })
    }

    /// Payload elements, or an empty slice for a bare byte-string payload.
    pub fn items(&self) -> &[Value] {
        self.payload.as_list().unwrap_or(&[])
    }
}

/// Encode an envelope into a single frame: 2 bytes BE length + envelope bytes.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = envelope.encode();
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding an envelope into a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

/// Split one frame from the front of `bytes`. Returns the envelope bytes and the number of bytes consumed.
/// Call with partial buffer; returns NeedMore if the frame is incomplete (try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = usize::from(u16::from_be_bytes([bytes[0], bytes[1]]));
    if len == 0 {
        return Err(FrameDecodeError::Empty);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Error splitting a frame (need more bytes, or a zero-length frame).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("empty frame")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new(
            7,
            Value::List(vec!["portsend".into(), Value::uint(3), b"hi".to_vec().into()]),
        )
    }

    #[test]
    fn roundtrip_envelope() {
        let env = sample();
        let frame = encode_frame(&env).unwrap();
        let (body, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(Envelope::decode(body).unwrap(), env);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample()).unwrap();
        assert_eq!(decode_frame(&frame[..1]), Err(FrameDecodeError::NeedMore));
        assert_eq!(
            decode_frame(&frame[..super::LEN_SIZE + 1]),
            Err(FrameDecodeError::NeedMore)
        );
    }

    #[test]
    fn multiple_frames() {
        let a = sample();
        let b = Envelope::new(8, Value::List(vec!["getblockpeak".into()]));
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(Envelope::decode(m1).unwrap().request_id, 7);
        assert_eq!(Envelope::decode(m2).unwrap().request_id, 8);
    }

    #[test]
    fn oversized_envelope_rejected() {
        let env = Envelope::new(1, Value::Bytes(vec![0u8; MAX_FRAME_LEN]));
        assert!(matches!(
            encode_frame(&env),
            Err(FrameEncodeError::TooLarge(_))
        ));
    }

    #[test]
    fn envelope_requires_two_elements() {
        let bytes = rlp::encode(&Value::List(vec![Value::uint(1)]));
        let err = Envelope::decode(&bytes).unwrap_err();
        assert_eq!(err.path(), "envelope.payload");
    }
}
