//! Envelope encoding and incremental decoding.
//!
//! Encoding produces one contiguous length-prefixed buffer. Decoding is
//! incremental: the decoder consumes nothing until a complete frame is
//! buffered, so callers can feed it partial reads straight off a socket.

use crate::envelope::{Envelope, EnvelopeFlags, Metadata};
use crate::error::WireError;
use crate::{DEFAULT_MAX_FRAME_SIZE, MAX_META_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encode an envelope into a single length-prefixed buffer.
///
/// The `EMPTY` flag bit is derived from the payload, and a correlation id is
/// required whenever a sync bit is set. Size-limit violations are reported
/// here, at encode time, never silently dropped.
pub fn encode_envelope(envelope: &Envelope, max_frame_size: usize) -> Result<Bytes, WireError> {
    let mut flags = envelope.flags & (EnvelopeFlags::SYNC_REQUEST | EnvelopeFlags::SYNC_REPLY);
    if envelope.payload.is_none() {
        flags |= EnvelopeFlags::EMPTY;
    }

    let is_sync = flags.intersects(EnvelopeFlags::SYNC_REQUEST | EnvelopeFlags::SYNC_REPLY);
    let corr_id = match (is_sync, envelope.corr_id) {
        (true, Some(id)) => Some(id),
        (true, None) => return Err(WireError::MissingCorrelation),
        (false, _) => None,
    };

    let meta_size: usize = envelope
        .metadata
        .iter()
        .map(|(k, v)| 8 + k.len() + v.len())
        .sum();
    if meta_size > MAX_META_SIZE {
        return Err(WireError::Size(meta_size));
    }

    let mut frame_len = 1 + 4 + meta_size; // flags + meta_count + entries
    if corr_id.is_some() {
        frame_len += 8;
    }
    if flags.contains(EnvelopeFlags::SYNC_REQUEST) {
        frame_len += 8;
    }
    if let Some(payload) = &envelope.payload {
        frame_len += 4 + payload.len();
    }
    if frame_len + 4 > effective_limit(max_frame_size) {
        return Err(WireError::Size(frame_len + 4));
    }

    let mut buf = BytesMut::with_capacity(frame_len + 4);
    buf.put_u32(frame_len as u32);
    buf.put_u8(flags.bits());

    if let Some(id) = corr_id {
        buf.put_u64(id);
    }
    if flags.contains(EnvelopeFlags::SYNC_REQUEST) {
        buf.put_u64(envelope.expires_at_ms.unwrap_or(0));
    }

    buf.put_u32(envelope.metadata.len() as u32);
    for (key, value) in &envelope.metadata {
        buf.put_u32(key.len() as u32);
        buf.put_slice(key.as_bytes());
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
    }

    if let Some(payload) = &envelope.payload {
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
    }

    Ok(buf.freeze())
}

/// The length prefix is a `u32`, so no configured limit can admit a frame
/// whose length would not fit it.
fn effective_limit(max_frame_size: usize) -> usize {
    max_frame_size.min(u32::MAX as usize)
}

/// Incremental envelope decoder for one connection's byte stream.
#[derive(Debug)]
pub struct EnvelopeDecoder {
    max_frame_size: usize,
}

impl EnvelopeDecoder {
    /// Create a decoder with the default frame size limit.
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom frame size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one envelope from the buffer.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; the buffer is left untouched in that case. A decoded frame is
    /// consumed from the front of the buffer.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Envelope>, WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len + 4 > self.max_frame_size {
            return Err(WireError::Size(frame_len + 4));
        }
        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame = buf.split_to(frame_len).freeze();

        if frame.is_empty() {
            return Err(WireError::Malformed);
        }
        let flags = EnvelopeFlags::from_bits(frame.get_u8()).ok_or(WireError::Reserved)?;
        let is_sync = flags.intersects(EnvelopeFlags::SYNC_REQUEST | EnvelopeFlags::SYNC_REPLY);

        let corr_id = if is_sync {
            if frame.len() < 8 {
                return Err(WireError::Malformed);
            }
            Some(frame.get_u64())
        } else {
            None
        };

        let expires_at_ms = if flags.contains(EnvelopeFlags::SYNC_REQUEST) {
            if frame.len() < 8 {
                return Err(WireError::Malformed);
            }
            match frame.get_u64() {
                0 => None,
                ms => Some(ms),
            }
        } else {
            None
        };

        let metadata = decode_metadata(&mut frame)?;

        let payload = if flags.contains(EnvelopeFlags::EMPTY) {
            if !frame.is_empty() {
                return Err(WireError::Malformed);
            }
            None
        } else {
            if frame.len() < 4 {
                return Err(WireError::Malformed);
            }
            let payload_len = frame.get_u32() as usize;
            if frame.len() != payload_len {
                return Err(WireError::Malformed);
            }
            Some(frame)
        };

        Ok(Some(Envelope {
            flags,
            corr_id,
            expires_at_ms,
            metadata,
            payload,
        }))
    }
}

impl Default for EnvelopeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_metadata(frame: &mut Bytes) -> Result<Metadata, WireError> {
    if frame.len() < 4 {
        return Err(WireError::Malformed);
    }
    let count = frame.get_u32() as usize;

    let mut metadata = Metadata::with_capacity(count.min(1024));
    for _ in 0..count {
        if frame.len() < 4 {
            return Err(WireError::Malformed);
        }
        let key_len = frame.get_u32() as usize;
        if frame.len() < key_len {
            return Err(WireError::Malformed);
        }
        let key = std::str::from_utf8(&frame.split_to(key_len))
            .map_err(|_| WireError::MetaKey)?
            .to_string();

        if frame.len() < 4 {
            return Err(WireError::Malformed);
        }
        let val_len = frame.get_u32() as usize;
        if frame.len() < val_len {
            return Err(WireError::Malformed);
        }
        let value = frame.split_to(val_len).to_vec();

        metadata.insert(key, value);
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn roundtrip(env: &Envelope) -> Envelope {
        let encoded = encode_envelope(env, DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());
        EnvelopeDecoder::new().decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_roundtrip_plain() {
        let env = Envelope::new("hello world")
            .with_metadata("content-type", b"text/plain".to_vec())
            .with_metadata("x-bin", vec![0u8, 255, 1, 2]);
        assert_eq!(roundtrip(&env), env);
    }

    #[test]
    fn test_roundtrip_empty_message() {
        let env = Envelope::empty();
        let decoded = roundtrip(&env);
        assert!(decoded.payload.is_none());
        assert!(decoded.metadata.is_empty());
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_roundtrip_metadata_without_payload() {
        let env = Envelope::empty().with_metadata("foo", b"bar".to_vec());
        let decoded = roundtrip(&env);
        assert!(decoded.payload.is_none());
        assert_eq!(decoded.metadata.get("foo").unwrap(), b"bar");
    }

    #[test]
    fn test_roundtrip_sync_request() {
        let env = Envelope::new("ping").into_sync_request(0xDEADBEEF, Duration::from_secs(5));
        let decoded = roundtrip(&env);
        assert!(decoded.is_sync_request());
        assert_eq!(decoded.corr_id, Some(0xDEADBEEF));
        assert_eq!(decoded.expires_at_ms, env.expires_at_ms);
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_roundtrip_sync_reply() {
        let env = Envelope::new("pong")
            .with_metadata("foo", b"bar".to_vec())
            .into_sync_reply(99);
        let decoded = roundtrip(&env);
        assert!(decoded.is_sync_reply());
        assert_eq!(decoded.corr_id, Some(99));
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_binary_payload_with_embedded_length_bytes() {
        // Payload bytes that look like frame prefixes must not confuse the
        // decoder; only the outer length prefix delimits the frame.
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let env = Envelope::new(payload);
        assert_eq!(roundtrip(&env), env);
    }

    #[test]
    fn test_partial_frames_buffer_until_complete() {
        let env = Envelope::new("split me").with_metadata("k", b"v".to_vec());
        let encoded = encode_envelope(&env, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = EnvelopeDecoder::new();
        let mut buf = BytesMut::new();
        for chunk in encoded.chunks(3) {
            let before = decoder.decode(&mut buf).unwrap();
            if buf.len() + chunk.len() < encoded.len() {
                assert!(before.is_none());
            }
            buf.extend_from_slice(chunk);
        }
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, env);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let first = Envelope::new("one");
        let second = Envelope::new("two").with_metadata("n", b"2".to_vec());

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_envelope(&first, DEFAULT_MAX_FRAME_SIZE).unwrap());
        buf.extend_from_slice(&encode_envelope(&second, DEFAULT_MAX_FRAME_SIZE).unwrap());

        let mut decoder = EnvelopeDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), second);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_sync_flag_without_corr_id_fails_encode() {
        let env = Envelope {
            flags: EnvelopeFlags::SYNC_REQUEST,
            ..Envelope::new("bad")
        };
        assert!(matches!(
            encode_envelope(&env, DEFAULT_MAX_FRAME_SIZE),
            Err(WireError::MissingCorrelation)
        ));
    }

    #[test]
    fn test_oversized_frame_rejected_at_encode() {
        let env = Envelope::new(vec![0u8; 1024]);
        assert!(matches!(
            encode_envelope(&env, 64),
            Err(WireError::Size(_))
        ));
    }

    #[test]
    fn test_frame_limit_clamped_to_length_prefix_range() {
        // A limit beyond what the u32 length prefix can express is capped,
        // never allowed to wrap the prefix silently.
        assert_eq!(effective_limit(usize::MAX), u32::MAX as usize);
        assert_eq!(effective_limit(64), 64);

        let env = Envelope::new("fits either way");
        let encoded = encode_envelope(&env, usize::MAX).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());
        assert_eq!(
            EnvelopeDecoder::new().decode(&mut buf).unwrap().unwrap(),
            env
        );
    }

    #[test]
    fn test_oversized_frame_rejected_at_decode() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_slice(&[0u8; 16]);
        let mut decoder = EnvelopeDecoder::new();
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Size(_))));
    }

    #[test]
    fn test_truncated_frame_body_is_malformed() {
        // Claims a 10-byte frame whose body ends mid-metadata.
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_u8(0); // flags: plain
        buf.put_u32(3); // meta_count = 3 but no entries follow
        buf.put_slice(&[0u8; 5]); // junk to reach the declared length
        let mut decoder = EnvelopeDecoder::new();
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Malformed)));
    }

    #[test]
    fn test_reserved_flag_bits_rejected() {
        let env = Envelope::new("x");
        let encoded = encode_envelope(&env, DEFAULT_MAX_FRAME_SIZE).unwrap();
        let mut bytes = encoded.to_vec();
        bytes[4] |= 0x80; // set a reserved flag bit
        let mut buf = BytesMut::from(&bytes[..]);
        let mut decoder = EnvelopeDecoder::new();
        assert!(matches!(decoder.decode(&mut buf), Err(WireError::Reserved)));
    }
}
