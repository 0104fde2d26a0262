//! The envelope: one complete application-level message unit.
//!
//! An envelope pairs an optional binary payload with a string-keyed metadata
//! map and three flag bits that classify it as a plain message, a sync
//! request, or a sync reply.

use bitflags::bitflags;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// String-keyed metadata with opaque byte values.
///
/// Map semantics only: insertion order does not round-trip and is not part
/// of the envelope contract.
pub type Metadata = HashMap<String, Vec<u8>>;

bitflags! {
    /// Envelope flag byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvelopeFlags: u8 {
        /// Envelope is a synchronous request expecting exactly one reply
        const SYNC_REQUEST = 1 << 0;
        /// Envelope is the reply to a synchronous request
        const SYNC_REPLY = 1 << 1;
        /// Envelope carries no payload block
        const EMPTY = 1 << 2;
    }
}

/// One complete message as exchanged over the wire.
///
/// A `None` payload with empty metadata is a valid empty message and is
/// distinct from a `None` payload accompanied by metadata. The `EMPTY` flag
/// bit is derived from the payload at encode time; the flags stored here are
/// normalized by the codec so `decode(encode(e)) == e` holds for envelopes
/// built through the constructors below.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    /// Classification flags
    pub flags: EnvelopeFlags,
    /// Correlation id, present only on sync requests and replies
    pub corr_id: Option<u64>,
    /// Expiration deadline (unix milliseconds), attached to sync requests
    pub expires_at_ms: Option<u64>,
    /// Key/value metadata
    pub metadata: Metadata,
    /// Binary payload, or absent
    pub payload: Option<Bytes>,
}

impl Envelope {
    /// Create a plain envelope carrying the given payload.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: Some(payload.into()),
            ..Self::default()
        }
    }

    /// Create an envelope with no payload.
    pub fn empty() -> Self {
        Self {
            flags: EnvelopeFlags::EMPTY,
            ..Self::default()
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Replace the metadata map wholesale.
    pub fn with_metadata_map(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Tag this envelope as a sync request with the given correlation id
    /// and time-to-live.
    pub fn into_sync_request(mut self, corr_id: u64, ttl: Duration) -> Self {
        self.flags |= EnvelopeFlags::SYNC_REQUEST;
        self.flags &= !EnvelopeFlags::SYNC_REPLY;
        self.corr_id = Some(corr_id);
        self.expires_at_ms = Some(unix_millis_now().saturating_add(ttl.as_millis() as u64));
        self
    }

    /// Tag this envelope as the sync reply for the given correlation id.
    pub fn into_sync_reply(mut self, corr_id: u64) -> Self {
        self.flags |= EnvelopeFlags::SYNC_REPLY;
        self.flags &= !EnvelopeFlags::SYNC_REQUEST;
        self.corr_id = Some(corr_id);
        self.expires_at_ms = None;
        self
    }

    /// Whether this envelope is a sync request.
    pub fn is_sync_request(&self) -> bool {
        self.flags.contains(EnvelopeFlags::SYNC_REQUEST)
    }

    /// Whether this envelope is a sync reply.
    pub fn is_sync_reply(&self) -> bool {
        self.flags.contains(EnvelopeFlags::SYNC_REPLY)
    }

    /// Whether this sync request's deadline has already passed.
    pub fn is_expired(&self) -> bool {
        match self.expires_at_ms {
            Some(deadline) => deadline <= unix_millis_now(),
            None => false,
        }
    }

    /// Payload length in bytes, zero when absent.
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
    }
}

/// Current wall-clock time in unix milliseconds.
pub(crate) fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_vs_metadata_only() {
        let empty = Envelope::empty();
        let meta_only = Envelope::empty().with_metadata("foo", b"bar".to_vec());

        assert!(empty.payload.is_none());
        assert!(meta_only.payload.is_none());
        assert_ne!(empty, meta_only);
    }

    #[test]
    fn test_sync_request_tagging() {
        let env = Envelope::new("ping").into_sync_request(42, Duration::from_secs(5));
        assert!(env.is_sync_request());
        assert!(!env.is_sync_reply());
        assert_eq!(env.corr_id, Some(42));
        assert!(!env.is_expired());
    }

    #[test]
    fn test_sync_reply_clears_request_bit() {
        let env = Envelope::new("pong")
            .into_sync_request(7, Duration::from_secs(1))
            .into_sync_reply(7);
        assert!(env.is_sync_reply());
        assert!(!env.is_sync_request());
        assert_eq!(env.expires_at_ms, None);
    }

    #[test]
    fn test_expired_request() {
        let mut env = Envelope::new("late").into_sync_request(1, Duration::from_secs(5));
        env.expires_at_ms = Some(1); // long past
        assert!(env.is_expired());
    }
}
