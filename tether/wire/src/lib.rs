//! Length-prefixed envelope framing and encoding/decoding for tether.
//!
//! This crate implements the wire representation of a tether message: a
//! self-delimiting envelope carrying a flag byte, an optional correlation id,
//! a key/value metadata block, and an optional binary payload.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+------------------------------+
//! | u32 frame_len        | length of bytes that follow  |
//! +----------------------+------------------------------+
//! | u8 flags             | sync-request/sync-reply/empty|
//! +----------------------+------------------------------+
//! | u64 corr_id (opt)    | present iff a sync bit set   |
//! +----------------------+------------------------------+
//! | u64 expires_ms (opt) | present iff sync-request     |
//! +----------------------+------------------------------+
//! | u32 meta_count       | number of metadata entries   |
//! +----------------------+------------------------------+
//! | entries              | u32 klen, key, u32 vlen, val |
//! +----------------------+------------------------------+
//! | u32 payload_len      | absent iff empty bit set     |
//! | payload              |                              |
//! +----------------------+------------------------------+
//! ```
//!
//! All integers are big-endian. Payloads are arbitrary binary, so the frame
//! is delimited by the length prefix alone.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod envelope;
pub mod error;

pub use codec::{encode_envelope, EnvelopeDecoder};
pub use envelope::{Envelope, EnvelopeFlags, Metadata};
pub use error::WireError;

/// Maximum frame size accepted by default (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Maximum total metadata block size (64 KiB)
pub const MAX_META_SIZE: usize = 64 * 1024;
