//! Application-level handshake: envelope receive loop and the preshared-key
//! exchange that gates a session before any other traffic is accepted.

use bytes::BytesMut;
use std::time::Duration;
use tether_wire::{encode_envelope, Envelope, EnvelopeDecoder, WireError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// Metadata key carrying the authentication state of the handshake.
pub const AUTH_KEY: &str = "auth";
/// Metadata key carrying the peer-supplied preshared key.
pub const PSK_KEY: &str = "psk";

/// Auth state value: server demands a preshared key.
pub const AUTH_REQUIRED: &[u8] = b"required";
/// Auth state value: preshared key accepted.
pub const AUTH_OK: &[u8] = b"ok";
/// Auth state value: preshared key rejected.
pub const AUTH_FAILED: &[u8] = b"failed";

/// Why an envelope read ended without an envelope.
#[derive(Error, Debug)]
pub enum RecvError {
    /// The peer closed the connection at a frame boundary
    #[error("connection closed by peer")]
    Closed,

    /// Reading from the transport failed
    #[error("socket read failed: {0}")]
    Io(#[from] std::io::Error),

    /// The byte stream violated the wire protocol
    #[error("frame decode failed: {0}")]
    Wire(#[from] WireError),
}

/// Read one envelope from the transport.
///
/// Suspends until a complete frame is buffered or the transport signals
/// closure or error. Returns the envelope and the number of wire bytes it
/// occupied. Partial frames accumulate in `buffer` across calls.
pub async fn recv_envelope<R: AsyncRead + Unpin>(
    reader: &mut R,
    decoder: &mut EnvelopeDecoder,
    buffer: &mut BytesMut,
) -> Result<(Envelope, usize), RecvError> {
    loop {
        let before = buffer.len();
        if let Some(envelope) = decoder.decode(buffer)? {
            return Ok((envelope, before - buffer.len()));
        }

        let bytes_read = reader.read_buf(buffer).await?;
        if bytes_read == 0 {
            if buffer.is_empty() {
                return Err(RecvError::Closed);
            }
            // Mid-frame EOF: the stream ended inside a frame.
            return Err(RecvError::Wire(WireError::Malformed));
        }
        trace!(
            "read {} bytes, buffer now has {} bytes",
            bytes_read,
            buffer.len()
        );
    }
}

/// Run the server side of the preshared-key exchange.
///
/// Sends the auth challenge, then requires the peer's first envelope to
/// carry a matching key within `timeout`. On success an `auth: ok` envelope
/// is sent and the session may proceed; on mismatch an `auth: failed`
/// envelope is sent best-effort and the error closes the session.
pub async fn authenticate_peer<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    decoder: &mut EnvelopeDecoder,
    buffer: &mut BytesMut,
    expected_key: &str,
    timeout: Duration,
    max_frame_size: usize,
) -> anyhow::Result<()> {
    let challenge = Envelope::empty().with_metadata(AUTH_KEY, AUTH_REQUIRED.to_vec());
    let bytes = encode_envelope(&challenge, max_frame_size)?;
    stream.write_all(&bytes).await?;
    debug!("sent preshared-key challenge");

    let (first, _) = tokio::time::timeout(timeout, recv_envelope(stream, decoder, buffer))
        .await
        .map_err(|_| anyhow::anyhow!("preshared-key exchange timed out"))??;

    let supplied = first.metadata.get(PSK_KEY);
    if supplied.map(|v| v.as_slice()) == Some(expected_key.as_bytes()) {
        let accepted = Envelope::empty().with_metadata(AUTH_KEY, AUTH_OK.to_vec());
        let bytes = encode_envelope(&accepted, max_frame_size)?;
        stream.write_all(&bytes).await?;
        debug!("preshared key accepted");
        Ok(())
    } else {
        warn!("preshared key mismatch; rejecting peer");
        let rejected = Envelope::empty().with_metadata(AUTH_KEY, AUTH_FAILED.to_vec());
        if let Ok(bytes) = encode_envelope(&rejected, max_frame_size) {
            // Best effort; the session is ending either way.
            let _ = stream.write_all(&bytes).await;
        }
        anyhow::bail!("preshared key mismatch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_wire::DEFAULT_MAX_FRAME_SIZE;

    async fn client_recv(
        stream: &mut tokio::io::DuplexStream,
        decoder: &mut EnvelopeDecoder,
        buf: &mut BytesMut,
    ) -> Envelope {
        recv_envelope(stream, decoder, buf).await.unwrap().0
    }

    #[tokio::test]
    async fn test_psk_exchange_success() {
        let (mut server, mut client) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut decoder = EnvelopeDecoder::new();
            let mut buf = BytesMut::new();
            authenticate_peer(
                &mut server,
                &mut decoder,
                &mut buf,
                "0000000000000000",
                Duration::from_secs(2),
                DEFAULT_MAX_FRAME_SIZE,
            )
            .await
        });

        let mut decoder = EnvelopeDecoder::new();
        let mut buf = BytesMut::new();

        let challenge = client_recv(&mut client, &mut decoder, &mut buf).await;
        assert_eq!(challenge.metadata.get(AUTH_KEY).unwrap(), AUTH_REQUIRED);

        let reply = Envelope::empty().with_metadata(PSK_KEY, b"0000000000000000".to_vec());
        let bytes = encode_envelope(&reply, DEFAULT_MAX_FRAME_SIZE).unwrap();
        client.write_all(&bytes).await.unwrap();

        let verdict = client_recv(&mut client, &mut decoder, &mut buf).await;
        assert_eq!(verdict.metadata.get(AUTH_KEY).unwrap(), AUTH_OK);

        assert!(server_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_psk_exchange_mismatch() {
        let (mut server, mut client) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let mut decoder = EnvelopeDecoder::new();
            let mut buf = BytesMut::new();
            authenticate_peer(
                &mut server,
                &mut decoder,
                &mut buf,
                "correct-key",
                Duration::from_secs(2),
                DEFAULT_MAX_FRAME_SIZE,
            )
            .await
        });

        let mut decoder = EnvelopeDecoder::new();
        let mut buf = BytesMut::new();

        let _challenge = client_recv(&mut client, &mut decoder, &mut buf).await;

        let reply = Envelope::empty().with_metadata(PSK_KEY, b"wrong-key".to_vec());
        let bytes = encode_envelope(&reply, DEFAULT_MAX_FRAME_SIZE).unwrap();
        client.write_all(&bytes).await.unwrap();

        let verdict = client_recv(&mut client, &mut decoder, &mut buf).await;
        assert_eq!(verdict.metadata.get(AUTH_KEY).unwrap(), AUTH_FAILED);

        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_recv_envelope_eof_mid_frame() {
        let (mut server, mut client) = tokio::io::duplex(4096);

        let env = Envelope::new("truncated");
        let bytes = encode_envelope(&env, DEFAULT_MAX_FRAME_SIZE).unwrap();
        client.write_all(&bytes[..bytes.len() - 2]).await.unwrap();
        drop(client);

        let mut decoder = EnvelopeDecoder::new();
        let mut buf = BytesMut::new();
        let err = recv_envelope(&mut server, &mut decoder, &mut buf)
            .await
            .unwrap_err();
        assert!(matches!(err, RecvError::Wire(WireError::Malformed)));
    }
}
