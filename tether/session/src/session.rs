//! Per-connection session task.
//!
//! One task owns each accepted connection for its whole life: it runs the
//! preshared-key gate, registers the peer, then multiplexes outbound
//! commands and inbound frames in a single select loop until something
//! ends the session.

use crate::events::DisconnectReason;
use crate::handshake::{authenticate_peer, recv_envelope, RecvError};
use crate::registry::{next_session_id, ClientHandle};
use crate::server::Shared;
use crate::transport::IoStream;
use bytes::{Bytes, BytesMut};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tether_wire::{encode_envelope, Envelope, EnvelopeDecoder, WireError};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Metadata key on a best-effort error reply to a failed sync request.
pub const ERROR_KEY: &str = "error";

/// Commands routed into a session task by the rest of the server.
pub enum SessionCommand {
    /// Write a pre-encoded frame to the peer. `done` (when present) fires
    /// with the outcome once the write completes or fails.
    Send {
        frame: Bytes,
        done: Option<oneshot::Sender<bool>>,
    },
    /// Tear the session down with the given reason.
    Close { reason: DisconnectReason },
}

/// Drive one client connection to completion.
pub(crate) async fn run_session(mut stream: IoStream, peer: String, shared: Arc<Shared>) {
    let mut decoder = EnvelopeDecoder::with_max_frame_size(shared.max_frame_size);
    let mut buffer = BytesMut::with_capacity(8 * 1024);

    if let Some(expected) = shared.preshared_key() {
        let gate = authenticate_peer(
            &mut stream,
            &mut decoder,
            &mut buffer,
            &expected,
            shared.auth_timeout,
            shared.max_frame_size,
        )
        .await;
        if let Err(err) = gate {
            warn!(%peer, "authentication failed: {err:#}");
            shared
                .observers
                .notify_disconnected(&peer, DisconnectReason::AuthFailure);
            return;
        }
    }

    let session_id = next_session_id();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(64);
    let superseded = shared
        .registry
        .register(ClientHandle {
            peer: peer.clone(),
            session_id,
            cmd_tx,
        })
        .await;
    if let Some(old) = superseded {
        debug!(%peer, "peer reconnected, closing superseded session");
        let _ = old
            .cmd_tx
            .send(SessionCommand::Close {
                reason: DisconnectReason::Superseded,
            })
            .await;
    }

    shared.stats.record_connection();
    shared.observers.notify_connected(&peer);
    info!(%peer, session_id, "client connected");

    let (mut reader, mut writer) = tokio::io::split(stream);

    // Frames pipelined behind the handshake are already sitting in
    // `buffer`; recv_envelope drains those before touching the socket.
    let idle_limit = shared
        .idle_timeout
        .unwrap_or(Duration::from_secs(365 * 24 * 3600));
    let idle = tokio::time::sleep(idle_limit);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Send { frame, done }) => {
                    let outcome = writer.write_all(&frame).await;
                    let ok = outcome.is_ok();
                    if ok {
                        shared.stats.record_sent(frame.len() as u64);
                    }
                    if let Some(done) = done {
                        let _ = done.send(ok);
                    }
                    if let Err(err) = outcome {
                        warn!(%peer, "write failed: {err}");
                        break DisconnectReason::SocketError;
                    }
                }
                Some(SessionCommand::Close { reason }) => break reason,
                None => break DisconnectReason::Shutdown,
            },

            received = recv_envelope(&mut reader, &mut decoder, &mut buffer) => {
                match received {
                    Ok((envelope, wire_bytes)) => {
                        shared.stats.record_received(wire_bytes as u64);
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_limit);
                        if let Err(err) =
                            dispatch(&shared, &peer, envelope, &mut writer).await
                        {
                            warn!(%peer, "reply write failed: {err}");
                            break DisconnectReason::SocketError;
                        }
                    }
                    Err(RecvError::Closed) => break DisconnectReason::PeerClosed,
                    Err(RecvError::Io(err)) => {
                        warn!(%peer, "read failed: {err}");
                        break DisconnectReason::SocketError;
                    }
                    Err(RecvError::Wire(err)) => {
                        warn!(%peer, "protocol violation: {err}");
                        break DisconnectReason::SocketError;
                    }
                }
            },

            _ = &mut idle => {
                debug!(%peer, "idle timeout elapsed");
                break DisconnectReason::Timeout;
            }
        }
    };

    teardown(&shared, &peer, session_id, reason).await;
}

/// Tear down a finished session.
///
/// Unregistration is guarded by session id, and pending calls are failed
/// only when this session still owned the registry entry: a superseded
/// session must leave calls parked for its replacement untouched.
async fn teardown(shared: &Shared, peer: &str, session_id: u64, reason: DisconnectReason) {
    let owned = shared.registry.unregister(peer, session_id).await;
    if owned {
        shared.correlator.fail_peer(peer);
    }
    shared.observers.notify_disconnected(peer, reason);
    info!(%peer, session_id, %reason, "client disconnected");
}

/// Route one inbound envelope.
///
/// Sync replies feed the correlator, sync requests run the reply handler
/// and answer inline on this session's writer, everything else goes to the
/// message observers. Only a failed reply write is an error; handler
/// faults are answered best-effort and do not end the session.
async fn dispatch(
    shared: &Shared,
    peer: &str,
    envelope: Envelope,
    writer: &mut WriteHalf<IoStream>,
) -> std::io::Result<()> {
    if envelope.is_sync_reply() {
        if let Some(corr_id) = envelope.corr_id {
            if let Some(latency) = shared.correlator.complete(corr_id, envelope) {
                debug!(%peer, corr_id, ?latency, "sync reply delivered");
            }
        }
        return Ok(());
    }

    if envelope.is_sync_request() {
        if envelope.is_expired() {
            debug!(%peer, corr_id = ?envelope.corr_id, "dropping expired sync request");
            return Ok(());
        }
        let corr_id = match envelope.corr_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let reply = answer_sync_request(shared, peer, envelope).into_sync_reply(corr_id);
        let frame = match encode_envelope(&reply, shared.max_frame_size) {
            Ok(frame) => frame,
            Err(err @ WireError::Size(_)) => {
                warn!(%peer, corr_id, "reply exceeds frame limit: {err}");
                let fallback = Envelope::empty()
                    .with_metadata(ERROR_KEY, err.to_string().into_bytes())
                    .into_sync_reply(corr_id);
                match encode_envelope(&fallback, shared.max_frame_size) {
                    Ok(frame) => frame,
                    Err(_) => return Ok(()),
                }
            }
            Err(_) => return Ok(()),
        };
        writer.write_all(&frame).await?;
        shared.stats.record_sent(frame.len() as u64);
        return Ok(());
    }

    shared.observers.notify_message(peer, &envelope);
    Ok(())
}

/// Run the reply handler, shielding the session from its faults.
fn answer_sync_request(shared: &Shared, peer: &str, request: Envelope) -> Envelope {
    let handler = shared
        .reply_handler
        .read()
        .ok()
        .and_then(|slot| slot.clone());
    let handler = match handler {
        Some(handler) => handler,
        None => {
            debug!(%peer, "sync request with no reply handler installed");
            return Envelope::empty().with_metadata(ERROR_KEY, b"no reply handler".to_vec());
        }
    };

    match catch_unwind(AssertUnwindSafe(|| handler.handle(peer, request))) {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => {
            warn!(%peer, "reply handler failed: {err:#}");
            Envelope::empty().with_metadata(ERROR_KEY, format!("{err:#}").into_bytes())
        }
        Err(_) => {
            warn!(%peer, "reply handler panicked");
            Envelope::empty().with_metadata(ERROR_KEY, b"reply handler panicked".to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerConfig;
    use tokio::sync::oneshot::error::TryRecvError;

    fn handle(peer: &str, session_id: u64) -> ClientHandle {
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        ClientHandle {
            peer: peer.to_string(),
            session_id,
            cmd_tx,
        }
    }

    #[tokio::test]
    async fn test_superseded_teardown_spares_replacement_calls() {
        let shared = Shared::new(&ServerConfig::default());
        let peer = "10.0.0.1:5000";

        shared.registry.register(handle(peer, 1)).await;
        // Peer reconnects; the new session takes over the registry entry
        // and a caller parks a sync request against it.
        shared.registry.register(handle(peer, 2)).await;
        let (_corr_id, mut reply_rx) = shared.correlator.register(peer);

        // The superseded session winding down must not fail that call.
        teardown(&shared, peer, 1, DisconnectReason::Superseded).await;
        assert!(shared.registry.contains(peer).await);
        assert!(matches!(reply_rx.try_recv(), Err(TryRecvError::Empty)));

        // The owning session's teardown does.
        teardown(&shared, peer, 2, DisconnectReason::PeerClosed).await;
        assert!(shared.registry.is_empty().await);
        assert!(reply_rx.await.is_err());
    }
}
