//! server::session
//!
//! One client connection from handshake to close.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use super::ServeError;
use crate::personality::{Personality, RequestHandler, Session, WatchSink};
use crate::proto::codec::{
    decode_connect_request, decode_request, encode_connect_response, encode_reply,
    encode_watcher_event,
};
use crate::proto::frame::{read_frame, write_frame};
use crate::proto::{CodecError, ConnectResponse, Request, ZkError, WATCH_XID};

/// Process-wide request gate of serialized dispatch.
pub(crate) type Gate = Option<Arc<Mutex<()>>>;

async fn admit(gate: &Gate) -> Option<OwnedMutexGuard<()>> {
    match gate {
        Some(gate) => Some(gate.clone().lock_owned().await),
        None => None,
    }
}

/// Close a handler while holding the gate.
async fn close(gate: &Gate, handler: &dyn RequestHandler) {
    let _admitted = admit(gate).await;
    handler.close().await;
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), ServeError> {
    write_frame(writer, payload).await.map_err(ServeError::Io)
}

/// Serve one connection until the client leaves or the personality's
/// scope is cancelled.
pub(crate) async fn run(
    stream: TcpStream,
    peer: SocketAddr,
    personality: Personality,
    gate: Gate,
) -> Result<(), ServeError> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();

    let Some(frame) = read_frame(&mut reader).await.map_err(ServeError::Io)? else {
        return Ok(());
    };
    let connect = decode_connect_request(&frame)?;
    let ctx = personality.ctx.clone();
    let (sink, mut events) = WatchSink::channel();

    let opened: Result<(Session, Box<dyn RequestHandler>), ZkError> = {
        let _admitted = admit(&gate).await;
        match personality.auth.authenticate(&ctx, &connect).await {
            Ok(session) => personality
                .handlers
                .new_handler(&ctx, &session, sink)
                .await
                .map(|handler| (session, handler)),
            Err(err) => Err(err),
        }
    };
    let (session, handler) = match opened {
        Ok(opened) => opened,
        Err(err) => {
            tracing::info!(%peer, error = %err, "session refused");
            send(&mut writer, &encode_connect_response(&ConnectResponse::rejected())).await?;
            return Ok(());
        }
    };
    let session_id = format!("{:#x}", session.id);
    if let Err(err) = send(&mut writer, &encode_connect_response(&session.connect_response())).await {
        close(&gate, handler.as_ref()).await;
        return Err(err);
    }
    tracing::debug!(%peer, session = %session_id, "session open");

    // Frames are read on their own task so a partially read frame is never
    // dropped when a watch event wins the select below.
    let (frames_tx, mut frames) = mpsc::channel(16);
    let read_task = tokio::spawn(async move {
        loop {
            let frame = read_frame(&mut reader).await;
            let done = !matches!(frame, Ok(Some(_)));
            if frames_tx.send(frame).await.is_err() || done {
                return;
            }
        }
    });

    let result = loop {
        tokio::select! {
            frame = frames.recv() => {
                let frame = match frame {
                    Some(Ok(Some(frame))) => frame,
                    Some(Ok(None)) | None => break Ok(()),
                    Some(Err(err)) => break Err(ServeError::Io(err)),
                };
                let (xid, request) = match decode_request(&frame) {
                    Ok(decoded) => decoded,
                    Err(CodecError::UnknownOpCode { xid, code }) => {
                        tracing::debug!(session = %session_id, code, "unsupported opcode");
                        if let Err(err) = send(&mut writer, &encode_reply(xid, 0, &Err(ZkError::Unimplemented))).await {
                            break Err(err);
                        }
                        continue;
                    }
                    Err(err) => break Err(err.into()),
                };

                let closing = matches!(request, Request::CloseSession);
                let op = request.op_code();
                let write = request.is_write();
                // Cancellation abandons a call still waiting on the backend.
                let served = async {
                    let _admitted = admit(&gate).await;
                    handler.handle(request).await
                };
                let result = tokio::select! {
                    result = served => result,
                    _ = ctx.cancelled() => break Ok(()),
                };
                let (zxid, result) = match result {
                    Ok(reply) => (reply.zxid, Ok(reply.response)),
                    Err(err) => (0, Err(err)),
                };
                tracing::trace!(session = %session_id, xid, %op, write, ok = result.is_ok(), "request served");
                if let Err(err) = send(&mut writer, &encode_reply(xid, zxid, &result)).await {
                    break Err(err);
                }
                if closing {
                    break Ok(());
                }
            }
            Some(event) = events.recv() => {
                if let Err(err) = send(&mut writer, &encode_watcher_event(WATCH_XID as i64, &event)).await {
                    break Err(err);
                }
            }
            _ = ctx.cancelled() => break Ok(()),
        }
    };

    read_task.abort();
    close(&gate, handler.as_ref()).await;
    tracing::debug!(%peer, session = %session_id, "session ended");
    result
}
