//! ACP writer task.
//!
//! Receives outbound [`Message`]s from a tokio [`mpsc`] channel and writes
//! each one to the agent's `stdin` as a single NDJSON line through a
//! [`FramedWrite`] backed by [`AcpCodec`].

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::AcpCodec;
use crate::acp::message::Message;
use crate::Result;

/// ACP writer task: serialises outbound messages and writes to `stdin`.
///
/// The task exits cleanly when:
/// - `cancel` is triggered (teardown), or
/// - `msg_rx` is closed (all senders dropped).
///
/// # Errors
///
/// - [`AppError::Protocol`](crate::AppError::Protocol) if a message cannot
///   be serialised.
/// - [`AppError::Io`](crate::AppError::Io) if the write to `stdin` fails
///   (e.g. the agent process has exited).
pub async fn run_writer<W>(
    session_id: String,
    stdin: W,
    mut msg_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut framed = FramedWrite::new(stdin, AcpCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id = session_id.as_str(), "acp writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(message) = msg else {
                    debug!(session_id = session_id.as_str(), "acp writer: message channel closed, stopping");
                    break;
                };

                if let Err(e) = framed.send(message).await {
                    warn!(session_id = session_id.as_str(), error = %e, "acp writer: write to stdin failed");
                    return Err(e);
                }
            }
        }
    }

    Ok(())
}
