//! ACP reader task.
//!
//! Reads JSON-RPC messages from an agent's stdout and forwards them, in
//! arrival order, through a tokio [`mpsc`] channel to the connection's
//! supervisor.
//!
//! The reader is driven by [`FramedRead`] backed by [`AcpCodec`], which
//! enforces the 1 MiB per-line limit before any heap allocation for JSON
//! parsing and reassembles documents split across lines.
//!
//! Malformed frames and JSON documents that are not JSON-RPC messages are
//! logged at `WARN` and skipped; they do **not** terminate the reader.

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::{AcpCodec, Frame};
use crate::acp::message::Message;

/// ACP reader task: decodes `stdout` and emits [`Message`]s.
///
/// Returns when:
/// - `stdout` reaches EOF (the agent closed its end or exited),
/// - an I/O error occurs on the stream,
/// - `inbound_tx` is closed, or
/// - `cancel` is triggered.
///
/// Dropping `inbound_tx` on return is how the supervisor learns the stream
/// is finished.
pub async fn run_reader<R>(
    session_id: String,
    stdout: R,
    inbound_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, AcpCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id = session_id.as_str(), "acp reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(session_id = session_id.as_str(), "acp reader: EOF detected");
                        break;
                    }

                    Some(Err(e)) => {
                        warn!(session_id = session_id.as_str(), error = %e, "acp reader: IO error, stopping");
                        break;
                    }

                    Some(Ok(Frame::Malformed(reason))) => {
                        warn!(
                            session_id = session_id.as_str(),
                            error = reason.as_str(),
                            "acp reader: malformed frame, skipping"
                        );
                    }

                    Some(Ok(Frame::Json(value))) => match Message::from_value(value) {
                        Ok(message) => {
                            if inbound_tx.send(message).await.is_err() {
                                debug!(session_id = session_id.as_str(), "acp reader: inbound_tx closed, stopping");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(
                                session_id = session_id.as_str(),
                                error = %e,
                                "acp reader: not a JSON-RPC message, skipping"
                            );
                        }
                    },
                }
            }
        }
    }
}
