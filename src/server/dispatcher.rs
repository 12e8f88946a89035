//! Ordered response dispatch for one connection.
//!
//! Every request line is handed to the handler right away, on its own task, so
//! requests on a connection are processed concurrently. The pending results
//! are queued in arrival order and a single drain task writes them out one at
//! a time, so a fast request never overtakes a slow one that arrived earlier.

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, warn};

use crate::error::Result;
use crate::protocol::Response;

/// Asynchronous request handler: one line in, one response out.
pub type Handler = Arc<dyn Fn(String) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

type Pending = JoinHandle<Result<Response>>;

/// Writes handler results to a connection in request order.
pub struct Dispatcher {
    handler: Handler,
    queue: mpsc::UnboundedSender<Pending>,
    drain: JoinHandle<()>,
    closed: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Create a dispatcher writing to `writer`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<W>(writer: W, handler: Handler) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (queue, rx) = mpsc::unbounded_channel();
        let (closed_tx, closed) = watch::channel(false);
        let drain = tokio::spawn(drain(rx, writer, closed_tx));

        Self {
            handler,
            queue,
            drain,
            closed,
        }
    }

    /// Process a request line.
    ///
    /// The handler starts immediately; its response is written once every
    /// earlier response on this connection has been written.
    pub fn handle(&self, line: String) {
        let handler = self.handler.clone();
        let pending = tokio::spawn(async move { handler(line).await });

        if self.queue.send(pending).is_err() {
            // Only possible if the drain task itself died.
            warn!("Dispatch queue closed, dropping request");
        }
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// A receiver that flips to `true` when the connection is torn down.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    /// Stop accepting requests and wait until every queued one is resolved.
    pub async fn close(self) {
        drop(self.queue);
        if let Err(e) = self.drain.await {
            warn!(error = %e, "Dispatch drain task failed");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Turn whatever the handler produced into a writable response.
fn resolve(outcome: std::result::Result<Result<Response>, JoinError>) -> Response {
    let response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => Response::internal_error(e),
        Err(e) if e.is_panic() => Response::internal_error(panic_message(e.into_panic())),
        Err(e) => Response::internal_error(e),
    };

    if response.message.contains('\n') {
        return Response::internal_error("Message contained newlines");
    }
    response
}

async fn drain<W>(
    mut queue: mpsc::UnboundedReceiver<Pending>,
    mut writer: W,
    closed: watch::Sender<bool>,
) where
    W: AsyncWrite + Unpin,
{
    debug!("Beginning dispatch drain");

    let mut writable = true;
    while let Some(pending) = queue.recv().await {
        let response = resolve(pending.await);

        if !writable {
            debug!(status = %response.status, "Connection closed, skipping response");
            continue;
        }

        let line = response.to_line();
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            debug!(error = %e, "Write failed, tearing down connection");
            writable = false;
            closed.send_replace(true);
            continue;
        }

        if response.is_error() {
            debug!(message = %response.message, "Error response written, tearing down connection");
            let _ = writer.shutdown().await;
            writable = false;
            closed.send_replace(true);
        }
    }

    debug!("Finished dispatch drain");
}
