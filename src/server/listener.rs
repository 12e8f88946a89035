//! TCP listener and per-connection plumbing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::SplitStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use super::dispatcher::{Dispatcher, Handler};
use super::service::DivvyService;
use crate::error::Result;
use crate::metrics::Instrumenter;

/// Default port the protocol server listens on.
pub const DEFAULT_PORT: u16 = 8321;

/// The protocol server.
pub struct Server {
    listener: TcpListener,
    handler: Handler,
    instrumenter: Arc<dyn Instrumenter>,
    connections: Arc<AtomicUsize>,
}

impl Server {
    /// Bind the protocol listener.
    ///
    /// The credit backend behind `service` must already be initialized.
    pub async fn bind(addr: SocketAddr, service: DivvyService) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let instrumenter = service.instrumenter().clone();

        Ok(Self {
            listener,
            handler: Arc::new(service).into_handler(),
            instrumenter,
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle on the open connection count.
    pub fn connections(&self) -> Arc<AtomicUsize> {
        self.connections.clone()
    }

    /// Serve until the process exits.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until the provided signal resolves.
    ///
    /// Connections that are already open keep being served after the signal.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        info!(addr = %self.local_addr()?, "Divvy server listening");
        tokio::pin!(signal);

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Stopped accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection = Connection {
                            handler: self.handler.clone(),
                            instrumenter: self.instrumenter.clone(),
                            connections: self.connections.clone(),
                        };
                        tokio::spawn(connection.run(stream, peer));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }

        Ok(())
    }
}

/// Shared state a connection task needs.
struct Connection {
    handler: Handler,
    instrumenter: Arc<dyn Instrumenter>,
    connections: Arc<AtomicUsize>,
}

impl Connection {
    async fn run(self, stream: TcpStream, peer: SocketAddr) {
        let open = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        self.instrumenter.gauge_current_connections(open);
        debug!(peer = %peer, connections = open, "Connection opened");

        let (reader, writer) = stream.into_split();
        let dispatcher = Dispatcher::new(writer, self.handler.clone());
        let mut closed = dispatcher.closed();
        let mut lines = SplitStream::new(BufReader::new(reader).split(b'\n'));

        loop {
            tokio::select! {
                _ = closed.wait_for(|closed| *closed) => break,
                next = lines.next() => match next {
                    Some(Ok(bytes)) => {
                        let line = decode_line(&bytes);
                        if !line.is_empty() {
                            dispatcher.handle(line);
                        }
                    }
                    Some(Err(e)) => {
                        debug!(peer = %peer, error = %e, "Connection read error");
                        break;
                    }
                    None => break,
                }
            }
        }

        let open = self.connections.fetch_sub(1, Ordering::SeqCst) - 1;
        self.instrumenter.gauge_current_connections(open);
        debug!(peer = %peer, connections = open, "Connection closed");

        // Requests already read still get answered if the peer is listening.
        dispatcher.close().await;
    }
}

/// Decode one request line. Invalid UTF-8 is replaced, not rejected.
fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
