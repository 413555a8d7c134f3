use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::responder::ProtocolResponder;

const MAX_REQUEST_LINE_BYTES: u64 = 1_024;

/// Accepts one protocol connection at a time and serves it synchronously:
/// one request line in, one response line out, connection closed.
pub struct ProtocolListener {
    listener: TcpListener,
    responder: Arc<ProtocolResponder>,
}

impl ProtocolListener {
    /// Binds the protocol listener to the provided local address.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Bind`] when the socket cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        responder: Arc<ProtocolResponder>,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        Ok(Self {
            listener,
            responder,
        })
    }

    /// Returns the local bound address of the listener.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::LocalAddr`] if the runtime cannot retrieve it.
    pub fn local_addr(&self) -> Result<SocketAddr, ListenerError> {
        self.listener
            .local_addr()
            .map_err(|source| ListenerError::LocalAddr { source })
    }

    /// Serves connections until a shutdown signal is received. Per-
    /// connection failures are logged and never stop the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Accept`] when the accept call itself fails.
    pub async fn run_until_shutdown(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ListenerError> {
        loop {
            select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) =
                        accepted.map_err(|source| ListenerError::Accept { source })?;
                    if let Err(error) = self.serve_connection(stream).await {
                        warn!(%peer, %error, "failed to serve protocol connection");
                    }
                }
            }
        }
    }

    async fn serve_connection(&self, stream: TcpStream) -> Result<(), std::io::Error> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half).take(MAX_REQUEST_LINE_BYTES);

        let mut request_line = String::new();
        let read = reader.read_line(&mut request_line).await?;
        if read == 0 {
            debug!("connection closed before sending a request line");
            return Ok(());
        }

        let request = request_line.trim_end_matches(['\r', '\n']);
        debug!(request, "handling protocol request");
        let mut response = self.responder.handle(request).await;
        response.push('\n');

        write_half.write_all(response.as_bytes()).await?;
        write_half.flush().await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind protocol listener at {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("failed to resolve local listener address: {source}")]
    LocalAddr { source: std::io::Error },
    #[error("failed to accept protocol connection: {source}")]
    Accept { source: std::io::Error },
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::sync::watch;

    use super::ProtocolListener;
    use crate::responder::{ProtocolResponder, RESP_BAD_REQUEST, RESP_OK};

    fn localhost_any() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }

    async fn request(addr: SocketAddr, line: &str) -> String {
        let mut stream = TcpStream::connect(addr)
            .await
            .unwrap_or_else(|error| panic!("connect failed: {error}"));
        stream
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap_or_else(|error| panic!("write failed: {error}"));

        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        let _ = reader
            .read_line(&mut response)
            .await
            .unwrap_or_else(|error| panic!("read failed: {error}"));
        response.trim_end().to_owned()
    }

    #[tokio::test]
    async fn serves_one_request_per_connection_and_stays_alive() {
        let responder = Arc::new(ProtocolResponder::new(Duration::from_millis(50)));
        let listener = ProtocolListener::bind(localhost_any(), responder)
            .await
            .unwrap_or_else(|error| panic!("bind failed: {error}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|error| panic!("local_addr failed: {error}"));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(listener.run_until_shutdown(shutdown_rx));

        assert_eq!(request(addr, "HELLO").await, RESP_OK);
        assert_eq!(request(addr, "GARBAGE LINE").await, RESP_BAD_REQUEST);
        assert_eq!(request(addr, "MADDR 10.0.0.7").await, RESP_OK);
        assert_eq!(request(addr, "HELLO").await, RESP_OK);

        let _ = shutdown_tx.send(true);
        let joined = server.await;
        assert!(matches!(joined, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn empty_connection_does_not_stop_the_listener() {
        let responder = Arc::new(ProtocolResponder::new(Duration::from_millis(50)));
        let listener = ProtocolListener::bind(localhost_any(), responder)
            .await
            .unwrap_or_else(|error| panic!("bind failed: {error}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|error| panic!("local_addr failed: {error}"));

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _server = tokio::spawn(listener.run_until_shutdown(shutdown_rx));

        // Connect and hang up without sending anything.
        drop(
            TcpStream::connect(addr)
                .await
                .unwrap_or_else(|error| panic!("connect failed: {error}")),
        );

        assert_eq!(request(addr, "HELLO").await, RESP_OK);
    }
}
