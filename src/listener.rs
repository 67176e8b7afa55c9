use crate::connection::{handle_connection, ListenContext};
use crate::error::describe_io_error;
use crate::worker::Worker;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, info_span, Instrument};

/// Delay before a failed listener is bound again
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

const BACKLOG: u32 = 1024;

/// One listening socket feeding connections to a worker
pub struct ProxyListener {
    addr: SocketAddr,
    context: ListenContext,
    tls_acceptor: Option<TlsAcceptor>,
    worker: Arc<Worker>,
}

impl ProxyListener {
    pub fn new(addr: SocketAddr, context: ListenContext, worker: Arc<Worker>) -> Self {
        Self {
            addr,
            context,
            tls_acceptor: None,
            worker,
        }
    }

    /// Serve TLS on this listener
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Bind and serve until shutdown, re-binding after any bind or accept
    /// failure.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let failure = match bind(self.addr) {
                Ok(listener) => {
                    info!(
                        addr = %self.addr,
                        target_port = self.context.mapping.target,
                        tls = self.tls_acceptor.is_some(),
                        "Proxy listening"
                    );
                    match self.serve(listener, &mut shutdown_rx).await {
                        Ok(()) => return,
                        Err(e) => {
                            error!(addr = %self.addr, error = %describe_io_error(&e), "Failed to accept connection");
                            e
                        }
                    }
                }
                Err(e) => {
                    error!(addr = %self.addr, error = %describe_io_error(&e), "Failed to bind listener");
                    e
                }
            };
            debug!(addr = %self.addr, error = %failure, "Restarting listener");

            tokio::select! {
                _ = tokio::time::sleep(RETRY_DELAY) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => return,
            }
        }
    }

    /// Accept connections from an already bound socket.
    ///
    /// Returns `Ok` on shutdown and the error when accepting fails.
    pub async fn serve(&self, listener: TcpListener, shutdown_rx: &mut watch::Receiver<bool>) -> io::Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = result?;
                    self.spawn_connection(stream, peer);
                }
                _ = wait_for_shutdown(shutdown_rx) => {
                    info!(addr = %self.addr, "Proxy listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let context = self.context;
        let worker = Arc::clone(&self.worker);
        let tls_acceptor = self.tls_acceptor.clone();
        let span = info_span!(
            "conn",
            id = %uuid::Uuid::new_v4(),
            peer = %peer,
            port = context.mapping.listen
        );

        tokio::spawn(
            async move {
                let _ = stream.set_nodelay(true);
                match tls_acceptor {
                    Some(acceptor) => {
                        let handshake_timeout = worker.limits().header_timeout;
                        match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
                            Ok(Ok(tls_stream)) => handle_connection(tls_stream, peer, context, worker).await,
                            Ok(Err(e)) => debug!(error = %e, "TLS handshake failed"),
                            Err(_) => debug!("TLS handshake timed out"),
                        }
                    }
                    None => handle_connection(stream, peer, context, worker).await,
                }
            }
            .instrument(span),
        );
    }
}

/// Bind with address and port reuse so several workers can share a port
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

/// Resolves once shutdown is requested or the sender is gone
pub async fn wait_for_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}
