//! Daemon accept loop.
//!
//! One task per connection: read a framed build request, check the shared
//! secret, hand the deserialized flag set to the dispatcher, frame the
//! response back. While a build is in flight a watchdog read detects the
//! peer hanging up and cancels the request.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::dispatcher::{CompileRequest, Dispatcher};
use crate::error::DispatchError;
use crate::protocol::{read_frame, write_frame, ProtocolError, RemoteRequest, RemoteResponse};

/// Framed-request server over TCP.
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    secret: Option<String>,
    listener: TcpListener,
    shutdown: Arc<Notify>,
}

impl Server {
    /// Binds the listen address without accepting yet.
    pub async fn bind(
        dispatcher: Arc<Dispatcher>,
        secret: Option<String>,
        listen: &str,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        Ok(Self {
            dispatcher,
            secret,
            listener,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// The bound address; useful when binding to port zero.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Notifying this handle makes [`run`](Self::run) return.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Accepts connections until shut down.
    pub async fn run(self) -> std::io::Result<()> {
        info!(addr = %self.local_addr()?, "daemon listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "connection accepted");
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let secret = self.secret.clone();
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(dispatcher, secret, stream).await {
                                    debug!(%peer, error = %e, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("shutdown requested, no longer accepting");
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_connection(
    dispatcher: Arc<Dispatcher>,
    secret: Option<String>,
    mut stream: TcpStream,
) -> Result<(), ProtocolError> {
    let request: RemoteRequest = read_frame(&mut stream).await?;
    if secret.is_some() && request.secret != secret {
        warn!("rejecting build request with bad shared secret");
        write_frame(&mut stream, &RemoteResponse::internal("unauthorized")).await?;
        return Ok(());
    }

    let compile = CompileRequest::new(request.flags, request.source);
    let request_id = compile.id;
    let cancel = compile.cancel.clone();

    let (mut read_half, mut write_half) = stream.into_split();
    // The peer sends nothing after its request frame, so any read completion
    // means it hung up: cancel the request instead of building for nobody.
    let watchdog = tokio::spawn(async move {
        let mut buf = [0u8; 1];
        if matches!(read_half.read(&mut buf).await, Ok(0) | Err(_)) {
            cancel.cancel();
        }
    });

    let result = dispatcher.dispatch(compile).await;
    watchdog.abort();

    let response = match result {
        Ok(reply) => RemoteResponse::ok(reply.object.as_slice().to_vec(), reply.stderr.as_slice().to_vec()),
        Err(DispatchError::BuildFailed { status, stderr }) => {
            RemoteResponse::build_failed(status, stderr)
        }
        Err(DispatchError::Cancelled) => {
            debug!(request = %request_id, "peer went away, dropping response");
            return Ok(());
        }
        Err(e) => RemoteResponse::internal(e.to_string()),
    };
    write_frame(&mut write_half, &response).await?;
    Ok(())
}
