//! TCP bus server
//!
//! One task reads frames per connection; every request is dispatched on its own
//! task, and all replies go through a single writer task per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use docstore_common::config::ServerConfig;
use docstore_common::error::Result;
use docstore_common::metrics;

use crate::frame::{codec, recover_inbox, Frame};
use crate::router::{Reply, ReplyError, Router};

type Subscriptions = Arc<DashMap<u64, CancellationToken>>;

/// Bus server
#[derive(Clone)]
pub struct BusServer {
    config: ServerConfig,
    router: Arc<Router>,
    shutdown: CancellationToken,
}

impl BusServer {
    /// Create a new bus server
    pub fn new(config: &ServerConfig, router: Arc<Router>) -> Self {
        Self {
            config: config.clone(),
            router,
            shutdown: CancellationToken::new(),
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("Bus server listening on {}", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, addr)) => {
                    let connection = Connection {
                        router: self.router.clone(),
                        max_frame_length: self.config.max_frame_length,
                        outbound_buffer: self.config.outbound_buffer.max(1),
                        cancel: self.shutdown.child_token(),
                        subscriptions: Arc::new(DashMap::new()),
                    };
                    tokio::spawn(async move {
                        if let Err(e) = connection.handle(socket, addr).await {
                            error!("Connection error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        info!("Bus server stopped accepting connections");
        Ok(())
    }

    /// Stop accepting connections and end every open connection
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down bus server");
        self.shutdown.cancel();
        Ok(())
    }
}

struct Connection {
    router: Arc<Router>,
    max_frame_length: usize,
    outbound_buffer: usize,
    cancel: CancellationToken,
    /// In-flight requests by inbox
    subscriptions: Subscriptions,
}

impl Connection {
    async fn handle(self, socket: TcpStream, addr: SocketAddr) -> Result<()> {
        debug!("New bus connection from {}", addr);
        metrics::connection_opened();

        let framed = Framed::new(socket, codec(self.max_frame_length));
        let (mut sink, mut stream) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Frame>(self.outbound_buffer);

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!("Failed to encode frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(bytes).await {
                    debug!("Write to {} failed: {}", addr, e);
                    break;
                }
            }
        });

        let subscriptions = self.subscriptions.clone();

        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => break,
                next = stream.next() => next,
            };
            let bytes = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    warn!("Invalid frame from {}: {}", addr, e);
                    break;
                }
                None => break,
            };

            match Frame::decode(&bytes) {
                Ok(Frame::Request { inbox, pattern }) => {
                    debug!("Request {} from {}", inbox, addr);
                    // Registered before dispatch so an early unsubscribe still applies
                    let token = self.cancel.child_token();
                    subscriptions.insert(inbox, token.clone());
                    let router = self.router.clone();
                    let tx = tx.clone();
                    let subscriptions = subscriptions.clone();
                    tokio::spawn(async move {
                        handle_request(router, inbox, pattern, tx, token).await;
                        subscriptions.remove(&inbox);
                    });
                }
                Ok(Frame::Unsubscribe { inbox }) => {
                    debug!("Unsubscribe {} from {}", inbox, addr);
                    if let Some(token) = subscriptions.get(&inbox) {
                        token.cancel();
                    }
                }
                Ok(other) => {
                    let error = ReplyError::invalid_request("Only request and unsubscribe frames are accepted");
                    let _ = tx.send(Frame::reply(other.inbox(), Err(error), true)).await;
                }
                Err(e) => match recover_inbox(&bytes) {
                    Some(inbox) => {
                        let error = ReplyError::invalid_request(e.to_string());
                        let _ = tx.send(Frame::reply(inbox, Err(error), true)).await;
                    }
                    None => warn!("Skipping malformed frame from {}: {}", addr, e),
                },
            }
        }

        for entry in subscriptions.iter() {
            entry.value().cancel();
        }
        metrics::connection_closed();
        debug!("Connection closed from {}", addr);
        Ok(())
    }
}

async fn handle_request(
    router: Arc<Router>,
    inbox: u64,
    pattern: serde_json::Value,
    tx: mpsc::Sender<Frame>,
    token: CancellationToken,
) {
    let reply = tokio::select! {
        () = token.cancelled() => return,
        reply = router.dispatch(pattern) => reply,
    };

    match reply {
        Reply::Single(result) => {
            let _ = tx.send(Frame::reply(inbox, result, true)).await;
        }
        Reply::Stream { ack, mut events } => {
            // The acknowledgment is queued before any event
            if tx.send(Frame::reply(inbox, Ok(ack), false)).await.is_err() {
                return;
            }

            metrics::subscription_opened();
            loop {
                let event = tokio::select! {
                    () = token.cancelled() => break,
                    event = events.next() => event,
                };
                match event {
                    Some(result) => {
                        metrics::record_change_delivered();
                        if tx.send(Frame::reply(inbox, result, false)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = tx.send(Frame::End { inbox }).await;
                        break;
                    }
                }
            }
            metrics::subscription_closed();
            debug!("Subscription {} finished", inbox);
        }
    }
}
