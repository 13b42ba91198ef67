//! TCP bus client

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use docstore_common::error::Result;

use crate::frame::{codec, Frame, DEFAULT_MAX_FRAME_LENGTH};
use crate::router::ReplyError;

type Pending = Arc<DashMap<u64, mpsc::UnboundedSender<Frame>>>;

/// Client side of the bus
pub struct BusClient {
    tx: mpsc::Sender<Frame>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_inbox: AtomicU64,
    timeout: Option<Duration>,
    tasks: Vec<JoinHandle<()>>,
}

impl BusClient {
    /// Connect to a bus server
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        let peer = socket.peer_addr()?;
        debug!("Connected to bus at {}", peer);

        let (mut sink, mut stream) = Framed::new(socket, codec(DEFAULT_MAX_FRAME_LENGTH)).split();
        let (tx, mut rx) = mpsc::channel::<Frame>(256);
        let pending: Pending = Arc::new(DashMap::new());

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Failed to encode frame: {}", e);
                        continue;
                    }
                };
                if sink.send(bytes).await.is_err() {
                    break;
                }
            }
        });

        let routes = pending.clone();
        let closed = Arc::new(AtomicBool::new(false));
        let reader_closed = closed.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(bytes)) = stream.next().await {
                let frame = match Frame::decode(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Skipping malformed frame from {}: {}", peer, e);
                        continue;
                    }
                };
                let inbox = frame.inbox();
                let last = matches!(frame, Frame::End { .. } | Frame::Reply { is_final: true, .. });
                if let Some(route) = routes.get(&inbox) {
                    let _ = route.send(frame);
                }
                if last {
                    routes.remove(&inbox);
                }
            }
            debug!("Bus connection to {} closed", peer);
            reader_closed.store(true, Ordering::SeqCst);
            // Dropping the senders wakes every waiting caller
            routes.clear();
        });

        Ok(Self {
            tx,
            pending,
            closed,
            next_inbox: AtomicU64::new(1),
            timeout: None,
            tasks: vec![writer, reader],
        })
    }

    /// Fail `act` calls that get no reply within `timeout`
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// False once the server side has gone away
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn send(
        &self,
        pattern: Value,
    ) -> std::result::Result<(u64, mpsc::UnboundedReceiver<Frame>), ReplyError> {
        if !self.is_connected() {
            return Err(ReplyError::connection_closed());
        }
        let inbox = self.next_inbox.fetch_add(1, Ordering::Relaxed);
        let (route, replies) = mpsc::unbounded_channel();
        self.pending.insert(inbox, route);

        if self.tx.send(Frame::Request { inbox, pattern }).await.is_err() {
            self.pending.remove(&inbox);
            return Err(ReplyError::connection_closed());
        }
        Ok((inbox, replies))
    }

    /// Send a pattern and wait for its first reply
    pub async fn act(&self, pattern: Value) -> std::result::Result<Value, ReplyError> {
        let (inbox, mut replies) = self.send(pattern).await?;

        let first = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, replies.recv()).await {
                Ok(first) => first,
                Err(_) => {
                    self.pending.remove(&inbox);
                    let _ = self.tx.try_send(Frame::Unsubscribe { inbox });
                    return Err(ReplyError::timeout(format!(
                        "No reply within {}ms",
                        timeout.as_millis()
                    )));
                }
            },
            None => replies.recv().await,
        };

        match first {
            Some(Frame::Reply {
                result,
                error,
                is_final,
                ..
            }) => {
                if !is_final {
                    // Only the first reply of a stream is wanted
                    self.pending.remove(&inbox);
                    let _ = self.tx.try_send(Frame::Unsubscribe { inbox });
                }
                error.map_or(Ok(result), Err)
            }
            _ => Err(ReplyError::connection_closed()),
        }
    }

    /// Send a pattern and stream every reply, starting with the first
    pub async fn subscribe(&self, pattern: Value) -> std::result::Result<Subscription, ReplyError> {
        let (inbox, replies) = self.send(pattern).await?;
        Ok(Subscription {
            inbox,
            replies,
            tx: self.tx.clone(),
            pending: self.pending.clone(),
            done: false,
        })
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Replies of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    inbox: u64,
    replies: mpsc::UnboundedReceiver<Frame>,
    tx: mpsc::Sender<Frame>,
    pending: Pending,
    done: bool,
}

impl Subscription {
    pub fn inbox(&self) -> u64 {
        self.inbox
    }
}

impl Stream for Subscription {
    type Item = std::result::Result<Value, ReplyError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.replies.poll_recv(cx) {
            Poll::Ready(Some(Frame::Reply {
                result,
                error,
                is_final,
                ..
            })) => {
                self.done = is_final;
                Poll::Ready(Some(error.map_or(Ok(result), Err)))
            }
            Poll::Ready(Some(Frame::End { .. })) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(_)) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(ReplyError::connection_closed())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.done {
            self.pending.remove(&self.inbox);
            let _ = self.tx.try_send(Frame::Unsubscribe { inbox: self.inbox });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{ErrorCode, Handler, Reply, Router};
    use crate::server::BusServer;
    use async_trait::async_trait;
    use docstore_common::config::ServerConfig;
    use futures::stream;
    use serde_json::json;
    use tokio::net::TcpListener;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn call(&self, msg: Value) -> Reply {
            Reply::Single(Ok(msg["value"].clone()))
        }
    }

    struct Ticks;

    #[async_trait]
    impl Handler for Ticks {
        async fn call(&self, msg: Value) -> Reply {
            let count = msg["count"].as_u64().unwrap_or(0);
            Reply::Stream {
                ack: json!(true),
                events: stream::iter((0..count).map(|n| Ok(json!(n)))).boxed(),
            }
        }
    }

    struct Forever;

    #[async_trait]
    impl Handler for Forever {
        async fn call(&self, _msg: Value) -> Reply {
            Reply::Stream {
                ack: json!(true),
                events: stream::pending::<std::result::Result<Value, ReplyError>>().boxed(),
            }
        }
    }

    async fn start() -> (BusServer, std::net::SocketAddr) {
        let router = Arc::new(Router::new());
        router.add("test", "echo", Arc::new(Echo)).unwrap();
        router.add("test", "ticks", Arc::new(Ticks)).unwrap();
        router.add("test", "forever", Arc::new(Forever)).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = BusServer::new(&ServerConfig::default(), router);
        let running = server.clone();
        tokio::spawn(async move { running.serve(listener).await });
        (server, addr)
    }

    #[tokio::test]
    async fn test_act_round_trip() {
        let (server, addr) = start().await;
        let client = BusClient::connect(addr).await.unwrap();

        let reply = client
            .act(json!({"topic": "test", "cmd": "echo", "value": {"a": 1}}))
            .await
            .unwrap();
        assert_eq!(reply, json!({"a": 1}));

        let err = client.act(json!({"topic": "test", "cmd": "nope"})).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::PatternNotFound);

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_requests() {
        let (_server, addr) = start().await;
        let client = Arc::new(BusClient::connect(addr).await.unwrap());

        let calls = (0..20).map(|n| {
            let client = client.clone();
            async move {
                client
                    .act(json!({"topic": "test", "cmd": "echo", "value": n}))
                    .await
                    .unwrap()
            }
        });
        let replies = futures::future::join_all(calls).await;
        for (n, reply) in replies.into_iter().enumerate() {
            assert_eq!(reply, json!(n));
        }
    }

    #[tokio::test]
    async fn test_subscription_ack_then_events() {
        let (_server, addr) = start().await;
        let client = BusClient::connect(addr).await.unwrap();

        let sub = client
            .subscribe(json!({"topic": "test", "cmd": "ticks", "count": 3}))
            .await
            .unwrap();
        let replies: Vec<_> = sub.map(std::result::Result::unwrap).collect().await;
        assert_eq!(replies, vec![json!(true), json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_dropped_subscription_keeps_connection_usable() {
        let (_server, addr) = start().await;
        let client = BusClient::connect(addr).await.unwrap();

        let mut sub = client
            .subscribe(json!({"topic": "test", "cmd": "forever"}))
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap(), json!(true));
        drop(sub);

        let reply = client
            .act(json!({"topic": "test", "cmd": "echo", "value": "still here"}))
            .await
            .unwrap();
        assert_eq!(reply, json!("still here"));
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_reply() {
        let (_server, addr) = start().await;
        let socket = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(socket, codec(DEFAULT_MAX_FRAME_LENGTH));

        framed
            .send(bytes::Bytes::from_static(br#"{"type":"request","inbox":9}"#))
            .await
            .unwrap();
        let bytes = framed.next().await.unwrap().unwrap();
        let Frame::Reply { inbox, error, is_final, .. } = Frame::decode(&bytes).unwrap() else {
            panic!("expected reply");
        };
        assert_eq!(inbox, 9);
        assert!(is_final);
        assert_eq!(error.unwrap().code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_act_fails_when_server_goes_away() {
        let (server, addr) = start().await;
        let client = BusClient::connect(addr)
            .await
            .unwrap()
            .with_timeout(Duration::from_secs(5));
        server.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = client
            .act(json!({"topic": "test", "cmd": "echo", "value": 1}))
            .await
            .unwrap_err();
        assert!(!client.is_connected());
        assert_eq!(err.code, ErrorCode::ConnectionClosed);
    }
}
