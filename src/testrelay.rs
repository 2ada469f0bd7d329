//! a scriptable in-process relay for tests
//!
//! accepts WebSocket connections, exposes every frame a client sends, and
//! lets the test push arbitrary frames (or a close) to connected clients.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Clone, Debug)]
enum Directive {
    Frame(String),
    Kick,
}

pub(crate) struct TestRelay {
    addr: SocketAddr,
    directives: broadcast::Sender<Directive>,
    inbound: mpsc::UnboundedReceiver<String>,
    accepted: Arc<AtomicUsize>,
}

impl TestRelay {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (directives, _) = broadcast::channel::<Directive>(64);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let accepted = Arc::new(AtomicUsize::new(0));

        let directives_accept = directives.clone();
        let accepted_accept = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accepted_accept.fetch_add(1, Ordering::SeqCst);

                let mut rx = directives_accept.subscribe();
                let inbound_tx = inbound_tx.clone();
                tokio::spawn(async move {
                    let Ok(ws) = accept_async(stream).await else {
                        return;
                    };
                    let (mut write, mut read) = ws.split();

                    loop {
                        tokio::select! {
                            directive = rx.recv() => match directive {
                                Ok(Directive::Frame(text)) => {
                                    if write.send(Message::text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(Directive::Kick) => {
                                    let _ = write.send(Message::Close(None)).await;
                                    break;
                                }
                                Err(_) => break,
                            },
                            message = read.next() => match message {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = inbound_tx.send(text.to_string());
                                }
                                Some(Ok(Message::Ping(payload))) => {
                                    let _ = write.send(Message::Pong(payload)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(_)) => break,
                            },
                        }
                    }
                });
            }
        });

        Self {
            addr,
            directives,
            inbound,
            accepted,
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// push a frame to every connected client
    pub(crate) fn send(&self, frame: impl Into<String>) {
        let _ = self.directives.send(Directive::Frame(frame.into()));
    }

    /// close every connected client
    pub(crate) fn kick(&self) {
        let _ = self.directives.send(Directive::Kick);
    }

    /// next frame received from any client
    pub(crate) async fn recv(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.inbound.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("relay inbound channel closed")
    }

    /// how many connections the relay has accepted so far
    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}
