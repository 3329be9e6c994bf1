//! Loopback relay peer for tests

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Server side of one accepted client
pub struct Peer {
    to_client: mpsc::UnboundedSender<Message>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl Peer {
    pub async fn next_text(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.from_client.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn send_text(&self, text: &str) {
        self.to_client.send(Message::Text(text.to_string())).unwrap();
    }

    pub fn close(&self, code: CloseCode) {
        self.to_client
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: "".into(),
            })))
            .unwrap();
    }
}

/// Loopback relay that hands every accepted client to the test
pub async fn start_server() -> (String, mpsc::UnboundedReceiver<Peer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (peers_tx, peers_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(ws) = accept_async(stream).await else {
                continue;
            };
            let (to_client, mut to_client_rx) = mpsc::unbounded_channel::<Message>();
            let (from_client_tx, from_client) = mpsc::unbounded_channel();
            if peers_tx.send(Peer { to_client, from_client }).is_err() {
                return;
            }

            tokio::spawn(async move {
                let (mut sink, mut stream) = ws.split();
                loop {
                    tokio::select! {
                        Some(msg) = to_client_rx.recv() => {
                            let closing = matches!(msg, Message::Close(_));
                            if sink.send(msg).await.is_err() || closing {
                                break;
                            }
                        }
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                let _ = from_client_tx.send(text);
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                    }
                }
            });
        }
    });

    (url, peers_rx)
}

pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
    timeout(Duration::from_secs(2), peers.recv())
        .await
        .expect("no client connected")
        .expect("server stopped")
}

