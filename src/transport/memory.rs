//! In-process transport.
//!
//! [`MemoryDialer`] hands out channel halves backed by tokio mpsc queues and
//! gives the other ends to a [`MemoryServer`]. The server side can push
//! frames, close or drop the channel, and the dialer can be told to refuse
//! dials. Used to exercise reconnection, ordering and dedup without a
//! network.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Credentials, Dialer, FrameReader, FrameWriter, WsMessage};
use crate::error::ConnectionError;

/// Dialer whose peers are [`ServerPeer`]s delivered to a [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    accepted_tx: mpsc::UnboundedSender<ServerPeer>,
    refuse: Arc<AtomicU32>,
    dials: Arc<AtomicU32>,
}

/// Server end of a [`MemoryDialer`].
#[derive(Debug)]
pub struct MemoryServer {
    accepted_rx: mpsc::UnboundedReceiver<ServerPeer>,
}

/// Server-side view of one dialed channel.
#[derive(Debug)]
pub struct ServerPeer {
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    to_client: mpsc::UnboundedSender<WsMessage>,
    client_closed: Arc<AtomicBool>,
    pongs: Arc<AtomicU32>,
    url: String,
    authorization: Option<String>,
}

struct MemoryWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
    pongs: Arc<AtomicU32>,
}

struct MemoryReader {
    rx: mpsc::UnboundedReceiver<WsMessage>,
}

impl MemoryDialer {
    /// Create a connected dialer/server pair.
    #[must_use]
    pub fn pair() -> (Self, MemoryServer) {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted_tx,
                refuse: Arc::new(AtomicU32::new(0)),
                dials: Arc::new(AtomicU32::new(0)),
            },
            MemoryServer { accepted_rx },
        )
    }

    /// Fail the next `count` dials with `ConnectionError::DialFailed`.
    pub fn refuse_next(&self, count: u32) {
        self.refuse.store(count, Ordering::SeqCst);
    }

    /// Number of dial attempts so far, refused ones included.
    #[must_use]
    pub fn dial_count(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(
        &self,
        url: &str,
        credentials: &Credentials,
    ) -> Result<(Box<dyn FrameWriter>, Box<dyn FrameReader>), ConnectionError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectionError::DialFailed("connection refused".into()));
        }

        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let pongs = Arc::new(AtomicU32::new(0));

        let peer = ServerPeer {
            from_client,
            to_client,
            client_closed: Arc::clone(&closed),
            pongs: Arc::clone(&pongs),
            url: url.to_string(),
            authorization: credentials.bearer(),
        };
        self.accepted_tx
            .send(peer)
            .map_err(|_| ConnectionError::DialFailed("server gone".into()))?;

        Ok((
            Box::new(MemoryWriter {
                tx: client_tx,
                closed,
                pongs,
            }),
            Box::new(MemoryReader { rx: client_rx }),
        ))
    }
}

impl MemoryServer {
    /// Wait for the next dialed channel.
    pub async fn accept(&mut self) -> Option<ServerPeer> {
        self.accepted_rx.recv().await
    }
}

impl ServerPeer {
    /// Push a text frame to the client.
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.to_client.send(WsMessage::Text(text.into()));
    }

    /// Push a JSON value as a text frame.
    pub fn push_json(&self, value: &serde_json::Value) {
        self.push_text(value.to_string());
    }

    /// Push a ping; the client should answer with a pong.
    pub fn ping(&self) {
        let _ = self.to_client.send(WsMessage::Ping(Vec::new()));
    }

    /// Send a close frame.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(WsMessage::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Next frame the client wrote, or `None` once the client side is gone.
    pub async fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.from_client.recv().await
    }

    /// Number of pongs the client has answered with.
    #[must_use]
    pub fn pong_count(&self) -> u32 {
        self.pongs.load(Ordering::SeqCst)
    }

    /// Whether the client has closed its writer.
    #[must_use]
    pub fn client_closed(&self) -> bool {
        self.client_closed.load(Ordering::SeqCst)
    }

    /// URL the client dialed.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// `Authorization` header the client presented.
    #[must_use]
    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }
}

impl MemoryWriter {
    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("memory channel closed");
        }
        Ok(())
    }

    fn push(&self, data: Vec<u8>) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.tx
            .send(data)
            .map_err(|_| anyhow::anyhow!("memory peer dropped"))
    }
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.push(text.into_bytes())
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> anyhow::Result<()> {
        self.push(data)
    }

    async fn send_pong(&mut self, _data: Vec<u8>) -> anyhow::Result<()> {
        self.ensure_open()?;
        self.pongs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Option<anyhow::Result<WsMessage>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_hands_peer_to_server() {
        let (dialer, mut server) = MemoryDialer::pair();
        let (mut writer, mut reader) = dialer
            .dial("mem://x", &Credentials::bearer_token("t0k"))
            .await
            .unwrap();

        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.url(), "mem://x");
        assert_eq!(peer.authorization(), Some("Bearer t0k"));

        writer.send_text("hello".into()).await.unwrap();
        assert_eq!(peer.next_frame().await.unwrap(), b"hello".to_vec());

        peer.push_text("world");
        assert_eq!(
            reader.recv().await.unwrap().unwrap(),
            WsMessage::Text("world".into())
        );

        writer.send_pong(Vec::new()).await.unwrap();
        assert_eq!(peer.pong_count(), 1);

        writer.close().await.unwrap();
        assert!(peer.client_closed());
        assert!(writer.send_pong(Vec::new()).await.is_err());
        assert!(writer.send_text("late".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_refuse_next_counts_down() {
        let (dialer, _server) = MemoryDialer::pair();
        dialer.refuse_next(1);
        assert!(dialer.dial("mem://x", &Credentials::default()).await.is_err());
        assert!(dialer.dial("mem://x", &Credentials::default()).await.is_ok());
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_peer_ends_stream() {
        let (dialer, mut server) = MemoryDialer::pair();
        let (_writer, mut reader) = dialer.dial("mem://x", &Credentials::default()).await.unwrap();
        drop(server.accept().await);
        assert!(reader.recv().await.is_none());
    }
}
