//! In-process transport
//!
//! Two connected ends exchange packets over unbounded queues. Dropping or
//! closing one end makes the other observe `ConnectionClosed`.

use super::Transport;
use crate::{Packet, ProtocolError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// One end of an in-process packet pipe
#[derive(Debug)]
pub struct MemoryTransport {
    address: String,
    peer_certificate: Option<Vec<u8>>,
    tx: Option<mpsc::UnboundedSender<Packet>>,
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl MemoryTransport {
    /// Create two connected ends
    ///
    /// `first_certificate` is the certificate the first end authenticates
    /// with, so the second end reports it as its peer certificate, and vice
    /// versa.
    pub fn pair(
        scheme: &str,
        first_certificate: Option<Vec<u8>>,
        second_certificate: Option<Vec<u8>>,
    ) -> (Self, Self) {
        let pipe = NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed);
        let (first_tx, second_rx) = mpsc::unbounded_channel();
        let (second_tx, first_rx) = mpsc::unbounded_channel();

        let first = Self {
            address: format!("{}://pipe-{}/b", scheme, pipe),
            peer_certificate: second_certificate,
            tx: Some(first_tx),
            rx: first_rx,
        };
        let second = Self {
            address: format!("{}://pipe-{}/a", scheme, pipe),
            peer_certificate: first_certificate,
            tx: Some(second_tx),
            rx: second_rx,
        };

        (first, second)
    }

    /// Whether the remote end is still able to receive
    pub fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn remote_address(&self) -> String {
        self.address.clone()
    }

    fn peer_certificate(&self) -> Option<&[u8]> {
        self.peer_certificate.as_deref()
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(packet.clone())
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn receive_packet(&mut self) -> Result<Packet> {
        self.rx.recv().await.ok_or(ProtocolError::ConnectionClosed)
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.tx.take();
        self.rx.close();
        Ok(())
    }
}
