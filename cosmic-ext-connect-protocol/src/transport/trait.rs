//! Transport trait abstraction

use crate::{Packet, Result};
use async_trait::async_trait;
use std::fmt::Debug;

/// Common interface for packet transports
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Printable address of the remote end, e.g. `lan://192.168.1.5:1716`
    fn remote_address(&self) -> String;

    /// DER certificate the remote end authenticated the session with
    ///
    /// `None` when the peer presented no certificate.
    fn peer_certificate(&self) -> Option<&[u8]>;

    /// Send a packet
    ///
    /// # Errors
    ///
    /// Returns an error if the packet is too large for this transport
    /// or if there's a communication failure.
    async fn send_packet(&mut self, packet: &Packet) -> Result<()>;

    /// Receive the next packet
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose or corrupt data, so it can be raced in `tokio::select!`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ProtocolError::ConnectionClosed`] once the remote end
    /// has gone away.
    async fn receive_packet(&mut self) -> Result<Packet>;

    /// Close the session gracefully
    async fn close(self: Box<Self>) -> Result<()>;
}
