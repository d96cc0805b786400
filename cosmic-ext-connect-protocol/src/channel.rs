//! Authenticated packet channels
//!
//! A [`Channel`] is produced by a channel service once the identity exchange
//! and certificate check succeeded. It owns its transport through a spawned
//! I/O task; the task forwards inbound packets and the final close to the
//! coordinating loop as [`ServiceEvent`]s and writes outbound packets queued
//! with [`Channel::send_packet`].
//!
//! Dropping a `Channel` closes it.

use crate::service::{ServiceEvent, ServiceEventSender};
use crate::transport::Transport;
use crate::{DeviceInfo, Packet, ProtocolError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Process-unique channel identifier
pub type ChannelId = u64;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Upper bound for a graceful transport shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum ChannelCommand {
    Send(Packet),
    Close,
}

/// Cloneable control handle for a channel's I/O task
///
/// Channel services keep handles to the channels they produced so they can
/// close them and wait for the I/O to finish when they stop.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    command_tx: mpsc::UnboundedSender<ChannelCommand>,
    closed: watch::Receiver<bool>,
}

impl ChannelHandle {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Ask the I/O task to close the transport
    pub fn close(&self) {
        let _ = self.command_tx.send(ChannelCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.command_tx.is_closed()
    }

    /// Wait until the I/O task has finished
    pub async fn closed(&mut self) {
        // An error means the task is gone, which is closed too.
        let _ = self.closed.wait_for(|closed| *closed).await;
    }
}

/// One authenticated, bidirectional packet stream to a single peer
#[derive(Debug)]
pub struct Channel {
    service: String,
    peer: DeviceInfo,
    peer_certificate: Vec<u8>,
    remote_address: String,
    handle: ChannelHandle,
}

impl Channel {
    /// Take ownership of an authenticated transport and start its I/O task
    ///
    /// `peer` is the identity packet received during the handshake and
    /// `peer_certificate` the DER certificate that was verified against it.
    pub fn spawn(
        service: impl Into<String>,
        peer: DeviceInfo,
        peer_certificate: Vec<u8>,
        transport: Box<dyn Transport>,
        events: ServiceEventSender,
    ) -> Self {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let remote_address = transport.remote_address();

        info!(
            "Channel {} open to {} ({}) at {}",
            id, peer.device_name, peer.device_id, remote_address
        );

        tokio::spawn(run_channel(id, transport, command_rx, events, closed_tx));

        Self {
            service: service.into(),
            peer,
            peer_certificate,
            remote_address,
            handle: ChannelHandle {
                id,
                command_tx,
                closed: closed_rx,
            },
        }
    }

    pub fn id(&self) -> ChannelId {
        self.handle.id
    }

    /// Name of the channel service that produced this channel
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Identity packet contents announced by the peer
    pub fn peer(&self) -> &DeviceInfo {
        &self.peer
    }

    /// Verified DER certificate of the peer
    pub fn peer_certificate(&self) -> &[u8] {
        &self.peer_certificate
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Queue a packet for the peer
    pub fn send_packet(&self, packet: Packet) -> Result<()> {
        self.handle
            .command_tx
            .send(ChannelCommand::Send(packet))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the transport and wait for the I/O task to finish
    pub async fn close(self) {
        let mut handle = self.handle.clone();
        drop(self);
        handle.closed().await;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.handle.close();
    }
}

async fn run_channel(
    id: ChannelId,
    mut transport: Box<dyn Transport>,
    mut command_rx: mpsc::UnboundedReceiver<ChannelCommand>,
    events: ServiceEventSender,
    closed_tx: watch::Sender<bool>,
) {
    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(ChannelCommand::Send(packet)) => {
                    if let Err(e) = transport.send_packet(&packet).await {
                        warn!("Channel {}: failed to send '{}': {}", id, packet.packet_type, e);
                        break;
                    }
                }
                Some(ChannelCommand::Close) | None => {
                    debug!("Channel {}: close requested", id);
                    break;
                }
            },
            result = transport.receive_packet() => match result {
                Ok(packet) => {
                    debug!("Channel {}: received '{}'", id, packet.packet_type);
                    if events
                        .send(ServiceEvent::PacketReceived { channel_id: id, packet })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(ProtocolError::ConnectionClosed) => {
                    debug!("Channel {}: closed by peer", id);
                    break;
                }
                Err(e) => {
                    warn!("Channel {}: dropping after error: {}", id, e);
                    break;
                }
            },
        }
    }

    match timeout(CLOSE_TIMEOUT, transport.close()).await {
        Ok(Err(e)) => debug!("Channel {}: unclean close: {}", id, e),
        Err(_) => debug!("Channel {}: close timed out", id),
        Ok(Ok(())) => {}
    }

    let _ = closed_tx.send(true);
    let _ = events.send(ServiceEvent::ChannelClosed { channel_id: id });
    info!("Channel {} closed", id);
}
