//! TLS over TCP
//!
//! Both ends present their self-signed identity certificate and chain
//! validation is disabled (trust on first use). The TLS handshake only proves
//! possession of the key; the channel service then compares the certificate
//! fingerprint with the id claimed in the identity packet.

use super::Transport;
use crate::{Identity, Packet, ProtocolError, Result, MAX_PACKET_SIZE};
use async_trait::async_trait;
use openssl::pkey::PKey;
use openssl::ssl::{Ssl, SslAcceptor, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_openssl::SslStream;
use tracing::{debug, warn};

/// Timeout for TCP connect and for the TLS handshake
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Server and client TLS contexts built from the local identity
#[derive(Clone)]
pub struct TlsConfig {
    acceptor: Arc<SslAcceptor>,
    connector: Arc<SslConnector>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

impl TlsConfig {
    pub fn new(identity: &Identity) -> Result<Self> {
        let cert = X509::from_der(identity.certificate()).map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to parse certificate: {}", e))
        })?;
        let pkey = PKey::private_key_from_der(identity.private_key()).map_err(|e| {
            ProtocolError::CertificateValidation(format!("Failed to parse private key: {}", e))
        })?;

        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
        acceptor.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        acceptor.set_certificate(&cert)?;
        acceptor.set_private_key(&pkey)?;
        acceptor.check_private_key()?;
        // Require a client certificate but accept any, including self-signed.
        acceptor.set_verify_callback(
            SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
            |_, _| true,
        );

        let mut connector = SslConnector::builder(SslMethod::tls_client())?;
        connector.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        connector.set_certificate(&cert)?;
        connector.set_private_key(&pkey)?;
        connector.set_verify(SslVerifyMode::NONE);

        debug!("TLS contexts created for {}", identity.device_id());

        Ok(Self {
            acceptor: Arc::new(acceptor.build()),
            connector: Arc::new(connector.build()),
        })
    }
}

/// Packet transport over a TLS session
pub struct TlsTransport {
    stream: SslStream<TcpStream>,
    remote_addr: SocketAddr,
    peer_certificate: Option<Vec<u8>>,
    buffer: Vec<u8>,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl TlsTransport {
    /// Connect to `addr` and run the TLS client handshake
    pub async fn connect(addr: SocketAddr, config: &TlsConfig) -> Result<Self> {
        debug!("Connecting to {} via TLS", addr);

        let tcp = timeout(TLS_HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| ProtocolError::from_io_error(e, &format!("connecting to {}", addr)))?;
        tcp.set_nodelay(true)?;

        let ssl = Ssl::new(config.connector.context())?;
        let mut stream = SslStream::new(ssl, tcp)?;
        timeout(TLS_HANDSHAKE_TIMEOUT, Pin::new(&mut stream).connect())
            .await
            .map_err(|_| ProtocolError::Timeout(format!("TLS handshake with {}", addr)))??;

        Self::from_stream(stream, addr)
    }

    /// Run the TLS server handshake on an accepted TCP connection
    pub async fn accept(tcp: TcpStream, addr: SocketAddr, config: &TlsConfig) -> Result<Self> {
        tcp.set_nodelay(true)?;

        let ssl = Ssl::new(config.acceptor.context())?;
        let mut stream = SslStream::new(ssl, tcp)?;
        timeout(TLS_HANDSHAKE_TIMEOUT, Pin::new(&mut stream).accept())
            .await
            .map_err(|_| ProtocolError::Timeout(format!("TLS handshake with {}", addr)))??;

        Self::from_stream(stream, addr)
    }

    fn from_stream(stream: SslStream<TcpStream>, remote_addr: SocketAddr) -> Result<Self> {
        let peer_certificate = match stream.ssl().peer_certificate() {
            Some(cert) => Some(cert.to_der()?),
            None => None,
        };

        debug!("TLS session established with {}", remote_addr);

        Ok(Self {
            stream,
            remote_addr,
            peer_certificate,
            buffer: Vec::new(),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

#[async_trait]
impl Transport for TlsTransport {
    fn remote_address(&self) -> String {
        format!("lan://{}", self.remote_addr)
    }

    fn peer_certificate(&self) -> Option<&[u8]> {
        self.peer_certificate.as_deref()
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let bytes = packet.to_bytes()?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketSizeExceeded(bytes.len(), MAX_PACKET_SIZE));
        }

        self.stream
            .write_all(&bytes)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "sending packet"))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ProtocolError::from_io_error(e, "sending packet"))?;

        debug!(
            "Sent packet '{}' ({} bytes) to {}",
            packet.packet_type,
            bytes.len(),
            self.remote_addr
        );
        Ok(())
    }

    async fn receive_packet(&mut self) -> Result<Packet> {
        // Bytes live in `self.buffer` between calls, so a cancelled read
        // never loses part of a frame.
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Packet::from_bytes(&line);
            }

            if self.buffer.len() > MAX_PACKET_SIZE {
                warn!(
                    "Dropping oversized frame ({} bytes) from {}",
                    self.buffer.len(),
                    self.remote_addr
                );
                return Err(ProtocolError::PacketSizeExceeded(
                    self.buffer.len(),
                    MAX_PACKET_SIZE,
                ));
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = self
                .stream
                .read(&mut chunk)
                .await
                .map_err(|e| ProtocolError::from_io_error(e, "receiving packet"))?;
            if n == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        debug!("Closing TLS connection to {}", self.remote_addr);
        self.stream.shutdown().await?;
        Ok(())
    }
}
