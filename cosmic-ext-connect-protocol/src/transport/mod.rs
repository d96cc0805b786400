//! Packet transports
//!
//! A transport moves framed packets over one authenticated session. Channel
//! services create transports, run the identity handshake over them and then
//! hand them to a [`crate::Channel`], which owns them until the session ends.

pub mod memory;
mod r#trait;
pub mod tls;

pub use memory::MemoryTransport;
pub use r#trait::Transport;
pub use tls::{TlsConfig, TlsTransport};
