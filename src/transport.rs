//! Wire seam between the core and the embedder's sockets.

use std::net::SocketAddr;

use crate::common::messages::Message;
use crate::Result;

/// Wire codec and datagram sink supplied by the embedder.
///
/// The core hands outbound [Message] records to `send` synchronously from
/// within [crate::Dht::periodic]; inbound datagrams reach the core as raw
/// bytes and are decoded with `parse`. The encoding format is entirely the
/// embedder's choice, as is the socket I/O.
pub trait Transport {
    /// Decode one datagram. Return [crate::Error::MalformedMessage] for
    /// anything that does not parse; the core drops it and may blacklist
    /// the source.
    fn parse(&mut self, buf: &[u8], from: SocketAddr) -> Result<Message>;

    /// Encode and ship one message. Errors are the embedder's to handle;
    /// the core treats sends as fire-and-forget.
    fn send(&mut self, message: &Message, to: SocketAddr);
}
