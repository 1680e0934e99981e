/// Transmitter module - outbound side of the transport
///
/// Encodes envelopes and sends them as single datagrams. Sending never
/// fragments: an envelope that does not fit in one datagram is rejected
/// before it touches the socket.
use std::net::{SocketAddr, UdpSocket};

use tracing::debug;

use crate::codec;
use crate::contracts::Envelope;
use crate::errors::SendError;

/// Transmitter - stateless encode-and-send helpers
pub struct Transmitter;

impl Transmitter {
    /// Encode an envelope, enforcing the datagram size limit
    pub fn serialize_envelope(envelope: &Envelope) -> Result<Vec<u8>, SendError> {
        let bytes = codec::encode(envelope)?;
        Self::check_size(bytes.len())?;
        Ok(bytes)
    }

    /// Send an envelope through an existing socket
    ///
    /// # Returns
    /// Number of bytes transmitted
    pub fn send(
        socket: &UdpSocket,
        envelope: &Envelope,
        destination: SocketAddr,
    ) -> Result<usize, SendError> {
        let bytes = Self::serialize_envelope(envelope)?;
        let sent = socket.send_to(&bytes, destination)?;
        debug!(id = %envelope.id(), kind = %envelope.kind(), %destination, bytes = sent, "envelope sent");
        Ok(sent)
    }

    /// Send an envelope through a throwaway socket
    ///
    /// Used when the node has no bound endpoint. Replies to such a send land
    /// on the ephemeral port and are never read.
    pub fn send_ephemeral(envelope: &Envelope, destination: SocketAddr) -> Result<usize, SendError> {
        let bind_addr: SocketAddr = if destination.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)?;
        Self::send(&socket, envelope, destination)
    }

    /// Send pre-encoded bytes (for advanced use cases)
    pub fn send_raw(
        socket: &UdpSocket,
        bytes: &[u8],
        destination: SocketAddr,
    ) -> Result<usize, SendError> {
        Self::check_size(bytes.len())?;
        Ok(socket.send_to(bytes, destination)?)
    }

    fn check_size(size: usize) -> Result<(), SendError> {
        if size > crate::MAX_DATAGRAM_SIZE {
            return Err(SendError::TooLarge {
                size,
                max: crate::MAX_DATAGRAM_SIZE,
            });
        }
        Ok(())
    }
}
