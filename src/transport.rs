/// Transport module - one bound UDP endpoint
///
/// Couples the socket a node listens on with its receive thread. Sends go
/// out through the same socket so peers see a stable source port to reply to.
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::contracts::Envelope;
use crate::errors::{SendError, StartupError};
use crate::receiver::{EnvelopeSink, ReceiveLoop, ReceiverBuilder};
use crate::transmitter::Transmitter;

pub struct Transport {
    socket: Arc<UdpSocket>,
    poll_interval: Duration,
    receive_loop: Option<ReceiveLoop>,
}

impl Transport {
    /// Bind the local endpoint
    ///
    /// # Errors
    /// `StartupError::Bind` when the address is unavailable (port in use,
    /// permission denied).
    pub fn bind(addr: SocketAddr) -> Result<Self, StartupError> {
        let socket = UdpSocket::bind(addr).map_err(|source| StartupError::Bind { addr, source })?;
        Ok(Self {
            socket: Arc::new(socket),
            poll_interval: Duration::from_millis(crate::DEFAULT_POLL_INTERVAL_MS),
            receive_loop: None,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Shared handle to the bound socket, for sending from other threads
    pub fn endpoint(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }

    pub fn send(&self, envelope: &Envelope, destination: SocketAddr) -> Result<usize, SendError> {
        Transmitter::send(&self.socket, envelope, destination)
    }

    pub fn is_receiving(&self) -> bool {
        self.receive_loop.as_ref().is_some_and(ReceiveLoop::is_running)
    }

    /// Start the receive thread, delivering envelopes to `sink`
    pub fn start_receiving<S: EnvelopeSink>(&mut self, name: &str, sink: S) -> Result<(), StartupError> {
        if self.receive_loop.is_some() {
            return Err(StartupError::AlreadyReceiving);
        }
        let receive_loop = ReceiverBuilder::new()
            .with_poll_interval(self.poll_interval)
            .with_thread_name(format!("{}-receiver", name))
            .spawn(Arc::clone(&self.socket), sink)?;
        self.receive_loop = Some(receive_loop);
        info!(node = name, addr = ?self.socket.local_addr().ok(), "receive loop started");
        Ok(())
    }

    /// Stop the receive thread and release the endpoint
    ///
    /// Waits up to `timeout` for the loop to exit. The socket closes once the
    /// loop has let go of it.
    pub fn stop_receiving(mut self, timeout: Duration) -> bool {
        match self.receive_loop.take() {
            Some(mut receive_loop) => receive_loop.stop(timeout),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{MessageKind, Payload};
    use std::sync::mpsc;

    #[test]
    fn test_bind_conflict() {
        let first = Transport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken = first.local_addr().unwrap();

        let err = Transport::bind(taken).err().unwrap();
        assert!(matches!(err, StartupError::Bind { addr, .. } if addr == taken));
    }

    #[test]
    fn test_send_and_receive() {
        let mut receiving = Transport::bind("127.0.0.1:0".parse().unwrap())
            .unwrap()
            .with_poll_interval(Duration::from_millis(20));
        let target = receiving.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        receiving
            .start_receiving("test", move |envelope: Envelope, from: SocketAddr| {
                tx.send((envelope, from)).unwrap();
            })
            .unwrap();
        assert!(receiving.is_receiving());

        let sending = Transport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let envelope = Envelope::new(MessageKind::Command, "a", "b", Payload::new());
        sending.send(&envelope, target).unwrap();

        let (received, from) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, envelope);
        assert_eq!(from.port(), sending.local_addr().unwrap().port());

        assert!(receiving.stop_receiving(Duration::from_secs(1)));
        // Endpoint released: the port can be bound again.
        assert!(Transport::bind(target).is_ok());
    }

    #[test]
    fn test_double_start_rejected() {
        let mut transport = Transport::bind("127.0.0.1:0".parse().unwrap())
            .unwrap()
            .with_poll_interval(Duration::from_millis(20));
        transport.start_receiving("t", |_: Envelope, _: SocketAddr| {}).unwrap();
        assert!(matches!(
            transport.start_receiving("t", |_: Envelope, _: SocketAddr| {}),
            Err(StartupError::AlreadyReceiving)
        ));
        assert!(transport.stop_receiving(Duration::from_secs(1)));
    }
}
