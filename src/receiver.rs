/// Receiver module - inbound side of the transport
///
/// Runs one dedicated thread that waits on the socket in bounded poll
/// windows, decodes each datagram and hands it to an `EnvelopeSink`. A
/// datagram that fails to decode is logged and dropped; the loop keeps going.
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::codec;
use crate::contracts::Envelope;
use crate::errors::DecodeError;

/// Consumer of decoded envelopes, driven by the receive thread
pub trait EnvelopeSink: Send + 'static {
    fn on_envelope(&mut self, envelope: Envelope, from: SocketAddr);

    /// Called once per wait window, whether or not a datagram arrived
    fn on_poll(&mut self) {}
}

impl<F> EnvelopeSink for F
where
    F: FnMut(Envelope, SocketAddr) + Send + 'static,
{
    fn on_envelope(&mut self, envelope: Envelope, from: SocketAddr) {
        self(envelope, from)
    }
}

/// Result of one bounded wait on the socket
#[derive(Debug)]
pub enum Received {
    Envelope(Envelope, SocketAddr),
    Malformed { from: SocketAddr, error: DecodeError },
    Timeout,
}

pub struct Receiver;

impl Receiver {
    /// Wait for one datagram, up to the socket read timeout
    pub fn receive(socket: &UdpSocket, buffer: &mut [u8]) -> io::Result<Received> {
        match socket.recv_from(buffer) {
            Ok((bytes_received, from)) => match codec::decode(&buffer[..bytes_received]) {
                Ok(envelope) => Ok(Received::Envelope(envelope, from)),
                Err(error) => Ok(Received::Malformed { from, error }),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                Ok(Received::Timeout)
            }
            Err(e) => Err(e),
        }
    }
}

pub struct ReceiverBuilder {
    buffer_size: usize,
    poll_interval: Duration,
    thread_name: String,
}

impl ReceiverBuilder {
    pub fn new() -> Self {
        Self {
            buffer_size: crate::MAX_DATAGRAM_SIZE,
            poll_interval: Duration::from_millis(crate::DEFAULT_POLL_INTERVAL_MS),
            thread_name: "node-receiver".to_string(),
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Upper bound on each wait; also bounds how long a stop request goes unnoticed
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn get_buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn get_poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Start the receive thread on `socket`
    pub fn spawn<S: EnvelopeSink>(self, socket: Arc<UdpSocket>, mut sink: S) -> io::Result<ReceiveLoop> {
        // A zero timeout means "block forever" to the OS.
        let poll_interval = self.poll_interval.max(Duration::from_millis(1));
        socket.set_read_timeout(Some(poll_interval))?;

        let running = Arc::new(AtomicBool::new(true));
        let (exited_tx, exited_rx) = mpsc::channel::<()>();
        let buffer_size = self.buffer_size;

        let handle = thread::Builder::new().name(self.thread_name).spawn({
            let running = Arc::clone(&running);
            move || {
                // Dropped on exit, including unwinding.
                let _exited = exited_tx;
                // Released before the exit signal so the port is free once stop returns.
                let socket = socket;
                let mut buffer = vec![0u8; buffer_size];
                let mut backoff = ErrorBackoff::new(poll_interval);

                while running.load(Ordering::Acquire) {
                    match Receiver::receive(&socket, &mut buffer) {
                        Ok(Received::Envelope(envelope, from)) => {
                            backoff.reset();
                            sink.on_envelope(envelope, from);
                        }
                        Ok(Received::Malformed { from, error }) => {
                            backoff.reset();
                            warn!(%from, %error, "dropping malformed datagram");
                        }
                        Ok(Received::Timeout) => backoff.reset(),
                        Err(error) => {
                            let (log, pause) = backoff.record();
                            if log {
                                warn!(%error, failures = backoff.failures(), "receive failed");
                            }
                            thread::sleep(pause);
                        }
                    }
                    sink.on_poll();
                }
                debug!("receive loop exited");
            }
        })?;

        Ok(ReceiveLoop {
            running,
            exited: exited_rx,
            handle: Some(handle),
        })
    }
}

impl Default for ReceiverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Throttle for a socket that keeps failing
///
/// Pauses double from 2ms up to `max_pause`; only the 1st, 2nd, 4th, 8th...
/// consecutive failure is worth a log line.
struct ErrorBackoff {
    consecutive: u32,
    max_pause: Duration,
}

impl ErrorBackoff {
    fn new(max_pause: Duration) -> Self {
        Self {
            consecutive: 0,
            max_pause,
        }
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }

    fn failures(&self) -> u32 {
        self.consecutive
    }

    /// Count a failure, returning whether to log it and how long to pause
    fn record(&mut self) -> (bool, Duration) {
        self.consecutive = self.consecutive.saturating_add(1);
        let pause = Duration::from_millis(1 << self.consecutive.min(16)).min(self.max_pause);
        (self.consecutive.is_power_of_two(), pause)
    }
}

/// Handle to a running receive thread
pub struct ReceiveLoop {
    running: Arc<AtomicBool>,
    exited: mpsc::Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiveLoop {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the loop and wait up to `timeout` for it to exit
    ///
    /// The loop notices the signal at the end of its current wait window. A
    /// handler already running is allowed to finish. Returns whether the
    /// thread exited in time. Called from the receive thread itself (a
    /// handler stopping its own node), this only signals.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        self.running.store(false, Ordering::Release);

        let Some(handle) = self.handle.take() else {
            return true;
        };
        if handle.thread().id() == thread::current().id() {
            return true;
        }

        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!("receive thread panicked");
                }
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(?timeout, "receive loop did not exit in time");
                false
            }
        }
    }
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{MessageKind, Payload};
    use crate::transmitter::Transmitter;
    use std::time::Instant;

    #[test]
    fn test_receiver_builder() {
        let builder = ReceiverBuilder::new()
            .with_buffer_size(2048)
            .with_poll_interval(Duration::from_millis(50));

        assert_eq!(builder.get_buffer_size(), 2048);
        assert_eq!(builder.get_poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_error_backoff_throttles() {
        let mut backoff = ErrorBackoff::new(Duration::from_millis(100));

        let logged: Vec<u32> = (1..=20)
            .filter(|_| backoff.record().0)
            .collect();
        assert_eq!(logged, vec![1, 2, 4, 8, 16]);
        assert_eq!(backoff.failures(), 20);
        assert_eq!(backoff.record().1, Duration::from_millis(100));

        backoff.reset();
        assert_eq!(backoff.record(), (true, Duration::from_millis(2)));
    }

    #[test]
    fn test_receive_timeout() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let mut buffer = vec![0u8; 1024];

        assert!(matches!(Receiver::receive(&socket, &mut buffer), Ok(Received::Timeout)));
    }

    #[test]
    fn test_loop_survives_malformed_datagram() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let target = socket.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();

        let mut receive_loop = ReceiverBuilder::new()
            .with_poll_interval(Duration::from_millis(20))
            .spawn(Arc::clone(&socket), move |envelope: Envelope, _from: SocketAddr| {
                tx.send(envelope).unwrap();
            })
            .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"{ definitely not an envelope", target).unwrap();
        let good = Envelope::new(MessageKind::Data, "a", "b", Payload::new());
        Transmitter::send(&sender, &good, target).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, good);

        assert!(receive_loop.stop(Duration::from_secs(1)));
        assert!(!receive_loop.is_running());
    }

    #[test]
    fn test_stop_within_poll_interval() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        let mut receive_loop = ReceiverBuilder::new()
            .with_poll_interval(Duration::from_millis(50))
            .spawn(socket, |_: Envelope, _: SocketAddr| {})
            .unwrap();

        let started = Instant::now();
        assert!(receive_loop.stop(Duration::from_secs(2)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
