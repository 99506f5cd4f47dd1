//! In-memory datagram substrate for the DTLS handshake.
//!
//! The handshake engine never touches a socket. Incoming datagrams are
//! handed in through [`DatagramQueue::write_to_recv_stream`] on a
//! bounded channel; outgoing datagrams leave through an `on_data_ready`
//! callback invoked synchronously from the handshake thread.
//!
//! The blocking read side implements the DTLS retransmission schedule:
//! it waits with an exponential back-off (doubling from the configured
//! minimum up to the ceiling) and replays the last outgoing flight each
//! time the back-off expires, until the overall handshake deadline.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DtlsConfig;

/// Callback receiving every outgoing datagram.
pub type DataReadyCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Bound on queued incoming datagrams before the feeder blocks.
const RECV_QUEUE_DEPTH: usize = 64;

/// Feeder-side handle to the handshake receive queue. Clone freely; all
/// clones share the close flag.
#[derive(Clone)]
pub struct DatagramQueue {
    tx: SyncSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl DatagramQueue {
    /// Enqueue one received datagram for the handshake thread. Blocks
    /// when the queue is full; fails once the transport is closed.
    pub fn write_to_recv_stream(&self, datagram: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "DTLS transport closed",
            ));
        }
        self.tx
            .send(datagram.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionAborted, "receiver gone"))
    }

    /// Close the transport: pending and future reads fail, and the
    /// queue is woken so a blocked handshake observes the close.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Empty sentinel wakes a blocked read without carrying data.
        let _ = self.tx.try_send(Vec::new());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The blocking `Read`/`Write` endpoint the handshake engine drives.
pub struct QueueIo {
    rx: Receiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
    on_data_ready: DataReadyCallback,
    /// Remainder of a datagram the reader's buffer could not hold.
    pending: Vec<u8>,
    /// Datagrams of the current outgoing flight, replayed on back-off
    /// expiry.
    flight: Vec<Vec<u8>>,
    read_since_write: bool,
    backoff: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
    deadline: Option<Instant>,
    handshake_timeout: Duration,
}

/// Build the wired queue pair: the feeder handle and the IO endpoint.
pub fn datagram_pair(config: &DtlsConfig, on_data_ready: DataReadyCallback) -> (DatagramQueue, QueueIo) {
    let (tx, rx) = sync_channel(RECV_QUEUE_DEPTH);
    let closed = Arc::new(AtomicBool::new(false));
    let queue = DatagramQueue {
        tx,
        closed: closed.clone(),
    };
    let io = QueueIo {
        rx,
        closed,
        on_data_ready,
        pending: Vec::new(),
        flight: Vec::new(),
        read_since_write: false,
        backoff: config.retransmit_min(),
        backoff_min: config.retransmit_min(),
        backoff_max: config.retransmit_max(),
        deadline: None,
        handshake_timeout: config.handshake_timeout(),
    };
    (queue, io)
}

impl QueueIo {
    /// Start the overall handshake deadline clock. Called once when the
    /// handshake begins.
    pub fn arm_deadline(&mut self) {
        self.deadline = Some(Instant::now() + self.handshake_timeout);
    }

    fn serve(&mut self, buf: &mut [u8], datagram: Vec<u8>) -> usize {
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        if n < datagram.len() {
            self.pending = datagram[n..].to_vec();
        }
        n
    }

    fn replay_flight(&self) {
        for datagram in &self.flight {
            (self.on_data_ready)(datagram);
        }
        if !self.flight.is_empty() {
            tracing::debug!(
                "DTLS back-off expired, retransmitted flight of {} datagram(s)",
                self.flight.len()
            );
        }
    }
}

impl Read for QueueIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let datagram = std::mem::take(&mut self.pending);
            return Ok(self.serve(buf, datagram));
        }

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "DTLS transport closed",
                ));
            }
            let now = Instant::now();
            let deadline = self.deadline.unwrap_or(now + self.handshake_timeout);
            if now >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "DTLS handshake deadline expired",
                ));
            }
            let wait = self.backoff.min(deadline - now);
            match self.rx.recv_timeout(wait) {
                Ok(datagram) if datagram.is_empty() => continue, // close sentinel
                Ok(datagram) => {
                    self.backoff = self.backoff_min;
                    self.read_since_write = true;
                    return Ok(self.serve(buf, datagram));
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.replay_flight();
                    self.backoff = (self.backoff * 2).min(self.backoff_max);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "all datagram feeders dropped",
                    ));
                }
            }
        }
    }
}

impl Write for QueueIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A write after a read starts a new flight.
        if self.read_since_write {
            self.flight.clear();
            self.read_since_write = false;
        }
        self.flight.push(buf.to_vec());
        (self.on_data_ready)(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
