//! [`PacketIO`]: a framed, checksummed, acknowledged duplex byte channel to a
//! gdbstub, backed by two background threads sharing one [`TcpStream`].

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Result, RspError};
use crate::packet::{extract_frame, is_stop_reply, make_packet};

/// Both background threads poll for shutdown (and the writer polls its
/// queue) at this cadence, per spec.md's 1s bound on shutdown latency.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// A FIFO queue that supports blocking-with-timeout pops as well as a
/// non-consuming emptiness check, which `mpsc::Receiver` cannot do. Used for
/// the stop-reply queue, since `RspTarget` needs to observe "is it empty"
/// without racing a concurrent consumer out of an item.
struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

impl<T> BlockingQueue<T> {
    fn new() -> Self {
        BlockingQueue {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
        }
    }

    fn push(&self, item: T) {
        let mut items = self.items.lock().unwrap();
        items.push_back(item);
        self.not_empty.notify_one();
    }

    fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut items = self.items.lock().unwrap();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self.not_empty.wait_timeout(items, deadline - now).unwrap();
            items = guard;
            if result.timed_out() && items.is_empty() {
                return None;
            }
        }
    }

    fn pop_blocking(&self) -> Option<T> {
        let mut items = self.items.lock().unwrap();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            items = self.not_empty.wait(items).unwrap();
        }
    }
}

/// A framed, checksummed, acknowledged duplex byte channel to a gdbstub.
///
/// Spawns one sender and one receiver thread against a single
/// [`TcpStream`], sharing one socket-access mutex between them. Data
/// packets (anything that isn't a stop-reply) are retrieved with
/// [`PacketIO::recv`]; stop-reply packets are delivered on a separate
/// queue retrieved with [`PacketIO::recv_stop`], so that `RspTarget`'s
/// stop-event loop never has to distinguish them from ordinary command
/// replies.
pub struct PacketIO {
    /// Raw, already-framed bytes destined for the socket. `send()` frames a
    /// payload before posting it here; the receiver thread also posts bare
    /// `+` acks here directly, unframed.
    write_tx: mpsc::Sender<Vec<u8>>,
    data_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    stop_queue: Arc<BlockingQueue<Vec<u8>>>,
    shutdown: Arc<AtomicBool>,
    sender_thread: Mutex<Option<JoinHandle<()>>>,
    receiver_thread: Mutex<Option<JoinHandle<()>>>,
}

impl PacketIO {
    /// Open a TCP connection to `(host, port)` and spawn the sender/receiver
    /// threads. Fails with [`RspError::Connect`] if the stub is unreachable.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).map_err(|source| RspError::Connect {
            host: host.to_string(),
            port,
            source,
        })?;
        stream.set_nodelay(true).ok();

        let shutdown = Arc::new(AtomicBool::new(false));
        let sock = Arc::new(Mutex::new(stream));

        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>();
        let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>();
        let stop_queue = Arc::new(BlockingQueue::new());

        let sender_thread = {
            let sock = Arc::clone(&sock);
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || sender_loop(sock, write_rx, shutdown))
        };

        let receiver_thread = {
            let sock = Arc::clone(&sock);
            let shutdown = Arc::clone(&shutdown);
            let write_tx = write_tx.clone();
            let stop_queue = Arc::clone(&stop_queue);
            std::thread::spawn(move || receiver_loop(sock, write_tx, data_tx, stop_queue, shutdown))
        };

        Ok(PacketIO {
            write_tx,
            data_rx: Mutex::new(data_rx),
            stop_queue,
            shutdown,
            sender_thread: Mutex::new(Some(sender_thread)),
            receiver_thread: Mutex::new(Some(receiver_thread)),
        })
    }

    /// Enqueue `payload` to be framed and sent. Returns immediately; the
    /// sender thread picks it up within [`POLL_TIMEOUT`].
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        log::debug!("PacketIO::send {:?}", String::from_utf8_lossy(payload));
        self.write_tx
            .send(make_packet(payload))
            .map_err(|_| RspError::BrokenPipe)
    }

    /// Block (up to `timeout`, or forever if `None`) for the next data-queue
    /// payload. Returns `None` on timeout or if the connection has shut down.
    pub fn recv(&self, timeout: Option<Duration>) -> Option<Vec<u8>> {
        let rx = self.data_rx.lock().unwrap();
        match timeout {
            Some(t) => rx.recv_timeout(t).ok(),
            None => rx.recv().ok(),
        }
    }

    /// Non-blocking peek at whether the stop queue currently has anything
    /// buffered. Used by `RspTarget` to wait for the stop queue to drain
    /// before acquiring the event lock on the owner thread. Does not
    /// consume a pending item.
    pub fn stop_queue_is_empty(&self) -> bool {
        self.stop_queue.is_empty()
    }

    /// Block (up to `timeout`) for the next stop-reply payload.
    pub fn recv_stop(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.stop_queue.pop_timeout(timeout)
    }

    /// Block forever for the next stop-reply payload.
    pub fn recv_stop_blocking(&self) -> Option<Vec<u8>> {
        self.stop_queue.pop_blocking()
    }

    /// Signal both background threads to exit at their next poll, then join
    /// them and tear down the socket. Idempotent: safe to call more than
    /// once (e.g. once explicitly from `RspTarget::close` and once more
    /// implicitly from `Drop`).
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(h) = self.sender_thread.lock().unwrap().take() {
            let _ = h.join();
        }
        if let Some(h) = self.receiver_thread.lock().unwrap().take() {
            let _ = h.join();
        }
    }
}

impl Drop for PacketIO {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sender_loop(sock: Arc<Mutex<TcpStream>>, rx: mpsc::Receiver<Vec<u8>>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let frame = match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(f) => f,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let mut guard = sock.lock().unwrap();
        log::trace!("PacketIO sender writing {} bytes", frame.len());
        if let Err(e) = guard.write_all(&frame) {
            log::warn!("PacketIO sender got {e}, shutting down");
            shutdown.store(true, Ordering::SeqCst);
            return;
        }
    }
}

fn receiver_loop(
    sock: Arc<Mutex<TcpStream>>,
    write_tx: mpsc::Sender<Vec<u8>>,
    data_tx: mpsc::Sender<Vec<u8>>,
    stop_queue: Arc<BlockingQueue<Vec<u8>>>,
    shutdown: Arc<AtomicBool>,
) {
    // A short read timeout lets us re-check the shutdown flag at roughly
    // the same cadence as the sender thread without a select()-style API.
    {
        let guard = sock.lock().unwrap();
        let _ = guard.set_read_timeout(Some(POLL_TIMEOUT));
    }

    let mut recv_buf: Vec<u8> = Vec::new();
    let mut scratch = [0u8; 1024];

    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }

        let n = {
            let mut guard = sock.lock().unwrap();
            match guard.read(&mut scratch) {
                Ok(0) => {
                    shutdown.store(true, Ordering::SeqCst);
                    return;
                }
                Ok(n) => n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    0
                }
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    shutdown.store(true, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    log::warn!("PacketIO receiver got {e}, shutting down");
                    shutdown.store(true, Ordering::SeqCst);
                    return;
                }
            }
        };

        if n == 0 {
            continue;
        }
        recv_buf.extend_from_slice(&scratch[..n]);

        // A bare '+' ack carries no frame; drop it so it doesn't wedge
        // frame extraction.
        if recv_buf == b"+" {
            recv_buf.clear();
            continue;
        }

        // A single read may contain multiple frames; drain all complete
        // ones before going back to the socket.
        loop {
            match extract_frame(&recv_buf) {
                Some((payload, consumed)) => {
                    recv_buf.drain(..consumed);

                    if !(payload.is_empty() || payload == b"OK") {
                        let _ = write_tx.send(b"+".to_vec());
                    }

                    if is_stop_reply(&payload) {
                        stop_queue.push(payload);
                    } else {
                        let _ = data_tx.send(payload);
                    }
                }
                None => break,
            }
        }
    }
}
