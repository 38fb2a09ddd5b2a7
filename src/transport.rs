//! # Transport Layer
//!
//! One TCP socket per [`TransportChannel`]. A background task polls the
//! socket once per tick: it reassembles inbound frames into the receive
//! queue, then writes every queued outbound frame.
//!
//! Closing keeps frames already queued for sending; the loop writes them
//! before shutting the socket down. Frames received before the peer hung
//! up stay readable.
//!
//! Lock order: the socket lock is always taken before the queue lock.
//! Callers only ever touch the queue lock, so a caller holding a
//! [`ChannelGuard`] never blocks the socket side for longer than one
//! queue operation.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::TransportConfig;
use crate::error::{ProtocolError, ProtocolResult};
use crate::packet::{encode_frame, FrameDecoder};

/// Socket side of a channel, owned by the loop task
struct ChannelIo {
    stream: TcpStream,
    decoder: FrameDecoder,
    read_buffer: Vec<u8>,
}

/// Pending frames in both directions
#[derive(Default)]
struct ChannelQueues {
    outbound: VecDeque<Bytes>,
    inbound: VecDeque<Bytes>,
}

struct ChannelShared {
    io: tokio::sync::Mutex<ChannelIo>,
    queues: Mutex<ChannelQueues>,
    connected: AtomicBool,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    config: TransportConfig,
}

/// Length-prefixed framing over one TCP connection
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct TransportChannel {
    shared: Arc<ChannelShared>,
}

/// Exclusive access to both queues for the span of a caller's tick
pub struct ChannelGuard<'a> {
    queues: MutexGuard<'a, ChannelQueues>,
    connected: bool,
}

impl ChannelGuard<'_> {
    /// Queue one outbound frame payload
    pub fn send(&mut self, payload: Bytes) {
        if self.connected {
            self.queues.outbound.push_back(payload);
        }
    }

    /// Pop one reassembled inbound frame
    pub fn receive(&mut self) -> Option<Bytes> {
        self.queues.inbound.pop_front()
    }

    pub fn pending_inbound(&self) -> usize {
        self.queues.inbound.len()
    }
}

impl TransportChannel {
    /// Connect to a remote address and start the channel loop
    pub async fn connect(addr: SocketAddr, config: TransportConfig) -> ProtocolResult<Self> {
        let stream = timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(config.connect_timeout_secs))?
            .map_err(ProtocolError::IoError)?;

        Self::from_stream(stream, config)
    }

    /// Wrap an accepted stream and start the channel loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream(stream: TcpStream, config: TransportConfig) -> ProtocolResult<Self> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;

        let shared = Arc::new(ChannelShared {
            io: tokio::sync::Mutex::new(ChannelIo {
                stream,
                decoder: FrameDecoder::new(config.max_frame_size),
                read_buffer: vec![0u8; config.read_buffer_size.max(1)],
            }),
            queues: Mutex::new(ChannelQueues::default()),
            connected: AtomicBool::new(true),
            peer_addr,
            local_addr,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            config,
        });

        info!(peer = %peer_addr, local = %local_addr, "transport channel open");
        tokio::spawn(run_channel(shared.clone()));

        Ok(Self { shared })
    }

    /// Queue a frame payload for sending (non-blocking)
    pub fn send(&self, payload: Bytes) {
        self.lock().send(payload);
    }

    /// Dequeue one fully reassembled inbound frame
    pub fn receive(&self) -> Option<Bytes> {
        self.lock().receive()
    }

    /// Hold both queues until the guard is dropped
    pub fn lock(&self) -> ChannelGuard<'_> {
        ChannelGuard {
            queues: self.shared.queues.lock(),
            connected: self.is_connected(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Close the channel; safe to call repeatedly from any thread
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.shared.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            peer_addr: self.shared.peer_addr,
            local_addr: self.shared.local_addr,
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl ChannelShared {
    /// Local close: unread frames are discarded
    fn close(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.queues.lock().inbound.clear();
            info!(peer = %self.peer_addr, "transport channel closed");
        }
    }

    /// The socket failed or the peer hung up
    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(peer = %self.peer_addr, "transport channel disconnected");
        }
    }

    /// One poll of the socket: read once, surface frames, flush writes
    async fn tick(&self) -> ProtocolResult<()> {
        let mut io = self.io.lock().await;
        let ChannelIo {
            stream,
            decoder,
            read_buffer,
        } = &mut *io;

        match stream.try_read(read_buffer) {
            Ok(0) => return Err(ProtocolError::ConnectionClosed),
            Ok(n) => {
                self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                decoder.push(&read_buffer[..n]);
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(ProtocolError::IoError(e)),
        }

        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode()? {
            frames.push(frame);
        }

        let outbound: Vec<Bytes> = {
            let mut queues = self.queues.lock();
            if !frames.is_empty() {
                trace!(peer = %self.peer_addr, count = frames.len(), "frames received");
                queues.inbound.extend(frames);
            }
            queues.outbound.drain(..).collect()
        };

        for payload in outbound {
            let framed = encode_frame(&payload);
            stream.write_all(&framed).await?;
            self.bytes_sent
                .fetch_add(framed.len() as u64, Ordering::Relaxed);
        }

        Ok(())
    }
}

async fn run_channel(shared: Arc<ChannelShared>) {
    let interval = shared.config.tick_interval();

    while shared.connected.load(Ordering::SeqCst) {
        if let Err(e) = shared.tick().await {
            match e {
                ProtocolError::ConnectionClosed => {
                    debug!(peer = %shared.peer_addr, "peer closed the connection")
                }
                ref other => warn!(peer = %shared.peer_addr, error = %other, "transport failure"),
            }
            shared.disconnect();
            break;
        }
        tokio::time::sleep(interval).await;
    }

    let mut io = shared.io.lock().await;
    let pending: Vec<Bytes> = shared.queues.lock().outbound.drain(..).collect();
    for payload in pending {
        if io.stream.write_all(&encode_frame(&payload)).await.is_err() {
            break;
        }
    }
    let _ = io.stream.shutdown().await;
}

/// Transport statistics
#[derive(Debug, Clone)]
pub struct TransportStats {
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl std::fmt::Display for TransportStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}: sent={} bytes, recv={} bytes",
            self.local_addr, self.peer_addr, self.bytes_sent, self.bytes_received
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn channel_pair() -> (TransportChannel, TransportChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TransportChannel::connect(addr, TransportConfig::default())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        let server = TransportChannel::from_stream(accepted, TransportConfig::default()).unwrap();
        (client, server)
    }

    async fn wait_for_frame(channel: &TransportChannel) -> Bytes {
        for _ in 0..2000 {
            if let Some(frame) = channel.receive() {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("no frame arrived");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_transport_echo() {
        let (client, server) = channel_pair().await;

        client.send(Bytes::from_static(b"ping"));
        let frame = wait_for_frame(&server).await;
        assert_eq!(frame, Bytes::from_static(b"ping"));

        server.send(frame);
        assert_eq!(wait_for_frame(&client).await, Bytes::from_static(b"ping"));
        assert!(client.stats().bytes_sent >= 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_frames_keep_order() {
        let (client, server) = channel_pair().await;

        for i in 0..50u8 {
            client.send(Bytes::from(vec![i; i as usize + 1]));
        }
        for i in 0..50u8 {
            let frame = wait_for_frame(&server).await;
            assert_eq!(frame.len(), i as usize + 1);
            assert!(frame.iter().all(|b| *b == i));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wire_format_is_length_prefixed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let channel = TransportChannel::connect(addr, TransportConfig::default())
            .await
            .unwrap();
        let (mut raw, _) = listener.accept().await.unwrap();

        channel.send(Bytes::from_static(b"abc"));

        let mut buf = [0u8; 7];
        raw.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..4], &3u32.to_le_bytes());
        assert_eq!(&buf[4..], b"abc");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_frames_are_sent_before_close() {
        let (client, server) = channel_pair().await;

        {
            let mut guard = client.lock();
            guard.send(Bytes::from_static(b"first"));
            guard.send(Bytes::from_static(b"last words"));
        }
        client.close();

        for _ in 0..2000 {
            if !server.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!server.is_connected());

        // Frames that arrived before the hang-up stay readable
        assert_eq!(server.lock().pending_inbound(), 2);
        assert_eq!(server.receive().unwrap(), Bytes::from_static(b"first"));
        assert_eq!(server.receive().unwrap(), Bytes::from_static(b"last words"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_is_idempotent_and_propagates() {
        let (client, server) = channel_pair().await;

        client.close();
        client.close();
        assert!(!client.is_connected());

        for _ in 0..2000 {
            if !server.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!server.is_connected());

        // Sends after close are dropped
        client.send(Bytes::from_static(b"late"));
        assert!(client.receive().is_none());
    }
}
