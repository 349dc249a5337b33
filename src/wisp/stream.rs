//! Per-stream relay engine
//!
//! Each client stream runs two tasks: a connect task that dials the
//! destination and then becomes the outbound read pump, and an inbound write
//! pump that drains the bounded DATA queue into the socket. All failure
//! sources funnel into [`WispStream::close`], which acts exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::dialer::{DialError, DialedSocket};
use super::packet::{CloseReason, ConnectPayload, StreamType};
use super::session::WispSession;

const STATE_CONNECTING: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Largest payload a single UDP datagram can carry.
const MAX_UDP_PAYLOAD: usize = 65507;

/// One client-requested end-to-end connection.
pub(crate) struct WispStream {
    id: u32,
    kind: StreamType,
    session: Arc<WispSession>,
    state: AtomicU8,
    data_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

enum SocketReader {
    Tcp(OwnedReadHalf),
    Udp(Arc<UdpSocket>),
}

enum SocketWriter {
    Tcp(OwnedWriteHalf),
    Udp(Arc<UdpSocket>),
}

impl SocketWriter {
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Tcp(half) => half.write_all(data).await,
            Self::Udp(socket) => socket.send(data).await.map(|_| ()),
        }
    }
}

impl WispStream {
    /// Create the stream, register it in the session table, and spawn its
    /// tasks. Registration happens before the tasks run so a connect failure
    /// always finds its own table entry to remove.
    pub(crate) fn open(session: Arc<WispSession>, stream_id: u32, connect: ConnectPayload) {
        let capacity = session.config().buffer_remaining_length.max(1) as usize;
        let (data_tx, data_rx) = mpsc::channel(capacity);
        let (ready_tx, ready_rx) = oneshot::channel();

        let stream = Arc::new(Self {
            id: stream_id,
            kind: connect.stream_type,
            session: session.clone(),
            state: AtomicU8::new(STATE_CONNECTING),
            data_tx,
            cancel: CancellationToken::new(),
        });

        session.register(stream_id, stream.clone());

        tokio::spawn(
            stream
                .clone()
                .run_connect(connect.hostname, connect.port, ready_tx),
        );
        tokio::spawn(stream.run_inbound(data_rx, ready_rx));
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Queue an inbound DATA payload for the write pump. A full queue drops
    /// the newest payload: the credit window already bounds a well-behaved
    /// client, so overflow is a protocol violation, not a server problem.
    pub(crate) fn enqueue(&self, payload: Bytes) {
        if self.is_closed() {
            return;
        }
        match self.data_tx.try_send(payload) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                trace!(
                    "[{}] stream {}: inbound queue full, dropping {} bytes",
                    self.session.id(),
                    self.id,
                    dropped.len()
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Close exactly once. Racing callers (peer CLOSE, pump errors, session
    /// teardown) all land here; the winner of the state swap removes the
    /// stream from the session, cancels both pumps, and sends the CLOSE
    /// packet.
    pub(crate) fn close(&self, reason: CloseReason) {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return;
        }

        self.session.unregister(self.id);
        self.cancel.cancel();
        self.session.send_close(self.id, reason);

        debug!(
            "[{}] stream {} closed: {:?}",
            self.session.id(),
            self.id,
            reason
        );
    }

    /// Dial the destination, publish Connected, then pump destination reads
    /// back to the client until EOF, error, or close.
    async fn run_connect(
        self: Arc<Self>,
        hostname: String,
        port: u16,
        ready_tx: oneshot::Sender<SocketWriter>,
    ) {
        if self.session.config().is_hostname_blocked(&hostname) {
            debug!(
                "[{}] stream {}: hostname {:?} blocked by policy",
                self.session.id(),
                self.id,
                hostname
            );
            self.close(CloseReason::Blocked);
            return;
        }

        let dialed = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.session.dialer().dial(self.kind, &hostname, port) => result,
        };

        let socket = match dialed {
            Ok(socket) => socket,
            Err(DialError::Blocked) => {
                self.close(CloseReason::Blocked);
                return;
            }
            Err(e) => {
                debug!(
                    "[{}] stream {}: dial {}:{} failed: {}",
                    self.session.id(),
                    self.id,
                    hostname,
                    port,
                    e
                );
                self.close(CloseReason::NetworkError);
                return;
            }
        };

        // Lost a race with close while dialing; drop the fresh socket.
        if self
            .state
            .compare_exchange(
                STATE_CONNECTING,
                STATE_CONNECTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        trace!(
            "[{}] stream {}: connected to {}:{}",
            self.session.id(),
            self.id,
            hostname,
            port
        );

        let (reader, writer) = match socket {
            DialedSocket::Tcp(tcp) => {
                let (read, write) = tcp.into_split();
                (SocketReader::Tcp(read), SocketWriter::Tcp(write))
            }
            DialedSocket::Udp(udp) => {
                let udp = Arc::new(udp);
                (SocketReader::Udp(udp.clone()), SocketWriter::Udp(udp))
            }
        };

        // Release the inbound pump; it only fails if close already won.
        if ready_tx.send(writer).is_err() {
            return;
        }

        match reader {
            SocketReader::Tcp(read) => self.run_outbound_tcp(read).await,
            SocketReader::Udp(socket) => self.run_outbound_udp(socket).await,
        }
    }

    /// Outbound pump, TCP side: one DATA packet per read, sent in read
    /// order. The read buffer is reused, so each slice is copied before it
    /// is handed to the session writer.
    async fn run_outbound_tcp(self: Arc<Self>, mut read: OwnedReadHalf) {
        let mut buffer = vec![0u8; self.session.config().tcp_buffer_size];

        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = read.read(&mut buffer) => match result {
                    Ok(0) => {
                        self.close(CloseReason::Voluntary);
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        trace!(
                            "[{}] stream {}: read error: {}",
                            self.session.id(),
                            self.id,
                            e
                        );
                        self.close(CloseReason::NetworkError);
                        return;
                    }
                },
            };

            self.session
                .send_data(self.id, Bytes::copy_from_slice(&buffer[..n]));
        }
    }

    async fn run_outbound_udp(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut buffer = vec![0u8; MAX_UDP_PAYLOAD];

        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = socket.recv(&mut buffer) => match result {
                    Ok(n) => n,
                    Err(e) => {
                        trace!(
                            "[{}] stream {}: recv error: {}",
                            self.session.id(),
                            self.id,
                            e
                        );
                        self.close(CloseReason::NetworkError);
                        return;
                    }
                },
            };

            if n == 0 {
                continue;
            }

            self.session
                .send_data(self.id, Bytes::copy_from_slice(&buffer[..n]));
        }
    }

    /// Inbound pump: sole consumer of the DATA queue. Payloads that arrive
    /// while the dial is still in flight wait in the queue and drain in
    /// order once the connect task hands over the socket writer. TCP writes
    /// spend credit; at zero the window resets and a CONTINUE grants the
    /// client another full window. UDP never touches credit.
    async fn run_inbound(
        self: Arc<Self>,
        mut data_rx: mpsc::Receiver<Bytes>,
        ready_rx: oneshot::Receiver<SocketWriter>,
    ) {
        let mut writer = tokio::select! {
            _ = self.cancel.cancelled() => return,
            ready = ready_rx => match ready {
                Ok(writer) => writer,
                // Connect failed or the stream closed first
                Err(_) => return,
            },
        };

        let refill = self.session.config().buffer_remaining_length;
        let mut credit = refill;

        loop {
            let payload = tokio::select! {
                _ = self.cancel.cancelled() => return,
                data = data_rx.recv() => match data {
                    Some(payload) => payload,
                    None => return,
                },
            };

            let written = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = writer.write(&payload) => result,
            };

            if let Err(e) = written {
                trace!(
                    "[{}] stream {}: write error: {}",
                    self.session.id(),
                    self.id,
                    e
                );
                self.close(CloseReason::NetworkError);
                return;
            }

            if self.kind == StreamType::Tcp {
                credit = credit.saturating_sub(1);
                if credit == 0 {
                    credit = refill;
                    self.session.send_continue(self.id, refill);
                }
            }
        }
    }
}
