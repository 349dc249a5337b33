//! Per-WebSocket Wisp session
//!
//! A session owns the stream table and the single outbound packet channel.
//! Every packet sent back to the client flows through that channel, so the
//! handler's writer task is the only WebSocket writer and frames never
//! interleave.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::config::WispConfig;
use super::dialer::Dialer;
use super::packet::{CloseReason, ConnectPayload, Packet, PacketType};
use super::stream::WispStream;

pub struct WispSession {
    id: String,
    config: Arc<WispConfig>,
    dialer: Arc<dyn Dialer>,
    streams: DashMap<u32, Arc<WispStream>>,
    packet_tx: mpsc::UnboundedSender<Bytes>,
    torn_down: AtomicBool,
}

impl WispSession {
    /// Create a session and immediately queue the initial
    /// `CONTINUE(stream_id=0)` credit advertisement, the first frame on the
    /// wire and the only one with stream id 0. The returned receiver is the
    /// serialized outbound frame stream the caller must pump into the
    /// WebSocket.
    pub fn new(
        config: Arc<WispConfig>,
        dialer: Arc<dyn Dialer>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            dialer,
            streams: DashMap::new(),
            packet_tx,
            torn_down: AtomicBool::new(false),
        });

        session.send_continue(0, session.config.buffer_remaining_length);

        (session, packet_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn config(&self) -> &WispConfig {
        &self.config
    }

    pub(crate) fn dialer(&self) -> &dyn Dialer {
        self.dialer.as_ref()
    }

    /// Number of live streams; teardown drives this to zero.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Demultiplex one inbound WebSocket binary frame. Malformed frames are
    /// ignored; a broken client cannot take the session down.
    pub fn handle_frame(self: &Arc<Self>, frame: Bytes) {
        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("[{}] ignoring frame: {}", self.id, e);
                return;
            }
        };

        match packet.packet_type {
            PacketType::Connect => self.handle_connect(packet.stream_id, &packet.payload),
            PacketType::Data => self.handle_data(packet.stream_id, packet.payload),
            PacketType::Continue => {
                // The server grants credit, it never spends it
                trace!("[{}] ignoring client CONTINUE", self.id);
            }
            PacketType::Close => self.handle_close(packet.stream_id, &packet.payload),
        }
    }

    fn handle_connect(self: &Arc<Self>, stream_id: u32, payload: &[u8]) {
        // No new streams once teardown has begun; they would never be closed
        if self.torn_down.load(Ordering::Acquire) {
            return;
        }

        let connect = match ConnectPayload::parse(payload) {
            Ok(connect) => connect,
            Err(e) => {
                debug!("[{}] dropping CONNECT for stream {}: {}", self.id, stream_id, e);
                return;
            }
        };

        // The read loop is the only task that creates streams, so a plain
        // existence check is race-free. First CONNECT wins.
        if self.streams.contains_key(&stream_id) {
            debug!("[{}] ignoring duplicate CONNECT for stream {}", self.id, stream_id);
            return;
        }

        debug!(
            "[{}] stream {}: CONNECT {:?} {}:{}",
            self.id, stream_id, connect.stream_type, connect.hostname, connect.port
        );

        WispStream::open(self.clone(), stream_id, connect);
    }

    fn handle_data(&self, stream_id: u32, payload: Bytes) {
        let Some(stream) = self.get_stream(stream_id) else {
            self.send_close(stream_id, CloseReason::InvalidInfo);
            return;
        };
        stream.enqueue(payload);
    }

    fn handle_close(&self, stream_id: u32, payload: &[u8]) {
        let Some(&reason) = payload.first() else {
            return;
        };
        let Some(stream) = self.get_stream(stream_id) else {
            return;
        };

        // The client's reason byte is logged but not interpreted further
        debug!(
            "[{}] stream {}: client CLOSE, reason {:#04x}",
            self.id, stream_id, reason
        );
        stream.close(CloseReason::Voluntary);
    }

    /// Close every stream still in the table. Idempotent; runs when the
    /// WebSocket read loop exits for any reason.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let streams: Vec<Arc<WispStream>> = self
            .streams
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        debug!("[{}] tearing down {} streams", self.id, streams.len());

        for stream in streams {
            stream.close(CloseReason::Unspecified);
        }
    }

    pub(crate) fn register(&self, stream_id: u32, stream: Arc<WispStream>) {
        self.streams.insert(stream_id, stream);
    }

    pub(crate) fn unregister(&self, stream_id: u32) {
        self.streams.remove(&stream_id);
    }

    // Clone the Arc out so no table shard lock is held while the stream
    // acts; WispStream::close re-enters the table to unregister itself.
    fn get_stream(&self, stream_id: u32) -> Option<Arc<WispStream>> {
        self.streams
            .get(&stream_id)
            .map(|entry| entry.value().clone())
    }

    pub(crate) fn send_data(&self, stream_id: u32, payload: Bytes) {
        self.send_packet(Packet::data(stream_id, payload));
    }

    pub(crate) fn send_continue(&self, stream_id: u32, buffer_remaining: u32) {
        self.send_packet(Packet::continue_grant(stream_id, buffer_remaining));
    }

    pub(crate) fn send_close(&self, stream_id: u32, reason: CloseReason) {
        self.send_packet(Packet::close(stream_id, reason));
    }

    // Send failure means the writer task is gone and the session is dying;
    // nothing useful is left to do with the packet.
    fn send_packet(&self, packet: Packet) {
        let _ = self.packet_tx.send(packet.encode());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::wisp::dialer::{DialError, DialedSocket};
    use crate::wisp::packet::StreamType;

    /// Records dial attempts and never resolves, so streams stay in the
    /// table in their Connecting state.
    struct PendingDialer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for PendingDialer {
        async fn dial(
            &self,
            _kind: StreamType,
            _host: &str,
            _port: u16,
        ) -> Result<DialedSocket, DialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    fn demux_session() -> (
        Arc<WispSession>,
        mpsc::UnboundedReceiver<Bytes>,
        Arc<PendingDialer>,
    ) {
        let dialer = Arc::new(PendingDialer {
            calls: AtomicUsize::new(0),
        });
        let (session, mut rx) = WispSession::new(Arc::new(WispConfig::default()), dialer.clone());
        rx.try_recv().expect("missing initial CONTINUE");
        (session, rx, dialer)
    }

    fn connect_frame(stream_id: u32) -> Bytes {
        let mut frame = vec![0x01];
        frame.extend_from_slice(&stream_id.to_le_bytes());
        frame.extend_from_slice(&[0x01, 0x50, 0x00]);
        frame.extend_from_slice(b"example.com");
        Bytes::from(frame)
    }

    #[tokio::test]
    async fn initial_continue_is_queued_at_construction() {
        let dialer = Arc::new(PendingDialer {
            calls: AtomicUsize::new(0),
        });
        let config = Arc::new(WispConfig {
            buffer_remaining_length: 255,
            ..Default::default()
        });
        let (_session, mut rx) = WispSession::new(config, dialer);

        let frame = rx.try_recv().expect("missing initial CONTINUE");
        assert_eq!(
            frame.as_ref(),
            &[0x03, 0x00, 0x00, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn duplicate_connect_is_ignored() {
        let (session, _rx, dialer) = demux_session();

        session.handle_frame(connect_frame(1));
        session.handle_frame(connect_frame(1));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.stream_count(), 1);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn data_for_unknown_stream_replies_invalid_info() {
        let (session, mut rx, _dialer) = demux_session();

        session.handle_frame(Bytes::from_static(&[0x02, 0x09, 0x00, 0x00, 0x00, 0xAA]));

        let frame = rx.try_recv().expect("expected CLOSE frame");
        assert_eq!(frame.as_ref(), &[0x04, 0x09, 0x00, 0x00, 0x00, 0x41]);
        assert_eq!(session.stream_count(), 0);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_without_reply() {
        let (session, mut rx, dialer) = demux_session();

        // Short frame, unknown packet type, short CONNECT payload, unknown
        // stream type, short CLOSE payload
        session.handle_frame(Bytes::from_static(&[0x02, 0x01]));
        session.handle_frame(Bytes::from_static(&[0x7F, 0x01, 0x00, 0x00, 0x00]));
        session.handle_frame(Bytes::from_static(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x01]));
        session.handle_frame(Bytes::from_static(&[
            0x01, 0x01, 0x00, 0x00, 0x00, 0x07, 0x50, 0x00,
        ]));
        session.handle_frame(Bytes::from_static(&[0x04, 0x01, 0x00, 0x00, 0x00]));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(session.stream_count(), 0);
        assert_eq!(dialer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn client_continue_is_ignored() {
        let (session, mut rx, _dialer) = demux_session();

        session.handle_frame(Bytes::from_static(&[
            0x03, 0x01, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00,
        ]));

        assert!(rx.try_recv().is_err());
        assert_eq!(session.stream_count(), 0);
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let (session, mut rx, _dialer) = demux_session();

        session.handle_frame(connect_frame(1));
        session.teardown();
        session.teardown();

        let frame = rx.try_recv().expect("expected CLOSE frame");
        assert_eq!(frame.as_ref(), &[0x04, 0x01, 0x00, 0x00, 0x00, 0x01]);
        assert!(rx.try_recv().is_err());
        assert_eq!(session.stream_count(), 0);
    }
}
