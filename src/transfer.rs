//! Per-connection data transfer.
//!
//! A [`TransferChannel`] exists only while its connection is `Connected`.
//! Outbound data goes through a bounded queue drained by one task, so writes
//! reach the transport in the order they were queued. Inbound data collects
//! in a bounded buffer; the connection pauses transport reads when the buffer
//! crosses its high watermark. Frames are decoded per channel, so a partial
//! frame never outlives the link it arrived on.

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::config::TransferConfig;
use crate::device::Address;
use crate::error::{Error, Result};
use crate::protocol::FrameDecoder;
use crate::transport::{LinkHandle, Transport, TransportError};

/// Bytes requested per read while assembling a frame.
const FRAME_READ_SIZE: usize = 4096;

/// Receiver for the failure that stopped a channel's writer.
pub(crate) type DrainFailure = oneshot::Receiver<TransportError>;

/// Byte counters for one connection.
#[derive(Debug, Default)]
pub struct TransferStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TransferStats {
    /// Bytes accepted by the transport.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes received from the transport.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

/// Which way data moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataDirection {
    /// Written to the device.
    Sent,
    /// Received from the device.
    Received,
}

/// Bytes that moved over a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct DataEvent {
    /// The device.
    pub address: Address,
    /// Which way the bytes went.
    pub direction: DataDirection,
    /// The bytes accepted by the transport or the receive buffer.
    pub data: Bytes,
}

#[derive(Debug, Default)]
struct Inbound {
    buffer: BytesMut,
    closed: bool,
}

/// Bidirectional byte pipe over one open link.
pub struct TransferChannel {
    address: Address,
    config: TransferConfig,
    outbound: mpsc::Sender<Bytes>,
    inbound: Mutex<Inbound>,
    data_ready: Notify,
    space_ready: Notify,
    stats: Arc<TransferStats>,
    frames: Mutex<FrameDecoder>,
    activity: broadcast::Sender<DataEvent>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl TransferChannel {
    /// Open a channel over `handle` and start its writer.
    ///
    /// Every byte written or buffered is also published on `activity`.
    pub(crate) fn open(
        address: Address,
        transport: Arc<dyn Transport>,
        handle: LinkHandle,
        config: TransferConfig,
        activity: broadcast::Sender<DataEvent>,
    ) -> (Arc<Self>, DrainFailure) {
        let (outbound, queue) = mpsc::channel(config.outbound_capacity);
        let (failure_tx, failure_rx) = oneshot::channel();
        let stats = Arc::new(TransferStats::default());

        let writer = tokio::spawn(drain(
            Writer {
                address: address.clone(),
                transport,
                handle,
                config: config.clone(),
                stats: stats.clone(),
                activity: activity.clone(),
            },
            queue,
            failure_tx,
        ));

        let channel = Arc::new(Self {
            address,
            inbound: Mutex::new(Inbound {
                buffer: BytesMut::with_capacity(config.inbound_capacity.min(4096)),
                closed: false,
            }),
            frames: Mutex::new(FrameDecoder::with_check(
                config.max_frame_len,
                config.frame_check,
            )),
            config,
            outbound,
            data_ready: Notify::new(),
            space_ready: Notify::new(),
            stats,
            activity,
            writer: Mutex::new(Some(writer)),
        });

        (channel, failure_rx)
    }

    /// The device this channel talks to.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Queue `data` for transmission.
    ///
    /// Waits up to `send_timeout` for queue space. Returns once the data is
    /// queued, not once it is written. Empty data is accepted and ignored.
    ///
    /// # Errors
    ///
    /// - [`Error::Backpressure`] if the queue stayed full.
    /// - [`Error::Disconnected`] if the channel was closed.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(self.disconnected());
        }
        if data.is_empty() {
            return Ok(());
        }

        let permit = match timeout(self.config.send_timeout, self.outbound.reserve()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.disconnected()),
            Err(_) => {
                return Err(Error::Backpressure {
                    address: self.address.to_string(),
                    detail: format!(
                        "outbound queue full for {:?}",
                        self.config.send_timeout
                    ),
                })
            }
        };

        permit.send(Bytes::copy_from_slice(data));
        trace!("Queued {} bytes for {}", data.len(), self.address);
        Ok(())
    }

    /// Take up to `max_len` buffered bytes, waiting up to `wait` for data.
    ///
    /// Data buffered before the channel closed is still handed out.
    ///
    /// # Errors
    ///
    /// - [`Error::Backpressure`] if nothing arrived in time.
    /// - [`Error::Disconnected`] if the channel is closed and drained.
    pub async fn receive(&self, max_len: usize, wait: Duration) -> Result<Bytes> {
        if max_len == 0 {
            return Ok(Bytes::new());
        }

        let deadline = Instant::now() + wait;
        loop {
            let notified = self.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inbound = self.inbound.lock();
                if !inbound.buffer.is_empty() {
                    let take = max_len.min(inbound.buffer.len());
                    let data = inbound.buffer.split_to(take).freeze();
                    drop(inbound);
                    self.space_ready.notify_one();
                    return Ok(data);
                }
                if inbound.closed {
                    return Err(self.disconnected());
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Backpressure {
                    address: self.address.to_string(),
                    detail: format!("no data received within {:?}", wait),
                });
            }
        }
    }

    /// Take the next complete frame, waiting up to `wait` for its bytes.
    ///
    /// Bytes past the end of the frame are kept for the next call.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidFrame`] for a corrupt frame.
    /// - [`Error::Backpressure`] if no complete frame arrived in time.
    /// - [`Error::Disconnected`] if the channel is closed and drained.
    pub async fn receive_frame(&self, wait: Duration) -> Result<Bytes> {
        let deadline = Instant::now() + wait;

        loop {
            let decoded = self.frames.lock().decode()?;
            if let Some(payload) = decoded {
                return Ok(payload);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let chunk = self.receive(FRAME_READ_SIZE, remaining).await?;
            self.frames.lock().extend(&chunk);
        }
    }

    /// Bytes waiting to be received.
    pub fn buffered(&self) -> usize {
        self.inbound.lock().buffer.len()
    }

    /// Writes queued but not yet taken by the writer.
    pub fn pending_writes(&self) -> usize {
        self.config
            .outbound_capacity
            .saturating_sub(self.outbound.capacity())
    }

    /// Byte counters.
    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.inbound.lock().closed
    }

    /// Buffer as much of `data` as fits and return the rest.
    pub(crate) fn offer(&self, mut data: Bytes) -> Bytes {
        let accepted = {
            let mut inbound = self.inbound.lock();
            if inbound.closed {
                return data;
            }
            let room = self
                .config
                .inbound_capacity
                .saturating_sub(inbound.buffer.len());
            let accepted = room.min(data.len());
            inbound.buffer.extend_from_slice(&data[..accepted]);
            accepted
        };

        if accepted > 0 {
            let _ = self.activity.send(DataEvent {
                address: self.address.clone(),
                direction: DataDirection::Received,
                data: data.slice(..accepted),
            });
            data.advance(accepted);
            self.stats
                .bytes_received
                .fetch_add(accepted as u64, Ordering::Relaxed);
            self.data_ready.notify_waiters();
        }
        data
    }

    /// Whether the buffer has reached the high watermark.
    pub(crate) fn above_high_watermark(&self) -> bool {
        self.buffered() >= self.config.inbound_high_watermark
    }

    /// Whether the buffer has drained to the low watermark.
    pub(crate) fn at_or_below_low_watermark(&self) -> bool {
        self.buffered() <= self.config.inbound_low_watermark
    }

    /// Resolves after a receiver took data out of the buffer.
    pub(crate) async fn space_available(&self) {
        self.space_ready.notified().await;
    }

    /// Stop the writer and fail pending and future operations.
    pub(crate) fn close(&self) {
        self.inbound.lock().closed = true;
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
        self.data_ready.notify_waiters();
        debug!("Transfer channel for {} closed", self.address);
    }

    fn disconnected(&self) -> Error {
        Error::Disconnected {
            address: self.address.to_string(),
        }
    }
}

impl Drop for TransferChannel {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.get_mut().take() {
            writer.abort();
        }
    }
}

impl std::fmt::Debug for TransferChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferChannel")
            .field("address", &self.address)
            .field("buffered", &self.buffered())
            .field("frame_bytes", &self.frames.lock().buffered())
            .field("pending_writes", &self.pending_writes())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// What the writer task needs to reach the transport.
struct Writer {
    address: Address,
    transport: Arc<dyn Transport>,
    handle: LinkHandle,
    config: TransferConfig,
    stats: Arc<TransferStats>,
    activity: broadcast::Sender<DataEvent>,
}

/// Write queued data to the transport in order, chunked to the link payload.
async fn drain(
    writer: Writer,
    mut queue: mpsc::Receiver<Bytes>,
    failure: oneshot::Sender<TransportError>,
) {
    let Writer {
        address,
        transport,
        handle,
        config,
        stats,
        activity,
    } = writer;

    while let Some(mut data) = queue.recv().await {
        while !data.is_empty() {
            let chunk = transport
                .max_payload_size(handle)
                .min(config.max_chunk_size)
                .max(1)
                .min(data.len());

            match write_with_retry(transport.as_ref(), handle, &data[..chunk], &config).await {
                Ok(written) => {
                    let _ = activity.send(DataEvent {
                        address: address.clone(),
                        direction: DataDirection::Sent,
                        data: data.slice(..written),
                    });
                    data.advance(written);
                    stats
                        .bytes_sent
                        .fetch_add(written as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("Writer for {} stopped: {}", address, e);
                    let _ = failure.send(e);
                    return;
                }
            }
        }
    }
}

async fn write_with_retry(
    transport: &dyn Transport,
    handle: LinkHandle,
    chunk: &[u8],
    config: &TransferConfig,
) -> std::result::Result<usize, TransportError> {
    let mut retries = 0;
    loop {
        let error = match transport.write(handle, chunk).await {
            Ok(0) => TransportError::Other("write accepted no bytes".to_string()),
            Ok(written) => return Ok(written.min(chunk.len())),
            Err(e) => e,
        };

        if retries >= config.max_write_retries {
            return Err(error);
        }
        retries += 1;
        debug!(
            "Write to {} failed ({}), retry {} of {}",
            handle, error, retries, config.max_write_retries
        );
        tokio::time::sleep(config.write_retry_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceClass;
    use crate::protocol::{encode_frame, encode_frame_with, FrameCheck};
    use crate::transport::{MemoryTransport, MockTransport};
    use pretty_assertions::assert_eq;

    async fn linked_radio() -> (MemoryTransport, Address, LinkHandle) {
        let radio = MemoryTransport::new();
        let address = radio
            .add_device("AA:BB:CC:DD:EE:01", "Sensor", -50, DeviceClass::Ble)
            .unwrap();
        let handle = radio.open_link(&address).await.unwrap();
        (radio, address, handle)
    }

    fn open(
        radio: &MemoryTransport,
        address: &Address,
        handle: LinkHandle,
        config: TransferConfig,
    ) -> (Arc<TransferChannel>, DrainFailure) {
        let (activity, _) = broadcast::channel(64);
        TransferChannel::open(
            address.clone(),
            Arc::new(radio.clone()),
            handle,
            config,
            activity,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_is_chunked_and_ordered() {
        let (radio, address, handle) = linked_radio().await;
        radio.set_max_payload(4);
        let (channel, _failure) = open(&radio, &address, handle, TransferConfig::default());

        channel.send(b"hello ").await.unwrap();
        channel.send(b"world").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(radio.written(&address), b"hello world".to_vec());
        assert!(radio.write_calls(&address).iter().all(|n| *n <= 4));
        assert_eq!(channel.stats().bytes_sent(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_writes_continue_from_remainder() {
        let (radio, address, handle) = linked_radio().await;
        radio.set_write_limit(&address, Some(3));
        let (channel, _failure) = open(&radio, &address, handle, TransferConfig::default());

        channel.send(b"abcdefgh").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(radio.written(&address), b"abcdefgh".to_vec());
        assert_eq!(radio.write_calls(&address), vec![3, 3, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_errors_are_retried() {
        let (radio, address, handle) = linked_radio().await;
        radio.fail_next_writes(&address, 2);
        let (channel, mut failure) = open(&radio, &address, handle, TransferConfig::default());

        channel.send(b"data").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(radio.written(&address), b"data".to_vec());
        assert!(failure.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_write_failure_is_reported() {
        let (radio, address, handle) = linked_radio().await;
        radio.fail_next_writes(&address, 100);
        let (channel, failure) = open(&radio, &address, handle, TransferConfig::default());

        channel.send(b"data").await.unwrap();
        let error = failure.await.unwrap();
        assert!(matches!(error, TransportError::Other(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reports_backpressure_when_queue_stays_full() {
        let (radio, address, handle) = linked_radio().await;
        radio.set_write_delay(Duration::from_secs(3600));
        let config = TransferConfig {
            outbound_capacity: 2,
            send_timeout: Duration::from_millis(100),
            ..TransferConfig::default()
        };
        let (channel, _failure) = open(&radio, &address, handle, config);

        // The writer holds the first item, the queue holds two more.
        for _ in 0..3 {
            channel.send(b"x").await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let err = channel.send(b"x").await.unwrap_err();
        assert!(matches!(err, Error::Backpressure { .. }));
        assert_eq!(channel.pending_writes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_waits_for_data() {
        let (radio, address, handle) = linked_radio().await;
        let (channel, _failure) = open(&radio, &address, handle, TransferConfig::default());

        let receiver = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.receive(64, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(channel.offer(Bytes::from_static(b"ping")).is_empty());

        let data = receiver.await.unwrap().unwrap();
        assert_eq!(&data[..], b"ping");
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out_and_respects_max_len() {
        let (radio, address, handle) = linked_radio().await;
        let (channel, _failure) = open(&radio, &address, handle, TransferConfig::default());

        let err = channel
            .receive(8, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backpressure { .. }));

        channel.offer(Bytes::from_static(b"abcdef"));
        let first = channel.receive(4, Duration::ZERO).await.unwrap();
        let second = channel.receive(4, Duration::ZERO).await.unwrap();
        assert_eq!(&first[..], b"abcd");
        assert_eq!(&second[..], b"ef");
        assert!(channel.receive(0, Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offer_returns_overflow() {
        let (radio, address, handle) = linked_radio().await;
        let config = TransferConfig {
            inbound_capacity: 4,
            inbound_high_watermark: 3,
            inbound_low_watermark: 1,
            ..TransferConfig::default()
        };
        let (channel, _failure) = open(&radio, &address, handle, config);

        let rest = channel.offer(Bytes::from_static(b"abcdef"));
        assert_eq!(&rest[..], b"ef");
        assert!(channel.above_high_watermark());
        assert!(!channel.at_or_below_low_watermark());
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_senders() {
        let (radio, address, handle) = linked_radio().await;
        let (channel, _failure) = open(&radio, &address, handle, TransferConfig::default());

        let receiver = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.receive(64, Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;
        channel.close();

        let err = receiver.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Disconnected { .. }));
        let err = channel.send(b"late").await.unwrap_err();
        assert!(matches!(err, Error::Disconnected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_byte_writes_count_as_failures() {
        let mut mock = MockTransport::new();
        mock.expect_max_payload_size().return_const(20usize);
        mock.expect_write().times(4).returning(|_, _| Ok(0));
        let address = Address::parse("AA:BB:CC:DD:EE:02").unwrap();

        let (channel, failure) = TransferChannel::open(
            address,
            Arc::new(mock),
            LinkHandle::new(1),
            TransferConfig::default(),
            broadcast::channel(4).0,
        );
        channel.send(b"stuck").await.unwrap();

        assert!(matches!(failure.await.unwrap(), TransportError::Other(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_send_is_a_no_op() {
        let (radio, address, handle) = linked_radio().await;
        let (channel, _failure) = open(&radio, &address, handle, TransferConfig::default());

        channel.send(b"").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(channel.pending_writes(), 0);
        assert!(radio.write_calls(&address).is_empty());
        assert_eq!(channel.stats().bytes_sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_reports_both_directions() {
        let (radio, address, handle) = linked_radio().await;
        radio.set_max_payload(3);
        let (activity, mut events) = broadcast::channel(16);
        let (channel, _failure) = TransferChannel::open(
            address.clone(),
            Arc::new(radio.clone()),
            handle,
            TransferConfig::default(),
            activity,
        );

        channel.send(b"abcd").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.offer(Bytes::from_static(b"xy"));

        let seen: Vec<(DataDirection, Bytes)> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| {
                assert_eq!(event.address, address);
                (event.direction, event.data)
            })
            .collect();
        assert_eq!(
            seen,
            vec![
                (DataDirection::Sent, Bytes::from_static(b"abc")),
                (DataDirection::Sent, Bytes::from_static(b"d")),
                (DataDirection::Received, Bytes::from_static(b"xy")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_frame_assembles_split_frames() {
        let (radio, address, handle) = linked_radio().await;
        let (channel, _failure) = open(&radio, &address, handle, TransferConfig::default());

        let mut stream = encode_frame(b"one").unwrap().to_vec();
        stream.extend_from_slice(&encode_frame(b"two").unwrap());
        channel.offer(Bytes::copy_from_slice(&stream[..3]));

        let err = channel
            .receive_frame(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backpressure { .. }));

        channel.offer(Bytes::copy_from_slice(&stream[3..]));
        let first = channel.receive_frame(Duration::from_secs(1)).await.unwrap();
        let second = channel.receive_frame(Duration::ZERO).await.unwrap();
        assert_eq!(&first[..], b"one");
        assert_eq!(&second[..], b"two");
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_frame_uses_configured_check() {
        let (radio, address, handle) = linked_radio().await;
        let config = TransferConfig {
            frame_check: FrameCheck::Crc16,
            ..TransferConfig::default()
        };
        let (channel, _failure) = open(&radio, &address, handle, config);

        channel.offer(encode_frame_with(b"crc", FrameCheck::Crc16).unwrap());
        let payload = channel.receive_frame(Duration::ZERO).await.unwrap();
        assert_eq!(&payload[..], b"crc");

        // A default-check frame is one byte short of a CRC trailer.
        let mut sum8 = encode_frame(b"sum8").unwrap().to_vec();
        sum8.push(0);
        channel.offer(Bytes::from(sum8));
        let err = channel.receive_frame(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::InvalidFrame { .. }));
    }
}
