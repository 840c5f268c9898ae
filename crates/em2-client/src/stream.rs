//! Fast-buffer streaming receiver.
//!
//! In `FAST_BUFFER` mode the instrument pushes one message per acquired
//! point on a second port, as length-delimited JSON. A dedicated background
//! task ingests those messages into a strictly-ordered queue shared with
//! the control path; frame numbers are checked on the way out so any drop
//! surfaces as a data-loss error instead of silently misaligned samples.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use em2_core::{Em2Error, Em2Result};

use crate::codec::{measurement_channel_keys, ChannelData};

/// Safety backstop on buffered messages; not a flow-control mechanism.
const MAX_MESSAGES_IN_FLIGHT: usize = 1_000_000;

/// Largest acceptable framed payload (a data message is a few hundred
/// bytes; anything near this is a desynchronized stream).
const MAX_PAYLOAD_BYTES: u32 = 1 << 20;

/// One streamed measurement message.
///
/// Only `message_type == "data"` messages are consumed; a data message
/// carries a strictly sequential `frame_number` and one sample per
/// `CHANnn` key.
#[derive(Debug, Deserialize)]
struct StreamMessage {
    message_type: String,
    #[serde(default)]
    frame_number: u64,
    #[serde(flatten)]
    samples: HashMap<String, f64>,
}

/// Source of length-delimited stream payloads (injection seam for tests).
#[async_trait]
pub trait StreamSource: Send {
    /// Next payload, or `None` on a clean end of stream.
    async fn next_payload(&mut self) -> std::io::Result<Option<Vec<u8>>>;
}

/// Factory dialed by the ingestion task on every start.
pub type SourceFactory =
    Arc<dyn Fn() -> BoxFuture<'static, std::io::Result<Box<dyn StreamSource>>> + Send + Sync>;

/// TCP stream source: u32 big-endian length prefix, then the JSON payload.
struct TcpStreamSource {
    reader: BufReader<TcpStream>,
}

#[async_trait]
impl StreamSource for TcpStreamSource {
    async fn next_payload(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let len = u32::from_be_bytes(header);
        if len > MAX_PAYLOAD_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("oversized stream payload: {len} bytes"),
            ));
        }
        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }
}

/// Arrival-ordered message queue with dequeue accounting.
///
/// `front_position` counts messages ever dequeued and `total_count`
/// messages ever enqueued, so `front_position <= total_count` always and
/// `total_count - front_position` is what is currently available.
#[derive(Default)]
struct CountableQueue {
    items: VecDeque<StreamMessage>,
    front_position: u64,
    total_count: u64,
}

impl CountableQueue {
    fn put(&mut self, message: StreamMessage) {
        self.items.push_back(message);
        self.total_count += 1;
    }

    fn get(&mut self) -> Option<StreamMessage> {
        let item = self.items.pop_front()?;
        self.front_position += 1;
        Some(item)
    }
}

/// State shared between the ingestion task and the control path.
#[derive(Default)]
struct WorkerShared {
    queue: CountableQueue,
    last_error: Option<String>,
}

/// Background receiver for the fast-buffer stream.
///
/// There is exactly one producer (the ingestion task) and one consumer
/// (the facade's read path); all shared state lives behind one mutex with
/// O(1) critical sections.
pub struct StreamReceiver {
    connect: SourceFactory,
    shared: Arc<Mutex<WorkerShared>>,
    expected_frame_number: u64,
    running: bool,
    stop_tx: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
}

impl StreamReceiver {
    /// Receiver for the instrument's streaming port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let connect: SourceFactory = Arc::new(move || {
            let host = host.clone();
            Box::pin(async move {
                let stream = TcpStream::connect((host.as_str(), port)).await?;
                Ok(Box::new(TcpStreamSource {
                    reader: BufReader::new(stream),
                }) as Box<dyn StreamSource>)
            })
        });
        Self::with_source_factory(connect)
    }

    /// Receiver over an injected source (used by tests).
    pub fn with_source_factory(connect: SourceFactory) -> Self {
        Self {
            connect,
            shared: Arc::new(Mutex::new(WorkerShared::default())),
            expected_frame_number: 0,
            running: false,
            stop_tx: None,
            worker: None,
        }
    }

    /// Whether the ingestion task has been started and not yet stopped.
    pub fn running(&self) -> bool {
        self.running
    }

    /// Start the ingestion task.
    ///
    /// A running receiver is fully stopped first, and the queue, frame
    /// accounting and recorded error are reset, so starting twice never
    /// mixes frames from two acquisitions.
    pub async fn start(&mut self) {
        if self.running {
            self.stop().await;
        }
        *self.shared.lock() = WorkerShared::default();
        self.expected_frame_number = 0;

        let (stop_tx, stop_rx) = watch::channel(false);
        let connect = Arc::clone(&self.connect);
        let shared = Arc::clone(&self.shared);
        tracing::info!("starting stream receiver");
        self.worker = Some(tokio::spawn(ingest(connect, shared, stop_rx)));
        self.stop_tx = Some(stop_tx);
        self.running = true;
    }

    /// Signal the ingestion task to exit and wait for it.
    ///
    /// The task observes the signal even mid-poll, so this returns
    /// promptly; a no-op when not running.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        self.running = false;
        tracing::info!("stream receiver stopped");
    }

    /// Count of data messages received so far.
    ///
    /// Raises the ingestion task's recorded error instead of returning a
    /// stale count.
    pub fn nb_points_received(&self) -> Em2Result<u64> {
        let shared = self.shared.lock();
        if let Some(error) = &shared.last_error {
            return Err(Em2Error::Stream(error.clone()));
        }
        Ok(shared.queue.total_count)
    }

    /// Dequeue `nb_points` messages (all available when `None`) starting at
    /// `start_position`, which must be the current front of the queue.
    ///
    /// Verifies each message's frame number against the expected sequence;
    /// a mismatch means frames were dropped and the acquisition must be
    /// restarted.
    pub fn read(
        &mut self,
        start_position: u64,
        nb_points: Option<usize>,
    ) -> Em2Result<ChannelData> {
        let mut shared = self.shared.lock();
        let front = shared.queue.front_position;
        let available = (shared.queue.total_count - front) as usize;
        if start_position != front {
            return Err(Em2Error::DataLoss(format!(
                "reads must be from the front of the queue. {start_position} != {front}."
            )));
        }
        let nb_points = match nb_points {
            None => available,
            Some(n) if n > available => {
                return Err(Em2Error::DataLoss(format!(
                    "cannot read more items than in the queue. {n} > {available}."
                )))
            }
            Some(n) => n,
        };

        let mut data: ChannelData = measurement_channel_keys()
            .into_iter()
            .map(|key| (key, Vec::with_capacity(nb_points)))
            .collect();
        for _ in 0..nb_points {
            let message = shared.queue.get().ok_or_else(|| {
                Em2Error::DataLoss("queue drained while reading".to_string())
            })?;
            if message.frame_number != self.expected_frame_number {
                return Err(Em2Error::DataLoss(format!(
                    "dropped frame(s): received #{} != expected #{}. The system may be \
                     overloaded, or another receiver may be attached to the stream.",
                    message.frame_number, self.expected_frame_number
                )));
            }
            self.expected_frame_number += 1;
            for (channel, series) in data.iter_mut() {
                let sample = message.samples.get(channel).copied().ok_or_else(|| {
                    Em2Error::Stream(format!(
                        "data message #{} is missing {channel}",
                        message.frame_number
                    ))
                })?;
                series.push(sample);
            }
        }
        Ok(data)
    }
}

/// Ingestion loop: poll the source, decode, enqueue data messages.
///
/// Malformed payloads are recorded and polling continues (later frames are
/// still usable for diagnosis); transport failures end the loop.
async fn ingest(
    connect: SourceFactory,
    shared: Arc<Mutex<WorkerShared>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    // Later errors replace earlier ones so the consumer sees the most
    // recent failure, not the first.
    let record = |error: String| {
        tracing::warn!("stream worker: {error}");
        shared.lock().last_error = Some(error);
    };

    let mut source = tokio::select! {
        _ = stop_rx.changed() => return,
        connected = (connect)() => match connected {
            Ok(source) => source,
            Err(e) => {
                record(format!("failed to connect to stream: {e}."));
                return;
            }
        },
    };

    loop {
        // A stop request interrupts the in-flight poll; there is nothing
        // worth finishing once the acquisition is being torn down.
        let next = tokio::select! {
            _ = stop_rx.changed() => break,
            next = source.next_payload() => next,
        };
        match next {
            Ok(Some(payload)) => {
                if let Some(error) = accept_payload(&shared, &payload) {
                    record(error);
                }
            }
            Ok(None) => {
                record("stream closed by the instrument.".to_string());
                break;
            }
            Err(e) => {
                record(format!("general error receiving message: {e}."));
                break;
            }
        }
    }
}

/// Decode one payload and enqueue it if it is a data message.
fn accept_payload(shared: &Arc<Mutex<WorkerShared>>, payload: &[u8]) -> Option<String> {
    match serde_json::from_slice::<StreamMessage>(payload) {
        Ok(message) if message.message_type == "data" => {
            let mut shared = shared.lock();
            if shared.queue.items.len() >= MAX_MESSAGES_IN_FLIGHT {
                return Some("message backstop exceeded; consumer stalled.".to_string());
            }
            shared.queue.put(message);
            None
        }
        // Non-data messages (e.g. status chatter) are not ours to consume.
        Ok(_) => None,
        Err(e) => Some(format!(
            "error deserialising JSON message: {} => {e}. Check fast buffer code on \
             the electrometer.",
            String::from_utf8_lossy(payload)
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct QueueSource {
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    #[async_trait]
    impl StreamSource for QueueSource {
        async fn next_payload(&mut self) -> std::io::Result<Option<Vec<u8>>> {
            Ok(self.rx.recv().await)
        }
    }

    /// Receiver whose starts consume the given sources in order.
    fn receiver_with_sources(
        sources: Vec<mpsc::UnboundedReceiver<Vec<u8>>>,
    ) -> StreamReceiver {
        let pending = Arc::new(Mutex::new(VecDeque::from(sources)));
        StreamReceiver::with_source_factory(Arc::new(move || {
            let pending = Arc::clone(&pending);
            Box::pin(async move {
                let rx = pending.lock().pop_front().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotConnected, "no source left")
                })?;
                Ok(Box::new(QueueSource { rx }) as Box<dyn StreamSource>)
            })
        }))
    }

    fn data_frame(frame_number: u64) -> Vec<u8> {
        format!(
            r#"{{"message_type": "data", "frame_number": {frame_number}, "CHAN01": {0}, "CHAN02": {0}, "CHAN03": {0}, "CHAN04": {0}}}"#,
            frame_number as f64 + 1.0
        )
        .into_bytes()
    }

    async fn wait_for_points(receiver: &StreamReceiver, n: u64) {
        for _ in 0..200 {
            if receiver.nb_points_received().map(|c| c >= n).unwrap_or(true) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_for_error(receiver: &StreamReceiver) {
        for _ in 0..200 {
            if receiver.nb_points_received().is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn queue_counters_hold_the_invariant() {
        let mut queue = CountableQueue::default();
        assert!(queue.get().is_none());
        for i in 0..5 {
            queue.put(StreamMessage {
                message_type: "data".into(),
                frame_number: i,
                samples: HashMap::new(),
            });
            assert!(queue.front_position <= queue.total_count);
        }
        for _ in 0..3 {
            queue.get();
            assert!(queue.front_position <= queue.total_count);
        }
        assert_eq!(queue.total_count, 5);
        assert_eq!(queue.front_position, 3);
    }

    #[tokio::test]
    async fn receives_and_reads_frames_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut receiver = receiver_with_sources(vec![rx]);
        receiver.start().await;
        for i in 0..3 {
            tx.send(data_frame(i)).unwrap();
        }
        wait_for_points(&receiver, 3).await;

        assert_eq!(receiver.nb_points_received().unwrap(), 3);
        let data = receiver.read(0, None).unwrap();
        assert_eq!(data["CHAN01"], vec![1.0, 2.0, 3.0]);
        assert_eq!(data["CHAN04"], vec![1.0, 2.0, 3.0]);
        receiver.stop().await;
    }

    #[tokio::test]
    async fn read_away_from_the_front_raises() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut receiver = receiver_with_sources(vec![rx]);
        receiver.start().await;
        tx.send(data_frame(0)).unwrap();
        wait_for_points(&receiver, 1).await;

        assert!(matches!(
            receiver.read(1, None),
            Err(Em2Error::DataLoss(_))
        ));
        receiver.stop().await;
    }

    #[tokio::test]
    async fn over_reading_the_queue_raises() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut receiver = receiver_with_sources(vec![rx]);
        receiver.start().await;
        tx.send(data_frame(0)).unwrap();
        wait_for_points(&receiver, 1).await;

        assert!(matches!(
            receiver.read(0, Some(2)),
            Err(Em2Error::DataLoss(_))
        ));
        // The failed read did not consume anything.
        assert_eq!(receiver.read(0, Some(1)).unwrap()["CHAN01"], vec![1.0]);
        receiver.stop().await;
    }

    #[tokio::test]
    async fn dropped_frame_is_detected_on_read() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut receiver = receiver_with_sources(vec![rx]);
        receiver.start().await;
        tx.send(data_frame(0)).unwrap();
        tx.send(data_frame(2)).unwrap(); // frame 1 dropped
        wait_for_points(&receiver, 2).await;

        let data = receiver.read(0, Some(1)).unwrap();
        assert_eq!(data["CHAN01"], vec![1.0]);
        let err = receiver.read(1, Some(1)).unwrap_err();
        match err {
            Em2Error::DataLoss(message) => {
                assert!(message.contains("#2") && message.contains("#1"), "{message}");
            }
            other => panic!("expected DataLoss, got {other:?}"),
        }
        receiver.stop().await;
    }

    #[tokio::test]
    async fn malformed_payload_is_recorded_but_not_fatal_to_the_loop() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut receiver = receiver_with_sources(vec![rx]);
        receiver.start().await;
        tx.send(b"not json".to_vec()).unwrap();
        tx.send(data_frame(0)).unwrap();
        wait_for_error(&receiver).await;

        let err = receiver.nb_points_received().unwrap_err();
        assert!(matches!(err, Em2Error::Stream(_)));
        receiver.stop().await;
    }

    #[tokio::test]
    async fn non_data_messages_are_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut receiver = receiver_with_sources(vec![rx]);
        receiver.start().await;
        tx.send(br#"{"message_type": "status", "state": "RUNNING"}"#.to_vec())
            .unwrap();
        tx.send(data_frame(0)).unwrap();
        wait_for_points(&receiver, 1).await;

        assert_eq!(receiver.nb_points_received().unwrap(), 1);
        receiver.stop().await;
    }

    #[tokio::test]
    async fn restart_resets_frame_accounting() {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let mut receiver = receiver_with_sources(vec![rx1, rx2]);

        receiver.start().await;
        tx1.send(data_frame(0)).unwrap();
        tx1.send(data_frame(1)).unwrap();
        wait_for_points(&receiver, 2).await;

        // Start again without reading: a fresh acquisition numbers its
        // frames from zero and the stale queue must be gone.
        receiver.start().await;
        tx2.send(data_frame(0)).unwrap();
        wait_for_points(&receiver, 1).await;

        assert_eq!(receiver.nb_points_received().unwrap(), 1);
        let data = receiver.read(0, None).unwrap();
        assert_eq!(data["CHAN01"], vec![1.0]);
        receiver.stop().await;
    }

    #[tokio::test]
    async fn stop_when_not_running_is_a_no_op() {
        let mut receiver = receiver_with_sources(vec![]);
        receiver.stop().await;
        assert!(!receiver.running());
    }

    #[tokio::test]
    async fn later_worker_errors_replace_earlier_ones() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut receiver = receiver_with_sources(vec![rx]);
        receiver.start().await;
        tx.send(b"not json".to_vec()).unwrap();
        wait_for_error(&receiver).await;
        drop(tx); // clean end of stream, recorded over the decode error

        for _ in 0..200 {
            match receiver.nb_points_received() {
                Err(Em2Error::Stream(m)) if m.contains("closed") => break,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
        match receiver.nb_points_received().unwrap_err() {
            Em2Error::Stream(m) => assert!(m.contains("closed"), "{m}"),
            other => panic!("expected Stream, got {other:?}"),
        }
        receiver.stop().await;
    }

    // =========================================================================
    // Wire framing over TCP
    // =========================================================================

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    /// Serve `bytes` to the first connection on an ephemeral port; the
    /// socket closes right after unless `hold_open`.
    async fn serve_bytes(bytes: Vec<u8>, hold_open: bool) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&bytes).await.unwrap();
            socket.flush().await.unwrap();
            if hold_open {
                std::future::pending::<()>().await;
            }
        });
        port
    }

    #[tokio::test]
    async fn tcp_source_decodes_length_prefixed_frames() {
        let mut bytes = frame(&data_frame(0));
        bytes.extend(frame(&data_frame(1)));
        let port = serve_bytes(bytes, true).await;

        let mut receiver = StreamReceiver::new("127.0.0.1", port);
        receiver.start().await;
        wait_for_points(&receiver, 2).await;

        assert_eq!(receiver.nb_points_received().unwrap(), 2);
        let data = receiver.read(0, None).unwrap();
        assert_eq!(data["CHAN01"], vec![1.0, 2.0]);
        receiver.stop().await;
    }

    #[tokio::test]
    async fn tcp_close_at_a_frame_boundary_keeps_received_frames() {
        let port = serve_bytes(frame(&data_frame(0)), false).await;

        let mut receiver = StreamReceiver::new("127.0.0.1", port);
        receiver.start().await;
        wait_for_error(&receiver).await;

        match receiver.nb_points_received().unwrap_err() {
            Em2Error::Stream(m) => assert!(m.contains("closed"), "{m}"),
            other => panic!("expected Stream, got {other:?}"),
        }
        // The frame delivered before the close is still readable.
        let data = receiver.read(0, Some(1)).unwrap();
        assert_eq!(data["CHAN01"], vec![1.0]);
        receiver.stop().await;
    }

    #[tokio::test]
    async fn oversized_frame_header_is_rejected() {
        let mut bytes = (MAX_PAYLOAD_BYTES + 1).to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        let port = serve_bytes(bytes, true).await;

        let mut receiver = StreamReceiver::new("127.0.0.1", port);
        receiver.start().await;
        wait_for_error(&receiver).await;

        match receiver.nb_points_received().unwrap_err() {
            Em2Error::Stream(m) => assert!(m.contains("oversized"), "{m}"),
            other => panic!("expected Stream, got {other:?}"),
        }
        receiver.stop().await;
    }

    #[tokio::test]
    async fn tcp_close_mid_frame_is_a_transport_error() {
        // Header promises 64 bytes; only 5 arrive before the close.
        let mut bytes = 64u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"short");
        let port = serve_bytes(bytes, false).await;

        let mut receiver = StreamReceiver::new("127.0.0.1", port);
        receiver.start().await;
        wait_for_error(&receiver).await;

        match receiver.nb_points_received().unwrap_err() {
            Em2Error::Stream(m) => assert!(m.contains("receiving"), "{m}"),
            other => panic!("expected Stream, got {other:?}"),
        }
        receiver.stop().await;
    }
}
