//! Multicast of one byte stream to several sinks.
//!
//! [`Multicast`] reads its source once and hands every chunk to each
//! attached sink through a bounded queue. The next chunk is only read after
//! every queue has accepted the current one, so the slowest sink sets the
//! pace and memory stays bounded by `sinks × capacity × chunk_size`.
//!
//! Each sink is an async task that hands every chunk to the blocking pool
//! for one `accept` call, so no blocking thread is held between chunks and
//! any number of sinks can be in flight. Sinks see chunks in source order. A
//! sink only finalizes after an explicit end-of-stream frame; if the source fails
//! or another sink gives up, the queues close without that frame and every
//! remaining sink aborts, discarding its partial output.

use crate::hash::HashError;
use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// What a sink receives on its queue.
#[derive(Debug, Clone)]
pub enum Frame {
    Data(Bytes),
    End,
}

/// Failure inside a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Hash(#[from] HashError),

    /// The sink task panicked or was cancelled.
    #[error("sink task did not complete: {0}")]
    Join(String),
}

/// Failure while pumping the source.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("Failed to read source: {0}")]
    Read(#[from] io::Error),

    /// A sink dropped its queue, which only happens after it failed.
    #[error("A sink stopped accepting data")]
    SinkClosed,
}

/// Consumer of a multicast stream.
pub trait ChunkSink: Send + 'static {
    type Output: Send + 'static;

    /// Consumes the next chunk, in source order.
    fn accept(&mut self, chunk: &[u8]) -> Result<(), SinkError>;

    /// Called once after the last chunk. Cleans up its own output on error.
    fn finish(self) -> Result<Self::Output, SinkError>;

    /// Called instead of `finish` when the stream ended abnormally.
    fn abort(self);
}

/// Handle to a running sink.
pub struct SinkHandle<T> {
    join: JoinHandle<Result<Option<T>, SinkError>>,
}

impl<T> SinkHandle<T> {
    /// Waits for the sink.
    ///
    /// - `Ok(Some(output))` when it finished normally
    /// - `Ok(None)` when it aborted because the stream ended abnormally
    /// - `Err` when the sink itself failed
    pub async fn wait(self) -> Result<Option<T>, SinkError> {
        match self.join.await {
            Ok(result) => result,
            Err(join_err) => Err(SinkError::Join(join_err.to_string())),
        }
    }
}

/// One source, many sinks, synchronized backpressure.
pub struct Multicast {
    senders: Vec<mpsc::Sender<Frame>>,
    chunk_size: usize,
    capacity: usize,
}

impl Multicast {
    /// `chunk_size` bytes are read per step; each sink may queue up to `capacity` chunks.
    pub fn new(chunk_size: usize, capacity: usize) -> Self {
        Self {
            senders: Vec::new(),
            chunk_size: chunk_size.max(1),
            capacity: capacity.max(1),
        }
    }

    /// Starts `sink` as a task and connects it to this stream.
    pub fn attach<S: ChunkSink>(&mut self, sink: S) -> SinkHandle<S::Output> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.push(tx);
        SinkHandle {
            join: tokio::spawn(drain(sink, rx)),
        }
    }

    /// Reads `source` to the end, delivering every chunk to every sink.
    ///
    /// Returns the number of bytes read. On error the queues are dropped
    /// without an end frame, which makes every sink abort.
    pub async fn pump<R: AsyncRead + Unpin>(self, mut source: R) -> Result<u64, PumpError> {
        let Self {
            senders,
            chunk_size,
            ..
        } = self;

        let mut total = 0u64;
        let mut buf = BytesMut::with_capacity(chunk_size);
        loop {
            buf.reserve(chunk_size);
            let read = source.read_buf(&mut buf).await?;
            if read == 0 {
                break;
            }
            total += read as u64;

            let chunk = buf.split().freeze();
            for tx in &senders {
                tx.send(Frame::Data(chunk.clone()))
                    .await
                    .map_err(|_| PumpError::SinkClosed)?;
            }
        }

        for tx in &senders {
            tx.send(Frame::End)
                .await
                .map_err(|_| PumpError::SinkClosed)?;
        }

        Ok(total)
    }
}

/// Runs `f` on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, SinkError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|join_err| SinkError::Join(join_err.to_string()))
}

async fn abort_sink<S: ChunkSink>(sink: S) {
    if let Err(err) = blocking(move || sink.abort()).await {
        warn!(error = %err, "sink abort did not complete");
    }
}

async fn drain<S: ChunkSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<Frame>,
) -> Result<Option<S::Output>, SinkError> {
    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Data(chunk) => {
                let (returned, accepted) = blocking(move || {
                    let accepted = sink.accept(&chunk);
                    (sink, accepted)
                })
                .await?;
                sink = returned;
                if let Err(err) = accepted {
                    // Closing the queue first stops the pump at its next send
                    drop(rx);
                    abort_sink(sink).await;
                    return Err(err);
                }
            }
            Frame::End => return blocking(move || sink.finish()).await?.map(Some),
        }
    }
    abort_sink(sink).await;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Collects everything it receives.
    struct Collect {
        data: Vec<u8>,
        delay: Duration,
        aborted: Arc<AtomicBool>,
    }

    impl Collect {
        fn new(delay: Duration) -> (Self, Arc<AtomicBool>) {
            let aborted = Arc::new(AtomicBool::new(false));
            (
                Self {
                    data: Vec::new(),
                    delay,
                    aborted: aborted.clone(),
                },
                aborted,
            )
        }
    }

    impl ChunkSink for Collect {
        type Output = Vec<u8>;

        fn accept(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
            std::thread::sleep(self.delay);
            self.data.extend_from_slice(chunk);
            Ok(())
        }

        fn finish(self) -> Result<Vec<u8>, SinkError> {
            Ok(self.data)
        }

        fn abort(self) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    /// Fails on the n-th chunk.
    struct FailAt {
        remaining: usize,
    }

    impl ChunkSink for FailAt {
        type Output = ();

        fn accept(&mut self, _chunk: &[u8]) -> Result<(), SinkError> {
            if self.remaining == 0 {
                return Err(io::Error::other("sink broke").into());
            }
            self.remaining -= 1;
            Ok(())
        }

        fn finish(self) -> Result<(), SinkError> {
            Ok(())
        }

        fn abort(self) {}
    }

    /// Records how far ahead of this sink the source got.
    struct LagRecorder {
        read_so_far: Arc<AtomicUsize>,
        consumed: usize,
        max_lag: Arc<Mutex<usize>>,
    }

    impl ChunkSink for LagRecorder {
        type Output = ();

        fn accept(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
            std::thread::sleep(Duration::from_millis(2));
            self.consumed += chunk.len();
            let lag = self.read_so_far.load(Ordering::SeqCst) - self.consumed;
            let mut max = self.max_lag.lock().unwrap();
            *max = (*max).max(lag);
            Ok(())
        }

        fn finish(self) -> Result<(), SinkError> {
            Ok(())
        }

        fn abort(self) {}
    }

    /// Async reader that tracks how many bytes were handed out.
    struct TrackingReader {
        data: std::io::Cursor<Vec<u8>>,
        read_so_far: Arc<AtomicUsize>,
    }

    impl AsyncRead for TrackingReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            let before = buf.filled().len();
            let pos = self.data.position() as usize;
            let remaining = &self.data.get_ref()[pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.data.set_position((pos + n) as u64);
            self.read_so_far
                .fetch_add(buf.filled().len() - before, Ordering::SeqCst);
            std::task::Poll::Ready(Ok(()))
        }
    }

    /// Fails after the first read.
    struct BrokenReader {
        served: bool,
    }

    impl AsyncRead for BrokenReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            if self.served {
                return std::task::Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "source vanished",
                )));
            }
            self.served = true;
            buf.put_slice(b"partial");
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_every_sink_sees_every_byte_in_order() {
        let data = sample(100_000);
        let mut multicast = Multicast::new(1024, 2);
        let (fast, _) = Collect::new(Duration::ZERO);
        let (slow, _) = Collect::new(Duration::from_micros(200));
        let fast = multicast.attach(fast);
        let slow = multicast.attach(slow);

        let total = multicast.pump(&data[..]).await.unwrap();

        assert_eq!(total, data.len() as u64);
        assert_eq!(fast.wait().await.unwrap().unwrap(), data);
        assert_eq!(slow.wait().await.unwrap().unwrap(), data);
    }

    #[tokio::test]
    async fn test_empty_source_still_finishes_sinks() {
        let mut multicast = Multicast::new(64, 1);
        let (sink, aborted) = Collect::new(Duration::ZERO);
        let handle = multicast.attach(sink);

        assert_eq!(multicast.pump(&b""[..]).await.unwrap(), 0);
        assert_eq!(handle.wait().await.unwrap(), Some(Vec::new()));
        assert!(!aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_slow_sink_paces_the_source() {
        let chunk_size = 512;
        let capacity = 2;
        let read_so_far = Arc::new(AtomicUsize::new(0));
        let max_lag = Arc::new(Mutex::new(0));

        let mut multicast = Multicast::new(chunk_size, capacity);
        let recorder = multicast.attach(LagRecorder {
            read_so_far: read_so_far.clone(),
            consumed: 0,
            max_lag: max_lag.clone(),
        });
        let reader = TrackingReader {
            data: std::io::Cursor::new(sample(64 * chunk_size)),
            read_so_far,
        };

        multicast.pump(reader).await.unwrap();
        recorder.wait().await.unwrap().unwrap();

        // Queued chunks, the chunk in the sink's hands, and the one being sent.
        // BytesMut may round capacity up, so allow one extra chunk of slack.
        let bound = (capacity + 3) * chunk_size * 2;
        let lag = *max_lag.lock().unwrap();
        assert!(lag <= bound, "source ran {lag} bytes ahead, bound {bound}");
    }

    #[tokio::test]
    async fn test_failing_sink_aborts_siblings() {
        let data = sample(64 * 1024);
        let mut multicast = Multicast::new(1024, 1);
        let (sibling, aborted) = Collect::new(Duration::from_micros(100));
        let sibling = multicast.attach(sibling);
        let failing = multicast.attach(FailAt { remaining: 3 });

        let pumped = multicast.pump(&data[..]).await;

        assert!(matches!(pumped, Err(PumpError::SinkClosed)));
        assert!(matches!(failing.wait().await, Err(SinkError::Io(_))));
        assert_eq!(sibling.wait().await.unwrap(), None);
        assert!(aborted.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_read_failure_aborts_all_sinks() {
        let mut multicast = Multicast::new(64, 4);
        let (first, first_aborted) = Collect::new(Duration::ZERO);
        let (second, second_aborted) = Collect::new(Duration::ZERO);
        let first = multicast.attach(first);
        let second = multicast.attach(second);

        let pumped = multicast.pump(BrokenReader { served: false }).await;

        assert!(matches!(pumped, Err(PumpError::Read(_))));
        assert_eq!(first.wait().await.unwrap(), None);
        assert_eq!(second.wait().await.unwrap(), None);
        assert!(first_aborted.load(Ordering::SeqCst));
        assert!(second_aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_sinks_outnumbering_blocking_threads_complete() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let data = sample(4096);

        let outputs = runtime.block_on(async {
            let mut streams = tokio::task::JoinSet::new();
            for _ in 0..40 {
                let data = data.clone();
                streams.spawn(async move {
                    let mut multicast = Multicast::new(64, 1);
                    let handles: Vec<_> = (0..5)
                        .map(|_| multicast.attach(Collect::new(Duration::ZERO).0))
                        .collect();
                    multicast.pump(&data[..]).await.unwrap();
                    let mut outputs = Vec::new();
                    for handle in handles {
                        outputs.push(handle.wait().await.unwrap().unwrap());
                    }
                    outputs
                });
            }

            tokio::time::timeout(Duration::from_secs(60), async {
                let mut all = Vec::new();
                while let Some(joined) = streams.join_next().await {
                    all.extend(joined.unwrap());
                }
                all
            })
            .await
            .expect("streams stalled waiting for blocking threads")
        });

        assert_eq!(outputs.len(), 200);
        assert!(outputs.iter().all(|output| *output == data));
    }
}
