//! Per-sink write serialization.
//!
//! Each sink is owned by a dedicated writer task fed through an unbounded
//! queue. [`WriteSerializer::enqueue`] places the write in the queue when it
//! is called, not when the returned [`WriteTicket`] is first polled, so
//! writes issued back to back complete in call order even if nobody awaits
//! in between. Only one write is ever in flight per sink.
//!
//! ```text
//! send A ─┐
//! send B ─┼─► queue ─► writer task ─► sink
//! send C ─┘
//! ```
//!
//! A failed write does not stop the task: later writes are still attempted
//! and every caller observes the result of its own write.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::framing::{ChannelKind, FrameError};
use crate::transport::DatagramChannel;

/// Errors surfaced to the caller of a single write.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The sink has been released (session closed or never opened).
    #[error("sink closed")]
    SinkClosed,

    /// The sink rejected the write.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame could not be encoded; nothing was queued.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Destination for whole encoded frames.
pub trait FrameSink: Send + 'static {
    /// Write one frame in full.
    fn write_frame(&mut self, frame: &[u8]) -> impl Future<Output = std::io::Result<()>> + Send;
}

/// Adapts the write half of a byte stream.
pub struct StreamSink<W>(pub W);

impl<W> FrameSink for StreamSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.0.write_all(frame).await?;
        self.0.flush().await
    }
}

/// Adapts a shared datagram channel. One frame is one datagram.
pub struct DatagramSink<D>(pub Arc<D>);

impl<D: DatagramChannel> FrameSink for DatagramSink<D> {
    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.0.send(frame).await
    }
}

struct WriteRequest {
    frame: Vec<u8>,
    done: oneshot::Sender<Result<(), WriteError>>,
}

/// Ordered write queue in front of one sink.
pub struct WriteSerializer {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl WriteSerializer {
    /// Spawn the writer task for `sink`. Must be called within a tokio runtime.
    ///
    /// The task exits, releasing the sink, once the serializer is dropped and
    /// the queue has drained.
    pub fn spawn<S: FrameSink>(sink: S, channel: ChannelKind) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, rx, channel));
        Self { tx }
    }

    /// Queue `frame` behind every write already queued on this sink.
    pub fn enqueue(&self, frame: Vec<u8>) -> WriteTicket {
        let (done, rx) = oneshot::channel();
        match self.tx.send(WriteRequest { frame, done }) {
            Ok(()) => WriteTicket::queued(rx),
            Err(_) => WriteTicket::rejected(WriteError::SinkClosed),
        }
    }
}

async fn write_loop<S: FrameSink>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<WriteRequest>,
    channel: ChannelKind,
) {
    while let Some(request) = rx.recv().await {
        let result = sink
            .write_frame(&request.frame)
            .await
            .map_err(WriteError::from);
        if let Err(error) = &result {
            tracing::warn!(%channel, %error, "write failed");
        }
        // The caller may have stopped waiting.
        let _ = request.done.send(result);
    }
    tracing::trace!(%channel, "writer task finished");
}

/// Completion of one queued write.
#[must_use = "a write ticket reports the write's outcome only when awaited"]
pub struct WriteTicket {
    state: TicketState,
}

enum TicketState {
    Queued(oneshot::Receiver<Result<(), WriteError>>),
    Rejected(Option<WriteError>),
}

impl WriteTicket {
    fn queued(rx: oneshot::Receiver<Result<(), WriteError>>) -> Self {
        Self {
            state: TicketState::Queued(rx),
        }
    }

    pub(crate) fn rejected(error: WriteError) -> Self {
        Self {
            state: TicketState::Rejected(Some(error)),
        }
    }
}

impl Future for WriteTicket {
    type Output = Result<(), WriteError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            // A dropped sender means the writer task went away with our write.
            TicketState::Queued(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.unwrap_or(Err(WriteError::SinkClosed))),
            TicketState::Rejected(error) => {
                Poll::Ready(Err(error.take().unwrap_or(WriteError::SinkClosed)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{StreamReassembler, encode_stream_frame};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, duplex};

    /// Records every byte with a yield in between, so interleaving would show.
    struct TrickleSink {
        bytes: Arc<Mutex<Vec<(usize, u8)>>>,
        writes: usize,
    }

    impl FrameSink for TrickleSink {
        async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
            let write = self.writes;
            self.writes += 1;
            for b in frame {
                self.bytes.lock().unwrap().push((write, *b));
                tokio::task::yield_now().await;
            }
            Ok(())
        }
    }

    /// Fails the writes whose index is listed.
    struct FlakySink {
        fail: Vec<usize>,
        writes: usize,
        accepted: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl FrameSink for FlakySink {
        async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
            let index = self.writes;
            self.writes += 1;
            if self.fail.contains(&index) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "sink broken",
                ));
            }
            self.accepted.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_writes_complete_in_call_order() {
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let serializer = WriteSerializer::spawn(
            TrickleSink {
                bytes: Arc::clone(&bytes),
                writes: 0,
            },
            ChannelKind::Reliable,
        );

        let a = serializer.enqueue(b"AAAA".to_vec());
        let b = serializer.enqueue(b"BBBB".to_vec());
        let c = serializer.enqueue(b"CCCC".to_vec());
        // Await out of order; the sink order must not change.
        c.await.unwrap();
        a.await.unwrap();
        b.await.unwrap();

        let observed: Vec<u8> = bytes.lock().unwrap().iter().map(|(_, b)| *b).collect();
        assert_eq!(observed, b"AAAABBBBCCCC");
        let writes: Vec<usize> = bytes.lock().unwrap().iter().map(|(w, _)| *w).collect();
        assert!(writes.windows(2).all(|w| w[0] <= w[1]), "writes interleaved");
    }

    #[tokio::test]
    async fn test_failure_reported_to_its_caller_only() {
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let serializer = WriteSerializer::spawn(
            FlakySink {
                fail: vec![1],
                writes: 0,
                accepted: Arc::clone(&accepted),
            },
            ChannelKind::Unreliable,
        );

        let first = serializer.enqueue(vec![1]);
        let second = serializer.enqueue(vec![2]);
        let third = serializer.enqueue(vec![3]);

        assert!(first.await.is_ok());
        assert!(matches!(second.await, Err(WriteError::Io(_))));
        assert!(third.await.is_ok());
        assert_eq!(*accepted.lock().unwrap(), vec![vec![1], vec![3]]);
    }

    #[tokio::test]
    async fn test_broken_sink_fails_every_queued_write() {
        let serializer = WriteSerializer::spawn(
            FlakySink {
                fail: (0..10).collect(),
                writes: 0,
                accepted: Arc::new(Mutex::new(Vec::new())),
            },
            ChannelKind::Reliable,
        );

        let tickets: Vec<WriteTicket> = (0..5).map(|i| serializer.enqueue(vec![i])).collect();
        for ticket in tickets {
            assert!(matches!(ticket.await, Err(WriteError::Io(_))));
        }
    }

    #[tokio::test]
    async fn test_stream_sink_frames_arrive_whole_and_ordered() {
        let (client, mut server) = duplex(8);
        let serializer = WriteSerializer::spawn(StreamSink(client), ChannelKind::Reliable);

        let tickets = [
            serializer.enqueue(encode_stream_frame(1, b"first message").unwrap()),
            serializer.enqueue(encode_stream_frame(2, b"second").unwrap()),
            serializer.enqueue(encode_stream_frame(3, b"third and last").unwrap()),
        ];

        let reader = tokio::spawn(async move {
            let mut reassembler = StreamReassembler::default();
            let mut frames = Vec::new();
            let mut buf = [0u8; 5];
            while frames.len() < 3 {
                let n = server.read(&mut buf).await.unwrap();
                frames.extend(reassembler.push(&buf[..n]).unwrap());
            }
            frames
        });

        for ticket in tickets {
            ticket.await.unwrap();
        }
        let frames = reader.await.unwrap();
        let opcodes: Vec<u16> = frames.iter().map(|f| f.opcode).collect();
        assert_eq!(opcodes, vec![1, 2, 3]);
        assert_eq!(frames[1].payload, b"second");
    }

    #[tokio::test]
    async fn test_closed_stream_rejects_write() {
        let (client, server) = duplex(64);
        drop(server);
        let serializer = WriteSerializer::spawn(StreamSink(client), ChannelKind::Reliable);
        let result = serializer.enqueue(encode_stream_frame(1, b"x").unwrap()).await;
        assert!(matches!(result, Err(WriteError::Io(_))));
    }

    #[tokio::test]
    async fn test_rejected_ticket_reports_sink_closed() {
        let ticket = WriteTicket::rejected(WriteError::SinkClosed);
        assert!(matches!(ticket.await, Err(WriteError::SinkClosed)));
    }
}
