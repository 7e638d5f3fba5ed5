//! Connection driver: the reader and writer halves of one transport stream.

use crate::link::Link;
use crate::session::{Batch, Session};
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::FrameDecoder;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on buffers handed to one vectored write.
const MAX_IOVECS: usize = 64;

/// How long a closing side waits for the peer to hang up.
const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// How a connection ended.
#[derive(Debug)]
pub enum ConnectionOutcome {
    /// The peer closed the stream.
    PeerClosed,
    /// A read or write failed.
    Failed(io::Error),
    /// This side closed the session and flushed its queue.
    Closed,
    /// The connection was dropped on request (abort or transfer).
    Halted,
}

impl ConnectionOutcome {
    /// Whether the loss was unplanned, making the session eligible for recovery.
    pub fn is_instant(&self) -> bool {
        !matches!(self, ConnectionOutcome::Closed)
    }
}

impl fmt::Display for ConnectionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionOutcome::PeerClosed => write!(f, "closed by peer"),
            ConnectionOutcome::Failed(e) => write!(f, "I/O error: {}", e),
            ConnectionOutcome::Closed => write!(f, "closed"),
            ConnectionOutcome::Halted => write!(f, "halted"),
        }
    }
}

enum WriteEnd {
    Finished,
    Stopped,
}

/// Runs a session's connection until it ends.
pub(crate) async fn drive<S>(link: &Arc<Link>, session: &Arc<Session>, stream: S) -> ConnectionOutcome
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let read = read_loop(link, session, reader);
    let write = write_loop(link, session, writer);
    tokio::pin!(read, write);

    tokio::select! {
        outcome = &mut read => outcome,
        end = &mut write => match end {
            Ok(WriteEnd::Finished) => {
                tokio::select! {
                    _ = &mut read => {}
                    _ = session.halted() => {}
                    _ = tokio::time::sleep(CLOSE_LINGER) => {}
                }
                ConnectionOutcome::Closed
            }
            Ok(WriteEnd::Stopped) => ConnectionOutcome::Halted,
            Err(e) => ConnectionOutcome::Failed(e),
        },
        _ = session.halted() => ConnectionOutcome::Halted,
    }
}

async fn read_loop<R>(link: &Link, session: &Arc<Session>, mut reader: R) -> ConnectionOutcome
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::with_max_payload(link.config().max_payload_size);
    let chunk = link.config().read_buffer_size;

    loop {
        let n = match reader.read_buf(decoder.read_region(chunk)).await {
            Ok(0) => return ConnectionOutcome::PeerClosed,
            Ok(n) => n,
            Err(e) => return ConnectionOutcome::Failed(e),
        };
        session
            .counters()
            .bytes_received
            .fetch_add(n as u64, Ordering::Relaxed);
        if let Some(metrics) = link.metrics() {
            metrics.bytes_received_total.inc_by(n as f64);
        }

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => link.handle_frame(session, frame),
                Ok(None) => break,
                Err(e) => link.skip_message(session, &e),
            }
        }
    }
}

async fn write_loop<W>(link: &Link, session: &Session, mut writer: W) -> io::Result<WriteEnd>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match session.next_batch(link.encoder()) {
            Batch::Write { chunks, events } => {
                let bytes = write_chunks(&mut writer, chunks).await?;
                session.record_batch(bytes, events);
                if let Some(metrics) = link.metrics() {
                    metrics.bytes_sent_total.inc_by(bytes as f64);
                    if events > 0 {
                        metrics.events_sent_total.inc_by(events as f64);
                        metrics.batch_events.observe(events as f64);
                    }
                }
                tracing::trace!("[{}] Wrote {} bytes ({} events)", session.handle(), bytes, events);
            }
            Batch::Idle => session.woken().await,
            Batch::Finish => {
                writer.shutdown().await?;
                return Ok(WriteEnd::Finished);
            }
            Batch::Stop => return Ok(WriteEnd::Stopped),
        }
    }
}

/// Writes every chunk in order, resuming after partial writes.
async fn write_chunks<W>(writer: &mut W, chunks: Vec<Bytes>) -> io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let total = chunks.iter().map(Bytes::len).sum();
    let mut queue: VecDeque<Bytes> = chunks.into_iter().filter(|c| !c.is_empty()).collect();

    while !queue.is_empty() {
        let written = {
            let slices: Vec<IoSlice<'_>> = queue
                .iter()
                .take(MAX_IOVECS)
                .map(|c| IoSlice::new(c))
                .collect();
            writer.write_vectored(&slices).await?
        };
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        advance(&mut queue, written);
    }

    writer.flush().await?;
    Ok(total)
}

fn advance(queue: &mut VecDeque<Bytes>, mut n: usize) {
    while n > 0 {
        let Some(front) = queue.front_mut() else {
            break;
        };
        if n >= front.len() {
            n -= front.len();
            queue.pop_front();
        } else {
            front.advance(n);
            n = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Accepts at most three bytes per write call.
    #[derive(Default)]
    struct Trickle {
        written: Vec<u8>,
        calls: usize,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(3);
            self.written.extend_from_slice(&buf[..n]);
            self.calls += 1;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_partial_writes_resume_in_order() {
        let mut writer = Trickle::default();
        let chunks = vec![
            Bytes::from_static(b"hello"),
            Bytes::new(),
            Bytes::from_static(b", "),
            Bytes::from_static(b"world"),
        ];
        let total = write_chunks(&mut writer, chunks).await.unwrap();
        assert_eq!(total, 12);
        assert_eq!(writer.written, b"hello, world");
        assert!(writer.calls >= 4);
    }

    #[test]
    fn test_advance_across_chunks() {
        let mut queue: VecDeque<Bytes> = vec![
            Bytes::from_static(b"ab"),
            Bytes::from_static(b"cde"),
            Bytes::from_static(b"f"),
        ]
        .into();
        advance(&mut queue, 3);
        assert_eq!(queue.len(), 2);
        assert_eq!(&queue[0][..], b"de");
        advance(&mut queue, 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_outcome_classification() {
        assert!(ConnectionOutcome::PeerClosed.is_instant());
        assert!(ConnectionOutcome::Halted.is_instant());
        assert!(ConnectionOutcome::Failed(io::ErrorKind::BrokenPipe.into()).is_instant());
        assert!(!ConnectionOutcome::Closed.is_instant());
    }
}
