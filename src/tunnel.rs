// Copy loop forked from tokio's copy.rs and copy_bidirectional.rs.
//
// Changes:
// - Caller-provided buffers (so they can come from a pool)
// - Read and write whenever there's space, circular buffer
// - The tunnel ends as soon as either direction finishes
// - External cancellation, and closed-connection errors are not surfaced

use futures::ready;
use tokio::io::{AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::async_stream::AsyncStream;

#[derive(Debug)]
struct CopyBuffer<'a> {
    read_done: bool,
    need_flush: bool,
    start_index: usize,
    cache_length: usize,
    size: usize,
    buf: &'a mut [u8],
}

impl<'a> CopyBuffer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        let size = buf.len();
        Self {
            read_done: false,
            need_flush: false,
            start_index: 0,
            cache_length: 0,
            size,
            buf,
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncStream + ?Sized,
        W: AsyncStream + ?Sized,
    {
        loop {
            let mut read_pending = false;
            let mut write_pending = false;

            // Read as much as possible before writing, so that streams which
            // packetize individual poll_write calls see fewer, larger writes.
            while !self.read_done && self.cache_length < self.size {
                let unused_start_index = (self.start_index + self.cache_length) % self.size;
                let unused_end_index_exclusive = if unused_start_index < self.start_index {
                    self.start_index
                } else {
                    self.size
                };

                let me = &mut *self;
                let mut buf =
                    ReadBuf::new(&mut me.buf[unused_start_index..unused_end_index_exclusive]);
                match reader.as_mut().poll_read(cx, &mut buf) {
                    Poll::Ready(val) => {
                        val?;
                        let n = buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cache_length += n;
                        }
                    }
                    Poll::Pending => {
                        read_pending = true;
                        break;
                    }
                }
            }

            // If our buffer has some data, write out as much as possible to
            // minimize forwarding latency and to increase the chance that the
            // next read starts at index zero.
            while self.cache_length > 0 {
                let used_start_index = self.start_index;
                let used_end_index_exclusive =
                    std::cmp::min(self.start_index + self.cache_length, self.size);

                let me = &mut *self;
                match writer
                    .as_mut()
                    .poll_write(cx, &me.buf[used_start_index..used_end_index_exclusive])
                {
                    Poll::Ready(val) => {
                        let written = val?;
                        if written == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "write zero byte into writer",
                            )));
                        } else {
                            self.cache_length -= written;
                            if self.cache_length == 0 {
                                self.start_index = 0;
                            } else {
                                self.start_index = (self.start_index + written) % self.size;
                            }
                            self.need_flush = true;
                        }
                    }
                    Poll::Pending => {
                        write_pending = true;
                        break;
                    }
                }
            }

            if self.need_flush {
                ready!(writer.as_mut().poll_flush(cx))?;
                self.need_flush = false;
            }

            // All the data has been written and we've seen EOF: this
            // direction is done.
            if self.read_done && self.cache_length == 0 {
                return Poll::Ready(Ok(()));
            }

            // Returning as soon as either side is pending (rather than
            // looping until both are) avoids starving other tasks.
            if read_pending || write_pending {
                return Poll::Pending;
            }
        }
    }
}

enum TransferState {
    Running,
    ShuttingDown,
    Done,
}

fn transfer_one_direction<A, B>(
    cx: &mut Context<'_>,
    state: &mut TransferState,
    buf: &mut CopyBuffer<'_>,
    r: &mut A,
    w: &mut B,
) -> Poll<io::Result<()>>
where
    A: AsyncStream + ?Sized,
    B: AsyncStream + ?Sized,
{
    let mut r = Pin::new(r);
    let mut w = Pin::new(w);

    loop {
        match state {
            TransferState::Running => {
                ready!(buf.poll_copy(cx, r.as_mut(), w.as_mut()))?;
                *state = TransferState::ShuttingDown;
            }
            TransferState::ShuttingDown => {
                ready!(w.as_mut().poll_shutdown(cx))?;
                *state = TransferState::Done;
            }
            TransferState::Done => return Poll::Ready(Ok(())),
        }
    }
}

struct CopyBidirectional<'a, A: ?Sized, B: ?Sized> {
    a: &'a mut A,
    b: &'a mut B,
    a_buf: CopyBuffer<'a>,
    b_buf: CopyBuffer<'a>,
    a_to_b: TransferState,
    b_to_a: TransferState,
}

impl<A, B> Future for CopyBidirectional<'_, A, B>
where
    A: AsyncStream + ?Sized,
    B: AsyncStream + ?Sized,
{
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Unpack self into mut refs to each field to avoid borrow check issues.
        let CopyBidirectional {
            a,
            b,
            a_buf,
            b_buf,
            a_to_b,
            b_to_a,
        } = &mut *self;

        let a_to_b = transfer_one_direction(cx, a_to_b, &mut *a_buf, &mut *a, &mut *b);
        let b_to_a = transfer_one_direction(cx, b_to_a, &mut *b_buf, &mut *b, &mut *a);

        // Either direction finishing (EOF or error) ends the tunnel; the
        // caller then tears down both streams.
        if a_to_b.is_ready() {
            return a_to_b;
        } else if b_to_a.is_ready() {
            return b_to_a;
        }

        Poll::Pending
    }
}

/// True for the errors produced by tearing down a connection we (or the
/// tunnel peer) already closed. These are expected during teardown and are
/// not surfaced.
pub fn is_closed_conn_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionAborted
    )
}

fn first_tunnel_error(errors: [Option<io::Error>; 3]) -> io::Result<()> {
    for err in errors.into_iter().flatten() {
        if !is_closed_conn_error(&err) {
            return Err(err);
        }
    }
    Ok(())
}

/// Forward bytes between `a` and `b` in both directions until either
/// direction finishes (EOF or error) or `cancel` fires.
///
/// Both streams are shut down before returning, on every path. The result
/// is the first error observed across the copy and the two shutdowns that
/// is not a closed-connection error; cancellation is not an error.
pub async fn tunnel<A, B>(
    a: &mut A,
    b: &mut B,
    a_to_b_buf: &mut [u8],
    b_to_a_buf: &mut [u8],
    cancel: &CancellationToken,
) -> io::Result<()>
where
    A: AsyncStream + ?Sized,
    B: AsyncStream + ?Sized,
{
    let copy_result = {
        let copy_future = CopyBidirectional {
            a: &mut *a,
            b: &mut *b,
            a_buf: CopyBuffer::new(a_to_b_buf),
            b_buf: CopyBuffer::new(b_to_a_buf),
            a_to_b: TransferState::Running,
            b_to_a: TransferState::Running,
        };

        tokio::select! {
            result = copy_future => result,
            _ = cancel.cancelled() => Ok(()),
        }
    };

    let (a_shutdown, b_shutdown) = futures::join!(a.shutdown(), b.shutdown());

    first_tunnel_error([copy_result.err(), a_shutdown.err(), b_shutdown.err()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    #[tokio::test]
    async fn test_tunnel_copies_both_directions() {
        let (mut left_peer, left) = tokio::io::duplex(1024);
        let (mut right_peer, right) = tokio::io::duplex(1024);

        let tunnel_task = tokio::spawn(async move {
            let mut left = left;
            let mut right = right;
            let mut buf1 = vec![0u8; 64];
            let mut buf2 = vec![0u8; 64];
            tunnel(
                &mut left,
                &mut right,
                &mut buf1,
                &mut buf2,
                &CancellationToken::new(),
            )
            .await
        });

        left_peer.write_all(b"to the right").await.unwrap();
        let mut buf = [0u8; 12];
        right_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to the right");

        right_peer.write_all(b"to the left!").await.unwrap();
        left_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"to the left!");

        // EOF on one side ends the tunnel and closes the other.
        drop(left_peer);
        tunnel_task.await.unwrap().unwrap();

        let n = right_peer.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_tunnel_cancellation_is_not_an_error() {
        let (_left_peer, left) = tokio::io::duplex(64);
        let (_right_peer, right) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        let tunnel_task = tokio::spawn(async move {
            let mut left = left;
            let mut right = right;
            let mut buf1 = vec![0u8; 64];
            let mut buf2 = vec![0u8; 64];
            tunnel(&mut left, &mut right, &mut buf1, &mut buf2, &token).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), tunnel_task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    /// A stream that reads EOF immediately and fails shutdown with a
    /// closed-connection error.
    struct ClosedOnShutdown;

    impl AsyncRead for ClosedOnShutdown {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for ClosedOnShutdown {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "use of closed connection",
            )))
        }
    }

    #[tokio::test]
    async fn test_closed_conn_errors_collapse_to_ok() {
        let (_peer, other) = tokio::io::duplex(64);
        let mut a = ClosedOnShutdown;
        let mut other = other;
        let mut buf1 = vec![0u8; 64];
        let mut buf2 = vec![0u8; 64];

        let result = tunnel(
            &mut a,
            &mut other,
            &mut buf1,
            &mut buf2,
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_first_tunnel_error_picks_first_real_error() {
        let closed = io::Error::new(io::ErrorKind::NotConnected, "closed");
        let real = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        let result = first_tunnel_error([Some(closed), Some(real), None]);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);

        assert!(first_tunnel_error([None, None, None]).is_ok());
    }
}
