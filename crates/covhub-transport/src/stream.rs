//! Byte stream over a message socket
//!
//! The socket pump owns a [`MessagePipe`]: it pushes every inbound text or
//! binary message into `inbound` and sends everything read from `outbound`
//! as one message. The [`MessageStream`] half is handed to the RPC layer.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

/// Socket side of a [`MessageStream`]
#[derive(Debug)]
pub struct MessagePipe {
    /// Messages received from the peer
    pub inbound: mpsc::Sender<Bytes>,
    /// Messages to send to the peer
    pub outbound: mpsc::Receiver<Bytes>,
}

/// `AsyncRead + AsyncWrite` adapter over message channels
///
/// Reads return EOF once the pipe's `inbound` sender is dropped. Writes fail
/// with `BrokenPipe` once the pipe's `outbound` receiver is dropped.
#[derive(Debug)]
pub struct MessageStream {
    inbound: mpsc::Receiver<Bytes>,
    outbound: PollSender<Bytes>,
    /// Unread remainder of the current inbound message
    pending: Bytes,
}

impl MessageStream {
    /// Create a connected stream and pipe, each channel holding `capacity` messages
    pub fn pair(capacity: usize) -> (MessageStream, MessagePipe) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

        let stream = MessageStream {
            inbound: inbound_rx,
            outbound: PollSender::new(outbound_tx),
            pending: Bytes::new(),
        };
        let pipe = MessagePipe {
            inbound: inbound_tx,
            outbound: outbound_rx,
        };
        (stream, pipe)
    }
}

impl AsyncRead for MessageStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        while this.pending.is_empty() {
            match ready!(this.inbound.poll_recv(cx)) {
                Some(message) => this.pending = message,
                // EOF
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MessageStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        ready!(this.outbound.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        this.outbound
            .send_item(Bytes::copy_from_slice(buf))
            .map_err(|_| broken_pipe())?;

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().outbound.close();
        Poll::Ready(Ok(()))
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "message socket closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_each_write_is_one_message() {
        let (mut stream, mut pipe) = MessageStream::pair(8);

        stream.write_all(b"first\n").await.unwrap();
        stream.write_all(b"second\n").await.unwrap();

        assert_eq!(pipe.outbound.recv().await.unwrap(), Bytes::from("first\n"));
        assert_eq!(pipe.outbound.recv().await.unwrap(), Bytes::from("second\n"));
    }

    #[tokio::test]
    async fn test_reads_span_messages_until_eof() {
        let (mut stream, pipe) = MessageStream::pair(8);

        pipe.inbound.send(Bytes::from("hello ")).await.unwrap();
        pipe.inbound.send(Bytes::new()).await.unwrap();
        pipe.inbound.send(Bytes::from("world")).await.unwrap();
        drop(pipe);

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_small_reads_keep_remainder() {
        let (mut stream, pipe) = MessageStream::pair(8);
        pipe.inbound.send(Bytes::from("abcdef")).await.unwrap();

        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn test_write_after_socket_gone() {
        let (mut stream, pipe) = MessageStream::pair(8);
        drop(pipe);

        let err = stream.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
