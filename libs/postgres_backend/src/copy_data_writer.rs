//! Wraps an `AsyncWrite` so every call into it becomes one tagged
//! `CopyData` message on the wire, rather than raw bytes. `ArchiveWriter`
//! (C1) and the WAL streamer (C4) both write into a plain `AsyncWrite`
//! sink; this is what turns that into the copy-out/copy-both channel a
//! real connection exposes, without either of those modules needing to
//! know about message framing.
//!
//! Treats a logical write as atomic: `poll_write` only reports a buffer
//! as accepted once the whole tag+length+payload frame has reached the
//! inner writer, buffering partial progress across `Pending` results.

use bytes::BytesMut;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

pin_project! {
    pub struct CopyDataWriter<W> {
        #[pin]
        inner: W,
        pending: BytesMut,
        written: usize,
    }
}

impl<W: AsyncWrite + Unpin> CopyDataWriter<W> {
    pub fn new(inner: W) -> Self {
        CopyDataWriter {
            inner,
            pending: BytesMut::new(),
            written: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite> AsyncWrite for CopyDataWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            let mut this = self.as_mut().project();

            if this.pending.is_empty() {
                this.pending.extend_from_slice(&[b'd']);
                this.pending
                    .extend_from_slice(&((buf.len() + 4) as i32).to_be_bytes());
                this.pending.extend_from_slice(buf);
                *this.written = 0;
            }

            let remaining_start = *this.written;
            match this
                .inner
                .as_mut()
                .poll_write(cx, &this.pending[remaining_start..])
            {
                Poll::Ready(Ok(n)) => {
                    *this.written += n;
                    if *this.written >= this.pending.len() {
                        this.pending.clear();
                        *this.written = 0;
                        return Poll::Ready(Ok(buf.len()));
                    }
                    // Partial write of the frame; loop and push more.
                    continue;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn wraps_each_write_in_a_copy_data_message() {
        let mut w = CopyDataWriter::new(Vec::new());
        w.write_all(b"hello").await.unwrap();
        w.write_all(b"world").await.unwrap();
        let out = w.into_inner();

        assert_eq!(out[0], b'd');
        let len1 = i32::from_be_bytes(out[1..5].try_into().unwrap()) as usize;
        assert_eq!(len1, 4 + 5);
        assert_eq!(&out[5..10], b"hello");
        assert_eq!(out[10], b'd');
        let len2 = i32::from_be_bytes(out[11..15].try_into().unwrap()) as usize;
        assert_eq!(len2, 4 + 5);
        assert_eq!(&out[15..20], b"world");
    }
}
