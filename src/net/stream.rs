use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};

const CHUNK: usize = 8 * 1024;

/// A connection in any of its transport states. STARTTLS and
/// COMPRESS=DEFLATE rebuild the enum in place, so the session code is
/// generic over one concrete type.
pub enum ImapStream {
    Plain(TcpStream),
    Tls(tokio_rustls::server::TlsStream<TcpStream>),
    Unix(UnixStream),
    Deflate(DeflateStream),
    #[cfg(test)]
    Duplex(tokio::io::DuplexStream),
}

impl ImapStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, ImapStream::Tls(_))
    }

    /// Wrap the current transport in a DEFLATE stream pair.
    pub fn into_deflate(self) -> ImapStream {
        ImapStream::Deflate(DeflateStream::new(Box::new(self)))
    }
}

impl AsyncRead for ImapStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            ImapStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ImapStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
            ImapStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            ImapStream::Deflate(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(test)]
            ImapStream::Duplex(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            ImapStream::Plain(s) => Pin::new(s).poll_write(cx, data),
            ImapStream::Tls(s) => Pin::new(s).poll_write(cx, data),
            ImapStream::Unix(s) => Pin::new(s).poll_write(cx, data),
            ImapStream::Deflate(s) => Pin::new(s).poll_write(cx, data),
            #[cfg(test)]
            ImapStream::Duplex(s) => Pin::new(s).poll_write(cx, data),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            ImapStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ImapStream::Tls(s) => Pin::new(s).poll_flush(cx),
            ImapStream::Unix(s) => Pin::new(s).poll_flush(cx),
            ImapStream::Deflate(s) => Pin::new(s).poll_flush(cx),
            #[cfg(test)]
            ImapStream::Duplex(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            ImapStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ImapStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
            ImapStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            ImapStream::Deflate(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(test)]
            ImapStream::Duplex(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Raw-deflate duplex wrapper (RFC 4978). Reads inflate, writes
/// compress; each flush ends with a sync point so interactive responses
/// reach the peer immediately.
pub struct DeflateStream {
    inner: Box<ImapStream>,
    inflate: Decompress,
    deflate: Compress,
    /// Compressed bytes read from the transport, not yet inflated.
    raw_in: Vec<u8>,
    raw_in_pos: usize,
    /// Compressed bytes produced, not yet written to the transport.
    raw_out: Vec<u8>,
    raw_out_pos: usize,
}

impl DeflateStream {
    pub fn new(inner: Box<ImapStream>) -> Self {
        Self {
            inner,
            // Raw streams, no zlib header, per COMPRESS=DEFLATE.
            inflate: Decompress::new(false),
            deflate: Compress::new(Compression::default(), false),
            raw_in: Vec::new(),
            raw_in_pos: 0,
            raw_out: Vec::new(),
            raw_out_pos: 0,
        }
    }

    fn drain_raw_out(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.raw_out_pos < self.raw_out.len() {
            let n = ready!(
                Pin::new(&mut *self.inner).poll_write(cx, &self.raw_out[self.raw_out_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.raw_out_pos += n;
        }
        self.raw_out.clear();
        self.raw_out_pos = 0;
        Poll::Ready(Ok(()))
    }

    fn compress_into_pending(&mut self, data: &[u8], flush: FlushCompress) -> io::Result<usize> {
        let start_in = self.deflate.total_in();
        let mut consumed = 0;
        loop {
            self.raw_out.reserve(CHUNK);
            self.deflate
                .compress_vec(&data[consumed..], &mut self.raw_out, flush)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            consumed = (self.deflate.total_in() - start_in) as usize;
            let done = consumed == data.len()
                && (flush == FlushCompress::None
                    || self.raw_out.capacity() > self.raw_out.len());
            if done {
                return Ok(consumed);
            }
        }
    }
}

impl AsyncRead for DeflateStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.raw_in_pos < this.raw_in.len() {
                let before_in = this.inflate.total_in();
                let before_out = this.inflate.total_out();
                let status = this
                    .inflate
                    .decompress(
                        &this.raw_in[this.raw_in_pos..],
                        buf.initialize_unfilled(),
                        FlushDecompress::None,
                    )
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                this.raw_in_pos += (this.inflate.total_in() - before_in) as usize;
                let produced = (this.inflate.total_out() - before_out) as usize;
                if produced > 0 {
                    buf.advance(produced);
                    return Poll::Ready(Ok(()));
                }
                if status == flate2::Status::StreamEnd {
                    return Poll::Ready(Ok(()));
                }
            }

            this.raw_in.clear();
            this.raw_in_pos = 0;
            let mut tmp = [0u8; CHUNK];
            let mut tmp_buf = ReadBuf::new(&mut tmp);
            ready!(Pin::new(&mut *this.inner).poll_read(cx, &mut tmp_buf))?;
            if tmp_buf.filled().is_empty() {
                // Transport EOF
                return Poll::Ready(Ok(()));
            }
            this.raw_in.extend_from_slice(tmp_buf.filled());
        }
    }
}

impl AsyncWrite for DeflateStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let consumed = this.compress_into_pending(data, FlushCompress::None)?;
        // Push what we can without blocking the caller.
        let _ = this.drain_raw_out(cx)?;
        Poll::Ready(Ok(consumed))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.compress_into_pending(&[], FlushCompress::Sync)?;
        ready!(this.drain_raw_out(cx))?;
        Pin::new(&mut *this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}
