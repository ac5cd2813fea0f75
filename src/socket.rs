use std::future::Future;
use std::io::{Error, ErrorKind};
use std::ops::Deref;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Sleep;
use tokio_rustls::client::TlsStream;

/// An origin connection with per-operation read and write deadlines.
///
/// A deadline is armed when an operation first has to wait and is cleared as soon as it
/// makes progress, so it bounds stalls rather than total transfer time.
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  read_deadline: Option<Pin<Box<Sleep>>>,
  write_deadline: Option<Pin<Box<Sleep>>>,
}

impl Socket {
  pub(crate) fn new(
    maybe_tls_stream: MaybeTlsStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
  ) -> Self {
    Self {
      inner: maybe_tls_stream,
      read_timeout,
      write_timeout,
      read_deadline: None,
      write_deadline: None,
    }
  }
  pub(crate) async fn tls<F, Fut>(self, func: F) -> Result<Self, Error>
  where
    F: FnOnce(TcpStream) -> Fut,
    Fut: Future<Output = Result<TlsStream<TcpStream>, Error>>,
  {
    let inner = match self.inner {
      MaybeTlsStream::Tcp(t) => MaybeTlsStream::Tls(Box::new(func(t).await?)),
      MaybeTlsStream::Tls(t) => MaybeTlsStream::Tls(t),
    };
    Ok(Self::new(inner, self.read_timeout, self.write_timeout))
  }
}

/// Plain TCP or client-side TLS.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS
  Tls(Box<TlsStream<TcpStream>>),
}

fn poll_deadline(
  deadline: &mut Option<Pin<Box<Sleep>>>,
  timeout: Option<Duration>,
  cx: &mut Context<'_>,
  what: &str,
) -> Poll<std::io::Result<()>> {
  let Some(timeout) = timeout else {
    return Poll::Pending;
  };
  let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
  match sleep.as_mut().poll(cx) {
    Poll::Ready(()) => {
      *deadline = None;
      Poll::Ready(Err(Error::new(ErrorKind::TimedOut, format!("{} timed out", what))))
    }
    Poll::Pending => Poll::Pending,
  }
}

impl AsyncRead for Socket {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_read(cx, buf) {
      Poll::Ready(result) => {
        this.read_deadline = None;
        Poll::Ready(result)
      }
      Poll::Pending => poll_deadline(&mut this.read_deadline, this.read_timeout, cx, "read"),
    }
  }
}

impl AsyncWrite for Socket {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_write(cx, buf) {
      Poll::Ready(result) => {
        this.write_deadline = None;
        Poll::Ready(result)
      }
      Poll::Pending => poll_deadline(&mut this.write_deadline, this.write_timeout, cx, "write")
        .map(|r| r.map(|_| 0)),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    let this = self.get_mut();
    match Pin::new(&mut this.inner).poll_flush(cx) {
      Poll::Ready(result) => {
        this.write_deadline = None;
        Poll::Ready(result)
      }
      Poll::Pending => poll_deadline(&mut this.write_deadline, this.write_timeout, cx, "flush"),
    }
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}

// peer_addr, local_addr and friends of the underlying TCP stream
impl Deref for MaybeTlsStream {
  type Target = TcpStream;

  fn deref(&self) -> &Self::Target {
    match self {
      MaybeTlsStream::Tcp(s) => s,
      MaybeTlsStream::Tls(t) => t.get_ref().0,
    }
  }
}

impl Deref for Socket {
  type Target = MaybeTlsStream;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn stalled_read_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
      let (stream, _) = listener.accept().await.unwrap();
      tokio::time::sleep(Duration::from_millis(500)).await;
      drop(stream);
    });
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut socket = Socket::new(
      MaybeTlsStream::Tcp(stream),
      Some(Duration::from_millis(50)),
      None,
    );
    let mut buf = [0u8; 8];
    let err = socket.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    server.await.unwrap();
  }
}
