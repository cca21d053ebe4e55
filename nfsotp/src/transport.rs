//! Byte stream connection to an RPC server.
use crate::result::{Error, Result};
use bytes::Bytes;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// A connection to `peer`.  Generic over the stream so the RPC layers can
/// run over anything that reads and writes bytes; `TcpStream` is what
/// [`Transport::open`] produces.
///
/// No retries happen at this level, every failure is returned as is.
pub struct Transport<S> {
    stream: S,
    peer: String,
}

impl Transport<TcpStream> {
    /// Connects to `host:port`
    pub async fn open(host: &str, port: u16) -> Result<Self> {
        let addr = if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| Error::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        debug!(peer = %addr, "connected");

        Ok(Transport { stream, peer: addr })
    }
}

impl<S> Transport<S> {
    /// Wraps an already established stream
    pub fn from_stream(stream: S, peer: impl Into<String>) -> Self {
        Transport {
            stream,
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl<S: AsyncRead + AsyncWrite> Transport<S> {
    /// Splits the connection so reads and writes can proceed from
    /// different tasks.
    pub fn split(self) -> (Transport<ReadHalf<S>>, Transport<WriteHalf<S>>) {
        let (read, write) = io::split(self.stream);
        (
            Transport {
                stream: read,
                peer: self.peer.clone(),
            },
            Transport {
                stream: write,
                peer: self.peer,
            },
        )
    }
}

impl<S: AsyncWrite + Unpin> Transport<S> {
    /// Writes all of `bytes`, a partial write is an error
    pub async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shuts down the write direction.  The peer sees end of stream.
    pub async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        debug!(peer = %self.peer, "closed");
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> Transport<S> {
    /// Reads whatever is available, at most `max_bytes`.  End of stream
    /// is reported as `UnexpectedEof`.
    pub async fn receive(&mut self, max_bytes: usize) -> Result<Bytes> {
        let mut buf = vec![0; max_bytes];
        let read = self.stream.read(&mut buf).await?;
        if read == 0 && max_bytes > 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        buf.truncate(read);
        Ok(Bytes::from(buf))
    }

    /// Fills `buf` completely, across as many reads as needed
    pub async fn receive_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_receive() {
        let (a, b) = io::duplex(64);
        let mut client = Transport::from_stream(a, "client");
        let mut server = Transport::from_stream(b, "server");

        client.send(b"hello").await.unwrap();
        let got = server.receive(64).await.unwrap();
        assert_eq!(got.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_receive_after_close_is_eof() {
        let (a, b) = io::duplex(64);
        let mut client = Transport::from_stream(a, "client");
        let mut server = Transport::from_stream(b, "server");

        client.close().await.unwrap();
        match server.receive(16).await {
            Err(Error::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {:?}", other.map(|b| b.len())),
        }
    }

    #[tokio::test]
    async fn test_open_refused() {
        // Bind then drop to get a port that is very likely closed
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let res = Transport::open("127.0.0.1", port).await;
        assert!(matches!(res, Err(Error::Connect { .. })));
    }
}
