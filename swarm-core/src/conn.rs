use std::{net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::ConnError;

/// Connects with a deadline; a hung peer or tracker must not stall a worker
/// forever (spec §4.4/§7).
pub async fn connect_timeout(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, ConnError> {
    Ok(tokio::time::timeout(timeout, TcpStream::connect(addr)).await??)
}

/// A framed, request/response connection to either a tracker or a remote
/// peer's seeder. `C` is `TrackerCodec` or `PeerCodec`; both speak the same
/// length-prefixed tagged-union framing, so this wrapper is generic over the
/// wire vocabulary rather than duplicated per role.
///
/// Strictly alternating request/response, one in flight at a time — neither
/// role in this protocol pipelines requests, so there's no need to split the
/// sink and stream halves the way a full-duplex session would.
pub struct PeerConnection<C> {
    framed: Framed<TcpStream, C>,
    timeout: Duration,
}

impl<C> PeerConnection<C> {
    pub fn new(stream: TcpStream, codec: C, timeout: Duration) -> Self {
        Self { framed: Framed::new(stream, codec), timeout }
    }

    pub async fn connect(addr: SocketAddr, codec: C, timeout: Duration) -> Result<Self, ConnError> {
        let stream = connect_timeout(addr, timeout).await?;
        Ok(Self::new(stream, codec, timeout))
    }
}

impl<C> PeerConnection<C>
where
    C: Decoder<Error = ConnError>,
{
    pub async fn send<M>(&mut self, msg: M) -> Result<(), ConnError>
    where
        C: Encoder<M, Error = ConnError>,
    {
        tokio::time::timeout(self.timeout, self.framed.send(msg)).await??;
        Ok(())
    }

    /// Waits for the next frame, or `ConnError::Io` (unexpected EOF) if the
    /// remote closes the connection first.
    pub async fn receive(&mut self) -> Result<C::Item, ConnError> {
        match tokio::time::timeout(self.timeout, self.framed.next()).await? {
            Some(item) => item,
            None => Err(ConnError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before a response arrived",
            ))),
        }
    }

    /// Sends `msg` and waits for the single response it provokes.
    pub async fn request<M>(&mut self, msg: M) -> Result<C::Item, ConnError>
    where
        C: Encoder<M, Error = ConnError>,
    {
        self.send(msg).await?;
        self.receive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PeerCodec, PeerMessage};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn request_round_trips_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = PeerConnection::new(stream, PeerCodec, Duration::from_secs(5));
            let req = conn.receive().await.unwrap();
            match req {
                PeerMessage::MetadataRequest { filename } => {
                    assert_eq!(filename, b"movie.mkv");
                    conn.send(PeerMessage::MetadataResp { file_size: 1024, block_size: 16384 }).await.unwrap();
                }
                other => panic!("unexpected request: {other:?}"),
            }
        });

        let mut client = PeerConnection::connect(addr, PeerCodec, Duration::from_secs(5)).await.unwrap();
        let resp = client
            .request(PeerMessage::MetadataRequest { filename: b"movie.mkv".to_vec() })
            .await
            .unwrap();
        assert_eq!(resp, PeerMessage::MetadataResp { file_size: 1024, block_size: 16384 });

        server.await.unwrap();
    }

    #[tokio::test]
    async fn receive_after_remote_closes_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            // Drop immediately without writing anything.
        });

        let mut client = PeerConnection::connect(addr, PeerCodec, Duration::from_secs(5)).await.unwrap();
        let err = client.receive().await.unwrap_err();
        assert!(matches!(err, ConnError::Io(_)));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = PeerConnection::connect(addr, PeerCodec, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ConnError::Io(_)));
    }
}
