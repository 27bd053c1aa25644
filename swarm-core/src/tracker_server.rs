use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_util::codec::Framed;

use crate::{
    codec::{TrackerCodec, TrackerMessage},
    endpoint::PeerEndpoint,
    error::{ConnError, TrackerServerError},
    registry::TrackerRegistry,
};

/// The tracker role (spec §4.3): accepts connections and serves
/// `RegisterPeer`/`PeerList` against a shared [`TrackerRegistry`].
pub struct TrackerServer {
    registry: Arc<TrackerRegistry>,
}

impl TrackerServer {
    pub fn new(registry: Arc<TrackerRegistry>) -> Self {
        Self { registry }
    }

    /// Runs the accept loop until `shutdown` carries `true`. Each connection
    /// is handled on its own task; a bad or disconnecting peer never brings
    /// down the listener.
    #[tracing::instrument(skip(self, shutdown), fields(addr = %listen_addr))]
    pub async fn run(
        &self,
        listen_addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TrackerServerError> {
        let listener = TcpListener::bind(listen_addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "tracker listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer_addr, registry).await {
                            tracing::warn!(%peer_addr, error = %e, "tracker connection ended with an error");
                        }
                    });
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        tracing::info!("tracker server shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Serves one client connection until it closes or sends something we can't
/// parse. The peer's registered host is always the address we observed this
/// connection arrive from, never a value taken from the request body — a
/// peer cannot register somebody else's address (spec §4.3, invariant 2).
#[tracing::instrument(skip(stream, registry), fields(peer = %peer_addr))]
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<TrackerRegistry>,
) -> Result<(), ConnError> {
    let mut framed = Framed::new(stream, TrackerCodec);

    while let Some(msg) = framed.next().await {
        let response = match msg? {
            TrackerMessage::RegisterPeer { filename, data_port } => {
                let endpoint = PeerEndpoint::new(peer_addr.ip().to_string(), data_port);
                registry.add_peer(&filename, endpoint).await;
                TrackerMessage::Success
            }
            TrackerMessage::PeerList { filename } => {
                let peers = registry.peers_of(&filename).await;
                TrackerMessage::PeerListResp { peers }
            }
            other => TrackerMessage::TrackerError { reason: format!("unexpected request: {other:?}") },
        };
        framed.send(response).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn start_server() -> (SocketAddr, watch::Sender<bool>, Arc<TrackerRegistry>) {
        let registry = Arc::new(TrackerRegistry::new());
        let server = TrackerServer::new(Arc::clone(&registry));
        let (tx, rx) = watch::channel(false);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        tokio::spawn(async move {
            server.run(addr, rx).await.unwrap();
        });
        // Give the listener a moment to bind before the test connects.
        tokio::time::sleep(Duration::from_millis(20)).await;

        (addr, tx, registry)
    }

    #[tokio::test]
    async fn register_then_list_round_trip() {
        let (addr, _shutdown_tx, _registry) = start_server().await;

        let mut conn = crate::conn::PeerConnection::connect(addr, TrackerCodec, Duration::from_secs(5))
            .await
            .unwrap();

        let resp = conn
            .request(TrackerMessage::RegisterPeer { filename: b"movie.mkv".to_vec(), data_port: 7001 })
            .await
            .unwrap();
        assert_eq!(resp, TrackerMessage::Success);

        let resp = conn.request(TrackerMessage::PeerList { filename: b"movie.mkv".to_vec() }).await.unwrap();
        match resp {
            TrackerMessage::PeerListResp { peers } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].host, "127.0.0.1");
                assert_eq!(peers[0].data_port, 7001);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn registered_host_is_the_observed_connection_address() {
        let (addr, _shutdown_tx, registry) = start_server().await;

        let mut conn = crate::conn::PeerConnection::connect(addr, TrackerCodec, Duration::from_secs(5))
            .await
            .unwrap();
        conn.request(TrackerMessage::RegisterPeer { filename: b"f".to_vec(), data_port: 1 }).await.unwrap();

        let peers = registry.peers_of(b"f").await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].host, "127.0.0.1", "host must come from the socket, not from the request");
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_accept_loop() {
        let registry = Arc::new(TrackerRegistry::new());
        let server = TrackerServer::new(registry);
        let (tx, rx) = watch::channel(false);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handle = tokio::spawn(async move { server.run(addr, rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok(), "server task must exit promptly after shutdown signal");
        assert!(result.unwrap().unwrap().is_ok());
    }
}
