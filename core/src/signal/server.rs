//! Rendezvous relay — bridges a dialer to a registered listener by endpoint
//! name and shuttles opaque frames between them.
//!
//! The relay sees endpoint names and sealed bytes, nothing else. Run it
//! standalone, or spawn it in-process for tests the way the integration
//! suite does.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::protocol::{read_frame, write_frame, RelayFrame, PROTOCOL_VERSION};

/// Messages between the per-connection tasks of a bridged pair.
enum BridgeMsg {
    /// You are now bridged to `endpoint`; reach it through `tx`.
    Link {
        endpoint: String,
        tx: mpsc::Sender<BridgeMsg>,
    },
    /// Payload from the bridged peer.
    Forward(Vec<u8>),
    /// The bridged peer disconnected.
    Gone,
}

#[derive(Default)]
struct Registry {
    /// endpoint name -> (connection id, handle to that connection's task)
    endpoints: HashMap<String, (u64, mpsc::Sender<BridgeMsg>)>,
    /// Dials parked until the named endpoint registers:
    /// target endpoint -> [(connection id, dialer endpoint, handle)]
    parked: HashMap<String, Vec<(u64, String, mpsc::Sender<BridgeMsg>)>>,
    next_id: u64,
}

impl Registry {
    fn register(&mut self, endpoint: &str, tx: mpsc::Sender<BridgeMsg>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        // A duplicate registration replaces the stale entry so a crashed
        // client can retry without waiting for relay cleanup.
        self.endpoints.insert(endpoint.to_string(), (id, tx));
        id
    }

    fn unregister(&mut self, endpoint: &str, conn_id: u64) {
        if let Some((id, _)) = self.endpoints.get(endpoint) {
            if *id == conn_id {
                self.endpoints.remove(endpoint);
            }
        }
        for waiters in self.parked.values_mut() {
            waiters.retain(|(id, _, _)| *id != conn_id);
        }
        self.parked.retain(|_, waiters| !waiters.is_empty());
    }

    fn lookup(&self, endpoint: &str) -> Option<mpsc::Sender<BridgeMsg>> {
        self.endpoints.get(endpoint).map(|(_, tx)| tx.clone())
    }

    fn park(&mut self, target: &str, conn_id: u64, endpoint: &str, tx: mpsc::Sender<BridgeMsg>) {
        self.parked
            .entry(target.to_string())
            .or_default()
            .push((conn_id, endpoint.to_string(), tx));
    }

    fn take_parked(&mut self, endpoint: &str) -> Option<(String, mpsc::Sender<BridgeMsg>)> {
        let waiters = self.parked.get_mut(endpoint)?;
        let (_, dialer_endpoint, tx) = waiters.remove(0);
        if waiters.is_empty() {
            self.parked.remove(endpoint);
        }
        Some((dialer_endpoint, tx))
    }
}

/// The rendezvous relay server.
pub struct RendezvousServer {
    listener: TcpListener,
    registry: Arc<Mutex<Registry>>,
}

impl RendezvousServer {
    /// Bind the listener. Use port 0 to let the OS pick (tests do).
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry: Arc::new(Mutex::new(Registry::default())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Runs until the listener itself errors.
    pub async fn run(self) -> io::Result<()> {
        tracing::info!(addr = %self.listener.local_addr()?, "rendezvous relay listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let registry = Arc::clone(&self.registry);
            tracing::debug!(%peer, "relay client connected");
            tokio::spawn(async move {
                if let Err(e) = handle_client(stream, registry).await {
                    tracing::debug!("relay client ended: {}", e);
                }
            });
        }
    }
}

async fn handle_client(stream: TcpStream, registry: Arc<Mutex<Registry>>) -> io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<BridgeMsg>(32);

    // First frame must claim an endpoint.
    let endpoint = match read_frame(&mut reader).await? {
        RelayFrame::Register { version, endpoint } if version == PROTOCOL_VERSION => endpoint,
        RelayFrame::Register { version, .. } => {
            let reason = format!("unsupported protocol version {version}");
            write_frame(&mut writer, &RelayFrame::Error { reason }).await?;
            return Ok(());
        }
        other => {
            let reason = format!("expected register, got {}", other.frame_type());
            write_frame(&mut writer, &RelayFrame::Error { reason }).await?;
            return Ok(());
        }
    };

    let (conn_id, waiting_dialer) = {
        let mut reg = registry.lock();
        let conn_id = reg.register(&endpoint, tx.clone());
        (conn_id, reg.take_parked(&endpoint))
    };

    // Inbound frames arrive through a dedicated reader task so the select
    // in serve_bridged never cancels a read mid-frame.
    let (frame_tx, frames) = mpsc::channel::<RelayFrame>(32);
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => {
                    if frame_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // From here on the endpoint is registered, so every exit — clean close,
    // peer loss, or a write error — must pass through the cleanup below.
    let mut peer: Option<mpsc::Sender<BridgeMsg>> = None;
    let result = serve_bridged(
        &mut writer,
        frames,
        &mut rx,
        waiting_dialer,
        &registry,
        conn_id,
        &endpoint,
        &tx,
        &mut peer,
    )
    .await;

    registry.lock().unregister(&endpoint, conn_id);
    if let Some(peer_tx) = peer.take() {
        let _ = peer_tx.send(BridgeMsg::Gone).await;
    }
    reader_task.abort();
    tracing::debug!(endpoint = %endpoint, "relay client closed");
    result
}

#[allow(clippy::too_many_arguments)]
async fn serve_bridged(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    mut frames: mpsc::Receiver<RelayFrame>,
    rx: &mut mpsc::Receiver<BridgeMsg>,
    waiting_dialer: Option<(String, mpsc::Sender<BridgeMsg>)>,
    registry: &Arc<Mutex<Registry>>,
    conn_id: u64,
    endpoint: &str,
    tx: &mpsc::Sender<BridgeMsg>,
    peer: &mut Option<mpsc::Sender<BridgeMsg>>,
) -> io::Result<()> {
    write_frame(writer, &RelayFrame::Registered).await?;
    tracing::debug!(endpoint = %endpoint, "endpoint registered");

    // A dialer may already be parked on this name.
    if let Some((dialer_endpoint, dialer_tx)) = waiting_dialer {
        let _ = dialer_tx
            .send(BridgeMsg::Link {
                endpoint: endpoint.to_string(),
                tx: tx.clone(),
            })
            .await;
        write_frame(
            writer,
            &RelayFrame::PeerJoined {
                endpoint: dialer_endpoint,
            },
        )
        .await?;
        *peer = Some(dialer_tx);
    }

    loop {
        tokio::select! {
            frame = frames.recv() => {
                // The reader task ended: the client hung up.
                let Some(frame) = frame else { return Ok(()) };
                match frame {
                    RelayFrame::Dial { endpoint: target } => {
                        let found = registry.lock().lookup(&target);
                        match found {
                            Some(peer_tx) => {
                                let _ = peer_tx
                                    .send(BridgeMsg::Link { endpoint: endpoint.to_string(), tx: tx.clone() })
                                    .await;
                                write_frame(writer, &RelayFrame::PeerJoined { endpoint: target }).await?;
                                *peer = Some(peer_tx);
                            }
                            None => {
                                tracing::debug!(target = %target, "dial parked until target registers");
                                registry.lock().park(&target, conn_id, endpoint, tx.clone());
                            }
                        }
                    }
                    RelayFrame::Forward { data } => {
                        match &*peer {
                            Some(peer_tx) => { let _ = peer_tx.send(BridgeMsg::Forward(data)).await; }
                            None => tracing::debug!(endpoint = %endpoint, "dropping forward with no bridged peer"),
                        }
                    }
                    RelayFrame::Close => return Ok(()),
                    other => {
                        let reason = format!("unexpected {}", other.frame_type());
                        write_frame(writer, &RelayFrame::Error { reason }).await?;
                    }
                }
            }
            msg = rx.recv() => {
                match msg {
                    Some(BridgeMsg::Link { endpoint: remote, tx: peer_tx }) => {
                        *peer = Some(peer_tx);
                        write_frame(writer, &RelayFrame::PeerJoined { endpoint: remote }).await?;
                    }
                    Some(BridgeMsg::Forward(data)) => {
                        write_frame(writer, &RelayFrame::Forward { data }).await?;
                    }
                    Some(BridgeMsg::Gone) => {
                        *peer = None;
                        write_frame(writer, &RelayFrame::PeerLeft).await?;
                    }
                    // Unreachable while the caller holds `tx`.
                    None => return Ok(()),
                }
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
