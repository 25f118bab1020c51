//! Client side of the rendezvous relay.
//!
//! A `RelayChannel` is a claimed endpoint name; bridging it to the partner
//! turns it into a `RelayConnection`. Every wait is timeout-bounded, and
//! abandoning a wait (dropping the future) tears the socket down with it —
//! nothing fires into a discarded state machine.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::protocol::{read_frame, write_frame, RelayFrame, PROTOCOL_VERSION};
use crate::room::SessionIdentity;
use crate::tunnel::TunnelLink;
use crate::PairingError;

/// Bound for reaching the relay and claiming an endpoint.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Creator-side bound for a peer to arrive.
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(120);

/// Joiner-side bound for reaching the named remote endpoint.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// A registered endpoint on the relay, not yet bridged to a peer.
pub struct RelayChannel {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    local: SessionIdentity,
}

impl RelayChannel {
    /// Connect to the relay and claim our session endpoint.
    ///
    /// Fails with `RelayUnavailable` if the whole setup does not finish
    /// within `setup_timeout`.
    pub async fn initialize(
        relay_addr: &str,
        local: &SessionIdentity,
        setup_timeout: Duration,
    ) -> Result<Self, PairingError> {
        let setup = async {
            let stream = TcpStream::connect(relay_addr)
                .await
                .map_err(|e| PairingError::RelayUnavailable(e.to_string()))?;
            let (mut reader, mut writer) = stream.into_split();

            write_frame(
                &mut writer,
                &RelayFrame::Register {
                    version: PROTOCOL_VERSION,
                    endpoint: local.endpoint().to_string(),
                },
            )
            .await
            .map_err(|e| PairingError::RelayUnavailable(e.to_string()))?;

            match read_frame(&mut reader)
                .await
                .map_err(|e| PairingError::RelayUnavailable(e.to_string()))?
            {
                RelayFrame::Registered => {
                    tracing::debug!(endpoint = %local.endpoint(), "relay endpoint claimed");
                    Ok(Self {
                        reader,
                        writer,
                        local: local.clone(),
                    })
                }
                RelayFrame::Error { reason } => Err(PairingError::RelayUnavailable(reason)),
                other => Err(PairingError::RelayUnavailable(format!(
                    "unexpected {} during setup",
                    other.frame_type()
                ))),
            }
        };

        match timeout(setup_timeout, setup).await {
            Ok(result) => result,
            Err(_) => Err(PairingError::RelayUnavailable(
                "relay setup timed out".to_string(),
            )),
        }
    }

    /// Creator side: wait for the joiner to dial our endpoint.
    ///
    /// Consumes the channel either way; on timeout the socket (and with it
    /// the relay registration) is released.
    pub async fn listen_for_peer(self, wait: Duration) -> Result<RelayConnection, PairingError> {
        tracing::info!(endpoint = %self.local.endpoint(), "listening for partner");
        match timeout(wait, self.await_peer()).await {
            Ok(result) => result,
            Err(_) => Err(PairingError::ConnectionTimeout),
        }
    }

    /// Joiner side: dial the creator's endpoint and wait for the bridge.
    pub async fn connect_to_peer(
        mut self,
        remote: &SessionIdentity,
        wait: Duration,
    ) -> Result<RelayConnection, PairingError> {
        write_frame(
            &mut self.writer,
            &RelayFrame::Dial {
                endpoint: remote.endpoint().to_string(),
            },
        )
        .await
        .map_err(|_| PairingError::ConnectionClosed)?;
        tracing::info!(remote = %remote.endpoint(), "dialing partner");

        match timeout(wait, self.await_peer()).await {
            Ok(result) => result,
            Err(_) => Err(PairingError::ConnectionTimeout),
        }
    }

    async fn await_peer(mut self) -> Result<RelayConnection, PairingError> {
        loop {
            match read_frame(&mut self.reader).await {
                Ok(RelayFrame::PeerJoined { endpoint }) => {
                    tracing::info!(remote = %endpoint, "partner bridged");
                    return Ok(RelayConnection {
                        reader: self.reader,
                        writer: self.writer,
                        remote_endpoint: endpoint,
                        open: true,
                    });
                }
                Ok(RelayFrame::Error { reason }) => {
                    return Err(PairingError::RelayUnavailable(reason))
                }
                Ok(RelayFrame::PeerLeft | RelayFrame::Close) => {
                    return Err(PairingError::ConnectionClosed)
                }
                Ok(other) => {
                    tracing::debug!("ignoring {} while waiting for peer", other.frame_type());
                }
                Err(_) => return Err(PairingError::ConnectionClosed),
            }
        }
    }
}

/// A bridged peer-to-peer message channel through the relay.
pub struct RelayConnection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    remote_endpoint: String,
    open: bool,
}

impl RelayConnection {
    /// The remote end's endpoint name.
    pub fn remote_endpoint(&self) -> &str {
        &self.remote_endpoint
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Send one payload to the peer.
    ///
    /// Dropped silently when the connection is not open — not queued, not an
    /// error. Callers that need delivery wait for open state before calling.
    pub async fn send(&mut self, payload: &[u8]) {
        if !self.open {
            tracing::debug!("send on closed connection dropped");
            return;
        }
        let frame = RelayFrame::Forward {
            data: payload.to_vec(),
        };
        if let Err(e) = write_frame(&mut self.writer, &frame).await {
            tracing::warn!("send failed, marking connection closed: {}", e);
            self.open = false;
        }
    }

    /// Wait for the next payload from the peer.
    ///
    /// One waiter at a time by construction (`&mut self`). Fails with
    /// `MessageTimeout` when `wait` elapses first.
    pub async fn receive_once(&mut self, wait: Duration) -> Result<Vec<u8>, PairingError> {
        if !self.open {
            return Err(PairingError::ConnectionClosed);
        }
        let result = timeout(wait, self.next_payload()).await;
        match result {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => {
                self.open = false;
                Err(e)
            }
            Err(_) => Err(PairingError::MessageTimeout),
        }
    }

    async fn next_payload(&mut self) -> Result<Vec<u8>, PairingError> {
        loop {
            match read_frame(&mut self.reader).await {
                Ok(RelayFrame::Forward { data }) => return Ok(data),
                Ok(RelayFrame::PeerLeft | RelayFrame::Close) => {
                    return Err(PairingError::ConnectionClosed)
                }
                Ok(RelayFrame::Error { reason }) => {
                    return Err(PairingError::RelayUnavailable(reason))
                }
                Ok(other) => {
                    tracing::debug!("ignoring {} on open connection", other.frame_type());
                }
                Err(_) => return Err(PairingError::ConnectionClosed),
            }
        }
    }

    /// Close the connection and release the relay registration. Idempotent.
    pub async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let _ = write_frame(&mut self.writer, &RelayFrame::Close).await;
        let _ = self.writer.shutdown().await;
        tracing::debug!(remote = %self.remote_endpoint, "connection closed");
    }
}

#[async_trait]
impl TunnelLink for RelayConnection {
    async fn send(&mut self, payload: &[u8]) {
        RelayConnection::send(self, payload).await;
    }

    async fn receive_once(&mut self, wait: Duration) -> Result<Vec<u8>, PairingError> {
        RelayConnection::receive_once(self, wait).await
    }

    async fn close(&mut self) {
        RelayConnection::close(self).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================
