//! Join Protocol
//!
//! Establishes a bus link with a peer. The dialing side sends `Hello`
//! with its identity and waits for `Welcome`; the accepting side matches
//! the hello against its membership (or appends the peer) and answers.
//! Either side may dial first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_message, write_message, Message};
use crate::cluster::{ClusterState, InboundMatch, LocalIdentity, BUS_PORT_OFFSET};
use crate::error::{Error, Result};

/// Established bus channel to a peer, owned by its membership entry
#[derive(Debug)]
pub struct PeerLink {
    remote_name: String,
    remote_address: String,
    remote_client_port: u16,
    stream: TcpStream,
    established_at: chrono::DateTime<chrono::Utc>,
}

impl PeerLink {
    pub fn new(
        remote_name: impl Into<String>,
        remote_address: impl Into<String>,
        remote_client_port: u16,
        stream: TcpStream,
    ) -> Self {
        Self {
            remote_name: remote_name.into(),
            remote_address: remote_address.into(),
            remote_client_port,
            stream,
            established_at: chrono::Utc::now(),
        }
    }

    /// Name the peer announced in the handshake
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// Client address the peer announced
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Client port the peer announced
    pub fn remote_client_port(&self) -> u16 {
        self.remote_client_port
    }

    /// True if the peer announced the given member key
    pub fn announces(&self, address: &str, client_port: u16) -> bool {
        self.remote_address == address && self.remote_client_port == client_port
    }

    /// Socket address of the peer, if still connected
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    pub fn established_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.established_at
    }
}

/// Opens transport connections to peers' bus ports
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `address:port`
    async fn dial(&self, address: &str, port: u16) -> Result<TcpStream>;
}

/// Plain TCP dialer with a connect timeout
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str, port: u16) -> Result<TcpStream> {
        let target = format!("{}:{}", address, port);
        let result = timeout(
            self.connect_timeout,
            TcpStream::connect((address, port)),
        ).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: target,
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(target)),
        }
    }
}

/// Outbound side of the join protocol
#[derive(Clone)]
pub struct Joiner {
    dialer: Arc<dyn Dialer>,
    local: LocalIdentity,
    handshake_timeout: Duration,
}

impl Joiner {
    pub fn new(dialer: Arc<dyn Dialer>, local: LocalIdentity, handshake_timeout: Duration) -> Self {
        Self {
            dialer,
            local,
            handshake_timeout,
        }
    }

    /// Join the peer serving clients on `address:client_port`.
    ///
    /// Dials the peer's bus port and performs the handshake. Nothing is
    /// recorded on failure; on success the caller owns the returned link.
    pub async fn join(&self, address: &str, client_port: u16) -> Result<PeerLink> {
        let bus_port = client_port.checked_add(BUS_PORT_OFFSET).ok_or_else(|| {
            Error::Config(format!("client port {} has no bus port", client_port))
        })?;
        let target = format!("{}:{}", address, bus_port);

        let mut stream = self.dialer.dial(address, bus_port).await?;

        let hello = Message::Hello {
            name: self.local.name.clone(),
            address: self.local.address.clone(),
            client_port: self.local.client_port,
        };

        let reply = timeout(self.handshake_timeout, async {
            write_message(&mut stream, &hello).await?;
            read_message(&mut stream).await
        })
        .await
        .map_err(|_| Error::ConnectionTimeout(target.clone()))??;

        match reply {
            Message::Welcome { name, address: remote_address, client_port: remote_port } => {
                let link = PeerLink::new(name, remote_address, remote_port, stream);
                if !link.announces(address, client_port) {
                    // Its own hello will be keyed differently and counted twice
                    tracing::warn!(
                        "Peer listed as {}:{} identifies as {}:{} ({}); use the same address in every peers file",
                        address,
                        client_port,
                        link.remote_address(),
                        link.remote_client_port(),
                        link.remote_name()
                    );
                }
                Ok(link)
            }
            Message::Reject { reason } => Err(Error::Handshake {
                address: target,
                reason,
            }),
            other => Err(Error::Handshake {
                address: target,
                reason: format!("unexpected {} reply", other.type_name()),
            }),
        }
    }
}

/// Inbound side of the join protocol.
///
/// Reads the peer's hello, answers with our identity and hands the link to
/// the membership, either marking a configured peer reachable or adding a
/// new one.
pub async fn accept_join(
    state: &ClusterState,
    mut stream: TcpStream,
    handshake_timeout: Duration,
) -> Result<InboundMatch> {
    let remote = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let hello = timeout(handshake_timeout, read_message(&mut stream))
        .await
        .map_err(|_| Error::ConnectionTimeout(remote.clone()))??;

    let kind = hello.type_name();
    let Message::Hello { name, address, client_port } = hello else {
        return Err(Error::Handshake {
            address: remote,
            reason: format!("expected Hello, got {}", kind),
        });
    };

    let local = state.local();
    if local.address == address && local.client_port == client_port {
        let reason = format!("{}:{} is this node", address, client_port);
        write_message(&mut stream, &Message::Reject { reason: reason.clone() }).await?;
        return Err(Error::Handshake { address: remote, reason });
    }

    let welcome = Message::Welcome {
        name: local.name.clone(),
        address: local.address.clone(),
        client_port: local.client_port,
    };
    timeout(handshake_timeout, write_message(&mut stream, &welcome))
        .await
        .map_err(|_| Error::ConnectionTimeout(remote.clone()))??;

    let link = PeerLink::new(name.clone(), address.clone(), client_port, stream);
    let matched = state.accept_inbound(&name, &address, client_port, link).await?;

    match matched {
        InboundMatch::Known(_) => {
            tracing::debug!("Peer {} ({}:{}) joined from {}", name, address, client_port, remote)
        }
        InboundMatch::Added(_) => {
            tracing::info!("Added unlisted peer {} ({}:{}) from {}", name, address, client_port, remote)
        }
    }

    Ok(matched)
}
