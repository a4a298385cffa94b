//! TCP transport
//!
//! Both ends send `HELLO{peer_id}` as their first frame, then every frame
//! read from the socket lands in the node's inbox. Authenticating the peer
//! (TLS, certificate pinning) is left to whatever wraps the socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use super::{NetworkError, PeerChannel, PeerRegistry};
use crate::model::PeerId;
use crate::protocol::{encode_frame, FrameDecoder, Inbound, PeerMessage};

const READ_BUF: usize = 64 * 1024;

pub struct TcpChannel {
    peer: PeerId,
    writer: Mutex<OwnedWriteHalf>,
    online: AtomicBool,
}

#[async_trait]
impl PeerChannel for TcpChannel {
    fn peer_id(&self) -> PeerId {
        self.peer
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &PeerMessage) -> Result<(), NetworkError> {
        if !self.is_online() {
            return Err(NetworkError::Offline(self.peer));
        }
        let frame = encode_frame(message)?;
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(&frame).await {
            self.online.store(false, Ordering::SeqCst);
            return Err(NetworkError::SendFailed(e.to_string()));
        }
        Ok(())
    }
}

pub struct TcpTransport {
    local_id: PeerId,
    registry: Arc<PeerRegistry>,
    inbox: mpsc::UnboundedSender<Inbound>,
}

impl TcpTransport {
    pub fn new(
        local_id: PeerId,
        registry: Arc<PeerRegistry>,
        inbox: mpsc::UnboundedSender<Inbound>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            registry,
            inbox,
        })
    }

    /// Bind and accept connections in the background.
    pub async fn listen(self: &Arc<Self>, address: &str) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| NetworkError::IoError(e.to_string()))?;
        let local = listener
            .local_addr()
            .map_err(|e| NetworkError::IoError(e.to_string()))?;
        log::info!("Listening for peers on {}", local);

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let transport = Arc::clone(&transport);
                        tokio::spawn(async move {
                            if let Err(e) = transport.attach(stream, None).await {
                                log::warn!("Rejected connection from {}: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("Accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        Ok(local)
    }

    /// Dial a peer and register the channel once it has identified itself.
    pub async fn connect(self: &Arc<Self>, peer: PeerId, address: &str) -> Result<(), NetworkError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| NetworkError::IoError(e.to_string()))?;
        self.attach(stream, Some(peer)).await
    }

    async fn attach(
        self: &Arc<Self>,
        stream: TcpStream,
        expected: Option<PeerId>,
    ) -> Result<(), NetworkError> {
        let (mut reader, mut writer) = stream.into_split();

        let hello = encode_frame(&PeerMessage::Hello {
            peer_id: self.local_id,
        })?;
        writer
            .write_all(&hello)
            .await
            .map_err(|e| NetworkError::IoError(e.to_string()))?;

        let mut decoder = FrameDecoder::new();
        let peer = match read_message(&mut reader, &mut decoder).await? {
            Some(PeerMessage::Hello { peer_id }) => peer_id,
            Some(other) => {
                return Err(NetworkError::Handshake(format!(
                    "expected HELLO, got {}",
                    other.kind()
                )))
            }
            None => return Err(NetworkError::Handshake("closed before HELLO".into())),
        };
        if let Some(expected) = expected {
            if expected != peer {
                return Err(NetworkError::Handshake(format!(
                    "dialed {} but {} answered",
                    expected, peer
                )));
            }
        }

        let channel = Arc::new(TcpChannel {
            peer,
            writer: Mutex::new(writer),
            online: AtomicBool::new(true),
        });
        self.registry.add(channel.clone()).await;
        log::info!("Connected to peer {}", peer);

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            transport.read_loop(reader, decoder, channel).await;
        });
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        mut decoder: FrameDecoder,
        channel: Arc<TcpChannel>,
    ) {
        let peer = channel.peer;
        loop {
            match read_message(&mut reader, &mut decoder).await {
                Ok(Some(message)) => {
                    if self.inbox.send(Inbound::new(peer, message)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Dropping connection to {}: {}", peer, e);
                    break;
                }
            }
        }
        channel.online.store(false, Ordering::SeqCst);
        let channel: Arc<dyn PeerChannel> = channel;
        self.registry.remove_if_current(&channel).await;
        log::info!("Peer {} disconnected", peer);
    }
}

/// Next message from the socket, `None` on a clean close.
async fn read_message(
    reader: &mut OwnedReadHalf,
    decoder: &mut FrameDecoder,
) -> Result<Option<PeerMessage>, NetworkError> {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        if let Some(message) = decoder.next_message()? {
            return Ok(Some(message));
        }
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| NetworkError::IoError(e.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        decoder.extend(&buf[..n]);
    }
}
