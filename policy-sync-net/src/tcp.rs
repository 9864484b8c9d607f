//! TCP transport
//!
//! Frames are read by a per-channel reader task into a bounded buffer so that
//! non-blocking receives never touch the socket. Writes are bounded by
//! [`WRITE_TIMEOUT`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;

use crate::protocol::{encode_frame, frame_len, Envelope, FRAME_HEADER_BYTES};
use crate::traits::{ChannelListener, Connector, Endpoint, HeartbeatChannel, RecvMode};
use crate::{ChannelError, Result};

/// Upper bound on a single frame write
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUFFER_FRAMES: usize = 64;

/// Read one frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    let mut header = [0u8; FRAME_HEADER_BYTES];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = frame_len(header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Envelope::deserialize(&body).map(Some)
}

/// Channel over one TCP connection
#[derive(Debug)]
pub struct TcpChannel {
    endpoint: Endpoint,
    writer: OwnedWriteHalf,
    inbound: mpsc::Receiver<Result<Envelope>>,
    reader: JoinHandle<()>,
}

impl TcpChannel {
    /// Wrap a connected stream
    pub fn new(stream: TcpStream, endpoint: Endpoint) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%endpoint, error = %e, "could not disable nagle");
        }
        let (mut read_half, writer) = stream.into_split();
        let (tx, inbound) = mpsc::channel(READ_BUFFER_FRAMES);
        let peer = endpoint.clone();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(Some(env)) => {
                        if tx.send(Ok(env)).await.is_err() {
                            tracing::debug!(endpoint = %peer, "channel dropped, reader exiting");
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(endpoint = %peer, "tcp channel closed by peer");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(endpoint = %peer, error = %e, "tcp channel read failed");
                        if tx.send(Err(e)).await.is_err() {
                            tracing::debug!(endpoint = %peer, "receiver gone before read error was delivered");
                        }
                        break;
                    }
                }
            }
        });
        Self {
            endpoint,
            writer,
            inbound,
            reader,
        }
    }

    fn closed(&self) -> ChannelError {
        ChannelError::Closed(self.endpoint.to_string())
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl HeartbeatChannel for TcpChannel {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        let frame = encode_frame(envelope)?;
        let write = async {
            self.writer.write_all(&frame).await?;
            self.writer.flush().await
        };
        match tokio::time::timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ChannelError::unreachable(
                self.endpoint.as_str(),
                e.to_string(),
            )),
            Err(_) => Err(ChannelError::unreachable(
                self.endpoint.as_str(),
                "write timed out",
            )),
        }
    }

    async fn recv(&mut self, mode: RecvMode) -> Result<Option<Envelope>> {
        let next = match mode {
            RecvMode::NonBlocking => match self.inbound.try_recv() {
                Ok(item) => Some(item),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => None,
            },
            RecvMode::Timeout(wait) => match tokio::time::timeout(wait, self.inbound.recv()).await
            {
                Ok(item) => item,
                Err(_) => return Ok(None),
            },
        };
        match next {
            Some(item) => item.map(Some),
            None => Err(self.closed()),
        }
    }
}

/// Opens TCP channels with a connect timeout
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn HeartbeatChannel>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(endpoint.as_str()))
            .await
            .map_err(|_| ChannelError::unreachable(endpoint.as_str(), "connect timed out"))?
            .map_err(|e| ChannelError::unreachable(endpoint.as_str(), e.to_string()))?;
        tracing::debug!(%endpoint, "tcp channel connected");
        Ok(Box::new(TcpChannel::new(stream, endpoint.clone())))
    }
}

/// Accepts TCP channels on a bound socket
#[derive(Debug)]
pub struct TcpChannelListener {
    listener: TcpListener,
    local: Endpoint,
}

impl TcpChannelListener {
    /// Bind to `addr` (`host:port`; port 0 picks a free port)
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local = Endpoint::new(listener.local_addr()?.to_string());
        Ok(Self { listener, local })
    }
}

#[async_trait]
impl ChannelListener for TcpChannelListener {
    fn local_endpoint(&self) -> Endpoint {
        self.local.clone()
    }

    async fn accept(&self) -> Result<Box<dyn HeartbeatChannel>> {
        let (stream, peer) = self.listener.accept().await?;
        Ok(Box::new(TcpChannel::new(stream, Endpoint::new(peer.to_string()))))
    }
}
