//! TCP listener driver.
//!
//! Frame format: `[length:4 big-endian][envelope bytes]`. Every accepted
//! connection is a peer; sends fan out to all of them unless addressed to
//! one peer.

use std::{io, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use multiwire_core::{
    ConnectionReporter, DriverError, InboundFrame, InboundSender, PeerId, TransportDriver,
    TransportKind,
    envelope::{MAX_ID_LEN, MAX_PAYLOAD_SIZE},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};

use super::peers::PeerSet;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD_SIZE + 2 * MAX_ID_LEN + 16;

/// Driver accepting TCP peers on a local address.
pub struct TcpDriver {
    peers: Arc<PeerSet>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl TcpDriver {
    /// Bind `addr` and start accepting peers.
    ///
    /// # Errors
    /// Returns error if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        reporter: ConnectionReporter,
        inbound: InboundSender,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let peers = Arc::new(PeerSet::new(reporter));

        tracing::info!(%local_addr, "TCP transport listening");
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&peers), inbound));

        Ok(Self {
            peers,
            local_addr,
            accept_task,
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for TcpDriver {
    fn drop(&mut self) {
        // Cancelling the accept task drops its `JoinSet`, which aborts every
        // connection task and detaches its peer.
        self.accept_task.abort();
    }
}

#[async_trait]
impl TransportDriver for TcpDriver {
    fn kind(&self) -> TransportKind {
        self.peers.kind()
    }

    async fn send(&self, frame: Bytes) -> Result<(), DriverError> {
        check_frame_size(&frame)?;
        self.peers.broadcast(&frame).map(|_| ())
    }

    async fn send_to_peer(&self, peer: PeerId, frame: Bytes) -> Result<(), DriverError> {
        check_frame_size(&frame)?;
        self.peers.send_to(peer, &frame)
    }
}

fn check_frame_size(frame: &Bytes) -> Result<(), DriverError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(DriverError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", frame.len()),
        )));
    }
    Ok(())
}

async fn accept_loop(listener: TcpListener, peers: Arc<PeerSet>, inbound: InboundSender) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    connections.spawn(handle_connection(
                        stream,
                        addr,
                        Arc::clone(&peers),
                        inbound.clone(),
                    ));
                }
                Err(e) => {
                    tracing::error!("TCP accept failed: {e}");
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

/// Detaches the peer when the connection task ends or is aborted.
struct Attachment {
    peers: Arc<PeerSet>,
    id: PeerId,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.peers.detach(self.id);
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    peers: Arc<PeerSet>,
    inbound: InboundSender,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(%addr, "Failed to set TCP_NODELAY: {e}");
    }
    let (reader, writer) = stream.into_split();
    let transport = peers.kind();
    let (id, rx) = peers.attach(addr.to_string());
    let attachment = Attachment { peers, id };

    tokio::select! {
        result = read_loop(reader, transport, id, &inbound) => {
            if let Err(e) = result {
                tracing::warn!(%addr, "TCP peer read failed: {e}");
            }
        }
        () = write_loop(writer, rx, addr) => {}
    }

    drop(attachment);
    tracing::info!(%addr, "TCP peer disconnected");
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    addr: SocketAddr,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            tracing::error!(%addr, "TCP write failed: {e}");
            break;
        }
    }
}

#[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE in `check_frame_size`
async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> io::Result<()> {
    writer.write_u32(frame.len() as u32).await?;
    writer.write_all(frame).await
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    transport: TransportKind,
    peer: PeerId,
    inbound: &InboundSender,
) -> io::Result<()> {
    loop {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit"),
            ));
        }

        let mut buf = vec![0; len];
        reader.read_exact(&mut buf).await?;
        if inbound
            .send(InboundFrame {
                transport,
                peer: Some(peer),
                bytes: Bytes::from(buf),
            })
            .is_err()
        {
            return Ok(());
        }
    }
}
