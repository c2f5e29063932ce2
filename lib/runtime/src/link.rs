// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Link layer: one framed, bidirectional TCP connection to one remote address.
//!
//! Wire format:
//! ```text
//! [u32 BE: payload_len][payload bytes]
//! ```
//!
//! The first frame written by the connecting side is a JSON [`Handshake`]
//! carrying the connector's advertised listener address. The accepting side
//! attributes every later frame on the connection to that address, so
//! observers registered against a manager's listening address see traffic
//! from it regardless of the ephemeral source port.
//!
//! Writes go through a single writer task fed by a flume channel, which keeps
//! per-connection FIFO order for any number of concurrent senders.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address::RemoteAddress;
use crate::config::TransportConfig;
use crate::error::TransportError;

/// Current handshake version
const HANDSHAKE_VERSION: u16 = 1;

/// Length prefix size
const LENGTH_PREFIX: usize = 4;

/// How long an accepted connection may take to present its handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Framing
// ============================================================================

/// Length-prefixed frame codec.
#[derive(Debug, Clone)]
pub struct LengthPrefixedCodec {
    max_frame_size: usize,
}

impl LengthPrefixedCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    fn too_large(&self, size: usize) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Frame size {} exceeds maximum {}",
                size, self.max_frame_size
            ),
        )
    }
}

impl Decoder for LengthPrefixedCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        // Peek the length without consuming
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > self.max_frame_size {
            return Err(self.too_large(frame_len));
        }

        let total_len = LENGTH_PREFIX + frame_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(frame_len).freeze()))
    }
}

impl Encoder<Bytes> for LengthPrefixedCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(self.too_large(item.len()));
        }
        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// First frame on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u16,
    /// Listener address of the connecting manager; `None` for client-only managers.
    pub address: Option<RemoteAddress>,
}

impl Handshake {
    fn new(address: Option<RemoteAddress>) -> Self {
        Self {
            version: HANDSHAKE_VERSION,
            address,
        }
    }

    fn to_bytes(&self) -> Result<Bytes, TransportError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| TransportError::Handshake(e.to_string()))
    }

    fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        let handshake: Handshake = serde_json::from_slice(data)
            .map_err(|e| TransportError::Handshake(format!("malformed handshake: {e}")))?;
        if handshake.version != HANDSHAKE_VERSION {
            return Err(TransportError::Handshake(format!(
                "unsupported handshake version: {} (expected {})",
                handshake.version, HANDSHAKE_VERSION
            )));
        }
        Ok(handshake)
    }
}

// ============================================================================
// Link
// ============================================================================

pub type LinkReader = FramedRead<OwnedReadHalf, LengthPrefixedCodec>;

/// Write side of one connection plus its lifetime token.
///
/// Cancelling the token stops the writer task, which drops the write half and
/// sends FIN to the peer.
#[derive(Debug)]
pub struct Link {
    id: u64,
    remote: RemoteAddress,
    max_frame_size: usize,
    tx: flume::Sender<Bytes>,
    token: CancellationToken,
}

impl Link {
    /// Open a connection to `destination` and present `advertised` as our identity.
    pub async fn connect(
        destination: RemoteAddress,
        advertised: Option<RemoteAddress>,
        config: &TransportConfig,
        token: CancellationToken,
    ) -> Result<(Arc<Link>, LinkReader), TransportError> {
        debug!("Connecting to {}", destination);

        let stream = tokio::time::timeout(
            config.connect_timeout(),
            TcpStream::connect(destination.socket_addr()),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout(destination))?
        .map_err(|source| TransportError::Connect {
            address: destination,
            source,
        })?;

        configure_socket(&stream, config);

        let (read_half, write_half) = stream.into_split();
        let codec = LengthPrefixedCodec::new(config.max_frame_size);
        let mut writer = FramedWrite::new(write_half, codec.clone());

        writer.send(Handshake::new(advertised).to_bytes()?).await?;

        let link = Self::spawn(destination, config.max_frame_size, writer, token);
        debug!(link_id = link.id, "Connected to {}", destination);

        Ok((link, FramedRead::new(read_half, codec)))
    }

    /// Take over an accepted connection; the handshake decides its source address.
    pub async fn accept(
        stream: TcpStream,
        config: &TransportConfig,
        token: CancellationToken,
    ) -> Result<(Arc<Link>, LinkReader), TransportError> {
        let peer = RemoteAddress::from(stream.peer_addr()?);
        configure_socket(&stream, config);

        let (read_half, write_half) = stream.into_split();
        let codec = LengthPrefixedCodec::new(config.max_frame_size);
        let mut reader = FramedRead::new(read_half, codec.clone());

        let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next())
            .await
            .map_err(|_| TransportError::Handshake(format!("{peer} sent no handshake")))?;

        let handshake = match first {
            Some(frame) => Handshake::from_bytes(&frame?)?,
            None => return Err(TransportError::ConnectionClosed(peer)),
        };

        let source = handshake.address.unwrap_or(peer);
        let writer = FramedWrite::new(write_half, codec);
        let link = Self::spawn(source, config.max_frame_size, writer, token);
        debug!(link_id = link.id, %peer, "Accepted connection from {}", source);

        Ok((link, reader))
    }

    fn spawn(
        remote: RemoteAddress,
        max_frame_size: usize,
        writer: FramedWrite<OwnedWriteHalf, LengthPrefixedCodec>,
        token: CancellationToken,
    ) -> Arc<Link> {
        let (tx, rx) = flume::unbounded();
        let link = Arc::new(Link {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            max_frame_size,
            tx,
            token: token.clone(),
        });
        tokio::spawn(writer_task(link.id, remote, writer, rx, token));
        link
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address this link talks to.
    pub fn remote(&self) -> RemoteAddress {
        self.remote
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_disconnected()
    }

    /// Enqueue one frame; frames are written in enqueue order.
    pub fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        if self.token.is_cancelled() {
            return Err(TransportError::ConnectionClosed(self.remote));
        }
        self.tx
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed(self.remote))
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

/// Drains the link's queue onto the socket until cancelled or the socket fails.
async fn writer_task(
    link_id: u64,
    remote: RemoteAddress,
    mut framed: FramedWrite<OwnedWriteHalf, LengthPrefixedCodec>,
    rx: flume::Receiver<Bytes>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            frame = rx.recv_async() => {
                let Ok(frame) = frame else { break };
                if let Err(e) = framed.send(frame).await {
                    warn!(link_id, "Write to {} failed: {}", remote, e);
                    token.cancel();
                    break;
                }
            }
            _ = token.cancelled() => {
                // flush what was queued before the close
                while let Ok(frame) = rx.try_recv() {
                    if framed.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = framed.close().await;
    debug!(link_id, "Writer for {} closed", remote);
}

fn configure_socket(stream: &TcpStream, config: &TransportConfig) {
    if config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
    }

    if let Some(time) = config.keepalive() {
        let sock = socket2::SockRef::from(stream);
        let keepalive = socket2::TcpKeepalive::new().with_time(time);
        if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set keepalive: {}", e);
        }
    }
}
