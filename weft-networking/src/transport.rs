// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The channel layer consumed from the transport.
//!
//! The overlay multiplexes many short-lived channels over one connection
//! per peer. This module provides that layer over any ordered byte stream:
//! a TCP socket in production, an in-memory duplex pipe in tests. Securing
//! the stream itself is the transport collaborator's concern and out of
//! scope here; the identification handshake only establishes which public
//! key the remote claims, which admission then verifies by derivation.
//!
//! Guarantees relied on by the rest of the engine:
//! * per-channel frame ordering is FIFO;
//! * a channel receiver yields `None` exactly once, when the channel (or
//!   the whole connection) closes;
//! * `write_channel_data` never suspends.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot, Notify},
};
use weft_protocol::{wire, PROTOCOL_VERSION_STR};

/// Channel type for overlay traffic.
pub const CHANNEL_MPEER: &str = "mpeer";
/// Channel type for the localhost admin session.
pub const CHANNEL_SESSION: &str = "session";

/// Largest accepted mux frame. Comfortably above the largest data block so
/// a relayed `StoreData` fits in one frame.
const MAX_FRAME_SIZE: usize = 5 * 1024 * 1024;

const FRAME_OPEN: u8 = 1;
const FRAME_DATA: u8 = 2;
const FRAME_CLOSE: u8 = 3;

pub type ChannelId = u32;
pub type ChannelRx = mpsc::UnboundedReceiver<Bytes>;

/// What each side announces before any channel traffic.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub version: String,
    pub public_key: Bytes,
    pub listen_port: u16,
}

impl HandshakeInfo {
    pub fn new(public_key: Bytes, listen_port: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION_STR.to_string(),
            public_key,
            listen_port,
        }
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        wire::put_string(&mut buf, &self.version);
        wire::put_binary(&mut buf, &self.public_key);
        buf.put_u32(u32::from(self.listen_port));
        buf.freeze()
    }

    fn decode(frame: Bytes) -> Result<Self> {
        let mut buf = frame;
        let version = wire::get_string(&mut buf, "handshake version")?;
        let public_key = wire::get_binary(&mut buf, "handshake public key")?;
        let listen_port = wire::get_u32(&mut buf, "handshake listen port")? as u16;
        Ok(Self {
            version,
            public_key,
            listen_port,
        })
    }
}

/// A channel opened by the remote side, handed to the connection's owner.
pub struct IncomingChannel {
    pub id: ChannelId,
    pub kind: String,
    pub rx: ChannelRx,
}

enum Ctl {
    Open {
        kind: String,
        reply: oneshot::Sender<(ChannelId, ChannelRx)>,
    },
    Write {
        id: ChannelId,
        data: Bytes,
    },
    Close {
        id: ChannelId,
    },
    /// A frame the reader task pulled off the stream.
    Inbound(Bytes),
    Shutdown,
}

/// Cheap handle to a live connection's mux actor.
#[derive(Clone)]
pub struct ConnHandle {
    ctl: mpsc::UnboundedSender<Ctl>,
    open: Arc<AtomicBool>,
    closed: Arc<Notify>,
}

impl ConnHandle {
    /// Open a fresh channel of `kind`. Yields `None` when the connection is
    /// down.
    pub async fn open_channel(&self, kind: &str) -> Option<(ChannelId, ChannelRx)> {
        let (reply, rx) = oneshot::channel();
        self.ctl
            .send(Ctl::Open {
                kind: kind.to_string(),
                reply,
            })
            .ok()?;
        rx.await.ok()
    }

    /// Queue a frame on `id`. Does not suspend; frames to a dead channel
    /// are silently dropped, the closure is observed on the read side.
    pub fn write_channel_data(&self, id: ChannelId, data: Bytes) {
        let _ = self.ctl.send(Ctl::Write { id, data });
    }

    pub fn close_channel(&self, id: ChannelId) {
        let _ = self.ctl.send(Ctl::Close { id });
    }

    /// Tear down the connection; every channel receiver observes `None`.
    pub fn shutdown(&self) {
        let _ = self.ctl.send(Ctl::Shutdown);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Completes once the connection has fully closed.
    pub async fn closed(&self) {
        loop {
            let notified = self.closed.notified();
            if !self.is_open() {
                return;
            }
            notified.await;
        }
    }
}

/// Exchange identification frames. Both sides write first, then read; the
/// stream buffers the small frames so this cannot deadlock.
pub async fn exchange_handshake<S>(stream: &mut S, ours: &HandshakeInfo) -> Result<HandshakeInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &ours.encode()).await?;
    let frame = read_frame(stream).await?;
    HandshakeInfo::decode(frame)
}

/// Spawn the mux actor over an already-handshaken stream. Returns the
/// write handle and the queue of remotely opened channels.
pub fn spawn_mux<S>(
    stream: S,
    initiator: bool,
) -> (ConnHandle, mpsc::UnboundedReceiver<IncomingChannel>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));
    let closed = Arc::new(Notify::new());

    let handle = ConnHandle {
        ctl: ctl_tx,
        open: Arc::clone(&open),
        closed: Arc::clone(&closed),
    };

    let (reader, writer) = tokio::io::split(stream);

    // The reader task owns the read half outright: a frame read is never
    // cancelled halfway, so the stream cannot desynchronise.
    let reader_ctl = handle.ctl.clone();
    let _reader_handle = tokio::spawn(async move {
        let mut reader = reader;
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => {
                    if reader_ctl.send(Ctl::Inbound(frame)).is_err() {
                        break;
                    }
                }
                Err(_) => {
                    let _ = reader_ctl.send(Ctl::Shutdown);
                    break;
                }
            }
        }
    });

    let _handle = tokio::spawn(async move {
        let mut actor = MuxActor {
            channels: HashMap::new(),
            // Initiator ids are odd, acceptor ids even, so both sides can
            // allocate without coordination.
            next_id: if initiator { 1 } else { 2 },
            incoming_tx,
        };
        actor.run(writer, ctl_rx).await;
        open.store(false, Ordering::Release);
        closed.notify_waiters();
    });

    (handle, incoming_rx)
}

struct MuxActor {
    channels: HashMap<ChannelId, mpsc::UnboundedSender<Bytes>>,
    next_id: ChannelId,
    incoming_tx: mpsc::UnboundedSender<IncomingChannel>,
}

impl MuxActor {
    async fn run<W>(&mut self, mut writer: W, mut ctl_rx: mpsc::UnboundedReceiver<Ctl>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        while let Some(ctl) = ctl_rx.recv().await {
            if !self.handle_ctl(ctl, &mut writer).await {
                break;
            }
        }
        // Dropping the senders ends every channel receiver with `None`;
        // shutting the writer lets the remote's reader observe EOF.
        self.channels.clear();
        let _ = writer.shutdown().await;
    }

    async fn handle_ctl<W>(&mut self, ctl: Ctl, writer: &mut W) -> bool
    where
        W: AsyncWrite + Unpin,
    {
        match ctl {
            Ctl::Inbound(frame) => {
                if let Err(err) = self.handle_frame(frame, writer).await {
                    trace!("Dropping malformed mux frame: {err}");
                }
                true
            }
            Ctl::Open { kind, reply } => {
                let id = self.next_id;
                self.next_id = self.next_id.wrapping_add(2);
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = self.channels.insert(id, tx);

                let mut buf = BytesMut::new();
                buf.put_u8(FRAME_OPEN);
                buf.put_u32(id);
                wire::put_string(&mut buf, &kind);
                if write_frame(writer, &buf.freeze()).await.is_err() {
                    return false;
                }
                // A dropped reply just means the opener gave up waiting.
                let _ = reply.send((id, rx));
                true
            }
            Ctl::Write { id, data } => {
                if !self.channels.contains_key(&id) {
                    trace!("Write to closed channel {id}; dropping frame");
                    return true;
                }
                let mut buf = BytesMut::with_capacity(5 + data.len());
                buf.put_u8(FRAME_DATA);
                buf.put_u32(id);
                buf.put_slice(&data);
                write_frame(writer, &buf.freeze()).await.is_ok()
            }
            Ctl::Close { id } => {
                if self.channels.remove(&id).is_none() {
                    return true;
                }
                let mut buf = BytesMut::new();
                buf.put_u8(FRAME_CLOSE);
                buf.put_u32(id);
                write_frame(writer, &buf.freeze()).await.is_ok()
            }
            Ctl::Shutdown => false,
        }
    }

    async fn handle_frame<W>(&mut self, frame: Bytes, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = frame;
        let frame_type = wire::get_u8(&mut buf, "frame type")?;
        let id = wire::get_u32(&mut buf, "channel id")?;
        match frame_type {
            FRAME_OPEN => {
                let kind = wire::get_string(&mut buf, "channel kind")?;
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = self.channels.insert(id, tx);
                if self.incoming_tx.send(IncomingChannel { id, kind, rx }).is_err() {
                    // Nobody is accepting channels any more; refuse.
                    let _ = self.channels.remove(&id);
                    let mut close = BytesMut::new();
                    close.put_u8(FRAME_CLOSE);
                    close.put_u32(id);
                    let _ = write_frame(writer, &close.freeze()).await;
                }
            }
            FRAME_DATA => {
                if let Some(tx) = self.channels.get(&id) {
                    if tx.send(buf).is_err() {
                        let _ = self.channels.remove(&id);
                    }
                } else {
                    trace!("Data for unknown channel {id}; ignoring");
                }
            }
            FRAME_CLOSE => {
                let _ = self.channels.remove(&id);
            }
            other => {
                trace!("Unknown mux frame type {other}; ignoring");
            }
        }
        Ok(())
    }
}

async fn write_frame<W>(writer: &mut W, payload: &Bytes) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R>(reader: &mut R) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_SIZE} cap"),
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (
        (ConnHandle, mpsc::UnboundedReceiver<IncomingChannel>),
        (ConnHandle, mpsc::UnboundedReceiver<IncomingChannel>),
    ) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        (spawn_mux(a, true), spawn_mux(b, false))
    }

    #[tokio::test]
    async fn channel_frames_arrive_in_order() {
        let ((initiator, _), (_acceptor, mut incoming)) = pipe_pair();

        let (cid, _our_rx) = initiator
            .open_channel(CHANNEL_MPEER)
            .await
            .expect("connection should be live");
        for i in 0u8..5 {
            initiator.write_channel_data(cid, Bytes::from(vec![i]));
        }

        let mut channel = incoming.recv().await.expect("channel should arrive");
        assert_eq!(channel.kind, CHANNEL_MPEER);
        for i in 0u8..5 {
            let frame = channel.rx.recv().await.expect("frame should arrive");
            assert_eq!(frame.as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn closing_a_channel_ends_the_remote_queue() {
        let ((initiator, _), (_acceptor, mut incoming)) = pipe_pair();

        let (cid, _rx) = initiator.open_channel(CHANNEL_MPEER).await.expect("open");
        initiator.write_channel_data(cid, Bytes::from_static(b"last words"));
        initiator.close_channel(cid);

        let mut channel = incoming.recv().await.expect("channel should arrive");
        assert_eq!(
            channel.rx.recv().await.as_deref(),
            Some(b"last words".as_ref())
        );
        assert!(channel.rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_ends_every_channel() {
        let ((initiator, _), (acceptor, mut incoming)) = pipe_pair();

        let (cid, mut reply_rx) = initiator.open_channel(CHANNEL_MPEER).await.expect("open");
        let mut channel = incoming.recv().await.expect("channel should arrive");

        acceptor.shutdown();
        acceptor.closed().await;

        assert!(channel.rx.recv().await.is_none());
        // The initiator's reader eventually observes the broken pipe too.
        initiator.write_channel_data(cid, Bytes::from_static(b"into the void"));
        assert!(reply_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn handshake_round_trips() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let ours = HandshakeInfo::new(Bytes::from_static(b"key a"), 4250);
        let theirs = HandshakeInfo::new(Bytes::from_static(b"key b"), 4251);

        let (got_b, got_a) = tokio::join!(
            exchange_handshake(&mut a, &ours),
            exchange_handshake(&mut b, &theirs),
        );
        let got_b = got_b.expect("handshake a->b");
        let got_a = got_a.expect("handshake b->a");
        assert_eq!(got_b.public_key.as_ref(), b"key b");
        assert_eq!(got_b.listen_port, 4251);
        assert_eq!(got_a.public_key.as_ref(), b"key a");
        assert_eq!(got_a.version, PROTOCOL_VERSION_STR);
    }
}
